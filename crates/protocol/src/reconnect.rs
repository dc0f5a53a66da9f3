//! Peer reconnect policy: jittered exponential back-off.
//!
//! `delay = min(base · 2^attempt, max) + jitter · rand()`. Errors whose
//! message names a missing gateway token are configuration mistakes, not
//! transient faults, and stop the retry loop.

/// Back-off parameters. The defaults are the wire contract every peer
/// implements.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 30_000,
            jitter_ms: 1_000,
        }
    }
}

/// Delay before reconnect attempt `attempt` (0-indexed). `random` supplies
/// a value in `[0, 1)`; injecting it keeps the computation testable.
pub fn reconnect_delay_ms(attempt: u32, policy: &ReconnectPolicy, random: impl Fn() -> f64) -> u64 {
    // 2^attempt saturates instead of overflowing for absurd attempt counts.
    let exp = policy
        .base_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = exp.min(policy.max_ms);
    let jitter = (policy.jitter_ms as f64 * random()) as u64;
    capped + jitter
}

/// Whether a connect error is worth retrying. A missing gateway token can
/// never heal on its own; everything else is assumed transient.
pub fn is_retryable_error(message: &str) -> bool {
    !message.contains("Missing gatewayToken")
}
