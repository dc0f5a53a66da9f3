//! Session store and inbound router.
//!
//! Maps every inbound message to a canonical session key, owns the
//! per-session metadata record, and extracts directive commands before a
//! message reaches the dispatcher.

pub mod commands;
pub mod entry;
pub mod pairing;
pub mod router;
pub mod session_key;

pub use commands::{extract_directive, Directive};
pub use entry::{DeliveryContext, SessionEntry, SessionStore};
pub use pairing::{PairingCode, PairingStore};
pub use router::{ChatType, InboundMessage, RouteOutcome, Router};
pub use session_key::SessionKey;
