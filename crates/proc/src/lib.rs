//! Process supervisor: child and PTY lifecycle with scoped cancellation,
//! overall and no-output timeouts, and output capture/streaming.
//!
//! A run may carry a `scope_key` tying it to an owner (a session, a tool
//! call); starting a new run with `replace_existing_scope` cancels
//! whatever run currently holds that scope. All exit paths — normal
//! exit, either timeout, and cancellation — tear down the reader tasks
//! and the PTY data/exit listeners, so neither listeners nor pipe
//! buffers leak.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use oc_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options & result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the child's stdin is wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdinMode {
    /// Piped and closed immediately (child sees EOF).
    #[default]
    PipeClosed,
    /// Piped and held open for the run's lifetime.
    PipeOpen,
    /// Inherited from the gateway process.
    Inherit,
}

pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
pub struct RunOptions {
    pub argv: Vec<String>,
    pub cwd: Option<std::path::PathBuf>,
    pub env: Vec<(String, String)>,
    /// Wall-clock limit for the whole run.
    pub overall_timeout: Option<Duration>,
    /// Max silence window; any stdout/stderr output resets it.
    pub no_output_timeout: Option<Duration>,
    pub stdin: StdinMode,
    /// Collect stdout/stderr into the exit record.
    pub capture_output: bool,
    pub on_stdout: Option<OutputCallback>,
    pub on_stderr: Option<OutputCallback>,
    /// Ties the run to an owner for scoped cancellation.
    pub scope_key: Option<String>,
    /// Cancel any prior run holding the same scope before starting.
    pub replace_existing_scope: bool,
    /// Run on a PTY instead of pipes. The child sees a terminal and its
    /// stdout/stderr merge into one stream (captured as `stdout`).
    pub pty: bool,
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("argv", &self.argv)
            .field("scope_key", &self.scope_key)
            .field("overall_timeout", &self.overall_timeout)
            .field("no_output_timeout", &self.no_output_timeout)
            .field("pty", &self.pty)
            .finish_non_exhaustive()
    }
}

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal child exit (any exit code).
    Exit,
    OverallTimeout,
    NoOutputTimeout,
    ManualCancel,
    /// Killed by a signal (unix).
    Signal,
}

#[derive(Debug, Clone)]
pub struct RunExit {
    pub reason: ExitReason,
    pub timed_out: bool,
    pub no_output_timed_out: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ProcessSupervisor {
    scopes: Mutex<HashMap<String, ScopeSlot>>,
    next_run_id: AtomicU64,
    /// Live PTY data/exit listener tasks. Every PTY run registers two and
    /// deregisters both on all exit paths; a non-zero count after a run
    /// completes is a listener leak.
    pty_listeners: Arc<AtomicUsize>,
}

struct ScopeSlot {
    run_id: u64,
    token: CancellationToken,
}

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the run currently holding `scope_key`, if any.
    pub fn cancel_scope(&self, scope_key: &str) -> bool {
        if let Some(slot) = self.scopes.lock().get(scope_key) {
            slot.token.cancel();
            true
        } else {
            false
        }
    }

    /// Number of live PTY listener tasks. Zero whenever no PTY run is in
    /// flight.
    pub fn pty_listener_count(&self) -> usize {
        self.pty_listeners.load(Ordering::SeqCst)
    }

    /// Spawn and supervise a child to completion.
    pub async fn run(&self, opts: RunOptions) -> Result<RunExit> {
        let Some(program) = opts.argv.first() else {
            return Err(Error::Validation("empty argv".into()));
        };

        // Scope bookkeeping: replace (cancel) any holder, then register.
        let cancel = CancellationToken::new();
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        if let Some(ref key) = opts.scope_key {
            let mut scopes = self.scopes.lock();
            if let Some(prior) = scopes.get(key) {
                if opts.replace_existing_scope {
                    prior.token.cancel();
                } else {
                    return Err(Error::Validation(format!(
                        "scope '{key}' already has a running process"
                    )));
                }
            }
            scopes.insert(
                key.clone(),
                ScopeSlot {
                    run_id,
                    token: cancel.clone(),
                },
            );
        }

        let result = if opts.pty {
            self.supervise_pty(&opts, program.clone(), cancel.clone()).await
        } else {
            self.supervise(&opts, program.clone(), cancel.clone()).await
        };

        if let Some(ref key) = opts.scope_key {
            let mut scopes = self.scopes.lock();
            // Only deregister if the slot still belongs to this run.
            if scopes.get(key).map_or(false, |s| s.run_id == run_id) {
                scopes.remove(key);
            }
        }

        result
    }

    async fn supervise(
        &self,
        opts: &RunOptions,
        program: String,
        cancel: CancellationToken,
    ) -> Result<RunExit> {
        let mut cmd = Command::new(&program);
        cmd.args(&opts.argv[1..]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        match opts.stdin {
            StdinMode::PipeClosed | StdinMode::PipeOpen => cmd.stdin(Stdio::piped()),
            StdinMode::Inherit => cmd.stdin(Stdio::inherit()),
        };
        if let Some(ref cwd) = opts.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Other(format!("failed to spawn {program}: {e}")))?;

        // Stdin wiring. PipeClosed drops the handle so the child sees EOF;
        // PipeOpen parks it until the run ends.
        let held_stdin = match opts.stdin {
            StdinMode::PipeClosed => {
                drop(child.stdin.take());
                None
            }
            StdinMode::PipeOpen => child.stdin.take(),
            StdinMode::Inherit => None,
        };

        // Reader tasks feed a single channel; dropping both senders closes
        // it, which is how the loop learns output is drained.
        let (line_tx, mut line_rx) = mpsc::channel::<OutputLine>(256);
        let stdout_task = child.stdout.take().map(|out| {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(OutputLine::Stdout(line)).await.is_err() {
                        break;
                    }
                }
            })
        });
        let stderr_task = child.stderr.take().map(|err| {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(OutputLine::Stderr(line)).await.is_err() {
                        break;
                    }
                }
            })
        });
        drop(line_tx);

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut append = |line: OutputLine, opts: &RunOptions| match line {
            OutputLine::Stdout(text) => {
                if let Some(cb) = &opts.on_stdout {
                    cb(&text);
                }
                if opts.capture_output {
                    stdout.push_str(&text);
                    stdout.push('\n');
                }
            }
            OutputLine::Stderr(text) => {
                if let Some(cb) = &opts.on_stderr {
                    cb(&text);
                }
                if opts.capture_output {
                    stderr.push_str(&text);
                    stderr.push('\n');
                }
            }
        };

        let overall_deadline = opts
            .overall_timeout
            .map(|d| tokio::time::Instant::now() + d);
        let far_future = || tokio::time::Instant::now() + Duration::from_secs(86_400 * 365);
        let mut silence_deadline = opts
            .no_output_timeout
            .map(|d| tokio::time::Instant::now() + d)
            .unwrap_or_else(far_future);

        let mut reason: Option<ExitReason> = None;
        let mut exit_code: Option<i32> = None;
        let mut output_open = true;

        // Which branch woke the loop. Computed inside the select so the
        // arm bodies never touch `child` while its wait future is live.
        enum Wake {
            Exited(std::io::Result<std::process::ExitStatus>),
            Line(Option<OutputLine>),
            OverallTimeout,
            SilenceTimeout,
            Cancelled,
        }

        loop {
            let wake = tokio::select! {
                status = child.wait(), if reason.is_none() => Wake::Exited(status),
                line = line_rx.recv(), if output_open => Wake::Line(line),
                _ = tokio::time::sleep_until(overall_deadline.unwrap_or_else(far_future)),
                    if reason.is_none() && overall_deadline.is_some() => Wake::OverallTimeout,
                _ = tokio::time::sleep_until(silence_deadline),
                    if reason.is_none() && opts.no_output_timeout.is_some() => Wake::SilenceTimeout,
                _ = cancel.cancelled(), if reason.is_none() => Wake::Cancelled,
            };

            match wake {
                Wake::Exited(status) => match status {
                    Ok(st) => {
                        exit_code = st.code();
                        reason = Some(if st.code().is_some() {
                            ExitReason::Exit
                        } else {
                            ExitReason::Signal
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "child wait failed");
                        reason = Some(ExitReason::Exit);
                    }
                },
                Wake::Line(Some(line)) => {
                    append(line, opts);
                    if let Some(window) = opts.no_output_timeout {
                        silence_deadline = tokio::time::Instant::now() + window;
                    }
                }
                Wake::Line(None) => {
                    output_open = false;
                }
                Wake::OverallTimeout => {
                    let _ = child.start_kill();
                    reason = Some(ExitReason::OverallTimeout);
                    let _ = child.wait().await;
                }
                Wake::SilenceTimeout => {
                    let _ = child.start_kill();
                    reason = Some(ExitReason::NoOutputTimeout);
                    let _ = child.wait().await;
                }
                Wake::Cancelled => {
                    let _ = child.start_kill();
                    reason = Some(ExitReason::ManualCancel);
                    let _ = child.wait().await;
                }
            }

            if reason.is_some() && !output_open {
                break;
            }
        }

        // All exit paths: readers joined, stdin released.
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }
        drop(held_stdin);

        let reason = reason.unwrap_or(ExitReason::Exit);
        Ok(RunExit {
            reason,
            timed_out: reason == ExitReason::OverallTimeout,
            no_output_timed_out: reason == ExitReason::NoOutputTimeout,
            exit_code,
            stdout,
            stderr,
        })
    }

    /// Supervise a child on a PTY.
    ///
    /// Two blocking listener tasks serve the run: a *data listener*
    /// reading the master side, and an *exit listener* reaping the child.
    /// Both register in `pty_listeners` and both are joined before this
    /// function returns — on normal exit, on either timeout, and on
    /// cancellation — so a finished run never leaves a listener behind.
    async fn supervise_pty(
        &self,
        opts: &RunOptions,
        program: String,
        cancel: CancellationToken,
    ) -> Result<RunExit> {
        use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};

        let pty = native_pty_system();
        let PtyPair { master, slave } = pty
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Other(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&opts.argv[1..]);
        if let Some(ref cwd) = opts.cwd {
            cmd.cwd(cwd);
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }

        let mut child = slave
            .spawn_command(cmd)
            .map_err(|e| Error::Other(format!("failed to spawn {program} on pty: {e}")))?;
        // Close our slave handle; the master then sees EOF once the child
        // exits.
        drop(slave);
        let mut killer = child.clone_killer();

        let reader = match master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                return Err(Error::Other(format!("pty reader unavailable: {e}")));
            }
        };

        // Data listener: blocking reads off the master, lines into the
        // channel. Closing the channel is the drained signal.
        let (line_tx, mut line_rx) = mpsc::channel::<OutputLine>(256);
        self.pty_listeners.fetch_add(1, Ordering::SeqCst);
        let data_listener = tokio::task::spawn_blocking({
            let listeners = self.pty_listeners.clone();
            move || {
                use std::io::BufRead;
                let mut lines = std::io::BufReader::new(reader);
                let mut line = String::new();
                loop {
                    line.clear();
                    match lines.read_line(&mut line) {
                        // EOF, or EIO once the child is gone.
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let text = line.trim_end_matches(['\r', '\n']).to_owned();
                            if line_tx.blocking_send(OutputLine::Stdout(text)).is_err() {
                                break;
                            }
                        }
                    }
                }
                listeners.fetch_sub(1, Ordering::SeqCst);
            }
        });

        // Exit listener: blocking reap, status over a oneshot.
        let (exit_tx, mut exit_rx) = oneshot::channel();
        self.pty_listeners.fetch_add(1, Ordering::SeqCst);
        let exit_listener = tokio::task::spawn_blocking({
            let listeners = self.pty_listeners.clone();
            move || {
                let status = child.wait();
                let _ = exit_tx.send(status);
                listeners.fetch_sub(1, Ordering::SeqCst);
            }
        });

        let mut stdout = String::new();
        let mut append = |line: OutputLine, opts: &RunOptions| {
            if let OutputLine::Stdout(text) = line {
                if let Some(cb) = &opts.on_stdout {
                    cb(&text);
                }
                if opts.capture_output {
                    stdout.push_str(&text);
                    stdout.push('\n');
                }
            }
        };

        let overall_deadline = opts
            .overall_timeout
            .map(|d| tokio::time::Instant::now() + d);
        let far_future = || tokio::time::Instant::now() + Duration::from_secs(86_400 * 365);
        let mut silence_deadline = opts
            .no_output_timeout
            .map(|d| tokio::time::Instant::now() + d)
            .unwrap_or_else(far_future);

        enum PtyWake {
            Exited(Option<u32>),
            Line(Option<OutputLine>),
            OverallTimeout,
            SilenceTimeout,
            Cancelled,
        }

        let mut reason: Option<ExitReason> = None;
        let mut exit_code: Option<i32> = None;
        let mut output_open = true;

        loop {
            let wake = tokio::select! {
                status = &mut exit_rx, if reason.is_none() => {
                    PtyWake::Exited(status.ok().and_then(|s| s.ok()).map(|s| s.exit_code()))
                }
                line = line_rx.recv(), if output_open => PtyWake::Line(line),
                _ = tokio::time::sleep_until(overall_deadline.unwrap_or_else(far_future)),
                    if reason.is_none() && overall_deadline.is_some() => PtyWake::OverallTimeout,
                _ = tokio::time::sleep_until(silence_deadline),
                    if reason.is_none() && opts.no_output_timeout.is_some() => PtyWake::SilenceTimeout,
                _ = cancel.cancelled(), if reason.is_none() => PtyWake::Cancelled,
            };

            match wake {
                PtyWake::Exited(code) => {
                    exit_code = code.map(|c| c as i32);
                    reason = Some(ExitReason::Exit);
                }
                PtyWake::Line(Some(line)) => {
                    append(line, opts);
                    if let Some(window) = opts.no_output_timeout {
                        silence_deadline = tokio::time::Instant::now() + window;
                    }
                }
                PtyWake::Line(None) => {
                    output_open = false;
                }
                PtyWake::OverallTimeout => {
                    let _ = killer.kill();
                    reason = Some(ExitReason::OverallTimeout);
                }
                PtyWake::SilenceTimeout => {
                    let _ = killer.kill();
                    reason = Some(ExitReason::NoOutputTimeout);
                }
                PtyWake::Cancelled => {
                    let _ = killer.kill();
                    reason = Some(ExitReason::ManualCancel);
                }
            }

            if reason.is_some() && !output_open {
                break;
            }
        }

        // Dispose listeners on every path: drop the master (forcing the
        // data listener to EOF even if the kill raced), then join both
        // tasks so the counter is back to zero before we return.
        drop(master);
        let _ = data_listener.await;
        let _ = exit_listener.await;

        let reason = reason.unwrap_or(ExitReason::Exit);
        Ok(RunExit {
            reason,
            timed_out: reason == ExitReason::OverallTimeout,
            no_output_timed_out: reason == ExitReason::NoOutputTimeout,
            exit_code,
            // A PTY has one stream; stderr is merged into stdout.
            stdout,
            stderr: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn capture(argv: Vec<String>) -> RunOptions {
        RunOptions {
            argv,
            capture_output: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let sup = ProcessSupervisor::new();
        let exit = sup.run(capture(sh("echo hello; exit 3"))).await.unwrap();
        assert_eq!(exit.reason, ExitReason::Exit);
        assert_eq!(exit.exit_code, Some(3));
        assert_eq!(exit.stdout, "hello\n");
        assert!(!exit.timed_out);
    }

    #[tokio::test]
    async fn stderr_captured_separately() {
        let sup = ProcessSupervisor::new();
        let exit = sup
            .run(capture(sh("echo out; echo err >&2")))
            .await
            .unwrap();
        assert_eq!(exit.stdout, "out\n");
        assert_eq!(exit.stderr, "err\n");
    }

    #[tokio::test]
    async fn overall_timeout_kills() {
        let sup = ProcessSupervisor::new();
        let mut opts = capture(sh("sleep 5"));
        opts.overall_timeout = Some(Duration::from_millis(50));
        let exit = sup.run(opts).await.unwrap();
        assert_eq!(exit.reason, ExitReason::OverallTimeout);
        assert!(exit.timed_out);
        assert!(!exit.no_output_timed_out);
    }

    #[tokio::test]
    async fn no_output_timeout_resets_on_output() {
        let sup = ProcessSupervisor::new();
        // Emits every 30ms, silence window 200ms: completes normally.
        let mut opts = capture(sh(
            "for i in 1 2 3; do echo tick; sleep 0.03; done",
        ));
        opts.no_output_timeout = Some(Duration::from_millis(200));
        let exit = sup.run(opts).await.unwrap();
        assert_eq!(exit.reason, ExitReason::Exit);
        assert_eq!(exit.stdout, "tick\ntick\ntick\n");

        // Silent child trips the window.
        let mut opts = capture(sh("sleep 5"));
        opts.no_output_timeout = Some(Duration::from_millis(50));
        let exit = sup.run(opts).await.unwrap();
        assert_eq!(exit.reason, ExitReason::NoOutputTimeout);
        assert!(exit.no_output_timed_out);
        assert!(!exit.timed_out);
    }

    #[tokio::test]
    async fn streaming_callback_sees_lines() {
        let sup = ProcessSupervisor::new();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let mut opts = capture(sh("echo a; echo b"));
        opts.on_stdout = Some(Arc::new(move |line| sink.lock().push(line.to_owned())));
        sup.run(opts).await.unwrap();
        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn scope_replacement_cancels_prior() {
        let sup = Arc::new(ProcessSupervisor::new());

        let first = {
            let sup = sup.clone();
            tokio::spawn(async move {
                let mut opts = capture(sh("sleep 5"));
                opts.scope_key = Some("session:main".into());
                opts.replace_existing_scope = true;
                sup.run(opts).await.unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut opts = capture(sh("echo second"));
        opts.scope_key = Some("session:main".into());
        opts.replace_existing_scope = true;
        let second = sup.run(opts).await.unwrap();

        let first = first.await.unwrap();
        assert_eq!(first.reason, ExitReason::ManualCancel);
        assert_eq!(second.reason, ExitReason::Exit);
        assert_eq!(second.stdout, "second\n");
    }

    #[tokio::test]
    async fn duplicate_scope_without_replace_rejected() {
        let sup = Arc::new(ProcessSupervisor::new());
        let holder = {
            let sup = sup.clone();
            tokio::spawn(async move {
                let mut opts = capture(sh("sleep 1"));
                opts.scope_key = Some("s".into());
                sup.run(opts).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut opts = capture(sh("echo x"));
        opts.scope_key = Some("s".into());
        assert!(sup.run(opts).await.is_err());

        sup.cancel_scope("s");
        let first = holder.await.unwrap().unwrap();
        assert_eq!(first.reason, ExitReason::ManualCancel);
    }

    #[tokio::test]
    async fn empty_argv_rejected() {
        let sup = ProcessSupervisor::new();
        assert!(sup.run(RunOptions::default()).await.is_err());
    }

    // ── PTY runs ─────────────────────────────────────────────────────

    fn pty(script: &str) -> RunOptions {
        RunOptions {
            argv: sh(script),
            capture_output: true,
            pty: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pty_merges_streams_and_disposes_listeners_on_exit() {
        let sup = ProcessSupervisor::new();
        let exit = sup.run(pty("echo out; echo err >&2")).await.unwrap();

        assert_eq!(exit.reason, ExitReason::Exit);
        assert_eq!(exit.exit_code, Some(0));
        // One terminal stream: stderr rides along with stdout.
        assert!(exit.stdout.contains("out"), "stdout: {:?}", exit.stdout);
        assert!(exit.stdout.contains("err"), "stdout: {:?}", exit.stdout);
        assert!(exit.stderr.is_empty());
        // Normal exit left no data/exit listener behind.
        assert_eq!(sup.pty_listener_count(), 0);
    }

    #[tokio::test]
    async fn pty_overall_timeout_disposes_listeners() {
        let sup = ProcessSupervisor::new();
        let mut opts = pty("sleep 5");
        opts.overall_timeout = Some(Duration::from_millis(50));
        let exit = sup.run(opts).await.unwrap();

        assert_eq!(exit.reason, ExitReason::OverallTimeout);
        assert!(exit.timed_out);
        // The timeout path joined both listeners before returning.
        assert_eq!(sup.pty_listener_count(), 0);
    }

    #[tokio::test]
    async fn pty_no_output_timeout_disposes_listeners() {
        let sup = ProcessSupervisor::new();
        let mut opts = pty("echo once; sleep 5");
        opts.no_output_timeout = Some(Duration::from_millis(80));
        let exit = sup.run(opts).await.unwrap();

        assert_eq!(exit.reason, ExitReason::NoOutputTimeout);
        assert!(exit.stdout.contains("once"));
        assert_eq!(sup.pty_listener_count(), 0);
    }

    #[tokio::test]
    async fn pty_cancel_disposes_listeners() {
        let sup = Arc::new(ProcessSupervisor::new());
        let runner = {
            let sup = sup.clone();
            tokio::spawn(async move {
                let mut opts = pty("sleep 5");
                opts.scope_key = Some("pty:test".into());
                sup.run(opts).await.unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sup.pty_listener_count(), 2);

        assert!(sup.cancel_scope("pty:test"));
        let exit = runner.await.unwrap();
        assert_eq!(exit.reason, ExitReason::ManualCancel);
        assert_eq!(sup.pty_listener_count(), 0);
    }

    #[tokio::test]
    async fn pty_streaming_callback_sees_lines() {
        let sup = ProcessSupervisor::new();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let mut opts = pty("echo a; echo b");
        opts.on_stdout = Some(Arc::new(move |line| sink.lock().push(line.to_owned())));
        sup.run(opts).await.unwrap();
        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(sup.pty_listener_count(), 0);
    }
}
