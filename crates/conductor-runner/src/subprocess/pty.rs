//! Pseudo-terminal execution strategy.
//!
//! The child gets the PTY slave as its controlling terminal. Its output is
//! copied to our stdout as it arrives and captured for parsing; our stdin is
//! copied into the master. The caller's terminal is switched to raw mode for
//! the duration so keystrokes reach the child unprocessed.

use std::io::{IsTerminal as _, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conductor_core::ndjson::strip_ansi;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::executor::{
    Captured, ExecError, ExecOutcome, ExecRequest, ProcessExecutor, Waited, interpret, timed_out,
};
use super::signals::SignalForwarder;

const DEFAULT_SIZE: (u16, u16) = (80, 24);

/// How long the output thread may keep reading after the child exited.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Stdin poll interval; bounds how long the input thread outlives the child.
#[cfg(unix)]
const INPUT_POLL_MS: u16 = 100;

type SharedMaster = Arc<Mutex<Box<dyn MasterPty + Send>>>;

/// Restores cooked mode when dropped.
struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    fn enable() -> Self {
        if !std::io::stdin().is_terminal() {
            return Self { enabled: false };
        }
        match crossterm::terminal::enable_raw_mode() {
            Ok(()) => Self { enabled: true },
            Err(e) => {
                debug!(error = %e, "Could not enable raw mode");
                Self { enabled: false }
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled
            && let Err(e) = crossterm::terminal::disable_raw_mode()
        {
            warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

fn terminal_size() -> PtySize {
    let (cols, rows) = crossterm::terminal::size().unwrap_or(DEFAULT_SIZE);
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Run `request` attached to a fresh pseudo-terminal.
///
/// Returns `Err` only when the PTY itself cannot be set up, so the caller can
/// fall back to pipes. Everything after that is reported in the outcome.
pub(super) async fn run(
    executor: &ProcessExecutor,
    request: &ExecRequest,
) -> Result<ExecOutcome, ExecError> {
    let pair = native_pty_system()
        .openpty(terminal_size())
        .map_err(|e| ExecError::Pty(e.to_string()))?;
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ExecError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| ExecError::Pty(e.to_string()))?;

    let spec = &request.command;
    let mut builder = CommandBuilder::new(&spec.program);
    builder.args(&spec.args);
    if let Some(dir) = &spec.working_dir {
        builder.cwd(dir);
    }
    for (key, value) in &spec.env {
        builder.env(key, value);
    }

    let mut child = match pair.slave.spawn_command(builder) {
        Ok(child) => child,
        Err(e) => {
            return Ok(ExecOutcome::failed(ExecError::Spawn {
                program: spec.program.display().to_string(),
                source: std::io::Error::other(e.to_string()),
            }));
        }
    };
    // Only the child may keep the slave open, or reads never see EOF.
    drop(pair.slave);

    let pid = child.process_id();
    let mut killer = child.clone_killer();
    debug!(?pid, "Subprocess spawned on PTY");

    let raw_mode = RawModeGuard::enable();
    let output_thread = std::thread::spawn(move || copy_output(reader));
    let input_stop = Arc::new(AtomicBool::new(false));
    let input_thread = spawn_input_copier(writer, Arc::clone(&input_stop));

    let master: SharedMaster = Arc::new(Mutex::new(pair.master));
    let resize_stop = CancellationToken::new();
    let resize_task = tokio::spawn(propagate_resize(Arc::clone(&master), resize_stop.clone()));

    let forwarder = request.forwarder(pid, executor.grace_period());
    let kill_switch = forwarder.as_ref().map(SignalForwarder::kill_switch);

    let mut wait_task = tokio::task::spawn_blocking(move || child.wait());
    let deadline = async {
        match request.timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };
    let killed = async {
        match &kill_switch {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    let waited = tokio::select! {
        joined = &mut wait_task => Waited::Exited(joined),
        () = deadline => Waited::TimedOut,
        () = killed => Waited::Killed,
    };
    let waited = match waited {
        Waited::Exited(joined) => Waited::Exited(joined),
        other => {
            if matches!(other, Waited::TimedOut) {
                warn!(?pid, timeout = ?request.timeout, "Subprocess timed out, killing");
            }
            kill(pid, &mut *killer);
            if let Err(e) = wait_task.await {
                warn!(error = %e, "Failed to reap killed subprocess");
            }
            other
        }
    };

    if let Some(forwarder) = forwarder {
        forwarder.stop().await;
    }
    resize_stop.cancel();
    if let Err(e) = resize_task.await {
        debug!(error = %e, "Resize task ended abnormally");
    }

    input_stop.store(true, Ordering::Relaxed);
    #[cfg(unix)]
    join_thread(input_thread, "input").await;
    #[cfg(not(unix))]
    drop(input_thread);
    let raw_output = join_thread(output_thread, "output").await.unwrap_or_default();
    drop(raw_mode);
    drop(master);

    let mut outcome = match waited {
        Waited::Exited(Ok(Ok(status))) => ExecOutcome {
            exit_code: i32::try_from(status.exit_code()).unwrap_or(super::EXIT_FAILURE),
            ..ExecOutcome::default()
        },
        Waited::Exited(Ok(Err(e))) => ExecOutcome::failed(ExecError::Wait(e)),
        Waited::Exited(Err(e)) => ExecOutcome::failed(ExecError::Wait(std::io::Error::other(e))),
        Waited::TimedOut => timed_out(request.timeout),
        Waited::Killed => ExecOutcome {
            exit_code: super::EXIT_FAILURE,
            error: Some(ExecError::Killed),
            ..ExecOutcome::default()
        },
    };

    let captured = Captured {
        text: strip_ansi(&String::from_utf8_lossy(&raw_output)),
        stream: None,
    };
    interpret(&mut outcome, &request.output, captured);
    Ok(outcome)
}

fn kill(pid: Option<u32>, killer: &mut (dyn ChildKiller + Send + Sync)) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        super::signals::signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
    if let Err(e) = killer.kill() {
        debug!(error = %e, "PTY child kill failed, likely already gone");
    }
}

/// Copy master output to stdout until EOF, returning everything read.
fn copy_output(mut reader: Box<dyn Read + Send>) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    let mut echo = true;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if echo && let Err(e) = echo_chunk(&buf[..n]) {
                    debug!(error = %e, "PTY echo stopped, stdout not writable");
                    echo = false;
                }
                captured.extend_from_slice(&buf[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            // EIO once the slave side is closed.
            Err(_) => break,
        }
    }
    captured
}

fn echo_chunk(chunk: &[u8]) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(chunk)?;
    out.flush()
}

/// Forward our stdin into the PTY until `stop` is set.
fn spawn_input_copier(
    writer: Box<dyn Write + Send>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || copy_input(writer, &stop))
}

/// Stdin is polled so the thread notices `stop` within [`INPUT_POLL_MS`]
/// and never consumes input typed after the child is gone.
#[cfg(unix)]
fn copy_input(mut writer: Box<dyn Write + Send>, stop: &AtomicBool) {
    use std::os::fd::AsFd as _;

    use nix::errno::Errno;
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

    let stdin = std::io::stdin();
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::Relaxed) {
        let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(INPUT_POLL_MS)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Polling stdin failed, input forwarding stopped");
                break;
            }
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match nix::unistd::read(stdin.as_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).and_then(|()| writer.flush()).is_err() {
                    break;
                }
            }
            Err(Errno::EINTR) => {}
            Err(e) => {
                debug!(error = %e, "Reading stdin failed, input forwarding stopped");
                break;
            }
        }
    }
}

/// Without a pollable stdin the thread can only notice `stop` after a read,
/// so it may hold on to one more chunk of input once the child is gone.
#[cfg(not(unix))]
fn copy_input(mut writer: Box<dyn Write + Send>, stop: &AtomicBool) {
    let mut stdin = std::io::stdin();
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::Relaxed) {
        match stdin.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stop.load(Ordering::Relaxed)
                    || writer.write_all(&buf[..n]).and_then(|()| writer.flush()).is_err()
                {
                    break;
                }
            }
        }
    }
}

async fn join_thread<T: Send + 'static>(
    thread: std::thread::JoinHandle<T>,
    name: &'static str,
) -> Option<T> {
    let join = tokio::task::spawn_blocking(move || thread.join());
    match tokio::time::timeout(READER_JOIN_TIMEOUT, join).await {
        Ok(Ok(Ok(value))) => Some(value),
        Ok(_) => {
            warn!(thread = name, "PTY thread panicked");
            None
        }
        Err(_) => {
            warn!(thread = name, "PTY thread still busy after child exit, abandoning");
            None
        }
    }
}

#[cfg(unix)]
async fn propagate_resize(master: SharedMaster, stop: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "SIGWINCH handler unavailable");
            return;
        }
    };
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            Some(()) = winch.recv() => {
                let size = terminal_size();
                let result = master
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .resize(size);
                if let Err(e) = result {
                    debug!(error = %e, "PTY resize failed");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn propagate_resize(master: SharedMaster, stop: CancellationToken) {
    drop(master);
    stop.cancelled().await;
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn input_copier_stops_when_told() {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = spawn_input_copier(Box::new(Vec::new()), Arc::clone(&stop));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.store(true, Ordering::Relaxed);
        assert!(join_thread(thread, "input").await.is_some());
    }

    #[tokio::test]
    async fn output_copier_captures_everything() {
        let reader: Box<dyn Read + Send> = Box::new(&b"line one\r\nline two"[..]);
        let captured = join_thread(std::thread::spawn(move || copy_output(reader)), "output")
            .await
            .unwrap();
        assert_eq!(captured, b"line one\r\nline two");
    }
}
