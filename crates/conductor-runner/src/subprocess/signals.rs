//! Termination signals: forwarding to a running child and process-wide
//! interrupt state.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
#[cfg(unix)]
use tracing::warn;

/// Signal number recorded for a Ctrl-C where signal numbers do not exist.
#[cfg(not(unix))]
const CTRL_C: i32 = 2;

/// Process-wide record that the user asked conductor to stop.
///
/// Signal forwarders raise it when they relay a signal to a child; an idle
/// listener ([`Interrupt::listen`]) raises it when no child is running.
/// Run modes stop dispatching new work once it is raised. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    token: CancellationToken,
    /// First signal received, 0 while not raised.
    signal: Arc<AtomicI32>,
    /// Children currently covered by a forwarder.
    children: Arc<AtomicUsize>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the interrupt as raised by `signal`. The first signal wins.
    pub fn raise(&self, signal: i32) {
        if self
            .signal
            .compare_exchange(0, signal, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(signal, "Interrupt received, no new tasks will start");
        }
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancelled once the interrupt is raised.
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Conventional shell exit code, `128 + signal`, once raised.
    pub fn exit_code(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(128 + signal),
        }
    }

    /// Number of children whose forwarder is live.
    pub fn running_children(&self) -> usize {
        self.children.load(Ordering::SeqCst)
    }

    fn attach_child(&self) -> ChildGuard {
        self.children.fetch_add(1, Ordering::SeqCst);
        ChildGuard {
            children: Arc::clone(&self.children),
        }
    }

    /// Wait for a termination signal that arrives while no child is running.
    ///
    /// Signals received while children run are left to their forwarders; they
    /// only raise the interrupt. Returns the exit code the process should end
    /// with, or `None` when the signal handlers cannot be installed.
    #[cfg(unix)]
    pub async fn listen(&self) -> Option<i32> {
        use nix::sys::signal::Signal;
        use tokio::signal::unix::{SignalKind, signal};

        let (mut interrupt, mut terminate, mut quit) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::quit()),
        ) {
            (Ok(i), Ok(t), Ok(q)) => (i, t, q),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                warn!(error = %e, "Failed to install signal handlers");
                return None;
            }
        };
        loop {
            let received = tokio::select! {
                Some(()) = interrupt.recv() => Signal::SIGINT,
                Some(()) = terminate.recv() => Signal::SIGTERM,
                Some(()) = quit.recv() => Signal::SIGQUIT,
                else => return None,
            };
            self.raise(received as i32);
            let running = self.running_children();
            if running == 0 {
                return self.exit_code();
            }
            debug!(%received, running, "Signal left to child forwarders");
        }
    }

    #[cfg(not(unix))]
    pub async fn listen(&self) -> Option<i32> {
        loop {
            tokio::signal::ctrl_c().await.ok()?;
            self.raise(CTRL_C);
            if self.running_children() == 0 {
                return self.exit_code();
            }
        }
    }
}

/// Counts one running child for [`Interrupt::running_children`].
struct ChildGuard {
    children: Arc<AtomicUsize>,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.children.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Background task relaying SIGINT/SIGTERM/SIGQUIT to a child's process group.
///
/// A forwarded SIGTERM arms a grace timer; if the child is still around when
/// it fires, the group is sent SIGKILL. On platforms without those signals,
/// Ctrl-C requests an immediate kill through [`SignalForwarder::kill_switch`].
/// Every relayed signal also raises the shared [`Interrupt`].
///
/// The task lives until [`SignalForwarder::stop`] is awaited.
pub struct SignalForwarder {
    cancel: CancellationToken,
    kill_switch: CancellationToken,
    handle: JoinHandle<()>,
    _child: ChildGuard,
}

impl SignalForwarder {
    /// Start forwarding to the process group led by `pid`.
    ///
    /// If `interrupt` is already raised the child is asked to terminate
    /// straight away.
    pub fn spawn(pid: u32, grace: Duration, interrupt: Interrupt) -> Self {
        let cancel = CancellationToken::new();
        let kill_switch = CancellationToken::new();
        let child = interrupt.attach_child();
        let handle = tokio::spawn(forward(
            pid,
            grace,
            interrupt,
            cancel.clone(),
            kill_switch.clone(),
        ));
        debug!(pid, ?grace, "Signal forwarding started");
        Self {
            cancel,
            kill_switch,
            handle,
            _child: child,
        }
    }

    /// Cancelled once the child has been (or must be) killed outright.
    pub fn kill_switch(&self) -> CancellationToken {
        self.kill_switch.clone()
    }

    /// Stop forwarding and wait for the background task to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            debug!(error = %e, "Signal forwarder ended abnormally");
        }
    }
}

#[cfg(unix)]
async fn forward(
    pid: u32,
    grace: Duration,
    shared: Interrupt,
    cancel: CancellationToken,
    kill_switch: CancellationToken,
) {
    use nix::sys::signal::Signal;
    use tokio::signal::unix::{SignalKind, signal};
    use tokio::time::Instant;

    let (mut interrupt, mut terminate, mut quit) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) {
        (Ok(i), Ok(t), Ok(q)) => (i, t, q),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
            warn!(error = %e, "Failed to install signal handlers, not forwarding");
            return;
        }
    };

    let mut deadline: Option<Instant> = None;
    if shared.is_raised() {
        signal_group(pid, Signal::SIGTERM);
        deadline = Some(Instant::now() + grace);
    }
    loop {
        let relayed = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = escalation(deadline) => {
                warn!(pid, ?grace, "Child ignored SIGTERM, sending SIGKILL");
                signal_group(pid, Signal::SIGKILL);
                deadline = None;
                kill_switch.cancel();
                continue;
            }
            Some(()) = interrupt.recv() => Signal::SIGINT,
            Some(()) = terminate.recv() => {
                deadline.get_or_insert_with(|| Instant::now() + grace);
                Signal::SIGTERM
            }
            Some(()) = quit.recv() => Signal::SIGQUIT,
        };
        signal_group(pid, relayed);
        shared.raise(relayed as i32);
    }
}

#[cfg(unix)]
async fn escalation(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn forward(
    _pid: u32,
    _grace: Duration,
    shared: Interrupt,
    cancel: CancellationToken,
    kill_switch: CancellationToken,
) {
    if shared.is_raised() {
        kill_switch.cancel();
        return;
    }
    tokio::select! {
        () = cancel.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if result.is_ok() {
                debug!("Interrupt received, killing child");
                shared.raise(CTRL_C);
                kill_switch.cancel();
            }
        }
    }
}

/// Send `signal` to the process group led by `pid`.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => debug!(pid, %signal, "Signalled process group"),
        Err(nix::errno::Errno::ESRCH) => debug!(pid, %signal, "Process group already gone"),
        Err(e) => warn!(pid, %signal, error = %e, "Failed to signal process group"),
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_joins_forwarder() {
        let interrupt = Interrupt::new();
        let forwarder = SignalForwarder::spawn(u32::MAX, Duration::from_secs(5), interrupt.clone());
        assert_eq!(interrupt.running_children(), 1);
        let kill_switch = forwarder.kill_switch();
        tokio::time::timeout(Duration::from_secs(2), forwarder.stop())
            .await
            .unwrap();
        assert!(!kill_switch.is_cancelled());
        assert_eq!(interrupt.running_children(), 0);
        assert!(!interrupt.is_raised());
    }

    #[test]
    fn signalling_missing_group_is_harmless() {
        signal_group(u32::MAX, nix::sys::signal::Signal::SIGTERM);
    }

    #[test]
    fn first_signal_sets_exit_code() {
        let interrupt = Interrupt::new();
        assert_eq!(interrupt.exit_code(), None);
        interrupt.raise(15);
        interrupt.clone().raise(2);
        assert!(interrupt.is_raised());
        assert!(interrupt.token().is_cancelled());
        assert_eq!(interrupt.exit_code(), Some(143));
    }

    #[tokio::test]
    async fn raised_interrupt_escalates_new_child() {
        // The group does not exist, so only the escalation path is observable.
        let interrupt = Interrupt::new();
        interrupt.raise(2);
        let forwarder = SignalForwarder::spawn(u32::MAX, Duration::from_millis(50), interrupt);
        let kill_switch = forwarder.kill_switch();
        tokio::time::timeout(Duration::from_secs(2), kill_switch.cancelled())
            .await
            .unwrap();
        forwarder.stop().await;
    }
}
