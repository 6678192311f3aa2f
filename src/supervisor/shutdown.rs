//! Single-flight shutdown: the first request wins, later ones are ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::task::JoinHandle;

use super::coordinator::{Coordinator, ShutdownReport};

/// What the process does once the scheduler has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Exit,
    /// Replace the process image with a fresh copy of itself.
    Reload,
}

struct ShutdownInner {
    requested: AtomicBool,
    action: OnceLock<ExitAction>,
    coordinator: Arc<Coordinator>,
    task: Mutex<Option<JoinHandle<ShutdownReport>>>,
}

#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

impl ShutdownHandle {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                requested: AtomicBool::new(false),
                action: OnceLock::new(),
                coordinator,
                task: Mutex::new(None),
            }),
        }
    }

    /// Start the ordered shutdown. Returns `false` if one is already in
    /// flight, in which case nothing happens.
    pub fn request(&self, action: ExitAction) -> bool {
        if self.inner.requested.swap(true, Ordering::AcqRel) {
            tracing::debug!("Shutdown already in progress, ignoring {:?} request", action);
            return false;
        }
        let _ = self.inner.action.set(action);
        tracing::info!("Shutting down ({:?})", action);

        let coordinator = self.inner.coordinator.clone();
        let task = tokio::spawn(async move { coordinator.shutdown().await });
        match self.inner.task.lock() {
            Ok(mut slot) => *slot = Some(task),
            Err(poisoned) => *poisoned.into_inner() = Some(task),
        }
        true
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    pub fn action(&self) -> ExitAction {
        self.inner.action.get().copied().unwrap_or(ExitAction::Exit)
    }

    /// Wait for the shutdown started by [`request`](Self::request).
    pub async fn wait(&self) -> Option<ShutdownReport> {
        let task = match self.inner.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match task?.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!("Shutdown task failed: {}", e);
                None
            }
        }
    }
}

/// Route every termination signal of the host OS to `handle`.
#[cfg(unix)]
pub(crate) fn install_signal_handlers(handle: ShutdownHandle) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = int.recv() => "SIGINT",
                _ = hup.recv() => "SIGHUP",
                _ = quit.recv() => "SIGQUIT",
            };
            tracing::warn!("Server has got signal {}, exiting...", name);
            handle.request(ExitAction::Exit);
        }
    });
    Ok(())
}

#[cfg(windows)]
pub(crate) fn install_signal_handlers(handle: ShutdownHandle) -> std::io::Result<()> {
    use tokio::signal::windows::{ctrl_break, ctrl_c};

    let mut int = ctrl_c()?;
    let mut brk = ctrl_break()?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = int.recv() => "SIGINT",
                _ = brk.recv() => "SIGBREAK",
            };
            tracing::warn!("Server has got signal {}, exiting...", name);
            handle.request(ExitAction::Exit);
        }
    });
    Ok(())
}
