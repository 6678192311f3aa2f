//! Development-mode live reload.
//!
//! Once a second the watched files are compared against the process start
//! time. The first file strictly newer than that triggers a reload: the usual
//! ordered shutdown runs, then the binary re-executes itself with the same
//! arguments so nothing from the old process image survives.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use super::shutdown::{ExitAction, ShutdownHandle};

pub const RELOAD_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SourceWatch {
    started_at: SystemTime,
    paths: Vec<PathBuf>,
}

impl SourceWatch {
    pub fn new(started_at: SystemTime, paths: Vec<PathBuf>) -> Self {
        Self { started_at, paths }
    }

    /// Watch `executable` plus `extra` files.
    pub fn with_executable(started_at: SystemTime, executable: Option<&Path>, extra: &[PathBuf]) -> Self {
        let mut paths = Vec::with_capacity(extra.len() + 1);
        paths.extend(executable.map(Path::to_path_buf));
        paths.extend(extra.iter().cloned());
        Self::new(started_at, paths)
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// First watched file modified after start. Unreadable files are skipped.
    pub async fn modified_file(&self) -> Option<&Path> {
        for path in &self.paths {
            let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if modified > self.started_at {
                return Some(path);
            }
        }
        None
    }
}

pub(crate) fn spawn_reload_hook(
    watch: SourceWatch,
    handle: ShutdownHandle,
    scheduler: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RELOAD_CHECK_INTERVAL);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = scheduler.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Some(path) = watch.modified_file().await {
                tracing::debug!("File {} has been modified", path.display());
                tracing::info!("Reloading");
                handle.request(ExitAction::Reload);
                break;
            }
        }
    })
}

/// Path of the running executable. Must be taken at startup: once the file
/// is replaced on disk the kernel reports the old inode as deleted.
pub fn current_executable() -> std::io::Result<PathBuf> {
    std::env::current_exe()
}

/// Replace the current process with a fresh invocation of `executable` with
/// the same arguments. Only returns on failure.
#[cfg(unix)]
pub fn reexec(executable: &Path) -> std::io::Error {
    use std::os::unix::process::CommandExt;

    tracing::info!("Re-executing {}", executable.display());
    std::process::Command::new(executable)
        .args(std::env::args_os().skip(1))
        .exec()
}

#[cfg(windows)]
pub fn reexec(executable: &Path) -> std::io::Error {
    tracing::info!("Restarting {}", executable.display());
    match std::process::Command::new(executable)
        .args(std::env::args_os().skip(1))
        .spawn()
    {
        Ok(_) => std::process::exit(0),
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_only_files_newer_than_start() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("old.rs");
        std::fs::write(&old, "fn main() {}").unwrap();
        let missing = tmp.path().join("missing.rs");

        let future_start = SystemTime::now() + Duration::from_secs(3600);
        let watch = SourceWatch::new(future_start, vec![missing.clone(), old.clone()]);
        assert!(watch.modified_file().await.is_none());

        let past_start = SystemTime::now() - Duration::from_secs(3600);
        let watch = SourceWatch::new(past_start, vec![missing, old.clone()]);
        assert_eq!(watch.modified_file().await, Some(old.as_path()));
    }

    #[test]
    fn watches_executable_then_extra_files() {
        let exe = PathBuf::from("/opt/netemu/netemu-core");
        let extra = vec![PathBuf::from("config/server.toml")];
        let watch = SourceWatch::with_executable(SystemTime::now(), Some(&exe), &extra);
        assert_eq!(watch.paths(), &[exe, extra[0].clone()]);

        let watch = SourceWatch::with_executable(SystemTime::now(), None, &extra);
        assert_eq!(watch.paths(), &extra[..]);
    }
}
