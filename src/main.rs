use std::path::PathBuf;

use netemu_core::config::{ServerConfig, DEFAULT_CONFIG_PATH};
use netemu_core::supervisor::reload;
use netemu_core::supervisor::shutdown::ExitAction;
use netemu_core::supervisor::Supervisor;
use tracing_subscriber::EnvFilter;

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("NETEMU_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,hyper=warn")),
        )
        .init();
    tracing::info!("netemu compute {} starting", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load(&config_path())?.apply_env_overrides();

    let supervisor = Supervisor::new(config);
    let executable = supervisor.executable().map(PathBuf::from);

    match supervisor.run() {
        Ok(ExitAction::Exit) => Ok(()),
        Ok(ExitAction::Reload) => {
            let Some(executable) = executable else {
                tracing::error!("Could not reload: the executable path is unknown");
                std::process::exit(1);
            };
            // only returns if the new image could not be started
            let e = reload::reexec(&executable);
            tracing::error!("Could not reload: {}", e);
            std::process::exit(1);
        }
        // already logged by the supervisor
        Err(_) => std::process::exit(1),
    }
}
