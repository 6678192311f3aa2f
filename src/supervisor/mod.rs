//! Process supervisor: owns the event loop, the shutdown path and, in debug
//! mode, live reload.

pub mod coordinator;
pub mod error;
pub mod reload;
pub mod shutdown;
pub mod tls;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiServer};
use crate::config::ServerConfig;
use crate::dynamips::Dynamips;
use crate::port_manager::PortManager;
use crate::project::ProjectPaths;
use coordinator::{Coordinator, ModuleRegistry};
use error::StartupError;
use reload::SourceWatch;
use shutdown::{ExitAction, ShutdownHandle};

pub struct Supervisor {
    config: ServerConfig,
    started_at: SystemTime,
    executable: Option<PathBuf>,
    dynamips: Arc<Dynamips>,
    coordinator: Arc<Coordinator>,
    shutdown: ShutdownHandle,
    scheduler: CancellationToken,
}

impl Supervisor {
    /// Supervisor with the built-in module set.
    pub fn new(config: ServerConfig) -> Self {
        let dynamips = Arc::new(Dynamips::new(ProjectPaths::new(&config.projects_path)));
        let registry = ModuleRegistry::new().register(dynamips.clone());
        Self::with_registry(config, dynamips, registry)
    }

    /// `dynamips` must also be part of `registry` to be attached and unloaded.
    pub fn with_registry(config: ServerConfig, dynamips: Arc<Dynamips>, registry: ModuleRegistry) -> Self {
        let port_manager = Arc::new(PortManager::with_udp_range(
            &config.host,
            config.udp_start_port,
            config.udp_end_port,
        ));
        let scheduler = CancellationToken::new();
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(registry),
            port_manager,
            scheduler.clone(),
        ));
        let shutdown = ShutdownHandle::new(coordinator.clone());
        let executable = match reload::current_executable() {
            Ok(exe) => Some(exe),
            Err(e) => {
                tracing::warn!("Cannot locate the running executable: {}", e);
                None
            }
        };
        Self {
            config,
            started_at: SystemTime::now(),
            executable,
            dynamips,
            coordinator,
            shutdown,
            scheduler,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn dynamips(&self) -> &Arc<Dynamips> {
        &self.dynamips
    }

    /// Executable recorded at startup; the target of a reload.
    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    /// Run on a single-threaded runtime until shut down.
    pub fn run(self) -> Result<ExitAction, StartupError> {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                let err = StartupError::Runtime(e);
                tracing::error!("{}", err);
                return Err(err);
            }
        };
        runtime.block_on(self.serve())
    }

    /// Startup sequence, then serve until the scheduler stops. Any startup
    /// failure is logged here and returned before modules are attached or
    /// signals are routed.
    pub async fn serve(self) -> Result<ExitAction, StartupError> {
        let (listener, tls) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                tracing::error!("{}", e);
                return Err(e);
            }
        };

        self.coordinator.attach_all();
        if let Err(e) = shutdown::install_signal_handlers(self.shutdown.clone()) {
            let err = StartupError::Signals(e);
            tracing::error!("{}", err);
            return Err(err);
        }

        if self.config.debug {
            tracing::info!("Code live reload is enabled, watching for file changes");
            let watch = SourceWatch::with_executable(
                self.started_at,
                self.executable(),
                &self.config.watch_paths,
            );
            reload::spawn_reload_hook(watch, self.shutdown.clone(), self.scheduler.clone());
        }

        let scheme = if tls.is_some() { "https" } else { "http" };
        match listener.local_addr() {
            Ok(local) => tracing::info!("Starting server on {}://{}", scheme, local),
            Err(_) => tracing::info!("Starting server on {}://{}", scheme, self.config.listen_addr()),
        }

        let router = ApiServer::new(self.dynamips.clone(), self.scheduler.clone()).router();
        let served = match tls {
            Some(tls) => api::serve_tls(listener, router, tls, self.scheduler.clone()).await,
            None => api::serve(listener, router, self.scheduler.clone()).await,
        };
        if let Err(e) = served {
            tracing::error!("Server loop failed: {}", e);
        }

        // the server can also stop on its own; unload modules either way
        if !self.shutdown.is_requested() {
            self.shutdown.request(ExitAction::Exit);
        }
        if let Some(report) = self.shutdown.wait().await {
            tracing::info!(
                "{} modules unloaded, {} with errors",
                report.outcomes.len(),
                report.failures().count()
            );
        }
        tracing::info!("Server stopped");
        Ok(self.shutdown.action())
    }

    async fn bind(&self) -> Result<(TcpListener, Option<Arc<rustls::ServerConfig>>), StartupError> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| StartupError::Bind { addr, source })?;
        let tls = if self.config.ssl { Some(self.load_tls()?) } else { None };
        Ok((listener, tls))
    }

    fn load_tls(&self) -> Result<Arc<rustls::ServerConfig>, StartupError> {
        if cfg!(windows) {
            return Err(StartupError::TlsUnsupported);
        }
        let certfile = self
            .config
            .certfile
            .as_deref()
            .ok_or(StartupError::TlsNotConfigured("certfile"))?;
        let certkey = self
            .config
            .certkey
            .as_deref()
            .ok_or(StartupError::TlsNotConfigured("certkey"))?;
        let tls = tls::load_tls_config(certfile, certkey)?;
        tracing::info!("SSL is enabled");
        Ok(tls)
    }
}
