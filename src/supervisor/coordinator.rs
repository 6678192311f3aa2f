//! Ordered startup attachment and best-effort shutdown of backend modules.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::port_manager::PortManager;

/// An emulation engine owning its own node namespace.
#[async_trait]
pub trait BackendModule: Send + Sync {
    fn name(&self) -> &str;

    /// Hand the module the shared port allocator. Called once at startup.
    fn attach_port_manager(&self, port_manager: Arc<PortManager>);

    /// Release everything the module holds (nodes, NIOs, child processes).
    async fn unload(&self) -> anyhow::Result<()>;
}

/// Modules known to this process, in registration order. Built once before
/// the supervisor starts and never changed afterwards.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn BackendModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, module: Arc<dyn BackendModule>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn BackendModule>> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleOutcome {
    pub name: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub outcomes: Vec<ModuleOutcome>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| o.error.is_none())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ModuleOutcome> {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }
}

pub struct Coordinator {
    registry: Arc<ModuleRegistry>,
    port_manager: Arc<PortManager>,
    scheduler: CancellationToken,
}

impl Coordinator {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        port_manager: Arc<PortManager>,
        scheduler: CancellationToken,
    ) -> Self {
        Self { registry, port_manager, scheduler }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Give every module the shared port manager, in registration order.
    pub fn attach_all(&self) {
        for module in self.registry.iter() {
            tracing::debug!("Loading module {}", module.name());
            module.attach_port_manager(self.port_manager.clone());
        }
    }

    /// Unload every module in registration order, then stop the scheduler.
    ///
    /// A module whose unload fails (or panics) is logged and skipped; the
    /// remaining modules are still unloaded.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        for module in self.registry.iter() {
            let name = module.name().to_string();
            tracing::debug!("Unloading module {}", name);

            let task = {
                let module = module.clone();
                tokio::spawn(async move { module.unload().await })
            };
            let error = match task.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(join) => Some(format!("unload task failed: {}", join)),
            };
            if let Some(e) = &error {
                tracing::warn!("Module {} failed to unload: {}", name, e);
            }
            report.outcomes.push(ModuleOutcome { name, error });
        }
        self.scheduler.cancel();
        report
    }
}
