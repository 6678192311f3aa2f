//! Dynamips backend module.
//!
//! Owns the namespace of Ethernet hub nodes and the NIOs bound to them. The
//! frame-forwarding engine sits behind this module; what lives here is the
//! bookkeeping the control plane needs: which NIO is on which port, which
//! capture is running, and which resources must be given back on unload.

pub mod capture;
pub mod hub;
pub mod nio;
pub mod slot;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ControlError, ControlResult};
use crate::port_manager::PortManager;
use crate::project::ProjectPaths;
use crate::supervisor::coordinator::BackendModule;
use crate::utils::poisoned;
use capture::LinkType;
use hub::{default_ports, Detached, EthernetHub, PortSpec};
use nio::{Nio, NioConfig};

/// Node kinds this module can emulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    EthernetHub,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EthernetHub => f.write_str("ethernet_hub"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeCreate {
    pub name: String,
    pub project_id: Uuid,
    pub node_id: Option<Uuid>,
    pub node_type: NodeType,
    pub ports: Option<Vec<PortSpec>>,
}

pub struct Dynamips {
    projects: ProjectPaths,
    port_manager: OnceLock<Arc<PortManager>>,
    nodes: RwLock<HashMap<Uuid, Arc<EthernetHub>>>,
    /// Removed from their port but not released yet.
    orphans: Mutex<Vec<Arc<Nio>>>,
}

impl Dynamips {
    pub fn new(projects: ProjectPaths) -> Self {
        Self {
            projects,
            port_manager: OnceLock::new(),
            nodes: RwLock::new(HashMap::new()),
            orphans: Mutex::new(Vec::new()),
        }
    }

    pub fn projects(&self) -> &ProjectPaths {
        &self.projects
    }

    pub fn port_manager(&self) -> Option<&Arc<PortManager>> {
        self.port_manager.get()
    }

    pub fn has_port_manager(&self) -> bool {
        self.port_manager.get().is_some()
    }

    fn nodes(&self) -> ControlResult<RwLockReadGuard<'_, HashMap<Uuid, Arc<EthernetHub>>>> {
        self.nodes.read().map_err(|_| poisoned("Dynamips nodes"))
    }

    fn nodes_mut(&self) -> ControlResult<RwLockWriteGuard<'_, HashMap<Uuid, Arc<EthernetHub>>>> {
        self.nodes.write().map_err(|_| poisoned("Dynamips nodes"))
    }

    fn orphan_list(&self) -> ControlResult<MutexGuard<'_, Vec<Arc<Nio>>>> {
        self.orphans.lock().map_err(|_| poisoned("Dynamips orphans"))
    }

    pub fn node_count(&self) -> usize {
        self.nodes().map(|n| n.len()).unwrap_or(0)
    }

    /// NIOs that were removed from their port but whose release failed.
    pub fn orphaned_nios(&self) -> Vec<Arc<Nio>> {
        self.orphan_list().map(|o| o.clone()).unwrap_or_default()
    }

    pub async fn create_node(&self, request: NodeCreate) -> ControlResult<Arc<EthernetHub>> {
        let node_id = request.node_id.unwrap_or_else(Uuid::new_v4);
        let ports = request.ports.unwrap_or_else(default_ports);
        let mut nodes = self.nodes_mut()?;
        if nodes.contains_key(&node_id) {
            return Err(ControlError::NodeExists(node_id));
        }
        let node = Arc::new(EthernetHub::new(node_id, request.project_id, &request.name, ports));
        nodes.insert(node_id, node.clone());
        tracing::info!(
            "{} \"{}\" [{}] created in project {}",
            request.node_type, request.name, node_id, request.project_id
        );
        Ok(node)
    }

    /// Look a node up, checking that it belongs to `project_id`.
    pub fn get_node(&self, node_id: Uuid, project_id: Uuid) -> ControlResult<Arc<EthernetHub>> {
        let node = self
            .nodes()?
            .get(&node_id)
            .cloned()
            .ok_or(ControlError::NodeNotFound(node_id))?;
        if node.project_id() != project_id {
            return Err(ControlError::NodeNotInProject { node: node_id, project: project_id });
        }
        Ok(node)
    }

    pub async fn delete_node(&self, node_id: Uuid) -> ControlResult<()> {
        let node = self
            .nodes_mut()?
            .remove(&node_id)
            .ok_or(ControlError::NodeNotFound(node_id))?;
        let failed = node.close().await?;
        self.park_orphans(failed)?;
        tracing::info!("Node {} deleted", node_id);
        Ok(())
    }

    /// Copy the source hub's port layout onto an existing destination hub.
    pub async fn duplicate_node(
        &self,
        source_id: Uuid,
        destination_id: Uuid,
    ) -> ControlResult<Arc<EthernetHub>> {
        let (source, destination) = {
            let nodes = self.nodes()?;
            let source = nodes
                .get(&source_id)
                .cloned()
                .ok_or(ControlError::NodeNotFound(source_id))?;
            let destination = nodes
                .get(&destination_id)
                .cloned()
                .ok_or(ControlError::NodeNotFound(destination_id))?;
            (source, destination)
        };
        destination.set_ports_mapping(source.ports()?)?;
        destination.updated();
        tracing::info!("Node {} duplicated into {}", source_id, destination_id);
        Ok(destination)
    }

    /// Materialize a detached NIO for `node`. A UDP NIO without a local
    /// port gets the first free one.
    pub fn create_nio(&self, node: &EthernetHub, mut config: NioConfig) -> ControlResult<Arc<Nio>> {
        let port_manager = self.port_manager.get().cloned();
        if let NioConfig::Udp { lport, .. } = &mut config {
            let pm = port_manager.as_ref().ok_or_else(|| {
                ControlError::Internal(anyhow::anyhow!("Dynamips module has no port manager"))
            })?;
            let project = node.project_id().to_string();
            if *lport == 0 {
                *lport = pm.get_free_udp_port(&project)?;
            } else {
                pm.reserve_udp_port(*lport, &project)?;
            }
        }
        let nio = Arc::new(Nio::new(config, node.project_id(), port_manager));
        tracing::debug!("NIO {} created for node {}", nio.name(), node.id());
        Ok(nio)
    }

    /// Create a NIO and bind it to `port`. If binding fails the new NIO is
    /// released before the error is returned. A UDP NIO whose local socket
    /// cannot be opened stays attached without frame I/O.
    pub async fn attach_nio(
        &self,
        node: &Arc<EthernetHub>,
        port: u32,
        config: NioConfig,
    ) -> ControlResult<Arc<Nio>> {
        let nio = self.create_nio(node, config)?;
        if let Err(e) = node.add_nio(nio.clone(), port).await {
            if let Err(release) = nio.release() {
                tracing::warn!("NIO {} could not be released: {}", nio.name(), release);
                self.park_orphans(vec![Detached { nio, release_error: Some(release) }])?;
            }
            return Err(e);
        }
        match nio.bind_udp().await {
            Ok(Some(socket)) => {
                hub::spawn_udp_receiver(Arc::downgrade(node), port, nio.clone(), socket);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("NIO {}: could not open UDP socket: {}", nio.name(), e),
        }
        Ok(nio)
    }

    /// Remove and release the NIO on `port` as one operation.
    pub async fn detach_nio(&self, node: &EthernetHub, port: u32) -> ControlResult<()> {
        let detached = node.detach_nio(port).await?;
        if let Some(e) = detached.release_error {
            tracing::warn!(
                "NIO {} removed from node {} port {} but not released: {}",
                detached.nio.name(), node.id(), port, e
            );
            self.orphan_list()?.push(detached.nio);
            return Err(e);
        }
        Ok(())
    }

    /// Start a capture on `port`, writing into the project's capture
    /// directory. Returns the capture file path.
    pub async fn start_capture(
        &self,
        node: &EthernetHub,
        port: u32,
        file_name: &str,
        link_type: LinkType,
    ) -> ControlResult<PathBuf> {
        let file_name = validate_capture_file_name(file_name)?;
        // fail before touching the disk when nothing is attached
        node.get_nio(port).await?;
        let dir = self
            .projects
            .capture_working_directory(&node.project_id())
            .await
            .map_err(|e| anyhow::anyhow!("Could not create capture directory: {}", e))?;
        let path = dir.join(file_name);
        node.start_capture(port, &path, link_type).await?;
        Ok(path)
    }

    pub async fn stop_capture(&self, node: &EthernetHub, port: u32) -> ControlResult<()> {
        node.stop_capture(port).await
    }

    /// Stream the capture file of `nio` while it grows.
    pub async fn stream_pcap_file(
        &self,
        nio: &Nio,
        shutdown: CancellationToken,
    ) -> ControlResult<BoxStream<'static, std::io::Result<Bytes>>> {
        let session = nio.capture().ok_or_else(|| {
            ControlError::CaptureFileNotFound(format!("no packet capture active on NIO {}", nio.name()))
        })?;
        session.open_stream(shutdown).await
    }

    fn park_orphans(&self, detached: Vec<Detached>) -> ControlResult<()> {
        if detached.is_empty() {
            return Ok(());
        }
        let mut orphans = self.orphan_list()?;
        for d in detached {
            if let Some(e) = &d.release_error {
                tracing::warn!("NIO {} left unreleased: {}", d.nio.name(), e);
            }
            orphans.push(d.nio);
        }
        Ok(())
    }

    fn retry_orphans(&self) -> ControlResult<usize> {
        let mut orphans = self.orphan_list()?;
        orphans.retain(|nio| match nio.release() {
            Ok(_) => false,
            Err(e) => {
                tracing::warn!("NIO {} still cannot be released: {}", nio.name(), e);
                true
            }
        });
        Ok(orphans.len())
    }
}

/// Capture files must land directly in the capture directory.
fn validate_capture_file_name(name: &str) -> ControlResult<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(name),
        _ => Err(ControlError::InvalidRequest(format!(
            "Invalid capture file name '{}'",
            name
        ))),
    }
}

#[async_trait]
impl BackendModule for Dynamips {
    fn name(&self) -> &str {
        "dynamips"
    }

    fn attach_port_manager(&self, port_manager: Arc<PortManager>) {
        if self.port_manager.set(port_manager).is_err() {
            tracing::warn!("Dynamips port manager already attached, keeping the first one");
        }
    }

    async fn unload(&self) -> anyhow::Result<()> {
        let nodes: Vec<Arc<EthernetHub>> = self.nodes_mut()?.drain().map(|(_, n)| n).collect();
        tracing::info!("Dynamips: closing {} nodes", nodes.len());

        let mut errors = Vec::new();
        for node in nodes {
            match node.close().await {
                Ok(failed) => self.park_orphans(failed)?,
                Err(e) => errors.push(format!("node {}: {}", node.id(), e)),
            }
        }
        let left = self.retry_orphans()?;
        if left > 0 {
            errors.push(format!("{} NIOs could not be released", left));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Dynamips unload incomplete: {}", errors.join("; ")))
        }
    }
}
