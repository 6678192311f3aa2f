//! Ethernet hub node.
//!
//! Every port lives in its own [`PortSlot`] behind an async mutex. Lifecycle
//! operations (attach, detach, start/stop capture) take that lock for their
//! whole duration, so two transitions on the same port are serialized while
//! different ports proceed independently.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::capture::{CaptureSession, LinkType};
use super::nio::Nio;
use super::slot::{PortSlot, SlotState};
use crate::error::{ControlError, ControlResult};
use crate::utils::{current_timestamp, poisoned};

pub const DEFAULT_HUB_PORTS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub port_number: u32,
}

pub fn default_ports() -> Vec<PortSpec> {
    (0..DEFAULT_HUB_PORTS)
        .map(|n| PortSpec { name: format!("Ethernet{}", n), port_number: n })
        .collect()
}

/// Serialized view of a hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthernetHubInfo {
    pub name: String,
    pub node_id: Uuid,
    pub project_id: Uuid,
    pub ports_mapping: Vec<PortSpec>,
    pub status: String,
    pub updated_at: u64,
}

/// A NIO pulled out of its slot. `release_error` is set when the slot was
/// emptied but the NIO could not give its resources back.
#[derive(Debug)]
pub struct Detached {
    pub nio: Arc<Nio>,
    pub release_error: Option<ControlError>,
}

type SlotHandle = Arc<AsyncMutex<PortSlot>>;

#[derive(Debug)]
struct HubInner {
    name: String,
    ports: Vec<PortSpec>,
    slots: BTreeMap<u32, SlotHandle>,
}

#[derive(Debug)]
pub struct EthernetHub {
    id: Uuid,
    project_id: Uuid,
    inner: Mutex<HubInner>,
    updated_at: AtomicU64,
}

impl EthernetHub {
    pub fn new(id: Uuid, project_id: Uuid, name: &str, ports: Vec<PortSpec>) -> Self {
        Self {
            id,
            project_id,
            inner: Mutex::new(HubInner {
                name: name.to_string(),
                ports,
                slots: BTreeMap::new(),
            }),
            updated_at: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    fn inner(&self) -> ControlResult<MutexGuard<'_, HubInner>> {
        self.inner.lock().map_err(|_| poisoned("EthernetHub"))
    }

    pub fn name(&self) -> ControlResult<String> {
        Ok(self.inner()?.name.clone())
    }

    /// Returns `false` when `name` is already the hub's name.
    pub fn set_name(&self, name: &str) -> ControlResult<bool> {
        let mut inner = self.inner()?;
        if inner.name == name {
            return Ok(false);
        }
        tracing::info!("Ethernet hub \"{}\" renamed to \"{}\"", inner.name, name);
        inner.name = name.to_string();
        Ok(true)
    }

    pub fn ports(&self) -> ControlResult<Vec<PortSpec>> {
        Ok(self.inner()?.ports.clone())
    }

    /// Replace the port layout. Refused while any port holds a NIO or is
    /// in the middle of a transition.
    pub fn set_ports_mapping(&self, ports: Vec<PortSpec>) -> ControlResult<()> {
        let mut inner = self.inner()?;
        if inner.ports == ports {
            return Ok(());
        }
        for slot in inner.slots.values() {
            match slot.try_lock() {
                Ok(slot) if slot.state() == SlotState::Empty => {}
                _ => return Err(ControlError::HubInUse(self.id)),
            }
        }
        inner.slots.retain(|port, _| ports.iter().any(|p| p.port_number == *port));
        inner.ports = ports;
        Ok(())
    }

    /// Record that the node changed.
    pub fn updated(&self) {
        self.updated_at.store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> ControlResult<EthernetHubInfo> {
        let inner = self.inner()?;
        Ok(EthernetHubInfo {
            name: inner.name.clone(),
            node_id: self.id,
            project_id: self.project_id,
            ports_mapping: inner.ports.clone(),
            // hubs are always on
            status: "started".to_string(),
            updated_at: self.updated_at(),
        })
    }

    async fn lock_slot(&self, port: u32) -> ControlResult<OwnedMutexGuard<PortSlot>> {
        let slot = {
            let mut inner = self.inner()?;
            if !inner.ports.iter().any(|p| p.port_number == port) {
                return Err(ControlError::PortNotFound { node: self.id, port });
            }
            inner.slots.entry(port).or_default().clone()
        };
        Ok(slot.lock_owned().await)
    }

    pub async fn slot_state(&self, port: u32) -> ControlResult<SlotState> {
        Ok(self.lock_slot(port).await?.state())
    }

    pub async fn add_nio(&self, nio: Arc<Nio>, port: u32) -> ControlResult<()> {
        let mut slot = self.lock_slot(port).await?;
        if slot.nio().is_some() {
            return Err(ControlError::PortOccupied { node: self.id, port });
        }
        tracing::info!("Ethernet hub {}: NIO {} bound to port {}", self.id, nio.name(), port);
        slot.attach(nio).map_err(anyhow::Error::from)?;
        self.updated();
        Ok(())
    }

    pub async fn get_nio(&self, port: u32) -> ControlResult<Arc<Nio>> {
        let slot = self.lock_slot(port).await?;
        slot.nio()
            .cloned()
            .ok_or(ControlError::NioNotFound { node: self.id, port })
    }

    /// Remove the NIO from `port` and release it in one step. A running
    /// capture is stopped first. The slot stays locked until the release has
    /// been attempted, so no other operation sees the NIO half-removed.
    pub async fn detach_nio(&self, port: u32) -> ControlResult<Detached> {
        let mut slot = self.lock_slot(port).await?;
        if slot.nio().is_none() {
            return Err(ControlError::NioNotFound { node: self.id, port });
        }
        self.detach_locked(&mut slot, port).await
    }

    async fn detach_locked(&self, slot: &mut PortSlot, port: u32) -> ControlResult<Detached> {
        if let Some(nio) = slot.nio() {
            nio.stop_capture().await?;
        }
        let nio = slot.detach().map_err(anyhow::Error::from)?;
        tracing::info!("Ethernet hub {}: NIO {} removed from port {}", self.id, nio.name(), port);
        self.updated();
        let release_error = nio.release().err();
        Ok(Detached { nio, release_error })
    }

    pub async fn start_capture(
        &self,
        port: u32,
        output_file: &Path,
        link_type: LinkType,
    ) -> ControlResult<Arc<CaptureSession>> {
        let mut slot = self.lock_slot(port).await?;
        let nio = slot
            .nio()
            .cloned()
            .ok_or(ControlError::NioNotFound { node: self.id, port })?;
        if slot.state() == SlotState::Capturing || nio.capture().is_some() {
            return Err(ControlError::CaptureAlreadyRunning { node: self.id, port });
        }
        let session = CaptureSession::start(output_file, link_type)
            .await
            .map_err(|e| {
                anyhow::anyhow!("Could not create capture file {}: {}", output_file.display(), e)
            })?;
        nio.set_capture(session.clone())?;
        slot.begin_capture().map_err(anyhow::Error::from)?;
        tracing::info!(
            "Ethernet hub {}: capture started on port {} to {}",
            self.id, port, output_file.display()
        );
        Ok(session)
    }

    pub async fn stop_capture(&self, port: u32) -> ControlResult<()> {
        let mut slot = self.lock_slot(port).await?;
        let nio = slot
            .nio()
            .cloned()
            .ok_or(ControlError::NioNotFound { node: self.id, port })?;
        if !nio.stop_capture().await? {
            return Err(ControlError::CaptureNotRunning { node: self.id, port });
        }
        slot.end_capture().map_err(anyhow::Error::from)?;
        tracing::info!("Ethernet hub {}: capture stopped on port {}", self.id, port);
        Ok(())
    }

    /// Repeat a frame received on `from` out of every other connected port.
    pub async fn forward(&self, from: u32, frame: &[u8]) {
        let slots: Vec<(u32, SlotHandle)> = match self.inner() {
            Ok(inner) => inner
                .slots
                .iter()
                .filter(|(port, _)| **port != from)
                .map(|(port, slot)| (*port, slot.clone()))
                .collect(),
            Err(_) => return,
        };
        for (port, slot) in slots {
            let nio = slot.lock().await.nio().cloned();
            if let Some(nio) = nio {
                if let Err(e) = nio.transmit(frame).await {
                    tracing::debug!("Ethernet hub {}: send on port {} failed: {}", self.id, port, e);
                }
            }
        }
    }

    /// Detach every port. NIOs whose release failed are returned.
    pub async fn close(&self) -> ControlResult<Vec<Detached>> {
        let slots: Vec<(u32, SlotHandle)> = self
            .inner()?
            .slots
            .iter()
            .map(|(port, slot)| (*port, slot.clone()))
            .collect();

        let mut failed = Vec::new();
        for (port, slot) in slots {
            let mut slot = slot.lock_owned().await;
            if slot.nio().is_none() {
                continue;
            }
            let detached = self.detach_locked(&mut slot, port).await?;
            if detached.release_error.is_some() {
                failed.push(detached);
            }
        }
        tracing::info!("Ethernet hub {} closed", self.id);
        Ok(failed)
    }
}

/// Feed datagrams arriving on a UDP NIO into its capture and out of the
/// hub's other ports, until the NIO is released or the hub is gone.
pub(crate) fn spawn_udp_receiver(
    hub: Weak<EthernetHub>,
    port: u32,
    nio: Arc<Nio>,
    socket: Arc<UdpSocket>,
) -> JoinHandle<()> {
    let stop = nio.stop_token();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let received = tokio::select! {
                _ = stop.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            let n = match received {
                Ok((n, _)) => n,
                Err(e) => {
                    tracing::debug!("NIO {}: receive failed: {}", nio.name(), e);
                    continue;
                }
            };
            let frame = &buf[..n];
            if let Err(e) = nio.ingress(frame).await {
                tracing::warn!("NIO {}: could not record frame: {}", nio.name(), e);
            }
            match hub.upgrade() {
                Some(hub) => hub.forward(port, frame).await,
                None => break,
            }
        }
        tracing::debug!("NIO {} receiver stopped", nio.name());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamips::nio::NioConfig;

    fn hub() -> EthernetHub {
        EthernetHub::new(Uuid::new_v4(), Uuid::new_v4(), "Hub1", default_ports())
    }

    fn nio(hub: &EthernetHub) -> Arc<Nio> {
        Arc::new(Nio::new(NioConfig::Null, hub.project_id(), None))
    }

    #[test]
    fn rename_only_when_changed() {
        let hub = hub();
        assert!(!hub.set_name("Hub1").unwrap());
        assert!(hub.set_name("Core").unwrap());
        assert_eq!(hub.name().unwrap(), "Core");
    }

    #[test]
    fn default_layout() {
        let ports = default_ports();
        assert_eq!(ports.len(), 8);
        assert_eq!(ports[7].name, "Ethernet7");
    }

    #[tokio::test]
    async fn occupied_port_keeps_first_nio() {
        let hub = hub();
        let first = nio(&hub);
        hub.add_nio(first.clone(), 1).await.unwrap();

        let err = hub.add_nio(nio(&hub), 1).await.unwrap_err();
        assert!(matches!(err, ControlError::PortOccupied { port: 1, .. }));
        assert_eq!(hub.get_nio(1).await.unwrap().name(), first.name());
    }

    #[tokio::test]
    async fn unknown_port_is_not_found() {
        let hub = hub();
        let err = hub.add_nio(nio(&hub), 42).await.unwrap_err();
        assert!(matches!(err, ControlError::PortNotFound { port: 42, .. }));
    }

    #[tokio::test]
    async fn detach_stops_capture_then_releases() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = hub();
        hub.add_nio(nio(&hub), 0).await.unwrap();
        let session = hub
            .start_capture(0, &tmp.path().join("a.pcap"), LinkType::En10mb)
            .await
            .unwrap();
        assert_eq!(hub.slot_state(0).await.unwrap(), SlotState::Capturing);

        let detached = hub.detach_nio(0).await.unwrap();
        assert!(detached.release_error.is_none());
        assert!(detached.nio.is_released());
        assert!(!session.is_running());
        assert_eq!(hub.slot_state(0).await.unwrap(), SlotState::Empty);
        assert!(hub.get_nio(0).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn stop_without_capture_is_not_found() {
        let hub = hub();
        hub.add_nio(nio(&hub), 2).await.unwrap();
        let err = hub.stop_capture(2).await.unwrap_err();
        assert!(matches!(err, ControlError::CaptureNotRunning { port: 2, .. }));
    }

    #[tokio::test]
    async fn ports_locked_while_connected() {
        let hub = hub();
        hub.add_nio(nio(&hub), 0).await.unwrap();
        let err = hub.set_ports_mapping(vec![PortSpec { name: "p".into(), port_number: 0 }]);
        assert!(matches!(err, Err(ControlError::HubInUse(_))));

        hub.detach_nio(0).await.unwrap();
        hub.set_ports_mapping(vec![PortSpec { name: "p".into(), port_number: 0 }]).unwrap();
        assert_eq!(hub.ports().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_detaches_all_ports() {
        let hub = hub();
        let a = nio(&hub);
        let b = nio(&hub);
        hub.add_nio(a.clone(), 0).await.unwrap();
        hub.add_nio(b.clone(), 5).await.unwrap();

        let failed = hub.close().await.unwrap();
        assert!(failed.is_empty());
        assert!(a.is_released() && b.is_released());
    }
}
