//! Network endpoints (NIOs) bound to hub ports.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::capture::CaptureSession;
use crate::error::ControlResult;
use crate::port_manager::PortManager;
use crate::utils::poisoned;

/// Transport configuration of a NIO, tagged the way clients send it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NioConfig {
    /// `lport` 0 (or absent) asks the port manager for a free port.
    #[serde(rename = "nio_udp")]
    Udp {
        #[serde(default)]
        lport: u16,
        rhost: String,
        rport: u16,
    },
    #[serde(rename = "nio_tap")]
    Tap { tap_device: String },
    #[serde(rename = "nio_generic_ethernet")]
    GenericEthernet { ethernet_device: String },
    #[serde(rename = "nio_null")]
    Null,
}

impl NioConfig {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Udp { .. } => "udp",
            Self::Tap { .. } => "tap",
            Self::GenericEthernet { .. } => "generic_ethernet",
            Self::Null => "null",
        }
    }
}

/// A frame-transport handle. Created detached, attached to exactly one hub
/// port, then released once it has been removed from that port.
#[derive(Debug)]
pub struct Nio {
    name: String,
    config: NioConfig,
    project_id: Uuid,
    port_manager: Option<Arc<PortManager>>,
    capture: Mutex<Option<Arc<CaptureSession>>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    /// Cancelled on release; ends the frame receiver.
    stop: CancellationToken,
    released: AtomicBool,
}

impl Nio {
    pub(crate) fn new(
        config: NioConfig,
        project_id: Uuid,
        port_manager: Option<Arc<PortManager>>,
    ) -> Self {
        Self {
            name: format!("{}-{}", config.prefix(), Uuid::new_v4()),
            config,
            project_id,
            port_manager,
            capture: Mutex::new(None),
            socket: Mutex::new(None),
            stop: CancellationToken::new(),
            released: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NioConfig {
        &self.config
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    fn capture_slot(&self) -> ControlResult<MutexGuard<'_, Option<Arc<CaptureSession>>>> {
        self.capture.lock().map_err(|_| poisoned("NIO capture"))
    }

    /// The capture session currently bound to this NIO, if any.
    pub fn capture(&self) -> Option<Arc<CaptureSession>> {
        self.capture_slot().ok().and_then(|c| c.clone())
    }

    pub fn is_capturing(&self) -> bool {
        self.capture().map(|c| c.is_running()).unwrap_or(false)
    }

    pub(crate) fn set_capture(&self, session: Arc<CaptureSession>) -> ControlResult<()> {
        *self.capture_slot()? = Some(session);
        Ok(())
    }

    pub(crate) fn take_capture(&self) -> ControlResult<Option<Arc<CaptureSession>>> {
        Ok(self.capture_slot()?.take())
    }

    /// Stop and drop the capture session, if one is bound.
    pub(crate) async fn stop_capture(&self) -> ControlResult<bool> {
        match self.take_capture()? {
            Some(session) => {
                if let Err(e) = session.stop().await {
                    tracing::warn!("NIO {}: failed to flush capture {}: {}", self.name, session.path().display(), e);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().ok().and_then(|s| s.clone())
    }

    /// Bind the local end of a UDP NIO. Other kinds have nothing to bind.
    pub(crate) async fn bind_udp(&self) -> io::Result<Option<Arc<UdpSocket>>> {
        let (NioConfig::Udp { lport, .. }, Some(pm)) = (&self.config, &self.port_manager) else {
            return Ok(None);
        };
        let socket = Arc::new(UdpSocket::bind((pm.host(), *lport)).await?);
        tracing::debug!("NIO {} listening on {}:{}", self.name, pm.host(), lport);
        match self.socket.lock() {
            Ok(mut slot) => *slot = Some(socket.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(socket.clone()),
        }
        Ok(Some(socket))
    }

    /// A frame arrived on this NIO from the wire.
    pub async fn ingress(&self, frame: &[u8]) -> io::Result<()> {
        match self.capture() {
            Some(session) => session.record(frame).await,
            None => Ok(()),
        }
    }

    /// Send a frame out through this NIO. Kinds without a bound socket only
    /// record it.
    pub async fn transmit(&self, frame: &[u8]) -> io::Result<()> {
        if let Some(session) = self.capture() {
            session.record(frame).await?;
        }
        if let (Some(socket), NioConfig::Udp { rhost, rport, .. }) = (self.socket(), &self.config) {
            socket.send_to(frame, (rhost.as_str(), *rport)).await?;
        }
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Give back everything this NIO holds. Returns `false` when it was
    /// already released, so a retry never frees twice.
    pub fn release(&self) -> ControlResult<bool> {
        if self.is_released() {
            return Ok(false);
        }
        self.stop.cancel();
        if let Ok(mut socket) = self.socket.lock() {
            socket.take();
        }
        if let NioConfig::Udp { lport, .. } = &self.config {
            if let Some(pm) = &self.port_manager {
                pm.release_udp_port(*lport, &self.project_id.to_string())?;
            }
        }
        self.released.store(true, Ordering::Release);
        tracing::debug!("NIO {} released", self.name);
        Ok(true)
    }
}
