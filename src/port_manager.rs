//! UDP port bookkeeping shared by every backend module.
//!
//! A fixed range; the first free port wins.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{ControlError, ControlResult};
use crate::utils::poisoned;

pub const DEFAULT_UDP_START_PORT: u16 = 10000;
pub const DEFAULT_UDP_END_PORT: u16 = 20000;

#[derive(Debug)]
pub struct PortManager {
    host: String,
    udp_start: u16,
    udp_end: u16,
    /// port -> owning project
    reserved: Mutex<BTreeMap<u16, String>>,
}

impl PortManager {
    pub fn new(host: &str) -> Self {
        Self::with_udp_range(host, DEFAULT_UDP_START_PORT, DEFAULT_UDP_END_PORT)
    }

    pub fn with_udp_range(host: &str, udp_start: u16, udp_end: u16) -> Self {
        let (udp_start, udp_end) = if udp_start <= udp_end {
            (udp_start, udp_end)
        } else {
            (udp_end, udp_start)
        };
        Self {
            host: host.to_string(),
            udp_start,
            udp_end,
            reserved: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn udp_range(&self) -> (u16, u16) {
        (self.udp_start, self.udp_end)
    }

    fn lock(&self) -> ControlResult<MutexGuard<'_, BTreeMap<u16, String>>> {
        self.reserved.lock().map_err(|_| poisoned("PortManager"))
    }

    /// Reserve a specific UDP port for a project.
    pub fn reserve_udp_port(&self, port: u16, project_id: &str) -> ControlResult<()> {
        if port < self.udp_start || port > self.udp_end {
            return Err(ControlError::UdpPortOutOfRange {
                port,
                start: self.udp_start,
                end: self.udp_end,
            });
        }
        let mut reserved = self.lock()?;
        if reserved.contains_key(&port) {
            return Err(ControlError::UdpPortInUse {
                port,
                project: project_id.to_string(),
            });
        }
        reserved.insert(port, project_id.to_string());
        tracing::debug!("UDP port {} reserved for project {}", port, project_id);
        Ok(())
    }

    /// Pick and reserve the lowest free UDP port in range.
    pub fn get_free_udp_port(&self, project_id: &str) -> ControlResult<u16> {
        let mut reserved = self.lock()?;
        let port = (self.udp_start..=self.udp_end)
            .find(|p| !reserved.contains_key(p))
            .ok_or(ControlError::NoFreeUdpPort {
                start: self.udp_start,
                end: self.udp_end,
            })?;
        reserved.insert(port, project_id.to_string());
        Ok(port)
    }

    /// Returns `true` if the port was reserved by this project. Releasing a
    /// port twice is harmless; releasing a port another project holds is
    /// refused and leaves the reservation in place.
    pub fn release_udp_port(&self, port: u16, project_id: &str) -> ControlResult<bool> {
        let mut reserved = self.lock()?;
        match reserved.get(&port) {
            Some(owner) if owner == project_id => {
                reserved.remove(&port);
                tracing::debug!("UDP port {} released for project {}", port, project_id);
                Ok(true)
            }
            Some(owner) => Err(ControlError::UdpPortNotOwned {
                port,
                project: project_id.to_string(),
                owner: owner.clone(),
            }),
            None => Ok(false),
        }
    }

    pub fn reserved_udp_ports(&self) -> ControlResult<Vec<u16>> {
        Ok(self.lock()?.keys().copied().collect())
    }
}
