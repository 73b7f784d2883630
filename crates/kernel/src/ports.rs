//! Collision-free port allocation for kernels started side by side, mostly in tests.

use std::{
    collections::HashSet,
    net::{Ipv4Addr, TcpListener, UdpSocket},
    ops::RangeInclusive,
    sync::{Mutex, OnceLock, PoisonError},
};

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::config::ChannelPorts;

pub const PORT_RANGE: RangeInclusive<u16> = 32768..=65535;
pub const MAX_TRIALS: usize = 32768;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PortError {
    #[error("no free port found after {0} attempts")]
    Exhausted(usize),
}

/// Remembers every port it handed out; ports are never released.
#[derive(Debug, Default)]
pub struct PortRegistry {
    issued: Mutex<HashSet<u16>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by everything in this process.
    pub fn process() -> &'static PortRegistry {
        static REGISTRY: OnceLock<PortRegistry> = OnceLock::new();
        REGISTRY.get_or_init(PortRegistry::new)
    }

    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut rng = rand::thread_rng();

        for _ in 0..MAX_TRIALS {
            let port = rng.gen_range(PORT_RANGE);
            let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);

            if issued.contains(&port) || !is_free(port) {
                continue;
            }

            issued.insert(port);
            debug!(port, "allocated port");
            return Ok(port);
        }

        Err(PortError::Exhausted(MAX_TRIALS))
    }

    pub fn allocate_channel_ports(&self) -> Result<ChannelPorts, PortError> {
        Ok(ChannelPorts {
            shell: self.allocate()?,
            control: self.allocate()?,
            stdin: self.allocate()?,
            iopub: self.allocate()?,
            heartbeat: self.allocate()?,
        })
    }

    pub fn issued(&self) -> usize {
        self.issued.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Both a tcp listener and a udp socket must be able to bind the port.
fn is_free(port: u16) -> bool {
    let tcp = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port));
    let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port));

    tcp.is_ok() && udp.is_ok()
}
