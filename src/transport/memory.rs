//! In-process transport with scripted devices.
//!
//! Each [`MemoryDevice`] stands in for one core. Tests push notification
//! bytes into it, inspect what the host wrote, and cut the link to simulate
//! the core going out of range.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::transport::{ConnectCriteria, Discovered, TINKAMO_SERVICE, Transport};
use crate::types::DeviceId;

/// Buffered notifications per link.
const NOTIFY_CAPACITY: usize = 64;

/// Link to a [`MemoryDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLink {
    device: DeviceId,
    generation: u64,
}

impl MemoryLink {
    /// Returns the id of the linked device.
    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        &self.device
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    advertising: bool,
    active: Option<u64>,
    next_generation: u64,
    sender: Option<mpsc::Sender<Bytes>>,
    lost: Option<watch::Sender<bool>>,
    written: Vec<Bytes>,
    fail_writes: bool,
}

#[derive(Debug)]
struct DeviceShared {
    id: DeviceId,
    name: String,
    service: u16,
    state: Mutex<DeviceState>,
}

impl DeviceShared {
    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a scripted device.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    shared: Arc<DeviceShared>,
}

impl MemoryDevice {
    /// Returns the device id.
    #[must_use]
    pub fn id(&self) -> &DeviceId {
        &self.shared.id
    }

    /// Returns the advertised name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Sends a notification to the host.
    ///
    /// Returns false if nothing is subscribed or the buffer is full.
    pub fn notify(&self, data: impl Into<Bytes>) -> bool {
        let sender = self.shared.state().sender.clone();
        match sender {
            Some(tx) => tx.try_send(data.into()).is_ok(),
            None => false,
        }
    }

    /// Cuts the current link, as if the core went out of range.
    ///
    /// The device keeps advertising and can be connected again.
    pub fn drop_link(&self) {
        let mut state = self.shared.state();
        state.active = None;
        state.sender = None;
        if let Some(lost) = state.lost.take() {
            let _ = lost.send(true);
        }
    }

    /// Makes the device visible or invisible to `connect`.
    pub fn set_advertising(&self, advertising: bool) {
        self.shared.state().advertising = advertising;
    }

    /// Makes writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.state().fail_writes = fail;
    }

    /// Returns true while a host holds a link.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.shared.state().active.is_some()
    }

    /// Returns every packet the host wrote so far.
    #[must_use]
    pub fn written(&self) -> Vec<Bytes> {
        self.shared.state().written.clone()
    }

    /// Returns and clears the packets written so far.
    pub fn take_written(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.shared.state().written)
    }
}

/// Transport over in-process [`MemoryDevice`]s.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    devices: Mutex<Vec<Arc<DeviceShared>>>,
}

impl MemoryTransport {
    /// Creates a transport with no devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an advertising device exposing the Tinkamo service.
    pub fn add_device(&self, id: impl Into<DeviceId>, name: impl Into<String>) -> MemoryDevice {
        self.add_device_with_service(id, name, TINKAMO_SERVICE)
    }

    /// Adds an advertising device exposing `service`.
    pub fn add_device_with_service(
        &self,
        id: impl Into<DeviceId>,
        name: impl Into<String>,
        service: u16,
    ) -> MemoryDevice {
        let shared = Arc::new(DeviceShared {
            id: id.into(),
            name: name.into(),
            service,
            state: Mutex::new(DeviceState {
                advertising: true,
                ..DeviceState::default()
            }),
        });
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&shared));
        MemoryDevice { shared }
    }

    fn find(&self, id: &DeviceId) -> Option<Arc<DeviceShared>> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| &d.id == id)
            .cloned()
    }

    fn live(&self, link: &MemoryLink) -> Result<Arc<DeviceShared>> {
        let device = self.find(&link.device).ok_or(Error::TransportLost)?;
        if device.state().active == Some(link.generation) {
            Ok(device)
        } else {
            Err(Error::TransportLost)
        }
    }
}

impl Transport for MemoryTransport {
    type Link = MemoryLink;

    fn connect<'a>(
        &'a self,
        criteria: &'a ConnectCriteria,
    ) -> BoxFuture<'a, Result<Discovered<MemoryLink>>> {
        Box::pin(async move {
            let devices = self
                .devices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();

            for device in devices {
                if device.service != criteria.service || !criteria.matches(&device.id, &device.name)
                {
                    continue;
                }
                let mut state = device.state();
                if !state.advertising || state.active.is_some() {
                    continue;
                }
                let generation = state.next_generation;
                state.next_generation += 1;
                state.active = Some(generation);
                state.lost = Some(watch::channel(false).0);
                tracing::debug!("memory transport linked {} ({})", device.id, device.name);
                return Ok(Discovered {
                    device_id: device.id.clone(),
                    link: MemoryLink {
                        device: device.id.clone(),
                        generation,
                    },
                });
            }

            Err(Error::transport("no matching device in range"))
        })
    }

    fn subscribe<'a>(
        &'a self,
        link: &'a MemoryLink,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<Bytes>>> {
        Box::pin(async move {
            let device = self.live(link)?;
            let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
            device.state().sender = Some(tx);
            Ok(rx)
        })
    }

    fn write<'a>(&'a self, link: &'a MemoryLink, data: Bytes) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let device = self.live(link)?;
            let mut state = device.state();
            if state.fail_writes {
                return Err(Error::transport("write rejected"));
            }
            state.written.push(data);
            Ok(())
        })
    }

    fn on_disconnect(&self, link: &MemoryLink) -> BoxFuture<'static, ()> {
        let lost = self
            .live(link)
            .ok()
            .and_then(|device| device.state().lost.as_ref().map(watch::Sender::subscribe));
        Box::pin(async move {
            if let Some(mut lost) = lost {
                // A dropped sender also means the link is gone.
                let _ = lost.wait_for(|gone| *gone).await;
            }
        })
    }
}
