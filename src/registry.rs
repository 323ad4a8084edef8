//! Registry of known cores.
//!
//! The registry owns one [`ModuleSession`] per device id and keeps every
//! known id in exactly one of two sets: connected or disconnected. Sessions
//! are kept after they disconnect so a later connection resumes the same
//! session (same display name, same last readings) instead of registering
//! a new one.
//!
//! Every session event is re-emitted on the registry's own hub, so a single
//! listener sees activity from all devices.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::{Error, Result};
use crate::event::{DisconnectReason, Event, EventHub, Topic};
use crate::session::{ModuleSession, SessionConfig};
use crate::top::Top;
use crate::transport::{ConnectCriteria, Transport};
use crate::types::DeviceId;

/// Prefix of generated display names.
pub const DISPLAY_NAME_PREFIX: &str = "tinka";

/// The connected/disconnected partition of known device ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIds {
    connected: BTreeSet<DeviceId>,
    disconnected: BTreeSet<DeviceId>,
}

impl DeviceIds {
    fn mark_connected(&mut self, id: &DeviceId) {
        self.disconnected.remove(id);
        self.connected.insert(id.clone());
    }

    fn mark_disconnected(&mut self, id: &DeviceId) {
        self.connected.remove(id);
        self.disconnected.insert(id.clone());
    }

    fn forget(&mut self, id: &DeviceId) {
        self.connected.remove(id);
        self.disconnected.remove(id);
    }

    /// Returns the connected ids, sorted.
    #[must_use]
    pub const fn connected(&self) -> &BTreeSet<DeviceId> {
        &self.connected
    }

    /// Returns the disconnected ids, sorted.
    #[must_use]
    pub const fn disconnected(&self) -> &BTreeSet<DeviceId> {
        &self.disconnected
    }

    /// Returns true if the id is in either set.
    #[must_use]
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.connected.contains(id) || self.disconnected.contains(id)
    }
}

struct RegistryState<T: Transport> {
    sessions: HashMap<DeviceId, ModuleSession<T>>,
    ids: DeviceIds,
    number_added: usize,
}

struct RegistryInner<T: Transport> {
    transport: Arc<T>,
    config: SessionConfig,
    state: Mutex<RegistryState<T>>,
    events: EventHub<Event>,
}

/// Registry of device sessions sharing one transport.
///
/// Cloning is cheap and yields a handle to the same registry.
pub struct DeviceRegistry<T: Transport> {
    inner: Arc<RegistryInner<T>>,
}

impl<T: Transport> Clone for DeviceRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> DeviceRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(transport: Arc<T>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                config,
                state: Mutex::new(RegistryState {
                    sessions: HashMap::new(),
                    ids: DeviceIds::default(),
                    number_added: 0,
                }),
                events: EventHub::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions(&self) -> Vec<ModuleSession<T>> {
        let mut sessions: Vec<_> = self.lock().sessions.values().cloned().collect();
        sessions.sort_by_key(ModuleSession::number);
        sessions
    }

    /// Returns the registry's event hub.
    ///
    /// Carries every event of every registered session.
    #[must_use]
    pub fn events(&self) -> &EventHub<Event> {
        &self.inner.events
    }

    /// Returns the shared transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    // ==================== Membership ====================

    /// Connects to a device matching `criteria` and registers it.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport finds no device or the session
    /// fails to connect.
    pub async fn discover(&self, criteria: &ConnectCriteria) -> Result<ModuleSession<T>> {
        let found = self.inner.transport.connect(criteria).await?;
        self.add_or_resume(found.device_id, found.link).await
    }

    /// Registers a new device, or resumes the session of a known one.
    ///
    /// New devices get the next `tinkaN` display name. On success the id is
    /// in the connected set and nowhere else. A new device that fails to
    /// connect stays registered as disconnected.
    ///
    /// # Errors
    ///
    /// Returns the session's connect error.
    pub async fn add_or_resume(&self, id: DeviceId, link: T::Link) -> Result<ModuleSession<T>> {
        let (session, fresh) = {
            let mut state = self.lock();
            if let Some(session) = state.sessions.get(&id) {
                (session.clone(), false)
            } else {
                let number = state.number_added;
                state.number_added += 1;
                let session = ModuleSession::new(
                    id.clone(),
                    number,
                    format!("{DISPLAY_NAME_PREFIX}{number}"),
                    Arc::clone(&self.inner.transport),
                    self.inner.config.clone(),
                );
                state.sessions.insert(id.clone(), session.clone());
                state.ids.mark_disconnected(&id);
                (session, true)
            }
        };

        if fresh {
            tracing::info!("{} registered as {}", id, session.display_name());
            self.watch(&session);
            session.connect(link).await?;
        } else {
            session.reconnect(link).await?;
        }
        Ok(session)
    }

    /// Forwards a session's events and keeps the id sets in step with them.
    fn watch(&self, session: &ModuleSession<T>) {
        let weak: Weak<RegistryInner<T>> = Arc::downgrade(&self.inner);
        session.events().on(
            Topic::All,
            Arc::new(move |event: &Event| {
                if let Some(inner) = weak.upgrade() {
                    DeviceRegistry { inner }.on_session_event(event);
                }
            }),
        );
    }

    fn on_session_event(&self, event: &Event) {
        let device = event.device();
        {
            let mut state = self.lock();
            if !state.sessions.contains_key(device) {
                return;
            }
            match event {
                Event::Connected { .. } => state.ids.mark_connected(device),
                Event::Disconnected { .. } => state.ids.mark_disconnected(device),
                _ => {}
            }
        }

        if let Event::Disconnected {
            reason: DisconnectReason::TransportLost,
            ..
        } = event
        {
            if self.inner.config.auto_reconnect {
                self.schedule_reconnect(device);
            }
        }

        self.inner.events.emit(event.clone());
    }

    fn schedule_reconnect(&self, id: &DeviceId) {
        let Some(session) = self.by_id(id) else {
            return;
        };
        if session.is_reconnecting() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("{} lost with no runtime to reconnect on", id);
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let id = id.clone();
        let interval = self.inner.config.reconnect_interval;
        // Any disconnect, remove or purge bumps this, which stops the loop.
        let generation = session.generation();
        tracing::info!("{} scheduling reconnect every {:?}", id, interval);

        let task = runtime.spawn(async move {
            let criteria = ConnectCriteria::for_device(id.clone());
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { return };
                let registry = DeviceRegistry { inner };
                let Some(session) = registry.by_id(&id) else {
                    return;
                };
                if session.is_connected() {
                    drop(session.take_reconnect_task());
                    return;
                }

                let found = match registry.inner.transport.connect(&criteria).await {
                    Ok(found) => found,
                    Err(e) => {
                        tracing::debug!("{} reconnect attempt failed: {}", id, e);
                        continue;
                    }
                };

                // Binding cancels the session's reconnect task, which is this one.
                if session.take_reconnect_task().is_none() {
                    return;
                }
                match session.resume(found.link, generation).await {
                    Ok(()) => {}
                    Err(Error::Superseded) => {
                        tracing::debug!("{} reconnect abandoned", id);
                    }
                    Err(e) => {
                        tracing::warn!("{} reconnect failed: {}", id, e);
                        registry.schedule_reconnect(&id);
                    }
                }
                return;
            }
        });
        session.set_reconnect_task(task);
    }

    /// Disconnects a device but keeps its session for later resumption.
    ///
    /// Cancels any pending writes and reconnect loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDevice`] if the id was never registered.
    pub fn remove(&self, id: &DeviceId) -> Result<()> {
        let session = self
            .by_id(id)
            .ok_or_else(|| Error::UnknownDevice(id.clone()))?;
        session.disconnect();
        self.lock().ids.mark_disconnected(id);
        Ok(())
    }

    /// Disconnects a device and forgets it entirely.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDevice`] if the id was never registered.
    pub fn purge(&self, id: &DeviceId) -> Result<ModuleSession<T>> {
        let session = self
            .by_id(id)
            .ok_or_else(|| Error::UnknownDevice(id.clone()))?;
        session.disconnect();
        let mut state = self.lock();
        state.sessions.remove(id);
        state.ids.forget(id);
        tracing::info!("{} purged", id);
        Ok(session)
    }

    // ==================== Queries ====================

    /// Returns the session for a device id.
    #[must_use]
    pub fn by_id(&self, id: &DeviceId) -> Option<ModuleSession<T>> {
        self.lock().sessions.get(id).cloned()
    }

    /// Returns the session with this display name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<ModuleSession<T>> {
        self.sessions()
            .into_iter()
            .find(|s| s.display_name() == name)
    }

    /// Returns every session whose attached top has this name, in the
    /// order they were added.
    #[must_use]
    pub fn by_attached_top(&self, top_name: &str) -> Vec<ModuleSession<T>> {
        self.sessions()
            .into_iter()
            .filter(|s| s.attached_top().map(Top::name) == Some(top_name))
            .collect()
    }

    /// Returns sessions in the order they were added.
    #[must_use]
    pub fn list(&self, include_disconnected: bool) -> Vec<ModuleSession<T>> {
        if include_disconnected {
            return self.sessions();
        }
        let connected = self.lock().ids.connected.clone();
        self.sessions()
            .into_iter()
            .filter(|s| connected.contains(s.device_id()))
            .collect()
    }

    /// Returns a snapshot of the id partition.
    #[must_use]
    pub fn ids(&self) -> DeviceIds {
        self.lock().ids.clone()
    }

    /// Returns the connected ids, sorted.
    #[must_use]
    pub fn connected_ids(&self) -> Vec<DeviceId> {
        self.lock().ids.connected.iter().cloned().collect()
    }

    /// Returns the disconnected ids, sorted.
    #[must_use]
    pub fn disconnected_ids(&self) -> Vec<DeviceId> {
        self.lock().ids.disconnected.iter().cloned().collect()
    }

    /// Returns the number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Returns true if no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
