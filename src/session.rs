//! Per-device session: connection lifecycle, packet handling and writes.
//!
//! A [`ModuleSession`] owns one core. It turns raw notifications into
//! [`Event`]s, tracks which top is attached, and sends commands, retrying
//! verified writes until the module echoes them.
//!
//! Every connection attempt bumps a generation counter. Work started for an
//! older generation (a slow connect, a reader for a dropped link) checks the
//! counter before touching state and backs off if it has moved on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{Error, ProtocolError, Result};
use crate::event::{DisconnectReason, Event, EventHub};
use crate::protocol::{
    Command, CoreCommand, DEFAULT_PROTOCOL_VERSION, DecodedPacket, ModuleType, decode,
};
use crate::top::{Sensed, Top};
use crate::transport::Transport;
use crate::types::{BatteryLevel, ConnectionState, DeviceId, Reading};

/// Interval between verified-write retries.
pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_millis(100);

/// Interval between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// Suggested interval for battery polling.
pub const BATTERY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Suggested interval for attached-top polling.
pub const PORT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Connection marker payload meaning "nothing attached".
pub const DETACHED_MARKER: u8 = 0xFF;

/// Configuration for sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between verified-write retries.
    pub write_interval: Duration,
    /// Interval between reconnect attempts after the link drops.
    pub reconnect_interval: Duration,
    /// Give up on a verified write after this many retries. `None` retries
    /// until acknowledged or cancelled.
    pub max_write_retries: Option<u32>,
    /// Reconnect automatically when the transport drops the link.
    pub auto_reconnect: bool,
    /// Ask the core for its protocol version after connecting.
    pub query_on_connect: bool,
    /// Protocol version assumed until the core reports one.
    pub protocol_version: u8,
    /// Ask for the battery status this often while connected.
    pub battery_poll_interval: Option<Duration>,
    /// Ask which top is attached this often while connected. Catches
    /// attach markers the link dropped.
    pub port_poll_interval: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_interval: DEFAULT_WRITE_INTERVAL,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_write_retries: None,
            auto_reconnect: true,
            query_on_connect: true,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            battery_poll_interval: None,
            port_poll_interval: None,
        }
    }
}

impl SessionConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the verified-write retry interval.
    #[must_use]
    pub const fn write_interval(mut self, interval: Duration) -> Self {
        self.write_interval = interval;
        self
    }

    /// Sets the reconnect interval.
    #[must_use]
    pub const fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Bounds verified-write retries.
    #[must_use]
    pub const fn max_write_retries(mut self, retries: Option<u32>) -> Self {
        self.max_write_retries = retries;
        self
    }

    /// Enables or disables automatic reconnection.
    #[must_use]
    pub const fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Enables or disables the protocol version query on connect.
    #[must_use]
    pub const fn query_on_connect(mut self, enabled: bool) -> Self {
        self.query_on_connect = enabled;
        self
    }

    /// Sets the initial protocol version.
    #[must_use]
    pub const fn protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }

    /// Enables or disables battery polling.
    #[must_use]
    pub const fn battery_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.battery_poll_interval = interval;
        self
    }

    /// Enables or disables attached-top polling.
    #[must_use]
    pub const fn port_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.port_poll_interval = interval;
        self
    }
}

struct PendingWrite {
    seq: u64,
    module_type: ModuleType,
    task: JoinHandle<()>,
}

struct SessionState<L> {
    display_name: String,
    connection: ConnectionState,
    generation: u64,
    link: Option<L>,
    attached: Option<Top>,
    port: u8,
    protocol_version: u8,
    battery: Option<BatteryLevel>,
    last_readings: HashMap<&'static str, Reading>,
    pending_writes: HashMap<u8, PendingWrite>,
    write_seq: u64,
    reader: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    pollers: Vec<JoinHandle<()>>,
}

impl<L> SessionState<L> {
    fn abort_writes(&mut self) {
        for (_, pending) in self.pending_writes.drain() {
            pending.task.abort();
        }
    }

    fn abort_pollers(&mut self) {
        for poller in self.pollers.drain(..) {
            poller.abort();
        }
    }

    fn cancel_tasks(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(reconnect) = self.reconnect.take() {
            reconnect.abort();
        }
        self.abort_pollers();
        self.abort_writes();
    }
}

struct SessionInner<T: Transport> {
    device_id: DeviceId,
    number: usize,
    transport: Arc<T>,
    config: SessionConfig,
    state: Mutex<SessionState<T::Link>>,
    events: EventHub<Event>,
}

impl<T: Transport> Drop for SessionInner<T> {
    fn drop(&mut self) {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel_tasks();
    }
}

/// Session for one physical core.
///
/// Cloning is cheap and yields a handle to the same session.
pub struct ModuleSession<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for ModuleSession<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> std::fmt::Debug for ModuleSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSession")
            .field("device_id", &self.inner.device_id)
            .field("number", &self.inner.number)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ModuleSession<T> {
    /// Creates a disconnected session.
    #[must_use]
    pub fn new(
        device_id: DeviceId,
        number: usize,
        display_name: impl Into<String>,
        transport: Arc<T>,
        config: SessionConfig,
    ) -> Self {
        let state = SessionState {
            display_name: display_name.into(),
            connection: ConnectionState::Disconnected,
            generation: 0,
            link: None,
            attached: None,
            port: 0,
            protocol_version: config.protocol_version,
            battery: None,
            last_readings: HashMap::new(),
            pending_writes: HashMap::new(),
            write_seq: 0,
            reader: None,
            reconnect: None,
            pollers: Vec::new(),
        };
        Self {
            inner: Arc::new(SessionInner {
                device_id,
                number,
                transport,
                config,
                state: Mutex::new(state),
                events: EventHub::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState<T::Link>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_all(&self, events: Vec<Event>) {
        for event in events {
            self.inner.events.emit(event);
        }
    }

    // ==================== Accessors ====================

    /// Returns the device id.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    /// Returns the order in which the registry added this session.
    #[must_use]
    pub fn number(&self) -> usize {
        self.inner.number
    }

    /// Returns the display name.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.lock().display_name.clone()
    }

    /// Renames the session.
    pub fn set_display_name(&self, name: impl Into<String>) {
        self.lock().display_name = name.into();
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Returns the connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    /// Returns true while notifications are flowing.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Returns the attached top, if any.
    #[must_use]
    pub fn attached_top(&self) -> Option<Top> {
        self.lock().attached
    }

    /// Returns the port of the attached top.
    #[must_use]
    pub fn port(&self) -> u8 {
        self.lock().port
    }

    /// Returns the protocol version in use.
    #[must_use]
    pub fn protocol_version(&self) -> u8 {
        self.lock().protocol_version
    }

    /// Returns the last reported battery status.
    #[must_use]
    pub fn battery(&self) -> Option<BatteryLevel> {
        self.lock().battery
    }

    /// Returns the last reading of a top, by name.
    #[must_use]
    pub fn last_reading(&self, top_name: &str) -> Option<Reading> {
        self.lock().last_readings.get(top_name).copied()
    }

    /// Returns the last reading of every top seen so far.
    #[must_use]
    pub fn last_readings(&self) -> HashMap<&'static str, Reading> {
        self.lock().last_readings.clone()
    }

    /// Returns the number of verified writes still awaiting an echo.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.lock().pending_writes.len()
    }

    /// Returns the current connection generation.
    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Returns true while a reconnect loop is scheduled for this session.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.lock().reconnect.is_some()
    }

    /// Returns the session's event hub.
    #[must_use]
    pub fn events(&self) -> &EventHub<Event> {
        &self.inner.events
    }

    // ==================== Notifications ====================

    /// Handles one raw notification from the transport.
    ///
    /// Truncated packets are dropped without any state change. Events are
    /// emitted after the session state is updated and unlocked.
    pub fn on_notification(&self, raw: &[u8]) {
        let device = &self.inner.device_id;
        tracing::trace!("{} <- {}", device, hex::encode(raw));

        let packet = match decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("{} dropped packet: {}", device, e);
                return;
            }
        };
        if !packet.header_valid {
            tracing::debug!("{} packet without sync bytes: {:02x?}", device, &raw[..2]);
        }

        let events = {
            let mut state = self.lock();
            let mut events = Vec::new();

            if let Some(pending) = state.pending_writes.remove(&packet.command_id) {
                pending.task.abort();
                tracing::debug!(
                    "{} write 0x{:02x} acknowledged",
                    device,
                    packet.command_id
                );
                events.push(Event::WriteAcknowledged {
                    device: device.clone(),
                    command_id: packet.command_id,
                });
            }

            if packet.module_type == ModuleType::Core.id() {
                self.handle_core_packet(&mut state, &packet, &mut events);
            } else {
                self.handle_top_packet(&mut state, &packet, &mut events);
            }
            events
        };

        self.emit_all(events);
    }

    fn handle_core_packet(
        &self,
        state: &mut SessionState<T::Link>,
        packet: &DecodedPacket,
        events: &mut Vec<Event>,
    ) {
        let device = &self.inner.device_id;
        let Some(&value) = packet.payload.first() else {
            tracing::debug!("{} empty core packet", device);
            return;
        };

        match CoreCommand::from_byte(packet.command_id) {
            Some(CoreCommand::PowerStatus) => {
                let level = BatteryLevel::from_byte(value);
                state.battery = Some(level);
                events.push(Event::Battery {
                    device: device.clone(),
                    level,
                });
            }
            Some(CoreCommand::ProtocolVersion) => {
                tracing::info!("{} protocol version {}", device, value);
                state.protocol_version = value;
                events.push(Event::ProtocolVersion {
                    device: device.clone(),
                    version: value,
                });
            }
            Some(CoreCommand::SetLedColor) => {
                tracing::debug!("{} led color set to {}", device, value);
            }
            _ if value == DETACHED_MARKER => {
                let previous = state.attached.take();
                tracing::info!(
                    "{} detached {}",
                    device,
                    previous.map_or("nothing", Top::name)
                );
                state.pending_writes.retain(|_, pending| {
                    let keep = pending.module_type == ModuleType::Core;
                    if !keep {
                        pending.task.abort();
                    }
                    keep
                });
                events.push(Event::TopChanged {
                    device: device.clone(),
                    top: previous,
                    attached: false,
                });
            }
            _ => {
                let top = Top::from_id(value);
                if let Top::Unsupported(id) = top {
                    tracing::debug!(
                        "{} attached top: {}",
                        device,
                        ProtocolError::UnknownModuleType(id)
                    );
                }
                tracing::info!("{} attached {}", device, top.name());
                state.attached = Some(top);
                events.push(Event::TopChanged {
                    device: device.clone(),
                    top: Some(top),
                    attached: true,
                });
            }
        }
    }

    fn handle_top_packet(
        &self,
        state: &mut SessionState<T::Link>,
        packet: &DecodedPacket,
        events: &mut Vec<Event>,
    ) {
        let device = &self.inner.device_id;
        let Some(module) = packet.module() else {
            tracing::debug!(
                "{} ignored packet: {}",
                device,
                ProtocolError::UnknownModuleType(packet.module_type)
            );
            return;
        };

        let top = Top::Known(module);
        if state.attached != Some(top) {
            tracing::debug!("{} implicit attach of {}", device, top.name());
            state.attached = Some(top);
            events.push(Event::TopChanged {
                device: device.clone(),
                top: Some(top),
                attached: true,
            });
        }
        state.port = packet.port;

        match top.sense(packet.command_id, &packet.payload) {
            Sensed::Reading(value) => {
                state.last_readings.insert(top.name(), value);
                events.push(Event::Reading {
                    device: device.clone(),
                    top,
                    value,
                });
            }
            Sensed::Suppressed(reason) => {
                tracing::debug!("{} {} reading suppressed: {:?}", device, top.name(), reason);
            }
        }
    }

    // ==================== Lifecycle ====================

    /// Binds a fresh link and starts reading notifications.
    ///
    /// Any earlier link, reader, pending write or reconnect loop is
    /// dropped first. If another `connect` or a `disconnect` happens while
    /// this one is still subscribing, this one returns
    /// [`Error::Superseded`] and leaves the newer state alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot subscribe to the link. A
    /// session that was live before the failed attempt emits
    /// [`Event::Disconnected`] with [`DisconnectReason::TransportLost`].
    pub async fn connect(&self, link: T::Link) -> Result<()> {
        self.bind(link, None).await
    }

    /// Reconnects only if the session is still at `generation`, so a
    /// `disconnect` issued after a reconnect loop fired wins over it.
    pub(crate) async fn resume(&self, link: T::Link, generation: u64) -> Result<()> {
        tracing::info!("{} reconnecting", self.inner.device_id);
        self.bind(link, Some(generation)).await
    }

    async fn bind(&self, link: T::Link, expected: Option<u64>) -> Result<()> {
        let device = &self.inner.device_id;
        let (generation, was_live) = {
            let mut state = self.lock();
            if expected.is_some_and(|g| g != state.generation) {
                tracing::debug!("{} skipping reconnect, session moved on", device);
                return Err(Error::Superseded);
            }
            state.cancel_tasks();
            state.generation += 1;
            let was_live = state.connection != ConnectionState::Disconnected;
            state.connection = ConnectionState::Connecting;
            state.link = Some(link.clone());
            state.attached = None;
            (state.generation, was_live)
        };
        tracing::info!("{} connecting", device);

        let subscribed = self.inner.transport.subscribe(&link).await;
        let rx = match subscribed {
            Ok(rx) => rx,
            Err(e) => {
                let dropped = {
                    let mut state = self.lock();
                    let current = state.generation == generation;
                    if current {
                        state.connection = ConnectionState::Disconnected;
                        state.link = None;
                    }
                    current && was_live
                };
                tracing::warn!("{} subscribe failed: {}", device, e);
                if dropped {
                    self.inner.events.emit(Event::Disconnected {
                        device: device.clone(),
                        reason: DisconnectReason::TransportLost,
                    });
                }
                return Err(e);
            }
        };
        let lost = self.inner.transport.on_disconnect(&link);

        {
            let mut state = self.lock();
            if state.generation != generation {
                tracing::debug!("{} discarding stale connect (generation {})", device, generation);
                return Err(Error::Superseded);
            }
            state.connection = ConnectionState::Connected;
            state.reader = Some(self.spawn_reader(generation, rx, lost));
            let config = &self.inner.config;
            let polls = [
                (config.port_poll_interval, Command::check_ports()),
                (config.battery_poll_interval, Command::request_battery()),
            ];
            for (every, command) in polls {
                if let Some(every) = every {
                    state.pollers.push(self.spawn_poller(generation, every, command));
                }
            }
        }

        tracing::info!("{} connected", device);
        self.inner.events.emit(Event::Connected {
            device: device.clone(),
        });

        if self.inner.config.query_on_connect {
            if let Err(e) = self.send(Command::request_protocol_version()).await {
                tracing::warn!("{} protocol version query failed: {}", device, e);
            }
        }
        Ok(())
    }

    /// Rebinds the session to a new link after a disconnect.
    ///
    /// Display name, readings and battery state carry over.
    ///
    /// # Errors
    ///
    /// Same as [`ModuleSession::connect`].
    pub async fn reconnect(&self, link: T::Link) -> Result<()> {
        tracing::info!("{} reconnecting", self.inner.device_id);
        self.bind(link, None).await
    }

    fn spawn_poller(&self, generation: u64, every: Duration, command: Command) -> JoinHandle<()> {
        let weak: Weak<SessionInner<T>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                let session = ModuleSession { inner };
                if session.generation() != generation {
                    return;
                }
                if let Err(e) = session.send(command.clone()).await {
                    tracing::debug!(
                        "{} poll 0x{:02x} failed: {}",
                        session.device_id(),
                        command.command_id,
                        e
                    );
                }
            }
        })
    }

    fn spawn_reader(
        &self,
        generation: u64,
        mut rx: mpsc::Receiver<Bytes>,
        mut lost: BoxFuture<'static, ()>,
    ) -> JoinHandle<()> {
        let weak: Weak<SessionInner<T>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    frame = rx.recv() => match frame {
                        Some(frame) => {
                            let Some(inner) = weak.upgrade() else { return };
                            ModuleSession { inner }.on_notification(&frame);
                        }
                        None => break,
                    },
                    () = &mut lost => break,
                }
            }
            if let Some(inner) = weak.upgrade() {
                ModuleSession { inner }.handle_transport_lost(generation);
            }
        })
    }

    fn handle_transport_lost(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation
                || state.connection == ConnectionState::Disconnected
            {
                return;
            }
            // The reader is the caller; let it finish on its own.
            drop(state.reader.take());
            state.abort_pollers();
            state.abort_writes();
            state.generation += 1;
            state.connection = ConnectionState::Disconnected;
            state.link = None;
            state.attached = None;
        }

        tracing::info!("{} transport lost", self.inner.device_id);
        self.inner.events.emit(Event::Disconnected {
            device: self.inner.device_id.clone(),
            reason: DisconnectReason::TransportLost,
        });
    }

    /// Drops the link and cancels every pending write and reconnect.
    ///
    /// Emits [`Event::Disconnected`] unless the session was already
    /// disconnected.
    pub fn disconnect(&self) {
        let was_live = {
            let mut state = self.lock();
            state.cancel_tasks();
            state.generation += 1;
            state.link = None;
            state.attached = None;
            let was_live = state.connection != ConnectionState::Disconnected;
            state.connection = ConnectionState::Disconnected;
            was_live
        };

        if was_live {
            tracing::info!("{} disconnected", self.inner.device_id);
            self.inner.events.emit(Event::Disconnected {
                device: self.inner.device_id.clone(),
                reason: DisconnectReason::Requested,
            });
        }
    }

    /// Stores the reconnect loop for this session so `disconnect` can
    /// cancel it. Aborts the loop if the session is already connected.
    pub(crate) fn set_reconnect_task(&self, task: JoinHandle<()>) {
        let mut state = self.lock();
        if state.connection == ConnectionState::Connected {
            task.abort();
            return;
        }
        if let Some(old) = state.reconnect.replace(task) {
            old.abort();
        }
    }

    /// Detaches the reconnect loop handle so the loop can connect without
    /// cancelling itself.
    pub(crate) fn take_reconnect_task(&self) -> Option<JoinHandle<()>> {
        self.lock().reconnect.take()
    }

    // ==================== Writes ====================

    /// Sends a command to the core or the attached top.
    ///
    /// Core commands go to port 0; everything else to the port the attached
    /// top last reported from. Verified commands are repeated every
    /// `write_interval` until the module echoes the command id. A new
    /// verified command with the same id replaces the old one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a live link, or the
    /// transport's error if the first write fails. Retries keep running
    /// after a failed first write.
    pub async fn send(&self, command: Command) -> Result<()> {
        let (link, packet) = {
            let mut state = self.lock();
            let link = match (&state.link, state.connection) {
                (Some(link), ConnectionState::Connected) => link.clone(),
                _ => return Err(Error::NotConnected),
            };
            let port = if command.module_type == ModuleType::Core {
                0
            } else {
                state.port
            };
            let packet = command.encode(port, state.protocol_version)?;
            if command.verify {
                self.arm_retry(&mut state, &command, link.clone(), packet.clone());
            }
            (link, packet)
        };

        tracing::trace!("{} -> {}", self.inner.device_id, hex::encode(&packet));
        self.inner
            .transport
            .write(&link, packet)
            .await
            .inspect_err(|e| tracing::warn!("{} write failed: {}", self.inner.device_id, e))
    }

    /// Starts the retry task for a verified write. Runs under the same
    /// guard that checked the connection, so a concurrent `disconnect`
    /// either sees the task or the task sees the new generation.
    fn arm_retry(
        &self,
        state: &mut SessionState<T::Link>,
        command: &Command,
        link: T::Link,
        packet: Bytes,
    ) {
        let command_id = command.command_id;
        let interval = self.inner.config.write_interval;
        let max_retries = self.inner.config.max_write_retries;
        let weak = Arc::downgrade(&self.inner);
        let generation = state.generation;
        state.write_seq += 1;
        let seq = state.write_seq;

        let task = tokio::spawn(async move {
            let mut attempts: u32 = 1;
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { return };
                let session = ModuleSession { inner };
                let device = session.device_id().clone();
                if session.generation() != generation {
                    session.forget_write(command_id, seq);
                    return;
                }

                let unacked = ProtocolError::WriteUnacknowledged {
                    command_id,
                    attempts,
                };
                if max_retries.is_some_and(|max| attempts > max) {
                    tracing::warn!("{} giving up: {}", device, unacked);
                    session.forget_write(command_id, seq);
                    return;
                }
                tracing::debug!("{} retrying: {}", device, unacked);

                if let Err(e) = session.inner.transport.write(&link, packet.clone()).await {
                    tracing::warn!("{} retry write failed: {}", device, e);
                }
                attempts = attempts.saturating_add(1);
            }
        });

        let pending = PendingWrite {
            seq,
            module_type: command.module_type,
            task,
        };
        if let Some(old) = state.pending_writes.insert(command_id, pending) {
            old.task.abort();
        }
    }

    fn forget_write(&self, command_id: u8, seq: u64) {
        let mut state = self.lock();
        if state
            .pending_writes
            .get(&command_id)
            .is_some_and(|p| p.seq == seq)
        {
            state.pending_writes.remove(&command_id);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{PacketHeader, encode_payload};
    use crate::top::actuator;
    use crate::transport::{ConnectCriteria, MemoryDevice, MemoryTransport};

    pub(crate) fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    pub(crate) fn packet(module: u8, command: u8, payload: &[u8]) -> Vec<u8> {
        encode_payload(PacketHeader::new(module, 1, command), payload)
            .unwrap()
            .to_vec()
    }

    fn recorded(session: &ModuleSession<MemoryTransport>) -> Arc<Mutex<Vec<Event>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        session.events().on(
            crate::event::Topic::All,
            Arc::new(move |e: &Event| sink.lock().unwrap().push(e.clone())),
        );
        log
    }

    fn offline_session() -> ModuleSession<MemoryTransport> {
        init_tracing();
        ModuleSession::new(
            DeviceId::from("core-1"),
            0,
            "tinka0",
            Arc::new(MemoryTransport::new()),
            SessionConfig::default(),
        )
    }

    async fn online_session(
        config: SessionConfig,
    ) -> (ModuleSession<MemoryTransport>, MemoryDevice) {
        init_tracing();
        let transport = Arc::new(MemoryTransport::new());
        let device = transport.add_device("core-1", "Tinkamo");
        let found = transport.connect(&ConnectCriteria::new()).await.unwrap();
        let session = ModuleSession::new(found.device_id, 0, "tinka0", transport, config);
        session.connect(found.link).await.unwrap();
        (session, device)
    }

    fn quiet() -> SessionConfig {
        SessionConfig::default().query_on_connect(false)
    }

    fn id() -> DeviceId {
        DeviceId::from("core-1")
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::new()
            .write_interval(Duration::from_millis(20))
            .max_write_retries(Some(3))
            .auto_reconnect(false)
            .protocol_version(3);
        assert_eq!(config.write_interval, Duration::from_millis(20));
        assert_eq!(config.reconnect_interval, DEFAULT_RECONNECT_INTERVAL);
        assert_eq!(config.max_write_retries, Some(3));
        assert!(!config.auto_reconnect);
        assert!(config.query_on_connect);
        assert_eq!(config.protocol_version, 3);
        assert_eq!(config.battery_poll_interval, None);
        assert_eq!(config.port_poll_interval, None);

        let polling = SessionConfig::new()
            .battery_poll_interval(Some(BATTERY_POLL_INTERVAL))
            .port_poll_interval(Some(PORT_POLL_INTERVAL));
        assert_eq!(polling.battery_poll_interval, Some(Duration::from_secs(2)));
        assert_eq!(polling.port_poll_interval, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_button_attach_then_press() {
        let session = offline_session();
        let log = recorded(&session);

        session.on_notification(&packet(0, 0, &[1]));
        session.on_notification(&packet(1, 0, &[1]));

        let button = Top::Known(ModuleType::Button);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Event::TopChanged {
                    device: id(),
                    top: Some(button),
                    attached: true,
                },
                Event::Reading {
                    device: id(),
                    top: button,
                    value: Reading::Button(true),
                },
            ]
        );
        assert_eq!(session.attached_top(), Some(button));
        assert_eq!(session.last_reading("button"), Some(Reading::Button(true)));
    }

    #[test]
    fn test_truncated_packets_change_nothing() {
        let session = offline_session();
        let log = recorded(&session);
        let full = packet(0, 0, &[1]);

        for len in 0..full.len() {
            session.on_notification(&full[..len]);
        }

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(session.attached_top(), None);
        assert!(session.last_readings().is_empty());
    }

    #[test]
    fn test_detach_marker_clears_top() {
        let session = offline_session();
        session.on_notification(&packet(0, 0, &[2]));
        let log = recorded(&session);

        session.on_notification(&packet(0, 0, &[255]));

        assert_eq!(session.attached_top(), None);
        assert_eq!(
            *log.lock().unwrap(),
            vec![Event::TopChanged {
                device: id(),
                top: Some(Top::Known(ModuleType::Knob)),
                attached: false,
            }]
        );
    }

    #[test]
    fn test_marker_fires_even_without_change() {
        let session = offline_session();
        let log = recorded(&session);

        session.on_notification(&packet(0, 0, &[1]));
        session.on_notification(&packet(0, 0, &[1]));

        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_implicit_attach_on_mismatched_module() {
        let session = offline_session();
        session.on_notification(&packet(0, 0, &[1]));
        let log = recorded(&session);

        // A slider reading while the button is believed attached.
        session.on_notification(&packet(3, 0, &[0]));

        let slider = Top::Known(ModuleType::Slider);
        assert_eq!(session.attached_top(), Some(slider));
        assert_eq!(session.port(), 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Event::TopChanged {
                    device: id(),
                    top: Some(slider),
                    attached: true,
                },
                Event::Reading {
                    device: id(),
                    top: slider,
                    value: Reading::Slider(10.0),
                },
            ]
        );
    }

    #[test]
    fn test_unknown_module_type_is_ignored() {
        let session = offline_session();
        let log = recorded(&session);

        session.on_notification(&packet(42, 0, &[1, 2, 3]));

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(session.attached_top(), None);
    }

    #[test]
    fn test_unknown_marker_attaches_unsupported_top() {
        let session = offline_session();
        let log = recorded(&session);

        session.on_notification(&packet(0, 0, &[42]));

        assert_eq!(session.attached_top(), Some(Top::Unsupported(42)));
        assert_eq!(
            log.lock().unwrap()[0].top_name(),
            Some("unsupported")
        );
    }

    #[test]
    fn test_suppressed_reading_emits_nothing() {
        let session = offline_session();
        session.on_notification(&packet(0, 0, &[23]));
        let log = recorded(&session);

        session.on_notification(&packet(23, 0, &[61, 0]));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(session.last_reading("distance"), None);

        session.on_notification(&packet(23, 0, &[30, 0]));
        assert_eq!(session.last_reading("distance"), Some(Reading::Distance(30.0)));
    }

    #[test]
    fn test_battery_and_protocol_version() {
        let session = offline_session();
        let log = recorded(&session);

        session.on_notification(&packet(0, 0xFE, &[0xFF]));
        session.on_notification(&packet(0, 0xFF, &[3]));

        assert_eq!(session.battery(), Some(BatteryLevel::Charging));
        assert_eq!(session.protocol_version(), 3);
        assert_eq!(session.attached_top(), None);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Event::Battery {
                    device: id(),
                    level: BatteryLevel::Charging,
                },
                Event::ProtocolVersion {
                    device: id(),
                    version: 3,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let session = offline_session();
        let result = session.send(Command::request_battery()).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_queries_protocol_version() {
        let (session, device) = online_session(SessionConfig::default()).await;
        assert!(session.is_connected());
        assert_eq!(
            device.written(),
            vec![Bytes::from_static(&[0x5A, 0xAB, 7, 0, 0, 2, 0, 0, 0xFF])]
        );
    }

    #[tokio::test]
    async fn test_notifications_flow_through_reader() {
        let (session, device) = online_session(quiet()).await;

        assert!(device.notify(packet(0, 0, &[1])));
        assert!(device.notify(packet(1, 0, &[1])));

        let event = session
            .events()
            .wait_for(
                |e| matches!(e, Event::Reading { .. }),
                Duration::from_secs(1),
            )
            .await;
        assert!(event.is_some());
        assert_eq!(session.last_reading("button"), Some(Reading::Button(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verified_write_retries_until_echo() {
        let (session, device) = online_session(quiet()).await;
        session.on_notification(&packet(5, 0, &[0, 0, 0]));

        session.send(actuator::motor_speed(10.0)).await.unwrap();
        assert_eq!(session.pending_writes(), 1);
        assert_eq!(device.take_written().len(), 1);

        tokio::time::sleep(DEFAULT_WRITE_INTERVAL * 3 + Duration::from_millis(10)).await;
        let retries = device.take_written();
        assert_eq!(retries.len(), 3);
        assert_eq!(retries[0][6], ModuleType::Motor.id());
        assert_eq!(retries[0][7], 1);

        session.on_notification(&packet(5, 0, &[0xFF, 3, 0]));
        assert_eq!(session.pending_writes(), 0);

        tokio::time::sleep(DEFAULT_WRITE_INTERVAL * 5).await;
        assert!(device.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_verified_write_replaced_by_newer() {
        let (session, device) = online_session(quiet()).await;

        session.send(Command::set_led_color(1)).await.unwrap();
        session.send(Command::set_led_color(2)).await.unwrap();
        assert_eq!(session.pending_writes(), 1);
        device.take_written();

        tokio::time::sleep(DEFAULT_WRITE_INTERVAL + Duration::from_millis(10)).await;
        let retries = device.take_written();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0][9], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verified_write_gives_up_after_max_retries() {
        let (session, device) = online_session(quiet().max_write_retries(Some(2))).await;

        session.send(Command::set_led_color(4)).await.unwrap();
        tokio::time::sleep(DEFAULT_WRITE_INTERVAL * 10).await;

        assert_eq!(device.written().len(), 3);
        assert_eq!(session.pending_writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_retries() {
        let (session, device) = online_session(quiet()).await;
        let log = recorded(&session);

        session.send(Command::set_led_color(4)).await.unwrap();
        session.disconnect();
        session.disconnect();
        device.take_written();

        tokio::time::sleep(DEFAULT_WRITE_INTERVAL * 5).await;
        assert!(device.written().is_empty());
        assert_eq!(session.pending_writes(), 0);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            *log.lock().unwrap(),
            vec![Event::Disconnected {
                device: id(),
                reason: DisconnectReason::Requested,
            }]
        );
    }

    #[tokio::test]
    async fn test_transport_loss_disconnects_and_keeps_state() {
        let (session, device) = online_session(quiet()).await;
        session.on_notification(&packet(2, 0, &[1, 0]));

        device.drop_link();
        let event = session
            .events()
            .wait_for(
                |e| matches!(e, Event::Disconnected { .. }),
                Duration::from_secs(1),
            )
            .await;

        assert_eq!(
            event,
            Some(Event::Disconnected {
                device: id(),
                reason: DisconnectReason::TransportLost,
            })
        );
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(session.attached_top(), None);
        assert!(session.last_reading("knob").is_some());
        assert_eq!(session.display_name(), "tinka0");
    }

    /// Holds `subscribe` until a permit is released.
    pub(crate) struct GatedTransport {
        pub(crate) inner: MemoryTransport,
        pub(crate) gate: tokio::sync::Semaphore,
    }

    impl GatedTransport {
        pub(crate) fn new() -> Self {
            Self {
                inner: MemoryTransport::new(),
                gate: tokio::sync::Semaphore::new(0),
            }
        }
    }

    impl Transport for GatedTransport {
        type Link = crate::transport::MemoryLink;

        fn connect<'a>(
            &'a self,
            criteria: &'a ConnectCriteria,
        ) -> BoxFuture<'a, Result<crate::transport::Discovered<Self::Link>>> {
            self.inner.connect(criteria)
        }

        fn subscribe<'a>(
            &'a self,
            link: &'a Self::Link,
        ) -> BoxFuture<'a, Result<mpsc::Receiver<Bytes>>> {
            Box::pin(async move {
                let _permit = self.gate.acquire().await.map_err(|_| Error::ChannelClosed)?;
                self.inner.subscribe(link).await
            })
        }

        fn write<'a>(&'a self, link: &'a Self::Link, data: Bytes) -> BoxFuture<'a, Result<()>> {
            self.inner.write(link, data)
        }

        fn on_disconnect(&self, link: &Self::Link) -> BoxFuture<'static, ()> {
            self.inner.on_disconnect(link)
        }
    }

    #[tokio::test]
    async fn test_stale_connect_is_discarded() {
        init_tracing();
        let transport = Arc::new(GatedTransport::new());
        let device = transport.inner.add_device("core-1", "Tinkamo");
        let found = transport.connect(&ConnectCriteria::new()).await.unwrap();
        let session = ModuleSession::new(
            found.device_id.clone(),
            0,
            "tinka0",
            Arc::clone(&transport),
            quiet(),
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        session.events().on(
            crate::event::Topic::All,
            Arc::new(move |e: &Event| sink.lock().unwrap().push(e.clone())),
        );

        let connecting = session.clone();
        let pending = tokio::spawn(async move { connecting.connect(found.link).await });
        tokio::task::yield_now().await;
        assert_eq!(session.connection_state(), ConnectionState::Connecting);

        // The host gives up before the attempt resolves.
        session.disconnect();
        transport.gate.add_permits(1);

        assert!(matches!(pending.await.unwrap(), Err(Error::Superseded)));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());
        // The late subscription is never read from.
        device.notify(packet(0, 0, &[1]));
        tokio::task::yield_now().await;
        assert_eq!(session.attached_top(), None);
        assert_eq!(
            *log.lock().unwrap(),
            vec![Event::Disconnected {
                device: id(),
                reason: DisconnectReason::Requested,
            }]
        );
    }

    #[tokio::test]
    async fn test_reconnect_rebinds_link() {
        let (session, device) = online_session(quiet()).await;
        session.on_notification(&packet(0, 0xFE, &[50]));
        session.disconnect();
        device.drop_link();

        let transport = Arc::clone(&session.inner.transport);
        let again = transport
            .connect(&ConnectCriteria::for_device(id()))
            .await
            .unwrap();
        session.reconnect(again.link).await.unwrap();

        assert!(session.is_connected());
        assert_eq!(session.battery(), Some(BatteryLevel::Percent(50)));
        session.send(Command::request_battery()).await.unwrap();
        assert_eq!(device.written().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_when_generation_moves_on() {
        let (session, device) = online_session(quiet()).await;

        session.send(Command::set_led_color(4)).await.unwrap();
        // A disconnect racing the send lands after the retry was armed.
        session.lock().generation += 1;
        device.take_written();

        tokio::time::sleep(DEFAULT_WRITE_INTERVAL * 5).await;
        assert!(device.written().is_empty());
        assert_eq!(session.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_failed_rebind_of_live_session_reports_disconnect() {
        init_tracing();
        let transport = Arc::new(MemoryTransport::new());
        let device = transport.add_device("core-1", "Tinkamo");
        let stale = transport.connect(&ConnectCriteria::new()).await.unwrap();
        device.drop_link();
        let live = transport.connect(&ConnectCriteria::new()).await.unwrap();

        let session = ModuleSession::new(id(), 0, "tinka0", transport, quiet());
        session.connect(live.link).await.unwrap();
        let log = recorded(&session);

        let result = session.reconnect(stale.link.clone()).await;
        assert!(matches!(result, Err(Error::TransportLost)));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            *log.lock().unwrap(),
            vec![Event::Disconnected {
                device: id(),
                reason: DisconnectReason::TransportLost,
            }]
        );

        // A failing attempt from an already disconnected session stays quiet.
        assert!(session.reconnect(stale.link).await.is_err());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_skipped_after_disconnect() {
        let (session, device) = online_session(quiet()).await;
        let generation = session.generation();
        session.disconnect();
        device.drop_link();

        let transport = Arc::clone(&session.inner.transport);
        let again = transport
            .connect(&ConnectCriteria::for_device(id()))
            .await
            .unwrap();
        assert!(matches!(
            session.resume(again.link.clone(), generation).await,
            Err(Error::Superseded)
        ));
        assert!(!session.is_connected());

        session
            .resume(again.link, session.generation())
            .await
            .unwrap();
        assert!(session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_ports_and_battery_while_connected() {
        let every = Duration::from_secs(2);
        let config = quiet()
            .port_poll_interval(Some(every))
            .battery_poll_interval(Some(every * 2));
        let (session, device) = online_session(config).await;
        assert!(device.written().is_empty());

        tokio::time::sleep(every * 2 + Duration::from_millis(10)).await;
        let sent: Vec<(u8, u8, u8)> = device
            .take_written()
            .iter()
            .map(|p| (p[6], p[7], p[8]))
            .collect();
        assert_eq!(sent.iter().filter(|c| **c == (0, 0, 0x00)).count(), 2);
        assert_eq!(sent.iter().filter(|c| **c == (0, 0, 0xFE)).count(), 1);
        assert_eq!(sent.len(), 3);

        // The port poll reply is a connection marker.
        session.on_notification(&packet(0, 0, &[ModuleType::Slider.id()]));
        assert_eq!(session.attached_top(), Some(Top::Known(ModuleType::Slider)));

        session.disconnect();
        tokio::time::sleep(every * 3).await;
        assert!(device.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_stops_on_transport_loss() {
        let every = Duration::from_secs(2);
        let (session, device) = online_session(quiet().battery_poll_interval(Some(every))).await;
        let mut sub = session.events().subscribe();

        device.drop_link();
        let lost = sub.recv().await;
        assert!(matches!(lost, Some(Event::Disconnected { .. })));

        tokio::time::sleep(every * 3).await;
        assert!(device.written().is_empty());
        assert!(!session.is_connected());
    }
}
