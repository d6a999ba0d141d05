// Device session: binds the D-LAB GATT characteristics of one connected
// peripheral to their roles and exposes typed reads, writes and bursts.
//
// A session goes Unattached -> Discovering -> Attached -> Detached and is
// never reused. Detaching (explicitly or because the link dropped) drops all
// bindings, stops notification handlers and cancels running bursts.

use crate::config::{PowerLimit, SessionConfig};
use crate::error::{Error, Result};
use crate::firmware::{CharacteristicRole, ServiceRole, POWER_MAX};
use crate::protocol::{
    self, Channel, ChannelPowerState, DecodeError, DeviceConfig, WaveformParams,
};
use crate::transport::{GattCharacteristic, GattPeripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Unattached,
    Discovering,
    Attached,
    Detached,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached,
    BatteryLevel(u8),
    ChannelPower(ChannelPowerState),
    Waveform(Channel, WaveformParams),
    Config(DeviceConfig),
    BurstStarted(Channel),
    BurstFinished(Channel),
    Detached,
}

/// Last known device values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub battery_level: Option<u8>,
    pub channel_power: ChannelPowerState,
    /// As last reported by the device, indexed A then B.
    pub waveform: [Option<WaveformParams>; 2],
    pub config: Option<DeviceConfig>,
}

#[derive(Clone)]
struct Binding {
    characteristic: Arc<dyn GattCharacteristic>,
    // tokio's mutex is fair, so writes queue up in FIFO order.
    write_gate: Arc<tokio::sync::Mutex<()>>,
}

impl Binding {
    fn new(characteristic: Arc<dyn GattCharacteristic>) -> Self {
        Self {
            characteristic,
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

#[derive(Default)]
struct BurstSlot {
    generation: u64,
    task: Option<(JoinHandle<()>, Arc<tokio::sync::Mutex<()>>)>,
}

struct Shared {
    config: SessionConfig,
    phase: Mutex<Phase>,
    bindings: Mutex<HashMap<CharacteristicRole, Binding>>,
    state: Mutex<DeviceState>,
    pending: Mutex<[Option<[u8; 3]>; 2]>,
    bursts: Mutex<[BurstSlot; 2]>,
    sending: [watch::Sender<bool>; 2],
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<DeviceEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one device session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                phase: Mutex::new(Phase::Unattached),
                bindings: Mutex::new(HashMap::new()),
                state: Mutex::new(DeviceState::default()),
                pending: Mutex::new([None, None]),
                bursts: Mutex::new(Default::default()),
                sending: [watch::channel(false).0, watch::channel(false).0],
                tasks: Mutex::new(Vec::new()),
                events,
            }),
        }
    }

    /// Discover the device's services and characteristics, bind the known
    /// ones and run their initial reads and subscriptions.
    ///
    /// Missing services or characteristics are not an error; operations on
    /// them report [`Error::RoleUnbound`] later on.
    pub async fn attach(&self, peripheral: Arc<dyn GattPeripheral>) -> Result<()> {
        {
            let mut phase = lock(&self.shared.phase);
            if *phase != Phase::Unattached {
                return Err(Error::AlreadyAttached(*phase));
            }
            *phase = Phase::Discovering;
        }

        let weak = Arc::downgrade(&self.shared);
        let watched = Arc::clone(&peripheral);
        let watcher = tokio::spawn(async move {
            watched.disconnected().await;
            if let Some(shared) = weak.upgrade() {
                info!("Device disconnected");
                // Detaching aborts this task, so it has to finish elsewhere.
                tokio::spawn(async move { shared.detach().await });
            }
        });
        self.shared.track(watcher);

        info!("Requesting services");
        let services = match peripheral.services().await {
            Ok(services) => services,
            Err(err) => {
                warn!("Service discovery failed: {err}");
                self.shared.detach().await;
                return Err(err.into());
            }
        };
        if services.is_empty() {
            warn!("Device exposes no services, nothing will be bound");
        }

        let mut bindings: HashMap<CharacteristicRole, Binding> = HashMap::new();
        for service in services {
            let Some(service_role) = ServiceRole::from_uuid(service.uuid()) else {
                debug!("Skipping unknown service {}", service.uuid());
                continue;
            };
            debug!("Requesting {service_role:?} characteristics");
            let characteristics = match service.characteristics().await {
                Ok(characteristics) => characteristics,
                Err(err) => {
                    warn!("Could not list {service_role:?} characteristics: {err}");
                    continue;
                }
            };
            for characteristic in characteristics {
                let Some(role) = CharacteristicRole::from_uuid(characteristic.uuid()) else {
                    continue;
                };
                if role.service() != service_role {
                    warn!("Ignoring {role} characteristic found under the {service_role:?} service");
                    continue;
                }
                if bindings.contains_key(&role) {
                    warn!("Ignoring duplicate {role} characteristic");
                    continue;
                }
                info!("Bound {role} characteristic");
                bindings.insert(role, Binding::new(characteristic));
            }
        }

        {
            let mut phase = lock(&self.shared.phase);
            if *phase != Phase::Discovering {
                return Err(Error::NotAttached);
            }
            *lock(&self.shared.bindings) = bindings.clone();
            *phase = Phase::Attached;
        }
        self.shared.emit(DeviceEvent::Attached);

        futures::future::join_all(
            bindings
                .into_iter()
                .map(|(role, binding)| Arc::clone(&self.shared).on_bind(role, binding)),
        )
        .await;
        Ok(())
    }

    /// End the session. Idempotent. A burst frame that is already being
    /// written finishes before this returns.
    pub async fn detach(&self) {
        self.shared.detach().await;
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.shared.phase)
    }

    pub fn is_bound(&self, role: CharacteristicRole) -> bool {
        lock(&self.shared.bindings).contains_key(&role)
    }

    pub fn config(&self) -> Option<DeviceConfig> {
        lock(&self.shared.state).config
    }

    pub fn battery_level(&self) -> Option<u8> {
        lock(&self.shared.state).battery_level
    }

    pub fn channel_power(&self) -> ChannelPowerState {
        lock(&self.shared.state).channel_power
    }

    pub fn waveform(&self, channel: Channel) -> Option<WaveformParams> {
        lock(&self.shared.state).waveform[channel.index()]
    }

    pub fn state(&self) -> DeviceState {
        *lock(&self.shared.state)
    }

    /// Change notifications, in the order they were applied. Dropping the
    /// receiver ends the subscription.
    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    pub async fn read_battery_level(&self) -> Result<u8> {
        let value = self.shared.read(CharacteristicRole::BatteryLevel).await?;
        Ok(self.shared.apply_battery(&value)?)
    }

    pub async fn read_channel_power(&self) -> Result<ChannelPowerState> {
        let value = self.shared.read(CharacteristicRole::ChannelPower).await?;
        Ok(self.shared.apply_power(&value)?)
    }

    pub async fn read_config(&self) -> Result<DeviceConfig> {
        let value = self.shared.read(CharacteristicRole::Config).await?;
        Ok(self.shared.apply_config(&value)?)
    }

    /// Read what the device currently reports for a channel's waveform.
    /// The pending buffer is left alone.
    pub async fn read_waveform(&self, channel: Channel) -> Result<WaveformParams> {
        let role = match channel {
            Channel::A => CharacteristicRole::WaveformA,
            Channel::B => CharacteristicRole::WaveformB,
        };
        let value = self.shared.read(role).await?;
        Ok(self.shared.apply_waveform(channel, &value)?)
    }

    /// Set one channel's power and send it together with the other channel's
    /// last known power, then read the result back from the device.
    ///
    /// Returns the power state as confirmed by the device, or the written
    /// state if the read-back failed. A failed write leaves the cached state
    /// untouched.
    pub async fn write_channel_power(
        &self,
        channel: Channel,
        value: u16,
    ) -> Result<ChannelPowerState> {
        let binding = self.shared.binding(CharacteristicRole::ChannelPower)?;
        let value = self.shared.limit_power(channel, value)?;

        let _gate = binding.write_gate.lock().await;
        let target = self.channel_power().with(channel, value);
        debug!("Writing channel power A={} B={}", target.a, target.b);
        binding
            .characteristic
            .write(&protocol::encode_power_state(target))
            .await?;
        self.shared.ensure_attached()?;
        lock(&self.shared.state).channel_power = target;

        match self.read_channel_power().await {
            Ok(confirmed) => {
                if confirmed != target {
                    info!(
                        "Device adjusted channel power to A={} B={}",
                        confirmed.a, confirmed.b
                    );
                }
                Ok(confirmed)
            }
            Err(Error::NotAttached) => Err(Error::NotAttached),
            Err(err) => {
                warn!("Channel power read-back failed: {err}");
                Ok(target)
            }
        }
    }

    /// Store a waveform in the channel's pending buffer. Nothing is sent
    /// until a burst is started.
    pub fn set_waveform(&self, channel: Channel, x: u8, y: u16, z: u8) -> Result<()> {
        self.shared.ensure_attached()?;
        let buffer = protocol::encode_waveform(x, y, z);
        debug!("Pending waveform {channel}: x={x} y={y} z={z} -> {buffer:02x?}");
        lock(&self.shared.pending)[channel.index()] = Some(buffer);
        Ok(())
    }

    pub fn pending_waveform(&self, channel: Channel) -> Option<WaveformParams> {
        let buffer = lock(&self.shared.pending)[channel.index()]?;
        protocol::decode_waveform(&buffer).ok()
    }

    /// Repeatedly send the channel's pending buffer for the configured
    /// number of ticks. A burst already running on this channel is replaced.
    pub fn start_waveform_burst(&self, channel: Channel) -> Result<()> {
        let shared = &self.shared;
        if shared.config.burst_interval.is_zero() {
            return Err(Error::InvalidBurstInterval);
        }
        let target = shared.config.burst_routing.target(channel);
        let binding = shared.binding(target)?;
        if lock(&shared.pending)[channel.index()].is_none() {
            return Err(Error::NoPendingWaveform(channel));
        }

        let replaced = {
            let mut bursts = lock(&shared.bursts);
            shared.ensure_attached()?;
            let slot = &mut bursts[channel.index()];
            slot.generation += 1;
            let guard = BurstGuard {
                shared: Arc::downgrade(shared),
                channel,
                generation: slot.generation,
                sent: 0,
            };
            let gate = Arc::clone(&binding.write_gate);
            let task = tokio::spawn(run_burst(
                guard,
                binding,
                shared.config.burst_ticks,
                shared.config.burst_interval,
            ));
            let replaced = slot.task.replace((task, gate));
            shared.sending[channel.index()].send_replace(true);
            info!("Waveform burst started on channel {channel}, sending to {target}");
            shared.emit(DeviceEvent::BurstStarted(channel));
            replaced
        };
        // Abort outside the lock: the aborted task's guard takes it too.
        if let Some((task, _)) = replaced {
            debug!("Replaced running waveform burst on channel {channel}");
            task.abort();
        }
        Ok(())
    }

    /// Cancel the channel's burst. Once this returns, no further burst write
    /// happens. Returns whether a burst was running.
    pub async fn stop_waveform_burst(&self, channel: Channel) -> bool {
        let (task, gate) = {
            let mut bursts = lock(&self.shared.bursts);
            let slot = &mut bursts[channel.index()];
            slot.generation += 1;
            match slot.task.take() {
                Some(running) => running,
                None => return false,
            }
        };
        // Let a tick that is already writing finish before reporting.
        drop(gate.lock().await);
        task.abort();
        self.shared.sending[channel.index()].send_replace(false);
        info!("Waveform burst on channel {channel} cancelled");
        self.shared.emit(DeviceEvent::BurstFinished(channel));
        true
    }

    pub fn is_sending_waveform(&self, channel: Channel) -> bool {
        *self.shared.sending[channel.index()].borrow()
    }

    pub fn watch_waveform_burst(&self, channel: Channel) -> watch::Receiver<bool> {
        self.shared.sending[channel.index()].subscribe()
    }

    /// Wait until the channel has no active burst.
    pub async fn wait_waveform_burst(&self, channel: Channel) {
        let mut sending = self.watch_waveform_burst(channel);
        let _ = sending.wait_for(|active| !*active).await;
    }
}

impl Shared {
    fn emit(&self, event: DeviceEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn ensure_attached(&self) -> Result<()> {
        match *lock(&self.phase) {
            Phase::Attached => Ok(()),
            _ => Err(Error::NotAttached),
        }
    }

    fn binding(&self, role: CharacteristicRole) -> Result<Binding> {
        self.ensure_attached()?;
        lock(&self.bindings)
            .get(&role)
            .cloned()
            .ok_or(Error::RoleUnbound(role))
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        if *lock(&self.phase) == Phase::Detached {
            task.abort();
        } else {
            tasks.push(task);
        }
    }

    async fn read(&self, role: CharacteristicRole) -> Result<Vec<u8>> {
        let binding = self.binding(role)?;
        let value = binding.characteristic.read().await?;
        self.ensure_attached()?;
        Ok(value)
    }

    fn limit_power(&self, channel: Channel, value: u16) -> Result<u16> {
        let max = lock(&self.state)
            .config
            .map_or(POWER_MAX, |config| config.max_power.min(POWER_MAX));
        match self.config.power_limit {
            PowerLimit::Unchecked => Ok(value),
            PowerLimit::Clamp => Ok(value.min(max)),
            PowerLimit::Reject if value > max => {
                Err(Error::PowerOutOfRange { channel, value, max })
            }
            PowerLimit::Reject => Ok(value),
        }
    }

    fn apply_battery(&self, value: &[u8]) -> Result<u8, DecodeError> {
        let level = protocol::decode_battery(value)?;
        lock(&self.state).battery_level = Some(level);
        debug!("Battery level: {level}%");
        self.emit(DeviceEvent::BatteryLevel(level));
        Ok(level)
    }

    fn apply_power(&self, value: &[u8]) -> Result<ChannelPowerState, DecodeError> {
        let power = protocol::decode_power(value)?;
        lock(&self.state).channel_power = power;
        debug!("Channel power: A={} B={}", power.a, power.b);
        self.emit(DeviceEvent::ChannelPower(power));
        Ok(power)
    }

    fn apply_waveform(&self, channel: Channel, value: &[u8]) -> Result<WaveformParams, DecodeError> {
        let params = protocol::decode_waveform(value)?;
        lock(&self.state).waveform[channel.index()] = Some(params);
        self.emit(DeviceEvent::Waveform(channel, params));
        Ok(params)
    }

    fn apply_config(&self, value: &[u8]) -> Result<DeviceConfig, DecodeError> {
        let config = protocol::decode_config(value)?;
        lock(&self.state).config = Some(config);
        info!(
            "Device config: max power {}, power step {}",
            config.max_power, config.power_step
        );
        self.emit(DeviceEvent::Config(config));
        Ok(config)
    }

    fn apply(&self, role: CharacteristicRole, value: &[u8]) -> Result<(), DecodeError> {
        match role {
            CharacteristicRole::BatteryLevel => self.apply_battery(value).map(drop),
            CharacteristicRole::ChannelPower => self.apply_power(value).map(drop),
            CharacteristicRole::WaveformA => self.apply_waveform(Channel::A, value).map(drop),
            CharacteristicRole::WaveformB => self.apply_waveform(Channel::B, value).map(drop),
            CharacteristicRole::Config => self.apply_config(value).map(drop),
        }
    }

    fn seed(&self, role: CharacteristicRole, value: &[u8]) {
        if self.ensure_attached().is_err() {
            return;
        }
        // Waveform values only land in the cache. The pending buffers stay
        // empty until set_waveform.
        if let Err(err) = self.apply(role, value) {
            warn!("Initial {role} value is malformed: {err}");
        }
    }

    async fn on_bind(self: Arc<Self>, role: CharacteristicRole, binding: Binding) {
        match binding.characteristic.read().await {
            Ok(value) => self.seed(role, &value),
            Err(err) => warn!("Initial read of {role} failed: {err}"),
        }

        if matches!(
            role,
            CharacteristicRole::BatteryLevel | CharacteristicRole::ChannelPower
        ) {
            self.subscribe(role, &binding).await;
        }
    }

    async fn subscribe(self: &Arc<Self>, role: CharacteristicRole, binding: &Binding) {
        let mut notifications = match binding.characteristic.subscribe().await {
            Ok(notifications) => notifications,
            Err(err) => {
                warn!("Could not subscribe to {role} notifications: {err}");
                return;
            }
        };
        debug!("Subscribed to {role} notifications");
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(value) = notifications.next().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if shared.ensure_attached().is_err() {
                    break;
                }
                if let Err(err) = shared.apply(role, &value) {
                    warn!("Ignoring malformed {role} notification {value:02x?}: {err}");
                }
            }
            debug!("{role} notification stream ended");
        });
        self.track(task);
    }

    fn burst_is_current(&self, channel: Channel, generation: u64) -> bool {
        lock(&self.bursts)[channel.index()].generation == generation
    }

    fn finish_burst(&self, channel: Channel, generation: u64, sent: usize) {
        let mut bursts = lock(&self.bursts);
        let slot = &mut bursts[channel.index()];
        if slot.generation != generation {
            return;
        }
        slot.task = None;
        self.sending[channel.index()].send_replace(false);
        info!("Waveform burst on channel {channel} finished after {sent} frames");
        self.emit(DeviceEvent::BurstFinished(channel));
    }

    async fn detach(&self) {
        {
            let mut phase = lock(&self.phase);
            if *phase == Phase::Detached {
                return;
            }
            *phase = Phase::Detached;
        }
        lock(&self.bindings).clear();
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let mut running = Vec::new();
        {
            let mut bursts = lock(&self.bursts);
            for channel in Channel::ALL {
                let slot = &mut bursts[channel.index()];
                slot.generation += 1;
                if let Some(task) = slot.task.take() {
                    running.push((channel, task));
                }
            }
        }
        for (channel, (task, gate)) in running {
            // Same as stop_waveform_burst: a frame already on its way is
            // written before the flag drops.
            drop(gate.lock().await);
            task.abort();
            self.sending[channel.index()].send_replace(false);
            self.emit(DeviceEvent::BurstFinished(channel));
        }
        info!("Session detached");
        self.emit(DeviceEvent::Detached);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
        let bursts = self.bursts.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in bursts.iter_mut() {
            if let Some((task, _)) = slot.task.take() {
                task.abort();
            }
        }
    }
}

/// Ends a burst when its task ends, whether it ran out of ticks, failed,
/// panicked or was aborted. A burst that was replaced or stopped no longer
/// owns its slot, so finishing it is a no-op.
struct BurstGuard {
    shared: Weak<Shared>,
    channel: Channel,
    generation: u64,
    sent: usize,
}

impl Drop for BurstGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.finish_burst(self.channel, self.generation, self.sent);
        }
    }
}

async fn run_burst(mut guard: BurstGuard, binding: Binding, ticks: usize, interval: Duration) {
    let channel = guard.channel;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    for _ in 0..ticks {
        ticker.tick().await;
        let Some(session) = guard.shared.upgrade() else {
            return;
        };
        let _gate = binding.write_gate.lock().await;
        if !session.burst_is_current(channel, guard.generation) {
            return;
        }
        let Some(buffer) = lock(&session.pending)[channel.index()] else {
            break;
        };
        if let Err(err) = binding.characteristic.write(&buffer).await {
            warn!("Waveform burst on channel {channel} aborted: {err}");
            break;
        }
        guard.sent += 1;
    }
}
