//! Connection Facade
//!
//! The single boundary between the protocol engine and the rest of the
//! world. The facade owns the peripheral handle, the connection state and
//! the published streams; external collaborators observe the streams and
//! issue the high-level commands defined on [`TrainerApi`]. Notification
//! characteristics (rep, version, mode) are wired here; the polling
//! engine handles polled characteristics only.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::anyhow;
use async_trait::async_trait;
use btleplug::api::Manager as _;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Peripheral, ScanFilter, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager};
use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

use crate::controller::polling::{find_characteristic, MetricPollingEngine, PollingCallbacks};
use crate::controller::queue::BleOperationQueue;
use crate::core::clock::now_ms;
use crate::core::constants::{
    CONNECT_TIMEOUT_MS, DIAGNOSTIC_CHARACTERISTIC_UUID, EVENT_CHANNEL_CAPACITY,
    GATT_OPERATION_TIMEOUT_MS, METRIC_CHANNEL_CAPACITY, MODE_CHARACTERISTIC_UUID, OPCODE_CONFIG,
    REPS_CHARACTERISTIC_UUID, RX_CHARACTERISTIC_UUID, SCAN_REFRESH_INTERVAL_MS, TARGET_MTU,
    TX_CHARACTERISTIC_UUID, VERSION_CHARACTERISTIC_UUID,
};
use crate::core::errors::{CommandError, ConnectError, ScanError};
use crate::core::events::{ConnectionLossReason, ConnectionState, WorkoutEvent};
use crate::model::commands::{encode_stop, start_sequence, WorkoutCommand};
use crate::model::device::DeviceDescriptor;
use crate::model::handle::HandleStateDetector;
use crate::model::monitor::MonitorDataProcessor;
use crate::model::packets::{
    DiagnosticPacket, HeuristicPacket, ModeChangeEvent, RepPacket, VersionInfo, WorkoutMetric,
};
use crate::model::parser::{
    buf_to_hex, parse_diagnostic_packet, parse_mode_change, parse_rep_packet,
    parse_rx_metrics_response, parse_version_info,
};

/// The characteristics the facade subscribes to on connect.
const NOTIFY_CHARACTERISTICS: [Uuid; 3] = [
    REPS_CHARACTERISTIC_UUID,
    VERSION_CHARACTERISTIC_UUID,
    MODE_CHARACTERISTIC_UUID,
];

/// High-level command surface of the engine.
#[async_trait]
pub trait TrainerApi {
    /// Starts device discovery; results stream on the scan channel.
    async fn start_scanning(&mut self) -> Result<(), ScanError>;

    /// Stops device discovery.
    async fn stop_scanning(&mut self) -> Result<(), ScanError>;

    /// Establishes the GATT session and starts all polling.
    async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), ConnectError>;

    /// Tears the session down. Idempotent.
    async fn disconnect(&mut self);

    /// Sends the CONFIG/START/STOP command sequence for `command`.
    async fn send_workout_command(&self, command: WorkoutCommand) -> Result<(), CommandError>;

    /// Stops metric emission while keeping the link warm.
    async fn stop_monitor_polling_only(&self);

    /// Resumes monitor polling after [`TrainerApi::stop_monitor_polling_only`].
    async fn restart_monitor_polling(&self) -> Result<(), CommandError>;

    /// Revives diagnostic and heartbeat polling where needed.
    async fn restart_diagnostic_polling(&self) -> Result<(), CommandError>;

    /// Brings every polling task up for an active workout.
    async fn start_active_workout_polling(&self) -> Result<(), CommandError>;

    /// Monitor polling with the handle detector armed for just-lift
    /// session starts.
    async fn start_auto_start_monitoring(&self) -> Result<(), CommandError>;
}

/// Adapter discovery seam, so the facade stays testable without hardware.
#[async_trait]
pub trait AdapterDiscovery<A: Central> {
    async fn discover_adapters() -> Result<Vec<A>, ScanError>;
}

#[async_trait]
impl AdapterDiscovery<Adapter> for Adapter {
    async fn discover_adapters() -> Result<Vec<Adapter>, ScanError> {
        let manager = Manager::new().await?;
        Ok(manager.adapters().await?)
    }
}

/// Senders of the notification-driven streams, shared with the dispatcher
/// task and the reconnect supervisor.
#[derive(Clone)]
struct NotificationSenders {
    rep_tx: broadcast::Sender<RepPacket>,
    version_tx: broadcast::Sender<VersionInfo>,
    mode_tx: broadcast::Sender<ModeChangeEvent>,
}

/// The session pieces the supervisor must reach from its own task: the
/// peripheral handle and the notification dispatcher.
struct SharedLink<P> {
    peripheral: StdMutex<Option<P>>,
    notif_handle: StdMutex<Option<JoinHandle<anyhow::Result<()>>>>,
}

impl<P> Default for SharedLink<P> {
    fn default() -> Self {
        Self {
            peripheral: StdMutex::new(None),
            notif_handle: StdMutex::new(None),
        }
    }
}

/// Connection facade over one Bluetooth adapter. Must be constructed
/// inside a tokio runtime.
pub struct DeviceController<A: Central + 'static> {
    adapter: A,
    queue: Arc<BleOperationQueue>,
    engine: Arc<Mutex<MetricPollingEngine>>,
    processor: Arc<Mutex<MonitorDataProcessor>>,
    detector: Arc<Mutex<HandleStateDetector>>,
    link: Arc<SharedLink<A::Peripheral>>,
    senders: NotificationSenders,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    metrics_tx: broadcast::Sender<WorkoutMetric>,
    diagnostic_tx: broadcast::Sender<DiagnosticPacket>,
    workout_tx: broadcast::Sender<WorkoutEvent>,
    scan_tx: broadcast::Sender<DeviceDescriptor>,
    heuristic_tx: Arc<watch::Sender<Option<HeuristicPacket>>>,
    loss_tx: mpsc::Sender<ConnectionLossReason>,
    scan_handle: Option<JoinHandle<anyhow::Result<()>>>,
    central_events_handle: Option<JoinHandle<anyhow::Result<()>>>,
    supervisor_handle: Option<JoinHandle<()>>,
    scanning: bool,
}

impl<A: Central + 'static> Drop for DeviceController<A> {
    fn drop(&mut self) {
        if let Some(handle) = self.scan_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.central_events_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.supervisor_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.link.notif_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl DeviceController<Adapter> {
    /// Convenience constructor on the platform's first adapter.
    pub async fn with_first_adapter() -> Result<Self, ScanError> {
        let adapters = Adapter::discover_adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(ScanError::NoAdapter)?;
        Ok(Self::new(adapter))
    }
}

impl<A: Central + 'static> DeviceController<A>
where
    A::Peripheral: 'static,
{
    pub fn new(adapter: A) -> Self {
        let state_tx = Arc::new(watch::channel(ConnectionState::Disconnected).0);
        let (metrics_tx, _) = broadcast::channel(METRIC_CHANNEL_CAPACITY);
        let (rep_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (version_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (mode_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (diagnostic_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (workout_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (scan_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let heuristic_tx = Arc::new(watch::channel(None).0);
        let (loss_tx, loss_rx) = mpsc::channel(4);

        let mut processor = MonitorDataProcessor::new();
        let deload_tx = workout_tx.clone();
        processor.set_deload_callback(Box::new(move || {
            let _ = deload_tx.send(WorkoutEvent::DeloadOccurred);
        }));
        let rom_tx = workout_tx.clone();
        processor.set_rom_violation_callback(Box::new(move |kind| {
            let _ = rom_tx.send(WorkoutEvent::RomViolation(kind));
        }));
        let processor = Arc::new(Mutex::new(processor));
        let detector = Arc::new(Mutex::new(HandleStateDetector::new()));
        let queue = Arc::new(BleOperationQueue::new());

        let metric_cb_tx = metrics_tx.clone();
        let heuristic_cb_tx = heuristic_tx.clone();
        let diagnostic_cb_tx = diagnostic_tx.clone();
        let loss_cb_tx = loss_tx.clone();
        let callbacks = PollingCallbacks {
            on_metric_emit: Arc::new(move |metric| metric_cb_tx.send(metric).is_ok()),
            on_heuristic_data: Arc::new(move |packet| {
                heuristic_cb_tx.send_replace(Some(packet));
            }),
            on_diagnostic_data: Arc::new(move |packet| {
                let _ = diagnostic_cb_tx.send(packet);
            }),
            on_connection_lost: Arc::new(move || {
                let _ = loss_cb_tx.try_send(ConnectionLossReason::ConsecutiveTimeouts);
            }),
        };
        let engine = Arc::new(Mutex::new(MetricPollingEngine::new(
            queue.clone(),
            processor.clone(),
            detector.clone(),
            callbacks,
        )));
        let link: Arc<SharedLink<A::Peripheral>> = Arc::new(SharedLink::default());
        let senders = NotificationSenders {
            rep_tx,
            version_tx,
            mode_tx,
        };
        let supervisor_handle = tokio::spawn(supervise(
            loss_rx,
            state_tx.clone(),
            engine.clone(),
            link.clone(),
            queue.clone(),
            senders.clone(),
        ));

        Self {
            adapter,
            queue,
            engine,
            processor,
            detector,
            link,
            senders,
            state_tx,
            metrics_tx,
            diagnostic_tx,
            workout_tx,
            scan_tx,
            heuristic_tx,
            loss_tx,
            scan_handle: None,
            central_events_handle: None,
            supervisor_handle: Some(supervisor_handle),
            scanning: false,
        }
    }

    // --- Published streams ---

    pub fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<WorkoutMetric> {
        self.metrics_tx.subscribe()
    }

    pub fn subscribe_rep_events(&self) -> broadcast::Receiver<RepPacket> {
        self.senders.rep_tx.subscribe()
    }

    pub fn subscribe_diagnostic_events(&self) -> broadcast::Receiver<DiagnosticPacket> {
        self.diagnostic_tx.subscribe()
    }

    pub fn subscribe_mode_changes(&self) -> broadcast::Receiver<ModeChangeEvent> {
        self.senders.mode_tx.subscribe()
    }

    pub fn subscribe_version_info(&self) -> broadcast::Receiver<VersionInfo> {
        self.senders.version_tx.subscribe()
    }

    pub fn subscribe_workout_events(&self) -> broadcast::Receiver<WorkoutEvent> {
        self.workout_tx.subscribe()
    }

    pub fn subscribe_scan_results(&self) -> broadcast::Receiver<DeviceDescriptor> {
        self.scan_tx.subscribe()
    }

    /// Last heuristic snapshot, as a single-value stream.
    pub fn heuristic_data(&self) -> watch::Receiver<Option<HeuristicPacket>> {
        self.heuristic_tx.subscribe()
    }

    pub fn monitor_processor(&self) -> Arc<Mutex<MonitorDataProcessor>> {
        self.processor.clone()
    }

    pub fn handle_detector(&self) -> Arc<Mutex<HandleStateDetector>> {
        self.detector.clone()
    }

    pub async fn enable_handle_detection(&self, auto_start: bool) {
        self.detector.lock().await.enable(auto_start);
    }

    pub async fn disable_handle_detection(&self) {
        self.detector.lock().await.disable();
    }

    // --- Internals ---

    fn set_state(&self, state: ConnectionState) {
        debug!("connection state -> {:?}", state);
        self.state_tx.send_replace(state);
    }

    fn current_peripheral(&self) -> Option<A::Peripheral> {
        self.link.peripheral.lock().unwrap().clone()
    }

    /// Looks the connected peripheral up for a polling wrapper. Calling a
    /// wrapper without a session is a caller bug: it is logged loudly and
    /// surfaced, never swallowed.
    fn require_peripheral(&self, operation: &str) -> Result<A::Peripheral, CommandError> {
        self.current_peripheral().ok_or_else(|| {
            error!("{} called without a connected peripheral", operation);
            CommandError::NotConnected
        })
    }

    async fn establish(&mut self, device: &DeviceDescriptor) -> Result<(), ConnectError> {
        let peripherals = self.adapter.peripherals().await?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.address() == device.address)
            .ok_or_else(|| ConnectError::DeviceNotFound(device.name.clone()))?;

        timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            self.queue.with_lock(peripheral.connect()),
        )
        .await
        .map_err(|_| {
            ConnectError::Ble(btleplug::Error::TimedOut(Duration::from_millis(
                CONNECT_TIMEOUT_MS,
            )))
        })??;
        peripheral
            .discover_services()
            .await
            .map_err(ConnectError::ServiceDiscovery)?;
        // ATT MTU is negotiated by the platform stack; a smaller result
        // only lowers throughput.
        info!(
            "connected to {}, MTU target {} left to the platform",
            device.name, TARGET_MTU
        );

        wire_session(&peripheral, &self.queue, &self.link, &self.senders).await?;
        self.start_central_watcher();
        self.engine.lock().await.start_all(&peripheral);
        self.set_state(ConnectionState::Connected {
            device_name: device.name.clone(),
            address: device.address,
            model: device.model,
        });
        Ok(())
    }

    /// Forwards platform disconnect events into the supervisor channel.
    fn start_central_watcher(&mut self) {
        if let Some(old) = self.central_events_handle.take() {
            old.abort();
        }
        let adapter = self.adapter.clone();
        let loss_tx = self.loss_tx.clone();
        self.central_events_handle = Some(tokio::spawn(async move {
            let mut events = adapter.events().await?;
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    warn!("platform reported disconnect of {:?}", id);
                    let _ = loss_tx.try_send(ConnectionLossReason::PeerDisconnected);
                }
            }
            Err(anyhow!("central event stream ended"))
        }));
    }

    async fn surface_config_faults(&self, peripheral: &A::Peripheral) {
        let Some(characteristic) = find_characteristic(peripheral, DIAGNOSTIC_CHARACTERISTIC_UUID)
        else {
            return;
        };
        match timeout(
            Duration::from_millis(GATT_OPERATION_TIMEOUT_MS),
            self.queue.with_lock(peripheral.read(&characteristic)),
        )
        .await
        {
            Ok(Ok(bytes)) => {
                if let Some(packet) = parse_diagnostic_packet(&bytes) {
                    if packet.has_faults {
                        warn!("faults after CONFIG: {:?}", packet.faults);
                    }
                    let _ = self.diagnostic_tx.send(packet);
                }
            }
            _ => warn!("post-CONFIG diagnostic read failed"),
        }
    }

    async fn write_frame(
        &self,
        peripheral: &A::Peripheral,
        characteristic: &btleplug::api::Characteristic,
        frame: &[u8],
    ) -> Result<(), CommandError> {
        match timeout(
            Duration::from_millis(GATT_OPERATION_TIMEOUT_MS),
            self.queue
                .with_lock(peripheral.write(characteristic, frame, WriteType::WithResponse)),
        )
        .await
        {
            Err(_) => Err(CommandError::Timeout),
            Ok(Err(e)) => Err(CommandError::Write(e)),
            Ok(Ok(())) => Ok(()),
        }
    }
}

#[async_trait]
impl<A: Central + 'static> TrainerApi for DeviceController<A>
where
    A::Peripheral: 'static,
{
    async fn start_scanning(&mut self) -> Result<(), ScanError> {
        if self.scanning {
            return Err(ScanError::AlreadyScanning);
        }
        self.adapter.start_scan(ScanFilter::default()).await?;
        let adapter = self.adapter.clone();
        let scan_tx = self.scan_tx.clone();
        self.scan_handle = Some(tokio::spawn(async move {
            let mut seen: HashSet<BDAddr> = HashSet::new();
            loop {
                for peripheral in adapter.peripherals().await? {
                    let address = peripheral.address();
                    if seen.contains(&address) {
                        continue;
                    }
                    let name = match peripheral.properties().await {
                        Ok(Some(props)) => props.local_name,
                        _ => None,
                    };
                    let descriptor =
                        name.and_then(|n| DeviceDescriptor::from_advertisement(n, address));
                    if let Some(descriptor) = descriptor {
                        debug!("discovered {} ({})", descriptor.name, descriptor.address);
                        seen.insert(address);
                        let _ = scan_tx.send(descriptor);
                    }
                }
                sleep(Duration::from_millis(SCAN_REFRESH_INTERVAL_MS)).await;
            }
        }));
        self.scanning = true;
        if matches!(
            self.connection_state(),
            ConnectionState::Disconnected | ConnectionState::Error { .. }
        ) {
            self.set_state(ConnectionState::Scanning);
        }
        Ok(())
    }

    async fn stop_scanning(&mut self) -> Result<(), ScanError> {
        if !self.scanning {
            return Err(ScanError::NotScanning);
        }
        if let Some(handle) = self.scan_handle.take() {
            handle.abort();
        }
        self.adapter.stop_scan().await?;
        self.scanning = false;
        if matches!(self.connection_state(), ConnectionState::Scanning) {
            self.set_state(ConnectionState::Disconnected);
        }
        Ok(())
    }

    async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), ConnectError> {
        if matches!(
            self.connection_state(),
            ConnectionState::Connected { .. }
                | ConnectionState::Connecting
                | ConnectionState::Reconnecting
        ) {
            return Err(ConnectError::Busy);
        }
        if self.scanning {
            let _ = self.stop_scanning().await;
        }
        self.set_state(ConnectionState::Connecting);
        match self.establish(device).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(ConnectionState::Error {
                    message: format!("failed to connect to {}", device.name),
                    cause: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.engine.lock().await.stop_all();
        if let Some(handle) = self.central_events_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.link.notif_handle.lock().unwrap().take() {
            handle.abort();
        }
        let peripheral = self.link.peripheral.lock().unwrap().take();
        if let Some(peripheral) = peripheral {
            for uuid in NOTIFY_CHARACTERISTICS {
                if let Some(characteristic) = find_characteristic(&peripheral, uuid) {
                    let _ = timeout(
                        Duration::from_millis(GATT_OPERATION_TIMEOUT_MS),
                        self.queue.with_lock(peripheral.unsubscribe(&characteristic)),
                    )
                    .await;
                }
            }
            match timeout(
                Duration::from_millis(GATT_OPERATION_TIMEOUT_MS),
                self.queue.with_lock(peripheral.disconnect()),
            )
            .await
            {
                Ok(Err(e)) => warn!("disconnect failed: {}", e),
                Err(_) => warn!("disconnect timed out"),
                Ok(Ok(())) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn send_workout_command(&self, command: WorkoutCommand) -> Result<(), CommandError> {
        let peripheral = self
            .current_peripheral()
            .ok_or(CommandError::NotConnected)?;
        let tx_characteristic = find_characteristic(&peripheral, TX_CHARACTERISTIC_UUID)
            .ok_or(CommandError::MissingTx)?;
        let frames = match command {
            WorkoutCommand::Start(config) => start_sequence(&config),
            WorkoutCommand::Stop => vec![encode_stop()],
        };
        for frame in frames {
            debug!("TX {}", buf_to_hex(&frame));
            self.write_frame(&peripheral, &tx_characteristic, &frame)
                .await?;
            // CONFIG can trip hardware faults; surface them right away
            // through the regular diagnostic path.
            if frame[0] == OPCODE_CONFIG {
                self.surface_config_faults(&peripheral).await;
            }
        }
        Ok(())
    }

    async fn stop_monitor_polling_only(&self) {
        self.engine.lock().await.stop_monitor_only();
    }

    async fn restart_monitor_polling(&self) -> Result<(), CommandError> {
        let peripheral = self.require_peripheral("restart_monitor_polling")?;
        self.engine
            .lock()
            .await
            .start_monitor_polling(&peripheral, false);
        Ok(())
    }

    async fn restart_diagnostic_polling(&self) -> Result<(), CommandError> {
        let peripheral = self.require_peripheral("restart_diagnostic_polling")?;
        self.engine
            .lock()
            .await
            .restart_diagnostic_and_heartbeat(&peripheral);
        Ok(())
    }

    async fn start_active_workout_polling(&self) -> Result<(), CommandError> {
        let peripheral = self.require_peripheral("start_active_workout_polling")?;
        self.engine.lock().await.restart_all(&peripheral);
        Ok(())
    }

    async fn start_auto_start_monitoring(&self) -> Result<(), CommandError> {
        let peripheral = self.require_peripheral("start_auto_start_monitoring")?;
        self.engine
            .lock()
            .await
            .start_monitor_polling(&peripheral, true);
        Ok(())
    }
}

/// Subscribes the notification characteristics and (re)spawns the
/// dispatcher, then publishes the peripheral as the active session.
async fn wire_session<P: Peripheral + 'static>(
    peripheral: &P,
    queue: &BleOperationQueue,
    link: &SharedLink<P>,
    senders: &NotificationSenders,
) -> Result<(), ConnectError> {
    for uuid in NOTIFY_CHARACTERISTICS {
        let Some(characteristic) = find_characteristic(peripheral, uuid) else {
            // Variant difference; the stream stays silent and any real use
            // fails at operation time.
            warn!("characteristic {} missing on this device", uuid);
            continue;
        };
        timeout(
            Duration::from_millis(GATT_OPERATION_TIMEOUT_MS),
            queue.with_lock(peripheral.subscribe(&characteristic)),
        )
        .await
        .map_err(|_| ConnectError::Subscribe {
            uuid,
            source: btleplug::Error::TimedOut(Duration::from_millis(GATT_OPERATION_TIMEOUT_MS)),
        })?
        .map_err(|e| ConnectError::Subscribe { uuid, source: e })?;
    }
    let dispatcher = start_notification_dispatcher(peripheral, senders.clone())
        .await
        .map_err(ConnectError::Ble)?;
    if let Some(old) = link.notif_handle.lock().unwrap().replace(dispatcher) {
        old.abort();
    }
    *link.peripheral.lock().unwrap() = Some(peripheral.clone());
    Ok(())
}

async fn start_notification_dispatcher<P: Peripheral>(
    peripheral: &P,
    senders: NotificationSenders,
) -> btleplug::Result<JoinHandle<anyhow::Result<()>>> {
    let mut notifications = peripheral.notifications().await?;
    Ok(tokio::spawn(async move {
        while let Some(notification) = notifications.next().await {
            dispatch_notification(notification, &senders);
        }
        warn!("notification stream ended");
        Err(anyhow!("notification stream ended"))
    }))
}

fn dispatch_notification(notification: ValueNotification, senders: &NotificationSenders) {
    let ts = now_ms();
    match notification.uuid {
        REPS_CHARACTERISTIC_UUID => match parse_rep_packet(&notification.value, false, ts) {
            Some(packet) => {
                trace!("rep notification {}", buf_to_hex(&notification.value));
                let _ = senders.rep_tx.send(packet);
            }
            None => trace!(
                "undersized rep notification {}",
                buf_to_hex(&notification.value)
            ),
        },
        VERSION_CHARACTERISTIC_UUID => {
            if let Some(version) = parse_version_info(&notification.value) {
                info!("firmware version {}", version);
                let _ = senders.version_tx.send(version);
            }
        }
        MODE_CHARACTERISTIC_UUID => {
            if let Some(mode) = parse_mode_change(&notification.value, ts) {
                let _ = senders.mode_tx.send(mode);
            }
        }
        RX_CHARACTERISTIC_UUID => {
            if let Some(response) = parse_rx_metrics_response(&notification.value) {
                debug!(
                    "RX response opcode {:02X}: {:?}",
                    response.opcode, response.values
                );
            }
        }
        other => trace!(
            "unhandled notification from {}: {}",
            other,
            buf_to_hex(&notification.value)
        ),
    }
}

/// Reconnect supervisor. Runs on its own scope so the monitor task that
/// signalled the loss is never asked to cancel itself.
async fn supervise<P: Peripheral + 'static>(
    mut loss_rx: mpsc::Receiver<ConnectionLossReason>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    engine: Arc<Mutex<MetricPollingEngine>>,
    link: Arc<SharedLink<P>>,
    queue: Arc<BleOperationQueue>,
    senders: NotificationSenders,
) {
    while let Some(reason) = loss_rx.recv().await {
        let Some(peripheral) = link.peripheral.lock().unwrap().clone() else {
            continue;
        };
        if reason == ConnectionLossReason::PeerDisconnected
            && peripheral.is_connected().await.unwrap_or(false)
        {
            debug!("ignoring disconnect event, session link still up");
            continue;
        }
        warn!("connection lost ({:?}), attempting to re-establish", reason);
        let session_state = state_tx.borrow().clone();
        engine.lock().await.stop_all();
        state_tx.send_replace(ConnectionState::Reconnecting);
        match re_establish(&peripheral, &queue, &link, &senders).await {
            Ok(()) => {
                engine.lock().await.restart_all(&peripheral);
                state_tx.send_replace(session_state);
                info!("session link re-established");
            }
            Err(e) => {
                warn!("reconnect failed: {}", e);
                link.peripheral.lock().unwrap().take();
                state_tx.send_replace(ConnectionState::Error {
                    message: "connection lost".into(),
                    cause: Some(e.to_string()),
                });
            }
        }
        // Coalesce loss signals that piled up while recovering.
        while loss_rx.try_recv().is_ok() {}
    }
}

async fn re_establish<P: Peripheral + 'static>(
    peripheral: &P,
    queue: &BleOperationQueue,
    link: &SharedLink<P>,
    senders: &NotificationSenders,
) -> Result<(), ConnectError> {
    timeout(
        Duration::from_millis(CONNECT_TIMEOUT_MS),
        queue.with_lock(peripheral.connect()),
    )
    .await
    .map_err(|_| {
        ConnectError::Ble(btleplug::Error::TimedOut(Duration::from_millis(
            CONNECT_TIMEOUT_MS,
        )))
    })??;
    peripheral
        .discover_services()
        .await
        .map_err(ConnectError::ServiceDiscovery)?;
    wire_session(peripheral, queue, link, senders).await
}
