//! Metric Polling Engine
//!
//! The concurrency core: four independent tasks (monitor, diagnostic,
//! heuristic, heartbeat) over one peripheral, plus the consecutive-timeout
//! disconnect signal. The engine never stores the peripheral; each task
//! owns a clone for its own lifetime and every GATT call goes through the
//! operation queue. Stopping the monitor task leaves the other three
//! untouched so the link stays warm during bodyweight exercises.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use btleplug::api::{Characteristic, Peripheral, WriteType};
use log::{error, trace, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

use crate::core::clock::now_ms;
use crate::core::constants::{
    DIAGNOSTIC_CHARACTERISTIC_UUID, DIAGNOSTIC_POLL_INTERVAL_MS, GATT_OPERATION_TIMEOUT_MS,
    HEARTBEAT_INTERVAL_MS, HEURISTIC_CHARACTERISTIC_UUID, HEURISTIC_POLL_INTERVAL_MS,
    MAX_CONSECUTIVE_TIMEOUTS, METRIC_DROP_WARN_INTERVAL_MS, MONITOR_CHARACTERISTIC_UUID,
    MONITOR_POLL_INTERVAL_MS, MONITOR_READ_TIMEOUT_MS, TX_CHARACTERISTIC_UUID,
};
use crate::model::commands::encode_heartbeat;
use crate::model::handle::HandleStateDetector;
use crate::model::monitor::MonitorDataProcessor;
use crate::model::packets::{DiagnosticPacket, HeuristicPacket, WorkoutMetric};
use crate::model::parser::{
    buf_to_hex, parse_diagnostic_packet, parse_heuristic_packet, parse_monitor_packet,
};
use crate::controller::queue::BleOperationQueue;

/// Result sinks supplied by the facade at construction.
#[derive(Clone)]
pub struct PollingCallbacks {
    /// Receives every emitted metric. Returns false when the consumer side
    /// is saturated; the engine rate-limits a warning in that case.
    pub on_metric_emit: Arc<dyn Fn(WorkoutMetric) -> bool + Send + Sync>,
    pub on_heuristic_data: Arc<dyn Fn(HeuristicPacket) + Send + Sync>,
    /// Fired when the fault snapshot changes between diagnostic polls.
    pub on_diagnostic_data: Arc<dyn Fn(DiagnosticPacket) + Send + Sync>,
    /// Fired once when the monitor task hits the consecutive-timeout
    /// ceiling. The receiver must launch the disconnect on its own scope;
    /// the signalling task is never cancelled from inside itself.
    pub on_connection_lost: Arc<dyn Fn() + Send + Sync>,
}

/// Outcome of one paced monitor read.
enum MonitorReadOutcome {
    Data(Vec<u8>),
    Empty,
    Timeout,
    Error,
}

/// Updates the consecutive-timeout counter for one read outcome. Returns
/// true when the ceiling has been reached and the loss signal must fire.
fn note_read_outcome(counter: &AtomicU32, outcome: &MonitorReadOutcome) -> bool {
    match outcome {
        MonitorReadOutcome::Data(_) => {
            counter.store(0, Ordering::SeqCst);
            false
        }
        _ => counter.fetch_add(1, Ordering::SeqCst) + 1 >= MAX_CONSECUTIVE_TIMEOUTS,
    }
}

/// Looks a characteristic up on a discovered peripheral.
pub(crate) fn find_characteristic<P: Peripheral>(
    peripheral: &P,
    uuid: Uuid,
) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
}

pub struct MetricPollingEngine {
    queue: Arc<BleOperationQueue>,
    processor: Arc<Mutex<MonitorDataProcessor>>,
    detector: Arc<Mutex<HandleStateDetector>>,
    callbacks: PollingCallbacks,
    monitor_handle: Option<JoinHandle<()>>,
    diagnostic_handle: Option<JoinHandle<()>>,
    heuristic_handle: Option<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
    /// Held by exactly the running monitor task. A restarted monitor task
    /// waits here until its cancelled predecessor has let go.
    monitor_poll_lock: Arc<Mutex<()>>,
    consecutive_timeouts: Arc<AtomicU32>,
    diagnostic_poll_count: Arc<AtomicU64>,
    last_logged_faults: Arc<StdMutex<Option<[i16; 4]>>>,
}

impl Drop for MetricPollingEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl MetricPollingEngine {
    pub fn new(
        queue: Arc<BleOperationQueue>,
        processor: Arc<Mutex<MonitorDataProcessor>>,
        detector: Arc<Mutex<HandleStateDetector>>,
        callbacks: PollingCallbacks,
    ) -> Self {
        Self {
            queue,
            processor,
            detector,
            callbacks,
            monitor_handle: None,
            diagnostic_handle: None,
            heuristic_handle: None,
            heartbeat_handle: None,
            monitor_poll_lock: Arc::new(Mutex::new(())),
            consecutive_timeouts: Arc::new(AtomicU32::new(0)),
            diagnostic_poll_count: Arc::new(AtomicU64::new(0)),
            last_logged_faults: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn processor(&self) -> Arc<Mutex<MonitorDataProcessor>> {
        self.processor.clone()
    }

    pub fn detector(&self) -> Arc<Mutex<HandleStateDetector>> {
        self.detector.clone()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::SeqCst)
    }

    pub fn diagnostic_poll_count(&self) -> u64 {
        self.diagnostic_poll_count.load(Ordering::SeqCst)
    }

    pub fn monitor_active(&self) -> bool {
        is_active(&self.monitor_handle)
    }

    pub fn diagnostic_active(&self) -> bool {
        is_active(&self.diagnostic_handle)
    }

    pub fn heuristic_active(&self) -> bool {
        is_active(&self.heuristic_handle)
    }

    pub fn heartbeat_active(&self) -> bool {
        is_active(&self.heartbeat_handle)
    }

    /// Starts all four polling tasks.
    pub fn start_all<P: Peripheral + 'static>(&mut self, peripheral: &P) {
        self.start_monitor_polling(peripheral, false);
        self.start_diagnostic_polling(peripheral);
        self.start_heuristic_polling(peripheral);
        self.start_heartbeat(peripheral);
    }

    /// Starts (or restarts) the monitor loop. A still-running predecessor
    /// is cancelled first; the new task then waits on the monitor-polling
    /// mutex until the predecessor's lock is released. There is no
    /// try-lock short-circuit: dropping a legitimate restart because the
    /// old task had not yet unwound loses the session.
    pub fn start_monitor_polling<P: Peripheral + 'static>(
        &mut self,
        peripheral: &P,
        for_auto_start: bool,
    ) {
        if let Some(handle) = self.monitor_handle.take() {
            handle.abort();
        }
        self.monitor_handle = Some(tokio::spawn(run_monitor_loop(
            peripheral.clone(),
            for_auto_start,
            self.queue.clone(),
            self.processor.clone(),
            self.detector.clone(),
            self.callbacks.clone(),
            self.monitor_poll_lock.clone(),
            self.consecutive_timeouts.clone(),
        )));
    }

    pub fn start_diagnostic_polling<P: Peripheral + 'static>(&mut self, peripheral: &P) {
        if let Some(handle) = self.diagnostic_handle.take() {
            handle.abort();
        }
        self.diagnostic_handle = Some(tokio::spawn(run_diagnostic_loop(
            peripheral.clone(),
            self.queue.clone(),
            self.callbacks.clone(),
            self.diagnostic_poll_count.clone(),
            self.last_logged_faults.clone(),
        )));
    }

    pub fn start_heuristic_polling<P: Peripheral + 'static>(&mut self, peripheral: &P) {
        if let Some(handle) = self.heuristic_handle.take() {
            handle.abort();
        }
        self.heuristic_handle = Some(tokio::spawn(run_heuristic_loop(
            peripheral.clone(),
            self.queue.clone(),
            self.callbacks.clone(),
        )));
    }

    pub fn start_heartbeat<P: Peripheral + 'static>(&mut self, peripheral: &P) {
        if let Some(handle) = self.heartbeat_handle.take() {
            handle.abort();
        }
        self.heartbeat_handle = Some(tokio::spawn(run_heartbeat_loop(
            peripheral.clone(),
            self.queue.clone(),
        )));
    }

    /// Cancels and clears all four tasks and resets the diagnostic
    /// counters. The tasks own the only peripheral clones, so cancelling
    /// them also releases the peripheral.
    pub fn stop_all(&mut self) {
        for handle in [
            self.monitor_handle.take(),
            self.diagnostic_handle.take(),
            self.heuristic_handle.take(),
            self.heartbeat_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        self.consecutive_timeouts.store(0, Ordering::SeqCst);
        self.diagnostic_poll_count.store(0, Ordering::SeqCst);
        *self.last_logged_faults.lock().unwrap() = None;
    }

    /// Cancels only the monitor task. Diagnostic, heuristic and heartbeat
    /// stay active so the GATT link keeps its traffic during exercises
    /// with no cable load.
    pub fn stop_monitor_only(&mut self) {
        if let Some(handle) = self.monitor_handle.take() {
            handle.abort();
        }
    }

    /// Restarts diagnostic and heartbeat, each only if not currently
    /// active.
    pub fn restart_diagnostic_and_heartbeat<P: Peripheral + 'static>(&mut self, peripheral: &P) {
        if !self.diagnostic_active() {
            self.start_diagnostic_polling(peripheral);
        }
        if !self.heartbeat_active() {
            self.start_heartbeat(peripheral);
        }
    }

    /// Restarts the monitor unconditionally and the remaining tasks only
    /// where their predecessor is no longer active. Never produces two
    /// live tasks of the same kind.
    pub fn restart_all<P: Peripheral + 'static>(&mut self, peripheral: &P) {
        self.start_monitor_polling(peripheral, false);
        if !self.diagnostic_active() {
            self.start_diagnostic_polling(peripheral);
        }
        if !self.heuristic_active() {
            self.start_heuristic_polling(peripheral);
        }
        if !self.heartbeat_active() {
            self.start_heartbeat(peripheral);
        }
    }

    /// Installs a never-ending placeholder task, so lifecycle invariants
    /// can be exercised without any BLE I/O.
    #[cfg(test)]
    pub(crate) fn install_idle_task(&mut self, kind: TaskKind) {
        let handle = tokio::spawn(std::future::pending());
        match kind {
            TaskKind::Monitor => self.monitor_handle = Some(handle),
            TaskKind::Diagnostic => self.diagnostic_handle = Some(handle),
            TaskKind::Heuristic => self.heuristic_handle = Some(handle),
            TaskKind::Heartbeat => self.heartbeat_handle = Some(handle),
        }
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub(crate) enum TaskKind {
    Monitor,
    Diagnostic,
    Heuristic,
    Heartbeat,
}

fn is_active(handle: &Option<JoinHandle<()>>) -> bool {
    handle.as_ref().is_some_and(|h| !h.is_finished())
}

#[allow(clippy::too_many_arguments)]
async fn run_monitor_loop<P: Peripheral>(
    peripheral: P,
    for_auto_start: bool,
    queue: Arc<BleOperationQueue>,
    processor: Arc<Mutex<MonitorDataProcessor>>,
    detector: Arc<Mutex<HandleStateDetector>>,
    callbacks: PollingCallbacks,
    monitor_poll_lock: Arc<Mutex<()>>,
    consecutive_timeouts: Arc<AtomicU32>,
) {
    let _poll_guard = monitor_poll_lock.lock().await;
    if for_auto_start {
        detector.lock().await.enable_just_lift_waiting();
    }
    processor.lock().await.reset_for_new_session();
    let characteristic = match find_characteristic(&peripheral, MONITOR_CHARACTERISTIC_UUID) {
        Some(c) => c,
        None => {
            error!("monitor characteristic missing, monitor polling not started");
            return;
        }
    };
    consecutive_timeouts.store(0, Ordering::SeqCst);
    let mut last_drop_warn_ms = 0u64;

    loop {
        sleep(Duration::from_millis(MONITOR_POLL_INTERVAL_MS)).await;
        let outcome = match timeout(
            Duration::from_millis(MONITOR_READ_TIMEOUT_MS),
            queue.with_lock(peripheral.read(&characteristic)),
        )
        .await
        {
            Err(_) => MonitorReadOutcome::Timeout,
            Ok(Err(e)) => {
                warn!("monitor read failed: {}", e);
                MonitorReadOutcome::Error
            }
            Ok(Ok(bytes)) if bytes.is_empty() => MonitorReadOutcome::Empty,
            Ok(Ok(bytes)) => MonitorReadOutcome::Data(bytes),
        };
        if note_read_outcome(&consecutive_timeouts, &outcome) {
            warn!(
                "{} consecutive monitor read failures, signalling connection loss",
                MAX_CONSECUTIVE_TIMEOUTS
            );
            (callbacks.on_connection_lost)();
            return;
        }
        let MonitorReadOutcome::Data(bytes) = outcome else {
            continue;
        };
        let ts = now_ms();
        let Some(packet) = parse_monitor_packet(&bytes) else {
            trace!("undersized monitor packet: {}", buf_to_hex(&bytes));
            continue;
        };
        let metric = processor.lock().await.process(&packet, ts);
        if let Some(metric) = metric {
            detector.lock().await.process_metric(&metric);
            if !(callbacks.on_metric_emit)(metric)
                && ts.saturating_sub(last_drop_warn_ms) >= METRIC_DROP_WARN_INTERVAL_MS
            {
                last_drop_warn_ms = ts;
                warn!("metric stream saturated, samples are being dropped");
            }
        }
    }
}

async fn run_diagnostic_loop<P: Peripheral>(
    peripheral: P,
    queue: Arc<BleOperationQueue>,
    callbacks: PollingCallbacks,
    poll_count: Arc<AtomicU64>,
    last_logged_faults: Arc<StdMutex<Option<[i16; 4]>>>,
) {
    let characteristic = match find_characteristic(&peripheral, DIAGNOSTIC_CHARACTERISTIC_UUID) {
        Some(c) => c,
        None => {
            error!("diagnostic characteristic missing, diagnostic polling not started");
            return;
        }
    };
    loop {
        let result = timeout(
            Duration::from_millis(GATT_OPERATION_TIMEOUT_MS),
            queue.with_lock(peripheral.read(&characteristic)),
        )
        .await;
        poll_count.fetch_add(1, Ordering::SeqCst);
        match result {
            Ok(Ok(bytes)) => {
                if let Some(packet) = parse_diagnostic_packet(&bytes) {
                    handle_diagnostic_packet(packet, &callbacks, &last_logged_faults);
                } else {
                    trace!("undersized diagnostic packet: {}", buf_to_hex(&bytes));
                }
            }
            Ok(Err(e)) => warn!("diagnostic read failed: {}", e),
            Err(_) => warn!("diagnostic read timed out"),
        }
        sleep(Duration::from_millis(DIAGNOSTIC_POLL_INTERVAL_MS)).await;
    }
}

/// Deduplicates against the last logged fault snapshot; only a changed
/// snapshot is logged and forwarded.
fn handle_diagnostic_packet(
    packet: DiagnosticPacket,
    callbacks: &PollingCallbacks,
    last_logged_faults: &StdMutex<Option<[i16; 4]>>,
) {
    let changed = {
        let mut last = last_logged_faults.lock().unwrap();
        last.replace(packet.faults) != Some(packet.faults)
    };
    if !changed {
        return;
    }
    if packet.has_faults {
        warn!(
            "device faults {:?}, temps {:?}, uptime {}s",
            packet.faults, packet.temps, packet.seconds
        );
    } else {
        trace!("device faults cleared, uptime {}s", packet.seconds);
    }
    (callbacks.on_diagnostic_data)(packet);
}

async fn run_heuristic_loop<P: Peripheral>(
    peripheral: P,
    queue: Arc<BleOperationQueue>,
    callbacks: PollingCallbacks,
) {
    let characteristic = match find_characteristic(&peripheral, HEURISTIC_CHARACTERISTIC_UUID) {
        Some(c) => c,
        None => {
            error!("heuristic characteristic missing, heuristic polling not started");
            return;
        }
    };
    loop {
        match timeout(
            Duration::from_millis(GATT_OPERATION_TIMEOUT_MS),
            queue.with_lock(peripheral.read(&characteristic)),
        )
        .await
        {
            Ok(Ok(bytes)) => {
                // Parse failures drop the sample and keep polling.
                if let Some(packet) = parse_heuristic_packet(&bytes, now_ms()) {
                    (callbacks.on_heuristic_data)(packet);
                }
            }
            Ok(Err(e)) => warn!("heuristic read failed: {}", e),
            Err(_) => warn!("heuristic read timed out"),
        }
        sleep(Duration::from_millis(HEURISTIC_POLL_INTERVAL_MS)).await;
    }
}

async fn run_heartbeat_loop<P: Peripheral>(peripheral: P, queue: Arc<BleOperationQueue>) {
    let characteristic = match find_characteristic(&peripheral, TX_CHARACTERISTIC_UUID) {
        Some(c) => c,
        None => {
            error!("TX characteristic missing, heartbeat not started");
            return;
        }
    };
    let frame = encode_heartbeat();
    loop {
        sleep(Duration::from_millis(HEARTBEAT_INTERVAL_MS)).await;
        // Without-response writes silently fail on some hardware variants.
        let result = timeout(
            Duration::from_millis(GATT_OPERATION_TIMEOUT_MS),
            queue.with_lock(peripheral.write(&characteristic, &frame, WriteType::WithResponse)),
        )
        .await;
        match result {
            Ok(Ok(())) => trace!("heartbeat"),
            Ok(Err(e)) => warn!("heartbeat write failed: {}", e),
            Err(_) => warn!("heartbeat write timed out"),
        }
    }
}
