//! Protocol Constants
//!
//! Every UUID, opcode, threshold and interval used by the engine lives here.
//! The characteristic UUIDs are fixed by the trainer firmware and must be
//! preserved bit-exactly.

use uuid::{uuid, Uuid};

// --- GATT profile (Nordic UART style custom service) ---

/// UUID of the custom UART service exposed by the trainer.
pub const UART_SERVICE_UUID: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");
/// TX characteristic (client to device). Carries workout commands.
pub const TX_CHARACTERISTIC_UUID: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");
/// RX characteristic (device to client). One-shot command responses, big-endian.
pub const RX_CHARACTERISTIC_UUID: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");
/// Polled monitor characteristic: position, load, velocity, status.
pub const MONITOR_CHARACTERISTIC_UUID: Uuid = uuid!("90e991a6-c548-44ed-969b-eb541014eae3");
/// Rep counter notifications.
pub const REPS_CHARACTERISTIC_UUID: Uuid = uuid!("8308f2a6-0875-4a94-a86f-5c5c5e1b068a");
/// Polled diagnostic characteristic: faults, temperatures, uptime.
pub const DIAGNOSTIC_CHARACTERISTIC_UUID: Uuid = uuid!("5fa538ec-d041-42f6-bbd6-c30d475387b7");
/// Polled heuristic characteristic: per-phase workout statistics.
pub const HEURISTIC_CHARACTERISTIC_UUID: Uuid = uuid!("c7b73007-b245-4503-a1ed-9e4e97eb9802");
/// Firmware version notifications.
pub const VERSION_CHARACTERISTIC_UUID: Uuid = uuid!("74e994ac-0e80-4c02-9cd0-76cb31d3959b");
/// Mode-change echo notifications.
pub const MODE_CHARACTERISTIC_UUID: Uuid = uuid!("67d0dae0-5bfc-4ea2-acc9-ac784dee7f29");

// OTA update characteristics are reserved by the firmware but not driven by
// this client.

/// Advertised name prefix of the first hardware variant.
pub const DEVICE_NAME_PREFIX_VEE: &str = "Vee_";
/// Advertised name prefix of the second hardware variant.
pub const DEVICE_NAME_PREFIX_VIT: &str = "VIT";

// --- TX opcodes ---

/// No-op heartbeat frame, keeps the GATT link active.
pub const OPCODE_HEARTBEAT: u8 = 0x00;
/// Arms the cable load. Never sent for bodyweight exercises.
pub const OPCODE_INIT: u8 = 0x02;
/// Starts the configured workout.
pub const OPCODE_START: u8 = 0x03;
/// Configures the training mode and per-cable weights.
pub const OPCODE_CONFIG: u8 = 0x04;
/// Stops the running workout.
pub const OPCODE_STOP: u8 = 0x05;

/// Warmup rep count forced into every cable CONFIG frame.
pub const CABLE_WARMUP_REPS: u8 = 3;

// --- Monitor status flag bits ---

/// The machine released force on its own.
pub const STATUS_DELOAD_OCCURRED: u16 = 0x0001;
/// The user moved above the calibrated range of motion.
pub const STATUS_ROM_OUTSIDE_HIGH: u16 = 0x0002;
/// The user moved below the calibrated range of motion.
pub const STATUS_ROM_OUTSIDE_LOW: u16 = 0x0004;

// --- Monitor sample validation ---

/// Lowest plausible cable position in millimeters.
pub const MIN_POSITION_MM: f32 = -100.0;
/// Highest plausible cable position in millimeters.
pub const MAX_POSITION_MM: f32 = 2500.0;
/// Upper load boundary in kilograms. Some variants may accept more.
pub const MAX_WEIGHT_KG: f32 = 220.0;
/// Per-sample position delta above which a reading is treated as a spike.
pub const POSITION_JUMP_THRESHOLD_MM: f32 = 20.0;
/// Smoothing coefficient of the firmware-velocity moving average.
pub const VELOCITY_EMA_ALPHA: f32 = 0.3;
/// Firmware velocity is reported as signed tenths of mm/s.
pub const FIRMWARE_VELOCITY_SCALE: f32 = 10.0;
/// Minimum spacing between two deload callbacks.
pub const DELOAD_EVENT_DEBOUNCE_MS: u64 = 2000;

// --- Handle state detection ---

/// Position under which a handle counts as resting.
pub const HANDLE_REST_THRESHOLD_MM: f32 = 5.0;
/// Absolute position above which a handle might be grabbed.
pub const HANDLE_GRABBED_THRESHOLD_MM: f32 = 8.0;
/// Baseline-relative delta required for a grab decision.
pub const GRAB_DELTA_THRESHOLD_MM: f32 = 10.0;
/// Baseline-relative delta under which a release becomes possible.
pub const RELEASE_DELTA_THRESHOLD_MM: f32 = 5.0;
/// Velocity needed to confirm a grab in normal mode.
pub const VELOCITY_THRESHOLD_MM_S: f32 = 50.0;
/// Relaxed grab velocity while auto-starting.
pub const AUTO_START_VELOCITY_THRESHOLD_MM_S: f32 = 20.0;
/// A transition condition must hold this long before the transition fires.
pub const STATE_TRANSITION_DWELL_MS: u64 = 200;
/// Pre-session timeout after which a virtual baseline is captured.
pub const WAITING_FOR_REST_TIMEOUT_MS: u64 = 3000;
/// Simple per-side handle presence threshold.
pub const PRESENCE_THRESHOLD_MM: f32 = 50.0;

// --- Polling engine ---

/// Monitor poll pacing (20 Hz).
pub const MONITOR_POLL_INTERVAL_MS: u64 = 50;
/// Per-read deadline of a single monitor poll.
pub const MONITOR_READ_TIMEOUT_MS: u64 = 250;
/// Consecutive failed monitor reads before the link counts as lost.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 5;
/// Diagnostic poll pacing (1 Hz).
pub const DIAGNOSTIC_POLL_INTERVAL_MS: u64 = 1000;
/// Heuristic poll pacing (4 Hz).
pub const HEURISTIC_POLL_INTERVAL_MS: u64 = 250;
/// Heartbeat write pacing.
pub const HEARTBEAT_INTERVAL_MS: u64 = 2000;
/// Per-operation deadline for non-monitor GATT calls.
pub const GATT_OPERATION_TIMEOUT_MS: u64 = 2000;
/// Deadline for establishing the GATT connection itself.
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
/// MTU requested after connecting. Falling back to the platform default is
/// not an error.
pub const TARGET_MTU: u16 = 247;
/// Scan list refresh pacing while scanning.
pub const SCAN_REFRESH_INTERVAL_MS: u64 = 1000;

// --- Published streams ---

/// Ring capacity of the high-rate metrics stream.
pub const METRIC_CHANNEL_CAPACITY: usize = 64;
/// Capacity of the low-rate event streams.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;
/// Minimum spacing of the "metrics bus saturated" warning.
pub const METRIC_DROP_WARN_INTERVAL_MS: u64 = 5000;
