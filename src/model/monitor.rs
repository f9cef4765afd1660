//! Monitor Data Processor
//!
//! Per-sample validation, filtering and enrichment of monitor packets into
//! [`WorkoutMetric`]s. The pipeline order is fixed: range fallback, load
//! validation, position jump filter, velocity smoothing, status dispatch,
//! emission. A sample rejected by the jump filter must still update the
//! jump reference, so a single spike followed by identical real readings
//! recovers on the next sample instead of cascading into permanent
//! rejection.

use log::{debug, trace};

use crate::core::constants::{
    DELOAD_EVENT_DEBOUNCE_MS, FIRMWARE_VELOCITY_SCALE, MAX_POSITION_MM, MAX_WEIGHT_KG,
    MIN_POSITION_MM, POSITION_JUMP_THRESHOLD_MM, VELOCITY_EMA_ALPHA,
};
use crate::core::events::RomViolation;
use crate::model::packets::{MonitorPacket, WorkoutMetric};

/// Histogram of inter-sample spacing, for poll-rate diagnostics.
///
/// Buckets: <25 ms, <50 ms, <75 ms, <100 ms, <150 ms, and slower.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollRateStats {
    buckets: [u32; 6],
}

impl PollRateStats {
    const BOUNDS_MS: [u64; 5] = [25, 50, 75, 100, 150];

    fn record(&mut self, delta_ms: u64) {
        let idx = Self::BOUNDS_MS
            .iter()
            .position(|bound| delta_ms < *bound)
            .unwrap_or(Self::BOUNDS_MS.len());
        self.buckets[idx] += 1;
    }

    pub fn buckets(&self) -> &[u32; 6] {
        &self.buckets
    }

    pub fn total(&self) -> u32 {
        self.buckets.iter().sum()
    }
}

type DeloadCallback = Box<dyn Fn() + Send + Sync>;
type RomViolationCallback = Box<dyn Fn(RomViolation) + Send + Sync>;

/// Stateful per-session sample processor. Touched only by the monitor task.
#[derive(Default)]
pub struct MonitorDataProcessor {
    strict_validation: bool,
    /// Jump-filter reference. Cleared per session.
    last_pos_a: Option<f32>,
    last_pos_b: Option<f32>,
    /// Range-fallback values. Survive session resets so a new session that
    /// opens with an out-of-range blip still has a substitute.
    last_good_pos_a: Option<f32>,
    last_good_pos_b: Option<f32>,
    vel_ema_a: Option<f32>,
    vel_ema_b: Option<f32>,
    last_sample_ms: Option<u64>,
    last_deload_ms: Option<u64>,
    notification_count: u64,
    poll_rate: PollRateStats,
    on_deload: Option<DeloadCallback>,
    on_rom_violation: Option<RomViolationCallback>,
}

impl MonitorDataProcessor {
    pub fn new() -> Self {
        Self {
            strict_validation: true,
            ..Default::default()
        }
    }

    /// Toggles load rejection and the position jump filter. Position
    /// fallback and reference tracking stay active either way.
    pub fn set_strict_validation(&mut self, enabled: bool) {
        self.strict_validation = enabled;
    }

    pub fn strict_validation_enabled(&self) -> bool {
        self.strict_validation
    }

    /// Count of metrics emitted this session. Monotonically non-decreasing
    /// between resets.
    pub fn notification_count(&self) -> u64 {
        self.notification_count
    }

    pub fn poll_rate_stats(&self) -> &PollRateStats {
        &self.poll_rate
    }

    pub fn set_deload_callback(&mut self, callback: DeloadCallback) {
        self.on_deload = Some(callback);
    }

    pub fn set_rom_violation_callback(&mut self, callback: RomViolationCallback) {
        self.on_rom_violation = Some(callback);
    }

    /// Clears all per-session tracking. The last-good positions are kept.
    pub fn reset_for_new_session(&mut self) {
        self.last_pos_a = None;
        self.last_pos_b = None;
        self.vel_ema_a = None;
        self.vel_ema_b = None;
        self.last_sample_ms = None;
        self.last_deload_ms = None;
        self.notification_count = 0;
        self.poll_rate = PollRateStats::default();
    }

    /// Runs one packet through the validation pipeline. Returns the
    /// enriched metric, or `None` for a rejected sample.
    pub fn process(&mut self, packet: &MonitorPacket, timestamp_ms: u64) -> Option<WorkoutMetric> {
        // Implausible loads invalidate the whole sample.
        if self.strict_validation && !(loads_plausible(packet)) {
            debug!(
                "rejecting sample, implausible load a={} b={}",
                packet.load_a, packet.load_b
            );
            return None;
        }

        // Out-of-range positions fall back to the last good reading. A
        // first sample with no fallback yet passes through unchanged.
        let pos_a = resolve_position(packet.pos_a, self.last_good_pos_a);
        let pos_b = resolve_position(packet.pos_b, self.last_good_pos_b);

        // Jump filter. The reference is updated even for the rejected
        // reading so that an identical follow-up sample passes.
        if self.strict_validation {
            if let (Some(last_a), Some(last_b)) = (self.last_pos_a, self.last_pos_b) {
                let jump_a = (pos_a - last_a).abs() > POSITION_JUMP_THRESHOLD_MM;
                let jump_b = (pos_b - last_b).abs() > POSITION_JUMP_THRESHOLD_MM;
                if jump_a || jump_b {
                    trace!(
                        "position spike a: {} -> {}, b: {} -> {}",
                        last_a,
                        pos_a,
                        last_b,
                        pos_b
                    );
                    self.last_pos_a = Some(pos_a);
                    self.last_pos_b = Some(pos_b);
                    return None;
                }
            }
        }
        self.last_pos_a = Some(pos_a);
        self.last_pos_b = Some(pos_b);
        if position_in_range(packet.pos_a) {
            self.last_good_pos_a = Some(packet.pos_a);
        }
        if position_in_range(packet.pos_b) {
            self.last_good_pos_b = Some(packet.pos_b);
        }

        // Velocity: EMA over the firmware-reported value, seeded with the
        // raw reading so there is no cold-start lag toward zero. Samples
        // the jump filter dropped never reach this point and so cannot
        // contaminate the smoothing state.
        let vel_a = smooth(&mut self.vel_ema_a, packet.vel_a_raw as f32 / FIRMWARE_VELOCITY_SCALE);
        let vel_b = smooth(&mut self.vel_ema_b, packet.vel_b_raw as f32 / FIRMWARE_VELOCITY_SCALE);

        self.dispatch_status_flags(packet, timestamp_ms);

        if let Some(last) = self.last_sample_ms {
            self.poll_rate.record(timestamp_ms.saturating_sub(last));
        }
        self.last_sample_ms = Some(timestamp_ms);
        self.notification_count += 1;

        Some(WorkoutMetric {
            timestamp_ms,
            pos_a,
            pos_b,
            vel_a,
            vel_b,
            load_a: packet.load_a,
            load_b: packet.load_b,
        })
    }

    fn dispatch_status_flags(&mut self, packet: &MonitorPacket, timestamp_ms: u64) {
        if packet.deload_occurred() {
            let due = match self.last_deload_ms {
                None => true,
                Some(last) => timestamp_ms.saturating_sub(last) >= DELOAD_EVENT_DEBOUNCE_MS,
            };
            if due {
                self.last_deload_ms = Some(timestamp_ms);
                if let Some(cb) = &self.on_deload {
                    cb();
                }
            }
        }
        if let Some(cb) = &self.on_rom_violation {
            if packet.rom_outside_high() {
                cb(RomViolation::OutsideHigh);
            }
            if packet.rom_outside_low() {
                cb(RomViolation::OutsideLow);
            }
        }
    }
}

fn loads_plausible(packet: &MonitorPacket) -> bool {
    let ok = |load: f32| (0.0..=MAX_WEIGHT_KG).contains(&load);
    ok(packet.load_a) && ok(packet.load_b)
}

fn position_in_range(pos: f32) -> bool {
    (MIN_POSITION_MM..=MAX_POSITION_MM).contains(&pos)
}

fn resolve_position(pos: f32, last_good: Option<f32>) -> f32 {
    if position_in_range(pos) {
        pos
    } else {
        last_good.unwrap_or(pos)
    }
}

fn smooth(ema: &mut Option<f32>, raw: f32) -> f32 {
    let value = match *ema {
        None => raw,
        Some(prev) => VELOCITY_EMA_ALPHA * raw + (1.0 - VELOCITY_EMA_ALPHA) * prev,
    };
    *ema = Some(value);
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn packet(pos_a: f32, pos_b: f32) -> MonitorPacket {
        MonitorPacket {
            pos_a,
            pos_b,
            load_a: 20.0,
            load_b: 20.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_sample_passes() {
        let mut proc = MonitorDataProcessor::new();
        let m = proc.process(&packet(100.0, 50.0), 1000).unwrap();
        assert_eq!(m.pos_a, 100.0);
        assert_eq!(m.pos_b, 50.0);
        assert_eq!(proc.notification_count(), 1);
    }

    #[test]
    fn test_spike_recovers_on_identical_follow_up() {
        // p, spike, spike: the middle sample is dropped, but the repeated
        // reading must pass because the reference moved to the spike value.
        let mut proc = MonitorDataProcessor::new();
        assert!(proc.process(&packet(100.0, 0.0), 1000).is_some());
        assert!(proc.process(&packet(150.0, 0.0), 1020).is_none());
        assert!(proc.process(&packet(150.0, 0.0), 1040).is_some());
    }

    #[test]
    fn test_jump_on_either_side_rejects() {
        let mut proc = MonitorDataProcessor::new();
        assert!(proc.process(&packet(100.0, 100.0), 0).is_some());
        assert!(proc.process(&packet(100.0, 160.0), 20).is_none());
        assert!(proc.process(&packet(100.0, 160.0), 40).is_some());
    }

    #[test]
    fn test_small_movement_passes() {
        let mut proc = MonitorDataProcessor::new();
        assert!(proc.process(&packet(100.0, 0.0), 0).is_some());
        assert!(proc.process(&packet(119.0, 0.0), 20).is_some());
    }

    #[test]
    fn test_implausible_load_rejects_sample() {
        let mut proc = MonitorDataProcessor::new();
        let mut p = packet(10.0, 10.0);
        p.load_a = -0.5;
        assert!(proc.process(&p, 0).is_none());
        p.load_a = 20.0;
        p.load_b = MAX_WEIGHT_KG + 1.0;
        assert!(proc.process(&p, 20).is_none());
        assert_eq!(proc.notification_count(), 0);
    }

    #[test]
    fn test_out_of_range_position_falls_back_to_last_good() {
        let mut proc = MonitorDataProcessor::new();
        assert!(proc.process(&packet(100.0, 0.0), 0).is_some());
        let m = proc.process(&packet(MAX_POSITION_MM + 500.0, 0.0), 20).unwrap();
        assert_eq!(m.pos_a, 100.0);
    }

    #[test]
    fn test_out_of_range_first_sample_passes_unclamped() {
        // No fallback recorded yet, so the range check alone must not
        // reject the very first sample.
        let mut proc = MonitorDataProcessor::new();
        let m = proc.process(&packet(MAX_POSITION_MM + 500.0, 0.0), 0).unwrap();
        assert_eq!(m.pos_a, MAX_POSITION_MM + 500.0);
    }

    #[test]
    fn test_velocity_seeded_with_raw_value() {
        let mut proc = MonitorDataProcessor::new();
        let mut p = packet(0.0, 0.0);
        p.vel_a_raw = 1000; // 100.0 mm/s
        let m = proc.process(&p, 0).unwrap();
        assert_eq!(m.vel_a, 100.0);
    }

    #[test]
    fn test_velocity_ema_converges() {
        let mut proc = MonitorDataProcessor::new();
        let mut p = packet(0.0, 0.0);
        p.vel_a_raw = 0;
        proc.process(&p, 0).unwrap();
        p.vel_a_raw = 1000;
        let mut last = 0.0;
        for i in 1..=20 {
            last = proc.process(&p, i * 20).unwrap().vel_a;
        }
        assert!((last - 100.0).abs() < 5.0, "ema at {}", last);
        // Single step from the seed follows the fixed coefficient.
        let mut proc = MonitorDataProcessor::new();
        p.vel_a_raw = 0;
        proc.process(&p, 0).unwrap();
        p.vel_a_raw = 1000;
        let m = proc.process(&p, 20).unwrap();
        assert!((m.vel_a - 30.0).abs() < 1e-3);
    }

    #[test]
    fn test_rejected_sample_skips_velocity_update() {
        let mut proc = MonitorDataProcessor::new();
        let mut p = packet(100.0, 0.0);
        p.vel_a_raw = 0;
        proc.process(&p, 0).unwrap();
        // Spike with a wild velocity; both must be ignored.
        p.pos_a = 200.0;
        p.vel_a_raw = 90000;
        assert!(proc.process(&p, 20).is_none());
        p.vel_a_raw = 0;
        let m = proc.process(&p, 40).unwrap();
        assert_eq!(m.vel_a, 0.0);
    }

    #[test]
    fn test_deload_debounce() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut proc = MonitorDataProcessor::new();
        let counter = fired.clone();
        proc.set_deload_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let mut p = packet(0.0, 0.0);
        p.status = crate::core::constants::STATUS_DELOAD_OCCURRED;
        proc.process(&p, 1000).unwrap();
        proc.process(&p, 1500).unwrap(); // inside the debounce window
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        proc.process(&p, 1000 + DELOAD_EVENT_DEBOUNCE_MS + 1).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rom_violation_fires_per_sample() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut proc = MonitorDataProcessor::new();
        let counter = fired.clone();
        proc.set_rom_violation_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let mut p = packet(0.0, 0.0);
        p.status = crate::core::constants::STATUS_ROM_OUTSIDE_HIGH;
        proc.process(&p, 0).unwrap();
        proc.process(&p, 20).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset_preserves_last_good_positions() {
        let mut proc = MonitorDataProcessor::new();
        proc.process(&packet(100.0, 80.0), 0).unwrap();
        proc.reset_for_new_session();
        assert_eq!(proc.notification_count(), 0);
        // Out-of-range opener still has the pre-reset fallback.
        let m = proc.process(&packet(MAX_POSITION_MM + 500.0, 80.0), 0).unwrap();
        assert_eq!(m.pos_a, 100.0);
    }

    #[test]
    fn test_reset_clears_jump_reference() {
        let mut proc = MonitorDataProcessor::new();
        proc.process(&packet(100.0, 0.0), 0).unwrap();
        proc.reset_for_new_session();
        // A big delta against the pre-reset position is not a spike.
        assert!(proc.process(&packet(400.0, 0.0), 0).is_some());
    }

    #[test]
    fn test_lenient_mode_accepts_spikes_and_loads() {
        let mut proc = MonitorDataProcessor::new();
        proc.set_strict_validation(false);
        let mut p = packet(100.0, 0.0);
        assert!(proc.process(&p, 0).is_some());
        p.pos_a = 400.0;
        p.load_a = MAX_WEIGHT_KG + 50.0;
        assert!(proc.process(&p, 20).is_some());
    }

    #[test]
    fn test_poll_rate_histogram_counts_gaps() {
        let mut proc = MonitorDataProcessor::new();
        let p = packet(0.0, 0.0);
        proc.process(&p, 0).unwrap();
        proc.process(&p, 50).unwrap(); // 50 ms gap
        proc.process(&p, 250).unwrap(); // 200 ms gap
        assert_eq!(proc.poll_rate_stats().total(), 2);
        assert_eq!(proc.poll_rate_stats().buckets()[2], 1);
        assert_eq!(proc.poll_rate_stats().buckets()[5], 1);
    }
}
