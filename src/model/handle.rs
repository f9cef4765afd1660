//! Handle State Detector
//!
//! Classifies the user's physical interaction with the cable handles from
//! the enriched metric stream. Two outputs: a four-state machine
//! (waiting-for-rest, released, moving, grabbed) with dwell-debounced
//! transitions against a captured baseline, and a simple per-side presence
//! vector. Grab and release decisions are always baseline-relative, never
//! absolute.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::core::constants::{
    AUTO_START_VELOCITY_THRESHOLD_MM_S, GRAB_DELTA_THRESHOLD_MM, HANDLE_GRABBED_THRESHOLD_MM,
    HANDLE_REST_THRESHOLD_MM, PRESENCE_THRESHOLD_MM, RELEASE_DELTA_THRESHOLD_MM,
    STATE_TRANSITION_DWELL_MS, VELOCITY_THRESHOLD_MM_S, WAITING_FOR_REST_TIMEOUT_MS,
};
use crate::model::packets::{HandleDetection, WorkoutMetric};

/// The four-valued handle classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleState {
    /// Pre-session: waiting for the handles to settle so a baseline can be
    /// captured.
    #[default]
    WaitingForRest,
    /// Handles are at their baseline.
    Released,
    /// A handle left the baseline without the velocity of a deliberate
    /// lift.
    Moving,
    /// The user is holding and driving at least one handle.
    Grabbed,
}

/// A transition candidate accumulating dwell time. Any frame that violates
/// the candidate's condition discards it; the dwell restarts from scratch
/// when the condition reappears.
#[derive(Debug, Clone, Copy)]
struct PendingTransition {
    target: HandleState,
    since_ms: u64,
    handle_a: bool,
    handle_b: bool,
}

/// Stateful detector. Touched only by the monitor task.
#[derive(Debug, Default)]
pub struct HandleStateDetector {
    enabled: bool,
    auto_start: bool,
    state: HandleState,
    baseline_a: f32,
    baseline_b: f32,
    waiting_since_ms: Option<u64>,
    pending: Option<PendingTransition>,
    /// Which handles participated in the most recent grab or move.
    active_a: bool,
    active_b: bool,
    detection: HandleDetection,
    min_position_seen: f32,
    max_position_seen: f32,
}

impl HandleStateDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn detection(&self) -> HandleDetection {
        self.detection
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Lowest position observed since the last control call. Logging only.
    pub fn min_position_seen(&self) -> f32 {
        self.min_position_seen
    }

    /// Highest position observed since the last control call. Logging only.
    pub fn max_position_seen(&self) -> f32 {
        self.max_position_seen
    }

    /// Starts detection. `auto_start` relaxes the grab velocity threshold.
    pub fn enable(&mut self, auto_start: bool) {
        self.clear_tracking();
        self.enabled = true;
        self.auto_start = auto_start;
    }

    pub fn disable(&mut self) {
        self.clear_tracking();
        self.enabled = false;
    }

    /// Drops all tracking and returns to `WaitingForRest`. Keeps the
    /// enabled flag.
    pub fn reset(&mut self) {
        let enabled = self.enabled;
        let auto_start = self.auto_start;
        self.clear_tracking();
        self.enabled = enabled;
        self.auto_start = auto_start;
    }

    /// Rest-then-lift shortcut: back to `WaitingForRest` with auto-start
    /// grab thresholds.
    pub fn enable_just_lift_waiting(&mut self) {
        self.clear_tracking();
        self.enabled = true;
        self.auto_start = true;
    }

    fn clear_tracking(&mut self) {
        self.state = HandleState::WaitingForRest;
        self.baseline_a = 0.0;
        self.baseline_b = 0.0;
        self.waiting_since_ms = None;
        self.pending = None;
        self.active_a = false;
        self.active_b = false;
        self.detection = HandleDetection::default();
        self.min_position_seen = f32::MAX;
        self.max_position_seen = f32::MIN;
    }

    /// Feeds one metric through the state machine. No-op while disabled.
    pub fn process_metric(&mut self, metric: &WorkoutMetric) {
        if !self.enabled {
            return;
        }
        self.detection = HandleDetection {
            left_detected: metric.pos_a > PRESENCE_THRESHOLD_MM,
            right_detected: metric.pos_b > PRESENCE_THRESHOLD_MM,
        };
        self.min_position_seen = self.min_position_seen.min(metric.pos_a).min(metric.pos_b);
        self.max_position_seen = self.max_position_seen.max(metric.pos_a).max(metric.pos_b);

        match self.state {
            HandleState::WaitingForRest => self.step_waiting_for_rest(metric),
            HandleState::Released => self.step_released(metric),
            HandleState::Moving => self.step_moving(metric),
            HandleState::Grabbed => self.step_grabbed(metric),
        }
    }

    fn step_waiting_for_rest(&mut self, metric: &WorkoutMetric) {
        let ts = metric.timestamp_ms;
        let entered = *self.waiting_since_ms.get_or_insert(ts);

        if ts.saturating_sub(entered) >= WAITING_FOR_REST_TIMEOUT_MS {
            // The user may already be holding elevated handles; capture a
            // real baseline only where the handle is plausibly unheld,
            // otherwise fall back to a virtual baseline of zero.
            self.baseline_a = virtual_or_real_baseline(metric.pos_a);
            self.baseline_b = virtual_or_real_baseline(metric.pos_b);
            debug!(
                "rest wait timed out, baseline a={} b={}",
                self.baseline_a, self.baseline_b
            );
            self.commit(HandleState::Released, false, false);
            return;
        }

        let at_rest = metric.pos_a < HANDLE_REST_THRESHOLD_MM
            && metric.pos_b < HANDLE_REST_THRESHOLD_MM;
        if at_rest {
            if self.dwell_elapsed(HandleState::Released, ts, false, false) {
                self.baseline_a = metric.pos_a;
                self.baseline_b = metric.pos_b;
                self.commit(HandleState::Released, false, false);
            }
        } else {
            self.pending = None;
        }
    }

    fn step_released(&mut self, metric: &WorkoutMetric) {
        let ts = metric.timestamp_ms;
        let (pos_a, pos_b) = self.position_criteria(metric);
        let (vel_a, vel_b) = self.velocity_criteria(metric);

        if (pos_a && vel_a) || (pos_b && vel_b) {
            if self.dwell_elapsed(HandleState::Grabbed, ts, pos_a, pos_b) {
                self.commit(HandleState::Grabbed, pos_a, pos_b);
            }
        } else if pos_a || pos_b {
            if self.dwell_elapsed(HandleState::Moving, ts, pos_a, pos_b) {
                self.commit(HandleState::Moving, pos_a, pos_b);
            }
        } else {
            self.pending = None;
        }
    }

    fn step_moving(&mut self, metric: &WorkoutMetric) {
        let ts = metric.timestamp_ms;
        let (pos_a, pos_b) = self.position_criteria(metric);
        let (vel_a, vel_b) = self.velocity_criteria(metric);

        if (pos_a && vel_a) || (pos_b && vel_b) {
            if self.dwell_elapsed(HandleState::Grabbed, ts, pos_a, pos_b) {
                self.commit(HandleState::Grabbed, pos_a, pos_b);
            }
        } else if self.release_condition(metric) {
            if self.dwell_elapsed(HandleState::Released, ts, false, false) {
                self.commit(HandleState::Released, false, false);
            }
        } else {
            self.pending = None;
        }
    }

    fn step_grabbed(&mut self, metric: &WorkoutMetric) {
        let ts = metric.timestamp_ms;
        if self.release_condition(metric) {
            if self.dwell_elapsed(HandleState::Released, ts, false, false) {
                self.commit(HandleState::Released, false, false);
            }
        } else {
            self.pending = None;
        }
    }

    /// Baseline-relative grab deltas per handle.
    fn position_criteria(&self, metric: &WorkoutMetric) -> (bool, bool) {
        (
            metric.pos_a - self.baseline_a > GRAB_DELTA_THRESHOLD_MM,
            metric.pos_b - self.baseline_b > GRAB_DELTA_THRESHOLD_MM,
        )
    }

    fn velocity_criteria(&self, metric: &WorkoutMetric) -> (bool, bool) {
        let threshold = if self.auto_start {
            AUTO_START_VELOCITY_THRESHOLD_MM_S
        } else {
            VELOCITY_THRESHOLD_MM_S
        };
        (
            metric.vel_a.abs() > threshold,
            metric.vel_b.abs() > threshold,
        )
    }

    /// Every handle that took part in the last grab is back near its
    /// baseline. A handle that never moved is ignored.
    fn release_condition(&self, metric: &WorkoutMetric) -> bool {
        let a_back = metric.pos_a - self.baseline_a < RELEASE_DELTA_THRESHOLD_MM;
        let b_back = metric.pos_b - self.baseline_b < RELEASE_DELTA_THRESHOLD_MM;
        (self.active_a || self.active_b)
            && (!self.active_a || a_back)
            && (!self.active_b || b_back)
    }

    /// Accumulates dwell for `target`. Returns true once the condition has
    /// held continuously for the full dwell interval.
    fn dwell_elapsed(&mut self, target: HandleState, ts: u64, handle_a: bool, handle_b: bool) -> bool {
        match &mut self.pending {
            Some(p) if p.target == target => {
                p.handle_a = handle_a;
                p.handle_b = handle_b;
                ts.saturating_sub(p.since_ms) >= STATE_TRANSITION_DWELL_MS
            }
            _ => {
                self.pending = Some(PendingTransition {
                    target,
                    since_ms: ts,
                    handle_a,
                    handle_b,
                });
                false
            }
        }
    }

    fn commit(&mut self, target: HandleState, handle_a: bool, handle_b: bool) {
        debug!("handle state {:?} -> {:?}", self.state, target);
        self.state = target;
        self.pending = None;
        match target {
            HandleState::Moving | HandleState::Grabbed => {
                self.active_a = handle_a;
                self.active_b = handle_b;
            }
            HandleState::Released | HandleState::WaitingForRest => {
                self.active_a = false;
                self.active_b = false;
            }
        }
    }
}

fn virtual_or_real_baseline(pos: f32) -> f32 {
    if pos < HANDLE_GRABBED_THRESHOLD_MM {
        pos
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(ts: u64, pos_a: f32, pos_b: f32, vel_a: f32, vel_b: f32) -> WorkoutMetric {
        WorkoutMetric {
            timestamp_ms: ts,
            pos_a,
            pos_b,
            vel_a,
            vel_b,
            load_a: 10.0,
            load_b: 10.0,
        }
    }

    /// Feeds resting frames until the detector reaches `Released` with a
    /// zero baseline. Returns the next free timestamp.
    fn settle(det: &mut HandleStateDetector) -> u64 {
        det.process_metric(&metric(0, 0.0, 0.0, 0.0, 0.0));
        det.process_metric(&metric(STATE_TRANSITION_DWELL_MS, 0.0, 0.0, 0.0, 0.0));
        assert_eq!(det.state(), HandleState::Released);
        STATE_TRANSITION_DWELL_MS + 50
    }

    #[test]
    fn test_disabled_detector_ignores_metrics() {
        let mut det = HandleStateDetector::new();
        det.process_metric(&metric(0, 0.0, 0.0, 0.0, 0.0));
        det.process_metric(&metric(5000, 0.0, 0.0, 0.0, 0.0));
        assert_eq!(det.state(), HandleState::WaitingForRest);
        assert_eq!(det.detection(), HandleDetection::default());
    }

    #[test]
    fn test_rest_capture_transitions_to_released() {
        let mut det = HandleStateDetector::new();
        det.enable(false);
        det.process_metric(&metric(0, 3.0, 2.0, 0.0, 0.0));
        assert_eq!(det.state(), HandleState::WaitingForRest);
        det.process_metric(&metric(STATE_TRANSITION_DWELL_MS, 3.0, 2.0, 0.0, 0.0));
        assert_eq!(det.state(), HandleState::Released);
    }

    #[test]
    fn test_transition_fires_at_dwell_boundary_not_before() {
        let mut det = HandleStateDetector::new();
        det.enable(false);
        let t0 = settle(&mut det);
        det.process_metric(&metric(t0, 20.0, 0.0, 80.0, 0.0));
        det.process_metric(&metric(t0 + 100, 20.0, 0.0, 80.0, 0.0));
        det.process_metric(&metric(t0 + STATE_TRANSITION_DWELL_MS - 1, 20.0, 0.0, 80.0, 0.0));
        assert_eq!(det.state(), HandleState::Released);
        det.process_metric(&metric(t0 + STATE_TRANSITION_DWELL_MS, 20.0, 0.0, 80.0, 0.0));
        assert_eq!(det.state(), HandleState::Grabbed);
    }

    #[test]
    fn test_condition_gap_restarts_dwell() {
        let mut det = HandleStateDetector::new();
        det.enable(false);
        let t0 = settle(&mut det);
        det.process_metric(&metric(t0, 20.0, 0.0, 80.0, 0.0));
        // Condition drops mid-dwell.
        det.process_metric(&metric(t0 + 100, 0.0, 0.0, 0.0, 0.0));
        det.process_metric(&metric(t0 + 150, 20.0, 0.0, 80.0, 0.0));
        det.process_metric(&metric(t0 + 150 + STATE_TRANSITION_DWELL_MS - 1, 20.0, 0.0, 80.0, 0.0));
        assert_eq!(det.state(), HandleState::Released);
        det.process_metric(&metric(t0 + 150 + STATE_TRANSITION_DWELL_MS, 20.0, 0.0, 80.0, 0.0));
        assert_eq!(det.state(), HandleState::Grabbed);
    }

    #[test]
    fn test_position_without_velocity_is_moving() {
        let mut det = HandleStateDetector::new();
        det.enable(false);
        let t0 = settle(&mut det);
        det.process_metric(&metric(t0, 20.0, 0.0, 10.0, 0.0));
        det.process_metric(&metric(t0 + STATE_TRANSITION_DWELL_MS, 20.0, 0.0, 10.0, 0.0));
        assert_eq!(det.state(), HandleState::Moving);
        // Velocity arriving upgrades to grabbed after its own dwell.
        let t1 = t0 + STATE_TRANSITION_DWELL_MS + 50;
        det.process_metric(&metric(t1, 25.0, 0.0, 80.0, 0.0));
        det.process_metric(&metric(t1 + STATE_TRANSITION_DWELL_MS, 25.0, 0.0, 80.0, 0.0));
        assert_eq!(det.state(), HandleState::Grabbed);
    }

    #[test]
    fn test_release_requires_only_active_handles() {
        let mut det = HandleStateDetector::new();
        det.enable(false);
        let t0 = settle(&mut det);
        // Only handle A participates in the grab; B sits far out but was
        // never active, so returning A alone releases the state.
        det.process_metric(&metric(t0, 20.0, 0.0, 80.0, 0.0));
        det.process_metric(&metric(t0 + STATE_TRANSITION_DWELL_MS, 20.0, 0.0, 80.0, 0.0));
        assert_eq!(det.state(), HandleState::Grabbed);
        let t1 = t0 + STATE_TRANSITION_DWELL_MS + 50;
        det.process_metric(&metric(t1, 1.0, 0.0, 0.0, 0.0));
        det.process_metric(&metric(t1 + STATE_TRANSITION_DWELL_MS, 1.0, 0.0, 0.0, 0.0));
        assert_eq!(det.state(), HandleState::Released);
    }

    #[test]
    fn test_moving_returns_to_released() {
        let mut det = HandleStateDetector::new();
        det.enable(false);
        let t0 = settle(&mut det);
        det.process_metric(&metric(t0, 20.0, 0.0, 10.0, 0.0));
        det.process_metric(&metric(t0 + STATE_TRANSITION_DWELL_MS, 20.0, 0.0, 10.0, 0.0));
        assert_eq!(det.state(), HandleState::Moving);
        // The handle drifts back to the baseline without ever grabbing.
        let t1 = t0 + STATE_TRANSITION_DWELL_MS + 50;
        det.process_metric(&metric(t1, 2.0, 0.0, 0.0, 0.0));
        det.process_metric(&metric(t1 + STATE_TRANSITION_DWELL_MS - 1, 2.0, 0.0, 0.0, 0.0));
        assert_eq!(det.state(), HandleState::Moving);
        det.process_metric(&metric(t1 + STATE_TRANSITION_DWELL_MS, 2.0, 0.0, 0.0, 0.0));
        assert_eq!(det.state(), HandleState::Released);
    }

    #[test]
    fn test_auto_start_relaxes_velocity_threshold() {
        let mut det = HandleStateDetector::new();
        det.enable(true);
        let t0 = settle(&mut det);
        // 30 mm/s: below the normal threshold, above the auto-start one.
        det.process_metric(&metric(t0, 20.0, 0.0, 30.0, 0.0));
        det.process_metric(&metric(t0 + STATE_TRANSITION_DWELL_MS, 20.0, 0.0, 30.0, 0.0));
        assert_eq!(det.state(), HandleState::Grabbed);
    }

    #[test]
    fn test_normal_mode_needs_full_velocity() {
        let mut det = HandleStateDetector::new();
        det.enable(false);
        let t0 = settle(&mut det);
        det.process_metric(&metric(t0, 20.0, 0.0, 30.0, 0.0));
        det.process_metric(&metric(t0 + STATE_TRANSITION_DWELL_MS, 20.0, 0.0, 30.0, 0.0));
        assert_eq!(det.state(), HandleState::Moving);
    }

    #[test]
    fn test_rest_timeout_captures_virtual_baseline() {
        let mut det = HandleStateDetector::new();
        det.enable(false);
        // Handles elevated the whole pre-session window.
        det.process_metric(&metric(0, 100.0, 100.0, 0.0, 0.0));
        det.process_metric(&metric(WAITING_FOR_REST_TIMEOUT_MS, 100.0, 100.0, 0.0, 0.0));
        assert_eq!(det.state(), HandleState::Released);
        // Virtual zero baseline: the elevated position already satisfies
        // the grab delta, so velocity alone completes a grab.
        det.process_metric(&metric(WAITING_FOR_REST_TIMEOUT_MS + 50, 100.0, 100.0, 80.0, 0.0));
        det.process_metric(&metric(
            WAITING_FOR_REST_TIMEOUT_MS + 50 + STATE_TRANSITION_DWELL_MS,
            100.0,
            100.0,
            80.0,
            0.0,
        ));
        assert_eq!(det.state(), HandleState::Grabbed);
    }

    #[test]
    fn test_rest_timeout_keeps_real_baseline_when_low() {
        let mut det = HandleStateDetector::new();
        det.enable(false);
        // 6 mm: above rest, below the grabbed threshold.
        det.process_metric(&metric(0, 6.0, 6.0, 0.0, 0.0));
        det.process_metric(&metric(WAITING_FOR_REST_TIMEOUT_MS, 6.0, 6.0, 0.0, 0.0));
        assert_eq!(det.state(), HandleState::Released);
        // Baseline is the real 6 mm, so 15 mm is only a 9 mm delta.
        let t0 = WAITING_FOR_REST_TIMEOUT_MS + 50;
        det.process_metric(&metric(t0, 15.0, 6.0, 80.0, 0.0));
        det.process_metric(&metric(t0 + STATE_TRANSITION_DWELL_MS, 15.0, 6.0, 80.0, 0.0));
        assert_eq!(det.state(), HandleState::Released);
    }

    #[test]
    fn test_control_methods_recapture_baseline() {
        let mut det = HandleStateDetector::new();
        det.enable(false);
        let t0 = settle(&mut det);
        det.process_metric(&metric(t0, 20.0, 0.0, 80.0, 0.0));
        det.process_metric(&metric(t0 + STATE_TRANSITION_DWELL_MS, 20.0, 0.0, 80.0, 0.0));
        assert_eq!(det.state(), HandleState::Grabbed);

        // A stale baseline must not survive a reset: the detector returns
        // to WaitingForRest and re-captures before any grab decision.
        det.reset();
        assert_eq!(det.state(), HandleState::WaitingForRest);
        assert!(det.is_enabled());

        det.enable(false);
        assert_eq!(det.state(), HandleState::WaitingForRest);
        det.disable();
        assert!(!det.is_enabled());
        det.enable_just_lift_waiting();
        assert!(det.is_enabled());
        assert_eq!(det.state(), HandleState::WaitingForRest);
        assert_eq!(det.detection(), HandleDetection::default());
    }

    #[test]
    fn test_presence_flags_follow_threshold() {
        let mut det = HandleStateDetector::new();
        det.enable(false);
        det.process_metric(&metric(0, 60.0, 10.0, 0.0, 0.0));
        assert!(det.detection().left_detected);
        assert!(!det.detection().right_detected);
    }

    #[test]
    fn test_min_max_positions_track_extremes() {
        let mut det = HandleStateDetector::new();
        det.enable(false);
        det.process_metric(&metric(0, -5.0, 10.0, 0.0, 0.0));
        det.process_metric(&metric(50, 400.0, 10.0, 0.0, 0.0));
        assert_eq!(det.min_position_seen(), -5.0);
        assert_eq!(det.max_position_seen(), 400.0);
    }
}
