//! Workout Commands
//!
//! TX frame construction for the trainer's command characteristic. The
//! start sequence is strictly CONFIG then START; cable modes are preceded
//! by INIT, bodyweight is not: sending INIT for a bodyweight exercise
//! makes the machine treat the load as cable-based and answer with a
//! hardware STOP.

use serde::{Deserialize, Serialize};

use crate::core::constants::{
    CABLE_WARMUP_REPS, OPCODE_CONFIG, OPCODE_HEARTBEAT, OPCODE_INIT, OPCODE_START, OPCODE_STOP,
};

/// Training mode selected for a workout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingMode {
    /// Constant cable load.
    OldSchool,
    /// Load ramps with rep cadence.
    Pump,
    /// Extra eccentric-phase load, percent on top of the base weight.
    Eccentric { extra_pct: u8 },
    /// Slow-rep cable mode.
    TimeUnderTension,
    /// No cable load at all.
    Bodyweight,
}

impl TrainingMode {
    /// Wire id of the mode inside the CONFIG frame.
    pub fn mode_id(&self) -> u8 {
        match self {
            TrainingMode::OldSchool => 0x00,
            TrainingMode::Pump => 0x01,
            TrainingMode::Eccentric { .. } => 0x02,
            TrainingMode::TimeUnderTension => 0x03,
            TrainingMode::Bodyweight => 0x04,
        }
    }

    /// Whether the mode drives the cables.
    pub fn is_cable(&self) -> bool {
        !matches!(self, TrainingMode::Bodyweight)
    }

    fn mode_param(&self) -> u8 {
        match self {
            TrainingMode::Eccentric { extra_pct } => *extra_pct,
            _ => 0,
        }
    }
}

/// Everything the CONFIG frame needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkoutConfig {
    pub mode: TrainingMode,
    pub weight_a_kg: f32,
    pub weight_b_kg: f32,
    /// Requested warmup reps. Ignored for cable modes, which always get
    /// [`CABLE_WARMUP_REPS`].
    pub warmup_reps: u8,
}

/// High-level command surface accepted by the facade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WorkoutCommand {
    Start(WorkoutConfig),
    Stop,
}

/// CONFIG frame: opcode, mode id, both weights in 10 g units, warmup rep
/// count, mode parameter byte.
pub fn encode_config(config: &WorkoutConfig) -> Vec<u8> {
    let warmup = if config.mode.is_cable() {
        CABLE_WARMUP_REPS
    } else {
        config.warmup_reps
    };
    let weight_a = (config.weight_a_kg.max(0.0) * 100.0).round() as u16;
    let weight_b = (config.weight_b_kg.max(0.0) * 100.0).round() as u16;
    let mut frame = vec![OPCODE_CONFIG, config.mode.mode_id()];
    frame.extend_from_slice(&weight_a.to_le_bytes());
    frame.extend_from_slice(&weight_b.to_le_bytes());
    frame.push(warmup);
    frame.push(config.mode.mode_param());
    frame
}

pub fn encode_init() -> Vec<u8> {
    vec![OPCODE_INIT]
}

pub fn encode_start() -> Vec<u8> {
    vec![OPCODE_START]
}

pub fn encode_stop() -> Vec<u8> {
    vec![OPCODE_STOP]
}

pub fn encode_heartbeat() -> Vec<u8> {
    vec![OPCODE_HEARTBEAT]
}

/// The full TX frame sequence for starting a workout. Cable modes arm the
/// load first; bodyweight must not.
pub fn start_sequence(config: &WorkoutConfig) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    if config.mode.is_cable() {
        frames.push(encode_init());
    }
    frames.push(encode_config(config));
    frames.push(encode_start());
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cable_config() -> WorkoutConfig {
        WorkoutConfig {
            mode: TrainingMode::OldSchool,
            weight_a_kg: 25.0,
            weight_b_kg: 17.5,
            warmup_reps: 9,
        }
    }

    #[test]
    fn test_config_frame_layout() {
        let frame = encode_config(&cable_config());
        assert_eq!(frame[0], OPCODE_CONFIG);
        assert_eq!(frame[1], 0x00);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 2500);
        assert_eq!(u16::from_le_bytes([frame[4], frame[5]]), 1750);
        assert_eq!(frame[7], 0);
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn test_cable_warmup_reps_are_forced() {
        // User asked for 9; cable configs always go out with 3.
        let frame = encode_config(&cable_config());
        assert_eq!(frame[6], CABLE_WARMUP_REPS);

        let mut bw = cable_config();
        bw.mode = TrainingMode::Bodyweight;
        bw.warmup_reps = 9;
        assert_eq!(encode_config(&bw)[6], 9);
    }

    #[test]
    fn test_eccentric_param_byte() {
        let mut config = cable_config();
        config.mode = TrainingMode::Eccentric { extra_pct: 35 };
        let frame = encode_config(&config);
        assert_eq!(frame[1], 0x02);
        assert_eq!(frame[7], 35);
    }

    #[test]
    fn test_cable_start_sequence_arms_first() {
        let frames = start_sequence(&cable_config());
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], vec![OPCODE_INIT]);
        assert_eq!(frames[1][0], OPCODE_CONFIG);
        assert_eq!(frames[2], vec![OPCODE_START]);
    }

    #[test]
    fn test_bodyweight_start_sequence_has_no_init() {
        let mut config = cable_config();
        config.mode = TrainingMode::Bodyweight;
        let frames = start_sequence(&config);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], OPCODE_CONFIG);
        assert_eq!(frames[1], vec![OPCODE_START]);
        assert!(frames.iter().all(|f| f[0] != OPCODE_INIT));
    }

    #[test]
    fn test_stop_and_heartbeat_frames() {
        assert_eq!(encode_stop(), vec![OPCODE_STOP]);
        assert_eq!(encode_heartbeat(), vec![OPCODE_HEARTBEAT]);
    }
}
