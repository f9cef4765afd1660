//! Wire Parser
//!
//! Pure, stateless conversion of raw GATT byte buffers into the typed
//! records of [`crate::model::packets`]. A bag of free functions: no
//! instance state, no logging, no streams. Every function returns `None`
//! for an undersized buffer instead of panicking.
//!
//! All packets are little-endian except the RX one-shot metrics response,
//! which is big-endian. Eight-bit values are unsigned-masked before being
//! combined so sign extension can never leak into a wider field.

use crate::model::packets::{
    DiagnosticPacket, HeuristicPacket, ModeChangeEvent, MonitorPacket, PhaseStats, RepPacket,
    RxMetricsResponse, VersionInfo,
};

/// Modern rep packets are 24 bytes of payload after the optional opcode
/// prefix; anything shorter (down to 6) is the legacy shape. There is no
/// third tier.
const REP_MODERN_SIZE: usize = 24;
/// Legacy rep packets carry two u16 counters four bytes apart.
const REP_LEGACY_SIZE: usize = 6;

// --- Byte utilities ---
//
// Offsets are the caller's responsibility; the parse functions below check
// buffer sizes before reaching for these.

pub fn get_u16_le(buf: &[u8], off: usize) -> u16 {
    (buf[off] as u16) | ((buf[off + 1] as u16) << 8)
}

pub fn get_i16_le(buf: &[u8], off: usize) -> i16 {
    get_u16_le(buf, off) as i16
}

pub fn get_u16_be(buf: &[u8], off: usize) -> u16 {
    ((buf[off] as u16) << 8) | (buf[off + 1] as u16)
}

pub fn get_u32_le(buf: &[u8], off: usize) -> u32 {
    (buf[off] as u32)
        | ((buf[off + 1] as u32) << 8)
        | ((buf[off + 2] as u32) << 16)
        | ((buf[off + 3] as u32) << 24)
}

pub fn get_i32_le(buf: &[u8], off: usize) -> i32 {
    get_u32_le(buf, off) as i32
}

/// f32 via raw-bits reinterpretation of the little-endian u32.
pub fn get_f32_le(buf: &[u8], off: usize) -> f32 {
    f32::from_bits(get_u32_le(buf, off))
}

/// Uppercase, zero-padded hex of a single byte.
pub fn to_hex(byte: u8) -> String {
    format!("{:02X}", byte)
}

/// Space-separated hex dump of a buffer, for diagnostics.
pub fn buf_to_hex(buf: &[u8]) -> String {
    buf.iter()
        .map(|b| to_hex(*b))
        .collect::<Vec<_>>()
        .join(" ")
}

// --- Packet parsers ---

/// Parses a MONITOR read.
///
/// The four sample fields sit on a 4-byte stride with two zero pad bytes
/// after each position and after the first load: ticks at 0 (two u16le
/// halves), posA at 4, loadA at 8, posB at 12, loadB at 16. The status word
/// follows at 18 on firmware that sends it; older reads stop after loadB.
/// Firmware velocities trail as an i32 pair at 20 and 24 when present.
pub fn parse_monitor_packet(buf: &[u8]) -> Option<MonitorPacket> {
    if buf.len() < 18 {
        return None;
    }
    let ticks = (get_u16_le(buf, 0) as u32) | ((get_u16_le(buf, 2) as u32) << 16);
    let status = if buf.len() >= 20 { get_u16_le(buf, 18) } else { 0 };
    let (vel_a_raw, vel_b_raw) = if buf.len() >= 28 {
        (get_i32_le(buf, 20), get_i32_le(buf, 24))
    } else {
        (0, 0)
    };
    Some(MonitorPacket {
        ticks,
        pos_a: get_i16_le(buf, 4) as f32 / 10.0,
        load_a: get_u16_le(buf, 8) as f32 / 100.0,
        pos_b: get_i16_le(buf, 12) as f32 / 10.0,
        load_b: get_u16_le(buf, 16) as f32 / 100.0,
        status,
        vel_a_raw,
        vel_b_raw,
    })
}

/// Parses a DIAGNOSTIC read: uptime, four fault words, eight temperatures.
pub fn parse_diagnostic_packet(buf: &[u8]) -> Option<DiagnosticPacket> {
    if buf.len() < 20 {
        return None;
    }
    let seconds = get_i32_le(buf, 0);
    let mut faults = [0i16; 4];
    for (i, fault) in faults.iter_mut().enumerate() {
        *fault = get_i16_le(buf, 4 + i * 2);
    }
    let mut temps = [0i8; 8];
    for (i, temp) in temps.iter_mut().enumerate() {
        *temp = buf[12 + i] as i8;
    }
    Some(DiagnosticPacket {
        seconds,
        faults,
        temps,
        has_faults: faults.iter().any(|f| *f != 0),
    })
}

/// Parses a HEURISTIC read: concentric then eccentric phase block, six
/// consecutive f32 each.
pub fn parse_heuristic_packet(buf: &[u8], timestamp_ms: u64) -> Option<HeuristicPacket> {
    if buf.len() < 48 {
        return None;
    }
    Some(HeuristicPacket {
        concentric: parse_phase_stats(buf, 0),
        eccentric: parse_phase_stats(buf, 24),
        timestamp_ms,
    })
}

fn parse_phase_stats(buf: &[u8], off: usize) -> PhaseStats {
    PhaseStats {
        kg_avg: get_f32_le(buf, off),
        kg_max: get_f32_le(buf, off + 4),
        vel_avg: get_f32_le(buf, off + 8),
        vel_max: get_f32_le(buf, off + 12),
        watt_avg: get_f32_le(buf, off + 16),
        watt_max: get_f32_le(buf, off + 20),
    }
}

/// Parses a rep notification.
///
/// The effective payload (after the optional one-byte opcode prefix) decides
/// the shape: 24 bytes or more is the modern format, 6 to 23 bytes is the
/// legacy format, anything shorter is rejected. This partition must stay
/// exactly two-tier; an intermediate tier for 16..23 bytes once broke rep
/// counting on one hardware variant.
pub fn parse_rep_packet(buf: &[u8], has_opcode_prefix: bool, timestamp_ms: u64) -> Option<RepPacket> {
    let off = if has_opcode_prefix { 1 } else { 0 };
    let effective = buf.len().saturating_sub(off);
    if effective < REP_LEGACY_SIZE {
        return None;
    }
    if effective >= REP_MODERN_SIZE {
        Some(RepPacket {
            top_counter: get_u32_le(buf, off),
            complete_counter: get_u32_le(buf, off + 4),
            range_top: get_f32_le(buf, off + 8),
            range_bottom: get_f32_le(buf, off + 12),
            reps_rom_count: get_u16_le(buf, off + 16),
            reps_rom_total: get_u16_le(buf, off + 18),
            reps_set_count: get_u16_le(buf, off + 20),
            reps_set_total: get_u16_le(buf, off + 22),
            is_legacy_format: false,
            raw_data: buf.to_vec(),
            timestamp_ms,
        })
    } else {
        Some(RepPacket {
            top_counter: get_u16_le(buf, off) as u32,
            complete_counter: get_u16_le(buf, off + 4) as u32,
            range_top: 0.0,
            range_bottom: 0.0,
            reps_rom_count: 0,
            reps_rom_total: 0,
            reps_set_count: 0,
            reps_set_total: 0,
            is_legacy_format: true,
            raw_data: buf.to_vec(),
            timestamp_ms,
        })
    }
}

/// Parses a one-shot metrics response from the RX characteristic. Big-endian
/// u16 values after the opcode byte; a trailing odd byte is ignored.
pub fn parse_rx_metrics_response(buf: &[u8]) -> Option<RxMetricsResponse> {
    if buf.len() < 3 {
        return None;
    }
    let values = buf[1..]
        .chunks_exact(2)
        .map(|pair| get_u16_be(pair, 0))
        .collect();
    Some(RxMetricsResponse {
        opcode: buf[0],
        values,
    })
}

/// Parses a firmware version notification.
pub fn parse_version_info(buf: &[u8]) -> Option<VersionInfo> {
    if buf.len() < 3 {
        return None;
    }
    Some(VersionInfo {
        major: buf[0],
        minor: buf[1],
        patch: buf[2],
    })
}

/// Parses a mode-change echo notification.
pub fn parse_mode_change(buf: &[u8], timestamp_ms: u64) -> Option<ModeChangeEvent> {
    if buf.is_empty() {
        return None;
    }
    Some(ModeChangeEvent {
        mode_id: buf[0],
        timestamp_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_utils_endianness() {
        let buf = [0x34, 0x12, 0xCD, 0xAB];
        assert_eq!(get_u16_le(&buf, 0), 0x1234);
        assert_eq!(get_u16_le(&buf, 2), 0xABCD);
        assert_eq!(get_u16_be(&buf, 0), 0x3412);
        assert_eq!(get_u32_le(&buf, 0), 0xABCD_1234);
    }

    #[test]
    fn test_byte_utils_signedness() {
        // An all-ones pair must stay positive when read unsigned.
        let buf = [0xFF, 0xFF, 0x00, 0x80];
        assert_eq!(get_u16_le(&buf, 0), 65535);
        assert_eq!(get_i16_le(&buf, 0), -1);
        assert_eq!(get_i16_le(&buf, 2), i16::MIN);
        assert_eq!(get_i32_le(&[0xFF; 4], 0), -1);
        assert_eq!(get_u32_le(&[0xFF; 4], 0), u32::MAX);
    }

    #[test]
    fn test_f32_raw_bits() {
        // 300.0f32 = 0x43960000
        let buf = [0x00, 0x00, 0x96, 0x43];
        assert_eq!(get_f32_le(&buf, 0), 300.0);
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(0x0A), "0A");
        assert_eq!(to_hex(0xFF), "FF");
        assert_eq!(buf_to_hex(&[0x00, 0xAB]), "00 AB");
    }

    #[test]
    fn test_monitor_packet_reference_sample() {
        let buf = [
            0x00, 0x01, 0x00, 0x00, 0xD2, 0x04, 0x00, 0x00, 0x88, 0x13, 0x00, 0x00, 0xC9, 0xFD,
            0x00, 0x00, 0x10, 0x27,
        ];
        let p = parse_monitor_packet(&buf).unwrap();
        assert_eq!(p.ticks, 256);
        assert!((p.pos_a - 123.4).abs() < 1e-4);
        assert!((p.pos_b - -56.7).abs() < 1e-4);
        assert!((p.load_a - 50.0).abs() < 1e-4);
        assert!((p.load_b - 100.0).abs() < 1e-4);
        assert_eq!(p.status, 0);
        assert_eq!(p.vel_a_raw, 0);
        assert_eq!(p.vel_b_raw, 0);
    }

    #[test]
    fn test_monitor_packet_with_status_and_velocity() {
        let mut buf = vec![0u8; 28];
        buf[18] = 0x05; // deload + rom-low
        buf[20..24].copy_from_slice(&(-1500i32).to_le_bytes());
        buf[24..28].copy_from_slice(&(800i32).to_le_bytes());
        let p = parse_monitor_packet(&buf).unwrap();
        assert_eq!(p.status, 0x0005);
        assert_eq!(p.vel_a_raw, -1500);
        assert_eq!(p.vel_b_raw, 800);
    }

    #[test]
    fn test_monitor_packet_undersized() {
        assert!(parse_monitor_packet(&[0u8; 17]).is_none());
        assert!(parse_monitor_packet(&[]).is_none());
    }

    #[test]
    fn test_diagnostic_packet() {
        let mut buf = vec![0u8; 20];
        buf[0..4].copy_from_slice(&3600i32.to_le_bytes());
        buf[6..8].copy_from_slice(&(-2i16).to_le_bytes());
        buf[12] = 0x28; // 40 C
        buf[19] = 0xF6; // -10 C
        let p = parse_diagnostic_packet(&buf).unwrap();
        assert_eq!(p.seconds, 3600);
        assert_eq!(p.faults, [0, -2, 0, 0]);
        assert_eq!(p.temps[0], 40);
        assert_eq!(p.temps[7], -10);
        assert!(p.has_faults);

        let clean = parse_diagnostic_packet(&vec![0u8; 20]).unwrap();
        assert!(!clean.has_faults);
        assert!(parse_diagnostic_packet(&[0u8; 19]).is_none());
    }

    #[test]
    fn test_heuristic_packet() {
        let mut buf = vec![0u8; 48];
        buf[0..4].copy_from_slice(&25.5f32.to_le_bytes()); // concentric kg_avg
        buf[20..24].copy_from_slice(&310.0f32.to_le_bytes()); // concentric watt_max
        buf[24..28].copy_from_slice(&18.0f32.to_le_bytes()); // eccentric kg_avg
        let p = parse_heuristic_packet(&buf, 42).unwrap();
        assert_eq!(p.concentric.kg_avg, 25.5);
        assert_eq!(p.concentric.watt_max, 310.0);
        assert_eq!(p.eccentric.kg_avg, 18.0);
        assert_eq!(p.timestamp_ms, 42);
        assert!(parse_heuristic_packet(&[0u8; 47], 0).is_none());
    }

    #[test]
    fn test_rep_packet_modern_reference() {
        let buf = [
            0x0A, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x96, 0x43, 0x00, 0x00,
            0x00, 0x00, 0x03, 0x00, 0x05, 0x00, 0x07, 0x00, 0x0A, 0x00,
        ];
        let p = parse_rep_packet(&buf, false, 7).unwrap();
        assert!(!p.is_legacy_format);
        assert_eq!(p.top_counter, 10);
        assert_eq!(p.complete_counter, 8);
        assert_eq!(p.range_top, 300.0);
        assert_eq!(p.range_bottom, 0.0);
        assert_eq!(p.reps_rom_count, 3);
        assert_eq!(p.reps_rom_total, 5);
        assert_eq!(p.reps_set_count, 7);
        assert_eq!(p.reps_set_total, 10);
        assert_eq!(p.raw_data, buf.to_vec());
        assert_eq!(p.timestamp_ms, 7);
    }

    #[test]
    fn test_rep_packet_legacy_reference() {
        let buf = [0x05, 0x00, 0x00, 0x00, 0x03, 0x00];
        let p = parse_rep_packet(&buf, false, 0).unwrap();
        assert!(p.is_legacy_format);
        assert_eq!(p.top_counter, 5);
        assert_eq!(p.complete_counter, 3);
    }

    #[test]
    fn test_rep_packet_opcode_prefix_shifts_fields() {
        let buf = [0xA5, 0x05, 0x00, 0x00, 0x00, 0x03, 0x00];
        let p = parse_rep_packet(&buf, true, 0).unwrap();
        assert!(p.is_legacy_format);
        assert_eq!(p.top_counter, 5);
        assert_eq!(p.complete_counter, 3);
    }

    #[test]
    fn test_rep_packet_two_tier_partition_is_exhaustive() {
        // For every buffer length and prefix flag the parser lands in
        // exactly one of: rejected, legacy, modern. 16..24 byte payloads
        // are legacy, never a shape of their own.
        for prefix in [false, true] {
            let off = prefix as usize;
            for len in 0..40 {
                let buf = vec![0u8; len];
                let effective = len.saturating_sub(off);
                match parse_rep_packet(&buf, prefix, 0) {
                    None => assert!(effective < 6, "len {} prefix {}", len, prefix),
                    Some(p) if p.is_legacy_format => {
                        assert!((6..24).contains(&effective), "len {} prefix {}", len, prefix)
                    }
                    Some(_) => assert!(effective >= 24, "len {} prefix {}", len, prefix),
                }
            }
        }
    }

    #[test]
    fn test_rx_metrics_response_is_big_endian() {
        let buf = [0x81, 0x12, 0x34, 0xAB, 0xCD];
        let r = parse_rx_metrics_response(&buf).unwrap();
        assert_eq!(r.opcode, 0x81);
        assert_eq!(r.values, vec![0x1234, 0xABCD]);
        // Trailing odd byte is ignored.
        let r = parse_rx_metrics_response(&[0x81, 0x00, 0x01, 0xFF]).unwrap();
        assert_eq!(r.values, vec![0x0001]);
        assert!(parse_rx_metrics_response(&[0x81, 0x00]).is_none());
    }

    #[test]
    fn test_version_and_mode_notifications() {
        let v = parse_version_info(&[2, 14, 7]).unwrap();
        assert_eq!((v.major, v.minor, v.patch), (2, 14, 7));
        assert!(parse_version_info(&[2, 14]).is_none());

        let m = parse_mode_change(&[0x03, 0xFF], 9).unwrap();
        assert_eq!(m.mode_id, 0x03);
        assert_eq!(m.timestamp_ms, 9);
        assert!(parse_mode_change(&[], 0).is_none());
    }
}
