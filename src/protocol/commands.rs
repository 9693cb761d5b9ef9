//! Command validation and the wire-level command surface.

use crate::error::ProtocolError;

const MAX_COMMAND_LEN: usize = 64;

/// Uppercases `raw`, appends a trailing `\r` if absent, and rejects
/// oversize or non-printable-ASCII commands. The returned string is
/// ready to write to the port verbatim.
pub fn validate(raw: &str) -> Result<String, ProtocolError> {
    let mut normalized = raw.to_ascii_uppercase();
    if !normalized.ends_with('\r') {
        normalized.push('\r');
    }

    if normalized.len() > MAX_COMMAND_LEN {
        return Err(ProtocolError::TooLong);
    }

    let body = &normalized.as_bytes()[..normalized.len() - 1];
    if body.iter().any(|&b| !(0x21..=0x7E).contains(&b)) {
        return Err(ProtocolError::NonAsciiPrintable);
    }

    Ok(normalized)
}

/// `R`: firmware state reset.
pub fn reset() -> String {
    "R".to_string()
}

/// `RB`: full reboot.
pub fn reboot() -> String {
    "RB".to_string()
}

/// `EM,e1,e2`: enable/disable motors. `e1`/`e2` are expected to be `0` or `1`.
pub fn enable_motors(e1: u8, e2: u8) -> String {
    format!("EM,{e1},{e2}")
}

/// `TP[,dur]`: toggle pen, optional duration in ms (`1..=65535`).
pub fn toggle_pen(duration_ms: Option<u32>) -> String {
    match duration_ms {
        Some(d) => format!("TP,{d}"),
        None => "TP".to_string(),
    }
}

/// `SP,v[,dur[,pin]]`: set pen state. `value` is `0` or `1`.
pub fn set_pen(value: u8, duration_ms: Option<u32>, pin: Option<u8>) -> String {
    match (duration_ms, pin) {
        (Some(d), Some(p)) => format!("SP,{value},{d},{p}"),
        (Some(d), None) => format!("SP,{value},{d}"),
        (None, _) => format!("SP,{value}"),
    }
}

/// `QP`: query pen state. The device replies `0` or `1`.
pub fn query_pen() -> String {
    "QP".to_string()
}

/// `HM,f[,p1,p2]`: home or move at a given step rate.
pub fn home_move(step_rate: u32, p1: Option<i64>, p2: Option<i64>) -> String {
    match (p1, p2) {
        (Some(a), Some(b)) => format!("HM,{step_rate},{a},{b}"),
        _ => format!("HM,{step_rate}"),
    }
}

/// `SC,v1,v2`: configure a firmware parameter.
pub fn configure(v1: u16, v2: u32) -> String {
    format!("SC,{v1},{v2}")
}

/// `XM,dur,a,b`: stepper move, run for `duration_ms` at the given
/// per-axis step deltas.
pub fn stepper_move(duration_ms: u32, axis_a: i64, axis_b: i64) -> String {
    format!("XM,{duration_ms},{axis_a},{axis_b}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercase_is_uppercased_and_terminated() {
        let v = validate("xm,100,10,10").unwrap();
        assert_eq!(v, "XM,100,10,10\r");
    }

    #[test]
    fn already_terminated_is_not_doubled() {
        let v = validate("QP\r").unwrap();
        assert_eq!(v, "QP\r");
    }

    #[test]
    fn oversize_command_is_rejected() {
        let raw = "X".repeat(100);
        assert_eq!(validate(&raw), Err(ProtocolError::TooLong));
    }

    #[test]
    fn embedded_space_is_rejected() {
        assert_eq!(
            validate("XM ,100,10,10"),
            Err(ProtocolError::NonAsciiPrintable)
        );
    }

    #[test]
    fn builders_match_wire_forms() {
        assert_eq!(reset(), "R");
        assert_eq!(reboot(), "RB");
        assert_eq!(enable_motors(1, 1), "EM,1,1");
        assert_eq!(toggle_pen(Some(500)), "TP,500");
        assert_eq!(set_pen(1, Some(750), None), "SP,1,750");
        assert_eq!(query_pen(), "QP");
        assert_eq!(configure(4, 7500), "SC,4,7500");
        assert_eq!(stepper_move(100, 10, -10), "XM,100,10,-10");
    }
}
