use crate::encode::{opcode, write_gains};
use crate::{AccelKind, DriverError, PidGains, Result, TelemetryScale, TelemetrySnapshot};
use std::time::Duration;

/// Raw status fields as they appear on the wire.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatusReport {
    pub temperature_c: i8,
    pub current_raw: i16,
    pub velocity_dps: i16,
    pub position_raw: i16,
}

impl StatusReport {
    fn from_payload(data: &[u8; 8]) -> Self {
        Self {
            temperature_c: data[1] as i8,
            current_raw: i16::from_le_bytes([data[2], data[3]]),
            velocity_dps: i16::from_le_bytes([data[4], data[5]]),
            position_raw: i16::from_le_bytes([data[6], data[7]]),
        }
    }

    /// The reply a device sends for `opcode` (0x9C or a motion command).
    pub fn encode(&self, opcode: u8) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[0] = opcode;
        data[1] = self.temperature_c as u8;
        data[2..4].copy_from_slice(&self.current_raw.to_le_bytes());
        data[4..6].copy_from_slice(&self.velocity_dps.to_le_bytes());
        data[6..8].copy_from_slice(&self.position_raw.to_le_bytes());
        data
    }

    pub fn to_snapshot(&self, scale: &TelemetryScale, observed_at: Duration) -> TelemetrySnapshot {
        TelemetrySnapshot {
            temperature_c: self.temperature_c,
            current_a: f64::from(self.current_raw) * scale.current_amps_per_lsb,
            velocity_dps: self.velocity_dps,
            position_deg: f64::from(self.position_raw) * scale.position_deg_per_lsb,
            observed_at,
        }
    }
}

/// A decoded inbound frame. Only `Status` updates telemetry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reply {
    Status { opcode: u8, report: StatusReport },
    Pid { opcode: u8, gains: PidGains },
    Acceleration { opcode: u8, kind: AccelKind, value: u32 },
    /// Acknowledgements and anything else without a dedicated layout.
    Info { opcode: u8, data: [u8; 8] },
}

impl Reply {
    pub fn opcode(&self) -> u8 {
        match *self {
            Reply::Status { opcode, .. }
            | Reply::Pid { opcode, .. }
            | Reply::Acceleration { opcode, .. }
            | Reply::Info { opcode, .. } => opcode,
        }
    }
}

/// Opcodes whose replies carry temperature, current, velocity and position.
pub fn is_status_opcode(op: u8) -> bool {
    matches!(
        op,
        opcode::READ_STATUS
            | opcode::TORQUE
            | opcode::SPEED
            | opcode::POSITION
            | opcode::POSITION_WITH_SPEED
    )
}

fn full_payload(data: &[u8]) -> Result<&[u8; 8]> {
    data.get(..8)
        .and_then(|d| d.try_into().ok())
        .ok_or(DriverError::MalformedFrame("payload shorter than 8 bytes"))
}

pub fn decode_reply(data: &[u8]) -> Result<Reply> {
    let data = full_payload(data)?;
    let op = data[0];
    let reply = match op {
        op if is_status_opcode(op) => Reply::Status {
            opcode: op,
            report: StatusReport::from_payload(data),
        },
        opcode::READ_PID | opcode::WRITE_PID_RAM | opcode::WRITE_PID_ROM => Reply::Pid {
            opcode: op,
            gains: PidGains {
                current_kp: data[2],
                current_ki: data[3],
                speed_kp: data[4],
                speed_ki: data[5],
                position_kp: data[6],
                position_ki: data[7],
            },
        },
        opcode::READ_ACCELERATION | opcode::WRITE_ACCELERATION => Reply::Acceleration {
            opcode: op,
            kind: AccelKind::from_selector(data[1])
                .ok_or(DriverError::MalformedFrame("acceleration selector"))?,
            value: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        },
        _ => Reply::Info {
            opcode: op,
            data: *data,
        },
    };
    Ok(reply)
}

/// Decode where only a status reply is acceptable.
pub fn decode_status(data: &[u8]) -> Result<StatusReport> {
    match decode_reply(data)? {
        Reply::Status { report, .. } => Ok(report),
        _ => Err(DriverError::MalformedFrame("not a status reply")),
    }
}

/// The reply to 0x30/0x31/0x32.
pub fn encode_pid_reply(opcode: u8, gains: &PidGains) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0] = opcode;
    write_gains(&mut data, gains);
    data
}

/// The reply to 0x42/0x43.
pub fn encode_acceleration_reply(opcode: u8, kind: AccelKind, value: u32) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0] = opcode;
    data[1] = kind.selector();
    data[4..8].copy_from_slice(&value.to_le_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN_STATUS: [u8; 8] = [0x9C, 0x20, 0x0A, 0x00, 0x05, 0x00, 0x10, 0x00];

    #[test]
    fn test_known_status_reply_raw_fields() {
        let report = decode_status(&KNOWN_STATUS).unwrap();
        assert_eq!(report.temperature_c, 32);
        assert_eq!(report.current_raw, 10);
        assert_eq!(report.velocity_dps, 5);
        assert_eq!(report.position_raw, 16);
    }

    #[test]
    fn test_known_status_reply_default_scale() {
        // Deployed firmware: 0.01 A per count, position in whole degrees
        let report = decode_status(&KNOWN_STATUS).unwrap();
        let snap = report.to_snapshot(&TelemetryScale::default(), Duration::from_millis(1));
        assert_eq!(snap.temperature_c, 32);
        assert_eq!(snap.velocity_dps, 5);
        assert!((snap.current_a - 0.10).abs() < 1e-9);
        assert!((snap.position_deg - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_known_status_reply_alternate_scales() {
        let report = decode_status(&KNOWN_STATUS).unwrap();
        let unit = TelemetryScale {
            current_amps_per_lsb: 1.0,
            position_deg_per_lsb: 1.0,
        };
        let snap = report.to_snapshot(&unit, Duration::ZERO);
        assert_eq!(snap.current_a, 10.0);
        assert_eq!(snap.position_deg, 16.0);

        let centi = TelemetryScale {
            current_amps_per_lsb: 0.1,
            position_deg_per_lsb: 0.01,
        };
        let snap = report.to_snapshot(&centi, Duration::ZERO);
        assert!((snap.current_a - 1.0).abs() < 1e-9);
        assert!((snap.position_deg - 0.16).abs() < 1e-9);
    }

    #[test]
    fn test_status_roundtrip_boundaries() {
        for (t, c, v, p) in [
            (0i8, 0i16, 0i16, 0i16),
            (i8::MAX, i16::MAX, i16::MAX, i16::MAX),
            (i8::MIN, i16::MIN, i16::MIN, i16::MIN),
            (-5, -1, 1, -1),
        ] {
            let report = StatusReport {
                temperature_c: t,
                current_raw: c,
                velocity_dps: v,
                position_raw: p,
            };
            for op in [0x9C, 0xA1, 0xA2, 0xA3, 0xA4] {
                let reply = decode_reply(&report.encode(op)).unwrap();
                assert_eq!(reply, Reply::Status { opcode: op, report });
            }
        }
    }

    #[test]
    fn test_pid_roundtrip() {
        for gains in [
            PidGains::default(),
            PidGains {
                current_kp: 255,
                current_ki: 0,
                speed_kp: 100,
                speed_ki: 5,
                position_kp: 1,
                position_ki: 254,
            },
        ] {
            let reply = decode_reply(&encode_pid_reply(0x30, &gains)).unwrap();
            assert_eq!(reply, Reply::Pid { opcode: 0x30, gains });
        }
    }

    #[test]
    fn test_acceleration_readback() {
        let data = encode_acceleration_reply(0x42, AccelKind::VelocityAcceleration, 10_000);
        assert_eq!(
            decode_reply(&data).unwrap(),
            Reply::Acceleration {
                opcode: 0x42,
                kind: AccelKind::VelocityAcceleration,
                value: 10_000
            }
        );
        let bad = [0x42, 0x09, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            decode_reply(&bad),
            Err(DriverError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_short_payload_is_malformed() {
        assert!(matches!(
            decode_reply(&KNOWN_STATUS[..7]),
            Err(DriverError::MalformedFrame(_))
        ));
        assert!(decode_reply(&[]).is_err());
    }

    #[test]
    fn test_unrecognized_opcode_is_informational() {
        let ack = [0x80, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            decode_reply(&ack).unwrap(),
            Reply::Info {
                opcode: 0x80,
                data: ack
            }
        );
        assert!(matches!(
            decode_status(&ack),
            Err(DriverError::MalformedFrame("not a status reply"))
        ));
    }
}
