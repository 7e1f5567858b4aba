use crate::{AccelKind, DriverError, GainStorage, NodeId, PidGains, Result};
use can_transport::{CanFrame, CanId};

/// First payload byte of every frame.
pub mod opcode {
    pub const PING: u8 = 0x01;
    pub const ZERO_ENCODER_OFFSET: u8 = 0x19;
    pub const READ_PID: u8 = 0x30;
    pub const WRITE_PID_RAM: u8 = 0x31;
    pub const WRITE_PID_ROM: u8 = 0x32;
    pub const READ_ACCELERATION: u8 = 0x42;
    pub const WRITE_ACCELERATION: u8 = 0x43;
    pub const PERSIST_ZERO: u8 = 0x64;
    pub const RESTART: u8 = 0x76;
    pub const SET_DEVICE_ID: u8 = 0x79;
    pub const STOP: u8 = 0x80;
    pub const BRAKE: u8 = 0x81;
    pub const READ_STATUS: u8 = 0x9C;
    pub const TORQUE: u8 = 0xA1;
    pub const SPEED: u8 = 0xA2;
    pub const POSITION: u8 = 0xA3;
    pub const POSITION_WITH_SPEED: u8 = 0xA4;
    pub const ACTIVE_REPLY: u8 = 0xB6;
}

/// Everything the driver can ask of an actuator, in physical units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    Ping,
    ZeroEncoderOffset,
    ReadPid,
    WritePid { gains: PidGains, storage: GainStorage },
    ReadAcceleration(AccelKind),
    WriteAcceleration { kind: AccelKind, value: u32 },
    PersistZero,
    Restart,
    SetDeviceId(NodeId),
    Stop,
    Brake,
    ReadStatus,
    /// Current setpoint in milliamps.
    Torque { milliamps: i16 },
    Speed { dps: f64 },
    Position { deg: f64 },
    PositionWithSpeed { deg: f64, max_speed_dps: u16 },
    /// Ask the device to send the reply of `opcode` on its own every `interval_10ms` x 10 ms.
    ActiveReply { opcode: u8, enable: bool, interval_10ms: u32 },
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Ping => opcode::PING,
            Command::ZeroEncoderOffset => opcode::ZERO_ENCODER_OFFSET,
            Command::ReadPid => opcode::READ_PID,
            Command::WritePid {
                storage: GainStorage::Ram,
                ..
            } => opcode::WRITE_PID_RAM,
            Command::WritePid {
                storage: GainStorage::Rom,
                ..
            } => opcode::WRITE_PID_ROM,
            Command::ReadAcceleration(_) => opcode::READ_ACCELERATION,
            Command::WriteAcceleration { .. } => opcode::WRITE_ACCELERATION,
            Command::PersistZero => opcode::PERSIST_ZERO,
            Command::Restart => opcode::RESTART,
            Command::SetDeviceId(_) => opcode::SET_DEVICE_ID,
            Command::Stop => opcode::STOP,
            Command::Brake => opcode::BRAKE,
            Command::ReadStatus => opcode::READ_STATUS,
            Command::Torque { .. } => opcode::TORQUE,
            Command::Speed { .. } => opcode::SPEED,
            Command::Position { .. } => opcode::POSITION,
            Command::PositionWithSpeed { .. } => opcode::POSITION_WITH_SPEED,
            Command::ActiveReply { .. } => opcode::ACTIVE_REPLY,
        }
    }

    /// Devices reboot on restart without answering.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Command::Restart)
    }

    /// The zero-padded 8-byte payload; multi-byte fields are little-endian.
    pub fn encode(&self) -> Result<[u8; 8]> {
        let mut data = [0u8; 8];
        data[0] = self.opcode();
        match *self {
            Command::Ping
            | Command::ZeroEncoderOffset
            | Command::ReadPid
            | Command::PersistZero
            | Command::Restart
            | Command::Stop
            | Command::Brake
            | Command::ReadStatus => {}
            Command::WritePid { gains, .. } => write_gains(&mut data, &gains),
            Command::ReadAcceleration(kind) => data[1] = kind.selector(),
            Command::WriteAcceleration { kind, value } => {
                data[1] = kind.selector();
                data[4..8].copy_from_slice(&value.to_le_bytes());
            }
            Command::SetDeviceId(node) => {
                // byte 2: 0 = write, 1 = read back
                data[7] = node.get();
            }
            Command::Torque { milliamps } => {
                data[4..6].copy_from_slice(&milliamps.to_le_bytes());
            }
            Command::Speed { dps } => {
                data[4..8].copy_from_slice(&centi(dps, "speed_dps")?.to_le_bytes());
            }
            Command::Position { deg } => {
                data[4..8].copy_from_slice(&centi(deg, "position_deg")?.to_le_bytes());
            }
            Command::PositionWithSpeed { deg, max_speed_dps } => {
                data[2..4].copy_from_slice(&max_speed_dps.to_le_bytes());
                data[4..8].copy_from_slice(&centi(deg, "position_deg")?.to_le_bytes());
            }
            Command::ActiveReply {
                opcode,
                enable,
                interval_10ms,
            } => {
                data[1] = opcode;
                data[2] = u8::from(enable);
                data[3..7].copy_from_slice(&interval_10ms.to_le_bytes());
            }
        }
        Ok(data)
    }
}

pub(crate) fn write_gains(data: &mut [u8; 8], gains: &PidGains) {
    data[2] = gains.current_kp;
    data[3] = gains.current_ki;
    data[4] = gains.speed_kp;
    data[5] = gains.speed_ki;
    data[6] = gains.position_kp;
    data[7] = gains.position_ki;
}

/// Physical value to a signed 0.01-unit wire count, rounded to nearest.
fn centi(value: f64, field: &'static str) -> Result<i32> {
    let scaled = (value * 100.0).round();
    if !scaled.is_finite() || scaled < f64::from(i32::MIN) || scaled > f64::from(i32::MAX) {
        return Err(DriverError::OutOfRange { field, value });
    }
    Ok(scaled as i32)
}

/// An addressed command ready for the bus. The payload is always exactly 8 bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommandFrame {
    address: u16,
    payload: [u8; 8],
}

impl CommandFrame {
    pub fn new(address: u16, payload: [u8; 8]) -> Self {
        Self { address, payload }
    }

    pub fn encode(address: u16, command: &Command) -> Result<Self> {
        Ok(Self::new(address, command.encode()?))
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn payload(&self) -> &[u8; 8] {
        &self.payload
    }

    pub fn opcode(&self) -> u8 {
        self.payload[0]
    }

    pub fn to_can(&self) -> Result<CanFrame> {
        let id = CanId::standard(self.address).ok_or(DriverError::MalformedFrame("address"))?;
        CanFrame::new(id, &self.payload).ok_or(DriverError::MalformedFrame("len"))
    }
}
