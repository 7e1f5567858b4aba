//! In-process actuator model answering frames on a [`MockBus`](can_transport::MockBus).

use crate::decode::{encode_acceleration_reply, encode_pid_reply};
use crate::encode::opcode;
use crate::{AccelKind, AddressLayout, PidGains, StatusReport, TelemetryScale};
use can_transport::{CanFrame, CanId, Responder};
use std::collections::BTreeMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::trace;

/// Observable state of one simulated actuator.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulatedDevice {
    pub temperature_c: i8,
    pub current_a: f64,
    pub velocity_dps: f64,
    pub position_deg: f64,
    pub ram_gains: PidGains,
    pub rom_gains: PidGains,
    /// Indexed by [`AccelKind::selector`].
    pub acceleration: [u32; 4],
    pub braked: bool,
    /// Id written through 0x300; takes effect on restart.
    pub pending_id: Option<u8>,
    /// Applies commands but never answers, like a stalled device.
    pub silent: bool,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self {
            temperature_c: 30,
            current_a: 0.0,
            velocity_dps: 0.0,
            position_deg: 0.0,
            ram_gains: PidGains {
                current_kp: 100,
                current_ki: 100,
                speed_kp: 50,
                speed_ki: 40,
                position_kp: 50,
                position_ki: 50,
            },
            rom_gains: PidGains::default(),
            acceleration: [0; 4],
            braked: false,
            pending_id: None,
            silent: false,
        }
    }
}

/// A bus full of actuators. Motion is instantaneous: a position command moves the
/// device there and the reply reports the new pose.
#[derive(Clone)]
pub struct SimulatedActuators {
    layout: AddressLayout,
    scale: TelemetryScale,
    devices: Arc<Mutex<BTreeMap<u8, SimulatedDevice>>>,
}

impl SimulatedActuators {
    pub fn new(layout: AddressLayout, scale: TelemetryScale, ids: impl IntoIterator<Item = u8>) -> Self {
        let devices = ids
            .into_iter()
            .map(|id| (id, SimulatedDevice::default()))
            .collect();
        Self {
            layout,
            scale,
            devices: Arc::new(Mutex::new(devices)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u8, SimulatedDevice>> {
        self.devices.lock()
    }

    pub fn ids(&self) -> Vec<u8> {
        self.lock().keys().copied().collect()
    }

    pub fn device(&self, id: u8) -> Option<SimulatedDevice> {
        self.lock().get(&id).cloned()
    }

    pub fn set_silent(&self, id: u8, silent: bool) {
        if let Some(dev) = self.lock().get_mut(&id) {
            dev.silent = silent;
        }
    }

    pub fn set_position(&self, id: u8, position_deg: f64) {
        if let Some(dev) = self.lock().get_mut(&id) {
            dev.position_deg = position_deg;
        }
    }

    /// Hook for [`MockBus::set_responder`](can_transport::MockBus::set_responder).
    pub fn responder(&self) -> Responder {
        let sim = self.clone();
        Box::new(move |frame: &CanFrame| sim.respond(frame))
    }

    pub fn respond(&self, frame: &CanFrame) -> Vec<CanFrame> {
        if frame.id.is_extended() || frame.rtr || frame.len != 8 {
            return Vec::new();
        }
        let address = frame.id.raw() as u16;
        let mut data = [0u8; 8];
        data.copy_from_slice(frame.payload());
        let mut devices = self.lock();

        if address == self.layout.set_id {
            if data[0] == opcode::SET_DEVICE_ID && data[2] == 0 {
                for dev in devices.values_mut() {
                    dev.pending_id = Some(data[7]);
                }
            }
            return Vec::new();
        }
        if address == self.layout.broadcast {
            if data[0] == opcode::RESTART {
                restart_all(&mut devices);
            } else {
                for dev in devices.values_mut() {
                    self.apply(dev, &data);
                }
            }
            return Vec::new();
        }
        let Some(id) = address
            .checked_sub(self.layout.command_base)
            .and_then(|d| u8::try_from(d).ok())
        else {
            return Vec::new();
        };
        if data[0] == opcode::RESTART {
            if let Some(dev) = devices.remove(&id) {
                let new_id = dev.pending_id.unwrap_or(id);
                devices.insert(new_id, SimulatedDevice { pending_id: None, ..dev });
            }
            return Vec::new();
        }
        let Some(dev) = devices.get_mut(&id) else {
            return Vec::new();
        };
        let reply = self.apply(dev, &data);
        if dev.silent {
            trace!(id, "simulated device stays silent");
            return Vec::new();
        }
        reply
            .and_then(|payload| {
                let reply_id = CanId::standard(self.layout.reply_base + u16::from(id))?;
                CanFrame::new(reply_id, &payload)
            })
            .into_iter()
            .collect()
    }

    /// Update the device for one command; returns the payload it would answer with.
    fn apply(&self, dev: &mut SimulatedDevice, data: &[u8; 8]) -> Option<[u8; 8]> {
        let op = data[0];
        let i32_at4 = i32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        match op {
            opcode::READ_STATUS => {}
            opcode::TORQUE => {
                dev.current_a = f64::from(i16::from_le_bytes([data[4], data[5]])) / 1000.0;
                dev.braked = false;
            }
            opcode::SPEED => {
                dev.velocity_dps = f64::from(i32_at4) / 100.0;
                dev.braked = false;
            }
            opcode::POSITION | opcode::POSITION_WITH_SPEED => {
                dev.position_deg = f64::from(i32_at4) / 100.0;
                dev.velocity_dps = 0.0;
                dev.braked = false;
            }
            opcode::READ_PID => return Some(encode_pid_reply(op, &dev.ram_gains)),
            opcode::WRITE_PID_RAM | opcode::WRITE_PID_ROM => {
                let gains = PidGains {
                    current_kp: data[2],
                    current_ki: data[3],
                    speed_kp: data[4],
                    speed_ki: data[5],
                    position_kp: data[6],
                    position_ki: data[7],
                };
                dev.ram_gains = gains;
                if op == opcode::WRITE_PID_ROM {
                    dev.rom_gains = gains;
                }
                return Some(encode_pid_reply(op, &gains));
            }
            opcode::READ_ACCELERATION | opcode::WRITE_ACCELERATION => {
                let kind = AccelKind::from_selector(data[1])?;
                let slot = usize::from(kind.selector());
                if op == opcode::WRITE_ACCELERATION {
                    dev.acceleration[slot] = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
                }
                return Some(encode_acceleration_reply(op, kind, dev.acceleration[slot]));
            }
            opcode::STOP => {
                dev.velocity_dps = 0.0;
                dev.current_a = 0.0;
                return Some(*data);
            }
            opcode::BRAKE => {
                dev.velocity_dps = 0.0;
                dev.braked = true;
                return Some(*data);
            }
            opcode::ZERO_ENCODER_OFFSET | opcode::PERSIST_ZERO => {
                dev.position_deg = 0.0;
                return Some(*data);
            }
            _ => return Some(*data),
        }
        Some(self.status(dev).encode(op))
    }

    fn status(&self, dev: &SimulatedDevice) -> StatusReport {
        let to_i16 = |v: f64| v.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
        StatusReport {
            temperature_c: dev.temperature_c,
            current_raw: to_i16(dev.current_a / self.scale.current_amps_per_lsb),
            velocity_dps: to_i16(dev.velocity_dps),
            position_raw: to_i16(dev.position_deg / self.scale.position_deg_per_lsb),
        }
    }
}

fn restart_all(devices: &mut BTreeMap<u8, SimulatedDevice>) {
    let old = std::mem::take(devices);
    for (id, dev) in old {
        let new_id = dev.pending_id.unwrap_or(id);
        devices.insert(new_id, SimulatedDevice { pending_id: None, ..dev });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode_reply, Command, Reply};

    fn sim() -> SimulatedActuators {
        SimulatedActuators::new(AddressLayout::default(), TelemetryScale::default(), [1, 2])
    }

    fn send(sim: &SimulatedActuators, address: u16, cmd: &Command) -> Vec<CanFrame> {
        let id = CanId::standard(address).unwrap();
        sim.respond(&CanFrame::new(id, &cmd.encode().unwrap()).unwrap())
    }

    #[test]
    fn test_position_command_moves_and_reports() {
        let sim = sim();
        let replies = send(&sim, 0x142, &Command::Position { deg: 45.0 });
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id.raw(), 0x242);
        assert_eq!(
            decode_reply(replies[0].payload()).unwrap(),
            Reply::Status {
                opcode: 0xA3,
                report: StatusReport {
                    temperature_c: 30,
                    current_raw: 0,
                    velocity_dps: 0,
                    position_raw: 45,
                },
            }
        );
        assert_eq!(sim.device(2).unwrap().position_deg, 45.0);
        assert_eq!(sim.device(1).unwrap().position_deg, 0.0);
    }

    #[test]
    fn test_pid_and_acceleration_storage() {
        let sim = sim();
        let gains = PidGains {
            current_kp: 1,
            current_ki: 2,
            speed_kp: 3,
            speed_ki: 4,
            position_kp: 5,
            position_ki: 6,
        };
        send(
            &sim,
            0x141,
            &Command::WritePid {
                gains,
                storage: crate::GainStorage::Rom,
            },
        );
        let dev = sim.device(1).unwrap();
        assert_eq!(dev.rom_gains, gains);
        assert_eq!(dev.ram_gains, gains);

        let kind = AccelKind::VelocityAcceleration;
        send(&sim, 0x141, &Command::WriteAcceleration { kind, value: 1234 });
        let replies = send(&sim, 0x141, &Command::ReadAcceleration(kind));
        assert_eq!(
            decode_reply(replies[0].payload()).unwrap(),
            Reply::Acceleration {
                opcode: 0x42,
                kind,
                value: 1234
            }
        );
    }

    #[test]
    fn test_silent_and_unknown_devices_do_not_answer() {
        let sim = sim();
        sim.set_silent(1, true);
        assert!(send(&sim, 0x141, &Command::Position { deg: 10.0 }).is_empty());
        assert_eq!(sim.device(1).unwrap().position_deg, 10.0);
        assert!(send(&sim, 0x147, &Command::ReadStatus).is_empty());
    }

    #[test]
    fn test_broadcast_applies_to_all_without_reply() {
        let sim = sim();
        assert!(send(&sim, 0x280, &Command::Brake).is_empty());
        assert!(sim.device(1).unwrap().braked);
        assert!(sim.device(2).unwrap().braked);
    }

    #[test]
    fn test_set_id_takes_effect_after_restart() {
        let sim = SimulatedActuators::new(AddressLayout::default(), TelemetryScale::default(), [1]);
        let new_id = crate::NodeId::new(9).unwrap();
        send(&sim, 0x300, &Command::SetDeviceId(new_id));
        assert_eq!(sim.ids(), vec![1]);
        send(&sim, 0x280, &Command::Restart);
        assert_eq!(sim.ids(), vec![9]);
        assert_eq!(send(&sim, 0x149, &Command::Ping)[0].id.raw(), 0x249);
    }
}
