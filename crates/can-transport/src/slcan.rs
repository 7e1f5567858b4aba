use crate::{BusInfo, CanBus, CanFilter, CanFrame, CanId, Result, TransportError};
use serialport::{SerialPort, SerialPortType};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, trace};

/// SLCAN text protocol over serial (common on USB-CAN dongles)
pub struct SlcanBus {
    port_path: String,
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SlcanBus {
    pub fn open_with(path: &str, bitrate: Option<SlcanBitrate>) -> Result<Self> {
        let mut port = serialport::new(path, 115200)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        // Close, set bitrate, then open the channel
        let _ = Self::write_cmd(&mut *port, b"C\r");
        let bitrate = bitrate.unwrap_or(SlcanBitrate::B1M);
        Self::write_cmd(&mut *port, &[b'S', bitrate.code(), b'\r'])?;
        Self::write_cmd(&mut *port, b"O\r")?;
        debug!(path, ?bitrate, "slcan channel open");
        Ok(SlcanBus {
            port_path: path.to_string(),
            port,
            pending: Vec::with_capacity(64),
        })
    }

    pub fn path(&self) -> &str {
        &self.port_path
    }

    fn encode_frame(frame: &CanFrame) -> Result<Vec<u8>> {
        if frame.rtr {
            return Err(TransportError::Unsupported("RTR not implemented"));
        }
        if frame.len > 8 {
            return Err(TransportError::InvalidFrame("dlc > 8"));
        }
        let mut out = Vec::with_capacity(32);
        if frame.id.is_extended() {
            out.extend_from_slice(format!("T{:08X}", frame.id.raw()).as_bytes());
        } else {
            out.extend_from_slice(format!("t{:03X}", frame.id.raw()).as_bytes());
        }
        out.push(b'0' + frame.len);
        for b in frame.payload() {
            out.extend_from_slice(format!("{b:02X}").as_bytes());
        }
        out.push(b'\r');
        Ok(out)
    }

    fn parse_frame(line: &[u8]) -> Result<CanFrame> {
        let (kind, rest) = line
            .split_first()
            .ok_or(TransportError::InvalidFrame("empty"))?;
        let (id_digits, rtr) = match *kind {
            b't' => (3, false),
            b'r' => (3, true),
            b'T' => (8, false),
            b'R' => (8, true),
            _ => return Err(TransportError::InvalidFrame("unknown header")),
        };
        if rest.len() < id_digits + 1 {
            return Err(TransportError::InvalidFrame("short header"));
        }
        let raw_id = u32::from_str_radix(hex_str(&rest[..id_digits])?, 16)
            .map_err(|_| TransportError::InvalidFrame("id"))?;
        let id = if id_digits == 3 {
            CanId::standard(raw_id as u16)
        } else {
            CanId::extended(raw_id)
        }
        .ok_or(TransportError::InvalidFrame("id range"))?;

        let dlc = rest[id_digits].wrapping_sub(b'0');
        if dlc > 8 {
            return Err(TransportError::InvalidFrame("dlc > 8"));
        }
        let hex = &rest[id_digits + 1..];
        let mut data = [0u8; 8];
        if !rtr {
            for (i, slot) in data.iter_mut().take(usize::from(dlc)).enumerate() {
                let pair = hex
                    .get(i * 2..i * 2 + 2)
                    .ok_or(TransportError::InvalidFrame("short data"))?;
                *slot = u8::from_str_radix(hex_str(pair)?, 16)
                    .map_err(|_| TransportError::InvalidFrame("byte"))?;
            }
        }
        Ok(CanFrame {
            id,
            len: dlc,
            data,
            rtr,
            timestamp: None,
        }
        .stamped_now())
    }

    fn write_cmd(port: &mut dyn SerialPort, cmd: &[u8]) -> Result<()> {
        port.write_all(cmd)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }
}

fn hex_str(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|_| TransportError::InvalidFrame("utf8"))
}

impl CanBus for SlcanBus {
    fn open(path: &str) -> Result<Self>
    where
        Self: Sized,
    {
        Self::open_with(path, Some(SlcanBitrate::B1M))
    }

    fn list() -> Result<Vec<BusInfo>> {
        let ports = serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|p| BusInfo {
                driver: match p.port_type {
                    SerialPortType::UsbPort(_) => "slcan-serial".to_string(),
                    _ => "serial".to_string(),
                },
                name: p.port_name,
            })
            .collect())
    }

    fn set_filters(&mut self, _filters: &[CanFilter]) -> Result<()> {
        let _ = _filters;
        // SLCAN hardware filters are not standardized
        Err(TransportError::Unsupported("slcan filters not supported"))
    }

    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame> {
        if let Some(ms) = timeout_ms {
            if let Err(e) = self.port.set_timeout(Duration::from_millis(ms)) {
                debug!(path = %self.port_path, error = %e, "slcan read timeout not applied");
            }
        }
        let mut buf = [0u8; 128];
        loop {
            // Bell (0x07) is the adapter's NACK
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\r' || b == 0x07) {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                if line.last() == Some(&0x07) {
                    trace!(path = %self.port_path, "slcan adapter rejected a command");
                    continue;
                }
                let trim = &line[..line.len().saturating_sub(1)];
                // Bare acknowledgements ("z", "Z") follow our own transmits
                if trim.is_empty() || trim == b"z" || trim == b"Z" {
                    continue;
                }
                return Self::parse_frame(trim);
            }
            match self.port.read(&mut buf) {
                Ok(n) if n > 0 => self.pending.extend_from_slice(&buf[..n]),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(TransportError::Timeout)
                }
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let line = Self::encode_frame(frame)?;
        self.port
            .write_all(&line)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    fn try_clone(&self) -> Result<Self> {
        let port = self
            .port
            .try_clone()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(SlcanBus {
            port_path: self.port_path.clone(),
            port,
            pending: Vec::with_capacity(64),
        })
    }
}

/// Supported SLCAN bitrates (mapped to Sx codes)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlcanBitrate {
    B10k,  // S0
    B20k,  // S1
    B50k,  // S2
    B100k, // S3
    B125k, // S4
    B250k, // S5
    B500k, // S6
    B800k, // S7
    B1M,   // S8
}

impl SlcanBitrate {
    pub fn code(self) -> u8 {
        match self {
            SlcanBitrate::B10k => b'0',
            SlcanBitrate::B20k => b'1',
            SlcanBitrate::B50k => b'2',
            SlcanBitrate::B100k => b'3',
            SlcanBitrate::B125k => b'4',
            SlcanBitrate::B250k => b'5',
            SlcanBitrate::B500k => b'6',
            SlcanBitrate::B800k => b'7',
            SlcanBitrate::B1M => b'8',
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_standard_frame() {
        let id = CanId::standard(0x141).unwrap();
        let frame = CanFrame::new(id, &[0xA4, 0x00, 0xF4, 0x01]).unwrap();
        let line = SlcanBus::encode_frame(&frame).unwrap();
        assert_eq!(line, b"t1414A400F401\r");
    }

    #[test]
    fn test_parse_standard_and_extended() {
        let f = SlcanBus::parse_frame(b"t24189C200A0005001000").unwrap();
        assert_eq!(f.id.raw(), 0x241);
        assert_eq!(f.len, 8);
        assert_eq!(f.data, [0x9C, 0x20, 0x0A, 0x00, 0x05, 0x00, 0x10, 0x00]);

        let f = SlcanBus::parse_frame(b"T000002412ABCD").unwrap();
        assert!(f.id.is_extended());
        assert_eq!(f.payload(), &[0xAB, 0xCD]);
    }

    #[test]
    fn test_parse_rejects_truncated_data() {
        assert!(SlcanBus::parse_frame(b"t24189C20").is_err());
        assert!(SlcanBus::parse_frame(b"x123").is_err());
        assert!(SlcanBus::parse_frame(b"t2419").is_err());
    }
}
