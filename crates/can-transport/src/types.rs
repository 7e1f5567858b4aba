use core::fmt;
use time::OffsetDateTime;

/// 11-bit or 29-bit CAN identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CanId {
    raw: u32,
    extended: bool,
}

impl CanId {
    pub fn standard(id11: u16) -> Option<Self> {
        if id11 <= 0x7FF {
            Some(Self {
                raw: id11 as u32,
                extended: false,
            })
        } else {
            None
        }
    }

    pub fn extended(id29: u32) -> Option<Self> {
        if id29 <= 0x1FFF_FFFF {
            Some(Self {
                raw: id29,
                extended: true,
            })
        } else {
            None
        }
    }

    /// Parse `0x141` or `321`. Values above 0x7FF become extended ids.
    pub fn parse(s: &str) -> Option<Self> {
        let t = s.trim();
        let val = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => t.parse::<u32>().ok()?,
        };
        if val <= 0x7FF {
            Self::standard(val as u16)
        } else {
            Self::extended(val)
        }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }
    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{raw:08X}", raw = self.raw)
        } else {
            write!(f, "0x{raw:03X}", raw = self.raw)
        }
    }
}

/// A classic CAN data frame (at most 8 data bytes)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanFrame {
    pub id: CanId,
    pub len: u8,
    pub data: [u8; 8],
    pub rtr: bool,
    pub timestamp: Option<Timestamp>,
}

impl CanFrame {
    pub fn new(id: CanId, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            len: data.len() as u8,
            data: buf,
            rtr: false,
            timestamp: None,
        })
    }

    /// The valid data bytes (`len` clamped to 8).
    pub fn payload(&self) -> &[u8] {
        let len = usize::from(self.len).min(self.data.len());
        &self.data[..len]
    }

    pub fn stamped_now(mut self) -> Self {
        self.timestamp = Some(Timestamp(OffsetDateTime::now_utc()));
        self
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.id, self.len)?;
        for b in self.payload() {
            write!(f, " {b:02X}")?;
        }
        Ok(())
    }
}

/// Acceptance filter: a frame passes when `frame.id & mask == id & mask`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CanFilter {
    pub id: CanId,
    pub mask: u32,
}

impl CanFilter {
    pub fn accepts(&self, id: CanId) -> bool {
        id.is_extended() == self.id.is_extended()
            && (id.raw() & self.mask) == (self.id.raw() & self.mask)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timestamp(pub OffsetDateTime);

#[derive(Clone, Debug)]
pub struct BusInfo {
    pub name: String,
    pub driver: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_hex_and_decimal() {
        assert_eq!(CanId::parse("0x141"), CanId::standard(0x141));
        assert_eq!(CanId::parse("321"), CanId::standard(321));
        assert_eq!(CanId::parse("0x1000"), CanId::extended(0x1000));
        assert!(CanId::parse("zz").is_none());
    }

    #[test]
    fn test_frame_zero_pads_and_trims_payload() {
        let id = CanId::standard(0x141).unwrap();
        let frame = CanFrame::new(id, &[0x9C, 0x01]).unwrap();
        assert_eq!(frame.data, [0x9C, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(frame.payload(), &[0x9C, 0x01]);
        assert!(CanFrame::new(id, &[0u8; 9]).is_none());
    }

    #[test]
    fn test_filter_window() {
        let filter = CanFilter {
            id: CanId::standard(0x240).unwrap(),
            mask: 0x780,
        };
        assert!(filter.accepts(CanId::standard(0x241).unwrap()));
        assert!(filter.accepts(CanId::standard(0x27F).unwrap()));
        assert!(!filter.accepts(CanId::standard(0x141).unwrap()));
        assert!(!filter.accepts(CanId::extended(0x241).unwrap()));
    }

    #[test]
    fn test_display() {
        let frame = CanFrame::new(CanId::standard(0x241).unwrap(), &[0xA4, 0x00]).unwrap();
        assert_eq!(frame.to_string(), "0x241 [2] A4 00");
    }
}
