use crate::{DriverError, Result};
use core::fmt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bus identity of one actuator, assigned out-of-band with the set-id command.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct NodeId(u8);

impl NodeId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 127;

    pub fn new(id: u8) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&id) {
            Ok(Self(id))
        } else {
            Err(DriverError::InvalidNodeId(id))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for NodeId {
    type Error = DriverError;

    fn try_from(id: u8) -> Result<Self> {
        Self::new(id)
    }
}

impl From<NodeId> for u8 {
    fn from(id: NodeId) -> u8 {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command target: one actuator, or every actuator on the bus at once.
///
/// Broadcast frames get no unicast reply, so anything that waits for an answer
/// only accepts `Individual`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DeviceId {
    Individual(NodeId),
    Broadcast,
}

impl DeviceId {
    pub fn individual(id: u8) -> Result<Self> {
        NodeId::new(id).map(Self::Individual)
    }

    pub fn node(self) -> Option<NodeId> {
        match self {
            Self::Individual(node) => Some(node),
            Self::Broadcast => None,
        }
    }
}

impl From<NodeId> for DeviceId {
    fn from(node: NodeId) -> Self {
        Self::Individual(node)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Individual(node) => write!(f, "{node}"),
            Self::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// PI gains of the three cascaded loops, one byte each on the wire.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub current_kp: u8,
    pub current_ki: u8,
    pub speed_kp: u8,
    pub speed_ki: u8,
    pub position_kp: u8,
    pub position_ki: u8,
}

/// Where written gains land: volatile RAM (0x31) or persistent ROM (0x32).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainStorage {
    Ram,
    Rom,
}

/// Acceleration parameter selected by byte 1 of 0x42/0x43.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccelKind {
    PositionAcceleration,
    PositionDeceleration,
    VelocityAcceleration,
    VelocityDeceleration,
}

impl AccelKind {
    pub const ALL: [AccelKind; 4] = [
        AccelKind::PositionAcceleration,
        AccelKind::PositionDeceleration,
        AccelKind::VelocityAcceleration,
        AccelKind::VelocityDeceleration,
    ];

    pub fn selector(self) -> u8 {
        match self {
            AccelKind::PositionAcceleration => 0x00,
            AccelKind::PositionDeceleration => 0x01,
            AccelKind::VelocityAcceleration => 0x02,
            AccelKind::VelocityDeceleration => 0x03,
        }
    }

    pub fn from_selector(b: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.selector() == b)
    }
}

/// How raw status fields map to physical units.
///
/// Firmware revisions disagree on the current and position resolution, so this is
/// deployment configuration. Check it against a known reply from the actual devices.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryScale {
    pub current_amps_per_lsb: f64,
    pub position_deg_per_lsb: f64,
}

impl Default for TelemetryScale {
    fn default() -> Self {
        Self {
            current_amps_per_lsb: 0.01,
            position_deg_per_lsb: 1.0,
        }
    }
}

/// Latest known state of one actuator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub temperature_c: i8,
    pub current_a: f64,
    pub velocity_dps: i16,
    pub position_deg: f64,
    /// Monotonic time since the driver clock origin; zero until the first reply.
    pub observed_at: Duration,
}

impl TelemetrySnapshot {
    pub fn is_observed(&self) -> bool {
        self.observed_at > Duration::ZERO
    }

    pub fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.observed_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_range() {
        assert!(NodeId::new(0).is_err());
        assert!(NodeId::new(1).is_ok());
        assert!(NodeId::new(127).is_ok());
        assert!(matches!(
            NodeId::new(128),
            Err(DriverError::InvalidNodeId(128))
        ));
    }

    #[test]
    fn test_device_id_variants() {
        let d = DeviceId::individual(3).unwrap();
        assert_eq!(d.node().map(NodeId::get), Some(3));
        assert_eq!(DeviceId::Broadcast.node(), None);
        assert_eq!(DeviceId::Broadcast.to_string(), "broadcast");
    }

    #[test]
    fn test_accel_selector_roundtrip() {
        for kind in AccelKind::ALL {
            assert_eq!(AccelKind::from_selector(kind.selector()), Some(kind));
        }
        assert_eq!(AccelKind::from_selector(4), None);
    }

    #[test]
    fn test_snapshot_age_saturates() {
        let snap = TelemetrySnapshot {
            observed_at: Duration::from_millis(50),
            ..Default::default()
        };
        assert_eq!(snap.age(Duration::from_millis(80)), Duration::from_millis(30));
        assert_eq!(snap.age(Duration::from_millis(10)), Duration::ZERO);
        assert!(!TelemetrySnapshot::default().is_observed());
    }
}
