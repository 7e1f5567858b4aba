use can_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = DriverError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("send to 0x{address:03X} failed: {source}")]
    TransportSendFailure {
        address: u16,
        #[source]
        source: TransportError,
    },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("unknown device: {0}")]
    UnknownDevice(u8),
    #[error("operation requires an individual device, not broadcast")]
    BroadcastNotAllowed,
    #[error("telemetry for device {node} is {age:?} old (limit {limit:?})")]
    StaleTelemetry {
        node: u8,
        age: Duration,
        limit: Duration,
    },
    #[error("address conflict: device {node} reply address 0x{address:03X} {reason}")]
    AddressConflict {
        node: u8,
        address: u16,
        reason: &'static str,
    },
    #[error("invalid device id {0} (expected 1..=127)")]
    InvalidNodeId(u8),
    #[error("value out of range for {field}: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("no reply with opcode 0x{opcode:02X} from device {node} within {timeout:?}")]
    Timeout {
        node: u8,
        opcode: u8,
        timeout: Duration,
    },
    #[error("control loop already running")]
    AlreadyRunning,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("control loop worker failed: {0}")]
    Worker(String),
}
