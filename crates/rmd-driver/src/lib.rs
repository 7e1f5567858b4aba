//! rmd-driver: multi-axis servo actuator driver over a shared CAN bus
//!
//! Commands go out as 8-byte frames on `command_base + id`; devices answer on
//! `reply_base + id`. A [`Dispatcher`] routes every inbound frame to a per-device
//! [`TelemetryStore`] slot while the control loop paces setpoint transmission
//! (Idle → Homing → Running → Stopping → Idle). [`Driver`] ties the pieces together.

mod error;
pub use error::{DriverError, Result};

mod types;
pub use types::*;

mod encode;
pub use encode::{opcode, Command, CommandFrame};

mod decode;
pub use decode::{
    decode_reply, decode_status, encode_acceleration_reply, encode_pid_reply, is_status_opcode,
    Reply, StatusReport,
};

mod address;
pub use address::{AddressLayout, AddressMap};

mod store;
pub use store::TelemetryStore;

mod replies;
pub use replies::ReplyBoard;

mod metrics;
pub use metrics::{BusMetrics, MetricsHub};

pub mod clock;
pub use clock::{Clock, MonotonicClock, Pacer, TickOutcome};

mod trajectory;
pub use trajectory::{Setpoints, Sinusoid, Trajectory};

pub mod transport;
pub use transport::{BusTransport, FrameHandler, Transport};

mod dispatch;
pub use dispatch::Dispatcher;

pub mod config;
pub use config::{load_config_file, ControlConfig, DriverConfig, Handshake, HomingConfig, StopMode};

mod control;
pub use control::{LoopState, RunReport, TickObserver, TickSample, TrackingEntry};

mod driver;
pub use driver::Driver;

pub mod sim;
pub use sim::{SimulatedActuators, SimulatedDevice};
