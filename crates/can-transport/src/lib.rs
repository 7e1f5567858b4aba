//! can-transport: CAN bus abstractions for the actuator driver
//!
//! This crate provides the frame types and the blocking [`CanBus`] trait the driver consumes,
//! with feature-gated backends. The default build enables a `mock` backend (an in-process bus
//! with loopback and a pluggable node model) so that binaries and tests run on any host.

mod types;
pub use types::{BusInfo, CanFilter, CanFrame, CanId, Timestamp};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::CanBus;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBus, Responder, DEFAULT_SENT_CAPACITY};

#[cfg(feature = "slcan")]
mod slcan;

#[cfg(feature = "slcan")]
pub use slcan::{SlcanBitrate, SlcanBus};
