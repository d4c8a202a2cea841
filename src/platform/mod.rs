// src/platform/mod.rs

//! Device-side collaborators
//!
//! The update pipeline never talks to the platform directly. Identity,
//! telemetry, and host utilities sit behind small traits so the pipeline
//! can be driven against real devices or recording fakes.

mod events;
mod host;
mod identity;

pub use events::{EventSink, LogEventCommand, TracingEvents, sanitize_param};
pub use host::{HostOps, SystemHost};
pub use identity::{
    BUILD_TARGET_PROP, DeviceIdentity, OS_VERSION_PROP, PropertyIdentity, SERIALNO_PROP,
    VICTOR_VERSION_PROP,
};
