//! Honeywell security sensor handling.
//!
//! Telemetry flows `record` → `router` → `sink`. Sensors that no logical
//! device has claimed yet are tracked by the `registry`, which also owns the
//! bindings between sensor serials and logical devices.

pub mod loops;
pub mod record;
pub mod registry;
pub mod router;
pub mod sink;

pub use loops::Loop;
pub use record::SensorRecord;
pub use registry::{BindOutcome, DeviceState, LogicalDevice, Registry};
pub use router::{EventRouter, RouteOutcome};
pub use sink::{AttributeValue, ChannelSink, DeviceSink, SinkEvent};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// What a logical device represents to the user.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SensorKind {
    /// Door/window contact: reports open/close.
    Contact,
    /// Motion detector: reports active/inactive.
    Motion,
}
