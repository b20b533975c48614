//! Reserved in-band body values.
//!
//! These travel as ordinary string bodies but are handled by the connection
//! itself and never reach the application as messages.

use crate::codec::Value;

/// Body of a latency probe. Answered with the responder's current timestamp.
pub const PING: &str = "$ping";

/// Body of a name query. Answered with the responder's logical name.
pub const IDENTIFY: &str = "$identify";

/// Body sent with id 0 immediately before an intentional close.
pub const VCLOSE: &str = "$vclose";

/// Which reserved marker a body carries, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Ping,
    Identify,
    VClose,
}

impl Marker {
    /// Classify a decoded body.
    pub fn of(value: &Value) -> Option<Self> {
        match value.as_str()? {
            PING => Some(Marker::Ping),
            IDENTIFY => Some(Marker::Identify),
            VCLOSE => Some(Marker::VClose),
            _ => None,
        }
    }

    /// The body value for this marker.
    pub fn value(self) -> Value {
        Value::from(match self {
            Marker::Ping => PING,
            Marker::Identify => IDENTIFY,
            Marker::VClose => VCLOSE,
        })
    }
}
