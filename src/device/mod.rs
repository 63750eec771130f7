pub mod decoder;
pub mod state;

use std::fmt;

use serde_json::json;

/// The kind of Zigbee2MQTT device a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    Plug,
    ContactSensor,
    LeakSensor,
}

impl DeviceFamily {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "plug" | "power-plug" => Some(Self::Plug),
            "contact" | "contact-sensor" => Some(Self::ContactSensor),
            "leak" | "water-leak" => Some(Self::LeakSensor),
            _ => None,
        }
    }

    /// Resolve a raw host command against this family's vocabulary.
    /// Returns the expected device state and the wire payload, or `None`
    /// when the command is not recognized. Sensors accept no commands.
    pub fn resolve_command(&self, raw: &str) -> Option<(DeviceStateValue, Vec<u8>)> {
        match self {
            Self::Plug => {
                let power = if raw.eq_ignore_ascii_case("on") {
                    PowerState::On
                } else if raw.eq_ignore_ascii_case("off") {
                    PowerState::Off
                } else {
                    return None;
                };
                let payload = serde_json::to_vec(&json!({ "state": power.wire() })).ok()?;
                Some((DeviceStateValue::Power(power), payload))
            }
            Self::ContactSensor | Self::LeakSensor => None,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Plug => "plug",
            Self::ContactSensor => "contact-sensor",
            Self::LeakSensor => "water-leak-sensor",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    /// The exact string the device expects and reports on the wire.
    pub fn wire(&self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakState {
    Dry,
    LeakDetected,
}

/// Last known normalized state of the device, one variant per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStateValue {
    Power(PowerState),
    Contact(ContactState),
    Leak(LeakState),
}

impl fmt::Display for DeviceStateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Power(p) => p.wire(),
            Self::Contact(ContactState::Open) => "Open",
            Self::Contact(ContactState::Closed) => "Closed",
            Self::Leak(LeakState::Dry) => "Dry",
            Self::Leak(LeakState::LeakDetected) => "LEAK DETECTED",
        };
        f.write_str(label)
    }
}

/// A one-shot command as received from the host surface. The engine
/// validates it against the device family before anything is published.
#[derive(Debug, Clone)]
pub struct CommandRequest(String);

impl CommandRequest {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Empty-state query published to the get topic to prompt an immediate
/// status push from the device.
pub fn state_query_payload() -> Vec<u8> {
    br#"{"state":""}"#.to_vec()
}
