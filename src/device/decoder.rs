use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::{ContactState, DeviceFamily, DeviceStateValue, LeakState, PowerState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not a valid status message: {0}")]
    MalformedPayload(String),

    #[error("payload has no usable `{0}` field")]
    MissingField(&'static str),
}

// Status payloads as Zigbee2MQTT publishes them. Devices attach plenty of
// extra fields (battery, link quality); only the state-bearing one matters.
#[derive(Deserialize)]
struct PlugStatus {
    #[serde(default)]
    state: Option<String>,
}

#[derive(Deserialize)]
struct ContactStatus {
    #[serde(default)]
    contact: Option<bool>,
}

#[derive(Deserialize)]
struct LeakStatus {
    #[serde(default)]
    water_leak: Option<bool>,
    #[serde(default)]
    water: Option<bool>,
}

/// Parse an inbound status payload into a normalized state value.
/// Pure and synchronous; malformed or field-less payloads never touch
/// engine state.
pub fn decode(payload: &[u8], family: DeviceFamily) -> Result<DeviceStateValue, DecodeError> {
    match family {
        DeviceFamily::Plug => {
            let status: PlugStatus = parse(payload)?;
            let state = status.state.ok_or(DecodeError::MissingField("state"))?;
            match state.as_str() {
                "ON" => Ok(DeviceStateValue::Power(PowerState::On)),
                "OFF" => Ok(DeviceStateValue::Power(PowerState::Off)),
                other => Err(DecodeError::MalformedPayload(format!(
                    "unrecognized state {other:?}"
                ))),
            }
        }
        DeviceFamily::ContactSensor => {
            let status: ContactStatus = parse(payload)?;
            let contact = status.contact.ok_or(DecodeError::MissingField("contact"))?;
            // contact=false means the sensor halves are apart.
            let state = if contact {
                ContactState::Closed
            } else {
                ContactState::Open
            };
            Ok(DeviceStateValue::Contact(state))
        }
        DeviceFamily::LeakSensor => {
            let status: LeakStatus = parse(payload)?;
            // `water_leak` wins over the legacy `water` field.
            let wet = status
                .water_leak
                .or(status.water)
                .ok_or(DecodeError::MissingField("water_leak"))?;
            let state = if wet {
                LeakState::LeakDetected
            } else {
                LeakState::Dry
            };
            Ok(DeviceStateValue::Leak(state))
        }
    }
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|e| DecodeError::MalformedPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plug_state_decodes_both_ways() {
        assert_eq!(
            decode(br#"{"state":"ON"}"#, DeviceFamily::Plug),
            Ok(DeviceStateValue::Power(PowerState::On))
        );
        assert_eq!(
            decode(br#"{"state":"OFF"}"#, DeviceFamily::Plug),
            Ok(DeviceStateValue::Power(PowerState::Off))
        );
    }

    #[test]
    fn plug_ignores_extra_fields() {
        let payload = br#"{"state":"ON","linkquality":134,"power":12}"#;
        assert_eq!(
            decode(payload, DeviceFamily::Plug),
            Ok(DeviceStateValue::Power(PowerState::On))
        );
    }

    #[test]
    fn plug_unrecognized_state_is_malformed() {
        assert!(matches!(
            decode(br#"{"state":"BLINKING"}"#, DeviceFamily::Plug),
            Err(DecodeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(
            decode(b"not json at all", DeviceFamily::Plug),
            Err(DecodeError::MalformedPayload(_))
        ));
        assert!(matches!(
            decode(b"{\"state\":", DeviceFamily::ContactSensor),
            Err(DecodeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn missing_family_field_is_reported() {
        assert_eq!(
            decode(br#"{"battery":97}"#, DeviceFamily::Plug),
            Err(DecodeError::MissingField("state"))
        );
        assert_eq!(
            decode(br#"{"battery":97}"#, DeviceFamily::ContactSensor),
            Err(DecodeError::MissingField("contact"))
        );
        assert_eq!(
            decode(br#"{"battery":97}"#, DeviceFamily::LeakSensor),
            Err(DecodeError::MissingField("water_leak"))
        );
    }

    #[test]
    fn contact_mapping_is_inverted() {
        assert_eq!(
            decode(br#"{"contact":false}"#, DeviceFamily::ContactSensor),
            Ok(DeviceStateValue::Contact(ContactState::Open))
        );
        assert_eq!(
            decode(br#"{"contact":true}"#, DeviceFamily::ContactSensor),
            Ok(DeviceStateValue::Contact(ContactState::Closed))
        );
    }

    #[test]
    fn leak_decodes_water_leak_field() {
        assert_eq!(
            decode(br#"{"water_leak":true}"#, DeviceFamily::LeakSensor),
            Ok(DeviceStateValue::Leak(LeakState::LeakDetected))
        );
        assert_eq!(
            decode(br#"{"water_leak":false}"#, DeviceFamily::LeakSensor),
            Ok(DeviceStateValue::Leak(LeakState::Dry))
        );
    }

    #[test]
    fn leak_falls_back_to_legacy_water_field() {
        assert_eq!(
            decode(br#"{"water":true}"#, DeviceFamily::LeakSensor),
            Ok(DeviceStateValue::Leak(LeakState::LeakDetected))
        );
    }

    #[test]
    fn water_leak_takes_precedence_over_water() {
        assert_eq!(
            decode(br#"{"water_leak":false,"water":true}"#, DeviceFamily::LeakSensor),
            Ok(DeviceStateValue::Leak(LeakState::Dry))
        );
    }
}
