use std::env;
use std::time::Duration;

use rand::Rng;

use crate::device::DeviceFamily;

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub device: DeviceConfig,
    pub wait: WaitConfig,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub family: DeviceFamily,
    pub status_topic: String,
    /// Publishing `{"state":""}` here prompts an immediate status push.
    pub get_topic: String,
    /// Only command-capable families have one.
    pub command_topic: Option<String>,
    pub client_id_prefix: String,
}

/// Poll cadences for the two bounded waits: the synchronous state query and
/// the post-command confirmation.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    pub query_timeout: Duration,
    pub query_interval: Duration,
    pub confirm_timeout: Duration,
    pub confirm_interval: Duration,
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let family_raw = env_or_default("DEVICE_FAMILY", "plug".to_string());
        let family = DeviceFamily::parse(&family_raw)
            .ok_or_else(|| format!("Unknown DEVICE_FAMILY `{family_raw}` (expected plug, contact, or leak)"))?;

        let config = Self {
            broker: BrokerConfig {
                host: env_or_default("MQTT_BROKER_HOST", "localhost".to_string()),
                port: env_or_default("MQTT_BROKER_PORT", 1883),
                username: env_optional("MQTT_USERNAME"),
                password: env_optional("MQTT_PASSWORD"),
                connect_timeout: Duration::from_secs(env_or_default(
                    "MQTT_CONNECT_TIMEOUT_SECS",
                    10,
                )),
            },
            device: DeviceConfig::for_family(family),
            wait: WaitConfig {
                query_timeout: Duration::from_secs(env_or_default("QUERY_TIMEOUT_SECS", 5)),
                query_interval: Duration::from_millis(env_or_default("QUERY_POLL_MS", 500)),
                confirm_timeout: Duration::from_secs(env_or_default("CONFIRM_TIMEOUT_SECS", 10)),
                confirm_interval: Duration::from_millis(env_or_default("CONFIRM_POLL_MS", 1000)),
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.broker.host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.wait.query_interval.is_zero() || self.wait.confirm_interval.is_zero() {
            return Err("Poll intervals must be > 0".into());
        }
        if self.device.status_topic.is_empty() {
            return Err("STATUS_TOPIC must not be empty".into());
        }
        Ok(())
    }
}

impl DeviceConfig {
    /// Family defaults, each overridable through the environment. The get
    /// and set topics derive from the status topic unless set explicitly.
    fn for_family(family: DeviceFamily) -> Self {
        let status_topic =
            env_or_default("STATUS_TOPIC", default_status_topic(family).to_string());
        let get_topic = env_or_default("GET_TOPIC", format!("{status_topic}/get"));
        let command_topic = match family {
            DeviceFamily::Plug => {
                Some(env_or_default("COMMAND_TOPIC", format!("{status_topic}/set")))
            }
            DeviceFamily::ContactSensor | DeviceFamily::LeakSensor => None,
        };

        Self {
            family,
            status_topic,
            get_topic,
            command_topic,
            client_id_prefix: client_id_prefix(family).to_string(),
        }
    }

    /// Mint a broker client id for a new session. Ids must be unique per
    /// session; a stale id the broker still considers connected would
    /// collide, so every session gets a fresh random suffix.
    pub fn mint_client_id(&self) -> String {
        let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
        format!("{}-{}", self.client_id_prefix, suffix)
    }
}

fn default_status_topic(family: DeviceFamily) -> &'static str {
    match family {
        DeviceFamily::Plug => "zigbee2mqtt/Power Plug",
        DeviceFamily::ContactSensor => "zigbee2mqtt/Contact Sensor",
        DeviceFamily::LeakSensor => "zigbee2mqtt/Water Leak Detector",
    }
}

fn client_id_prefix(family: DeviceFamily) -> &'static str {
    match family {
        DeviceFamily::Plug => "plug-controller",
        DeviceFamily::ContactSensor => "contact-sensor",
        DeviceFamily::LeakSensor => "water-leak-sensor",
    }
}
