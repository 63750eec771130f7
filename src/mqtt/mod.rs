pub mod client;

use async_trait::async_trait;
use thiserror::Error;

/// A raw message delivered on a subscribed topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to reach broker: {0}")]
    Transport(String),

    #[error("broker rejected connection: {0:?}")]
    Rejected(rumqttc::ConnectReturnCode),

    #[error("a session is already active")]
    SessionActive,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Outbound half of an established broker session. The inbound half is the
/// message stream handed out at connect time.
#[async_trait]
pub trait TransportLink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    /// Best-effort; the session is unusable afterwards either way.
    async fn disconnect(&self);
}
