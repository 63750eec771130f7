use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BrokerConfig, DeviceConfig};

use super::{ConnectError, InboundMessage, PublishError, TransportLink};

/// An established broker session: the client for outbound traffic plus a
/// reader task that forwards inbound publishes over a channel. The channel
/// closing signals that the connection is gone; there is no reconnect here —
/// a replacement session needs a fresh client id.
pub struct MqttSession {
    client: AsyncClient,
    reader: JoinHandle<()>,
}

impl MqttSession {
    /// Connect, wait for the broker's CONNACK, subscribe to the status
    /// topic, and hand back the inbound message stream.
    pub async fn connect(
        broker: &BrokerConfig,
        device: &DeviceConfig,
        client_id: &str,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), ConnectError> {
        let mut mqttopts = MqttOptions::new(client_id, &broker.host, broker.port);
        mqttopts.set_keep_alive(Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&broker.username, &broker.password) {
            mqttopts.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttopts, 100);

        let connack = tokio::time::timeout(broker.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => {}
                    Err(e) => return Err(ConnectError::Transport(e.to_string())),
                }
            }
        })
        .await
        .map_err(|_| ConnectError::Transport("timed out waiting for CONNACK".into()))??;

        if connack.code != ConnectReturnCode::Success {
            return Err(ConnectError::Rejected(connack.code));
        }
        info!("Connected to MQTT broker");

        client
            .subscribe(device.status_topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;
        debug!("Subscribed to `{}`", device.status_topic);

        let (inbound_tx, inbound_rx) = mpsc::channel(100);
        let reader = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let msg = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if inbound_tx.send(msg).await.is_err() {
                            debug!("Inbound channel closed, stopping reader");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Dropping the sender tells the engine the session
                        // is gone.
                        error!("MQTT connection error: {e}");
                        break;
                    }
                }
            }
        });

        Ok((Self { client, reader }, inbound_rx))
    }
}

#[async_trait]
impl TransportLink for MqttSession {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| PublishError(e.to_string()))
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("Disconnect failed: {e}");
        }
        self.reader.abort();
    }
}
