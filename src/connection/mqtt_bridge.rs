//! MQTT bridge connection kind: routes bus messages over a broker using
//! `rumqttc`, for deployments that already run an MQTT fabric and want the
//! bus to ride on top of it rather than open its own sockets.
//!
//! `rumqttc` is not part of the teacher's own dependency stack; it is
//! grounded on the thin-edge.io manifest retrieved alongside the teacher
//! (`other_examples/manifests/thin-edge-thin-edge.io/Cargo.toml`), which
//! uses the same crate for an equivalent device-to-broker bridge.
//!
//! Topic convention (local to this bridge, not a bus requirement — see
//! Open Question 2): a message addressed to a single endpoint is published
//! to `meshbus/<router_id>/<endpoint_id>`; a broadcast is published to
//! `meshbus/broadcast/<class>/<method>`. The bridge subscribes to both its
//! own unicast topic and the broadcast wildcard.

use super::{Connection, ConnectionKind};
use crate::message::codec::{BincodeCodec, MessageCodec};
use crate::message::{EndpointId, Message};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;

fn unicast_topic(router_id: u64, endpoint_id: EndpointId) -> String {
    format!("meshbus/{}/{}", router_id, endpoint_id.0)
}

fn broadcast_topic(class: &str, method: &str) -> String {
    format!("meshbus/broadcast/{}/{}", class, method)
}

fn broadcast_wildcard() -> &'static str {
    "meshbus/broadcast/#"
}

/// A connection bridging to an MQTT broker for one router endpoint.
pub struct MqttBridgeConnection {
    client: AsyncClient,
    router_id: u64,
    local_endpoint: EndpointId,
    max_data_size: usize,
    inbound: mpsc::UnboundedReceiver<Message>,
    usable: bool,
    codec: BincodeCodec,
}

impl MqttBridgeConnection {
    /// Connect to `host:port` and subscribe to this endpoint's unicast and
    /// the broadcast wildcard topics.
    pub async fn connect(host: &str, port: u16, router_id: u64, local_endpoint: EndpointId, max_data_size: usize) -> Result<Self> {
        let client_id = format!("meshbus-{}-{}", router_id, local_endpoint.0);
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(15));

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        client
            .subscribe(unicast_topic(router_id, local_endpoint), QoS::AtLeastOnce)
            .await
            .context("subscribing to unicast topic")?;
        client
            .subscribe(broadcast_wildcard(), QoS::AtLeastOnce)
            .await
            .context("subscribing to broadcast wildcard")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let codec = BincodeCodec;
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Ok(message) = codec.decode(&publish.payload) {
                            if tx.send(message).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            client,
            router_id,
            local_endpoint,
            max_data_size,
            inbound: rx,
            usable: true,
            codec: BincodeCodec,
        })
    }
}

#[async_trait]
impl Connection for MqttBridgeConnection {
    fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    async fn send(&mut self, message: Message) -> Result<bool> {
        if !self.usable {
            return Ok(false);
        }
        let bytes = self.codec.encode(&message)?;
        if bytes.len() > self.max_data_size {
            return Err(anyhow!("message of {} bytes exceeds bridge max {}", bytes.len(), self.max_data_size));
        }
        let topic = if message.is_broadcast() {
            broadcast_topic(&message.message_id.class, &message.message_id.method)
        } else {
            unicast_topic(self.router_id, message.target_id)
        };
        match self.client.publish(topic, QoS::AtLeastOnce, false, bytes).await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.usable = false;
                Err(anyhow!("mqtt publish failed: {}", e))
            }
        }
    }

    async fn fetch_messages(&mut self, max: usize) -> Result<Vec<Message>> {
        let mut out = VecDeque::new();
        while out.len() < max {
            match self.inbound.try_recv() {
                Ok(message) => out.push_back(message),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.usable = false;
                    break;
                }
            }
        }
        Ok(out.into())
    }

    async fn update(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::MqttBridge
    }

    fn type_id(&self) -> &'static str {
        "mqtt-bridge"
    }

    fn cleanup(&mut self) {
        self.usable = false;
    }
}
