//! Subscription workers: one broker subscription per telemetry class.
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeReasonCode,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Broker, WorkerConfig};
use crate::error::{DecodeError, MessageError, TransportError};
use crate::model::TelemetryMessage;
use crate::normalizer::{normalize, Normalized, TelemetryClass};
use crate::store::RecordStore;

const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// A connected broker session with the subscription already requested.
pub struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

pub struct SubscriptionWorker {
    class: TelemetryClass,
    settings: WorkerConfig,
    store: Arc<dyn RecordStore>,
}

impl SubscriptionWorker {
    pub fn new(class: TelemetryClass, settings: WorkerConfig, store: Arc<dyn RecordStore>) -> Self {
        Self {
            class,
            settings,
            store,
        }
    }

    pub fn class(&self) -> TelemetryClass {
        self.class
    }

    pub fn mqtt_options(&self, broker: &Broker) -> Result<MqttOptions, TransportError> {
        let host = broker_host(&broker.host)?;
        let mut options = MqttOptions::new(&self.settings.client_id, host, broker.port);
        options.set_keep_alive(Duration::from_secs(broker.keepalive_seconds));
        options.set_clean_session(true);
        options.set_max_packet_size(broker.max_packet_bytes, broker.max_packet_bytes);
        if let Some(username) = &broker.username {
            options.set_credentials(username, broker.password.as_deref().unwrap_or_default());
        }
        Ok(options)
    }

    /// Connect to the broker and subscribe to this worker's topic. Fails
    /// without entering a receive loop if the broker is unreachable or refuses us.
    #[instrument(skip_all, fields(worker = self.class.as_str(), client_id = %self.settings.client_id))]
    pub async fn connect(&self, broker: &Broker) -> Result<Session, TransportError> {
        let options = self.mqtt_options(broker)?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        info!(host = %broker.host, port = broker.port, "connecting to MQTT broker");

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(code)) => {
                    error!(?code, "broker refused connection");
                    return Err(TransportError::Rejected(code));
                }
                Err(e) => {
                    error!(error = %e, "failed to connect to MQTT broker");
                    return Err(TransportError::Connect(e));
                }
            }
        }
        info!("connected to MQTT broker");

        client
            .subscribe(&self.settings.topic, QoS::AtMostOnce)
            .await
            .map_err(|source| TransportError::Subscribe {
                topic: self.settings.topic.clone(),
                source,
            })?;
        info!(topic = %self.settings.topic, "subscribed to topic");

        Ok(Session { client, eventloop })
    }

    /// Drive the session until the transport fails. Messages are handled one
    /// at a time, in delivery order.
    #[instrument(skip_all, fields(worker = self.class.as_str()))]
    pub async fn run_forever(&self, session: Session) -> TransportError {
        let Session {
            client: _client,
            mut eventloop,
        } = session;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = self.on_message(&publish.topic, &publish.payload).await;
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        error!(topic = %self.settings.topic, "subscription refused by broker");
                        return TransportError::SubscriptionRejected(self.settings.topic.clone());
                    }
                    debug!("subscription acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "MQTT event loop error");
                    return TransportError::Receive(e);
                }
            }
        }
    }

    /// Connect and receive until the transport fails. With a reconnect policy
    /// configured, failures are retried with capped exponential backoff; the
    /// attempt counter resets after every successful connect.
    pub async fn run(&self, broker: &Broker) -> TransportError {
        let mut attempt = 0_u32;
        loop {
            let err = match self.connect(broker).await {
                Ok(session) => {
                    attempt = 0;
                    self.run_forever(session).await
                }
                Err(e) => e,
            };

            let Some(policy) = &broker.reconnect else {
                return err;
            };
            attempt += 1;
            if attempt > policy.max_attempts {
                error!(
                    worker = self.class.as_str(),
                    error = %err,
                    max_attempts = policy.max_attempts,
                    "max reconnect attempts reached"
                );
                return TransportError::RetriesExhausted(policy.max_attempts);
            }
            let delay = policy.delay_for(attempt);
            warn!(
                worker = self.class.as_str(),
                error = %err,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting to MQTT broker"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Handle one inbound message. Every failure is logged here and contained
    /// to this message; the result is returned for callers that care.
    pub async fn on_message(&self, topic: &str, payload: &[u8]) -> Result<(), MessageError> {
        let message = TelemetryMessage {
            topic,
            raw_payload: payload,
            received_at: Utc::now(),
        };
        let result = self.handle(&message).await;
        match &result {
            Ok(()) => {}
            Err(MessageError::Decode(e)) => warn!(worker = self.class.as_str(), topic, error = %e, "dropping undecodable message"),
            Err(MessageError::Parse(e)) => warn!(worker = self.class.as_str(), topic, error = %e, "dropping malformed message"),
            Err(MessageError::Storage(e)) => error!(worker = self.class.as_str(), topic, error = %e, "failed to store record"),
        }
        result
    }

    #[instrument(skip_all, fields(worker = self.class.as_str(), topic = %message.topic, payload_size = message.raw_payload.len()))]
    async fn handle(&self, message: &TelemetryMessage<'_>) -> Result<(), MessageError> {
        let text = std::str::from_utf8(message.raw_payload).map_err(DecodeError)?;
        debug!(payload = text, "message received");

        let record = normalize(self.class, message.topic, text, message.received_at)?;
        if let Normalized::Feeding(feeding) = &record {
            let d = feeding.diagnostics;
            if let Some(angle) = d.angle {
                info!(angle_deg = angle, "feeder angle");
            }
            if let Some(weight) = d.weight {
                info!(weight_g = weight, "food waste weight");
            }
            if let Some(distance) = d.laser_distance {
                info!(laser_distance_mm = distance, "laser distance");
            }
        }

        let collection = record.collection();
        self.store.insert(collection, record.to_row()?).await?;
        info!(
            collection = collection.as_str(),
            pet_id = record.pet_id().unwrap_or("-"),
            "record stored"
        );
        Ok(())
    }
}

/// Accept `host`, `mqtt://host` or `tcp://host`; the port is configured separately.
fn broker_host(raw: &str) -> Result<&str, TransportError> {
    let host = raw
        .trim()
        .trim_start_matches("mqtt://")
        .trim_start_matches("tcp://")
        .trim_end_matches('/');
    if host.is_empty() || host.contains(['/', ':', ' ']) {
        return Err(TransportError::InvalidAddress(raw.to_string()));
    }
    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_host_strips_scheme() {
        assert_eq!(broker_host("broker.emqx.io").unwrap(), "broker.emqx.io");
        assert_eq!(broker_host("mqtt://broker.emqx.io").unwrap(), "broker.emqx.io");
        assert_eq!(broker_host("tcp://10.0.0.5/").unwrap(), "10.0.0.5");
    }

    #[test]
    fn broker_host_rejects_ports_and_paths() {
        assert!(matches!(broker_host("broker:1883"), Err(TransportError::InvalidAddress(_))));
        assert!(matches!(broker_host("mqtt://a/b"), Err(TransportError::InvalidAddress(_))));
        assert!(matches!(broker_host("  "), Err(TransportError::InvalidAddress(_))));
    }
}
