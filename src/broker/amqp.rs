//! AMQP (RabbitMQ) transport using lapin.
//!
//! One [`AmqpConnection`] per connection manager; channels are cheap and
//! created per purpose (topology, publishing, one per subscriber).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{Acknowledger, BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream};
use crate::config::BrokerConfig;
use crate::envelope::{Envelope, DELIVERY_MODE_PERSISTENT};
use crate::error::{BusError, Result};
use crate::topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec};

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Whether a broker error means the declared topology disagrees with what
/// already exists (or references something missing).
fn is_topology_error(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(e) => matches!(
            e.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
                | AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)
        ),
        _ => false,
    }
}

fn declare_error(what: &str, err: lapin::Error) -> BusError {
    if is_topology_error(&err) {
        BusError::Topology(format!("Failed to declare {}: {}", what, err))
    } else {
        BusError::Connection(format!("Failed to declare {}: {}", what, err))
    }
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(dlx) = &spec.dead_letter_exchange {
        args.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(dlx.clone().into()),
        );
    }
    args
}

fn publish_properties(envelope: &Envelope) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type(envelope.content_type().into())
        .with_message_id(envelope.message_id().into())
        .with_timestamp(envelope.timestamp().max(0) as u64);
    let properties = if envelope.payload_type().is_empty() {
        properties
    } else {
        properties.with_type(envelope.payload_type().into())
    };
    let properties = if envelope.headers().is_empty() {
        properties
    } else {
        properties.with_headers(header_table(envelope.headers()))
    };
    if envelope.persistent() {
        properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT)
    } else {
        properties
    }
}

/// Envelope headers as AMQP long strings.
fn header_table(headers: &HashMap<String, String>) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| {
            (
                key.as_str().into(),
                AMQPValue::LongString(value.as_str().into()),
            )
        })
        .collect();
    FieldTable::from(table)
}

/// String-valued AMQP headers. Other value types are skipped.
fn envelope_headers(table: &Option<FieldTable>) -> HashMap<String, String> {
    let Some(table) = table else {
        return HashMap::new();
    };
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok()?.to_string(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn short_string(value: &Option<ShortString>) -> String {
    value
        .as_ref()
        .map(|s| s.as_str().to_string())
        .unwrap_or_default()
}

fn to_envelope(delivery: &mut lapin::message::Delivery) -> Envelope {
    let props = &delivery.properties;
    Envelope::received(
        delivery.routing_key.as_str().to_string(),
        short_string(props.kind()),
        std::mem::take(&mut delivery.data),
        short_string(props.content_type()),
        *props.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
        short_string(props.message_id()),
        props.timestamp().map(|t| t as i64).unwrap_or_default(),
        envelope_headers(props.headers()),
    )
}

// ============================================================================
// Connector
// ============================================================================

/// Opens lapin connections to the configured broker.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.config.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let conn = Connection::connect(&self.config.amqp_uri(), properties)
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let notify = Arc::clone(&closed_tx);
        conn.on_error(move |err| {
            error!(error = %err, "AMQP connection error");
            notify.send_replace(true);
        });

        info!(broker = %self.config.redacted_uri(), "Connected to AMQP");

        Ok(Arc::new(AmqpConnection {
            conn,
            closed: closed_tx,
        }))
    }

    fn describe(&self) -> String {
        self.config.redacted_uri()
    }
}

// ============================================================================
// Connection
// ============================================================================

struct AmqpConnection {
    conn: Connection,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;
        Ok(Arc::new(AmqpChannel {
            channel,
            confirms: AtomicBool::new(false),
        }))
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow() && self.conn.status().connected()
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        if !self.conn.status().connected() {
            return Ok(());
        }
        self.conn
            .close(200, "shutdown")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))
    }
}

// ============================================================================
// Channel
// ============================================================================

struct AmqpChannel {
    channel: Channel,
    confirms: AtomicBool,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.channel
            .exchange_declare(
                &spec.name,
                lapin_kind(spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(&format!("exchange '{}'", spec.name), e))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await
            .map(|_| ())
            .map_err(|e| declare_error(&format!("queue '{}'", spec.name), e))
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                declare_error(
                    &format!("binding '{}' -> '{}'", binding.exchange, binding.queue),
                    e,
                )
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Publish(format!("Failed to enable confirms: {}", e)))?;
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                envelope.routing_key(),
                BasicPublishOptions::default(),
                envelope.payload(),
                publish_properties(envelope),
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirm failed: {}", e)))?;

        if self.confirms.load(Ordering::SeqCst) && confirmation.is_nack() {
            return Err(BusError::Publish(format!(
                "Broker rejected message {}",
                envelope.message_id()
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer started");

        let stream = consumer.map(|delivery| match delivery {
            Ok(mut delivery) => {
                let envelope = to_envelope(&mut delivery);
                Ok(Delivery::new(
                    envelope,
                    delivery.delivery_tag,
                    delivery.redelivered,
                    Box::new(AmqpAcker {
                        acker: delivery.acker,
                    }),
                ))
            }
            Err(e) => Err(BusError::Connection(format!("Consumer delivery error: {}", e))),
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to cancel consumer: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "closing")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close channel: {}", e)))
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to ack: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Connection(format!("Failed to nack: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_mapping() {
        assert!(matches!(lapin_kind(ExchangeKind::Topic), lapin::ExchangeKind::Topic));
        assert!(matches!(lapin_kind(ExchangeKind::Direct), lapin::ExchangeKind::Direct));
        assert!(matches!(lapin_kind(ExchangeKind::Fanout), lapin::ExchangeKind::Fanout));
    }

    #[test]
    fn test_queue_arguments_carry_dead_letter_exchange() {
        let plain = queue_arguments(&QueueSpec::durable("shift.created.queue"));
        assert!(plain.inner().is_empty());

        let args = queue_arguments(
            &QueueSpec::durable("shift.created.queue").with_dead_letter_exchange("karma-kebab.dlx"),
        );
        let key: ShortString = DEAD_LETTER_EXCHANGE_ARG.into();
        assert_eq!(
            args.inner().get(&key),
            Some(&AMQPValue::LongString("karma-kebab.dlx".into()))
        );
    }

    #[test]
    fn test_publish_properties_are_persistent_json() {
        let envelope =
            Envelope::encode("shift.created", "ShiftCreated", &serde_json::json!({"shiftId": "S1"}))
                .unwrap();
        let props = publish_properties(&envelope);
        assert_eq!(*props.delivery_mode(), Some(DELIVERY_MODE_PERSISTENT));
        assert_eq!(
            props.content_type().as_ref().map(|s| s.as_str()),
            Some("application/json")
        );
        assert_eq!(props.kind().as_ref().map(|s| s.as_str()), Some("ShiftCreated"));
        assert_eq!(
            props.message_id().as_ref().map(|s| s.as_str()),
            Some(envelope.message_id())
        );
    }

    #[test]
    fn test_string_headers_survive_the_wire_format() {
        let headers = HashMap::from([
            (
                "traceparent".to_string(),
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
            ),
            ("tracestate".to_string(), "karma=1".to_string()),
        ]);
        let envelope = Envelope::encode("shift.created", "ShiftCreated", &vec![1])
            .unwrap()
            .with_headers(headers.clone());

        let props = publish_properties(&envelope);
        assert_eq!(envelope_headers(props.headers()), headers);
    }

    #[test]
    fn test_non_string_headers_are_skipped() {
        let mut table = FieldTable::default();
        table.insert("x-death-count".into(), AMQPValue::LongLongInt(3));
        table.insert("origin".into(), AMQPValue::LongString("employee-service".into()));

        let headers = envelope_headers(&Some(table));
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["origin"], "employee-service");
        assert!(envelope_headers(&None).is_empty());
    }

    #[test]
    fn test_connector_describe_hides_password() {
        let connector = AmqpConnector::new(BrokerConfig {
            password: "secret".to_string(),
            ..Default::default()
        });
        assert!(!connector.describe().contains("secret"));
    }
}
