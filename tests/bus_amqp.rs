//! RabbitMQ integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

use karma_bus::broker::{AmqpConnector, Connector};
use karma_bus::config::{
    BrokerConfig, DeadLetterConfig, PublisherConfig, ReconnectConfig, SubscriberConfig,
};
use karma_bus::events::{ClockIn, ShiftCreated};
use karma_bus::registry::{queues, ENTITY_EXCHANGE};
use karma_bus::topology::ExchangeSpec;
use karma_bus::{
    handler_fn, BusError, ConnectionManager, DispatchSupervisor, ExchangeKind, HandlerOutcome,
    Publisher, RoutingTable, SupervisorState,
};

/// Start RabbitMQ container.
///
/// Returns the container and a broker config pointing at it.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, BrokerConfig) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let config = BrokerConfig {
        host: host.to_string(),
        port,
        connection_name: Some("karma-bus-tests".to_string()),
        ..Default::default()
    };
    println!("RabbitMQ available at: {}", config.redacted_uri());

    (container, config)
}

fn reconnect() -> ReconnectConfig {
    ReconnectConfig {
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        max_attempts: 5,
    }
}

async fn connect(config: &BrokerConfig) -> (Arc<RoutingTable>, Arc<ConnectionManager>) {
    let routes = Arc::new(RoutingTable::karma_kebab(&DeadLetterConfig::default()).unwrap());
    let connection = ConnectionManager::connect(
        Arc::new(AmqpConnector::new(config.clone())),
        reconnect(),
        Arc::new(routes.topology().clone()),
    )
    .await
    .expect("connect to rabbitmq");
    (routes, connection)
}

async fn wait_running(supervisor: &DispatchSupervisor) {
    let mut state = supervisor.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| *s == SupervisorState::Running),
    )
    .await
    .expect("supervisor did not start")
    .expect("state channel closed");
}

#[tokio::test]
async fn test_amqp_publish_and_consume() {
    let (_container, config) = start_rabbitmq().await;
    let (routes, connection) = connect(&config).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut supervisor = DispatchSupervisor::new(
        Arc::clone(&connection),
        Arc::clone(&routes),
        SubscriberConfig::default(),
        &reconnect(),
    );
    supervisor
        .register::<ShiftCreated, _>(
            queues::SHIFT_CREATED,
            handler_fn(move |event: ShiftCreated| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    HandlerOutcome::Success
                }
            }),
        )
        .unwrap();
    supervisor.start_all().await.unwrap();
    wait_running(&supervisor).await;

    let publisher = Publisher::new(Arc::clone(&connection), routes, PublisherConfig::default());
    publisher
        .publish(&ShiftCreated {
            shift_id: "S1".to_string(),
            role_id: 2,
        })
        .await
        .expect("publish with confirms");

    let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no delivery from rabbitmq")
        .unwrap();
    assert_eq!(event.shift_id, "S1");

    let mut stats = supervisor.stats();
    while stats[0].1.acked == 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stats = supervisor.stats();
    }
    assert_eq!(stats[0].1.delivered, 1);

    publisher.close().await.unwrap();
    supervisor.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_amqp_fanout_reaches_clock_in_queue() {
    let (_container, config) = start_rabbitmq().await;
    let (routes, connection) = connect(&config).await;

    let publisher = Publisher::new(Arc::clone(&connection), routes, PublisherConfig::default());
    publisher
        .publish(&ClockIn {
            shift_id: "S3".to_string(),
            timestamp: chrono::Utc::now(),
            role_id: 1,
        })
        .await
        .unwrap();

    let channel = connection.channel().await.unwrap();
    let mut deliveries = channel
        .consume(queues::DUTY_SERVICE_CLOCK_IN, "clockin-probe")
        .await
        .unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(10), deliveries.next())
        .await
        .expect("no clock-in delivery")
        .expect("stream ended")
        .unwrap();
    let event: ClockIn = delivery.envelope().decode().unwrap();
    assert_eq!(event.shift_id, "S3");
    assert_eq!(delivery.envelope().payload_type(), "ClockIn");
    delivery.ack().await.unwrap();

    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_amqp_permanent_failure_dead_lettered() {
    let (_container, config) = start_rabbitmq().await;
    let (routes, connection) = connect(&config).await;

    let mut supervisor = DispatchSupervisor::new(
        Arc::clone(&connection),
        Arc::clone(&routes),
        SubscriberConfig::default(),
        &reconnect(),
    );
    supervisor
        .register::<ShiftCreated, _>(
            queues::SHIFT_CREATED,
            handler_fn(|_event: ShiftCreated| async {
                HandlerOutcome::Permanent("role does not exist".to_string())
            }),
        )
        .unwrap();
    supervisor.start_all().await.unwrap();
    wait_running(&supervisor).await;

    let publisher = Publisher::new(Arc::clone(&connection), routes, PublisherConfig::default());
    publisher
        .publish(&ShiftCreated {
            shift_id: "S2".to_string(),
            role_id: 99,
        })
        .await
        .unwrap();

    let dead_letter = DeadLetterConfig::default();
    let channel = connection.channel().await.unwrap();
    let mut deliveries = channel
        .consume(&dead_letter.queue, "dead-letter-probe")
        .await
        .unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(10), deliveries.next())
        .await
        .expect("nothing dead-lettered")
        .expect("stream ended")
        .unwrap();
    assert_eq!(delivery.envelope().routing_key(), "shift.created");
    let event: ShiftCreated = delivery.envelope().decode().unwrap();
    assert_eq!(event.shift_id, "S2");
    delivery.ack().await.unwrap();

    publisher.close().await.unwrap();
    supervisor.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_amqp_conflicting_exchange_fails_startup() {
    let (_container, config) = start_rabbitmq().await;

    let connector = AmqpConnector::new(config.clone());
    let raw = connector.connect().await.unwrap();
    let channel = raw.open_channel().await.unwrap();
    channel
        .declare_exchange(&ExchangeSpec::durable(ENTITY_EXCHANGE, ExchangeKind::Fanout))
        .await
        .unwrap();
    raw.close().await.unwrap();

    let routes = RoutingTable::karma_kebab(&DeadLetterConfig::default()).unwrap();
    let err = ConnectionManager::connect(
        Arc::new(AmqpConnector::new(config)),
        reconnect(),
        Arc::new(routes.topology().clone()),
    )
    .await
    .err()
    .expect("startup should fail");
    assert!(matches!(err, BusError::Topology(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_amqp_wrong_credentials_is_fatal() {
    let (_container, config) = start_rabbitmq().await;

    let routes = RoutingTable::karma_kebab(&DeadLetterConfig::default()).unwrap();
    let err = ConnectionManager::connect(
        Arc::new(AmqpConnector::new(BrokerConfig {
            password: "wrong".to_string(),
            ..config
        })),
        ReconnectConfig {
            base_delay_ms: 50,
            max_delay_ms: 100,
            max_attempts: 2,
        },
        Arc::new(routes.topology().clone()),
    )
    .await
    .err()
    .expect("bad credentials should fail");
    assert!(matches!(err, BusError::Fatal(_)), "got {:?}", err);
}
