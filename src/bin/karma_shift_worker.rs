//! karma-shift-worker: shift-service event consumer
//!
//! Keeps the shift store consistent with the rest of the system by reacting
//! to lifecycle events of other services.
//!
//! ## Architecture
//! ```text
//! [employee-service] --employee.deleted--> shift-service.employee.deleted --> ShiftCleanupHandler
//! [event-service]    --event.created-----> shift-service.event.created    --> ShiftGenerationHandler
//! [event-service]    --event.deleted-----> shift-service.event.deleted    --> EventShiftsCleanupHandler
//! ```
//!
//! ## Configuration
//! - KARMA_BUS_CONFIG: path to a YAML configuration file (optional)
//! - KARMA__BROKER__HOST etc.: per-field overrides
//! - KARMA_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use karma_bus::broker::AmqpConnector;
use karma_bus::config::MessagingConfig;
use karma_bus::events::{EmployeeDeleted, EventCreated, EventDeleted};
use karma_bus::handlers::{
    EventShiftsCleanupHandler, InMemoryShiftRepository, ShiftCleanupHandler,
    ShiftGenerationHandler,
};
use karma_bus::registry::queues;
use karma_bus::utils::bootstrap::{init_tracing, shutdown_signal};
use karma_bus::{ConnectionManager, DispatchSupervisor, RoutingTable, SupervisorState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = MessagingConfig::load(None)?;
    info!(broker = %config.broker.redacted_uri(), "karma-shift-worker starting");

    let routes = Arc::new(RoutingTable::karma_kebab(&config.dead_letter)?);
    let connection = ConnectionManager::connect(
        Arc::new(AmqpConnector::new(config.broker.clone())),
        config.reconnect.clone(),
        Arc::new(routes.topology().clone()),
    )
    .await?;

    // The shift store is owned by the shift service; this process keeps its
    // own copy until it is wired to the service database.
    let repository = Arc::new(InMemoryShiftRepository::new());

    let mut supervisor = DispatchSupervisor::new(
        Arc::clone(&connection),
        routes,
        config.subscriber.clone(),
        &config.reconnect,
    );
    supervisor.register::<EmployeeDeleted, _>(
        queues::SHIFT_SERVICE_EMPLOYEE_DELETED,
        ShiftCleanupHandler::new(Arc::clone(&repository)),
    )?;
    supervisor.register::<EventCreated, _>(
        queues::SHIFT_SERVICE_EVENT_CREATED,
        ShiftGenerationHandler::new(Arc::clone(&repository)),
    )?;
    supervisor.register::<EventDeleted, _>(
        queues::SHIFT_SERVICE_EVENT_DELETED,
        EventShiftsCleanupHandler::new(Arc::clone(&repository)),
    )?;

    supervisor.start_all().await?;
    info!("karma-shift-worker consuming");

    let mut state = supervisor.subscribe_state();
    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = state.wait_for(|s| matches!(s, SupervisorState::Failed(_))) => {
            error!(state = ?supervisor.state(), "Supervisor gave up");
        }
    }

    if let Err(e) = supervisor.stop_all().await {
        error!(error = %e, "Unclean shutdown");
        return Err(e.into());
    }

    for (queue, stats) in supervisor.stats() {
        info!(
            queue = %queue,
            delivered = stats.delivered,
            acked = stats.acked,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            poison = stats.poison,
            "Subscriber totals"
        );
    }

    Ok(())
}
