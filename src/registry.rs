//! Routing-key registry.
//!
//! Maps `(entity, action)` pairs to the exchange and routing key producers
//! publish on, and declares the consumer queues bound to them. Producers and
//! consumers derive everything from the same [`RoutingTable`], so bindings
//! always agree with what is published.
//!
//! Routing keys follow `<entity>.<action>`, e.g. `employee.deleted`.

use std::collections::HashMap;
use std::fmt;

use crate::config::DeadLetterConfig;
use crate::error::{BusError, Result};
use crate::topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec, Topology};

/// Topic exchange shared by all entity lifecycle events.
pub const ENTITY_EXCHANGE: &str = "karma-kebab-exchange";
/// Fanout exchange for clock-in notifications.
pub const CLOCK_IN_EXCHANGE: &str = "shift.clockin";

/// Default consumer queue names.
pub mod queues {
    pub const SHIFT_CREATED: &str = "shift.created.queue";
    pub const SHIFT_DELETED: &str = "shift.deleted.queue";
    pub const SHIFT_SERVICE_EMPLOYEE_DELETED: &str = "shift-service.employee.deleted";
    pub const SHIFT_SERVICE_EVENT_CREATED: &str = "shift-service.event.created";
    pub const SHIFT_SERVICE_EVENT_DELETED: &str = "shift-service.event.deleted";
    pub const DUTY_SERVICE_CLOCK_IN: &str = "duty-service.shift.clockin";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Availability,
    Event,
    Employee,
    Shift,
    Truck,
    Duty,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Availability => "availability",
            Self::Event => "event",
            Self::Employee => "employee",
            Self::Shift => "shift",
            Self::Truck => "truck",
            Self::Duty => "duty",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Created,
    Updated,
    Deleted,
    ClockIn,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::ClockIn => "clockin",
        }
    }
}

/// An entity lifecycle transition that is published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub entity: Entity,
    pub action: Action,
}

impl Route {
    pub const fn new(entity: Entity, action: Action) -> Self {
        Self { entity, action }
    }

    /// `<entity>.<action>`.
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.entity.as_str(), self.action.as_str())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity.as_str(), self.action.as_str())
    }
}

/// Where a route is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBinding {
    pub exchange: String,
    pub routing_key: String,
}

/// Immutable routing configuration, built once at startup and shared by `Arc`.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<Route, RouteBinding>,
    topology: Topology,
    dead_letter: Option<String>,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    /// The table shared by the employee, shift and event services.
    pub fn karma_kebab(dead_letter: &DeadLetterConfig) -> Result<Self> {
        use queues::*;

        let mut builder = Self::builder()
            .exchange(ENTITY_EXCHANGE, ExchangeKind::Topic)
            .exchange(CLOCK_IN_EXCHANGE, ExchangeKind::Fanout);

        for entity in [
            Entity::Availability,
            Entity::Event,
            Entity::Employee,
            Entity::Shift,
            Entity::Truck,
            Entity::Duty,
        ] {
            for action in [Action::Created, Action::Updated, Action::Deleted] {
                builder = builder.route(Route::new(entity, action), ENTITY_EXCHANGE);
            }
        }

        builder
            .route(Route::new(Entity::Shift, Action::ClockIn), CLOCK_IN_EXCHANGE)
            .dead_letter(dead_letter)
            .consume(SHIFT_CREATED, Route::new(Entity::Shift, Action::Created))
            .consume(SHIFT_DELETED, Route::new(Entity::Shift, Action::Deleted))
            .consume(
                SHIFT_SERVICE_EMPLOYEE_DELETED,
                Route::new(Entity::Employee, Action::Deleted),
            )
            .consume(
                SHIFT_SERVICE_EVENT_CREATED,
                Route::new(Entity::Event, Action::Created),
            )
            .consume(
                SHIFT_SERVICE_EVENT_DELETED,
                Route::new(Entity::Event, Action::Deleted),
            )
            .consume(
                DUTY_SERVICE_CLOCK_IN,
                Route::new(Entity::Shift, Action::ClockIn),
            )
            .build()
    }

    /// Exchange and routing key for a route.
    pub fn resolve(&self, route: Route) -> Result<&RouteBinding> {
        self.routes
            .get(&route)
            .ok_or_else(|| BusError::UnknownRoute(route.to_string()))
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Whether rejected messages from `queue` are dead-lettered.
    pub fn dead_letters(&self, queue: &str) -> bool {
        self.topology
            .queue(queue)
            .map(|q| q.dead_letter_exchange.is_some())
            .unwrap_or(false)
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter.as_deref()
    }
}

enum QueueDecl {
    Route { queue: String, route: Route },
    Pattern {
        queue: String,
        exchange: String,
        pattern: String,
    },
}

/// Builder for [`RoutingTable`]. Validation happens in [`build`](Self::build).
#[derive(Default)]
pub struct RoutingTableBuilder {
    exchanges: Vec<(String, ExchangeKind)>,
    routes: Vec<(Route, String)>,
    queues: Vec<QueueDecl>,
    dead_letter: Option<(String, String)>,
}

impl RoutingTableBuilder {
    /// Declare a durable exchange.
    pub fn exchange(mut self, name: impl Into<String>, kind: ExchangeKind) -> Self {
        self.exchanges.push((name.into(), kind));
        self
    }

    /// Publish `route` on `exchange` with its derived routing key.
    pub fn route(mut self, route: Route, exchange: impl Into<String>) -> Self {
        self.routes.push((route, exchange.into()));
        self
    }

    /// Declare `queue` and bind it to wherever `route` is published.
    pub fn consume(mut self, queue: impl Into<String>, route: Route) -> Self {
        self.queues.push(QueueDecl::Route {
            queue: queue.into(),
            route,
        });
        self
    }

    /// Declare `queue` bound to `exchange` with an explicit pattern
    /// (e.g. `shift.*`).
    pub fn consume_pattern(
        mut self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        self.queues.push(QueueDecl::Pattern {
            queue: queue.into(),
            exchange: exchange.into(),
            pattern: pattern.into(),
        });
        self
    }

    /// Dead-letter rejected messages from every consumer queue.
    pub fn dead_letter(mut self, config: &DeadLetterConfig) -> Self {
        self.dead_letter = config
            .enabled
            .then(|| (config.exchange.clone(), config.queue.clone()));
        self
    }

    pub fn build(self) -> Result<RoutingTable> {
        let mut topology = Topology::new();
        for (name, kind) in &self.exchanges {
            topology.add_exchange(ExchangeSpec::durable(name.clone(), *kind))?;
        }

        let mut routes = HashMap::new();
        for (route, exchange) in self.routes {
            if topology.exchange(&exchange).is_none() {
                return Err(BusError::Topology(format!(
                    "route '{}' targets undeclared exchange '{}'",
                    route, exchange
                )));
            }
            let binding = RouteBinding {
                exchange,
                routing_key: route.routing_key(),
            };
            if let Some(previous) = routes.insert(route, binding.clone()) {
                if previous != binding {
                    return Err(BusError::Topology(format!(
                        "route '{}' registered on both '{}' and '{}'",
                        route, previous.exchange, binding.exchange
                    )));
                }
            }
        }

        let dead_letter_exchange = match &self.dead_letter {
            Some((exchange, queue)) => {
                topology.add_exchange(ExchangeSpec::durable(exchange.clone(), ExchangeKind::Topic))?;
                topology.add_queue(QueueSpec::durable(queue.clone()))?;
                topology.add_binding(BindingSpec {
                    queue: queue.clone(),
                    exchange: exchange.clone(),
                    pattern: "#".to_string(),
                })?;
                Some(exchange.clone())
            }
            None => None,
        };

        for decl in self.queues {
            let (queue, exchange, pattern) = match decl {
                QueueDecl::Route { queue, route } => {
                    let binding = routes
                        .get(&route)
                        .ok_or_else(|| BusError::UnknownRoute(route.to_string()))?;
                    (queue, binding.exchange.clone(), binding.routing_key.clone())
                }
                QueueDecl::Pattern {
                    queue,
                    exchange,
                    pattern,
                } => (queue, exchange, pattern),
            };

            let mut spec = QueueSpec::durable(queue.clone());
            if let Some(dlx) = &dead_letter_exchange {
                spec = spec.with_dead_letter_exchange(dlx.clone());
            }
            topology.add_queue(spec)?;
            topology.add_binding(BindingSpec {
                queue,
                exchange,
                pattern,
            })?;
        }

        Ok(RoutingTable {
            routes,
            topology,
            dead_letter: dead_letter_exchange,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        RoutingTable::karma_kebab(&DeadLetterConfig::default()).unwrap()
    }

    #[test]
    fn test_routing_keys_are_entity_dot_action() {
        assert_eq!(
            Route::new(Entity::Employee, Action::Deleted).routing_key(),
            "employee.deleted"
        );
        assert_eq!(
            Route::new(Entity::Shift, Action::Created).routing_key(),
            "shift.created"
        );
        assert_eq!(
            Route::new(Entity::Event, Action::Created).to_string(),
            "event.created"
        );
    }

    #[test]
    fn test_resolve_entity_route() {
        let table = table();
        let binding = table
            .resolve(Route::new(Entity::Employee, Action::Deleted))
            .unwrap();
        assert_eq!(binding.exchange, ENTITY_EXCHANGE);
        assert_eq!(binding.routing_key, "employee.deleted");
    }

    #[test]
    fn test_clock_in_goes_to_fanout() {
        let table = table();
        let binding = table
            .resolve(Route::new(Entity::Shift, Action::ClockIn))
            .unwrap();
        assert_eq!(binding.exchange, CLOCK_IN_EXCHANGE);
        assert_eq!(
            table.topology().exchange(CLOCK_IN_EXCHANGE).unwrap().kind,
            ExchangeKind::Fanout
        );
    }

    #[test]
    fn test_unknown_route() {
        let table = RoutingTable::builder()
            .exchange(ENTITY_EXCHANGE, ExchangeKind::Topic)
            .build()
            .unwrap();
        let err = table
            .resolve(Route::new(Entity::Truck, Action::Created))
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownRoute(ref r) if r == "truck.created"));
    }

    #[test]
    fn test_consumer_queues_bound_to_route_key() {
        let table = table();
        let binding = table
            .topology()
            .bindings()
            .iter()
            .find(|b| b.queue == queues::SHIFT_SERVICE_EMPLOYEE_DELETED)
            .unwrap();
        assert_eq!(binding.exchange, ENTITY_EXCHANGE);
        assert_eq!(binding.pattern, "employee.deleted");
        assert!(table.dead_letters(queues::SHIFT_SERVICE_EMPLOYEE_DELETED));
        assert!(!table.dead_letters("karma-kebab.dead-letter"));
    }

    #[test]
    fn test_dead_letter_disabled() {
        let config = DeadLetterConfig {
            enabled: false,
            ..Default::default()
        };
        let table = RoutingTable::karma_kebab(&config).unwrap();
        assert!(table.dead_letter_exchange().is_none());
        assert!(!table.dead_letters(queues::SHIFT_CREATED));
        assert!(table.topology().exchange("karma-kebab.dlx").is_none());
    }

    #[test]
    fn test_route_on_undeclared_exchange_rejected() {
        let err = RoutingTable::builder()
            .route(Route::new(Entity::Shift, Action::Created), "missing")
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::Topology(_)));
    }

    #[test]
    fn test_consume_unregistered_route_rejected() {
        let err = RoutingTable::builder()
            .exchange(ENTITY_EXCHANGE, ExchangeKind::Topic)
            .consume("orphan.queue", Route::new(Entity::Duty, Action::Updated))
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownRoute(_)));
    }
}
