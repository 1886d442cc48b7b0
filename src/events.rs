//! Typed domain events exchanged between the services.
//!
//! Payloads are JSON with camelCase field names. Each event knows its
//! [`Route`] so producers never spell out routing keys by hand.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::registry::{Action, Entity, Route};

/// An event that can travel over the bus.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Lifecycle transition this event announces.
    const ROUTE: Route;
    /// Stored in the message `type` property.
    const TYPE_NAME: &'static str;

    /// Id of the entity the event is about. Consumers key side effects on it.
    fn entity_id(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftCreated {
    pub shift_id: String,
    pub role_id: i32,
}

impl DomainEvent for ShiftCreated {
    const ROUTE: Route = Route::new(Entity::Shift, Action::Created);
    const TYPE_NAME: &'static str = "ShiftCreated";

    fn entity_id(&self) -> String {
        self.shift_id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftDeleted {
    pub shift_id: String,
}

impl DomainEvent for ShiftDeleted {
    const ROUTE: Route = Route::new(Entity::Shift, Action::Deleted);
    const TYPE_NAME: &'static str = "ShiftDeleted";

    fn entity_id(&self) -> String {
        self.shift_id.clone()
    }
}

/// A worker clocked in for a shift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockIn {
    pub shift_id: String,
    pub timestamp: DateTime<Utc>,
    pub role_id: i32,
}

impl DomainEvent for ClockIn {
    const ROUTE: Route = Route::new(Entity::Shift, Action::ClockIn);
    const TYPE_NAME: &'static str = "ClockIn";

    fn entity_id(&self) -> String {
        self.shift_id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeDeleted {
    pub employee_id: String,
}

impl DomainEvent for EmployeeDeleted {
    const ROUTE: Route = Route::new(Entity::Employee, Action::Deleted);
    const TYPE_NAME: &'static str = "EmployeeDeleted";

    fn entity_id(&self) -> String {
        self.employee_id.clone()
    }
}

/// An event (catering booking) was created and needs staffing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCreated {
    pub event_id: String,
    #[serde(default)]
    pub role_ids: Vec<i32>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Number of shifts to generate.
    pub shifts_number: u32,
}

impl DomainEvent for EventCreated {
    const ROUTE: Route = Route::new(Entity::Event, Action::Created);
    const TYPE_NAME: &'static str = "EventCreated";

    fn entity_id(&self) -> String {
        self.event_id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDeleted {
    pub event_id: String,
    #[serde(default)]
    pub shift_ids: Vec<String>,
}

impl DomainEvent for EventDeleted {
    const ROUTE: Route = Route::new(Entity::Event, Action::Deleted);
    const TYPE_NAME: &'static str = "EventDeleted";

    fn entity_id(&self) -> String {
        self.event_id.clone()
    }
}
