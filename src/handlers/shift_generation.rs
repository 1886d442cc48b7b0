//! Standby shift generation for newly created events.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;
use uuid::Uuid;

use super::repository::{Shift, ShiftRepository, ShiftType};
use crate::events::EventCreated;
use crate::subscriber::{EventHandler, HandlerOutcome};

/// Id of the `index`-th shift generated for `event_id`.
///
/// Stable across redeliveries, so generating twice creates nothing new.
pub fn generated_shift_id(event_id: &str, index: u32) -> String {
    let name = format!("karma-kebab:event:{}:shift:{}", event_id, index);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// Upper bound on `shiftsNumber` accepted from one event.
pub const DEFAULT_MAX_GENERATED_SHIFTS: u32 = 500;

/// Creates `shiftsNumber` standby shifts for a new event.
///
/// Roles are assigned round-robin from the event's role list. Shifts that
/// already exist are left alone. Events asking for more than the configured
/// maximum are rejected as permanent failures.
pub struct ShiftGenerationHandler<R> {
    repository: Arc<R>,
    max_shifts: u32,
}

impl<R: ShiftRepository> ShiftGenerationHandler<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            repository,
            max_shifts: DEFAULT_MAX_GENERATED_SHIFTS,
        }
    }

    pub fn with_max_shifts(mut self, max_shifts: u32) -> Self {
        self.max_shifts = max_shifts;
        self
    }
}

impl<R: ShiftRepository> EventHandler<EventCreated> for ShiftGenerationHandler<R> {
    fn handle(&self, event: EventCreated) -> BoxFuture<'static, HandlerOutcome> {
        let repository = Arc::clone(&self.repository);
        let max_shifts = self.max_shifts;
        Box::pin(async move {
            if event.shifts_number > max_shifts {
                return HandlerOutcome::Permanent(format!(
                    "event {} requests {} shifts, at most {} can be generated",
                    event.event_id, event.shifts_number, max_shifts
                ));
            }
            if event.end_time <= event.start_time {
                return HandlerOutcome::Permanent(format!(
                    "event {} ends at {} before it starts at {}",
                    event.event_id, event.end_time, event.start_time
                ));
            }

            let mut created = 0u32;
            for index in 0..event.shifts_number {
                let role_id = (!event.role_ids.is_empty())
                    .then(|| event.role_ids[index as usize % event.role_ids.len()]);
                let shift = Shift {
                    id: generated_shift_id(&event.event_id, index),
                    employee_id: None,
                    event_id: Some(event.event_id.clone()),
                    role_id,
                    start_time: event.start_time,
                    end_time: event.end_time,
                    shift_type: ShiftType::Standby,
                };
                match repository.create_shift(shift).await {
                    Ok(true) => created += 1,
                    Ok(false) => {}
                    Err(e) => return e.into(),
                }
            }

            info!(
                event_id = %event.event_id,
                requested = event.shifts_number,
                created,
                "Generated standby shifts"
            );
            HandlerOutcome::Success
        })
    }
}
