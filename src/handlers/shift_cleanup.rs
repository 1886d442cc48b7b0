//! Shift removal when the owning employee or event disappears.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use super::repository::ShiftRepository;
use crate::events::{EmployeeDeleted, EventDeleted};
use crate::subscriber::{EventHandler, HandlerOutcome};

/// Deletes every shift of a deleted employee.
///
/// Re-running it for the same employee finds nothing left and succeeds.
pub struct ShiftCleanupHandler<R> {
    repository: Arc<R>,
}

impl<R: ShiftRepository> ShiftCleanupHandler<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }
}

impl<R: ShiftRepository> EventHandler<EmployeeDeleted> for ShiftCleanupHandler<R> {
    fn handle(&self, event: EmployeeDeleted) -> BoxFuture<'static, HandlerOutcome> {
        let repository = Arc::clone(&self.repository);
        Box::pin(async move {
            if event.employee_id.trim().is_empty() {
                return HandlerOutcome::Permanent("employee id is empty".to_string());
            }

            let shifts = match repository.shifts_for_employee(&event.employee_id).await {
                Ok(shifts) => shifts,
                Err(e) => return e.into(),
            };

            let mut removed = 0usize;
            for shift in &shifts {
                match repository.delete_shift(&shift.id).await {
                    Ok(true) => removed += 1,
                    Ok(false) => debug!(shift_id = %shift.id, "Shift already gone"),
                    Err(e) => return e.into(),
                }
            }

            info!(
                employee_id = %event.employee_id,
                removed,
                "Removed shifts of deleted employee"
            );
            HandlerOutcome::Success
        })
    }
}

/// Deletes the shifts of a cancelled event: those listed in the message
/// plus any still linked to the event.
pub struct EventShiftsCleanupHandler<R> {
    repository: Arc<R>,
}

impl<R: ShiftRepository> EventShiftsCleanupHandler<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }
}

impl<R: ShiftRepository> EventHandler<EventDeleted> for EventShiftsCleanupHandler<R> {
    fn handle(&self, event: EventDeleted) -> BoxFuture<'static, HandlerOutcome> {
        let repository = Arc::clone(&self.repository);
        Box::pin(async move {
            let linked = match repository.shifts_for_event(&event.event_id).await {
                Ok(shifts) => shifts,
                Err(e) => return e.into(),
            };

            let mut ids = event.shift_ids;
            ids.extend(linked.into_iter().map(|s| s.id));
            ids.sort();
            ids.dedup();

            let mut removed = 0usize;
            for id in &ids {
                match repository.delete_shift(id).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => return e.into(),
                }
            }

            info!(event_id = %event.event_id, removed, "Removed shifts of deleted event");
            HandlerOutcome::Success
        })
    }
}
