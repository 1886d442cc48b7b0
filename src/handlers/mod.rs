//! Shift-service event handlers.
//!
//! - `ShiftCleanupHandler`: `employee.deleted` removes the employee's shifts
//! - `EventShiftsCleanupHandler`: `event.deleted` removes the event's shifts
//! - `ShiftGenerationHandler`: `event.created` generates standby shifts
//!
//! All of them are idempotent and report store outages as transient
//! failures, invalid input as permanent ones.

mod repository;
mod shift_cleanup;
mod shift_generation;

pub use repository::{InMemoryShiftRepository, RepositoryError, Shift, ShiftRepository, ShiftType};
pub use shift_cleanup::{EventShiftsCleanupHandler, ShiftCleanupHandler};
pub use shift_generation::{
    generated_shift_id, ShiftGenerationHandler, DEFAULT_MAX_GENERATED_SHIFTS,
};
