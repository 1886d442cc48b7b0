//! Shift storage seam used by the shift-service handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::subscriber::HandlerOutcome;

/// Kind of shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftType {
    Normal,
    /// Generated for an event, not yet assigned to a worker.
    Standby,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shift {
    pub id: String,
    pub employee_id: Option<String>,
    pub event_id: Option<String>,
    pub role_id: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub shift_type: ShiftType,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("Shift store unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid shift request: {0}")]
    Invalid(String),
}

impl From<RepositoryError> for HandlerOutcome {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Unavailable(_) => HandlerOutcome::Transient(err.to_string()),
            RepositoryError::Invalid(_) => HandlerOutcome::Permanent(err.to_string()),
        }
    }
}

/// Storage operations the handlers need. Owned by the shift service.
#[async_trait]
pub trait ShiftRepository: Send + Sync + 'static {
    async fn get_shift(&self, id: &str) -> Result<Option<Shift>, RepositoryError>;

    async fn shifts_for_employee(&self, employee_id: &str) -> Result<Vec<Shift>, RepositoryError>;

    async fn shifts_for_event(&self, event_id: &str) -> Result<Vec<Shift>, RepositoryError>;

    /// Insert a shift unless one with the same id exists. Returns whether
    /// it was inserted.
    async fn create_shift(&self, shift: Shift) -> Result<bool, RepositoryError>;

    /// Delete a shift. Returns whether it existed.
    async fn delete_shift(&self, id: &str) -> Result<bool, RepositoryError>;
}

/// Process-local [`ShiftRepository`].
#[derive(Debug, Default)]
pub struct InMemoryShiftRepository {
    shifts: RwLock<HashMap<String, Shift>>,
    unavailable: AtomicBool,
}

impl InMemoryShiftRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`RepositoryError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.shifts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shifts.read().await.is_empty()
    }

    fn check(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RepositoryError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ShiftRepository for InMemoryShiftRepository {
    async fn get_shift(&self, id: &str) -> Result<Option<Shift>, RepositoryError> {
        self.check()?;
        Ok(self.shifts.read().await.get(id).cloned())
    }

    async fn shifts_for_employee(&self, employee_id: &str) -> Result<Vec<Shift>, RepositoryError> {
        self.check()?;
        Ok(self
            .shifts
            .read()
            .await
            .values()
            .filter(|s| s.employee_id.as_deref() == Some(employee_id))
            .cloned()
            .collect())
    }

    async fn shifts_for_event(&self, event_id: &str) -> Result<Vec<Shift>, RepositoryError> {
        self.check()?;
        Ok(self
            .shifts
            .read()
            .await
            .values()
            .filter(|s| s.event_id.as_deref() == Some(event_id))
            .cloned()
            .collect())
    }

    async fn create_shift(&self, shift: Shift) -> Result<bool, RepositoryError> {
        self.check()?;
        if shift.end_time <= shift.start_time {
            return Err(RepositoryError::Invalid(format!(
                "shift {} ends before it starts",
                shift.id
            )));
        }
        let mut shifts = self.shifts.write().await;
        if shifts.contains_key(&shift.id) {
            return Ok(false);
        }
        shifts.insert(shift.id.clone(), shift);
        Ok(true)
    }

    async fn delete_shift(&self, id: &str) -> Result<bool, RepositoryError> {
        self.check()?;
        Ok(self.shifts.write().await.remove(id).is_some())
    }
}
