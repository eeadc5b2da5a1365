//! Database health signal.

use parking_lot::Mutex;

/// Receives fatal conditions that take the local database copy offline.
pub trait HealthSignal: Send + Sync {
    /// Mark the database unhealthy. Only the first cause is retained.
    fn panic(&self, cause: &str);

    fn is_healthy(&self) -> bool;
}

/// Health signal that remembers the first panic cause.
#[derive(Debug, Default)]
pub struct DatabaseHealth {
    cause: Mutex<Option<String>>,
}

impl DatabaseHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cause of the first panic, if any.
    pub fn cause(&self) -> Option<String> {
        self.cause.lock().clone()
    }
}

impl HealthSignal for DatabaseHealth {
    fn panic(&self, cause: &str) {
        let mut slot = self.cause.lock();
        if slot.is_none() {
            tracing::error!(cause, "Database panicked");
            *slot = Some(cause.to_string());
        }
    }

    fn is_healthy(&self) -> bool {
        self.cause.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_cause_wins() {
        let health = DatabaseHealth::new();
        assert!(health.is_healthy());

        health.panic("apply failed at 12");
        health.panic("second failure");

        assert!(!health.is_healthy());
        assert_eq!(health.cause().as_deref(), Some("apply failed at 12"));
    }
}
