//! Thread-safe buffer of pending alerts.

use std::sync::Mutex;

use crate::alert::Alert;

/// Pools alerts posted since the last drain.
///
/// All operations serialize on one mutex with short critical sections; no
/// callbacks run under the lock.
#[derive(Default)]
pub struct AlertPool {
    alerts: Mutex<Vec<Alert>>,
}

impl AlertPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an alert.
    pub fn put(&self, a: Alert) {
        self.alerts.lock().unwrap().push(a);
    }

    /// Whether the pool currently holds no alerts.
    pub fn is_empty(&self) -> bool {
        self.alerts.lock().unwrap().is_empty()
    }

    /// A deep copy of the pooled alerts, for inspection. Does not drain.
    pub fn peek(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    /// Return the pooled alerts and reset the buffer, transferring
    /// ownership of the underlying storage.
    pub fn take(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock().unwrap())
    }
}
