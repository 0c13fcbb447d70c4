use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkCommandBatch {
    pub tokens: Vec<String>,
    pub valid: bool,
    pub consumed: bool,
}

#[derive(Debug, Default)]
pub struct UplinkCommandStore {
    batch: Mutex<UplinkCommandBatch>,
}

impl UplinkCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new batch, unconditionally replacing the current one.
    pub fn publish(&self, tokens: Vec<String>) {
        *self.lock() = UplinkCommandBatch {
            tokens,
            valid: true,
            consumed: false,
        };
    }

    /// Tokens of the current batch while it is valid. Does not mark it
    /// consumed; call [`acknowledge`](Self::acknowledge) for that.
    pub fn take_if_pending(&self) -> Option<Vec<String>> {
        let batch = self.lock();
        batch.valid.then(|| batch.tokens.clone())
    }

    pub fn acknowledge(&self) {
        self.lock().consumed = true;
    }

    /// Re-open the slot once the batch is empty or has been consumed.
    /// Returns whether a reset happened.
    pub fn reset_if_stale(&self) -> bool {
        let mut batch = self.lock();
        if batch.tokens.is_empty() || batch.consumed {
            batch.valid = false;
            batch.consumed = false;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> UplinkCommandBatch {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, UplinkCommandBatch> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
