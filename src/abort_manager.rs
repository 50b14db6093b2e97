use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::chat_manager::stream::StreamControl;
use crate::error::{AppError, AppResult};

/// Live streams by request id, so a caller holding only the id can cancel.
#[derive(Clone)]
pub struct AbortRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<StreamControl>>>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn register(&self, request_id: String, control: Arc<StreamControl>) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(request_id, control);
        }
    }

    /// Cancels the stream and returns the content it had already delivered.
    pub fn abort(&self, request_id: &str) -> AppResult<String> {
        let control = {
            let mut map = self
                .inner
                .lock()
                .map_err(|_| AppError::from("Failed to acquire lock on abort registry"))?;
            map.remove(request_id)
        };
        match control {
            Some(control) => {
                tracing::info!(request_id, "aborting stream");
                Ok(control.cancel())
            }
            None => Err(AppError::Other(format!(
                "Request {} not found or already completed",
                request_id
            ))),
        }
    }

    /// Drops the entry for a finished stream. A later stream that reused the id keeps its
    /// own registration.
    pub fn unregister(&self, request_id: &str, control: &Arc<StreamControl>) {
        if let Ok(mut map) = self.inner.lock() {
            if map
                .get(request_id)
                .is_some_and(|current| Arc::ptr_eq(current, control))
            {
                map.remove(request_id);
            }
        }
    }

    pub fn is_registered(&self, request_id: &str) -> bool {
        if let Ok(map) = self.inner.lock() {
            map.contains_key(request_id)
        } else {
            false
        }
    }
}

impl Default for AbortRegistry {
    fn default() -> Self {
        Self::new()
    }
}
