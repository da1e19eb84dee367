//! Variable storage and subscription interface for the edgescript engine.
//!
//! The engine never talks to a concrete variable backend directly; it goes
//! through the [`VariableStore`] trait. A backend stores process variables by
//! id, lets consumers read and write them, and delivers change notifications
//! to subscribed callbacks.
//!
//! [`MemoryStore`] is the in-process reference backend. Small deployments run
//! on it directly and the engine's test suite uses it as its storage fake.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for variable storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VarError {
    /// The requested variable id is not present in the store.
    #[error("variable not found: {0}")]
    NotFound(String),

    /// The backend failed internally (I/O, bus, lock poisoning).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A change notification delivered to subscription callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableUpdate {
    /// Id of the variable that changed.
    pub variable_id: String,
    /// The new value.
    pub value: Value,
    /// When the write was applied.
    pub timestamp: DateTime<Utc>,
}

/// Callback invoked for every update to a subscribed variable.
pub type UpdateCallback = Arc<dyn Fn(VariableUpdate) + Send + Sync>;

/// Interface to a variable storage backend.
///
/// Implementations must be safe to share across threads; the engine reads
/// variables from script host functions and worker tasks concurrently.
pub trait VariableStore: Send + Sync {
    /// Read a single variable.
    ///
    /// # Errors
    ///
    /// Returns [`VarError::NotFound`] if the id is unknown.
    fn read_var(&self, id: &str) -> Result<Value, VarError>;

    /// Read several variables at once. Unknown ids are omitted from the
    /// result rather than failing the whole batch.
    ///
    /// # Errors
    ///
    /// Returns an error only if the backend itself fails.
    fn read_vars(&self, ids: &[String]) -> Result<HashMap<String, Value>, VarError>;

    /// Write a single variable, notifying subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the write.
    fn write_var(&self, id: &str, value: Value) -> Result<(), VarError>;

    /// Write several variables, notifying subscribers per variable.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects any write.
    fn write_vars(&self, values: HashMap<String, Value>) -> Result<(), VarError>;

    /// Subscribe `consumer_id` to updates of `variable_ids`.
    ///
    /// A second call with the same consumer id replaces the previous
    /// subscription wholesale; callers re-subscribe with their full variable
    /// set instead of patching incrementally.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot record the subscription.
    fn subscribe(
        &self,
        consumer_id: &str,
        variable_ids: Vec<String>,
        callback: UpdateCallback,
    ) -> Result<(), VarError>;

    /// Remove the subscription for `consumer_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot remove the subscription.
    fn unsubscribe(&self, consumer_id: &str) -> Result<(), VarError>;
}

struct Subscription {
    variable_ids: HashSet<String>,
    callback: UpdateCallback,
}

/// In-memory variable store with subscription fan-out.
///
/// Values live in a `RwLock<HashMap>`; writes deliver updates synchronously
/// to every subscriber watching the written id. Callbacks are invoked outside
/// the store locks so they may call back into the store.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values = self.values.read().map(|v| v.len()).unwrap_or(0);
        let subs = self.subscriptions.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("MemoryStore")
            .field("values", &values)
            .field("subscriptions", &subs)
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with the given variables.
    #[must_use]
    pub fn with_values(values: HashMap<String, Value>) -> Self {
        Self {
            values: RwLock::new(values),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Collect the callbacks watching `id`, then invoke them lock-free.
    fn notify(&self, id: &str, value: &Value) {
        let callbacks: Vec<UpdateCallback> = match self.subscriptions.read() {
            Ok(subs) => subs
                .values()
                .filter(|sub| sub.variable_ids.contains(id))
                .map(|sub| Arc::clone(&sub.callback))
                .collect(),
            Err(_) => return,
        };

        if callbacks.is_empty() {
            return;
        }

        let update = VariableUpdate {
            variable_id: id.to_string(),
            value: value.clone(),
            timestamp: Utc::now(),
        };
        for callback in callbacks {
            callback(update.clone());
        }
    }

    fn lock_err<T>(e: std::sync::PoisonError<T>) -> VarError {
        VarError::Backend(format!("store lock poisoned: {e}"))
    }
}

impl VariableStore for MemoryStore {
    fn read_var(&self, id: &str) -> Result<Value, VarError> {
        let values = self.values.read().map_err(Self::lock_err)?;
        values
            .get(id)
            .cloned()
            .ok_or_else(|| VarError::NotFound(id.to_string()))
    }

    fn read_vars(&self, ids: &[String]) -> Result<HashMap<String, Value>, VarError> {
        let values = self.values.read().map_err(Self::lock_err)?;
        Ok(ids
            .iter()
            .filter_map(|id| values.get(id).map(|v| (id.clone(), v.clone())))
            .collect())
    }

    fn write_var(&self, id: &str, value: Value) -> Result<(), VarError> {
        {
            let mut values = self.values.write().map_err(Self::lock_err)?;
            values.insert(id.to_string(), value.clone());
        }
        self.notify(id, &value);
        Ok(())
    }

    fn write_vars(&self, values: HashMap<String, Value>) -> Result<(), VarError> {
        for (id, value) in values {
            self.write_var(&id, value)?;
        }
        Ok(())
    }

    fn subscribe(
        &self,
        consumer_id: &str,
        variable_ids: Vec<String>,
        callback: UpdateCallback,
    ) -> Result<(), VarError> {
        let mut subs = self.subscriptions.write().map_err(Self::lock_err)?;
        tracing::debug!(
            consumer_id = %consumer_id,
            variables = variable_ids.len(),
            "Subscription replaced"
        );
        subs.insert(
            consumer_id.to_string(),
            Subscription {
                variable_ids: variable_ids.into_iter().collect(),
                callback,
            },
        );
        Ok(())
    }

    fn unsubscribe(&self, consumer_id: &str) -> Result<(), VarError> {
        let mut subs = self.subscriptions.write().map_err(Self::lock_err)?;
        subs.remove(consumer_id);
        Ok(())
    }
}
