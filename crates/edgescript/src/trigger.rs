//! Event-driven trigger registry and condition evaluation.
//!
//! The trigger manager owns every non-periodic runtime trigger and decides,
//! on each variable update or system event, which scripts to dispatch. It
//! keeps four indices under one reader/writer lock: trigger by id, triggers
//! by owning script, variable triggers by watched variable id, and
//! system/alarm triggers by event name.
//!
//! Condition evaluation coerces both sides to a common numeric form whenever
//! both are numeric-like (booleans count as 1/0, numeric strings parse);
//! otherwise only equality operators apply. A non-numeric operand under an
//! ordering operator is a configuration mistake: it is reported through the
//! log at evaluation time, never raised, and the trigger simply does not
//! fire.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;

use edgescript_vars::{VariableStore, VariableUpdate};

use crate::dispatch::{trigger_input, ScriptDispatcher};
use crate::error::Error;
use crate::script::{CompareOp, PeriodicConfig, ScriptTrigger, Threshold, TriggerCondition, TriggerType};

/// A live, dispatchable binding from an event condition to a script.
///
/// Built from a [`ScriptTrigger`] declaration at script load time and
/// destroyed at unload. The mutable firing state is interior so triggers can
/// be shared between the indices and in-flight evaluations.
pub struct Trigger {
    /// Globally unique trigger id.
    pub id: String,
    /// Id of the owning script.
    pub script_id: String,
    /// Event source kind.
    pub trigger_type: TriggerType,
    /// Condition for variable triggers.
    pub condition: Option<TriggerCondition>,
    /// Event name for system/alarm triggers.
    pub event: Option<String>,
    /// Schedule for periodic triggers (owned by the scheduler, carried here
    /// so a trigger is self-describing).
    pub periodic: Option<PeriodicConfig>,
    enabled: AtomicBool,
    fire_count: AtomicU64,
    last_fired: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("id", &self.id)
            .field("script_id", &self.script_id)
            .field("trigger_type", &self.trigger_type)
            .field("enabled", &self.is_enabled())
            .field("fire_count", &self.fire_count())
            .finish_non_exhaustive()
    }
}

impl Trigger {
    /// Build a runtime trigger from its declaration.
    #[must_use]
    pub fn from_config(script_id: &str, config: &ScriptTrigger) -> Self {
        Self {
            id: config.id.clone(),
            script_id: script_id.to_string(),
            trigger_type: config.trigger_type,
            condition: config.condition.clone(),
            event: config.event.clone(),
            periodic: config.periodic.clone(),
            enabled: AtomicBool::new(config.enabled),
            fire_count: AtomicU64::new(0),
            last_fired: Mutex::new(None),
        }
    }

    /// Whether the trigger currently dispatches.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Toggle dispatch without touching the index entries.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// How many times the trigger has fired.
    #[must_use]
    pub fn fire_count(&self) -> u64 {
        self.fire_count.load(Ordering::Relaxed)
    }

    /// When the trigger last fired.
    #[must_use]
    pub fn last_fired(&self) -> Option<DateTime<Utc>> {
        *self
            .last_fired
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn record_fire(&self) {
        self.fire_count.fetch_add(1, Ordering::Relaxed);
        *self
            .last_fired
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Utc::now());
    }
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, Arc<Trigger>>,
    by_script: HashMap<String, HashSet<String>>,
    by_variable: HashMap<String, HashSet<String>>,
    by_event: HashMap<String, HashSet<String>>,
}

/// Registry and evaluator for variable and system/alarm triggers.
pub struct TriggerManager {
    indices: RwLock<Indices>,
    dispatcher: RwLock<Option<Arc<dyn ScriptDispatcher>>>,
    storage: Arc<dyn VariableStore>,
}

impl std::fmt::Debug for TriggerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let indices = self.indices();
        f.debug_struct("TriggerManager")
            .field("triggers", &indices.by_id.len())
            .field("watched_variables", &indices.by_variable.len())
            .finish_non_exhaustive()
    }
}

impl TriggerManager {
    /// Create a manager reading threshold variables from `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn VariableStore>) -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
            dispatcher: RwLock::new(None),
            storage,
        }
    }

    /// Wire the dispatcher that satisfied triggers enqueue into.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn ScriptDispatcher>) {
        *self
            .dispatcher
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(dispatcher);
    }

    /// Register a runtime trigger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TriggerConfig`] if the id already exists, the owning
    /// script id is empty, a variable trigger carries no condition, a
    /// system/alarm trigger carries no event name, or the trigger is
    /// periodic (those belong to the scheduler).
    pub fn register_trigger(&self, trigger: Trigger) -> Result<(), Error> {
        if trigger.script_id.is_empty() {
            return Err(Error::TriggerConfig(format!(
                "trigger '{}' has no owning script",
                trigger.id
            )));
        }
        match trigger.trigger_type {
            TriggerType::Variable => {
                let watched = trigger
                    .condition
                    .as_ref()
                    .map(|c| c.variable_id.as_str())
                    .unwrap_or_default();
                if watched.is_empty() {
                    return Err(Error::TriggerConfig(format!(
                        "variable trigger '{}' has no variable id",
                        trigger.id
                    )));
                }
            }
            TriggerType::System | TriggerType::Alarm => {
                if trigger.event.as_deref().unwrap_or_default().is_empty() {
                    return Err(Error::TriggerConfig(format!(
                        "event trigger '{}' has no event name",
                        trigger.id
                    )));
                }
            }
            TriggerType::Periodic => {
                return Err(Error::TriggerConfig(format!(
                    "periodic trigger '{}' must be registered with the scheduler",
                    trigger.id
                )));
            }
        }

        let mut indices = self.indices_mut();
        if indices.by_id.contains_key(&trigger.id) {
            return Err(Error::TriggerConfig(format!(
                "trigger id already registered: {}",
                trigger.id
            )));
        }

        let id = trigger.id.clone();
        indices
            .by_script
            .entry(trigger.script_id.clone())
            .or_default()
            .insert(id.clone());
        if let Some(condition) = &trigger.condition {
            if trigger.trigger_type == TriggerType::Variable {
                indices
                    .by_variable
                    .entry(condition.variable_id.clone())
                    .or_default()
                    .insert(id.clone());
            }
        }
        if let Some(event) = &trigger.event {
            indices
                .by_event
                .entry(event.clone())
                .or_default()
                .insert(id.clone());
        }
        indices.by_id.insert(id.clone(), Arc::new(trigger));

        tracing::debug!(trigger_id = %id, "Trigger registered");
        Ok(())
    }

    /// Remove a trigger from every index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TriggerConfig`] if the id is unknown.
    pub fn unregister_trigger(&self, trigger_id: &str) -> Result<(), Error> {
        let mut indices = self.indices_mut();
        let trigger = indices.by_id.remove(trigger_id).ok_or_else(|| {
            Error::TriggerConfig(format!("unknown trigger id: {trigger_id}"))
        })?;
        Self::drop_from_secondary(&mut indices, &trigger);
        tracing::debug!(trigger_id = %trigger_id, "Trigger unregistered");
        Ok(())
    }

    /// Remove every trigger owned by `script_id`. Returns the removed ids.
    pub fn unregister_script(&self, script_id: &str) -> Vec<String> {
        let mut indices = self.indices_mut();
        let Some(ids) = indices.by_script.remove(script_id) else {
            return Vec::new();
        };
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(trigger) = indices.by_id.remove(&id) {
                Self::drop_from_variable_event(&mut indices, &trigger);
                removed.push(id);
            }
        }
        removed
    }

    /// Look up a trigger by id.
    #[must_use]
    pub fn trigger(&self, trigger_id: &str) -> Option<Arc<Trigger>> {
        self.indices().by_id.get(trigger_id).cloned()
    }

    /// Resume dispatching for a trigger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TriggerConfig`] if the id is unknown.
    pub fn enable_trigger(&self, trigger_id: &str) -> Result<(), Error> {
        self.set_trigger_enabled(trigger_id, true)
    }

    /// Suppress dispatching for a trigger without removing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TriggerConfig`] if the id is unknown.
    pub fn disable_trigger(&self, trigger_id: &str) -> Result<(), Error> {
        self.set_trigger_enabled(trigger_id, false)
    }

    /// Evaluate every enabled trigger watching the updated variable and
    /// dispatch the satisfied ones asynchronously.
    ///
    /// This is the storage backend's notification callback; it never blocks
    /// on script execution.
    pub fn on_variable_changed(&self, update: &VariableUpdate) {
        let watching: Vec<Arc<Trigger>> = {
            let indices = self.indices();
            let Some(ids) = indices.by_variable.get(&update.variable_id) else {
                return;
            };
            ids.iter()
                .filter_map(|id| indices.by_id.get(id).cloned())
                .collect()
        };

        for trigger in watching {
            if !trigger.is_enabled() {
                continue;
            }
            if self.condition_satisfied(&trigger, update) {
                let mut input = trigger_input(trigger.trigger_type, &trigger.id);
                input.insert(
                    "variable_id".to_string(),
                    Value::String(update.variable_id.clone()),
                );
                input.insert("value".to_string(), update.value.clone());
                self.dispatch(&trigger, input);
            }
        }
    }

    /// Dispatch every enabled system/alarm trigger registered for `event`.
    pub fn on_system_event(&self, event: &str, payload: Option<Value>) {
        let listening: Vec<Arc<Trigger>> = {
            let indices = self.indices();
            let Some(ids) = indices.by_event.get(event) else { return };
            ids.iter()
                .filter_map(|id| indices.by_id.get(id).cloned())
                .collect()
        };

        for trigger in listening {
            if !trigger.is_enabled() {
                continue;
            }
            let mut input = trigger_input(trigger.trigger_type, &trigger.id);
            input.insert("event".to_string(), Value::String(event.to_string()));
            if let Some(payload) = &payload {
                input.insert("payload".to_string(), payload.clone());
            }
            self.dispatch(&trigger, input);
        }
    }

    fn set_trigger_enabled(&self, trigger_id: &str, enabled: bool) -> Result<(), Error> {
        let trigger = self.trigger(trigger_id).ok_or_else(|| {
            Error::TriggerConfig(format!("unknown trigger id: {trigger_id}"))
        })?;
        trigger.set_enabled(enabled);
        tracing::debug!(trigger_id = %trigger_id, enabled, "Trigger toggled");
        Ok(())
    }

    fn condition_satisfied(&self, trigger: &Trigger, update: &VariableUpdate) -> bool {
        let Some(condition) = &trigger.condition else {
            return false;
        };
        let threshold = match &condition.threshold {
            Threshold::Literal(value) => value.clone(),
            Threshold::Variable { variable } => match self.storage.read_var(variable) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(
                        trigger_id = %trigger.id,
                        threshold_variable = %variable,
                        error = %err,
                        "Threshold variable unreadable"
                    );
                    return false;
                }
            },
        };

        match compare(&update.value, condition.operator, &threshold) {
            Ok(satisfied) => satisfied,
            Err(err) => {
                tracing::warn!(trigger_id = %trigger.id, error = %err, "Condition misconfigured");
                false
            }
        }
    }

    fn dispatch(&self, trigger: &Trigger, input: crate::engine::ExecInput) {
        let dispatcher = self
            .dispatcher
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let Some(dispatcher) = dispatcher else {
            tracing::warn!(trigger_id = %trigger.id, "No dispatcher wired, trigger dropped");
            return;
        };

        trigger.record_fire();
        if let Err(err) = dispatcher.execute_async(&trigger.script_id, input) {
            tracing::warn!(
                trigger_id = %trigger.id,
                script_id = %trigger.script_id,
                error = %err,
                "Trigger dispatch rejected"
            );
        }
    }

    fn drop_from_secondary(indices: &mut Indices, trigger: &Trigger) {
        if let Some(ids) = indices.by_script.get_mut(&trigger.script_id) {
            ids.remove(&trigger.id);
            if ids.is_empty() {
                indices.by_script.remove(&trigger.script_id);
            }
        }
        Self::drop_from_variable_event(indices, trigger);
    }

    fn drop_from_variable_event(indices: &mut Indices, trigger: &Trigger) {
        if let Some(condition) = &trigger.condition {
            if let Some(ids) = indices.by_variable.get_mut(&condition.variable_id) {
                ids.remove(&trigger.id);
                if ids.is_empty() {
                    indices.by_variable.remove(&condition.variable_id);
                }
            }
        }
        if let Some(event) = &trigger.event {
            if let Some(ids) = indices.by_event.get_mut(event) {
                ids.remove(&trigger.id);
                if ids.is_empty() {
                    indices.by_event.remove(event);
                }
            }
        }
    }

    fn indices(&self) -> std::sync::RwLockReadGuard<'_, Indices> {
        self.indices
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn indices_mut(&self) -> std::sync::RwLockWriteGuard<'_, Indices> {
        self.indices
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Compare a live value against a threshold.
///
/// Both sides are coerced to `f64` when numeric-like; otherwise only
/// `==`/`!=` apply via direct equality and ordering operators are a
/// configuration error.
pub(crate) fn compare(value: &Value, op: CompareOp, threshold: &Value) -> Result<bool, Error> {
    if let (Some(left), Some(right)) = (coerce_numeric(value), coerce_numeric(threshold)) {
        return Ok(match op {
            CompareOp::Eq => (left - right).abs() < f64::EPSILON,
            CompareOp::Ne => (left - right).abs() >= f64::EPSILON,
            CompareOp::Gt => left > right,
            CompareOp::Gte => left >= right,
            CompareOp::Lt => left < right,
            CompareOp::Lte => left <= right,
        });
    }

    match op {
        CompareOp::Eq => Ok(value == threshold),
        CompareOp::Ne => Ok(value != threshold),
        other => Err(Error::TriggerConfig(format!(
            "operator '{}' requires numeric operands, got {value} and {threshold}",
            other.symbol()
        ))),
    }
}

/// Coerce a value to `f64` when it is numeric-like.
fn coerce_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
