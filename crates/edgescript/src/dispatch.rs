//! The dispatch seam between event sources and the orchestrator.
//!
//! The trigger manager and scheduler never call into the script consumer
//! directly; they depend on the one-method [`ScriptDispatcher`] capability,
//! which keeps both unit-testable against a fake dispatcher and keeps the
//! dependency arrow pointing at an interface instead of a concrete type.

use chrono::Utc;
use serde_json::Value;

use crate::engine::ExecInput;
use crate::error::Error;
use crate::script::TriggerType;

/// Narrow "execute this script asynchronously" capability.
///
/// Implementations must enqueue without blocking; a full queue is reported
/// as [`Error::QueueFull`] rather than waited out, because callers sit on
/// hot notification paths.
pub trait ScriptDispatcher: Send + Sync {
    /// Enqueue an execution of `script_id` with the given input bindings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if admission is refused, or a lifecycle
    /// error if the dispatcher is stopped.
    fn execute_async(&self, script_id: &str, input: ExecInput) -> Result<(), Error>;
}

/// Input map every triggered execution receives: the trigger's type and id
/// plus the dispatch timestamp.
pub(crate) fn trigger_input(trigger_type: TriggerType, trigger_id: &str) -> ExecInput {
    let mut input = ExecInput::new();
    input.insert(
        "trigger_type".to_string(),
        Value::String(trigger_type.as_str().to_string()),
    );
    input.insert(
        "trigger_id".to_string(),
        Value::String(trigger_id.to_string()),
    );
    input.insert(
        "timestamp".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    input
}
