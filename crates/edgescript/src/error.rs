//! Error types for the script execution engine.

use std::time::Duration;

use edgescript_vars::VarError;

/// Error type for all engine operations.
///
/// Script misbehavior never crashes the host process: compile and
/// configuration errors are returned to the caller that requested the
/// action, while runtime faults and timeouts are recorded into the owning
/// script's status and surfaced only to synchronous callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The script source failed to compile.
    #[error("script '{script_id}' failed to compile: {message}")]
    Compile {
        /// Id of the script that failed.
        script_id: String,
        /// Parser diagnostic.
        message: String,
    },

    /// Execution exceeded its deadline. The underlying run is not cancelled;
    /// it keeps the borrowed interpreter until it finishes on its own.
    #[error("script '{script_id}' timed out after {timeout:?}")]
    Timeout {
        /// Id of the script that timed out.
        script_id: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The script faulted at runtime (script error or recovered panic).
    #[error("script '{script_id}' failed: {message}")]
    Runtime {
        /// Id of the script that faulted.
        script_id: String,
        /// Fault description.
        message: String,
    },

    /// The execution queue refused admission.
    #[error("execution queue is full")]
    QueueFull,

    /// A trigger registration or schedule was malformed.
    #[error("invalid trigger configuration: {0}")]
    TriggerConfig(String),

    /// No script with the given id is loaded.
    #[error("script not found: {0}")]
    ScriptNotFound(String),

    /// A script with this id is already loaded; unload it first.
    #[error("script already loaded: {0}")]
    ScriptAlreadyLoaded(String),

    /// The script is loaded but disabled.
    #[error("script is disabled: {0}")]
    ScriptDisabled(String),

    /// The scheduler is not running; periodic triggers cannot be added.
    #[error("scheduler is not running")]
    SchedulerNotRunning,

    /// The consumer has been stopped and accepts no further work.
    #[error("script consumer is stopped")]
    Stopped,

    /// A host-API module failed to inject into the sandbox.
    #[error("sandbox setup failed: {0}")]
    Sandbox(String),

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The variable storage backend failed.
    #[error(transparent)]
    Var(#[from] VarError),
}
