//! Script and trigger data model.
//!
//! A [`Script`] is the unit of user logic: source text plus the declared
//! triggers that decide when it runs. Trigger declarations here are plain
//! config data; the trigger manager and scheduler turn them into live,
//! dispatchable bindings at load time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of event a trigger binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Fires when a watched process variable changes.
    Variable,
    /// Fires on a fixed interval or cron schedule.
    Periodic,
    /// Fires on a named system event.
    System,
    /// Fires when an alarm rule raises.
    Alarm,
}

impl TriggerType {
    /// Stable name used in execution input maps and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Variable => "variable",
            Self::Periodic => "periodic",
            Self::System => "system",
            Self::Alarm => "alarm",
        }
    }
}

/// Comparison operators for variable-trigger conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
}

impl CompareOp {
    /// Symbolic form, for diagnostics.
    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// The right-hand side of a condition: a literal value, or the live value of
/// another variable read at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    /// Compare against another variable's current value.
    Variable {
        /// Id of the variable supplying the threshold.
        variable: String,
    },
    /// Compare against a fixed value.
    Literal(Value),
}

/// Evaluation predicate for a variable trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    /// The watched variable.
    pub variable_id: String,
    /// Comparison operator.
    pub operator: CompareOp,
    /// Threshold the live value is compared against.
    pub threshold: Threshold,
}

/// Schedule for a periodic trigger: a fixed interval or a cron expression,
/// optionally gated to a time-of-day window and a day-of-week set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriodicConfig {
    /// Fixed firing interval in milliseconds. Mutually exclusive with `cron`.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    /// 6-field cron expression (seconds resolution), e.g. `"0/5 * * * * *"`.
    #[serde(default)]
    pub cron: Option<String>,
    /// Earliest wall-clock time of day (`HH:MM` or `HH:MM:SS`) a fire passes.
    #[serde(default)]
    pub start_time: Option<String>,
    /// Latest wall-clock time of day a fire passes.
    #[serde(default)]
    pub end_time: Option<String>,
    /// Allowed weekdays, Monday = 1 through Sunday = 7. Empty or absent
    /// means every day.
    #[serde(default)]
    pub days_of_week: Option<Vec<u8>>,
}

impl PeriodicConfig {
    /// The fixed interval as a [`Duration`], if one is configured.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }
}

/// Declared attachment of a script to an event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptTrigger {
    /// Globally unique trigger id.
    pub id: String,
    /// Event source kind.
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Whether the trigger dispatches. Disabled triggers stay registered.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Condition for variable triggers.
    #[serde(default)]
    pub condition: Option<TriggerCondition>,
    /// Schedule for periodic triggers.
    #[serde(default)]
    pub periodic: Option<PeriodicConfig>,
    /// Event name for system triggers, or rule id for alarm triggers.
    #[serde(default)]
    pub event: Option<String>,
}

/// A unit of user logic attached to the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    /// Unique script id.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Script source text.
    pub source: String,
    /// Whether the script may execute at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Variables the script reads or writes; always subscribed.
    #[serde(default)]
    pub variable_ids: Vec<String>,
    /// Declared triggers.
    #[serde(default)]
    pub triggers: Vec<ScriptTrigger>,
    /// Per-script execution deadline in milliseconds; the engine default
    /// applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Script {
    /// The script's execution deadline, if it declares one.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn default_true() -> bool {
    true
}

/// Lifecycle state recorded in a script's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptState {
    /// Loaded, not yet executed.
    Loaded,
    /// An execution is in flight.
    Running,
    /// Last execution finished successfully.
    Completed,
    /// Last execution failed; see `last_error`.
    Error,
    /// Execution is administratively suppressed.
    Disabled,
}

/// Runtime health of a loaded script.
///
/// Created at load, mutated after every execution, deleted at unload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptStatus {
    /// Whether the script is currently loaded.
    pub loaded: bool,
    /// Whether the script may execute.
    pub enabled: bool,
    /// Lifecycle state.
    pub state: ScriptState,
    /// When the last execution finished.
    pub last_execution: Option<DateTime<Utc>>,
    /// Total executions attempted.
    pub execution_count: u64,
    /// Executions that failed.
    pub error_count: u64,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

impl ScriptStatus {
    /// Fresh status for a newly loaded script.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            loaded: true,
            enabled,
            state: if enabled {
                ScriptState::Loaded
            } else {
                ScriptState::Disabled
            },
            last_execution: None,
            execution_count: 0,
            error_count: 0,
            last_error: None,
        }
    }

    /// Record a successful execution.
    pub fn record_success(&mut self) {
        self.execution_count += 1;
        self.last_execution = Some(Utc::now());
        self.state = ScriptState::Completed;
        self.last_error = None;
    }

    /// Record a failed execution.
    pub fn record_failure(&mut self, error: &str) {
        self.execution_count += 1;
        self.error_count += 1;
        self.last_execution = Some(Utc::now());
        self.state = ScriptState::Error;
        self.last_error = Some(error.to_string());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn script_definition_parses_from_json() {
        let json = r#"{
            "id": "script-001",
            "name": "High temperature alert",
            "source": "let t = vars::read(\"water_temp\"); return t;",
            "variable_ids": ["water_temp"],
            "triggers": [
                {
                    "id": "trig-001",
                    "type": "variable",
                    "condition": {
                        "variable_id": "water_temp",
                        "operator": "gt",
                        "threshold": 28.0
                    }
                }
            ]
        }"#;

        let script: Script = serde_json::from_str(json).unwrap();
        assert_eq!(script.id, "script-001");
        assert!(script.enabled);
        assert_eq!(script.triggers.len(), 1);
        let condition = script.triggers[0].condition.as_ref().unwrap();
        assert_eq!(condition.operator, CompareOp::Gt);
        assert_eq!(condition.threshold, Threshold::Literal(json!(28.0)));
    }

    #[test]
    fn variable_threshold_parses_from_object_form() {
        let condition: TriggerCondition = serde_json::from_str(
            r#"{
                "variable_id": "flow_in",
                "operator": "gte",
                "threshold": { "variable": "flow_limit" }
            }"#,
        )
        .unwrap();
        assert_eq!(
            condition.threshold,
            Threshold::Variable { variable: "flow_limit".to_string() }
        );
    }

    #[test]
    fn periodic_config_parses_interval_and_gates() {
        let periodic: PeriodicConfig = serde_json::from_str(
            r#"{
                "interval_ms": 1500,
                "start_time": "08:00",
                "end_time": "17:30",
                "days_of_week": [1, 2, 3, 4, 5]
            }"#,
        )
        .unwrap();
        assert_eq!(periodic.interval(), Some(Duration::from_millis(1500)));
        assert_eq!(periodic.days_of_week.as_deref(), Some(&[1, 2, 3, 4, 5][..]));
    }

    #[test]
    fn status_records_success_and_failure() {
        let mut status = ScriptStatus::new(true);
        assert_eq!(status.state, ScriptState::Loaded);

        status.record_success();
        assert_eq!(status.execution_count, 1);
        assert_eq!(status.state, ScriptState::Completed);
        assert!(status.last_error.is_none());

        status.record_failure("boom");
        assert_eq!(status.execution_count, 2);
        assert_eq!(status.error_count, 1);
        assert_eq!(status.state, ScriptState::Error);
        assert_eq!(status.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn disabled_script_starts_in_disabled_state() {
        let status = ScriptStatus::new(false);
        assert_eq!(status.state, ScriptState::Disabled);
        assert!(!status.enabled);
    }
}
