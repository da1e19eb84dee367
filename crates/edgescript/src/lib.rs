//! # edgescript
//!
//! Reactive script execution engine for industrial edge devices.
//!
//! Operators attach small pieces of logic (scripts) to process variables,
//! alarms, schedules and system events. The engine runs them safely,
//! concurrently and with bounded resource use:
//!
//! - **Sandboxed interpreters** - scripts only see allow-listed capability
//!   namespaces; `eval` is stripped and resource ceilings apply
//! - **Interpreter pooling** - a bounded buffer of reusable instances with
//!   idle/lifetime eviction
//! - **Compiled-program caching** - each script compiles once and reruns
//!   from its cached program
//! - **Event triggers** - variable-change conditions with numeric coercion,
//!   plus system/alarm events
//! - **Scheduling** - fixed intervals and 6-field cron expressions, gated by
//!   time-of-day windows and day-of-week sets
//! - **Bounded execution** - a fixed worker pool drains one bounded queue;
//!   every run carries a deadline
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use edgescript::{EngineConfig, ExecInput, ScriptConsumer, Script};
//! use edgescript_vars::{MemoryStore, VariableStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), edgescript::Error> {
//!     let storage: Arc<dyn VariableStore> = Arc::new(MemoryStore::new());
//!     let consumer = ScriptConsumer::new(EngineConfig::default(), storage);
//!     consumer.start()?;
//!
//!     consumer.load_script(Script {
//!         id: "hello".to_string(),
//!         name: "Hello".to_string(),
//!         source: r#"return #{ greeting: "hello" };"#.to_string(),
//!         enabled: true,
//!         variable_ids: vec![],
//!         triggers: vec![],
//!         timeout_ms: None,
//!     })?;
//!
//!     let result = consumer.execute_script("hello", ExecInput::new()).await?;
//!     println!("{:?}", result.values);
//!
//!     consumer.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
mod consumer;
mod dispatch;
mod engine;
mod error;
pub mod pool;
pub mod sandbox;
mod scheduler;
mod script;
mod trigger;

pub use config::{EngineConfig, PoolConfig, SandboxLimits};
pub use consumer::ScriptConsumer;
pub use dispatch::ScriptDispatcher;
pub use engine::{ExecInput, ExecResult, ScriptEngine};
pub use error::Error;
pub use pool::{InterpreterPool, PoolStats, PooledInterpreter};
pub use sandbox::{HostApi, Sandbox, SandboxBuilder};
pub use scheduler::Scheduler;
pub use script::{
    CompareOp, PeriodicConfig, Script, ScriptState, ScriptStatus, ScriptTrigger, Threshold,
    TriggerCondition, TriggerType,
};
pub use trigger::{Trigger, TriggerManager};
