//! Script compilation and deadline-bounded execution.
//!
//! The engine compiles script source into a reusable program (`rhai::AST`)
//! cached per script id, and executes programs against interpreters borrowed
//! from the pool. Input bindings become top-level variables in the script's
//! scope, and a bare top-level `return <expr>` produces the result, since the
//! interpreter evaluates every script in its own isolated scope.
//!
//! Execution runs the script body on a blocking worker thread and waits on
//! whichever happens first: the result, a recovered panic, or the deadline.
//! A run that outlives its deadline is not cancelled: it keeps the borrowed
//! interpreter and returns it to the pool when it eventually finishes. The
//! sandbox's operation ceiling bounds how long that can take.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rhai::{Dynamic, Scope, AST};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::Error;
use crate::pool::InterpreterPool;

/// Named input bindings passed to an execution, exposed to the script as
/// top-level variables.
pub type ExecInput = serde_json::Map<String, Value>;

/// Outcome of a successful execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The script's result, normalized to a key/value map: map results keep
    /// their entries, a unit result becomes an empty map, anything else is
    /// wrapped under `"value"`.
    pub values: serde_json::Map<String, Value>,
    /// Wall-clock execution time.
    pub duration: Duration,
}

/// Compiles and executes scripts against pooled interpreters.
pub struct ScriptEngine {
    pool: Arc<InterpreterPool>,
    programs: RwLock<HashMap<String, Arc<AST>>>,
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = read_lock(&self.programs).len();
        f.debug_struct("ScriptEngine")
            .field("cached_programs", &cached)
            .field("pool", &self.pool)
            .finish()
    }
}

impl ScriptEngine {
    /// Create an engine executing against the given pool.
    #[must_use]
    pub fn new(pool: Arc<InterpreterPool>) -> Self {
        Self {
            pool,
            programs: RwLock::new(HashMap::new()),
        }
    }

    /// Compile `source` into a cached program for `script_id`.
    ///
    /// Idempotent per id: a second compile of the same id returns the
    /// identical cached program without reparsing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compile`] if the source fails to parse.
    pub fn compile(&self, script_id: &str, source: &str) -> Result<Arc<AST>, Error> {
        if let Some(program) = read_lock(&self.programs).get(script_id) {
            return Ok(Arc::clone(program));
        }

        // Parse with a sandboxed interpreter so stripped symbols are already
        // rejected at compile time.
        let vm = self.pool.get()?;
        let parsed = vm.engine().compile(source);
        self.pool.put(vm);

        let program = Arc::new(parsed.map_err(|e| Error::Compile {
            script_id: script_id.to_string(),
            message: e.to_string(),
        })?);

        let mut programs = write_lock(&self.programs);
        // A concurrent compile may have won the race; keep the first entry so
        // every caller observes the same program object.
        let entry = programs
            .entry(script_id.to_string())
            .or_insert_with(|| Arc::clone(&program));
        Ok(Arc::clone(entry))
    }

    /// Whether a compiled program is cached for `script_id`.
    #[must_use]
    pub fn has_program(&self, script_id: &str) -> bool {
        read_lock(&self.programs).contains_key(script_id)
    }

    /// Evict the cached program for `script_id`, if any.
    pub fn remove_program(&self, script_id: &str) {
        if write_lock(&self.programs).remove(script_id).is_some() {
            tracing::debug!(script_id = %script_id, "Compiled program evicted");
        }
    }

    /// Execute a compiled program with the given input bindings and deadline.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the deadline elapses first. The underlying run
    ///   is not interrupted; it returns its interpreter to the pool whenever
    ///   it completes.
    /// - [`Error::Runtime`] if the script faults or panics; panics are
    ///   recovered and never propagate to the caller.
    pub async fn execute(
        &self,
        script_id: &str,
        program: Arc<AST>,
        input: ExecInput,
        timeout: Duration,
    ) -> Result<ExecResult, Error> {
        let vm = self.pool.get()?;
        let pool = Arc::clone(&self.pool);
        let exec_id = Uuid::new_v4();
        let id = script_id.to_string();
        let started = Instant::now();

        tracing::debug!(script_id = %id, exec_id = %exec_id, "Execution started");

        let (tx, rx) = oneshot::channel::<Result<serde_json::Map<String, Value>, String>>();
        tokio::task::spawn_blocking(move || {
            let mut scope = Scope::new();
            for (name, value) in &input {
                match rhai::serde::to_dynamic(value) {
                    Ok(dynamic) => {
                        scope.push_dynamic(name.clone(), dynamic);
                    }
                    Err(err) => {
                        tracing::warn!(binding = %name, error = %err, "Input binding skipped");
                    }
                }
            }

            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                vm.engine().eval_ast_with_scope::<Dynamic>(&mut scope, &program)
            }));

            // On every path the interpreter goes back to the pool, including
            // runs the caller has already given up on.
            pool.put(vm);

            let result = match outcome {
                Ok(Ok(value)) => normalize(&value),
                Ok(Err(err)) => Err(err.to_string()),
                Err(panic) => Err(panic_message(&panic)),
            };
            let _ = tx.send(result);
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(values))) => {
                let duration = started.elapsed();
                tracing::debug!(script_id = %id, exec_id = %exec_id, ?duration, "Execution finished");
                Ok(ExecResult { values, duration })
            }
            Ok(Ok(Err(message))) => {
                tracing::warn!(script_id = %id, exec_id = %exec_id, error = %message, "Execution failed");
                Err(Error::Runtime { script_id: id, message })
            }
            Ok(Err(_closed)) => Err(Error::Runtime {
                script_id: id,
                message: "execution worker dropped without a result".to_string(),
            }),
            Err(_elapsed) => {
                tracing::warn!(script_id = %id, exec_id = %exec_id, ?timeout, "Execution timed out");
                Err(Error::Timeout { script_id: id, timeout })
            }
        }
    }
}

/// Normalize a script result to a key/value map.
fn normalize(value: &Dynamic) -> Result<serde_json::Map<String, Value>, String> {
    let json: Value = rhai::serde::from_dynamic(value).map_err(|e| e.to_string())?;
    Ok(match json {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    })
}

/// Best-effort message extraction from a recovered panic payload.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("script panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("script panicked: {message}")
    } else {
        "script panicked".to_string()
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
