//! The script consumer: registry, status, queue and worker pool.
//!
//! This is the orchestrator the rest of the engine hangs off. It owns the
//! script registry and per-script status, runs a fixed pool of workers
//! draining one bounded execution queue, and wires the trigger manager and
//! scheduler to itself through the [`ScriptDispatcher`] seam; event sources
//! only ever enqueue, they never run script bodies inline.
//!
//! Lifecycle: [`ScriptConsumer::start`] wires the dispatchers, starts the
//! scheduler and launches the workers; scripts are loaded afterwards (the
//! scheduler rejects periodic triggers while stopped). [`ScriptConsumer::stop`]
//! stops the scheduler, cancels and joins the workers, and closes the
//! interpreter pool. A consumer is not restartable; build a fresh one.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use edgescript_vars::VariableStore;

use crate::config::EngineConfig;
use crate::dispatch::ScriptDispatcher;
use crate::engine::{ExecInput, ExecResult, ScriptEngine};
use crate::error::Error;
use crate::pool::{InterpreterPool, PoolStats};
use crate::sandbox::Sandbox;
use crate::scheduler::Scheduler;
use crate::script::{Script, ScriptState, ScriptStatus, TriggerType};
use crate::trigger::{Trigger, TriggerManager};

/// A queued execution request.
struct ExecTask {
    script_id: String,
    input: ExecInput,
    reply: Option<oneshot::Sender<Result<ExecResult, Error>>>,
}

/// Orchestrates script loading, triggering and execution.
pub struct ScriptConsumer {
    config: EngineConfig,
    storage: Arc<dyn VariableStore>,
    engine: ScriptEngine,
    pool: Arc<InterpreterPool>,
    triggers: Arc<TriggerManager>,
    scheduler: Arc<Scheduler>,
    scripts: RwLock<HashMap<String, Arc<Script>>>,
    statuses: RwLock<HashMap<String, ScriptStatus>>,
    queue_tx: mpsc::Sender<ExecTask>,
    queue_rx: StdMutex<Option<mpsc::Receiver<ExecTask>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    running: StdMutex<bool>,
    shutdown: CancellationToken,
    consumer_id: String,
}

impl std::fmt::Debug for ScriptConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptConsumer")
            .field("consumer_id", &self.consumer_id)
            .field("scripts", &read_lock(&self.scripts).len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ScriptConsumer {
    /// Create a consumer with a default sandbox built from `config`.
    ///
    /// Must be called within a tokio runtime (the interpreter pool spawns
    /// its sweep task).
    #[must_use]
    pub fn new(config: EngineConfig, storage: Arc<dyn VariableStore>) -> Arc<Self> {
        let sandbox = Sandbox::builder()
            .with_allowed_apis(config.allowed_apis.iter().cloned())
            .with_limits(config.limits.clone())
            .build();
        Self::with_sandbox(config, storage, Arc::new(sandbox))
    }

    /// Create a consumer around a prebuilt sandbox, e.g. one carrying extra
    /// host-API modules.
    #[must_use]
    pub fn with_sandbox(
        config: EngineConfig,
        storage: Arc<dyn VariableStore>,
        sandbox: Arc<Sandbox>,
    ) -> Arc<Self> {
        let pool = InterpreterPool::new(config.pool.clone(), sandbox, Arc::clone(&storage));
        let engine = ScriptEngine::new(Arc::clone(&pool));
        let triggers = Arc::new(TriggerManager::new(Arc::clone(&storage)));
        let scheduler = Arc::new(Scheduler::new());
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));

        Arc::new(Self {
            config,
            storage,
            engine,
            pool,
            triggers,
            scheduler,
            scripts: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: StdMutex::new(Some(queue_rx)),
            workers: StdMutex::new(Vec::new()),
            running: StdMutex::new(false),
            shutdown: CancellationToken::new(),
            consumer_id: format!("script-consumer-{}", Uuid::new_v4()),
        })
    }

    /// Whether the consumer is started and accepting work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self
            .running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start the subsystem: wire the trigger manager and scheduler to this
    /// consumer, start the scheduler, and launch the worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] if the consumer was already stopped; a
    /// consumer cannot be restarted.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        {
            let mut running = self
                .running
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *running {
                return Ok(());
            }
            *running = true;
        }

        let receiver = self
            .queue_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or(Error::Stopped)?;

        let dispatcher: Arc<dyn ScriptDispatcher> = self.clone();
        self.triggers.set_dispatcher(Arc::clone(&dispatcher));
        self.scheduler.set_dispatcher(dispatcher);
        self.scheduler.start();

        let receiver = Arc::new(AsyncMutex::new(receiver));
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for worker in 0..self.config.workers.max(1) {
            let consumer = Arc::clone(self);
            let receiver = Arc::clone(&receiver);
            let token = self.shutdown.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(consumer, receiver, token).await;
                tracing::trace!(worker, "Worker exited");
            }));
        }

        tracing::info!(consumer_id = %self.consumer_id, workers = self.config.workers, "Script consumer started");
        Ok(())
    }

    /// Stop the subsystem: scheduler first, then cancel and join every
    /// worker, then close the interpreter pool.
    pub async fn stop(&self) {
        {
            let mut running = self
                .running
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !*running {
                return;
            }
            *running = false;
        }

        self.scheduler.stop();
        self.shutdown.cancel();

        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self
                .workers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }

        let _ = self.storage.unsubscribe(&self.consumer_id);
        self.pool.close();
        tracing::info!(consumer_id = %self.consumer_id, "Script consumer stopped");
    }

    /// Load a script: store it, initialize its status, register its
    /// triggers, and recompute the variable subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScriptAlreadyLoaded`] for duplicate ids, or a
    /// [`Error::TriggerConfig`]/[`Error::SchedulerNotRunning`] if a trigger
    /// declaration is rejected, in which case every registration made so
    /// far is rolled back and the script is not loaded.
    pub fn load_script(&self, script: Script) -> Result<(), Error> {
        if script.id.is_empty() {
            return Err(Error::Config("script id must not be empty".to_string()));
        }
        if read_lock(&self.scripts).contains_key(&script.id) {
            return Err(Error::ScriptAlreadyLoaded(script.id));
        }

        self.register_triggers(&script)?;

        let enabled = script.enabled;
        let id = script.id.clone();
        write_lock(&self.scripts).insert(id.clone(), Arc::new(script));
        write_lock(&self.statuses).insert(id.clone(), ScriptStatus::new(enabled));

        if let Err(err) = self.resubscribe() {
            tracing::warn!(script_id = %id, error = %err, "Variable subscription failed");
        }

        tracing::info!(script_id = %id, "Script loaded");
        Ok(())
    }

    /// Unload a script: unregister its triggers, evict its compiled program,
    /// delete its status, and recompute the variable subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScriptNotFound`] if the id is not loaded.
    pub fn unload_script(&self, script_id: &str) -> Result<(), Error> {
        let script = write_lock(&self.scripts)
            .remove(script_id)
            .ok_or_else(|| Error::ScriptNotFound(script_id.to_string()))?;

        self.triggers.unregister_script(script_id);
        for trigger in &script.triggers {
            if trigger.trigger_type == TriggerType::Periodic {
                let _ = self.scheduler.remove_trigger(&trigger.id);
            }
        }

        self.engine.remove_program(script_id);
        write_lock(&self.statuses).remove(script_id);

        if let Err(err) = self.resubscribe() {
            tracing::warn!(script_id = %script_id, error = %err, "Variable subscription failed");
        }

        tracing::info!(script_id = %script_id, "Script unloaded");
        Ok(())
    }

    /// Execute a script synchronously: enqueue with a bounded admission
    /// wait, then block until a worker publishes the result.
    ///
    /// # Errors
    ///
    /// [`Error::QueueFull`] if admission times out, [`Error::Stopped`] if
    /// the consumer is not running, plus any execution error the worker
    /// reports ([`Error::ScriptNotFound`], [`Error::ScriptDisabled`],
    /// [`Error::Compile`], [`Error::Timeout`], [`Error::Runtime`]).
    pub async fn execute_script(
        &self,
        script_id: &str,
        input: ExecInput,
    ) -> Result<ExecResult, Error> {
        if !self.is_running() {
            return Err(Error::Stopped);
        }

        let (tx, rx) = oneshot::channel();
        let task = ExecTask {
            script_id: script_id.to_string(),
            input,
            reply: Some(tx),
        };
        self.queue_tx
            .send_timeout(task, self.config.admission_wait())
            .await
            .map_err(|err| match err {
                mpsc::error::SendTimeoutError::Timeout(_) => Error::QueueFull,
                mpsc::error::SendTimeoutError::Closed(_) => Error::Stopped,
            })?;

        rx.await.unwrap_or(Err(Error::Stopped))
    }

    /// Execute a script asynchronously: enqueue without waiting for a
    /// result, failing immediately if the queue is full.
    ///
    /// # Errors
    ///
    /// [`Error::QueueFull`] if the queue is full, [`Error::Stopped`] if the
    /// consumer is not running.
    pub fn execute_script_async(&self, script_id: &str, input: ExecInput) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::Stopped);
        }
        let task = ExecTask {
            script_id: script_id.to_string(),
            input,
            reply: None,
        };
        self.queue_tx.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Error::Stopped,
        })
    }

    /// Re-enable execution of a loaded script.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScriptNotFound`] if the id is not loaded.
    pub fn enable_script(&self, script_id: &str) -> Result<(), Error> {
        self.set_script_enabled(script_id, true)
    }

    /// Administratively suppress execution of a loaded script. Queued and
    /// triggered tasks for it are rejected at execution time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScriptNotFound`] if the id is not loaded.
    pub fn disable_script(&self, script_id: &str) -> Result<(), Error> {
        self.set_script_enabled(script_id, false)
    }

    /// Current status of a loaded script.
    #[must_use]
    pub fn script_status(&self, script_id: &str) -> Option<ScriptStatus> {
        read_lock(&self.statuses).get(script_id).cloned()
    }

    /// Ids of all loaded scripts.
    #[must_use]
    pub fn script_ids(&self) -> Vec<String> {
        read_lock(&self.scripts).keys().cloned().collect()
    }

    /// Whether a compiled program is cached for `script_id`.
    #[must_use]
    pub fn program_cached(&self, script_id: &str) -> bool {
        self.engine.has_program(script_id)
    }

    /// Deliver a system or alarm event to the trigger manager.
    pub fn notify_system_event(&self, event: &str, payload: Option<Value>) {
        self.triggers.on_system_event(event, payload);
    }

    /// The trigger manager, for inspection and manual trigger control.
    #[must_use]
    pub fn trigger_manager(&self) -> &Arc<TriggerManager> {
        &self.triggers
    }

    /// The scheduler, for inspection and interval updates.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Interpreter pool counters.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Register every declared trigger, rolling back on the first failure.
    fn register_triggers(&self, script: &Script) -> Result<(), Error> {
        let mut registered_manager: Vec<String> = Vec::new();
        let mut registered_scheduler: Vec<String> = Vec::new();

        for config in &script.triggers {
            let trigger = Trigger::from_config(&script.id, config);
            let result = match config.trigger_type {
                TriggerType::Periodic => {
                    let outcome = self.scheduler.add_trigger(trigger);
                    if outcome.is_ok() {
                        registered_scheduler.push(config.id.clone());
                    }
                    outcome
                }
                _ => {
                    let outcome = self.triggers.register_trigger(trigger);
                    if outcome.is_ok() {
                        registered_manager.push(config.id.clone());
                    }
                    outcome
                }
            };

            if let Err(err) = result {
                for id in &registered_manager {
                    let _ = self.triggers.unregister_trigger(id);
                }
                for id in &registered_scheduler {
                    let _ = self.scheduler.remove_trigger(id);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Recompute the union of variables to watch and issue one subscription
    /// call: declared variables plus every variable referenced by an active
    /// variable-trigger condition.
    fn resubscribe(&self) -> Result<(), Error> {
        let variable_ids: BTreeSet<String> = {
            let scripts = read_lock(&self.scripts);
            scripts
                .values()
                .flat_map(|script| {
                    let declared = script.variable_ids.iter().cloned();
                    let watched = script
                        .triggers
                        .iter()
                        .filter(|t| t.trigger_type == TriggerType::Variable)
                        .filter_map(|t| t.condition.as_ref())
                        .map(|c| c.variable_id.clone());
                    declared.chain(watched).collect::<Vec<_>>()
                })
                .collect()
        };

        let manager = Arc::clone(&self.triggers);
        self.storage.subscribe(
            &self.consumer_id,
            variable_ids.into_iter().collect(),
            Arc::new(move |update| manager.on_variable_changed(&update)),
        )?;
        Ok(())
    }

    fn set_script_enabled(&self, script_id: &str, enabled: bool) -> Result<(), Error> {
        let mut statuses = write_lock(&self.statuses);
        let status = statuses
            .get_mut(script_id)
            .ok_or_else(|| Error::ScriptNotFound(script_id.to_string()))?;
        status.enabled = enabled;
        status.state = if enabled {
            ScriptState::Loaded
        } else {
            ScriptState::Disabled
        };
        tracing::debug!(script_id = %script_id, enabled, "Script toggled");
        Ok(())
    }

    /// Run one queued task to completion and update the script's status.
    async fn run_task(&self, task: ExecTask) {
        let ExecTask { script_id, input, reply } = task;

        let script = read_lock(&self.scripts).get(&script_id).cloned();
        let Some(script) = script else {
            tracing::warn!(script_id = %script_id, "Task for unknown script dropped");
            if let Some(reply) = reply {
                let _ = reply.send(Err(Error::ScriptNotFound(script_id)));
            }
            return;
        };

        let enabled = read_lock(&self.statuses)
            .get(&script_id)
            .map(|s| s.enabled)
            .unwrap_or(false);
        if !enabled {
            if let Some(reply) = reply {
                let _ = reply.send(Err(Error::ScriptDisabled(script_id)));
            }
            return;
        }

        let program = match self.engine.compile(&script_id, &script.source) {
            Ok(program) => program,
            Err(err) => {
                self.record_failure(&script_id, &err);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
                return;
            }
        };

        if let Some(status) = write_lock(&self.statuses).get_mut(&script_id) {
            status.state = ScriptState::Running;
        }

        let timeout = script.timeout().unwrap_or_else(|| self.config.default_timeout());
        let result = self.engine.execute(&script_id, program, input, timeout).await;

        match &result {
            Ok(_) => {
                if let Some(status) = write_lock(&self.statuses).get_mut(&script_id) {
                    status.record_success();
                }
            }
            Err(err) => self.record_failure(&script_id, err),
        }

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn record_failure(&self, script_id: &str, err: &Error) {
        if let Some(status) = write_lock(&self.statuses).get_mut(script_id) {
            status.record_failure(&err.to_string());
        }
    }
}

impl ScriptDispatcher for ScriptConsumer {
    fn execute_async(&self, script_id: &str, input: ExecInput) -> Result<(), Error> {
        self.execute_script_async(script_id, input)
    }
}

/// Drain the shared queue until shutdown.
async fn worker_loop(
    consumer: Arc<ScriptConsumer>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<ExecTask>>>,
    token: CancellationToken,
) {
    loop {
        let task = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                () = token.cancelled() => None,
                task = rx.recv() => task,
            }
        };
        match task {
            Some(task) => consumer.run_task(task).await,
            None => break,
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use edgescript_vars::MemoryStore;
    use serde_json::json;

    fn basic_script(id: &str, source: &str) -> Script {
        Script {
            id: id.to_string(),
            name: id.to_string(),
            source: source.to_string(),
            enabled: true,
            variable_ids: Vec::new(),
            triggers: Vec::new(),
            timeout_ms: None,
        }
    }

    async fn started_consumer() -> Arc<ScriptConsumer> {
        let storage: Arc<dyn VariableStore> = Arc::new(MemoryStore::new());
        let consumer = ScriptConsumer::new(EngineConfig::default(), storage);
        consumer.start().unwrap();
        consumer
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn load_execute_unload_round_trip() {
        let consumer = started_consumer().await;
        consumer
            .load_script(basic_script("s1", "return #{ answer: 42 };"))
            .unwrap();

        let result = consumer.execute_script("s1", ExecInput::new()).await.unwrap();
        assert_eq!(result.values["answer"], json!(42));

        let status = consumer.script_status("s1").unwrap();
        assert_eq!(status.execution_count, 1);
        assert_eq!(status.state, ScriptState::Completed);

        consumer.unload_script("s1").unwrap();
        assert!(consumer.script_status("s1").is_none());
        consumer.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unloaded_script_is_not_found_and_cache_is_evicted() {
        let consumer = started_consumer().await;
        consumer
            .load_script(basic_script("s1", "return 1;"))
            .unwrap();
        consumer.execute_script("s1", ExecInput::new()).await.unwrap();
        assert!(consumer.program_cached("s1"));

        consumer.unload_script("s1").unwrap();
        assert!(!consumer.program_cached("s1"));

        let err = consumer
            .execute_script("s1", ExecInput::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScriptNotFound(_)));
        consumer.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disabled_script_never_executes() {
        let consumer = started_consumer().await;
        consumer
            .load_script(basic_script("s1", "return 1;"))
            .unwrap();
        consumer.disable_script("s1").unwrap();

        let err = consumer
            .execute_script("s1", ExecInput::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScriptDisabled(_)));

        let status = consumer.script_status("s1").unwrap();
        assert_eq!(status.execution_count, 0);

        consumer.enable_script("s1").unwrap();
        consumer.execute_script("s1", ExecInput::new()).await.unwrap();
        consumer.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn compile_error_is_returned_and_recorded() {
        let consumer = started_consumer().await;
        consumer
            .load_script(basic_script("bad", "let = nope ;;"))
            .unwrap();

        let err = consumer
            .execute_script("bad", ExecInput::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Compile { .. }));

        let status = consumer.script_status("bad").unwrap();
        assert_eq!(status.error_count, 1);
        assert_eq!(status.state, ScriptState::Error);
        assert!(status.last_error.is_some());
        consumer.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_load_is_rejected() {
        let consumer = started_consumer().await;
        consumer
            .load_script(basic_script("s1", "return 1;"))
            .unwrap();
        let err = consumer
            .load_script(basic_script("s1", "return 2;"))
            .unwrap_err();
        assert!(matches!(err, Error::ScriptAlreadyLoaded(_)));
        consumer.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bad_trigger_declaration_rolls_back_the_load() {
        let consumer = started_consumer().await;

        let mut script = basic_script("s1", "return 1;");
        script.triggers = vec![
            crate::script::ScriptTrigger {
                id: "ok".to_string(),
                trigger_type: TriggerType::Variable,
                enabled: true,
                condition: Some(crate::script::TriggerCondition {
                    variable_id: "temp".to_string(),
                    operator: crate::script::CompareOp::Gt,
                    threshold: crate::script::Threshold::Literal(json!(1)),
                }),
                periodic: None,
                event: None,
            },
            crate::script::ScriptTrigger {
                id: "broken".to_string(),
                trigger_type: TriggerType::Variable,
                enabled: true,
                condition: None,
                periodic: None,
                event: None,
            },
        ];

        let err = consumer.load_script(script).unwrap_err();
        assert!(matches!(err, Error::TriggerConfig(_)));
        assert!(consumer.script_status("s1").is_none());
        assert!(consumer.trigger_manager().trigger("ok").is_none());
        consumer.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_consumer_rejects_submissions() {
        let consumer = started_consumer().await;
        consumer.stop().await;

        assert!(matches!(
            consumer.execute_script("s1", ExecInput::new()).await,
            Err(Error::Stopped)
        ));
        assert!(matches!(
            consumer.execute_script_async("s1", ExecInput::new()),
            Err(Error::Stopped)
        ));
    }
}
