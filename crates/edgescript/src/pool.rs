//! Bounded pool of reusable sandboxed interpreters.
//!
//! Creating and sandboxing an interpreter is not free, so executions borrow
//! instances from a bounded reuse buffer instead of building one per run.
//! Every instance the factory creates is wired through the [`Sandbox`] with
//! the storage backend supplied at pool construction, so consumers never see an
//! un-sandboxed interpreter.
//!
//! Pool exhaustion never errors: when the buffer is empty, [`InterpreterPool::get`]
//! falls back to synchronous creation, so the pool can grow beyond its buffer
//! under load. A background sweep retires instances whose idle time or total
//! lifetime exceeds the configured ceilings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use rhai::Engine;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use edgescript_vars::VariableStore;

use crate::config::PoolConfig;
use crate::error::Error;
use crate::sandbox::Sandbox;

/// A reusable sandboxed interpreter instance.
pub struct PooledInterpreter {
    engine: Engine,
    id: u64,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl std::fmt::Debug for PooledInterpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledInterpreter")
            .field("id", &self.id)
            .field("age", &self.created_at.elapsed())
            .field("use_count", &self.use_count)
            .finish_non_exhaustive()
    }
}

impl PooledInterpreter {
    /// The sandboxed engine.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Instance id, unique within the pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// How many executions have borrowed this instance.
    #[must_use]
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances built by the factory.
    pub created: u64,
    /// Borrows served from the reuse buffer.
    pub reused: u64,
    /// Instances dropped because the buffer was full or their lifetime ran out.
    pub discarded: u64,
    /// Instances retired by the background sweep.
    pub swept: u64,
}

/// Bounded pool of sandboxed interpreter instances.
pub struct InterpreterPool {
    tx: mpsc::Sender<PooledInterpreter>,
    rx: Mutex<mpsc::Receiver<PooledInterpreter>>,
    sandbox: Arc<Sandbox>,
    storage: Arc<dyn VariableStore>,
    config: PoolConfig,
    next_id: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
    swept: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for InterpreterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl InterpreterPool {
    /// Create a pool and start its background sweep.
    ///
    /// Must be called within a tokio runtime; the sweep runs as a spawned
    /// task until [`InterpreterPool::close`] is called or the pool is dropped.
    #[must_use]
    pub fn new(
        config: PoolConfig,
        sandbox: Arc<Sandbox>,
        storage: Arc<dyn VariableStore>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.max_size.max(1));
        let pool = Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            sandbox,
            storage,
            config,
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            swept: AtomicU64::new(0),

            shutdown: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&pool);
        let token = pool.shutdown.clone();
        let sweep_interval = pool.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = Weak::upgrade(&weak) else { break };
                        pool.sweep();
                    }
                }
            }
        });

        pool
    }

    /// Borrow a ready-to-use sandboxed interpreter.
    ///
    /// Reuses a buffered instance when one is available and still within its
    /// lifetime ceiling; otherwise creates a fresh one synchronously.
    ///
    /// # Errors
    ///
    /// Returns an error only if sandbox setup fails on a fresh instance.
    pub fn get(&self) -> Result<PooledInterpreter, Error> {
        if let Some(mut vm) = self.pop_buffered() {
            if vm.created_at.elapsed() <= self.config.max_lifetime() {
                vm.touch();
                self.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(vm);
            }
            // Aged out while buffered: retire it and hand out a fresh one.
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(vm_id = vm.id, "Interpreter exceeded lifetime, replacing");
        }
        self.create()
    }

    /// Return a borrowed interpreter to the reuse buffer.
    ///
    /// The instance is dropped if the buffer is full or the pool is closed.
    pub fn put(&self, mut vm: PooledInterpreter) {
        vm.last_used = Instant::now();
        if let Err(err) = self.tx.try_send(vm) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(reason = %err, "Interpreter discarded on return");
        }
    }

    /// Snapshot of the activity counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }

    /// Stop the sweep and drop every buffered instance.
    pub fn close(&self) {
        self.shutdown.cancel();
        let mut dropped = 0u64;
        if let Ok(mut rx) = self.rx.lock() {
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
        }
        tracing::debug!(dropped, "Interpreter pool closed");
    }

    fn pop_buffered(&self) -> Option<PooledInterpreter> {
        self.rx.lock().ok()?.try_recv().ok()
    }

    fn create(&self) -> Result<PooledInterpreter, Error> {
        let mut engine = Engine::new();
        self.sandbox.setup_engine(&mut engine, &self.storage)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let vm = PooledInterpreter {
            engine,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            created_at: now,
            last_used: now,
            use_count: 1,
        };
        tracing::trace!(vm_id = vm.id, "Interpreter created");
        Ok(vm)
    }

    /// Retire buffered instances that idled or aged past their ceilings.
    fn sweep(&self) {
        let max_idle = self.config.max_idle();
        let max_lifetime = self.config.max_lifetime();

        let mut keep = Vec::new();
        let mut retired = 0u64;
        {
            let Ok(mut rx) = self.rx.lock() else { return };
            while let Ok(vm) = rx.try_recv() {
                let expired = vm.last_used.elapsed() > max_idle
                    || vm.created_at.elapsed() > max_lifetime;
                if expired {
                    retired += 1;
                } else {
                    keep.push(vm);
                }
            }
        }
        for vm in keep {
            // Put back without touching last_used; try_send cannot fail here
            // since we just drained the buffer, but stay defensive about a
            // concurrent put racing us.
            if self.tx.try_send(vm).is_err() {
                retired += 1;
            }
        }
        if retired > 0 {
            self.swept.fetch_add(retired, Ordering::Relaxed);
            tracing::debug!(retired, "Pool sweep retired interpreters");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use edgescript_vars::MemoryStore;
    use std::time::Duration;

    fn test_pool(config: PoolConfig) -> Arc<InterpreterPool> {
        let sandbox = Arc::new(Sandbox::builder().build());
        let storage: Arc<dyn VariableStore> = Arc::new(MemoryStore::new());
        InterpreterPool::new(config, sandbox, storage)
    }

    #[tokio::test]
    async fn put_after_get_reuses_the_same_instance() {
        let pool = test_pool(PoolConfig::default());

        let vm = pool.get().unwrap();
        let id = vm.id();
        pool.put(vm);

        let vm = pool.get().unwrap();
        assert_eq!(vm.id(), id, "buffered instance must be reused");

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
    }

    #[tokio::test]
    async fn use_count_increments_per_borrow() {
        let pool = test_pool(PoolConfig::default());
        let vm = pool.get().unwrap();
        assert_eq!(vm.use_count(), 1);
        pool.put(vm);
        let vm = pool.get().unwrap();
        assert_eq!(vm.use_count(), 2);
    }

    #[tokio::test]
    async fn full_buffer_discards_returned_instances() {
        let pool = test_pool(PoolConfig { max_size: 1, ..PoolConfig::default() });

        let first = pool.get().unwrap();
        let second = pool.get().unwrap();
        pool.put(first);
        pool.put(second);

        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn lifetime_expired_instance_is_replaced_on_get() {
        let pool = test_pool(PoolConfig {
            max_lifetime_ms: 1,
            ..PoolConfig::default()
        });

        let vm = pool.get().unwrap();
        let first_id = vm.id();
        pool.put(vm);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let vm = pool.get().unwrap();
        assert_ne!(vm.id(), first_id);
        let stats = pool.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.created, 2);
    }

    #[tokio::test]
    async fn sweep_retires_idle_instances() {
        let pool = test_pool(PoolConfig {
            max_idle_ms: 1,
            sweep_interval_ms: 10,
            ..PoolConfig::default()
        });

        let vm = pool.get().unwrap();
        pool.put(vm);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(pool.stats().swept >= 1, "idle instance should be swept");
        let vm = pool.get().unwrap();
        assert_eq!(pool.stats().created, 2);
        pool.put(vm);
    }

    #[tokio::test]
    async fn exhaustion_falls_back_to_synchronous_creation() {
        let pool = test_pool(PoolConfig { max_size: 1, ..PoolConfig::default() });

        // Borrow more instances than the buffer holds; none of these errors.
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        let c = pool.get().unwrap();
        assert_eq!(pool.stats().created, 3);

        pool.put(a);
        pool.put(b);
        pool.put(c);
    }
}
