//! Capability-restricted execution environment.
//!
//! The sandbox prepares a raw interpreter for script use: it strips dynamic
//! evaluation, applies resource ceilings, and injects the allow-listed
//! capability namespaces. Scripts only ever see interpreters that went
//! through [`Sandbox::setup_engine`]; the pool runs it on every instance it
//! creates.
//!
//! Capabilities are delivered as rhai modules. The built-in namespaces are
//! `vars` (variable I/O over the storage backend) and `sys` (logging and
//! clock helpers); further namespaces such as communication clients plug in
//! through the [`HostApi`] trait. No capability can be added to a live
//! interpreter after setup; re-sandboxing requires a fresh instance.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use rhai::{Dynamic, Engine, EvalAltResult, Module, Position};
use serde_json::Value;

use edgescript_vars::VariableStore;

use crate::config::SandboxLimits;
use crate::error::Error;

/// Contract for injectable host-API modules.
///
/// Each module owns one capability namespace (HTTP client, MQTT client,
/// Modbus master, ...). The sandbox calls [`HostApi::inject`] once per fresh
/// interpreter, before any script executes on it, and only when the module's
/// name is on the allow-list.
pub trait HostApi: Send + Sync {
    /// Namespace name the allow-list matches against.
    fn name(&self) -> &str;

    /// Register the module's functions on the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the module cannot be constructed; the interpreter
    /// is then discarded rather than handed out half-wired.
    fn inject(&self, engine: &mut Engine) -> Result<(), Error>;
}

/// Builds restricted execution environments for interpreter instances.
pub struct Sandbox {
    allowed: RwLock<HashSet<String>>,
    apis: Vec<Arc<dyn HostApi>>,
    limits: SandboxLimits,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let allowed = self.allowed.read().map(|a| a.len()).unwrap_or(0);
        f.debug_struct("Sandbox")
            .field("allowed", &allowed)
            .field("apis", &format!("[{} modules]", self.apis.len()))
            .field("limits", &self.limits)
            .finish()
    }
}

impl Sandbox {
    /// Create a sandbox builder.
    #[must_use]
    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::new()
    }

    /// Whether the named capability namespace may be injected.
    #[must_use]
    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed
            .read()
            .map(|allowed| allowed.contains(name))
            .unwrap_or(false)
    }

    /// Replace the capability allow-list.
    ///
    /// Only affects interpreters sandboxed after the call; instances already
    /// handed out keep the capabilities they were built with.
    pub fn set_allowed_apis<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut allowed) = self.allowed.write() {
            *allowed = names.into_iter().map(Into::into).collect();
        }
    }

    /// Turn a raw engine into a sandboxed one.
    ///
    /// Strips `eval`, applies the resource ceilings, and injects every
    /// allowed capability namespace using the supplied storage backend.
    ///
    /// # Errors
    ///
    /// Returns an error if a host-API module fails to inject.
    pub fn setup_engine(
        &self,
        engine: &mut Engine,
        storage: &Arc<dyn VariableStore>,
    ) -> Result<(), Error> {
        engine.disable_symbol("eval");

        if self.limits.max_operations > 0 {
            engine.set_max_operations(self.limits.max_operations);
        }
        engine.set_max_call_levels(self.limits.max_call_levels);
        engine.set_max_string_size(self.limits.max_string_size);
        engine.set_max_array_size(self.limits.max_array_size);
        engine.set_max_map_size(self.limits.max_map_size);

        if self.is_allowed("vars") {
            engine.register_static_module("vars", vars_module(Arc::clone(storage)).into());
        }
        if self.is_allowed("sys") {
            engine.register_static_module("sys", sys_module().into());
        }

        for api in &self.apis {
            if self.is_allowed(api.name()) {
                api.inject(engine)?;
                tracing::debug!(api = %api.name(), "Host API injected");
            }
        }

        Ok(())
    }
}

/// Builder for constructing a [`Sandbox`].
pub struct SandboxBuilder {
    allowed: HashSet<String>,
    apis: Vec<Arc<dyn HostApi>>,
    limits: SandboxLimits,
}

impl Default for SandboxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SandboxBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxBuilder")
            .field("allowed", &self.allowed)
            .field("apis", &format!("[{} modules]", self.apis.len()))
            .field("limits", &self.limits)
            .finish()
    }
}

impl SandboxBuilder {
    /// Create a builder with the default `vars` + `sys` allow-list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            allowed: ["vars", "sys"].into_iter().map(str::to_string).collect(),
            apis: Vec::new(),
            limits: SandboxLimits::default(),
        }
    }

    /// Replace the capability allow-list.
    #[must_use]
    pub fn with_allowed_apis<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = names.into_iter().map(Into::into).collect();
        self
    }

    /// Add an injectable host-API module.
    #[must_use]
    pub fn with_api(mut self, api: impl HostApi + 'static) -> Self {
        self.apis.push(Arc::new(api));
        self
    }

    /// Set the per-interpreter resource ceilings.
    #[must_use]
    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Build the sandbox.
    #[must_use]
    pub fn build(self) -> Sandbox {
        Sandbox {
            allowed: RwLock::new(self.allowed),
            apis: self.apis,
            limits: self.limits,
        }
    }
}

/// Convert a host-side failure into a script-visible runtime error.
fn host_error(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message.into()),
        Position::NONE,
    ))
}

/// Variable I/O namespace: `vars::read`, `vars::write`, `vars::exists`.
fn vars_module(storage: Arc<dyn VariableStore>) -> Module {
    let mut module = Module::new();

    let store = Arc::clone(&storage);
    module.set_native_fn(
        "read",
        move |id: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let value = store.read_var(id).map_err(|e| host_error(e.to_string()))?;
            rhai::serde::to_dynamic(&value)
        },
    );

    let store = Arc::clone(&storage);
    module.set_native_fn(
        "write",
        move |id: &str, value: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
            let json: Value = rhai::serde::from_dynamic(&value)?;
            store
                .write_var(id, json)
                .map_err(|e| host_error(e.to_string()))?;
            Ok(Dynamic::UNIT)
        },
    );

    let store = storage;
    module.set_native_fn(
        "exists",
        move |id: &str| -> Result<bool, Box<EvalAltResult>> { Ok(store.read_var(id).is_ok()) },
    );

    module
}

/// System utilities namespace: `sys::log`, `sys::warn`, `sys::now_ms`.
fn sys_module() -> Module {
    let mut module = Module::new();

    module.set_native_fn(
        "log",
        |message: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            tracing::info!(target: "edgescript::script", "{message}");
            Ok(Dynamic::UNIT)
        },
    );

    module.set_native_fn(
        "warn",
        |message: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            tracing::warn!(target: "edgescript::script", "{message}");
            Ok(Dynamic::UNIT)
        },
    );

    module.set_native_fn(
        "now_ms",
        || -> Result<i64, Box<EvalAltResult>> { Ok(chrono::Utc::now().timestamp_millis()) },
    );

    module
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use edgescript_vars::MemoryStore;
    use serde_json::json;

    fn sandboxed_engine(sandbox: &Sandbox, storage: &Arc<dyn VariableStore>) -> Engine {
        let mut engine = Engine::new();
        sandbox.setup_engine(&mut engine, storage).unwrap();
        engine
    }

    #[test]
    fn eval_symbol_is_stripped() {
        let sandbox = Sandbox::builder().build();
        let storage: Arc<dyn VariableStore> = Arc::new(MemoryStore::new());
        let engine = sandboxed_engine(&sandbox, &storage);

        let result = engine.eval::<i64>(r#"eval("1 + 1")"#);
        assert!(result.is_err(), "eval must not be callable");
    }

    #[test]
    fn vars_namespace_reads_and_writes_storage() {
        let sandbox = Sandbox::builder().build();
        let store = Arc::new(MemoryStore::new());
        let storage: Arc<dyn VariableStore> = store.clone();
        let engine = sandboxed_engine(&sandbox, &storage);

        store.write_var("temp", json!(21.0)).unwrap();
        let read: f64 = engine.eval(r#"vars::read("temp")"#).unwrap();
        assert!((read - 21.0).abs() < f64::EPSILON);

        engine.eval::<()>(r#"vars::write("setpoint", 42.5)"#).unwrap();
        assert_eq!(store.read_var("setpoint").unwrap(), json!(42.5));

        let exists: bool = engine.eval(r#"vars::exists("temp")"#).unwrap();
        assert!(exists);
        let missing: bool = engine.eval(r#"vars::exists("nope")"#).unwrap();
        assert!(!missing);
    }

    #[test]
    fn narrowed_allow_list_withholds_namespaces() {
        let sandbox = Sandbox::builder().build();
        sandbox.set_allowed_apis(["sys"]);
        assert!(!sandbox.is_allowed("vars"));

        let storage: Arc<dyn VariableStore> = Arc::new(MemoryStore::new());
        let engine = sandboxed_engine(&sandbox, &storage);
        assert!(engine.eval::<f64>(r#"vars::read("temp")"#).is_err());
    }

    #[test]
    fn host_api_injection_respects_allow_list() {
        struct Echo;
        impl HostApi for Echo {
            fn name(&self) -> &str {
                "echo"
            }
            fn inject(&self, engine: &mut Engine) -> Result<(), Error> {
                let mut module = Module::new();
                module.set_native_fn(
                    "ping",
                    || -> Result<String, Box<EvalAltResult>> { Ok("pong".to_string()) },
                );
                engine.register_static_module("echo", module.into());
                Ok(())
            }
        }

        let storage: Arc<dyn VariableStore> = Arc::new(MemoryStore::new());

        // Not on the allow-list: namespace absent.
        let sandbox = Sandbox::builder().with_api(Echo).build();
        let engine = sandboxed_engine(&sandbox, &storage);
        assert!(engine.eval::<String>("echo::ping()").is_err());

        // Allow-listed: namespace callable.
        let sandbox = Sandbox::builder()
            .with_api(Echo)
            .with_allowed_apis(["vars", "sys", "echo"])
            .build();
        let engine = sandboxed_engine(&sandbox, &storage);
        assert_eq!(engine.eval::<String>("echo::ping()").unwrap(), "pong");
    }

    #[test]
    fn operation_ceiling_stops_runaway_loops() {
        let limits = SandboxLimits { max_operations: 10_000, ..SandboxLimits::default() };
        let sandbox = Sandbox::builder().with_limits(limits).build();
        let storage: Arc<dyn VariableStore> = Arc::new(MemoryStore::new());
        let engine = sandboxed_engine(&sandbox, &storage);

        let result = engine.eval::<i64>("let x = 0; while true { x += 1 } x");
        assert!(result.is_err(), "unbounded loop must hit the operation ceiling");
    }
}
