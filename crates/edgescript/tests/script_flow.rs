//! End-to-end tests for the script consumer: variable-triggered dispatch,
//! periodic execution, queue backpressure and status bookkeeping.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use edgescript::{
    CompareOp, EngineConfig, Error, ExecInput, HostApi, PeriodicConfig, Sandbox, Script,
    ScriptConsumer, ScriptTrigger, Threshold, TriggerCondition, TriggerType,
};
use edgescript_vars::{MemoryStore, VariableStore};

/// Poll until `check` passes or the deadline elapses.
async fn wait_for(deadline: Duration, check: impl Fn() -> bool) -> bool {
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn variable_trigger(id: &str, variable: &str, op: CompareOp, threshold: serde_json::Value) -> ScriptTrigger {
    ScriptTrigger {
        id: id.to_string(),
        trigger_type: TriggerType::Variable,
        enabled: true,
        condition: Some(TriggerCondition {
            variable_id: variable.to_string(),
            operator: op,
            threshold: Threshold::Literal(threshold),
        }),
        periodic: None,
        event: None,
    }
}

async fn started(store: &Arc<MemoryStore>) -> Arc<ScriptConsumer> {
    let storage: Arc<dyn VariableStore> = store.clone();
    let consumer = ScriptConsumer::new(EngineConfig::default(), storage);
    consumer.start().unwrap();
    consumer
}

// =============================================================================
// Variable-triggered dispatch
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn variable_update_triggers_script_execution() {
    let store = Arc::new(MemoryStore::new());
    let consumer = started(&store).await;

    consumer
        .load_script(Script {
            id: "level-alarm".to_string(),
            name: "Tank level alarm".to_string(),
            // The trigger input map arrives as top-level bindings.
            source: r#"vars::write("alarm_level", value); return #{ ack: true };"#.to_string(),
            enabled: true,
            variable_ids: vec![],
            triggers: vec![variable_trigger("high-level", "tank_level", CompareOp::Gte, json!(80))],
            timeout_ms: None,
        })
        .unwrap();

    // Below threshold: nothing fires.
    store.write_var("tank_level", json!(75)).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(store.read_var("alarm_level").is_err());

    // Above threshold: the script runs and records the triggering value.
    store.write_var("tank_level", json!(85)).unwrap();
    let fired = wait_for(Duration::from_secs(2), || {
        store.read_var("alarm_level").ok() == Some(json!(85))
    })
    .await;
    assert!(fired, "triggered execution should write alarm_level");

    let status = consumer.script_status("level-alarm").unwrap();
    assert_eq!(status.execution_count, 1);
    assert_eq!(status.error_count, 0);

    consumer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn only_satisfied_thresholds_dispatch() {
    let store = Arc::new(MemoryStore::new());
    let consumer = started(&store).await;

    for (script_id, trigger_id, threshold) in
        [("s-80", "t-80", json!(80)), ("s-90", "t-90", json!(90))]
    {
        consumer
            .load_script(Script {
                id: script_id.to_string(),
                name: script_id.to_string(),
                source: format!(r#"vars::write("ran_{script_id}", true);"#),
                enabled: true,
                variable_ids: vec![],
                triggers: vec![variable_trigger(trigger_id, "temp", CompareOp::Gte, threshold)],
                timeout_ms: None,
            })
            .unwrap();
    }

    store.write_var("temp", json!(85)).unwrap();
    let fired = wait_for(Duration::from_secs(2), || {
        store.read_var("ran_s-80").is_ok()
    })
    .await;
    assert!(fired);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.read_var("ran_s-90").is_err(), "90-threshold must not fire at 85");

    consumer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabling_a_trigger_suppresses_dispatch() {
    let store = Arc::new(MemoryStore::new());
    let consumer = started(&store).await;

    consumer
        .load_script(Script {
            id: "counter".to_string(),
            name: "Counter".to_string(),
            source: r#"
                let n = if vars::exists("count") { vars::read("count") } else { 0 };
                vars::write("count", n + 1);
            "#
            .to_string(),
            enabled: true,
            variable_ids: vec![],
            triggers: vec![variable_trigger("on-tick", "tick", CompareOp::Gt, json!(0))],
            timeout_ms: None,
        })
        .unwrap();

    store.write_var("tick", json!(1)).unwrap();
    assert!(wait_for(Duration::from_secs(2), || store.read_var("count").ok() == Some(json!(1))).await);

    consumer.trigger_manager().disable_trigger("on-tick").unwrap();
    store.write_var("tick", json!(2)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.read_var("count").unwrap(), json!(1));

    consumer.trigger_manager().enable_trigger("on-tick").unwrap();
    store.write_var("tick", json!(3)).unwrap();
    assert!(wait_for(Duration::from_secs(2), || store.read_var("count").ok() == Some(json!(2))).await);

    consumer.stop().await;
}

// =============================================================================
// Periodic execution
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interval_trigger_executes_repeatedly() {
    let store = Arc::new(MemoryStore::new());
    let consumer = started(&store).await;

    consumer
        .load_script(Script {
            id: "heartbeat".to_string(),
            name: "Heartbeat".to_string(),
            source: r#"
                let n = if vars::exists("beats") { vars::read("beats") } else { 0 };
                vars::write("beats", n + 1);
            "#
            .to_string(),
            enabled: true,
            variable_ids: vec![],
            triggers: vec![ScriptTrigger {
                id: "every-50ms".to_string(),
                trigger_type: TriggerType::Periodic,
                enabled: true,
                condition: None,
                periodic: Some(PeriodicConfig {
                    interval_ms: Some(50),
                    ..PeriodicConfig::default()
                }),
                event: None,
            }],
            timeout_ms: None,
        })
        .unwrap();

    let beat = wait_for(Duration::from_secs(2), || {
        matches!(store.read_var("beats"), Ok(v) if v.as_i64().unwrap_or(0) >= 2)
    })
    .await;
    assert!(beat, "interval trigger should execute at least twice");

    // Unloading removes the schedule; the counter stops advancing.
    consumer.unload_script("heartbeat").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let frozen = store.read_var("beats").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.read_var("beats").unwrap(), frozen);

    consumer.stop().await;
}

// =============================================================================
// System events
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn system_event_reaches_listening_script() {
    let store = Arc::new(MemoryStore::new());
    let consumer = started(&store).await;

    consumer
        .load_script(Script {
            id: "on-boot".to_string(),
            name: "Boot hook".to_string(),
            source: r#"vars::write("boot_event", event);"#.to_string(),
            enabled: true,
            variable_ids: vec![],
            triggers: vec![ScriptTrigger {
                id: "boot".to_string(),
                trigger_type: TriggerType::System,
                enabled: true,
                condition: None,
                periodic: None,
                event: Some("startup".to_string()),
            }],
            timeout_ms: None,
        })
        .unwrap();

    consumer.notify_system_event("startup", Some(json!({"cold": true})));
    let fired = wait_for(Duration::from_secs(2), || {
        store.read_var("boot_event").ok() == Some(json!("startup"))
    })
    .await;
    assert!(fired);

    consumer.stop().await;
}

// =============================================================================
// Queue backpressure
// =============================================================================

/// Blocking sleep capability for occupying the single worker.
struct Block;

impl HostApi for Block {
    fn name(&self) -> &str {
        "block"
    }
    fn inject(&self, engine: &mut rhai::Engine) -> Result<(), Error> {
        let mut module = rhai::Module::new();
        module.set_native_fn(
            "sleep_ms",
            |ms: i64| -> Result<rhai::Dynamic, Box<rhai::EvalAltResult>> {
                std::thread::sleep(Duration::from_millis(ms.max(0) as u64));
                Ok(rhai::Dynamic::UNIT)
            },
        );
        engine.register_static_module("block", module.into());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_submission_fails_fast_when_the_queue_is_full() {
    let store = Arc::new(MemoryStore::new());
    let storage: Arc<dyn VariableStore> = store.clone();

    let config = EngineConfig {
        workers: 1,
        queue_capacity: 1,
        ..EngineConfig::default()
    };
    let sandbox = Sandbox::builder()
        .with_api(Block)
        .with_allowed_apis(["vars", "sys", "block"])
        .build();
    let consumer = ScriptConsumer::with_sandbox(config, storage, Arc::new(sandbox));
    consumer.start().unwrap();

    consumer
        .load_script(Script {
            id: "slow".to_string(),
            name: "Slow".to_string(),
            source: "block::sleep_ms(400);".to_string(),
            enabled: true,
            variable_ids: vec![],
            triggers: vec![],
            timeout_ms: Some(2_000),
        })
        .unwrap();

    // First task occupies the single worker, second fills the queue.
    consumer.execute_script_async("slow", ExecInput::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    consumer.execute_script_async("slow", ExecInput::new()).unwrap();

    let err = consumer
        .execute_script_async("slow", ExecInput::new())
        .unwrap_err();
    assert!(matches!(err, Error::QueueFull));

    consumer.stop().await;
}
