//! End-to-end tests for the policy engine lifecycle.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tempfile::TempDir;

use policy_bridge_common::{BridgeConfig, EvaluationError, GuestFault};
use policy_bridge_runtime::{BuiltinTable, EngineStatus, PolicyEngine, Tier};

/// A policy speaking the context API over an imported memory.
///
/// `opa_json_parse` boxes the input text as `(addr, len)`; `opa_eval` allows
/// when the text contains `"role":"admin"`. Inputs mentioning `"boom"` abort
/// and inputs mentioning `"spin"` never return.
const POLICY: &str = r#"
(module
    (import "env" "memory" (memory 2))
    (import "env" "opa_abort" (func $abort (param i32)))
    (import "env" "opa_println" (func $println (param i32)))
    (global (export "opa_wasm_abi_version") i32 (i32.const 1))
    (global (export "opa_wasm_abi_minor_version") i32 (i32.const 3))
    (global $heap (mut i32) (i32.const 65536))
    (global $mallocs (mut i32) (i32.const 0))
    (global $frees (mut i32) (i32.const 0))
    (data (i32.const 1024) "\"role\":\"admin\"")
    (data (i32.const 1040) "\"boom\"")
    (data (i32.const 1048) "\"spin\"")
    (data (i32.const 1056) "policy aborted\00")
    (data (i32.const 1088) "[{\"result\":true}]\00")
    (data (i32.const 1120) "[{\"result\":false}]\00")

    (func $contains (param $addr i32) (param $len i32) (param $needle i32) (param $needle_len i32) (result i32)
        (local $i i32) (local $j i32)
        (block $done
            (loop $scan
                (br_if $done (i32.gt_s (i32.add (local.get $i) (local.get $needle_len)) (local.get $len)))
                (local.set $j (i32.const 0))
                (block $mismatch
                    (loop $compare
                        (br_if $mismatch
                            (i32.ne
                                (i32.load8_u (i32.add (local.get $addr) (i32.add (local.get $i) (local.get $j))))
                                (i32.load8_u (i32.add (local.get $needle) (local.get $j)))))
                        (local.set $j (i32.add (local.get $j) (i32.const 1)))
                        (br_if $compare (i32.lt_s (local.get $j) (local.get $needle_len)))
                        (return (i32.const 1))))
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (br $scan)))
        (i32.const 0))

    (func (export "opa_malloc") (param $len i32) (result i32)
        (local $addr i32)
        (global.set $mallocs (i32.add (global.get $mallocs) (i32.const 1)))
        (local.set $addr (global.get $heap))
        (global.set $heap
            (i32.add (local.get $addr) (i32.and (i32.add (local.get $len) (i32.const 7)) (i32.const -8))))
        (local.get $addr))
    (func (export "opa_free") (param i32)
        (global.set $frees (i32.add (global.get $frees) (i32.const 1))))
    (func (export "opa_heap_ptr_get") (result i32) (global.get $heap))
    (func (export "opa_heap_ptr_set") (param i32) (global.set $heap (local.get 0)))

    (func (export "opa_json_parse") (param $addr i32) (param $len i32) (result i32)
        (local $value i32)
        (if (i32.eqz (local.get $len)) (then (return (i32.const 0))))
        (local.set $value (global.get $heap))
        (global.set $heap (i32.add (local.get $value) (i32.const 8)))
        (i32.store (local.get $value) (local.get $addr))
        (i32.store offset=4 (local.get $value) (local.get $len))
        (local.get $value))
    (func (export "opa_json_dump") (param i32) (result i32) (local.get 0))

    (func (export "opa_eval_ctx_new") (result i32)
        (i64.store (i32.const 512) (i64.const 0))
        (i32.const 512))
    (func (export "opa_eval_ctx_set_input") (param $ctx i32) (param $value i32)
        (i32.store (local.get $ctx) (local.get $value)))
    (func (export "opa_eval") (param $ctx i32) (result i32)
        (local $addr i32) (local $len i32)
        (local.set $addr (i32.load (i32.load (local.get $ctx))))
        (local.set $len (i32.load offset=4 (i32.load (local.get $ctx))))
        (if (call $contains (local.get $addr) (local.get $len) (i32.const 1040) (i32.const 6))
            (then (call $abort (i32.const 1056))))
        (if (call $contains (local.get $addr) (local.get $len) (i32.const 1048) (i32.const 6))
            (then (loop $forever (br $forever))))
        (i32.store offset=4 (local.get $ctx)
            (select (i32.const 1088) (i32.const 1120)
                (call $contains (local.get $addr) (local.get $len) (i32.const 1024) (i32.const 14))))
        (i32.const 0))
    (func (export "opa_eval_ctx_get_result") (param $ctx i32) (result i32)
        (i32.load offset=4 (local.get $ctx)))

    (func (export "malloc_count") (result i32) (global.get $mallocs))
    (func (export "free_count") (result i32) (global.get $frees))
)
"#;

/// Context API that hands out a null context, plus a simple `eval` that
/// allows everyone.
const BROKEN_CONTEXT: &str = r#"
(module
    (memory (export "memory") 1)
    (global $heap (mut i32) (i32.const 1024))
    (func (export "opa_malloc") (param $len i32) (result i32)
        (local $addr i32)
        (local.set $addr (global.get $heap))
        (global.set $heap (i32.add (local.get $addr) (local.get $len)))
        (local.get $addr))
    (func (export "opa_free") (param i32))
    (func (export "opa_eval_ctx_new") (result i32) (i32.const 0))
    (func (export "opa_eval_ctx_set_input") (param i32 i32))
    (func (export "opa_eval") (param i32) (result i32) (i32.const 0))
    (func (export "opa_eval_ctx_get_result") (param i32) (result i32) (i32.const 0))
    (func (export "eval") (param i32) (result i32) (i32.const 1))
)
"#;

/// `opa_eval` consults the `tenant.enabled` builtin.
const BUILTIN_POLICY: &str = r#"
(module
    (import "env" "opa_builtin0" (func $builtin0 (param i32 i32) (result i32)))
    (memory (export "memory") 2)
    (global $heap (mut i32) (i32.const 4096))
    (data (i32.const 16) "{\"tenant.enabled\":0}\00")
    (data (i32.const 64) "[{\"result\":true}]\00")
    (data (i32.const 96) "[{\"result\":false}]\00")
    (func (export "builtins") (result i32) (i32.const 16))
    (func (export "opa_malloc") (param $len i32) (result i32)
        (local $addr i32)
        (local.set $addr (global.get $heap))
        (global.set $heap (i32.add (local.get $addr) (i32.add (local.get $len) (i32.const 1))))
        (local.get $addr))
    (func (export "opa_free") (param i32))
    (func (export "opa_json_parse") (param i32 i32) (result i32) (local.get 0))
    (func (export "opa_json_dump") (param i32) (result i32) (local.get 0))
    (func (export "opa_eval_ctx_new") (result i32) (i32.const 8))
    (func (export "opa_eval_ctx_set_input") (param i32 i32))
    (func (export "opa_eval") (param $ctx i32) (result i32)
        (local $enabled i32)
        (local.set $enabled (call $builtin0 (i32.const 0) (local.get $ctx)))
        ;; JSON `true` starts with 't'
        (i32.store (i32.const 8)
            (select (i32.const 64) (i32.const 96)
                (i32.and
                    (i32.ne (local.get $enabled) (i32.const 0))
                    (i32.eq (i32.load8_u (local.get $enabled)) (i32.const 116)))))
        (i32.const 0))
    (func (export "opa_eval_ctx_get_result") (param i32) (result i32) (i32.load (i32.const 8)))
)
"#;

struct Fixture {
    _dir: TempDir,
    config: BridgeConfig,
}

impl Fixture {
    fn new(wat: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.wat");
        std::fs::write(&path, wat).unwrap();
        Self {
            config: config_for(&path),
            _dir: dir,
        }
    }

    fn engine(&self) -> PolicyEngine {
        let engine = PolicyEngine::new(self.config.clone());
        assert_eq!(engine.initialize(), EngineStatus::Ready);
        engine
    }
}

fn config_for(path: &Path) -> BridgeConfig {
    let mut config = BridgeConfig::with_artifact(path);
    config.pool.size = 2;
    config
}

fn admin() -> Value {
    json!({"user": {"role": "admin", "name": "alice"}})
}

#[test]
fn test_context_tier_decisions() {
    let engine = Fixture::new(POLICY).engine();

    let decision = engine.evaluate(&admin()).unwrap();
    assert!(decision.allowed());
    assert_eq!(decision.tier(), Tier::Context);
    assert_eq!(decision.result(), Some(&json!([{"result": true}])));

    for input in [
        json!({"user": {"role": "user"}}),
        json!({"user": {"role": "guest"}}),
        json!({"user": {"role": "administrator"}}),
        json!({"user": {}}),
        json!({}),
    ] {
        let decision = engine.evaluate(&input).unwrap();
        assert!(!decision.allowed(), "{input} must be denied");
        assert_eq!(decision.tier(), Tier::Context);
    }

    assert!(engine.is_allowed(&admin()));
}

#[test]
fn test_describe_loaded_module() {
    let engine = Fixture::new(POLICY).engine();

    let description = engine.describe().unwrap();
    assert!(description.has_memory);
    assert!(description.supports_context_api);
    assert!(!description.supports_simple_api);
    assert!(description.has_allocator);
    assert!(description.capabilities.has_heap_reset);
    assert_eq!(description.abi_version.unwrap().to_string(), "1.3");
    assert!(description.export_names.iter().any(|name| name == "opa_eval"));

    let exports = engine.describe_exports().unwrap();
    assert!(exports.opa.contains(&"opa_malloc".to_string()));
    assert!(exports.eval.contains(&"opa_eval_ctx_new".to_string()));
    assert_eq!(exports.memory, vec!["opa_malloc", "opa_free"]);
}

#[test]
fn test_initialize_is_idempotent() {
    let fixture = Fixture::new(POLICY);
    let engine = fixture.engine();

    assert_eq!(engine.initialize(), EngineStatus::Ready);
    assert!(engine.is_ready());
    assert!(engine.degraded_reason().is_none());
}

#[test]
fn test_missing_file_degrades() {
    let engine = PolicyEngine::new(BridgeConfig::with_artifact("/nonexistent/policy.wasm"));

    assert_eq!(engine.initialize(), EngineStatus::Degraded);
    assert!(engine.degraded_reason().unwrap().contains("not found"));

    let decision = engine.evaluate(&admin()).unwrap();
    assert!(decision.allowed());
    assert_eq!(decision.tier(), Tier::Fallback);
    assert!(!engine.is_allowed(&json!({"user": {"role": "guest"}})));
}

#[test]
fn test_unsupported_abi_degrades() {
    let wat = r#"
        (module
            (memory (export "memory") 1)
            (global (export "opa_wasm_abi_version") i32 (i32.const 2))
        )
    "#;
    let fixture = Fixture::new(wat);
    let engine = PolicyEngine::new(fixture.config.clone());

    assert_eq!(engine.initialize(), EngineStatus::Degraded);
    assert!(
        engine
            .degraded_reason()
            .unwrap()
            .contains("Unsupported policy ABI version 2.0")
    );
    assert_eq!(engine.evaluate(&admin()).unwrap().tier(), Tier::Fallback);
}

#[test]
fn test_unknown_import_degrades() {
    let wat = r#"(module (import "env" "opa_mystery" (func (param i32))))"#;
    let fixture = Fixture::new(wat);
    let engine = PolicyEngine::new(fixture.config.clone());

    assert_eq!(engine.initialize(), EngineStatus::Degraded);
    assert!(engine.degraded_reason().unwrap().contains("opa_mystery"));
}

#[test]
fn test_module_without_protocols_uses_fallback() {
    let engine = Fixture::new(r#"(module (memory (export "memory") 1))"#).engine();

    let decision = engine.evaluate(&admin()).unwrap();
    assert!(decision.allowed());
    assert!(decision.is_degraded());

    for input in [
        json!({"user": {"role": "user"}}),
        json!({"user": "admin"}),
        json!({}),
        json!(null),
    ] {
        let decision = engine.evaluate(&input).unwrap();
        assert!(!decision.allowed(), "{input} must be denied");
        assert_eq!(decision.tier(), Tier::Fallback);
    }
}

#[test]
fn test_broken_context_falls_through_to_simple() {
    let engine = Fixture::new(BROKEN_CONTEXT).engine();

    let decision = engine.evaluate(&json!({"user": {"role": "guest"}})).unwrap();
    assert_eq!(decision.tier(), Tier::Simple);
    assert!(decision.allowed());
    assert_eq!(decision.result(), Some(&json!(true)));
}

#[test]
fn test_builtin_served_by_host() {
    let fixture = Fixture::new(BUILTIN_POLICY);

    let mut builtins = BuiltinTable::with_defaults();
    builtins.register("tenant.enabled", |_| Ok(json!(true)));
    let engine = PolicyEngine::with_builtins(fixture.config.clone(), builtins);
    assert_eq!(engine.initialize(), EngineStatus::Ready);

    let decision = engine.evaluate(&json!({"user": {"role": "guest"}})).unwrap();
    assert!(decision.allowed());
    assert_eq!(decision.tier(), Tier::Context);

    let mut builtins = BuiltinTable::new();
    builtins.register("tenant.enabled", |_| Ok(json!(false)));
    let engine = PolicyEngine::with_builtins(fixture.config.clone(), builtins);
    engine.initialize();

    let decision = engine.evaluate(&admin()).unwrap();
    assert!(!decision.allowed());
    assert_eq!(decision.tier(), Tier::Context);
}

#[test]
fn test_unserved_builtin_falls_back() {
    let engine = Fixture::new(BUILTIN_POLICY).engine();

    let decision = engine.evaluate(&admin()).unwrap();
    assert_eq!(decision.tier(), Tier::Fallback);
    assert!(decision.allowed());
    assert!(!engine.is_allowed(&json!({"user": {"role": "user"}})));
}

#[test]
fn test_guest_abort_poisons_only_its_slot() {
    let mut fixture = Fixture::new(POLICY);
    fixture.config.pool.size = 1;
    let engine = fixture.engine();

    let err = engine
        .evaluate(&json!({"user": {"role": "boom"}}))
        .unwrap_err();
    assert!(err.is_guest_fault());
    assert!(matches!(err, EvaluationError::GuestFault(GuestFault::Abort)));
    assert!(!err.to_string().contains("policy aborted"));

    // The only slot was recreated.
    assert!(engine.evaluate(&admin()).unwrap().allowed());
    assert!(!engine.is_allowed(&json!({"user": {"role": "boom"}})));
}

#[test]
fn test_guest_faults_do_not_disturb_other_slots() {
    let mut fixture = Fixture::new(POLICY);
    fixture.config.pool.size = 4;
    fixture.config.pool.acquire_timeout_ms = 5_000;
    let engine = fixture.engine();

    std::thread::scope(|scope| {
        let aborter = scope.spawn(|| {
            (0..50)
                .filter(|_| {
                    matches!(
                        engine.evaluate(&json!({"user": {"role": "boom"}})),
                        Err(EvaluationError::GuestFault(GuestFault::Abort))
                    )
                })
                .count()
        });
        let evaluators: Vec<_> = (0..7)
            .map(|_| {
                scope.spawn(|| {
                    (0..50)
                        .filter(|_| {
                            let decision = engine.evaluate(&admin()).unwrap();
                            decision.allowed() && decision.tier() == Tier::Context
                        })
                        .count()
                })
            })
            .collect();

        assert_eq!(aborter.join().unwrap(), 50);
        for evaluator in evaluators {
            assert_eq!(evaluator.join().unwrap(), 50);
        }
    });

    assert_eq!(engine.status(), EngineStatus::Ready);
    assert!(engine.evaluate(&admin()).unwrap().allowed());
}

#[test]
fn test_watchdog_interrupts_runaway_guest() {
    let mut fixture = Fixture::new(POLICY);
    fixture.config.engine.fuel_metering = false;
    fixture.config.evaluation.timeout_ms = 50;
    let engine = fixture.engine();

    let start = Instant::now();
    let err = engine
        .evaluate(&json!({"user": {"role": "spin"}}))
        .unwrap_err();

    assert!(matches!(err, EvaluationError::GuestFault(GuestFault::Timeout)));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(engine.evaluate(&admin()).unwrap().allowed());
}

#[test]
fn test_fuel_exhaustion() {
    let mut fixture = Fixture::new(POLICY);
    fixture.config.engine.epoch_interruption = false;
    fixture.config.evaluation.max_fuel = 1_000_000;
    let engine = fixture.engine();

    let err = engine
        .evaluate(&json!({"user": {"role": "spin"}}))
        .unwrap_err();

    assert!(matches!(
        err,
        EvaluationError::GuestFault(GuestFault::FuelExhausted)
    ));
    assert!(engine.evaluate(&admin()).unwrap().allowed());
}

#[test]
fn test_backpressure_when_pool_is_busy() {
    let mut fixture = Fixture::new(POLICY);
    fixture.config.pool.size = 1;
    fixture.config.pool.acquire_timeout_ms = 20;
    fixture.config.engine.fuel_metering = false;
    fixture.config.evaluation.timeout_ms = 500;
    let engine = Arc::new(fixture.engine());

    let busy = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || engine.evaluate(&json!({"user": {"role": "spin"}})))
    };
    std::thread::sleep(Duration::from_millis(100));

    let err = engine.evaluate(&admin()).unwrap_err();
    assert!(err.is_overload());
    assert!(!engine.is_allowed(&admin()));

    assert!(busy.join().unwrap().unwrap_err().is_guest_fault());
    assert!(engine.evaluate(&admin()).unwrap().allowed());
}

/// Run 100 inputs sequentially, then concurrently on 8 slots, and compare.
async fn assert_concurrent_matches_sequential(wat: &str, tier: Tier) {
    let mut fixture = Fixture::new(wat);
    fixture.config.pool.size = 8;
    fixture.config.pool.acquire_timeout_ms = 5_000;
    let engine = Arc::new(fixture.engine());

    let roles = ["admin", "user", "guest", "auditor", "admin"];
    let inputs: Vec<Value> = (0..100)
        .map(|i| json!({"user": {"role": roles[i % roles.len()], "id": i}}))
        .collect();

    let sequential: Vec<bool> = inputs
        .iter()
        .map(|input| engine.evaluate(input).unwrap().allowed())
        .collect();

    let tasks: Vec<_> = inputs
        .iter()
        .cloned()
        .map(|input| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.evaluate_blocking(input).await })
        })
        .collect();

    let mut concurrent = Vec::with_capacity(tasks.len());
    for task in tasks {
        let decision = task.await.unwrap().unwrap();
        assert_eq!(decision.tier(), tier);
        concurrent.push(decision.allowed());
    }

    assert_eq!(concurrent, sequential);
    assert_eq!(sequential.iter().filter(|allowed| **allowed).count(), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_matches_sequential() {
    assert_concurrent_matches_sequential(POLICY, Tier::Context).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fallback_matches_sequential() {
    assert_concurrent_matches_sequential(r#"(module (memory (export "memory") 1))"#, Tier::Fallback)
        .await;
}

#[test]
fn test_shutdown_rejects_further_calls() {
    let engine = Fixture::new(POLICY).engine();
    assert!(engine.is_allowed(&admin()));

    engine.shutdown();

    assert_eq!(engine.status(), EngineStatus::Stopped);
    assert!(!engine.is_initialized());
    assert!(engine.describe().is_none());
    assert!(matches!(
        engine.evaluate(&admin()),
        Err(EvaluationError::Stopped)
    ));
    assert!(!engine.is_allowed(&admin()));
    assert_eq!(engine.initialize(), EngineStatus::Stopped);
}
