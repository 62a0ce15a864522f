use sagaflow::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Probe {
    events: Mutex<Vec<String>>,
}

impl Probe {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().expect("lock").push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().expect("lock").clone()
    }
}

impl WorkflowListener for Probe {
    fn on_workflow_start(&self, _workflow: &str, _ctx: &WorkflowContext) -> Result<(), StepError> {
        self.push("start");
        Ok(())
    }

    fn on_workflow_complete(
        &self,
        _workflow: &str,
        _ctx: &WorkflowContext,
        _result: Option<&Value>,
    ) -> Result<(), StepError> {
        self.push("complete");
        Ok(())
    }

    fn on_workflow_error(
        &self,
        _workflow: &str,
        _ctx: &WorkflowContext,
        _error: &(dyn std::error::Error + Send + Sync),
    ) -> Result<(), StepError> {
        self.push("error");
        Ok(())
    }

    fn on_compensation_start(
        &self,
        _workflow: &str,
        _ctx: &WorkflowContext,
    ) -> Result<(), StepError> {
        self.push("compensation_start");
        Ok(())
    }

    fn on_compensation_complete(
        &self,
        _workflow: &str,
        _ctx: &WorkflowContext,
        succeeded: usize,
        failed: usize,
    ) -> Result<(), StepError> {
        self.push(format!("compensation_complete:{succeeded}:{failed}"));
        Ok(())
    }
}

impl StepInterceptor for Probe {
    fn before_step(&self, step: &WorkflowStep, _ctx: &WorkflowContext) -> Result<(), StepError> {
        self.push(format!("before:{}", step.name()));
        Ok(())
    }

    fn after_step(
        &self,
        step: &WorkflowStep,
        _ctx: &WorkflowContext,
        _result: &Value,
    ) -> Result<(), StepError> {
        self.push(format!("after:{}", step.name()));
        Ok(())
    }

    fn on_step_error(
        &self,
        step: &WorkflowStep,
        _ctx: &WorkflowContext,
        _error: &(dyn std::error::Error + Send + Sync),
    ) -> Result<(), StepError> {
        self.push(format!("step_error:{}", step.name()));
        Ok(())
    }
}

#[tokio::test]
async fn test_two_steps_complete_in_order() {
    let mut workflow = Workflow::new("TwoSteps");
    let compensated = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&compensated);
    workflow
        .step_with_compensation(
            "A",
            || Ok("a"),
            move |_v| {
                probe.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .expect("enqueue")
        .step("B", || Ok("b"))
        .expect("enqueue");

    let result = workflow.execute().await.expect("workflow failed");

    assert_eq!(result, Some(json!("b")));
    assert_eq!(workflow.executed_step_names(), vec!["A", "B"]);
    assert_eq!(workflow.get(keys::FINAL_RESULT), Some(json!("b")));
    assert_eq!(compensated.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_retry_exhaustion_triggers_compensation() {
    let mut workflow = Workflow::new("RetryScenario");
    let b_attempts = Arc::new(AtomicU32::new(0));
    let attempts_probe = Arc::clone(&b_attempts);
    let record_a = Arc::new(Mutex::new(Vec::new()));
    let record_probe = Arc::clone(&record_a);

    workflow
        .step_with_compensation(
            "A",
            || Ok("a"),
            move |value| {
                record_probe.lock().expect("lock").push(value);
                Ok(())
            },
        )
        .expect("enqueue")
        .add_step(
            SyncStep::builder("B", move || {
                attempts_probe.fetch_add(1, Ordering::SeqCst);
                Err::<(), StepError>("B keeps failing".into())
            })
            .max_retries(3)
            .retry_delay(Duration::from_millis(1))
            .build(),
        )
        .expect("enqueue");

    let error = workflow.execute().await.expect_err("must fail");

    assert_eq!(b_attempts.load(Ordering::SeqCst), 4);
    assert!(error.to_string().contains("step 2"));
    let recorded = record_a.lock().expect("lock").clone();
    assert_eq!(recorded, vec![json!("a")]);
    match error {
        WorkflowError::WorkflowFailed {
            compensation_errors,
            ..
        } => assert!(compensation_errors.is_empty()),
        other => panic!("unexpected error kind: {other}"),
    }
}

#[tokio::test]
async fn test_critical_step_failure_preserves_kind_and_cause() {
    let mut workflow = Workflow::new("Critical");
    workflow
        .add_step(
            SyncStep::builder("fragile", || {
                Err::<(), StepError>("duplicate key".into())
            })
            .max_retries(0)
            .critical()
            .build(),
        )
        .expect("enqueue");

    let error = workflow.execute().await.expect_err("must fail");

    match error {
        WorkflowError::CriticalStepFailed { step_name, source } => {
            assert_eq!(step_name, "fragile");
            assert_eq!(source.to_string(), "duplicate key");
        }
        other => panic!("unexpected error kind: {other}"),
    }
}

#[tokio::test]
async fn test_parallel_branches_then_step() {
    let mut workflow = Workflow::new("Parallel");
    let ctx = workflow.context();
    let ctx_x = Arc::clone(&ctx);
    let ctx_y = Arc::clone(&ctx);

    let branches: Vec<Branch> = vec![
        Box::new(move |sub| {
            let ctx = Arc::clone(&ctx_x);
            sub.step("leaf x", move || {
                ctx.put("x_result", "x");
                Ok("x")
            })?;
            Ok(())
        }),
        Box::new(move |sub| {
            let ctx = Arc::clone(&ctx_y);
            sub.step("leaf y", move || {
                ctx.put("y_result", "y");
                Ok("y")
            })?;
            Ok(())
        }),
    ];

    workflow
        .parallel(branches)
        .expect("enqueue")
        .step("z", || Ok("z"))
        .expect("enqueue");

    let result = workflow.execute().await.expect("workflow failed");

    assert_eq!(result, Some(json!("z")));
    assert_eq!(workflow.get("x_result"), Some(json!("x")));
    assert_eq!(workflow.get("y_result"), Some(json!("y")));
    assert_eq!(workflow.get(keys::FINAL_RESULT), Some(json!("z")));
}

#[tokio::test]
async fn test_for_each_accumulates_serially() {
    let mut workflow = Workflow::new("ForEach");
    let ctx = workflow.context();
    workflow
        .for_each(
            || vec![1, 2, 3],
            move |item| {
                let sum = ctx.get_or("sum", json!(0)).as_i64().unwrap_or(0);
                let item = item.as_i64().unwrap_or(0);
                ctx.put("sum", sum + item);
                Ok(())
            },
        )
        .expect("enqueue");

    workflow.execute().await.expect("workflow failed");

    assert_eq!(workflow.get("sum"), Some(json!(6)));
    assert_eq!(workflow.get(keys::ITEM_INDEX), Some(json!(2)));
}

#[tokio::test]
async fn test_for_each_async_suppresses_item_failures() {
    let mut workflow = Workflow::new("ForEachAsync");
    let processed = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&processed);
    workflow
        .for_each_async(
            || vec![1, 2, 3],
            move |item| {
                let probe = Arc::clone(&probe);
                async move {
                    if item == json!(2) {
                        return Err("item 2 rejected".into());
                    }
                    probe.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .expect("enqueue");

    workflow.execute().await.expect("workflow must still succeed");

    assert_eq!(processed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_compensations_run_in_reverse_order() {
    let mut workflow = Workflow::new("Reverse");
    let order = Arc::new(Mutex::new(Vec::new()));

    let comp = |label: &str| {
        let order = Arc::clone(&order);
        let label = label.to_string();
        move |_value: Value| {
            order.lock().expect("lock").push(label.clone());
            Ok(())
        }
    };

    workflow
        .step_with_compensation("A", || Ok("a"), comp("A"))
        .expect("enqueue")
        .step_with_compensation("B", || Ok("b"), comp("B"))
        .expect("enqueue")
        .add_step(
            SyncStep::builder("C", || Err::<(), StepError>("C failed".into()))
                .max_retries(0)
                .build(),
        )
        .expect("enqueue");

    let error = workflow.execute().await.expect_err("must fail");

    assert_eq!(workflow.executed_step_names(), vec!["A", "B"]);
    assert_eq!(*order.lock().expect("lock"), vec!["B", "A"]);
    match error {
        WorkflowError::WorkflowFailed {
            source,
            compensation_errors,
            ..
        } => {
            assert_eq!(source.to_string(), "C failed");
            assert!(compensation_errors.is_empty());
        }
        other => panic!("unexpected error kind: {other}"),
    }
}

#[tokio::test]
async fn test_empty_workflow_fires_start_and_complete() {
    let mut workflow = Workflow::new("Empty");
    let probe = Arc::new(Probe::default());
    workflow
        .add_listener(probe.clone())
        .expect("configure");

    let result = workflow.execute().await.expect("workflow failed");

    assert_eq!(result, None);
    assert_eq!(workflow.executed_step_count(), 0);
    assert_eq!(probe.events(), vec!["start", "complete"]);
}

#[tokio::test]
async fn test_single_failure_without_executed_steps_skips_sweep() {
    let mut workflow = Workflow::new("NoSweep");
    let probe = Arc::new(Probe::default());
    workflow
        .add_listener(probe.clone())
        .expect("configure")
        .add_step(
            SyncStep::builder("only", || Err::<(), StepError>("boom".into()))
                .max_retries(0)
                .build(),
        )
        .expect("enqueue");

    workflow.execute().await.expect_err("must fail");

    let events = probe.events();
    assert_eq!(events, vec!["start", "error"]);
    assert!(!events.iter().any(|e| e.starts_with("compensation")));
}

#[tokio::test]
async fn test_async_step_timeout_escalates_after_retries() {
    let mut workflow = Workflow::new("Timeouts");
    let attempts = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&attempts);
    workflow
        .add_step(
            AsyncStep::builder("sleepy", move |_ctx| {
                probe.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok("unreachable")
                }
            })
            .timeout(Duration::from_millis(20))
            .max_retries(1)
            .retry_delay(Duration::from_millis(1))
            .build(),
        )
        .expect("enqueue");

    let error = workflow.execute().await.expect_err("must time out");

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(matches!(error, WorkflowError::StepTimeout { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_failing_compensation_is_collected_and_sweep_continues() {
    let mut workflow = Workflow::new("CompFailure");
    let order = Arc::new(Mutex::new(Vec::new()));
    let order_a = Arc::clone(&order);

    workflow
        .step_with_compensation(
            "A",
            || Ok("a"),
            move |_v| {
                order_a.lock().expect("lock").push("A");
                Ok(())
            },
        )
        .expect("enqueue")
        .step_with_compensation(
            "B",
            || Ok("b"),
            |_v| Err("undo B broken".into()),
        )
        .expect("enqueue")
        .add_step(
            SyncStep::builder("C", || Err::<(), StepError>("C failed".into()))
                .max_retries(0)
                .build(),
        )
        .expect("enqueue");

    let error = workflow.execute().await.expect_err("must fail");

    match error {
        WorkflowError::WorkflowFailed {
            compensation_errors,
            ..
        } => {
            assert_eq!(compensation_errors.len(), 1);
            assert!(matches!(
                compensation_errors[0],
                WorkflowError::CompensationFailed { .. }
            ));
        }
        other => panic!("unexpected error kind: {other}"),
    }
    // A's compensation still ran after B's failed.
    assert_eq!(*order.lock().expect("lock"), vec!["A"]);
}

#[tokio::test]
async fn test_skip_compensation_suppresses_sweep() {
    let mut workflow = Workflow::new("Skipped");
    let compensated = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&compensated);
    workflow
        .skip_compensation(true)
        .expect("configure")
        .step_with_compensation(
            "A",
            || Ok("a"),
            move |_v| {
                probe.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .expect("enqueue")
        .add_step(
            SyncStep::builder("B", || Err::<(), StepError>("boom".into()))
                .max_retries(0)
                .build(),
        )
        .expect("enqueue");

    workflow.execute().await.expect_err("must fail");

    assert_eq!(compensated.load(Ordering::SeqCst), 0);
}

struct FixedChecker {
    executed: Mutex<Vec<(String, String)>>,
    report_done: bool,
}

impl IdempotencyChecker for FixedChecker {
    fn is_step_executed(&self, _workflow_id: &str, _step_id: &str) -> Result<bool, StepError> {
        Ok(self.report_done)
    }

    fn mark_step_executed(&self, workflow_id: &str, step_id: &str) -> Result<(), StepError> {
        self.executed
            .lock()
            .expect("lock")
            .push((workflow_id.to_string(), step_id.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn test_idempotent_step_is_skipped_on_positive_check() {
    let mut workflow = Workflow::new("Idempotent");
    let invoked = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&invoked);
    let checker = Arc::new(FixedChecker {
        executed: Mutex::new(Vec::new()),
        report_done: true,
    });
    workflow
        .with_idempotency_checker(checker)
        .expect("configure")
        .add_step(
            SyncStep::builder("once", move || {
                probe.fetch_add(1, Ordering::SeqCst);
                Ok("value")
            })
            .idempotent()
            .build(),
        )
        .expect("enqueue")
        .step("normal", || Ok("ran"))
        .expect("enqueue");

    let result = workflow.execute().await.expect("workflow failed");

    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(result, Some(json!("ran")));
    assert_eq!(workflow.executed_step_names(), vec!["normal"]);
}

#[tokio::test]
async fn test_idempotent_step_is_marked_after_execution() {
    let mut workflow = Workflow::new("IdempotentMark");
    let checker = Arc::new(FixedChecker {
        executed: Mutex::new(Vec::new()),
        report_done: false,
    });
    workflow
        .with_idempotency_checker(checker.clone())
        .expect("configure")
        .add_step(
            SyncStep::builder("once", || Ok("value"))
                .id("step-once")
                .idempotent()
                .build(),
        )
        .expect("enqueue");

    workflow.execute().await.expect("workflow failed");

    let marked = checker.executed.lock().expect("lock").clone();
    assert_eq!(
        marked,
        vec![(workflow.workflow_id(), "step-once".to_string())]
    );
}

#[tokio::test]
async fn test_interceptors_fire_in_order_and_errors_are_swallowed() {
    struct Exploding;

    impl StepInterceptor for Exploding {
        fn before_step(
            &self,
            _step: &WorkflowStep,
            _ctx: &WorkflowContext,
        ) -> Result<(), StepError> {
            Err("interceptor broken".into())
        }
    }

    let mut workflow = Workflow::new("Hooks");
    let probe = Arc::new(Probe::default());
    workflow
        .add_interceptor(Arc::new(Exploding))
        .expect("configure")
        .add_interceptor(probe.clone())
        .expect("configure")
        .step("only", || Ok("fine"))
        .expect("enqueue");

    let result = workflow.execute().await.expect("workflow failed");

    assert_eq!(result, Some(json!("fine")));
    assert_eq!(probe.events(), vec!["before:only", "after:only"]);
}

#[tokio::test]
async fn test_listener_sees_error_and_compensation_tally() {
    let mut workflow = Workflow::new("ListenerFlow");
    let probe = Arc::new(Probe::default());
    workflow
        .add_listener(probe.clone())
        .expect("configure")
        .step_with_compensation("A", || Ok("a"), |_v| Ok(()))
        .expect("enqueue")
        .add_step(
            SyncStep::builder("B", || Err::<(), StepError>("boom".into()))
                .max_retries(0)
                .build(),
        )
        .expect("enqueue");

    workflow.execute().await.expect_err("must fail");

    assert_eq!(
        probe.events(),
        vec![
            "start",
            "error",
            "compensation_start",
            "compensation_complete:1:0"
        ]
    );
}

struct CountingMetrics {
    executions: AtomicU32,
    failures: AtomicU32,
    retries: AtomicU32,
    compensations: AtomicU32,
}

impl MetricsCollector for CountingMetrics {
    fn record_step_execution(&self, _step: &str, _duration: Duration, success: bool) {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if !success {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_retry(&self, _step: &str, _attempt: u32) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn record_compensation(&self, _step: &str, _success: bool) {
        self.compensations.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_metrics_cover_steps_retries_and_compensation() {
    let metrics = Arc::new(CountingMetrics {
        executions: AtomicU32::new(0),
        failures: AtomicU32::new(0),
        retries: AtomicU32::new(0),
        compensations: AtomicU32::new(0),
    });
    let mut workflow = Workflow::new("Metrics");
    workflow
        .with_metrics_collector(metrics.clone())
        .expect("configure")
        .step_with_compensation("A", || Ok("a"), |_v| Ok(()))
        .expect("enqueue")
        .add_step(
            SyncStep::builder("B", || Err::<(), StepError>("boom".into()))
                .max_retries(1)
                .retry_delay(Duration::from_millis(1))
                .build(),
        )
        .expect("enqueue");

    workflow.execute().await.expect_err("must fail");

    // One successful attempt for A, two failed attempts for B.
    assert_eq!(metrics.executions.load(Ordering::SeqCst), 3);
    assert_eq!(metrics.failures.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.retries.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.compensations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_non_retryable_errors_fail_fast() {
    let mut workflow = Workflow::new("FastFail");
    let attempts = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&attempts);
    workflow
        .with_non_retryable(|e| e.to_string().contains("validation"))
        .expect("configure")
        .add_step(
            SyncStep::builder("reject", move || {
                probe.fetch_add(1, Ordering::SeqCst);
                Err::<(), StepError>("validation rejected".into())
            })
            .max_retries(5)
            .retry_delay(Duration::from_millis(1))
            .build(),
        )
        .expect("enqueue");

    workflow.execute().await.expect_err("must fail");

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mutators_fail_while_executing() {
    let mut workflow = Workflow::new("Gated");
    workflow
        .async_step("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .expect("enqueue");

    let handle = workflow.execute_async().expect("spawn");
    assert!(workflow.is_executing());

    let denied = workflow.step("late", || Ok(()));
    assert!(matches!(
        denied.err(),
        Some(WorkflowError::ExecutionInProgress)
    ));

    handle.cancel();
    assert!(!workflow.is_executing());
}

#[tokio::test]
async fn test_cancelled_execution_reports_interrupted() {
    let mut workflow = Workflow::new("Cancelled");
    workflow
        .async_step("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .expect("enqueue");

    let handle = workflow.execute_async().expect("spawn");
    handle.cancel();

    let error = handle.join().await.expect_err("cancelled");
    assert!(matches!(error, WorkflowError::Interrupted { .. }));
}

#[tokio::test]
async fn test_execute_async_resolves_result() {
    let mut workflow = Workflow::new("Spawned");
    workflow.step("quick", || Ok("done")).expect("enqueue");

    let handle = workflow.execute_async().expect("spawn");
    let result = handle.join().await.expect("workflow failed");

    assert_eq!(result, Some(json!("done")));
    assert!(!workflow.is_executing());
}

#[tokio::test]
async fn test_reset_round_trip_is_deterministic() {
    let build = |workflow: &mut Workflow| {
        workflow
            .step("first", || Ok("one"))
            .expect("enqueue")
            .step("second", || Ok("two"))
            .expect("enqueue");
    };

    let mut workflow = Workflow::new("RoundTrip");
    build(&mut workflow);
    let first_result = workflow.execute().await.expect("workflow failed");
    let first_names = workflow.executed_step_names();

    workflow.reset().expect("reset");
    build(&mut workflow);
    let second_result = workflow.execute().await.expect("workflow failed");

    assert_eq!(first_result, second_result);
    assert_eq!(first_names, workflow.executed_step_names());
}

#[tokio::test]
async fn test_context_survives_failure_for_inspection() {
    let mut workflow = Workflow::new("PostMortem");
    workflow
        .step("A", || Ok("a"))
        .expect("enqueue")
        .add_step(
            SyncStep::builder("B", || Err::<(), StepError>("boom".into()))
                .id("step-b")
                .max_retries(0)
                .build(),
        )
        .expect("enqueue");

    workflow.execute().await.expect_err("must fail");

    let snapshot = workflow.context_snapshot();
    assert_eq!(snapshot.get("step_result_a"), Some(&json!("a")));
    assert!(snapshot.contains_key(keys::ERROR_CONTEXT));
    assert_eq!(
        workflow.context().step_error("step-b").as_deref(),
        Some("boom")
    );
    assert!(workflow
        .execution_trace()
        .iter()
        .any(|line| line.contains("Workflow failed")));
}

#[tokio::test]
async fn test_async_steps_mix_with_sync_steps_in_order() {
    let mut workflow = Workflow::new("Mixed");
    let order = Arc::new(Mutex::new(Vec::new()));
    let sync_probe = Arc::clone(&order);
    let async_probe = Arc::clone(&order);

    workflow
        .step("sync one", move || {
            sync_probe.lock().expect("lock").push("sync");
            Ok(1)
        })
        .expect("enqueue")
        .async_step("async two", move |_ctx| {
            let order = Arc::clone(&async_probe);
            async move {
                order.lock().expect("lock").push("async");
                Ok(2)
            }
        })
        .expect("enqueue");

    let result = workflow.execute().await.expect("workflow failed");

    assert_eq!(result, Some(json!(2)));
    assert_eq!(*order.lock().expect("lock"), vec!["sync", "async"]);
}

#[tokio::test]
async fn test_async_compensation_runs_on_failure() {
    let mut workflow = Workflow::new("AsyncComp");
    let undone = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&undone);

    workflow
        .async_step_with_compensation(
            "Provision",
            |_ctx| async { Ok("account-7") },
            move |_value| {
                let probe = Arc::clone(&probe);
                async move {
                    probe.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .expect("enqueue")
        .add_step(
            SyncStep::builder("Explode", || Err::<(), StepError>("boom".into()))
                .max_retries(0)
                .build(),
        )
        .expect("enqueue");

    workflow.execute().await.expect_err("must fail");

    assert_eq!(undone.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_initial_context_is_visible_to_steps() {
    let mut initial = HashMap::new();
    initial.insert("tenant".to_string(), json!("acme"));
    let mut workflow = Workflow::with_initial("Seeded", initial);
    let ctx = workflow.context();

    workflow
        .step("read", move || {
            Ok(ctx.get_or("tenant", json!("unknown")))
        })
        .expect("enqueue");

    let result = workflow.execute().await.expect("workflow failed");

    assert_eq!(result, Some(json!("acme")));
}
