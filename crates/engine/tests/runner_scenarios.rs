use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Value, json};
use stepwise_engine::{
    AutomationRunner, EngineConfig, EngineFault, InMemoryQuotaGate, QuotaResource, RecordingEventPublisher, StepRegistry,
    StepServices, templates::encode_script_binding,
};
use stepwise_types::{
    AutomationDefinition, EventKind, LoopSpec, RunResult, RunStatus, StepId, StepRunStatus, StepSpec, TenantId, TriggerEvent,
    TriggerSpec,
};

struct Fixture {
    runner: AutomationRunner,
    events: Arc<RecordingEventPublisher>,
    quota: Arc<InMemoryQuotaGate>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_quota(InMemoryQuotaGate::unlimited())
    }

    fn with_quota(quota: InMemoryQuotaGate) -> Self {
        let events = Arc::new(RecordingEventPublisher::new());
        let quota = Arc::new(quota);
        let runner = AutomationRunner::new(StepServices::in_memory(), quota.clone(), events.clone(), EngineConfig::default());
        Self { runner, events, quota }
    }
}

fn automation(tenant: &str, steps: Vec<StepSpec>) -> AutomationDefinition {
    AutomationDefinition {
        id: format!("au_{tenant}"),
        tenant_id: TenantId::new(tenant),
        name: Some("scenario".to_string()),
        trigger: TriggerSpec {
            event: TriggerEvent::Webhook,
            filter: IndexMap::new(),
        },
        steps,
    }
}

fn collect(step_name: &str, collection: Value) -> StepSpec {
    StepSpec::new(step_name, StepId::Collect).with_input("collection", collection)
}

#[tokio::test]
async fn sequential_collect_steps_succeed_in_order() {
    let fixture = Fixture::new();
    let tenant_id = TenantId::new("tenant_a");
    let definition = automation("tenant_a", vec![collect("first", json!("x")), collect("second", json!("y"))]);

    let run = fixture
        .runner
        .execute(&definition, json!({}), &tenant_id)
        .await
        .expect("run completes");

    assert_eq!(run.status, RunStatus::Success);
    let values: Vec<&Value> = run.steps.iter().map(|step| &step.outputs["value"]).collect();
    assert_eq!(values, vec![&json!("x"), &json!("y")]);
    assert!(run.steps.iter().all(|step| step.status == StepRunStatus::Success));
}

#[tokio::test]
async fn loop_over_delimited_binding_respects_max_iterations() {
    let fixture = Fixture::new();
    let tenant_id = TenantId::new("tenant_a");
    let definition = automation(
        "tenant_a",
        vec![
            collect("source", json!("a,b,c")),
            collect("each", json!("${{ loop.currentItem }}")).with_loop(LoopSpec {
                input: json!("${{ steps.source.value }}"),
                separator: Some(",".to_string()),
                max_iterations: Some(2),
                failure_condition: None,
            }),
        ],
    );

    let run = fixture
        .runner
        .execute(&definition, json!({}), &tenant_id)
        .await
        .expect("run completes");

    let loop_outputs = run.outputs_of("each");
    assert_eq!(loop_outputs["iterations"], json!(2));
    assert_eq!(loop_outputs["items"].as_array().map(Vec::len), Some(2));
    assert_eq!(loop_outputs["success"], json!(true));
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn quota_rejection_fails_without_steps_or_step_events() {
    let tenant_id = TenantId::new("tenant_t");
    let fixture = Fixture::with_quota(InMemoryQuotaGate::unlimited().with_limit(tenant_id.clone(), QuotaResource::AutomationRuns, 0));
    let definition = automation("tenant_t", vec![collect("first", json!("x"))]);

    let run = fixture
        .runner
        .execute(&definition, json!({}), &tenant_id)
        .await
        .expect("rejection is not a fault");

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.steps.is_empty());
    assert!(run.error.as_deref().is_some_and(|message| message.contains("quota exceeded")));
    assert_eq!(fixture.events.kinds_for_run(&run.run_id).await, vec![EventKind::RunRejected]);
    assert_eq!(fixture.quota.usage(&tenant_id, QuotaResource::AutomationRuns).await, 0);
}

#[tokio::test]
async fn unresolvable_required_input_fails_the_step_but_not_the_run() {
    let fixture = Fixture::new();
    let tenant_id = TenantId::new("tenant_a");
    let definition = automation(
        "tenant_a",
        vec![
            StepSpec::new("log", StepId::ServerLog).with_input("text", json!("${{ trigger.does.not.exist }}")),
            collect("after", json!("${{ steps.log.success }}")),
        ],
    );

    let run = fixture
        .runner
        .execute(&definition, json!({}), &tenant_id)
        .await
        .expect("run completes");

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.steps[0].status, StepRunStatus::Failed);
    assert_eq!(run.outputs_of("log")["success"], json!(false));
    assert!(run.steps[0].error.is_some());
    assert_eq!(run.outputs_of("after")["value"], json!(false));
}

#[tokio::test]
async fn failing_filter_stops_the_run() {
    let fixture = Fixture::new();
    let tenant_id = TenantId::new("tenant_a");
    let definition = automation(
        "tenant_a",
        vec![
            StepSpec::new("only_orders", StepId::Filter)
                .with_input("field", json!("${{ trigger.table }}"))
                .with_input("condition", json!("EQUAL"))
                .with_input("value", json!("orders")),
            collect("never", json!("unreachable")),
        ],
    );

    let run = fixture
        .runner
        .execute(&definition, json!({"table": "customers"}), &tenant_id)
        .await
        .expect("run completes");

    assert_eq!(run.status, RunStatus::Stopped);
    assert_eq!(run.steps.len(), 1);
    assert_eq!(run.steps[0].status, StepRunStatus::Stopped);
    assert!(run.step("never").is_none());
}

#[tokio::test]
async fn unregistered_step_kind_is_an_engine_fault() {
    let events = Arc::new(RecordingEventPublisher::new());
    let runner = AutomationRunner::new(
        StepServices::in_memory(),
        Arc::new(InMemoryQuotaGate::unlimited()),
        events.clone(),
        EngineConfig::default(),
    )
    .with_registry(StepRegistry::default());
    let definition = automation("tenant_a", vec![collect("first", json!("x"))]);

    let fault = runner
        .execute(&definition, json!({}), &TenantId::new("tenant_a"))
        .await
        .expect_err("empty registry faults");

    assert_eq!(fault.fault, EngineFault::UnregisteredStep { step_id: StepId::Collect });
    assert_eq!(fault.run.status, RunStatus::Failed);
    assert!(fault.run.steps.is_empty());
    assert!(events.events().await.is_empty());
}

#[tokio::test]
async fn running_another_tenants_automation_is_refused() {
    let fixture = Fixture::new();
    let definition = automation("tenant_a", vec![collect("first", json!("x"))]);

    let fault = fixture
        .runner
        .execute(&definition, json!({}), &TenantId::new("tenant_b"))
        .await
        .expect_err("tenant mismatch");
    assert!(matches!(fault.fault, EngineFault::TenantMismatch { .. }));
}

#[tokio::test]
async fn lifecycle_events_are_ordered_and_usage_is_recorded() {
    let fixture = Fixture::new();
    let tenant_id = TenantId::new("tenant_a");
    let definition = automation("tenant_a", vec![collect("first", json!(1)), collect("second", json!(2))]);

    let run = fixture
        .runner
        .execute(&definition, json!({}), &tenant_id)
        .await
        .expect("run completes");

    assert_eq!(
        fixture.events.kinds_for_run(&run.run_id).await,
        vec![
            EventKind::RunCreated,
            EventKind::StepCompleted,
            EventKind::StepCompleted,
            EventKind::RunFinished
        ]
    );
    let events = fixture.events.events().await;
    assert_eq!(events[1].properties["step"], json!("first"));
    assert_eq!(events[3].properties["status"], json!("SUCCESS"));
    assert_eq!(fixture.quota.usage(&tenant_id, QuotaResource::AutomationRuns).await, 1);
}

#[tokio::test]
async fn concurrent_tenants_with_colliding_step_names_stay_isolated() {
    let fixture = Fixture::new();
    let steps = || {
        vec![
            collect("read", json!("${{ trigger.secret }}")),
            StepSpec::new("pause", StepId::Delay).with_input("time", json!(20)),
            StepSpec::new("store", StepId::CreateRow)
                .with_input("table_id", json!("notes"))
                .with_input("row", json!({"secret": "${{ steps.read.value }}"})),
            StepSpec::new("list", StepId::QueryRows).with_input("table_id", json!("notes")),
        ]
    };
    let definition_a = automation("tenant_a", steps());
    let definition_b = automation("tenant_b", steps());
    let tenant_a = TenantId::new("tenant_a");
    let tenant_b = TenantId::new("tenant_b");

    let (run_a, run_b) = tokio::join!(
        fixture.runner.execute(&definition_a, json!({"secret": "alpha"}), &tenant_a),
        fixture.runner.execute(&definition_b, json!({"secret": "beta"}), &tenant_b),
    );
    let (run_a, run_b): (RunResult, RunResult) = (run_a.expect("run a"), run_b.expect("run b"));

    assert_eq!(run_a.outputs_of("read")["value"], json!("alpha"));
    assert_eq!(run_b.outputs_of("read")["value"], json!("beta"));
    let rows_a = run_a.outputs_of("list")["rows"].as_array().cloned().unwrap_or_default();
    let rows_b = run_b.outputs_of("list")["rows"].as_array().cloned().unwrap_or_default();
    assert_eq!(rows_a.len(), 1);
    assert_eq!(rows_b.len(), 1);
    assert_eq!(rows_a[0]["secret"], json!("alpha"));
    assert_eq!(rows_b[0]["secret"], json!("beta"));
}

#[tokio::test]
async fn script_bindings_and_environment_feed_later_steps() {
    let events = Arc::new(RecordingEventPublisher::new());
    let mut environment = IndexMap::new();
    environment.insert("REGION".to_string(), "eu-west".to_string());
    let runner = AutomationRunner::new(
        StepServices::in_memory(),
        Arc::new(InMemoryQuotaGate::unlimited()),
        events,
        EngineConfig::default(),
    )
    .with_tenant_environment(TenantId::new("tenant_a"), environment);
    let definition = automation(
        "tenant_a",
        vec![
            collect("prices", json!([3, 4])),
            collect(
                "total",
                json!(encode_script_binding(
                    "let sum = 0; for price in context.steps.prices.value { sum += price; } sum"
                )),
            ),
            collect("summary", json!("${{ env.REGION }}: ${{ steps.2.value }}")),
        ],
    );

    let run = runner
        .execute(&definition, json!({}), &TenantId::new("tenant_a"))
        .await
        .expect("run completes");

    assert_eq!(run.outputs_of("total")["value"], json!(7));
    assert_eq!(run.outputs_of("summary")["value"], json!("eu-west: 7"));
}

#[tokio::test]
async fn script_failure_condition_sees_loop_state() {
    let fixture = Fixture::new();
    let tenant_id = TenantId::new("tenant_a");
    let definition = automation(
        "tenant_a",
        vec![
            collect("each", json!("${{ loop.currentItem }}")).with_loop(LoopSpec {
                input: json!(["ok", "ok", "stop", "ok"]),
                failure_condition: Some(encode_script_binding(r#"context["loop"].output.value == "stop""#)),
                ..LoopSpec::default()
            }),
            collect("after", json!("${{ steps.each.iterations }}")),
        ],
    );

    let run = fixture
        .runner
        .execute(&definition, json!({}), &tenant_id)
        .await
        .expect("run completes");

    assert_eq!(run.status, RunStatus::Success);
    let each = run.step("each").expect("loop step recorded");
    assert_eq!(each.status, StepRunStatus::Failed);
    assert_eq!(each.outputs["iterations"], json!(3));
    assert_eq!(each.outputs["items"].as_array().map(Vec::len), Some(3));
    assert_eq!(run.outputs_of("after")["value"], json!(3));
}

#[tokio::test]
async fn broken_failure_condition_keeps_gathered_items() {
    let fixture = Fixture::new();
    let tenant_id = TenantId::new("tenant_a");
    let definition = automation(
        "tenant_a",
        vec![collect("each", json!("${{ loop.currentItem }}")).with_loop(LoopSpec {
            input: json!("a,b,c"),
            failure_condition: Some(encode_script_binding("throw \"broken\"")),
            ..LoopSpec::default()
        })],
    );

    let run = fixture
        .runner
        .execute(&definition, json!({}), &tenant_id)
        .await
        .expect("run completes");

    let each = run.step("each").expect("loop step recorded");
    assert_eq!(each.status, StepRunStatus::Failed);
    assert_eq!(each.outputs["items"][0]["value"], json!("a"));
    assert_eq!(each.outputs["iterations"], json!(1));
    assert!(
        each.error
            .as_deref()
            .is_some_and(|message| message.contains("could not be evaluated"))
    );
}

#[tokio::test]
async fn oversized_script_allocation_fails_only_its_step() {
    let fixture = Fixture::new();
    let tenant_id = TenantId::new("tenant_a");
    let definition = automation(
        "tenant_a",
        vec![
            StepSpec::new("hog", StepId::ExecuteScript)
                .with_input("code", json!("let s = \"\"; s.pad(3000000000, 'x'); s.len()")),
            collect("after", json!("still running")),
        ],
    );

    let run = fixture
        .runner
        .execute(&definition, json!({}), &tenant_id)
        .await
        .expect("run completes");

    assert_eq!(run.status, RunStatus::Success);
    let hog = run.step("hog").expect("script step recorded");
    assert_eq!(hog.status, StepRunStatus::Failed);
    assert!(hog.error.as_deref().is_some_and(|message| message.contains("sandbox limit")));
    assert_eq!(run.outputs_of("after")["value"], json!("still running"));
}

#[tokio::test]
async fn step_timeout_interrupts_long_running_scripts() {
    let config = EngineConfig {
        step_timeout_ms: Some(50),
        script_timeout_ms: 1_000,
        ..EngineConfig::default()
    };
    let runner = AutomationRunner::new(
        StepServices::in_memory(),
        Arc::new(InMemoryQuotaGate::unlimited()),
        Arc::new(RecordingEventPublisher::new()),
        config,
    );
    let definition = automation(
        "tenant_a",
        vec![StepSpec::new("spin", StepId::ExecuteScript).with_input("code", json!("loop { }"))],
    );

    let started_at = std::time::Instant::now();
    let run = runner
        .execute(&definition, json!({}), &TenantId::new("tenant_a"))
        .await
        .expect("run completes");

    let spin = run.step("spin").expect("script step recorded");
    assert_eq!(spin.status, StepRunStatus::Failed);
    assert_eq!(spin.error.as_deref(), Some("step timed out after 50ms"));
    assert!(started_at.elapsed() < std::time::Duration::from_millis(900));
}

#[tokio::test]
async fn run_results_round_trip_through_json() {
    let fixture = Fixture::new();
    let definition = automation(
        "tenant_a",
        vec![
            collect("first", json!("x")),
            StepSpec::new("log", StepId::ServerLog),
            collect("third", json!("z")),
        ],
    );
    let run = fixture
        .runner
        .execute(&definition, json!({"id": 1}), &TenantId::new("tenant_a"))
        .await
        .expect("run completes");

    let encoded = serde_json::to_string(&run).expect("serialize");
    let decoded: RunResult = serde_json::from_str(&encoded).expect("deserialize");
    assert_eq!(decoded, run);
    let statuses: Vec<StepRunStatus> = decoded.steps.iter().map(|step| step.status).collect();
    assert_eq!(
        statuses,
        vec![StepRunStatus::Success, StepRunStatus::Failed, StepRunStatus::Success]
    );
}
