use anyhow::{Context, Result};
use conduit_core::{
    Condition, Correlation, CoreError, DataBag, DataRequirement, DataType, EngineConfig,
    ErrorKind, FlowDefinition, FlowEngine, FlowStatus, IdempotencyScope, PauseSpec,
    ResumeCondition, SignalSet, SignalSpec, StepDefinition, StepFlags, StepResult,
};
use conduit_monitoring::{init_logging, LogExt, LoggingConfig};
use conduit_state_inmemory::{InMemoryStateStoreProvider, IntervalTimer};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Card payment with a 3-D Secure challenge between validation and capture
fn card_payment_flow() -> Result<FlowDefinition, CoreError> {
    let validate = StepDefinition {
        flags: StepFlags::critical(),
        requires: vec![DataRequirement::new("amount", DataType::Number)],
        ..StepDefinition::from_fn("validate", |ctx| async move {
            let amount: f64 = ctx.get("amount")?;
            if amount <= 0.0 {
                return Ok(StepResult::failure(
                    ErrorKind::Validation,
                    format!("invalid amount {}", amount),
                ));
            }
            Ok::<_, CoreError>(StepResult::success("payment validated"))
        })
    };

    let challenge = StepDefinition {
        after: vec!["validate".to_string()],
        pause: Some(PauseSpec {
            reason: "awaiting 3-D Secure challenge".to_string(),
            when: Condition::not(Condition::truthy("challenge_passed")),
            resume: vec![
                ResumeCondition::Signals(SignalSet {
                    signals: vec![SignalSpec::new("acs.challenge_completed", "challenge_passed")],
                    correlation: Some(Correlation {
                        payload_field: "payment_id".to_string(),
                        data_key: "payment_id".to_string(),
                    }),
                }),
                ResumeCondition::fail_after(Duration::from_secs(15 * 60)),
            ],
        }),
        ..StepDefinition::from_fn("three_ds", |ctx| async move {
            if ctx.is_set("challenge_passed") {
                return Ok(StepResult::success("challenge passed"));
            }
            Ok(StepResult::success_with(
                "challenge issued",
                json!({"acs_url": "https://acs.example.com/challenge"}),
            ))
        })
    };

    let capture = StepDefinition {
        after: vec!["three_ds".to_string()],
        flags: StepFlags::critical(),
        idempotency: Some(IdempotencyScope::BusinessKey("payment_id".to_string())),
        output_key: Some("capture".to_string()),
        ..StepDefinition::from_fn("capture", |ctx| async move {
            let payment: String = ctx.get("payment_id")?;
            Ok::<_, CoreError>(StepResult::success_with(
                "captured",
                json!({"capture_id": format!("cap_{}", payment)}),
            ))
        })
    };

    let receipt = StepDefinition {
        after: vec!["capture".to_string()],
        flags: StepFlags::allow_failure(),
        ..StepDefinition::from_fn("receipt", |_ctx| async {
            Ok(StepResult::success("receipt sent"))
        })
    };

    FlowDefinition::build(
        "card_payment",
        vec![
            DataRequirement::new("payment_id", DataType::String),
            DataRequirement::new("amount", DataType::Number),
        ],
        vec![validate, challenge, capture, receipt],
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(&LoggingConfig::from_env()).context("Failed to initialize logging")?;

    let config = EngineConfig::load().context("Failed to load configuration")?;
    let provider = InMemoryStateStoreProvider::with_event_buffer(config.event_buffer);
    let timer = Arc::new(IntervalTimer::new(config.coordinator_tick()));
    let engine = FlowEngine::new(config, provider.dependencies(timer));

    engine
        .register(card_payment_flow().context("Invalid card payment flow")?)
        .context("Failed to register card payment flow")?;
    let coordinator = engine.spawn_coordinator();

    let id = engine
        .start(
            "card_payment",
            DataBag::from_value(json!({"payment_id": "pay_demo", "amount": 42.5})),
        )
        .await
        .log_err("Card payment rejected")
        .context("Failed to start card payment")?;

    let paused = engine
        .wait_until_settled(&id, Duration::from_secs(5))
        .await
        .context("Card payment did not pause")?;
    info!(flow_instance_id = %id, status = ?paused.status, "Card payment settled");

    engine
        .publish_event("acs.challenge_completed", json!({"payment_id": "pay_demo"}))
        .await
        .log_err("Challenge result not published")
        .context("Failed to publish challenge result")?;

    let mut snapshot = engine.query(&id).await?;
    for _ in 0..100 {
        if matches!(snapshot.status, FlowStatus::Completed | FlowStatus::Failed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        snapshot = engine.query(&id).await?;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("Failed to render snapshot")?
    );

    coordinator.shutdown().await;
    Ok(())
}
