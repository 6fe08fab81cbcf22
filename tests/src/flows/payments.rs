//! Card payment capture with risk scoring and a 3-D Secure challenge

use crate::providers::{FakeAcquirer, FakeMailer};
use conduit_core::{
    Condition, Correlation, CoreError, DataRequirement, DataType, ErrorKind, FlowDefinition,
    IdempotencyScope, PauseSpec, ResumeCondition, SignalSet, SignalSpec, StepDefinition,
    StepFlags, StepResult,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const FLOW: &str = "card_payment";

/// Amounts above this are challenged
pub const CHALLENGE_THRESHOLD: f64 = 1_000.0;

/// How long the cardholder has to complete the challenge
pub const CHALLENGE_WINDOW: Duration = Duration::from_secs(15 * 60);

pub const CHALLENGE_COMPLETED: &str = "acs.challenge_completed";
pub const AUTHENTICATION_CONFIRMED: &str = "acs.authentication_confirmed";

pub fn card_payment(acquirer: Arc<FakeAcquirer>, mailer: Arc<FakeMailer>) -> Result<FlowDefinition, CoreError> {
    let validate = StepDefinition {
        flags: StepFlags::critical(),
        requires: vec![DataRequirement::new("amount", DataType::Number)],
        ..StepDefinition::from_fn("validate", |ctx| async move {
            let amount: f64 = ctx.get("amount")?;
            if amount <= 0.0 {
                return Ok(StepResult::failure(
                    ErrorKind::Validation,
                    format!("amount must be positive, got {}", amount),
                ));
            }
            Ok::<_, CoreError>(StepResult::success("payment validated"))
        })
    };

    let risk_score = StepDefinition {
        after: vec!["validate".to_string()],
        flags: StepFlags {
            allow_failure: true,
            ..StepFlags::parallel()
        },
        produces: vec!["risk".to_string()],
        ..StepDefinition::from_fn("risk_score", |ctx| async move {
            let amount: f64 = ctx.get("amount")?;
            let risk = if amount > CHALLENGE_THRESHOLD { "high" } else { "low" };
            ctx.set("risk", risk)?;
            Ok::<_, CoreError>(StepResult::success(format!("risk {}", risk)))
        })
    };

    let sanctions_check = StepDefinition {
        after: vec!["validate".to_string()],
        flags: StepFlags {
            critical: true,
            ..StepFlags::parallel()
        },
        requires: vec![DataRequirement::new("card", DataType::String)],
        ..StepDefinition::from_fn("sanctions_check", |ctx| async move {
            let card: String = ctx.get("card")?;
            if card.starts_with("blk_") {
                return Ok(StepResult::not_authorized("cardholder is on a sanctions list"));
            }
            Ok::<_, CoreError>(StepResult::success("cardholder cleared"))
        })
    };

    let three_ds = StepDefinition {
        after: vec!["risk_score".to_string(), "sanctions_check".to_string()],
        flags: StepFlags::critical(),
        produces: vec!["three_ds_outcome".to_string()],
        pause: Some(PauseSpec {
            reason: "awaiting 3-D Secure challenge".to_string(),
            when: Condition::all(vec![
                Condition::equals("risk", "high"),
                Condition::missing("three_ds_outcome"),
            ]),
            resume: vec![
                ResumeCondition::Signals(SignalSet {
                    signals: vec![
                        SignalSpec {
                            store_as: Some("challenge".to_string()),
                            ..SignalSpec::new(CHALLENGE_COMPLETED, "challenge_passed")
                        },
                        SignalSpec::new(AUTHENTICATION_CONFIRMED, "authentication_confirmed"),
                    ],
                    correlation: Some(Correlation {
                        payload_field: "payment_id".to_string(),
                        data_key: "payment_id".to_string(),
                    }),
                }),
                ResumeCondition::after(CHALLENGE_WINDOW, "challenge_expired"),
                ResumeCondition::manual(vec!["risk_officer".to_string()], "officer_approved"),
            ],
        }),
        ..StepDefinition::from_fn("three_ds", |ctx| async move {
            if !ctx.get_value("risk").map_or(false, |risk| risk == "high") {
                return Ok(StepResult::success("frictionless"));
            }

            let outcome = if ctx.is_set("challenge_passed") && ctx.is_set("authentication_confirmed") {
                "authenticated"
            } else if ctx.is_set("officer_approved") {
                "approved"
            } else if ctx.is_set("challenge_expired") {
                "expired"
            } else {
                let payment: String = ctx.get("payment_id")?;
                return Ok(StepResult::success_with(
                    "challenge issued",
                    json!({"acs_url": format!("https://acs.example.com/{}", payment)}),
                ));
            };

            ctx.set("three_ds_outcome", outcome)?;
            if outcome == "expired" {
                return Ok(StepResult::failure(
                    ErrorKind::Timeout,
                    "cardholder did not complete the challenge",
                ));
            }
            Ok::<_, CoreError>(StepResult::success(format!("challenge {}", outcome)))
        })
    };

    let capture = StepDefinition {
        after: vec!["three_ds".to_string()],
        flags: StepFlags::critical(),
        idempotency: Some(IdempotencyScope::BusinessKey("payment_id".to_string())),
        output_key: Some("capture".to_string()),
        ..StepDefinition::from_fn("capture", move |ctx| {
            let acquirer = acquirer.clone();
            async move {
                let payment: String = ctx.get("payment_id")?;
                let card: String = ctx.get("card")?;
                let amount: f64 = ctx.get("amount")?;
                let capture = acquirer.capture(&payment, &card, amount).await?;
                Ok::<_, CoreError>(StepResult::success_with(
                    format!("captured {:.2}", capture.amount),
                    json!({"capture_id": capture.capture_id}),
                ))
            }
        })
    };

    let receipt = StepDefinition {
        after: vec!["capture".to_string()],
        flags: StepFlags {
            allow_failure: true,
            ..StepFlags::parallel()
        },
        ..StepDefinition::from_fn("receipt", move |ctx| {
            let mailer = mailer.clone();
            async move {
                let email: String = ctx.get("email")?;
                mailer.send(&email, "payment_receipt").await?;
                Ok::<_, CoreError>(StepResult::success("receipt sent"))
            }
        })
    };

    let ledger = StepDefinition {
        after: vec!["capture".to_string()],
        flags: StepFlags::parallel(),
        produces: vec!["ledger_entry".to_string()],
        ..StepDefinition::from_fn("ledger", |ctx| async move {
            let payment: String = ctx.get("payment_id")?;
            let amount: f64 = ctx.get("amount")?;
            ctx.set(
                "ledger_entry",
                &json!({"account": "merchant_settlement", "reference": payment, "credit": amount}),
            )?;
            Ok::<_, CoreError>(StepResult::success("ledger updated"))
        })
    };

    FlowDefinition::build(
        FLOW,
        vec![
            DataRequirement::new("payment_id", DataType::String),
            DataRequirement::new("card", DataType::String),
            DataRequirement::new("amount", DataType::Number),
            DataRequirement::new("email", DataType::String),
        ],
        vec![validate, risk_score, sanctions_check, three_ds, capture, receipt, ledger],
    )
}
