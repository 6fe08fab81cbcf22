//! Subscription lifecycle: signup, first invoice, renewal window
//!
//! After the first invoice the instance pauses until billing reports a
//! renewal or a cancellation for the customer, support overrides it, or
//! the window closes.

use crate::providers::{FakeAcquirer, FakeMailer};
use conduit_core::{
    Condition, Correlation, CoreError, DataRequirement, DataType, FlowDefinition,
    IdempotencyScope, PauseSpec, ResumeCondition, SignalSet, SignalSpec, StaticBranch,
    StepDefinition, StepFlags, StepResult, TriggerSpec,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const SIGNUP_FLOW: &str = "subscription_signup";
pub const WELCOME_FLOW: &str = "welcome_email";

pub const RENEWAL_DUE: &str = "billing.renewal_due";
pub const CANCEL_REQUESTED: &str = "billing.cancel_requested";

/// How long the instance waits for a renewal decision
pub const RENEWAL_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn for_customer(event: &str, flag: &str, store_as: Option<&str>) -> ResumeCondition {
    ResumeCondition::Signals(SignalSet {
        signals: vec![SignalSpec {
            store_as: store_as.map(str::to_string),
            ..SignalSpec::new(event, flag)
        }],
        correlation: Some(Correlation {
            payload_field: "customer_id".to_string(),
            data_key: "customer_id".to_string(),
        }),
    })
}

fn charge(
    name: &str,
    reference: &'static str,
    acquirer: Arc<FakeAcquirer>,
) -> StepDefinition {
    StepDefinition::from_fn(name, move |ctx| {
        let acquirer = acquirer.clone();
        async move {
            let customer: String = ctx.get("customer_id")?;
            let card: String = ctx.get("card")?;
            let price: f64 = ctx.get("price")?;
            let capture = acquirer
                .capture(&format!("{}-{}", customer, reference), &card, price)
                .await?;
            Ok::<_, CoreError>(StepResult::success_with(
                format!("{} invoice paid", reference),
                json!({"capture_id": capture.capture_id}),
            ))
        }
    })
}

fn send(name: &str, template: &'static str, mailer: Arc<FakeMailer>) -> StepDefinition {
    StepDefinition::from_fn(name, move |ctx| {
        let mailer = mailer.clone();
        async move {
            let email: String = ctx.get("email")?;
            mailer.send(&email, template).await?;
            Ok::<_, CoreError>(StepResult::success(format!("{} sent", template)))
        }
    })
}

pub fn subscription_signup(
    acquirer: Arc<FakeAcquirer>,
    mailer: Arc<FakeMailer>,
) -> Result<FlowDefinition, CoreError> {
    let create = StepDefinition {
        flags: StepFlags::critical(),
        idempotency: Some(IdempotencyScope::BusinessKey("customer_id".to_string())),
        output_key: Some("subscription".to_string()),
        ..StepDefinition::from_fn("create_subscription", |ctx| async move {
            let customer: String = ctx.get("customer_id")?;
            let plan: String = ctx.get("plan")?;
            Ok::<_, CoreError>(StepResult::success_with(
                format!("subscription created for {}", customer),
                json!({"plan": plan, "state": "active"}),
            ))
        })
    };

    let first_invoice = StepDefinition {
        after: vec!["create_subscription".to_string()],
        flags: StepFlags::critical(),
        output_key: Some("first_invoice".to_string()),
        triggers: vec![TriggerSpec::with_keys(
            WELCOME_FLOW,
            &["customer_id", "email", "plan"],
        )],
        ..charge("charge_first_invoice", "first", acquirer.clone())
    };

    let await_renewal = StepDefinition {
        after: vec!["charge_first_invoice".to_string()],
        pause: Some(PauseSpec {
            reason: "renewal window open".to_string(),
            when: Condition::not(Condition::any(vec![
                Condition::truthy("renewed"),
                Condition::truthy("cancelled"),
                Condition::truthy("support_override"),
            ])),
            resume: vec![
                for_customer(RENEWAL_DUE, "renewed", None),
                for_customer(CANCEL_REQUESTED, "cancelled", Some("cancellation")),
                ResumeCondition::fail_after(RENEWAL_WINDOW),
                ResumeCondition::manual(vec!["support".to_string()], "support_override"),
            ],
        }),
        ..StepDefinition::from_fn("await_renewal", |ctx| async move {
            if ctx.is_set("cancelled") {
                return Ok(StepResult::success("customer cancelled"));
            }
            if ctx.is_set("renewed") || ctx.is_set("support_override") {
                return Ok(StepResult::success("renewal confirmed"));
            }
            Ok(StepResult::success("waiting for billing"))
        })
    };

    let renewal_decision = StepDefinition {
        after: vec!["await_renewal".to_string()],
        static_branches: vec![
            StaticBranch {
                jump_to: Some("archive".to_string()),
                ..StaticBranch::new(
                    "cancel",
                    Condition::truthy("cancelled"),
                    vec![send("close_account", "cancellation_confirmation", mailer.clone())],
                )
            },
            StaticBranch::new(
                "renew",
                Condition::any(vec![
                    Condition::truthy("renewed"),
                    Condition::truthy("support_override"),
                ]),
                vec![StepDefinition {
                    output_key: Some("renewal_invoice".to_string()),
                    ..charge("charge_renewal", "renewal", acquirer)
                }],
            ),
        ],
        ..StepDefinition::from_fn("renewal_decision", |_ctx| async {
            Ok(StepResult::success("renewal decided"))
        })
    };

    let renewal_receipt = StepDefinition {
        after: vec!["renewal_decision".to_string()],
        flags: StepFlags::allow_failure(),
        ..send("renewal_receipt", "renewal_receipt", mailer)
    };

    let archive = StepDefinition {
        after: vec!["renewal_receipt".to_string()],
        produces: vec!["archived".to_string()],
        ..StepDefinition::from_fn("archive", |ctx| async move {
            ctx.set("archived", &true)?;
            Ok::<_, CoreError>(StepResult::success("lifecycle archived"))
        })
    };

    FlowDefinition::build(
        SIGNUP_FLOW,
        vec![
            DataRequirement::new("customer_id", DataType::String),
            DataRequirement::new("plan", DataType::String),
            DataRequirement::new("price", DataType::Number),
            DataRequirement::new("card", DataType::String),
            DataRequirement::new("email", DataType::String),
        ],
        vec![
            create,
            first_invoice,
            await_renewal,
            renewal_decision,
            renewal_receipt,
            archive,
        ],
    )
}

pub fn welcome_email(mailer: Arc<FakeMailer>) -> Result<FlowDefinition, CoreError> {
    FlowDefinition::build(
        WELCOME_FLOW,
        vec![
            DataRequirement::new("customer_id", DataType::String),
            DataRequirement::new("email", DataType::String),
            DataRequirement::new("plan", DataType::String),
        ],
        vec![send("send_welcome", "welcome", mailer)],
    )
}
