//! End-to-end subscription lifecycle
//!
//! Signup charges the first invoice, sends a welcome email through a child
//! flow and then waits for billing to renew or cancel.

use anyhow::Result;
use conduit_core::{Actor, ErrorKind, FlowSnapshot, FlowStatus, StepStatus};
use conduit_tests::flows::subscriptions::{
    CANCEL_REQUESTED, RENEWAL_DUE, RENEWAL_WINDOW, SIGNUP_FLOW, WELCOME_FLOW,
};
use conduit_tests::flows::Providers;
use conduit_tests::TestEngine;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

fn setup() -> Result<(TestEngine, Providers)> {
    let test = TestEngine::new();
    let providers = Providers::new();
    providers.register_all(&test.engine)?;
    Ok((test, providers))
}

async fn sign_up(test: &TestEngine, customer: &str) -> Result<FlowSnapshot> {
    let snapshot = test
        .run(
            SIGNUP_FLOW,
            json!({
                "customer_id": customer,
                "plan": "pro_monthly",
                "price": 29.0,
                "card": "tok_mastercard",
                "email": format!("{}@example.com", customer)
            }),
        )
        .await?;
    assert_eq!(snapshot.status, FlowStatus::Paused);
    Ok(snapshot)
}

#[tokio::test]
async fn test_signup_pauses_and_welcomes_the_customer() -> Result<()> {
    let (test, providers) = setup()?;

    let paused = sign_up(&test, "cus_1").await?;

    let pause = paused.pause.clone().unwrap();
    assert_eq!(pause.step, "await_renewal");
    assert_eq!(pause.awaiting, vec![RENEWAL_DUE, CANCEL_REQUESTED]);
    assert_eq!(pause.manual_roles, vec!["support"]);
    assert_eq!(
        paused.data.lookup("subscription.state"),
        Some(&json!("active"))
    );
    assert_eq!(providers.acquirer.captures().len(), 1);
    assert_eq!(providers.acquirer.captures()[0].payment_id, "cus_1-first");

    // The welcome email runs as its own instance
    assert_eq!(paused.children.len(), 1);
    let child = test.settle(&paused.children[0]).await?;
    assert_eq!(child.status, FlowStatus::Completed);
    assert_eq!(child.flow_id.0, WELCOME_FLOW);
    assert_eq!(child.parent.as_ref(), Some(&paused.id));
    assert_eq!(
        child.data.to_value(),
        json!({"customer_id": "cus_1", "email": "cus_1@example.com", "plan": "pro_monthly"})
    );
    assert_eq!(providers.mailer.sent_template("welcome"), 1);
    Ok(())
}

#[tokio::test]
async fn test_renewal_charges_and_archives() -> Result<()> {
    let (test, providers) = setup()?;
    let paused = sign_up(&test, "cus_2").await?;

    // Billing events for other customers do not touch this instance
    let resumed = test
        .engine
        .deliver_event(RENEWAL_DUE, json!({"customer_id": "cus_other"}))
        .await?;
    assert!(resumed.is_empty());

    let resumed = test
        .engine
        .deliver_event(RENEWAL_DUE, json!({"customer_id": "cus_2"}))
        .await?;
    assert_eq!(resumed, vec![paused.id.clone()]);
    let done = test.settle(&paused.id).await?;

    assert_eq!(done.status, FlowStatus::Completed);
    assert_eq!(
        done.step_status("renewal_decision/renew/charge_renewal"),
        Some(StepStatus::Succeeded)
    );
    assert!(done.step("renewal_decision/cancel/close_account").is_none());
    assert_eq!(done.step_status("renewal_receipt"), Some(StepStatus::Succeeded));
    assert!(done.data.is_truthy("archived"));
    assert!(done.data.contains("renewal_invoice"));

    let payments: Vec<String> = providers
        .acquirer
        .captures()
        .into_iter()
        .map(|capture| capture.payment_id)
        .collect();
    assert_eq!(payments, vec!["cus_2-first", "cus_2-renewal"]);
    assert_eq!(providers.mailer.sent_template("renewal_receipt"), 1);
    Ok(())
}

#[tokio::test]
async fn test_cancellation_jumps_to_archive() -> Result<()> {
    let (test, providers) = setup()?;
    let paused = sign_up(&test, "cus_3").await?;

    test.engine
        .deliver_event(
            CANCEL_REQUESTED,
            json!({"customer_id": "cus_3", "reason": "too expensive"}),
        )
        .await?;
    let done = test.settle(&paused.id).await?;

    assert_eq!(done.status, FlowStatus::Completed);
    assert_eq!(
        done.step_status("renewal_decision/cancel/close_account"),
        Some(StepStatus::Succeeded)
    );
    assert_eq!(done.step_status("renewal_receipt"), Some(StepStatus::Skipped));
    assert_eq!(done.step_status("archive"), Some(StepStatus::Succeeded));
    assert_eq!(
        done.data.lookup("cancellation.reason"),
        Some(&json!("too expensive"))
    );
    assert_eq!(providers.acquirer.captures().len(), 1);
    assert_eq!(providers.mailer.sent_template("cancellation_confirmation"), 1);
    assert_eq!(providers.mailer.sent_template("renewal_receipt"), 0);
    Ok(())
}

#[tokio::test]
async fn test_closed_window_fails_the_lifecycle() -> Result<()> {
    let (test, providers) = setup()?;
    let paused = sign_up(&test, "cus_4").await?;

    test.timer.advance(RENEWAL_WINDOW + Duration::from_secs(60));
    let expired = test.engine.evaluate_timeouts().await?;
    assert_eq!(expired, vec![paused.id.clone()]);

    let failed = test.engine.query(&paused.id).await?;
    assert_eq!(failed.status, FlowStatus::Failed);
    let failure = failed.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert_eq!(failure.step.as_deref(), Some("await_renewal"));
    assert!(failed.pause.is_none());
    assert_eq!(providers.acquirer.captures().len(), 1);

    // Late billing events find nothing to resume
    let resumed = test
        .engine
        .deliver_event(RENEWAL_DUE, json!({"customer_id": "cus_4"}))
        .await?;
    assert!(resumed.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_support_override_renews() -> Result<()> {
    let (test, providers) = setup()?;
    let paused = sign_up(&test, "cus_5").await?;

    let outsider = Actor::new("eve", &["marketing"]);
    let denied = test.engine.resume_manually(&paused.id, &outsider).await;
    assert_eq!(denied.unwrap_err().kind(), ErrorKind::NotAuthorized);

    let agent = Actor::new("ola", &["support"]);
    test.engine.resume_manually(&paused.id, &agent).await?;
    let done = test.settle(&paused.id).await?;

    assert_eq!(done.status, FlowStatus::Completed);
    assert!(done.data.is_truthy("support_override"));
    assert_eq!(
        done.step_status("renewal_decision/renew/charge_renewal"),
        Some(StepStatus::Succeeded)
    );
    assert_eq!(providers.acquirer.captures().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_repeat_signup_reuses_the_subscription() -> Result<()> {
    let (test, _providers) = setup()?;

    let first = sign_up(&test, "cus_6").await?;
    let second = sign_up(&test, "cus_6").await?;

    let created = first.step("create_subscription").unwrap();
    let replayed = second.step("create_subscription").unwrap();
    assert_eq!(
        created.idempotency_key.as_deref(),
        Some("subscription_signup:create_subscription:cus_6")
    );
    assert_eq!(replayed.idempotency_key, created.idempotency_key);
    assert_eq!(replayed.message, created.message);
    assert_eq!(
        second.data.lookup("subscription.plan"),
        Some(&json!("pro_monthly"))
    );
    Ok(())
}

#[tokio::test]
async fn test_aborting_a_waiting_subscription() -> Result<()> {
    let (test, _providers) = setup()?;
    let paused = sign_up(&test, "cus_7").await?;

    test.engine.abort(&paused.id, "account closed by compliance").await?;

    let aborted = test.engine.query(&paused.id).await?;
    assert_eq!(aborted.status, FlowStatus::Failed);
    assert_eq!(aborted.failure.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert!(test.engine.abort(&paused.id, "again").await.is_err());
    Ok(())
}
