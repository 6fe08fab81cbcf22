//! End-to-end order placement across exchange accounts

use anyhow::Result;
use conduit_core::domain::branching::BranchReport;
use conduit_core::{ErrorKind, FlowStatus, StepStatus};
use conduit_tests::flows::{exchange, Providers};
use conduit_tests::TestEngine;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn setup() -> Result<(TestEngine, Providers)> {
    let test = TestEngine::new();
    let providers = Providers::new();
    providers.register_all(&test.engine)?;
    Ok((test, providers))
}

fn order(id: &str, quantity: f64) -> Value {
    json!({"id": id, "symbol": "BTC-USD", "quantity": quantity})
}

#[tokio::test]
async fn test_orders_rotate_over_venues() -> Result<()> {
    let (test, providers) = setup()?;
    let orders: Vec<Value> = (1..=6).map(|i| order(&format!("o{}", i), 0.5)).collect();

    let snapshot = test
        .run(exchange::FLOW, json!({"portfolio_id": "pf_1", "orders": orders}))
        .await?;

    assert_eq!(snapshot.status, FlowStatus::Completed);
    assert_eq!(providers.exchange.placed_on("binance"), vec!["o1", "o3", "o5"]);
    assert_eq!(providers.exchange.placed_on("kraken"), vec!["o2", "o4", "o6"]);

    // Each venue saw one order at a time
    assert_eq!(providers.exchange.peak_in_flight("binance"), 1);
    assert_eq!(providers.exchange.peak_in_flight("kraken"), 1);

    let fills: Vec<BranchReport> = snapshot.data.get("fills")?;
    let venues: Vec<&str> = fills.iter().map(|fill| fill.group.as_str()).collect();
    assert_eq!(
        venues,
        vec!["binance", "kraken", "binance", "kraken", "binance", "kraken"]
    );
    assert_eq!(
        fills[1].payload,
        Some(json!({"venue_order_id": "kraken-o2"}))
    );
    assert_eq!(snapshot.data.get::<Vec<String>>("filled")?.len(), 6);
    assert_eq!(snapshot.step_status("place_orders[o6]"), Some(StepStatus::Succeeded));
    assert_eq!(snapshot.step("settle").unwrap().message, "6 filled, 0 rejected");
    Ok(())
}

#[tokio::test]
async fn test_pinned_orders_follow_priority() -> Result<()> {
    let (test, providers) = setup()?;
    let orders = json!([
        {"id": "o1", "quantity": 1.0, "exchange": "kraken", "priority": 5},
        {"id": "o2", "quantity": 1.0},
        {"id": "o3", "quantity": 1.0, "exchange": "kraken", "priority": 1},
        {"id": "o4", "quantity": 1.0}
    ]);

    let snapshot = test
        .run(exchange::FLOW, json!({"portfolio_id": "pf_2", "orders": orders}))
        .await?;

    assert_eq!(snapshot.status, FlowStatus::Completed);
    // Untagged orders rotate among themselves; pinned ones keep their venue
    assert_eq!(providers.exchange.placed_on("binance"), vec!["o2"]);
    assert_eq!(providers.exchange.placed_on("kraken"), vec!["o4", "o3", "o1"]);

    // Reports stay in submission order
    let fills: Vec<BranchReport> = snapshot.data.get("fills")?;
    let ids: Vec<&str> = fills.iter().map(|fill| fill.id.as_str()).collect();
    assert_eq!(ids, vec!["o1", "o2", "o3", "o4"]);
    assert_eq!(fills[0].priority, 5);
    Ok(())
}

#[tokio::test]
async fn test_rejected_order_does_not_stop_the_others() -> Result<()> {
    let (test, providers) = setup()?;
    let orders = vec![order("o1", 1.0), order("o2", 0.0), order("o3", 2.0)];

    let snapshot = test
        .run(exchange::FLOW, json!({"portfolio_id": "pf_3", "orders": orders}))
        .await?;

    assert_eq!(snapshot.status, FlowStatus::Completed);
    assert_eq!(providers.exchange.placements().len(), 2);
    assert_eq!(snapshot.step_status("place_orders[o2]"), Some(StepStatus::Failed));
    assert_eq!(snapshot.step_status("place_orders"), Some(StepStatus::Failed));
    assert_eq!(
        snapshot.data.lookup("errors.place_orders.kind"),
        Some(&json!("validation"))
    );
    assert_eq!(snapshot.data.get::<Vec<String>>("filled")?, vec!["o1", "o3"]);
    assert_eq!(snapshot.data.get::<Vec<String>>("rejected")?, vec!["o2"]);
    Ok(())
}

#[tokio::test]
async fn test_empty_rebalance_is_rejected() -> Result<()> {
    let (test, providers) = setup()?;

    let snapshot = test
        .run(exchange::FLOW, json!({"portfolio_id": "pf_4", "orders": []}))
        .await?;

    assert_eq!(snapshot.status, FlowStatus::Failed);
    let failure = snapshot.failure.as_ref().unwrap();
    assert_eq!(failure.step.as_deref(), Some("plan"));
    assert_eq!(failure.kind, ErrorKind::Validation);
    assert_eq!(failure.message, "nothing to rebalance");
    assert!(snapshot.step("place_orders").is_none());
    assert!(providers.exchange.placements().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_malformed_order_fails_before_placement() -> Result<()> {
    let (test, providers) = setup()?;
    let orders = json!([{"id": "o1", "quantity": 1.0}, {"quantity": 2.0}]);

    let snapshot = test
        .run(exchange::FLOW, json!({"portfolio_id": "pf_5", "orders": orders}))
        .await?;

    assert_eq!(
        snapshot.step("place_orders").unwrap().kind,
        Some(ErrorKind::Validation)
    );
    assert!(providers.exchange.placements().is_empty());

    // Without reports there is nothing to settle
    assert_eq!(snapshot.status, FlowStatus::Failed);
    let failure = snapshot.failure.as_ref().unwrap();
    assert_eq!(failure.step.as_deref(), Some("settle"));
    assert_eq!(failure.kind, ErrorKind::DataBagMissingKey);
    Ok(())
}
