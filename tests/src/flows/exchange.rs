//! Portfolio rebalancing across exchange accounts
//!
//! Orders fan out as dynamic branches. Untagged orders rotate over the
//! venues; an order may pin its venue with `exchange` and its position in
//! the venue's queue with `priority`. Each venue takes one order at a time.

use crate::providers::FakeExchange;
use conduit_core::domain::branching::{BranchFactory, BranchReport, BranchSelector};
use conduit_core::{
    step_fn, BranchItem, CoreError, DataBag, DataRequirement, DataType, Distribution,
    DynamicBranches, ErrorKind, FlowDefinition, StepDefinition, StepExecutor, StepFlags, StepResult,
    StepStatus,
};
use serde_json::{json, Value};
use std::sync::Arc;

pub const FLOW: &str = "rebalance";

pub const VENUES: [&str; 2] = ["binance", "kraken"];

fn order_selector() -> BranchSelector {
    Arc::new(|data: &DataBag| -> Result<Vec<BranchItem>, CoreError> {
        let orders: Vec<Value> = data.get("orders")?;
        orders
            .into_iter()
            .map(|order| -> Result<BranchItem, CoreError> {
                let id = order
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CoreError::ValidationError("order without id".to_string()))?
                    .to_string();
                Ok(BranchItem {
                    resource_group: order
                        .get("exchange")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    priority: order.get("priority").and_then(Value::as_i64).unwrap_or(0),
                    ..BranchItem::new(id, order)
                })
            })
            .collect()
    })
}

fn place_order(exchange: Arc<FakeExchange>) -> BranchFactory {
    Arc::new(move |_item: &BranchItem| -> Arc<dyn StepExecutor> {
        let exchange = exchange.clone();
        step_fn(move |ctx| {
            let exchange = exchange.clone();
            async move {
                let venue: String = ctx.get("branch.group")?;
                let order: String = ctx.get("item.id")?;
                let quantity: f64 = ctx.get("item.quantity")?;
                let venue_order = exchange.place(&venue, &order, quantity).await?;
                Ok::<_, CoreError>(StepResult::success_with(
                    format!("{} accepted by {}", order, venue),
                    json!({"venue_order_id": venue_order}),
                ))
            }
        })
    })
}

pub fn rebalance(exchange: Arc<FakeExchange>) -> Result<FlowDefinition, CoreError> {
    let plan = StepDefinition {
        flags: StepFlags::critical(),
        requires: vec![DataRequirement::new("orders", DataType::Array)],
        produces: vec!["order_count".to_string()],
        ..StepDefinition::from_fn("plan", |ctx| async move {
            let orders: Vec<Value> = ctx.get("orders")?;
            if orders.is_empty() {
                return Ok(StepResult::failure(
                    ErrorKind::Validation,
                    "nothing to rebalance",
                ));
            }
            ctx.set("order_count", &orders.len())?;
            Ok::<_, CoreError>(StepResult::success(format!("{} orders planned", orders.len())))
        })
    };

    let place_orders = StepDefinition {
        after: vec!["plan".to_string()],
        flags: StepFlags::allow_failure(),
        dynamic_branches: Some(DynamicBranches {
            selector: order_selector(),
            factory: place_order(exchange),
            distribution: Distribution::RoundRobin {
                groups: VENUES.iter().map(|venue| venue.to_string()).collect(),
            },
            results_key: "fills".to_string(),
        }),
        ..StepDefinition::from_fn("place_orders", |_ctx| async {
            Ok(StepResult::success("orders routed"))
        })
    };

    let settle = StepDefinition {
        after: vec!["place_orders".to_string()],
        requires: vec![DataRequirement::new("fills", DataType::Array)],
        produces: vec!["filled".to_string(), "rejected".to_string()],
        ..StepDefinition::from_fn("settle", |ctx| async move {
            let fills: Vec<BranchReport> = ctx.get("fills")?;
            let (filled, rejected): (Vec<BranchReport>, Vec<BranchReport>) = fills
                .into_iter()
                .partition(|fill| fill.status == StepStatus::Succeeded);
            let ids = |reports: &[BranchReport]| -> Vec<String> {
                reports.iter().map(|report| report.id.clone()).collect()
            };
            ctx.set("filled", &ids(&filled))?;
            ctx.set("rejected", &ids(&rejected))?;
            Ok::<_, CoreError>(StepResult::success(format!(
                "{} filled, {} rejected",
                filled.len(),
                rejected.len()
            )))
        })
    };

    FlowDefinition::build(
        FLOW,
        vec![
            DataRequirement::new("portfolio_id", DataType::String),
            DataRequirement::new("orders", DataType::Array),
        ],
        vec![plan, place_orders, settle],
    )
}
