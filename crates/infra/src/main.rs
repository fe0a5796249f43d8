use std::sync::Arc;

use anyhow::Context;

use saleflow_core::SaleItemId;
use saleflow_infra::{SimulatedActivities, WorkflowConfig, WorkflowError, WorkflowRuntime};
use saleflow_sales::SaleItemWorkflowInput;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    saleflow_observability::init();

    let config = WorkflowConfig::from_env();
    let (runtime, _history) =
        WorkflowRuntime::in_memory(config, Arc::new(SimulatedActivities::default()));

    let sale_item_id = SaleItemId::new("1234567")?;
    let handle = runtime
        .start(SaleItemWorkflowInput::new(sale_item_id, 10).with_status("open"))
        .context("failed to start sale item workflow")?;

    let transitions = handle.get_transitions().await?;
    for (from, to) in transitions.iter() {
        let targets: Vec<&str> = to.iter().map(|s| s.as_str()).collect();
        tracing::info!(from = %from, to = ?targets, "transition");
    }

    for status in ["ready", "billed_pending"] {
        let item = handle.update_status(status).await?;
        tracing::info!(status = %item.current_status, quantity = item.quantity, "sale item updated");
    }

    match handle.update_status("open").await {
        Err(e @ WorkflowError::InvalidTransition { .. }) => {
            tracing::info!(error = %e, "rejected as expected");
        }
        other => anyhow::bail!("expected billed_pending -> open to be rejected, got {other:?}"),
    }

    let item = handle.update_status("billed_approved").await?;
    tracing::info!(status = %item.current_status, "sale item approved");

    let outcome = handle.result().await?;
    println!("{}", serde_json::to_string(&outcome)?);

    Ok(())
}
