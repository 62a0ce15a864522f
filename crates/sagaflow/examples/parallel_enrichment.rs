//! Fan-out: parallel branches and for-each processing with a listener.

use sagaflow::prelude::*;
use std::sync::Arc;

struct PrintingListener;

impl WorkflowListener for PrintingListener {
    fn on_workflow_start(&self, workflow: &str, _ctx: &WorkflowContext) -> Result<(), StepError> {
        println!("[listener] {workflow} started");
        Ok(())
    }

    fn on_workflow_complete(
        &self,
        workflow: &str,
        _ctx: &WorkflowContext,
        result: Option<&Value>,
    ) -> Result<(), StepError> {
        println!("[listener] {workflow} completed with {result:?}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut workflow = Workflow::new("EnrichOrder");
    workflow.add_listener(Arc::new(PrintingListener))?;

    let ctx = workflow.context();
    let pricing_ctx = Arc::clone(&ctx);
    let stock_ctx = Arc::clone(&ctx);

    let branches: Vec<Branch> = vec![
        Box::new(move |sub| {
            let ctx = Arc::clone(&pricing_ctx);
            sub.step("Fetch pricing", move || {
                ctx.put("price", 42.5);
                Ok("priced")
            })?;
            Ok(())
        }),
        Box::new(move |sub| {
            let ctx = Arc::clone(&stock_ctx);
            sub.step("Check stock", move || {
                ctx.put("in_stock", true);
                Ok("checked")
            })?;
            Ok(())
        }),
    ];

    let totals_ctx = Arc::clone(&ctx);
    workflow
        .parallel(branches)?
        .for_each(
            || vec![10, 20, 30],
            move |item| {
                let total = totals_ctx.get_or("total", json!(0)).as_i64().unwrap_or(0);
                totals_ctx.put("total", total + item.as_i64().unwrap_or(0));
                Ok(())
            },
        )?
        .step("Summarise", {
            let ctx = Arc::clone(&ctx);
            move || {
                Ok(json!({
                    "price": ctx.get_or("price", json!(null)),
                    "in_stock": ctx.get_or("in_stock", json!(false)),
                    "total": ctx.get_or("total", json!(0)),
                }))
            }
        })?;

    let summary = workflow.execute().await?;
    println!("summary: {summary:?}");

    Ok(())
}
