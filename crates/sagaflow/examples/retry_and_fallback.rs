//! Flaky dependencies: retries, fallback and timeout-bounded calls.

use sagaflow::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut workflow = Workflow::new("FetchProfile");
    let attempts = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&attempts);

    workflow
        // Succeeds on the third attempt.
        .add_step(
            SyncStep::builder("Fetch from primary", move || {
                let attempt = probe.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    return Err(format!("connection reset (attempt {attempt})").into());
                }
                Ok(json!({ "name": "Alice", "source": "primary" }))
            })
            .max_retries(3)
            .retry_delay(Duration::from_millis(50))
            .build(),
        )?
        // The cache lookup never fails thanks to the static fallback.
        .with_fallback(
            || Err::<Value, StepError>("cache miss".into()),
            || Ok(json!({ "avatar": "default.png" })),
        )?
        // A slow enrichment call bounded to 200ms.
        .with_timeout(
            "enrichment service",
            || Ok(json!({ "segment": "beta" })),
            Duration::from_millis(200),
        )?
        .log_message("profile assembled")?;

    let result = workflow.execute().await?;
    println!("final result: {:?}", result);
    println!("primary attempts: {}", attempts.load(Ordering::SeqCst));
    for line in workflow.execution_trace() {
        println!("trace: {line}");
    }

    Ok(())
}
