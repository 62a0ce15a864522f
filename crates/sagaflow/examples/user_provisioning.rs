//! User-creation saga: persist, provision, audit, respond.
//!
//! Demonstrates:
//! - Steps with compensations (delete user, deprovision account)
//! - An async step for event emission
//! - Reverse-order rollback when a later step fails

use sagaflow::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
struct User {
    id: String,
    email: String,
}

#[derive(Debug, Clone, Serialize)]
struct Account {
    id: String,
    user_id: String,
}

async fn run_saga(fail_on_audit: bool) -> Result<Option<Value>, WorkflowError> {
    let mut workflow = Workflow::new("CreateUser");
    let ctx = workflow.context();

    workflow
        .step_with_compensation(
            "Persist user",
            || {
                let user = User {
                    id: "user-42".to_string(),
                    email: "alice@example.com".to_string(),
                };
                println!("persisting {}", user.email);
                Ok(user)
            },
            |user| {
                println!("rolling back user {}", user["id"]);
                Ok(())
            },
        )?
        .step_with_compensation(
            "Provision account",
            || {
                let account = Account {
                    id: "account-7".to_string(),
                    user_id: "user-42".to_string(),
                };
                println!("provisioning {}", account.id);
                Ok(account)
            },
            |account| {
                println!("deprovisioning account {}", account["id"]);
                Ok(())
            },
        )?
        .add_step(
            AsyncStep::builder("Emit audit event", move |_ctx| async move {
                if fail_on_audit {
                    return Err("audit bus unavailable".into());
                }
                println!("audit event published");
                Ok("event-1")
            })
            .max_retries(1)
            .retry_delay(std::time::Duration::from_millis(100))
            .build(),
        )?
        .step("Build response", move || {
            let user = ctx.get_or("step_result_persist_user", json!({}));
            Ok(json!({ "status": "created", "user": user }))
        })?;

    workflow.execute().await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("--- happy path ---");
    let response = run_saga(false).await?;
    println!("response: {:?}\n", response);

    println!("--- audit failure triggers rollback ---");
    match run_saga(true).await {
        Ok(_) => println!("unexpected success"),
        Err(error) => println!("saga failed as expected: {error}"),
    }

    Ok(())
}
