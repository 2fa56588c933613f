//! Session Lifecycle Example
//!
//! Walks through startup, sign-in, a backend outage and sign-out against the
//! in-memory backends from `sessiond-testing`.
//!
//! Run with:
//! ```bash
//! RUST_LOG=sessiond=debug cargo run -p sessiond --example session_lifecycle
//! ```

use sessiond::prelude::*;
use sessiond_testing::{server_unavailable, MockIdentityBackend, MockProfileStore};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    sessiond::init_tracing(None);

    let identity = Arc::new(
        MockIdentityBackend::new()
            .with_account("jane@example.com", "correct-horse", "user-1")
            .with_latency(Duration::from_millis(50)),
    );
    let profiles = Arc::new(MockProfileStore::new());

    let mut config = SessiondConfig::for_environment(Environment::Development);
    config.orchestrator.retry = RetryPolicy::new()
        .with_max_retries(2)
        .with_base_delay(Duration::from_millis(100));
    config.orchestrator.circuit.failure_threshold = 2;
    config.orchestrator.circuit.reset_timeout = Duration::from_secs(1);

    let layer = Sessiond::new(config, Collaborators::new(identity.clone(), profiles))?;

    let status = layer.start().await;
    println!("startup settled: {status:?}");

    let session = layer
        .sign_in(&Credentials::new("jane@example.com", "correct-horse"))
        .await?;
    let record = layer.session();
    println!(
        "signed in as {} ({:?}), profile: {:?}",
        session.user.id,
        record.status,
        record.profile.and_then(|p| p.display_name)
    );

    // Every attempt fails until the circuit opens.
    identity.fail_next(6, server_unavailable());
    for _ in 0..3 {
        match layer.refresh_session().await {
            Ok(_) => println!("refreshed"),
            Err(err) => {
                let shown = err.to_user_facing();
                println!(
                    "refresh failed: {} [{:?}, retry: {}]",
                    shown.message, shown.code, shown.can_retry
                );
            }
        }
    }
    println!("health: {}", serde_json::to_string_pretty(&layer.health())?);

    tokio::time::sleep(Duration::from_secs(1)).await;
    layer.refresh_session().await?;
    println!("circuit after recovery: {:?}", layer.circuit_metrics().state);

    layer.sign_out().await?;
    println!("signed out: {:?}", layer.session().status);

    layer.close();
    Ok(())
}
