//! One-shot local run of a tasker, without the server.

use std::{future::Future, sync::Arc};

use anyhow::{Context, Result};
use eam_core::{config::AppConfig, engine::Engine, Operator, OperatorEnv, RunOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Activates the selected tasker and runs its task list until it completes or
/// `interrupt` resolves. The operator is destroyed on every path.
pub async fn run_once(
    config: &AppConfig,
    engine: Arc<dyn Engine>,
    id: Option<&str>,
    name: Option<&str>,
    interrupt: impl Future<Output = ()>,
) -> Result<RunOutcome> {
    let profile = config
        .select_profile(id, name)
        .context("no tasker to run")?
        .clone();
    let env = Arc::new(OperatorEnv::from_config(engine, config));
    let mut operator = Operator::new(profile, env);
    info!(tasker_id = %operator.id(), "one-shot run");

    if let Err(err) = operator.activate().await {
        error!(tasker_id = %operator.id(), error = %err, "activation failed");
        operator.destroy();
        let message = err.client_message();
        return Err(err).context(message);
    }
    let stopper = operator
        .stopper()
        .context("tasker missing after activation")?;

    let token = CancellationToken::new();
    let outcome = {
        let run = operator.run(&token);
        tokio::pin!(run);
        tokio::select! {
            outcome = &mut run => outcome,
            _ = interrupt => {
                info!("interrupt received; stopping run");
                if !stopper.stop(&token).await {
                    error!("engine refused stop");
                }
                run.await
            }
        }
    };
    operator.destroy();
    Ok(outcome)
}

/// Line printed once a one-shot run ends.
pub fn summary(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed(_) => "Completed".to_string(),
        RunOutcome::Cancelled(_) => "Interrupt".to_string(),
        RunOutcome::Failed(err) => format!("Failed: {err}"),
    }
}
