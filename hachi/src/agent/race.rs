//! Racing several agents on the same input.

use futures::future::select_all;
use tracing::info;

use super::runner::Runner;
use super::{Agent, RunConfig, RunResult};
use crate::cancel::CancelToken;
use crate::error::RunError;
use crate::message::UserInput;

/// The winner of a race and its result.
#[derive(Debug)]
pub struct RaceOutcome {
    /// Name of the first agent to complete successfully.
    pub winner: String,
    /// Its run result.
    pub result: RunResult,
}

/// Run every agent concurrently on the same input; the first successful
/// completion wins and the losers are cancelled.
///
/// Each racer gets its own cancellation token (linked to the one on
/// `config`, when present, so an external cancel still stops them all).
///
/// # Errors
///
/// When every racer fails, the first failure observed is returned.
pub async fn race(
    agents: &[&Agent],
    input: impl Into<UserInput>,
    config: RunConfig,
) -> Result<RaceOutcome, RunError> {
    let input = input.into();
    assert!(!agents.is_empty(), "race requires at least one agent");

    let tokens: Vec<CancelToken> = agents.iter().map(|_| CancelToken::new()).collect();

    // Propagate an external cancel to every racer.
    if let Some(external) = config.cancel.clone() {
        let racers = tokens.clone();
        tokio::spawn(async move {
            external.cancelled().await;
            for token in &racers {
                token.cancel();
            }
        });
    }

    let mut running: Vec<_> = agents
        .iter()
        .zip(&tokens)
        .map(|(agent, token)| {
            let racer_config = config.clone().cancel_token(token.clone());
            let input = input.clone();
            Box::pin(async move { (agent.name.clone(), Runner::run(agent, input, racer_config).await) })
        })
        .collect();

    let mut first_error: Option<RunError> = None;
    loop {
        let ((name, outcome), _, rest) = select_all(running).await;
        match outcome {
            Ok(result) => {
                for token in &tokens {
                    token.cancel();
                }
                info!(winner = %name, "Race finished");
                return Ok(RaceOutcome {
                    winner: name,
                    result,
                });
            }
            Err(err) => {
                first_error.get_or_insert(err);
                if rest.is_empty() {
                    return Err(first_error.expect("at least one failure observed"));
                }
                running = rest;
            }
        }
    }
}
