use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum Error {
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Probe budget: never more than `max_attempts` probes, `interval` between
/// them, `probe_timeout` per request.
#[derive(Debug, Clone)]
pub struct Budget {
    pub max_attempts: u32,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

/// One probe of the endpoint. The verifier produces a finite ordered
/// sequence of these, terminal on first success or an exhausted budget.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthCheckOutcome {
    pub attempt: u32,
    pub success: bool,
    pub latency_ms: u64,
    pub http_status: Option<u16>,
}

/// Verifier states. `Probing` loops back on itself while attempts remain;
/// `Healthy` and `Unhealthy` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    Waiting,
    Probing,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Verdict {
    pub outcomes: Vec<HealthCheckOutcome>,
    pub final_state: State,
    /// True when an overall deadline cut verification short. The release
    /// itself has committed by then; only its verification is incomplete.
    pub timed_out: bool,
}

impl Verdict {
    pub fn healthy(&self) -> bool {
        self.final_state == State::Healthy
    }
}

/// Probe `url` until it answers 2xx or the budget runs out.
///
/// Network errors and non-2xx responses are both probe failures, not crashes.
/// The wait between probes is a plain cooperative sleep, so the whole future
/// can be dropped or raced against a timeout at any point; `deadline`
/// additionally bounds the run from the inside so a partial outcome sequence
/// is still returned for the report.
pub async fn verify(url: &str, budget: &Budget, deadline: Option<Instant>) -> Result<Verdict, Error> {
    let client = reqwest::Client::builder()
        .timeout(budget.probe_timeout)
        .build()?;

    let mut state = State::Waiting;
    let mut outcomes = Vec::new();

    for attempt in 1..=budget.max_attempts {
        if attempt > 1 {
            let wake = Instant::now() + budget.interval;
            match deadline {
                Some(deadline) if deadline < wake => {
                    tokio::time::sleep_until(deadline).await;
                    warn!("verification deadline reached after {} probes", outcomes.len());
                    return Ok(Verdict {
                        outcomes,
                        final_state: State::Unhealthy,
                        timed_out: true,
                    });
                }
                _ => tokio::time::sleep_until(wake).await,
            }
        }

        state = State::Probing;
        let started = Instant::now();
        let response = client.get(url).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (success, http_status) = match response {
            Ok(response) => {
                let status = response.status();
                (status.is_success(), Some(status.as_u16()))
            }
            Err(err) => {
                debug!("probe {attempt} failed: {err}");
                (false, err.status().map(|s| s.as_u16()))
            }
        };

        debug!(
            "probe {attempt}/{}: success={success} status={http_status:?} latency={latency_ms}ms",
            budget.max_attempts
        );
        outcomes.push(HealthCheckOutcome {
            attempt,
            success,
            latency_ms,
            http_status,
        });

        if success {
            info!("{url} healthy after {attempt} probe(s)");
            state = State::Healthy;
            break;
        }
    }

    if state != State::Healthy {
        warn!(
            "{url} still unhealthy after {} probe(s)",
            outcomes.len()
        );
        state = State::Unhealthy;
    }

    Ok(Verdict {
        outcomes,
        final_state: state,
        timed_out: false,
    })
}
