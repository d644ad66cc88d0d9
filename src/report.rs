use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};

use crate::docker::ImageArtifact;
use crate::health::Verdict;
use crate::provision::ProvisionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Succeeded,
    PartiallySucceeded,
    Failed,
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::Succeeded => "succeeded",
            Status::PartiallySucceeded => "partially-succeeded",
            Status::Failed => "failed",
        })
    }
}

/// The pipeline stage a fatal error surfaced in. Drives the process exit
/// code; config errors never produce a report at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Provision,
    Build,
    Release,
    Verify,
}

/// Release outcome as recorded in the report. Deliberately excludes the
/// environment mapping; settings may carry secrets.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReleaseSection {
    pub service: String,
    pub image_ref: String,
}

/// Aggregated outcome of one orchestration run. Each stage fills in its own
/// section; nothing here is shared while stages are still running.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeploymentReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub provision: Vec<ProvisionResult>,
    pub artifacts: Vec<ImageArtifact>,
    pub release: Option<ReleaseSection>,
    pub health: Option<Verdict>,
    /// Fatal error that aborted the pipeline, verbatim.
    pub failure: Option<String>,
    pub failed_stage: Option<Stage>,
}

impl DeploymentReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            provision: Vec::new(),
            artifacts: Vec::new(),
            release: None,
            health: None,
            failure: None,
            failed_stage: None,
        }
    }

    pub fn abort(&mut self, stage: Stage, failure: String) {
        self.failure = Some(failure);
        self.failed_stage = Some(stage);
        self.finish();
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Overall verdict. Succeeded requires a clean provisioning pass, both
    /// artifacts, a committed release and a healthy service; a healthy
    /// release on top of partially failed provisioning is partial success;
    /// anything else is failure.
    pub fn status(&self) -> Status {
        if self.failure.is_some() {
            return Status::Failed;
        }
        let provision_ok = self.provision.iter().all(ProvisionResult::ok);

        // provisioning-only invocation: nothing was ever released
        if self.release.is_none() && self.artifacts.is_empty() && self.health.is_none() {
            return if provision_ok {
                Status::Succeeded
            } else {
                Status::Failed
            };
        }

        let released = self.release.is_some();
        let healthy = self.health.as_ref().map(Verdict::healthy).unwrap_or(false);
        if !released || !healthy {
            return Status::Failed;
        }
        if provision_ok {
            Status::Succeeded
        } else {
            Status::PartiallySucceeded
        }
    }

    /// The release committed but was never verified healthy. Operators need
    /// to see this loudly: the new image is live.
    pub fn deployed_but_unverified(&self) -> bool {
        self.release.is_some()
            && self.failure.is_none()
            && self.health.as_ref().map(|v| !v.healthy()).unwrap_or(false)
    }
}

impl Default for DeploymentReport {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DeploymentReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "deployment report: {}", self.status())?;

        if !self.provision.is_empty() {
            writeln!(f, "resources:")?;
            for result in &self.provision {
                match &result.error {
                    Some(error) => {
                        writeln!(f, "  {} {}: FAILED: {}", result.kind, result.name, error)?
                    }
                    None => {
                        let verb = if result.already_existed {
                            "already existed"
                        } else {
                            "created"
                        };
                        match &result.endpoint {
                            Some(endpoint) => writeln!(
                                f,
                                "  {} {}: {} ({})",
                                result.kind, result.name, verb, endpoint
                            )?,
                            None => {
                                writeln!(f, "  {} {}: {}", result.kind, result.name, verb)?
                            }
                        }
                    }
                }
            }
        }

        if !self.artifacts.is_empty() {
            writeln!(f, "images:")?;
            for artifact in &self.artifacts {
                match &artifact.historical_ref {
                    Some(unique) => writeln!(
                        f,
                        "  {} {} (also {})",
                        artifact.role, artifact.registry_ref, unique
                    )?,
                    None => writeln!(f, "  {} {}", artifact.role, artifact.registry_ref)?,
                }
            }
        }

        if let Some(release) = &self.release {
            writeln!(f, "release: {} -> {}", release.service, release.image_ref)?;
        }

        if let Some(health) = &self.health {
            if health.healthy() {
                writeln!(f, "health: healthy after {} probe(s)", health.outcomes.len())?;
            } else if health.timed_out {
                writeln!(
                    f,
                    "health: verification deadline reached after {} probe(s)",
                    health.outcomes.len()
                )?;
            } else {
                writeln!(
                    f,
                    "health: UNHEALTHY after {} probe(s)",
                    health.outcomes.len()
                )?;
            }
        }

        if self.deployed_but_unverified() {
            writeln!(f, "WARNING: DEPLOYED BUT UNVERIFIED - the new image is live but never answered healthy")?;
        }

        if let Some(failure) = &self.failure {
            writeln!(f, "fatal: {failure}")?;
        }

        Ok(())
    }
}
