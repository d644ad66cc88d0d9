use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;
use tokio::task;

use crate::spec::{self, Params, ResourceKind, ResourceSpec};

/// Provider error text, carried verbatim so operators can act on it.
/// Must never contain credentials; the control plane is responsible for
/// keeping them out of its output.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct ProviderError(pub String);

/// Connection string or hostname of a live resource, for kinds that have one.
pub type Endpoint = String;

#[derive(Debug, Clone)]
pub enum ShowResult {
    Absent,
    Present { endpoint: Option<Endpoint> },
}

/// The create/get surface of the cloud provider, one call per verb.
/// Implemented against the `az` CLI in production and faked in tests.
pub trait ControlPlane: Send + Sync {
    fn show(&self, spec: &ResourceSpec) -> Result<ShowResult, ProviderError>;

    fn create(&self, spec: &ResourceSpec) -> Result<Option<Endpoint>, ProviderError>;

    /// Idempotent: creating a rule that already exists is success.
    fn ensure_firewall_rule(&self, spec: &ResourceSpec, rule: &str) -> Result<(), ProviderError>;
}

/// Outcome of converging one ResourceSpec. One per spec per run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProvisionResult {
    pub kind: ResourceKind,
    pub name: String,
    pub already_existed: bool,
    pub endpoint: Option<Endpoint>,
    pub error: Option<String>,
}

impl ProvisionResult {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    fn failed(spec: &ResourceSpec, error: String) -> Self {
        Self {
            kind: spec.kind,
            name: spec.name.clone(),
            already_existed: false,
            endpoint: None,
            error: Some(error),
        }
    }
}

/// Converge a single resource: leave it alone if it exists, create it if not.
/// Errors are captured in the result, never propagated, so one bad resource
/// cannot take down the rest of the run.
pub fn ensure(cp: &dyn ControlPlane, spec: &ResourceSpec) -> ProvisionResult {
    let (already_existed, endpoint) = match cp.show(spec) {
        Ok(ShowResult::Present { endpoint }) => {
            info!("{} {} already exists, leaving untouched", spec.kind, spec.name);
            (true, endpoint)
        }
        Ok(ShowResult::Absent) => {
            info!("{} {} not found, creating", spec.kind, spec.name);
            match cp.create(spec) {
                Ok(endpoint) => (false, endpoint),
                Err(err) => {
                    warn!("{} {} failed to create: {}", spec.kind, spec.name, err);
                    return ProvisionResult::failed(spec, err.to_string());
                }
            }
        }
        Err(err) => {
            warn!("{} {} lookup failed: {}", spec.kind, spec.name, err);
            return ProvisionResult::failed(spec, err.to_string());
        }
    };

    // The database only accepts application traffic once its allow-rule is
    // in place, so the rule is part of converging the database itself.
    if let Params::ManagedDatabase { firewall_rule, .. } = &spec.params {
        if let Err(err) = cp.ensure_firewall_rule(spec, firewall_rule) {
            warn!("{} {} firewall rule failed: {}", spec.kind, spec.name, err);
            return ProvisionResult::failed(spec, err.to_string());
        }
    }

    ProvisionResult {
        kind: spec.kind,
        name: spec.name.clone(),
        already_existed,
        endpoint,
        error: None,
    }
}

/// Converge all specs in dependency order. Specs within a wave are
/// independent and run concurrently; a spec whose dependency failed is not
/// attempted. Results come back in the same order as the input specs.
pub async fn provision_all(
    cp: Arc<dyn ControlPlane>,
    specs: &[ResourceSpec],
) -> Result<Vec<ProvisionResult>, spec::Error> {
    let waves = spec::waves(specs)?;
    let mut failed: HashSet<String> = HashSet::new();
    let mut by_name: HashMap<String, ProvisionResult> = HashMap::new();

    for wave in waves {
        let mut tasks = Vec::new();
        for s in wave {
            if let Some(dep) = s.depends_on.iter().find(|d| failed.contains(*d)) {
                warn!(
                    "{} {} not attempted: dependency {} failed",
                    s.kind, s.name, dep
                );
                by_name.insert(
                    s.name.clone(),
                    ProvisionResult::failed(&s, format!("not attempted: dependency {dep} failed")),
                );
                continue;
            }
            let cp = Arc::clone(&cp);
            let spec = s.clone();
            tasks.push((s, task::spawn_blocking(move || ensure(cp.as_ref(), &spec))));
        }
        for (s, handle) in tasks {
            // a crashed task still yields a failed result for its spec
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => ProvisionResult::failed(&s, format!("provisioning task failed: {err}")),
            };
            if !result.ok() {
                failed.insert(result.name.clone());
            }
            by_name.insert(result.name.clone(), result);
        }
    }

    Ok(specs
        .iter()
        .filter_map(|s| by_name.remove(&s.name))
        .collect())
}
