use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::task::JoinSet;

use crate::azure::AzCli;
use crate::compose::Services;
use crate::config::runtime::Config;
use crate::docker::{self, ImageArtifact, Role};
use crate::health::{self, Budget};
use crate::provision::{self, ControlPlane, ProvisionResult, ShowResult};
use crate::release::{self, ReleaseTarget};
use crate::report::{DeploymentReport, ReleaseSection, Stage};
use crate::spec::{self, ResourceKind, ResourceSpec};
use crate::Error;

/// Caller-facing knobs for one `deploy` run.
pub struct Params {
    pub cfg: Config,
    pub services: Services,
    pub tag: String,
    /// Overall bound on the verification phase.
    pub verify_deadline: Option<Duration>,
}

/// Registry login server, from the live resource when provisioned, else
/// the provider's well-known naming scheme.
pub fn login_server(cfg: &Config, results: &[ProvisionResult]) -> String {
    results
        .iter()
        .find(|r| r.kind == ResourceKind::ContainerRegistry && r.ok())
        .and_then(|r| r.endpoint.clone())
        .unwrap_or_else(|| format!("{}.azurecr.io", cfg.registry))
}

/// Public hostname of the web service, same fallback scheme.
pub fn service_host(cfg: &Config, results: &[ProvisionResult]) -> String {
    results
        .iter()
        .find(|r| r.kind == ResourceKind::WebService && r.ok())
        .and_then(|r| r.endpoint.clone())
        .unwrap_or_else(|| format!("{}.azurewebsites.net", cfg.service))
}

/// Read-only sweep over the declared resources, for subcommands that need
/// live endpoints without converging anything.
pub fn inspect_endpoints(cp: &dyn ControlPlane, specs: &[ResourceSpec]) -> Vec<ProvisionResult> {
    specs
        .iter()
        .map(|s| match cp.show(s) {
            Ok(ShowResult::Present { endpoint }) => ProvisionResult {
                kind: s.kind,
                name: s.name.clone(),
                already_existed: true,
                endpoint,
                error: None,
            },
            Ok(ShowResult::Absent) => ProvisionResult {
                kind: s.kind,
                name: s.name.clone(),
                already_existed: false,
                endpoint: None,
                error: Some("resource does not exist".into()),
            },
            Err(err) => ProvisionResult {
                kind: s.kind,
                name: s.name.clone(),
                already_existed: false,
                endpoint: None,
                error: Some(err.to_string()),
            },
        })
        .collect()
}

/// Authenticate to the registry, then build and push both role images
/// concurrently. Auth happens before any build so a bad login fails fast
/// instead of after minutes of image building.
pub async fn build_stage(
    cfg: &Config,
    services: &Services,
    tag: &str,
    login_server: &str,
) -> Result<Vec<ImageArtifact>, docker::Error> {
    docker::authenticate(&cfg.registry, login_server)?;

    let mut tasks = JoinSet::new();
    for context in [services.application.clone(), services.edge_proxy.clone()] {
        let name_cfg = docker::name::Config {
            registry: login_server.to_string(),
            app: cfg.app.clone(),
            role: context.role,
            tag: tag.to_string(),
        };
        tasks.spawn_blocking(move || docker::build_and_push(&context, name_cfg));
    }

    let mut artifacts = Vec::new();
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|err| docker::Error::IOError(std::io::Error::other(err)))
            .and_then(|r| r);
        match outcome {
            Ok(artifact) => artifacts.push(artifact),
            Err(err) if first_error.is_none() => first_error = Some(err),
            Err(err) => warn!("additional build failure: {err}"),
        }
    }

    if let Err(err) = docker::logout(login_server) {
        warn!("docker logout failed: {err}");
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    artifacts.sort_by_key(|a| a.role != Role::Application);
    Ok(artifacts)
}

/// The whole workflow: provision, build and push, release, verify.
///
/// Configuration problems surface as `Err` before anything runs. From the
/// provisioning stage onwards a report is always produced; fatal stage
/// errors are recorded in it rather than thrown, so the operator sees the
/// full picture of what did and did not happen.
pub async fn deploy(params: Params) -> Result<DeploymentReport, Error> {
    let cfg = &params.cfg;
    let mut report = DeploymentReport::new();

    let specs = spec::load(cfg)?;

    // provision
    let cp: Arc<dyn ControlPlane> = Arc::new(AzCli);
    report.provision = provision::provision_all(cp, &specs).await?;

    let release_path = [ResourceKind::ContainerRegistry, ResourceKind::WebService];
    if let Some(broken) = report
        .provision
        .iter()
        .find(|r| release_path.contains(&r.kind) && !r.ok())
    {
        report.abort(
            Stage::Provision,
            format!(
                "{} {} failed to provision, release is impossible: {}",
                broken.kind,
                broken.name,
                broken.error.as_deref().unwrap_or("unknown error")
            ),
        );
        return Ok(report);
    }

    // build and push both images
    let registry = login_server(cfg, &report.provision);
    match build_stage(cfg, &params.services, &params.tag, &registry).await {
        Ok(artifacts) => report.artifacts = artifacts,
        Err(err) => {
            report.abort(Stage::Build, err.to_string());
            return Ok(report);
        }
    }

    // release the application image
    let Some(app_artifact) = report
        .artifacts
        .iter()
        .find(|a| a.role == Role::Application)
        .cloned()
    else {
        report.abort(Stage::Build, "no application artifact was produced".into());
        return Ok(report);
    };

    let target = ReleaseTarget {
        service_name: cfg.service.clone(),
        resource_group: cfg.resource_group.clone(),
        current_image_ref: None,
        environment: release::app_settings(cfg, &report.provision),
    };
    match release::release(&AzCli, target, &app_artifact) {
        Ok(target) => {
            report.release = Some(ReleaseSection {
                service: target.service_name,
                image_ref: app_artifact.registry_ref.clone(),
            })
        }
        Err(err) => {
            report.abort(Stage::Release, err.to_string());
            return Ok(report);
        }
    }

    // verify
    let host = service_host(cfg, &report.provision);
    let budget = Budget {
        max_attempts: cfg.health.max_attempts,
        interval: cfg.health.interval,
        probe_timeout: cfg.health.probe_timeout,
    };
    let deadline = params
        .verify_deadline
        .map(|d| tokio::time::Instant::now() + d);

    let health_url = format!("https://{host}/health");
    let verdict = health::verify(&health_url, &budget, deadline).await?;
    let healthy = verdict.healthy();
    report.health = Some(verdict);

    if healthy {
        // the second contractually stable endpoint; informational only
        let status_url = format!("https://{host}/api/status");
        let once = Budget {
            max_attempts: 1,
            ..budget
        };
        match health::verify(&status_url, &once, None).await {
            Ok(v) if v.healthy() => info!("{status_url} answered healthy"),
            Ok(_) => warn!("{status_url} did not answer healthy"),
            Err(err) => warn!("status endpoint probe failed: {err}"),
        }
    } else {
        report.failed_stage = Some(Stage::Verify);
    }

    report.finish();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{file, runtime, Secret};
    use crate::provision::test::FakeControlPlane;

    fn test_config() -> Config {
        let mut cfg = runtime::Config::new(&file::File::default(), Some("shop-api")).unwrap();
        cfg.database_admin_password = Some(Secret::new("s3cret"));
        cfg
    }

    #[test]
    fn login_server_prefers_live_endpoint() {
        let cfg = test_config();
        let results = vec![ProvisionResult {
            kind: ResourceKind::ContainerRegistry,
            name: "shopapiacr".into(),
            already_existed: true,
            endpoint: Some("shopapiacr.azurecr.example".into()),
            error: None,
        }];
        assert_eq!(login_server(&cfg, &results), "shopapiacr.azurecr.example");
        assert_eq!(login_server(&cfg, &[]), "shopapiacr.azurecr.io");
    }

    #[test]
    fn service_host_falls_back_to_naming_scheme() {
        let cfg = test_config();
        assert_eq!(service_host(&cfg, &[]), "shop-api-web.azurewebsites.net");
    }

    /// The release path end to end against fakes: point the service at a
    /// fresh artifact, probe a healthy endpoint once, aggregate the report.
    #[tokio::test]
    async fn release_then_verify_reports_success() {
        let cfg = test_config();
        let artifact = ImageArtifact {
            role: Role::Application,
            registry_ref: "shopapiacr.azurecr.io/shop-api-app:v1".into(),
            tag: "v1".into(),
            historical_ref: None,
        };

        let ctl = crate::release::test::FakeServiceControl::default();
        let target = ReleaseTarget {
            service_name: cfg.service.clone(),
            resource_group: cfg.resource_group.clone(),
            current_image_ref: None,
            environment: release::app_settings(&cfg, &[]),
        };
        let target = release::release(&ctl, target, &artifact).unwrap();

        let url = crate::health::test::spawn_server(vec![200]).await;
        let verdict = health::verify(
            &url,
            &Budget {
                max_attempts: 1,
                interval: Duration::from_millis(10),
                probe_timeout: Duration::from_secs(2),
            },
            None,
        )
        .await
        .unwrap();

        let mut report = DeploymentReport::new();
        report.artifacts = vec![artifact.clone()];
        report.release = Some(ReleaseSection {
            service: target.service_name,
            image_ref: artifact.registry_ref.clone(),
        });
        report.health = Some(verdict);
        report.finish();

        assert_eq!(report.status(), crate::report::Status::Succeeded);
        assert_eq!(report_probe_count(&report), 1);
    }

    fn report_probe_count(report: &DeploymentReport) -> usize {
        report.health.as_ref().map(|v| v.outcomes.len()).unwrap_or(0)
    }

    #[test]
    fn inspect_reports_missing_resources_without_mutation() {
        let cfg = test_config();
        let specs = spec::load(&cfg).unwrap();
        let fake = FakeControlPlane::new();
        fake.existing
            .lock()
            .unwrap()
            .insert("shop-api-rg".to_string());

        let results = inspect_endpoints(&fake, &specs);
        assert_eq!(results.len(), specs.len());
        let rg = results.iter().find(|r| r.name == "shop-api-rg").unwrap();
        assert!(rg.ok() && rg.already_existed);
        let missing = results.iter().find(|r| r.name == "shopapiacr").unwrap();
        assert!(!missing.ok());
        // a read-only sweep never creates anything
        assert!(fake.create_calls.lock().unwrap().is_empty());
    }
}
