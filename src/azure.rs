use std::io::Write;
use std::process::Command;

use log::debug;
use thiserror::Error;

use crate::provision::{ControlPlane, Endpoint, ProviderError, ShowResult};
use crate::release::{EnvVar, ReleaseTarget, ServiceControl};
use crate::spec::{Params, ResourceKind, ResourceSpec};

#[derive(Error, Debug)]
pub enum Error {
    #[error("az {verb} {name} exited with code {code}: {stderr}")]
    Az {
        verb: String,
        name: String,
        code: i32,
        stderr: String,
    },

    #[error("az produced unparseable output: {0}")]
    Output(#[from] serde_json::Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

impl From<Error> for ProviderError {
    fn from(err: Error) -> Self {
        ProviderError(err.to_string())
    }
}

/// Control plane backed by the `az` CLI. Credentials come from the ambient
/// `az login` session; this type never sees them.
pub struct AzCli;

struct AzOutput {
    success: bool,
    code: i32,
    stdout: String,
    stderr: String,
}

/// Run one az command with JSON output. Secrets may appear in `args`
/// (the provider offers no other channel for them), so arguments are
/// never logged here; call sites log their own redacted lines.
fn az(args: &[&str]) -> Result<AzOutput, Error> {
    let output = Command::new("az")
        .args(args)
        .args(["--output", "json"])
        .output()?;
    Ok(AzOutput {
        success: output.status.success(),
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// az signals a missing resource with a nonzero exit and one of a few
/// well-known phrases on stderr.
fn is_not_found(stderr: &str) -> bool {
    stderr.contains("ResourceNotFound")
        || stderr.contains("ResourceGroupNotFound")
        || stderr.contains("could not be found")
        || stderr.contains("was not found")
        || stderr.contains("(NotFound)")
}

/// Pluck the connection endpoint out of a `show`/`create` response,
/// for the kinds that have one.
fn endpoint_of(kind: ResourceKind, body: &str) -> Result<Option<Endpoint>, Error> {
    let field = match kind {
        ResourceKind::ContainerRegistry => "loginServer",
        ResourceKind::ManagedDatabase => "fullyQualifiedDomainName",
        ResourceKind::ManagedCache => "hostName",
        ResourceKind::WebService => "defaultHostName",
        ResourceKind::ResourceGroup | ResourceKind::ComputePlan => return Ok(None),
    };
    let value: serde_json::Value = serde_json::from_str(body)?;
    Ok(value
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string))
}

fn show_args<'a>(spec: &'a ResourceSpec) -> Vec<&'a str> {
    let n = spec.name.as_str();
    let g = spec.resource_group.as_str();
    match spec.kind {
        ResourceKind::ResourceGroup => vec!["group", "show", "--name", n],
        ResourceKind::ContainerRegistry => {
            vec!["acr", "show", "--name", n, "--resource-group", g]
        }
        ResourceKind::ManagedDatabase => vec![
            "mysql",
            "flexible-server",
            "show",
            "--name",
            n,
            "--resource-group",
            g,
        ],
        ResourceKind::ManagedCache => vec!["redis", "show", "--name", n, "--resource-group", g],
        ResourceKind::ComputePlan => {
            vec!["appservice", "plan", "show", "--name", n, "--resource-group", g]
        }
        ResourceKind::WebService => vec!["webapp", "show", "--name", n, "--resource-group", g],
    }
}

/// Placeholder image a freshly created web service boots with until the
/// first release points it at a real artifact.
const BOOTSTRAP_IMAGE: &str = "mcr.microsoft.com/appsvc/staticsite:latest";

impl AzCli {
    fn create_resource(&self, spec: &ResourceSpec) -> Result<Option<Endpoint>, Error> {
        let storage;
        let args: Vec<&str> = match &spec.params {
            Params::ResourceGroup => vec![
                "group", "create", "--name", &spec.name, "--location", &spec.region,
            ],
            Params::ContainerRegistry { sku } => vec![
                "acr",
                "create",
                "--name",
                &spec.name,
                "--resource-group",
                &spec.resource_group,
                "--sku",
                sku,
                "--admin-enabled",
                "true",
            ],
            Params::ManagedDatabase {
                sku,
                storage_gb,
                database_name,
                admin_user,
                admin_password,
                ..
            } => {
                storage = storage_gb.to_string();
                vec![
                    "mysql",
                    "flexible-server",
                    "create",
                    "--name",
                    &spec.name,
                    "--resource-group",
                    &spec.resource_group,
                    "--location",
                    &spec.region,
                    "--sku-name",
                    sku,
                    "--storage-size",
                    &storage,
                    "--database-name",
                    database_name,
                    "--admin-user",
                    admin_user,
                    "--admin-password",
                    admin_password.expose(),
                    "--yes",
                ]
            }
            Params::ManagedCache { sku, vm_size } => vec![
                "redis",
                "create",
                "--name",
                &spec.name,
                "--resource-group",
                &spec.resource_group,
                "--location",
                &spec.region,
                "--sku",
                sku,
                "--vm-size",
                vm_size,
            ],
            Params::ComputePlan { sku } => vec![
                "appservice",
                "plan",
                "create",
                "--name",
                &spec.name,
                "--resource-group",
                &spec.resource_group,
                "--is-linux",
                "--sku",
                sku,
            ],
            Params::WebService { plan, .. } => vec![
                "webapp",
                "create",
                "--name",
                &spec.name,
                "--resource-group",
                &spec.resource_group,
                "--plan",
                plan,
                "--deployment-container-image-name",
                BOOTSTRAP_IMAGE,
            ],
        };

        debug!("az {} create {}", spec.kind, spec.name);
        let out = az(&args)?;
        if !out.success {
            return Err(Error::Az {
                verb: format!("{} create", spec.kind),
                name: spec.name.clone(),
                code: out.code,
                stderr: out.stderr,
            });
        }
        endpoint_of(spec.kind, &out.stdout)
    }
}

impl ControlPlane for AzCli {
    fn show(&self, spec: &ResourceSpec) -> Result<ShowResult, ProviderError> {
        debug!("az {} show {}", spec.kind, spec.name);
        let out = az(&show_args(spec)).map_err(Error::from)?;
        if out.success {
            let endpoint = endpoint_of(spec.kind, &out.stdout).map_err(Error::from)?;
            Ok(ShowResult::Present { endpoint })
        } else if is_not_found(&out.stderr) {
            Ok(ShowResult::Absent)
        } else {
            Err(Error::Az {
                verb: format!("{} show", spec.kind),
                name: spec.name.clone(),
                code: out.code,
                stderr: out.stderr,
            }
            .into())
        }
    }

    fn create(&self, spec: &ResourceSpec) -> Result<Option<Endpoint>, ProviderError> {
        Ok(self.create_resource(spec)?)
    }

    fn ensure_firewall_rule(&self, spec: &ResourceSpec, rule: &str) -> Result<(), ProviderError> {
        debug!("az firewall-rule create {} on {}", rule, spec.name);
        let out = az(&[
            "mysql",
            "flexible-server",
            "firewall-rule",
            "create",
            "--name",
            &spec.name,
            "--resource-group",
            &spec.resource_group,
            "--rule-name",
            rule,
            // 0.0.0.0-0.0.0.0 is the provider's marker for "Azure services only"
            "--start-ip-address",
            "0.0.0.0",
            "--end-ip-address",
            "0.0.0.0",
        ])
        .map_err(Error::from)?;

        // A rule that is already in place is convergence, not failure.
        if out.success || out.stderr.contains("already exists") {
            Ok(())
        } else {
            Err(Error::Az {
                verb: "firewall-rule create".into(),
                name: rule.to_string(),
                code: out.code,
                stderr: out.stderr,
            }
            .into())
        }
    }
}

impl ServiceControl for AzCli {
    fn current_image(&self, target: &ReleaseTarget) -> Result<Option<String>, ProviderError> {
        debug!("az webapp config show {}", target.service_name);
        let out = az(&[
            "webapp",
            "config",
            "show",
            "--name",
            &target.service_name,
            "--resource-group",
            &target.resource_group,
        ])
        .map_err(Error::from)?;
        if !out.success {
            return Err(Error::Az {
                verb: "webapp config show".into(),
                name: target.service_name.clone(),
                code: out.code,
                stderr: out.stderr,
            }
            .into());
        }
        let body: serde_json::Value =
            serde_json::from_str(&out.stdout).map_err(Error::from)?;
        Ok(body
            .get("linuxFxVersion")
            .and_then(|v| v.as_str())
            .and_then(|v| v.strip_prefix("DOCKER|"))
            .map(str::to_string))
    }

    fn apply_settings(&self, target: &ReleaseTarget, env: &[EnvVar]) -> Result<(), ProviderError> {
        // Settings go through a temp file rather than the command line so
        // secret values never show up in a process listing.
        let settings: Vec<serde_json::Value> = env
            .iter()
            .map(|var| {
                serde_json::json!({
                    "name": var.name,
                    "value": var.value.expose(),
                    "slotSetting": false,
                })
            })
            .collect();

        let mut file = tempfile::NamedTempFile::new().map_err(Error::from)?;
        serde_json::to_writer(&mut file, &settings).map_err(Error::from)?;
        file.flush().map_err(Error::from)?;
        let at_file = format!("@{}", file.path().display());

        debug!(
            "az webapp config appsettings set {} ({} settings)",
            target.service_name,
            env.len()
        );
        let out = az(&[
            "webapp",
            "config",
            "appsettings",
            "set",
            "--name",
            &target.service_name,
            "--resource-group",
            &target.resource_group,
            "--settings",
            &at_file,
        ])
        .map_err(Error::from)?;
        if out.success {
            Ok(())
        } else {
            Err(Error::Az {
                verb: "webapp config appsettings set".into(),
                name: target.service_name.clone(),
                code: out.code,
                stderr: out.stderr,
            }
            .into())
        }
    }

    fn set_image(&self, target: &ReleaseTarget, image_ref: &str) -> Result<(), ProviderError> {
        debug!("az webapp config container set {} -> {image_ref}", target.service_name);
        let out = az(&[
            "webapp",
            "config",
            "container",
            "set",
            "--name",
            &target.service_name,
            "--resource-group",
            &target.resource_group,
            "--container-image-name",
            image_ref,
        ])
        .map_err(Error::from)?;
        if out.success {
            Ok(())
        } else {
            Err(Error::Az {
                verb: "webapp config container set".into(),
                name: target.service_name.clone(),
                code: out.code,
                stderr: out.stderr,
            }
            .into())
        }
    }

    fn restart(&self, target: &ReleaseTarget) -> Result<(), ProviderError> {
        debug!("az webapp restart {}", target.service_name);
        let out = az(&[
            "webapp",
            "restart",
            "--name",
            &target.service_name,
            "--resource-group",
            &target.resource_group,
        ])
        .map_err(Error::from)?;
        if out.success {
            Ok(())
        } else {
            Err(Error::Az {
                verb: "webapp restart".into(),
                name: target.service_name.clone(),
                code: out.code,
                stderr: out.stderr,
            }
            .into())
        }
    }
}
