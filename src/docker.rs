use std::fmt::{Display, Formatter};
use std::io::Write;
use std::process::{ExitStatus, Stdio};

use log::{debug, info};
use thiserror::Error;

use crate::compose::BuildContext;
use crate::docker::Error::IOError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("registry authentication failed: {0}")]
    Auth(String),

    #[error("docker build failed with exit code {0}")]
    Build(ExitStatus),

    #[error("docker login failed with exit code {0}")]
    Login(ExitStatus),

    #[error("docker logout failed with exit code {0}")]
    Logout(ExitStatus),

    #[error("docker tag failed with exit code {0}")]
    Tag(ExitStatus),

    #[error("docker push failed with exit code {0}")]
    Push(ExitStatus),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// The two images every release consists of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Application,
    EdgeProxy,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Application => "application",
            Role::EdgeProxy => "edge-proxy",
        })
    }
}

impl Role {
    /// Short repository suffix, e.g. `shopacr.azurecr.io/shop-api-app`.
    fn repository_suffix(&self) -> &'static str {
        match self {
            Role::Application => "app",
            Role::EdgeProxy => "proxy",
        }
    }
}

/// A built and pushed image. Immutable once pushed; the release controller
/// references it but never owns it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImageArtifact {
    pub role: Role,
    pub registry_ref: String,
    pub tag: String,
    /// Unique content tag pushed alongside a rolling tag, so the previous
    /// release stays referencable for manual rollback.
    pub historical_ref: Option<String>,
}

pub mod name {
    use super::Role;
    use std::fmt::{Display, Formatter};

    /// Everything needed to produce a fully qualified image reference.
    #[derive(Debug, Clone)]
    pub struct Config {
        pub registry: String,
        pub app: String,
        pub role: Role,
        pub tag: String,
    }

    impl Display for Config {
        fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
            f.write_fmt(format_args!(
                "{}/{}-{}:{}",
                self.registry,
                self.app,
                self.role.repository_suffix(),
                self.tag
            ))
        }
    }
}

pub mod tag {
    use std::process::Command;

    /// Generate a unique tag for the working tree: the git short SHA when
    /// available, otherwise a timestamp.
    pub fn generate(filesystem_path: &str) -> String {
        let git = Command::new("git")
            .args(["rev-parse", "--short=12", "HEAD"])
            .current_dir(filesystem_path)
            .output();

        if let Ok(output) = git {
            if output.status.success() {
                let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !sha.is_empty() {
                    return sha;
                }
            }
        }

        chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
    }
}

/// Exchange the ambient az session for a registry token and log docker in.
/// Called before any build so a bad login fails fast instead of after an
/// expensive image build.
pub fn authenticate(registry_name: &str, login_server: &str) -> Result<(), Error> {
    debug!("Requesting registry token for {registry_name}");
    let output = std::process::Command::new("az")
        .args(["acr", "login", "--name", registry_name, "--expose-token"])
        .args(["--output", "json"])
        .output()?;

    if !output.status.success() {
        return Err(Error::Auth(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let body: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|err| Error::Auth(format!("unparseable token response: {err}")))?;
    let token = body
        .get("accessToken")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Auth("token response without accessToken".into()))?;

    // ACR's well-known username for token logins.
    login(login_server, "00000000-0000-0000-0000-000000000000", token)
}

pub fn login(registry: &str, username: &str, token: &str) -> Result<(), Error> {
    debug!("Logging in to Docker registry {}", registry);
    let mut child = std::process::Command::new("docker")
        .arg("login")
        .arg(registry)
        .arg("--username")
        .arg(username)
        .arg("--password-stdin")
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(IOError)?;

    child.stdin.as_mut().unwrap().write_all(token.as_bytes())?;
    let status = child.wait_with_output()?.status;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Login(status))
    }
}

pub fn logout(registry: &str) -> Result<(), Error> {
    std::process::Command::new("docker")
        .arg("logout")
        .arg(registry)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map(|exit_status| {
            if exit_status.success() {
                Ok(())
            } else {
                Err(Error::Logout(exit_status))
            }
        })?
}

pub fn build(context: &BuildContext, image_ref: &str) -> Result<(), Error> {
    debug!("Building {} image as {}", context.role, image_ref);
    let mut command = std::process::Command::new("docker");
    command.arg("build");
    if let Some(dockerfile) = &context.dockerfile {
        command.arg("--file").arg(dockerfile);
    }
    command
        .arg("--tag")
        .arg(image_ref)
        .arg(&context.context)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map(|exit_status| {
            if exit_status.success() {
                Ok(())
            } else {
                Err(Error::Build(exit_status))
            }
        })?
}

pub fn retag(source_ref: &str, target_ref: &str) -> Result<(), Error> {
    std::process::Command::new("docker")
        .arg("tag")
        .arg(source_ref)
        .arg(target_ref)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map(|exit_status| {
            if exit_status.success() {
                Ok(())
            } else {
                Err(Error::Tag(exit_status))
            }
        })?
}

pub fn push(image_name: &str) -> Result<(), Error> {
    debug!("Pushing image {}", image_name);
    std::process::Command::new("docker")
        .arg("push")
        .arg(image_name)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map(|exit_status| {
            if exit_status.success() {
                Ok(())
            } else {
                Err(Error::Push(exit_status))
            }
        })?
}

/// Build one role's image from its compose build context and push it.
///
/// When the caller ships a rolling `latest` tag, a unique historical tag is
/// pushed as well so the rolling tag never becomes the only reference to a
/// release. Push failures are terminal; there is no automatic retry.
pub fn build_and_push(context: &BuildContext, cfg: name::Config) -> Result<ImageArtifact, Error> {
    let image_ref = cfg.to_string();

    build(context, &image_ref)?;
    push(&image_ref)?;

    let historical_ref = if cfg.tag == "latest" {
        let unique = name::Config {
            tag: tag::generate(&context.context),
            ..cfg.clone()
        }
        .to_string();
        retag(&image_ref, &unique)?;
        push(&unique)?;
        Some(unique)
    } else {
        None
    };

    info!("Pushed {} image {}", context.role, image_ref);
    Ok(ImageArtifact {
        role: context.role,
        registry_ref: image_ref,
        tag: cfg.tag,
        historical_ref,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_reference_format() {
        let cfg = name::Config {
            registry: "shopacr.azurecr.io".into(),
            app: "shop-api".into(),
            role: Role::Application,
            tag: "v1".into(),
        };
        assert_eq!(cfg.to_string(), "shopacr.azurecr.io/shop-api-app:v1");

        let proxy = name::Config {
            role: Role::EdgeProxy,
            tag: "latest".into(),
            ..cfg
        };
        assert_eq!(proxy.to_string(), "shopacr.azurecr.io/shop-api-proxy:latest");
    }

    #[test]
    fn tag_falls_back_to_timestamp_outside_git() {
        let dir = tempfile::tempdir().unwrap();
        let tag = tag::generate(dir.path().to_str().unwrap());
        assert_eq!(tag.len(), 14);
        assert!(tag.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn role_names() {
        assert_eq!(Role::Application.to_string(), "application");
        assert_eq!(Role::EdgeProxy.to_string(), "edge-proxy");
    }
}
