use log::debug;
use thiserror::Error;

use crate::docker::Role;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no docker-compose file found")]
    ComposeNotFound,

    #[error("read {path}: {err}")]
    ReadFile { err: std::io::Error, path: String },

    #[error("deserialize: {0}")]
    Deserialize(#[from] serde_yaml::Error),

    #[error("no buildable {0} service in compose file")]
    MissingService(Role),
}

/// Where to build one image role from.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildContext {
    pub role: Role,
    pub service: String,
    pub context: String,
    pub dockerfile: Option<String>,
}

/// The two buildable services discovered in the project's compose file.
#[derive(Debug)]
pub struct Services {
    pub application: BuildContext,
    pub edge_proxy: BuildContext,
}

/// Returns the path of the first and best detected compose file.
pub fn detect_compose_file(filesystem_path: &str) -> Result<String, Error> {
    let candidates = [
        "docker-compose.yml",
        "docker-compose.yaml",
        "compose.yml",
        "compose.yaml",
    ];

    candidates
        .iter()
        .map(|name| format!("{filesystem_path}/{name}"))
        .inspect(|path| debug!("Possible compose file candidate: {path}"))
        .find(|path| {
            std::fs::metadata(path)
                .map(|metadata| metadata.is_file())
                .unwrap_or(false)
        })
        .ok_or(Error::ComposeNotFound)
}

impl Services {
    pub fn parse(yaml_string: &str) -> Result<Self, Error> {
        let parsed = serde_yaml::from_str::<yaml::Compose>(yaml_string)?;
        Ok(Self {
            application: find_role(&parsed, Role::Application)?,
            edge_proxy: find_role(&parsed, Role::EdgeProxy)?,
        })
    }

    pub fn parse_file(path: &str) -> Result<Self, Error> {
        Self::parse(
            &std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
                err,
                path: path.to_string(),
            })?,
        )
    }
}

/// Service names that conventionally carry each role in a compose file.
fn candidate_names(role: Role) -> &'static [&'static str] {
    match role {
        Role::Application => &["app", "php", "application", "backend", "api"],
        Role::EdgeProxy => &["nginx", "proxy", "edge", "web", "webserver"],
    }
}

fn find_role(compose: &yaml::Compose, role: Role) -> Result<BuildContext, Error> {
    for name in candidate_names(role) {
        if let Some(service) = compose.services.get(*name) {
            if let Some(build) = &service.build {
                let (context, dockerfile) = match build {
                    yaml::Build::Context(context) => (context.clone(), None),
                    yaml::Build::Detailed { context, dockerfile } => {
                        (context.clone(), dockerfile.clone())
                    }
                };
                debug!("{role} role mapped to compose service {name}");
                return Ok(BuildContext {
                    role,
                    service: name.to_string(),
                    context,
                    dockerfile,
                });
            }
        }
    }
    Err(Error::MissingService(role))
}

mod yaml {
    use std::collections::BTreeMap;

    use serde::Deserialize;

    #[derive(Deserialize)]
    pub struct Compose {
        pub services: BTreeMap<String, Service>,
    }

    #[derive(Deserialize)]
    pub struct Service {
        pub build: Option<Build>,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub enum Build {
        Context(String),
        Detailed {
            context: String,
            dockerfile: Option<String>,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPOSE: &str = r#"
services:
  app:
    build:
      context: .
      dockerfile: docker/php/Dockerfile
    environment:
      APP_ENV: local
  nginx:
    build:
      context: .
      dockerfile: docker/nginx/Dockerfile
    ports:
      - "8080:80"
  mysql:
    image: mysql:8.0
"#;

    #[test]
    fn discovers_both_roles() {
        let services = Services::parse(COMPOSE).unwrap();
        assert_eq!(services.application.service, "app");
        assert_eq!(
            services.application.dockerfile.as_deref(),
            Some("docker/php/Dockerfile")
        );
        assert_eq!(services.edge_proxy.service, "nginx");
        assert_eq!(services.edge_proxy.context, ".");
    }

    #[test]
    fn build_as_plain_string() {
        let services = Services::parse(
            "services:\n  app:\n    build: ./src\n  nginx:\n    build: ./docker/nginx\n",
        )
        .unwrap();
        assert_eq!(services.application.context, "./src");
        assert_eq!(services.application.dockerfile, None);
    }

    #[test]
    fn image_only_services_are_not_buildable() {
        // nginx present but pulled, not built
        let err = Services::parse("services:\n  app:\n    build: .\n  nginx:\n    image: nginx:1\n")
            .unwrap_err();
        match err {
            Error::MissingService(role) => assert_eq!(role, Role::EdgeProxy),
            other => panic!("expected MissingService, got {other}"),
        }
    }

    #[test]
    fn detect_prefers_docker_compose_yml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("docker-compose.yml"), COMPOSE).unwrap();
        std::fs::write(dir.path().join("compose.yaml"), COMPOSE).unwrap();
        let found = detect_compose_file(dir.path().to_str().unwrap()).unwrap();
        assert!(found.ends_with("docker-compose.yml"));
    }

    #[test]
    fn detect_fails_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            detect_compose_file(dir.path().to_str().unwrap()),
            Err(Error::ComposeNotFound)
        ));
    }
}
