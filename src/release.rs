use log::{debug, info};
use thiserror::Error;

use crate::config::runtime::Config;
use crate::config::Secret;
use crate::docker::ImageArtifact;
use crate::provision::{ProviderError, ProvisionResult};
use crate::spec::ResourceKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("release of {service} failed: {err}")]
    Release { service: String, err: ProviderError },
}

/// One application setting on the release target. Sensitive values are
/// rendered redacted everywhere except on the wire to the provider.
#[derive(Debug, Clone)]
pub struct EnvVar {
    pub name: String,
    pub value: Secret,
    pub sensitive: bool,
}

impl EnvVar {
    pub fn plain(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: Secret::new(value),
            sensitive: false,
        }
    }

    pub fn sensitive(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: Secret::new(value),
            sensitive: true,
        }
    }

    /// Log-safe rendering.
    pub fn describe(&self) -> String {
        if self.sensitive {
            format!("{}=***", self.name)
        } else {
            format!("{}={}", self.name, self.value.expose())
        }
    }
}

/// The deployed service instance, as this run wants it to look.
#[derive(Debug, Clone)]
pub struct ReleaseTarget {
    pub service_name: String,
    pub resource_group: String,
    pub current_image_ref: Option<String>,
    pub environment: Vec<EnvVar>,
}

/// The update/restart surface of the compute service.
/// Implemented against the `az` CLI in production and faked in tests.
pub trait ServiceControl {
    fn current_image(&self, target: &ReleaseTarget) -> Result<Option<String>, ProviderError>;

    fn apply_settings(&self, target: &ReleaseTarget, env: &[EnvVar]) -> Result<(), ProviderError>;

    fn set_image(&self, target: &ReleaseTarget, image_ref: &str) -> Result<(), ProviderError>;

    fn restart(&self, target: &ReleaseTarget) -> Result<(), ProviderError>;
}

/// Point the service at a new artifact and restart it.
///
/// Re-releasing the image the service already runs is a reported success
/// without touching the provider again, so repeated invocations are safe.
/// Migrations and other release-time side effects are deliberately left to
/// the application's own startup sequence.
pub fn release(
    ctl: &dyn ServiceControl,
    mut target: ReleaseTarget,
    artifact: &ImageArtifact,
) -> Result<ReleaseTarget, Error> {
    let service = target.service_name.clone();
    let wrap = move |err: ProviderError| Error::Release {
        service: service.clone(),
        err,
    };

    let current = ctl.current_image(&target).map_err(&wrap)?;
    if current.as_deref() == Some(artifact.registry_ref.as_str()) {
        info!(
            "{} already runs {}, nothing to release",
            target.service_name, artifact.registry_ref
        );
        target.current_image_ref = Some(artifact.registry_ref.clone());
        return Ok(target);
    }

    for var in &target.environment {
        debug!("setting {}", var.describe());
    }
    ctl.apply_settings(&target, &target.environment).map_err(&wrap)?;
    ctl.set_image(&target, &artifact.registry_ref).map_err(&wrap)?;
    ctl.restart(&target).map_err(&wrap)?;

    info!(
        "{} released with image {}",
        target.service_name, artifact.registry_ref
    );
    target.current_image_ref = Some(artifact.registry_ref.clone());
    Ok(target)
}

/// Translate provisioned endpoints into the application's environment.
/// Consumes the provisioning results of the same run; endpoints of failed
/// resources are simply absent.
pub fn app_settings(cfg: &Config, results: &[ProvisionResult]) -> Vec<EnvVar> {
    let endpoint = |kind: ResourceKind| {
        results
            .iter()
            .find(|r| r.kind == kind && r.ok())
            .and_then(|r| r.endpoint.clone())
    };

    let mut env = vec![
        EnvVar::plain("APP_ENV", "production"),
        EnvVar::plain("WEBSITES_PORT", "80"),
        EnvVar::plain("DB_CONNECTION", "mysql"),
        EnvVar::plain("DB_PORT", "3306"),
        EnvVar::plain("DB_DATABASE", &cfg.database_name),
        EnvVar::plain("DB_USERNAME", &cfg.database_admin_user),
    ];

    if let Some(host) = endpoint(ResourceKind::ManagedDatabase) {
        env.push(EnvVar::plain("DB_HOST", host));
    }
    if let Some(host) = endpoint(ResourceKind::ManagedCache) {
        env.push(EnvVar::plain("REDIS_HOST", host));
        env.push(EnvVar::plain("REDIS_PORT", "6380"));
    }
    if let Some(password) = &cfg.database_admin_password {
        env.push(EnvVar::sensitive("DB_PASSWORD", password.expose()));
    }

    env
}

#[cfg(test)]
pub mod test {
    use super::*;
    use std::sync::Mutex;

    /// In-memory service control recording every mutation.
    #[derive(Default)]
    pub struct FakeServiceControl {
        pub image: Mutex<Option<String>>,
        pub set_image_calls: Mutex<u32>,
        pub restart_calls: Mutex<u32>,
        pub settings: Mutex<Vec<String>>,
    }

    impl ServiceControl for FakeServiceControl {
        fn current_image(&self, _: &ReleaseTarget) -> Result<Option<String>, ProviderError> {
            Ok(self.image.lock().unwrap().clone())
        }

        fn apply_settings(&self, _: &ReleaseTarget, env: &[EnvVar]) -> Result<(), ProviderError> {
            *self.settings.lock().unwrap() = env.iter().map(|v| v.name.clone()).collect();
            Ok(())
        }

        fn set_image(&self, _: &ReleaseTarget, image_ref: &str) -> Result<(), ProviderError> {
            *self.set_image_calls.lock().unwrap() += 1;
            *self.image.lock().unwrap() = Some(image_ref.to_string());
            Ok(())
        }

        fn restart(&self, _: &ReleaseTarget) -> Result<(), ProviderError> {
            *self.restart_calls.lock().unwrap() += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::FakeServiceControl;
    use super::*;

    use crate::docker::Role;

    fn artifact() -> ImageArtifact {
        ImageArtifact {
            role: Role::Application,
            registry_ref: "shopacr.azurecr.io/shop-api-app:v1".into(),
            tag: "v1".into(),
            historical_ref: None,
        }
    }

    fn target() -> ReleaseTarget {
        ReleaseTarget {
            service_name: "shop-api-web".into(),
            resource_group: "shop-api-rg".into(),
            current_image_ref: None,
            environment: vec![EnvVar::plain("APP_ENV", "production")],
        }
    }

    #[test]
    fn release_is_idempotent() {
        let ctl = FakeServiceControl::default();

        let first = release(&ctl, target(), &artifact()).unwrap();
        assert_eq!(
            first.current_image_ref.as_deref(),
            Some("shopacr.azurecr.io/shop-api-app:v1")
        );

        let second = release(&ctl, first, &artifact()).unwrap();
        assert_eq!(
            second.current_image_ref.as_deref(),
            Some("shopacr.azurecr.io/shop-api-app:v1")
        );

        // the second call was a no-op: one image update, one restart
        assert_eq!(*ctl.set_image_calls.lock().unwrap(), 1);
        assert_eq!(*ctl.restart_calls.lock().unwrap(), 1);
    }

    #[test]
    fn release_applies_settings_before_restart() {
        let ctl = FakeServiceControl::default();
        release(&ctl, target(), &artifact()).unwrap();
        assert_eq!(ctl.settings.lock().unwrap().as_slice(), &["APP_ENV"]);
    }

    #[test]
    fn sensitive_settings_are_redacted_in_logs() {
        let var = EnvVar::sensitive("DB_PASSWORD", "hunter2");
        assert_eq!(var.describe(), "DB_PASSWORD=***");
        assert!(!format!("{var:?}").contains("hunter2"));

        let plain = EnvVar::plain("DB_PORT", "3306");
        assert_eq!(plain.describe(), "DB_PORT=3306");
    }

    #[test]
    fn app_settings_wire_provisioned_endpoints() {
        use crate::config::{file, runtime, Secret};
        use crate::provision::ProvisionResult;

        let mut cfg = runtime::Config::new(&file::File::default(), Some("shop-api")).unwrap();
        cfg.database_admin_password = Some(Secret::new("s3cret"));

        let results = vec![
            ProvisionResult {
                kind: ResourceKind::ManagedDatabase,
                name: "shop-api-mysql".into(),
                already_existed: true,
                endpoint: Some("shop-api-mysql.mysql.database.azure.com".into()),
                error: None,
            },
            ProvisionResult {
                kind: ResourceKind::ManagedCache,
                name: "shop-api-redis".into(),
                already_existed: false,
                endpoint: Some("shop-api-redis.redis.cache.windows.net".into()),
                error: None,
            },
        ];

        let env = app_settings(&cfg, &results);
        let get = |name: &str| {
            env.iter()
                .find(|v| v.name == name)
                .map(|v| v.value.expose().to_string())
        };
        assert_eq!(
            get("DB_HOST").as_deref(),
            Some("shop-api-mysql.mysql.database.azure.com")
        );
        assert_eq!(
            get("REDIS_HOST").as_deref(),
            Some("shop-api-redis.redis.cache.windows.net")
        );
        assert_eq!(get("DB_PASSWORD").as_deref(), Some("s3cret"));
        assert!(env.iter().find(|v| v.name == "DB_PASSWORD").unwrap().sensitive);
    }

    #[test]
    fn app_settings_skip_failed_resources() {
        use crate::config::{file, runtime};

        let cfg = runtime::Config::new(&file::File::default(), Some("shop-api")).unwrap();
        let results = vec![ProvisionResult {
            kind: ResourceKind::ManagedDatabase,
            name: "shop-api-mysql".into(),
            already_existed: false,
            endpoint: None,
            error: Some("quota exceeded".into()),
        }];

        let env = app_settings(&cfg, &results);
        assert!(env.iter().all(|v| v.name != "DB_HOST"));
    }
}
