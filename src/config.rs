/// A string that must never end up in logs or error text.
///
/// Debug and Display render a placeholder; the actual value is only
/// reachable through [`Secret::expose`].
#[derive(Clone, PartialEq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

pub mod file {
    use serde::Deserialize;
    use serde_inline_default::serde_inline_default;
    use thiserror::Error;

    const DEFAULT_CONFIG: &str = include_str!("../default.toml");

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("read {path}: {err}")]
        ReadFile { err: std::io::Error, path: String },

        #[error("parse: {0}")]
        Parse(#[from] toml::de::Error),
    }

    /// A deploy.toml file.
    #[derive(Deserialize, Debug, Clone)]
    pub struct File {
        pub description: Option<String>,
        pub app: Option<String>,
        #[serde(default)]
        pub azure: Azure,
        #[serde(default)]
        pub database: Database,
        #[serde(default)]
        pub health: Health,
    }

    impl Default for File {
        fn default() -> Self {
            // The default config is compiled into the program, so
            // make sure to test default() to catch panics compile-time.
            toml::from_str(DEFAULT_CONFIG).unwrap()
        }
    }

    impl File {
        /// Parse a user configuration file and overlay it on the built-in
        /// `default.toml`. Values the user omits keep their defaults.
        pub fn default_with_user_config_file(path: &str) -> Result<Self, Error> {
            let data = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
                err,
                path: path.to_string(),
            })?;
            let defaults: toml::Value = toml::from_str(DEFAULT_CONFIG)?;
            let user: toml::Value = toml::from_str(&data)?;
            let merged = merge(defaults, user);
            Ok(merged.try_into()?)
        }
    }

    fn merge(base: toml::Value, overlay: toml::Value) -> toml::Value {
        match (base, overlay) {
            (toml::Value::Table(mut base), toml::Value::Table(overlay)) => {
                for (key, value) in overlay {
                    let merged = match base.remove(&key) {
                        Some(existing) => merge(existing, value),
                        None => value,
                    };
                    base.insert(key, merged);
                }
                toml::Value::Table(base)
            }
            (_, overlay) => overlay,
        }
    }

    #[serde_inline_default]
    #[derive(Deserialize, Debug, Clone)]
    pub struct Azure {
        #[serde_inline_default("westeurope".into())]
        pub region: String,
        #[serde_inline_default("Basic".into())]
        pub registry_sku: String,
        #[serde_inline_default("Standard_B1ms".into())]
        pub database_sku: String,
        #[serde_inline_default(32)]
        pub database_storage_gb: u32,
        #[serde_inline_default("Basic".into())]
        pub cache_sku: String,
        #[serde_inline_default("c0".into())]
        pub cache_vm_size: String,
        #[serde_inline_default("B1".into())]
        pub plan_sku: String,
    }

    impl Default for Azure {
        fn default() -> Self {
            toml::from_str("").unwrap()
        }
    }

    #[serde_inline_default]
    #[derive(Deserialize, Debug, Clone)]
    pub struct Database {
        #[serde_inline_default("appadmin".into())]
        pub admin_user: String,
        #[serde_inline_default("appdb".into())]
        pub name: String,
    }

    impl Default for Database {
        fn default() -> Self {
            toml::from_str("").unwrap()
        }
    }

    #[serde_inline_default]
    #[derive(Deserialize, Debug, Clone)]
    pub struct Health {
        #[serde_inline_default(10)]
        pub max_attempts: u32,
        #[serde_inline_default(15)]
        pub interval_seconds: u64,
        #[serde_inline_default(5)]
        pub probe_timeout_seconds: u64,
    }

    impl Default for Health {
        fn default() -> Self {
            toml::from_str("").unwrap()
        }
    }
}

pub mod runtime {
    use std::time::Duration;

    use thiserror::Error;

    use super::file;
    use super::Secret;

    /// Environment variable holding the database administrator password.
    /// Only ever read from the environment; never part of any config file.
    pub const DB_PASSWORD_ENV: &str = "AZURE_DB_ADMIN_PASSWORD";

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("application name not set; pass --app or set `app` in deploy.toml")]
        MissingAppName,
    }

    /// Fully resolved configuration for one orchestration run.
    /// Built once at startup and passed explicitly; nothing here is mutated.
    #[derive(Debug, Clone)]
    pub struct Config {
        pub app: String,
        pub region: String,
        pub resource_group: String,
        pub registry: String,
        pub database_server: String,
        pub cache: String,
        pub plan: String,
        pub service: String,
        pub registry_sku: String,
        pub database_sku: String,
        pub database_storage_gb: u32,
        pub cache_sku: String,
        pub cache_vm_size: String,
        pub plan_sku: String,
        pub database_name: String,
        pub database_admin_user: String,
        pub database_admin_password: Option<Secret>,
        pub health: Health,
    }

    #[derive(Debug, Clone)]
    pub struct Health {
        pub max_attempts: u32,
        pub interval: Duration,
        pub probe_timeout: Duration,
    }

    impl Config {
        pub fn new(cfg: &file::File, app_override: Option<&str>) -> Result<Self, Error> {
            let app = app_override
                .map(str::to_string)
                .or_else(|| cfg.app.clone())
                .ok_or(Error::MissingAppName)?;

            let password = std::env::var(DB_PASSWORD_ENV).ok().map(Secret::new);

            Ok(Self {
                region: cfg.azure.region.clone(),
                resource_group: format!("{app}-rg"),
                registry: registry_name(&app),
                database_server: format!("{app}-mysql"),
                cache: format!("{app}-redis"),
                plan: format!("{app}-plan"),
                service: format!("{app}-web"),
                registry_sku: cfg.azure.registry_sku.clone(),
                database_sku: cfg.azure.database_sku.clone(),
                database_storage_gb: cfg.azure.database_storage_gb,
                cache_sku: cfg.azure.cache_sku.clone(),
                cache_vm_size: cfg.azure.cache_vm_size.clone(),
                plan_sku: cfg.azure.plan_sku.clone(),
                database_name: cfg.database.name.clone(),
                database_admin_user: cfg.database.admin_user.clone(),
                database_admin_password: password,
                health: Health {
                    max_attempts: cfg.health.max_attempts,
                    interval: Duration::from_secs(cfg.health.interval_seconds),
                    probe_timeout: Duration::from_secs(cfg.health.probe_timeout_seconds),
                },
                app,
            })
        }
    }

    /// Registry names must be lowercase alphanumeric, so the app name is
    /// squeezed rather than hyphenated like the other derived names.
    fn registry_name(app: &str) -> String {
        let squeezed: String = app
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        format!("{squeezed}acr")
    }
}

#[cfg(test)]
pub mod test {
    use super::runtime;

    #[test]
    pub fn load_default_configuration() {
        let cfg = super::file::File::default();
        assert_eq!(cfg.description, Some("Default configuration file".into()));
        assert_eq!(cfg.health.max_attempts, 10);
        assert_eq!(cfg.azure.region, "westeurope");
    }

    #[test]
    pub fn user_config_overlays_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "app = \"shop-api\"\n[health]\nmax_attempts = 3\n").unwrap();
        let cfg =
            super::file::File::default_with_user_config_file(f.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.app, Some("shop-api".into()));
        assert_eq!(cfg.health.max_attempts, 3);
        // untouched sections keep their defaults
        assert_eq!(cfg.health.interval_seconds, 15);
        assert_eq!(cfg.azure.region, "westeurope");
    }

    #[test]
    pub fn derived_resource_names() {
        let file = super::file::File::default();
        let cfg = runtime::Config::new(&file, Some("shop-api")).unwrap();
        assert_eq!(cfg.resource_group, "shop-api-rg");
        assert_eq!(cfg.registry, "shopapiacr");
        assert_eq!(cfg.database_server, "shop-api-mysql");
        assert_eq!(cfg.service, "shop-api-web");
    }

    #[test]
    pub fn app_name_required() {
        let file = super::file::File::default();
        assert!(runtime::Config::new(&file, None).is_err());
    }

    #[test]
    pub fn secret_is_redacted() {
        let secret = super::Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(format!("{}", secret), "***");
        assert_eq!(secret.expose(), "hunter2");
    }
}
