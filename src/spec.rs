use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::config::runtime::Config;
use crate::config::Secret;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} name {name:?} is invalid: {reason}")]
    InvalidName {
        kind: ResourceKind,
        name: String,
        reason: &'static str,
    },

    #[error("database admin password not set; export AZURE_DB_ADMIN_PASSWORD")]
    MissingDatabasePassword,

    #[error("resource {name} depends on unknown resource {dependency}")]
    UnknownDependency { name: String, dependency: String },

    #[error("dependency cycle involving resource {0}")]
    DependencyCycle(String),
}

/// The kinds of infrastructure this orchestrator knows how to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    ResourceGroup,
    ContainerRegistry,
    ManagedDatabase,
    ManagedCache,
    ComputePlan,
    WebService,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ResourceKind::ResourceGroup => "resource-group",
            ResourceKind::ContainerRegistry => "container-registry",
            ResourceKind::ManagedDatabase => "managed-database",
            ResourceKind::ManagedCache => "managed-cache",
            ResourceKind::ComputePlan => "compute-plan",
            ResourceKind::WebService => "web-service",
        })
    }
}

/// Declarative description of one piece of infrastructure.
/// Constructed once per run, compared against live provider state, never mutated.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub name: String,
    pub region: String,
    pub resource_group: String,
    pub params: Params,
    /// Names of specs that must be provisioned before this one.
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Params {
    ResourceGroup,
    ContainerRegistry {
        sku: String,
    },
    ManagedDatabase {
        sku: String,
        storage_gb: u32,
        database_name: String,
        admin_user: String,
        admin_password: Secret,
        firewall_rule: String,
    },
    ManagedCache {
        sku: String,
        vm_size: String,
    },
    ComputePlan {
        sku: String,
    },
    WebService {
        plan: String,
        registry: String,
    },
}

/// Build the ordered set of ResourceSpecs for one run from resolved config.
/// Pure; fails fast on naming-rule violations or missing credentials.
pub fn load(cfg: &Config) -> Result<Vec<ResourceSpec>, Error> {
    let admin_password = cfg
        .database_admin_password
        .clone()
        .ok_or(Error::MissingDatabasePassword)?;

    // Firewall rule names cap out at 80 characters on the provider side.
    let firewall_rule = hash_name_truncate(&cfg.app, "allow-azure", 80)
        .unwrap_or_else(|| "allow-azure-services".to_string());

    let group = cfg.resource_group.clone();
    let specs = vec![
        ResourceSpec {
            kind: ResourceKind::ResourceGroup,
            name: group.clone(),
            region: cfg.region.clone(),
            resource_group: group.clone(),
            params: Params::ResourceGroup,
            depends_on: vec![],
        },
        ResourceSpec {
            kind: ResourceKind::ContainerRegistry,
            name: cfg.registry.clone(),
            region: cfg.region.clone(),
            resource_group: group.clone(),
            params: Params::ContainerRegistry {
                sku: cfg.registry_sku.clone(),
            },
            depends_on: vec![group.clone()],
        },
        ResourceSpec {
            kind: ResourceKind::ManagedDatabase,
            name: cfg.database_server.clone(),
            region: cfg.region.clone(),
            resource_group: group.clone(),
            params: Params::ManagedDatabase {
                sku: cfg.database_sku.clone(),
                storage_gb: cfg.database_storage_gb,
                database_name: cfg.database_name.clone(),
                admin_user: cfg.database_admin_user.clone(),
                admin_password,
                firewall_rule,
            },
            depends_on: vec![group.clone()],
        },
        ResourceSpec {
            kind: ResourceKind::ManagedCache,
            name: cfg.cache.clone(),
            region: cfg.region.clone(),
            resource_group: group.clone(),
            params: Params::ManagedCache {
                sku: cfg.cache_sku.clone(),
                vm_size: cfg.cache_vm_size.clone(),
            },
            depends_on: vec![group.clone()],
        },
        ResourceSpec {
            kind: ResourceKind::ComputePlan,
            name: cfg.plan.clone(),
            region: cfg.region.clone(),
            resource_group: group.clone(),
            params: Params::ComputePlan {
                sku: cfg.plan_sku.clone(),
            },
            depends_on: vec![group.clone()],
        },
        ResourceSpec {
            kind: ResourceKind::WebService,
            name: cfg.service.clone(),
            region: cfg.region.clone(),
            resource_group: group.clone(),
            params: Params::WebService {
                plan: cfg.plan.clone(),
                registry: cfg.registry.clone(),
            },
            depends_on: vec![cfg.plan.clone(), cfg.registry.clone()],
        },
    ];

    for spec in &specs {
        validate_name(spec)?;
    }

    Ok(specs)
}

/// Group specs into waves where every spec's dependencies live in an
/// earlier wave. Specs within one wave are independent of each other.
pub fn waves(specs: &[ResourceSpec]) -> Result<Vec<Vec<ResourceSpec>>, Error> {
    let known: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
    for spec in specs {
        for dep in &spec.depends_on {
            if !known.contains(dep.as_str()) {
                return Err(Error::UnknownDependency {
                    name: spec.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut remaining: HashMap<&str, &ResourceSpec> =
        specs.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut placed: HashSet<String> = HashSet::new();
    let mut result = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<&ResourceSpec> = remaining
            .values()
            .filter(|s| s.depends_on.iter().all(|d| placed.contains(d)))
            .copied()
            .collect();

        if ready.is_empty() {
            // Nothing can make progress, so whatever remains is cyclic.
            let name = remaining.keys().min().unwrap_or(&"").to_string();
            return Err(Error::DependencyCycle(name));
        }

        let mut wave: Vec<ResourceSpec> = ready.into_iter().cloned().collect();
        wave.sort_by(|a, b| a.name.cmp(&b.name));
        for spec in &wave {
            remaining.remove(spec.name.as_str());
            placed.insert(spec.name.clone());
        }
        result.push(wave);
    }

    Ok(result)
}

fn validate_name(spec: &ResourceSpec) -> Result<(), Error> {
    let name = spec.name.as_str();
    let fail = |reason| {
        Err(Error::InvalidName {
            kind: spec.kind,
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return fail("name is empty");
    }

    match spec.kind {
        ResourceKind::ResourceGroup => {
            if name.len() > 90 {
                return fail("longer than 90 characters");
            }
            if name.ends_with('.') {
                return fail("must not end with a period");
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '(' | ')'))
            {
                return fail("allowed characters are alphanumerics, -, _, ., ( and )");
            }
        }
        ResourceKind::ContainerRegistry => {
            if name.len() < 5 || name.len() > 50 {
                return fail("must be 5-50 characters");
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            {
                return fail("must be lowercase alphanumeric");
            }
        }
        ResourceKind::ManagedDatabase => {
            if name.len() < 3 || name.len() > 63 {
                return fail("must be 3-63 characters");
            }
            if name.starts_with('-') || name.ends_with('-') {
                return fail("must not start or end with a hyphen");
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            {
                return fail("must be lowercase alphanumeric or hyphens");
            }
        }
        ResourceKind::ManagedCache | ResourceKind::ComputePlan | ResourceKind::WebService => {
            if name.len() > 60 {
                return fail("longer than 60 characters");
            }
            if name.starts_with('-') || name.ends_with('-') {
                return fail("must not start or end with a hyphen");
            }
            if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return fail("must be alphanumeric or hyphens");
            }
        }
    }

    Ok(())
}

/// Concatenate slug and prefix into `<PREFIX>-<TRUNCATED_SLUG>-<HASH>`, where:
/// * `PREFIX` is left as-is,
/// * `TRUNCATED_SLUG` is the part of the slug that still fits into the string after everything is assembled to the maximum length, and
/// * `HASH` is the first four characters of the hex-encoded SHA256 sum of the slug.
///
/// `max_length` must be at least `prefix_len` + 6, otherwise the length of the truncated slug
/// would end up below zero. In this case, `None` is returned.
pub fn hash_name_truncate(slug: &str, prefix: &str, max_length: usize) -> Option<String> {
    const HASH_LENGTH: usize = 4;
    let hashed_slug = sha256::digest(slug);
    let prefix_len = prefix.len() as isize;
    let slug_length = max_length as isize - prefix_len - HASH_LENGTH as isize - 2;
    if slug_length < 0 {
        return None;
    }
    let trimmed = truncate(slug, slug_length.max(0) as usize);
    let truncated = truncate(&hashed_slug, HASH_LENGTH);
    Some([prefix, trimmed, truncated].join("-"))
}

/// Helper function for truncating a string to at most `length` bytes
/// without panicking. The cut backs off to the nearest character boundary.
fn truncate(s: &str, length: usize) -> &str {
    if s.len() <= length {
        return s;
    }
    let mut end = length;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[0..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{file, runtime};

    fn test_config(app: &str) -> runtime::Config {
        let mut cfg = runtime::Config::new(&file::File::default(), Some(app)).unwrap();
        cfg.database_admin_password = Some(Secret::new("s3cret"));
        cfg
    }

    #[test]
    fn load_produces_full_resource_set() {
        let specs = load(&test_config("shop-api")).unwrap();
        assert_eq!(specs.len(), 6);
        assert_eq!(specs[0].kind, ResourceKind::ResourceGroup);
        let svc = specs
            .iter()
            .find(|s| s.kind == ResourceKind::WebService)
            .unwrap();
        assert_eq!(svc.depends_on, vec!["shop-api-plan", "shopapiacr"]);
    }

    #[test]
    fn load_requires_database_password() {
        let mut cfg = test_config("shop-api");
        cfg.database_admin_password = None;
        match load(&cfg) {
            Err(Error::MissingDatabasePassword) => {}
            other => panic!("expected MissingDatabasePassword, got {other:?}"),
        }
    }

    #[test]
    fn load_rejects_bad_registry_name() {
        let mut cfg = test_config("shop-api");
        cfg.registry = "Shop_API".into();
        match load(&cfg) {
            Err(Error::InvalidName { kind, .. }) => {
                assert_eq!(kind, ResourceKind::ContainerRegistry)
            }
            other => panic!("expected InvalidName, got {other:?}"),
        }
    }

    #[test]
    fn waves_respect_dependency_order() {
        let specs = load(&test_config("shop-api")).unwrap();
        let waves = waves(&specs).unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0].len(), 1);
        assert_eq!(waves[0][0].kind, ResourceKind::ResourceGroup);
        // registry, database, cache and plan are mutually independent
        assert_eq!(waves[1].len(), 4);
        assert_eq!(waves[2][0].kind, ResourceKind::WebService);
    }

    #[test]
    fn waves_detect_cycles() {
        let mut specs = load(&test_config("shop-api")).unwrap();
        // make the resource group depend on the web service
        specs[0].depends_on = vec!["shop-api-web".into()];
        match waves(&specs) {
            Err(Error::DependencyCycle(_)) => {}
            other => panic!("expected DependencyCycle, got {other:?}"),
        }
    }

    #[test]
    fn waves_reject_unknown_dependency() {
        let mut specs = load(&test_config("shop-api")).unwrap();
        specs[1].depends_on.push("no-such-resource".into());
        match waves(&specs) {
            Err(Error::UnknownDependency { dependency, .. }) => {
                assert_eq!(dependency, "no-such-resource")
            }
            other => panic!("expected UnknownDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_hash_name_truncate() {
        const MAX_LENGTH: usize = 30;
        let slug = "crm-arbeidsforhold-admin";
        let prefix = "gar";
        let expected = "gar-crm-arbeidsforhold-ad-4789";
        let result = hash_name_truncate(slug, prefix, MAX_LENGTH).unwrap();
        assert_eq!(result, expected);
        assert_eq!(result.len(), MAX_LENGTH);
    }

    #[test]
    fn test_hash_name_truncate_out_of_bounds() {
        const MAX_LENGTH: usize = 9;
        let slug = "very-long-slug-that-must-be-truncated";
        let prefix = "four";
        let result = hash_name_truncate(slug, prefix, MAX_LENGTH);
        assert_eq!(result, None);
    }

    #[test]
    fn test_hash_name_truncate_multibyte_slug() {
        let slug = "é".repeat(40);
        let result = hash_name_truncate(&slug, "allow-azure", 80).unwrap();
        assert!(result.len() <= 80);
        assert!(result.starts_with("allow-azure-é"));
    }
}
