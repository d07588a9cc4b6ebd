use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;
use warden_core::{
    decode::DEFAULT_MAX_DECOMPRESSED_BYTES,
    denial::{DEFAULT_GLOBAL_DENIAL_CAPACITY, DEFAULT_TENANT_DENIAL_CAPACITY},
    EnforcementConfig, EngineConfig, RegistryConfig, TenantLimits, TenantRegistry,
};

/// Environment variable naming the optional YAML settings file.
const CONFIG_PATH_ENV: &str = "WARDEN_CONFIG";

/// Process configuration: defaults, overridden by the YAML file named in
/// `WARDEN_CONFIG` (or `./warden.yaml`), overridden by `WARDEN_*`
/// environment variables (`WARDEN_ADMIN_LISTEN`, `WARDEN_DEFAULT_LIMITS__
/// SAMPLES_PER_SECOND`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// ext_authz gRPC listener.
    pub authz_listen: String,
    /// rate-limit-service gRPC listener.
    pub ratelimit_listen: String,
    /// Admin HTTP (and /metrics) listener.
    pub admin_listen: String,
    /// Header carrying the tenant identity. Matched case-insensitively.
    pub tenant_header: String,
    /// When false, skip payload decoding and count one sample per request.
    pub enforce_body_parsing: bool,
    /// Allow-by-default vs deny-by-default on extraction/parse failures.
    pub failure_mode_allow: bool,
    /// Global hard cap on body size, before per-tenant limits. 0 disables.
    pub max_request_bytes: u64,
    /// Ceiling on decompressed payload size.
    pub max_decompressed_bytes: u64,
    /// Hard cap on one gRPC message.
    pub max_grpc_message_bytes: usize,
    /// Maximum concurrent HTTP/2 streams per gRPC server; the in-flight
    /// decision semaphore is sized at twice this.
    pub max_concurrent_streams: u32,
    /// Graceful-shutdown drain budget in seconds.
    pub shutdown_grace_secs: u64,
    /// Limits applied to tenants discovered on first reference.
    pub default_limits: TenantLimits,
    /// Whether discovered tenants start enforced.
    pub default_enforcement_enabled: bool,
    pub tenant_denial_capacity: usize,
    pub global_denial_capacity: usize,
    /// Optional per-tenant overrides file (YAML map of tenant id to
    /// seed), applied at boot.
    pub overrides_file: Option<PathBuf>,
    /// Inline per-tenant seeds, applied after the overrides file.
    pub tenants: HashMap<String, TenantSeed>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            authz_listen: "0.0.0.0:50051".to_string(),
            ratelimit_listen: "0.0.0.0:50052".to_string(),
            admin_listen: "0.0.0.0:8080".to_string(),
            tenant_header: "x-scope-orgid".to_string(),
            enforce_body_parsing: true,
            failure_mode_allow: true,
            max_request_bytes: 0,
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
            max_grpc_message_bytes: 16 * 1024 * 1024,
            max_concurrent_streams: 512,
            shutdown_grace_secs: 30,
            default_limits: TenantLimits::default(),
            default_enforcement_enabled: false,
            tenant_denial_capacity: DEFAULT_TENANT_DENIAL_CAPACITY,
            global_denial_capacity: DEFAULT_GLOBAL_DENIAL_CAPACITY,
            overrides_file: None,
            tenants: HashMap::new(),
        }
    }
}

/// One tenant's boot-time configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSeed {
    pub limits: Option<TenantLimits>,
    pub enabled: Option<bool>,
    pub burst_pct_override: Option<f64>,
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&Settings::default())?);

        builder = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => builder.add_source(File::with_name(&path)),
            Err(_) => builder.add_source(File::with_name("warden").required(false)),
        };
        builder = builder.add_source(
            Environment::with_prefix("WARDEN")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .context("assembling configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        Ok(settings)
    }

    pub fn authz_addr(&self) -> anyhow::Result<SocketAddr> {
        self.authz_listen
            .parse()
            .with_context(|| format!("invalid authz_listen {:?}", self.authz_listen))
    }

    pub fn ratelimit_addr(&self) -> anyhow::Result<SocketAddr> {
        self.ratelimit_listen
            .parse()
            .with_context(|| format!("invalid ratelimit_listen {:?}", self.ratelimit_listen))
    }

    pub fn admin_addr(&self) -> anyhow::Result<SocketAddr> {
        self.admin_listen
            .parse()
            .with_context(|| format!("invalid admin_listen {:?}", self.admin_listen))
    }

    /// Lower-cased tenant header for case-insensitive matching.
    pub fn tenant_header_key(&self) -> String {
        self.tenant_header.trim().to_lowercase()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            enforce_body_parsing: self.enforce_body_parsing,
            failure_mode_allow: self.failure_mode_allow,
            max_request_bytes: self.max_request_bytes,
            max_decompressed_bytes: self.max_decompressed_bytes,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            default_limits: self.default_limits.normalized(),
            default_enforcement: EnforcementConfig {
                enabled: self.default_enforcement_enabled,
                burst_pct_override: None,
            },
            tenant_denial_capacity: self.tenant_denial_capacity,
            global_denial_capacity: self.global_denial_capacity,
        }
    }

    /// Applies the overrides file and the inline tenant seeds. This is
    /// the boot-time stand-in for the external configuration
    /// collaborator that drives `set_limits` / `set_enforcement` at
    /// runtime.
    pub fn seed_tenants(&self, registry: &TenantRegistry) -> anyhow::Result<()> {
        if let Some(path) = &self.overrides_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading overrides file {}", path.display()))?;
            let seeds: HashMap<String, TenantSeed> = serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing overrides file {}", path.display()))?;
            apply_seeds(registry, &seeds);
            info!(count = seeds.len(), path = %path.display(), "applied tenant overrides file");
        }
        if !self.tenants.is_empty() {
            apply_seeds(registry, &self.tenants);
            info!(count = self.tenants.len(), "applied inline tenant seeds");
        }
        Ok(())
    }
}

fn apply_seeds(registry: &TenantRegistry, seeds: &HashMap<String, TenantSeed>) {
    for (tenant, seed) in seeds {
        if let Some(limits) = seed.limits {
            registry.set_limits(tenant, limits);
        }
        let current = registry
            .get_or_create(tenant)
            .policy()
            .1;
        registry.set_enforcement(
            tenant,
            EnforcementConfig {
                enabled: seed.enabled.unwrap_or(current.enabled),
                burst_pct_override: seed.burst_pct_override.or(current.burst_pct_override),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::RegistryConfig;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.tenant_header_key(), "x-scope-orgid");
        assert!(settings.failure_mode_allow);
        assert!(settings.enforce_body_parsing);
        assert!(settings.authz_addr().is_ok());
        assert!(settings.ratelimit_addr().is_ok());
        assert!(settings.admin_addr().is_ok());
        assert_eq!(settings.shutdown_grace_secs, 30);
    }

    #[test]
    fn yaml_settings_deserialize() {
        let yaml = r#"
authz_listen: "127.0.0.1:9001"
tenant_header: "X-Scope-OrgID"
failure_mode_allow: false
default_limits:
  samples_per_second: 1000
  burst_percent: 0.2
tenants:
  acme:
    enabled: true
    limits:
      samples_per_second: 2500
      max_body_bytes: 1048576
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.authz_listen, "127.0.0.1:9001");
        assert_eq!(settings.tenant_header_key(), "x-scope-orgid");
        assert!(!settings.failure_mode_allow);
        assert_eq!(settings.default_limits.samples_per_second, 1000.0);
        let acme = &settings.tenants["acme"];
        assert_eq!(acme.enabled, Some(true));
        assert_eq!(acme.limits.unwrap().max_body_bytes, 1_048_576);
    }

    #[test]
    fn seeds_configure_registry() {
        let mut settings = Settings::default();
        settings.tenants.insert(
            "acme".to_string(),
            TenantSeed {
                limits: Some(TenantLimits {
                    samples_per_second: 1000.0,
                    burst_percent: 0.2,
                    ..Default::default()
                }),
                enabled: Some(true),
                burst_pct_override: None,
            },
        );

        let registry = TenantRegistry::new(RegistryConfig::default());
        settings.seed_tenants(&registry).unwrap();

        let info = registry.snapshot("acme").unwrap();
        assert!(info.enforcement.enabled);
        assert_eq!(info.samples_bucket.capacity, 1200.0);
    }
}
