use std::env;
use std::time::Duration;

use azure_core::credentials::Secret;

use crate::auth::ClientCredentials;
use crate::error::{ArmError, ArmResult};
use crate::lro::PollSettings;

pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
/// Provider error code that triggers the Standard-SKU public IP fallback.
pub const BASIC_SKU_QUOTA_CODE: &str = "IPv4BasicSkuPublicIpCountLimitReached";

/// Poll timing for long-running operations.
///
/// - `AZ_POLL_INTERVAL_SECS` (default 5)
/// - `AZ_DELETE_TIMEOUT_SECS` (default 300)
/// - `AZ_DEPLOY_TIMEOUT_SECS` (default 900)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub delete_timeout: Duration,
    pub deploy_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            delete_timeout: Duration::from_secs(300),
            deploy_timeout: Duration::from_secs(900),
        }
    }
}

/// Which default timeout a call starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Delete,
    Deploy,
}

impl PollConfig {
    /// Defaults for `kind`, with optional per-call overrides in seconds.
    /// Zero overrides are ignored.
    pub fn settings(
        &self,
        kind: OperationKind,
        timeout_secs: Option<u64>,
        interval_secs: Option<u64>,
    ) -> PollSettings {
        let timeout = match kind {
            OperationKind::Delete => self.delete_timeout,
            OperationKind::Deploy => self.deploy_timeout,
        };
        PollSettings::new(
            interval_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(self.interval),
            timeout_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(timeout),
        )
    }
}

/// Defaults used by `deploy_vm` when the caller omits a field.
///
/// Environment variables: `AZ_TEST_LOCATION`, `AZ_TEST_VM_SIZE`,
/// `AZ_TEST_ADMIN`, `AZ_TEST_PASS`, `AZ_TEST_VNET_NAME`, `AZ_TEST_SUBNET_NAME`.
#[derive(Debug, Clone)]
pub struct VmDefaults {
    pub location: String,
    pub vm_size: String,
    pub admin_username: String,
    pub admin_password: Option<Secret>,
    pub vnet_name: String,
    pub subnet_name: String,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            location: "eastasia".into(),
            vm_size: "Standard_D2as_v5".into(),
            admin_username: "azureuser".into(),
            admin_password: None,
            vnet_name: "vnet-default".into(),
            subnet_name: "default".into(),
        }
    }
}

/// Top-level server configuration assembled from environment variables at
/// startup.  Read-only afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: ClientCredentials,
    pub management_endpoint: String,
    pub authority_host: String,
    /// Gates every mutating tool (`AZ_RUN_DEPLOY`).
    pub run_deploy: bool,
    pub polling: PollConfig,
    /// Error codes that make public IP creation retry with a Standard SKU.
    pub public_ip_fallback_codes: Vec<String>,
    pub vm_defaults: VmDefaults,
}

impl Config {
    /// Build configuration from the current process environment.
    ///
    /// All four `AZ_*` credential variables are required; any missing one is
    /// a configuration error before anything touches the network.
    pub fn from_env() -> ArmResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.  Empty values count
    /// as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ArmResult<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let credentials = ClientCredentials::new(
            get("AZ_TENANT_ID").unwrap_or_default(),
            get("AZ_CLIENT_ID").unwrap_or_default(),
            get("AZ_CLIENT_SECRET").unwrap_or_default(),
            get("AZ_SUBSCRIPTION_ID").unwrap_or_default(),
        )?;

        let run_deploy = match get("AZ_RUN_DEPLOY") {
            Some(v) => parse_bool("AZ_RUN_DEPLOY", &v)?,
            None => false,
        };
        if run_deploy {
            tracing::info!("AZ_RUN_DEPLOY is enabled - mutating tools will reach Azure");
        } else {
            tracing::info!("AZ_RUN_DEPLOY is not set - mutating tools are disabled");
        }

        let defaults = PollConfig::default();
        let polling = PollConfig {
            interval: parse_secs(&get, "AZ_POLL_INTERVAL_SECS", defaults.interval)?,
            delete_timeout: parse_secs(&get, "AZ_DELETE_TIMEOUT_SECS", defaults.delete_timeout)?,
            deploy_timeout: parse_secs(&get, "AZ_DEPLOY_TIMEOUT_SECS", defaults.deploy_timeout)?,
        };

        let public_ip_fallback_codes = match get("AZ_PUBLIC_IP_FALLBACK_CODES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
            None => vec![BASIC_SKU_QUOTA_CODE.to_string()],
        };

        let base = VmDefaults::default();
        let vm_defaults = VmDefaults {
            location: get("AZ_TEST_LOCATION").unwrap_or(base.location),
            vm_size: get("AZ_TEST_VM_SIZE").unwrap_or(base.vm_size),
            admin_username: get("AZ_TEST_ADMIN").unwrap_or(base.admin_username),
            admin_password: get("AZ_TEST_PASS").map(Secret::from),
            vnet_name: get("AZ_TEST_VNET_NAME").unwrap_or(base.vnet_name),
            subnet_name: get("AZ_TEST_SUBNET_NAME").unwrap_or(base.subnet_name),
        };

        Ok(Config {
            credentials,
            management_endpoint: get("AZ_MANAGEMENT_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_MANAGEMENT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            authority_host: get("AZ_AUTHORITY_HOST")
                .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string()),
            run_deploy,
            polling,
            public_ip_fallback_codes,
            vm_defaults,
        })
    }

    /// Error unless mutating operations are enabled.
    pub fn require_deploy(&self, operation: &str) -> ArmResult<()> {
        if self.run_deploy {
            Ok(())
        } else {
            Err(ArmError::Disabled(operation.to_string()))
        }
    }
}

fn parse_bool(key: &str, value: &str) -> ArmResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ArmError::Configuration(format!(
            "{key} must be true or false, got {other:?}"
        ))),
    }
}

fn parse_secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> ArmResult<Duration> {
    match get(key) {
        None => Ok(default),
        Some(v) => match v.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ArmError::Configuration(format!(
                "{key} must be a positive number of seconds, got {v:?}"
            ))),
        },
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Config pointing at fake endpoints with mutating tools enabled.
    pub fn config(run_deploy: bool) -> Config {
        Config::from_lookup(|key| {
            let v = match key {
                "AZ_TENANT_ID" => "tenant",
                "AZ_CLIENT_ID" => "client",
                "AZ_CLIENT_SECRET" => "secret",
                "AZ_SUBSCRIPTION_ID" => "sub-1",
                "AZ_MANAGEMENT_ENDPOINT" => "https://arm.test",
                "AZ_TEST_PASS" => "P@ssw0rd!",
                "AZ_RUN_DEPLOY" if run_deploy => "true",
                _ => return None,
            };
            Some(v.to_string())
        })
        .unwrap()
    }
}
