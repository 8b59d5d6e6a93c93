use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Artifact, LocalObjectReference, DEFAULT_INTERVAL, DEFAULT_TIMEOUT};

/// HelmRepositorySpec defines the desired state of HelmRepository.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "source.toolkit.dev",
    version = "v1beta2",
    kind = "HelmRepository",
    plural = "helmrepositories",
    shortname = "helmrepo",
    status = "HelmRepositoryStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositorySpec {
    /// URL of the repository: an HTTP index URL, or an `oci://` registry
    /// reference for repositories of type `oci`.
    pub url: String,

    /// Type of the repository. Defaults to `default` (HTTP index).
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub repository_type: Option<HelmRepositoryType>,

    /// Interval at which the repository is checked for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Timeout for remote operations such as index downloads and registry
    /// logins, defaults to 60s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// SecretRef names a Secret with registry login credentials, of type
    /// kubernetes.io/dockerconfigjson or with username/password entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,

    /// CertSecretRef names a Secret with TLS material: a PEM-encoded CA
    /// certificate (`ca.crt`) and optionally a client certificate pair
    /// (`tls.crt`, `tls.key`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_secret_ref: Option<LocalObjectReference>,

    /// ServiceAccountName names a ServiceAccount whose image pull secrets
    /// are used when no explicit secret is referenced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Provider used for registry authentication, 'aws', 'azure', 'gcp' or
    /// 'generic'. Defaults to 'generic'.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<RegistryProvider>,

    /// Insecure allows connecting to a non-TLS HTTP container registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,

    /// Suspend pauses reconciliation of this repository.
    #[serde(default)]
    pub suspend: bool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub enum HelmRepositoryType {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "oci")]
    Oci,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub enum RegistryProvider {
    #[default]
    #[serde(rename = "generic")]
    Generic,
    #[serde(rename = "aws")]
    Aws,
    #[serde(rename = "azure")]
    Azure,
    #[serde(rename = "gcp")]
    Gcp,
}

/// HelmRepositoryStatus defines the observed state of HelmRepository.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositoryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Artifact represents the output of the last successful repository
    /// sync. Repositories of type `oci` never produce one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    /// URL is the download link for the artifact output of the last sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
}

impl HelmRepository {
    pub fn interval(&self) -> Duration {
        self.spec
            .interval
            .as_deref()
            .and_then(|value| crate::parse_duration(value).ok())
            .unwrap_or(DEFAULT_INTERVAL)
    }

    pub fn timeout(&self) -> Duration {
        self.spec
            .timeout
            .as_deref()
            .and_then(|value| crate::parse_duration(value).ok())
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn provider(&self) -> RegistryProvider {
        self.spec.provider.unwrap_or_default()
    }

    pub fn is_insecure(&self) -> bool {
        self.spec.insecure.unwrap_or(false)
    }

    /// Whether this repository points at an OCI registry. The `oci://`
    /// scheme wins over a stale type field.
    pub fn is_oci(&self) -> bool {
        self.spec.url.starts_with("oci://")
            || self.spec.repository_type == Some(HelmRepositoryType::Oci)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository_from_spec(manifest: &str) -> HelmRepository {
        let spec: HelmRepositorySpec = serde_yaml::from_str(manifest).unwrap();
        HelmRepository::new("test", spec)
    }

    #[test]
    fn oci_repository_is_detected_by_scheme() {
        let repository = repository_from_spec("url: oci://ghcr.io/example/charts");
        assert!(repository.is_oci());
    }

    #[test]
    fn oci_repository_is_detected_by_type() {
        let repository = repository_from_spec(
            r#"
            url: https://registry.example.com/charts
            type: oci
        "#,
        );
        assert!(repository.is_oci());
    }

    #[test]
    fn http_repository_is_not_oci() {
        let repository = repository_from_spec("url: https://charts.example.com");
        assert!(!repository.is_oci());
        assert_eq!(repository.provider(), RegistryProvider::Generic);
    }

    #[test]
    fn interval_and_timeout_defaults() {
        let repository = repository_from_spec("url: https://charts.example.com");
        assert_eq!(repository.interval(), DEFAULT_INTERVAL);
        assert_eq!(repository.timeout(), DEFAULT_TIMEOUT);

        let repository = repository_from_spec(
            r#"
            url: https://charts.example.com
            interval: 1m
            timeout: 30s
        "#,
        );
        assert_eq!(repository.interval(), Duration::from_secs(60));
        assert_eq!(repository.timeout(), Duration::from_secs(30));
    }
}
