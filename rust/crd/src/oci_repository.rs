use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    Artifact, LocalObjectReference, RegistryProvider, SourceVerification, DEFAULT_INTERVAL,
    DEFAULT_TIMEOUT,
};

/// OCIRepositorySpec defines the desired state of OCIRepository.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "source.toolkit.dev",
    version = "v1beta2",
    kind = "OCIRepository",
    plural = "ocirepositories",
    shortname = "ocirepo",
    status = "OCIRepositoryStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OCIRepositorySpec {
    /// URL is a reference to an artifact repository hosted on a remote
    /// container registry, in the form `oci://<host>/<repository>`.
    pub url: String,

    /// The OCI reference to pull and monitor for changes, defaults to the
    /// latest tag.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ref")]
    pub reference: Option<OCIRepositoryRef>,

    /// LayerSelector specifies which layer should be extracted from the
    /// artifact. When not specified, the first layer is selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_selector: Option<OCILayerSelector>,

    /// Provider used for registry authentication, 'aws', 'azure', 'gcp' or
    /// 'generic'. Defaults to 'generic'.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<RegistryProvider>,

    /// SecretRef names a Secret of type kubernetes.io/dockerconfigjson with
    /// registry login credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,

    /// ServiceAccountName names a ServiceAccount whose image pull secrets
    /// are used when no explicit secret is referenced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// CertSecretRef names a Secret with TLS material: a PEM-encoded CA
    /// certificate (`ca.crt`) and optionally a client certificate pair
    /// (`tls.crt`, `tls.key`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_secret_ref: Option<LocalObjectReference>,

    /// Verify enables signature verification of the pulled artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<SourceVerification>,

    /// Ignore overrides the set of excluded patterns in the .sourceignore
    /// format (same syntax as .gitignore).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<String>,

    /// Insecure allows connecting to a non-TLS HTTP container registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,

    /// Interval at which the repository URL is checked for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Timeout for remote operations such as pulls, defaults to 60s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Suspend pauses reconciliation of this repository.
    #[serde(default)]
    pub suspend: bool,
}

/// The OCI reference to pull. Digest takes precedence over SemVer, SemVer
/// over Tag.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OCIRepositoryRef {
    /// Digest of the artifact, in the format 'sha256:<HASH>'.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// SemVer expression selecting the latest matching tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver: Option<String>,

    /// SemverFilter is a regex pattern restricting the tags considered by
    /// the SemVer expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver_filter: Option<String>,

    /// Tag to pull, defaults to latest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// LayerSelector picks the artifact layer to persist.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OCILayerSelector {
    /// MediaType of the layer to select. The first matching layer wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Operation applied to the selected layer: the compressed content is
    /// extracted and re-archived by default, or persisted as-is with
    /// 'copy'.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OCILayerOperation>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub enum OCILayerOperation {
    #[default]
    #[serde(rename = "extract")]
    Extract,
    #[serde(rename = "copy")]
    Copy,
}

/// OCIRepositoryStatus defines the observed state of OCIRepository.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OCIRepositoryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Artifact represents the output of the last successful sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    /// URL is the download link for the artifact output of the last sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// ObservedIgnore is the exclusion patterns the current artifact was
    /// constructed with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_ignore: Option<String>,

    /// ObservedLayerSelector is the layer selector the current artifact
    /// was constructed with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_layer_selector: Option<OCILayerSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
}

impl OCIRepository {
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

    pub fn layer_operation(&self) -> OCILayerOperation {
        self.spec
            .layer_selector
            .as_ref()
            .and_then(|selector| selector.operation)
            .unwrap_or_default()
    }

    /// Whether the content configuration (ignore patterns, layer selector)
    /// drifted from what the advertised artifact was built with.
    pub fn content_config_changed(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        if status.artifact.is_none() {
            return false;
        }
        status.observed_ignore != self.spec.ignore
            || status.observed_layer_selector != self.spec.layer_selector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_yaml_roundtrip() {
        let manifest = r#"
            url: oci://ghcr.io/example/manifests/podinfo
            ref:
              semver: ">=6.0.0"
              semverFilter: "^6\\.[0-9]+\\.[0-9]+$"
        "#;
        let spec: OCIRepositorySpec = serde_yaml::from_str(manifest).unwrap();
        let reference = spec.reference.unwrap();
        assert_eq!(reference.semver.as_deref(), Some(">=6.0.0"));
        assert!(reference.semver_filter.is_some());
        assert!(reference.digest.is_none());
    }

    #[test]
    fn layer_operation_defaults_to_extract() {
        let spec: OCIRepositorySpec =
            serde_yaml::from_str("url: oci://ghcr.io/example/podinfo").unwrap();
        let repository = OCIRepository::new("podinfo", spec);
        assert_eq!(repository.layer_operation(), OCILayerOperation::Extract);
    }

    #[test]
    fn content_config_change_is_detected() {
        let spec: OCIRepositorySpec = serde_yaml::from_str(
            r#"
            url: oci://ghcr.io/example/podinfo
            ignore: "*.md"
        "#,
        )
        .unwrap();
        let mut repository = OCIRepository::new("podinfo", spec);

        // No artifact yet, nothing to drift from.
        assert!(!repository.content_config_changed());

        repository.status = Some(OCIRepositoryStatus {
            artifact: Some(crate::Artifact {
                revision: "latest/abc".into(),
                path: "ocirepository/ns/podinfo/latest-abc.tgz".into(),
                url: "http://storage/ocirepository/ns/podinfo/latest-abc.tgz".into(),
                digest: None,
                last_update_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                    k8s_openapi::chrono::Utc::now(),
                ),
                metadata: None,
                size: None,
            }),
            observed_ignore: None,
            ..Default::default()
        });
        assert!(repository.content_config_changed());
    }
}
