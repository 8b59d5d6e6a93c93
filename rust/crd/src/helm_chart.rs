use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Artifact, SourceKind, SourceVerification, DEFAULT_INTERVAL, DEFAULT_TIMEOUT};

/// HelmChartSpec defines the desired state of HelmChart.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "source.toolkit.dev",
    version = "v1beta2",
    kind = "HelmChart",
    plural = "helmcharts",
    shortname = "hc",
    status = "HelmChartStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartSpec {
    /// Chart is the name or path the chart is available at in the
    /// referenced source.
    pub chart: String,

    /// Version is the chart version semver expression. Defaults to latest
    /// when omitted. Ignored for sources of kind GitRepository and Bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// SourceRef is the reference to the source this chart is materialized
    /// from.
    pub source_ref: ChartSourceReference,

    /// ReconcileStrategy determines what enables the creation of a new
    /// artifact: a bumped chart version, or any revision change of the
    /// upstream source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_strategy: Option<ReconcileStrategy>,

    /// ValuesFiles is an alternative list of values files to use as the
    /// chart values (values.yaml is not included by default); they are
    /// merged in the order given, with the last file overriding the first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_files: Vec<String>,

    /// Verify enables signature verification of the pulled chart. Only
    /// supported for sources of kind HelmRepository pointing at an OCI
    /// registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<SourceVerification>,

    /// Interval at which the chart source is checked for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Timeout for remote operations, defaults to 60s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Suspend pauses reconciliation of this chart.
    #[serde(default)]
    pub suspend: bool,
}

/// Reference to the upstream source of a chart.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSourceReference {
    /// Kind of the referent, one of HelmRepository, GitRepository, Bucket.
    pub kind: SourceKind,

    /// Name of the referent, in the same namespace as the chart.
    pub name: String,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub enum ReconcileStrategy {
    /// Rebuild only when the resolved chart version changes.
    #[default]
    ChartVersion,
    /// Rebuild whenever the upstream source revision changes.
    Revision,
}

/// HelmChartStatus defines the observed state of HelmChart.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Artifact represents the output of the last successful chart build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    /// URL is the download link for the artifact output of the last build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// ObservedSourceArtifactRevision is the upstream source revision the
    /// current artifact was built from. The change index compares this
    /// against the live upstream revision to decide on re-enqueues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_source_artifact_revision: Option<String>,

    /// ObservedChartName is the last resolved chart name, which may differ
    /// from spec.chart for path-based charts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_chart_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
}

impl HelmChart {
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

    /// The version expression, defaulting to any.
    pub fn version_or_default(&self) -> &str {
        self.spec.version.as_deref().unwrap_or("*")
    }

    pub fn reconcile_strategy(&self) -> ReconcileStrategy {
        self.spec.reconcile_strategy.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_spec_yaml_roundtrip() {
        let manifest = r#"
            chart: podinfo
            version: ">=6.0.0 <7.0.0"
            sourceRef:
              kind: HelmRepository
              name: podinfo
            valuesFiles:
              - values.yaml
              - values-prod.yaml
        "#;
        let spec: HelmChartSpec = serde_yaml::from_str(manifest).unwrap();
        assert_eq!(spec.chart, "podinfo");
        assert_eq!(spec.source_ref.kind, SourceKind::HelmRepository);
        assert_eq!(spec.values_files.len(), 2);
        assert!(spec.verify.is_none());
        assert!(!spec.suspend);
    }

    #[test]
    fn defaults_apply() {
        let manifest = r#"
            chart: ./charts/app
            sourceRef:
              kind: GitRepository
              name: app-repo
        "#;
        let spec: HelmChartSpec = serde_yaml::from_str(manifest).unwrap();
        let chart = HelmChart::new("app", spec);
        assert_eq!(chart.version_or_default(), "*");
        assert_eq!(chart.reconcile_strategy(), ReconcileStrategy::ChartVersion);
        assert_eq!(chart.interval(), DEFAULT_INTERVAL);
    }

    #[test]
    fn verify_block_deserializes() {
        let manifest = r#"
            chart: podinfo
            sourceRef:
              kind: HelmRepository
              name: podinfo-oci
            verify:
              provider: cosign
              secretRef:
                name: cosign-pub
        "#;
        let spec: HelmChartSpec = serde_yaml::from_str(manifest).unwrap();
        let verify = spec.verify.unwrap();
        assert_eq!(verify.secret_ref.unwrap().name, "cosign-pub");
    }
}
