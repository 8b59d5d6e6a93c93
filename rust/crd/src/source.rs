//! Upstream source kinds a `HelmChart` may reference, and the tagged
//! variant the chart builder dispatches on.
//!
//! `GitRepository` and `Bucket` are reconciled by sibling controllers; this
//! operator only reads their `status.artifact`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::Artifact;

/// Kind of the upstream source a `HelmChart` references.
#[derive(Clone, Copy, Debug, Display, Deserialize, JsonSchema, PartialEq, Eq, Hash, Serialize)]
pub enum SourceKind {
    HelmRepository,
    GitRepository,
    Bucket,
}

/// GitRepositorySpec defines the desired state of GitRepository. Only the
/// fields this operator reads are modelled.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "source.toolkit.dev",
    version = "v1beta2",
    kind = "GitRepository",
    plural = "gitrepositories",
    status = "GitRepositoryStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    /// URL of the Git repository.
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(default)]
    pub suspend: bool,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositoryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// BucketSpec defines the desired state of Bucket. Only the fields this
/// operator reads are modelled.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "source.toolkit.dev",
    version = "v1beta2",
    kind = "Bucket",
    plural = "buckets",
    status = "BucketStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BucketSpec {
    /// Name of the object storage bucket.
    pub bucket_name: String,

    /// Endpoint of the object storage service.
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(default)]
    pub suspend: bool,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// ChartSource is the resolved upstream of a `HelmChart`, dispatched by
/// tag in the chart builder.
#[derive(Clone, Debug)]
pub enum ChartSource {
    HelmRepository(Box<crate::HelmRepository>),
    GitRepository(Box<GitRepository>),
    Bucket(Box<Bucket>),
}

impl ChartSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            ChartSource::HelmRepository(_) => SourceKind::HelmRepository,
            ChartSource::GitRepository(_) => SourceKind::GitRepository,
            ChartSource::Bucket(_) => SourceKind::Bucket,
        }
    }

    /// The advertised artifact of the upstream source, if it has produced
    /// one. A `HelmRepository` of type OCI never advertises an artifact;
    /// the chart builder resolves against the registry directly.
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            ChartSource::HelmRepository(repository) => repository
                .status
                .as_ref()
                .and_then(|status| status.artifact.as_ref()),
            ChartSource::GitRepository(repository) => repository
                .status
                .as_ref()
                .and_then(|status| status.artifact.as_ref()),
            ChartSource::Bucket(bucket) => bucket
                .status
                .as_ref()
                .and_then(|status| status.artifact.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_display_matches_api_kind() {
        assert_eq!(SourceKind::HelmRepository.to_string(), "HelmRepository");
        assert_eq!(SourceKind::GitRepository.to_string(), "GitRepository");
        assert_eq!(SourceKind::Bucket.to_string(), "Bucket");
    }

    #[test]
    fn git_repository_yaml_roundtrip() {
        let manifest = r#"
            url: https://github.com/example/podinfo
            interval: 5m
        "#;
        let spec: GitRepositorySpec = serde_yaml::from_str(manifest).unwrap();
        assert_eq!(spec.url, "https://github.com/example/podinfo");
        assert_eq!(spec.interval.as_deref(), Some("5m"));
        assert!(!spec.suspend);
    }
}
