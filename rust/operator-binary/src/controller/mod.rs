//! Per-kind reconcilers.
//!
//! Every reconciliation runs the same phase order: FETCHED (object and
//! finalizer), STORAGE (garbage collection, dropped artifacts, URL
//! refresh), SOURCE (credentials, fetch or build, verification), ARTIFACT
//! (persist under lock, publish status fields) and SUMMARIZE (condition
//! reduction, one status patch, events, requeue scheduling). A phase that
//! fails records its sub-condition and short-circuits the rest; the
//! summary still runs so the object always leaves with a consistent
//! Ready.

pub mod helm_chart;
pub mod helm_repository;
pub mod oci_repository;

use std::sync::Arc;
use std::time::Duration;

use artifact_store::Storage;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource};
use rand::Rng;
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use source_operator_crd::Artifact;

use crate::index::ChangeIndex;
use crate::queue::WorkQueue;

/// GC lock acquisition is bounded separately from network timeouts.
pub const GC_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Context injected into every reconciliation.
pub struct Ctx {
    /// Kubernetes client for object reads, status patches and events.
    pub client: Client,
    pub storage: Arc<Storage>,
    pub queue: Arc<WorkQueue>,
    pub index: Arc<ChangeIndex>,
    /// Retrying HTTP client for index and artifact downloads.
    pub http: ClientWithMiddleware,
    /// Optional host override for upstream artifact URLs, for running
    /// outside the cluster.
    pub source_host: Option<String>,
}

/// Outcome of a full reconciliation, consumed by the worker loop.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Reconciled; poll again after the object's interval.
    Success { requeue_after: Duration },
    /// Re-enter immediately without recording an error.
    Requeue,
    /// Parked until the generation or reconcile request changes.
    Stalled,
    /// The object is gone or was released for deletion.
    Deleted,
    /// spec.suspend is set; nothing past FETCHED ran.
    Suspended,
}

/// Result of the SOURCE phase when it does not fail outright.
#[derive(Debug, PartialEq, Eq)]
pub enum PhaseResult {
    /// Progressed; later phases may run.
    Success,
    /// Nothing to do yet (e.g. upstream artifact absent); reconciliation
    /// ends after SOURCE without an artifact.
    Empty,
    /// The object must be re-fetched before continuing.
    Requeue,
}

/// Spreads interval polls so a controller restart does not synchronize
/// the whole fleet.
pub fn jittered(interval: Duration) -> Duration {
    let jitter = interval / 10;
    if jitter.is_zero() {
        return interval;
    }
    interval + rand::thread_rng().gen_range(Duration::ZERO..jitter)
}

/// Drops the advertised artifact when its file disappeared from storage.
/// Returns whether it was dropped; the next pass rebuilds it.
pub(crate) fn drop_missing_artifact(storage: &Storage, slot: &mut Option<Artifact>) -> bool {
    match slot {
        Some(artifact) if !storage.exists(artifact) => {
            warn!(
                "Artifact {} disappeared from storage, clearing status",
                artifact.path
            );
            *slot = None;
            true
        }
        _ => false,
    }
}

/// Refreshes artifact and status URLs after a hostname change.
pub(crate) fn refresh_urls(
    storage: &Storage,
    artifact: &mut Option<Artifact>,
    status_url: &mut Option<String>,
) {
    if let Some(artifact) = artifact {
        storage.set_artifact_url(artifact);
    }
    if let Some(url) = status_url {
        *url = storage.set_hostname(url);
    }
}

/// Patches the object status once, tolerating a deletion race.
pub(crate) async fn patch_status<K, S>(
    api: &Api<K>,
    name: &str,
    status: &S,
) -> Result<(), kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
    S: Serialize,
{
    let patch = serde_json::json!({ "status": status });
    match api
        .patch_status(
            name,
            &PatchParams::apply(crate::event::REPORTER),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(error) => Err(error),
    }
}

/// `observedGeneration` advances only when the pass concluded with
/// Ready=True or Stalled=True.
pub(crate) fn observed_generation(
    conditions: &[k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition],
    previous: Option<i64>,
    generation: i64,
) -> Option<i64> {
    use source_operator_crd::condition;

    if crate::conditions::is_true(conditions, condition::READY)
        || crate::conditions::is_true(conditions, condition::STALLED)
    {
        Some(generation)
    } else {
        previous
    }
}

/// Shortens SHA-like revisions to 12 hex characters for version
/// metadata; other revisions pass through unchanged.
pub(crate) fn short_revision(revision: &str) -> String {
    let tail = revision
        .rsplit(|c| c == ':' || c == '/')
        .next()
        .unwrap_or(revision);
    if tail.len() >= 12 && tail.chars().all(|c| c.is_ascii_hexdigit()) {
        tail[..12].to_string()
    } else {
        tail.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_artifact_is_dropped_from_status() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

        let tmp = tempfile::tempdir().unwrap();
        let storage =
            Storage::new(tmp.path(), "host", Duration::from_secs(3600), 2).unwrap();
        let meta = ObjectMeta {
            name: Some("app".into()),
            namespace: Some("ns".into()),
            ..Default::default()
        };

        let src = tmp.path().join("src.tgz");
        std::fs::write(&src, b"bytes").unwrap();
        let mut artifact = storage
            .artifact_for("HelmChart", &meta, "1.0.0", "app-1.0.0.tgz")
            .unwrap();
        storage.copy_from_path(&mut artifact, &src).unwrap();

        // Intact artifact survives the storage phase.
        let mut slot = Some(artifact.clone());
        assert!(!drop_missing_artifact(&storage, &mut slot));
        assert!(slot.is_some());

        // An externally deleted file clears the advertised artifact.
        std::fs::remove_file(storage.local_path(&artifact)).unwrap();
        assert!(drop_missing_artifact(&storage, &mut slot));
        assert!(slot.is_none());
    }

    #[test]
    fn short_revision_trims_sha_like_values() {
        assert_eq!(
            short_revision("sha256:6b7aab8a10d6ee8b895b0a5048f4ab0966ed29ff"),
            "6b7aab8a10d6"
        );
        assert_eq!(
            short_revision("main@sha1:6b7aab8a10d6ee8b895b0a5048f4ab0966ed29ff"),
            "6b7aab8a10d6"
        );
        assert_eq!(short_revision("6.2.0"), "6.2.0");
        assert_eq!(short_revision("latest/abc"), "abc");
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let interval = Duration::from_secs(600);
        for _ in 0..50 {
            let jittered = jittered(interval);
            assert!(jittered >= interval);
            assert!(jittered <= interval + interval / 10);
        }
    }

    #[test]
    fn observed_generation_requires_a_verdict() {
        use source_operator_crd::condition;
        use source_operator_crd::condition::reason;

        let mut conditions = Vec::new();
        assert_eq!(observed_generation(&conditions, Some(1), 2), Some(1));

        crate::conditions::set(
            &mut conditions,
            condition::READY,
            true,
            reason::SUCCEEDED,
            "ready",
            2,
        );
        assert_eq!(observed_generation(&conditions, Some(1), 2), Some(2));

        let mut stalled = Vec::new();
        crate::conditions::set(
            &mut stalled,
            condition::STALLED,
            true,
            reason::URL_INVALID,
            "bad url",
            3,
        );
        assert_eq!(observed_generation(&stalled, Some(1), 3), Some(3));
    }
}
