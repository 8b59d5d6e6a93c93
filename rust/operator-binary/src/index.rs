//! Secondary indices for cross-resource change propagation.
//!
//! Two indices are maintained from watch events: repository URL to
//! dependent charts, and `(source kind, namespace, name)` to dependent
//! charts. When an upstream source advertises a new artifact revision,
//! the dependents whose observed revision drifted are re-enqueued.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use kube::ResourceExt;
use tracing::trace;

use source_operator_crd::{HelmChart, SourceKind};

use crate::queue::{ObjectKey, ResourceKind};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SourceRef {
    kind: SourceKind,
    namespace: String,
    name: String,
}

#[derive(Debug)]
struct ChartRegistration {
    source: SourceRef,
    repository_url: Option<String>,
    observed_revision: Option<String>,
}

#[derive(Default)]
struct Inner {
    by_source: HashMap<SourceRef, HashSet<ObjectKey>>,
    by_repository_url: HashMap<String, HashSet<ObjectKey>>,
    charts: HashMap<ObjectKey, ChartRegistration>,
}

#[derive(Default)]
pub struct ChangeIndex {
    inner: RwLock<Inner>,
}

impl ChangeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records or updates the registration of a chart. `repository_url`
    /// is the URL of the referenced HelmRepository when known.
    pub fn observe_chart(&self, chart: &HelmChart, repository_url: Option<&str>) {
        let Some(namespace) = chart.namespace() else {
            return;
        };
        let key = ObjectKey::new(ResourceKind::HelmChart, namespace.clone(), chart.name_any());
        let registration = ChartRegistration {
            source: SourceRef {
                kind: chart.spec.source_ref.kind,
                namespace,
                name: chart.spec.source_ref.name.clone(),
            },
            repository_url: repository_url.map(str::to_string),
            observed_revision: chart
                .status
                .as_ref()
                .and_then(|status| status.observed_source_artifact_revision.clone()),
        };

        let mut inner = self.inner.write().expect("index lock poisoned");
        Self::deregister(&mut inner, &key);
        inner
            .by_source
            .entry(registration.source.clone())
            .or_default()
            .insert(key.clone());
        if let Some(url) = &registration.repository_url {
            inner
                .by_repository_url
                .entry(url.clone())
                .or_default()
                .insert(key.clone());
        }
        trace!("Indexed {} under {:?}", key, registration.source);
        inner.charts.insert(key, registration);
    }

    /// Drops a chart from all indices, e.g. after its deletion.
    pub fn forget_chart(&self, key: &ObjectKey) {
        let mut inner = self.inner.write().expect("index lock poisoned");
        Self::deregister(&mut inner, key);
        inner.charts.remove(key);
    }

    /// Charts registered against a repository URL.
    pub fn charts_for_repository_url(&self, url: &str) -> Vec<ObjectKey> {
        let inner = self.inner.read().expect("index lock poisoned");
        inner
            .by_repository_url
            .get(url)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Charts registered against an upstream source object.
    pub fn charts_for_source(&self, kind: SourceKind, namespace: &str, name: &str) -> Vec<ObjectKey> {
        let inner = self.inner.read().expect("index lock poisoned");
        inner
            .by_source
            .get(&SourceRef {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Dependents of an upstream source whose observed revision differs
    /// from the source's current artifact revision. Each dependent
    /// appears at most once; dependents already at the revision are
    /// skipped to avoid spurious re-enqueues.
    pub fn drifted_dependents(
        &self,
        kind: SourceKind,
        namespace: &str,
        name: &str,
        revision: Option<&str>,
    ) -> Vec<ObjectKey> {
        let inner = self.inner.read().expect("index lock poisoned");
        let Some(dependents) = inner.by_source.get(&SourceRef {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }) else {
            return Vec::new();
        };

        dependents
            .iter()
            .filter(|key| {
                let observed = inner
                    .charts
                    .get(key)
                    .and_then(|registration| registration.observed_revision.as_deref());
                observed != revision
            })
            .cloned()
            .collect()
    }

    fn deregister(inner: &mut Inner, key: &ObjectKey) {
        if let Some(previous) = inner.charts.get(key) {
            if let Some(keys) = inner.by_source.get_mut(&previous.source) {
                keys.remove(key);
                if keys.is_empty() {
                    inner.by_source.remove(&previous.source);
                }
            }
            if let Some(url) = &previous.repository_url {
                if let Some(keys) = inner.by_repository_url.get_mut(url) {
                    keys.remove(key);
                    if keys.is_empty() {
                        inner.by_repository_url.remove(url);
                    }
                }
            }
        }
    }
}
