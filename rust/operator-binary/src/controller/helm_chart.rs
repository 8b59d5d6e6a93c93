use async_trait::async_trait;
use kube::api::ListParams;
use kube::runtime::events::EventType;
use kube::{Api, Client, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info, warn};

use artifact_store::{artifact_filename, LATEST_LINK};
use registry_client::credentials::{Auth, CredentialResolver};
use registry_client::RegistryClient;
use source_operator_crd::condition::reason;
use source_operator_crd::{
    condition, reconcile_annotation_value, Bucket, ChartSource, GitRepository, HelmChart,
    HelmRepository, ReconcileStrategy, SourceKind,
};

use crate::builder::dependencies::{DependencyResolver, RepositoryCredentials};
use crate::builder::{local, remote, Build, BuildOptions};
use crate::conditions;
use crate::event;
use crate::fetcher::SourceFetcher;
use crate::finalizer;
use crate::queue::ObjectKey;

use super::{
    drop_missing_artifact, jittered, observed_generation, patch_status, refresh_urls,
    short_revision, Ctx, Outcome, PhaseResult, GC_LOCK_TIMEOUT,
};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Failed to get object: {}", source))]
    GetObject { source: kube::Error },

    #[snafu(display("Failed to get source {} {}: {}", kind, name, source))]
    GetSource {
        kind: SourceKind,
        name: String,
        source: kube::Error,
    },

    #[snafu(display("Failed to patch finalizer: {}", source))]
    Finalizer { source: kube::Error },

    #[snafu(display("Failed to patch status: {}", source))]
    PatchStatus { source: kube::Error },

    #[snafu(display("Failed to publish event: {}", source))]
    PublishEvent { source: crate::event::Error },

    #[snafu(display("Object has no namespace associated"))]
    NoNamespace,

    #[snafu(display("Failed to resolve credentials: {}", source))]
    Credentials {
        source: registry_client::credentials::Error,
    },

    #[snafu(display("Failed to fetch source artifact: {}", source))]
    FetchSource {
        source: crate::fetcher::FetcherError,
    },

    #[snafu(display("Failed to build chart: {}", source))]
    Build { source: crate::builder::Error },

    #[snafu(display("Storage operation failed: {}", source))]
    Storage { source: artifact_store::Error },

    #[snafu(display("Signature verification is not supported for sources of kind {}", kind))]
    VerificationUnsupported { kind: SourceKind },

    #[snafu(display("Operation timed out after {}s", seconds))]
    Timeout { seconds: u64 },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    fn is_stalling(&self) -> bool {
        match self {
            Error::Build { source } => source.is_persistent(),
            Error::VerificationUnsupported { .. } => true,
            _ => false,
        }
    }

    fn condition(&self) -> (&'static str, &'static str) {
        match self {
            Error::Credentials { .. } => (condition::FETCH_FAILED, reason::AUTHENTICATION_FAILED),
            Error::Build { source } => match source {
                crate::builder::Error::Verification { .. } => {
                    (condition::SOURCE_VERIFIED, reason::VERIFICATION_ERROR)
                }
                _ => (condition::BUILD_FAILED, reason::FAILED),
            },
            Error::VerificationUnsupported { .. } => {
                (condition::SOURCE_VERIFIED, reason::VERIFICATION_ERROR)
            }
            Error::Storage { .. } => (
                condition::STORAGE_OPERATION_FAILED,
                reason::STORAGE_OPERATION_FAILED,
            ),
            Error::FetchSource { .. } | Error::GetSource { .. } => {
                (condition::FETCH_FAILED, reason::FAILED)
            }
            _ => (condition::FETCH_FAILED, reason::FAILED),
        }
    }
}

pub async fn reconcile(key: &ObjectKey, ctx: &Ctx) -> Result<Outcome> {
    let api: Api<HelmChart> = Api::namespaced(ctx.client.clone(), &key.namespace);

    // FETCHED
    let Some(chart) = api.get_opt(&key.name).await.context(GetObjectSnafu)? else {
        ctx.index.forget_chart(key);
        return Ok(Outcome::Deleted);
    };

    if chart.metadata.deletion_timestamp.is_some() {
        ctx.storage
            .remove_all(key.kind.as_kind_str(), &chart.metadata)
            .context(StorageSnafu)?;
        finalizer::remove(&api, &chart)
            .await
            .context(FinalizerSnafu)?;
        ctx.index.forget_chart(key);
        info!("HelmChart {} deleted, artifacts removed", key);
        return Ok(Outcome::Deleted);
    }

    if !finalizer::has_finalizer(&chart) {
        finalizer::add(&api, &chart).await.context(FinalizerSnafu)?;
        return Ok(Outcome::Requeue);
    }

    if chart.spec.suspend {
        debug!("HelmChart {} suspended, skipping", key);
        return Ok(Outcome::Suspended);
    }

    let generation = chart.metadata.generation.unwrap_or(0);
    let mut status = chart.status.clone().unwrap_or_default();
    let reconcile_request = reconcile_annotation_value(&chart.metadata);
    let force = match &reconcile_request {
        Some(requested) => status.last_handled_reconcile_at.as_ref() != Some(requested),
        None => false,
    };

    // STORAGE
    let mut phase_error: Option<Error> = None;
    if let Some(artifact) = &status.artifact {
        if let Err(source) = ctx.storage.garbage_collect(artifact, GC_LOCK_TIMEOUT) {
            event::publish(
                &chart,
                ctx.client.clone(),
                EventType::Warning,
                reason::GARBAGE_COLLECTION_FAILED,
                Some(source.to_string()),
            )
            .await
            .context(PublishEventSnafu)?;
            phase_error = Some(Error::Storage { source });
        }
    }
    if drop_missing_artifact(&ctx.storage, &mut status.artifact) {
        status.url = None;
        conditions::set(
            &mut status.conditions,
            condition::ARTIFACT_IN_STORAGE,
            false,
            reason::NO_SOURCE_ARTIFACT,
            "artifact file is missing from storage",
            generation,
        );
    }
    refresh_urls(&ctx.storage, &mut status.artifact, &mut status.url);

    // SOURCE + ARTIFACT
    if phase_error.is_none() {
        phase_error = reconcile_source(ctx, &chart, &mut status, generation, force)
            .await
            .err();
    }

    if let Some(error) = &phase_error {
        let (condition_type, condition_reason) = error.condition();
        if condition_type == condition::SOURCE_VERIFIED {
            conditions::set(
                &mut status.conditions,
                condition::SOURCE_VERIFIED,
                false,
                condition_reason,
                &error.to_string(),
                generation,
            );
        } else {
            conditions::set(
                &mut status.conditions,
                condition_type,
                true,
                condition_reason,
                &error.to_string(),
                generation,
            );
        }
        if error.is_stalling() {
            conditions::set(
                &mut status.conditions,
                condition::STALLED,
                true,
                condition_reason,
                &error.to_string(),
                generation,
            );
        }
    }

    // SUMMARIZE
    let transition = conditions::summarize(&mut status.conditions, generation);
    status.observed_generation =
        observed_generation(&status.conditions, status.observed_generation, generation);
    if let Some(requested) = reconcile_request {
        status.last_handled_reconcile_at = Some(requested);
    }
    patch_status(&api, &key.name, &status)
        .await
        .context(PatchStatusSnafu)?;

    // Keep the change index in sync with what this pass observed.
    let mut indexed = chart.clone();
    indexed.status = Some(status);
    let repository_url = match indexed.spec.source_ref.kind {
        SourceKind::HelmRepository => {
            Api::<HelmRepository>::namespaced(ctx.client.clone(), &key.namespace)
                .get_opt(&indexed.spec.source_ref.name)
                .await
                .ok()
                .flatten()
                .map(|repository| repository.spec.url)
        }
        _ => None,
    };
    ctx.index.observe_chart(&indexed, repository_url.as_deref());

    if let Some(transition) = transition {
        let event_type = if transition.ready {
            EventType::Normal
        } else {
            EventType::Warning
        };
        event::publish(
            &chart,
            ctx.client.clone(),
            event_type,
            &transition.reason,
            Some(transition.message),
        )
        .await
        .context(PublishEventSnafu)?;
    }

    match phase_error {
        Some(error) if error.is_stalling() => Ok(Outcome::Stalled),
        Some(error) => Err(error),
        None => Ok(Outcome::Success {
            requeue_after: jittered(chart.interval()),
        }),
    }
}

/// Resolves the referenced source object.
async fn resolve_source(ctx: &Ctx, chart: &HelmChart, namespace: &str) -> Result<Option<ChartSource>> {
    let name = &chart.spec.source_ref.name;
    let source = match chart.spec.source_ref.kind {
        SourceKind::HelmRepository => {
            Api::<HelmRepository>::namespaced(ctx.client.clone(), namespace)
                .get_opt(name)
                .await
                .context(GetSourceSnafu {
                    kind: SourceKind::HelmRepository,
                    name,
                })?
                .map(|repository| ChartSource::HelmRepository(Box::new(repository)))
        }
        SourceKind::GitRepository => {
            Api::<GitRepository>::namespaced(ctx.client.clone(), namespace)
                .get_opt(name)
                .await
                .context(GetSourceSnafu {
                    kind: SourceKind::GitRepository,
                    name,
                })?
                .map(|repository| ChartSource::GitRepository(Box::new(repository)))
        }
        SourceKind::Bucket => Api::<Bucket>::namespaced(ctx.client.clone(), namespace)
            .get_opt(name)
            .await
            .context(GetSourceSnafu {
                kind: SourceKind::Bucket,
                name,
            })?
            .map(|bucket| ChartSource::Bucket(Box::new(bucket))),
    };
    Ok(source)
}

async fn reconcile_source(
    ctx: &Ctx,
    chart: &HelmChart,
    status: &mut source_operator_crd::HelmChartStatus,
    generation: i64,
    force: bool,
) -> Result<PhaseResult> {
    let namespace = chart.namespace().context(NoNamespaceSnafu)?;
    let timeout = chart.timeout();

    let Some(source) = resolve_source(ctx, chart, &namespace).await? else {
        conditions::set(
            &mut status.conditions,
            condition::FETCH_FAILED,
            true,
            reason::NO_SOURCE_ARTIFACT,
            &format!(
                "source {} {:?} not found",
                chart.spec.source_ref.kind, chart.spec.source_ref.name
            ),
            generation,
        );
        return Ok(PhaseResult::Empty);
    };

    // Verification reaches into registry signatures; only OCI-backed
    // repositories carry them.
    if chart.spec.verify.is_some() {
        let oci_backed = matches!(
            &source,
            ChartSource::HelmRepository(repository) if repository.is_oci()
        );
        if !oci_backed {
            return VerificationUnsupportedSnafu {
                kind: chart.spec.source_ref.kind,
            }
            .fail();
        }
    }

    // Version metadata parts: values overrides roll with the generation,
    // revision-tracking charts embed the upstream revision.
    let mut metadata_parts: Vec<String> = Vec::new();
    if !chart.spec.values_files.is_empty() {
        metadata_parts.push(generation.to_string());
    }

    let source_revision = source.artifact().map(|artifact| artifact.revision.clone());
    if chart.reconcile_strategy() == ReconcileStrategy::Revision {
        if let Some(revision) = &source_revision {
            metadata_parts.push(short_revision(revision));
        }
    }

    let mut options = BuildOptions {
        values_files: chart.spec.values_files.clone(),
        force,
        cached_chart: status
            .artifact
            .as_ref()
            .map(|artifact| ctx.storage.local_path(artifact)),
        verify: chart.spec.verify.clone(),
        verification_keys: Vec::new(),
        version_metadata: if metadata_parts.is_empty() {
            None
        } else {
            Some(metadata_parts.join("."))
        },
    };

    let resolver = CredentialResolver::new(ctx.client.clone());
    if let Some(verification) = &chart.spec.verify {
        if let Some(secret) = &verification.secret_ref {
            options.verification_keys = resolver
                .resolve_verification_keys(&namespace, &secret.name)
                .await
                .context(CredentialsSnafu)?;
        }
    }

    let workdir = tempfile::tempdir().map_err(|source| Error::Build {
        source: crate::builder::Error::Io { source },
    })?;

    let build = match &source {
        ChartSource::HelmRepository(repository) if repository.is_oci() => {
            build_from_oci(
                ctx,
                chart,
                repository,
                &resolver,
                &namespace,
                &options,
                workdir.path(),
                timeout,
            )
            .await?
        }
        ChartSource::HelmRepository(repository) => {
            let Some(index_artifact) = source.artifact() else {
                conditions::set(
                    &mut status.conditions,
                    condition::FETCH_FAILED,
                    true,
                    reason::NO_SOURCE_ARTIFACT,
                    "referenced HelmRepository has no index artifact yet",
                    generation,
                );
                return Ok(PhaseResult::Empty);
            };
            let login = match &repository.spec.secret_ref {
                Some(secret) => resolver
                    .resolve(&namespace, Some(&secret.name), None, repository.provider(), "")
                    .await
                    .context(CredentialsSnafu)?,
                None => Default::default(),
            };
            with_timeout(
                timeout,
                remote::build_from_index(
                    &ctx.http,
                    &ctx.storage.local_path(index_artifact),
                    &repository.spec.url,
                    login.auth,
                    &chart.spec.chart,
                    chart.version_or_default(),
                    &options,
                    workdir.path(),
                ),
            )
            .await?
            .context(BuildSnafu)?
        }
        ChartSource::GitRepository(_) | ChartSource::Bucket(_) => {
            let Some(artifact) = source.artifact() else {
                conditions::set(
                    &mut status.conditions,
                    condition::FETCH_FAILED,
                    true,
                    reason::NO_SOURCE_ARTIFACT,
                    "referenced source has not produced an artifact yet",
                    generation,
                );
                return Ok(PhaseResult::Empty);
            };

            let fetcher = SourceFetcher::new(ctx.http.clone(), ctx.source_host.clone());
            let source_dir = with_timeout(timeout, fetcher.fetch(artifact, workdir.path()))
                .await?
                .context(FetchSourceSnafu)?;

            let callback = NamespacedRepositoryCallback {
                client: ctx.client.clone(),
                namespace: namespace.clone(),
            };
            let dependency_resolver = DependencyResolver::new(&ctx.http, &callback, timeout);
            with_timeout(
                timeout,
                local::build_from_source(
                    &source_dir,
                    &chart.spec.chart,
                    &options,
                    &dependency_resolver,
                    workdir.path(),
                ),
            )
            .await?
            .context(BuildSnafu)?
        }
    };

    conditions::set(
        &mut status.conditions,
        condition::RECONCILING,
        true,
        reason::PROGRESSING,
        &format!("building artifact for chart version '{}'", build.version),
        generation,
    );
    if build.verified_by.is_some() {
        conditions::set(
            &mut status.conditions,
            condition::SOURCE_VERIFIED,
            true,
            reason::SUCCEEDED,
            &format!("verified signature of version '{}'", build.version),
            generation,
        );
    } else if chart.spec.verify.is_none() {
        conditions::remove(&mut status.conditions, condition::SOURCE_VERIFIED);
    }

    persist_build(ctx, chart, status, generation, &build, source_revision).await?;
    Ok(PhaseResult::Success)
}

#[allow(clippy::too_many_arguments)]
async fn build_from_oci(
    ctx: &Ctx,
    chart: &HelmChart,
    repository: &HelmRepository,
    resolver: &CredentialResolver,
    namespace: &str,
    options: &BuildOptions,
    workdir: &std::path::Path,
    timeout: std::time::Duration,
) -> Result<Build> {
    let registry_host = RegistryClient::parse_url(&repository.spec.url)
        .map_err(|source| Error::Build {
            source: crate::builder::Error::Registry { source },
        })?
        .registry()
        .to_string();
    let login = resolver
        .resolve(
            namespace,
            repository
                .spec
                .secret_ref
                .as_ref()
                .map(|secret| secret.name.as_str()),
            repository.spec.service_account_name.as_deref(),
            repository.provider(),
            &registry_host,
        )
        .await
        .context(CredentialsSnafu)?;
    let tls = match &repository.spec.cert_secret_ref {
        Some(secret) => Some(
            resolver
                .resolve_tls(namespace, &secret.name)
                .await
                .context(CredentialsSnafu)?,
        ),
        None => None,
    };

    let mut registry = RegistryClient::new(
        login.auth.to_registry_auth(),
        repository.is_insecure(),
        tls.as_ref(),
        timeout,
    );
    with_timeout(
        timeout,
        remote::build_from_oci_repository(
            &mut registry,
            &repository.spec.url,
            &login.auth,
            repository.is_insecure(),
            &chart.spec.chart,
            chart.version_or_default(),
            options,
            workdir,
        ),
    )
    .await?
    .context(BuildSnafu)
}

/// ARTIFACT phase: persist the build under the object lock and publish
/// the status fields.
async fn persist_build(
    ctx: &Ctx,
    chart: &HelmChart,
    status: &mut source_operator_crd::HelmChartStatus,
    generation: i64,
    build: &Build,
    source_revision: Option<String>,
) -> Result<()> {
    let revision = build.revision();

    let up_to_date = build.cached
        && status
            .artifact
            .as_ref()
            .map(|artifact| artifact.has_revision(revision))
            .unwrap_or(false);
    if up_to_date {
        conditions::set(
            &mut status.conditions,
            condition::ARTIFACT_IN_STORAGE,
            true,
            reason::SUCCEEDED,
            &format!("stored artifact for revision '{revision}'"),
            generation,
        );
        conditions::remove(&mut status.conditions, condition::RECONCILING);
        conditions::remove(&mut status.conditions, condition::FETCH_FAILED);
        conditions::remove(&mut status.conditions, condition::BUILD_FAILED);
        conditions::remove(&mut status.conditions, condition::ARTIFACT_OUTDATED);
        event::publish(
            chart,
            ctx.client.clone(),
            EventType::Normal,
            reason::ARTIFACT_UP_TO_DATE,
            Some(format!("artifact up-to-date with revision '{revision}'")),
        )
        .await
        .context(PublishEventSnafu)?;
        status.observed_source_artifact_revision = source_revision;
        status.observed_chart_name = Some(build.name.clone());
        return Ok(());
    }

    // The advertised artifact is now stale; the condition clears once the
    // replacement lands in storage, so it only surfaces when that fails.
    if let Some(superseded) = superseded_revision(status, build) {
        conditions::set(
            &mut status.conditions,
            condition::ARTIFACT_OUTDATED,
            true,
            reason::NEW_ARTIFACT,
            &format!(
                "chart '{}' version '{}' supersedes stored revision '{}'",
                build.name, build.version, superseded
            ),
            generation,
        );
    }

    event::publish(
        chart,
        ctx.client.clone(),
        EventType::Normal,
        if build.packaged {
            reason::CHART_PACKAGE_SUCCEEDED
        } else {
            reason::CHART_PULL_SUCCEEDED
        },
        Some(format!(
            "chart '{}' version '{}' ready for storage",
            build.name, build.version
        )),
    )
    .await
    .context(PublishEventSnafu)?;

    let mut artifact = ctx
        .storage
        .artifact_for(
            crate::queue::ResourceKind::HelmChart.as_kind_str(),
            &chart.metadata,
            revision,
            &artifact_filename(&format!("{}-{}", build.name, build.version), "tgz"),
        )
        .context(StorageSnafu)?;
    let _lock = ctx
        .storage
        .lock(&artifact, chart.timeout())
        .context(StorageSnafu)?;
    ctx.storage
        .copy_from_path(&mut artifact, &build.path)
        .context(StorageSnafu)?;
    let latest_url = ctx
        .storage
        .symlink(&artifact, LATEST_LINK)
        .context(StorageSnafu)?;

    event::publish(
        chart,
        ctx.client.clone(),
        EventType::Normal,
        reason::NEW_ARTIFACT,
        Some(event::new_artifact_note(
            &artifact.revision,
            artifact.digest.as_deref(),
        )),
    )
    .await
    .context(PublishEventSnafu)?;
    info!(
        "HelmChart {} stored artifact revision {}",
        chart.name_any(),
        artifact.revision
    );

    conditions::set(
        &mut status.conditions,
        condition::ARTIFACT_IN_STORAGE,
        true,
        reason::SUCCEEDED,
        &format!("stored artifact for revision '{}'", artifact.revision),
        generation,
    );
    conditions::remove(&mut status.conditions, condition::RECONCILING);
    conditions::remove(&mut status.conditions, condition::FETCH_FAILED);
    conditions::remove(&mut status.conditions, condition::BUILD_FAILED);
    conditions::remove(&mut status.conditions, condition::ARTIFACT_OUTDATED);
    conditions::remove(&mut status.conditions, condition::STALLED);

    status.url = Some(latest_url);
    status.artifact = Some(artifact);
    status.observed_source_artifact_revision = source_revision;
    status.observed_chart_name = Some(build.name.clone());
    Ok(())
}

/// The stored revision a fresh build replaces: set when the advertised
/// artifact no longer matches the resolved chart name and version.
fn superseded_revision(
    status: &source_operator_crd::HelmChartStatus,
    build: &Build,
) -> Option<String> {
    let current = status.artifact.as_ref()?;
    let name_changed = status
        .observed_chart_name
        .as_deref()
        .is_some_and(|name| name != build.name);
    if name_changed || !current.has_revision(build.revision()) {
        Some(current.revision.clone())
    } else {
        None
    }
}

/// Supplies dependency-repository credentials from HelmRepository
/// definitions in the chart's namespace.
struct NamespacedRepositoryCallback {
    client: Client,
    namespace: String,
}

#[async_trait]
impl RepositoryCredentials for NamespacedRepositoryCallback {
    async fn auth_for(&self, repository_url: &str) -> Auth {
        let api: Api<HelmRepository> = Api::namespaced(self.client.clone(), &self.namespace);
        let repositories = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(error) => {
                warn!("Failed to list HelmRepositories for dependencies: {}", error);
                return Auth::Anonymous;
            }
        };

        for repository in repositories {
            if normalize_url(&repository.spec.url) != normalize_url(repository_url) {
                continue;
            }
            let Some(secret) = &repository.spec.secret_ref else {
                continue;
            };
            let resolver = CredentialResolver::new(self.client.clone());
            match resolver
                .resolve(&self.namespace, Some(&secret.name), None, repository.provider(), "")
                .await
            {
                Ok(login) => return login.auth,
                Err(error) => {
                    warn!(
                        "Failed to resolve credentials of HelmRepository {}: {}",
                        repository.name_any(),
                        error
                    );
                }
            }
        }
        Auth::Anonymous
    }
}

fn normalize_url(url: &str) -> &str {
    url.trim_end_matches('/')
}

async fn with_timeout<T>(
    timeout: std::time::Duration,
    future: impl std::future::Future<Output = T>,
) -> Result<T> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::Timeout {
            seconds: timeout.as_secs(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use source_operator_crd::{Artifact, HelmChartStatus};

    #[test]
    fn normalize_url_ignores_trailing_slash() {
        assert_eq!(
            normalize_url("https://charts.example.com/"),
            normalize_url("https://charts.example.com")
        );
    }

    fn stored_status(chart_name: &str, revision: &str) -> HelmChartStatus {
        HelmChartStatus {
            artifact: Some(Artifact {
                revision: revision.into(),
                path: format!("helmchart/ns/app/{chart_name}-{revision}.tgz"),
                url: format!("http://host/helmchart/ns/app/{chart_name}-{revision}.tgz"),
                digest: None,
                last_update_time: Time(k8s_openapi::chrono::Utc::now()),
                metadata: None,
                size: None,
            }),
            observed_chart_name: Some(chart_name.into()),
            ..Default::default()
        }
    }

    fn test_build(name: &str, version: &str) -> Build {
        Build {
            name: name.into(),
            version: version.into(),
            path: std::path::PathBuf::from("/tmp/build.tgz"),
            packaged: false,
            cached: false,
            verified_by: None,
        }
    }

    #[test]
    fn matching_build_does_not_supersede() {
        let status = stored_status("podinfo", "6.2.0");
        assert_eq!(
            superseded_revision(&status, &test_build("podinfo", "6.2.0")),
            None
        );
    }

    #[test]
    fn version_bump_supersedes_the_stored_revision() {
        let status = stored_status("podinfo", "6.2.0");
        assert_eq!(
            superseded_revision(&status, &test_build("podinfo", "6.3.0")),
            Some("6.2.0".to_string())
        );
    }

    #[test]
    fn chart_name_change_supersedes_even_at_the_same_version() {
        let status = stored_status("podinfo", "6.2.0");
        assert_eq!(
            superseded_revision(&status, &test_build("renamed", "6.2.0")),
            Some("6.2.0".to_string())
        );
    }

    #[test]
    fn nothing_stored_means_nothing_superseded() {
        let status = HelmChartStatus::default();
        assert_eq!(
            superseded_revision(&status, &test_build("podinfo", "6.2.0")),
            None
        );
    }
}
