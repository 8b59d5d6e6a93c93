use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info};

use registry_client::credentials::CredentialResolver;
use registry_client::index::HelmIndexClient;
use registry_client::RegistryClient;
use source_operator_crd::condition::reason;
use source_operator_crd::{condition, reconcile_annotation_value, HelmRepository};

use crate::conditions;
use crate::event;
use crate::finalizer;
use crate::queue::ObjectKey;

use super::{
    drop_missing_artifact, jittered, observed_generation, patch_status, refresh_urls, Ctx,
    Outcome, GC_LOCK_TIMEOUT,
};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Failed to get object: {}", source))]
    GetObject { source: kube::Error },

    #[snafu(display("Failed to patch finalizer: {}", source))]
    Finalizer { source: kube::Error },

    #[snafu(display("Failed to patch status: {}", source))]
    PatchStatus { source: kube::Error },

    #[snafu(display("Failed to publish event: {}", source))]
    PublishEvent { source: crate::event::Error },

    #[snafu(display("Object has no namespace associated"))]
    NoNamespace,

    #[snafu(display("Invalid repository URL {:?}", url))]
    UrlInvalid { url: String },

    #[snafu(display("Failed to resolve credentials: {}", source))]
    Credentials {
        source: registry_client::credentials::Error,
    },

    #[snafu(display("Registry login failed: {}", source))]
    Registry { source: registry_client::Error },

    #[snafu(display("Failed to fetch repository index: {}", source))]
    Index {
        source: registry_client::index::Error,
    },

    #[snafu(display("Storage operation failed: {}", source))]
    Storage { source: artifact_store::Error },

    #[snafu(display("Failed to stage repository index: {}", source))]
    StageIndex { source: std::io::Error },

    #[snafu(display("Operation timed out after {}s", seconds))]
    Timeout { seconds: u64 },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    fn is_stalling(&self) -> bool {
        match self {
            Error::UrlInvalid { .. } => true,
            Error::Index { source } => source.is_stalling(),
            Error::Registry { source } => source.is_stalling(),
            _ => false,
        }
    }

    fn condition(&self) -> (&'static str, &'static str) {
        match self {
            Error::UrlInvalid { .. } => (condition::STALLED, reason::URL_INVALID),
            Error::Credentials { .. } => (condition::FETCH_FAILED, reason::AUTHENTICATION_FAILED),
            Error::Storage { .. } | Error::StageIndex { .. } => (
                condition::STORAGE_OPERATION_FAILED,
                reason::STORAGE_OPERATION_FAILED,
            ),
            _ => (condition::FETCH_FAILED, reason::FAILED),
        }
    }
}

pub async fn reconcile(key: &ObjectKey, ctx: &Ctx) -> Result<Outcome> {
    let api: Api<HelmRepository> = Api::namespaced(ctx.client.clone(), &key.namespace);

    // FETCHED
    let Some(repository) = api.get_opt(&key.name).await.context(GetObjectSnafu)? else {
        return Ok(Outcome::Deleted);
    };

    if repository.metadata.deletion_timestamp.is_some() {
        ctx.storage
            .remove_all(key.kind.as_kind_str(), &repository.metadata)
            .context(StorageSnafu)?;
        finalizer::remove(&api, &repository)
            .await
            .context(FinalizerSnafu)?;
        info!("HelmRepository {} deleted, artifacts removed", key);
        return Ok(Outcome::Deleted);
    }

    if !finalizer::has_finalizer(&repository) {
        finalizer::add(&api, &repository)
            .await
            .context(FinalizerSnafu)?;
        return Ok(Outcome::Requeue);
    }

    if repository.spec.suspend {
        debug!("HelmRepository {} suspended, skipping", key);
        return Ok(Outcome::Suspended);
    }

    let generation = repository.metadata.generation.unwrap_or(0);
    let mut status = repository.status.clone().unwrap_or_default();
    let reconcile_request = reconcile_annotation_value(&repository.metadata);
    let force = match &reconcile_request {
        Some(requested) => status.last_handled_reconcile_at.as_ref() != Some(requested),
        None => false,
    };

    // STORAGE
    let mut phase_error: Option<Error> = None;
    if let Some(artifact) = &status.artifact {
        if let Err(source) = ctx.storage.garbage_collect(artifact, GC_LOCK_TIMEOUT) {
            event::publish(
                &repository,
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
        phase_error = if repository.is_oci() {
            reconcile_oci(ctx, &repository, &mut status, generation).await.err()
        } else {
            reconcile_http(ctx, &repository, &mut status, generation, force)
                .await
                .err()
        };
    }

    if let Some(error) = &phase_error {
        let (condition_type, condition_reason) = error.condition();
        conditions::set(
            &mut status.conditions,
            condition_type,
            true,
            condition_reason,
            &error.to_string(),
            generation,
        );
        if error.is_stalling() && condition_type != condition::STALLED {
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

    if let Some(transition) = transition {
        let event_type = if transition.ready {
            EventType::Normal
        } else {
            EventType::Warning
        };
        event::publish(
            &repository,
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
            requeue_after: jittered(repository.interval()),
        }),
    }
}

/// OCI repositories carry no artifact; reconciliation validates the URL
/// and the registry login, then reports readiness directly.
async fn reconcile_oci(
    ctx: &Ctx,
    repository: &HelmRepository,
    status: &mut source_operator_crd::HelmRepositoryStatus,
    generation: i64,
) -> Result<()> {
    let namespace = repository.namespace().context(NoNamespaceSnafu)?;
    let reference = RegistryClient::parse_url(&repository.spec.url).map_err(|_| {
        Error::UrlInvalid {
            url: repository.spec.url.clone(),
        }
    })?;

    let resolver = CredentialResolver::new(ctx.client.clone());
    let login = resolver
        .resolve(
            &namespace,
            repository
                .spec
                .secret_ref
                .as_ref()
                .map(|secret| secret.name.as_str()),
            repository.spec.service_account_name.as_deref(),
            repository.provider(),
            reference.registry(),
        )
        .await
        .context(CredentialsSnafu)?;
    let tls = match &repository.spec.cert_secret_ref {
        Some(secret) => Some(
            resolver
                .resolve_tls(&namespace, &secret.name)
                .await
                .context(CredentialsSnafu)?,
        ),
        None => None,
    };

    let mut registry = RegistryClient::new(
        login.auth.to_registry_auth(),
        repository.is_insecure(),
        tls.as_ref(),
        repository.timeout(),
    );
    tokio::time::timeout(repository.timeout(), registry.login(&reference))
        .await
        .map_err(|_| Error::Timeout {
            seconds: repository.timeout().as_secs(),
        })?
        .context(RegistrySnafu)?;

    conditions::remove(&mut status.conditions, condition::FETCH_FAILED);
    conditions::remove(&mut status.conditions, condition::STALLED);
    conditions::remove(&mut status.conditions, condition::RECONCILING);
    conditions::set(
        &mut status.conditions,
        condition::READY,
        true,
        reason::SUCCEEDED,
        "Helm repository is ready",
        generation,
    );
    Ok(())
}

/// Default repositories produce the downloaded `index.yaml` as their
/// artifact; its checksum is the revision dependents observe.
async fn reconcile_http(
    ctx: &Ctx,
    repository: &HelmRepository,
    status: &mut source_operator_crd::HelmRepositoryStatus,
    generation: i64,
    force: bool,
) -> Result<()> {
    let namespace = repository.namespace().context(NoNamespaceSnafu)?;
    url::Url::parse(&repository.spec.url).map_err(|_| Error::UrlInvalid {
        url: repository.spec.url.clone(),
    })?;

    let resolver = CredentialResolver::new(ctx.client.clone());
    let login = match &repository.spec.secret_ref {
        Some(secret) => resolver
            .resolve(&namespace, Some(&secret.name), None, repository.provider(), "")
            .await
            .context(CredentialsSnafu)?,
        None => Default::default(),
    };

    let client = HelmIndexClient::new(ctx.http.clone(), &repository.spec.url, login.auth.clone())
        .context(IndexSnafu)?;
    let bytes = tokio::time::timeout(repository.timeout(), client.fetch_index_bytes())
        .await
        .map_err(|_| Error::Timeout {
            seconds: repository.timeout().as_secs(),
        })?
        .context(IndexSnafu)?;

    let revision = format!("{:x}", Sha256::digest(&bytes));
    let up_to_date = status
        .artifact
        .as_ref()
        .map(|artifact| artifact.has_revision(&revision))
        .unwrap_or(false)
        && !force;
    if up_to_date {
        conditions::set(
            &mut status.conditions,
            condition::ARTIFACT_IN_STORAGE,
            true,
            reason::SUCCEEDED,
            &format!("stored artifact for revision '{revision}'"),
            generation,
        );
        conditions::remove(&mut status.conditions, condition::ARTIFACT_OUTDATED);
        event::publish(
            repository,
            ctx.client.clone(),
            EventType::Normal,
            reason::ARTIFACT_UP_TO_DATE,
            Some(format!("artifact up-to-date with revision '{revision}'")),
        )
        .await
        .context(PublishEventSnafu)?;
        return Ok(());
    }

    conditions::set(
        &mut status.conditions,
        condition::RECONCILING,
        true,
        reason::PROGRESSING,
        &format!("building artifact for revision '{revision}'"),
        generation,
    );

    // The stored index is now stale; the condition clears once the
    // replacement lands in storage.
    if let Some(current) = &status.artifact {
        if !current.has_revision(&revision) {
            conditions::set(
                &mut status.conditions,
                condition::ARTIFACT_OUTDATED,
                true,
                reason::NEW_ARTIFACT,
                &format!(
                    "new index revision '{}' supersedes stored revision '{}'",
                    revision, current.revision
                ),
                generation,
            );
        }
    }

    // ARTIFACT
    let mut artifact = ctx
        .storage
        .artifact_for(
            crate::queue::ResourceKind::HelmRepository.as_kind_str(),
            &repository.metadata,
            &revision,
            &format!("index-{}.yaml", &revision[..12.min(revision.len())]),
        )
        .context(StorageSnafu)?;
    let _lock = ctx
        .storage
        .lock(&artifact, repository.timeout())
        .context(StorageSnafu)?;

    let staging = tempfile::NamedTempFile::new().context(StageIndexSnafu)?;
    std::fs::write(staging.path(), &bytes).context(StageIndexSnafu)?;
    ctx.storage
        .copy_from_path(&mut artifact, staging.path())
        .context(StorageSnafu)?;

    event::publish(
        repository,
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
        "HelmRepository {} stored index revision {}",
        repository.name_any(),
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
    conditions::remove(&mut status.conditions, condition::ARTIFACT_OUTDATED);
    conditions::remove(&mut status.conditions, condition::STALLED);

    status.url = Some(artifact.url.clone());
    status.artifact = Some(artifact);
    Ok(())
}
