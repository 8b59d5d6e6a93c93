use std::io::Write;

use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info};

use artifact_store::{artifact_filename, LATEST_LINK};
use registry_client::credentials::CredentialResolver;
use registry_client::verify::verify_artifact;
use registry_client::{RegistryClient, GENERIC_CONTENT_MEDIA_TYPES};
use source_operator_crd::condition::reason;
use source_operator_crd::{
    condition, reconcile_annotation_value, Artifact, OCILayerOperation, OCIRepository,
};

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

    #[snafu(display("Failed to resolve credentials: {}", source))]
    Credentials {
        source: registry_client::credentials::Error,
    },

    #[snafu(display("Registry operation failed: {}", source))]
    Registry { source: registry_client::Error },

    #[snafu(display("Verification failed: {}", source))]
    Verification {
        source: registry_client::verify::Error,
    },

    #[snafu(display("Storage operation failed: {}", source))]
    Storage { source: artifact_store::Error },

    #[snafu(display("Failed to unpack artifact layer: {}", source))]
    LayerExtract { source: std::io::Error },

    #[snafu(display("Operation timed out after {}s", seconds))]
    Timeout { seconds: u64 },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    fn is_stalling(&self) -> bool {
        match self {
            Error::Registry { source } => source.is_stalling(),
            Error::Verification { .. } => true,
            _ => false,
        }
    }

    /// The sub-condition and reason this failure records.
    fn condition(&self) -> (&'static str, &'static str) {
        match self {
            Error::Credentials { .. } => (condition::FETCH_FAILED, reason::AUTHENTICATION_FAILED),
            Error::Verification { .. } => (condition::SOURCE_VERIFIED, reason::VERIFICATION_ERROR),
            Error::Storage { .. } | Error::LayerExtract { .. } => (
                condition::STORAGE_OPERATION_FAILED,
                reason::STORAGE_OPERATION_FAILED,
            ),
            Error::Registry { source } if source.is_stalling() => match source {
                registry_client::Error::InvalidUrl { .. } => {
                    (condition::STALLED, reason::URL_INVALID)
                }
                _ => (condition::STALLED, reason::INVALID_CHART_REFERENCE),
            },
            _ => (condition::FETCH_FAILED, reason::FAILED),
        }
    }
}

pub async fn reconcile(key: &ObjectKey, ctx: &Ctx) -> Result<Outcome> {
    let api: Api<OCIRepository> = Api::namespaced(ctx.client.clone(), &key.namespace);

    // FETCHED
    let Some(repository) = api.get_opt(&key.name).await.context(GetObjectSnafu)? else {
        return Ok(Outcome::Deleted);
    };

    if repository.metadata.deletion_timestamp.is_some() {
        return finalize_deletion(&api, &repository, key, ctx).await;
    }

    if !finalizer::has_finalizer(&repository) {
        finalizer::add(&api, &repository).await.context(FinalizerSnafu)?;
        return Ok(Outcome::Requeue);
    }

    if repository.spec.suspend {
        debug!("OCIRepository {} suspended, skipping", key);
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
    let storage_result = reconcile_storage(ctx, &repository, &mut status, generation).await;

    // SOURCE + ARTIFACT
    let phase_error = match storage_result {
        Err(error) => Some(error),
        Ok(()) => {
            match reconcile_source(ctx, &repository, &mut status, generation, force).await {
                Ok(()) => None,
                Err(error) => Some(error),
            }
        }
    };

    if let Some(error) = &phase_error {
        let (condition_type, condition_reason) = error.condition();
        let stalling = error.is_stalling();
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
        // Persistent failures park the object instead of hot-looping.
        if stalling {
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

async fn finalize_deletion(
    api: &Api<OCIRepository>,
    repository: &OCIRepository,
    key: &ObjectKey,
    ctx: &Ctx,
) -> Result<Outcome> {
    // The artifact subtree must be empty before the finalizer clears.
    ctx.storage
        .remove_all(key.kind.as_kind_str(), &repository.metadata)
        .context(StorageSnafu)?;
    finalizer::remove(api, repository)
        .await
        .context(FinalizerSnafu)?;
    info!("OCIRepository {} deleted, artifacts removed", key);
    Ok(Outcome::Deleted)
}

async fn reconcile_storage(
    ctx: &Ctx,
    repository: &OCIRepository,
    status: &mut source_operator_crd::OCIRepositoryStatus,
    generation: i64,
) -> Result<()> {
    if let Some(artifact) = &status.artifact {
        match ctx.storage.garbage_collect(artifact, GC_LOCK_TIMEOUT) {
            Ok(deleted) if !deleted.is_empty() => {
                event::publish(
                    repository,
                    ctx.client.clone(),
                    EventType::Normal,
                    reason::GARBAGE_COLLECTION_SUCCEEDED,
                    Some(format!("garbage collected {} artifacts", deleted.len())),
                )
                .await
                .context(PublishEventSnafu)?;
            }
            Ok(_) => {}
            Err(source) => {
                event::publish(
                    repository,
                    ctx.client.clone(),
                    EventType::Warning,
                    reason::GARBAGE_COLLECTION_FAILED,
                    Some(source.to_string()),
                )
                .await
                .context(PublishEventSnafu)?;
                return Err(Error::Storage { source });
            }
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
    Ok(())
}

async fn reconcile_source(
    ctx: &Ctx,
    repository: &OCIRepository,
    status: &mut source_operator_crd::OCIRepositoryStatus,
    generation: i64,
    force: bool,
) -> Result<()> {
    let namespace = repository.namespace().context(NoNamespaceSnafu)?;
    let timeout = repository.timeout();

    // Credentials and TLS material.
    let resolver = CredentialResolver::new(ctx.client.clone());
    let registry_host = RegistryClient::parse_url(&repository.spec.url)
        .context(RegistrySnafu)?
        .registry()
        .to_string();
    let login = resolver
        .resolve(
            &namespace,
            repository
                .spec
                .secret_ref
                .as_ref()
                .map(|reference| reference.name.as_str()),
            repository.spec.service_account_name.as_deref(),
            repository.provider(),
            &registry_host,
        )
        .await
        .context(CredentialsSnafu)?;
    let tls = match &repository.spec.cert_secret_ref {
        Some(reference) => Some(
            resolver
                .resolve_tls(&namespace, &reference.name)
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

    // Resolve the pinned reference and its revision.
    let resolved = with_timeout(
        timeout,
        registry.resolve(&repository.spec.url, repository.spec.reference.as_ref()),
    )
    .await?
    .context(RegistrySnafu)?;

    let up_to_date = status
        .artifact
        .as_ref()
        .map(|artifact| artifact.has_revision(&resolved.revision))
        .unwrap_or(false)
        && !repository.content_config_changed()
        && !force;
    if up_to_date {
        conditions::set(
            &mut status.conditions,
            condition::ARTIFACT_IN_STORAGE,
            true,
            reason::SUCCEEDED,
            &format!("stored artifact for revision '{}'", resolved.revision),
            generation,
        );
        conditions::remove(&mut status.conditions, condition::ARTIFACT_OUTDATED);
        event::publish(
            repository,
            ctx.client.clone(),
            EventType::Normal,
            reason::ARTIFACT_UP_TO_DATE,
            Some(format!(
                "artifact up-to-date with remote revision '{}'",
                resolved.revision
            )),
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
        &format!("building artifact for revision '{}'", resolved.revision),
        generation,
    );

    // The advertised artifact is now stale; the condition clears once the
    // replacement lands in storage.
    if let Some(current) = &status.artifact {
        if !current.has_revision(&resolved.revision) {
            conditions::set(
                &mut status.conditions,
                condition::ARTIFACT_OUTDATED,
                true,
                reason::NEW_ARTIFACT,
                &format!(
                    "new upstream revision '{}' supersedes stored revision '{}'",
                    resolved.revision, current.revision
                ),
                generation,
            );
        }
    }

    // Verification runs against the pinned reference before anything is
    // persisted.
    if let Some(verification) = &repository.spec.verify {
        let keys = match &verification.secret_ref {
            Some(reference) => resolver
                .resolve_verification_keys(&namespace, &reference.name)
                .await
                .context(CredentialsSnafu)?,
            None => Vec::new(),
        };
        let verified = verify_artifact(
            &resolved.reference.whole(),
            &login.auth,
            verification,
            &keys,
            repository.is_insecure(),
        )
        .await
        .context(VerificationSnafu)?;
        debug!("OCIRepository {} verified: {:?}", repository.name_any(), verified);
        conditions::set(
            &mut status.conditions,
            condition::SOURCE_VERIFIED,
            true,
            reason::SUCCEEDED,
            &format!("verified signature of revision '{}'", resolved.revision),
            generation,
        );
    } else {
        conditions::remove(&mut status.conditions, condition::SOURCE_VERIFIED);
    }

    // Pull and select the layer.
    let accepted: Vec<&str> = match repository
        .spec
        .layer_selector
        .as_ref()
        .and_then(|selector| selector.media_type.as_deref())
    {
        Some(media_type) => vec![media_type],
        None => GENERIC_CONTENT_MEDIA_TYPES.to_vec(),
    };
    let image = with_timeout(timeout, registry.pull(&resolved.reference, &accepted))
        .await?
        .context(RegistrySnafu)?;
    let layer = registry_client::select_layer(&image, &accepted).context(RegistrySnafu)?;

    // ARTIFACT: stage the layer and persist it under the object lock.
    let mut artifact = ctx
        .storage
        .artifact_for(
            crate::queue::ResourceKind::OCIRepository.as_kind_str(),
            &repository.metadata,
            &resolved.revision,
            &artifact_filename(&resolved.revision, "tgz"),
        )
        .context(StorageSnafu)?;
    let _lock = ctx
        .storage
        .lock(&artifact, timeout)
        .context(StorageSnafu)?;

    let staging = tempfile::tempdir().context(LayerExtractSnafu)?;
    match repository.layer_operation() {
        OCILayerOperation::Copy => {
            let layer_path = staging.path().join("layer.tgz");
            let mut file = std::fs::File::create(&layer_path).context(LayerExtractSnafu)?;
            file.write_all(&layer.data).context(LayerExtractSnafu)?;
            ctx.storage
                .copy_from_path(&mut artifact, &layer_path)
                .context(StorageSnafu)?;
        }
        OCILayerOperation::Extract => {
            let content_dir = staging.path().join("content");
            let decoder = flate2::read::GzDecoder::new(layer.data.as_slice());
            tar::Archive::new(decoder)
                .unpack(&content_dir)
                .context(LayerExtractSnafu)?;
            ctx.storage
                .archive(&mut artifact, &content_dir, repository.spec.ignore.as_deref())
                .context(StorageSnafu)?;
        }
    }
    let latest_url = ctx
        .storage
        .symlink(&artifact, LATEST_LINK)
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
        "OCIRepository {} stored artifact revision {}",
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

    status.artifact = Some(artifact);
    status.url = Some(latest_url);
    status.observed_ignore = repository.spec.ignore.clone();
    status.observed_layer_selector = repository.spec.layer_selector.clone();
    Ok(())
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
