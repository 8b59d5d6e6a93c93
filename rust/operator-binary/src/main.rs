mod builder;
mod conditions;
mod controller;
mod event;
mod fetcher;
mod finalizer;
mod index;
mod queue;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use reqwest_middleware::ClientBuilder;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use artifact_store::Storage;
use source_operator_crd::{
    parse_duration, Bucket, GitRepository, HelmChart, HelmRepository, OCIRepository, SourceKind,
};

use crate::controller::{Ctx, Outcome};
use crate::index::ChangeIndex;
use crate::queue::{ObjectKey, ResourceKind, WorkQueue};

#[derive(Parser)]
#[clap(about, author, version)]
struct Opts {
    /// Root directory of the artifact store.
    #[arg(long, env = "SOURCE_STORAGE_ROOT", default_value = "/data")]
    storage_root: PathBuf,

    /// Host under which stored artifacts are advertised to consumers.
    #[arg(long, env = "SOURCE_STORAGE_ADDR", default_value = "localhost:9090")]
    storage_addr: String,

    /// Host override for upstream artifact URLs, for running outside the
    /// cluster.
    #[arg(long, env = "SOURCE_HOST")]
    source_host: Option<String>,

    /// Transient-retry count of the HTTP download client.
    #[arg(long, env = "SOURCE_HTTP_RETRY")]
    http_retry: Option<u32>,

    /// Number of concurrent reconciliations.
    #[arg(long, env = "SOURCE_CONCURRENT", default_value_t = 2)]
    concurrent: usize,

    /// Age beyond which superseded artifacts are garbage collected.
    #[arg(long, env = "SOURCE_ARTIFACT_RETENTION_TTL", default_value = "60s")]
    artifact_retention_ttl: String,

    /// Number of superseded artifacts retained per object.
    #[arg(long, env = "SOURCE_ARTIFACT_RETENTION_RECORDS", default_value_t = 2)]
    artifact_retention_records: usize,

    /// Restrict watches to one namespace instead of the whole cluster.
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("SOURCE_OPERATOR_LOG")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_logfmt::layer())
        .init();

    let retention_ttl = parse_duration(&opts.artifact_retention_ttl)?;
    info!("Storing artifacts in {:?}", opts.storage_root);
    let storage = Arc::new(Storage::new(
        &opts.storage_root,
        &opts.storage_addr,
        retention_ttl,
        opts.artifact_retention_records,
    )?);

    let client = Client::try_default().await?;

    let retry_policy =
        ExponentialBackoff::builder().build_with_max_retries(opts.http_retry.unwrap_or(3));
    let http = ClientBuilder::new(reqwest::Client::new())
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build();

    let queue = Arc::new(WorkQueue::default());
    let index = Arc::new(ChangeIndex::new());
    let ctx = Arc::new(Ctx {
        client: client.clone(),
        storage,
        queue: queue.clone(),
        index: index.clone(),
        http,
        source_host: opts.source_host.clone(),
    });

    let namespace = opts.watch_namespace.as_deref();
    let mut watchers = Vec::new();
    watchers.push(tokio::spawn(watch_owned::<HelmChart>(
        api_for(&client, namespace),
        ResourceKind::HelmChart,
        ctx.clone(),
    )));
    watchers.push(tokio::spawn(watch_owned::<HelmRepository>(
        api_for(&client, namespace),
        ResourceKind::HelmRepository,
        ctx.clone(),
    )));
    watchers.push(tokio::spawn(watch_owned::<OCIRepository>(
        api_for(&client, namespace),
        ResourceKind::OCIRepository,
        ctx.clone(),
    )));
    watchers.push(tokio::spawn(watch_upstream::<GitRepository>(
        api_for(&client, namespace),
        SourceKind::GitRepository,
        ctx.clone(),
    )));
    watchers.push(tokio::spawn(watch_upstream::<Bucket>(
        api_for(&client, namespace),
        SourceKind::Bucket,
        ctx.clone(),
    )));

    let mut workers = Vec::new();
    for worker_id in 0..opts.concurrent.max(1) {
        workers.push(tokio::spawn(run_worker(worker_id, ctx.clone())));
    }
    info!("Started {} reconciliation workers", workers.len());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    queue.shutdown();
    for watcher_task in &watchers {
        watcher_task.abort();
    }
    for worker in workers {
        let _ = worker.await;
    }

    Ok(())
}

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = ()>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

/// Watches a reconciled kind and keeps its keys flowing into the queue.
/// HelmRepository events additionally fan out to dependent charts.
async fn watch_owned<K>(api: Api<K>, kind: ResourceKind, ctx: Arc<Ctx>)
where
    K: Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    let mut stream = Box::pin(watcher(api, watcher::Config::default()));
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(object)) | Ok(watcher::Event::InitApply(object)) => {
                let Some(key) = key_of(&object, kind) else {
                    continue;
                };
                if kind == ResourceKind::HelmRepository {
                    fan_out_helm_repository(&object, &key, &ctx).await;
                }
                ctx.queue.add(key).await;
            }
            Ok(watcher::Event::Delete(object)) => {
                if let Some(key) = key_of(&object, kind) {
                    // The reconciler observes the deletion itself; it only
                    // needs a wake-up.
                    ctx.queue.add(key).await;
                }
            }
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
            Err(error) => {
                warn!("Watcher for {:?} failed: {}", kind, error);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Watches an upstream kind owned by a sibling controller; its revision
/// changes re-enqueue dependent charts.
async fn watch_upstream<K>(api: Api<K>, kind: SourceKind, ctx: Arc<Ctx>)
where
    K: Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    let mut stream = Box::pin(watcher(api, watcher::Config::default()));
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(object)) | Ok(watcher::Event::InitApply(object)) => {
                let Some(namespace) = object.namespace() else {
                    continue;
                };
                let revision = upstream_revision(&object);
                for dependent in ctx.index.drifted_dependents(
                    kind,
                    &namespace,
                    &object.name_any(),
                    revision.as_deref(),
                ) {
                    debug!("Upstream {} changed, enqueueing {}", object.name_any(), dependent);
                    ctx.queue.add(dependent).await;
                }
            }
            Ok(_) => {}
            Err(error) => {
                warn!("Watcher for {} failed: {}", kind, error);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Re-enqueues the charts depending on a HelmRepository whose artifact
/// revision drifted. OCI repositories advertise no artifact, so their
/// dependents resolve by repository URL.
async fn fan_out_helm_repository<K>(object: &K, key: &ObjectKey, ctx: &Arc<Ctx>)
where
    K: Resource<DynamicType = ()> + serde::Serialize,
{
    let value = match serde_json::to_value(object) {
        Ok(value) => value,
        Err(_) => return,
    };

    let revision = value
        .pointer("/status/artifact/revision")
        .and_then(|revision| revision.as_str())
        .map(str::to_string);

    let dependents = match revision {
        Some(revision) => ctx.index.drifted_dependents(
            SourceKind::HelmRepository,
            &key.namespace,
            &key.name,
            Some(&revision),
        ),
        None => value
            .pointer("/spec/url")
            .and_then(|url| url.as_str())
            .map(|url| ctx.index.charts_for_repository_url(url))
            .unwrap_or_default(),
    };
    for dependent in dependents {
        debug!("HelmRepository {} changed, enqueueing {}", key, dependent);
        ctx.queue.add(dependent).await;
    }
}

fn upstream_revision<K>(object: &K) -> Option<String>
where
    K: Resource<DynamicType = ()> + serde::Serialize,
{
    serde_json::to_value(object)
        .ok()?
        .pointer("/status/artifact/revision")?
        .as_str()
        .map(str::to_string)
}

fn key_of<K>(object: &K, kind: ResourceKind) -> Option<ObjectKey>
where
    K: Resource<DynamicType = ()>,
{
    Some(ObjectKey::new(kind, object.namespace()?, object.name_any()))
}

/// One worker: pulls keys, dispatches to the kind reconciler, schedules
/// follow-ups. Reconciliations run on their own task so a panic is
/// contained and reported instead of taking the worker down.
async fn run_worker(worker_id: usize, ctx: Arc<Ctx>) {
    while let Some(key) = ctx.queue.next().await {
        let task_ctx = ctx.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move { dispatch(task_key, task_ctx).await });

        match handle.await {
            Ok(Ok(Outcome::Success { requeue_after })) => {
                ctx.queue.forget(&key).await;
                ctx.queue.add_after(key.clone(), requeue_after).await;
            }
            Ok(Ok(Outcome::Requeue)) => {
                ctx.queue.add(key.clone()).await;
            }
            Ok(Ok(Outcome::Stalled)) => {
                // Parked: only a generation or reconcile-request change
                // (delivered by the watcher) wakes the object again.
                ctx.queue.forget(&key).await;
            }
            Ok(Ok(Outcome::Deleted)) | Ok(Ok(Outcome::Suspended)) => {
                ctx.queue.forget(&key).await;
            }
            Ok(Err(error)) => {
                error!("Reconciliation of {} failed: {}", key, error);
                let delay = ctx.queue.add_rate_limited(key.clone()).await;
                debug!("Retrying {} in {}", key, humantime::format_duration(delay));
            }
            Err(join_error) => {
                // Recovered worker panic.
                error!(
                    "Reconciliation of {} panicked on worker {}: {}",
                    key, worker_id, join_error
                );
                ctx.queue.add_rate_limited(key.clone()).await;
            }
        }
        ctx.queue.done(&key).await;
    }
    debug!("Worker {} stopped", worker_id);
}

async fn dispatch(key: ObjectKey, ctx: Arc<Ctx>) -> Result<Outcome, String> {
    match key.kind {
        ResourceKind::HelmChart => controller::helm_chart::reconcile(&key, &ctx)
            .await
            .map_err(|error| error.to_string()),
        ResourceKind::HelmRepository => controller::helm_repository::reconcile(&key, &ctx)
            .await
            .map_err(|error| error.to_string()),
        ResourceKind::OCIRepository => controller::oci_repository::reconcile(&key, &ctx)
            .await
            .map_err(|error| error.to_string()),
    }
}
