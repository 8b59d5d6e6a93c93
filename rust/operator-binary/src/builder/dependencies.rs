//! Chart dependency resolution.
//!
//! Declared dependencies with a remote repository are downloaded into the
//! chart's `charts/` directory before packaging. Credentials for a
//! repository URL come from a callback so that HelmRepository definitions
//! in the chart's namespace can supply them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use semver::Version;
use snafu::ResultExt;
use tracing::debug;

use registry_client::credentials::Auth;
use registry_client::index::HelmIndexClient;
use registry_client::{RegistryClient, HELM_CHART_CONTENT_MEDIA_TYPE};

use super::{chart::ChartMetadata, IndexSnafu, IoSnafu, RegistrySnafu, Result};

/// Maps a dependency repository URL to credentials. Implemented against
/// the HelmRepository objects of the owning chart's namespace.
#[async_trait]
pub trait RepositoryCredentials: Send + Sync {
    async fn auth_for(&self, repository_url: &str) -> Auth;
}

/// Fallback callback: everything resolves anonymously.
pub struct AnonymousCredentials;

#[async_trait]
impl RepositoryCredentials for AnonymousCredentials {
    async fn auth_for(&self, _repository_url: &str) -> Auth {
        Auth::Anonymous
    }
}

pub struct DependencyResolver<'a> {
    http: &'a ClientWithMiddleware,
    credentials: &'a dyn RepositoryCredentials,
    timeout: Duration,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(
        http: &'a ClientWithMiddleware,
        credentials: &'a dyn RepositoryCredentials,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            credentials,
            timeout,
        }
    }

    /// Downloads the missing remote dependencies of a chart into its
    /// `charts/` directory. Returns how many were materialized.
    pub async fn resolve(&self, chart_dir: &Path, metadata: &ChartMetadata) -> Result<usize> {
        if metadata.dependencies.is_empty() {
            return Ok(0);
        }

        let charts_dir = chart_dir.join("charts");
        std::fs::create_dir_all(&charts_dir).context(IoSnafu)?;

        let mut downloaded = 0;
        for dependency in &metadata.dependencies {
            let Some(repository) = dependency.repository.as_deref() else {
                // In-tree dependency, expected below charts/ already.
                continue;
            };
            if repository.starts_with("file://") {
                continue;
            }

            let fetched = if repository.starts_with("oci://") {
                self.pull_oci_dependency(repository, dependency, &charts_dir)
                    .await?
            } else {
                self.download_http_dependency(repository, dependency, &charts_dir)
                    .await?
            };
            if fetched {
                downloaded += 1;
            }
        }
        Ok(downloaded)
    }

    async fn pull_oci_dependency(
        &self,
        repository: &str,
        dependency: &super::chart::ChartDependency,
        charts_dir: &Path,
    ) -> Result<bool> {
        // An exact pin that is already vendored needs no registry
        // round-trip at all.
        let exact = Version::parse(dependency.version.trim_start_matches('v')).is_ok();
        if exact {
            let target = vendored_chart_path(charts_dir, &dependency.name, &dependency.version);
            if target.is_file() {
                debug!(
                    "Dependency {} {} already vendored",
                    dependency.name, dependency.version
                );
                return Ok(false);
            }
        }

        let auth = self.credentials.auth_for(repository).await;
        let mut client = RegistryClient::new(auth.to_registry_auth(), false, None, self.timeout);
        let reference = RegistryClient::parse_url(&format!(
            "{}/{}",
            repository.trim_end_matches('/'),
            dependency.name
        ))
        .context(RegistrySnafu)?;

        let tag = if exact {
            dependency.version.clone()
        } else {
            let tags = client.list_tags(&reference).await.context(RegistrySnafu)?;
            registry_client::select_semver_tag(&tags, &dependency.version, None)
                .context(RegistrySnafu)?
        };

        // The vendored file is keyed by the resolved tag, so constraint
        // ranges still hit the cache on later passes.
        let target = vendored_chart_path(charts_dir, &dependency.name, &tag);
        if target.is_file() {
            debug!("Dependency {} {} already vendored", dependency.name, tag);
            return Ok(false);
        }

        let pinned = registry_client::Reference::with_tag(
            reference.registry().to_string(),
            reference.repository().to_string(),
            tag,
        );
        let image = client
            .pull(&pinned, &[HELM_CHART_CONTENT_MEDIA_TYPE])
            .await
            .context(RegistrySnafu)?;
        let layer = registry_client::select_layer(&image, &[HELM_CHART_CONTENT_MEDIA_TYPE])
            .context(RegistrySnafu)?;
        std::fs::write(&target, &layer.data).context(IoSnafu)?;
        Ok(true)
    }

    async fn download_http_dependency(
        &self,
        repository: &str,
        dependency: &super::chart::ChartDependency,
        charts_dir: &Path,
    ) -> Result<bool> {
        let auth = self.credentials.auth_for(repository).await;
        let index_client =
            HelmIndexClient::new(self.http.clone(), repository, auth).context(IndexSnafu)?;
        let index = index_client.fetch_index().await.context(IndexSnafu)?;
        let entry = index
            .resolve(&dependency.name, &dependency.version)
            .context(IndexSnafu)?;

        // The chart download lands under the resolved entry version;
        // check the cache against that name, not the constraint string.
        let target = vendored_chart_path(charts_dir, &entry.name, &entry.version);
        if target.is_file() {
            debug!(
                "Dependency {} {} already vendored",
                entry.name, entry.version
            );
            return Ok(false);
        }

        if entry.version != dependency.version {
            debug!(
                "Dependency {} requested {:?}, vendoring {}",
                dependency.name, dependency.version, entry.version
            );
        }
        index_client
            .download_chart(entry, charts_dir)
            .await
            .context(IndexSnafu)?;
        Ok(true)
    }
}

fn vendored_chart_path(charts_dir: &Path, name: &str, version: &str) -> PathBuf {
    charts_dir.join(format!("{name}-{version}.tgz"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::chart::load_metadata;
    use reqwest_middleware::ClientBuilder;

    const INDEX: &str = r#"
apiVersion: v1
entries:
  redis:
    - name: redis
      version: 17.0.1
      urls: ["charts/redis-17.0.1.tgz"]
"#;

    fn write_chart_with_dependency(dir: &Path, version: &str, repository: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join("Chart.yaml"),
            format!(
                "apiVersion: v2\nname: app\nversion: 1.0.0\ndependencies:\n  - name: redis\n    version: \"{version}\"\n    repository: {repository}\n"
            ),
        )
        .unwrap();
    }

    fn resolver(http: &ClientWithMiddleware) -> DependencyResolver<'_> {
        DependencyResolver::new(http, &AnonymousCredentials, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn http_dependency_is_vendored_into_charts_dir() {
        let mut server = mockito::Server::new_async().await;
        let _index = server
            .mock("GET", "/index.yaml")
            .with_status(200)
            .with_body(INDEX)
            .create_async()
            .await;
        let _chart = server
            .mock("GET", "/charts/redis-17.0.1.tgz")
            .with_status(200)
            .with_body(b"chart bytes".as_slice())
            .create_async()
            .await;

        let tmp = tempfile::tempdir().unwrap();
        write_chart_with_dependency(tmp.path(), ">=17.0.0", &server.url());
        let metadata = load_metadata(tmp.path()).unwrap();

        let http = ClientBuilder::new(reqwest::Client::new()).build();
        let downloaded = resolver(&http).resolve(tmp.path(), &metadata).await.unwrap();

        assert_eq!(downloaded, 1);
        assert!(tmp.path().join("charts/redis-17.0.1.tgz").is_file());
    }

    #[tokio::test]
    async fn local_dependencies_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        write_chart_with_dependency(tmp.path(), ">=17.0.0", "file://../redis");
        let metadata = load_metadata(tmp.path()).unwrap();

        let http = ClientBuilder::new(reqwest::Client::new()).build();
        assert_eq!(resolver(&http).resolve(tmp.path(), &metadata).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn vendored_dependencies_are_not_downloaded_again() {
        // Only the index is mounted: a chart download attempt would 501.
        let mut server = mockito::Server::new_async().await;
        let _index = server
            .mock("GET", "/index.yaml")
            .with_status(200)
            .with_body(INDEX)
            .create_async()
            .await;

        let tmp = tempfile::tempdir().unwrap();
        write_chart_with_dependency(tmp.path(), ">=17.0.0", &server.url());
        // Pre-vendored under the version the constraint resolves to.
        std::fs::create_dir_all(tmp.path().join("charts")).unwrap();
        std::fs::write(tmp.path().join("charts/redis-17.0.1.tgz"), b"cached").unwrap();

        let metadata = load_metadata(tmp.path()).unwrap();
        let http = ClientBuilder::new(reqwest::Client::new()).build();
        assert_eq!(resolver(&http).resolve(tmp.path(), &metadata).await.unwrap(), 0);

        // The cached file is untouched.
        assert_eq!(
            std::fs::read(tmp.path().join("charts/redis-17.0.1.tgz")).unwrap(),
            b"cached"
        );
    }

    #[tokio::test]
    async fn vendored_exact_pin_skips_the_registry_entirely() {
        let tmp = tempfile::tempdir().unwrap();
        // An unreachable registry: any network attempt would fail loudly.
        write_chart_with_dependency(tmp.path(), "17.0.1", "oci://127.0.0.1:1/charts");
        std::fs::create_dir_all(tmp.path().join("charts")).unwrap();
        std::fs::write(tmp.path().join("charts/redis-17.0.1.tgz"), b"cached").unwrap();

        let metadata = load_metadata(tmp.path()).unwrap();
        let http = ClientBuilder::new(reqwest::Client::new()).build();
        assert_eq!(resolver(&http).resolve(tmp.path(), &metadata).await.unwrap(), 0);
    }
}
