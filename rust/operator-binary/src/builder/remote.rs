//! Remote chart builds: pull a packaged chart from an OCI registry or an
//! HTTP repository index, optionally verify its signature and repackage
//! it with merged values.

use std::fs;
use std::path::Path;

use reqwest_middleware::ClientWithMiddleware;
use semver::Version;
use snafu::ResultExt;
use tracing::{debug, info};

use registry_client::credentials::Auth;
use registry_client::index::{HelmIndexClient, RepositoryIndex};
use registry_client::verify::{verify_artifact, VerifiedBy};
use registry_client::{RegistryClient, HELM_CHART_CONTENT_MEDIA_TYPE};

use super::chart::{self, ChartMetadata};
use super::{
    apply_version_metadata, cached_build, Build, BuildOptions, IndexSnafu, IoSnafu, RegistrySnafu,
    Result, VerificationSnafu,
};

/// Pulls a chart from an OCI Helm repository. `repository_url` is the
/// `oci://` root, chart tags are chart versions.
#[allow(clippy::too_many_arguments)]
pub async fn build_from_oci_repository(
    registry: &mut RegistryClient,
    repository_url: &str,
    auth: &Auth,
    insecure: bool,
    chart_name: &str,
    version_range: &str,
    options: &BuildOptions,
    workdir: &Path,
) -> Result<Build> {
    let chart_url = format!(
        "{}/{}",
        repository_url.trim_end_matches('/'),
        chart_name
    );
    let base = RegistryClient::parse_url(&chart_url).context(RegistrySnafu)?;

    // Exact versions map straight to a tag, ranges resolve via the tag
    // list.
    let tag = match Version::parse(version_range.trim_start_matches('v')) {
        Ok(_) => version_range.to_string(),
        Err(_) => {
            let tags = registry.list_tags(&base).await.context(RegistrySnafu)?;
            registry_client::select_semver_tag(&tags, version_range, None)
                .context(RegistrySnafu)?
        }
    };

    let expected_version = match &options.version_metadata {
        Some(metadata) => apply_version_metadata(&tag, metadata)?,
        None => tag.clone(),
    };
    if let Some(build) = cached_build(options, &expected_version) {
        debug!("Chart {} {} already built, skipping pull", chart_name, tag);
        return Ok(build);
    }

    let reference = registry_client::Reference::with_tag(
        base.registry().to_string(),
        base.repository().to_string(),
        tag.clone(),
    );

    let verified_by = match &options.verify {
        Some(verification) => Some(
            verify_artifact(
                &reference.whole(),
                auth,
                verification,
                &options.verification_keys,
                insecure,
            )
            .await
            .context(VerificationSnafu)?,
        ),
        None => None,
    };

    let image = registry
        .pull(&reference, &[HELM_CHART_CONTENT_MEDIA_TYPE])
        .await
        .context(RegistrySnafu)?;
    let layer = registry_client::select_layer(&image, &[HELM_CHART_CONTENT_MEDIA_TYPE])
        .context(RegistrySnafu)?;

    fs::create_dir_all(workdir).context(IoSnafu)?;
    let pulled = workdir.join(format!("{chart_name}-{tag}.tgz"));
    fs::write(&pulled, &layer.data).context(IoSnafu)?;
    info!("Pulled chart {} version {}", chart_name, tag);

    let metadata = chart::read_metadata_from_archive(&pulled)?;
    finish_remote_build(metadata, pulled, options, workdir, verified_by)
}

/// Builds a chart from the index artifact of an HTTP Helm repository.
#[allow(clippy::too_many_arguments)]
pub async fn build_from_index(
    http: &ClientWithMiddleware,
    index_path: &Path,
    repository_url: &str,
    auth: Auth,
    chart_name: &str,
    version_range: &str,
    options: &BuildOptions,
    workdir: &Path,
) -> Result<Build> {
    let contents = fs::read(index_path).context(IoSnafu)?;
    let index = RepositoryIndex::parse(&contents).context(IndexSnafu)?;
    let entry = index
        .resolve(chart_name, version_range)
        .context(IndexSnafu)?;

    let expected_version = match &options.version_metadata {
        Some(metadata) => apply_version_metadata(&entry.version, metadata)?,
        None => entry.version.clone(),
    };
    if let Some(build) = cached_build(options, &expected_version) {
        debug!(
            "Chart {} {} already built, skipping download",
            chart_name, entry.version
        );
        return Ok(build);
    }

    fs::create_dir_all(workdir).context(IoSnafu)?;
    let client = HelmIndexClient::new(http.clone(), repository_url, auth).context(IndexSnafu)?;
    let pulled = client
        .download_chart(entry, workdir)
        .await
        .context(IndexSnafu)?;
    info!("Pulled chart {} version {}", chart_name, entry.version);

    let metadata = chart::read_metadata_from_archive(&pulled)?;
    finish_remote_build(metadata, pulled, options, workdir, None)
}

/// Applies values overrides and version metadata to a pulled chart. When
/// neither is configured the pulled package is the build output.
fn finish_remote_build(
    mut metadata: ChartMetadata,
    pulled: std::path::PathBuf,
    options: &BuildOptions,
    workdir: &Path,
    verified_by: Option<VerifiedBy>,
) -> Result<Build> {
    if options.values_files.is_empty() && options.version_metadata.is_none() {
        return Ok(Build {
            name: metadata.name,
            version: metadata.version,
            path: pulled,
            packaged: false,
            cached: false,
            verified_by,
        });
    }

    let unpack_dir = workdir.join("unpacked");
    let chart_dir = chart::unpack(&pulled, &unpack_dir)?;
    let merged_values = chart::merge_values(&chart_dir, &options.values_files)?;

    if let Some(version_metadata) = &options.version_metadata {
        metadata.version = apply_version_metadata(&metadata.version, version_metadata)?;
    }

    let packaged = chart::package(&chart_dir, &metadata, merged_values.as_ref(), workdir)?;
    Ok(Build {
        name: metadata.name,
        version: metadata.version,
        path: packaged,
        packaged: true,
        cached: false,
        verified_by,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::chart::{package, read_metadata_from_archive, ChartMetadata};
    use reqwest_middleware::ClientBuilder;
    use std::collections::BTreeMap;

    fn packaged_chart(dir: &Path, name: &str, version: &str) -> std::path::PathBuf {
        let chart_dir = dir.join(format!("{name}-src"));
        std::fs::create_dir_all(&chart_dir).unwrap();
        std::fs::write(
            chart_dir.join("Chart.yaml"),
            format!("apiVersion: v2\nname: {name}\nversion: {version}\n"),
        )
        .unwrap();
        std::fs::write(chart_dir.join("values.yaml"), "replicaCount: 1\n").unwrap();
        let metadata = ChartMetadata {
            name: name.into(),
            version: version.into(),
            dependencies: Vec::new(),
            extra: BTreeMap::new(),
        };
        package(&chart_dir, &metadata, None, dir).unwrap()
    }

    fn index_for(server_url: &str) -> String {
        format!(
            r#"
apiVersion: v1
entries:
  podinfo:
    - name: podinfo
      version: 6.0.0
      urls: ["{server_url}/charts/podinfo-6.0.0.tgz"]
    - name: podinfo
      version: 6.2.0
      urls: ["{server_url}/charts/podinfo-6.2.0.tgz"]
    - name: podinfo
      version: 7.0.0
      urls: ["{server_url}/charts/podinfo-7.0.0.tgz"]
"#
        )
    }

    #[tokio::test]
    async fn index_build_resolves_range_and_downloads() {
        let tmp = tempfile::tempdir().unwrap();
        let chart_bytes = std::fs::read(packaged_chart(tmp.path(), "podinfo", "6.2.0")).unwrap();

        let mut server = mockito::Server::new_async().await;
        let _chart = server
            .mock("GET", "/charts/podinfo-6.2.0.tgz")
            .with_status(200)
            .with_body(chart_bytes)
            .create_async()
            .await;

        let index_path = tmp.path().join("index.yaml");
        std::fs::write(&index_path, index_for(&server.url())).unwrap();

        let http = ClientBuilder::new(reqwest::Client::new()).build();
        let workdir = tmp.path().join("work");
        let build = build_from_index(
            &http,
            &index_path,
            &server.url(),
            Auth::Anonymous,
            "podinfo",
            ">=6.0 <7.0",
            &BuildOptions::default(),
            &workdir,
        )
        .await
        .unwrap();

        assert_eq!(build.version, "6.2.0");
        assert_eq!(build.revision(), "6.2.0");
        assert!(!build.packaged);
        assert!(build.path.ends_with("podinfo-6.2.0.tgz"));
        assert!(build.path.is_file());
    }

    #[tokio::test]
    async fn cached_chart_short_circuits_the_download() {
        let tmp = tempfile::tempdir().unwrap();
        let cached = packaged_chart(tmp.path(), "podinfo", "6.2.0");

        // No mock server mounted: a download attempt would fail loudly.
        let index_path = tmp.path().join("index.yaml");
        std::fs::write(&index_path, index_for("http://127.0.0.1:1")).unwrap();

        let http = ClientBuilder::new(reqwest::Client::new()).build();
        let build = build_from_index(
            &http,
            &index_path,
            "http://127.0.0.1:1",
            Auth::Anonymous,
            "podinfo",
            "6.2.0",
            &BuildOptions {
                cached_chart: Some(cached.clone()),
                ..Default::default()
            },
            &tmp.path().join("work"),
        )
        .await
        .unwrap();

        assert!(build.cached);
        assert_eq!(build.path, cached);
    }

    #[tokio::test]
    async fn force_ignores_the_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let cached = packaged_chart(tmp.path(), "podinfo", "6.2.0");
        let chart_bytes = std::fs::read(&cached).unwrap();

        let mut server = mockito::Server::new_async().await;
        let download = server
            .mock("GET", "/charts/podinfo-6.2.0.tgz")
            .with_status(200)
            .with_body(chart_bytes)
            .create_async()
            .await;

        let index_path = tmp.path().join("index.yaml");
        std::fs::write(&index_path, index_for(&server.url())).unwrap();

        let http = ClientBuilder::new(reqwest::Client::new()).build();
        let build = build_from_index(
            &http,
            &index_path,
            &server.url(),
            Auth::Anonymous,
            "podinfo",
            "6.2.0",
            &BuildOptions {
                cached_chart: Some(cached),
                force: true,
                ..Default::default()
            },
            &tmp.path().join("work"),
        )
        .await
        .unwrap();

        assert!(!build.cached);
        download.assert_async().await;
    }

    #[tokio::test]
    async fn values_files_repackage_with_version_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let chart_bytes = std::fs::read(packaged_chart(tmp.path(), "podinfo", "6.2.0")).unwrap();

        let mut server = mockito::Server::new_async().await;
        let _chart = server
            .mock("GET", "/charts/podinfo-6.2.0.tgz")
            .with_status(200)
            .with_body(chart_bytes)
            .create_async()
            .await;

        let index_path = tmp.path().join("index.yaml");
        std::fs::write(&index_path, index_for(&server.url())).unwrap();

        let http = ClientBuilder::new(reqwest::Client::new()).build();
        let build = build_from_index(
            &http,
            &index_path,
            &server.url(),
            Auth::Anonymous,
            "podinfo",
            "6.2.0",
            &BuildOptions {
                values_files: vec!["values.yaml".into()],
                version_metadata: Some("4".into()),
                ..Default::default()
            },
            &tmp.path().join("work"),
        )
        .await
        .unwrap();

        assert!(build.packaged);
        assert_eq!(build.version, "6.2.0+4");
        let metadata = read_metadata_from_archive(&build.path).unwrap();
        assert_eq!(metadata.version, "6.2.0+4");
    }
}
