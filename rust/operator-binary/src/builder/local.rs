//! Local chart builds: package a chart directory materialized from a Git
//! or Bucket source artifact, after resolving its dependencies and
//! merging values.

use std::path::Path;

use tracing::info;

use super::chart;
use super::dependencies::DependencyResolver;
use super::{
    apply_version_metadata, cached_build, Build, BuildOptions, ChartMetadataMissingSnafu, Result,
};

/// Packages the chart at `chart_path` inside an extracted source tree.
pub async fn build_from_source(
    source_dir: &Path,
    chart_path: &str,
    options: &BuildOptions,
    resolver: &DependencyResolver<'_>,
    workdir: &Path,
) -> Result<Build> {
    let chart_dir = source_dir.join(chart_path.trim_start_matches("./"));
    if !chart_dir.is_dir() {
        return ChartMetadataMissingSnafu { path: chart_dir }.fail();
    }

    let mut metadata = chart::load_metadata(&chart_dir)?;
    if let Some(version_metadata) = &options.version_metadata {
        metadata.version = apply_version_metadata(&metadata.version, version_metadata)?;
    }

    if let Some(build) = cached_build(options, &metadata.version) {
        return Ok(build);
    }

    let vendored = resolver.resolve(&chart_dir, &metadata).await?;
    if vendored > 0 {
        info!("Vendored {} chart dependencies", vendored);
    }

    let merged_values = chart::merge_values(&chart_dir, &options.values_files)?;
    let packaged = chart::package(&chart_dir, &metadata, merged_values.as_ref(), workdir)?;
    info!("Packaged chart {} version {}", metadata.name, metadata.version);

    Ok(Build {
        name: metadata.name,
        version: metadata.version,
        path: packaged,
        packaged: true,
        cached: false,
        verified_by: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::chart::read_metadata_from_archive;
    use crate::builder::dependencies::AnonymousCredentials;
    use crate::builder::Error;
    use reqwest_middleware::ClientBuilder;
    use std::time::Duration;

    fn fixture_source(dir: &Path) {
        let chart_dir = dir.join("charts/app");
        std::fs::create_dir_all(chart_dir.join("templates")).unwrap();
        std::fs::write(
            chart_dir.join("Chart.yaml"),
            "apiVersion: v2\nname: app\nversion: 1.4.0\n",
        )
        .unwrap();
        std::fs::write(chart_dir.join("values.yaml"), "replicaCount: 1\n").unwrap();
        std::fs::write(
            chart_dir.join("values-prod.yaml"),
            "replicaCount: 5\n",
        )
        .unwrap();
        std::fs::write(chart_dir.join("templates/deploy.yaml"), "kind: Deployment\n").unwrap();
    }

    fn resolver(http: &reqwest_middleware::ClientWithMiddleware) -> DependencyResolver<'_> {
        DependencyResolver::new(http, &AnonymousCredentials, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn source_chart_is_packaged() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_source(tmp.path());
        let http = ClientBuilder::new(reqwest::Client::new()).build();

        let build = build_from_source(
            tmp.path(),
            "./charts/app",
            &BuildOptions::default(),
            &resolver(&http),
            &tmp.path().join("work"),
        )
        .await
        .unwrap();

        assert!(build.packaged);
        assert_eq!(build.version, "1.4.0");
        assert!(build.path.ends_with("app-1.4.0.tgz"));
        assert_eq!(read_metadata_from_archive(&build.path).unwrap().name, "app");
    }

    #[tokio::test]
    async fn revision_metadata_lands_in_the_version() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_source(tmp.path());
        let http = ClientBuilder::new(reqwest::Client::new()).build();

        let build = build_from_source(
            tmp.path(),
            "charts/app",
            &BuildOptions {
                version_metadata: Some("6b7aab8a10d6".into()),
                ..Default::default()
            },
            &resolver(&http),
            &tmp.path().join("work"),
        )
        .await
        .unwrap();

        assert_eq!(build.version, "1.4.0+6b7aab8a10d6");
        assert_eq!(build.revision(), "1.4.0+6b7aab8a10d6");
    }

    #[tokio::test]
    async fn merged_values_are_packaged() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_source(tmp.path());
        let http = ClientBuilder::new(reqwest::Client::new()).build();

        let build = build_from_source(
            tmp.path(),
            "charts/app",
            &BuildOptions {
                values_files: vec!["values.yaml".into(), "values-prod.yaml".into()],
                version_metadata: Some("2".into()),
                ..Default::default()
            },
            &resolver(&http),
            &tmp.path().join("work"),
        )
        .await
        .unwrap();

        let unpacked = chart::unpack(&build.path, &tmp.path().join("unpacked")).unwrap();
        let values = std::fs::read_to_string(unpacked.join("values.yaml")).unwrap();
        assert!(values.contains("replicaCount: 5"));
    }

    #[tokio::test]
    async fn missing_chart_directory_is_persistent() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_source(tmp.path());
        let http = ClientBuilder::new(reqwest::Client::new()).build();

        let error = build_from_source(
            tmp.path(),
            "charts/absent",
            &BuildOptions::default(),
            &resolver(&http),
            &tmp.path().join("work"),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, Error::ChartMetadataMissing { .. }));
        assert!(error.is_persistent());
    }

    #[tokio::test]
    async fn unchanged_version_reuses_the_cached_chart() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_source(tmp.path());
        let http = ClientBuilder::new(reqwest::Client::new()).build();

        let first = build_from_source(
            tmp.path(),
            "charts/app",
            &BuildOptions::default(),
            &resolver(&http),
            &tmp.path().join("work"),
        )
        .await
        .unwrap();

        let second = build_from_source(
            tmp.path(),
            "charts/app",
            &BuildOptions {
                cached_chart: Some(first.path.clone()),
                ..Default::default()
            },
            &resolver(&http),
            &tmp.path().join("work-2"),
        )
        .await
        .unwrap();

        assert!(second.cached);
        assert_eq!(second.path, first.path);
    }
}
