//! Chart metadata, values merging and packaging.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use snafu::ResultExt;

use super::{
    ChartMalformedSnafu, ChartMetadataMissingSnafu, Error, IoSnafu, Result, ValuesFileMissingSnafu,
    ValuesMergeSnafu,
};

pub const CHART_FILENAME: &str = "Chart.yaml";
pub const VALUES_FILENAME: &str = "values.yaml";

/// The subset of `Chart.yaml` this operator interprets; everything else
/// is carried through packaging untouched.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ChartDependency>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChartDependency {
    pub name: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Loads `Chart.yaml` from a chart directory.
pub fn load_metadata(chart_dir: &Path) -> Result<ChartMetadata> {
    let path = chart_dir.join(CHART_FILENAME);
    if !path.is_file() {
        return ChartMetadataMissingSnafu { path: chart_dir }.fail();
    }
    let contents = fs::read(&path).context(IoSnafu)?;
    serde_yaml::from_slice(&contents).context(ChartMalformedSnafu)
}

/// Reads `Chart.yaml` out of a packaged chart without unpacking it.
pub fn read_metadata_from_archive(path: &Path) -> Result<ChartMetadata> {
    let file = File::open(path).context(IoSnafu)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries().context(IoSnafu)? {
        let mut entry = entry.context(IoSnafu)?;
        let entry_path = entry.path().context(IoSnafu)?;
        // The chart metadata sits directly below the top-level chart dir.
        let is_chart_yaml = entry_path.components().count() == 2
            && entry_path
                .file_name()
                .map(|name| name == CHART_FILENAME)
                .unwrap_or(false);
        if !is_chart_yaml {
            continue;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).context(IoSnafu)?;
        return serde_yaml::from_slice(&contents).context(ChartMalformedSnafu);
    }
    ChartMetadataMissingSnafu { path }.fail()
}

/// Merges the configured values files of a chart, last file winning.
/// Returns `None` when no files are configured, leaving the packaged
/// values untouched.
pub fn merge_values(chart_dir: &Path, files: &[String]) -> Result<Option<Value>> {
    if files.is_empty() {
        return Ok(None);
    }

    let mut merged = Value::Mapping(Default::default());
    for file in files {
        let path = chart_dir.join(file);
        if !path.is_file() {
            return ValuesFileMissingSnafu { file }.fail();
        }
        let contents = fs::read(&path).context(IoSnafu)?;
        let overlay: Value =
            serde_yaml::from_slice(&contents).context(ValuesMergeSnafu { file })?;
        deep_merge(&mut merged, overlay);
    }
    Ok(Some(merged))
}

/// Recursive mapping merge with Helm semantics: the overlay wins, and an
/// explicit null deletes the key.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    base_map.remove(&key);
                    continue;
                }
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Packages a chart directory into `<dest_dir>/<name>-<version>.tgz` with
/// the conventional top-level chart directory. The given metadata
/// replaces `Chart.yaml`; merged values, when present, replace
/// `values.yaml`.
pub fn package(
    chart_dir: &Path,
    metadata: &ChartMetadata,
    merged_values: Option<&Value>,
    dest_dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir).context(IoSnafu)?;
    let target = dest_dir.join(format!("{}-{}.tgz", metadata.name, metadata.version));

    let writer = File::create(&target).context(IoSnafu)?;
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let prefix = PathBuf::from(&metadata.name);

    let chart_yaml = serde_yaml::to_string(metadata).context(ChartMalformedSnafu)?;
    append_bytes(&mut builder, &prefix.join(CHART_FILENAME), chart_yaml.as_bytes())?;
    if let Some(values) = merged_values {
        let values_yaml = serde_yaml::to_string(values).context(ChartMalformedSnafu)?;
        append_bytes(&mut builder, &prefix.join(VALUES_FILENAME), values_yaml.as_bytes())?;
    }

    for entry in walkdir::WalkDir::new(chart_dir)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(std::io::Error::from).context(IoSnafu)?;
        let relative = entry
            .path()
            .strip_prefix(chart_dir)
            .expect("walked path is below its root");
        if relative == Path::new(CHART_FILENAME) {
            continue;
        }
        if merged_values.is_some() && relative == Path::new(VALUES_FILENAME) {
            continue;
        }
        if entry.file_type().is_dir() {
            builder
                .append_dir(prefix.join(relative), entry.path())
                .context(IoSnafu)?;
        } else if entry.file_type().is_file() {
            builder
                .append_path_with_name(entry.path(), prefix.join(relative))
                .context(IoSnafu)?;
        }
    }

    let encoder = builder.into_inner().context(IoSnafu)?;
    encoder.finish().context(IoSnafu)?;
    Ok(target)
}

/// Unpacks a packaged chart and returns the chart directory inside
/// `dest_dir`.
pub fn unpack(archive_path: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let file = File::open(archive_path).context(IoSnafu)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.unpack(dest_dir).context(IoSnafu)?;

    // The chart lives in the single top-level directory of the archive.
    let mut entries = fs::read_dir(dest_dir)
        .context(IoSnafu)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir());
    match entries.next() {
        Some(entry) => Ok(entry.path()),
        None => ChartMetadataMissingSnafu { path: dest_dir }.fail(),
    }
}

fn append_bytes<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    contents: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, contents)
        .context(IoSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_chart(dir: &Path) {
        fs::create_dir_all(dir.join("templates")).unwrap();
        fs::write(
            dir.join(CHART_FILENAME),
            "apiVersion: v2\nname: podinfo\nversion: 6.2.0\ndescription: test chart\n",
        )
        .unwrap();
        fs::write(dir.join(VALUES_FILENAME), "replicaCount: 1\n").unwrap();
        fs::write(
            dir.join("values-prod.yaml"),
            "replicaCount: 3\nresources:\n  requests:\n    cpu: 100m\n",
        )
        .unwrap();
        fs::write(dir.join("templates/deploy.yaml"), "kind: Deployment\n").unwrap();
    }

    #[test]
    fn metadata_loads_and_preserves_extra_fields() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_chart(tmp.path());

        let metadata = load_metadata(tmp.path()).unwrap();
        assert_eq!(metadata.name, "podinfo");
        assert_eq!(metadata.version, "6.2.0");
        assert!(metadata.extra.contains_key("description"));
    }

    #[test]
    fn missing_chart_yaml_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let error = load_metadata(tmp.path()).unwrap_err();
        assert!(matches!(error, Error::ChartMetadataMissing { .. }));
        assert!(error.is_persistent());
    }

    #[test]
    fn malformed_chart_yaml_is_persistent() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(CHART_FILENAME), "{not yaml").unwrap();
        let error = load_metadata(tmp.path()).unwrap_err();
        assert!(error.is_persistent());
    }

    #[test]
    fn values_merge_is_ordered_and_deep() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_chart(tmp.path());

        let merged = merge_values(
            tmp.path(),
            &["values.yaml".into(), "values-prod.yaml".into()],
        )
        .unwrap()
        .unwrap();

        assert_eq!(merged["replicaCount"], Value::from(3));
        assert_eq!(merged["resources"]["requests"]["cpu"], Value::from("100m"));
    }

    #[test]
    fn values_merge_null_deletes_keys() {
        let mut base: Value =
            serde_yaml::from_str("replicaCount: 1\nimage:\n  tag: latest\n").unwrap();
        let overlay: Value = serde_yaml::from_str("image: null\n").unwrap();
        deep_merge(&mut base, overlay);
        assert!(base.get("image").is_none());
        assert_eq!(base["replicaCount"], Value::from(1));
    }

    #[test]
    fn missing_values_file_is_persistent() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_chart(tmp.path());
        let error = merge_values(tmp.path(), &["absent.yaml".into()]).unwrap_err();
        assert!(matches!(error, Error::ValuesFileMissing { .. }));
        assert!(error.is_persistent());
    }

    #[test]
    fn package_roundtrip_carries_rewritten_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let chart_dir = tmp.path().join("chart");
        fixture_chart(&chart_dir);

        let mut metadata = load_metadata(&chart_dir).unwrap();
        metadata.version = "6.2.0+2".into();
        let merged: Value = serde_yaml::from_str("replicaCount: 3\n").unwrap();

        let out = tmp.path().join("out");
        let packaged = package(&chart_dir, &metadata, Some(&merged), &out).unwrap();
        assert!(packaged.ends_with("podinfo-6.2.0+2.tgz"));

        let read_back = read_metadata_from_archive(&packaged).unwrap();
        assert_eq!(read_back.version, "6.2.0+2");
        assert_eq!(read_back.name, "podinfo");

        // Unpack and check the replaced values landed.
        let unpacked = unpack(&packaged, &tmp.path().join("unpacked")).unwrap();
        let values = fs::read_to_string(unpacked.join(VALUES_FILENAME)).unwrap();
        assert!(values.contains("replicaCount: 3"));
        assert!(unpacked.join("templates/deploy.yaml").is_file());
    }

    #[test]
    fn archive_without_metadata_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.tgz");
        let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.finish().unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let error = read_metadata_from_archive(&path).unwrap_err();
        assert!(matches!(error, Error::ChartMetadataMissing { .. }));
    }
}
