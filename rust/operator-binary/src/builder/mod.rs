//! Chart acquisition and packaging.
//!
//! Remote builds pull a packaged chart from an OCI registry or an HTTP
//! repository index; local builds package a chart directory materialized
//! from a Git or Bucket source artifact. Build errors carry a reason that
//! decides between a retry and a stall.

pub mod chart;
pub mod dependencies;
pub mod local;
pub mod remote;

use std::path::PathBuf;

use semver::{BuildMetadata, Version};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use registry_client::verify::VerifiedBy;
use source_operator_crd::SourceVerification;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Chart has no Chart.yaml under {}", path.display()))]
    ChartMetadataMissing { path: PathBuf },

    #[snafu(display("Malformed chart metadata: {}", source))]
    ChartMalformed { source: serde_yaml::Error },

    #[snafu(display("Malformed chart version {:?}: {}", version, source))]
    ChartVersionInvalid {
        version: String,
        source: semver::Error,
    },

    #[snafu(display("Values file {:?} not found in chart", file))]
    ValuesFileMissing { file: String },

    #[snafu(display("Failed to merge values file {:?}: {}", file, source))]
    ValuesMerge {
        file: String,
        source: serde_yaml::Error,
    },

    #[snafu(display("Signature verification failed: {}", source))]
    Verification {
        source: registry_client::verify::Error,
    },

    #[snafu(display("Registry operation failed: {}", source))]
    Registry { source: registry_client::Error },

    #[snafu(display("Repository index operation failed: {}", source))]
    Index {
        source: registry_client::index::Error,
    },

    #[snafu(display("Failed to fetch source artifact: {}", source))]
    SourceFetch {
        source: crate::fetcher::FetcherError,
    },

    #[snafu(display("Chart build IO error: {}", source))]
    Io { source: std::io::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Persistent build errors stall the object: retrying the identical
    /// input cannot succeed, only a spec change can.
    pub fn is_persistent(&self) -> bool {
        match self {
            Error::ChartMetadataMissing { .. }
            | Error::ChartMalformed { .. }
            | Error::ChartVersionInvalid { .. }
            | Error::ValuesFileMissing { .. }
            | Error::ValuesMerge { .. }
            | Error::Verification { .. } => true,
            Error::Registry { source } => source.is_stalling(),
            Error::Index { source } => source.is_stalling(),
            Error::SourceFetch { .. } | Error::Io { .. } => false,
        }
    }
}

/// Inputs that vary a build beyond the chart reference itself.
#[derive(Debug, Default)]
pub struct BuildOptions {
    /// Alternative values files, merged in order.
    pub values_files: Vec<String>,
    /// Skip the cached-chart short circuit.
    pub force: bool,
    /// The previously built chart file, reused when its version matches.
    pub cached_chart: Option<PathBuf>,
    /// Signature verification of pulled charts.
    pub verify: Option<SourceVerification>,
    /// Candidate public keys from the verification secret, `(entry name,
    /// PEM bytes)`. Empty for keyless verification.
    pub verification_keys: Vec<(String, Vec<u8>)>,
    /// Build metadata appended to the chart version (`+<suffix>`).
    pub version_metadata: Option<String>,
}

/// A finished chart build.
#[derive(Clone, Debug)]
pub struct Build {
    pub name: String,
    /// Full version including any build metadata; doubles as the artifact
    /// revision.
    pub version: String,
    /// Path of the packaged chart on the local filesystem.
    pub path: PathBuf,
    /// Whether the chart was packaged here rather than pulled as-is.
    pub packaged: bool,
    /// Whether the cached chart was reused without any work.
    pub cached: bool,
    pub verified_by: Option<VerifiedBy>,
}

impl Build {
    pub fn revision(&self) -> &str {
        &self.version
    }
}

/// Appends build metadata to a chart version, replacing any existing
/// metadata.
pub fn apply_version_metadata(version: &str, metadata: &str) -> Result<String> {
    let mut parsed = Version::parse(version).context(ChartVersionInvalidSnafu { version })?;
    parsed.build = BuildMetadata::new(metadata).context(ChartVersionInvalidSnafu { version })?;
    Ok(parsed.to_string())
}

/// Reuses the cached chart when it matches the expected version and the
/// build is not forced.
fn cached_build(options: &BuildOptions, expected_version: &str) -> Option<Build> {
    if options.force {
        return None;
    }
    let path = options.cached_chart.as_ref()?;
    let metadata = chart::read_metadata_from_archive(path).ok()?;
    if metadata.version != expected_version {
        return None;
    }
    Some(Build {
        name: metadata.name,
        version: metadata.version,
        path: path.clone(),
        packaged: false,
        cached: true,
        verified_by: None,
    })
}
