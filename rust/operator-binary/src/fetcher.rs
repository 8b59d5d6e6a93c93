use std::fs::{create_dir_all, File};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use reqwest_middleware::ClientWithMiddleware;
use sha2::{Digest, Sha256};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tar::Archive;
use tracing::info;
use url::Url;

use source_operator_crd::Artifact;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum FetcherError {
    #[snafu(display("Url parse error: {}", source))]
    InvalidParseUrl { source: url::ParseError },

    #[snafu(display("IO error: {}", source))]
    CannotCreateFile { source: std::io::Error },

    #[snafu(display("Cannot get filename"))]
    FilenameWrong,

    #[snafu(display("Cannot download: {}", source))]
    CannotDownload { source: reqwest_middleware::Error },

    #[snafu(display("Download responded with status {}", status))]
    UnexpectedStatus { status: reqwest::StatusCode },

    #[snafu(display("Cannot get body: {}", source))]
    CannotGetBody { source: reqwest::Error },

    #[snafu(display(
        "Checksum mismatch for {}: expected {}, got {}",
        url, expected, actual
    ))]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },
}

type Result<T, E = FetcherError> = std::result::Result<T, E>;

/// Downloads and unpacks upstream source artifacts advertised by
/// GitRepository and Bucket objects.
pub struct SourceFetcher {
    client: ClientWithMiddleware,
    host: Option<String>,
}

impl SourceFetcher {
    pub fn new(client: ClientWithMiddleware, host: Option<String>) -> Self {
        Self { client, host }
    }

    /// Fetches the artifact tarball into `workdir` and extracts it.
    /// Returns the extraction directory. Both the download and the
    /// extraction are skipped when a previous run already produced them;
    /// the digest is verified either way.
    pub async fn fetch(&self, artifact: &Artifact, workdir: &Path) -> Result<PathBuf> {
        let url = build_url(&artifact.url, self.host.clone())?;

        let target = url
            .path_segments()
            .and_then(|segments| segments.last())
            .context(FilenameWrongSnafu)?;

        let target_path = workdir.join(target);

        if !workdir.exists() {
            create_dir_all(workdir).context(CannotCreateFileSnafu)?;
        }

        if !target_path.exists() {
            info!("Downloading source artifact from {}", url);
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .context(CannotDownloadSnafu)?;
            let status = response.status();
            ensure!(status.is_success(), UnexpectedStatusSnafu { status });

            let mut file = File::create(&target_path).context(CannotCreateFileSnafu)?;
            let mut content = Cursor::new(response.bytes().await.context(CannotGetBodySnafu)?);
            std::io::copy(&mut content, &mut file).context(CannotCreateFileSnafu)?;
        }

        if let Some(expected) = artifact.digest.as_deref() {
            let actual = file_digest(&target_path)?;
            if actual != expected {
                // A stale or truncated download never makes it into a build.
                let _ = std::fs::remove_file(&target_path);
                return ChecksumMismatchSnafu {
                    url: url.to_string(),
                    expected,
                    actual,
                }
                .fail();
            }
        }

        let dir_path = workdir.join(
            target
                .trim_end_matches(".tar.gz")
                .trim_end_matches(".tgz"),
        );
        if !dir_path.exists() {
            info!("Extracting source artifact to {}", dir_path.display());
            let tar_gz = File::open(&target_path).context(CannotCreateFileSnafu)?;
            let mut archive = Archive::new(GzDecoder::new(tar_gz));
            archive.unpack(&dir_path).context(CannotCreateFileSnafu)?;
        }

        Ok(dir_path)
    }
}

pub(crate) fn build_url(url: &str, override_host: Option<String>) -> Result<Url> {
    let parsed_url = Url::parse(url).context(InvalidParseUrlSnafu)?;
    if let Some(host) = override_host {
        let mut override_parsed = Url::parse(host.as_str()).context(InvalidParseUrlSnafu)?;
        override_parsed.set_path(parsed_url.path());
        override_parsed.set_query(parsed_url.query());
        Ok(override_parsed)
    } else {
        Ok(parsed_url)
    }
}

fn file_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path).context(CannotCreateFileSnafu)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).context(CannotCreateFileSnafu)?;
    Ok(format!("sha256:{:x}", hasher.finalize()))
}
