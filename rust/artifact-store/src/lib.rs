//! Content-addressed artifact storage.
//!
//! Artifacts live below a single root as
//! `<kind>/<namespace>/<name>/<filename>`, with a `latest.tar.gz` symlink
//! per object and a `.lock` sidecar serializing writers of one object.
//! Writers stage to a `.tmp` file and rename so readers never observe a
//! partial artifact.

pub mod sourceignore;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use flate2::write::GzEncoder;
use flate2::Compression;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, warn};

use source_operator_crd::Artifact;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Failed to create directory {}: {}", path.display(), source))]
    CannotCreateDirectories { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to stage artifact {}: {}", path.display(), source))]
    CannotStage { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to rename staged artifact into {}: {}", path.display(), source))]
    CannotRename { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to archive {}: {}", path.display(), source))]
    CannotArchive { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to symlink artifact: {}", source))]
    CannotSymlink { source: io::Error },

    #[snafu(display("Failed to remove {}: {}", path.display(), source))]
    CannotRemove { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to read artifact directory {}: {}", path.display(), source))]
    CannotReadDir { path: PathBuf, source: io::Error },

    #[snafu(display("Timed out acquiring lock {}", path.display()))]
    LockAcquireTimeout { path: PathBuf },

    #[snafu(display("Object has no namespace associated"))]
    NoNamespace,

    #[snafu(display("Object has no name associated"))]
    NoName,

    #[snafu(display("Invalid ignore patterns: {}", source))]
    InvalidIgnorePatterns { source: sourceignore::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Holds the `.lock` sidecar of one object directory; released (and the
/// sidecar removed) on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), error);
        }
    }
}

/// The name of the stable symlink maintained next to every artifact.
pub const LATEST_LINK: &str = "latest.tar.gz";

const LOCK_FILENAME: &str = ".lock";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Storage {
    /// Root of the artifact tree.
    root: PathBuf,
    /// Host artifacts are advertised under, e.g. `source-operator.flux-system.svc`.
    hostname: String,
    /// Artifacts younger than this survive garbage collection.
    retention_ttl: Duration,
    /// Number of non-current artifacts retained per object.
    retention_records: usize,
}

impl Storage {
    pub fn new(
        root: impl Into<PathBuf>,
        hostname: impl Into<String>,
        retention_ttl: Duration,
        retention_records: usize,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).context(CannotCreateDirectoriesSnafu { path: &root })?;
        Ok(Self {
            root,
            hostname: hostname.into(),
            retention_ttl,
            retention_records,
        })
    }

    /// Builds the artifact skeleton for an object and revision. The
    /// digest, size and timestamp are filled in by the write operations.
    pub fn artifact_for(
        &self,
        kind: &str,
        meta: &ObjectMeta,
        revision: &str,
        filename: &str,
    ) -> Result<Artifact> {
        let path = format!(
            "{}/{}/{}/{}",
            kind.to_lowercase(),
            meta.namespace.as_deref().context(NoNamespaceSnafu)?,
            meta.name.as_deref().context(NoNameSnafu)?,
            filename,
        );
        let mut artifact = Artifact {
            revision: revision.to_string(),
            url: String::new(),
            path,
            digest: None,
            last_update_time: Time(k8s_openapi::chrono::Utc::now()),
            metadata: None,
            size: None,
        };
        self.set_artifact_url(&mut artifact);
        Ok(artifact)
    }

    /// Absolute filesystem path of an artifact.
    pub fn local_path(&self, artifact: &Artifact) -> PathBuf {
        self.root.join(&artifact.path)
    }

    pub fn exists(&self, artifact: &Artifact) -> bool {
        self.local_path(artifact).is_file()
    }

    /// Whether the file on disk matches the artifact digest. A missing
    /// file or a missing digest counts as a mismatch.
    pub fn verify_checksum(&self, artifact: &Artifact) -> bool {
        let Some(expected) = artifact.digest.as_deref() else {
            return false;
        };
        match file_digest(&self.local_path(artifact)) {
            Ok(actual) => actual == expected,
            Err(_) => false,
        }
    }

    pub fn mkdir_all(&self, artifact: &Artifact) -> Result<()> {
        let path = self
            .local_path(artifact)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&path).context(CannotCreateDirectoriesSnafu { path })
    }

    /// Acquires the write lock of the artifact's object directory,
    /// polling until `timeout`.
    pub fn lock(&self, artifact: &Artifact, timeout: Duration) -> Result<LockGuard> {
        let dir = self
            .local_path(artifact)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir).context(CannotCreateDirectoriesSnafu { path: &dir })?;

        let path = dir.join(LOCK_FILENAME);
        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(LockGuard { path }),
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return LockAcquireTimeoutSnafu { path }.fail();
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(source) => return Err(Error::CannotStage { path, source }),
            }
        }
    }

    /// Copies a file into storage, staging to a `.tmp` sibling and
    /// renaming. Fills in the artifact digest, size and timestamp.
    pub fn copy_from_path(&self, artifact: &mut Artifact, src: &Path) -> Result<()> {
        self.mkdir_all(artifact)?;
        let target = self.local_path(artifact);
        let staged = staging_path(&target);

        let result = (|| {
            let mut reader = File::open(src).context(CannotStageSnafu { path: src })?;
            let mut writer = File::create(&staged).context(CannotStageSnafu { path: &staged })?;
            let mut hasher = Sha256::new();
            let mut buffer = [0u8; 64 * 1024];
            let mut size: i64 = 0;
            loop {
                let read = reader
                    .read(&mut buffer)
                    .context(CannotStageSnafu { path: src })?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
                writer
                    .write_all(&buffer[..read])
                    .context(CannotStageSnafu { path: &staged })?;
                size += read as i64;
            }
            writer.flush().context(CannotStageSnafu { path: &staged })?;
            fs::rename(&staged, &target).context(CannotRenameSnafu { path: &target })?;
            Ok((format!("sha256:{:x}", hasher.finalize()), size))
        })();

        match result {
            Ok((digest, size)) => {
                self.finish_write(artifact, digest, size);
                Ok(())
            }
            Err(error) => {
                let _ = fs::remove_file(&staged);
                Err(error)
            }
        }
    }

    /// Archives a directory into storage as a gzipped tarball, excluding
    /// paths matched by the ignore patterns. Staging and digest handling
    /// as in [`Storage::copy_from_path`].
    pub fn archive(&self, artifact: &mut Artifact, dir: &Path, ignore: Option<&str>) -> Result<()> {
        let filter = sourceignore::IgnoreFilter::new(ignore.unwrap_or_default())
            .context(InvalidIgnorePatternsSnafu)?;

        self.mkdir_all(artifact)?;
        let target = self.local_path(artifact);
        let staged = staging_path(&target);

        let result = (|| {
            let writer = File::create(&staged).context(CannotStageSnafu { path: &staged })?;
            let encoder = GzEncoder::new(writer, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.follow_symlinks(false);

            for entry in walkdir::WalkDir::new(dir).min_depth(1).sort_by_file_name() {
                let entry = entry
                    .map_err(io::Error::from)
                    .context(CannotArchiveSnafu { path: dir })?;
                let relative = entry
                    .path()
                    .strip_prefix(dir)
                    .expect("walked path is below its root");
                if filter.is_ignored(relative, entry.file_type().is_dir()) {
                    continue;
                }
                if entry.file_type().is_dir() {
                    builder
                        .append_dir(relative, entry.path())
                        .context(CannotArchiveSnafu { path: entry.path() })?;
                } else if entry.file_type().is_file() {
                    builder
                        .append_path_with_name(entry.path(), relative)
                        .context(CannotArchiveSnafu { path: entry.path() })?;
                }
            }

            let encoder = builder
                .into_inner()
                .context(CannotArchiveSnafu { path: dir })?;
            encoder
                .finish()
                .context(CannotStageSnafu { path: &staged })?
                .flush()
                .context(CannotStageSnafu { path: &staged })?;

            let digest = file_digest(&staged).context(CannotStageSnafu { path: &staged })?;
            let size = fs::metadata(&staged)
                .context(CannotStageSnafu { path: &staged })?
                .len() as i64;
            fs::rename(&staged, &target).context(CannotRenameSnafu { path: &target })?;
            Ok((digest, size))
        })();

        match result {
            Ok((digest, size)) => {
                self.finish_write(artifact, digest, size);
                Ok(())
            }
            Err(error) => {
                let _ = fs::remove_file(&staged);
                Err(error)
            }
        }
    }

    /// Points the stable symlink at the artifact and returns the link URL.
    pub fn symlink(&self, artifact: &Artifact, link_name: &str) -> Result<String> {
        let target = self.local_path(artifact);
        let link = target
            .parent()
            .map(|dir| dir.join(link_name))
            .unwrap_or_else(|| self.root.join(link_name));

        match fs::remove_file(&link) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(Error::CannotSymlink { source }),
        }
        let filename = target
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| target.clone());
        std::os::unix::fs::symlink(filename, &link).context(CannotSymlinkSnafu)?;

        let mut parts: Vec<&str> = artifact.path.split('/').collect();
        parts.pop();
        parts.push(link_name);
        Ok(format!("http://{}/{}", self.hostname, parts.join("/")))
    }

    /// Removes the whole artifact subtree of an object. Returns the
    /// deleted path.
    pub fn remove_all(&self, kind: &str, meta: &ObjectMeta) -> Result<String> {
        let dir = self.root.join(format!(
            "{}/{}/{}",
            kind.to_lowercase(),
            meta.namespace.as_deref().context(NoNamespaceSnafu)?,
            meta.name.as_deref().context(NoNameSnafu)?,
        ));
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(Error::CannotRemove { path: dir, source }),
        }
        Ok(dir.to_string_lossy().into_owned())
    }

    /// Deletes artifacts of the object that are neither the advertised one
    /// nor within the retention TTL and record count. Returns the deleted
    /// paths, newest deletions last.
    pub fn garbage_collect(
        &self,
        current: &Artifact,
        lock_timeout: Duration,
    ) -> Result<Vec<PathBuf>> {
        let _guard = self.lock(current, lock_timeout)?;

        let dir = match self.local_path(current).parent() {
            Some(dir) if dir.is_dir() => dir.to_path_buf(),
            _ => return Ok(Vec::new()),
        };
        let current_name = self.local_path(current).file_name().map(PathBuf::from);

        let mut candidates: Vec<(PathBuf, SystemTime)> = Vec::new();
        let entries = fs::read_dir(&dir).context(CannotReadDirSnafu { path: &dir })?;
        for entry in entries {
            let entry = entry.context(CannotReadDirSnafu { path: &dir })?;
            let file_type = entry.file_type().context(CannotReadDirSnafu { path: &dir })?;
            // Symlinks and the lock sidecar are not collectable.
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name();
            if name == LOCK_FILENAME {
                continue;
            }
            if current_name.as_deref() == Some(Path::new(&name)) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((entry.path(), modified));
        }

        // Newest first; retention counts from the most recent file.
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let now = SystemTime::now();
        let mut deleted = Vec::new();
        for (index, (path, modified)) in candidates.into_iter().enumerate() {
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if index < self.retention_records && age < self.retention_ttl {
                continue;
            }
            debug!("Garbage collecting {}", path.display());
            fs::remove_file(&path).context(CannotRemoveSnafu { path: &path })?;
            deleted.push(path);
        }
        Ok(deleted)
    }

    /// Stamps the advertised URL of the artifact from its storage path.
    pub fn set_artifact_url(&self, artifact: &mut Artifact) {
        artifact.url = format!("http://{}/{}", self.hostname, artifact.path);
    }

    /// Rewrites the host of an artifact URL to the advertised hostname.
    /// Used to fix up URLs recorded by a previous process instance.
    pub fn set_hostname(&self, url: &str) -> String {
        match url::Url::parse(url) {
            Ok(parsed) => {
                let path = parsed.path().trim_start_matches('/');
                format!("http://{}/{}", self.hostname, path)
            }
            Err(_) => url.to_string(),
        }
    }

    fn finish_write(&self, artifact: &mut Artifact, digest: String, size: i64) {
        artifact.digest = Some(digest);
        artifact.size = Some(size);
        artifact.last_update_time = Time(k8s_openapi::chrono::Utc::now());
        self.set_artifact_url(artifact);
    }
}

/// Filename for a revision: slashes and colons collapse to dashes so OCI
/// revisions like `latest/sha256:abc` stay single path components.
pub fn artifact_filename(revision: &str, extension: &str) -> String {
    let sanitized: String = revision
        .chars()
        .map(|c| match c {
            '/' | ':' | ' ' => '-',
            _ => c,
        })
        .collect();
    format!("{sanitized}.{extension}")
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    target.with_file_name(name)
}

fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_meta() -> ObjectMeta {
        ObjectMeta {
            name: Some("app".into()),
            namespace: Some("ns".into()),
            ..Default::default()
        }
    }

    fn test_storage(root: &Path) -> Storage {
        Storage::new(root, "storage.example.com", Duration::from_secs(3600), 2).unwrap()
    }

    #[test]
    fn artifact_paths_and_urls() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = test_storage(tmp.path());
        let artifact = storage
            .artifact_for("HelmChart", &test_meta(), "6.2.0", "podinfo-6.2.0.tgz")
            .unwrap();
        assert_eq!(artifact.path, "helmchart/ns/app/podinfo-6.2.0.tgz");
        assert_eq!(
            artifact.url,
            "http://storage.example.com/helmchart/ns/app/podinfo-6.2.0.tgz"
        );
        assert_eq!(
            storage.local_path(&artifact),
            tmp.path().join("helmchart/ns/app/podinfo-6.2.0.tgz")
        );
    }

    #[test]
    fn artifact_filename_sanitizes_revisions() {
        assert_eq!(
            artifact_filename("latest/sha256:abcd", "tgz"),
            "latest-sha256-abcd.tgz"
        );
        assert_eq!(artifact_filename("6.2.0", "tgz"), "6.2.0.tgz");
    }

    #[test]
    fn copy_from_path_is_atomic_and_checksummed() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = test_storage(tmp.path());
        let src = tmp.path().join("src.tgz");
        fs::write(&src, b"chart bytes").unwrap();

        let mut artifact = storage
            .artifact_for("HelmChart", &test_meta(), "1.0.0", "app-1.0.0.tgz")
            .unwrap();
        storage.copy_from_path(&mut artifact, &src).unwrap();

        assert!(storage.exists(&artifact));
        assert!(storage.verify_checksum(&artifact));
        assert_eq!(artifact.size, Some(11));
        assert!(artifact.digest.as_deref().unwrap().starts_with("sha256:"));

        // No staging residue.
        let dir = storage.local_path(&artifact);
        let residue: Vec<_> = fs::read_dir(dir.parent().unwrap())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(residue.is_empty());
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = test_storage(tmp.path());
        let src = tmp.path().join("src.tgz");
        fs::write(&src, b"original").unwrap();

        let mut artifact = storage
            .artifact_for("HelmChart", &test_meta(), "1.0.0", "app-1.0.0.tgz")
            .unwrap();
        storage.copy_from_path(&mut artifact, &src).unwrap();
        assert!(storage.verify_checksum(&artifact));

        fs::write(storage.local_path(&artifact), b"tampered").unwrap();
        assert!(!storage.verify_checksum(&artifact));
    }

    #[test]
    fn archive_respects_ignore_patterns() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = test_storage(tmp.path());

        let source = tmp.path().join("source");
        fs::create_dir_all(source.join("templates")).unwrap();
        fs::write(source.join("Chart.yaml"), "name: app\nversion: 1.0.0\n").unwrap();
        fs::write(source.join("README.md"), "# app\n").unwrap();
        fs::write(source.join("templates/deploy.yaml"), "kind: Deployment\n").unwrap();

        let mut artifact = storage
            .artifact_for("OCIRepository", &test_meta(), "r1", "r1.tgz")
            .unwrap();
        storage
            .archive(&mut artifact, &source, Some("*.md\n"))
            .unwrap();
        assert!(storage.verify_checksum(&artifact));

        let file = File::open(storage.local_path(&artifact)).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert!(names.iter().any(|name| name == "Chart.yaml"));
        assert!(names.iter().any(|name| name == "templates/deploy.yaml"));
        assert!(!names.iter().any(|name| name.ends_with("README.md")));
    }

    #[test]
    fn symlink_points_at_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = test_storage(tmp.path());
        let src = tmp.path().join("src.tgz");
        fs::write(&src, b"bytes").unwrap();

        let mut artifact = storage
            .artifact_for("HelmChart", &test_meta(), "1.0.0", "app-1.0.0.tgz")
            .unwrap();
        storage.copy_from_path(&mut artifact, &src).unwrap();

        let url = storage.symlink(&artifact, LATEST_LINK).unwrap();
        assert_eq!(
            url,
            "http://storage.example.com/helmchart/ns/app/latest.tar.gz"
        );

        let link = storage
            .local_path(&artifact)
            .parent()
            .unwrap()
            .join(LATEST_LINK);
        assert_eq!(
            fs::read_link(&link).unwrap(),
            PathBuf::from("app-1.0.0.tgz")
        );

        // Re-pointing the link to a newer artifact replaces it.
        let mut newer = storage
            .artifact_for("HelmChart", &test_meta(), "1.1.0", "app-1.1.0.tgz")
            .unwrap();
        storage.copy_from_path(&mut newer, &src).unwrap();
        storage.symlink(&newer, LATEST_LINK).unwrap();
        assert_eq!(
            fs::read_link(&link).unwrap(),
            PathBuf::from("app-1.1.0.tgz")
        );
    }

    #[test]
    fn lock_times_out_while_held() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = test_storage(tmp.path());
        let artifact = storage
            .artifact_for("HelmChart", &test_meta(), "1.0.0", "app-1.0.0.tgz")
            .unwrap();

        let guard = storage.lock(&artifact, Duration::from_millis(200)).unwrap();
        let second = storage.lock(&artifact, Duration::from_millis(120));
        assert!(matches!(second, Err(Error::LockAcquireTimeout { .. })));

        drop(guard);
        storage
            .lock(&artifact, Duration::from_millis(200))
            .expect("lock is free after release");
    }

    #[test]
    fn garbage_collect_retains_current_and_recent() {
        let tmp = tempfile::tempdir().unwrap();
        // TTL of zero: only the advertised artifact survives.
        let storage = Storage::new(tmp.path(), "host", Duration::ZERO, 10).unwrap();
        let src = tmp.path().join("src.tgz");
        fs::write(&src, b"bytes").unwrap();

        let mut old = storage
            .artifact_for("HelmChart", &test_meta(), "1.0.0", "app-1.0.0.tgz")
            .unwrap();
        storage.copy_from_path(&mut old, &src).unwrap();
        let mut current = storage
            .artifact_for("HelmChart", &test_meta(), "1.1.0", "app-1.1.0.tgz")
            .unwrap();
        storage.copy_from_path(&mut current, &src).unwrap();

        let deleted = storage
            .garbage_collect(&current, Duration::from_secs(1))
            .unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].ends_with("app-1.0.0.tgz"));
        assert!(storage.exists(&current));
        assert!(!storage.exists(&old));
    }

    #[test]
    fn garbage_collect_honors_record_count() {
        let tmp = tempfile::tempdir().unwrap();
        // Generous TTL, one retained record besides the current artifact.
        let storage = Storage::new(tmp.path(), "host", Duration::from_secs(3600), 1).unwrap();
        let src = tmp.path().join("src.tgz");
        fs::write(&src, b"bytes").unwrap();

        let mut artifacts = Vec::new();
        for version in ["1.0.0", "1.1.0", "1.2.0"] {
            let mut artifact = storage
                .artifact_for(
                    "HelmChart",
                    &test_meta(),
                    version,
                    &format!("app-{version}.tgz"),
                )
                .unwrap();
            storage.copy_from_path(&mut artifact, &src).unwrap();
            artifacts.push(artifact);
            std::thread::sleep(Duration::from_millis(20));
        }

        let current = artifacts.pop().unwrap();
        let deleted = storage
            .garbage_collect(&current, Duration::from_secs(1))
            .unwrap();
        // 1.1.0 is the one retained record, 1.0.0 goes.
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].ends_with("app-1.0.0.tgz"));
        assert!(storage.exists(&current));
    }

    #[test]
    fn remove_all_deletes_object_subtree() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = test_storage(tmp.path());
        let src = tmp.path().join("src.tgz");
        fs::write(&src, b"bytes").unwrap();

        let mut artifact = storage
            .artifact_for("HelmChart", &test_meta(), "1.0.0", "app-1.0.0.tgz")
            .unwrap();
        storage.copy_from_path(&mut artifact, &src).unwrap();

        let deleted = storage.remove_all("HelmChart", &test_meta()).unwrap();
        assert!(deleted.ends_with("helmchart/ns/app"));
        assert!(!storage.exists(&artifact));
        assert!(!tmp.path().join("helmchart/ns/app").exists());

        // Deleting an absent subtree is not an error.
        storage.remove_all("HelmChart", &test_meta()).unwrap();
    }

    #[test]
    fn set_hostname_rewrites_the_host() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = test_storage(tmp.path());
        assert_eq!(
            storage.set_hostname("http://old-host:9090/helmchart/ns/app/app-1.0.0.tgz"),
            "http://storage.example.com/helmchart/ns/app/app-1.0.0.tgz"
        );
    }
}
