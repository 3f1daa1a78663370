//! Artifact fetch → verify → extract → locate-executable pipeline (spec §4.F).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AgentError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Candidate executable names probed in order after archive extraction
/// (spec §4.F step 5), before falling back to a tree walk.
const EXECUTABLE_CANDIDATES: &[&str] = &["{app}", "bin/{app}", "{app}.bin", "main", "app", "start.sh", "run.sh"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactType {
    Binary,
    Archive,
    Script,
    Unknown,
}

/// A named blob belonging to one application version (spec §3 `Artifact`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub artifact_type: ArtifactType,
    pub storage_url: String,
    pub checksums: HashMap<String, String>,
    pub size: u64,
}

impl Artifact {
    #[must_use]
    pub fn new(name: impl Into<String>, artifact_type: ArtifactType, storage_url: impl Into<String>) -> Self {
        Self { name: name.into(), artifact_type, storage_url: storage_url.into(), checksums: HashMap::new(), size: 0 }
    }

    #[must_use]
    pub fn with_sha256(mut self, hex_digest: impl Into<String>) -> Self {
        self.checksums.insert("sha256".to_owned(), hex_digest.into());
        self
    }

    fn is_archive(&self) -> bool {
        self.name.ends_with(".tar.gz") || self.name.ends_with(".tgz") || self.name.ends_with(".zip")
    }
}

/// HTTP fetch collaborator (spec §6 `Fetcher`). A non-200 response is
/// `unavailable`.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn get(&self, url: &str) -> Result<Vec<u8>, AgentError>;
}

/// `reqwest`-backed [`Fetcher`], the production implementation.
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// # Panics
    ///
    /// Panics if the underlying TLS backend fails to initialize, mirroring
    /// `reqwest::Client::new`'s own panic contract.
    #[must_use]
    pub fn new() -> Self {
        Self { client: reqwest::Client::builder().timeout(FETCH_TIMEOUT).build().unwrap_or_default() }
    }
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Fetcher for ReqwestFetcher {
    async fn get(&self, url: &str) -> Result<Vec<u8>, AgentError> {
        let response = self.client.get(url).send().await.map_err(|e| AgentError::Fetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AgentError::Fetch(format!("unexpected status {} from {url}", response.status())));
        }
        response.bytes().await.map(|b| b.to_vec()).map_err(|e| AgentError::Fetch(e.to_string()))
    }
}

fn verify_checksum(artifact: &Artifact, bytes: &[u8]) -> Result<(), AgentError> {
    let Some(expected) = artifact.checksums.get("sha256") else {
        return Ok(());
    };
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(AgentError::ChecksumMismatch);
    }
    Ok(())
}

/// Prepare a deployment: fetch every artifact, verify checksums, write or
/// extract into `<deploy_root>/<app_name>/<version>/`, then locate the
/// executable entrypoint (spec §4.F). Returns the absolute path to that
/// executable.
///
/// A checksum mismatch aborts the *entire* deploy (spec §4.F step 2) — no
/// partial deployment is left registered, though already-written files for
/// earlier artifacts in the same call are not rolled back (the caller's
/// deployment directory is versioned, so a retried deploy overwrites it).
///
/// # Errors
///
/// [`AgentError::Fetch`], [`AgentError::ChecksumMismatch`],
/// [`AgentError::PathTraversal`], [`AgentError::NoExecutable`], or an I/O
/// error.
pub async fn prepare_deployment(
    fetcher: &dyn Fetcher,
    app_name: &str,
    version: &str,
    artifacts: &[Artifact],
    deploy_root: &Path,
) -> Result<PathBuf, AgentError> {
    let version_dir = deploy_root.join(app_name).join(version);
    tokio::fs::create_dir_all(&version_dir).await?;

    let mut preferred_executable: Option<PathBuf> = None;

    for artifact in artifacts {
        let bytes = fetcher.get(&artifact.storage_url).await?;
        verify_checksum(artifact, &bytes)?;

        match artifact.artifact_type {
            ArtifactType::Binary | ArtifactType::Script => {
                let path = version_dir.join(&artifact.name);
                write_file(&path, &bytes, 0o755).await?;
                if preferred_executable.is_none() {
                    preferred_executable = Some(path);
                }
            }
            ArtifactType::Archive => {
                extract_archive(artifact, &bytes, &version_dir).await?;
            }
            ArtifactType::Unknown => {
                if artifact.is_archive() {
                    extract_archive(artifact, &bytes, &version_dir).await?;
                } else {
                    write_file(&version_dir.join(&artifact.name), &bytes, 0o644).await?;
                }
            }
        }
    }

    if let Some(executable) = preferred_executable {
        return Ok(executable);
    }

    locate_executable(app_name, &version_dir).await
}

async fn write_file(path: &Path, bytes: &[u8], mode: u32) -> Result<(), AgentError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    set_mode(path, mode).await?;
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<(), AgentError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<(), AgentError> {
    Ok(())
}

/// Reject any archive entry whose cleaned target escapes `root` (spec §4.F
/// step 4, §8 property 6).
fn guarded_target(root: &Path, entry_path: &Path) -> Result<PathBuf, AgentError> {
    let mut cleaned = PathBuf::new();
    for component in entry_path.components() {
        match component {
            std::path::Component::Normal(part) => cleaned.push(part),
            std::path::Component::ParentDir | std::path::Component::RootDir | std::path::Component::Prefix(_) => {
                return Err(AgentError::PathTraversal(entry_path.display().to_string()));
            }
            std::path::Component::CurDir => {}
        }
    }
    let target = root.join(&cleaned);
    if !target.starts_with(root) {
        return Err(AgentError::PathTraversal(entry_path.display().to_string()));
    }
    Ok(target)
}

async fn extract_archive(artifact: &Artifact, bytes: &[u8], dest: &Path) -> Result<(), AgentError> {
    let dest = dest.to_owned();
    let bytes = bytes.to_owned();
    let name = artifact.name.clone();

    tokio::task::spawn_blocking(move || extract_archive_blocking(&name, &bytes, &dest))
        .await
        .map_err(|e| AgentError::Archive(format!("extraction task panicked: {e}")))?
}

fn extract_archive_blocking(name: &str, bytes: &[u8], dest: &Path) -> Result<(), AgentError> {
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        extract_tar_gz(bytes, dest)
    } else if name.ends_with(".zip") {
        extract_zip(bytes, dest)
    } else {
        Err(AgentError::Archive(format!("unrecognized archive suffix: {name}")))
    }
}

fn extract_tar_gz(bytes: &[u8], dest: &Path) -> Result<(), AgentError> {
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries().map_err(|e| AgentError::Archive(e.to_string()))? {
        let mut entry = entry.map_err(|e| AgentError::Archive(e.to_string()))?;
        let entry_path = entry.path().map_err(|e| AgentError::Archive(e.to_string()))?.into_owned();
        let target = guarded_target(dest, &entry_path)?;

        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target).map_err(|e| AgentError::Archive(e.to_string()))?;
    }
    Ok(())
}

fn extract_zip(bytes: &[u8], dest: &Path) -> Result<(), AgentError> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor).map_err(|e| AgentError::Archive(e.to_string()))?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(|e| AgentError::Archive(e.to_string()))?;
        let Some(enclosed) = file.enclosed_name() else {
            return Err(AgentError::PathTraversal(file.name().to_owned()));
        };
        let target = guarded_target(dest, &enclosed)?;

        if file.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut file, &mut out)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(())
}

/// Probe the well-known candidate names (spec §4.F step 5), then fall back
/// to a tree walk for the first regular file with any execute bit set.
async fn locate_executable(app_name: &str, version_dir: &Path) -> Result<PathBuf, AgentError> {
    for candidate in EXECUTABLE_CANDIDATES {
        let relative = candidate.replace("{app}", app_name);
        let path = version_dir.join(&relative);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) && is_regular_executable(&path).await {
            return Ok(path);
        }
    }

    if let Some(found) = walk_for_executable(version_dir).await {
        return Ok(found);
    }

    Err(AgentError::NoExecutable(app_name.to_owned()))
}

async fn is_regular_executable(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

async fn walk_for_executable(root: &Path) -> Option<PathBuf> {
    let mut stack = vec![root.to_owned()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(file_type) = entry.file_type().await else { continue };
            if file_type.is_dir() {
                stack.push(path);
            } else if is_regular_executable(&path).await {
                return Some(path);
            }
        }
    }
    None
}
