// Artifact storage and per-job scratch space
//
// Stages never pass paths to each other directly: everything a job produces
// goes through an ArtifactStore and is referred to by an opaque handle.
// Intermediate files live in a JobWorkspace, which removes itself on drop so
// scratch data disappears whether the job succeeds, fails or is cancelled.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DubError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Source,
    Audio,
    Subtitle,
    Narration,
    Video,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Source => "source",
            ArtifactKind::Audio => "audio",
            ArtifactKind::Subtitle => "subtitle",
            ArtifactKind::Narration => "narration",
            ArtifactKind::Video => "video",
        }
    }
}

/// Opaque reference to a stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle {
    job_id: Uuid,
    kind: ArtifactKind,
    key: String,
}

impl ArtifactHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// File extension the artifact was stored with, if any
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.key).extension().and_then(|e| e.to_str())
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put_bytes(&self, job_id: Uuid, kind: ArtifactKind, extension: &str, bytes: &[u8]) -> Result<ArtifactHandle>;

    /// Store a copy of a file, keeping its extension
    async fn put_file(&self, job_id: Uuid, kind: ArtifactKind, source: &Path) -> Result<ArtifactHandle>;

    async fn read_bytes(&self, handle: &ArtifactHandle) -> Result<Vec<u8>>;

    /// A local path the media tools can read the artifact from
    async fn local_path(&self, handle: &ArtifactHandle) -> Result<PathBuf>;

    async fn export(&self, handle: &ArtifactHandle, destination: &Path) -> Result<()>;
}

/// Artifact store on the local filesystem, one directory per job
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn handle_for(job_id: Uuid, kind: ArtifactKind, extension: &str) -> ArtifactHandle {
        let extension = extension.trim_start_matches('.');
        let name = if extension.is_empty() {
            kind.as_str().to_string()
        } else {
            format!("{}.{}", kind.as_str(), extension)
        };
        ArtifactHandle {
            job_id,
            kind,
            key: format!("{}/{}", job_id, name),
        }
    }

    fn path_of(&self, handle: &ArtifactHandle) -> PathBuf {
        self.root.join(&handle.key)
    }

    async fn ensure_job_dir(&self, job_id: Uuid) -> Result<()> {
        let dir = self.root.join(job_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| DubError::Storage(format!("Cannot create {}: {}", dir.display(), e)))
    }

    async fn existing_path(&self, handle: &ArtifactHandle) -> Result<PathBuf> {
        let path = self.path_of(handle);
        if fs::try_exists(&path).await.unwrap_or(false) {
            Ok(path)
        } else {
            Err(DubError::FileNotFound(format!("artifact {}", handle.key)))
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put_bytes(&self, job_id: Uuid, kind: ArtifactKind, extension: &str, bytes: &[u8]) -> Result<ArtifactHandle> {
        self.ensure_job_dir(job_id).await?;
        let handle = Self::handle_for(job_id, kind, extension);
        let path = self.path_of(&handle);
        fs::write(&path, bytes)
            .await
            .map_err(|e| DubError::Storage(format!("Cannot write {}: {}", path.display(), e)))?;

        debug!("Stored {} ({} bytes)", handle.key, bytes.len());
        Ok(handle)
    }

    async fn put_file(&self, job_id: Uuid, kind: ArtifactKind, source: &Path) -> Result<ArtifactHandle> {
        if !source.exists() {
            return Err(DubError::FileNotFound(source.display().to_string()));
        }
        self.ensure_job_dir(job_id).await?;
        let extension = source.extension().and_then(|e| e.to_str()).unwrap_or("");
        let handle = Self::handle_for(job_id, kind, extension);
        let path = self.path_of(&handle);
        fs::copy(source, &path)
            .await
            .map_err(|e| DubError::Storage(format!("Cannot copy {} into the store: {}", source.display(), e)))?;

        info!("Stored {} as {}", source.display(), handle.key);
        Ok(handle)
    }

    async fn read_bytes(&self, handle: &ArtifactHandle) -> Result<Vec<u8>> {
        let path = self.existing_path(handle).await?;
        Ok(fs::read(path).await?)
    }

    async fn local_path(&self, handle: &ArtifactHandle) -> Result<PathBuf> {
        self.existing_path(handle).await
    }

    async fn export(&self, handle: &ArtifactHandle, destination: &Path) -> Result<()> {
        let path = self.existing_path(handle).await?;
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&path, destination)
            .await
            .map_err(|e| DubError::Storage(format!("Cannot export {}: {}", handle.key, e)))?;

        info!("Exported {} to {}", handle.key, destination.display());
        Ok(())
    }
}

/// Scratch directory owned by one job, deleted on drop
pub struct JobWorkspace {
    dir: TempDir,
}

impl JobWorkspace {
    pub fn new(base: &Path, job_id: Uuid) -> Result<Self> {
        std::fs::create_dir_all(base)
            .map_err(|e| DubError::Storage(format!("Cannot create work dir {}: {}", base.display(), e)))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", job_id))
            .tempdir_in(base)
            .map_err(|e| DubError::Storage(format!("Cannot create job workspace: {}", e)))?;

        debug!("Job workspace: {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Fresh file name that no other caller of this method will get
    pub fn unique_file(&self, prefix: &str, extension: &str) -> PathBuf {
        self.file(&format!("{}-{}.{}", prefix, Uuid::new_v4().simple(), extension))
    }
}
