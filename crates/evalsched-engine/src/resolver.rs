//! Resolution of model references into loadable checkpoints.
//!
//! A model reference is either a local directory or a remote repository
//! identifier. Local directories may hold weights directly, or hold a tree
//! of intermediate training checkpoints laid out as `<model>/hf/<iter>/`
//! (or `<model_hf>/<iter>/`); every checkpoint in the tree becomes its own
//! resolved model. Remote identifiers are downloaded into the shared model
//! cache so compute nodes can load them without network access, and are
//! passed downstream by identifier.

use std::fmt;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::lock::LockedFile;

/// The extension of files holding model weights.
pub const WEIGHTS_EXTENSION: &str = "safetensors";

/// The conventional name of the directory holding a checkpoint tree.
const CHECKPOINT_TREE_DIR: &str = "hf";

/// Separates a remote repository id from its `key=value` modifiers.
const MODIFIER_DELIMITER: char = ',';

/// The subdirectory of the model cache holding lock files.
const LOCKS_DIR: &str = "locks";

/// The subdirectory of the model cache holding completion markers.
const SNAPSHOTS_DIR: &str = "snapshots";

/// Represents an error that occurred while resolving a model reference.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// A local directory could not be read.
    #[error("failed to read model directory `{path}`")]
    Io {
        /// The directory being read.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The download program could not be started.
    #[error("failed to run model download program `{program}`")]
    Spawn {
        /// The download program.
        program: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The download program exited unsuccessfully.
    #[error("failed to download `{repo_id}`: {reason}")]
    Download {
        /// The repository being downloaded.
        repo_id: String,
        /// What went wrong.
        reason: String,
    },

    /// The model cache could not be updated.
    #[error("failed to update model cache entry `{path}`")]
    Cache {
        /// The cache entry path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// Represents a remote repository identifier with optional modifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIdentifier {
    /// The identifier exactly as supplied.
    raw: String,
    /// The repository id, e.g. `EleutherAI/pythia-160m`.
    repo_id: String,
    /// The pinned revision, if any.
    revision: Option<String>,
}

impl RemoteIdentifier {
    /// Parses a remote identifier.
    ///
    /// Everything before the first `,` is the repository id; the remainder is
    /// a `,`-separated list of `key=value` modifiers, of which only
    /// `revision` is used. Entries without `=` are ignored.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split(MODIFIER_DELIMITER);
        let repo_id = parts.next().unwrap_or_default().trim().to_string();
        let revision = parts
            .filter_map(|kv| kv.split_once('='))
            .find(|(k, _)| k.trim() == "revision")
            .map(|(_, v)| v.trim().to_string());

        Self {
            raw: raw.to_string(),
            repo_id,
            revision,
        }
    }

    /// Gets the identifier exactly as supplied.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Gets the repository id.
    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    /// Gets the pinned revision, if any.
    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Gets the model cache key for this identifier.
    fn cache_key(&self) -> String {
        let repo = self.repo_id.replace('/', "--");
        match &self.revision {
            Some(revision) => format!("{repo}@{}", revision.replace('/', "--")),
            None => repo,
        }
    }
}

/// Represents a user-supplied model reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelReference {
    /// A local directory expected to hold weights directly.
    LocalDirectory(PathBuf),
    /// A local directory holding a tree of checkpoint subdirectories.
    LocalCheckpointTree(PathBuf),
    /// A remote repository identifier.
    RemoteIdentifier(RemoteIdentifier),
}

impl ModelReference {
    /// Classifies a model reference.
    ///
    /// Anything that is not an existing local directory is treated as a
    /// remote identifier.
    pub fn parse(reference: &str) -> Self {
        let path = Path::new(reference);
        if !path.is_dir() {
            return Self::RemoteIdentifier(RemoteIdentifier::parse(reference));
        }

        if checkpoint_tree_base(path).is_dir() {
            Self::LocalCheckpointTree(path.to_path_buf())
        } else {
            Self::LocalDirectory(path.to_path_buf())
        }
    }
}

/// Represents a model confirmed to be loadable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolvedModel {
    /// A local directory holding weights.
    Local(PathBuf),
    /// A remote identifier, including any modifiers, present in the model
    /// cache.
    Remote(String),
}

impl fmt::Display for ResolvedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(id) => write!(f, "{id}"),
        }
    }
}

/// Gets the directory whose subdirectories form a checkpoint tree.
///
/// A directory whose name already contains `hf` is its own base; otherwise
/// the base is its `hf` subdirectory.
fn checkpoint_tree_base(dir: &Path) -> PathBuf {
    let named_hf = dir
        .file_name()
        .map(|n| n.to_string_lossy().contains(CHECKPOINT_TREE_DIR))
        .unwrap_or(false);

    if named_hf {
        dir.to_path_buf()
    } else {
        dir.join(CHECKPOINT_TREE_DIR)
    }
}

/// Determines if a directory directly contains weight files.
fn has_weights(dir: &Path) -> Result<bool, ResolveError> {
    let io_error = |source| ResolveError::Io {
        path: dir.to_path_buf(),
        source,
    };

    for entry in dir.read_dir().map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == WEIGHTS_EXTENSION) {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Resolves a local directory into the checkpoints it holds.
///
/// The directory itself is included if it holds weights, followed by every
/// immediate subdirectory of its checkpoint tree base that holds weights, in
/// sorted order.
fn resolve_local(dir: &Path) -> Result<Vec<ResolvedModel>, ResolveError> {
    let dir = std::path::absolute(dir).map_err(|source| ResolveError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut resolved = Vec::new();
    if has_weights(&dir)? {
        resolved.push(ResolvedModel::Local(dir.clone()));
    }

    let base = checkpoint_tree_base(&dir);
    if base.is_dir() {
        let mut checkpoints = Vec::new();
        for entry in base.read_dir().map_err(|source| ResolveError::Io {
            path: base.clone(),
            source,
        })? {
            let path = entry
                .map_err(|source| ResolveError::Io {
                    path: base.clone(),
                    source,
                })?
                .path();
            if path.is_dir() {
                checkpoints.push(path);
            }
        }

        checkpoints.sort();
        for checkpoint in checkpoints {
            if has_weights(&checkpoint)? {
                resolved.push(ResolvedModel::Local(checkpoint));
            }
        }
    }

    Ok(resolved)
}

/// A remote model repository that can populate the local model cache.
#[async_trait]
pub trait ModelRepository: Send + Sync {
    /// Downloads (or refreshes) the full repository snapshot for `id`.
    async fn snapshot(&self, id: &RemoteIdentifier) -> Result<(), ResolveError>;
}

/// Downloads repositories by running an external command.
///
/// The command is invoked as `<program> <args..> <repo_id> [--revision
/// <revision>]`.
#[derive(Debug, Clone)]
pub struct CommandModelRepository {
    /// The program to run.
    program: String,
    /// Arguments preceding the repository id.
    args: Vec<String>,
}

impl CommandModelRepository {
    /// Creates a repository from a command line whose first element is the
    /// program.
    ///
    /// Returns `None` if the command line is empty.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl ModelRepository for CommandModelRepository {
    async fn snapshot(&self, id: &RemoteIdentifier) -> Result<(), ResolveError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(id.repo_id());
        if let Some(revision) = id.revision() {
            command.arg("--revision").arg(revision);
        }

        debug!(?command, "spawning model download command");
        let output = command.output().await.map_err(|source| ResolveError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ResolveError::Download {
                repo_id: id.repo_id().to_string(),
                reason: format!(
                    "`{program}` failed with {status}: {stderr}",
                    program = self.program,
                    status = output.status,
                    stderr = String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(())
    }
}

/// The completion marker written for a cached snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMarker {
    /// The repository id.
    repo_id: String,
    /// The pinned revision, if any.
    revision: Option<String>,
    /// When the snapshot last completed, in RFC 3339 format.
    completed_at: String,
}

/// A model cache keyed by repository id and revision.
///
/// Each key is guarded by an exclusive lock file, so concurrent schedulers
/// downloading the same repository take turns rather than writing over each
/// other. A snapshot pinned to a revision is downloaded once; an unpinned
/// snapshot is refreshed on every resolution so it tracks the latest
/// revision.
pub struct ModelCache {
    /// The cache root directory.
    root: PathBuf,
    /// The repository that populates the cache.
    inner: Arc<dyn ModelRepository>,
}

impl fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCache")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ModelCache {
    /// Creates a model cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, inner: Arc<dyn ModelRepository>) -> Self {
        Self {
            root: root.into(),
            inner,
        }
    }

    /// Gets the path of the completion marker for a key.
    fn marker_path(&self, key: &str) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(format!("{key}.json"))
    }

    /// Writes the completion marker for `id`.
    fn write_marker(&self, id: &RemoteIdentifier, path: &Path) -> Result<(), ResolveError> {
        let cache_error = |source| ResolveError::Cache {
            path: path.to_path_buf(),
            source,
        };

        let marker = SnapshotMarker {
            repo_id: id.repo_id().to_string(),
            revision: id.revision().map(str::to_string),
            completed_at: Utc::now().to_rfc3339(),
        };

        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir).map_err(cache_error)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(cache_error)?;
        serde_json::to_writer_pretty(temp.as_file_mut(), &marker)
            .map_err(|e| cache_error(e.into()))?;
        temp.persist(path).map_err(|e| cache_error(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl ModelRepository for ModelCache {
    async fn snapshot(&self, id: &RemoteIdentifier) -> Result<(), ResolveError> {
        let key = id.cache_key();
        let lock_path = self.root.join(LOCKS_DIR).join(format!("{key}.lock"));
        let _lock = LockedFile::acquire_exclusive(&lock_path)
            .await
            .map_err(|source| ResolveError::Cache {
                path: lock_path.clone(),
                source,
            })?;

        let marker = self.marker_path(&key);
        if id.revision().is_some() && marker.is_file() {
            debug!(key, "model snapshot is already cached");
            return Ok(());
        }

        self.inner.snapshot(id).await?;
        self.write_marker(id, &marker)
    }
}

/// Resolves model references into loadable checkpoints.
pub struct ModelResolver {
    /// The repository used for remote identifiers.
    repository: Arc<dyn ModelRepository>,
}

impl fmt::Debug for ModelResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelResolver").finish_non_exhaustive()
    }
}

impl ModelResolver {
    /// Creates a new model resolver.
    pub fn new(repository: Arc<dyn ModelRepository>) -> Self {
        Self { repository }
    }

    /// Resolves a single reference.
    ///
    /// Failures are logged and yield no resolved models.
    pub async fn resolve_one(&self, reference: &str) -> Vec<ResolvedModel> {
        let resolved = match ModelReference::parse(reference) {
            ModelReference::LocalDirectory(dir) | ModelReference::LocalCheckpointTree(dir) => {
                resolve_local(&dir).unwrap_or_else(|e| {
                    warn!(reference, "skipping local model: {e}");
                    Vec::new()
                })
            }
            ModelReference::RemoteIdentifier(id) => {
                info!(
                    reference,
                    "model not found locally; downloading it from the model repository"
                );
                match self.repository.snapshot(&id).await {
                    Ok(()) => vec![ResolvedModel::Remote(id.raw().to_string())],
                    Err(e) => {
                        warn!(reference, "failed to download model: {e}");
                        Vec::new()
                    }
                }
            }
        };

        if resolved.is_empty() {
            warn!(
                reference,
                "could not find any valid model for `{reference}`; it will be skipped"
            );
        }

        resolved
    }

    /// Resolves every reference, keyed by reference in input order.
    ///
    /// A reference that appears more than once is resolved once.
    pub async fn resolve<S: AsRef<str>>(
        &self,
        references: &[S],
    ) -> IndexMap<String, Vec<ResolvedModel>> {
        let mut resolved = IndexMap::new();
        for reference in references {
            let reference = reference.as_ref();
            if resolved.contains_key(reference) {
                continue;
            }

            let models = self.resolve_one(reference).await;
            resolved.insert(reference.to_string(), models);
        }

        resolved
    }
}
