//! Acquisition of the runtime container image.
//!
//! Evaluation jobs run inside an Apptainer image shared by every user of a
//! cluster. Before anything is submitted, [`ArtifactStore::ensure`] makes
//! sure that image exists at its configured destination by walking a small
//! state machine:
//!
//! ```text
//! Absent ──exists──────────────────────────────▶ Present
//!   │
//!   └──missing──▶ TryFetch ──fetched───────────▶ Present
//!                    │
//!                    └──failed──▶ TryBuild ──built──▶ Present
//!                                    │
//!                                    └──failed──▶ Failed
//! ```
//!
//! Both the fetch and build stages write into a temporary file next to the
//! destination and rename it into place, so a reader of the destination never
//! observes a partially written image. Independent processes racing on the
//! same destination each produce their own temporary file; whichever rename
//! lands last wins, and either result is a complete image.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::fs;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;
use url::Url;

/// Identifies a runtime image and where it is cached locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// The source image name, e.g. `ghcr.io/org/eval-env:latest`.
    name: String,
    /// The transport used to build from the source image, e.g. `docker`.
    source_repository: String,
    /// The local path of the built image.
    destination: PathBuf,
}

impl ImageReference {
    /// Creates a new image reference.
    pub fn new(
        name: impl Into<String>,
        source_repository: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            source_repository: source_repository.into(),
            destination: destination.into(),
        }
    }

    /// Gets the source image name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the transport used to build from the source image.
    pub fn source_repository(&self) -> &str {
        &self.source_repository
    }

    /// Gets the fully-qualified source reference handed to the image builder.
    ///
    /// A name that already carries a transport (`docker://...`) is returned
    /// unchanged.
    pub fn source(&self) -> String {
        if self.name.contains("://") {
            self.name.clone()
        } else {
            format!("{}://{}", self.source_repository, self.name)
        }
    }

    /// Gets the configured destination path.
    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

/// Represents an error that occurred while fetching a pre-built image.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The repository does not have the requested image.
    #[error("image `{0}` was not found in the artifact repository")]
    NotFound(String),

    /// The transfer failed.
    #[error("failed to transfer image `{name}`: {reason}")]
    Transfer {
        /// The requested image file name.
        name: String,
        /// What went wrong.
        reason: String,
    },
}

/// Represents an error that occurred while building an image locally.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The build program could not be started.
    #[error("failed to run image builder `{program}`")]
    Spawn {
        /// The build program.
        program: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The build program exited unsuccessfully.
    #[error("image builder `{program}` failed with {status}: {stderr}")]
    Failed {
        /// The build program.
        program: String,
        /// The exit status of the build program.
        status: ExitStatus,
        /// The standard error of the build program.
        stderr: String,
    },
}

/// Represents an error that prevented an image from being made available.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// The destination path cannot be used.
    #[error("image destination `{0}` does not name a file")]
    InvalidDestination(PathBuf),

    /// A filesystem operation on the destination failed.
    #[error("failed to prepare image destination `{path}`")]
    Io {
        /// The path being operated on.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Building the image failed after fetching was not possible.
    #[error("failed to build image for `{destination}`")]
    Build {
        /// The destination of the image.
        destination: PathBuf,
        /// The underlying error.
        #[source]
        source: BuildError,
    },
}

/// A repository of pre-built images, addressed by file name.
#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    /// Fetches the image with the given file name into a local cache and
    /// returns the cached path.
    async fn fetch(&self, name: &str) -> Result<PathBuf, FetchError>;
}

/// Builds images from a source reference.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Builds the image at `source` into the file at `output`.
    async fn build(&self, output: &Path, source: &str) -> Result<(), BuildError>;
}

/// The result of a single acquisition step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The step produced (or found) the image.
    Succeeded,
    /// The step did not produce the image.
    Failed,
}

/// The acquisition state of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    /// Nothing is known yet; the destination is checked for an existing image.
    Absent,
    /// The image is being fetched from the artifact repository.
    TryFetch,
    /// The image is being built locally.
    TryBuild,
    /// The image is in place.
    Present,
    /// Every stage failed.
    Failed,
}

impl ImageState {
    /// Gets the state following `self` given the result of its step.
    ///
    /// Terminal states are absorbing.
    pub fn next(self, step: Step) -> Self {
        match (self, step) {
            (Self::Absent, Step::Succeeded) => Self::Present,
            (Self::Absent, Step::Failed) => Self::TryFetch,
            (Self::TryFetch, Step::Succeeded) => Self::Present,
            (Self::TryFetch, Step::Failed) => Self::TryBuild,
            (Self::TryBuild, Step::Succeeded) => Self::Present,
            (Self::TryBuild, Step::Failed) => Self::Failed,
            (Self::Present, _) => Self::Present,
            (Self::Failed, _) => Self::Failed,
        }
    }

    /// Determines if the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Present | Self::Failed)
    }
}

/// Makes an image path absolute and lexically clean, canonicalizing the
/// parent directory when it already exists.
fn absolute(path: &Path) -> Result<PathBuf, ArtifactError> {
    let path = std::path::absolute(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let path = path_clean::clean(path);

    let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
        return Err(ArtifactError::InvalidDestination(path));
    };

    match parent.canonicalize() {
        Ok(parent) => Ok(parent.join(file_name)),
        Err(_) => Ok(path),
    }
}

/// Creates an empty temporary file beside `destination`.
///
/// The file is removed when the returned path is dropped unless it is
/// persisted first.
fn temp_beside(destination: &Path) -> io::Result<TempPath> {
    let parent = destination.parent().unwrap_or(Path::new("."));
    let prefix = format!(
        ".{}.",
        destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );

    Ok(tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent)?
        .into_temp_path())
}

/// The mode of an installed image, readable by every user of the cluster.
#[cfg(unix)]
const SHARED_MODE: u32 = 0o644;

/// Makes a file readable by every user.
///
/// Temporary files are created private to their owner, and the mode carries
/// over through the rename.
async fn make_shared(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;

        fs::set_permissions(path, std::fs::Permissions::from_mode(SHARED_MODE)).await?;
    }

    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}

/// Ensures a runtime image exists locally.
pub struct ArtifactStore {
    /// The repository of pre-built images, if one is configured.
    repository: Option<Arc<dyn ArtifactRepository>>,
    /// The local image builder.
    builder: Arc<dyn ImageBuilder>,
    /// Whether an existing image is replaced.
    force: bool,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("repository", &self.repository.is_some())
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

impl ArtifactStore {
    /// Creates a new artifact store.
    pub fn new(
        repository: Option<Arc<dyn ArtifactRepository>>,
        builder: Arc<dyn ImageBuilder>,
    ) -> Self {
        Self {
            repository,
            builder,
            force: false,
        }
    }

    /// Sets whether an existing image is replaced rather than trusted.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Ensures the referenced image exists, returning its absolute path.
    ///
    /// An existing file at the destination is trusted without inspection.
    /// Otherwise the image is fetched from the artifact repository, and if
    /// that fails for any reason it is built locally. Only a failed build is
    /// reported as an error.
    pub async fn ensure(&self, reference: &ImageReference) -> Result<PathBuf, ArtifactError> {
        let destination = absolute(reference.destination())?;
        let mut state = ImageState::Absent;
        let mut failure = None;

        while !state.is_terminal() {
            let step = match state {
                ImageState::Absent => self.check_existing(&destination).await?,
                ImageState::TryFetch => self.try_fetch(&destination).await,
                ImageState::TryBuild => match self.build(reference, &destination).await {
                    Ok(()) => Step::Succeeded,
                    Err(e) => {
                        failure = Some(e);
                        Step::Failed
                    }
                },
                ImageState::Present | ImageState::Failed => break,
            };

            state = state.next(step);
        }

        match (state, failure) {
            (ImageState::Present, _) => Ok(destination),
            (_, Some(e)) => Err(e),
            (_, None) => Err(ArtifactError::InvalidDestination(destination)),
        }
    }

    /// Checks for an existing image and prepares the destination directory
    /// when there is none.
    async fn check_existing(&self, destination: &Path) -> Result<Step, ArtifactError> {
        let exists = fs::try_exists(destination)
            .await
            .map_err(|source| ArtifactError::Io {
                path: destination.to_path_buf(),
                source,
            })?;

        if exists && !self.force {
            debug!(path = %destination.display(), "re-using existing image");
            return Ok(Step::Succeeded);
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| ArtifactError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        Ok(Step::Failed)
    }

    /// Tries to fetch a pre-built image and install it at `destination`.
    ///
    /// Every failure is logged and reported as [`Step::Failed`].
    async fn try_fetch(&self, destination: &Path) -> Step {
        let Some(repository) = &self.repository else {
            debug!("no artifact repository is configured; skipping fetch");
            return Step::Failed;
        };

        let Some(name) = destination.file_name().and_then(|n| n.to_str()) else {
            warn!(path = %destination.display(), "image destination has no usable file name");
            return Step::Failed;
        };

        info!(name, "fetching pre-built image");
        let cached = match repository.fetch(name).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(name, "could not fetch pre-built image, building it instead: {e}");
                return Step::Failed;
            }
        };

        match install_copy(&cached, destination).await {
            Ok(()) => {
                info!(path = %destination.display(), "installed pre-built image");
                Step::Succeeded
            }
            Err(e) => {
                warn!(
                    cached = %cached.display(),
                    path = %destination.display(),
                    "could not install fetched image, building it instead: {e}"
                );
                Step::Failed
            }
        }
    }

    /// Builds the image into a temporary file and renames it into place.
    async fn build(
        &self,
        reference: &ImageReference,
        destination: &Path,
    ) -> Result<(), ArtifactError> {
        let source = reference.source();
        info!(
            "building image at `{path}` from `{source}`; this may take a few minutes",
            path = destination.display()
        );

        let temp = temp_beside(destination).map_err(|source| ArtifactError::Io {
            path: destination.to_path_buf(),
            source,
        })?;

        if let Err(e) = self.builder.build(&temp, &source).await {
            error!(source, "failed to build image: {e}");
            // Dropping `temp` removes the partial output
            return Err(ArtifactError::Build {
                destination: destination.to_path_buf(),
                source: e,
            });
        }

        make_shared(&temp)
            .await
            .map_err(|source| ArtifactError::Io {
                path: destination.to_path_buf(),
                source,
            })?;
        temp.persist(destination)
            .map_err(|e| ArtifactError::Io {
                path: destination.to_path_buf(),
                source: e.error,
            })?;

        info!(path = %destination.display(), "image built");
        Ok(())
    }
}

/// Copies a cached image into place through a temporary file.
async fn install_copy(cached: &Path, destination: &Path) -> io::Result<()> {
    let temp = temp_beside(destination)?;
    fs::copy(cached, &temp).await?;
    make_shared(&temp).await?;
    temp.persist(destination).map_err(|e| e.error)
}

/// Builds images by running an external command.
///
/// The command is invoked as `<program> <args..> <output> <source>`.
#[derive(Debug, Clone)]
pub struct CommandImageBuilder {
    /// The program to run.
    program: String,
    /// Arguments preceding the output path and source.
    args: Vec<String>,
}

impl CommandImageBuilder {
    /// Creates a builder from a command line whose first element is the
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
impl ImageBuilder for CommandImageBuilder {
    async fn build(&self, output: &Path, source: &str) -> Result<(), BuildError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(output).arg(source);
        debug!(?command, "spawning image build command");

        let result = command.output().await.map_err(|source| BuildError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        for line in String::from_utf8_lossy(&result.stdout).lines() {
            trace!(stdout = line, program = self.program);
        }

        if !result.status.success() {
            return Err(BuildError::Failed {
                program: self.program.clone(),
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Fetches pre-built images over HTTP from `<base>/<name>`.
///
/// Downloads land in a local cache directory; a cached file is reused
/// without contacting the server.
#[derive(Debug, Clone)]
pub struct HttpArtifactRepository {
    /// The HTTP client.
    client: reqwest::Client,
    /// The base URL, always ending in `/`.
    base: Url,
    /// The local cache directory.
    cache_dir: PathBuf,
}

impl HttpArtifactRepository {
    /// Creates a new HTTP artifact repository.
    pub fn new(base: Url, cache_dir: impl Into<PathBuf>) -> Result<Self, reqwest::Error> {
        let mut base = base;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("evalsched/", env!("CARGO_PKG_VERSION")))
                .build()?,
            base,
            cache_dir: cache_dir.into(),
        })
    }

    /// Downloads the image `name` into the cache file at `cached`.
    async fn download(&self, name: &str, cached: &Path) -> Result<(), FetchError> {
        let transfer = |reason: String| FetchError::Transfer {
            name: name.to_string(),
            reason,
        };

        let url = self.base.join(name).map_err(|e| transfer(e.to_string()))?;
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| transfer(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(name.to_string()));
        }

        if !status.is_success() {
            return Err(transfer(format!("`{url}` responded with {status}")));
        }

        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| transfer(e.to_string()))?;
        let (file, temp) = tempfile::Builder::new()
            .prefix(".download.")
            .tempfile_in(&self.cache_dir)
            .map_err(|e| transfer(e.to_string()))?
            .into_parts();
        let mut file = fs::File::from_std(file);

        while let Some(chunk) = response.chunk().await.map_err(|e| transfer(e.to_string()))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| transfer(e.to_string()))?;
        }

        file.sync_all().await.map_err(|e| transfer(e.to_string()))?;
        drop(file);
        make_shared(&temp)
            .await
            .map_err(|e| transfer(e.to_string()))?;
        temp.persist(cached).map_err(|e| transfer(e.error.to_string()))
    }
}

#[async_trait]
impl ArtifactRepository for HttpArtifactRepository {
    async fn fetch(&self, name: &str) -> Result<PathBuf, FetchError> {
        let cached = self.cache_dir.join(name);
        if fs::try_exists(&cached).await.unwrap_or(false) {
            debug!(path = %cached.display(), "using cached pre-built image");
            return Ok(cached);
        }

        self.download(name, &cached).await?;
        debug!(path = %cached.display(), "downloaded pre-built image");
        Ok(cached)
    }
}
