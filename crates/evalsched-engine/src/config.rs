//! Implementation of engine configuration.
//!
//! Every component receives its settings from a [`Config`] value passed in at
//! construction. Nothing in the engine reads or writes the process
//! environment to discover configuration.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use url::Url;

use crate::artifact::ImageReference;

/// The default ceiling on the number of queued and running jobs.
pub const DEFAULT_QUEUE_LIMIT: u64 = 250;

/// The default maximum number of array tasks allowed to run concurrently.
pub const DEFAULT_MAX_ARRAY_LEN: u64 = 32;

/// The default transport used to build images.
pub const DEFAULT_IMAGE_TRANSPORT: &str = "docker";

/// The default queue query.
///
/// `USER` is provided to the command by the queue monitor.
pub const DEFAULT_QUEUE_COMMAND: &str = r#"squeue -u "$USER" -h -t pending,running -r | wc -l"#;

/// The default submission program.
pub const DEFAULT_SUBMIT_PROGRAM: &str = "sbatch";

/// The subdirectory of the system cache directory used by default.
const DEFAULT_CACHE_SUBDIR: &str = "evalsched";

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required value was not supplied.
    #[error("configuration value `{0}` is required but was not set")]
    Missing(&'static str),

    /// A value was supplied but is not usable.
    #[error("configuration value `{key}` is invalid: {reason}")]
    Invalid {
        /// The configuration key.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// No default cache directory exists on this system.
    #[error("the system has no cache directory; set `{0}` explicitly")]
    NoCacheDir(&'static str),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Gets the default cache directory for the given subdirectory.
fn default_cache_dir(subdir: &str, key: &'static str) -> ConfigResult<PathBuf> {
    dirs::cache_dir()
        .map(|d| d.join(DEFAULT_CACHE_SUBDIR).join(subdir))
        .ok_or(ConfigError::NoCacheDir(key))
}

/// Represents the scheduling engine configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// Scheduling limits and output location.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// The runtime container image.
    #[serde(default)]
    pub image: ImageConfig,
    /// The remote repository of pre-built images.
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    /// The remote model repository and its local cache.
    #[serde(default)]
    pub models: ModelsConfig,
    /// The queue load query.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Array job submission.
    #[serde(default)]
    pub submit: SubmitConfig,
    /// Task dataset pre-fetch.
    #[serde(default)]
    pub prefetch: PrefetchConfig,
    /// Variables available to the submission template.
    ///
    /// These take precedence over the process environment when the template
    /// is rendered.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, String>,
    /// Per-cluster profiles, selected by host name.
    ///
    /// Selecting and applying a profile is left to the caller.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub clusters: IndexMap<String, ClusterConfig>,
}

impl Config {
    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        self.scheduler.validate()?;
        self.image.validate()?;
        self.models.validate()?;
        self.queue.validate()?;
        self.submit.validate()?;
        self.prefetch.validate()?;
        for (name, cluster) in &self.clusters {
            cluster.validate(name)?;
        }

        Ok(())
    }
}

/// Represents scheduling limits and the output location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SchedulerConfig {
    /// The ceiling on the caller's queued and running jobs.
    ///
    /// Defaults to `250`.
    #[serde(default = "queue_limit_default")]
    pub queue_limit: u64,
    /// The root directory beneath which run directories are created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// The maximum number of array tasks that may run at once.
    ///
    /// This is not the size of the array, which is the number of matrix rows.
    ///
    /// Defaults to `32`.
    #[serde(default = "max_array_len_default")]
    pub max_array_len: u64,
}

/// Gets the default value for the `queue_limit` field.
const fn queue_limit_default() -> u64 {
    DEFAULT_QUEUE_LIMIT
}

/// Gets the default value for the `max_array_len` field.
const fn max_array_len_default() -> u64 {
    DEFAULT_MAX_ARRAY_LEN
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_limit: DEFAULT_QUEUE_LIMIT,
            output_dir: None,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
        }
    }
}

impl SchedulerConfig {
    /// Validates the scheduler configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.output_dir.is_none() {
            return Err(ConfigError::Missing("scheduler.output_dir"));
        }

        if self.max_array_len == 0 {
            return Err(ConfigError::Invalid {
                key: "scheduler.max_array_len",
                reason: "must be at least 1".into(),
            });
        }

        Ok(())
    }

    /// Gets the output directory.
    pub fn output_dir(&self) -> ConfigResult<&PathBuf> {
        self.output_dir
            .as_ref()
            .ok_or(ConfigError::Missing("scheduler.output_dir"))
    }
}

/// Represents the runtime container image configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ImageConfig {
    /// The source image, e.g. `ghcr.io/org/eval-env:latest`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The transport used when building from the source image.
    ///
    /// Defaults to `docker`.
    #[serde(default = "image_transport_default")]
    pub transport: String,
    /// Where the built image is cached.
    ///
    /// Defaults to a file named after the image in the user cache directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// The build command; the temporary output path and source reference are
    /// appended.
    ///
    /// Defaults to `apptainer build --force`.
    #[serde(default = "image_builder_default")]
    pub builder: Vec<String>,
}

/// Gets the default value for the `transport` field.
fn image_transport_default() -> String {
    DEFAULT_IMAGE_TRANSPORT.to_string()
}

/// Gets the default value for the `builder` field.
fn image_builder_default() -> Vec<String> {
    vec!["apptainer".into(), "build".into(), "--force".into()]
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: None,
            transport: image_transport_default(),
            path: None,
            builder: image_builder_default(),
        }
    }
}

impl ImageConfig {
    /// Validates the image configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        match &self.name {
            None => return Err(ConfigError::Missing("image.name")),
            Some(name) if name.trim().is_empty() => {
                return Err(ConfigError::Invalid {
                    key: "image.name",
                    reason: "cannot be empty".into(),
                });
            }
            Some(_) => {}
        }

        if self.builder.is_empty() {
            return Err(ConfigError::Invalid {
                key: "image.builder",
                reason: "must name a program".into(),
            });
        }

        Ok(())
    }

    /// Builds the image reference described by this configuration.
    pub fn reference(&self) -> ConfigResult<ImageReference> {
        let name = self.name.as_deref().ok_or(ConfigError::Missing("image.name"))?;
        let destination = match &self.path {
            Some(path) => path.clone(),
            None => default_cache_dir("images", "image.path")?
                .join(format!("{}.sif", sanitize_image_name(name))),
        };

        Ok(ImageReference::new(name, &self.transport, destination))
    }
}

/// Turns an image name into something usable as a file name.
fn sanitize_image_name(name: &str) -> String {
    name.replace('/', "_2f_").replace(':', "_3a_")
}

/// Represents the remote repository of pre-built images.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ArtifactsConfig {
    /// The base URL images are fetched from by file name.
    ///
    /// If unset, images are always built locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    /// Where fetched images are cached before installation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl ArtifactsConfig {
    /// Gets the cache directory for fetched images.
    pub fn cache_dir(&self) -> ConfigResult<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_cache_dir("artifacts", "artifacts.cache_dir"),
        }
    }
}

/// Represents the remote model repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ModelsConfig {
    /// The download command; the repository id and optional `--revision` are
    /// appended.
    ///
    /// Defaults to `hf download`.
    #[serde(default = "models_download_default")]
    pub download: Vec<String>,
    /// Where download markers and locks are kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

/// Gets the default value for the `download` field.
fn models_download_default() -> Vec<String> {
    vec!["hf".into(), "download".into()]
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            download: models_download_default(),
            cache_dir: None,
        }
    }
}

impl ModelsConfig {
    /// Validates the model repository configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.download.is_empty() {
            return Err(ConfigError::Invalid {
                key: "models.download",
                reason: "must name a program".into(),
            });
        }

        Ok(())
    }

    /// Gets the model cache directory.
    pub fn cache_dir(&self) -> ConfigResult<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_cache_dir("models", "models.cache_dir"),
        }
    }
}

/// Represents the queue load query configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct QueueConfig {
    /// A shell command printing the caller's pending and running job count.
    #[serde(default = "queue_command_default")]
    pub command: String,
}

/// Gets the default value for the `command` field.
fn queue_command_default() -> String {
    DEFAULT_QUEUE_COMMAND.to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            command: queue_command_default(),
        }
    }
}

impl QueueConfig {
    /// Validates the queue configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "queue.command",
                reason: "cannot be empty".into(),
            });
        }

        Ok(())
    }
}

/// Represents the array submission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SubmitConfig {
    /// The program that reads a submission script on stdin.
    ///
    /// Defaults to `sbatch`.
    #[serde(default = "submit_program_default")]
    pub program: String,
    /// A submission template to use instead of the built-in one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PathBuf>,
}

/// Gets the default value for the `program` field.
fn submit_program_default() -> String {
    DEFAULT_SUBMIT_PROGRAM.to_string()
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            program: submit_program_default(),
            template: None,
        }
    }
}

impl SubmitConfig {
    /// Validates the submission configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "submit.program",
                reason: "cannot be empty".into(),
            });
        }

        Ok(())
    }
}

/// Represents the task dataset pre-fetch configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PrefetchConfig {
    /// The command run once per task, with the task name appended.
    ///
    /// If unset, datasets are not pre-fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl PrefetchConfig {
    /// Validates the pre-fetch configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(command) = &self.command {
            if command.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "prefetch.command",
                    reason: "must name a program".into(),
                });
            }
        }

        Ok(())
    }
}

/// Represents the settings of one cluster.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ClusterConfig {
    /// A glob matched against the host name, e.g. `login*.cluster.org`.
    pub hostname_pattern: String,
    /// Overrides `scheduler.queue_limit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_limit: Option<u64>,
    /// Overrides `scheduler.output_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// Overrides `image.path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
    /// Variables added to (or replacing) the shared `environment`.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, String>,
}

impl ClusterConfig {
    /// Validates the cluster configuration.
    pub fn validate(&self, name: &str) -> ConfigResult<()> {
        if self.hostname_pattern.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "clusters.hostname_pattern",
                reason: format!("cluster `{name}` has an empty pattern"),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Gets a configuration that passes validation.
    fn valid() -> Config {
        let mut config = Config::default();
        config.scheduler.output_dir = Some(PathBuf::from("/scratch/evals"));
        config.image.name = Some("ghcr.io/org/eval-env:latest".into());
        config
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.queue_limit, 250);
        assert_eq!(config.scheduler.max_array_len, 32);
        assert_eq!(config.submit.program, "sbatch");
        assert_eq!(config.image.transport, "docker");
        assert!(config.prefetch.command.is_none());
    }

    #[test]
    fn missing_image_name() {
        let mut config = valid();
        config.image.name = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("image.name"))
        ));
    }

    #[test]
    fn missing_output_dir() {
        let mut config = valid();
        config.scheduler.output_dir = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("scheduler.output_dir"))
        ));
    }

    #[test]
    fn zero_array_len() {
        let mut config = valid();
        config.scheduler.max_array_len = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "scheduler.max_array_len",
                ..
            })
        ));
    }

    #[test]
    fn empty_prefetch_command() {
        let mut config = valid();
        config.prefetch.command = Some(Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn image_reference_uses_configured_path() {
        let mut config = valid();
        config.image.path = Some(PathBuf::from("/shared/images/eval.sif"));
        let reference = config.image.reference().unwrap();
        assert_eq!(reference.name(), "ghcr.io/org/eval-env:latest");
        assert_eq!(reference.source(), "docker://ghcr.io/org/eval-env:latest");
        assert_eq!(
            reference.destination(),
            std::path::Path::new("/shared/images/eval.sif")
        );
    }

    #[test]
    fn sanitized_image_names() {
        assert_eq!(
            sanitize_image_name("ghcr.io/org/eval-env:latest"),
            "ghcr.io_2f_org_2f_eval-env_3a_latest"
        );
    }

    #[test]
    fn deserialize_partial() {
        let config: Config = toml::from_str(
            r#"
[scheduler]
output_dir = "/scratch/evals"

[image]
name = "ghcr.io/org/eval-env:latest"

[environment]
TIME_LIMIT = "02:00:00"
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.scheduler.queue_limit, 250);
        assert_eq!(config.environment["TIME_LIMIT"], "02:00:00");
    }

    #[test]
    fn deserialize_clusters() {
        let config: Config = toml::from_str(
            r#"
[clusters.leonardo]
hostname_pattern = "login*.leonardo.local"
queue_limit = 100

[clusters.leonardo.environment]
PARTITION = "boost_usr_prod"

[clusters.lumi]
hostname_pattern = "uan*"
"#,
        )
        .unwrap();
        assert_eq!(
            config.clusters.keys().collect::<Vec<_>>(),
            ["leonardo", "lumi"]
        );
        assert_eq!(config.clusters["leonardo"].queue_limit, Some(100));
        assert_eq!(
            config.clusters["leonardo"].environment["PARTITION"],
            "boost_usr_prod"
        );
    }

    #[test]
    fn empty_cluster_pattern() {
        let mut config = valid();
        config.clusters.insert("lumi".into(), ClusterConfig::default());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "clusters.hostname_pattern",
                ..
            })
        ));
    }

    #[test]
    fn unknown_fields_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
[scheduler]
queue_lmit = 10
"#,
        );
        assert!(result.is_err());
    }
}
