//! Loading the configuration file and applying cluster profiles.
//!
//! The configuration is read from the path given on the command line (or in
//! `EVALSCHED_CONFIG`), falling back to `evalsched/config.toml` in the user
//! configuration directory, and finally to the built-in defaults.
//!
//! A configuration may describe several clusters. The profile whose
//! `hostname_pattern` matches the current host is applied on top of the
//! shared settings; when profiles exist and none matches, loading fails.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use evalsched_engine::Config;
use evalsched_engine::config::ClusterConfig;
use globset::Glob;
use indexmap::IndexMap;
use tracing::debug;
use tracing::info;

/// The environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "EVALSCHED_CONFIG";

/// Gets the path of the user configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("evalsched").join("config.toml"))
}

/// Reads a configuration file.
pub fn read_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file `{}`", path.display()))?;
    toml::from_str(&text)
        .with_context(|| format!("failed to parse config file `{}`", path.display()))
}

/// Loads the configuration.
///
/// An explicit path must exist; the user configuration file is only read if
/// it is present.
pub fn load(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        debug!(path = %path.display(), "loading configuration");
        return read_config(path);
    }

    match default_config_path() {
        Some(path) if path.is_file() => {
            debug!(path = %path.display(), "loading user configuration");
            read_config(&path)
        }
        _ => {
            debug!("no configuration file found; using defaults");
            Ok(Config::default())
        }
    }
}

/// Gets the name of the current host.
pub fn host_name() -> Option<String> {
    sysinfo::System::host_name()
}

/// Finds the first cluster profile whose pattern matches `host`.
pub fn select_cluster<'a>(
    clusters: &'a IndexMap<String, ClusterConfig>,
    host: &str,
) -> Result<Option<(&'a str, &'a ClusterConfig)>> {
    for (name, cluster) in clusters {
        let glob = Glob::new(&cluster.hostname_pattern).with_context(|| {
            format!(
                "invalid host name pattern `{pattern}` for cluster `{name}`",
                pattern = cluster.hostname_pattern
            )
        })?;

        if glob.compile_matcher().is_match(host) {
            return Ok(Some((name.as_str(), cluster)));
        }
    }

    Ok(None)
}

/// Expands `$VAR` references in every value.
///
/// Variables are looked up in `primary`, then `secondary`, then the process
/// environment. Unknown variables are left as they are.
fn expand_environment(
    values: &IndexMap<String, String>,
    primary: &IndexMap<String, String>,
    secondary: &IndexMap<String, String>,
) -> IndexMap<String, String> {
    values
        .iter()
        .map(|(key, value)| {
            let expanded = shellexpand::env_with_context_no_errors(value, |var| {
                primary
                    .get(var)
                    .or_else(|| secondary.get(var))
                    .cloned()
                    .or_else(|| std::env::var(var).ok())
            });
            (key.clone(), expanded.into_owned())
        })
        .collect()
}

/// Applies the cluster profile matching `host` to the configuration.
///
/// The shared environment is expanded against the profile's environment, and
/// the profile's environment against the shared one; profile values win on
/// conflicts.
pub fn apply_cluster(mut config: Config, host: Option<&str>) -> Result<Config> {
    if config.clusters.is_empty() {
        return Ok(config);
    }

    let Some(host) = host else {
        bail!("cluster profiles are configured but the host name could not be determined");
    };

    let Some((name, cluster)) = select_cluster(&config.clusters, host)? else {
        bail!(
            "no cluster profile matches host `{host}`; known clusters are {names}",
            names = config
                .clusters
                .keys()
                .map(|n| format!("`{n}`"))
                .collect::<Vec<_>>()
                .join(", ")
        );
    };

    info!(cluster = name, host, "using cluster profile");
    let cluster = cluster.clone();

    if let Some(limit) = cluster.queue_limit {
        config.scheduler.queue_limit = limit;
    }

    if let Some(dir) = &cluster.output_dir {
        config.scheduler.output_dir = Some(dir.clone());
    }

    if let Some(path) = &cluster.image_path {
        config.image.path = Some(path.clone());
    }

    let shared = expand_environment(&config.environment, &cluster.environment, &IndexMap::new());
    let specific = expand_environment(&cluster.environment, &shared, &IndexMap::new());
    config.environment = shared;
    config.environment.extend(specific);
    Ok(config)
}
