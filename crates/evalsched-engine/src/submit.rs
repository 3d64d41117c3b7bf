//! Persisting a job matrix and submitting it as a Slurm array job.
//!
//! Every submission gets a fresh run directory named after the time it was
//! created:
//!
//! ```text
//! <output_dir>/2025-06-01-12-30-00/
//! ├── jobs.csv
//! ├── submit_evals.sbatch
//! └── slurm_logs/
//! ```
//!
//! The directory is the durable record of what was submitted and is kept
//! even when submission fails, so the script can be resubmitted by hand.

use std::fmt;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;

use chrono::DateTime;
use chrono::Local;
use indexmap::IndexMap;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use tracing::info;

use crate::config::Config;
use crate::config::DEFAULT_MAX_ARRAY_LEN;
use crate::matrix::JobMatrix;
use crate::matrix::TableError;

/// The name of the persisted job table.
pub const JOBS_FILE_NAME: &str = "jobs.csv";

/// The name of the persisted submission script.
pub const SCRIPT_FILE_NAME: &str = "submit_evals.sbatch";

/// The name of the directory receiving per-task Slurm logs.
pub const LOGS_DIR_NAME: &str = "slurm_logs";

/// The format of run directory names.
const RUN_DIR_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// The built-in submission template.
pub const DEFAULT_TEMPLATE: &str = include_str!("../templates/submit_evals.sbatch");

/// The prefix of the line `sbatch` prints on success.
const SUBMITTED_PREFIX: &str = "Submitted batch job";

/// Represents an error submitting an array job.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The matrix has no rows to submit.
    #[error("cannot submit an empty job matrix")]
    EmptyMatrix,

    /// The configured template could not be read.
    #[error("failed to read submission template `{path}`")]
    Template {
        /// The template path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The run directory could not be written.
    #[error("failed to write run directory `{path}`")]
    Io {
        /// The path being written.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The job table could not be written.
    #[error(transparent)]
    Table(#[from] TableError),

    /// The submission program is not installed.
    #[error(
        "submission program `{program}` was not found; is Slurm available on this host? the \
         script was kept in `{run_dir}`"
    )]
    BackendNotFound {
        /// The submission program.
        program: String,
        /// The run directory holding the script.
        run_dir: PathBuf,
    },

    /// The submission program could not be started.
    #[error("failed to run submission program `{program}`; the script was kept in `{run_dir}`")]
    Spawn {
        /// The submission program.
        program: String,
        /// The run directory holding the script.
        run_dir: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The submission program rejected the script.
    #[error(
        "`{program}` rejected the submission ({status}): {stderr}; the script was kept in \
         `{run_dir}`"
    )]
    Rejected {
        /// The submission program.
        program: String,
        /// The run directory holding the script.
        run_dir: PathBuf,
        /// The exit status of the program.
        status: ExitStatus,
        /// The standard error of the program.
        stderr: String,
    },
}

/// A freshly created, timestamp-named run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectory(PathBuf);

impl RunDirectory {
    /// Creates a run directory beneath `root` named after `timestamp`.
    ///
    /// A directory of the same name is never reused; a `-1`, `-2`, ...
    /// suffix is added instead. The log subdirectory is created too.
    pub fn create(root: &Path, timestamp: DateTime<Local>) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;

        let name = timestamp.format(RUN_DIR_FORMAT).to_string();
        let mut path = root.join(&name);
        let mut attempt = 0;
        loop {
            match std::fs::create_dir(&path) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    path = root.join(format!("{name}-{attempt}"));
                }
                Err(e) => return Err(e),
            }
        }

        let dir = Self(path);
        std::fs::create_dir(dir.logs_dir())?;
        Ok(dir)
    }

    /// Gets the path of the run directory.
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Gets the path of the job table.
    pub fn jobs_path(&self) -> PathBuf {
        self.0.join(JOBS_FILE_NAME)
    }

    /// Gets the path of the submission script.
    pub fn script_path(&self) -> PathBuf {
        self.0.join(SCRIPT_FILE_NAME)
    }

    /// Gets the path of the log directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.0.join(LOGS_DIR_NAME)
    }
}

/// The values substituted into a submission template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateValues<'a> {
    /// The persisted job table.
    pub csv_path: &'a Path,
    /// The container image the jobs run in.
    pub image_path: &'a Path,
    /// The maximum number of array tasks that may run at once.
    pub max_array_len: u64,
    /// The number of jobs; the array spans `0..num_jobs`.
    pub num_jobs: usize,
    /// The directory receiving per-task logs.
    pub log_dir: &'a Path,
}

/// Renders a submission template.
///
/// The `{csv_path}`, `{image_path}`, `{max_array_len}`, `{array_limit}`,
/// `{num_jobs}`, and `{log_dir}` placeholders are replaced first. Remaining
/// `$VAR` and `${VAR}` references are then expanded from `environment`,
/// falling back to the process environment; unknown variables are left for
/// the job's shell.
pub fn render_template(
    template: &str,
    values: &TemplateValues<'_>,
    environment: &IndexMap<String, String>,
) -> String {
    let placeholders = [
        ("{csv_path}", values.csv_path.display().to_string()),
        ("{image_path}", values.image_path.display().to_string()),
        ("{max_array_len}", values.max_array_len.to_string()),
        (
            "{array_limit}",
            values.num_jobs.saturating_sub(1).to_string(),
        ),
        ("{num_jobs}", values.num_jobs.to_string()),
        ("{log_dir}", values.log_dir.display().to_string()),
    ];

    let mut script = template.to_string();
    for (placeholder, value) in &placeholders {
        script = script.replace(placeholder, value);
    }

    shellexpand::env_with_context_no_errors(&script, |var| {
        environment
            .get(var)
            .cloned()
            .or_else(|| std::env::var(var).ok())
    })
    .into_owned()
}

/// The outcome of a successful submission.
#[derive(Debug, Clone)]
pub struct SubmissionResult {
    /// The run directory.
    pub run_dir: RunDirectory,
    /// The number of array tasks submitted.
    pub num_jobs: usize,
    /// The array job id, if the submission program reported one.
    pub job_id: Option<String>,
    /// The standard output of the submission program.
    pub stdout: String,
}

/// Extracts the job id from `sbatch` output.
fn parse_job_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix(SUBMITTED_PREFIX))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string)
}

/// Persists job matrices and submits them as array jobs.
#[derive(Clone)]
pub struct ArraySubmitter {
    /// The program that reads the script on stdin.
    program: String,
    /// The submission template.
    template: String,
    /// The maximum number of array tasks that may run at once.
    max_array_len: u64,
    /// Variables for rendering the template and running the program.
    environment: IndexMap<String, String>,
}

impl fmt::Debug for ArraySubmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArraySubmitter")
            .field("program", &self.program)
            .field("max_array_len", &self.max_array_len)
            .finish_non_exhaustive()
    }
}

impl ArraySubmitter {
    /// Creates a submitter using the built-in template.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            template: DEFAULT_TEMPLATE.to_string(),
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
            environment: IndexMap::new(),
        }
    }

    /// Creates a submitter from configuration.
    pub fn from_config(config: &Config) -> Result<Self, SubmitError> {
        let mut submitter = Self::new(config.submit.program.clone())
            .with_max_array_len(config.scheduler.max_array_len)
            .with_environment(config.environment.clone());

        if let Some(path) = &config.submit.template {
            let template = std::fs::read_to_string(path).map_err(|source| SubmitError::Template {
                path: path.clone(),
                source,
            })?;
            submitter = submitter.with_template(template);
        }

        Ok(submitter)
    }

    /// Sets the submission template.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Sets the maximum number of array tasks that may run at once.
    pub fn with_max_array_len(mut self, max_array_len: u64) -> Self {
        self.max_array_len = max_array_len;
        self
    }

    /// Sets the variables used to render the template and run the program.
    pub fn with_environment(mut self, environment: IndexMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    /// Persists `matrix` to a new run directory beneath `root` and submits
    /// it as a single array job running in `image`.
    pub async fn submit(
        &self,
        root: &Path,
        image: &Path,
        matrix: &JobMatrix,
    ) -> Result<SubmissionResult, SubmitError> {
        if matrix.is_empty() {
            return Err(SubmitError::EmptyMatrix);
        }

        let run_dir =
            RunDirectory::create(root, Local::now()).map_err(|source| SubmitError::Io {
                path: root.to_path_buf(),
                source,
            })?;

        let jobs_path = run_dir.jobs_path();
        matrix.write_csv(&jobs_path)?;
        debug!(path = %jobs_path.display(), "saved job table");

        let logs_dir = run_dir.logs_dir();
        let script = render_template(
            &self.template,
            &TemplateValues {
                csv_path: &jobs_path,
                image_path: image,
                max_array_len: self.max_array_len,
                num_jobs: matrix.len(),
                log_dir: &logs_dir,
            },
            &self.environment,
        );

        let script_path = run_dir.script_path();
        std::fs::write(&script_path, &script).map_err(|source| SubmitError::Io {
            path: script_path.clone(),
            source,
        })?;
        debug!(path = %script_path.display(), "saved submission script");

        let (job_id, stdout) = self.run(&script, run_dir.path()).await?;
        info!(
            run_dir = %run_dir.path().display(),
            jobs = matrix.len(),
            job_id = job_id.as_deref().unwrap_or("unknown"),
            "submitted array job"
        );

        Ok(SubmissionResult {
            run_dir,
            num_jobs: matrix.len(),
            job_id,
            stdout,
        })
    }

    /// Pipes the script to the submission program.
    async fn run(
        &self,
        script: &str,
        run_dir: &Path,
    ) -> Result<(Option<String>, String), SubmitError> {
        let mut command = Command::new(&self.program);
        command
            .envs(&self.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(?command, "spawning submission command");
        let mut child = command.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                SubmitError::BackendNotFound {
                    program: self.program.clone(),
                    run_dir: run_dir.to_path_buf(),
                }
            } else {
                SubmitError::Spawn {
                    program: self.program.clone(),
                    run_dir: run_dir.to_path_buf(),
                    source,
                }
            }
        })?;

        let spawn_error = |source| SubmitError::Spawn {
            program: self.program.clone(),
            run_dir: run_dir.to_path_buf(),
            source,
        };

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(script.as_bytes()).await {
                Ok(()) => {}
                // The program exited without reading its input; its status
                // tells the rest.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(spawn_error(e)),
            }
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(SubmitError::Rejected {
                program: self.program.clone(),
                run_dir: run_dir.to_path_buf(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("{stdout}", stdout = stdout.trim());
        Ok((parse_job_id(&stdout), stdout))
    }
}
