//! The end-to-end scheduling run.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::artifact::ArtifactError;
use crate::artifact::ArtifactRepository;
use crate::artifact::ArtifactStore;
use crate::artifact::CommandImageBuilder;
use crate::artifact::HttpArtifactRepository;
use crate::artifact::ImageReference;
use crate::capacity::CapacityDecision;
use crate::capacity::decide;
use crate::config::Config;
use crate::config::ConfigError;
use crate::matrix::JobMatrixBuilder;
use crate::matrix::MatrixError;
use crate::matrix::MatrixInput;
use crate::prefetch::DatasetPrefetcher;
use crate::queue::QueueMonitor;
use crate::resolver::CommandModelRepository;
use crate::resolver::ModelCache;
use crate::resolver::ModelResolver;
use crate::submit::ArraySubmitter;
use crate::submit::SubmissionResult;
use crate::submit::SubmitError;

/// Represents an error that aborts a scheduling run.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The HTTP client for the artifact repository could not be created.
    #[error("failed to create the artifact repository client")]
    Client(#[source] reqwest::Error),

    /// The runtime image could not be obtained.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// The job matrix could not be built.
    #[error(transparent)]
    Matrix(#[from] MatrixError),

    /// The array job could not be submitted.
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// A request to schedule evaluations.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    /// Where the job matrix comes from.
    pub input: MatrixInput,
    /// Stop after models and datasets are cached, without submitting.
    pub download_only: bool,
}

/// How a scheduling run ended.
#[derive(Debug)]
pub enum Outcome {
    /// No model resolved, so there was nothing to schedule.
    EmptyMatrix,
    /// Models and datasets were cached and nothing was submitted.
    DownloadOnly {
        /// The number of jobs that would have been submitted.
        jobs: usize,
    },
    /// The queue had no room for more jobs.
    NoCapacity(CapacityDecision),
    /// The array job was submitted.
    Submitted(SubmissionResult),
}

/// Runs the scheduling steps in order.
#[derive(Debug)]
pub struct Scheduler {
    /// The runtime image.
    image: ImageReference,
    /// Obtains the runtime image.
    artifacts: ArtifactStore,
    /// Builds the job matrix.
    matrix: JobMatrixBuilder,
    /// Caches task datasets.
    prefetcher: DatasetPrefetcher,
    /// Reads the queue load.
    queue: QueueMonitor,
    /// The ceiling on the caller's queue entries.
    queue_limit: u64,
    /// The root of run directories.
    output_dir: PathBuf,
    /// Submits the array job.
    submitter: ArraySubmitter,
}

impl Scheduler {
    /// Creates a scheduler from validated configuration.
    ///
    /// When `force_image_rebuild` is set, an existing image is replaced.
    pub fn from_config(config: &Config, force_image_rebuild: bool) -> Result<Self, ScheduleError> {
        config.validate()?;

        let repository = match &config.artifacts.url {
            Some(url) => {
                let repository =
                    HttpArtifactRepository::new(url.clone(), config.artifacts.cache_dir()?)
                        .map_err(ScheduleError::Client)?;
                Some(Arc::new(repository) as Arc<dyn ArtifactRepository>)
            }
            None => None,
        };

        let builder =
            CommandImageBuilder::from_command(&config.image.builder).ok_or(ConfigError::Invalid {
                key: "image.builder",
                reason: "must name a program".into(),
            })?;

        let downloader = CommandModelRepository::from_command(&config.models.download).ok_or(
            ConfigError::Invalid {
                key: "models.download",
                reason: "must name a program".into(),
            },
        )?;
        let models = ModelCache::new(config.models.cache_dir()?, Arc::new(downloader));

        Ok(Self {
            image: config.image.reference()?,
            artifacts: ArtifactStore::new(repository, Arc::new(builder))
                .with_force(force_image_rebuild),
            matrix: JobMatrixBuilder::new(ModelResolver::new(Arc::new(models))),
            prefetcher: DatasetPrefetcher::from_config(&config.prefetch),
            queue: QueueMonitor::from_config(&config.queue),
            queue_limit: config.scheduler.queue_limit,
            output_dir: config.scheduler.output_dir()?.clone(),
            submitter: ArraySubmitter::from_config(config)?,
        })
    }

    /// Runs the scheduler.
    ///
    /// Nothing is written to the output directory unless a submission is
    /// attempted.
    pub async fn schedule(&self, request: &ScheduleRequest) -> Result<Outcome, ScheduleError> {
        let image = self.artifacts.ensure(&self.image).await?;
        info!(image = %image.display(), "runtime image is ready");

        let matrix = self.matrix.build(&request.input).await?;
        if matrix.is_empty() {
            warn!("no evaluation jobs to schedule");
            return Ok(Outcome::EmptyMatrix);
        }

        self.prefetcher.prefetch(matrix.unique_tasks()).await;

        if request.download_only {
            info!(
                jobs = matrix.len(),
                "models and datasets are cached; not submitting"
            );
            return Ok(Outcome::DownloadOnly { jobs: matrix.len() });
        }

        let snapshot = self.queue.snapshot().await;
        let decision = decide(self.queue_limit, &snapshot, matrix.len());
        if !decision.admits() {
            warn!(
                occupied = decision.occupied,
                ceiling = decision.ceiling,
                "no remaining queue capacity; not scheduling any jobs"
            );
            return Ok(Outcome::NoCapacity(decision));
        }

        debug!(
            remaining = decision.remaining,
            jobs = matrix.len(),
            "queue has capacity"
        );

        let result = self
            .submitter
            .submit(&self.output_dir, &image, &matrix)
            .await?;
        Ok(Outcome::Submitted(result))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::resolver::tests::FakeRepository;
    use crate::resolver::tests::checkpoint;

    /// A scheduling fixture rooted in a temporary directory.
    struct Fixture {
        /// The temporary root.
        dir: TempDir,
        /// A model with two checkpoints.
        model: String,
    }

    impl Fixture {
        /// Creates a fixture with an existing image and one model.
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join("eval.sif"), b"image").unwrap();
            let model = dir.path().join("model");
            checkpoint(&model.join("hf").join("iter_1"));
            checkpoint(&model.join("hf").join("iter_2"));

            Self {
                model: model.to_str().unwrap().to_string(),
                dir,
            }
        }

        /// Gets the output directory.
        fn output_dir(&self) -> PathBuf {
            self.dir.path().join("runs")
        }

        /// Gets a queue query that records being run in a `queried` file.
        fn queue_marker(&self) -> String {
            format!(
                "touch '{marker}'; echo 0",
                marker = self.dir.path().join("queried").display()
            )
        }

        /// Creates a scheduler with the given queue query.
        fn scheduler(&self, queue: &str) -> Scheduler {
            Scheduler {
                image: ImageReference::new(
                    "org/eval-env:latest",
                    "docker",
                    self.dir.path().join("eval.sif"),
                ),
                artifacts: ArtifactStore::new(
                    None,
                    Arc::new(CommandImageBuilder::from_command(&["false".into()]).unwrap()),
                ),
                matrix: JobMatrixBuilder::new(ModelResolver::new(Arc::new(
                    FakeRepository::default(),
                ))),
                prefetcher: DatasetPrefetcher::default(),
                queue: QueueMonitor::new(queue),
                queue_limit: 250,
                output_dir: self.output_dir(),
                submitter: ArraySubmitter::new("cat"),
            }
        }

        /// Creates a request for the fixture's model.
        fn request(&self, models: Vec<String>) -> ScheduleRequest {
            ScheduleRequest {
                input: MatrixInput::from_selectors(
                    None,
                    models,
                    vec!["t1".into(), "t2".into()],
                    vec![0, 5],
                )
                .unwrap(),
                download_only: false,
            }
        }
    }

    #[tokio::test]
    async fn submits_when_queue_is_clear() {
        let fixture = Fixture::new();
        let request = fixture.request(vec![fixture.model.clone(), "org/missing".into()]);

        let outcome = fixture
            .scheduler(&fixture.queue_marker())
            .schedule(&request)
            .await
            .unwrap();
        let Outcome::Submitted(result) = outcome else {
            panic!("expected a submission, got {outcome:?}");
        };

        assert!(fixture.dir.path().join("queried").exists());
        assert_eq!(result.num_jobs, 8);
        let jobs = std::fs::read_to_string(result.run_dir.jobs_path()).unwrap();
        assert_eq!(jobs.lines().count(), 9);
        assert!(!jobs.contains("org/missing"));

        let script = std::fs::read_to_string(result.run_dir.script_path()).unwrap();
        assert!(script.contains("#SBATCH --array=0-7%32"));
        assert!(script.contains(&fixture.dir.path().join("eval.sif").display().to_string()));
    }

    #[tokio::test]
    async fn stops_without_capacity() {
        let fixture = Fixture::new();
        let request = fixture.request(vec![fixture.model.clone()]);

        let outcome = fixture
            .scheduler("echo 260")
            .schedule(&request)
            .await
            .unwrap();
        match outcome {
            Outcome::NoCapacity(decision) => assert_eq!(decision.remaining, -10),
            other => panic!("expected no capacity, got {other:?}"),
        }
        assert!(!fixture.output_dir().exists());
    }

    #[tokio::test]
    async fn stops_on_empty_matrix() {
        let fixture = Fixture::new();
        let request = fixture.request(vec!["org/missing".into()]);

        let outcome = fixture
            .scheduler(&fixture.queue_marker())
            .schedule(&request)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::EmptyMatrix));
        assert!(!fixture.output_dir().exists());
        assert!(!fixture.dir.path().join("queried").exists());
    }

    #[tokio::test]
    async fn download_only() {
        let fixture = Fixture::new();
        let mut request = fixture.request(vec![fixture.model.clone()]);
        request.download_only = true;

        let outcome = fixture
            .scheduler(&fixture.queue_marker())
            .schedule(&request)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::DownloadOnly { jobs: 8 }));
        assert!(!fixture.output_dir().exists());
        assert!(!fixture.dir.path().join("queried").exists());
    }

    #[tokio::test]
    async fn missing_image_fails_when_build_fails() {
        let fixture = Fixture::new();
        std::fs::remove_file(fixture.dir.path().join("eval.sif")).unwrap();
        let request = fixture.request(vec![fixture.model.clone()]);

        let err = fixture
            .scheduler("echo 0")
            .schedule(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Artifact(_)));
        assert!(!fixture.dir.path().join("eval.sif").exists());
        assert!(!fixture.output_dir().exists());
    }

    #[test]
    fn from_config_requires_image() {
        let mut config = Config::default();
        config.scheduler.output_dir = Some("/scratch/evals".into());

        let err = Scheduler::from_config(&config, false).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::Config(ConfigError::Missing("image.name"))
        ));
    }
}
