//! Implementation of the `schedule` subcommand.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use evalsched_engine::Config;
use evalsched_engine::MatrixInput;
use evalsched_engine::Outcome;
use evalsched_engine::ScheduleRequest;
use evalsched_engine::Scheduler;
use tracing::info;

/// Arguments for the `schedule` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Models to evaluate: local directories, checkpoint trees, or remote
    /// repository ids.
    ///
    /// Separate multiple models with commas or repeat the option. To pass
    /// `,revision=...` modifiers, use `--eval-csv`.
    #[arg(long, short, value_delimiter = ',', value_name = "MODEL")]
    pub models: Vec<String>,

    /// Tasks to evaluate each model on.
    #[arg(long, short, value_delimiter = ',', value_name = "TASK")]
    pub tasks: Vec<String>,

    /// Few-shot counts to evaluate each task with.
    #[arg(long, short, value_delimiter = ',', value_name = "N")]
    pub n_shot: Vec<u32>,

    /// A CSV table of jobs with `model_path`, `task_path`, and `n_shot`
    /// columns.
    ///
    /// Cannot be combined with `--models`, `--tasks`, or `--n-shot`.
    #[arg(long, value_name = "PATH")]
    pub eval_csv: Option<PathBuf>,

    /// The maximum number of array tasks running at once.
    #[arg(long, value_name = "N")]
    pub max_array_len: Option<u64>,

    /// The ceiling on your queued and running jobs.
    #[arg(long, value_name = "N")]
    pub queue_limit: Option<u64>,

    /// The directory beneath which the run directory is created.
    #[arg(long, short, value_name = "PATH")]
    pub output_dir: Option<PathBuf>,

    /// Only download models and datasets; do not submit.
    #[arg(long)]
    pub download_only: bool,

    /// Rebuild the container image even if it exists.
    #[arg(long)]
    pub force_image_rebuild: bool,
}

impl Args {
    /// Applies command line overrides to the configuration.
    fn apply(&self, config: &mut Config) {
        if let Some(len) = self.max_array_len {
            config.scheduler.max_array_len = len;
        }

        if let Some(limit) = self.queue_limit {
            config.scheduler.queue_limit = limit;
        }

        if let Some(dir) = &self.output_dir {
            config.scheduler.output_dir = Some(dir.clone());
        }
    }
}

/// The main function for the `schedule` subcommand.
pub async fn schedule(args: Args, mut config: Config) -> Result<()> {
    let input = MatrixInput::from_selectors(
        args.eval_csv.clone(),
        args.models.clone(),
        args.tasks.clone(),
        args.n_shot.clone(),
    )?;

    args.apply(&mut config);
    let scheduler = Scheduler::from_config(&config, args.force_image_rebuild)?;
    let request = ScheduleRequest {
        input,
        download_only: args.download_only,
    };

    match scheduler.schedule(&request).await? {
        Outcome::EmptyMatrix => info!("nothing was scheduled"),
        Outcome::DownloadOnly { jobs } => {
            info!(jobs, "downloads are complete; nothing was submitted")
        }
        Outcome::NoCapacity(decision) => info!(
            occupied = decision.occupied,
            ceiling = decision.ceiling,
            "nothing was submitted"
        ),
        Outcome::Submitted(result) => {
            println!(
                "submitted {jobs} evaluation jobs{id} from `{dir}`",
                jobs = result.num_jobs,
                id = result
                    .job_id
                    .map(|id| format!(" as job {id}"))
                    .unwrap_or_default(),
                dir = result.run_dir.path().display()
            );
        }
    }

    Ok(())
}
