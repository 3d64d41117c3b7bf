//! Building the matrix of evaluation jobs.
//!
//! A matrix comes from exactly one of two inputs: the cross product of model
//! references, task names, and shot counts, or an explicit table with at
//! least the `model_path`, `task_path`, and `n_shot` columns. In both cases
//! model references are resolved first, and a reference that resolves to
//! several checkpoints contributes one row per checkpoint.

use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

use indexmap::IndexMap;
use indexmap::IndexSet;
use tracing::debug;
use tracing::info;

use crate::resolver::ModelResolver;
use crate::resolver::ResolvedModel;

/// The column holding the model to evaluate.
pub const MODEL_PATH_COLUMN: &str = "model_path";

/// The column holding the task to evaluate on.
pub const TASK_PATH_COLUMN: &str = "task_path";

/// The column holding the number of few-shot examples.
pub const N_SHOT_COLUMN: &str = "n_shot";

/// The columns every job table must have.
pub const REQUIRED_COLUMNS: [&str; 3] = [MODEL_PATH_COLUMN, TASK_PATH_COLUMN, N_SHOT_COLUMN];

/// Represents an error reading or writing a job table.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// The table could not be read or written.
    #[error("failed to access job table `{path}`")]
    Csv {
        /// The table path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: csv::Error,
    },

    /// The table lacks required columns.
    #[error(
        "job table `{path}` must contain the columns {required}; missing {missing}",
        required = REQUIRED_COLUMNS.join(", "),
        missing = .missing.join(", ")
    )]
    MissingColumns {
        /// The table path.
        path: PathBuf,
        /// The missing columns.
        missing: Vec<String>,
    },

    /// The table names a column more than once.
    #[error("job table `{path}` contains the column `{column}` more than once")]
    DuplicateColumn {
        /// The table path.
        path: PathBuf,
        /// The repeated column.
        column: String,
    },

    /// A shot count is not a non-negative integer.
    #[error("job table `{path}` has an invalid `n_shot` value `{value}` on line {line}")]
    InvalidShot {
        /// The table path.
        path: PathBuf,
        /// The line of the offending record.
        line: u64,
        /// The offending value.
        value: String,
    },
}

/// Represents an error building a job matrix.
#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    /// A table was supplied together with models, tasks, or shot counts.
    #[error("models, tasks, and shot counts cannot be specified together with a job table")]
    ConflictingInputs,

    /// Neither a table nor all of models, tasks, and shot counts were
    /// supplied.
    #[error("either a job table or all of models, tasks, and shot counts must be specified")]
    MissingInputs,

    /// The job table is invalid.
    #[error(transparent)]
    Table(#[from] TableError),
}

/// The validated source of a job matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixInput {
    /// An explicit job table.
    Table(PathBuf),
    /// Selectors whose cross product forms the matrix.
    Selectors {
        /// Model references.
        models: Vec<String>,
        /// Task names.
        tasks: Vec<String>,
        /// Shot counts.
        shots: Vec<u32>,
    },
}

impl MatrixInput {
    /// Validates the user's choice of inputs.
    ///
    /// A table excludes every selector; without a table, all selectors are
    /// required. Empty selector lists count as not supplied.
    pub fn from_selectors(
        table: Option<PathBuf>,
        models: Vec<String>,
        tasks: Vec<String>,
        shots: Vec<u32>,
    ) -> Result<Self, MatrixError> {
        match table {
            Some(_) if !models.is_empty() || !tasks.is_empty() || !shots.is_empty() => {
                Err(MatrixError::ConflictingInputs)
            }
            Some(path) => Ok(Self::Table(path)),
            None if models.is_empty() || tasks.is_empty() || shots.is_empty() => {
                Err(MatrixError::MissingInputs)
            }
            None => Ok(Self::Selectors {
                models,
                tasks,
                shots,
            }),
        }
    }
}

/// A single evaluation job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalJobRow {
    /// The resolved model.
    pub model_path: ResolvedModel,
    /// The task name.
    pub task_path: String,
    /// The number of few-shot examples.
    pub n_shot: u32,
    /// Additional columns carried over from a job table.
    pub extra: IndexMap<String, String>,
}

impl EvalJobRow {
    /// Gets the value of a column.
    fn value(&self, column: &str) -> String {
        match column {
            MODEL_PATH_COLUMN => self.model_path.to_string(),
            TASK_PATH_COLUMN => self.task_path.clone(),
            N_SHOT_COLUMN => self.n_shot.to_string(),
            other => self.extra.get(other).cloned().unwrap_or_default(),
        }
    }
}

/// An ordered matrix of evaluation jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMatrix {
    /// The column order used when persisting the matrix.
    columns: Vec<String>,
    /// The jobs.
    rows: Vec<EvalJobRow>,
}

impl JobMatrix {
    /// Creates a matrix with the required columns only.
    pub fn new(rows: Vec<EvalJobRow>) -> Self {
        Self {
            columns: REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    /// Gets the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Gets the jobs.
    pub fn rows(&self) -> &[EvalJobRow] {
        &self.rows
    }

    /// Gets the number of jobs.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Determines if the matrix has no jobs.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Gets the distinct task names in first-seen order.
    pub fn unique_tasks(&self) -> IndexSet<&str> {
        self.rows.iter().map(|r| r.task_path.as_str()).collect()
    }

    /// Writes the matrix as a CSV table with a header row.
    pub fn write_csv(&self, path: &Path) -> Result<(), TableError> {
        let csv_error = |source| TableError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
        writer.write_record(&self.columns).map_err(csv_error)?;
        for row in &self.rows {
            writer
                .write_record(self.columns.iter().map(|c| row.value(c)))
                .map_err(csv_error)?;
        }

        writer.flush().map_err(|e| csv_error(e.into()))?;
        Ok(())
    }
}

/// A row of a job table before its model is resolved.
#[derive(Debug, Clone)]
struct TableRow {
    /// The model reference.
    model: String,
    /// The task name.
    task_path: String,
    /// The number of few-shot examples.
    n_shot: u32,
    /// Additional columns.
    extra: IndexMap<String, String>,
}

/// A job table as read from disk.
#[derive(Debug)]
struct Table {
    /// The column names in table order.
    columns: Vec<String>,
    /// The rows.
    rows: Vec<TableRow>,
}

impl Table {
    /// Reads a job table.
    fn read(path: &Path) -> Result<Self, TableError> {
        let csv_error = |source| TableError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(|e| csv_error(e.into()))?;
        let mut reader = csv::Reader::from_reader(file);
        let columns: Vec<String> = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut seen = IndexSet::new();
        if let Some(column) = columns.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(TableError::DuplicateColumn {
                path: path.to_path_buf(),
                column: column.clone(),
            });
        }

        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|c| !columns.iter().any(|h| h == *c))
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(TableError::MissingColumns {
                path: path.to_path_buf(),
                missing,
            });
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            let mut model = String::new();
            let mut task_path = String::new();
            let mut n_shot: Option<u32> = None;
            let mut extra = IndexMap::new();
            for (column, value) in columns.iter().zip(record.iter()) {
                match column.as_str() {
                    MODEL_PATH_COLUMN => model = value.to_string(),
                    TASK_PATH_COLUMN => task_path = value.to_string(),
                    N_SHOT_COLUMN => {
                        n_shot = Some(value.trim().parse().map_err(|_| TableError::InvalidShot {
                            path: path.to_path_buf(),
                            line: record.position().map(|p| p.line()).unwrap_or_default(),
                            value: value.to_string(),
                        })?)
                    }
                    _ => {
                        extra.insert(column.clone(), value.to_string());
                    }
                }
            }

            rows.push(TableRow {
                model,
                task_path,
                n_shot: n_shot.unwrap_or_default(),
                extra,
            });
        }

        Ok(Self { columns, rows })
    }
}

/// Builds job matrices, resolving model references along the way.
#[derive(Debug)]
pub struct JobMatrixBuilder {
    /// The resolver for model references.
    resolver: ModelResolver,
}

impl JobMatrixBuilder {
    /// Creates a new matrix builder.
    pub fn new(resolver: ModelResolver) -> Self {
        Self { resolver }
    }

    /// Builds the job matrix for the given input.
    ///
    /// References that resolve to nothing contribute no rows; the result may
    /// be empty.
    pub async fn build(&self, input: &MatrixInput) -> Result<JobMatrix, MatrixError> {
        let matrix = match input {
            MatrixInput::Table(path) => self.build_from_table(path).await?,
            MatrixInput::Selectors {
                models,
                tasks,
                shots,
            } => self.build_cross_product(models, tasks, shots).await,
        };

        info!(jobs = matrix.len(), "built evaluation job matrix");
        Ok(matrix)
    }

    /// Builds the cross product of resolved models, tasks, and shot counts.
    async fn build_cross_product(
        &self,
        models: &[String],
        tasks: &[String],
        shots: &[u32],
    ) -> JobMatrix {
        let resolved = self.resolver.resolve(models).await;

        let mut rows = Vec::new();
        for model in resolved.values().flatten() {
            for task in tasks {
                for shot in shots {
                    rows.push(EvalJobRow {
                        model_path: model.clone(),
                        task_path: task.clone(),
                        n_shot: *shot,
                        extra: IndexMap::new(),
                    });
                }
            }
        }

        JobMatrix::new(rows)
    }

    /// Builds a matrix from a job table, expanding each row per resolved
    /// model.
    async fn build_from_table(&self, path: &Path) -> Result<JobMatrix, TableError> {
        let table = Table::read(path)?;
        debug!(
            path = %path.display(),
            rows = table.rows.len(),
            "read job table"
        );

        let references: Vec<&str> = table
            .rows
            .iter()
            .map(|r| r.model.trim())
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();
        let resolved = self.resolver.resolve(&references).await;

        let mut rows = Vec::new();
        for row in table.rows {
            for model in resolved.get(row.model.trim()).into_iter().flatten() {
                rows.push(EvalJobRow {
                    model_path: model.clone(),
                    task_path: row.task_path.clone(),
                    n_shot: row.n_shot,
                    extra: row.extra.clone(),
                });
            }
        }

        Ok(JobMatrix {
            columns: table.columns,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::resolver::tests::FakeRepository;
    use crate::resolver::tests::checkpoint;

    /// Creates a builder backed by a fake model repository.
    fn builder() -> JobMatrixBuilder {
        JobMatrixBuilder::new(ModelResolver::new(Arc::new(FakeRepository::default())))
    }

    /// Creates a model with two checkpoints and one without any weights.
    fn models(dir: &Path) -> (String, String) {
        let a = dir.join("a");
        checkpoint(&a.join("hf").join("iter_1"));
        checkpoint(&a.join("hf").join("iter_2"));
        let b = dir.join("b");
        std::fs::create_dir_all(&b).unwrap();
        (
            a.to_str().unwrap().to_string(),
            b.to_str().unwrap().to_string(),
        )
    }

    #[test]
    fn input_modes_are_exclusive() {
        let table = Some(PathBuf::from("jobs.csv"));
        assert!(matches!(
            MatrixInput::from_selectors(
                table.clone(),
                vec!["x".into(), "y".into()],
                vec!["t".into()],
                vec![]
            ),
            Err(MatrixError::ConflictingInputs)
        ));
        assert!(matches!(
            MatrixInput::from_selectors(table.clone(), vec![], vec![], vec![0]),
            Err(MatrixError::ConflictingInputs)
        ));
        assert_eq!(
            MatrixInput::from_selectors(table, vec![], vec![], vec![]).unwrap(),
            MatrixInput::Table("jobs.csv".into())
        );
    }

    #[test]
    fn selectors_are_required() {
        assert!(matches!(
            MatrixInput::from_selectors(None, vec![], vec![], vec![]),
            Err(MatrixError::MissingInputs)
        ));
        assert!(matches!(
            MatrixInput::from_selectors(None, vec!["x".into()], vec!["t".into()], vec![]),
            Err(MatrixError::MissingInputs)
        ));
    }

    #[tokio::test]
    async fn cross_product() {
        let dir = TempDir::new().unwrap();
        let (a, b) = models(dir.path());
        let input = MatrixInput::from_selectors(
            None,
            vec![a.clone(), b.clone()],
            vec!["t1".into(), "t2".into()],
            vec![0, 5],
        )
        .unwrap();

        let matrix = builder().build(&input).await.unwrap();
        assert_eq!(matrix.len(), 8);
        assert_eq!(matrix.columns(), REQUIRED_COLUMNS);
        assert!(
            matrix
                .rows()
                .iter()
                .all(|r| !r.model_path.to_string().starts_with(&b))
        );

        let first = &matrix.rows()[0];
        assert_eq!(
            first.model_path,
            ResolvedModel::Local(Path::new(&a).join("hf").join("iter_1"))
        );
        assert_eq!(first.task_path, "t1");
        assert_eq!(first.n_shot, 0);
        assert_eq!(matrix.rows()[1].n_shot, 5);
        assert_eq!(matrix.rows()[2].task_path, "t2");
        assert_eq!(
            matrix.unique_tasks().into_iter().collect::<Vec<_>>(),
            ["t1", "t2"]
        );
    }

    #[tokio::test]
    async fn nothing_resolves() {
        let input = MatrixInput::from_selectors(
            None,
            vec!["org/missing".into()],
            vec!["t1".into()],
            vec![0],
        )
        .unwrap();

        assert!(builder().build(&input).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn table_expands_models() {
        let dir = TempDir::new().unwrap();
        let (a, b) = models(dir.path());
        let table = dir.path().join("jobs.csv");
        std::fs::write(
            &table,
            format!(
                "task_path,model_path,n_shot,seed\n\
                 t1,{a},0,1\n\
                 t2,{b},5,2\n\
                 t3,org/remote,3,3\n\
                 t3,org/remote,3,3\n"
            ),
        )
        .unwrap();

        let matrix = builder()
            .build(&MatrixInput::Table(table))
            .await
            .unwrap();
        assert_eq!(matrix.columns(), ["task_path", "model_path", "n_shot", "seed"]);
        assert_eq!(matrix.len(), 4);
        assert_eq!(matrix.rows()[0].extra["seed"], "1");
        assert_eq!(
            matrix.rows()[1].model_path,
            ResolvedModel::Local(Path::new(&a).join("hf").join("iter_2"))
        );
        assert_eq!(matrix.rows()[2], matrix.rows()[3]);
        assert_eq!(
            matrix.rows()[2].model_path,
            ResolvedModel::Remote("org/remote".into())
        );

        let out = dir.path().join("out.csv");
        matrix.write_csv(&out).unwrap();
        let written = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines[0], "task_path,model_path,n_shot,seed");
        assert_eq!(lines[3], "t3,org/remote,3,3");
        assert_eq!(lines.len(), 5);
    }

    #[tokio::test]
    async fn table_missing_columns() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("jobs.csv");
        std::fs::write(&table, "model_path,task\nx,t1\n").unwrap();

        let err = builder()
            .build(&MatrixInput::Table(table))
            .await
            .unwrap_err();
        match err {
            MatrixError::Table(TableError::MissingColumns { missing, .. }) => {
                assert_eq!(missing, ["task_path", "n_shot"]);
            }
            other => panic!("unexpected error `{other}`"),
        }
    }

    #[tokio::test]
    async fn table_duplicate_columns() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("jobs.csv");
        std::fs::write(&table, "model_path,task_path,n_shot,seed,seed\nx,t1,0,1,2\n").unwrap();

        let err = builder()
            .build(&MatrixInput::Table(table))
            .await
            .unwrap_err();
        match err {
            MatrixError::Table(TableError::DuplicateColumn { column, .. }) => {
                assert_eq!(column, "seed");
            }
            other => panic!("unexpected error `{other}`"),
        }
    }

    #[tokio::test]
    async fn table_values_are_kept_as_written() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("jobs.csv");
        std::fs::write(
            &table,
            "model_path,task_path,n_shot,note\n org/remote , t1 ,0, padded \n",
        )
        .unwrap();

        let matrix = builder()
            .build(&MatrixInput::Table(table))
            .await
            .unwrap();
        assert_eq!(matrix.len(), 1);
        let row = &matrix.rows()[0];
        assert_eq!(row.model_path, ResolvedModel::Remote("org/remote".into()));
        assert_eq!(row.task_path, " t1 ");
        assert_eq!(row.extra["note"], " padded ");
    }

    #[tokio::test]
    async fn table_invalid_shot() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("jobs.csv");
        std::fs::write(&table, "model_path,task_path,n_shot\nx,t1,many\n").unwrap();

        let err = builder()
            .build(&MatrixInput::Table(table))
            .await
            .unwrap_err();
        match err {
            MatrixError::Table(TableError::InvalidShot { line, value, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(value, "many");
            }
            other => panic!("unexpected error `{other}`"),
        }
    }

    #[tokio::test]
    async fn table_not_found() {
        let dir = TempDir::new().unwrap();
        let err = builder()
            .build(&MatrixInput::Table(dir.path().join("missing.csv")))
            .await
            .unwrap_err();
        assert!(matches!(err, MatrixError::Table(TableError::Csv { .. })));
    }
}
