//! Differential expression: phenotype tables, the analysis seam, and the
//! Rscript-backed implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use log::{info, warn};
use crate::config::defs::{PipelineError, COUNT_KEY_COLUMN, DE_RAW_RESULTS_FILE, NA_MARKERS, PHENOTYPE_FILE, PHENOTYPE_GROUP_COLUMN};
use crate::utils::aggregate::CountMatrix;
use crate::utils::command::rscript;
use crate::utils::invoker::{run_tool, ToolInvoker};


/// Sample-indexed covariate table. `columns` excludes the sample id column.
#[derive(Debug, Clone, PartialEq)]
pub struct PhenotypeTable {
    pub columns: Vec<String>,
    pub rows: Vec<(String, Vec<String>)>,
}

impl PhenotypeTable {
    /// One `group` column, rows in sample order.
    pub fn from_groups(samples: &[String], groups: &[String]) -> Self {
        PhenotypeTable {
            columns: vec![PHENOTYPE_GROUP_COLUMN.to_string()],
            rows: samples
                .iter()
                .zip(groups)
                .map(|(s, g)| (s.clone(), vec![g.clone()]))
                .collect(),
        }
    }

    /// Reads a CSV whose first column is the sample id.
    pub fn read_csv(path: &Path) -> Result<Self, PipelineError> {
        let io_err = |e: csv::Error| PipelineError::IOError(format!("{}: {}", path.display(), e));
        let mut reader = csv::Reader::from_path(path).map_err(io_err)?;
        let header = reader.headers().map_err(io_err)?.clone();
        if header.len() < 2 {
            return Err(PipelineError::InvalidManifest(format!(
                "phenotype table {} needs a sample column and at least one covariate",
                path.display()
            )));
        }
        let columns = header.iter().skip(1).map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(io_err)?;
            let mut fields = record.iter().map(str::to_string);
            let sample = fields.next().unwrap_or_default();
            rows.push((sample, fields.collect()));
        }
        Ok(PhenotypeTable { columns, rows })
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), PipelineError> {
        let io_err = |e: csv::Error| PipelineError::IOError(format!("{}: {}", path.display(), e));
        let mut writer = csv::Writer::from_path(path).map_err(io_err)?;
        let mut header = vec![String::new()];
        header.extend(self.columns.iter().cloned());
        writer.write_record(&header).map_err(io_err)?;
        for (sample, values) in &self.rows {
            let mut record = vec![sample.clone()];
            record.extend(values.iter().cloned());
            writer.write_record(&record).map_err(io_err)?;
        }
        writer.flush().map_err(|e| PipelineError::IOError(e.to_string()))
    }

    pub fn samples(&self) -> Vec<String> {
        self.rows.iter().map(|(s, _)| s.clone()).collect()
    }
}


/// Results table: a feature id column followed by statistic columns.
#[derive(Debug, Clone, PartialEq)]
pub struct DeResults {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl DeResults {
    pub fn read_csv(path: &Path) -> Result<Self, PipelineError> {
        let io_err = |e: csv::Error| PipelineError::IOError(format!("{}: {}", path.display(), e));
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path).map_err(io_err)?;
        let header = reader.headers().map_err(io_err)?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record.map_err(io_err)?.iter().map(str::to_string).collect());
        }
        Ok(DeResults { header, rows })
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), PipelineError> {
        let io_err = |e: csv::Error| PipelineError::IOError(format!("{}: {}", path.display(), e));
        let mut writer = csv::WriterBuilder::new().flexible(true).from_path(path).map_err(io_err)?;
        writer.write_record(&self.header).map_err(io_err)?;
        for row in &self.rows {
            writer.write_record(row).map_err(io_err)?;
        }
        writer.flush().map_err(|e| PipelineError::IOError(e.to_string()))
    }

    /// Drops rows with no adjusted significance value. Returns how many went.
    pub fn drop_missing(&mut self, column: &str) -> Result<usize, PipelineError> {
        let idx = self.header.iter().position(|h| h == column).ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "results have no '{}' column (columns: {})",
                column,
                self.header.join(", ")
            ))
        })?;
        let before = self.rows.len();
        self.rows.retain(|row| {
            row.get(idx)
                .map(|v| !NA_MARKERS.contains(&v.trim()))
                .unwrap_or(false)
        });
        Ok(before - self.rows.len())
    }
}


/// Black-box statistics: counts + phenotype + design formula → results.
#[async_trait]
pub trait DifferentialExpression: Send + Sync {
    async fn analyse(
        &self,
        matrix: &CountMatrix,
        phenotype: &PhenotypeTable,
        design: &str,
        work_dir: &Path,
    ) -> Result<DeResults, PipelineError>;
}


/// Hands the inputs to an R script as CSV files and reads its CSV back.
/// The script is called as `Rscript <script> <counts> <phenotype> <design> <out>`.
pub struct RscriptAnalyzer {
    invoker: Arc<dyn ToolInvoker>,
    script: PathBuf,
}

impl RscriptAnalyzer {
    pub fn new(invoker: Arc<dyn ToolInvoker>, script: PathBuf) -> Self {
        RscriptAnalyzer { invoker, script }
    }
}

#[async_trait]
impl DifferentialExpression for RscriptAnalyzer {
    async fn analyse(
        &self,
        matrix: &CountMatrix,
        phenotype: &PhenotypeTable,
        design: &str,
        work_dir: &Path,
    ) -> Result<DeResults, PipelineError> {
        let counts_path = work_dir.join("de_input_counts.csv");
        let phenotype_path = work_dir.join(PHENOTYPE_FILE);
        let output_path = work_dir.join(DE_RAW_RESULTS_FILE);

        matrix.write_csv(&counts_path, COUNT_KEY_COLUMN)?;
        phenotype.write_csv(&phenotype_path)?;

        let command = rscript::command(&self.script, &counts_path, &phenotype_path, design, &output_path);
        run_tool(self.invoker.as_ref(), &command).await?;

        if !output_path.is_file() {
            warn!("{} finished without writing {}", self.script.display(), output_path.display());
            return Err(PipelineError::MissingInput(output_path));
        }
        let results = DeResults::read_csv(&output_path)?;
        info!("Differential expression produced {} rows", results.rows.len());
        Ok(results)
    }
}
