use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use lazy_static::lazy_static;
use std::collections::HashMap;
use crate::cli::Arguments;
use crate::utils::aggregate::MergeError;

// External software
pub const FASTP_TAG: &str = "fastp";
pub const HISAT2_TAG: &str = "hisat2";
pub const HISAT2_BUILD_TAG: &str = "hisat2-build";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const HTSEQ_COUNT_TAG: &str = "htseq-count";
pub const RSCRIPT_TAG: &str = "Rscript";
pub const SCP_TAG: &str = "scp";
pub const SSH_TAG: &str = "ssh";
pub const SSHPASS_TAG: &str = "sshpass";


lazy_static! {
    /// Tools whose normal progress or summary output goes to stderr.
    pub static ref STDERR_CHATTER: HashMap<&'static str, bool> = {
        let mut m = HashMap::new();
        m.insert(FASTP_TAG, true);
        m.insert(HISAT2_TAG, true);
        m.insert(HISAT2_BUILD_TAG, true);
        m.insert(SAMTOOLS_TAG, false);
        m.insert(HTSEQ_COUNT_TAG, true);
        m.insert(RSCRIPT_TAG, true);
        m.insert(SCP_TAG, false);
        m.insert(SSH_TAG, false);
        m.insert(SSHPASS_TAG, false);

        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    Sort,
}

// Static Filenames
pub const COUNT_MATRIX_FILE: &str = "count.csv";
pub const DE_RESULTS_FILE: &str = "de_results.csv";
pub const DE_RAW_RESULTS_FILE: &str = "de_raw.csv";
pub const PHENOTYPE_FILE: &str = "phenotype.csv";
pub const HISAT2_INDEX_EXT: &str = "ht2";


// Static Parameters
pub const COUNT_TRAILER_ROWS: usize = 5;
pub const COUNT_KEY_COLUMN: &str = "";
pub const DEFAULT_DESIGN_FORMULA: &str = "group";
pub const PHENOTYPE_GROUP_COLUMN: &str = "group";
pub const DEFAULT_PADJ_COLUMN: &str = "padj";
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 30;
pub const RUN_ID_MIN: u32 = 10_000_000;
pub const RUN_ID_MAX: u32 = 99_999_999;
pub const API_ROUTE: &str = "/rna_seq_analysis";
pub const REPORT_SUBJECT: &str = "RNA-seq analysis results";
pub const REPORT_BODY: &str = "Your RNA-seq analysis results are attached.";
pub const NA_MARKERS: &[&str] = &["", "NA", "NaN", "nan", "null"];


/// Fixed pipeline order. Preflight covers input validation and tool probes
/// before the first real stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Preflight,
    Trimming,
    Indexing,
    Aligning,
    Sorting,
    Counting,
    Merging,
    DifferentialExpression,
    Reporting,
}

impl Stage {
    pub const ORDER: [Stage; 9] = [
        Stage::Preflight,
        Stage::Trimming,
        Stage::Indexing,
        Stage::Aligning,
        Stage::Sorting,
        Stage::Counting,
        Stage::Merging,
        Stage::DifferentialExpression,
        Stage::Reporting,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Preflight => "Preflight",
            Stage::Trimming => "Trimming",
            Stage::Indexing => "Indexing",
            Stage::Aligning => "Aligning",
            Stage::Sorting => "Sorting",
            Stage::Counting => "Counting",
            Stage::Merging => "Merging",
            Stage::DifferentialExpression => "DifferentialExpression",
            Stage::Reporting => "Reporting",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}


#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Missing input file: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("Failed to execute {tool}: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("{tool} exited with status {status}: {stderr}")]
    ToolFailed { tool: String, status: String, stderr: String },

    #[error("{tool} did not finish within {secs} seconds")]
    ToolTimeout { tool: String, secs: u64 },

    #[error("Upload of {file} failed after {attempts} attempt(s): {error}")]
    TransferExhausted { file: String, attempts: u32, error: String },

    #[error("Upload batch incomplete, not dispatching. Failed files: {}", .files.join(", "))]
    BatchIncomplete { files: Vec<String> },

    #[error("Merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("Job dispatch failed: {0}")]
    Dispatch(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("{stage} failed{}: {detail}", .sample.as_ref().map(|s| format!(" for sample {}", s)).unwrap_or_default())]
    StageFailed { stage: Stage, sample: Option<String>, detail: String },

    #[error("IO error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}


/// Process-wide settings, built once in main and shared as `Arc<RunConfig>`.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub cwd: PathBuf,
    pub args: Arguments,
    pub threads: usize,
    pub tool_timeout: Option<Duration>,
}

impl RunConfig {
    pub fn new(mut args: Arguments, cwd: PathBuf, threads: usize) -> Self {
        let tool_timeout = args.tool_timeout.map(Duration::from_secs);
        if args.padj_column.is_empty() {
            args.padj_column = DEFAULT_PADJ_COLUMN.to_string();
        }
        RunConfig {
            cwd,
            args,
            threads: threads.max(1),
            tool_timeout,
        }
    }
}
