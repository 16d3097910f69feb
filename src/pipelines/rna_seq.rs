//! RNA-seq pipeline orchestration.
//!
//! Stages run strictly in order, each gated on the previous one. Per-sample
//! stages run samples one after another, except counting, which fans out one
//! worker per sample behind a join-all barrier.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use anyhow::anyhow;
use async_trait::async_trait;
use log::{error, info, warn};
use crate::config::defs::{
    PipelineError, RunConfig, SamtoolsSubcommand, Stage, COUNT_KEY_COLUMN, COUNT_MATRIX_FILE,
    DE_RESULTS_FILE, FASTP_TAG, HISAT2_BUILD_TAG, HISAT2_TAG, HTSEQ_COUNT_TAG, REPORT_BODY,
    REPORT_SUBJECT, SAMTOOLS_TAG,
};
use crate::config::manifest::{PipelineManifest, ReadSet, RunRequest, Sample};
use crate::pipelines::de::{DifferentialExpression, PhenotypeTable, RscriptAnalyzer};
use crate::utils::aggregate::{merge, read_count_table, CountMatrix};
use crate::utils::command::samtools::SamtoolsConfig;
use crate::utils::command::{check_versions, fastp, hisat2, htseq, samtools};
use crate::utils::file::{file_path_manipulator, index_files_exist, read_chrom_lengths, validate_file_inputs};
use crate::utils::invoker::{run_tool, ProcessInvoker, ToolInvoker};
use crate::utils::notify::{Notifier, Report, SmtpNotifier};
use crate::utils::workers::TaskGroup;


/// Shared collaborators handed to every stage.
#[derive(Clone)]
pub struct StageContext {
    pub config: Arc<RunConfig>,
    pub invoker: Arc<dyn ToolInvoker>,
    pub analyzer: Arc<dyn DifferentialExpression>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub stage: Stage,
    pub sample: Option<String>,
    pub status: StageStatus,
    pub artifacts: Vec<PathBuf>,
    pub diagnostics: String,
}

impl StageResult {
    fn succeeded(stage: Stage, sample: Option<&str>, artifacts: Vec<PathBuf>, diagnostics: String) -> Self {
        StageResult {
            stage,
            sample: sample.map(str::to_string),
            status: StageStatus::Succeeded,
            artifacts,
            diagnostics,
        }
    }

    fn failed(stage: Stage, sample: Option<&str>, diagnostics: String) -> Self {
        StageResult {
            stage,
            sample: sample.map(str::to_string),
            status: StageStatus::Failed,
            artifacts: Vec::new(),
            diagnostics,
        }
    }
}

/// Everything a run accumulates as stages complete.
#[derive(Debug)]
pub struct RunState {
    pub manifest: PipelineManifest,
    pub index_prefix: Option<PathBuf>,
    pub matrix: Option<CountMatrix>,
    pub count_matrix_path: Option<PathBuf>,
    pub de_results_path: Option<PathBuf>,
    pub results: Vec<StageResult>,
}

impl RunState {
    pub fn new(manifest: PipelineManifest) -> Self {
        RunState {
            manifest,
            index_prefix: None,
            matrix: None,
            count_matrix_path: None,
            de_results_path: None,
            results: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct StageFailure {
    pub sample: Option<String>,
    pub error: PipelineError,
}

impl StageFailure {
    fn for_sample(sample: &str, error: PipelineError) -> Self {
        StageFailure { sample: Some(sample.to_string()), error }
    }
}

impl From<PipelineError> for StageFailure {
    fn from(error: PipelineError) -> Self {
        StageFailure { sample: None, error }
    }
}

fn missing_artifact(sample: &Sample, what: &str) -> StageFailure {
    StageFailure::for_sample(
        &sample.name,
        PipelineError::Other(anyhow!("{} for sample {} was never produced", what, sample.name)),
    )
}


/// One step of the pipeline: consume prior artifacts from the run state,
/// record new ones.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn stage(&self) -> Stage;

    async fn run(&self, ctx: &StageContext, state: &mut RunState) -> Result<(), StageFailure>;
}


pub struct PreflightStage;

#[async_trait]
impl PipelineStage for PreflightStage {
    fn stage(&self) -> Stage {
        Stage::Preflight
    }

    async fn run(&self, ctx: &StageContext, state: &mut RunState) -> Result<(), StageFailure> {
        let manifest = &state.manifest;
        for sample in &manifest.samples {
            validate_file_inputs(sample.reads.paths()).map_err(|e| StageFailure::for_sample(&sample.name, e))?;
        }
        let refs = &manifest.references;
        validate_file_inputs([refs.genome.as_path(), refs.annotation.as_path(), refs.chrom_lengths.as_path()])?;

        let chroms = read_chrom_lengths(&refs.chrom_lengths)?;
        info!("Reference has {} chromosomes", chroms.len());

        check_versions(
            ctx.invoker.as_ref(),
            &[FASTP_TAG, HISAT2_BUILD_TAG, HISAT2_TAG, SAMTOOLS_TAG, HTSEQ_COUNT_TAG],
        )
        .await?;

        tokio::fs::create_dir_all(&manifest.out_dir)
            .await
            .map_err(|e| PipelineError::IOError(format!("{}: {}", manifest.out_dir.display(), e)))?;
        Ok(())
    }
}


pub struct TrimStage;

fn cleaned_reads(sample: &Sample, out_dir: &Path) -> ReadSet {
    let base = Path::new(&sample.name);
    match sample.reads {
        ReadSet::Single(_) => ReadSet::Single(out_dir.join(format!("{}.fq", sample.name))),
        ReadSet::Paired(_, _) => ReadSet::Paired(
            file_path_manipulator(base, Some(out_dir), None, Some("r1.fq"), "_"),
            file_path_manipulator(base, Some(out_dir), None, Some("r2.fq"), "_"),
        ),
    }
}

#[async_trait]
impl PipelineStage for TrimStage {
    fn stage(&self) -> Stage {
        Stage::Trimming
    }

    async fn run(&self, ctx: &StageContext, state: &mut RunState) -> Result<(), StageFailure> {
        let out_dir = state.manifest.out_dir.clone();
        let threads = state.manifest.threads;
        for sample in state.manifest.samples.iter_mut() {
            let cleaned = cleaned_reads(sample, &out_dir);
            let command = fastp::command(&sample.reads, &cleaned, threads)
                .map_err(|e| StageFailure::for_sample(&sample.name, e))?;
            let outcome = run_tool(ctx.invoker.as_ref(), &command)
                .await
                .map_err(|e| StageFailure::for_sample(&sample.name, e))?;
            let artifacts = cleaned.paths().iter().map(|p| p.to_path_buf()).collect();
            sample.set_cleaned(cleaned)?;
            state.results.push(StageResult::succeeded(Stage::Trimming, Some(&sample.name), artifacts, outcome.stderr));
        }
        Ok(())
    }
}


pub struct IndexStage;

#[async_trait]
impl PipelineStage for IndexStage {
    fn stage(&self) -> Stage {
        Stage::Indexing
    }

    async fn run(&self, ctx: &StageContext, state: &mut RunState) -> Result<(), StageFailure> {
        let prefix = state.manifest.out_dir.join(&state.manifest.index_prefix);
        if ctx.config.args.reuse_index && index_files_exist(&prefix) {
            info!("Reusing existing index at {}", prefix.display());
            state.results.push(StageResult::succeeded(Stage::Indexing, None, vec![prefix.clone()], String::new()));
            state.index_prefix = Some(prefix);
            return Ok(());
        }

        let command = hisat2::build_command(&state.manifest.references.genome, &prefix, state.manifest.threads);
        let outcome = run_tool(ctx.invoker.as_ref(), &command).await?;
        state.results.push(StageResult::succeeded(Stage::Indexing, None, vec![prefix.clone()], outcome.stderr));
        state.index_prefix = Some(prefix);
        Ok(())
    }
}


pub struct AlignStage;

#[async_trait]
impl PipelineStage for AlignStage {
    fn stage(&self) -> Stage {
        Stage::Aligning
    }

    async fn run(&self, ctx: &StageContext, state: &mut RunState) -> Result<(), StageFailure> {
        let index = state
            .index_prefix
            .clone()
            .ok_or_else(|| PipelineError::Other(anyhow!("alignment started without a reference index")))?;
        let out_dir = state.manifest.out_dir.clone();
        let threads = state.manifest.threads;
        for sample in state.manifest.samples.iter_mut() {
            let cleaned = sample
                .artifacts
                .cleaned
                .clone()
                .ok_or_else(|| missing_artifact(sample, "cleaned reads"))?;
            let sam = out_dir.join(format!("{}.sam", sample.name));
            let command = hisat2::align_command(&index, &cleaned, &sam, threads);
            let outcome = run_tool(ctx.invoker.as_ref(), &command)
                .await
                .map_err(|e| StageFailure::for_sample(&sample.name, e))?;
            sample.set_alignment(sam.clone())?;
            state.results.push(StageResult::succeeded(Stage::Aligning, Some(&sample.name), vec![sam], outcome.stderr));
        }
        Ok(())
    }
}


pub struct SortStage;

#[async_trait]
impl PipelineStage for SortStage {
    fn stage(&self) -> Stage {
        Stage::Sorting
    }

    async fn run(&self, ctx: &StageContext, state: &mut RunState) -> Result<(), StageFailure> {
        let out_dir = state.manifest.out_dir.clone();
        let sort_config = SamtoolsConfig { subcommand: SamtoolsSubcommand::Sort, threads: state.manifest.threads };
        for sample in state.manifest.samples.iter_mut() {
            let sam = sample
                .artifacts
                .alignment
                .clone()
                .ok_or_else(|| missing_artifact(sample, "alignment"))?;
            let sorted = file_path_manipulator(Path::new(&sample.name), Some(&out_dir), None, Some("sorted.bam"), "_");
            let command = samtools::command(&sort_config, &sam, &sorted);
            let outcome = run_tool(ctx.invoker.as_ref(), &command)
                .await
                .map_err(|e| StageFailure::for_sample(&sample.name, e))?;
            sample.set_sorted(sorted.clone())?;
            state.results.push(StageResult::succeeded(Stage::Sorting, Some(&sample.name), vec![sorted], outcome.stderr));
        }
        Ok(())
    }
}


pub struct CountStage;

#[async_trait]
impl PipelineStage for CountStage {
    fn stage(&self) -> Stage {
        Stage::Counting
    }

    async fn run(&self, ctx: &StageContext, state: &mut RunState) -> Result<(), StageFailure> {
        let out_dir = state.manifest.out_dir.clone();
        let annotation = state.manifest.references.annotation.clone();

        let mut group = TaskGroup::new();
        let mut count_paths = Vec::with_capacity(state.manifest.samples.len());
        for sample in &state.manifest.samples {
            let sorted = sample
                .artifacts
                .sorted
                .clone()
                .ok_or_else(|| missing_artifact(sample, "sorted alignment"))?;
            // Distinct file per sample; names are unique by manifest invariant
            let count_path = file_path_manipulator(Path::new(&sample.name), Some(&out_dir), None, Some("counts.txt"), "_");
            let command = htseq::command(&sorted, &annotation);
            let invoker = ctx.invoker.clone();
            let path = count_path.clone();
            group.spawn(sample.name.clone(), async move {
                let outcome = run_tool(invoker.as_ref(), &command).await?;
                tokio::fs::write(&path, outcome.stdout.as_bytes())
                    .await
                    .map_err(|e| PipelineError::IOError(format!("{}: {}", path.display(), e)))?;
                Ok(outcome.stderr)
            });
            count_paths.push(count_path);
        }

        info!("Counting {} samples concurrently", group.len());
        let reports = group.join_all().await;

        let mut failures = Vec::new();
        for ((sample, report), path) in state.manifest.samples.iter_mut().zip(reports).zip(count_paths) {
            match report.result {
                Ok(diagnostics) => {
                    sample.set_counts(path.clone())?;
                    state.results.push(StageResult::succeeded(Stage::Counting, Some(&sample.name), vec![path], diagnostics));
                }
                Err(e) => {
                    error!("Counting failed for {}: {}", report.label, e);
                    state.results.push(StageResult::failed(Stage::Counting, Some(&sample.name), e.to_string()));
                    failures.push(format!("{} ({})", report.label, e));
                }
            }
        }

        if let Some(first) = state
            .results
            .iter()
            .find(|r| r.stage == Stage::Counting && r.status == StageStatus::Failed)
        {
            let total = state.manifest.samples.len();
            return Err(StageFailure {
                sample: first.sample.clone(),
                error: PipelineError::Other(anyhow!(
                    "{} of {} counting workers failed: {}",
                    failures.len(),
                    total,
                    failures.join("; ")
                )),
            });
        }
        Ok(())
    }
}


pub struct MergeStage;

#[async_trait]
impl PipelineStage for MergeStage {
    fn stage(&self) -> Stage {
        Stage::Merging
    }

    async fn run(&self, _ctx: &StageContext, state: &mut RunState) -> Result<(), StageFailure> {
        let mut tables = Vec::with_capacity(state.manifest.samples.len());
        for sample in &state.manifest.samples {
            let path = sample
                .artifacts
                .counts
                .as_ref()
                .ok_or_else(|| missing_artifact(sample, "count file"))?;
            let table = read_count_table(path, &sample.name)
                .map_err(|e| StageFailure::for_sample(&sample.name, e.into()))?;
            tables.push(table);
        }

        let matrix = merge(&tables, COUNT_KEY_COLUMN).map_err(PipelineError::from)?;
        let path = state.manifest.out_dir.join(COUNT_MATRIX_FILE);
        matrix.write_csv(&path, COUNT_KEY_COLUMN).map_err(PipelineError::from)?;
        info!("Count matrix: {} features x {} samples", matrix.nrows(), matrix.ncols());

        state.results.push(StageResult::succeeded(Stage::Merging, None, vec![path.clone()], String::new()));
        state.count_matrix_path = Some(path);
        state.matrix = Some(matrix);
        Ok(())
    }
}


pub struct DifferentialExpressionStage;

#[async_trait]
impl PipelineStage for DifferentialExpressionStage {
    fn stage(&self) -> Stage {
        Stage::DifferentialExpression
    }

    async fn run(&self, ctx: &StageContext, state: &mut RunState) -> Result<(), StageFailure> {
        let manifest = &state.manifest;
        let matrix = state
            .matrix
            .as_ref()
            .ok_or_else(|| PipelineError::Other(anyhow!("no count matrix to analyse")))?;

        let phenotype = match &manifest.phenotype {
            Some(path) => PhenotypeTable::read_csv(path)?,
            None => {
                let groups: Vec<String> = manifest.samples.iter().map(|s| s.group.clone()).collect();
                PhenotypeTable::from_groups(&manifest.sample_names(), &groups)
            }
        };
        let ordered = matrix.select_columns(&phenotype.samples()).map_err(PipelineError::from)?;

        let mut results = ctx
            .analyzer
            .analyse(&ordered, &phenotype, &manifest.design_formula, &manifest.out_dir)
            .await?;
        let dropped = results.drop_missing(&ctx.config.args.padj_column)?;
        if dropped > 0 {
            warn!("Dropped {} feature(s) without an adjusted p-value", dropped);
        }

        let path = manifest.out_dir.join(DE_RESULTS_FILE);
        results.write_csv(&path)?;
        info!("Wrote {} differential expression rows to {}", results.rows.len(), path.display());

        state.results.push(StageResult::succeeded(Stage::DifferentialExpression, None, vec![path.clone()], String::new()));
        state.de_results_path = Some(path);
        Ok(())
    }
}


pub fn default_stages() -> Vec<Box<dyn PipelineStage>> {
    vec![
        Box::new(PreflightStage),
        Box::new(TrimStage),
        Box::new(IndexStage),
        Box::new(AlignStage),
        Box::new(SortStage),
        Box::new(CountStage),
        Box::new(MergeStage),
        Box::new(DifferentialExpressionStage),
    ]
}


#[derive(Debug)]
pub enum PipelineOutcome {
    Completed {
        count_matrix: Option<PathBuf>,
        de_results: Option<PathBuf>,
        results: Vec<StageResult>,
    },
    Failed {
        stage: Stage,
        sample: Option<String>,
        reason: String,
        results: Vec<StageResult>,
    },
}

impl PipelineOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed { .. })
    }

    pub fn results(&self) -> &[StageResult] {
        match self {
            PipelineOutcome::Completed { results, .. } => results,
            PipelineOutcome::Failed { results, .. } => results,
        }
    }

    pub fn error(&self) -> Option<PipelineError> {
        match self {
            PipelineOutcome::Completed { .. } => None,
            PipelineOutcome::Failed { stage, sample, reason, .. } => Some(PipelineError::StageFailed {
                stage: *stage,
                sample: sample.clone(),
                detail: reason.clone(),
            }),
        }
    }
}


/// Runs the stage list over one manifest, then sends the report.
pub struct Pipeline {
    ctx: StageContext,
    stages: Vec<Box<dyn PipelineStage>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Pipeline {
    pub fn new(ctx: StageContext, notifier: Option<Arc<dyn Notifier>>) -> Self {
        Pipeline { ctx, stages: default_stages(), notifier }
    }

    /// Runs every stage in order. The first failure ends the run and is
    /// reported with its stage and sample; reporting failures are only logged.
    ///
    /// # Arguments
    ///
    /// * `manifest` - Validated run manifest.
    ///
    /// # Returns
    /// PipelineOutcome::Completed or PipelineOutcome::Failed
    pub async fn run(&self, manifest: PipelineManifest) -> PipelineOutcome {
        let run_start = Instant::now();
        info!("Starting run {} with {} samples", manifest.run_id, manifest.samples.len());
        let mut state = RunState::new(manifest);

        for stage in &self.stages {
            let stage_start = Instant::now();
            info!("Stage {} started", stage.stage());
            if let Err(failure) = stage.run(&self.ctx, &mut state).await {
                match &failure.sample {
                    Some(sample) => error!("Stage {} failed for sample {}: {}", stage.stage(), sample, failure.error),
                    None => error!("Stage {} failed: {}", stage.stage(), failure.error),
                }
                if stage.stage() != Stage::Counting {
                    state.results.push(StageResult::failed(
                        stage.stage(),
                        failure.sample.as_deref(),
                        failure.error.to_string(),
                    ));
                }
                return PipelineOutcome::Failed {
                    stage: stage.stage(),
                    sample: failure.sample,
                    reason: failure.error.to_string(),
                    results: state.results,
                };
            }
            info!("Stage {} finished in {} ms", stage.stage(), stage_start.elapsed().as_millis());
        }

        self.report(&mut state).await;
        info!("Run {} complete in {} ms", state.manifest.run_id, run_start.elapsed().as_millis());
        PipelineOutcome::Completed {
            count_matrix: state.count_matrix_path,
            de_results: state.de_results_path,
            results: state.results,
        }
    }

    async fn report(&self, state: &mut RunState) {
        let (Some(notifier), Some(recipient)) = (&self.notifier, &state.manifest.report) else {
            info!("No report recipient configured; skipping report");
            return;
        };
        let attachments: Vec<PathBuf> = state
            .count_matrix_path
            .iter()
            .chain(state.de_results_path.iter())
            .cloned()
            .collect();
        let report = Report {
            sender: recipient.sender_email.clone(),
            sender_password: recipient.sender_password.clone(),
            recipient: recipient.email_address.clone(),
            subject: REPORT_SUBJECT.to_string(),
            body: REPORT_BODY.to_string(),
            attachments: attachments.clone(),
        };
        match notifier.send(&report).await {
            Ok(()) => state.results.push(StageResult::succeeded(Stage::Reporting, None, attachments, String::new())),
            Err(e) => {
                error!("Report delivery failed (run still completed): {}", e);
                state.results.push(StageResult::failed(Stage::Reporting, None, e.to_string()));
            }
        }
    }
}


/// Wires the process-backed collaborators from the run configuration.
pub fn build_pipeline(config: Arc<RunConfig>) -> Result<Pipeline, PipelineError> {
    let script = config
        .args
        .de_script
        .as_ref()
        .map(PathBuf::from)
        .ok_or_else(|| PipelineError::InvalidConfig("--de-script is required to run the pipeline".to_string()))?;
    let script = if script.is_absolute() { script } else { config.cwd.join(script) };
    validate_file_inputs([script.as_path()])?;

    let invoker: Arc<dyn ToolInvoker> = Arc::new(ProcessInvoker::new(config.tool_timeout));
    let analyzer: Arc<dyn DifferentialExpression> = Arc::new(RscriptAnalyzer::new(invoker.clone(), script));
    let notifier: Arc<dyn Notifier> = Arc::new(SmtpNotifier::new(&config.args.smtp_relay, config.args.smtp_port));
    Ok(Pipeline::new(StageContext { config, invoker, analyzer }, Some(notifier)))
}


/// `run` module: executes one run request from a local JSON file.
pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let settings = config
        .args
        .settings
        .as_ref()
        .ok_or_else(|| PipelineError::InvalidConfig("--settings <run request JSON> is required".to_string()))?;
    let raw = tokio::fs::read_to_string(settings)
        .await
        .map_err(|e| PipelineError::IOError(format!("{}: {}", settings, e)))?;
    let request: RunRequest = serde_json::from_str(&raw)
        .map_err(|e| PipelineError::InvalidManifest(format!("{}: {}", settings, e)))?;

    let mut manifest = PipelineManifest::from_request(&request, config.threads)?;
    if let Some(out) = &config.args.out_dir {
        let out = PathBuf::from(out);
        manifest.out_dir = if out.is_absolute() { out } else { config.cwd.join(out) };
    }
    info!("Outputs go to {}", manifest.out_dir.display());

    let pipeline = build_pipeline(config)?;
    match pipeline.run(manifest).await.error() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_follow_fixed_order() {
        let stages: Vec<Stage> = default_stages().iter().map(|s| s.stage()).collect();
        // Reporting runs after the stage list, outside of it
        assert_eq!(stages, Stage::ORDER[..Stage::ORDER.len() - 1].to_vec());
    }

    #[test]
    fn test_cleaned_read_names() {
        let sample = Sample {
            name: "s1".to_string(),
            group: "saline".to_string(),
            reads: ReadSet::Paired(PathBuf::from("in/s1_1.fq"), PathBuf::from("in/s1_2.fq")),
            artifacts: Default::default(),
        };
        assert_eq!(
            cleaned_reads(&sample, Path::new("/out")),
            ReadSet::Paired(PathBuf::from("/out/s1_r1.fq"), PathBuf::from("/out/s1_r2.fq"))
        );
    }
}
