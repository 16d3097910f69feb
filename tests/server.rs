use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use serde_json::json;
use tokio::net::TcpListener;
use rnaseq_relay::cli::Arguments;
use rnaseq_relay::config::defs::{PipelineError, RunConfig};
use rnaseq_relay::config::manifest::RunRequest;
use rnaseq_relay::pipelines::de::{DeResults, DifferentialExpression, PhenotypeTable};
use rnaseq_relay::pipelines::rna_seq::{Pipeline, StageContext};
use rnaseq_relay::pipelines::server::{router, ServerState};
use rnaseq_relay::utils::aggregate::CountMatrix;
use rnaseq_relay::utils::command::ToolCommand;
use rnaseq_relay::utils::dispatch::{HttpDispatcher, JobSubmitter, RunStatus};
use rnaseq_relay::utils::invoker::{ToolInvoker, ToolOutcome};

struct NoopInvoker;

#[async_trait]
impl ToolInvoker for NoopInvoker {
    async fn invoke(&self, _command: &ToolCommand) -> Result<ToolOutcome, PipelineError> {
        Ok(ToolOutcome::ok("tool 1.0"))
    }
}

struct NoopAnalyzer;

#[async_trait]
impl DifferentialExpression for NoopAnalyzer {
    async fn analyse(
        &self,
        _matrix: &CountMatrix,
        _phenotype: &PhenotypeTable,
        _design: &str,
        _work_dir: &Path,
    ) -> Result<DeResults, PipelineError> {
        Ok(DeResults { header: vec!["".into(), "padj".into()], rows: Vec::new() })
    }
}

async fn start_server() -> anyhow::Result<HttpDispatcher> {
    let config = Arc::new(RunConfig::new(Arguments::default(), PathBuf::from("."), 2));
    let ctx = StageContext { config, invoker: Arc::new(NoopInvoker), analyzer: Arc::new(NoopAnalyzer) };
    let state = Arc::new(ServerState { pipeline: Arc::new(Pipeline::new(ctx, None)), max_threads: 2 });

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    Ok(HttpDispatcher::new("127.0.0.1", port)?)
}

fn request(target: &str, groups: serde_json::Value) -> RunRequest {
    serde_json::from_value(json!({
        "sample_name_list": ["s1", "l1"],
        "grouping_list": groups,
        "chr_and_length": "chr_length.csv",
        "gtf": "genomic.gtf",
        "reference_genome": "genome.fna",
        "sequencing_type": 1,
        "fastq_list": ["s1.fastq", "l1.fastq"],
        "index_prefix": "index_prefix",
        "cpu_num": 2,
        "target_path": target,
        "file_name": "87654321"
    }))
    .unwrap()
}


#[tokio::test]
async fn test_mismatched_manifest_is_rejected_with_failed_status() -> anyhow::Result<()> {
    let dispatcher = start_server().await?;
    let response = dispatcher.submit(&request("/data/runs", json!(["saline"]))).await?;

    assert_eq!(response.status, RunStatus::Failed);
    assert!(response.message.contains("must match"));
    assert!(response.stage.is_none());
    Ok(())
}

#[tokio::test]
async fn test_stage_failure_names_the_stage_and_sample() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let dispatcher = start_server().await?;
    // Run directory exists but holds no inputs
    std::fs::create_dir_all(dir.path().join("87654321"))?;
    let response = dispatcher
        .submit(&request(&dir.path().to_string_lossy(), json!(["saline", "lps"])))
        .await?;

    assert_eq!(response.status, RunStatus::Failed);
    assert_eq!(response.stage.as_deref(), Some("Preflight"));
    assert_eq!(response.sample.as_deref(), Some("s1"));
    assert!(response.message.contains("s1.fastq"));
    Ok(())
}
