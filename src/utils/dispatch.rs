// src/utils/dispatch.rs: submitting a run request to the API server

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use crate::config::defs::{PipelineError, Stage, API_ROUTE};
use crate::config::manifest::RunRequest;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// What the API server answers for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    pub status: RunStatus,
    pub message: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub sample: Option<String>,
}

impl RunResponse {
    pub fn completed(message: impl Into<String>) -> Self {
        RunResponse { status: RunStatus::Completed, message: message.into(), stage: None, sample: None }
    }

    pub fn failed(message: impl Into<String>, stage: Option<Stage>, sample: Option<String>) -> Self {
        RunResponse {
            status: RunStatus::Failed,
            message: message.into(),
            stage: stage.map(|s| s.to_string()),
            sample,
        }
    }
}


/// Delivers one run request. Never retried: a second delivery could start
/// the same non-idempotent tool chain twice.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, request: &RunRequest) -> Result<RunResponse, PipelineError>;
}


/// `api_serve_ip` may already carry a scheme; otherwise it is a bare host.
pub fn endpoint_url(api_serve_ip: &str, api_port: u16) -> String {
    let base = api_serve_ip.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{}{}", base, API_ROUTE)
    } else {
        format!("http://{}:{}{}", base, api_port, API_ROUTE)
    }
}

pub struct HttpDispatcher {
    client: reqwest::Client,
    url: String,
}

impl HttpDispatcher {
    pub fn new(api_serve_ip: &str, api_port: u16) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| PipelineError::Dispatch(e.to_string()))?;
        Ok(HttpDispatcher { client, url: endpoint_url(api_serve_ip, api_port) })
    }
}

#[async_trait]
impl JobSubmitter for HttpDispatcher {
    async fn submit(&self, request: &RunRequest) -> Result<RunResponse, PipelineError> {
        info!("Submitting run {} to {}", request.file_name, self.url);
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| PipelineError::Dispatch(format!("could not reach {}: {}", self.url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::Dispatch(e.to_string()))?;

        // A failed run answers non-2xx with a `failed` RunResponse naming the stage.
        // Any other non-2xx answer, or a body that is not a RunResponse, is a delivery problem.
        match serde_json::from_str::<RunResponse>(&body) {
            Ok(parsed) if status.is_success() || parsed.status == RunStatus::Failed => Ok(parsed),
            _ => Err(PipelineError::Dispatch(format!("HTTP {}: {}", status, body.trim()))),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint_url("10.0.0.3", 5000), "http://10.0.0.3:5000/rna_seq_analysis");
        assert_eq!(endpoint_url("https://api.lab.org/", 5000), "https://api.lab.org/rna_seq_analysis");
    }

    #[test]
    fn test_response_wire_format() -> anyhow::Result<()> {
        let response = RunResponse::failed("hisat2 exited with status 1", Some(Stage::Aligning), Some("s2".to_string()));
        let value = serde_json::to_value(&response)?;
        assert_eq!(value["status"], "failed");
        assert_eq!(value["stage"], "Aligning");
        assert_eq!(value["sample"], "s2");

        let parsed: RunResponse = serde_json::from_str(r#"{"status":"completed","message":"done"}"#)?;
        assert_eq!(parsed, RunResponse::completed("done"));
        Ok(())
    }

    async fn serve_fixed(status: u16, body: &'static str) -> anyhow::Result<HttpDispatcher> {
        use axum::http::StatusCode;
        use axum::routing::post;
        let code = StatusCode::from_u16(status)?;
        let app = axum::Router::new().route(API_ROUTE, post(move || async move { (code, body) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(HttpDispatcher::new("127.0.0.1", port)?)
    }

    fn request() -> anyhow::Result<RunRequest> {
        Ok(serde_json::from_value(serde_json::json!({
            "sample_name_list": ["s1"],
            "grouping_list": ["saline"],
            "chr_and_length": "chr_length.csv",
            "gtf": "genomic.gtf",
            "reference_genome": "genome.fna",
            "sequencing_type": 1,
            "fastq_list": ["s1.fastq"],
            "index_prefix": "index_prefix",
            "cpu_num": 1,
            "target_path": "/data/runs",
            "file_name": "12345678"
        }))?)
    }

    #[tokio::test]
    async fn test_non_2xx_without_run_response_is_dispatch_error() -> anyhow::Result<()> {
        let dispatcher = serve_fixed(502, "upstream down").await?;
        let err = dispatcher.submit(&request()?).await.unwrap_err();
        assert!(matches!(err, PipelineError::Dispatch(ref msg) if msg.contains("502") && msg.contains("upstream down")));
        Ok(())
    }

    #[tokio::test]
    async fn test_non_2xx_claiming_completion_is_dispatch_error() -> anyhow::Result<()> {
        let dispatcher = serve_fixed(500, r#"{"status":"completed","message":"done"}"#).await?;
        assert!(matches!(dispatcher.submit(&request()?).await, Err(PipelineError::Dispatch(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_run_response_is_returned() -> anyhow::Result<()> {
        let dispatcher =
            serve_fixed(500, r#"{"status":"failed","message":"hisat2 crashed","stage":"Aligning","sample":"s1"}"#).await?;
        let response = dispatcher.submit(&request()?).await?;
        assert_eq!(response.status, RunStatus::Failed);
        assert_eq!(response.stage.as_deref(), Some("Aligning"));
        Ok(())
    }
}
