//! Client side of a run: upload inputs to the compute host, then hand the
//! run request to the API server exactly once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use log::{error, info};
use rand::rngs::StdRng;
use crate::config::defs::{PipelineError, RunConfig};
use crate::config::manifest::{ClientSettings, PipelineManifest};
use crate::utils::dispatch::{HttpDispatcher, JobSubmitter, RunResponse, RunStatus};
use crate::utils::invoker::{ProcessInvoker, ToolInvoker};
use crate::utils::system::{generate_rng, generate_run_id};
use crate::utils::transfer::{transfer, Credentials, RemoteHost, RemoteTransport, RetryPolicy, ScpTransport, TransferJob, TransferOutcome};


/// Uploads `files` into `remote_dir` one after another. Every file gets its
/// full retry budget even after an earlier one has failed; the batch only
/// succeeds when all of them arrived.
///
/// # Arguments
///
/// * `transport` - Remote copy implementation.
/// * `host` - Target host and login.
/// * `files` - Local files, uploaded under their own file names.
/// * `remote_dir` - Existing remote directory.
/// * `policy` - Per-file retry policy.
///
/// # Returns
/// Per-file outcomes in input order, or PipelineError::BatchIncomplete
/// naming every file that did not arrive.
pub async fn upload_batch(
    transport: &dyn RemoteTransport,
    host: &RemoteHost,
    files: &[PathBuf],
    remote_dir: &str,
    policy: RetryPolicy,
) -> Result<Vec<TransferOutcome>, PipelineError> {
    let mut outcomes = Vec::with_capacity(files.len());
    let mut failed = Vec::new();

    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::InvalidConfig(format!("not a file path: {}", file.display())))?;
        let destination = format!("{}/{}", remote_dir.trim_end_matches('/'), name);
        let outcome = transfer(transport, TransferJob::new(file.clone(), destination, host.clone(), policy)).await;
        if let TransferOutcome::ExhaustedRetries { attempts, last_error } = &outcome {
            error!("{}", PipelineError::TransferExhausted {
                file: name.clone(),
                attempts: *attempts,
                error: last_error.clone(),
            });
            failed.push(name);
        }
        outcomes.push(outcome);
    }

    if !failed.is_empty() {
        return Err(PipelineError::BatchIncomplete { files: failed });
    }
    info!("Uploaded {} file(s) to {}", outcomes.len(), remote_dir);
    Ok(outcomes)
}


fn remote_host(settings: &ClientSettings) -> RemoteHost {
    RemoteHost {
        address: settings.ssh_server_ip.clone(),
        port: settings.ssh_port,
        credentials: Credentials {
            username: settings.username.clone(),
            password: settings.password.clone(),
            identity_file: settings.identity_file.as_ref().map(PathBuf::from),
        },
    }
}


/// Full client flow for one run: pick a run id, validate the request,
/// create the remote run directory, upload every source file, then dispatch.
/// Nothing is dispatched unless the whole batch arrived.
pub async fn submit(
    mut settings: ClientSettings,
    transport: &dyn RemoteTransport,
    submitter: &dyn JobSubmitter,
    rng: &mut StdRng,
) -> Result<RunResponse, PipelineError> {
    let run_id = generate_run_id(rng);
    settings.request.file_name = run_id.clone();
    info!("Run id {}", run_id);

    // Catch malformed requests before anything is copied
    PipelineManifest::from_request(&settings.request, settings.request.cpu_num.max(1))?;

    let host = remote_host(&settings);
    let run_dir = settings.request.run_dir();
    transport.ensure_dir(&host, &run_dir).await?;

    let files: Vec<PathBuf> = settings.source_file_list.iter().map(PathBuf::from).collect();
    let policy = RetryPolicy {
        max_retries: settings.max_retries.max(1),
        retry_delay: Duration::from_secs(settings.retry_delay_secs),
    };
    upload_batch(transport, &host, &files, &run_dir, policy).await?;

    let response = submitter.submit(&settings.request).await?;
    match response.status {
        RunStatus::Completed => info!("Run {} completed: {}", run_id, response.message),
        RunStatus::Failed => error!(
            "Run {} failed{}{}: {}",
            run_id,
            response.stage.as_ref().map(|s| format!(" at {}", s)).unwrap_or_default(),
            response.sample.as_ref().map(|s| format!(" for sample {}", s)).unwrap_or_default(),
            response.message
        ),
    }
    Ok(response)
}


/// `submit` module entry point.
pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let path = config
        .args
        .settings
        .as_ref()
        .ok_or_else(|| PipelineError::InvalidConfig("--settings <client settings JSON> is required".to_string()))?;
    let settings = read_settings(Path::new(path)).await?;

    let invoker: Arc<dyn ToolInvoker> = Arc::new(ProcessInvoker::new(config.tool_timeout));
    let transport = ScpTransport::new(invoker);
    let dispatcher = HttpDispatcher::new(&settings.api_serve_ip, settings.api_port)?;
    let mut rng = generate_rng(config.args.seed);

    let response = submit(settings, &transport, &dispatcher, &mut rng).await?;
    match response.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Failed => Err(PipelineError::Dispatch(format!("server reported failure: {}", response.message))),
    }
}

pub async fn read_settings(path: &Path) -> Result<ClientSettings, PipelineError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PipelineError::IOError(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&raw).map_err(|e| PipelineError::InvalidConfig(format!("{}: {}", path.display(), e)))
}
