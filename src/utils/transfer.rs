//! Reliable single-file upload with bounded, fixed-delay retries.
//!
//! Every attempt opens a fresh connection. A connection that failed once
//! is never reused, so a retry never inherits a half-open session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use log::{error, info, warn};
use tokio::time::sleep;
use crate::config::defs::{PipelineError, SCP_TAG, SSHPASS_TAG, SSH_TAG};
use crate::utils::command::ToolCommand;
use crate::utils::invoker::{run_tool, ToolInvoker};


#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteHost {
    pub address: String,
    pub port: u16,
    pub credentials: Credentials,
}

impl RemoteHost {
    fn login(&self) -> String {
        format!("{}@{}", self.credentials.username, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

/// One file on its way to the remote host. Consumed by `transfer`.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub source: PathBuf,
    pub destination: String,
    pub host: RemoteHost,
    pub policy: RetryPolicy,
    attempts: u32,
}

impl TransferJob {
    pub fn new(source: PathBuf, destination: String, host: RemoteHost, policy: RetryPolicy) -> Self {
        TransferJob { source, destination, host, policy, attempts: 0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Succeeded { attempts: u32 },
    ExhaustedRetries { attempts: u32, last_error: String },
}

impl TransferOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, TransferOutcome::Succeeded { .. })
    }
}


/// Remote copy primitive. Each call is one complete connect, copy,
/// disconnect cycle.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Creates `dir` on the host; an existing directory is not an error.
    async fn ensure_dir(&self, host: &RemoteHost, dir: &str) -> Result<(), PipelineError>;

    async fn put(&self, host: &RemoteHost, source: &Path, destination: &str) -> Result<(), PipelineError>;
}


/// Uploads one file, retrying up to `max_retries` attempts in total with a
/// fixed `retry_delay` between attempts. Exhaustion is returned as an
/// outcome so a batch can carry on with its remaining files.
///
/// # Arguments
///
/// * `transport` - Connection-per-attempt copy implementation.
/// * `job` - File, destination, host and retry policy.
///
/// # Returns
/// TransferOutcome::Succeeded or TransferOutcome::ExhaustedRetries.
pub async fn transfer(transport: &dyn RemoteTransport, mut job: TransferJob) -> TransferOutcome {
    let source = job.source.display().to_string();
    let mut last_error = String::from("no attempt made");

    while job.attempts < job.policy.max_retries {
        job.attempts += 1;
        info!("Uploading {} (attempt {}/{})", source, job.attempts, job.policy.max_retries);
        match transport.put(&job.host, &job.source, &job.destination).await {
            Ok(()) => {
                info!("Uploaded {} to {}", source, job.destination);
                return TransferOutcome::Succeeded { attempts: job.attempts };
            }
            Err(e) => {
                warn!("Upload of {} failed: {}", source, e);
                last_error = e.to_string();
                if job.attempts < job.policy.max_retries {
                    info!("Retrying in {} seconds", job.policy.retry_delay.as_secs());
                    sleep(job.policy.retry_delay).await;
                }
            }
        }
    }

    error!("Giving up on {} after {} attempt(s)", source, job.attempts);
    TransferOutcome::ExhaustedRetries { attempts: job.attempts, last_error }
}


/// Drives the system OpenSSH client. One child process per call means one
/// connection per attempt. Password logins go through `sshpass -e` so the
/// secret travels in the environment rather than on the command line.
pub struct ScpTransport {
    invoker: Arc<dyn ToolInvoker>,
}

impl ScpTransport {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        ScpTransport { invoker }
    }

    fn wrap(&self, host: &RemoteHost, program: &str, port_flag: &str, tail: Vec<String>) -> ToolCommand {
        let mut args = vec![
            port_flag.to_string(),
            host.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(identity) = &host.credentials.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }
        match &host.credentials.password {
            Some(password) => ToolCommand::new(SSHPASS_TAG)
                .arg("-e")
                .arg(program)
                .args(args)
                .args(tail)
                .env("SSHPASS", password),
            None => ToolCommand::new(program)
                .args(["-o", "BatchMode=yes"])
                .args(args)
                .args(tail),
        }
    }

    pub fn mkdir_command(&self, host: &RemoteHost, dir: &str) -> ToolCommand {
        self.wrap(host, SSH_TAG, "-p", vec![host.login(), "mkdir".to_string(), "-p".to_string(), dir.to_string()])
    }

    pub fn put_command(&self, host: &RemoteHost, source: &Path, destination: &str) -> ToolCommand {
        self.wrap(
            host,
            SCP_TAG,
            "-P",
            vec![
                source.to_string_lossy().to_string(),
                format!("{}:{}", host.login(), destination),
            ],
        )
    }
}

#[async_trait]
impl RemoteTransport for ScpTransport {
    async fn ensure_dir(&self, host: &RemoteHost, dir: &str) -> Result<(), PipelineError> {
        run_tool(self.invoker.as_ref(), &self.mkdir_command(host, dir)).await?;
        Ok(())
    }

    async fn put(&self, host: &RemoteHost, source: &Path, destination: &str) -> Result<(), PipelineError> {
        if !source.is_file() {
            return Err(PipelineError::MissingInput(source.to_path_buf()));
        }
        run_tool(self.invoker.as_ref(), &self.put_command(host, source, destination)).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;
    use crate::utils::invoker::ProcessInvoker;

    /// Fails every attempt before `succeed_on`; never succeeds when None.
    struct FlakyTransport {
        attempts: AtomicU32,
        succeed_on: Option<u32>,
    }

    #[async_trait]
    impl RemoteTransport for FlakyTransport {
        async fn ensure_dir(&self, _host: &RemoteHost, _dir: &str) -> Result<(), PipelineError> {
            Ok(())
        }

        async fn put(&self, _host: &RemoteHost, _source: &Path, _destination: &str) -> Result<(), PipelineError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.succeed_on {
                Some(k) if attempt >= k => Ok(()),
                _ => Err(PipelineError::IOError("connection reset".to_string())),
            }
        }
    }

    fn host(password: Option<&str>) -> RemoteHost {
        RemoteHost {
            address: "10.0.0.2".to_string(),
            port: 2222,
            credentials: Credentials {
                username: "seq".to_string(),
                password: password.map(str::to_string),
                identity_file: None,
            },
        }
    }

    fn job(max_retries: u32, delay_secs: u64) -> TransferJob {
        TransferJob::new(
            PathBuf::from("s1.fastq"),
            "/data/runs/1/s1.fastq".to_string(),
            host(None),
            RetryPolicy { max_retries, retry_delay: Duration::from_secs(delay_secs) },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_makes_n_attempts_with_n_minus_one_delays() {
        for n in 1..=4u32 {
            let transport = FlakyTransport { attempts: AtomicU32::new(0), succeed_on: None };
            let start = Instant::now();
            let outcome = transfer(&transport, job(n, 30)).await;

            assert_eq!(transport.attempts.load(Ordering::SeqCst), n);
            assert!(matches!(outcome, TransferOutcome::ExhaustedRetries { attempts, .. } if attempts == n));
            assert_eq!(start.elapsed(), Duration::from_secs(30 * (n as u64 - 1)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_attempt_k_stops_retrying() {
        let transport = FlakyTransport { attempts: AtomicU32::new(0), succeed_on: Some(3) };
        let start = Instant::now();
        let outcome = transfer(&transport, job(5, 10)).await;

        assert_eq!(outcome, TransferOutcome::Succeeded { attempts: 3 });
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success_has_no_delay() {
        let transport = FlakyTransport { attempts: AtomicU32::new(0), succeed_on: Some(1) };
        let start = Instant::now();
        let outcome = transfer(&transport, job(5, 10)).await;
        assert!(outcome.succeeded());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_error_reported() {
        let transport = FlakyTransport { attempts: AtomicU32::new(0), succeed_on: None };
        match transfer(&transport, job(2, 1)).await {
            TransferOutcome::ExhaustedRetries { last_error, .. } => assert!(last_error.contains("connection reset")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_scp_commands() {
        let transport = ScpTransport::new(Arc::new(ProcessInvoker::default()));
        let put = transport.put_command(&host(None), Path::new("s1.fastq"), "/data/runs/1/s1.fastq");
        assert_eq!(put.program, "scp");
        assert_eq!(put.args.last().unwrap(), "seq@10.0.0.2:/data/runs/1/s1.fastq");
        assert!(put.args.windows(2).any(|w| w[0] == "-P" && w[1] == "2222"));
        assert!(put.envs.is_empty());

        let mkdir = transport.mkdir_command(&host(Some("hunter2")), "/data/runs/1");
        assert_eq!(mkdir.program, "sshpass");
        assert_eq!(&mkdir.args[..2], &["-e".to_string(), "ssh".to_string()]);
        assert!(!mkdir.args.iter().any(|a| a.contains("hunter2")));
        assert_eq!(mkdir.envs, vec![("SSHPASS".to_string(), "hunter2".to_string())]);
        assert_eq!(&mkdir.args[mkdir.args.len() - 3..], &["mkdir", "-p", "/data/runs/1"]);
    }
}
