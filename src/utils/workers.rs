// src/utils/workers.rs: fan-out/fan-in task group

use std::future::Future;
use anyhow::anyhow;
use futures::future::join_all;
use log::debug;
use tokio::task::JoinHandle;
use crate::config::defs::PipelineError;


/// A group of independently spawned workers with a join-all barrier.
///
/// Every worker runs to completion; one worker failing does not cancel its
/// siblings. `join_all` only returns once every worker has terminated, so
/// callers may safely read anything the workers wrote after it resolves.
pub struct TaskGroup<T> {
    handles: Vec<(String, JoinHandle<Result<T, PipelineError>>)>,
}

/// Terminal state of one worker, labelled as it was spawned.
#[derive(Debug)]
pub struct WorkerReport<T> {
    pub label: String,
    pub result: Result<T, PipelineError>,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new() -> Self {
        TaskGroup { handles: Vec::new() }
    }

    pub fn spawn<F>(&mut self, label: impl Into<String>, worker: F)
    where
        F: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let label = label.into();
        debug!("Spawning worker {}", label);
        self.handles.push((label, tokio::spawn(worker)));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker. Reports come back in spawn order regardless
    /// of completion order; a panicking worker becomes an Err report.
    pub async fn join_all(self) -> Vec<WorkerReport<T>> {
        let (labels, handles): (Vec<String>, Vec<_>) = self.handles.into_iter().unzip();
        let joined = join_all(handles).await;
        labels
            .into_iter()
            .zip(joined)
            .map(|(label, joined)| {
                let result = match joined {
                    Ok(result) => result,
                    Err(e) => Err(PipelineError::Other(anyhow!("worker {} did not finish: {}", label, e))),
                };
                WorkerReport { label, result }
            })
            .collect()
    }
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}
