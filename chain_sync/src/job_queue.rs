use std::future::Future;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt as _;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

type JobFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Job {
    name: String,
    run: JobFn,
}

/// Runs jobs one after another on a single worker task.
///
/// A failing job is started again up to `max_retries` times. When it still
/// fails the error is logged and the worker moves on to the next job.
pub struct JobQueue {
    name: String,
    sender: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    /// Creates the queue and spawns its worker. The worker stops once the
    /// queue is dropped and every pushed job has run.
    pub fn spawn(name: impl Into<String>, max_retries: usize) -> (Self, JoinHandle<()>) {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(name.clone(), receiver, max_retries));
        (Self { name, sender }, worker)
    }

    pub fn push<F, Fut>(&self, name: impl Into<String>, job: F) -> anyhow::Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job = Job {
            name: name.into(),
            run: Box::new(move || job().boxed()),
        };
        self.sender
            .send(job)
            .map_err(|_| anyhow!("job queue {} is closed", self.name))
    }
}

async fn run_worker(queue: String, mut receiver: mpsc::UnboundedReceiver<Job>, max_retries: usize) {
    while let Some(job) = receiver.recv().await {
        let mut attempt = 0;
        loop {
            match (job.run)().await {
                Ok(()) => {
                    trace!(queue = %queue, job = %job.name, "job done");
                    break;
                }
                Err(err) if attempt < max_retries => {
                    attempt += 1;
                    warn!(queue = %queue, job = %job.name, attempt, "job failed, retrying: {err:#}");
                }
                Err(err) => {
                    error!(queue = %queue, job = %job.name, "job failed after {attempt} retries: {err:#}");
                    break;
                }
            }
        }
    }
}
