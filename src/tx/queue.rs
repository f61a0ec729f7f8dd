//! Per-signer serial task queues
//!
//! Work for one payout signer runs strictly one job at a time on its own
//! worker; different signers run in parallel. Queues are created on first
//! use and live as long as the owning [`SignerQueues`].

use crate::error::{SwapError, SwapResult};

use dashmap::DashMap;
use futures::future::BoxFuture;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Job = BoxFuture<'static, ()>;

pub struct SignerQueues {
    capacity: usize,
    queues: DashMap<String, mpsc::Sender<Job>>,
}

impl SignerQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: DashMap::new(),
        }
    }

    /// Enqueue `job` behind earlier work for `key`. Waits while the queue is
    /// full. The receiver yields the job's output once it has run.
    pub async fn submit<T, F>(&self, key: &str, job: F) -> SwapResult<oneshot::Receiver<T>>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = done_tx.send(job.await);
        });

        self.sender(key)
            .send(job)
            .await
            .map_err(|_| SwapError::Internal(format!("signer queue {} closed", key)))?;
        Ok(done_rx)
    }

    fn sender(&self, key: &str) -> mpsc::Sender<Job> {
        self.queues
            .entry(key.to_string())
            .or_insert_with(|| {
                let (tx, mut rx) = mpsc::channel::<Job>(self.capacity);
                let name = key.to_string();
                tokio::spawn(async move {
                    debug!("Signer queue {} started", name);
                    while let Some(job) = rx.recv().await {
                        job.await;
                    }
                    debug!("Signer queue {} stopped", name);
                });
                tx
            })
            .clone()
    }

    /// Number of signer queues created so far
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
