use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::oidc::OidcFlows;
use crate::store::RefreshStore;

const QUEUE_CAPACITY: usize = 64;

/// Logout-time work that must not block the user's response.
#[derive(Debug)]
pub enum Job {
    /// Revoke a token with the provider.
    Revoke(String),
    /// Drop a session entry from the refresh store.
    DeleteSession(String),
    /// Stop the worker once the queue is empty.
    Shutdown,
}

/// Bounded queue with a single worker draining it. When the queue is full
/// (or the worker is gone) the job runs inline instead of being dropped, so
/// every enqueued job executes at least once.
#[derive(Clone)]
pub struct BackgroundQueue {
    tx: mpsc::Sender<Job>,
    provider: Arc<dyn OidcFlows>,
    store: Option<Arc<dyn RefreshStore>>,
}

impl BackgroundQueue {
    pub fn start(
        provider: Arc<dyn OidcFlows>,
        store: Option<Arc<dyn RefreshStore>>,
    ) -> (Self, actix_web::rt::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = {
            let provider = provider.clone();
            let store = store.clone();
            actix_web::rt::spawn(async move {
                while let Some(job) = rx.recv().await {
                    if matches!(job, Job::Shutdown) {
                        break;
                    }
                    run_job(job, &provider, &store).await;
                }
            })
        };
        (
            Self {
                tx,
                provider,
                store,
            },
            worker,
        )
    }

    pub async fn enqueue(&self, job: Job) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => {
                run_job(job, &self.provider, &self.store).await;
            }
        }
    }

    /// Ask the worker to finish outstanding jobs, waiting at most `deadline`.
    pub async fn drain(
        &self,
        worker: actix_web::rt::task::JoinHandle<()>,
        deadline: Duration,
    ) {
        let _ = self.tx.send(Job::Shutdown).await;
        if tokio::time::timeout(deadline, worker).await.is_err() {
            log::warn!("background queue did not drain before the deadline");
        }
    }
}

async fn run_job(job: Job, provider: &Arc<dyn OidcFlows>, store: &Option<Arc<dyn RefreshStore>>) {
    match job {
        Job::Revoke(token) => provider.revoke(&token).await,
        Job::DeleteSession(key) => {
            if let Some(backend) = store {
                if let Err(err) = backend.delete(&key).await {
                    log::warn!("unable to remove refresh token from store: {}", err);
                }
            }
        }
        Job::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc::MockOidcFlows;
    use crate::store::{MemoryStore, RefreshStore};

    #[actix_web::test]
    async fn jobs_run_on_the_worker() {
        let mut provider = MockOidcFlows::new();
        provider.expect_revoke().times(1).return_const(());
        let provider: Arc<dyn OidcFlows> = Arc::new(provider);

        let store = Arc::new(MemoryStore::default());
        store
            .put("gone", "ct", Duration::from_secs(60))
            .await
            .unwrap();
        let store_dyn: Arc<dyn RefreshStore> = store.clone();

        let (queue, worker) = BackgroundQueue::start(provider, Some(store_dyn));
        queue.enqueue(Job::Revoke("refresh".into())).await;
        queue.enqueue(Job::DeleteSession("gone".into())).await;
        queue.drain(worker, Duration::from_secs(5)).await;

        assert!(store.get("gone").await.is_err());
    }

    #[actix_web::test]
    async fn a_closed_queue_runs_jobs_inline() {
        let mut provider = MockOidcFlows::new();
        provider.expect_revoke().times(1).return_const(());
        let provider: Arc<dyn OidcFlows> = Arc::new(provider);

        let (queue, worker) = BackgroundQueue::start(provider, None);
        queue.drain(worker, Duration::from_secs(5)).await;
        // Worker is gone; the job still executes (inline fallback).
        queue.enqueue(Job::Revoke("refresh".into())).await;
    }
}
