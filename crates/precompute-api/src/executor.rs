//! Store executor for non-blocking storage operations.
//!
//! `SQLite` calls block, so every store operation runs on one of a small pool
//! of worker threads, each owning its own connection. Async callers hand a
//! closure over and await the result through a oneshot channel; no lock is
//! ever held across an await point.
//!
//! ```ignore
//! let executor = StoreExecutor::start(&config.store)?;
//! let claims = executor.run(|store| store.list_claims()).await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;

use precompute_core::{KernelError, StoreConfig};
use precompute_store_sqlite::SqliteStore;
use tokio::sync::oneshot;
use tracing::{debug, error};

type StoreJob = Box<dyn FnOnce(&mut SqliteStore) + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0:#}")]
    Store(anyhow::Error),
    #[error("store executor channel closed; executor may have shut down")]
    ChannelClosed,
}

impl From<ExecutorError> for KernelError {
    fn from(err: ExecutorError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Pool of store worker threads sharing one job queue.
pub struct StoreExecutor {
    db_path: PathBuf,
    sender: Mutex<Option<mpsc::Sender<StoreJob>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for StoreExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreExecutor").field("db_path", &self.db_path).finish_non_exhaustive()
    }
}

impl StoreExecutor {
    /// Open `config.workers` connections, apply pending migrations and start the workers.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn start(config: &StoreConfig) -> anyhow::Result<Self> {
        let mut stores = Vec::with_capacity(config.workers);
        for _ in 0..config.workers.max(1) {
            stores.push(SqliteStore::open(&config.path)?);
        }
        if let Some(first) = stores.first_mut() {
            first.migrate()?;
        }

        let (sender, receiver) = mpsc::channel::<StoreJob>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(stores.len());
        for (index, mut store) in stores.into_iter().enumerate() {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("precompute-store-{index}"))
                .spawn(move || loop {
                    let job = {
                        let queue = receiver.lock().unwrap_or_else(PoisonError::into_inner);
                        queue.recv()
                    };
                    match job {
                        Ok(job) => job(&mut store),
                        Err(_) => break,
                    }
                })?;
            workers.push(handle);
        }
        debug!(path = %config.path.display(), workers = workers.len(), "store executor started");

        Ok(Self {
            db_path: config.path.clone(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run a store operation on a worker thread.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Store`] when the operation fails and
    /// [`ExecutorError::ChannelClosed`] after shutdown.
    pub async fn try_run<F, T>(&self, op: F) -> Result<T, ExecutorError>
    where
        F: FnOnce(&mut SqliteStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        let job: StoreJob = Box::new(move |store| {
            // The caller may have gone away; the result is dropped in that case.
            let _ = response_tx.send(op(store));
        });

        {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(sender) = sender.as_ref() else {
                return Err(ExecutorError::ChannelClosed);
            };
            sender.send(job).map_err(|_| ExecutorError::ChannelClosed)?;
        }

        response_rx.await.map_err(|_| ExecutorError::ChannelClosed)?.map_err(ExecutorError::Store)
    }

    /// [`StoreExecutor::try_run`] with errors mapped to [`KernelError::Storage`].
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when the operation fails or the executor is shut down.
    pub async fn run<F, T>(&self, op: F) -> Result<T, KernelError>
    where
        F: FnOnce(&mut SqliteStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.try_run(op).await.map_err(KernelError::from)
    }

    /// Stop accepting work, let queued jobs drain and join the workers. Blocks.
    pub fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        let workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if worker.join().is_err() {
                error!(path = %self.db_path.display(), "store worker panicked");
            }
        }
    }
}

impl Drop for StoreExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
