//! Async executor for bridging synchronous filter callbacks with the async
//! backing store.
//!
//! Filter callbacks run on host threads that must not block a Tokio worker.
//! The executor owns a dedicated runtime on its own thread; callers submit a
//! future and wait on a typed oneshot channel.
//!
//! # Architecture
//!
//! ```text
//! Callback Thread                Executor Thread
//! ───────────────                ───────────────
//!     │                               │
//!     │ submit(future) ──────────────►│
//!     │                               │ spawn task
//!     │ blocking_recv() ◄─────────────│ send result
//!     │                               │
//! ```
//!
//! Must not be called from inside the executor's own runtime.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::VfsError;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during executor operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The executor has been shut down or the background thread died.
    Shutdown,
    /// The operation was cancelled.
    Cancelled,
    /// The operation timed out.
    Timeout {
        /// The timeout duration that was exceeded.
        duration: Duration,
    },
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::Shutdown => write!(f, "Executor has been shut down"),
            ExecutorError::Cancelled => write!(f, "Operation was cancelled"),
            ExecutorError::Timeout { duration } => {
                write!(f, "Operation timed out after {:?}", duration)
            }
        }
    }
}

impl std::error::Error for ExecutorError {}

impl From<ExecutorError> for VfsError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Timeout { duration } => VfsError::Timeout(duration),
            ExecutorError::Cancelled | ExecutorError::Shutdown => VfsError::Cancelled,
        }
    }
}

/// Type-erased work item for the executor queue.
///
/// The result travels through a typed oneshot captured in the future.
struct WorkItem {
    work: BoxFuture<'static, ()>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the async executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of Tokio worker threads.
    pub worker_threads: usize,
    /// Channel buffer size for work submission.
    pub queue_size: usize,
    /// Default timeout for `block_on` (None = no timeout).
    pub default_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            queue_size: 1024,
            default_timeout: None,
        }
    }
}

impl ExecutorConfig {
    /// Set the number of worker threads.
    ///
    /// # Arguments
    /// * `worker_threads` - Number of Tokio worker threads
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }

    /// Set the submission queue size.
    ///
    /// # Arguments
    /// * `queue_size` - Channel buffer size for work submission
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }

    /// Set default timeout for operations.
    ///
    /// # Arguments
    /// * `timeout` - Default timeout duration (None = no timeout)
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }
}

// ============================================================================
// Async Executor
// ============================================================================

/// Async executor that runs in a dedicated background thread.
pub struct AsyncExecutor {
    /// Channel to submit async work.
    tx: mpsc::Sender<WorkItem>,
    /// Root cancellation token; per-operation tokens are its children.
    cancel_token: CancellationToken,
    /// Handle to the background thread.
    thread: Option<JoinHandle<()>>,
    /// Whether the executor is still running.
    running: Arc<AtomicBool>,
    /// Default timeout for operations.
    default_timeout: Option<Duration>,
}

impl AsyncExecutor {
    /// Create a new executor with a dedicated runtime thread.
    ///
    /// # Arguments
    /// * `config` - Executor configuration
    ///
    /// # Returns
    /// Running executor, or an IO error if the runtime or thread could not
    /// be created.
    pub fn new(config: ExecutorConfig) -> Result<Self, VfsError> {
        let (tx, rx) = mpsc::channel::<WorkItem>(config.queue_size);
        let cancel_token = CancellationToken::new();
        let token_clone: CancellationToken = cancel_token.clone();
        let running = Arc::new(AtomicBool::new(true));
        let running_clone: Arc<AtomicBool> = running.clone();

        let rt: tokio::runtime::Runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("projection-io-worker")
            .enable_all()
            .build()?;

        let thread: JoinHandle<()> = std::thread::Builder::new()
            .name("projection-executor".to_string())
            .spawn(move || {
                rt.block_on(async move {
                    let mut rx: mpsc::Receiver<WorkItem> = rx;

                    loop {
                        tokio::select! {
                            biased;

                            _ = token_clone.cancelled() => break,
                            item = rx.recv() => {
                                match item {
                                    Some(work_item) => {
                                        tokio::spawn(work_item.work);
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                });

                running_clone.store(false, Ordering::Release);
                tracing::debug!("Executor thread stopped");
            })?;

        Ok(Self {
            tx,
            cancel_token,
            thread: Some(thread),
            running,
            default_timeout: config.default_timeout,
        })
    }

    /// Create executor with default settings.
    pub fn with_defaults() -> Result<Self, VfsError> {
        Self::new(ExecutorConfig::default())
    }

    /// Execute an async operation and block until complete.
    ///
    /// Applies the configured default timeout, if any.
    ///
    /// # Arguments
    /// * `future` - The async operation to execute
    pub fn block_on<F, T>(&self, future: F) -> Result<T, ExecutorError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match self.default_timeout {
            Some(timeout) => self.block_on_timeout(future, timeout),
            None => self.submit(future),
        }
    }

    /// Execute an async operation with an explicit timeout.
    ///
    /// # Arguments
    /// * `future` - The async operation to execute
    /// * `timeout` - Maximum time to wait for completion
    pub fn block_on_timeout<F, T>(&self, future: F, timeout: Duration) -> Result<T, ExecutorError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let wrapped = async move {
            tokio::time::timeout(timeout, future)
                .await
                .map_err(|_| ExecutorError::Timeout { duration: timeout })
        };
        self.submit(wrapped)?
    }

    /// Execute an async operation that stops when `token` (or the executor)
    /// is cancelled, or when `timeout` elapses.
    ///
    /// # Arguments
    /// * `future` - The async operation to execute
    /// * `timeout` - Maximum time to wait for completion
    /// * `token` - Per-operation cancellation token
    ///
    /// # Returns
    /// Ok(result) if completed, Err(Timeout) or Err(Cancelled) otherwise.
    pub fn block_on_cancellable_timeout<F, T>(
        &self,
        future: F,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<T, ExecutorError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let op_token: CancellationToken = token.clone();
        let root_token: CancellationToken = self.cancel_token.clone();

        let wrapped = async move {
            tokio::select! {
                biased;
                _ = op_token.cancelled() => Err(ExecutorError::Cancelled),
                _ = root_token.cancelled() => Err(ExecutorError::Cancelled),
                result = tokio::time::timeout(timeout, future) => {
                    result.map_err(|_| ExecutorError::Timeout { duration: timeout })
                }
            }
        };

        self.submit(wrapped)?
    }

    /// Token for one operation, cancelled with the executor.
    pub fn operation_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Cancel all in-flight operations and stop the executor.
    pub fn cancel_all(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the executor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Check if the executor is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn submit<F, T>(&self, future: F) -> Result<T, ExecutorError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.running.load(Ordering::Acquire) || self.cancel_token.is_cancelled() {
            return Err(ExecutorError::Shutdown);
        }

        let (result_tx, result_rx) = oneshot::channel::<T>();

        let work: BoxFuture<'static, ()> = async move {
            let result: T = future.await;
            // Caller may have given up.
            let _ = result_tx.send(result);
        }
        .boxed();

        if self.tx.blocking_send(WorkItem { work }).is_err() {
            return Err(ExecutorError::Shutdown);
        }

        result_rx.blocking_recv().map_err(|_| ExecutorError::Shutdown)
    }
}

impl Drop for AsyncExecutor {
    fn drop(&mut self) {
        self.cancel_token.cancel();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
