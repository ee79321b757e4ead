//! Background runner for post-operation notifications.
//!
//! Callbacks queue completed changes here and return; the worker thread
//! feeds them to the modified-paths database.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::FilterError;

/// Completed change to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundTask {
    /// File was created.
    FileCreated(String),
    /// File was modified.
    FileModified(String),
    /// File was deleted.
    FileDeleted(String),
    /// File was renamed.
    FileRenamed { old_path: String, new_path: String },
    /// Folder was created.
    FolderCreated(String),
    /// Folder was deleted.
    FolderDeleted(String),
    /// Folder was renamed.
    FolderRenamed { old_path: String, new_path: String },
}

/// Queue state shared with the worker.
#[derive(Default)]
struct QueueState {
    /// Pending tasks.
    tasks: VecDeque<BackgroundTask>,
    /// Tasks queued but not yet fully handled.
    outstanding: usize,
    /// Set when the runner is shutting down.
    shutdown: bool,
}

/// Runs queued tasks on a dedicated thread.
pub struct BackgroundTaskRunner {
    /// Queue plus wakeup for the worker and for idle waiters.
    shared: Arc<(Mutex<QueueState>, Condvar)>,
    /// Worker thread.
    thread: Option<JoinHandle<()>>,
}

impl BackgroundTaskRunner {
    /// Create new background task runner.
    ///
    /// # Arguments
    /// * `handler` - Function to handle tasks
    pub fn new<F>(handler: F) -> Result<Self, FilterError>
    where
        F: Fn(BackgroundTask) + Send + 'static,
    {
        let shared = Arc::new((Mutex::new(QueueState::default()), Condvar::new()));
        let worker_shared = shared.clone();

        let thread: JoinHandle<()> = thread::Builder::new()
            .name("projection-background".to_string())
            .spawn(move || {
                let (lock, cvar) = &*worker_shared;
                loop {
                    let task: BackgroundTask = {
                        let mut state = lock.lock();
                        loop {
                            if let Some(task) = state.tasks.pop_front() {
                                break task;
                            }
                            if state.shutdown {
                                return;
                            }
                            cvar.wait(&mut state);
                        }
                    };

                    handler(task);

                    let mut state = lock.lock();
                    state.outstanding -= 1;
                    if state.outstanding == 0 {
                        cvar.notify_all();
                    }
                }
            })
            .map_err(|e| FilterError::Worker(e.to_string()))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Enqueue a task.
    ///
    /// # Arguments
    /// * `task` - Task to enqueue
    pub fn enqueue(&self, task: BackgroundTask) {
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock();
        if state.shutdown {
            tracing::warn!("Dropping background task after shutdown: {:?}", task);
            return;
        }
        state.tasks.push_back(task);
        state.outstanding += 1;
        cvar.notify_all();
    }

    /// Check if every queued task has been handled.
    pub fn is_empty(&self) -> bool {
        self.shared.0.lock().outstanding == 0
    }

    /// Block until every queued task has been handled.
    ///
    /// # Returns
    /// False if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline: Instant = Instant::now() + timeout;
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock();
        while state.outstanding > 0 {
            if cvar.wait_until(&mut state, deadline).timed_out() {
                return state.outstanding == 0;
            }
        }
        true
    }

    /// Shutdown the runner after draining queued tasks.
    pub fn shutdown(&mut self) {
        {
            let (lock, cvar) = &*self.shared;
            lock.lock().shutdown = true;
            cvar.notify_all();
        }

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for BackgroundTaskRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_background_task_runner() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let runner = BackgroundTaskRunner::new(move |_task| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        runner.enqueue(BackgroundTask::FileCreated("test.txt".to_string()));
        runner.enqueue(BackgroundTask::FileModified("test.txt".to_string()));

        assert!(runner.wait_idle(Duration::from_secs(5)));
        assert!(runner.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let runner = BackgroundTaskRunner::new(move |_task| {
            thread::sleep(Duration::from_millis(10));
            counter_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for i in 0..3 {
            runner.enqueue(BackgroundTask::FileDeleted(format!("{}.txt", i)));
        }
        drop(runner);

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_enqueue_after_shutdown_is_dropped() {
        let mut runner = BackgroundTaskRunner::new(|_task| {}).unwrap();
        runner.shutdown();
        runner.enqueue(BackgroundTask::FolderCreated("dir".to_string()));
        assert!(runner.is_empty());
    }
}
