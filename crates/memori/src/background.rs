// crates/memori/src/background.rs
// Background executor: one persistent async runtime in a dedicated thread,
// bridging synchronous callers to async work. Lazy-started on first submit;
// pending work is cancelled on shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{MemoriError, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Executor statistics.
#[derive(Debug, Clone)]
pub struct ExecutorStats {
    pub running: bool,
    pub active_tasks: usize,
    pub thread_alive: bool,
}

/// Handle to a submitted task's result.
pub struct TaskHandle<T> {
    rx: std::sync::mpsc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task completes or the timeout elapses. A task that
    /// was cancelled by shutdown reports as cancelled.
    pub fn wait(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Err(MemoriError::Other(
                "background task did not finish within timeout".into(),
            )),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(MemoriError::Cancelled),
        }
    }

    /// Non-blocking poll for the result.
    pub fn try_wait(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

struct ExecutorInner {
    sender: mpsc::UnboundedSender<Job>,
    thread: std::thread::JoinHandle<()>,
}

/// Decrements the active-task counter when the task finishes, including on
/// cancellation.
struct ActiveGuard(Arc<Mutex<usize>>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut count = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
    }
}

/// Process-wide background executor. Cross-thread safe; usually held in an
/// `Arc` and shared by every component that schedules async work from sync
/// callers.
pub struct BackgroundExecutor {
    inner: Mutex<Option<ExecutorInner>>,
    active: Arc<Mutex<usize>>,
}

impl Default for BackgroundExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundExecutor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            active: Arc::new(Mutex::new(0)),
        }
    }

    fn start_locked(inner: &mut Option<ExecutorInner>) {
        if inner.is_some() {
            return;
        }

        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let thread = std::thread::Builder::new()
            .name("memori-background".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!(error = %e, "failed to build background runtime");
                        return;
                    }
                };

                runtime.block_on(async move {
                    // Receiving None means the sender was dropped: shutdown.
                    // Spawned jobs still in flight are cancelled when the
                    // runtime drops.
                    while let Some(job) = receiver.recv().await {
                        tokio::spawn(job);
                    }
                    debug!("background executor loop exited");
                });
            })
            .expect("failed to spawn background executor thread");

        info!("background executor started");
        *inner = Some(ExecutorInner { sender, thread });
    }

    /// Submit async work. Lazy-starts the runtime on first use. The
    /// caller receives a handle; results of dropped handles are discarded.
    ///
    /// Tenant context does not propagate here: jobs that need it must carry
    /// their `TenantContext` and re-set it at the start of execution.
    pub fn submit<F, T>(&self, fut: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::start_locked(&mut inner);

        {
            let mut count = self.active.lock().unwrap_or_else(|e| e.into_inner());
            *count += 1;
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let guard = ActiveGuard(self.active.clone());
        let job: Job = Box::pin(async move {
            let _guard = guard;
            let value = fut.await;
            let _ = tx.send(value);
        });

        if let Some(executor) = inner.as_ref() {
            if executor.sender.send(job).is_err() {
                warn!("background executor channel closed, task dropped");
            }
        }

        TaskHandle { rx }
    }

    /// Stop the runtime: cancels pending work and joins the thread, waiting
    /// up to `timeout` for it to exit.
    pub fn shutdown(&self, timeout: Duration) {
        let executor = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.take()
        };

        let Some(executor) = executor else {
            return;
        };

        info!("shutting down background executor");
        // Dropping the sender closes the channel and breaks the loop.
        drop(executor.sender);

        let deadline = Instant::now() + timeout;
        while !executor.thread.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        if executor.thread.is_finished() {
            let _ = executor.thread.join();
            info!("background executor stopped");
        } else {
            warn!(
                "background executor thread did not stop within {:?}",
                timeout
            );
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let active_tasks = *self.active.lock().unwrap_or_else(|e| e.into_inner());
        ExecutorStats {
            running: inner.is_some(),
            active_tasks,
            thread_alive: inner
                .as_ref()
                .map(|e| !e.thread.is_finished())
                .unwrap_or(false),
        }
    }
}

impl Drop for BackgroundExecutor {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_runs_and_returns_result() {
        let executor = BackgroundExecutor::new();
        let handle = executor.submit(async { 21 * 2 });
        assert_eq!(handle.wait(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_lazy_start() {
        let executor = BackgroundExecutor::new();
        assert!(!executor.stats().running);
        let handle = executor.submit(async { () });
        handle.wait(Duration::from_secs(5)).unwrap();
        assert!(executor.stats().running);
        assert!(executor.stats().thread_alive);
    }

    #[test]
    fn test_submit_from_multiple_threads() {
        let executor = Arc::new(BackgroundExecutor::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let executor = executor.clone();
            handles.push(std::thread::spawn(move || {
                executor.submit(async move { i * 10 }).wait(Duration::from_secs(5))
            }));
        }
        let mut results: Vec<i32> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        results.sort();
        assert_eq!(results, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[test]
    fn test_active_task_count_settles() {
        let executor = BackgroundExecutor::new();
        let handle = executor.submit(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        handle.wait(Duration::from_secs(5)).unwrap();
        // Completion callback decrements the counter.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(executor.stats().active_tasks, 0);
    }

    #[test]
    fn test_shutdown_stops_thread() {
        let executor = BackgroundExecutor::new();
        executor
            .submit(async { 1 })
            .wait(Duration::from_secs(5))
            .unwrap();
        executor.shutdown(Duration::from_secs(5));
        let stats = executor.stats();
        assert!(!stats.running);
        assert!(!stats.thread_alive);
    }

    #[test]
    fn test_shutdown_cancels_pending_work() {
        let executor = BackgroundExecutor::new();
        let handle = executor.submit(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "never"
        });
        // Give the job a moment to start, then shut down under it.
        std::thread::sleep(Duration::from_millis(50));
        executor.shutdown(Duration::from_secs(2));
        assert!(matches!(
            handle.wait(Duration::from_secs(1)),
            Err(MemoriError::Cancelled) | Err(MemoriError::Other(_))
        ));
    }

    #[test]
    fn test_submit_after_shutdown_restarts() {
        let executor = BackgroundExecutor::new();
        executor
            .submit(async { 1 })
            .wait(Duration::from_secs(5))
            .unwrap();
        executor.shutdown(Duration::from_secs(5));
        let handle = executor.submit(async { 2 });
        assert_eq!(handle.wait(Duration::from_secs(5)).unwrap(), 2);
    }
}
