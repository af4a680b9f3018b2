use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};

/// Owns the background supervision tasks (creation and shutdown workflows,
/// periodic jobs). Tasks are detached from the request that started them but
/// observe a process-wide shutdown signal, so the process can drain them.
#[derive(Clone)]
pub struct TaskSupervisor {
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    // Set when draining starts; `shutdown` flips once tasks get interrupted.
    draining: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count even when the task panics.
struct TaskSlot {
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Resolves once the shutdown flag is set. Never resolves if the sender is gone.
pub async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            draining: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(tx),
        }
    }

    /// Runs `task` in the background until it completes or shutdown is signalled.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let slot = TaskSlot {
            in_flight: self.in_flight.clone(),
            idle: self.idle.clone(),
        };
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let _slot = slot;
            if *shutdown.borrow() {
                tracing::warn!(task = name, "not started: shutting down");
                return;
            }
            tokio::select! {
                _ = task => {}
                _ = stopped(&mut shutdown) => {
                    tracing::warn!(task = name, "interrupted by shutdown");
                }
            }
        });
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// True from the moment `shutdown` is called, drain period included.
    pub fn is_shutting_down(&self) -> bool {
        self.draining.load(Ordering::SeqCst) || *self.shutdown.borrow()
    }

    /// Receiver flipping to `true` once shutdown starts. Periodic jobs select on it.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Resolves once no supervised task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Lets in-flight tasks finish for up to `grace`, then interrupts the rest.
    pub async fn shutdown(&self, grace: Duration) {
        self.draining.store(true, Ordering::SeqCst);
        let pending = self.in_flight();
        tracing::info!(pending, "draining supervision tasks");
        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            tracing::warn!(
                pending = self.in_flight(),
                "drain timed out; interrupting remaining tasks"
            );
        }
        self.shutdown.send_replace(true);
        // Interrupted tasks unwind at their next await point.
        let _ = tokio::time::timeout(Duration::from_secs(1), self.wait_idle()).await;
    }
}
