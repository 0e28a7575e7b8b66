// Thread affinity hand-off
//
// Host project calls must run on one designated thread; blocking file work runs
// on the tokio blocking pool. Both are explicit calls so the affinity is visible
// at every call site.

use std::marker::PhantomData;
use std::sync::mpsc;
use std::thread;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from handing work to another thread
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Host thread has shut down")]
    HostThreadGone,

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("Failed to spawn host thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Proof of running on the host thread.
///
/// Only [`HostThread`] creates it and it is neither `Send` nor `Sync`, so any
/// function taking `&HostContext` can only be called from a host job.
pub struct HostContext {
    _not_send: PhantomData<*const ()>,
}

type Job = Box<dyn FnOnce(&HostContext) + Send + 'static>;

/// Dedicated OS thread executing host jobs in submission order.
pub struct HostThread {
    tx: mpsc::Sender<Job>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HostThread {
    /// Spawn the host thread.
    pub fn spawn(name: &str) -> Result<Self, SchedulerError> {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let cx = HostContext {
                _not_send: PhantomData,
            };
            while let Ok(job) = rx.recv() {
                job(&cx);
            }
            tracing::debug!("Host thread exiting");
        })?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Run `f` on the host thread and await its result.
    pub async fn run<F, R>(&self, f: F) -> Result<R, SchedulerError>
    where
        F: FnOnce(&HostContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move |cx| {
            let _ = result_tx.send(f(cx));
        });

        self.tx.send(job).map_err(|_| SchedulerError::HostThreadGone)?;
        result_rx.await.map_err(|_| SchedulerError::HostThreadGone)
    }
}

impl Drop for HostThread {
    fn drop(&mut self) {
        // Closing the channel ends the loop; don't join from inside the host thread itself
        let (tx, _) = mpsc::channel();
        drop(std::mem::replace(&mut self.tx, tx));
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Run blocking work (file I/O, process setup) on the worker pool.
pub async fn run_on_worker<F, R>(f: F) -> Result<R, SchedulerError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}
