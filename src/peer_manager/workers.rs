use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A group of tasks that are stopped and awaited together.
///
/// Every task gets a child of the group's stop token. Finished tasks are reaped whenever a new
/// one is spawned, so the group does not grow with the number of tasks it ever ran.
#[derive(Debug)]
pub struct Workers {
    tasks: JoinSet<()>,
    stop: CancellationToken,
}

/// runs the wrapped closure when the task that owns it ends, even when it is aborted
struct OnFinish<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for OnFinish<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Workers {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            stop: parent.child_token(),
        }
    }

    pub fn spawn<W, Fut>(&mut self, worker: W)
    where
        W: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_with_on_finish(worker, || {});
    }

    /// like [`spawn`](Self::spawn), `on_finish` runs exactly once after the worker is done
    pub fn spawn_with_on_finish<W, Fut, F>(&mut self, worker: W, on_finish: F)
    where
        W: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.reap();
        let guard = OnFinish(Some(on_finish));
        let fut = worker(self.stop.child_token());
        self.tasks.spawn(async move {
            let _guard = guard;
            fut.await;
        });
    }

    /// number of workers that have not been reaped yet
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(error) = result {
                if error.is_panic() {
                    warn!(%error, "worker panicked");
                }
            }
        }
    }

    /// signals every worker to stop and waits until all of them returned
    pub async fn stop(mut self) {
        self.stop.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(error) = result {
                if error.is_panic() {
                    warn!(%error, "worker panicked");
                }
            }
        }
    }
}
