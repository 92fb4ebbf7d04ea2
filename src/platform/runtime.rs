use std::future::Future;
use std::time::Duration;

/// Spawns a background task on the ambient tokio runtime.
///
/// Outside a runtime the task gets a dedicated thread driving its own current-thread runtime, so
/// a client built from synchronous code still makes progress.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use tokio::runtime::{Builder, Handle};

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
        return;
    }

    std::thread::spawn(move || match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime.block_on(future),
        Err(err) => log::warn!("failed to build background tokio runtime: {err}"),
    });
}

/// Waits for `duration`; zero returns immediately.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_tasks_run_on_current_runtime() {
        let (sender, receiver) = futures::channel::oneshot::channel();
        spawn_detached(async move {
            sleep(Duration::from_millis(1)).await;
            let _ = sender.send(7);
        });
        assert_eq!(receiver.await.unwrap(), 7);
    }

    #[test]
    fn spawns_without_a_runtime() {
        let (sender, receiver) = std::sync::mpsc::channel();
        spawn_detached(async move {
            sleep(Duration::ZERO).await;
            let _ = sender.send(());
        });
        assert!(receiver.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
