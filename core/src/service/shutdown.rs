// Cooperative shutdown signal shared by every background task

use std::time::Duration;
use tokio::sync::watch;

/// Fires the shutdown signal
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving side, cloned into every background loop
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/signal pair
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested. A dropped trigger counts as shutdown.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration`, returning false if shutdown interrupted it
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_triggered(),
            _ = self.wait() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let (trigger, shutdown) = channel();
        let mut waiter = shutdown.clone();
        let task = tokio::spawn(async move {
            waiter.wait().await;
        });
        assert!(!shutdown.is_triggered());
        trigger.trigger();
        task.await.unwrap();
        assert!(shutdown.is_triggered());
        assert!(trigger.subscribe().is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted() {
        let (trigger, mut shutdown) = channel();
        assert!(shutdown.sleep(Duration::from_secs(5)).await);

        let handle = tokio::spawn(async move { shutdown.sleep(Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        trigger.trigger();
        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_trigger_counts_as_shutdown() {
        let (trigger, mut shutdown) = channel();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .unwrap();
    }
}
