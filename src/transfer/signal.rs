use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Tells the downloader that peers announced new pieces.
///
/// Any number of `notify` calls between two `wait`s collapse into one wake-up, so the sender
/// never blocks and the receiver never sees a backlog.
#[derive(Debug, Default)]
pub struct HaveSignal {
    dirty: AtomicBool,
    notify: Notify,
}

impl HaveSignal {
    pub fn notify(&self) {
        if !self.dirty.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// waits for the next wake-up and consumes it
    pub async fn wait(&self) {
        loop {
            if self.dirty.swap(false, Ordering::AcqRel) {
                return;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod test_signal {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn many_notifies_one_wake_up() {
        let signal = HaveSignal::default();
        for _ in 0..100 {
            signal.notify();
        }
        assert!(signal.is_pending());

        signal.wait().await;
        assert!(!signal.is_pending());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), signal.wait())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn wakes_a_waiting_task() {
        let signal = Arc::new(HaveSignal::default());
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });
        tokio::task::yield_now().await;
        signal.notify();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
