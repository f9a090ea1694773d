use tokio::sync::watch;

/// Liveness of the code that asked for a command to run.
///
/// The context ends when [`CallerContext::end`] is called or the value is
/// dropped. Runners configured with `Timeout::OnContextExit` terminate their
/// child at that point.
#[derive(Debug)]
pub struct CallerContext {
    tx: watch::Sender<bool>,
}

impl CallerContext {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn monitor(&self) -> ContextMonitor {
        ContextMonitor {
            rx: self.tx.subscribe(),
        }
    }

    pub fn end(self) {
        self.tx.send_replace(true);
    }
}

impl Default for CallerContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`CallerContext`].
#[derive(Debug, Clone)]
pub struct ContextMonitor {
    rx: watch::Receiver<bool>,
}

impl ContextMonitor {
    pub fn is_ended(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the context has ended.
    pub async fn ended(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // Err means the CallerContext was dropped
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_live_context() {
        let context = CallerContext::new();
        let monitor = context.monitor();
        assert!(!monitor.is_ended());
    }

    #[test]
    fn test_end_is_observed() {
        let context = CallerContext::new();
        let monitor = context.monitor();
        context.end();
        assert!(monitor.is_ended());
    }

    #[test]
    fn test_drop_is_observed() {
        let context = CallerContext::new();
        let monitor = context.monitor();
        drop(context);
        assert!(monitor.is_ended());
    }

    #[tokio::test]
    async fn test_ended_resolves_after_drop() {
        let context = CallerContext::new();
        let monitor = context.monitor();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(context);
        });
        tokio::time::timeout(Duration::from_secs(5), monitor.ended())
            .await
            .expect("monitor never observed the context ending");
    }

    #[tokio::test]
    async fn test_ended_pending_while_alive() {
        let context = CallerContext::new();
        let monitor = context.monitor();
        let waited = tokio::time::timeout(Duration::from_millis(50), monitor.ended()).await;
        assert!(waited.is_err());
        drop(context);
    }
}
