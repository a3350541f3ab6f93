//! Signal handling: one task listens for SIGINT/SIGTERM and fans the event
//! out to any number of subscribers (the runner, the cache shutdown path).

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct SignalSubscriber(watch::Receiver<bool>);

impl SignalSubscriber {
    /// Resolves when a shutdown signal arrives. Returns immediately if one
    /// already has.
    pub async fn listen(&mut self) {
        if *self.0.borrow() {
            return;
        }
        // an error means the handler was dropped, which also means shutdown
        let _ = self.0.changed().await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }
}

#[derive(Debug)]
pub struct SignalHandler {
    tx: watch::Sender<bool>,
}

impl SignalHandler {
    /// Installs the OS signal listeners and returns the handler.
    pub fn install() -> Self {
        let (tx, _rx) = watch::channel(false);
        let signal_tx = tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            let _ = signal_tx.send(true);
        });
        Self { tx }
    }

    pub fn subscribe(&self) -> SignalSubscriber {
        SignalSubscriber(self.tx.subscribe())
    }

    /// Manual trigger, used by tests and by fatal error paths.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(windows)]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_subscribers() {
        let handler = SignalHandler::install();
        let mut subscriber = handler.subscribe();
        assert!(!subscriber.is_triggered());
        handler.trigger();
        subscriber.listen().await;
        assert!(subscriber.is_triggered());
    }

    #[tokio::test]
    async fn test_late_subscription_sees_trigger() {
        let handler = SignalHandler::install();
        handler.trigger();
        let mut subscriber = handler.subscribe();
        subscriber.listen().await;
        assert!(subscriber.is_triggered());
    }
}
