//! Shutdown and cancellation signals.
//!
//! Components are stopped through `tokio::sync::watch::Receiver<bool>`
//! channels: `true` means "stop". A dropped sender never cancels.

use tokio::sync::watch;

/// Resolve once the signal is raised.
///
/// If the sending side is dropped without raising the signal, this never
/// resolves.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Whether the signal has been raised, without waiting.
pub fn is_cancelled(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// A receiver that is never cancelled.
pub fn never() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolves_when_raised() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        cancelled(&mut rx).await;
        assert!(is_cancelled(&rx));
    }

    #[tokio::test]
    async fn dropped_sender_never_cancels() {
        let mut rx = never();
        let waited = tokio::time::timeout(Duration::from_millis(20), cancelled(&mut rx)).await;
        assert!(waited.is_err());
    }
}
