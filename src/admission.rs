// Bounded hand-off between the decision engine and the delivery consumer.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::envelope::AlertEvent;

pub const DEFAULT_CAPACITY: usize = 5;

#[derive(Debug, Error)]
#[error("admission channel closed, alert {0} dropped")]
pub struct AdmissionClosed(pub String);

#[derive(Debug, Clone)]
pub struct AdmissionSender {
    inner: mpsc::Sender<AlertEvent>,
}

#[derive(Debug)]
pub struct AdmissionReceiver {
    inner: mpsc::Receiver<AlertEvent>,
}

/// Create a channel holding at most `capacity` pending alerts.
///
/// Panics if `capacity` is zero; configuration validation rejects that earlier.
pub fn channel(capacity: usize) -> (AdmissionSender, AdmissionReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (AdmissionSender { inner: tx }, AdmissionReceiver { inner: rx })
}

impl AdmissionSender {
    /// Queue an alert, waiting while the channel is full.
    pub async fn emit(&self, alert: AlertEvent) -> Result<(), AdmissionClosed> {
        self.inner
            .send(alert)
            .await
            .map_err(|e| AdmissionClosed(e.0.id))
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.inner.capacity()
    }
}

impl AdmissionReceiver {
    pub async fn recv(&mut self) -> Option<AlertEvent> {
        self.inner.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AlertEvent> {
        self.inner.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}
