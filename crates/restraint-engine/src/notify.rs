//! In-process activation notifiers.

use async_trait::async_trait;
use tokio::sync::mpsc;

use restraint_core::{ActivationEvent, ActivationNotifier};

pub type ActivationReceiver = mpsc::UnboundedReceiver<ActivationEvent>;

/// Forwards activations to a tokio channel owned by the executor.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<ActivationEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, ActivationReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ActivationNotifier for ChannelNotifier {
    async fn consumer_activated(&self, event: &ActivationEvent) -> anyhow::Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("Activation receiver dropped"))
    }
}

/// Discards activations; executors poll `get_consumer_state` instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl ActivationNotifier for NoopNotifier {
    async fn consumer_activated(&self, _event: &ActivationEvent) -> anyhow::Result<()> {
        Ok(())
    }
}
