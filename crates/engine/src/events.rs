//! Lifecycle event publishing.
//!
//! Publishing is fire-and-forget from the runner's point of view: a failed publish is
//! logged and never changes the outcome of a run.

use async_trait::async_trait;
use stepwise_types::{EventKind, LifecycleEvent};
use thiserror::Error;
use tokio::sync::{
    Mutex,
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};
use tracing::info;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("event channel closed")]
    ChannelClosed,
    #[error("event sink failure: {message}")]
    Backend { message: String },
}

/// Event collaborator.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), PublishError>;
}

/// Writes events to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), PublishError> {
        info!(
            kind = ?event.kind,
            tenant_id = %event.tenant_id,
            automation_id = %event.automation_id,
            run_id = %event.run_id,
            properties = %serde_json::Value::Object(event.properties.clone()),
            "automation event"
        );
        Ok(())
    }
}

/// Keeps every published event in memory.
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().await.clone()
    }

    /// Event kinds published for one run, in publish order.
    pub async fn kinds_for_run(&self, run_id: &str) -> Vec<EventKind> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|event| event.run_id == run_id)
            .map(|event| event.kind)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), PublishError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// Forwards events over an unbounded Tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelEventPublisher {
    sender: UnboundedSender<LifecycleEvent>,
}

impl ChannelEventPublisher {
    pub fn channel() -> (Self, UnboundedReceiver<LifecycleEvent>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventPublisher for ChannelEventPublisher {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), PublishError> {
        self.sender.send(event).map_err(|_| PublishError::ChannelClosed)
    }
}
