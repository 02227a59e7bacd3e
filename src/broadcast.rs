//! Forwards observable events to viewers, fire-and-forget.
//!
//! Viewers receive one camelCase notification per stage event, per route
//! end and per fault. Delivery failures are logged and never reach the
//! sagas.

use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::ids::WipId;
use crate::messages::Event;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerNotification {
    pub method: &'static str,
    pub wip_id: WipId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ViewerNotification {
    fn new(method: &'static str, wip_id: &WipId) -> Self {
        Self {
            method,
            wip_id: wip_id.clone(),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// `None` for events viewers do not display.
    pub fn from_event(event: &Event) -> Option<Self> {
        let notification = match event {
            Event::WipReleased { wip_id } => Self::new("wipReleased", wip_id),
            Event::WipMovedToAssemble { wip_id } => Self::new("wipMovedToAssemble", wip_id),
            Event::AssembleStarted { wip_id } => Self::new("assembleStarted", wip_id),
            Event::AssemblePassed { wip_id } => Self::new("assemblePassed", wip_id),
            Event::AssembleFailed { wip_id } => Self::new("assembleFailed", wip_id),
            Event::WipMovedToPackout { wip_id } => Self::new("wipMovedToPackout", wip_id),
            Event::WipPacked { wip_id } => Self::new("wipPacked", wip_id),
            Event::WipMovedToScrap { wip_id } => Self::new("wipMovedToScrap", wip_id),
            Event::WipScrapped { wip_id } => Self::new("wipScrapped", wip_id),
            Event::WipReachedEndOfRoute { wip_id, route_step_id, .. } => {
                Self::new("wipReachedEndOfRoute", wip_id).with_detail(route_step_id.as_str())
            }
            Event::Fault(fault) => Self::new("operationFault", fault.wip_id()).with_detail(fault.name()),
            _ => return None,
        };
        Some(notification)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[async_trait]
pub trait ViewerSink: Send + Sync {
    async fn notify(&self, notification: &ViewerNotification) -> io::Result<()>;
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> ViewerSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn notify(&self, notification: &ViewerNotification) -> io::Result<()> {
        let mut line = notification.to_json().map_err(io::Error::other)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }
}

/// Forward notifications until the event channel closes. Resolves to the
/// number of notifications delivered.
pub fn spawn_viewer_forwarder(
    mut events: broadcast::Receiver<Event>,
    sink: Arc<dyn ViewerSink>,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut delivered = 0;
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(notification) = ViewerNotification::from_event(&event) else {
                        continue;
                    };
                    match sink.notify(&notification).await {
                        Ok(()) => delivered += 1,
                        Err(e) => {
                            tracing::warn!(method = notification.method, error = %e, "Viewer notification failed")
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Viewer forwarder lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        delivered
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RouteStepId;
    use crate::messages::Fault;

    #[test]
    fn test_stage_events_map_to_camel_case_methods() {
        let wip_id = WipId::from("W1");
        let notification = ViewerNotification::from_event(&Event::AssembleFailed { wip_id: wip_id.clone() }).unwrap();
        assert_eq!(notification.method, "assembleFailed");
        assert_eq!(
            notification.to_json().unwrap(),
            r#"{"method":"assembleFailed","wipId":"W1"}"#
        );
    }

    #[test]
    fn test_faults_carry_their_name() {
        let fault = Fault::OperationFailedToStartBecauseWipIsAlreadyInProcess {
            wip_id: WipId::from("W1"),
            route_step_id: RouteStepId::from("S1"),
            material_id: "M1".into(),
        };
        let notification = ViewerNotification::from_event(&Event::Fault(fault)).unwrap();
        assert_eq!(notification.method, "operationFault");
        assert_eq!(
            notification.detail.as_deref(),
            Some("OperationFailedToStartBecauseWipIsAlreadyInProcess")
        );
    }

    #[test]
    fn test_queue_events_are_not_displayed() {
        let event = Event::WipEnqueuedAtRouteStep {
            wip_id: WipId::from("W1"),
            route_step_id: RouteStepId::from("S1"),
        };
        assert!(ViewerNotification::from_event(&event).is_none());
    }

    #[tokio::test]
    async fn test_forwarder_writes_json_lines_until_closed() {
        let (sender, receiver) = broadcast::channel(16);
        let sink = Arc::new(JsonLinesSink::new(Vec::new()));
        let forwarder = spawn_viewer_forwarder(receiver, sink.clone());

        sender.send(Event::WipReleased { wip_id: WipId::from("W1") }).unwrap();
        sender
            .send(Event::WipEnqueuedAtRouteStep {
                wip_id: WipId::from("W1"),
                route_step_id: RouteStepId::from("S1"),
            })
            .unwrap();
        sender.send(Event::WipPacked { wip_id: WipId::from("W1") }).unwrap();
        drop(sender);

        assert_eq!(forwarder.await.unwrap(), 2);
        let sink = Arc::try_unwrap(sink).ok().unwrap();
        let output = String::from_utf8(sink.into_inner()).unwrap();
        let methods: Vec<serde_json::Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(methods[0]["method"], "wipReleased");
        assert_eq!(methods[1]["method"], "wipPacked");
    }
}
