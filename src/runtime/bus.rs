//! In-process message bus.
//!
//! Commands and events share one unbounded channel drained by the runtime's
//! dispatcher. Delayed continuations sleep on a spawned task and then enter
//! the same channel. Every queued message and every pending continuation is
//! counted, so the runtime can tell when the system is quiescent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use super::RuntimeError;
use crate::messages::{Command, Continuation, Event, Message};

/// Dispatch surface the runtime performs effects through.
pub trait MessageBus: Send + Sync {
    /// Point-to-point: exactly one handler receives the command.
    fn send(&self, command: Command) -> Result<(), RuntimeError>;

    /// Broadcast to every subscriber of the event.
    fn publish(&self, event: Event) -> Result<(), RuntimeError>;

    /// Deliver `continuation` back to its correlation after `delay`.
    fn request_continuation(&self, delay: Duration, continuation: Continuation) -> Result<(), RuntimeError>;
}

/// Counts queued messages plus pending continuations.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once nothing is queued, being handled, or sleeping.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.current() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone)]
pub struct ChannelBus {
    sender: mpsc::UnboundedSender<Message>,
    in_flight: Arc<InFlight>,
}

impl ChannelBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let bus = Self {
            sender,
            in_flight: Arc::new(InFlight::default()),
        };
        (bus, receiver)
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    fn dispatch(&self, message: Message) -> Result<(), RuntimeError> {
        self.in_flight.begin();
        if self.sender.send(message).is_err() {
            self.in_flight.finish();
            return Err(RuntimeError::BusClosed);
        }
        Ok(())
    }

    /// Called by the dispatcher once a received message and all of its
    /// effects have been handled.
    pub fn message_handled(&self) {
        self.in_flight.finish();
    }
}

impl MessageBus for ChannelBus {
    fn send(&self, command: Command) -> Result<(), RuntimeError> {
        tracing::debug!(wip_id = %command.wip_id(), command = command.name(), "Sending command");
        self.dispatch(Message::Command(command))
    }

    fn publish(&self, event: Event) -> Result<(), RuntimeError> {
        tracing::debug!(wip_id = %event.wip_id(), event = event.name(), "Publishing event");
        self.dispatch(Message::Event(event))
    }

    fn request_continuation(&self, delay: Duration, continuation: Continuation) -> Result<(), RuntimeError> {
        if self.sender.is_closed() {
            return Err(RuntimeError::BusClosed);
        }

        self.in_flight.begin();
        let bus = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let name = continuation.name();
            if let Err(e) = bus.dispatch(Message::Continuation(continuation)) {
                tracing::debug!(continuation = name, error = %e, "Continuation fired after shutdown");
            }
            bus.in_flight.finish();
        });
        Ok(())
    }
}
