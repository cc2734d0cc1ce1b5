//! Call session actor: owns a [`Negotiator`] and applies commands one at a
//! time, in arrival order, so offer/answer application never races.

use crate::negotiation::{NegotiationError, NegotiationState, Negotiator, PeerLink, TrackId};
use shared::{ClientEvent, ServerEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SESSION_CHANNEL_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, NegotiationError>>;

enum SessionCommand {
    Call { respond_to: Reply<()> },
    Accept { respond_to: Reply<()> },
    Reject { respond_to: Reply<()> },
    AttachTrack { track: TrackId, respond_to: Reply<()> },
    HangUp { respond_to: Reply<()> },
    Relay { event: ServerEvent },
    State { respond_to: oneshot::Sender<NegotiationState> },
}

/// Handle to a running call session.
#[derive(Clone, Debug)]
pub struct CallSessionHandle {
    sender: mpsc::Sender<SessionCommand>,
}

impl CallSessionHandle {
    pub async fn call(&self) -> Result<(), NegotiationError> {
        self.request(|respond_to| SessionCommand::Call { respond_to }).await
    }

    pub async fn accept(&self) -> Result<(), NegotiationError> {
        self.request(|respond_to| SessionCommand::Accept { respond_to }).await
    }

    pub async fn reject(&self) -> Result<(), NegotiationError> {
        self.request(|respond_to| SessionCommand::Reject { respond_to }).await
    }

    pub async fn attach_track(&self, track: impl Into<TrackId>) -> Result<(), NegotiationError> {
        let track = track.into();
        self.request(|respond_to| SessionCommand::AttachTrack { track, respond_to })
            .await
    }

    pub async fn hang_up(&self) -> Result<(), NegotiationError> {
        self.request(|respond_to| SessionCommand::HangUp { respond_to }).await
    }

    /// Queues an event received from the relay.
    pub async fn deliver(&self, event: ServerEvent) -> Result<(), NegotiationError> {
        self.sender
            .send(SessionCommand::Relay { event })
            .await
            .map_err(|_| NegotiationError::SessionClosed)
    }

    pub async fn state(&self) -> Result<NegotiationState, NegotiationError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::State { respond_to: tx })
            .await
            .map_err(|_| NegotiationError::SessionClosed)?;
        rx.await.map_err(|_| NegotiationError::SessionClosed)
    }

    async fn request<F>(&self, build: F) -> Result<(), NegotiationError>
    where
        F: FnOnce(Reply<()>) -> SessionCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| NegotiationError::SessionClosed)?;
        rx.await.map_err(|_| NegotiationError::SessionClosed)?
    }
}

pub struct CallSession<L> {
    negotiator: Negotiator<L>,
    receiver: mpsc::Receiver<SessionCommand>,
    outbound: mpsc::UnboundedSender<ClientEvent>,
}

impl<L: PeerLink + 'static> CallSession<L> {
    /// Spawns the session. Events for the relay are written to `outbound`.
    pub fn spawn(
        link: L,
        outbound: mpsc::UnboundedSender<ClientEvent>,
    ) -> (CallSessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let session = Self {
            negotiator: Negotiator::new(link),
            receiver,
            outbound,
        };
        let task = tokio::spawn(session.run());
        (CallSessionHandle { sender }, task)
    }

    async fn run(mut self) {
        while let Some(command) = self.receiver.recv().await {
            match command {
                SessionCommand::Call { respond_to } => {
                    let result = self.negotiator.call().await;
                    self.reply(result, respond_to);
                }
                SessionCommand::Accept { respond_to } => {
                    let result = self.negotiator.accept().await;
                    self.reply(result, respond_to);
                }
                SessionCommand::Reject { respond_to } => {
                    let _ = respond_to.send(self.negotiator.reject());
                }
                SessionCommand::AttachTrack { track, respond_to } => {
                    let result = self.negotiator.attach_track(track).await;
                    self.reply(result, respond_to);
                }
                SessionCommand::HangUp { respond_to } => {
                    let result = Ok(self.negotiator.hang_up().into_iter().collect());
                    self.reply(result, respond_to);
                }
                SessionCommand::Relay { event } => {
                    let name = event.name();
                    let from = event.sender();
                    match self.negotiator.handle(event).await {
                        Ok(outbound) => self.emit(outbound),
                        Err(err) => {
                            warn!(event = name, ?from, error = %err, "ignoring relay event")
                        }
                    }
                }
                SessionCommand::State { respond_to } => {
                    let _ = respond_to.send(self.negotiator.state());
                }
            }
        }
        debug!("call session stopped");
    }

    fn reply(&self, result: Result<Vec<ClientEvent>, NegotiationError>, respond_to: Reply<()>) {
        let result = result.map(|outbound| self.emit(outbound));
        let _ = respond_to.send(result);
    }

    fn emit(&self, outbound: Vec<ClientEvent>) {
        for event in outbound {
            if self.outbound.send(event).is_err() {
                warn!("signaling channel closed, dropping outbound event");
            }
        }
    }
}

/// Feeds relay events into the session until either side goes away.
pub fn pump(
    handle: CallSessionHandle,
    mut inbound: mpsc::UnboundedReceiver<ServerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = inbound.recv().await {
            if handle.deliver(event).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLink;
    use shared::Description;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_session_emits_offer_after_peer_joins() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handle, _task) = CallSession::spawn(MemoryLink::new(), tx);
        let peer = Uuid::new_v4();

        assert!(matches!(handle.call().await, Err(NegotiationError::NoRemotePeer)));

        handle
            .deliver(ServerEvent::UserJoined {
                email: "b@x.com".to_string(),
                id: peer,
            })
            .await
            .expect("deliver");
        handle.call().await.expect("call");

        assert!(matches!(rx.recv().await, Some(ClientEvent::UserCall { to, .. }) if to == peer));
        assert_eq!(handle.state().await.expect("state"), NegotiationState::Offering);
    }

    #[tokio::test]
    async fn test_invalid_relay_event_does_not_stop_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handle, _task) = CallSession::spawn(MemoryLink::new(), tx);
        let peer = Uuid::new_v4();

        // Not offering, so an answer is out of place.
        handle
            .deliver(ServerEvent::CallAccepted {
                from: peer,
                ans: Description::new("stray"),
            })
            .await
            .expect("deliver");
        assert_eq!(handle.state().await.expect("state"), NegotiationState::Idle);

        handle
            .deliver(ServerEvent::IncomingCall {
                from: peer,
                offer: Description::new(serde_json::json!({"type": "offer", "version": 1, "tracks": []})),
            })
            .await
            .expect("deliver");
        handle.accept().await.expect("accept");
        assert!(matches!(rx.recv().await, Some(ClientEvent::CallAccepted { to, .. }) if to == peer));
    }

    #[tokio::test]
    async fn test_hang_up_twice_sends_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handle, _task) = CallSession::spawn(MemoryLink::new(), tx);
        let peer = Uuid::new_v4();
        handle
            .deliver(ServerEvent::UserJoined {
                email: "b@x.com".to_string(),
                id: peer,
            })
            .await
            .expect("deliver");

        handle.hang_up().await.expect("hang up");
        handle.hang_up().await.expect("hang up again");
        assert_eq!(handle.state().await.expect("state"), NegotiationState::Ended);

        drop(handle);
        assert_eq!(rx.recv().await, Some(ClientEvent::CallEnded { to: peer }));
        assert_eq!(rx.recv().await, None);
    }
}
