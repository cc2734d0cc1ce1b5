use crate::registry::{ConnectionRegistry, JoinOutcome};
use shared::{ClientEvent, ConnectionId, Description, RoomJoin, ServerEvent};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of forwarding one unicast message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Destination is not a live connection. Best effort, the sender is not told.
    Dropped,
}

/// Forwards negotiation events between connections. Payloads pass through
/// untouched; only the `from` provenance is added.
#[derive(Debug, Clone)]
pub struct SignalingRouter {
    registry: Arc<ConnectionRegistry>,
}

impl SignalingRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Entry point for one inbound text frame. Malformed frames are logged and
    /// dropped; the connection stays open.
    pub async fn handle_frame(&self, from: ConnectionId, text: &str) -> usize {
        match ClientEvent::from_frame(text) {
            Ok(event) => self.route(from, event).await,
            Err(err) => {
                warn!(connection_id = %from, error = %err, "dropping malformed frame");
                0
            }
        }
    }

    /// Dispatches an inbound event. Returns how many events were delivered.
    pub async fn route(&self, from: ConnectionId, event: ClientEvent) -> usize {
        debug!(connection_id = %from, event = event.name(), to = ?event.destination(), "routing");
        let delivery = match event {
            ClientEvent::RoomJoin(join) => return self.room_join(from, join).await,
            ClientEvent::UserCall { to, offer } => self.call_user(from, to, offer).await,
            ClientEvent::CallAccepted { to, ans } => self.accept_call(from, to, ans).await,
            ClientEvent::NegotiationNeeded { to, offer } => {
                self.request_renegotiation(from, to, offer).await
            }
            ClientEvent::NegotiationDone { to, ans } => {
                self.answer_renegotiation(from, to, ans).await
            }
            ClientEvent::CallEnded { to } => self.end_call(from, to).await,
        };
        usize::from(delivery == Delivery::Delivered)
    }

    /// `room:join`: registers the identity, tells every other member of the
    /// room and acknowledges the joiner. A join from a connection that is
    /// already gone sends nothing.
    #[instrument(skip(self, join), fields(room = %join.room))]
    pub async fn room_join(&self, from: ConnectionId, join: RoomJoin) -> usize {
        let JoinOutcome::Joined { superseded } =
            self.registry.join(&join.email, from, &join.room).await
        else {
            return 0;
        };
        info!(connection_id = %from, email = %join.email, ?superseded, "joined room");

        let announcement = ServerEvent::UserJoined {
            email: join.email.clone(),
            id: from,
        };
        let mut delivered = 0;
        for (peer, outbound) in self.registry.room_peers(&join.room, from).await {
            if outbound.send(announcement.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(%peer, "room member went away before announcement");
            }
        }

        if self.forward(from, ServerEvent::RoomJoined(join)).await == Delivery::Delivered {
            delivered += 1;
        }
        delivered
    }

    /// `user:call` → `incoming:call`.
    pub async fn call_user(
        &self,
        from: ConnectionId,
        to: ConnectionId,
        offer: Description,
    ) -> Delivery {
        self.forward(to, ServerEvent::IncomingCall { from, offer }).await
    }

    /// `call:accepted` → `call:accepted`.
    pub async fn accept_call(&self, from: ConnectionId, to: ConnectionId, ans: Description) -> Delivery {
        self.forward(to, ServerEvent::CallAccepted { from, ans }).await
    }

    /// `peer:nego:needed` → `peer:nego:needed`.
    pub async fn request_renegotiation(
        &self,
        from: ConnectionId,
        to: ConnectionId,
        offer: Description,
    ) -> Delivery {
        self.forward(to, ServerEvent::NegotiationNeeded { from, offer }).await
    }

    /// `peer:nego:done` → `peer:nego:final`.
    pub async fn answer_renegotiation(
        &self,
        from: ConnectionId,
        to: ConnectionId,
        ans: Description,
    ) -> Delivery {
        self.forward(to, ServerEvent::NegotiationFinal { from, ans }).await
    }

    /// `call:ended` → `call:ended`. Repeats are forwarded as-is.
    pub async fn end_call(&self, from: ConnectionId, to: ConnectionId) -> Delivery {
        self.forward(to, ServerEvent::CallEnded { from }).await
    }

    async fn forward(&self, to: ConnectionId, event: ServerEvent) -> Delivery {
        let name = event.name();
        let Some(outbound) = self.registry.outbound(to).await else {
            debug!(%to, event = name, "destination not live, dropping");
            return Delivery::Dropped;
        };
        match outbound.send(event) {
            Ok(()) => {
                debug!(%to, event = name, "forwarded");
                Delivery::Delivered
            }
            Err(_) => {
                debug!(%to, event = name, "destination closing, dropping");
                Delivery::Dropped
            }
        }
    }
}
