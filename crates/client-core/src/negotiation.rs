//! Call negotiation state machine for one endpoint.
//!
//! States: `Idle → Offering | Answering → Connected → (Renegotiating ⇄
//! Connected)* → Ended`. `Ended` is terminal and reachable from anywhere.
//!
//! The machine never talks to the relay itself; every operation returns the
//! [`ClientEvent`]s to send, in order. The peer-connection capability is
//! reached through [`PeerLink`].
//!
//! When both sides offer at once, the callee is the polite side: it rolls
//! back its own offer, answers, and then offers again. The caller ignores the
//! colliding offer and waits for its answer.

use async_trait::async_trait;
use shared::{ClientEvent, ConnectionId, Description, ServerEvent};
use thiserror::Error;
use tracing::{debug, info};

pub type TrackId = String;

/// The peer-connection capability the endpoint drives. Descriptions are
/// opaque to everything but the link.
#[async_trait]
pub trait PeerLink: Send {
    async fn create_offer(&mut self) -> anyhow::Result<Description>;
    /// Applies a remote offer and produces the local answer.
    async fn create_answer(&mut self, offer: &Description) -> anyhow::Result<Description>;
    async fn apply_answer(&mut self, answer: &Description) -> anyhow::Result<()>;
    /// Discards a local offer that has not been answered.
    async fn rollback(&mut self) -> anyhow::Result<()>;
    /// Returns `false` when the track is already attached.
    fn add_track(&mut self, track: &TrackId) -> bool;
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    Answering,
    Connected,
    Renegotiating,
    Ended,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer link failed: {0}")]
    Link(#[from] anyhow::Error),
    #[error("{event} is not valid while {state:?}")]
    InvalidTransition {
        event: &'static str,
        state: NegotiationState,
    },
    #[error("no remote peer known yet")]
    NoRemotePeer,
    #[error("message from unexpected peer {from}")]
    UnexpectedPeer { from: ConnectionId },
    #[error("call session closed")]
    SessionClosed,
}

pub struct Negotiator<L> {
    link: L,
    state: NegotiationState,
    remote: Option<ConnectionId>,
    polite: bool,
    pending_offer: Option<Description>,
    local_tracks: Vec<TrackId>,
}

impl<L: PeerLink> Negotiator<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            state: NegotiationState::Idle,
            remote: None,
            polite: false,
            pending_offer: None,
            local_tracks: Vec::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn remote(&self) -> Option<ConnectionId> {
        self.remote
    }

    /// Idle → Offering.
    pub async fn call(&mut self) -> Result<Vec<ClientEvent>, NegotiationError> {
        self.expect_state("call", &[NegotiationState::Idle])?;
        let to = self.remote.ok_or(NegotiationError::NoRemotePeer)?;
        let offer = self.link.create_offer().await?;
        self.state = NegotiationState::Offering;
        info!(%to, "calling");
        Ok(vec![ClientEvent::UserCall { to, offer }])
    }

    /// Answering → Connected. Local tracks are attached afterwards, which may
    /// immediately start a renegotiation.
    pub async fn accept(&mut self) -> Result<Vec<ClientEvent>, NegotiationError> {
        self.expect_state("accept", &[NegotiationState::Answering])?;
        let to = self.remote.ok_or(NegotiationError::NoRemotePeer)?;
        let offer = self.pending_offer.take().ok_or(NegotiationError::InvalidTransition {
            event: "accept",
            state: self.state,
        })?;
        let ans = self.link.create_answer(&offer).await?;
        self.state = NegotiationState::Connected;
        info!(%to, "call accepted");

        // The answer goes out first so the caller reaches Connected before any
        // renegotiation offer arrives.
        let mut outbound = vec![ClientEvent::CallAccepted { to, ans }];
        outbound.extend(self.attach_media().await?);
        Ok(outbound)
    }

    /// Answering → Idle. Nothing is sent; the caller times out on its own.
    pub fn reject(&mut self) -> Result<(), NegotiationError> {
        self.expect_state("reject", &[NegotiationState::Answering])?;
        self.pending_offer = None;
        self.state = NegotiationState::Idle;
        Ok(())
    }

    /// Records a local track. Once Connected it is attached to the link and a
    /// capability change starts a renegotiation.
    pub async fn attach_track(
        &mut self,
        track: TrackId,
    ) -> Result<Vec<ClientEvent>, NegotiationError> {
        if self.state == NegotiationState::Ended {
            return Err(NegotiationError::InvalidTransition {
                event: "attach_track",
                state: self.state,
            });
        }
        if !self.local_tracks.contains(&track) {
            self.local_tracks.push(track);
        }
        self.attach_media().await
    }

    /// Any → Ended. Repeats are no-ops.
    pub fn hang_up(&mut self) -> Option<ClientEvent> {
        if self.state == NegotiationState::Ended {
            return None;
        }
        let remote = self.remote;
        self.release();
        remote.map(|to| ClientEvent::CallEnded { to })
    }

    /// Feeds one relay event through the machine.
    pub async fn handle(
        &mut self,
        event: ServerEvent,
    ) -> Result<Vec<ClientEvent>, NegotiationError> {
        match event {
            ServerEvent::UserJoined { email, id } => {
                if self.state == NegotiationState::Idle {
                    debug!(%email, %id, "peer joined room");
                    self.remote = Some(id);
                }
                Ok(Vec::new())
            }
            ServerEvent::RoomJoined(_) => Ok(Vec::new()),
            ServerEvent::IncomingCall { from, offer } => {
                self.expect_state("incoming:call", &[NegotiationState::Idle])?;
                self.remote = Some(from);
                self.polite = true;
                self.pending_offer = Some(offer);
                self.state = NegotiationState::Answering;
                info!(%from, "incoming call");
                Ok(Vec::new())
            }
            ServerEvent::CallAccepted { from, ans } => {
                self.expect_state("call:accepted", &[NegotiationState::Offering])?;
                self.expect_remote(from)?;
                self.link.apply_answer(&ans).await?;
                self.state = NegotiationState::Connected;
                info!(%from, "call connected");
                self.attach_media().await
            }
            ServerEvent::NegotiationNeeded { from, offer } => {
                self.expect_state(
                    "peer:nego:needed",
                    &[NegotiationState::Connected, NegotiationState::Renegotiating],
                )?;
                self.expect_remote(from)?;
                let collided = self.state == NegotiationState::Renegotiating;
                if collided {
                    if !self.polite {
                        debug!(%from, "offer collision, keeping local offer");
                        return Ok(Vec::new());
                    }
                    debug!(%from, "offer collision, rolling back local offer");
                    self.link.rollback().await?;
                    self.state = NegotiationState::Connected;
                }
                let ans = self.link.create_answer(&offer).await?;
                let mut outbound = vec![ClientEvent::NegotiationDone { to: from, ans }];
                if collided {
                    // The rolled-back changes still have to reach the peer.
                    outbound.push(self.renegotiate(from).await?);
                }
                Ok(outbound)
            }
            ServerEvent::NegotiationFinal { from, ans } => {
                self.expect_state("peer:nego:final", &[NegotiationState::Renegotiating])?;
                self.expect_remote(from)?;
                self.link.apply_answer(&ans).await?;
                self.state = NegotiationState::Connected;
                debug!(%from, "renegotiation complete");
                // Tracks recorded mid-renegotiation go out now.
                self.attach_media().await
            }
            ServerEvent::CallEnded { from } => {
                if self.state == NegotiationState::Ended {
                    return Ok(Vec::new());
                }
                let Some(remote) = self.remote else {
                    debug!(%from, "call:ended with no known peer, ignoring");
                    return Ok(Vec::new());
                };
                if remote != from {
                    return Err(NegotiationError::UnexpectedPeer { from });
                }
                info!(%from, "call ended by peer");
                self.release();
                Ok(Vec::new())
            }
        }
    }

    /// Attaches every recorded track while Connected; the renegotiation guard.
    async fn attach_media(&mut self) -> Result<Vec<ClientEvent>, NegotiationError> {
        if self.state != NegotiationState::Connected {
            return Ok(Vec::new());
        }
        let mut changed = false;
        for track in &self.local_tracks {
            changed |= self.link.add_track(track);
        }
        if !changed {
            return Ok(Vec::new());
        }
        let to = self.remote.ok_or(NegotiationError::NoRemotePeer)?;
        Ok(vec![self.renegotiate(to).await?])
    }

    async fn renegotiate(&mut self, to: ConnectionId) -> Result<ClientEvent, NegotiationError> {
        let offer = self.link.create_offer().await?;
        self.state = NegotiationState::Renegotiating;
        debug!(%to, "capabilities changed, renegotiating");
        Ok(ClientEvent::NegotiationNeeded { to, offer })
    }

    fn release(&mut self) {
        self.link.close();
        self.local_tracks.clear();
        self.pending_offer = None;
        self.state = NegotiationState::Ended;
    }

    fn expect_state(
        &self,
        event: &'static str,
        allowed: &[NegotiationState],
    ) -> Result<(), NegotiationError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(NegotiationError::InvalidTransition {
                event,
                state: self.state,
            })
        }
    }

    fn expect_remote(&self, from: ConnectionId) -> Result<(), NegotiationError> {
        match self.remote {
            Some(remote) if remote != from => Err(NegotiationError::UnexpectedPeer { from }),
            _ => Ok(()),
        }
    }
}
