//! In-process [`PeerLink`] whose descriptions simply list the attached tracks.
//!
//! Used for headless endpoints and tests: after a negotiation converges, each
//! side's [`MemoryLink::remote_tracks`] equals the other side's local tracks.
//! Like a real peer connection it refuses a remote offer while its own offer
//! is unanswered.

use crate::negotiation::{PeerLink, TrackId};
use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::Description;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrackListing {
    #[serde(rename = "type")]
    kind: String,
    version: u64,
    tracks: Vec<TrackId>,
}

#[derive(Debug, Default)]
struct LinkState {
    local_tracks: Vec<TrackId>,
    remote_tracks: Vec<TrackId>,
    version: u64,
    offer_pending: bool,
    closed: bool,
}

/// Cloning yields another handle to the same link, so a test can keep one
/// while the session owns the other.
#[derive(Debug, Clone, Default)]
pub struct MemoryLink {
    inner: Arc<Mutex<LinkState>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_tracks(&self) -> Vec<TrackId> {
        self.lock().local_tracks.clone()
    }

    pub fn remote_tracks(&self) -> Vec<TrackId> {
        self.lock().remote_tracks.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn describe(&self, kind: &str) -> anyhow::Result<Description> {
        let mut state = self.lock();
        if state.closed {
            anyhow::bail!("link closed");
        }
        state.version += 1;
        let listing = TrackListing {
            kind: kind.to_string(),
            version: state.version,
            tracks: state.local_tracks.clone(),
        };
        Ok(Description(serde_json::to_value(listing)?))
    }

    fn apply_remote(&self, description: &Description, expected: &str) -> anyhow::Result<()> {
        let listing: TrackListing = serde_json::from_value(description.0.clone())
            .context("remote description is not a track listing")?;
        if listing.kind != expected {
            anyhow::bail!("expected {expected}, got {}", listing.kind);
        }
        let mut state = self.lock();
        if state.closed {
            anyhow::bail!("link closed");
        }
        state.remote_tracks = listing.tracks;
        Ok(())
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_offer(&mut self) -> anyhow::Result<Description> {
        let offer = self.describe("offer")?;
        self.lock().offer_pending = true;
        Ok(offer)
    }

    async fn create_answer(&mut self, offer: &Description) -> anyhow::Result<Description> {
        if self.lock().offer_pending {
            anyhow::bail!("remote offer while a local offer is pending");
        }
        self.apply_remote(offer, "offer")?;
        self.describe("answer")
    }

    async fn apply_answer(&mut self, answer: &Description) -> anyhow::Result<()> {
        if !self.lock().offer_pending {
            anyhow::bail!("answer without a pending local offer");
        }
        self.apply_remote(answer, "answer")?;
        self.lock().offer_pending = false;
        Ok(())
    }

    async fn rollback(&mut self) -> anyhow::Result<()> {
        let mut state = self.lock();
        if !state.offer_pending {
            anyhow::bail!("nothing to roll back");
        }
        state.offer_pending = false;
        Ok(())
    }

    fn add_track(&mut self, track: &TrackId) -> bool {
        let mut state = self.lock();
        if state.closed || state.local_tracks.contains(track) {
            return false;
        }
        state.local_tracks.push(track.clone());
        true
    }

    fn close(&mut self) {
        let mut state = self.lock();
        state.closed = true;
        state.local_tracks.clear();
        state.remote_tracks.clear();
    }
}
