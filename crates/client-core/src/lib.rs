pub mod memory;
pub mod negotiation;
pub mod session;
pub mod signaling;

pub use memory::MemoryLink;
pub use negotiation::{NegotiationError, NegotiationState, Negotiator, PeerLink, TrackId};
pub use session::{pump, CallSession, CallSessionHandle};
pub use signaling::{SignalingClient, SignalingClientError};
