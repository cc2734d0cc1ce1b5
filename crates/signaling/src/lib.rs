pub mod config;
pub mod registry;
pub mod router;
pub mod server;

pub use config::SignalingServerConfig;
pub use registry::{ConnectionRegistry, JoinOutcome, RegistryStats};
pub use router::{Delivery, SignalingRouter};
pub use server::{app, run_server, serve, AppState};
