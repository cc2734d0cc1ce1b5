pub mod models;

pub use models::{
    ClientEvent, ConnectionId, Description, ProtocolError, RoomJoin, ServerEvent,
};
