pub mod archive;
pub mod chat;
pub mod classifier;
pub mod config;
pub mod error;
pub mod handshake;
pub mod partial;
pub mod protocol;
pub mod room;
pub mod skip;
pub mod swarm;
pub mod ticket;
pub mod topic;
pub mod transfer;


pub use config::TransferConfig;
pub use error::{Error, Result};
pub use iroh::EndpointAddr;
pub use protocol::ChatMessage;
pub use room::{Channel, Room, RoomEvent, TransferProgress};
pub use swarm::memory::{MemoryHub, MemorySwarm};
pub use swarm::quic::IrohSwarm;
pub use swarm::{ConnectionId, PeerConnection, Swarm};
pub use ticket::PeerTicket;
pub use topic::Topic;
pub use transfer::{
    ReceiveProgress, ReceiveReport, ReceiveSession, SendProgress, SendReport, SendSession,
};
