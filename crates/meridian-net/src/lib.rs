//! Wire layer of the replication server: primitive codec, message framing,
//! the closed message set, and polled socket transport.

pub mod bandwidth;
pub mod codec;
pub mod framing;
pub mod memory;
pub mod messages;
pub mod transport;

pub use bandwidth::TrafficMonitor;
pub use codec::{ByteReader, CodecError};
pub use framing::{Frame, FrameConfig, FrameDecoder, FrameError, encode_client_frame, encode_frame};
pub use messages::{
    ClientMessage, ClientMessageType, MessageError, ServerMessage, ServerMessageType,
};
pub use transport::{Connection, Listener, ReadOutcome, SocketConfig, TcpAcceptor, TcpConnection};
