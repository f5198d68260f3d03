//! Authoritative state replication.
//!
//! The server keeps a mirror of every networked object (a
//! [`Representation`]), decides per client which of them that client should
//! have instantiated, arbitrates write authority, and persists the object
//! graph to disk.
//!
//! Everything runs on the thread that calls [`Server::update`]; there is no
//! internal locking.

mod dispatch;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod interest;
pub mod persistence;
pub mod prefab;
pub mod representation;
pub mod session;
pub mod world;

pub use engine::Server;
pub use error::{ErrorKind, ReplicationError, StartError};
pub use hierarchy::Root;
pub use prefab::{PrefabError, PrefabInfo, PrefabRegistry};
pub use representation::Representation;
pub use session::ClientId;
pub use world::{World, WorldSettings};
