//! The server loop and the collaborator-facing API.
//!
//! [`Server::update`] is the tick. It must be called periodically from one
//! thread; each call runs to completion:
//!
//! 1. forget expired recently-deleted ids
//! 2. accept pending connections
//! 3. read and dispatch everything each client has sent
//! 4. per-client proximity scan and timeouts, then delete transient
//!    objects left with no observer
//! 5. flush outbound queues in send-buffer sized chunks
//! 6. disconnect clients whose writes failed

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use glam::Vec3;
use meridian_config::Config;
use meridian_net::codec;
use meridian_net::{
    ClientMessage, FrameConfig, Listener, ReadOutcome, ServerMessage, SocketConfig, TcpAcceptor,
    TrafficMonitor,
};

use crate::error::{ErrorKind, ReplicationError, StartError};
use crate::hierarchy::Parent;
use crate::persistence;
use crate::prefab::{PrefabInfo, PrefabRegistry};
use crate::representation::{POSITION_SLOTS, Representation, RepresentationRecord};
use crate::session::{ClientId, ClientSession};
use crate::world::{World, WorldSettings};

pub const SERVER_STOPPED: &str = "Server stopped.";
pub const SERVER_FULL: &str = "Server full.";

pub struct Server {
    world: World,
    /// `None` once stopped; the port is released with it.
    listener: Option<Box<dyn Listener>>,
    frame_config: FrameConfig,
    max_clients: usize,
    saves_dir: PathBuf,
    save_name: String,
}

impl Server {
    /// Bind the configured port and load the configured save.
    ///
    /// The prefab table named in the config (if any) is loaded into
    /// `registry` first.
    pub fn start(config: &Config, registry: PrefabRegistry) -> Result<Self, StartError> {
        let addr = SocketAddr::new(config.network.bind_address, config.network.port);
        let acceptor = TcpAcceptor::bind(addr, SocketConfig::default()).map_err(|source| {
            StartError::Bind {
                addr: addr.to_string(),
                source,
            }
        })?;
        let server = Self::with_listener(config, registry, Box::new(acceptor))?;
        tracing::info!(%addr, save = %server.save_file().display(), "server started");
        Ok(server)
    }

    /// Like [`Server::start`] but accepting from any listener.
    pub fn with_listener(
        config: &Config,
        mut registry: PrefabRegistry,
        listener: Box<dyn Listener>,
    ) -> Result<Self, StartError> {
        if let Some(path) = &config.world.prefab_data {
            registry.load_table(path)?;
        }
        if !registry.contains(&config.world.player_prefab) {
            return Err(StartError::UnknownPlayerPrefab(
                config.world.player_prefab.clone(),
            ));
        }

        let frame_config = FrameConfig {
            max_payload_size: config.network.max_payload_size,
            ..FrameConfig::default()
        };
        let mut server = Self {
            world: World::new(registry, WorldSettings::from_config(config), Instant::now()),
            listener: Some(listener),
            frame_config,
            max_clients: config.network.max_clients,
            saves_dir: config.world.saves_dir.clone(),
            save_name: config.world.save_name.clone(),
        };

        let path = server.save_file();
        if path.is_file() {
            server.world.load_from(&path).map_err(StartError::Load)?;
        } else if config.world.require_existing_save {
            return Err(StartError::MissingSave(path));
        } else {
            tracing::info!(path = %path.display(), "no save found, starting an empty world");
        }
        Ok(server)
    }

    /// Disconnect everybody, stop listening and save. Returns the number of
    /// records saved.
    ///
    /// Later ticks do nothing.
    pub fn stop(&mut self) -> Result<usize, ReplicationError> {
        self.listener = None;
        let linger = self.world.settings.message_timeout;
        for client in self.world.client_ids() {
            self.world.disconnect(client, Some(SERVER_STOPPED), linger, false)?;
        }
        let records = self.save()?;
        tracing::info!(records, "server stopped");
        Ok(records)
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|listener| listener.local_addr())
    }

    pub fn is_stopped(&self) -> bool {
        self.listener.is_none()
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    pub fn update(&mut self) -> Result<(), ReplicationError> {
        self.tick(Instant::now())
    }

    /// One tick at an explicit time.
    pub fn tick(&mut self, now: Instant) -> Result<(), ReplicationError> {
        if self.is_stopped() {
            return Ok(());
        }
        self.world.now = now;
        self.world.expire_recently_deleted();
        self.accept_pending();
        self.receive_all()?;
        for client in self.world.client_ids() {
            self.world.update_client(client)?;
        }
        self.world.delete_unobserved_transients()?;
        self.flush_all()
    }

    fn accept_pending(&mut self) {
        loop {
            let Some(listener) = self.listener.as_mut() else {
                return;
            };
            let connection = match listener.accept_pending() {
                Ok(Some(connection)) => connection,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    break;
                }
            };

            if self.world.client_count() >= self.max_clients {
                tracing::warn!(peer = ?connection.peer_addr(), "server full, connection refused");
                let mut connection = connection;
                let notice = ServerMessage::Disconnect {
                    reason: SERVER_FULL.to_owned(),
                }
                .encode();
                if connection.write_all(&notice).is_ok() {
                    self.world.traffic_up.log_bytes(notice.len(), self.world.now);
                }
                connection.close(self.world.settings.message_timeout);
                continue;
            }
            self.world.attach(connection, self.frame_config.clone());
        }
    }

    fn receive_all(&mut self) -> Result<(), ReplicationError> {
        for client in self.world.client_ids() {
            let Err(err) = self.receive(client) else {
                continue;
            };
            if err.kind() == ErrorKind::Invariant {
                return Err(err);
            }
            let diagnostic = self
                .world
                .session(client)
                .and_then(|session| session.decoder.last_diagnostic())
                .map(str::to_owned);
            tracing::warn!(client = %client, %err, ?diagnostic, "protocol error, disconnecting");
            let linger = self.world.settings.message_timeout;
            self.world.disconnect(client, None, linger, false)?;
        }
        Ok(())
    }

    /// Drain one client's socket and dispatch every complete message.
    fn receive(&mut self, client: ClientId) -> Result<(), ReplicationError> {
        let Some(session) = self.world.clients.get(&client) else {
            return Ok(());
        };
        let mut buf = vec![0u8; session.connection.receive_buffer_size().max(1)];

        loop {
            let Some(session) = self.world.clients.get_mut(&client) else {
                return Ok(());
            };
            match session.connection.read_available(&mut buf)? {
                ReadOutcome::Data(n) => {
                    session.decoder.feed(&buf[..n]);
                    self.world.traffic_down.log_bytes(n, self.world.now);
                }
                ReadOutcome::WouldBlock => return Ok(()),
                ReadOutcome::Closed => {
                    tracing::debug!(client = %client, "peer closed the connection");
                    let linger = self.world.settings.message_timeout;
                    return self.world.disconnect(client, None, linger, false);
                }
            }

            loop {
                let Some(session) = self.world.clients.get_mut(&client) else {
                    return Ok(());
                };
                let Some(frame) = session.decoder.next_frame()? else {
                    break;
                };
                let message = ClientMessage::decode(&frame)?;
                self.world.dispatch(client, message)?;
            }
        }
    }

    fn flush_all(&mut self) -> Result<(), ReplicationError> {
        let now = self.world.now;
        let mut failed = Vec::new();
        for (&client, session) in self.world.clients.iter_mut() {
            if let Err(err) = flush(session, &mut self.world.traffic_up, now) {
                tracing::debug!(client = %client, %err, "write failed");
                failed.push(client);
            }
        }

        // the channel is already broken, no notice
        let linger = self.world.settings.message_timeout;
        for client in failed {
            self.world.disconnect(client, None, linger, false)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Collaborator operations
    // -----------------------------------------------------------------------

    /// Create a representation server-side. Slots 0..3 hold `position`,
    /// `extra` follows.
    ///
    /// Returns `None` if the prefab is not registered. A child is loaded on
    /// every client that has its parent; a top-level object is picked up by
    /// the next proximity scan. A transient top-level object nobody is in
    /// range of is deleted at the end of that tick.
    pub fn create(
        &mut self,
        prefab: &str,
        position: Vec3,
        parent: Option<i32>,
        extra: Vec<Vec<u8>>,
    ) -> Result<Option<i32>, ReplicationError> {
        let record = RepresentationRecord::at_position(prefab, parent.unwrap_or(0), position, extra);
        let Some(node) = self.world.instantiate(record)? else {
            return Ok(None);
        };
        if let Some(Parent::Node(parent)) = self.world.tree.parent(node) {
            for client in self.world.observers(parent, None) {
                self.world.load(client, node, false)?;
            }
        }
        Ok(Some(self.world.network_id(node)))
    }

    /// Delete a representation everywhere. Returns `false` for unknown ids.
    pub fn delete(&mut self, network_id: i32) -> Result<bool, ReplicationError> {
        let Some(&node) = self.world.ids.get(&network_id) else {
            return Ok(false);
        };
        self.world.delete_node(node, None, false, true)?;
        Ok(true)
    }

    /// Move a representation, telling every client that has it loaded.
    pub fn teleport(&mut self, network_id: i32, position: Vec3) -> Result<bool, ReplicationError> {
        let Some(&node) = self.world.ids.get(&network_id) else {
            return Ok(false);
        };
        for axis in 0..POSITION_SLOTS {
            let bytes = codec::encode_float(position[axis]).to_vec();
            self.world.set_variable(node, None, axis as i32, bytes)?;
        }
        Ok(true)
    }

    /// Delete every live representation of `prefab`. Returns how many were
    /// deleted directly (children removed with a parent are not counted).
    pub fn delete_all_with_prefab(&mut self, prefab: &str) -> Result<usize, ReplicationError> {
        let matching: Vec<i32> = self
            .world
            .network_ids()
            .into_iter()
            .filter(|&id| self.world.representation(id).is_some_and(|rep| rep.prefab() == prefab))
            .collect();

        let mut deleted = 0;
        for id in matching {
            if self.delete(id)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub fn prefab_info(&self, prefab: &str) -> Option<PrefabInfo> {
        self.world.prefab_info(prefab)
    }

    pub fn representation(&self, network_id: i32) -> Option<&Representation> {
        self.world.representation(network_id)
    }

    pub fn client_count(&self) -> usize {
        self.world.client_count()
    }

    /// Human-readable status.
    pub fn info(&mut self) -> String {
        let now = Instant::now();
        let status = match &self.listener {
            Some(listener) => format!(
                "Server listening on {}",
                listener
                    .local_addr()
                    .map_or_else(|| "<in-process>".to_string(), |addr| addr.to_string())
            ),
            None => "Server stopped".to_string(),
        };
        let [active, inactive, deleted] = self.world.tree.root_counts();
        format!(
            "{status}\n    \
             Connected clients  : {}\n    \
             Representations    : {}\n    \
             Graph nodes        : {active} active, {inactive} inactive, {deleted} deleted\n    \
             Recently deleted   : {}\n    \
             Upload             : {}\n    \
             Download           : {}",
            self.world.client_count(),
            self.world.representation_count(),
            self.world.recently_deleted_count(),
            self.world.traffic_up.usage(now),
            self.world.traffic_down.usage(now),
        )
    }

    // -----------------------------------------------------------------------
    // Saves
    // -----------------------------------------------------------------------

    pub fn saves_dir(&self) -> &Path {
        &self.saves_dir
    }

    pub fn save_file(&self) -> PathBuf {
        persistence::save_path(&self.saves_dir, &self.save_name)
    }

    pub fn existing_saves(&self) -> io::Result<Vec<PathBuf>> {
        persistence::existing_saves(&self.saves_dir)
    }

    pub fn save_exists(&self, name: &str) -> bool {
        persistence::save_exists(&self.saves_dir, name)
    }

    pub fn save(&self) -> Result<usize, ReplicationError> {
        self.world.save_to(&self.save_file())
    }

    /// Upload and download monitors.
    pub fn traffic(&self) -> (&TrafficMonitor, &TrafficMonitor) {
        (&self.world.traffic_up, &self.world.traffic_down)
    }
}

/// Write a client's queue, packing messages into send-buffer sized writes.
/// A message larger than the buffer goes out on its own.
fn flush(session: &mut ClientSession, traffic: &mut TrafficMonitor, now: Instant) -> io::Result<()> {
    let capacity = session.connection.send_buffer_size().max(1);
    let mut chunk: Vec<u8> = Vec::with_capacity(capacity);

    while let Some(message) = session.outbound.pop_front() {
        if !chunk.is_empty() && chunk.len() + message.len() > capacity {
            session.connection.write_all(&chunk)?;
            traffic.log_bytes(chunk.len(), now);
            chunk.clear();
        }
        if message.len() > capacity {
            session.connection.write_all(&message)?;
            traffic.log_bytes(message.len(), now);
            continue;
        }
        chunk.extend_from_slice(&message);
    }

    if !chunk.is_empty() {
        session.connection.write_all(&chunk)?;
        traffic.log_bytes(chunk.len(), now);
    }
    Ok(())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
