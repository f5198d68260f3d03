//! Per-connection state and the client lifecycle: login, load/unload,
//! the per-tick proximity scan, timeouts and disconnect.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use glam::Vec3;
use meridian_net::{Connection, FrameConfig, FrameDecoder, ServerMessage};
use rustc_hash::FxHashSet;

use crate::error::ReplicationError;
use crate::hierarchy::{NodeId, Parent, Root};
use crate::interest::{self, InterestTransitions, within_range};
use crate::world::World;

pub const USERNAME_IN_USE: &str = "Username already in use.";
pub const INACTIVITY: &str = "Disconnected due to inactivity";
pub const TIMED_OUT: &str = "Timed out";

/// Identifies one connection for its lifetime. Assigned in connection order
/// and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct ClientSession {
    pub(crate) id: ClientId,
    pub(crate) username: Option<String>,
    /// Carried opaque; never verified here.
    pub(crate) credentials: Vec<u8>,
    pub(crate) player: Option<NodeId>,
    /// Id reserved by a FORCE_CREATE, until the client answers with CREATE.
    pub(crate) pending_player: Option<i32>,
    pub(crate) loaded: FxHashSet<NodeId>,
    pub(crate) render_range: f32,
    pub(crate) last_message_time: Instant,
    pub(crate) last_active_time: Instant,
    /// Player position the other clients were last told about.
    pub(crate) last_updated_position: Vec3,
    pub(crate) outbound: VecDeque<Vec<u8>>,
    pub(crate) connection: Box<dyn Connection>,
    pub(crate) decoder: FrameDecoder,
}

impl ClientSession {
    pub(crate) fn new(
        id: ClientId,
        connection: Box<dyn Connection>,
        frame_config: FrameConfig,
        render_range: f32,
        now: Instant,
    ) -> Self {
        Self {
            id,
            username: None,
            credentials: Vec::new(),
            player: None,
            pending_player: None,
            loaded: FxHashSet::default(),
            render_range,
            last_message_time: now,
            last_active_time: now,
            last_updated_position: Vec3::ZERO,
            outbound: VecDeque::new(),
            connection,
            decoder: FrameDecoder::new(frame_config),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn credentials(&self) -> &[u8] {
        &self.credentials
    }
}

impl World {
    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Connected clients in connection order.
    pub fn connected_clients(&self) -> Vec<ClientId> {
        self.client_ids()
    }

    pub fn session(&self, client: ClientId) -> Option<&ClientSession> {
        self.clients.get(&client)
    }

    /// Network id of the client's player, once assigned.
    pub fn player_of(&self, client: ClientId) -> Option<i32> {
        let node = self.clients.get(&client)?.player?;
        Some(self.network_id(node))
    }

    /// Network ids loaded on a client, ascending.
    pub fn loaded_network_ids(&self, client: ClientId) -> Vec<i32> {
        let Some(session) = self.clients.get(&client) else {
            return Vec::new();
        };
        let mut ids: Vec<i32> = session
            .loaded
            .iter()
            .map(|&node| self.network_id(node))
            .collect();
        ids.sort_unstable();
        ids
    }

    fn player_position(&self, client: ClientId) -> Option<Vec3> {
        let node = self.clients.get(&client)?.player?;
        self.rep(node).map(|rep| rep.position)
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Register a freshly accepted connection.
    pub(crate) fn attach(
        &mut self,
        connection: Box<dyn Connection>,
        frame_config: FrameConfig,
    ) -> ClientId {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        tracing::info!(client = %id, peer = ?connection.peer_addr(), "client connected");
        let session = ClientSession::new(
            id,
            connection,
            frame_config,
            self.settings.initial_render_range,
            self.now,
        );
        self.clients.insert(id, session);
        id
    }

    pub(crate) fn login(
        &mut self,
        client: ClientId,
        username: String,
        credentials: Vec<u8>,
    ) -> Result<(), ReplicationError> {
        let session = self
            .clients
            .get(&client)
            .ok_or(ReplicationError::UnknownClient(client))?;
        if session.username.is_some() {
            return Err(ReplicationError::AlreadyLoggedIn(client));
        }

        let in_use = self
            .clients
            .values()
            .any(|other| other.username.as_deref() == Some(username.as_str()));
        if in_use {
            tracing::info!(client = %client, %username, "rejected login, username in use");
            let linger = self.settings.message_timeout;
            return self.disconnect(client, Some(USERNAME_IN_USE), linger, false);
        }

        if let Some(session) = self.clients.get_mut(&client) {
            session.username = Some(username.clone());
            session.credentials = credentials;
        }
        tracing::info!(client = %client, %username, "client logged in");

        let returning = self
            .players
            .get(&username)
            .copied()
            .filter(|&node| self.is_live(node));
        match returning {
            Some(player) => {
                self.tree.set_parent(player, Parent::Root(Root::Active));
                self.assign_player(client, player)?;
                self.load(client, player, false)?;
            }
            None => {
                let network_id = self.next_network_id();
                if let Some(session) = self.clients.get_mut(&client) {
                    session.pending_player = Some(network_id);
                }
                let prefab = self.settings.player_prefab.clone();
                self.send(
                    client,
                    ServerMessage::ForceCreate {
                        position: Vec3::ZERO,
                        prefab,
                        network_id,
                        parent_id: 0,
                    },
                );
            }
        }

        // roster of everyone already here
        let roster: Vec<(String, Vec3)> = self
            .clients
            .iter()
            .filter(|(id, _)| **id != client)
            .filter_map(|(&id, other)| {
                Some((other.username.clone()?, self.player_position(id)?))
            })
            .collect();
        for (username, position) in roster {
            self.send(
                client,
                ServerMessage::PlayerUpdate {
                    username,
                    position,
                    connected: true,
                },
            );
        }
        Ok(())
    }

    /// Bind a player representation to a client. Happens once per session.
    pub(crate) fn assign_player(
        &mut self,
        client: ClientId,
        node: NodeId,
    ) -> Result<(), ReplicationError> {
        let position = self.rep(node).map_or(Vec3::ZERO, |rep| rep.position);
        let session = self
            .clients
            .get_mut(&client)
            .ok_or(ReplicationError::UnknownClient(client))?;
        if session.player.is_some() {
            return Err(ReplicationError::PlayerAlreadyAssigned(client));
        }
        session.player = Some(node);
        session.pending_player = None;
        session.last_updated_position = position;

        let Some(username) = session.username.clone() else {
            return Ok(());
        };
        self.players.insert(username.clone(), node);
        for other in self.client_ids() {
            if other != client {
                self.send(
                    other,
                    ServerMessage::PlayerUpdate {
                        username: username.clone(),
                        position,
                        connected: true,
                    },
                );
            }
        }
        Ok(())
    }

    /// Tear a client down.
    ///
    /// Its loaded objects are unloaded, `reason` (if any) is written straight
    /// to the socket, and the socket is closed with `linger` to drain. The
    /// player is then deleted or parked under the inactive root.
    pub(crate) fn disconnect(
        &mut self,
        client: ClientId,
        reason: Option<&str>,
        linger: Duration,
        delete_player: bool,
    ) -> Result<(), ReplicationError> {
        let Some(session) = self.clients.get(&client) else {
            return Ok(());
        };
        let username = session.username.clone();
        let player = session.player;
        let position = self.player_position(client).unwrap_or(Vec3::ZERO);
        tracing::info!(
            client = %client,
            username = username.as_deref().unwrap_or("-"),
            reason = reason.unwrap_or("none"),
            "client disconnected"
        );

        // unload only the top of each loaded subtree; children follow
        let tops = interest::sorted(session.loaded.iter().copied().filter(|&node| {
            match self.tree.parent(node) {
                Some(Parent::Node(parent)) => !session.loaded.contains(&parent),
                _ => true,
            }
        }));
        for node in tops {
            if self.has_loaded(client, node) {
                self.unload(client, node, false, true)?;
            }
        }

        let Some(mut session) = self.clients.remove(&client) else {
            return Ok(());
        };
        if let Some(reason) = reason {
            let bytes = ServerMessage::Disconnect {
                reason: reason.to_owned(),
            }
            .encode();
            match session.connection.write_all(&bytes) {
                Ok(()) => self.traffic_up.log_bytes(bytes.len(), self.now),
                Err(err) => tracing::debug!(client = %client, %err, "disconnect notice not delivered"),
            }
        }
        session.connection.close(linger);

        if let Some(player) = player {
            if delete_player {
                self.delete_node(player, None, false, true)?;
            } else {
                for other in self.observers(player, None) {
                    self.unload(other, player, false, false)?;
                }
            }

            if self.is_live(player) {
                self.tree.set_parent(player, Parent::Root(Root::Inactive));
            } else if let Some(name) = &username
                && self.players.get(name) == Some(&player)
            {
                self.players.remove(name);
            }
        }

        if let Some(username) = username {
            for other in self.client_ids() {
                self.send(
                    other,
                    ServerMessage::PlayerUpdate {
                        username: username.clone(),
                        position,
                        connected: false,
                    },
                );
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Load / unload
    // -----------------------------------------------------------------------

    /// Load `node` and its subtree on a client.
    ///
    /// `already_created` means the client built the object itself, so no
    /// CREATE is sent; such an object cannot have children yet.
    pub(crate) fn load(
        &mut self,
        client: ClientId,
        node: NodeId,
        already_created: bool,
    ) -> Result<(), ReplicationError> {
        if !self.clients.contains_key(&client) {
            return Err(ReplicationError::UnknownClient(client));
        }
        if already_created && !self.tree.children(node).is_empty() {
            return Err(ReplicationError::CreatedWithChildren(self.network_id(node)));
        }

        for loading in self.tree.descendants(node) {
            if !already_created {
                let serialization = self.serialize(loading);
                self.send(client, ServerMessage::Create { serialization });
            }
            if let Some(session) = self.clients.get_mut(&client) {
                session.loaded.insert(loading);
            }
            self.on_load_on(loading, client);
        }
        Ok(())
    }

    /// Unload `node` and its subtree from a client. Every node must be
    /// loaded there.
    pub(crate) fn unload(
        &mut self,
        client: ClientId,
        node: NodeId,
        deleting: bool,
        already_removed: bool,
    ) -> Result<(), ReplicationError> {
        for unloading in self.tree.descendants(node) {
            let session = self
                .clients
                .get_mut(&client)
                .ok_or(ReplicationError::UnknownClient(client))?;
            if !session.loaded.remove(&unloading) {
                return Err(ReplicationError::NotLoaded {
                    client,
                    network_id: self.network_id(unloading),
                });
            }
            self.on_unload_on(unloading, client)?;
        }

        if !already_removed {
            let network_id = self.network_id(node);
            self.send(client, ServerMessage::Unload { network_id, deleting });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Per-tick update
    // -----------------------------------------------------------------------

    /// Proximity scan, roster broadcast and timeout checks for one client.
    pub(crate) fn update_client(&mut self, client: ClientId) -> Result<(), ReplicationError> {
        let Some(session) = self.clients.get(&client) else {
            return Ok(());
        };

        if let Some(player) = session.player
            && let Some(viewer) = self.rep(player).map(|rep| rep.position)
        {
            let range = session.render_range;
            // the client's own player is never subject to proximity
            let candidates: Vec<(NodeId, bool)> = self
                .tree
                .root_children(Root::Active)
                .iter()
                .filter(|&&node| node != player)
                .filter_map(|&node| {
                    let rep = self.rep(node)?;
                    Some((node, within_range(viewer, rep.position, rep.radius(), range)))
                })
                .collect();
            let transitions =
                InterestTransitions::compute(candidates, |node| session.loaded.contains(&node));

            for node in transitions.exited {
                if self.has_loaded(client, node) {
                    self.unload(client, node, false, false)?;
                }
            }
            for node in transitions.entered {
                if self.is_live(node) && !self.has_loaded(client, node) {
                    self.load(client, node, false)?;
                }
            }

            self.broadcast_movement(client, viewer);
        }

        if self.settings.enforce_timeouts {
            self.check_timeouts(client)?;
        }
        Ok(())
    }

    fn broadcast_movement(&mut self, client: ClientId, position: Vec3) {
        let resolution = self.settings.player_resolution;
        let Some(session) = self.clients.get_mut(&client) else {
            return;
        };
        if session.last_updated_position.distance(position) <= resolution {
            return;
        }
        session.last_updated_position = position;
        let Some(username) = session.username.clone() else {
            return;
        };

        for other in self.client_ids() {
            if other != client {
                self.send(
                    other,
                    ServerMessage::PlayerUpdate {
                        username: username.clone(),
                        position,
                        connected: true,
                    },
                );
            }
        }
    }

    fn check_timeouts(&mut self, client: ClientId) -> Result<(), ReplicationError> {
        let Some(session) = self.clients.get(&client) else {
            return Ok(());
        };
        let idle = self.now.saturating_duration_since(session.last_active_time);
        let silent = self.now.saturating_duration_since(session.last_message_time);
        let linger = self.settings.disconnect_linger;

        if idle > self.settings.activity_timeout {
            return self.disconnect(client, Some(INACTIVITY), linger, false);
        }
        if silent > self.settings.message_timeout {
            return self.disconnect(client, Some(TIMED_OUT), linger, false);
        }
        Ok(())
    }
}
