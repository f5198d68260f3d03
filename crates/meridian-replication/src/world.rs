//! Server-side replication state: the representation graph, the id table,
//! connected clients, and the operations that keep them consistent.
//!
//! Everything here runs on the tick thread; no operation is re-entered from
//! another thread, so plain `&mut self` is the only synchronization.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use meridian_config::Config;
use meridian_net::{ServerMessage, TrafficMonitor};
use rustc_hash::FxHashMap;

use crate::error::ReplicationError;
use crate::hierarchy::{Hierarchy, NodeId, Parent, Root};
use crate::prefab::{PrefabInfo, PrefabRegistry};
use crate::representation::{Representation, RepresentationRecord};
use crate::session::{ClientId, ClientSession};

/// Tunables the world needs at runtime.
#[derive(Debug, Clone)]
pub struct WorldSettings {
    pub player_prefab: String,
    pub initial_render_range: f32,
    /// Distance a player must move before others are told.
    pub player_resolution: f32,
    pub message_timeout: Duration,
    pub activity_timeout: Duration,
    /// Drain window when closing a timed-out client.
    pub disconnect_linger: Duration,
    pub recently_deleted_window: Duration,
    /// Off when hosted in a development environment that may pause.
    pub enforce_timeouts: bool,
}

impl WorldSettings {
    pub fn from_config(config: &Config) -> Self {
        let session = &config.session;
        Self {
            player_prefab: config.world.player_prefab.clone(),
            initial_render_range: session.initial_render_range,
            player_resolution: session.player_resolution,
            message_timeout: secs(session.message_timeout_secs),
            activity_timeout: secs(session.activity_timeout_secs),
            disconnect_linger: secs(session.disconnect_linger_secs),
            recently_deleted_window: secs(session.recently_deleted_secs),
            enforce_timeouts: !session.dev_host,
        }
    }
}

/// Negative or non-finite values read as zero.
fn secs(value: f32) -> Duration {
    Duration::try_from_secs_f32(value).unwrap_or(Duration::ZERO)
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct World {
    pub(crate) tree: Hierarchy<Representation>,
    /// Live representations by network id.
    pub(crate) ids: FxHashMap<i32, NodeId>,
    /// Freed ids with the time they were freed and the node they named.
    pub(crate) recently_deleted: FxHashMap<i32, (Instant, NodeId)>,
    /// Player representation per username, connected or not.
    pub(crate) players: BTreeMap<String, NodeId>,
    pub(crate) clients: BTreeMap<ClientId, ClientSession>,
    pub(crate) registry: PrefabRegistry,
    pub(crate) settings: WorldSettings,
    pub(crate) last_network_id: i32,
    pub(crate) next_client_id: u64,
    pub(crate) now: Instant,
    pub(crate) traffic_up: TrafficMonitor,
    pub(crate) traffic_down: TrafficMonitor,
}

impl World {
    pub fn new(registry: PrefabRegistry, settings: WorldSettings, now: Instant) -> Self {
        Self {
            tree: Hierarchy::new(),
            ids: FxHashMap::default(),
            recently_deleted: FxHashMap::default(),
            players: BTreeMap::new(),
            clients: BTreeMap::new(),
            registry,
            settings,
            last_network_id: 0,
            next_client_id: 1,
            now,
            traffic_up: TrafficMonitor::default(),
            traffic_down: TrafficMonitor::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    pub fn registry(&self) -> &PrefabRegistry {
        &self.registry
    }

    pub fn prefab_info(&self, prefab: &str) -> Option<PrefabInfo> {
        self.registry.get(prefab)
    }

    pub fn representation(&self, network_id: i32) -> Option<&Representation> {
        self.ids.get(&network_id).and_then(|&node| self.tree.get(node))
    }

    /// Ids of every live representation, ascending.
    pub fn network_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.ids.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn representation_count(&self) -> usize {
        self.ids.len()
    }

    pub fn recently_deleted_count(&self) -> usize {
        self.recently_deleted.len()
    }

    pub fn was_recently_deleted(&self, network_id: i32) -> bool {
        self.recently_deleted.contains_key(&network_id)
    }

    /// Root a live representation hangs under.
    pub fn root_of(&self, network_id: i32) -> Option<Root> {
        self.ids.get(&network_id).and_then(|&node| self.tree.root_of(node))
    }

    pub fn parent_of(&self, network_id: i32) -> Option<i32> {
        let node = *self.ids.get(&network_id)?;
        match self.tree.parent(node)? {
            Parent::Node(parent) => self.tree.get(parent).map(|r| r.network_id),
            Parent::Root(_) => Some(0),
        }
    }

    /// Player representation of `username`, connected or not.
    pub fn player(&self, username: &str) -> Option<&Representation> {
        let node = *self.players.get(username)?;
        self.is_live(node).then(|| self.tree.get(node)).flatten()
    }

    pub(crate) fn rep(&self, node: NodeId) -> Option<&Representation> {
        self.tree.get(node)
    }

    pub(crate) fn network_id(&self, node: NodeId) -> i32 {
        self.tree.get(node).map_or(0, |r| r.network_id)
    }

    /// In the tree and not on its way out.
    pub(crate) fn is_live(&self, node: NodeId) -> bool {
        matches!(
            self.tree.root_of(node),
            Some(Root::Active) | Some(Root::Inactive)
        )
    }

    pub(crate) fn serialize(&self, node: NodeId) -> Vec<u8> {
        let parent_id = match self.tree.parent(node) {
            Some(Parent::Node(parent)) => self.network_id(parent),
            _ => 0,
        };
        self.tree
            .get(node)
            .map(|rep| rep.serialize(parent_id))
            .unwrap_or_default()
    }

    pub(crate) fn next_network_id(&mut self) -> i32 {
        self.last_network_id += 1;
        self.last_network_id
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Queue a message for a client. Unknown clients are ignored.
    pub(crate) fn send(&mut self, client: ClientId, message: ServerMessage) {
        if let Some(session) = self.clients.get_mut(&client) {
            session.outbound.push_back(message.encode());
        }
    }

    pub(crate) fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub(crate) fn has_loaded(&self, client: ClientId, node: NodeId) -> bool {
        self.clients
            .get(&client)
            .is_some_and(|session| session.loaded.contains(&node))
    }

    /// Connected clients other than `except` that have `node` loaded.
    pub(crate) fn observers(&self, node: NodeId, except: Option<ClientId>) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|(id, session)| Some(**id) != except && session.loaded.contains(&node))
            .map(|(id, _)| *id)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Authority
    // -----------------------------------------------------------------------

    /// Current holder; a holder that is no longer connected reads as none.
    pub(crate) fn authority(&self, node: NodeId) -> Option<ClientId> {
        self.tree
            .get(node)
            .and_then(|rep| rep.authority)
            .filter(|client| self.clients.contains_key(client))
    }

    pub fn authority_of(&self, network_id: i32) -> Option<ClientId> {
        self.ids.get(&network_id).and_then(|&node| self.authority(node))
    }

    /// Hand authority over, telling the old and new holders.
    pub(crate) fn set_authority(&mut self, node: NodeId, holder: Option<ClientId>) {
        let previous = self.authority(node);
        let Some(rep) = self.tree.get_mut(node) else {
            return;
        };
        let network_id = rep.network_id;
        rep.authority = holder;

        if let Some(previous) = previous {
            self.send(previous, ServerMessage::LoseAuth { network_id });
        }
        if let Some(holder) = holder {
            tracing::debug!(network_id, client = %holder, "authority granted");
            self.send(holder, ServerMessage::GainAuth { network_id });
        }
    }

    /// `client` just loaded `node`.
    pub(crate) fn on_load_on(&mut self, node: NodeId, client: ClientId) {
        if self.authority(node).is_none() {
            self.set_authority(node, Some(client));
        }
    }

    /// `client` just unloaded `node`.
    pub(crate) fn on_unload_on(
        &mut self,
        node: NodeId,
        client: ClientId,
    ) -> Result<(), ReplicationError> {
        let is_own_player = self
            .clients
            .get(&client)
            .is_some_and(|session| session.player == Some(node));
        if is_own_player {
            return Ok(());
        }

        if self.authority(node) == Some(client) {
            // no LOSE_AUTH for a client that no longer has the object
            if let Some(rep) = self.tree.get_mut(node) {
                rep.authority = None;
            }
            if let Some(&successor) = self.observers(node, None).first() {
                self.set_authority(node, Some(successor));
            }
        }

        let persistent = self.tree.get(node).is_some_and(|rep| rep.info.persistent);
        if self.authority(node).is_none() && !persistent {
            self.delete_node(node, None, false, false)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Build a representation from a decoded record and register it.
    ///
    /// Returns `Ok(None)` when the prefab is unknown, or when the parent was
    /// deleted moments ago; neither is an error.
    pub(crate) fn instantiate(
        &mut self,
        record: RepresentationRecord,
    ) -> Result<Option<NodeId>, ReplicationError> {
        let Some(info) = self.registry.get(&record.prefab) else {
            tracing::warn!(prefab = %record.prefab, "unknown prefab, representation not created");
            return Ok(None);
        };

        let parent = if record.parent_id > 0 {
            match self.ids.get(&record.parent_id) {
                Some(&node) => Parent::Node(node),
                None if self.was_recently_deleted(record.parent_id) => {
                    tracing::debug!(
                        parent_id = record.parent_id,
                        "parent was just deleted, child dropped"
                    );
                    return Ok(None);
                }
                None => {
                    return Err(ReplicationError::UnknownParent {
                        parent_id: record.parent_id,
                    });
                }
            }
        } else {
            Parent::Root(Root::Active)
        };

        let network_id = match record.input_id {
            id if id < 0 => self.next_network_id(),
            0 => return Err(ReplicationError::InvalidId(0)),
            id if self.ids.contains_key(&id) => return Err(ReplicationError::IdInUse(id)),
            id => {
                self.last_network_id = self.last_network_id.max(id);
                id
            }
        };

        let mut rep = Representation::new(network_id, record.prefab, info);
        for (index, bytes) in record.slots.into_iter().enumerate() {
            rep.set_serialization(index, bytes)?;
        }

        let node = self.tree.insert(rep, parent);
        self.ids.insert(network_id, node);
        Ok(Some(node))
    }

    /// Tear down a representation and its subtree.
    ///
    /// Unless `check_clients` is false it is first unloaded from every
    /// client; the issuing client already removed it locally so it gets no
    /// UNLOAD. Ids move to the recently-deleted set.
    pub(crate) fn delete_node(
        &mut self,
        node: NodeId,
        issued_from: Option<ClientId>,
        response_requested: bool,
        check_clients: bool,
    ) -> Result<(), ReplicationError> {
        if !self.is_live(node) {
            return Ok(());
        }
        let network_id = self.network_id(node);

        if check_clients {
            for client in self.client_ids() {
                if self.has_loaded(client, node) {
                    self.unload(client, node, true, Some(client) == issued_from)?;
                }
            }
        }

        self.tree.set_parent(node, Parent::Root(Root::Deleted));

        for removed in self.tree.descendants(node) {
            let id = self.network_id(removed);
            if self.ids.get(&id) == Some(&removed) {
                self.ids.remove(&id);
            }
            self.recently_deleted.insert(id, (self.now, removed));
        }
        tracing::debug!(network_id, "representation deleted");

        if response_requested && let Some(client) = issued_from {
            self.send(client, ServerMessage::DeleteSuccess { network_id });
        }
        Ok(())
    }

    /// Store a variable and forward it to every other observer.
    pub(crate) fn set_variable(
        &mut self,
        node: NodeId,
        sender: Option<ClientId>,
        index: i32,
        serialization: Vec<u8>,
    ) -> Result<(), ReplicationError> {
        let slot = usize::try_from(index).map_err(|_| ReplicationError::NegativeSlot(index))?;
        let Some(rep) = self.tree.get_mut(node) else {
            return Ok(());
        };
        let network_id = rep.network_id;
        rep.set_serialization(slot, serialization.clone())?;

        for client in self.observers(node, sender) {
            self.send(
                client,
                ServerMessage::VariableUpdate {
                    network_id,
                    index,
                    serialization: serialization.clone(),
                },
            );
        }
        Ok(())
    }

    /// Fire a numbered event on every other observer.
    pub(crate) fn trigger(&mut self, node: NodeId, sender: Option<ClientId>, event: i32) {
        let network_id = self.network_id(node);
        for client in self.observers(node, sender) {
            self.send(client, ServerMessage::Trigger { network_id, event });
        }
    }

    /// Forget ids freed more than the recently-deleted window ago, and drop
    /// their nodes from the arena.
    pub(crate) fn expire_recently_deleted(&mut self) {
        let now = self.now;
        let window = self.settings.recently_deleted_window;
        let expired: Vec<(i32, NodeId)> = self
            .recently_deleted
            .iter()
            .filter(|(_, (at, _))| now.saturating_duration_since(*at) > window)
            .map(|(&id, &(_, node))| (id, node))
            .collect();

        for (id, node) in expired {
            self.recently_deleted.remove(&id);
            if self.tree.parent(node) == Some(Parent::Root(Root::Deleted)) {
                self.tree.remove_subtree(node);
            }
        }
    }

    /// Delete top-level transient representations that no client has
    /// loaded. Returns how many were deleted.
    ///
    /// Runs after the proximity scans, so anything still unobserved is out
    /// of every client's range. Player representations wait for their owner.
    pub(crate) fn delete_unobserved_transients(&mut self) -> Result<usize, ReplicationError> {
        let unobserved: Vec<NodeId> = self
            .tree
            .root_children(Root::Active)
            .iter()
            .copied()
            .filter(|&node| self.rep(node).is_some_and(|rep| !rep.info.persistent))
            .filter(|node| !self.players.values().any(|player| player == node))
            .filter(|&node| self.observers(node, None).is_empty())
            .collect();

        for &node in &unobserved {
            tracing::debug!(network_id = self.network_id(node), "transient out of range, deleting");
            self.delete_node(node, None, false, false)?;
        }
        Ok(unobserved.len())
    }

    /// Look up a live representation named in a client message.
    ///
    /// Unknown ids are expected shortly after a delete; anything else is
    /// logged.
    pub(crate) fn lookup_for_message(&self, network_id: i32, kind: &'static str) -> Option<NodeId> {
        if let Some(&node) = self.ids.get(&network_id) {
            return Some(node);
        }
        if !self.was_recently_deleted(network_id) {
            tracing::warn!(network_id, message = kind, "unknown network id (not recently deleted)");
        }
        None
    }
}

#[cfg(test)]
#[path = "world_tests.rs"]
mod tests;
