//! Inbound message handling.

use std::time::{SystemTime, UNIX_EPOCH};

use meridian_net::{ClientMessage, ServerMessage};

use crate::error::ReplicationError;
use crate::hierarchy::Parent;
use crate::representation::RepresentationRecord;
use crate::session::ClientId;
use crate::world::World;

fn unix_seconds() -> i32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() as i32)
}

impl World {
    /// Apply one decoded message from `client`.
    pub(crate) fn dispatch(
        &mut self,
        client: ClientId,
        message: ClientMessage,
    ) -> Result<(), ReplicationError> {
        let now = self.now;
        let Some(session) = self.clients.get_mut(&client) else {
            return Ok(());
        };
        session.last_message_time = now;

        match message {
            ClientMessage::Login {
                username,
                credentials,
            } => self.login(client, username, credentials),

            ClientMessage::Heartbeat { active, key } => {
                if active {
                    session.last_active_time = now;
                }
                self.send(
                    client,
                    ServerMessage::Heartbeat {
                        key,
                        unix_seconds: unix_seconds(),
                    },
                );
                Ok(())
            }

            // the client asked to leave, no notice needed
            ClientMessage::Disconnect { delete_player } => {
                let linger = self.settings.message_timeout;
                self.disconnect(client, None, linger, delete_player)
            }

            ClientMessage::Create { serialization } => self.handle_create(client, &serialization),

            ClientMessage::Delete {
                network_id,
                response_requested,
            } => {
                let Some(node) = self.lookup_for_message(network_id, "delete") else {
                    return Ok(());
                };
                self.delete_node(node, Some(client), response_requested, true)
            }

            ClientMessage::VariableUpdate {
                network_id,
                index,
                serialization,
            } => {
                let Some(node) = self.lookup_for_message(network_id, "variable update") else {
                    return Ok(());
                };
                self.set_variable(node, Some(client), index, serialization)
            }

            ClientMessage::Trigger { network_id, event } => {
                if let Some(node) = self.lookup_for_message(network_id, "trigger") {
                    self.trigger(node, Some(client), event);
                }
                Ok(())
            }

            ClientMessage::RenderRangeUpdate { range } => {
                session.render_range = range;
                Ok(())
            }
        }
    }

    /// A client built an object locally (or answered a FORCE_CREATE).
    fn handle_create(
        &mut self,
        client: ClientId,
        serialization: &[u8],
    ) -> Result<(), ReplicationError> {
        let record = RepresentationRecord::parse(serialization)?;
        let local_id = record.input_id;

        // a positive id can only be the player id reserved at login
        let forced = local_id > 0;
        if forced {
            let pending = self.clients.get(&client).and_then(|s| s.pending_player);
            if pending != Some(local_id) || record.prefab != self.settings.player_prefab {
                return Err(ReplicationError::UnexpectedForcedCreate {
                    client,
                    network_id: local_id,
                    prefab: record.prefab,
                });
            }
        }

        let Some(node) = self.instantiate(record)? else {
            return Ok(());
        };
        if forced {
            self.assign_player(client, node)?;
        }

        // acknowledge before any load so the creator knows the real id first
        let network_id = self.network_id(node);
        self.send(
            client,
            ServerMessage::CreationSuccess {
                local_id,
                network_id,
            },
        );
        self.load(client, node, true)?;

        if let Some(Parent::Node(parent)) = self.tree.parent(node) {
            for other in self.observers(parent, Some(client)) {
                self.load(other, node, false)?;
            }
        }
        Ok(())
    }
}
