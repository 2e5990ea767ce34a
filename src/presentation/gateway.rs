//! Gateway Fan-In
//!
//! The subscriber side of the broadcast layer as one gateway process sees
//! it. Each gateway tunes in to the channels for the conversations and
//! users it currently serves, and on every incoming payload consults the
//! presence registry to decide which of its local sockets should receive
//! it. Presence itself is an external collaborator; only its interface
//! lives here.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::infrastructure::broadcast::{channels, RedisBroadcaster, Subscription};
use crate::shared::error::EventError;

/// Where a user's live connection is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRef {
    pub gateway_instance: String,
    pub socket_id: String,
}

/// Collaborator mapping users to the gateway instances and sockets holding
/// their live connections.
#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    async fn resolve_sockets(&self, user_id: &str) -> Result<Vec<SocketRef>, EventError>;
}

/// In-memory presence registry for tests and single-node setups.
#[derive(Default)]
pub struct InMemoryPresenceRegistry {
    sockets: DashMap<String, Vec<SocketRef>>,
}

impl InMemoryPresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, user_id: &str, socket: SocketRef) {
        self.sockets.entry(user_id.to_owned()).or_default().push(socket);
    }

    pub fn disconnect(&self, user_id: &str, socket_id: &str) {
        if let Some(mut entry) = self.sockets.get_mut(user_id) {
            entry.retain(|s| s.socket_id != socket_id);
        }
    }
}

#[async_trait]
impl PresenceRegistry for InMemoryPresenceRegistry {
    async fn resolve_sockets(&self, user_id: &str) -> Result<Vec<SocketRef>, EventError> {
        Ok(self
            .sockets
            .get(user_id)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }
}

/// One gateway process's local delivery state.
pub struct GatewayFanout<P> {
    instance_id: String,
    /// Local sockets by socket id
    sockets: DashMap<String, mpsc::UnboundedSender<Value>>,
    presence: Arc<P>,
}

impl<P> GatewayFanout<P>
where
    P: PresenceRegistry + 'static,
{
    pub fn new(instance_id: impl Into<String>, presence: Arc<P>) -> Self {
        Self {
            instance_id: instance_id.into(),
            sockets: DashMap::new(),
            presence,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register a local socket's outbound sender.
    pub fn register_socket(&self, socket_id: impl Into<String>, sender: mpsc::UnboundedSender<Value>) {
        self.sockets.insert(socket_id.into(), sender);
    }

    pub fn unregister_socket(&self, socket_id: &str) {
        self.sockets.remove(socket_id);
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Deliver a payload to every local socket the presence registry maps
    /// the user to on this instance. Sockets on other instances are theirs
    /// to serve; stale registry entries are skipped. Returns how many local
    /// sockets were reached.
    pub async fn deliver_to_user(&self, user_id: &str, payload: &Value) -> Result<usize, EventError> {
        let mut delivered = 0;
        for socket_ref in self.presence.resolve_sockets(user_id).await? {
            if socket_ref.gateway_instance != self.instance_id {
                continue;
            }
            match self.sockets.get(&socket_ref.socket_id) {
                Some(sender) => {
                    if sender.send(payload.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                None => {
                    debug!(
                        user_id,
                        socket_id = %socket_ref.socket_id,
                        "Stale presence entry; socket no longer local"
                    );
                }
            }
        }
        Ok(delivered)
    }

    /// Tune in to a conversation's channel; each incoming payload fans out
    /// to this instance's sockets for the given participants.
    pub fn serve_conversation(
        self: &Arc<Self>,
        broadcaster: &RedisBroadcaster,
        conversation_id: &str,
        participant_ids: Vec<String>,
    ) -> Subscription {
        let gateway = Arc::clone(self);
        broadcaster.subscribe::<Value, _>(&channels::conversation(conversation_id), move |payload| {
            let gateway = Arc::clone(&gateway);
            let participant_ids = participant_ids.clone();
            tokio::spawn(async move {
                for user_id in &participant_ids {
                    if let Err(error) = gateway.deliver_to_user(user_id, &payload).await {
                        warn!(user_id, %error, "Local delivery failed");
                    }
                }
            });
        })
    }

    /// Tune in to a user's personal channel (blocks, privacy, receipts).
    pub fn serve_user(self: &Arc<Self>, broadcaster: &RedisBroadcaster, user_id: &str) -> Subscription {
        let gateway = Arc::clone(self);
        let target = user_id.to_owned();
        broadcaster.subscribe::<Value, _>(&channels::user(user_id), move |payload| {
            let gateway = Arc::clone(&gateway);
            let target = target.clone();
            tokio::spawn(async move {
                if let Err(error) = gateway.deliver_to_user(&target, &payload).await {
                    warn!(user_id = %target, %error, "Local delivery failed");
                }
            });
        })
    }
}
