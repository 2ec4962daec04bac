//! Service Registry
//!
//! The gateway's view of who is connected: one [`ServiceEntry`] per
//! registered service name, plus a reverse index from connection to owning
//! service so a closing socket can be attributed. Both indices are
//! maintained together and must be mutated under the gateway's single
//! registry lock.

use std::collections::HashMap;

use hubrpc_common::protocol::{messages, now_millis, Result, RpcError};
use serde_json::Value;

/// Identifies one accepted connection for the lifetime of the gateway.
pub type ConnId = u64;

/// What a REGISTER frame did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new entry was created with this connection as primary.
    Registered,
    /// The connection joined an existing entry's pool.
    PoolMemberAttached { member_index: usize },
}

/// How a closing connection affected the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The primary closed: the whole entry (and every pool member) is gone.
    ServiceRemoved { service: String },
    /// A pool member closed: the entry survives with one fewer socket.
    PoolMemberRemoved { service: String },
}

/// Per-service registration state.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub name: String,
    /// Connections in arrival order; `sockets[0]` is the primary.
    pub sockets: Vec<ConnId>,
    /// Advertised method list. Informational: the gateway does not validate
    /// method names against it.
    pub methods: Vec<String>,
    pub version: Option<String>,
    pub metadata: Option<Value>,
    pub connected_at: u64,
    pub last_heartbeat: u64,
    /// Round-robin cursor for egress across the sockets.
    current_socket_index: usize,
}

impl ServiceEntry {
    pub fn primary(&self) -> ConnId {
        self.sockets[0]
    }

    pub fn pool_size(&self) -> usize {
        self.sockets.len()
    }
}

/// The connection registry: `name → entry` and `connection → name`,
/// kept consistent as a unit.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    entries: HashMap<String, ServiceEntry>,
    owners: HashMap<ConnId, String>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a REGISTER frame.
    ///
    /// - No entry for the name: a new entry is created with `conn` as
    ///   primary, whether or not the frame carried a `poolIndex`.
    /// - Entry exists and the frame carries an integer `poolIndex`: the
    ///   connection is appended to the pool. The index value is not trusted
    ///   for ordering; arrival order is authoritative.
    /// - Entry exists and there is no `poolIndex`: duplicate registration,
    ///   rejected without touching the existing entry.
    pub fn register(
        &mut self,
        conn: ConnId,
        service_name: &str,
        methods: Vec<String>,
        version: Option<String>,
        metadata: Option<Value>,
    ) -> Result<RegisterOutcome> {
        match self.entries.get_mut(service_name) {
            None => {
                let now = now_millis();
                self.entries.insert(
                    service_name.to_string(),
                    ServiceEntry {
                        name: service_name.to_string(),
                        sockets: vec![conn],
                        methods,
                        version,
                        metadata,
                        connected_at: now,
                        last_heartbeat: now,
                        current_socket_index: 0,
                    },
                );
                self.owners.insert(conn, service_name.to_string());
                Ok(RegisterOutcome::Registered)
            }
            Some(entry) if messages::pool_index(metadata.as_ref()).is_some() => {
                entry.sockets.push(conn);
                self.owners.insert(conn, service_name.to_string());
                Ok(RegisterOutcome::PoolMemberAttached {
                    member_index: entry.sockets.len() - 1,
                })
            }
            Some(_) => Err(RpcError::ConnectionFailed(format!(
                "Service already registered: {}",
                service_name
            ))),
        }
    }

    /// Selects the egress connection for a CALL to `service`, advancing the
    /// round-robin cursor. Deterministic modular increment; a single-socket
    /// entry always yields its primary.
    pub fn next_egress(&mut self, service: &str) -> Option<ConnId> {
        let entry = self.entries.get_mut(service)?;
        let idx = entry.current_socket_index % entry.sockets.len();
        entry.current_socket_index = (idx + 1) % entry.sockets.len();
        Some(entry.sockets[idx])
    }

    /// The connection RESPONSEs to `service` are written on. Always the
    /// primary, never a pool member: responses follow caller-side
    /// correlation, not egress fanout.
    pub fn primary(&self, service: &str) -> Option<ConnId> {
        self.entries.get(service).map(ServiceEntry::primary)
    }

    /// Evicts one socket from `service`'s entry after a failed write.
    ///
    /// If it was the last socket, the entry is removed entirely.
    pub fn drop_socket(&mut self, service: &str, conn: ConnId) {
        let Some(entry) = self.entries.get_mut(service) else {
            return;
        };
        entry.sockets.retain(|s| *s != conn);
        self.owners.remove(&conn);
        if entry.sockets.is_empty() {
            self.entries.remove(service);
        } else {
            entry.current_socket_index %= entry.sockets.len();
        }
    }

    /// Handles a connection close.
    ///
    /// A closing primary removes the whole entry including its pool
    /// members; a closing pool member only trims the list.
    pub fn remove_connection(&mut self, conn: ConnId) -> Option<DisconnectOutcome> {
        let service = self.owners.remove(&conn)?;
        let entry = self.entries.get_mut(&service)?;

        if entry.primary() == conn {
            let entry = self.entries.remove(&service)?;
            for socket in &entry.sockets {
                self.owners.remove(socket);
            }
            Some(DisconnectOutcome::ServiceRemoved { service })
        } else {
            entry.sockets.retain(|s| *s != conn);
            entry.current_socket_index %= entry.sockets.len();
            Some(DisconnectOutcome::PoolMemberRemoved { service })
        }
    }

    /// Stamps `lastHeartbeat` for the service owning `conn`.
    pub fn record_heartbeat(&mut self, conn: ConnId) {
        if let Some(service) = self.owners.get(&conn) {
            if let Some(entry) = self.entries.get_mut(service) {
                entry.last_heartbeat = now_millis();
            }
        }
    }

    /// The service a connection registered as, if any.
    pub fn service_of(&self, conn: ConnId) -> Option<&str> {
        self.owners.get(&conn).map(String::as_str)
    }

    /// Names of every registered service, sorted for stable output.
    pub fn connected_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn entry(&self, service: &str) -> Option<&ServiceEntry> {
        self.entries.get(service)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
