//! Client connection management for the quiz server
//!
//! This module owns the bounded table of connected clients. For each client
//! it tracks:
//! - Connection metadata (ID, remote address)
//! - Authentication state (the pseudo, once login succeeds)
//! - Current session membership (at most one session at a time)
//! - The bounded outbound queue feeding that connection's writer
//!
//! The table is the single fan-out point for server-initiated events: a
//! session engine builds a payload once and enqueues it per recipient here.
//! Queues are bounded; a client that cannot drain its queue is kicked rather
//! than allowed to stall whoever is broadcasting.

use log::{info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// Maximum simultaneous client connections
pub const MAX_CLIENTS: usize = 100;

/// Outbound messages buffered per connection before the client is kicked
pub const SEND_QUEUE_LEN: usize = 64;

/// A connected client and its server-side state
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier, assigned on accept, never zero
    pub id: u32,
    /// Remote address, for logging
    pub addr: SocketAddr,
    /// Authenticated pseudo; `None` until login succeeds
    pub pseudo: Option<String>,
    /// Session this client is currently a member of, if any
    pub session_id: Option<u32>,
    /// Outbound line queue drained by the connection task
    sender: mpsc::Sender<String>,
    /// Kick signal; the connection task exits when notified
    kick: Arc<Notify>,
}

impl Client {
    pub fn is_authenticated(&self) -> bool {
        self.pseudo.is_some()
    }
}

/// Bounded registry of connected clients
pub struct ClientManager {
    clients: HashMap<u32, Client>,
    next_client_id: u32,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Registers a newly accepted connection.
    ///
    /// Returns the assigned client id, or `None` when the table is full.
    pub fn add_client(
        &mut self,
        addr: SocketAddr,
        sender: mpsc::Sender<String>,
        kick: Arc<Notify>,
    ) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let id = self.next_client_id;
        self.next_client_id += 1;

        self.clients.insert(
            id,
            Client {
                id,
                addr,
                pseudo: None,
                session_id: None,
                sender,
                kick,
            },
        );
        info!("Client {} connected from {} ({} online)", id, addr, self.clients.len());
        Some(id)
    }

    /// Removes a client, returning its final state for cleanup.
    pub fn remove_client(&mut self, id: u32) -> Option<Client> {
        let removed = self.clients.remove(&id);
        if let Some(client) = &removed {
            info!(
                "Client {} ('{}') disconnected ({} online)",
                id,
                client.pseudo.as_deref().unwrap_or("<anonymous>"),
                self.clients.len()
            );
        }
        removed
    }

    pub fn get(&self, id: u32) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Marks a client authenticated under the given pseudo.
    pub fn set_authenticated(&mut self, id: u32, pseudo: &str) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.pseudo = Some(pseudo.to_string());
        }
    }

    /// Sets or clears a client's session membership.
    pub fn set_session(&mut self, id: u32, session_id: Option<u32>) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.session_id = session_id;
        }
    }

    pub fn pseudo_of(&self, id: u32) -> Option<String> {
        self.clients.get(&id).and_then(|c| c.pseudo.clone())
    }

    pub fn session_of(&self, id: u32) -> Option<u32> {
        self.clients.get(&id).and_then(|c| c.session_id)
    }

    /// Enqueues one line for a client without blocking.
    ///
    /// A full queue means the client is not draining its socket; it is
    /// kicked so that no session broadcast can stall behind it. Returns
    /// false when the message was not enqueued.
    pub fn send_to(&self, id: u32, line: &str) -> bool {
        let Some(client) = self.clients.get(&id) else {
            return false;
        };
        match client.sender.try_send(line.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Client {} send queue full, kicking slow client", id);
                client.kick.notify_one();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Fans one line out to several clients. Failures are per-recipient and
    /// never affect the others.
    pub fn send_to_many(&self, ids: &[u32], line: &str) {
        for id in ids {
            self.send_to(*id, line);
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
