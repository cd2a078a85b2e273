use crate::{
    config::Config,
    error::Result,
    id::Kuid,
    routing::{contact::Contact, table::RouteTable},
    storage::{Database, DhtValueEntity},
    store_forward,
    token::SecurityToken,
};
use parking_lot::RwLock;
use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Outbound side of the protocol core.
pub trait Messenger: Send + Sync {
    /// Queue a store request carrying `values` to `dst`. Must not block on the network.
    ///
    /// Without a `token` the messenger is expected to obtain one from `dst` first.
    fn send_store_request(
        &self,
        dst: Contact,
        token: Option<SecurityToken>,
        values: Vec<DhtValueEntity>,
    ) -> Result<()>;

    /// Has the local node joined the network?
    fn is_bootstrapped(&self) -> bool;
}

/// Type of response that reached the handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    /// Answer to a ping sent to find out whether another node uses the local node id.
    CollisionPing,
    /// Answer to a `FindNode` request along with the security token, if the remote sent one.
    FindNode(Option<SecurityToken>),
    Other,
}

/// Everything the dispatcher reports to the handler.
#[derive(Clone, Debug)]
pub enum DispatchEvent {
    Request(Contact),
    Response(Contact, ResponseKind),
    /// No response arrived in time. The id is unknown when the request went to a bare address.
    Timeout(Option<Kuid>, SocketAddr),
    /// Response whose request had already timed out.
    LateResponse(Contact),
}

/// Keeps the routing table up to date with every message exchange and replicates stored
/// values to contacts that join the neighbourhood of a key.
pub struct DefaultMessageHandler {
    table: Arc<RwLock<RouteTable>>,
    database: Arc<RwLock<Database>>,
    messenger: Arc<dyn Messenger>,
    config: Config,
    internal_errors: AtomicUsize,
}

impl DefaultMessageHandler {
    pub fn new(
        table: Arc<RwLock<RouteTable>>,
        database: Arc<RwLock<Database>>,
        messenger: Arc<dyn Messenger>,
        config: Config,
    ) -> Self {
        Self {
            table,
            database,
            messenger,
            config,
            internal_errors: AtomicUsize::new(0),
        }
    }

    pub fn handle(&self, event: DispatchEvent) {
        match event {
            DispatchEvent::Request(contact) => self.handle_request(contact),
            DispatchEvent::Response(contact, kind) => self.handle_response(contact, kind),
            DispatchEvent::Timeout(id, addr) => self.handle_timeout(id, addr),
            DispatchEvent::LateResponse(contact) => self.handle_late_response(contact),
        }
    }

    pub fn handle_request(&self, contact: Contact) {
        self.handle_message(contact, None);
    }

    pub fn handle_response(&self, contact: Contact, kind: ResponseKind) {
        self.handle_message(contact, Some(kind));
    }

    pub fn handle_timeout(&self, id: Option<Kuid>, addr: SocketAddr) {
        match id {
            Some(id) => self.table.write().handle_failure(&id, addr),
            None => log::trace!("Request to {} timed out", addr),
        }
    }

    pub fn handle_late_response(&self, contact: Contact) {
        if contact.is_firewalled() {
            return;
        }

        if !self.config.allow_private_addresses && is_private_address(contact.addr().ip()) {
            log::trace!("Ignoring late response from private address {:?}", contact);
            return;
        }

        log::trace!("Late response from {:?}", contact);
        self.table.write().add(contact);
    }

    /// Number of protocol violations seen so far.
    pub fn internal_errors(&self) -> usize {
        self.internal_errors.load(Ordering::Relaxed)
    }

    fn handle_message(&self, contact: Contact, response: Option<ResponseKind>) {
        if contact.is_shutdown() {
            let mut table = self.table.write();

            if table.get(&contact.id()).is_some() {
                log::debug!("{:?} is shutting down", contact);
                table.add(contact);
            }
            return;
        }

        if contact.is_firewalled() {
            log::trace!("Ignoring firewalled contact {:?}", contact);
            return;
        }

        if !self.config.allow_private_addresses && is_private_address(contact.addr().ip()) {
            log::trace!("Ignoring contact with private address {:?}", contact);
            return;
        }

        let mut table = self.table.write();

        if table.is_local_node_id(&contact.id()) {
            if response == Some(ResponseKind::CollisionPing) {
                log::debug!("{:?} collides with the local node id", contact);
            } else {
                log::error!("Received a message from our own id: {:?}", contact);
                self.internal_errors.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let existing = table.get(&contact.id()).cloned();
        let forward = if is_new_or_restarted(existing.as_ref(), &contact)
            && self.config.store_forward
            && self.messenger.is_bootstrapped()
        {
            self.store_forward(&table, &contact, existing.as_ref(), response.as_ref())
        } else {
            None
        };

        table.add(contact.clone());
        drop(table);

        if let Some((token, values)) = forward {
            if let Err(error) = self.messenger.send_store_request(contact, token, values) {
                log::warn!("Failed to forward values: {}", error);
            }
        }
    }

    /// Runs the store-forward pass for `contact` against the held routing table. Returns the
    /// values to send and the token to send them with.
    ///
    /// Displaced replicas are dropped whatever the token. Only the forward batch needs one.
    fn store_forward(
        &self,
        table: &RouteTable,
        contact: &Contact,
        existing: Option<&Contact>,
        response: Option<&ResponseKind>,
    ) -> Option<(Option<SecurityToken>, Vec<DhtValueEntity>)> {
        let result = {
            let mut database = self.database.write();
            store_forward::run(table, &mut database, &self.config, contact, existing)
        };

        if result.forward.is_empty() {
            return None;
        }

        let token = match response {
            Some(ResponseKind::FindNode(token)) => {
                if token.is_none() && self.config.require_security_token {
                    log::trace!(
                        "No security token from {:?}, not forwarding {} values",
                        contact,
                        result.forward.len()
                    );
                    return None;
                }
                *token
            }
            _ => None,
        };

        Some((token, result.forward))
    }
}

/// A contact deserves a store-forward pass if we never saw it, it restarted or it came back
/// from the dead.
fn is_new_or_restarted(existing: Option<&Contact>, contact: &Contact) -> bool {
    match existing {
        None => true,
        Some(existing) => existing.instance_id() != contact.instance_id() || existing.is_dead(),
    }
}

/// Loopback, private, link-local, unspecified and similar addresses other nodes can't reach.
pub fn is_private_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_address(IpAddr::V4(v4));
            }

            let segment = v6.segments()[0];

            v6.is_loopback()
                || v6.is_unspecified()
                // unique local fc00::/7
                || (segment & 0xfe00) == 0xfc00
                // link local fe80::/10
                || (segment & 0xffc0) == 0xfe80
        }
    }
}

// ----------------------------------------------------------------------------//
