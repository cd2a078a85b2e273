use super::{timer::Timeout, timer::Timer, OneshotTask, Socket, StoreTask, WorkerError};
use crate::{
    config::Config,
    error::{Error, Result},
    handler::{is_private_address, DefaultMessageHandler, DispatchEvent, ResponseKind},
    id::Kuid,
    message::{
        self, error_code, ContactInfo, FindNodeRequest, FindValueRequest, Message, MessageBody,
        NodeInfo, NodesResponse, PingRequest, PongResponse, Request, Response, StoreRequest,
        StoredResponse, ValuesResponse, WireValue,
    },
    routing::{
        contact::{Contact, FIREWALLED_FLAG},
        table::{RouteTable, SelectMode},
    },
    storage::{Database, DhtValueEntity},
    token::{SecurityToken, TokenStore},
    transaction::{MessageId, MessageIdFactory},
};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde_bytes::ByteBuf;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time,
};

const EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

/// Owns the socket and matches outgoing requests with their responses. Every message exchange is
/// reported to the [`DefaultMessageHandler`].
pub(crate) struct Dispatcher {
    running: bool,
    socket: Socket,
    command_rx: mpsc::UnboundedReceiver<OneshotTask>,
    store_rx: mpsc::UnboundedReceiver<StoreTask>,
    timer: Timer<MessageId>,
    receipts: HashMap<MessageId, Receipt>,
    message_ids: MessageIdFactory,
    token_store: TokenStore,
    table: Arc<RwLock<RouteTable>>,
    database: Arc<RwLock<Database>>,
    handler: Arc<DefaultMessageHandler>,
    config: Config,
}

/// Outstanding request.
struct Receipt {
    addr: SocketAddr,
    id: Option<Kuid>,
    timeout: Timeout,
    pending: Pending,
}

enum Pending {
    Ping {
        collision: bool,
        tx: oneshot::Sender<Result<Contact>>,
    },
    FindNode {
        tx: Option<oneshot::Sender<Result<Vec<Contact>>>>,
        // Values waiting for the token this lookup fetches.
        store: Option<Vec<DhtValueEntity>>,
    },
    FindValue {
        tx: oneshot::Sender<Result<Vec<DhtValueEntity>>>,
    },
    Store,
}

impl Pending {
    fn fail(self, error: Error) {
        match self {
            Self::Ping { tx, .. } => {
                tx.send(Err(error)).unwrap_or(());
            }
            Self::FindNode { tx: Some(tx), .. } => {
                tx.send(Err(error)).unwrap_or(());
            }
            Self::FindValue { tx } => {
                tx.send(Err(error)).unwrap_or(());
            }
            Self::FindNode { tx: None, store } => {
                if let Some(values) = store {
                    log::debug!("Dropping {} values to forward: {}", values.len(), error);
                }
            }
            Self::Store => log::debug!("Store request failed: {}", error),
        }
    }
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: Socket,
        command_rx: mpsc::UnboundedReceiver<OneshotTask>,
        store_rx: mpsc::UnboundedReceiver<StoreTask>,
        table: Arc<RwLock<RouteTable>>,
        database: Arc<RwLock<Database>>,
        handler: Arc<DefaultMessageHandler>,
        config: Config,
    ) -> Self {
        Self {
            running: false,
            socket,
            command_rx,
            store_rx,
            timer: Timer::new(),
            receipts: HashMap::new(),
            message_ids: MessageIdFactory::new(),
            token_store: TokenStore::new(),
            table,
            database,
            handler,
            config,
        }
    }

    pub async fn run(mut self) {
        self.running = true;

        let mut expiry = time::interval(EXPIRY_INTERVAL);

        while self.running {
            select! {
                message_id = self.timer.next(), if !self.timer.is_empty() => {
                    if let Some(message_id) = message_id {
                        self.handle_timeout(message_id)
                    }
                }
                command = self.command_rx.recv() => {
                    if let Some(command) = command {
                        self.handle_command(command).await
                    } else {
                        self.shutdown()
                    }
                }
                Some(task) = self.store_rx.recv() => {
                    self.handle_store_task(task).await
                }
                _ = expiry.tick() => {
                    self.remove_expired_values()
                }
                message = self.socket.recv() => {
                    match message {
                        Ok((message, addr)) => {
                            if let Err(error) = self.handle_incoming(message, addr).await {
                                log::debug!(
                                    "{}: Failed to handle message from {}: {}",
                                    self.socket.ip_version(),
                                    addr,
                                    error
                                );
                            }
                        }
                        Err(error) => {
                            log::warn!("{}: Socket error: {}", self.socket.ip_version(), error)
                        }
                    }
                }
            }
        }

        log::debug!("{}: Dispatcher stopped", self.socket.ip_version());
    }

    async fn handle_command(&mut self, command: OneshotTask) {
        match command {
            OneshotTask::Ping {
                addr,
                collision,
                tx,
            } => {
                let sender = if collision {
                    self.collision_info()
                } else {
                    self.local_info()
                };

                self.send_request(
                    addr,
                    None,
                    sender,
                    Request::Ping(PingRequest {}),
                    Pending::Ping { collision, tx },
                )
                .await
            }
            OneshotTask::FindNode { addr, target, tx } => {
                let sender = self.local_info();

                self.send_request(
                    addr,
                    None,
                    sender,
                    Request::FindNode(FindNodeRequest { target }),
                    Pending::FindNode {
                        tx: Some(tx),
                        store: None,
                    },
                )
                .await
            }
            OneshotTask::FindValue { addr, key, tx } => {
                let sender = self.local_info();

                self.send_request(
                    addr,
                    None,
                    sender,
                    Request::FindValue(FindValueRequest { key }),
                    Pending::FindValue { tx },
                )
                .await
            }
            OneshotTask::Store(task) => self.handle_store_task(task).await,
            OneshotTask::GetLocalAddr(tx) => {
                tx.send(self.socket.local_addr()).unwrap_or(());
            }
        }
    }

    async fn handle_store_task(&mut self, task: StoreTask) {
        let StoreTask { dst, token, values } = task;

        if token.is_none() && self.config.require_security_token {
            // The token comes back with the nodes of a lookup of the contact's own id.
            let sender = self.local_info();

            self.send_request(
                dst.addr(),
                Some(dst.id()),
                sender,
                Request::FindNode(FindNodeRequest { target: dst.id() }),
                Pending::FindNode {
                    tx: None,
                    store: Some(values),
                },
            )
            .await
        } else {
            self.deliver_store(dst, token, values).await
        }
    }

    async fn deliver_store(
        &mut self,
        dst: Contact,
        token: Option<SecurityToken>,
        values: Vec<DhtValueEntity>,
    ) {
        if token.is_none() && self.config.require_security_token {
            log::debug!(
                "{}: No security token from {:?}, dropping {} values",
                self.socket.ip_version(),
                dst,
                values.len()
            );
            return;
        }

        log::debug!(
            "{}: Storing {} values at {:?}",
            self.socket.ip_version(),
            values.len(),
            dst
        );

        let request = Request::Store(StoreRequest {
            token: token.map(|token| ByteBuf::from(token.as_ref().to_vec())),
            values: values.iter().map(WireValue::from).collect(),
        });
        let sender = self.local_info();

        self.send_request(dst.addr(), Some(dst.id()), sender, request, Pending::Store)
            .await
    }

    async fn send_request(
        &mut self,
        addr: SocketAddr,
        id: Option<Kuid>,
        sender: ContactInfo,
        request: Request,
        pending: Pending,
    ) {
        // Requests to a bare address still charge a timeout to the contact known there.
        let id = id.or_else(|| self.table.read().find_by_addr(addr));

        let message_id = self.message_ids.generate(addr);
        let message = Message {
            message_id: message_id.as_bytes().to_vec(),
            contact: sender,
            body: MessageBody::Request(request),
        };

        if let Err(error) = self.socket.send(&message, addr).await {
            log::warn!(
                "{}: Failed to send request to {}: {}",
                self.socket.ip_version(),
                addr,
                error
            );
            pending.fail(Error::Io(error));
            return;
        }

        let timeout = self.timer.schedule_in(self.config.request_timeout, message_id);

        self.receipts.insert(
            message_id,
            Receipt {
                addr,
                id,
                timeout,
                pending,
            },
        );
    }

    fn handle_timeout(&mut self, message_id: MessageId) {
        let receipt = match self.receipts.remove(&message_id) {
            Some(receipt) => receipt,
            None => return,
        };

        log::trace!(
            "{}: Request to {} timed out",
            self.socket.ip_version(),
            receipt.addr
        );

        self.handler
            .handle(DispatchEvent::Timeout(receipt.id, receipt.addr));
        receipt.pending.fail(Error::Timeout);
    }

    async fn handle_incoming(
        &mut self,
        message: Message,
        addr: SocketAddr,
    ) -> Result<(), WorkerError> {
        let contact = message.contact.into_contact(addr);

        match message.body {
            MessageBody::Request(request) => {
                self.handle_request(message.message_id, contact, request)
                    .await
            }
            MessageBody::Response(response) => {
                self.handle_response(&message.message_id, contact, Ok(response))
                    .await
            }
            MessageBody::Error(error) => {
                self.handle_response(&message.message_id, contact, Err(error))
                    .await
            }
        }
    }

    async fn handle_request(
        &mut self,
        message_id: Vec<u8>,
        contact: Contact,
        request: Request,
    ) -> Result<(), WorkerError> {
        log::trace!(
            "{}: Received {:?} from {:?}",
            self.socket.ip_version(),
            request,
            contact
        );

        let addr = contact.addr();
        self.handler.handle(DispatchEvent::Request(contact.clone()));

        let body = self.respond(&contact, request);
        let response = Message {
            message_id,
            contact: self.local_info(),
            body,
        };

        self.socket.send(&response, addr).await?;

        Ok(())
    }

    fn respond(&mut self, requester: &Contact, request: Request) -> MessageBody {
        match request {
            Request::Ping(PingRequest {}) => MessageBody::Response(Response::Pong(PongResponse {})),
            Request::FindNode(FindNodeRequest { target }) => {
                let nodes = self.closest_nodes(&target, requester);
                let token = self.token_store.checkout(requester.addr());

                MessageBody::Response(Response::Nodes(NodesResponse {
                    nodes,
                    token: Some(ByteBuf::from(token.as_ref().to_vec())),
                }))
            }
            Request::FindValue(FindValueRequest { key }) => {
                let now = Instant::now();
                let values = self
                    .database
                    .read()
                    .values(&key)
                    .filter(|value| !value.is_expired(now))
                    .map(WireValue::from)
                    .collect();
                let nodes = self.closest_nodes(&key, requester);

                MessageBody::Response(Response::Values(ValuesResponse { values, nodes }))
            }
            Request::Store(request) => self.handle_store_request(requester.addr(), request),
        }
    }

    fn handle_store_request(&mut self, addr: SocketAddr, request: StoreRequest) -> MessageBody {
        if self.config.require_security_token {
            let valid = request
                .token
                .as_ref()
                .and_then(|token| SecurityToken::new(token).ok())
                .map(|token| self.token_store.checkin(addr, token))
                .unwrap_or(false);

            if !valid {
                log::debug!(
                    "{}: Rejecting store from {} with invalid token",
                    self.socket.ip_version(),
                    addr
                );

                return MessageBody::Error(message::Error {
                    code: error_code::PROTOCOL_ERROR,
                    message: "invalid store token".to_owned(),
                });
            }
        }

        let lifetime = self.config.value_lifetime;
        let mut database = self.database.write();
        let stored = request
            .values
            .into_iter()
            .map(|value| database.store(value.into_remote_entity(lifetime)))
            .filter(|stored| *stored)
            .count();

        MessageBody::Response(Response::Stored(StoredResponse {
            stored: stored as u32,
        }))
    }

    async fn handle_response(
        &mut self,
        message_id: &[u8],
        contact: Contact,
        response: Result<Response, message::Error>,
    ) -> Result<(), WorkerError> {
        let message_id = self
            .message_ids
            .verify(message_id, contact.addr())
            .ok_or(WorkerError::UnsolicitedResponse)?;

        let receipt = match self.receipts.remove(&message_id) {
            Some(receipt) => receipt,
            None => {
                self.handler.handle(DispatchEvent::LateResponse(contact));
                return Ok(());
            }
        };

        self.timer.cancel(receipt.timeout);

        let token = match &response {
            Ok(Response::Nodes(nodes)) => nodes
                .token
                .as_ref()
                .and_then(|token| SecurityToken::new(token).ok()),
            _ => None,
        };

        let kind = match &receipt.pending {
            Pending::Ping {
                collision: true, ..
            } => ResponseKind::CollisionPing,
            Pending::FindNode { .. } if matches!(response, Ok(Response::Nodes(_))) => {
                ResponseKind::FindNode(token)
            }
            _ => ResponseKind::Other,
        };

        self.handler
            .handle(DispatchEvent::Response(contact.clone(), kind));

        match (receipt.pending, response) {
            (pending, Err(error)) => {
                log::debug!(
                    "{}: {:?} rejected request: {} {}",
                    self.socket.ip_version(),
                    contact,
                    error.code,
                    error.message
                );
                pending.fail(Error::Rejected(error.message));
            }
            (Pending::Ping { tx, .. }, Ok(Response::Pong(_))) => {
                tx.send(Ok(contact)).unwrap_or(());
            }
            (Pending::FindNode { tx, store }, Ok(Response::Nodes(response))) => {
                let contacts = self.add_discovered(response.nodes);

                if let Some(values) = store {
                    self.deliver_store(contact, token, values).await;
                }
                if let Some(tx) = tx {
                    tx.send(Ok(contacts)).unwrap_or(());
                }
            }
            (Pending::FindValue { tx }, Ok(Response::Values(response))) => {
                self.add_discovered(response.nodes);

                let lifetime = self.config.value_lifetime;
                let values = response
                    .values
                    .into_iter()
                    .map(|value| value.into_remote_entity(lifetime))
                    .collect();

                tx.send(Ok(values)).unwrap_or(());
            }
            (Pending::Store, Ok(Response::Stored(StoredResponse { stored }))) => {
                log::trace!(
                    "{}: {:?} stored {} values",
                    self.socket.ip_version(),
                    contact,
                    stored
                );
            }
            (pending, Ok(response)) => {
                log::debug!(
                    "{}: Unexpected response from {:?}: {:?}",
                    self.socket.ip_version(),
                    contact,
                    response
                );
                pending.fail(Error::Rejected("unexpected response".to_owned()));
            }
        }

        Ok(())
    }

    /// Adds contacts learned from a response as unknown and returns them.
    fn add_discovered(&self, nodes: Vec<NodeInfo>) -> Vec<Contact> {
        let mut table = self.table.write();
        let mut contacts = Vec::with_capacity(nodes.len());

        for contact in nodes.into_iter().map(NodeInfo::into_contact) {
            if table.is_local_node_id(&contact.id()) {
                continue;
            }
            if !self.config.allow_private_addresses && is_private_address(contact.addr().ip()) {
                continue;
            }

            table.add(contact.clone());
            contacts.push(contact);
        }

        contacts
    }

    fn closest_nodes(&self, target: &Kuid, requester: &Contact) -> Vec<NodeInfo> {
        self.table
            .read()
            .select(target, self.config.k, SelectMode::Alive)
            .iter()
            .filter(|contact| contact.id() != requester.id())
            .map(NodeInfo::from)
            .collect()
    }

    fn remove_expired_values(&self) {
        let removed = self.database.write().remove_expired(Instant::now());

        if removed > 0 {
            log::debug!(
                "{}: Removed {} expired values",
                self.socket.ip_version(),
                removed
            );
        }
    }

    fn local_info(&self) -> ContactInfo {
        ContactInfo::from(self.table.read().local_contact())
    }

    /// A random firewalled identity, so that a node sharing our id answers and does not add us.
    fn collision_info(&self) -> ContactInfo {
        let local = self.local_info();

        ContactInfo {
            id: Kuid::random(),
            instance_id: local.instance_id,
            flags: local.flags | FIREWALLED_FLAG,
        }
    }

    fn shutdown(&mut self) {
        for (_, receipt) in self.receipts.drain() {
            receipt.pending.fail(Error::Closed);
        }

        self.running = false;
    }
}
