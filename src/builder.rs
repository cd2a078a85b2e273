use crate::{
    config::Config,
    error::{Error, Result},
    handler::DefaultMessageHandler,
    id::Kuid,
    routing::{
        contact::{Contact, ContactState},
        table::{RouteTable, SelectMode},
    },
    storage::{Database, DhtValueEntity},
    worker::{ChannelMessenger, Dispatcher, OneshotTask, Socket, SocketTrait, State, StoreTask},
};
use parking_lot::RwLock;
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::{
    sync::{mpsc, oneshot},
    task,
};

/// Handle to a running DHT node.
///
/// This type is cheaply cloneable where each clone refers to the same underlying node. The node
/// stops once every clone has been dropped.
#[derive(Clone)]
pub struct Dht {
    send: mpsc::UnboundedSender<OneshotTask>,
    table: Arc<RwLock<RouteTable>>,
    database: Arc<RwLock<Database>>,
    handler: Arc<DefaultMessageHandler>,
    bootstrapped: Arc<AtomicBool>,
    config: Config,
}

impl Dht {
    /// Create a new DhtBuilder.
    pub fn builder() -> DhtBuilder {
        DhtBuilder {
            node_id: None,
            instance_id: None,
            firewalled: false,
            bootstrapped: false,
            config: Config::default(),
        }
    }

    fn with_builder(builder: DhtBuilder, socket: Socket) -> Self {
        let DhtBuilder {
            node_id,
            instance_id,
            firewalled,
            bootstrapped,
            config,
        } = builder;

        let local = Contact::as_alive(node_id.unwrap_or_else(Kuid::random), socket.local_addr())
            .with_instance_id(instance_id.unwrap_or_else(rand::random))
            .with_firewalled(firewalled);

        log::info!("{}: Starting node {:?}", socket.ip_version(), local);

        let table = Arc::new(RwLock::new(RouteTable::new(local, &config)));
        let database = Arc::new(RwLock::new(Database::new(&config)));
        let bootstrapped = Arc::new(AtomicBool::new(bootstrapped));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (store_tx, store_rx) = mpsc::unbounded_channel();

        let messenger = ChannelMessenger::new(store_tx, bootstrapped.clone());
        let handler = Arc::new(DefaultMessageHandler::new(
            table.clone(),
            database.clone(),
            Arc::new(messenger),
            config.clone(),
        ));

        let dispatcher = Dispatcher::new(
            socket,
            command_rx,
            store_rx,
            table.clone(),
            database.clone(),
            handler.clone(),
            config.clone(),
        );

        task::spawn(dispatcher.run());

        Self {
            send: command_tx,
            table,
            database,
            handler,
            bootstrapped,
            config,
        }
    }

    pub fn local_id(&self) -> Kuid {
        self.table.read().local_id()
    }

    pub fn local_contact(&self) -> Contact {
        self.table.read().local_contact().clone()
    }

    /// Get the local address this node is bound to.
    pub async fn local_addr(&self) -> io::Result<SocketAddr> {
        let (tx, rx) = oneshot::channel();

        fn error() -> io::Error {
            io::Error::new(io::ErrorKind::Other, "dht worker has shut down")
        }

        self.send
            .send(OneshotTask::GetLocalAddr(tx))
            .map_err(|_| error())?;

        rx.await.map_err(|_| error())
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    /// Joins the network through the node at `addr` by asking it for the contacts closest to the
    /// local id. Returns the contacts it sent back.
    pub async fn bootstrap(&self, addr: SocketAddr) -> Result<Vec<Contact>> {
        let contacts = self.find_node(addr, self.local_id()).await?;

        if !self.bootstrapped.swap(true, Ordering::AcqRel) {
            log::info!("Bootstrapped via {} ({} contacts)", addr, contacts.len());
        }

        Ok(contacts)
    }

    /// Pings the node at `addr` and returns its contact.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Contact> {
        self.request(|tx| OneshotTask::Ping {
            addr,
            collision: false,
            tx,
        })
        .await
    }

    /// Finds out whether the node at `addr` uses the local node id.
    pub async fn check_collision(&self, addr: SocketAddr) -> Result<bool> {
        let contact = self
            .request(|tx| OneshotTask::Ping {
                addr,
                collision: true,
                tx,
            })
            .await?;

        Ok(contact.id() == self.local_id())
    }

    /// Asks the node at `addr` for the contacts it knows closest to `target`.
    pub async fn find_node(&self, addr: SocketAddr, target: Kuid) -> Result<Vec<Contact>> {
        self.request(|tx| OneshotTask::FindNode { addr, target, tx })
            .await
    }

    /// Asks the node at `addr` for the values it stores under `key`.
    pub async fn find_value(&self, addr: SocketAddr, key: Kuid) -> Result<Vec<DhtValueEntity>> {
        self.request(|tx| OneshotTask::FindValue { addr, key, tx })
            .await
    }

    /// Stores a value published by this node and sends it to the closest alive contacts of
    /// `key`. Returns the number of contacts the value was sent to.
    pub fn put(&self, key: Kuid, payload: Vec<u8>) -> Result<usize> {
        let local_id = self.local_id();
        let value = DhtValueEntity::local(key, local_id, payload, self.config.value_lifetime);

        if !self.database.write().store(value.clone()) {
            return Err(Error::Rejected("database is full".to_owned()));
        }

        let contacts = self
            .table
            .read()
            .select(&key, self.config.k, SelectMode::Alive);

        for dst in &contacts {
            self.send
                .send(OneshotTask::Store(StoreTask {
                    dst: dst.clone(),
                    token: None,
                    values: vec![value.clone()],
                }))
                .map_err(|_| Error::Closed)?;
        }

        log::debug!("Put {} at {} contacts", key, contacts.len());

        Ok(contacts.len())
    }

    /// Values stored locally under `key`, expired ones excluded.
    pub fn get(&self, key: &Kuid) -> Vec<DhtValueEntity> {
        let now = Instant::now();

        self.database
            .read()
            .values(key)
            .filter(|value| !value.is_expired(now))
            .cloned()
            .collect()
    }

    /// Live contacts of the routing table.
    pub fn contacts(&self) -> Vec<Contact> {
        self.table.read().live_contacts()
    }

    /// Get the state of the node, can be used for debugging.
    pub fn state(&self) -> State {
        let (alive, unknown, dead, cached, bucket_count) = {
            let table = self.table.read();
            (
                table.count(ContactState::Alive),
                table.count(ContactState::Unknown),
                table.count(ContactState::Dead),
                table.cached_contacts().len(),
                table.bucket_count(),
            )
        };
        let (key_count, value_count) = {
            let database = self.database.read();
            (database.key_count(), database.value_count())
        };

        State {
            bootstrapped: self.is_bootstrapped(),
            alive_contacts: alive,
            unknown_contacts: unknown,
            dead_contacts: dead,
            cached_contacts: cached,
            bucket_count,
            key_count,
            value_count,
            internal_errors: self.handler.internal_errors(),
        }
    }

    async fn request<T, F>(&self, task: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> OneshotTask,
    {
        let (tx, rx) = oneshot::channel();

        self.send.send(task(tx)).map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)?
    }
}

// ----------------------------------------------------------------------------//

/// Stores information for initializing a DHT node.
#[derive(Clone, Debug)]
pub struct DhtBuilder {
    node_id: Option<Kuid>,
    instance_id: Option<u8>,
    firewalled: bool,
    bootstrapped: bool,
    config: Config,
}

impl DhtBuilder {
    /// Set the id of the local node. A random one is used otherwise.
    pub fn set_node_id(mut self, id: Kuid) -> DhtBuilder {
        self.node_id = Some(id);
        self
    }

    pub fn set_instance_id(mut self, instance_id: u8) -> DhtBuilder {
        self.instance_id = Some(instance_id);
        self
    }

    /// Advertise the local node as firewalled. Other nodes will not add it to their routing
    /// tables.
    pub fn set_firewalled(mut self, firewalled: bool) -> DhtBuilder {
        self.firewalled = firewalled;
        self
    }

    /// Consider the node part of the network from the start. Used by the first node of a network,
    /// which has nobody to bootstrap from.
    pub fn set_bootstrapped(mut self, bootstrapped: bool) -> DhtBuilder {
        self.bootstrapped = bootstrapped;
        self
    }

    pub fn set_config(mut self, config: Config) -> DhtBuilder {
        self.config = config;
        self
    }

    /// Start a DHT node with the current configuration and bind it to the provided socket.
    pub fn start<S: SocketTrait + Send + Sync + 'static>(self, socket: S) -> io::Result<Dht> {
        Ok(Dht::with_builder(self, Socket::new(socket)?))
    }
}
