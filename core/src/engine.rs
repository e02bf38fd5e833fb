// Mail engine — wires the stores, network layer, relay layer and drivers
// together and owns their background tasks.
//
// Construction is explicit and does no IO beyond opening storage. `start`
// spawns every background loop on the current tokio runtime; `shutdown`
// signals them and waits until each one has exited.

use crate::config::EngineConfig;
use crate::crypto::Hash256;
use crate::dht::DhtStorage;
use crate::email::{AddressBook, Email};
use crate::identity::{IdentityError, IdentityStore};
use crate::network::{PacketDispatcher, SendQueue};
use crate::relay::{
    BanList, PacketPublisher, PeerListResponder, RelayError, RelayPeerManager,
    RelayRequestHandler,
};
use crate::service::shutdown::{self, ShutdownTrigger};
use crate::service::{
    CheckOutcome, DeliveryChecker, MailChecker, OutboxPass, OutboxProcessor, Shutdown,
};
use crate::store::{
    EmailFolder, IncompleteEmailFolder, MemoryStorage, MetadataStore, Outbox, SledStorage,
    StorageBackend, StoreError,
};
use crate::transport::{
    Destination, NetworkStatus, NetworkStatusListener, NodeKeys, StatusNotifier, Transport,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine already running")]
    AlreadyRunning,
    #[error("Engine not running")]
    NotRunning,
    #[error("No tokio runtime available")]
    NoRuntime,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================================================
// STORAGE
// ============================================================================

/// One backend per store, either all in memory or all trees of one sled db
struct Backends {
    identities: Arc<dyn StorageBackend>,
    outbox: Arc<dyn StorageBackend>,
    metadata: Arc<dyn StorageBackend>,
    inbox: Arc<dyn StorageBackend>,
    sent: Arc<dyn StorageBackend>,
    incomplete: Arc<dyn StorageBackend>,
}

impl Backends {
    fn open(config: &EngineConfig) -> Result<Self> {
        let Some(path) = &config.storage_path else {
            let memory = || -> Arc<dyn StorageBackend> { Arc::new(MemoryStorage::new()) };
            return Ok(Self {
                identities: memory(),
                outbox: memory(),
                metadata: memory(),
                inbox: memory(),
                sent: memory(),
                incomplete: memory(),
            });
        };
        std::fs::create_dir_all(path)
            .map_err(|e| StoreError::Backend(format!("{}: {}", path.display(), e)))?;
        let db = SledStorage::new(path)?;
        let tree = |name: &str| -> Result<Arc<dyn StorageBackend>> { Ok(Arc::new(db.open_tree(name)?)) };
        info!(path = %path.display(), "Opened mail storage");
        Ok(Self {
            identities: tree("identities")?,
            outbox: tree("outbox")?,
            metadata: tree("metadata")?,
            inbox: tree("inbox")?,
            sent: tree("sent")?,
            incomplete: tree("incomplete")?,
        })
    }
}

// ============================================================================
// MAIL ENGINE
// ============================================================================

struct Running {
    trigger: ShutdownTrigger,
    tasks: Vec<JoinHandle<()>>,
}

pub struct MailEngine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    dht: Arc<dyn DhtStorage>,
    identities: Arc<IdentityStore>,
    outbox: Arc<Outbox>,
    inbox: Arc<EmailFolder>,
    sent: Arc<EmailFolder>,
    incomplete: Arc<IncompleteEmailFolder>,
    metadata: Arc<MetadataStore>,
    ban_list: Arc<BanList>,
    send_queue: Arc<SendQueue>,
    dispatcher: Arc<PacketDispatcher>,
    peers: Arc<RelayPeerManager>,
    relay_handler: Arc<RelayRequestHandler>,
    mail_checker: Arc<MailChecker>,
    outbox_processor: Arc<OutboxProcessor>,
    delivery: Arc<DeliveryChecker>,
    status: Arc<StatusNotifier>,
    running: Mutex<Option<Running>>,
}

impl MailEngine {
    /// Build an engine on top of a transport and a DHT
    pub fn new(
        config: EngineConfig,
        keys: NodeKeys,
        transport: Arc<dyn Transport>,
        dht: Arc<dyn DhtStorage>,
    ) -> Result<Self> {
        Self::build(config, keys, transport, dht, None)
    }

    /// Like `new`, resolving bare recipient names through `book`
    pub fn with_address_book(
        config: EngineConfig,
        keys: NodeKeys,
        transport: Arc<dyn Transport>,
        dht: Arc<dyn DhtStorage>,
        book: Arc<dyn AddressBook>,
    ) -> Result<Self> {
        Self::build(config, keys, transport, dht, Some(book))
    }

    fn build(
        config: EngineConfig,
        keys: NodeKeys,
        transport: Arc<dyn Transport>,
        dht: Arc<dyn DhtStorage>,
        book: Option<Arc<dyn AddressBook>>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        if keys.destination() != transport.local_destination() {
            return Err(EngineError::Config(
                "node keys do not match the transport destination".to_string(),
            ));
        }

        let backends = Backends::open(&config)?;
        let identities = Arc::new(IdentityStore::persistent(backends.identities));
        let outbox = Arc::new(Outbox::persistent(backends.outbox));
        let metadata = Arc::new(MetadataStore::persistent(backends.metadata));
        let inbox = Arc::new(EmailFolder::persistent("inbox", backends.inbox));
        let sent = Arc::new(EmailFolder::persistent("sent", backends.sent));
        let incomplete = Arc::new(IncompleteEmailFolder::persistent(
            backends.incomplete,
            inbox.clone(),
        ));

        let local = transport.local_destination();
        let ban_list = Arc::new(BanList::new());
        let send_queue = SendQueue::new(transport.clone(), config.send_queue.clone());
        let dispatcher = PacketDispatcher::new(transport.clone(), ban_list.clone());
        let peers = Arc::new(RelayPeerManager::new(
            local,
            config.peers.clone(),
            ban_list.clone(),
        ));
        let relay_handler = Arc::new(RelayRequestHandler::new(
            keys,
            send_queue.clone(),
            dht.clone(),
            config.relay.clone(),
        ));
        dispatcher.add_listener(relay_handler.clone());
        dispatcher.add_listener(Arc::new(PeerListResponder::new(
            peers.clone(),
            send_queue.clone(),
        )));

        let publisher = Arc::new(PacketPublisher::new(
            dht.clone(),
            peers.clone(),
            send_queue.clone(),
            config.relay.clone(),
            config.peers.response_timeout(),
        ));
        let mail_checker = Arc::new(MailChecker::new(
            dht.clone(),
            identities.clone(),
            incomplete.clone(),
            config.mail_check.clone(),
        ));
        let mut processor = OutboxProcessor::new(
            outbox.clone(),
            sent.clone(),
            metadata.clone(),
            identities.clone(),
            publisher,
            config.outbox.clone(),
            config.packets.max_fragment_size,
        );
        if let Some(book) = book {
            processor = processor.with_address_book(book);
        }
        let delivery = Arc::new(DeliveryChecker::new(
            dht.clone(),
            metadata.clone(),
            config.delivery.clone(),
        ));

        Ok(Self {
            config,
            transport,
            dht,
            identities,
            outbox,
            inbox,
            sent,
            incomplete,
            metadata,
            ban_list,
            send_queue,
            dispatcher,
            peers,
            relay_handler,
            mail_checker,
            outbox_processor: Arc::new(processor),
            delivery,
            status: Arc::new(StatusNotifier::new()),
            running: Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Spawn every background task on the current tokio runtime
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        info!(node = %self.local_destination().short(), "Mail engine starting");
        if let Err(e) = self.peers.load() {
            warn!("Could not load relay peers: {}", e);
        }
        self.status.set(NetworkStatus::Connecting);

        let (trigger, signal) = shutdown::channel();
        let tasks = vec![
            runtime.spawn(self.send_queue.clone().run(signal.clone())),
            runtime.spawn(self.dispatcher.clone().run(signal.clone())),
            runtime.spawn(self.peers.clone().run(
                self.send_queue.clone(),
                self.dispatcher.clone(),
                signal.clone(),
            )),
            runtime.spawn(self.mail_checker.clone().run(signal.clone())),
            runtime.spawn(self.outbox_processor.clone().run(signal.clone())),
            runtime.spawn(self.delivery.clone().run(signal.clone())),
            runtime.spawn(watch_readiness(self.dht.clone(), self.status.clone(), signal)),
        ];
        *running = Some(Running { trigger, tasks });
        info!(hops = self.config.relay.hops, "Mail engine started");
        Ok(())
    }

    /// Stop every background task and wait for them to exit
    pub async fn shutdown(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Err(EngineError::NotRunning);
        };
        info!("Mail engine stopping");
        running.trigger.trigger();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.status.set(NetworkStatus::NotStarted);
        info!("Mail engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    // ------------------------------------------------------------------------
    // MANUAL TRIGGERS
    // ------------------------------------------------------------------------

    /// Run a mail check now. Dropped if one is already running.
    pub async fn check_mail(&self) -> CheckOutcome {
        self.mail_checker.check_mail().await
    }

    /// Queue an email and start an outbox pass. `sender = None` sends
    /// anonymously.
    pub fn send_email(&self, email: Email, sender: Option<Hash256>) -> Result<String> {
        if let Some(hash) = &sender {
            if self.identities.get(hash)?.is_none() {
                return Err(IdentityError::NotFound(*hash).into());
            }
        }
        let id = self.outbox.add(email, sender)?;
        self.wake_outbox();
        Ok(id)
    }

    pub fn wake_outbox(&self) {
        self.outbox_processor.wake();
    }

    /// Run one outbox pass now and wait for it
    pub async fn process_outbox(&self) -> OutboxPass {
        self.outbox_processor.process_all().await
    }

    /// Run one delivery confirmation pass now
    pub async fn check_delivery(&self) -> usize {
        self.delivery.check_once().await
    }

    // ------------------------------------------------------------------------
    // ACCESSORS
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn local_destination(&self) -> Destination {
        self.transport.local_destination()
    }

    pub fn identities(&self) -> &Arc<IdentityStore> {
        &self.identities
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn inbox(&self) -> &Arc<EmailFolder> {
        &self.inbox
    }

    pub fn sent_folder(&self) -> &Arc<EmailFolder> {
        &self.sent
    }

    pub fn incomplete_folder(&self) -> &Arc<IncompleteEmailFolder> {
        &self.incomplete
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn peers(&self) -> &Arc<RelayPeerManager> {
        &self.peers
    }

    pub fn ban_list(&self) -> &Arc<BanList> {
        &self.ban_list
    }

    pub fn relay_handler(&self) -> &Arc<RelayRequestHandler> {
        &self.relay_handler
    }

    pub fn dht(&self) -> &Arc<dyn DhtStorage> {
        &self.dht
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.status.status()
    }

    pub fn add_status_listener(&self, listener: Arc<dyn NetworkStatusListener>) {
        self.status.add_listener(listener);
    }
}

/// Report `Connected` once the DHT becomes ready
async fn watch_readiness(dht: Arc<dyn DhtStorage>, status: Arc<StatusNotifier>, mut shutdown: Shutdown) {
    loop {
        tokio::select! {
            ready = dht.wait_ready(Duration::from_secs(1)) => {
                if ready {
                    info!(peers = dht.peer_count(), "DHT ready");
                    status.set(NetworkStatus::Connected);
                    return;
                }
            }
            _ = shutdown.wait() => return,
        }
    }
}
