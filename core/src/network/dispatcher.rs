// Inbound packet dispatch
//
// Every datagram goes through `dispatch`: an incompatible protocol version
// bans the sender, a compatible one lifts any earlier ban, malformed bytes
// are logged and dropped. Responses go to the batch that is waiting for
// them; everything else goes to the registered listeners.

use super::batch::PacketBatch;
use crate::packet::{Packet, PacketError};
use crate::relay::BanList;
use crate::service::Shutdown;
use crate::transport::{Destination, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Receives decoded packets that are not responses to a batch
#[async_trait]
pub trait PacketListener: Send + Sync {
    async fn packet_received(&self, packet: &Packet, from: &Destination);
}

pub struct PacketDispatcher {
    transport: Arc<dyn Transport>,
    ban_list: Arc<BanList>,
    listeners: RwLock<Vec<Arc<dyn PacketListener>>>,
    batches: Mutex<Vec<Weak<PacketBatch>>>,
    received: AtomicU64,
    malformed: AtomicU64,
}

impl PacketDispatcher {
    pub fn new(transport: Arc<dyn Transport>, ban_list: Arc<BanList>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            ban_list,
            listeners: RwLock::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        })
    }

    pub fn ban_list(&self) -> &Arc<BanList> {
        &self.ban_list
    }

    pub fn add_listener(&self, listener: Arc<dyn PacketListener>) {
        self.listeners.write().push(listener);
    }

    /// Create a batch that receives responses until it is dropped
    pub fn new_batch(&self) -> Arc<PacketBatch> {
        let batch = Arc::new(PacketBatch::new());
        let mut batches = self.batches.lock();
        batches.retain(|b| b.strong_count() > 0);
        batches.push(Arc::downgrade(&batch));
        batch
    }

    pub fn active_batches(&self) -> usize {
        self.batches
            .lock()
            .iter()
            .filter(|b| b.strong_count() > 0)
            .count()
    }

    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Handle one inbound datagram
    pub async fn dispatch(&self, data: &[u8], from: Destination) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(PacketError::UnsupportedVersion { found, expected }) => {
                self.ban_list.ban(
                    from,
                    &format!("protocol version {} (expected {})", found, expected),
                );
                return;
            }
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %from.short(), "Dropping malformed packet: {}", e);
                return;
            }
        };
        self.ban_list.unban(&from);

        if let Packet::Response(response) = &packet {
            let batches: Vec<Arc<PacketBatch>> = self
                .batches
                .lock()
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            if batches.iter().any(|batch| batch.offer(&from, response)) {
                return;
            }
            trace!(peer = %from.short(), "Response without a waiting batch");
        }

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.packet_received(&packet, &from).await;
        }
    }

    /// Receive loop. Runs until shutdown or until the transport closes.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        info!(node = %self.transport.local_destination().short(), "Packet dispatcher started");
        loop {
            tokio::select! {
                received = self.transport.receive() => match received {
                    Ok((data, from)) => self.dispatch(&data, from).await,
                    Err(TransportError::Closed) => {
                        warn!("Transport closed, dispatcher exiting");
                        break;
                    }
                    Err(e) => {
                        warn!("Receive failed: {}", e);
                        if !shutdown.sleep(Duration::from_secs(1)).await {
                            break;
                        }
                    }
                },
                _ = shutdown.wait() => break,
            }
        }
        info!("Packet dispatcher stopped");
    }
}
