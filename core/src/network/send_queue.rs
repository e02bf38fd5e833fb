// Outbound send queue
//
// A single consumer drains a time-ordered heap: the packet with the earliest
// eligible send time goes first, ties broken by insertion order. Producers
// never block. When a bandwidth cap is configured the consumer sleeps
// `bits / (kbits * 1000)` seconds before each transmission.
//
// Each packet carries a one-shot completion that fires on transmission, not
// on any protocol level reply.

use super::{Result, SendQueueError};
use crate::config::SendQueueConfig;
use crate::packet::Packet;
use crate::service::Shutdown;
use crate::transport::{Destination, Transport, TransportError};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type Completion = oneshot::Sender<std::result::Result<(), TransportError>>;

struct QueuedPacket {
    not_before: Instant,
    seq: u64,
    data: Vec<u8>,
    destination: Destination,
    done: Completion,
}

impl PartialEq for QueuedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.not_before == other.not_before && self.seq == other.seq
    }
}

impl Eq for QueuedPacket {}

impl PartialOrd for QueuedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedPacket {
    // BinaryHeap is a max-heap: reverse so the earliest, oldest packet is on top
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .not_before
            .cmp(&self.not_before)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Completion signal of one queued packet
pub struct SendHandle {
    rx: oneshot::Receiver<std::result::Result<(), TransportError>>,
}

impl SendHandle {
    #[cfg(test)]
    pub(crate) fn from_receiver(
        rx: oneshot::Receiver<std::result::Result<(), TransportError>>,
    ) -> Self {
        Self { rx }
    }

    /// Resolve once the packet has been handed to the transport
    pub async fn sent(self) -> Result<()> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SendQueueError::Transport(e)),
            Err(_) => Err(SendQueueError::Stopped),
        }
    }
}

enum Next {
    Ready(QueuedPacket),
    WaitUntil(Instant),
    Empty,
}

/// Bandwidth-limited, time-ordered outbound queue
pub struct SendQueue {
    transport: Arc<dyn Transport>,
    config: SendQueueConfig,
    queue: Mutex<BinaryHeap<QueuedPacket>>,
    next_seq: AtomicU64,
    wakeup: Notify,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl SendQueue {
    pub fn new(transport: Arc<dyn Transport>, config: SendQueueConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            queue: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            wakeup: Notify::new(),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn local_destination(&self) -> Destination {
        self.transport.local_destination()
    }

    /// Queue a packet for immediate sending
    pub fn send(&self, packet: &Packet, destination: Destination) -> Result<SendHandle> {
        self.send_delayed(packet, destination, Duration::ZERO)
    }

    /// Queue a packet that must not leave before `delay` has passed
    pub fn send_delayed(
        &self,
        packet: &Packet,
        destination: Destination,
        delay: Duration,
    ) -> Result<SendHandle> {
        let data = packet.encode()?;
        Ok(self.enqueue(data, destination, Instant::now() + delay))
    }

    /// Queue raw bytes with an earliest send time
    pub fn enqueue(&self, data: Vec<u8>, destination: Destination, not_before: Instant) -> SendHandle {
        let (done, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push(QueuedPacket {
            not_before,
            seq,
            data,
            destination,
            done,
        });
        self.wakeup.notify_one();
        SendHandle { rx }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Packets handed to the transport so far
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn next(&self) -> Next {
        let mut queue = self.queue.lock();
        match queue.peek() {
            None => Next::Empty,
            Some(head) if head.not_before <= Instant::now() => match queue.pop() {
                Some(packet) => Next::Ready(packet),
                None => Next::Empty,
            },
            Some(head) => Next::WaitUntil(head.not_before),
        }
    }

    fn bandwidth_delay(&self, len: usize) -> Option<Duration> {
        if self.config.max_bandwidth_kbits == 0 {
            return None;
        }
        let bits = (len * 8) as f64;
        let bits_per_sec = self.config.max_bandwidth_kbits as f64 * 1000.0;
        Some(Duration::from_secs_f64(bits / bits_per_sec))
    }

    /// Consumer loop. Runs until shutdown; transport failures pause it briefly.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        info!(node = %self.local_destination().short(), "Send queue started");
        loop {
            if shutdown.is_triggered() {
                break;
            }
            match self.next() {
                Next::Empty => {
                    tokio::select! {
                        _ = self.wakeup.notified() => {}
                        _ = shutdown.wait() => break,
                    }
                }
                Next::WaitUntil(at) => {
                    // an earlier packet may arrive while we wait
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.wakeup.notified() => {}
                        _ = shutdown.wait() => break,
                    }
                }
                Next::Ready(packet) => {
                    if let Some(delay) = self.bandwidth_delay(packet.data.len()) {
                        if !shutdown.sleep(delay).await {
                            break;
                        }
                    }
                    self.transmit(packet, &mut shutdown).await;
                }
            }
        }
        info!(pending = self.len(), "Send queue stopped");
    }

    async fn transmit(&self, packet: QueuedPacket, shutdown: &mut Shutdown) {
        let QueuedPacket {
            data,
            destination,
            done,
            ..
        } = packet;
        match self.transport.send(&data, &destination).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %destination.short(), bytes = data.len(), "Packet sent");
                let _ = done.send(Ok(()));
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %destination.short(), "Send failed: {}", e);
                let _ = done.send(Err(e));
                shutdown
                    .sleep(Duration::from_millis(self.config.failure_pause_ms))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PeerListRequest;
    use crate::service::shutdown;
    use crate::transport::{LocalNetwork, NodeKeys};

    fn config(kbits: u32) -> SendQueueConfig {
        SendQueueConfig {
            max_bandwidth_kbits: kbits,
            failure_pause_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_ties_keep_insertion_order() {
        let network = LocalNetwork::new();
        let sender = Arc::new(network.join(&NodeKeys::generate()));
        let receiver = network.join(&NodeKeys::generate());
        let queue = SendQueue::new(sender, config(0));

        let at = Instant::now();
        let handles: Vec<SendHandle> = (0u8..5)
            .map(|i| queue.enqueue(vec![i], receiver.local_destination(), at))
            .collect();
        assert_eq!(queue.len(), 5);

        let (trigger, signal) = shutdown::channel();
        let task = tokio::spawn(queue.clone().run(signal));
        for handle in handles {
            handle.sent().await.unwrap();
        }
        for i in 0u8..5 {
            let (data, _) = receiver.receive().await.unwrap();
            assert_eq!(data, vec![i]);
        }
        assert_eq!(queue.sent_count(), 5);
        trigger.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_earliest_send_time_first() {
        let network = LocalNetwork::new();
        let sender = Arc::new(network.join(&NodeKeys::generate()));
        let receiver = network.join(&NodeKeys::generate());
        let queue = SendQueue::new(sender, config(0));
        let (trigger, signal) = shutdown::channel();
        let task = tokio::spawn(queue.clone().run(signal));

        let now = Instant::now();
        let late = queue.enqueue(b"late".to_vec(), receiver.local_destination(), now + Duration::from_secs(30));
        let early = queue.enqueue(b"early".to_vec(), receiver.local_destination(), now);

        early.sent().await.unwrap();
        let (data, _) = receiver.receive().await.unwrap();
        assert_eq!(data, b"early");

        late.sent().await.unwrap();
        assert!(Instant::now() >= now + Duration::from_secs(30));
        let (data, _) = receiver.receive().await.unwrap();
        assert_eq!(data, b"late");

        trigger.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_limit_spaces_sends() {
        let network = LocalNetwork::new();
        let sender = Arc::new(network.join(&NodeKeys::generate()));
        let receiver = network.join(&NodeKeys::generate());
        // 8 kbit/s = 1000 bytes per second
        let queue = SendQueue::new(sender, config(8));
        let (trigger, signal) = shutdown::channel();
        let task = tokio::spawn(queue.clone().run(signal));

        let start = Instant::now();
        let first = queue.enqueue(vec![0; 500], receiver.local_destination(), start);
        let second = queue.enqueue(vec![0; 500], receiver.local_destination(), start);
        first.sent().await.unwrap();
        second.sent().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1000));

        trigger.trigger();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_reported_and_loop_continues() {
        let network = LocalNetwork::new();
        let sender = Arc::new(network.join(&NodeKeys::generate()));
        let receiver = network.join(&NodeKeys::generate());
        let queue = SendQueue::new(sender, config(0));
        let (trigger, signal) = shutdown::channel();
        let task = tokio::spawn(queue.clone().run(signal));

        let nowhere = NodeKeys::generate().destination();
        let packet = Packet::PeerListRequest(PeerListRequest::new());
        let failed = queue.send(&packet, nowhere).unwrap();
        assert_eq!(
            failed.sent().await,
            Err(SendQueueError::Transport(TransportError::PeerUnreachable(nowhere)))
        );

        let ok = queue.send(&packet, receiver.local_destination()).unwrap();
        ok.sent().await.unwrap();
        let (data, _) = receiver.receive().await.unwrap();
        assert_eq!(Packet::decode(&data).unwrap(), packet);
        assert_eq!(queue.failed_count(), 1);

        trigger.trigger();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_packets_fail_after_shutdown() {
        let network = LocalNetwork::new();
        let sender = Arc::new(network.join(&NodeKeys::generate()));
        let queue = SendQueue::new(sender, config(0));
        let (trigger, signal) = shutdown::channel();
        trigger.trigger();
        let handle = queue.enqueue(vec![1], NodeKeys::generate().destination(), Instant::now());
        queue.clone().run(signal).await;
        drop(queue);
        assert_eq!(handle.sent().await, Err(SendQueueError::Stopped));
    }
}
