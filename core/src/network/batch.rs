// Packet batches: one logical request sent to many peers
//
// A batch remembers the correlation id and destination of every request it
// sent, collects the matching responses as the dispatcher hands them in, and
// lets the caller wait for "all sent", "first reply" or "all replies" with a
// bound on the wait. Callers carry on with whatever arrived in time.

use super::send_queue::SendHandle;
use crate::packet::{CorrelationId, ResponsePacket};
use crate::transport::Destination;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Transient request/response round
#[derive(Default)]
pub struct PacketBatch {
    requests: Mutex<HashMap<CorrelationId, Destination>>,
    handles: Mutex<Vec<SendHandle>>,
    responses: Mutex<HashMap<CorrelationId, (Destination, ResponsePacket)>>,
    response_notify: Notify,
}

impl PacketBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request that was queued for `destination`
    pub fn add(&self, correlation_id: CorrelationId, destination: Destination, handle: SendHandle) {
        self.requests.lock().insert(correlation_id, destination);
        self.handles.lock().push(handle);
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    pub fn expects(&self, correlation_id: &CorrelationId) -> bool {
        self.requests.lock().contains_key(correlation_id)
    }

    /// Offer an inbound response. Accepted only if it answers one of our
    /// requests, comes from the peer that request went to, and is the first
    /// answer for it.
    pub fn offer(&self, from: &Destination, response: &ResponsePacket) -> bool {
        let id = response.correlation_id;
        match self.requests.lock().get(&id) {
            Some(destination) if destination == from => {}
            _ => return false,
        }
        let mut responses = self.responses.lock();
        if responses.contains_key(&id) {
            return false;
        }
        responses.insert(id, (*from, response.clone()));
        drop(responses);
        self.response_notify.notify_waiters();
        true
    }

    /// Wait until every request was handed to the transport or `timeout`
    /// passed. Returns how many were transmitted successfully.
    pub async fn await_all_sent(&self, timeout: Duration) -> usize {
        let handles: Vec<SendHandle> = std::mem::take(&mut *self.handles.lock());
        let results = tokio::time::timeout(
            timeout,
            futures::future::join_all(handles.into_iter().map(|h| h.sent())),
        )
        .await;
        match results {
            Ok(results) => results.into_iter().filter(|r| r.is_ok()).count(),
            Err(_) => 0,
        }
    }

    /// Wait for at least one response. Returns false on timeout.
    pub async fn await_first_reply(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |batch| batch.response_count() > 0).await
    }

    /// Wait for a response to every request. Returns false on timeout.
    pub async fn await_all_replies(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |batch| batch.response_count() >= batch.len())
            .await
    }

    async fn wait_for(&self, timeout: Duration, done: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // registered before the check so a response in between is not missed
            let notified = self.response_notify.notified();
            if done(self) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return done(self);
            }
        }
    }

    pub fn response_count(&self) -> usize {
        self.responses.lock().len()
    }

    pub fn response(&self, correlation_id: &CorrelationId) -> Option<ResponsePacket> {
        self.responses
            .lock()
            .get(correlation_id)
            .map(|(_, response)| response.clone())
    }

    /// All responses received so far with their senders
    pub fn responses(&self) -> Vec<(Destination, ResponsePacket)> {
        self.responses.lock().values().cloned().collect()
    }

    /// Destinations of all requests
    pub fn destinations(&self) -> Vec<Destination> {
        self.requests.lock().values().copied().collect()
    }

    pub fn responded(&self, destination: &Destination) -> bool {
        self.responses
            .lock()
            .values()
            .any(|(from, _)| from == destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendQueueConfig;
    use crate::network::SendQueue;
    use crate::packet::{Packet, PeerListRequest, ResponseStatus};
    use crate::service::shutdown;
    use crate::transport::{LocalNetwork, NodeKeys, Transport};
    use std::sync::Arc;

    fn response(id: CorrelationId) -> ResponsePacket {
        ResponsePacket::new(id, ResponseStatus::Ok, vec![1, 2, 3])
    }

    fn queued_batch(peers: &[Destination]) -> (PacketBatch, Vec<CorrelationId>) {
        let network = LocalNetwork::new();
        let sender = Arc::new(network.join(&NodeKeys::generate()));
        let queue = SendQueue::new(sender, SendQueueConfig::default());
        let batch = PacketBatch::new();
        let mut ids = Vec::new();
        for peer in peers {
            let request = PeerListRequest::new();
            let handle = queue
                .send(&Packet::PeerListRequest(request.clone()), *peer)
                .unwrap();
            batch.add(request.correlation_id, *peer, handle);
            ids.push(request.correlation_id);
        }
        (batch, ids)
    }

    #[tokio::test]
    async fn test_offer_classifies_responses() {
        let a = Destination([1; 32]);
        let b = Destination([2; 32]);
        let (batch, ids) = queued_batch(&[a, b]);
        assert_eq!(batch.len(), 2);
        assert!(batch.expects(&ids[0]));

        // unknown id, wrong sender, then the real answer twice
        assert!(!batch.offer(&a, &response(CorrelationId::random())));
        assert!(!batch.offer(&b, &response(ids[0])));
        assert!(batch.offer(&a, &response(ids[0])));
        assert!(!batch.offer(&a, &response(ids[0])));

        assert_eq!(batch.response_count(), 1);
        assert!(batch.responded(&a));
        assert!(!batch.responded(&b));
        assert!(batch.response(&ids[0]).is_some());
        assert!(batch.response(&ids[1]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_reply_and_timeout() {
        let a = Destination([1; 32]);
        let b = Destination([2; 32]);
        let (batch, ids) = queued_batch(&[a, b]);
        let batch = Arc::new(batch);

        assert!(!batch.await_first_reply(Duration::from_secs(5)).await);

        let responder = batch.clone();
        let id = ids[1];
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            responder.offer(&b, &response(id));
        });
        assert!(batch.await_first_reply(Duration::from_secs(10)).await);
        // the other peer never answers
        assert!(!batch.await_all_replies(Duration::from_secs(10)).await);
        assert_eq!(batch.responses().len(), 1);
    }

    #[tokio::test]
    async fn test_all_replies() {
        let peers = [Destination([1; 32]), Destination([2; 32]), Destination([3; 32])];
        let (batch, ids) = queued_batch(&peers);
        for (peer, id) in peers.iter().zip(&ids) {
            batch.offer(peer, &response(*id));
        }
        assert!(batch.await_all_replies(Duration::from_millis(10)).await);
        let mut destinations = batch.destinations();
        destinations.sort();
        assert_eq!(destinations, peers.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_all_sent_counts_transmissions() {
        let network = LocalNetwork::new();
        let sender = Arc::new(network.join(&NodeKeys::generate()));
        let online = network.join(&NodeKeys::generate());
        let queue = SendQueue::new(sender, SendQueueConfig::default());
        let (trigger, signal) = shutdown::channel();
        let task = tokio::spawn(queue.clone().run(signal));

        let batch = PacketBatch::new();
        for peer in [online.local_destination(), NodeKeys::generate().destination()] {
            let request = PeerListRequest::new();
            let handle = queue
                .send(&Packet::PeerListRequest(request.clone()), peer)
                .unwrap();
            batch.add(request.correlation_id, peer, handle);
        }
        assert_eq!(batch.await_all_sent(Duration::from_secs(30)).await, 1);

        trigger.trigger();
        task.await.unwrap();
    }
}
