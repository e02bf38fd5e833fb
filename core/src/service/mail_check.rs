// Mail check driver
//
// One cycle per call: for every local identity, merge all copies of its index
// packet, fetch and decrypt the listed fragments with a worker pool that
// lives only for this cycle, hand the fragments to the incomplete folder and
// delete what was consumed. Only one cycle runs at a time.

use super::Shutdown;
use crate::config::MailCheckConfig;
use crate::dht::DhtStorage;
use crate::identity::{EmailIdentity, IdentityStore};
use crate::packet::{DhtPacket, IndexEntry, IndexPacket, PacketType, UnencryptedEmailPacket};
use crate::store::IncompleteEmailFolder;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Result of a mail check request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Completed { new_mail: bool },
    /// Another check was running; this request was dropped
    AlreadyChecking,
}

impl CheckOutcome {
    pub fn new_mail(&self) -> bool {
        matches!(self, CheckOutcome::Completed { new_mail: true })
    }
}

/// Clears the checking flag when a cycle ends, however it ends
struct CheckGuard<'a>(&'a AtomicBool);

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MailChecker {
    dht: Arc<dyn DhtStorage>,
    identities: Arc<IdentityStore>,
    incomplete: Arc<IncompleteEmailFolder>,
    config: MailCheckConfig,
    checking: AtomicBool,
    wake: Notify,
}

impl MailChecker {
    pub fn new(
        dht: Arc<dyn DhtStorage>,
        identities: Arc<IdentityStore>,
        incomplete: Arc<IncompleteEmailFolder>,
        config: MailCheckConfig,
    ) -> Self {
        Self {
            dht,
            identities,
            incomplete,
            config,
            checking: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn is_checking(&self) -> bool {
        self.checking.load(Ordering::Acquire)
    }

    /// Ask the background loop for an immediate check
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    fn begin(&self) -> Option<CheckGuard<'_>> {
        self.checking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CheckGuard(&self.checking))
    }

    /// Run one check cycle over every local identity
    pub async fn check_mail(&self) -> CheckOutcome {
        let Some(_guard) = self.begin() else {
            debug!("Mail check already running");
            return CheckOutcome::AlreadyChecking;
        };

        let identities = match self.identities.get_all() {
            Ok(identities) => identities,
            Err(e) => {
                warn!("Could not load identities for mail check: {}", e);
                return CheckOutcome::Completed { new_mail: false };
            }
        };

        let mut new_mail = false;
        for identity in identities {
            match self.check_identity(identity).await {
                Ok(completed) => new_mail |= completed > 0,
                Err(e) => warn!("Mail check failed: {}", e),
            }
        }
        CheckOutcome::Completed { new_mail }
    }

    /// Returns the number of emails completed for `identity`
    async fn check_identity(&self, identity: EmailIdentity) -> crate::dht::Result<usize> {
        let recipient = identity.hash();
        let copies = self.dht.find_all(&recipient, PacketType::Index).await?;
        let indexes: Vec<IndexPacket> = copies
            .into_iter()
            .filter_map(|packet| match packet {
                DhtPacket::Index(index) if index.recipient == recipient => Some(index),
                _ => None,
            })
            .collect();
        let index = IndexPacket::merge(recipient, &indexes);
        if index.is_empty() {
            debug!(identity = %recipient.short(), "No mail");
            return Ok(0);
        }
        debug!(identity = %recipient.short(), entries = index.len(), copies = indexes.len(), "Fetching email packets");

        let fetched = self.fetch_all(Arc::new(identity), index.entries().copied().collect()).await;

        let mut completed = 0;
        for (entry, fragment) in fetched {
            let key = entry.email_packet_key;
            match self.incomplete.add_fragment(&fragment) {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key.short(), "Could not store fragment: {}", e);
                    continue;
                }
            }
            let secret = &fragment.deletion_secret;
            if let Err(e) = self.dht.delete_email_packet(&key, secret).await {
                warn!(key = %key.short(), "Could not delete email packet: {}", e);
            }
            if let Err(e) = self.dht.delete_index_entry(&recipient, &key, secret).await {
                warn!(key = %key.short(), "Could not delete index entry: {}", e);
            }
        }
        if completed > 0 {
            info!(identity = %recipient.short(), emails = completed, "📬 New mail");
        }
        Ok(completed)
    }

    /// Fetch and decrypt `entries` with at most `fetch_workers` in flight.
    /// Missing, foreign and corrupt packets are left out of the result.
    async fn fetch_all(
        &self,
        identity: Arc<EmailIdentity>,
        entries: Vec<IndexEntry>,
    ) -> Vec<(IndexEntry, UnencryptedEmailPacket)> {
        let permits = Arc::new(Semaphore::new(self.config.fetch_workers.max(1)));
        let timeout = self.config.fetch_timeout();
        let mut pool = JoinSet::new();

        for entry in entries {
            let permits = permits.clone();
            let dht = self.dht.clone();
            let identity = identity.clone();
            pool.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                let fragment = fetch_fragment(dht.as_ref(), &identity, &entry, timeout).await?;
                Some((entry, fragment))
            });
        }

        let mut fetched = Vec::new();
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(Some(result)) => fetched.push(result),
                Ok(None) => {}
                Err(e) => warn!("Fetch worker failed: {}", e),
            }
        }
        fetched
    }

    /// Background loop: check on start and then every interval, or whenever
    /// woken
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        info!(
            auto = self.config.auto_check,
            interval_mins = self.config.interval_mins,
            "Mail checker started"
        );
        let mut due = self.config.auto_check;
        loop {
            if due {
                if self.dht.is_ready() {
                    // fetches are bounded by their own timeout, let the cycle finish
                    let outcome = self.check_mail().await;
                    debug!(?outcome, "Mail check finished");
                    if shutdown.is_triggered() {
                        break;
                    }
                } else {
                    debug!("DHT not ready, skipping mail check");
                }
            }
            if self.config.auto_check {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.interval()) => {}
                    _ = self.wake.notified() => {}
                    _ = shutdown.wait() => break,
                }
            } else {
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = shutdown.wait() => break,
                }
            }
            due = true;
        }
        info!("Mail checker stopped");
    }
}

async fn fetch_fragment(
    dht: &dyn DhtStorage,
    identity: &EmailIdentity,
    entry: &IndexEntry,
    timeout: Duration,
) -> Option<UnencryptedEmailPacket> {
    let key = entry.email_packet_key;
    let found = match tokio::time::timeout(timeout, dht.find_one(&key, PacketType::Email)).await {
        Ok(Ok(found)) => found,
        Ok(Err(e)) => {
            debug!(key = %key.short(), "Email packet lookup failed: {}", e);
            return None;
        }
        Err(_) => {
            debug!(key = %key.short(), "Email packet lookup timed out");
            return None;
        }
    };
    let Some(DhtPacket::Email(packet)) = found else {
        debug!(key = %key.short(), "Email packet not in the DHT yet");
        return None;
    };
    match packet.decrypt(identity) {
        Ok(fragment) => Some(fragment),
        Err(e) => {
            debug!(key = %key.short(), "Discarding undecryptable email packet: {}", e);
            None
        }
    }
}
