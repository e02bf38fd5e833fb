// Outbox driver
//
// Each pass walks the queued emails oldest first. Recipients are resolved,
// then every recipient not served yet gets its own fragments, encrypted
// packets and index packet published. Progress is written back after each
// recipient so a failure part way through resumes where it stopped on the
// next pass. Fully sent emails move to the sent folder.

use super::Shutdown;
use crate::config::OutboxConfig;
use crate::email::{create_email_packets, resolve_address, AddressBook, Email};
use crate::identity::{EmailDestination, EmailIdentity, IdentityStore};
use crate::packet::DhtPacket;
use crate::relay::PacketPublisher;
use crate::store::outbox::OutboxStatus;
use crate::store::{EmailFolder, EmailMetadata, MetadataStore, Outbox, OutboxEntry};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Result of one outbox pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxPass {
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
}

pub struct OutboxProcessor {
    outbox: Arc<Outbox>,
    sent_folder: Arc<EmailFolder>,
    metadata: Arc<MetadataStore>,
    identities: Arc<IdentityStore>,
    publisher: Arc<PacketPublisher>,
    address_book: Option<Arc<dyn AddressBook>>,
    config: OutboxConfig,
    max_fragment_size: usize,
    wake: Notify,
    pass_lock: Mutex<()>,
}

impl OutboxProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outbox: Arc<Outbox>,
        sent_folder: Arc<EmailFolder>,
        metadata: Arc<MetadataStore>,
        identities: Arc<IdentityStore>,
        publisher: Arc<PacketPublisher>,
        config: OutboxConfig,
        max_fragment_size: usize,
    ) -> Self {
        Self {
            outbox,
            sent_folder,
            metadata,
            identities,
            publisher,
            address_book: None,
            config,
            max_fragment_size,
            wake: Notify::new(),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn with_address_book(mut self, book: Arc<dyn AddressBook>) -> Self {
        self.address_book = Some(book);
        self
    }

    /// Start a pass now instead of waiting out the interval
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Process every queued email once. Passes never overlap.
    pub async fn process_all(&self) -> OutboxPass {
        let _pass = self.pass_lock.lock().await;
        let entries = match self.outbox.pending() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not read outbox: {}", e);
                return OutboxPass::default();
            }
        };

        let mut pass = OutboxPass::default();
        for entry in entries {
            pass.processed += 1;
            let id = entry.id.clone();
            match self.process_entry(entry).await {
                Ok(OutboxStatus::Sent) => pass.sent += 1,
                Ok(OutboxStatus::Failed(reason)) => {
                    pass.failed += 1;
                    warn!(email_id = %id, "Send failed, retrying on the next pass: {}", reason);
                }
                Ok(_) => {}
                Err(e) => {
                    pass.failed += 1;
                    warn!(email_id = %id, "Outbox store error: {}", e);
                }
            }
        }
        pass
    }

    fn sender_identity(&self, entry: &OutboxEntry) -> Result<Option<EmailIdentity>, String> {
        let Some(hash) = entry.sender else {
            return Ok(None);
        };
        match self.identities.get(&hash) {
            Ok(Some(identity)) => Ok(Some(identity)),
            Ok(None) => Err(format!("Unknown sender identity {}", hash.short())),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Rewrite recipient headers to inline destinations and collect the
    /// distinct recipients
    fn resolve_recipients(&self, email: &mut Email) -> Result<Vec<EmailDestination>, String> {
        let book = self.address_book.as_deref();
        let mut recipients: Vec<EmailDestination> = Vec::new();
        email
            .map_recipients(|_, text| {
                let address = resolve_address(text, book)?;
                if !recipients.iter().any(|d| d.hash() == address.destination.hash()) {
                    recipients.push(address.destination.clone());
                }
                Ok(Some(address.to_header_value()))
            })
            .map_err(|e| e.to_string())?;
        if recipients.is_empty() {
            return Err("No recipients".to_string());
        }
        Ok(recipients)
    }

    fn fail(&self, mut entry: OutboxEntry, reason: String) -> crate::store::Result<OutboxStatus> {
        entry.status = OutboxStatus::Failed(reason);
        self.outbox.update(&entry)?;
        Ok(entry.status)
    }

    /// Send one email to every recipient it has not reached yet
    pub async fn process_entry(&self, mut entry: OutboxEntry) -> crate::store::Result<OutboxStatus> {
        let sender = match self.sender_identity(&entry) {
            Ok(sender) => sender,
            Err(reason) => return self.fail(entry, reason),
        };
        let mut email = entry.email.clone();
        let recipients = match self.resolve_recipients(&mut email) {
            Ok(recipients) => recipients,
            Err(reason) => return self.fail(entry, reason),
        };

        // every recipient copy carries the same Message-ID
        if entry.email.message_id().is_none() {
            let message_id = email.ensure_message_id();
            entry.email.set_header("Message-ID", &message_id);
        }

        let total = recipients.len();
        entry.attempts += 1;
        entry.status = OutboxStatus::Sending;
        self.outbox.update(&entry)?;
        debug!(email_id = %entry.id, recipients = total, attempt = entry.attempts, "Sending email");

        for recipient in &recipients {
            let recipient_hash = recipient.hash();
            if entry.is_sent_to(&recipient_hash) {
                continue;
            }
            if let Err(reason) = self
                .send_to(&entry.id, &email, sender.as_ref(), recipient)
                .await
            {
                return self.fail(entry, reason);
            }
            entry.sent_to.push(recipient_hash);
            if entry.sent_to.len() < total {
                entry.status = OutboxStatus::Partial {
                    sent: entry.sent_to.len(),
                    total,
                };
                self.outbox.update(&entry)?;
            }
        }

        entry.status = OutboxStatus::Sent;
        self.outbox.update(&entry)?;
        let sent_id = self.sent_folder.add(entry.email.clone())?;
        self.outbox.remove(&entry.id)?;
        info!(email_id = %entry.id, sent_id = %sent_id, recipients = total, "📨 Email sent");
        Ok(OutboxStatus::Sent)
    }

    async fn send_to(
        &self,
        email_id: &str,
        email: &Email,
        sender: Option<&EmailIdentity>,
        recipient: &EmailDestination,
    ) -> Result<(), String> {
        let packets = create_email_packets(
            email,
            sender,
            recipient,
            std::slice::from_ref(recipient),
            self.max_fragment_size,
        )
        .map_err(|e| e.to_string())?;

        for packet in &packets.encrypted {
            self.publisher
                .publish(DhtPacket::Email(packet.clone()))
                .await
                .map_err(|e| e.to_string())?;
        }
        self.publisher
            .publish(DhtPacket::Index(packets.index.clone()))
            .await
            .map_err(|e| e.to_string())?;

        let mut metadata = self
            .metadata
            .get(email_id)
            .map_err(|e| e.to_string())?
            .unwrap_or_else(|| EmailMetadata::new(email_id));
        metadata.set_recipient_packets(
            recipient.hash(),
            packets
                .encrypted
                .iter()
                .map(|p| (p.dht_key, p.deletion_hash)),
        );
        self.metadata.put(&metadata).map_err(|e| e.to_string())?;
        debug!(
            email_id = %email_id,
            recipient = %recipient.hash().short(),
            fragments = packets.encrypted.len(),
            "Published email packets"
        );
        Ok(())
    }

    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        info!(interval_secs = self.config.interval_secs, "Outbox processor started");
        loop {
            let pass = self.process_all().await;
            if pass.processed > 0 {
                info!(
                    processed = pass.processed,
                    sent = pass.sent,
                    failed = pass.failed,
                    "Outbox pass finished"
                );
            }
            if shutdown.is_triggered() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.wait() => break,
            }
        }
        info!("Outbox processor stopped");
    }
}
