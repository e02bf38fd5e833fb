// Email → signed, compressed byte stream → fragments → encrypted DHT packets
//
// Fragments are built in two passes: split the stream into payloads, then
// create every fragment with the final count already known.

use super::address::parse_address;
use super::compress;
use super::message::{Email, SignatureStatus, ANONYMOUS_SIGNATURE, SIGNATURE_HEADER};
use super::{EmailError, Result};
use crate::crypto::{self, Hash256};
use crate::identity::{EmailDestination, EmailIdentity};
use crate::packet::{
    DeletionSecret, EncryptedEmailPacket, IndexEntry, IndexPacket, MessageId,
    UnencryptedEmailPacket,
};

/// Everything published for one recipient of one email
#[derive(Debug, Clone)]
pub struct EmailPackets {
    pub message_id: MessageId,
    pub recipient: Hash256,
    pub fragments: Vec<UnencryptedEmailPacket>,
    pub encrypted: Vec<EncryptedEmailPacket>,
    pub index: IndexPacket,
}

/// Strip, normalize and sign a copy of `email` for sending to one recipient.
///
/// Recipient headers are reduced to bare identity hashes; BCC entries are
/// dropped unless listed in `recipients_to_keep`. `sender = None` produces
/// anonymous mail.
pub fn prepare_email(
    email: &Email,
    sender: Option<&EmailIdentity>,
    recipients_to_keep: &[EmailDestination],
) -> Result<Email> {
    let mut prepared = email.clone();
    prepared.strip_headers();
    prepared.remove_header(SIGNATURE_HEADER);
    prepared.ensure_message_id();

    let keep: Vec<Hash256> = recipients_to_keep.iter().map(|d| d.hash()).collect();
    prepared.map_recipients(|header, address| {
        let hash = parse_address(address)?.destination.hash();
        if header.eq_ignore_ascii_case("BCC") && !keep.contains(&hash) {
            return Ok(None);
        }
        Ok(Some(hash.to_base64()))
    })?;

    match sender {
        Some(identity) => {
            prepared.set_header("From", &identity.destination().to_base64());
            prepared.remove_header("Sender");
            let signature = identity.sign(&prepared.signed_bytes())?;
            prepared.add_header(SIGNATURE_HEADER, &crypto::to_base64(&signature));
            prepared.signature = SignatureStatus::Valid;
        }
        None => {
            prepared.remove_header("From");
            prepared.remove_header("Sender");
            prepared.add_header(SIGNATURE_HEADER, ANONYMOUS_SIGNATURE);
            prepared.signature = SignatureStatus::Anonymous;
        }
    }
    Ok(prepared)
}

/// Check the signature header against the From destination
pub fn verify_signature(email: &Email) -> SignatureStatus {
    let Some(value) = email.header(SIGNATURE_HEADER) else {
        return SignatureStatus::Invalid;
    };
    if value == ANONYMOUS_SIGNATURE {
        return SignatureStatus::Anonymous;
    }
    let check = || -> std::result::Result<bool, crypto::CryptoError> {
        let sender = email
            .header("From")
            .ok_or(crypto::CryptoError::InvalidSignature)?;
        let destination = EmailDestination::from_base64(sender)
            .map_err(|_| crypto::CryptoError::InvalidSignature)?;
        let encoded = crypto::from_base64(value)?;
        let (scheme, raw) = crypto::decode_signature(&encoded)?;
        if scheme != destination.scheme() {
            return Ok(false);
        }
        destination.verify(&email.signed_bytes(), raw)
    };
    match check() {
        Ok(true) => SignatureStatus::Valid,
        _ => SignatureStatus::Invalid,
    }
}

/// Split a stream into fragments of at most `max_fragment_size` payload bytes
pub fn fragment_stream(
    stream: &[u8],
    message_id: MessageId,
    max_fragment_size: usize,
) -> Result<Vec<UnencryptedEmailPacket>> {
    if max_fragment_size == 0 || max_fragment_size > u16::MAX as usize {
        return Err(EmailError::FragmentSize(max_fragment_size));
    }
    // pass 1: payloads
    let payloads: Vec<&[u8]> = if stream.is_empty() {
        vec![stream]
    } else {
        stream.chunks(max_fragment_size).collect()
    };
    let count = u16::try_from(payloads.len()).map_err(|_| EmailError::TooLarge(stream.len()))?;

    // pass 2: fragments with the final count
    payloads
        .into_iter()
        .enumerate()
        .map(|(index, payload)| {
            UnencryptedEmailPacket::new(
                message_id,
                index as u16,
                count,
                payload.to_vec(),
                DeletionSecret::random(),
            )
            .map_err(EmailError::from)
        })
        .collect()
}

/// Reassemble the stream from a complete fragment set in any order
pub fn join_fragments(fragments: &[UnencryptedEmailPacket]) -> Result<Vec<u8>> {
    let first = fragments.first().ok_or(EmailError::MissingFragments { have: 0, need: 1 })?;
    let count = first.fragment_count as usize;
    if fragments.len() != count {
        return Err(EmailError::MissingFragments {
            have: fragments.len(),
            need: count,
        });
    }
    let mut ordered: Vec<Option<&UnencryptedEmailPacket>> = vec![None; count];
    for fragment in fragments {
        if fragment.message_id != first.message_id || fragment.fragment_count != first.fragment_count {
            return Err(EmailError::InconsistentFragments(
                "fragments belong to different emails".to_string(),
            ));
        }
        let slot = ordered
            .get_mut(fragment.fragment_index as usize)
            .ok_or_else(|| EmailError::InconsistentFragments("index out of range".to_string()))?;
        if slot.replace(fragment).is_some() {
            return Err(EmailError::InconsistentFragments(format!(
                "duplicate fragment {}",
                fragment.fragment_index
            )));
        }
    }
    let mut stream = Vec::new();
    for fragment in ordered.into_iter().flatten() {
        stream.extend_from_slice(&fragment.payload);
    }
    Ok(stream)
}

/// Build the fragments, encrypted packets and index entries that deliver
/// `email` to `recipient`.
pub fn create_email_packets(
    email: &Email,
    sender: Option<&EmailIdentity>,
    recipient: &EmailDestination,
    recipients_to_keep: &[EmailDestination],
    max_fragment_size: usize,
) -> Result<EmailPackets> {
    if email.all_recipients().is_empty() {
        return Err(EmailError::NoRecipients);
    }
    if max_fragment_size > UnencryptedEmailPacket::max_payload_len(recipient.scheme()) {
        return Err(EmailError::FragmentSize(max_fragment_size));
    }
    let prepared = prepare_email(email, sender, recipients_to_keep)?;
    let stream = compress::encode(&prepared.to_bytes());

    let message_id = MessageId::random();
    let fragments = fragment_stream(&stream, message_id, max_fragment_size)?;

    let mut index = IndexPacket::new(recipient.hash());
    let mut encrypted = Vec::with_capacity(fragments.len());
    for fragment in &fragments {
        let packet = fragment.encrypt(recipient)?;
        index.put(IndexEntry {
            email_packet_key: packet.dht_key,
            deletion_hash: packet.deletion_hash,
            store_time: 0,
        });
        encrypted.push(packet);
    }

    tracing::debug!(
        message = %message_id,
        recipient = %recipient.hash().short(),
        fragments = fragments.len(),
        stream_len = stream.len(),
        "Created email packets"
    );

    Ok(EmailPackets {
        message_id,
        recipient: recipient.hash(),
        fragments,
        encrypted,
        index,
    })
}

/// Rebuild an email from its complete fragment set and check its signature
pub fn reassemble(fragments: &[UnencryptedEmailPacket]) -> Result<Email> {
    let stream = join_fragments(fragments)?;
    let bytes = compress::decode(&stream)?;
    let mut email = Email::parse(&bytes)?;
    email.signature = verify_signature(&email);
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SchemeId;
    use crate::packet::WirePacket;
    use proptest::prelude::*;

    fn identity(name: &str) -> EmailIdentity {
        EmailIdentity::generate(SchemeId::EcP256, name)
    }

    fn email_to(recipients: &[&EmailIdentity]) -> Email {
        let to: Vec<String> = recipients
            .iter()
            .map(|r| format!("Someone <{}>", r.destination()))
            .collect();
        Email::new()
            .with_header("To", &to.join(", "))
            .with_header("Subject", "Test")
            .with_header("X-Private", "leak")
            .with_body("Hello there")
    }

    proptest! {
        #[test]
        fn prop_fragment_count_and_reassembly(
            stream in proptest::collection::vec(any::<u8>(), 1..5000),
            cap in 1usize..700,
            seed in any::<u64>(),
        ) {
            let fragments = fragment_stream(&stream, MessageId::random(), cap).unwrap();
            prop_assert_eq!(fragments.len(), (stream.len() + cap - 1) / cap);
            let id = fragments[0].message_id;
            for f in &fragments {
                prop_assert_eq!(f.message_id, id);
                prop_assert_eq!(f.fragment_count as usize, fragments.len());
                prop_assert!(f.payload.len() <= cap);
            }
            // any order
            let mut shuffled = fragments.clone();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();
            prop_assert_eq!(join_fragments(&shuffled).unwrap(), stream);
        }
    }

    #[test]
    fn test_zero_recipients_rejected() {
        let sender = identity("s");
        let recipient = identity("r");
        let email = Email::new().with_header("Subject", "nobody").with_body("x");
        assert!(matches!(
            create_email_packets(&email, Some(&sender), recipient.destination(), &[], 100),
            Err(EmailError::NoRecipients)
        ));
    }

    #[test]
    fn test_packets_decrypt_and_reassemble() {
        let sender = identity("s");
        let recipient = identity("r");
        let email = email_to(&[&recipient]).with_body(&"long body ".repeat(500));

        let packets =
            create_email_packets(&email, Some(&sender), recipient.destination(), &[], 200).unwrap();
        assert!(packets.fragments.len() > 1);
        assert_eq!(packets.encrypted.len(), packets.fragments.len());
        assert_eq!(packets.index.len(), packets.encrypted.len());
        assert_eq!(packets.index.recipient, recipient.hash());

        let decrypted: Vec<UnencryptedEmailPacket> = packets
            .encrypted
            .iter()
            .rev()
            .map(|p| p.decrypt(&recipient).unwrap())
            .collect();
        let received = reassemble(&decrypted).unwrap();

        assert_eq!(received.signature, SignatureStatus::Valid);
        assert_eq!(received.body(), email.body());
        assert_eq!(received.header("From"), Some(sender.destination().to_base64().as_str()));
        assert_eq!(received.header("To"), Some(recipient.hash().to_base64().as_str()));
        assert!(received.header("X-Private").is_none());
    }

    #[test]
    fn test_anonymous_email() {
        let recipient = identity("r");
        let email = email_to(&[&recipient]).with_header("From", "someone");
        let packets = create_email_packets(&email, None, recipient.destination(), &[], 10_000).unwrap();
        let decrypted: Vec<_> = packets
            .encrypted
            .iter()
            .map(|p| p.decrypt(&recipient).unwrap())
            .collect();
        let received = reassemble(&decrypted).unwrap();
        assert_eq!(received.signature, SignatureStatus::Anonymous);
        assert!(received.header("From").is_none());
    }

    #[test]
    fn test_bcc_kept_only_for_listed_recipients() {
        let sender = identity("s");
        let visible = identity("v");
        let hidden = identity("h");
        let email = email_to(&[&visible]).with_header("BCC", &hidden.destination().to_base64());

        let for_visible = prepare_email(&email, Some(&sender), &[]).unwrap();
        assert!(for_visible.header("BCC").is_none());

        let for_hidden = prepare_email(&email, Some(&sender), &[hidden.destination().clone()]).unwrap();
        assert_eq!(for_hidden.header("BCC"), Some(hidden.hash().to_base64().as_str()));
    }

    #[test]
    fn test_tampered_email_fails_verification() {
        let sender = identity("s");
        let recipient = identity("r");
        let mut prepared = prepare_email(&email_to(&[&recipient]), Some(&sender), &[]).unwrap();
        assert_eq!(verify_signature(&prepared), SignatureStatus::Valid);
        prepared.set_header("Subject", "Changed");
        assert_eq!(verify_signature(&prepared), SignatureStatus::Invalid);
    }

    #[test]
    fn test_join_rejects_incomplete_and_mixed_sets() {
        let stream = vec![1u8; 30];
        let a = fragment_stream(&stream, MessageId::random(), 10).unwrap();
        let b = fragment_stream(&stream, MessageId::random(), 10).unwrap();
        assert!(matches!(
            join_fragments(&a[..2]),
            Err(EmailError::MissingFragments { have: 2, need: 3 })
        ));
        let mixed = vec![a[0].clone(), a[1].clone(), b[2].clone()];
        assert!(matches!(
            join_fragments(&mixed),
            Err(EmailError::InconsistentFragments(_))
        ));
        let duplicated = vec![a[0].clone(), a[0].clone(), a[1].clone()];
        assert!(join_fragments(&duplicated).is_err());
    }

    #[test]
    fn test_invalid_fragment_size() {
        assert!(matches!(
            fragment_stream(b"abc", MessageId::random(), 0),
            Err(EmailError::FragmentSize(0))
        ));
    }

    #[test]
    fn test_fragment_size_bounded_by_recipient_scheme() {
        let body: String = (0..9000u32).map(|i| format!("{:08x}", i.wrapping_mul(2_654_435_761))).collect();
        for id in SchemeId::ALL {
            let recipient = EmailIdentity::generate(id, "r");
            let email = Email::new()
                .with_header("To", &recipient.destination().to_base64())
                .with_body(&body);
            let max = UnencryptedEmailPacket::max_payload_len(id);

            let packets =
                create_email_packets(&email, None, recipient.destination(), &[], max).unwrap();
            for packet in &packets.encrypted {
                assert!(packet.to_bytes().is_ok(), "scheme {}", id);
            }
            assert!(matches!(
                create_email_packets(&email, None, recipient.destination(), &[], max + 1),
                Err(EmailError::FragmentSize(_))
            ));
        }
    }
}
