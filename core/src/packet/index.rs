// Index packets: per-recipient list of the fragment keys stored for them

use super::codec::Reader;
use super::{PacketError, PacketType, Result, WirePacket};
use crate::crypto::Hash256;
use std::collections::BTreeMap;

/// Size of one encoded entry
pub const ENTRY_LEN: usize = 32 + 32 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub email_packet_key: Hash256,
    pub deletion_hash: Hash256,
    pub store_time: u32,
}

/// Set of fragment entries for one recipient, unique by `email_packet_key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPacket {
    pub recipient: Hash256,
    entries: BTreeMap<Hash256, IndexEntry>,
}

impl IndexPacket {
    pub fn new(recipient: Hash256) -> Self {
        Self {
            recipient,
            entries: BTreeMap::new(),
        }
    }

    /// Union of all `packets` addressed to `recipient`; packets for other
    /// recipients are ignored. For duplicate keys the first entry seen wins.
    pub fn merge<'a>(recipient: Hash256, packets: impl IntoIterator<Item = &'a IndexPacket>) -> Self {
        let mut merged = Self::new(recipient);
        for packet in packets.into_iter().filter(|p| p.recipient == recipient) {
            merged.merge_from(packet);
        }
        merged
    }

    /// Add every entry of `other` not already present
    pub fn merge_from(&mut self, other: &IndexPacket) {
        for (key, entry) in &other.entries {
            self.entries.entry(*key).or_insert(*entry);
        }
    }

    /// Insert or replace the entry for `entry.email_packet_key`
    pub fn put(&mut self, entry: IndexEntry) {
        self.entries.insert(entry.email_packet_key, entry);
    }

    pub fn remove(&mut self, key: &Hash256) -> Option<IndexEntry> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &Hash256) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &Hash256) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stamp every entry with `store_time`
    pub fn set_store_time(&mut self, store_time: u32) {
        for entry in self.entries.values_mut() {
            entry.store_time = store_time;
        }
    }
}

impl WirePacket for IndexPacket {
    const TYPE: PacketType = PacketType::Index;

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        let count = u32::try_from(self.entries.len()).map_err(|_| PacketError::TooLarge {
            field: "index entries",
            len: self.entries.len(),
            max: u32::MAX as usize,
        })?;
        out.reserve(32 + 4 + self.entries.len() * ENTRY_LEN);
        out.extend_from_slice(self.recipient.as_bytes());
        out.extend_from_slice(&count.to_be_bytes());
        for entry in self.entries.values() {
            out.extend_from_slice(entry.email_packet_key.as_bytes());
            out.extend_from_slice(entry.deletion_hash.as_bytes());
            out.extend_from_slice(&entry.store_time.to_be_bytes());
        }
        Ok(())
    }

    fn decode_body(reader: &mut Reader<'_>) -> Result<Self> {
        let recipient = reader.read_hash()?;
        let count = reader.read_u32()? as usize;
        // reject absurd counts before allocating anything
        if count > reader.remaining() / ENTRY_LEN {
            return Err(PacketError::Truncated {
                need: count.saturating_mul(ENTRY_LEN),
                got: reader.remaining(),
            });
        }
        let mut packet = Self::new(recipient);
        for _ in 0..count {
            let email_packet_key = reader.read_hash()?;
            let deletion_hash = reader.read_hash()?;
            let store_time = reader.read_u32()?;
            packet.entries.entry(email_packet_key).or_insert(IndexEntry {
                email_packet_key,
                deletion_hash,
                store_time,
            });
        }
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(seed: u8) -> IndexEntry {
        IndexEntry {
            email_packet_key: Hash256::digest(&[seed]),
            deletion_hash: Hash256::digest(&[seed, seed]),
            store_time: seed as u32,
        }
    }

    fn index(recipient: Hash256, seeds: &[u8]) -> IndexPacket {
        let mut packet = IndexPacket::new(recipient);
        for &seed in seeds {
            packet.put(entry(seed));
        }
        packet
    }

    proptest! {
        #[test]
        fn prop_index_roundtrip(seeds in proptest::collection::vec(any::<u8>(), 0..100)) {
            let packet = index(Hash256::digest(b"r"), &seeds);
            let decoded = IndexPacket::from_bytes(&packet.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded, packet);
        }

        #[test]
        fn prop_merge_commutative_and_idempotent(
            a in proptest::collection::vec(any::<u8>(), 0..50),
            b in proptest::collection::vec(any::<u8>(), 0..50),
        ) {
            let recipient = Hash256::digest(b"r");
            let i1 = index(recipient, &a);
            let i2 = index(recipient, &b);
            let ab = IndexPacket::merge(recipient, [&i1, &i2]);
            let ba = IndexPacket::merge(recipient, [&i2, &i1]);
            prop_assert_eq!(&ab, &ba);
            let again = IndexPacket::merge(recipient, [&ab, &ab]);
            prop_assert_eq!(&again, &ab);
        }

        #[test]
        fn prop_merge_size_is_distinct_keys(
            sets in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..30), 1..6),
        ) {
            let recipient = Hash256::digest(b"r");
            let packets: Vec<IndexPacket> = sets.iter().map(|s| index(recipient, s)).collect();
            let merged = IndexPacket::merge(recipient, &packets);
            let distinct: std::collections::BTreeSet<u8> = sets.iter().flatten().copied().collect();
            prop_assert_eq!(merged.len(), distinct.len());
        }
    }

    #[test]
    fn test_put_and_remove() {
        let mut packet = IndexPacket::new(Hash256::digest(b"r"));
        packet.put(entry(1));
        packet.put(entry(1));
        packet.put(entry(2));
        assert_eq!(packet.len(), 2);
        assert!(packet.remove(&entry(1).email_packet_key).is_some());
        assert!(!packet.contains(&entry(1).email_packet_key));
        assert!(packet.remove(&entry(1).email_packet_key).is_none());
    }

    #[test]
    fn test_merge_ignores_other_recipients() {
        let r1 = Hash256::digest(b"r1");
        let r2 = Hash256::digest(b"r2");
        let merged = IndexPacket::merge(r1, [&index(r1, &[1, 2]), &index(r2, &[3])]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.recipient, r1);
    }

    #[test]
    fn test_wire_layout() {
        let packet = index(Hash256::digest(b"r"), &[1, 2, 3]);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.len(), 2 + 32 + 4 + 3 * ENTRY_LEN);
        assert_eq!(bytes[0], b'I');
        assert_eq!(&bytes[34..38], &3u32.to_be_bytes());
    }

    #[test]
    fn test_huge_count_rejected() {
        let packet = IndexPacket::new(Hash256::digest(b"r"));
        let mut bytes = packet.to_bytes().unwrap();
        bytes[34..38].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            IndexPacket::from_bytes(&bytes),
            Err(PacketError::Truncated { .. })
        ));
    }
}
