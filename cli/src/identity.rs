// Identity lookup for the CLI
//
// Commands name an identity by display name, by a prefix of its hash (hex)
// or by its full Base64 destination.

use anyhow::{bail, Context, Result};
use dmail_core::store::SledStorage;
use dmail_core::{EmailIdentity, EngineConfig, IdentityStore};
use std::sync::Arc;

/// Shortest hash prefix accepted as a selector
const MIN_PREFIX_LEN: usize = 4;

/// Open the identity tree of the configured mail storage
pub fn open_store(config: &EngineConfig) -> Result<IdentityStore> {
    let path = crate::config::storage_path(config)?;
    std::fs::create_dir_all(&path).context("Failed to create storage directory")?;
    let db = SledStorage::new(&path)
        .with_context(|| format!("Failed to open mail storage at {}", path.display()))?;
    let tree = db.open_tree("identities").context("Failed to open identity storage")?;
    Ok(IdentityStore::persistent(Arc::new(tree)))
}

fn matches(identity: &EmailIdentity, selector: &str) -> bool {
    if identity.display_name == selector || identity.destination().to_base64() == selector {
        return true;
    }
    selector.len() >= MIN_PREFIX_LEN
        && identity
            .hash()
            .to_hex()
            .starts_with(&selector.to_ascii_lowercase())
}

/// The one identity `selector` refers to
pub fn find(store: &IdentityStore, selector: &str) -> Result<EmailIdentity> {
    let mut found: Vec<EmailIdentity> = store
        .get_all()?
        .into_iter()
        .filter(|identity| matches(identity, selector))
        .collect();
    if found.len() > 1 {
        bail!(
            "'{}' matches {} identities, use a longer hash prefix",
            selector,
            found.len()
        );
    }
    found
        .pop()
        .with_context(|| format!("No identity matches '{}'", selector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmail_core::SchemeId;

    fn store_with(names: &[&str]) -> (IdentityStore, Vec<EmailIdentity>) {
        let store = IdentityStore::memory();
        let identities: Vec<EmailIdentity> = names
            .iter()
            .map(|name| EmailIdentity::generate(SchemeId::EcP256, name))
            .collect();
        for identity in &identities {
            store.add(identity.clone()).unwrap();
        }
        (store, identities)
    }

    #[test]
    fn test_find_by_name_hash_and_destination() {
        let (store, identities) = store_with(&["alice", "bob"]);
        let bob = &identities[1];

        assert_eq!(find(&store, "bob").unwrap().hash(), bob.hash());
        assert_eq!(find(&store, &bob.hash().to_hex()[..12]).unwrap().hash(), bob.hash());
        assert_eq!(
            find(&store, &bob.hash().to_hex()[..12].to_uppercase()).unwrap().hash(),
            bob.hash()
        );
        assert_eq!(
            find(&store, &bob.destination().to_base64()).unwrap().hash(),
            bob.hash()
        );
    }

    #[test]
    fn test_unknown_and_short_selectors() {
        let (store, identities) = store_with(&["alice"]);
        assert!(find(&store, "nobody").is_err());
        assert!(find(&store, &identities[0].hash().to_hex()[..2]).is_err());
    }

    #[test]
    fn test_ambiguous_name() {
        let (store, _) = store_with(&["work", "work"]);
        let err = find(&store, "work").unwrap_err();
        assert!(err.to_string().contains("matches 2 identities"));
    }
}
