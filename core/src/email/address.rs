// Recipient addresses: "Name <base64destination>" or a bare destination

use super::{EmailError, Result};
use crate::identity::EmailDestination;
use std::collections::HashMap;

/// Looks up destinations by display name
pub trait AddressBook: Send + Sync {
    fn lookup(&self, name: &str) -> Option<EmailDestination>;
}

impl AddressBook for HashMap<String, EmailDestination> {
    fn lookup(&self, name: &str) -> Option<EmailDestination> {
        self.get(name).cloned()
    }
}

/// A parsed address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub name: Option<String>,
    pub destination: EmailDestination,
}

impl Address {
    /// "Name <b64>" when a name is known, otherwise the bare destination
    pub fn to_header_value(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.destination),
            None => self.destination.to_string(),
        }
    }
}

/// Split "Name <inner>" into its parts; bare input yields (None, input)
fn split_display_name(text: &str) -> (Option<&str>, &str) {
    let text = text.trim();
    match (text.rfind('<'), text.ends_with('>')) {
        (Some(open), true) => {
            let name = text[..open].trim().trim_matches('"').trim();
            let inner = text[open + 1..text.len() - 1].trim();
            ((!name.is_empty()).then_some(name), inner)
        }
        _ => (None, text),
    }
}

/// Parse an address that carries its destination inline
pub fn parse_address(text: &str) -> Result<Address> {
    let (name, inner) = split_display_name(text);
    let destination = EmailDestination::from_base64(inner)
        .map_err(|_| EmailError::InvalidRecipient(text.trim().to_string()))?;
    Ok(Address {
        name: name.map(str::to_string),
        destination,
    })
}

/// Parse an address, falling back to `book` for names without a destination
pub fn resolve_address(text: &str, book: Option<&dyn AddressBook>) -> Result<Address> {
    if let Ok(address) = parse_address(text) {
        return Ok(address);
    }
    let (name, inner) = split_display_name(text);
    let key = name.unwrap_or(inner);
    book.and_then(|b| b.lookup(inner).or_else(|| b.lookup(key)))
        .map(|destination| Address {
            name: Some(key.to_string()),
            destination,
        })
        .ok_or_else(|| EmailError::InvalidRecipient(text.trim().to_string()))
}
