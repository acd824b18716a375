//! Recipients of a campaign
//!
//! One entry from the imported list. Immutable once enqueued; the importer
//! (out of scope here) produces these, the engine only reads them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One addressable entry from the imported list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Stable id within its session (list position at import time)
    pub id: u64,
    /// Raw phone string as imported; normalized by the compliance gate
    pub phone: String,
    pub name: Option<String>,
    pub amount: Option<String>,
    /// Free-form columns from the imported file
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl Recipient {
    pub fn new(id: u64, phone: impl Into<String>) -> Self {
        Self {
            id,
            phone: phone.into(),
            name: None,
            amount: None,
            fields: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_amount(mut self, amount: impl Into<String>) -> Self {
        self.amount = Some(amount.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up a template variable on this recipient.
    ///
    /// Well-known aliases map to top-level attributes; everything else is a
    /// case-insensitive match against the imported columns.
    pub fn field(&self, key: &str) -> Option<&str> {
        match key.to_ascii_lowercase().as_str() {
            "name" => self.name.as_deref(),
            "phone" | "phonenumber" | "mobile" => Some(self.phone.as_str()),
            "amount" => self.amount.as_deref(),
            lower => self
                .fields
                .iter()
                .find(|(k, _)| k.to_ascii_lowercase() == lower)
                .map(|(_, v)| v.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_lookup() {
        let r = Recipient::new(0, "+254700000001")
            .with_name("Wanjiku")
            .with_amount("1200");

        assert_eq!(r.field("Name"), Some("Wanjiku"));
        assert_eq!(r.field("NAME"), Some("Wanjiku"));
        assert_eq!(r.field("PhoneNumber"), Some("+254700000001"));
        assert_eq!(r.field("phone"), Some("+254700000001"));
        assert_eq!(r.field("Mobile"), Some("+254700000001"));
        assert_eq!(r.field("Amount"), Some("1200"));
    }

    #[test]
    fn custom_fields_are_case_insensitive() {
        let r = Recipient::new(0, "+254700000001").with_field("DueDate", "2024-03-01");
        assert_eq!(r.field("duedate"), Some("2024-03-01"));
        assert_eq!(r.field("DUEDATE"), Some("2024-03-01"));
        assert_eq!(r.field("missing"), None);
    }

    #[test]
    fn absent_optionals_yield_none() {
        let r = Recipient::new(0, "+254700000001");
        assert_eq!(r.field("name"), None);
        assert_eq!(r.field("amount"), None);
    }
}
