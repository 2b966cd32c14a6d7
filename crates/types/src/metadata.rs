//! Call metadata: an ordered multimap of lower-case keys to values.
//!
//! Keys ending in `-bin` carry binary values; every other key carries
//! printable ASCII.

use std::collections::BTreeMap;

use snafu::ensure;

use crate::error::{InvalidKeySnafu, InvalidValueSnafu, KindMismatchSnafu, MetadataError};

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    /// Printable ASCII value.
    Ascii(String),
    /// Binary value, only valid under `-bin` keys.
    Binary(Vec<u8>),
}

/// Ordered multimap of metadata entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, Vec<MetadataValue>>,
}

impl Metadata {
    /// Creates empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all values under `key` with one ASCII value.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when the key is illegal, names a binary
    /// entry, or the value is not printable ASCII.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) -> Result<(), MetadataError> {
        let (key, value) = validate_ascii(key, value.into())?;
        self.entries.insert(key, vec![value]);
        Ok(())
    }

    /// Appends an ASCII value under `key`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Metadata::insert`].
    pub fn append(&mut self, key: &str, value: impl Into<String>) -> Result<(), MetadataError> {
        let (key, value) = validate_ascii(key, value.into())?;
        self.entries.entry(key).or_default().push(value);
        Ok(())
    }

    /// Appends a binary value under a `-bin` key.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when the key is illegal or lacks the `-bin`
    /// suffix.
    pub fn append_binary(&mut self, key: &str, value: Vec<u8>) -> Result<(), MetadataError> {
        let key = normalize_key(key)?;
        ensure!(key.ends_with("-bin"), KindMismatchSnafu { key });
        self.entries.entry(key).or_default().push(MetadataValue::Binary(value));
        Ok(())
    }

    /// Returns the first value under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries.get(&key.to_ascii_lowercase()).and_then(|values| values.first())
    }

    /// Returns every value under `key`.
    #[must_use]
    pub fn get_all(&self, key: &str) -> &[MetadataValue] {
        self.entries.get(&key.to_ascii_lowercase()).map(Vec::as_slice).unwrap_or_default()
    }

    /// Removes every value under `key`.
    pub fn remove(&mut self, key: &str) -> Vec<MetadataValue> {
        self.entries.remove(&key.to_ascii_lowercase()).unwrap_or_default()
    }

    /// Appends every entry of `other`.
    pub fn merge(&mut self, other: &Metadata) {
        for (key, values) in &other.entries {
            self.entries.entry(key.clone()).or_default().extend(values.iter().cloned());
        }
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no keys are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |value| (key.as_str(), value)))
    }
}

fn normalize_key(key: &str) -> Result<String, MetadataError> {
    let key = key.to_ascii_lowercase();
    ensure!(
        !key.is_empty()
            && key.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase() || b"_.-".contains(&b)),
        InvalidKeySnafu { key }
    );
    Ok(key)
}

fn validate_ascii(key: &str, value: String) -> Result<(String, MetadataValue), MetadataError> {
    let key = normalize_key(key)?;
    ensure!(!key.ends_with("-bin"), KindMismatchSnafu { key });
    ensure!(value.bytes().all(|b| (0x20..=0x7e).contains(&b)), InvalidValueSnafu { key });
    Ok((key, MetadataValue::Ascii(value)))
}
