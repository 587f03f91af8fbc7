//! INI-like configuration documents.
//!
//! The dialect is the one used by `blocknet.conf` and `xbridge.conf`:
//! - `key=value` lines, split on the first `=` and trimmed
//! - a bare line (optionally wrapped in `[` `]`) opens a new section
//! - keys before any header belong to the implicit `global` section
//! - `#` comment lines and blank lines are skipped
//!
//! Keys listed in [`MULTI_VALUED_KEYS`] accumulate into an ordered list
//! instead of overwriting, so repeated `addnode=` lines survive a round trip.

pub mod template;

use std::fmt;
use std::path::Path;

/// Name of the unsectioned region at the top of a document.
pub const GLOBAL: &str = "global";

/// Keys that may appear several times within one section.
pub const MULTI_VALUED_KEYS: &[&str] = &["addnode", "connect", "seednode"];

fn is_multi_valued(key: &str) -> bool {
    MULTI_VALUED_KEYS.contains(&key)
}

fn normalize(key: &str, value: ConfValue) -> Option<ConfValue> {
    match value {
        ConfValue::Single(v) if is_multi_valued(key) => Some(ConfValue::Multi(vec![v])),
        ConfValue::Multi(mut values) if !is_multi_valued(key) => {
            values.pop().map(ConfValue::Single)
        }
        ConfValue::Multi(values) if values.is_empty() => None,
        value => Some(value),
    }
}

/// A configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfValue {
    Single(String),
    Multi(Vec<String>),
}

impl ConfValue {
    /// The scalar value, or the first entry of a list.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Single(v) => Some(v.as_str()),
            Self::Multi(values) => values.first().map(String::as_str),
        }
    }

    /// All entries, a scalar being a one-element list.
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Single(v) => vec![v.as_str()],
            Self::Multi(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

/// One `[section]` of a document, keys kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    entries: Vec<(String, ConfValue)>,
}

impl Section {
    pub fn get(&self, key: &str) -> Option<&ConfValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Scalar lookup; `None` when the key is missing.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ConfValue::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set a scalar value, preserving the key's position if it already exists.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.insert(key, ConfValue::Single(value.into()));
    }

    /// Replace the whole value of a key. An empty list removes the key.
    ///
    /// The value is stored in the shape the parser would produce: a scalar
    /// for a multi-valued key becomes a one-element list, and a list for any
    /// other key keeps only its last entry.
    pub fn insert(&mut self, key: &str, value: ConfValue) {
        let Some(value) = normalize(key, value) else {
            self.remove(key);
            return;
        };
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Append to a multi-valued key unless the entry is already present.
    ///
    /// Returns `true` when the entry was added.
    pub fn push_unique(&mut self, key: &str, value: &str) -> bool {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, ConfValue::Multi(values))) => {
                if values.iter().any(|v| v == value) {
                    return false;
                }
                values.push(value.to_string());
                true
            }
            Some((_, existing @ ConfValue::Single(_))) => {
                let current = existing.as_str().unwrap_or_default().to_string();
                if current == value {
                    return false;
                }
                *existing = ConfValue::Multi(vec![current, value.to_string()]);
                true
            }
            None => {
                self.entries
                    .push((key.to_string(), ConfValue::Multi(vec![value.to_string()])));
                true
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<ConfValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn accumulate(&mut self, key: &str, value: String) {
        if is_multi_valued(key) {
            match self.entries.iter_mut().find(|(k, _)| k == key) {
                Some((_, ConfValue::Multi(values))) => values.push(value),
                Some((_, existing)) => *existing = ConfValue::Multi(vec![value]),
                None => self
                    .entries
                    .push((key.to_string(), ConfValue::Multi(vec![value]))),
            }
        } else {
            self.insert(key, ConfValue::Single(value));
        }
    }
}

/// An ordered collection of sections with a guaranteed `global` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDocument {
    sections: Vec<(String, Section)>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            sections: vec![(GLOBAL.to_string(), Section::default())],
        }
    }
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse document text. Parsing never fails; unrecognised formatting is dropped.
    pub fn parse(text: &str) -> Self {
        let mut doc = Self::default();
        let mut current = GLOBAL.to_string();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    if key.is_empty() {
                        continue;
                    }
                    doc.section_mut(&current)
                        .accumulate(key, value.trim().to_string());
                }
                None => {
                    let name = line
                        .trim_start_matches('[')
                        .trim_end_matches(']')
                        .trim();
                    if name.is_empty() {
                        continue;
                    }
                    current = name.to_string();
                    doc.section_mut(&current);
                }
            }
        }

        doc
    }

    /// Read and parse a file.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Write the serialized form, creating parent directories.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.serialize())
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let mut wrote_block = false;

        for (name, section) in self.ordered_sections() {
            if name != GLOBAL {
                if wrote_block {
                    out.push('\n');
                }
                out.push('[');
                out.push_str(name);
                out.push_str("]\n");
            }
            for (key, value) in section.iter() {
                for v in value.values() {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(v);
                    out.push('\n');
                }
            }
            wrote_block = wrote_block || name != GLOBAL || !section.is_empty();
        }

        out
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    /// Get a section, creating it empty at the end if absent.
    pub fn section_mut(&mut self, name: &str) -> &mut Section {
        let idx = match self.sections.iter().position(|(n, _)| n == name) {
            Some(idx) => idx,
            None => {
                self.sections.push((name.to_string(), Section::default()));
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx].1
    }

    pub fn global(&self) -> &Section {
        // `global` is created by every constructor and never removed.
        &self.sections[self.global_index()].1
    }

    pub fn global_mut(&mut self) -> &mut Section {
        self.section_mut(GLOBAL)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.section(name).is_some()
    }

    /// Scalar lookup across sections.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get_str(key))
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.section_mut(section).set(key, value);
    }

    /// Section names in document order, `global` included.
    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|(n, _)| n.as_str())
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.sections.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// True when no section holds any key.
    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|(_, s)| s.is_empty())
    }

    fn global_index(&self) -> usize {
        self.sections
            .iter()
            .position(|(n, _)| n == GLOBAL)
            .unwrap_or(0)
    }

    fn ordered_sections(&self) -> impl Iterator<Item = (&str, &Section)> {
        let global = self.global_index();
        std::iter::once(&self.sections[global])
            .chain(
                self.sections
                    .iter()
                    .enumerate()
                    .filter(move |(i, _)| *i != global)
                    .map(|(_, s)| s),
            )
            .map(|(n, s)| (n.as_str(), s))
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}
