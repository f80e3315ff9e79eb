//! Core type definitions used throughout Falcon Defender.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;

/// Severity level of a detected threat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Low risk - potentially unwanted but not necessarily malicious
    Low,
    /// Medium risk - suspicious content detected
    Medium,
    /// High risk - likely malicious
    High,
    /// Critical risk - confirmed malware
    Critical,
}

impl Severity {
    /// Get string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Parse from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Derive a severity from rule metadata.
    ///
    /// An explicit `severity` entry naming a level wins. Otherwise the
    /// `confidence` entry is mapped: anything mentioning "high" or "critical"
    /// is high, anything mentioning "low" is low, everything else is medium.
    pub fn from_rule_meta(meta: &RuleMetadata) -> Self {
        if let Some(severity) = meta.get_str("severity").and_then(Severity::from_str) {
            return severity;
        }

        let confidence = meta
            .get_str("confidence")
            .map(str::to_lowercase)
            .unwrap_or_default();
        if confidence.contains("high") || confidence.contains("critical") {
            Severity::High
        } else if confidence.contains("low") {
            Severity::Low
        } else {
            Severity::Medium
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A scalar rule metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Boolean(bool),
    Integer(i64),
    String(String),
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Boolean(b) => write!(f, "{}", b),
            MetaValue::Integer(i) => write!(f, "{}", i),
            MetaValue::String(s) => write!(f, "{}", s),
        }
    }
}

/// Rule metadata in declaration order.
///
/// Serialized as a JSON object whose keys keep the order they were declared in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleMetadata(Vec<(String, MetaValue)>);

impl RuleMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. A repeated key keeps both entries; lookups return the first.
    pub fn push(&mut self, key: impl Into<String>, value: MetaValue) {
        self.0.push((key.into(), value));
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Get a string entry.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(MetaValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for RuleMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RuleMetadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct MetadataVisitor;

        impl<'de> Visitor<'de> for MetadataVisitor {
            type Value = RuleMetadata;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of rule metadata")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut meta = RuleMetadata::new();
                while let Some((key, value)) = access.next_entry::<String, MetaValue>()? {
                    meta.push(key, value);
                }
                Ok(meta)
            }
        }

        deserializer.deserialize_map(MetadataVisitor)
    }
}

/// One occurrence of a rule string inside a scanned file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringMatch {
    /// String identifier including the `$`
    pub identifier: String,
    /// Byte offset of the occurrence
    pub offset: u64,
    /// Matched bytes (lossy UTF-8, truncated)
    pub data: String,
}

impl fmt::Display for StringMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}:{}: {}", self.offset, self.identifier, self.data)
    }
}

/// What happened to a file after a rule matched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum MatchAction {
    /// Reported only
    Detected,
    /// Moved into the containment store
    Quarantined { record_id: i64, storage_path: PathBuf },
    /// Containment was requested but failed
    QuarantineFailed { reason: String },
}

impl MatchAction {
    pub fn is_quarantined(&self) -> bool {
        matches!(self, MatchAction::Quarantined { .. })
    }
}

impl fmt::Display for MatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchAction::Detected => write!(f, "detected"),
            MatchAction::Quarantined { .. } => write!(f, "quarantined"),
            MatchAction::QuarantineFailed { reason } => write!(f, "quarantine-failed:{}", reason),
        }
    }
}

/// A single rule hit on a single file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Path of the matched file
    pub file_path: PathBuf,
    /// Matching rule identifier
    pub rule_name: String,
    /// Rule namespace (source key the rule was compiled from)
    pub namespace: String,
    /// Rule tags
    pub tags: Vec<String>,
    /// Rule metadata, verbatim
    pub meta: RuleMetadata,
    /// Matched string excerpts
    pub strings: Vec<StringMatch>,
    /// `description` meta or "N/A"
    pub description: String,
    /// `confidence` meta or "N/A"
    pub confidence: String,
    /// Derived severity
    pub severity: Severity,
    /// Action taken on the file
    pub action: MatchAction,
}

impl MatchRecord {
    /// Build a record with derived description, confidence and severity.
    pub fn new(
        file_path: PathBuf,
        rule_name: impl Into<String>,
        namespace: impl Into<String>,
        tags: Vec<String>,
        meta: RuleMetadata,
        strings: Vec<StringMatch>,
    ) -> Self {
        let description = meta.get_str("description").unwrap_or("N/A").to_string();
        let confidence = meta.get_str("confidence").unwrap_or("N/A").to_string();
        let severity = Severity::from_rule_meta(&meta);
        Self {
            file_path,
            rule_name: rule_name.into(),
            namespace: namespace.into(),
            tags,
            meta,
            strings,
            description,
            confidence,
            severity,
            action: MatchAction::Detected,
        }
    }
}
