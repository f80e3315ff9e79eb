//! Rule-based detection.
//!
//! - `yara`: rule language, parser and matching engine
//! - `ruleset`: compiled rule cache and hot reload of the active set

pub mod ruleset;
pub mod yara;

pub use ruleset::{Fingerprint, RuleSet, RuleStore};
pub use yara::{RuleMatch, YaraEngine, YaraRule};
