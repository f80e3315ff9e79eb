//! YARA rule engine for pattern matching.
//!
//! - `parser`: YARA source text to rules
//! - `rules`: rule, string and condition model
//! - `engine`: evaluates a compiled rule set against data

pub mod engine;
pub mod parser;
pub mod rules;

pub use engine::YaraEngine;
pub use parser::parse_rules;
pub use rules::{Condition, PatternType, RuleMatch, StringPattern, YaraRule};
