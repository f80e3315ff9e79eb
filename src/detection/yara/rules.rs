//! YARA rule definitions.
//!
//! Compiled form of the rule language accepted by the parser. Everything in
//! here is serializable so a compiled rule set can be cached on disk; the
//! byte regexes are rebuilt with [`YaraRule::compile`] after loading.

use crate::core::types::{RuleMetadata, StringMatch};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Instant;

/// Upper bound on occurrences recorded per string (keeps `#a` bounded).
pub const MAX_MATCHES_PER_STRING: usize = 10_000;

/// Occurrences per string reported back in a match.
pub const MAX_REPORTED_PER_STRING: usize = 16;

/// Longest excerpt of matched data kept per occurrence.
pub const MAX_EXCERPT_BYTES: usize = 64;

/// Pattern type for string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// Literal text
    Text,
    /// Hex bytes pattern with wildcards, jumps and alternatives
    Hex,
    /// Regular expression
    Regex,
}

/// String modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Modifiers {
    pub nocase: bool,
    pub ascii: bool,
    pub wide: bool,
    /// `s` flag on regular expressions
    pub dotall: bool,
}

/// A string pattern in a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringPattern {
    /// Pattern identifier (e.g., "$a")
    pub id: String,
    /// Pattern type
    pub pattern_type: PatternType,
    /// Literal bytes for text, hex body for hex, expression for regex
    pub pattern: Vec<u8>,
    /// Modifiers
    pub modifiers: Modifiers,
    /// Compiled byte regex
    #[serde(skip)]
    pub compiled: Option<Regex>,
}

impl StringPattern {
    /// Create a new text pattern.
    pub fn text(id: &str, pattern: &[u8]) -> Self {
        Self::new(id, PatternType::Text, pattern.to_vec())
    }

    /// Create a case-insensitive text pattern.
    pub fn text_nocase(id: &str, pattern: &[u8]) -> Self {
        let mut p = Self::text(id, pattern);
        p.modifiers.nocase = true;
        p
    }

    /// Create a hex pattern.
    pub fn hex(id: &str, hex: &str) -> Self {
        Self::new(id, PatternType::Hex, hex.as_bytes().to_vec())
    }

    /// Create a regex pattern.
    pub fn regex(id: &str, pattern: &str) -> Self {
        Self::new(id, PatternType::Regex, pattern.as_bytes().to_vec())
    }

    fn new(id: &str, pattern_type: PatternType, pattern: Vec<u8>) -> Self {
        Self {
            id: id.to_string(),
            pattern_type,
            pattern,
            modifiers: Modifiers::default(),
            compiled: None,
        }
    }

    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Compile the pattern for matching.
    pub fn compile(&mut self) -> Result<(), String> {
        let source = self.regex_source()?;
        self.compiled = Some(
            Regex::new(&source)
                .map_err(|e| format!("Failed to compile pattern {}: {}", self.id, e))?,
        );
        Ok(())
    }

    /// Translate the pattern into byte-regex syntax.
    fn regex_source(&self) -> Result<String, String> {
        match self.pattern_type {
            PatternType::Text => {
                let mut alternatives = Vec::new();
                // ascii is implied unless only wide was asked for
                if self.modifiers.ascii || !self.modifiers.wide {
                    alternatives.push(escape_bytes(&self.pattern));
                }
                if self.modifiers.wide {
                    let wide: Vec<u8> = self.pattern.iter().flat_map(|&b| [b, 0u8]).collect();
                    alternatives.push(escape_bytes(&wide));
                }
                let flags = if self.modifiers.nocase { "(?i-u)" } else { "(?-u)" };
                Ok(format!("{}(?:{})", flags, alternatives.join("|")))
            }
            PatternType::Hex => {
                let body = std::str::from_utf8(&self.pattern)
                    .map_err(|_| format!("Hex string {} is not ASCII", self.id))?;
                Ok(format!("(?s-u){}", hex_to_regex(body)?))
            }
            PatternType::Regex => {
                let body = std::str::from_utf8(&self.pattern)
                    .map_err(|_| format!("Regular expression {} is not UTF-8", self.id))?;
                let mut flags = String::new();
                if self.modifiers.nocase {
                    flags.push('i');
                }
                if self.modifiers.dotall {
                    flags.push('s');
                }
                // byte semantics: `.` and classes match single bytes
                Ok(format!("(?{}-u){}", flags, body))
            }
        }
    }

    /// Find occurrences as `(start, end)` byte ranges.
    pub fn matches(&self, data: &[u8]) -> Vec<(usize, usize)> {
        match self.compiled {
            Some(ref regex) => regex
                .find_iter(data)
                .take(MAX_MATCHES_PER_STRING)
                .map(|m| (m.start(), m.end()))
                .collect(),
            None => Vec::new(),
        }
    }
}

fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for &b in bytes {
        if b.is_ascii_alphanumeric() {
            out.push(b as char);
        } else {
            let _ = write!(out, "\\x{:02X}", b);
        }
    }
    out
}

/// Translate a hex string body (`4D 5A ?? [2-4] ( 90 | CC )`) into regex syntax.
pub fn hex_to_regex(body: &str) -> Result<String, String> {
    let chars: Vec<char> = body.chars().filter(|c| !c.is_whitespace()).collect();
    let mut out = String::new();
    let mut depth = 0usize;
    let mut tokens = 0usize;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '(' => {
                depth += 1;
                out.push_str("(?:");
                i += 1;
            }
            ')' => {
                if depth == 0 {
                    return Err("unbalanced ')' in hex string".to_string());
                }
                depth -= 1;
                out.push(')');
                i += 1;
            }
            '|' => {
                if depth == 0 {
                    return Err("alternative outside of parentheses in hex string".to_string());
                }
                out.push('|');
                i += 1;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|&c| c == ']')
                    .ok_or_else(|| "unterminated jump in hex string".to_string())?;
                let jump: String = chars[i + 1..i + close].iter().collect();
                out.push_str(&jump_to_regex(&jump)?);
                i += close + 1;
            }
            hi => {
                let lo = *chars
                    .get(i + 1)
                    .ok_or_else(|| "odd number of hex digits".to_string())?;
                out.push_str(&hex_byte_to_regex(hi, lo)?);
                tokens += 1;
                i += 2;
            }
        }
    }

    if depth != 0 {
        return Err("unbalanced '(' in hex string".to_string());
    }
    if tokens == 0 {
        return Err("empty hex string".to_string());
    }
    Ok(out)
}

fn jump_to_regex(jump: &str) -> Result<String, String> {
    let parse = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid jump '[{}]'", jump))
    };

    match jump.split_once('-') {
        None => Ok(format!(".{{{}}}", parse(jump)?)),
        Some((lo, hi)) => {
            let lo = if lo.trim().is_empty() { 0 } else { parse(lo)? };
            if hi.trim().is_empty() {
                Ok(format!(".{{{},}}", lo))
            } else {
                let hi = parse(hi)?;
                if hi < lo {
                    return Err(format!("invalid jump range '[{}]'", jump));
                }
                Ok(format!(".{{{},{}}}", lo, hi))
            }
        }
    }
}

fn hex_byte_to_regex(hi: char, lo: char) -> Result<String, String> {
    match (hi.to_digit(16), lo.to_digit(16), hi == '?', lo == '?') {
        (Some(h), Some(l), _, _) => Ok(format!("\\x{:02X}", h * 16 + l)),
        (_, _, true, true) => Ok(".".to_string()),
        (Some(h), None, _, true) => Ok(format!("[\\x{:X}0-\\x{:X}F]", h, h)),
        (None, Some(l), true, _) => {
            let mut class = String::from("[");
            for h in 0..16 {
                let _ = write!(class, "\\x{:X}{:X}", h, l);
            }
            class.push(']');
            Ok(class)
        }
        _ => Err(format!("invalid hex token '{}{}'", hi, lo)),
    }
}

/// Quantifier of an `of` expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantifier {
    All,
    Any,
    None,
    AtLeast(usize),
}

/// String set of an `of` expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringSet {
    /// Every string in the rule
    Them,
    /// Explicit identifiers; a trailing `*` matches by prefix
    Ids(Vec<String>),
}

impl StringSet {
    /// Resolve to the concrete identifiers of a rule.
    pub fn resolve<'a>(&self, ids: &'a [String]) -> Vec<&'a str> {
        match self {
            StringSet::Them => ids.iter().map(String::as_str).collect(),
            StringSet::Ids(wanted) => ids
                .iter()
                .filter(|id| wanted.iter().any(|w| id_matches(w, id)))
                .map(String::as_str)
                .collect(),
        }
    }
}

/// Whether a set entry (`$a` or `$a*`) selects an identifier.
pub fn id_matches(entry: &str, id: &str) -> bool {
    match entry.strip_suffix('*') {
        Some(prefix) => id.starts_with(prefix),
        None => entry == id,
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn apply(self, left: i64, right: i64) -> bool {
        match self {
            CmpOp::Eq => left == right,
            CmpOp::Ne => left != right,
            CmpOp::Lt => left < right,
            CmpOp::Le => left <= right,
            CmpOp::Gt => left > right,
            CmpOp::Ge => left >= right,
        }
    }
}

/// Integer-valued operand of a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Integer(i64),
    FileSize,
    /// `#id`: number of occurrences
    Count(String),
    /// `uintN(offset)`, little endian
    Uint { bits: u8, offset: i64 },
}

impl Operand {
    /// Evaluate; `None` means undefined (out-of-range read).
    fn value(&self, ctx: &EvalContext<'_>) -> Option<i64> {
        match self {
            Operand::Integer(v) => Some(*v),
            Operand::FileSize => Some(ctx.data.len() as i64),
            Operand::Count(id) => Some(ctx.hits.get(id).map_or(0, Vec::len) as i64),
            Operand::Uint { bits, offset } => {
                let width = (*bits / 8) as usize;
                let start = usize::try_from(*offset).ok()?;
                let bytes = ctx.data.get(start..start.checked_add(width)?)?;
                let mut value = 0u64;
                for (i, b) in bytes.iter().enumerate() {
                    value |= (*b as u64) << (8 * i);
                }
                Some(value as i64)
            }
        }
    }
}

/// Condition expression for rule matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// `true` / `false`
    Bool(bool),
    /// Specific pattern must match
    Pattern(String),
    /// `any of them`, `2 of ($a*)`
    Of { quantifier: Quantifier, set: StringSet },
    /// Integer comparison
    Compare {
        left: Operand,
        op: CmpOp,
        right: Operand,
    },
    /// Logical AND
    And(Box<Condition>, Box<Condition>),
    /// Logical OR
    Or(Box<Condition>, Box<Condition>),
    /// Logical NOT
    Not(Box<Condition>),
}

/// Inputs for evaluating a condition.
pub struct EvalContext<'a> {
    pub hits: &'a HashMap<String, Vec<(usize, usize)>>,
    pub ids: &'a [String],
    pub data: &'a [u8],
}

impl EvalContext<'_> {
    fn matched(&self, id: &str) -> bool {
        self.hits.get(id).is_some_and(|h| !h.is_empty())
    }
}

impl Condition {
    /// Evaluate the condition against match results.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Condition::Bool(b) => *b,
            Condition::Pattern(id) => ctx.matched(id),
            Condition::Of { quantifier, set } => {
                let members = set.resolve(ctx.ids);
                let hit = members.iter().filter(|id| ctx.matched(id)).count();
                match quantifier {
                    Quantifier::All => hit == members.len(),
                    Quantifier::Any => hit > 0,
                    Quantifier::None => hit == 0,
                    Quantifier::AtLeast(n) => hit >= *n,
                }
            }
            Condition::Compare { left, op, right } => {
                match (left.value(ctx), right.value(ctx)) {
                    (Some(l), Some(r)) => op.apply(l, r),
                    _ => false,
                }
            }
            Condition::And(a, b) => a.evaluate(ctx) && b.evaluate(ctx),
            Condition::Or(a, b) => a.evaluate(ctx) || b.evaluate(ctx),
            Condition::Not(c) => !c.evaluate(ctx),
        }
    }

    /// Visit every string identifier referenced, including set entries.
    pub fn for_each_reference<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Condition::Pattern(id) => f(id.as_str()),
            Condition::Of {
                set: StringSet::Ids(ids),
                ..
            } => ids.iter().for_each(|id| f(id.as_str())),
            Condition::Compare { left, right, .. } => {
                for op in [left, right] {
                    if let Operand::Count(id) = op {
                        f(id.as_str());
                    }
                }
            }
            Condition::And(a, b) | Condition::Or(a, b) => {
                a.for_each_reference(f);
                b.for_each_reference(f);
            }
            Condition::Not(c) => c.for_each_reference(f),
            Condition::Bool(_) | Condition::Of { .. } => {}
        }
    }
}

/// Marker returned when the matching deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExceeded;

/// A YARA-like detection rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YaraRule {
    /// Rule name
    pub name: String,
    /// Source key the rule was compiled from
    pub namespace: String,
    /// Rule tags
    pub tags: Vec<String>,
    /// Rule metadata
    pub meta: RuleMetadata,
    /// String patterns
    pub strings: Vec<StringPattern>,
    /// Condition for matching
    pub condition: Condition,
    /// Evaluated but never reported
    pub is_private: bool,
    /// Must hold for any other rule in the namespace to match
    pub is_global: bool,
}

impl YaraRule {
    /// Create a new rule.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: "default".to_string(),
            tags: Vec::new(),
            meta: RuleMetadata::new(),
            strings: Vec::new(),
            condition: Condition::Of {
                quantifier: Quantifier::Any,
                set: StringSet::Them,
            },
            is_private: false,
            is_global: false,
        }
    }

    /// Add a string pattern.
    pub fn with_string(mut self, pattern: StringPattern) -> Self {
        self.strings.push(pattern);
        self
    }

    /// Set the condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    /// Compile all patterns.
    pub fn compile(&mut self) -> Result<(), String> {
        for pattern in &mut self.strings {
            pattern.compile()?;
        }
        Ok(())
    }

    pub fn string_ids(&self) -> Vec<String> {
        self.strings.iter().map(|s| s.id.clone()).collect()
    }

    /// Match the rule against data, checking the deadline between strings.
    pub fn scan(
        &self,
        data: &[u8],
        deadline: Option<Instant>,
    ) -> Result<Option<RuleMatch>, DeadlineExceeded> {
        let mut hits: HashMap<String, Vec<(usize, usize)>> = HashMap::new();

        for pattern in &self.strings {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(DeadlineExceeded);
            }
            hits.insert(pattern.id.clone(), pattern.matches(data));
        }

        let ids = self.string_ids();
        let ctx = EvalContext {
            hits: &hits,
            ids: &ids,
            data,
        };
        if !self.condition.evaluate(&ctx) {
            return Ok(None);
        }

        let mut strings = Vec::new();
        for pattern in &self.strings {
            for &(start, end) in hits[&pattern.id].iter().take(MAX_REPORTED_PER_STRING) {
                let excerpt = &data[start..end.min(start + MAX_EXCERPT_BYTES)];
                strings.push(StringMatch {
                    identifier: pattern.id.clone(),
                    offset: start as u64,
                    data: String::from_utf8_lossy(excerpt).into_owned(),
                });
            }
        }

        Ok(Some(RuleMatch {
            rule_name: self.name.clone(),
            namespace: self.namespace.clone(),
            tags: self.tags.clone(),
            meta: self.meta.clone(),
            strings,
        }))
    }

    /// Match the rule against data without a deadline.
    pub fn matches(&self, data: &[u8]) -> Option<RuleMatch> {
        self.scan(data, None).ok().flatten()
    }
}

/// Result of a rule match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Name of the matched rule
    pub rule_name: String,
    /// Namespace of the matched rule
    pub namespace: String,
    /// Rule tags
    pub tags: Vec<String>,
    /// Rule metadata
    pub meta: RuleMetadata,
    /// Matched string excerpts
    pub strings: Vec<StringMatch>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(entries: &[(&str, usize)]) -> HashMap<String, Vec<(usize, usize)>> {
        entries
            .iter()
            .map(|(id, n)| (id.to_string(), (0..*n).map(|i| (i, i + 1)).collect()))
            .collect()
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_text_pattern() {
        let mut pattern = StringPattern::text("$a", b"malware");
        pattern.compile().unwrap();

        let data = b"This is malware detected";
        let matches = pattern.matches(data);
        assert_eq!(matches, vec![(8, 15)]);
    }

    #[test]
    fn test_text_nocase_pattern() {
        let mut pattern = StringPattern::text_nocase("$a", b"MALWARE");
        pattern.compile().unwrap();

        let data = b"This is Malware detected";
        assert_eq!(pattern.matches(data).len(), 1);
    }

    #[test]
    fn test_text_pattern_on_binary_offsets() {
        let mut pattern = StringPattern::text("$a", b"abc");
        pattern.compile().unwrap();

        // invalid UTF-8 before the needle must not shift the offset
        let data = [0xFF, 0xFE, b'a', b'b', b'c'];
        assert_eq!(pattern.matches(&data), vec![(2, 5)]);
    }

    #[test]
    fn test_wide_pattern() {
        let mut pattern = StringPattern::text("$w", b"evil").with_modifiers(Modifiers {
            wide: true,
            ..Modifiers::default()
        });
        pattern.compile().unwrap();

        assert_eq!(pattern.matches(b"e\0v\0i\0l\0").len(), 1);
        assert!(pattern.matches(b"evil").is_empty());

        let mut both = StringPattern::text("$w", b"evil").with_modifiers(Modifiers {
            wide: true,
            ascii: true,
            ..Modifiers::default()
        });
        both.compile().unwrap();
        assert_eq!(both.matches(b"evil e\0v\0i\0l\0").len(), 2);
    }

    #[test]
    fn test_hex_pattern() {
        let mut pattern = StringPattern::hex("$mz", "4D 5A");
        pattern.compile().unwrap();

        let data = &[0x4D, 0x5A, 0x90, 0x00];
        assert_eq!(pattern.matches(data), vec![(0, 2)]);
    }

    #[test]
    fn test_hex_wildcards_jumps_alternatives() {
        let mut pattern = StringPattern::hex("$h", "4D ?? [1-2] ( 90 | CC ) F?");
        pattern.compile().unwrap();

        assert_eq!(pattern.matches(&[0x4D, 0x00, 0x01, 0x90, 0xF3]).len(), 1);
        assert_eq!(pattern.matches(&[0x4D, 0x00, 0x01, 0x02, 0xCC, 0xFF]).len(), 1);
        assert!(pattern.matches(&[0x4D, 0x00, 0x01, 0x91, 0xF3]).is_empty());
    }

    #[test]
    fn test_invalid_hex() {
        assert!(hex_to_regex("4D 5").is_err());
        assert!(hex_to_regex("4D ZZ").is_err());
        assert!(hex_to_regex("( 4D").is_err());
        assert!(hex_to_regex("4D [x]").is_err());
        assert!(hex_to_regex("").is_err());
    }

    #[test]
    fn test_regex_pattern() {
        let mut pattern = StringPattern::regex("$ip", r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}");
        pattern.compile().unwrap();

        let data = b"Connect to 192.168.1.1 for C2";
        assert_eq!(pattern.matches(data).len(), 1);
    }

    #[test]
    fn test_regex_matches_non_utf8_bytes() {
        let mut pattern = StringPattern::regex("$pe", "MZ.{2}PE");
        pattern.compile().unwrap();
        assert_eq!(pattern.matches(b"xxMZ\x90\xffPExx"), vec![(2, 8)]);

        let mut class = StringPattern::regex("$hi", r"[\x80-\xff]{3}");
        class.compile().unwrap();
        assert_eq!(class.matches(&[0x41, 0x90, 0xfe, 0xff, 0x41]), vec![(1, 4)]);

        let mut nocase = StringPattern::regex("$pe", "mz.{2}pe").with_modifiers(Modifiers {
            nocase: true,
            ..Modifiers::default()
        });
        nocase.compile().unwrap();
        assert_eq!(nocase.matches(b"MZ\xc3\xffPE").len(), 1);
    }

    #[test]
    fn test_rule_matching() {
        let mut rule = YaraRule::new("TestMalware")
            .with_string(StringPattern::text_nocase(
                "$ransom",
                b"your files have been encrypted",
            ))
            .with_condition(Condition::And(
                Box::new(Condition::Compare {
                    left: Operand::Uint {
                        bits: 16,
                        offset: 0,
                    },
                    op: CmpOp::Eq,
                    right: Operand::Integer(0x5A4D),
                }),
                Box::new(Condition::Pattern("$ransom".to_string())),
            ));

        rule.compile().unwrap();

        let mut data = vec![0x4D, 0x5A, 0x90, 0x00];
        data.extend(b"Warning: YOUR FILES HAVE BEEN ENCRYPTED!");

        let result = rule.matches(&data).unwrap();
        assert_eq!(result.rule_name, "TestMalware");
        assert_eq!(result.strings.len(), 1);
        assert_eq!(result.strings[0].offset, 13);

        assert!(rule.matches(b"your files have been encrypted").is_none());
    }

    #[test]
    fn test_condition_of() {
        let names = ids(&["$a", "$b", "$c"]);
        let h = hits(&[("$a", 1), ("$b", 1), ("$c", 0)]);
        let ctx = EvalContext {
            hits: &h,
            ids: &names,
            data: &[],
        };

        let of = |quantifier, set| Condition::Of { quantifier, set };
        assert!(!of(Quantifier::All, StringSet::Them).evaluate(&ctx));
        assert!(of(Quantifier::Any, StringSet::Them).evaluate(&ctx));
        assert!(of(Quantifier::AtLeast(2), StringSet::Them).evaluate(&ctx));
        assert!(!of(Quantifier::AtLeast(3), StringSet::Them).evaluate(&ctx));
        assert!(of(Quantifier::None, StringSet::Ids(ids(&["$c"]))).evaluate(&ctx));
        assert!(of(Quantifier::All, StringSet::Ids(ids(&["$a", "$b"]))).evaluate(&ctx));
    }

    #[test]
    fn test_condition_counts_and_filesize() {
        let names = ids(&["$a"]);
        let h = hits(&[("$a", 3)]);
        let ctx = EvalContext {
            hits: &h,
            ids: &names,
            data: &[0u8; 10],
        };

        let cmp = |left, op, right| Condition::Compare { left, op, right };
        assert!(cmp(Operand::Count("$a".into()), CmpOp::Ge, Operand::Integer(3)).evaluate(&ctx));
        assert!(cmp(Operand::FileSize, CmpOp::Lt, Operand::Integer(11)).evaluate(&ctx));
        assert!(!cmp(Operand::FileSize, CmpOp::Ne, Operand::Integer(10)).evaluate(&ctx));
        // out-of-range reads are undefined, so every comparison is false
        let oob = Operand::Uint {
            bits: 32,
            offset: 8,
        };
        assert!(!cmp(oob.clone(), CmpOp::Eq, Operand::Integer(0)).evaluate(&ctx));
        assert!(!cmp(oob, CmpOp::Ne, Operand::Integer(0)).evaluate(&ctx));
    }

    #[test]
    fn test_set_prefix_resolution() {
        let names = ids(&["$str1", "$str2", "$other"]);
        let set = StringSet::Ids(ids(&["$str*"]));
        assert_eq!(set.resolve(&names), vec!["$str1", "$str2"]);
        assert!(id_matches("$a", "$a"));
        assert!(!id_matches("$a", "$ab"));
    }

    #[test]
    fn test_deadline_exceeded() {
        let mut rule = YaraRule::new("Slow").with_string(StringPattern::text("$a", b"x"));
        rule.compile().unwrap();
        let past = Instant::now() - std::time::Duration::from_millis(1);
        assert_eq!(rule.scan(b"x", Some(past)), Err(DeadlineExceeded));
    }

    #[test]
    fn test_rule_survives_serde_after_recompile() {
        let mut rule = YaraRule::new("Serde").with_string(StringPattern::hex("$h", "CA FE"));
        rule.compile().unwrap();

        let json = serde_json::to_string(&rule).unwrap();
        let mut loaded: YaraRule = serde_json::from_str(&json).unwrap();
        assert!(loaded.strings[0].compiled.is_none());
        loaded.compile().unwrap();
        assert!(loaded.matches(&[0x00, 0xCA, 0xFE]).is_some());
    }
}
