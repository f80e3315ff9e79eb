//! YARA rule engine for scanning files.
//!
//! Holds a compiled rule set and evaluates it against file contents.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use super::parser::parse_rules;
use super::rules::{DeadlineExceeded, RuleMatch, YaraRule};
use crate::core::error::{Error, Result};

/// YARA-like scanning engine.
#[derive(Debug, Default)]
pub struct YaraEngine {
    /// Loaded rules
    rules: Vec<YaraRule>,
    /// Rules indexed by `namespace:name`
    rules_by_name: HashMap<String, usize>,
}

impl YaraEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and add every rule of one source, tagged with `namespace`.
    pub fn add_source(&mut self, namespace: &str, source: &str) -> Result<usize> {
        let rules = parse_rules(namespace, source)?;
        let count = rules.len();
        for rule in rules {
            self.insert(rule)?;
        }
        Ok(count)
    }

    /// Add an already-built rule, compiling its patterns.
    pub fn add_rule(&mut self, mut rule: YaraRule) -> Result<()> {
        rule.compile()
            .map_err(|e| Error::rule_compile(rule.namespace.clone(), 0, e))?;
        self.insert(rule)
    }

    fn insert(&mut self, rule: YaraRule) -> Result<()> {
        let key = format!("{}:{}", rule.namespace, rule.name);
        if self.rules_by_name.contains_key(&key) {
            return Err(Error::rule_compile(
                rule.namespace.clone(),
                0,
                format!("duplicate rule identifier '{}'", rule.name),
            ));
        }
        self.rules_by_name.insert(key, self.rules.len());
        self.rules.push(rule);
        Ok(())
    }

    /// Rebuild an engine from deserialized rules (patterns are recompiled).
    pub fn from_compiled(rules: Vec<YaraRule>) -> Result<Self> {
        let mut engine = Self::new();
        for rule in rules {
            engine.add_rule(rule)?;
        }
        Ok(engine)
    }

    /// Get the number of loaded rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// All loaded rules in load order.
    pub fn rules(&self) -> &[YaraRule] {
        &self.rules
    }

    /// Get a rule by namespace and name.
    pub fn get_rule(&self, namespace: &str, name: &str) -> Option<&YaraRule> {
        self.rules_by_name
            .get(&format!("{}:{}", namespace, name))
            .and_then(|&idx| self.rules.get(idx))
    }

    /// List all rule names.
    pub fn list_rules(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Scan data against all rules.
    ///
    /// A failing global rule suppresses every rule of its own namespace;
    /// other namespaces are unaffected. Private rules are evaluated but not
    /// reported.
    pub fn scan_bytes(
        &self,
        data: &[u8],
        deadline: Option<Instant>,
    ) -> std::result::Result<Vec<RuleMatch>, DeadlineExceeded> {
        let mut failed_namespaces: Vec<&str> = Vec::new();
        for rule in self.rules.iter().filter(|r| r.is_global) {
            if rule.scan(data, deadline)?.is_none() {
                failed_namespaces.push(rule.namespace.as_str());
            }
        }

        let mut matches = Vec::new();
        for rule in &self.rules {
            if failed_namespaces.contains(&rule.namespace.as_str()) {
                continue;
            }
            if let Some(m) = rule.scan(data, deadline)? {
                if !rule.is_private {
                    matches.push(m);
                }
            }
        }

        Ok(matches)
    }

    /// Scan a file against all rules within `timeout`.
    pub fn scan_file(&self, path: &Path, timeout: Option<Duration>) -> Result<Vec<RuleMatch>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let data = fs::read(path).map_err(|e| Error::file_read(path, e))?;

        self.scan_bytes(&data, deadline)
            .map_err(|DeadlineExceeded| Error::MatchTimeout {
                path: path.to_path_buf(),
                timeout_secs: timeout.map_or(0, |t| t.as_secs()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::yara::rules::StringPattern;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const EICAR: &[u8] = b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

    const EICAR_RULE: &str = r#"
        rule EICAR_TestFile {
            meta:
                description = "EICAR test file"
            strings:
                $eicar = "X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"
            condition:
                $eicar
        }
    "#;

    #[test]
    fn test_engine_creation() {
        let engine = YaraEngine::new();
        assert_eq!(engine.rule_count(), 0);
    }

    #[test]
    fn test_add_rule() {
        let mut engine = YaraEngine::new();

        engine
            .add_rule(YaraRule::new("TestRule").with_string(StringPattern::text("$test", b"hello")))
            .unwrap();

        assert_eq!(engine.rule_count(), 1);
        assert!(engine.get_rule("default", "TestRule").is_some());
        assert!(engine
            .add_rule(YaraRule::new("TestRule").with_string(StringPattern::text("$t", b"x")))
            .is_err());
    }

    #[test]
    fn test_scan_bytes() {
        let mut engine = YaraEngine::new();
        engine
            .add_source(
                "hello.yar",
                r#"rule HelloWorld { strings: $hello = "hello world" nocase condition: $hello }"#,
            )
            .unwrap();

        let data = b"This contains Hello World text";
        let matches = engine.scan_bytes(data, None).unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule_name, "HelloWorld");
        assert_eq!(matches[0].namespace, "hello.yar");
    }

    #[test]
    fn test_eicar_detection() {
        let mut engine = YaraEngine::new();
        engine.add_source("eicar.yar", EICAR_RULE).unwrap();

        let matches = engine.scan_bytes(EICAR, None).unwrap();
        assert!(matches.iter().any(|m| m.rule_name == "EICAR_TestFile"));
        assert_eq!(engine.list_rules(), vec!["EICAR_TestFile"]);
    }

    #[test]
    fn test_same_rule_name_in_two_namespaces() {
        let mut engine = YaraEngine::new();
        engine.add_source("a.yar", EICAR_RULE).unwrap();
        engine.add_source("b.yar", EICAR_RULE).unwrap();

        let matches = engine.scan_bytes(EICAR, None).unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn test_private_and_global_rules() {
        let mut engine = YaraEngine::new();
        engine
            .add_source(
                "gated.yar",
                r#"
                global rule OnlySmall { condition: filesize < 16 }
                private rule Helper { strings: $a = "abc" condition: $a }
                rule Visible { strings: $a = "abc" condition: $a }
                "#,
            )
            .unwrap();

        let matches = engine.scan_bytes(b"abc", None).unwrap();
        let names: Vec<_> = matches.iter().map(|m| m.rule_name.as_str()).collect();
        assert_eq!(names, vec!["OnlySmall", "Visible"]);

        let big = [b"abc".as_slice(), &[0u8; 32]].concat();
        assert!(engine.scan_bytes(&big, None).unwrap().is_empty());
    }

    #[test]
    fn test_global_rule_gates_only_its_namespace() {
        let mut engine = YaraEngine::new();
        engine
            .add_source(
                "a.yar",
                r#"
                global rule OnlySmall { condition: filesize < 16 }
                rule InA { strings: $a = "abc" condition: $a }
                "#,
            )
            .unwrap();
        engine
            .add_source("b.yar", r#"rule InB { strings: $a = "abc" condition: $a }"#)
            .unwrap();

        let big = [b"abc".as_slice(), &[0u8; 32]].concat();
        let matches = engine.scan_bytes(&big, None).unwrap();
        let names: Vec<_> = matches.iter().map(|m| m.rule_name.as_str()).collect();
        assert_eq!(names, vec!["InB"]);

        let matches = engine.scan_bytes(b"abc", None).unwrap();
        assert_eq!(matches.len(), 3);
    }

    #[test]
    fn test_regex_string_over_binary_data() {
        let mut engine = YaraEngine::new();
        engine
            .add_source("p.yar", "rule P { strings: $r = /MZ.{2}PE/ condition: $r }")
            .unwrap();

        let matches = engine.scan_bytes(b"xxMZ\x90\xffPExx", None).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule_name, "P");
    }

    #[test]
    fn test_scan_file_and_timeout() {
        let mut engine = YaraEngine::new();
        engine.add_source("eicar.yar", EICAR_RULE).unwrap();

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(EICAR).unwrap();

        let matches = engine
            .scan_file(file.path(), Some(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(matches.len(), 1);

        let err = engine
            .scan_file(file.path(), Some(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, Error::MatchTimeout { .. }));

        let err = engine
            .scan_file(Path::new("/no/such/file"), None)
            .unwrap_err();
        assert!(matches!(err, Error::FileRead { .. }));
    }

    #[test]
    fn test_from_compiled_recompiles_patterns() {
        let mut engine = YaraEngine::new();
        engine.add_source("eicar.yar", EICAR_RULE).unwrap();

        let json = serde_json::to_string(engine.rules()).unwrap();
        let rules: Vec<YaraRule> = serde_json::from_str(&json).unwrap();
        let restored = YaraEngine::from_compiled(rules).unwrap();
        assert_eq!(restored.scan_bytes(EICAR, None).unwrap().len(), 1);
    }
}
