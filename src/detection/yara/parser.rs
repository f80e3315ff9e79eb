//! Parser for YARA rule sources.
//!
//! Accepts the subset of the YARA language the engine can evaluate: rules
//! with tags, `meta`, text/hex/regex `strings` and boolean conditions over
//! string matches, match counts, `filesize`, `uintN()` reads and `of`
//! expressions. Anything else (modules, `include`, offsets, loops) is a
//! compile error, so a rule is never silently evaluated differently from
//! what its author wrote.

use super::rules::{
    id_matches, CmpOp, Condition, Modifiers, Operand, PatternType, Quantifier, StringPattern,
    StringSet, YaraRule,
};
use crate::core::error::{Error, Result};
use crate::core::types::{MetaValue, RuleMetadata};
use std::collections::HashSet;

const KEYWORDS: &[&str] = &[
    "all", "and", "any", "ascii", "at", "condition", "false", "filesize", "for", "global", "import",
    "in", "include", "meta", "nocase", "none", "not", "of", "or", "private", "rule", "strings",
    "them", "true", "uint8", "uint16", "uint32", "wide",
];

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    /// `$name`, possibly with a trailing `*`
    StrId(String),
    /// `#name`, stored with a `$` prefix
    CountId(String),
    Str(Vec<u8>),
    Int(i64),
    Hex(String),
    Regex {
        pattern: String,
        nocase: bool,
        dotall: bool,
    },
    LBrace,
    RBrace,
    LParen,
    RParen,
    Colon,
    Comma,
    Minus,
    Assign,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: Tok,
    line: usize,
}

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    source_name: &'a str,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &str, source_name: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            source_name,
            tokens: Vec::new(),
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::rule_compile(self.source_name, self.line, message)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: Tok, line: usize) {
        self.tokens.push(Token { kind, line });
    }

    fn after_assign(&self) -> bool {
        matches!(self.tokens.last(), Some(Token { kind: Tok::Assign, .. }))
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        while let Some(c) = self.peek() {
            let line = self.line;
            match c {
                c if c.is_whitespace() => {
                    self.bump();
                }
                '/' if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '/' if self.peek_at(1) == Some('*') => {
                    self.pos += 2;
                    loop {
                        match self.bump() {
                            Some('*') if self.peek() == Some('/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => return Err(self.error("unterminated comment")),
                        }
                    }
                }
                '/' if self.after_assign() => {
                    let kind = self.regex()?;
                    self.push(kind, line);
                }
                '{' if self.after_assign() => {
                    self.bump();
                    let mut body = String::new();
                    loop {
                        match self.bump() {
                            Some('}') => break,
                            Some(c) => body.push(c),
                            None => return Err(self.error("unterminated hex string")),
                        }
                    }
                    self.push(Tok::Hex(body), line);
                }
                '"' => {
                    let bytes = self.string()?;
                    self.push(Tok::Str(bytes), line);
                }
                c if c.is_ascii_digit() => {
                    let value = self.number()?;
                    self.push(Tok::Int(value), line);
                }
                '$' | '#' => {
                    self.bump();
                    let name = self.ident_chars();
                    if c == '#' {
                        if name.is_empty() {
                            return Err(self.error("expected string identifier after '#'"));
                        }
                        self.push(Tok::CountId(format!("${}", name)), line);
                    } else {
                        let mut id = format!("${}", name);
                        if self.peek() == Some('*') {
                            self.bump();
                            id.push('*');
                        }
                        self.push(Tok::StrId(id), line);
                    }
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let ident = self.ident_chars();
                    self.push(Tok::Ident(ident), line);
                }
                '=' => {
                    self.bump();
                    if self.peek() == Some('=') {
                        self.bump();
                        self.push(Tok::EqEq, line);
                    } else {
                        self.push(Tok::Assign, line);
                    }
                }
                '!' if self.peek_at(1) == Some('=') => {
                    self.pos += 2;
                    self.push(Tok::Ne, line);
                }
                '<' | '>' => {
                    self.bump();
                    let or_equal = self.peek() == Some('=');
                    if or_equal {
                        self.bump();
                    }
                    let kind = match (c, or_equal) {
                        ('<', false) => Tok::Lt,
                        ('<', true) => Tok::Le,
                        (_, false) => Tok::Gt,
                        (_, true) => Tok::Ge,
                    };
                    self.push(kind, line);
                }
                _ => {
                    let kind = match c {
                        '{' => Tok::LBrace,
                        '}' => Tok::RBrace,
                        '(' => Tok::LParen,
                        ')' => Tok::RParen,
                        ':' => Tok::Colon,
                        ',' => Tok::Comma,
                        '-' => Tok::Minus,
                        other => {
                            return Err(self.error(format!("unexpected character '{}'", other)))
                        }
                    };
                    self.bump();
                    self.push(kind, line);
                }
            }
        }

        let line = self.line;
        self.push(Tok::Eof, line);
        Ok(self.tokens)
    }

    fn ident_chars(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                out.push(c);
                self.bump();
            } else {
                break;
            }
        }
        out
    }

    fn string(&mut self) -> Result<Vec<u8>> {
        self.bump();
        let mut out = Vec::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('"') => out.push(b'"'),
                    Some('\\') => out.push(b'\\'),
                    Some('n') => out.push(b'\n'),
                    Some('r') => out.push(b'\r'),
                    Some('t') => out.push(b'\t'),
                    Some('x') => {
                        let digits: String = [self.bump(), self.bump()]
                            .iter()
                            .flatten()
                            .collect();
                        let byte = u8::from_str_radix(&digits, 16)
                            .map_err(|_| self.error(format!("invalid escape \\x{}", digits)))?;
                        out.push(byte);
                    }
                    Some(other) => {
                        return Err(self.error(format!("invalid escape sequence \\{}", other)))
                    }
                    None => return Err(self.error("unterminated string")),
                },
                Some('\n') | None => return Err(self.error("unterminated string")),
                Some(c) => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
    }

    fn number(&mut self) -> Result<i64> {
        let mut digits = String::new();
        let radix = if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X')) {
            self.pos += 2;
            16
        } else {
            10
        };
        while let Some(c) = self.peek() {
            if c.is_digit(radix) {
                digits.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let mut value = i64::from_str_radix(&digits, radix)
            .map_err(|_| self.error(format!("invalid number '{}'", digits)))?;

        let multiplier = match (self.peek(), self.peek_at(1)) {
            (Some('K'), Some('B')) => Some(1024),
            (Some('M'), Some('B')) => Some(1024 * 1024),
            _ => None,
        };
        if let Some(m) = multiplier {
            self.pos += 2;
            value = value
                .checked_mul(m)
                .ok_or_else(|| self.error("number out of range"))?;
        }
        if self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(self.error("invalid numeric literal"));
        }
        Ok(value)
    }

    fn regex(&mut self) -> Result<Tok> {
        self.bump();
        let mut pattern = String::new();
        loop {
            match self.bump() {
                Some('/') => break,
                Some('\\') => match self.bump() {
                    Some('/') => pattern.push('/'),
                    Some(c) => {
                        pattern.push('\\');
                        pattern.push(c);
                    }
                    None => return Err(self.error("unterminated regular expression")),
                },
                Some('\n') | None => return Err(self.error("unterminated regular expression")),
                Some(c) => pattern.push(c),
            }
        }
        if pattern.is_empty() {
            return Err(self.error("empty regular expression"));
        }

        let (mut nocase, mut dotall) = (false, false);
        while let Some(c) = self.peek() {
            match c {
                'i' => nocase = true,
                's' => dotall = true,
                c if c.is_ascii_alphanumeric() => {
                    return Err(self.error(format!("unsupported regular expression flag '{}'", c)))
                }
                _ => break,
            }
            self.bump();
        }
        Ok(Tok::Regex {
            pattern,
            nocase,
            dotall,
        })
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source_name: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].kind
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn next(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::rule_compile(self.source_name, self.line(), message)
    }

    fn expect(&mut self, expected: Tok, what: &str) -> Result<()> {
        if *self.peek() == expected {
            self.next();
            Ok(())
        } else {
            Err(self.error(format!("expected {}, found {}", what, describe(self.peek()))))
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Tok::Ident(w) if w == word)
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.is_keyword(word) {
            self.next();
            true
        } else {
            false
        }
    }

    fn identifier(&mut self, what: &str) -> Result<String> {
        match self.next() {
            Tok::Ident(name) if !KEYWORDS.contains(&name.as_str()) => Ok(name),
            Tok::Ident(name) => Err(self.error(format!("'{}' is a reserved word", name))),
            other => Err(self.error(format!("expected {}, found {}", what, describe(&other)))),
        }
    }

    fn rules(&mut self, namespace: &str) -> Result<Vec<YaraRule>> {
        let mut rules = Vec::new();
        let mut names = HashSet::new();

        while *self.peek() != Tok::Eof {
            if self.is_keyword("import") || self.is_keyword("include") {
                return Err(self.error("import and include directives are not supported"));
            }

            let rule = self.rule(namespace)?;
            if !names.insert(rule.name.clone()) {
                return Err(self.error(format!("duplicate rule identifier '{}'", rule.name)));
            }
            rules.push(rule);
        }

        Ok(rules)
    }

    fn rule(&mut self, namespace: &str) -> Result<YaraRule> {
        let (mut is_private, mut is_global) = (false, false);
        loop {
            if self.eat_keyword("private") {
                is_private = true;
            } else if self.eat_keyword("global") {
                is_global = true;
            } else {
                break;
            }
        }
        if !self.eat_keyword("rule") {
            return Err(self.error(format!("expected 'rule', found {}", describe(self.peek()))));
        }

        let name = self.identifier("rule name")?;
        let mut rule = YaraRule::new(&name);
        rule.namespace = namespace.to_string();
        rule.is_private = is_private;
        rule.is_global = is_global;

        if *self.peek() == Tok::Colon {
            self.next();
            while let Tok::Ident(_) = self.peek() {
                rule.tags.push(self.identifier("tag")?);
            }
            if rule.tags.is_empty() {
                return Err(self.error("expected at least one tag after ':'"));
            }
        }

        self.expect(Tok::LBrace, "'{'")?;

        if self.eat_keyword("meta") {
            self.expect(Tok::Colon, "':' after meta")?;
            rule.meta = self.meta()?;
        }
        if self.eat_keyword("strings") {
            self.expect(Tok::Colon, "':' after strings")?;
            rule.strings = self.strings()?;
        }
        if !self.eat_keyword("condition") {
            return Err(self.error(format!(
                "expected 'condition' section in rule '{}'",
                rule.name
            )));
        }
        self.expect(Tok::Colon, "':' after condition")?;
        let condition_line = self.line();
        rule.condition = self.expression()?;
        self.expect(Tok::RBrace, "'}' closing the rule")?;

        self.check_references(&rule, condition_line)?;
        rule.compile()
            .map_err(|e| Error::rule_compile(self.source_name, condition_line, e))?;
        Ok(rule)
    }

    fn meta(&mut self) -> Result<RuleMetadata> {
        let mut meta = RuleMetadata::new();
        while let (Tok::Ident(key), Tok::Assign) = (self.peek().clone(), self.peek_at(1).clone()) {
            self.next();
            self.next();
            let value = match self.next() {
                Tok::Str(bytes) => MetaValue::String(String::from_utf8_lossy(&bytes).into_owned()),
                Tok::Int(v) => MetaValue::Integer(v),
                Tok::Minus => match self.next() {
                    Tok::Int(v) => MetaValue::Integer(-v),
                    other => {
                        return Err(self.error(format!(
                            "expected number after '-', found {}",
                            describe(&other)
                        )))
                    }
                },
                Tok::Ident(w) if w == "true" => MetaValue::Boolean(true),
                Tok::Ident(w) if w == "false" => MetaValue::Boolean(false),
                other => {
                    return Err(self.error(format!(
                        "invalid value for meta '{}': {}",
                        key,
                        describe(&other)
                    )))
                }
            };
            meta.push(key, value);
        }
        Ok(meta)
    }

    fn strings(&mut self) -> Result<Vec<StringPattern>> {
        let mut strings: Vec<StringPattern> = Vec::new();

        while let Tok::StrId(id) = self.peek().clone() {
            self.next();
            if id == "$" {
                return Err(self.error("anonymous strings are not supported"));
            }
            if id.ends_with('*') {
                return Err(self.error(format!("invalid string identifier '{}'", id)));
            }
            if strings.iter().any(|s| s.id == id) {
                return Err(self.error(format!("duplicate string identifier '{}'", id)));
            }
            self.expect(Tok::Assign, "'=' after string identifier")?;

            let mut pattern = match self.next() {
                Tok::Str(bytes) if bytes.is_empty() => {
                    return Err(self.error(format!("empty string {}", id)))
                }
                Tok::Str(bytes) => StringPattern::text(&id, &bytes),
                Tok::Hex(body) => StringPattern::hex(&id, &body),
                Tok::Regex {
                    pattern,
                    nocase,
                    dotall,
                } => StringPattern::regex(&id, &pattern).with_modifiers(Modifiers {
                    nocase,
                    dotall,
                    ..Modifiers::default()
                }),
                other => {
                    return Err(self.error(format!(
                        "expected string value for {}, found {}",
                        id,
                        describe(&other)
                    )))
                }
            };

            while let Tok::Ident(word) = self.peek().clone() {
                match (word.as_str(), pattern.pattern_type) {
                    ("nocase", PatternType::Text | PatternType::Regex) => {
                        pattern.modifiers.nocase = true
                    }
                    ("ascii", PatternType::Text) => pattern.modifiers.ascii = true,
                    ("wide", PatternType::Text) => pattern.modifiers.wide = true,
                    ("nocase" | "ascii" | "wide", _) => {
                        return Err(self.error(format!(
                            "modifier '{}' is not valid on {}",
                            word, id
                        )))
                    }
                    // the next section keyword ends the list
                    ("condition", _) => break,
                    _ => {
                        return Err(self.error(format!("unsupported string modifier '{}'", word)))
                    }
                }
                self.next();
            }

            strings.push(pattern);
        }

        if strings.is_empty() {
            return Err(self.error("empty strings section"));
        }
        Ok(strings)
    }

    fn expression(&mut self) -> Result<Condition> {
        let mut left = self.and_expression()?;
        while self.eat_keyword("or") {
            let right = self.and_expression()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expression(&mut self) -> Result<Condition> {
        let mut left = self.not_expression()?;
        while self.eat_keyword("and") {
            let right = self.not_expression()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expression(&mut self) -> Result<Condition> {
        if self.eat_keyword("not") {
            return Ok(Condition::Not(Box::new(self.not_expression()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Condition> {
        // quantified set: `any of them`, `2 of ($a, $b)`
        let quantifier = match (self.peek(), self.peek_at(1)) {
            (Tok::Ident(w), Tok::Ident(of)) if of == "of" => match w.as_str() {
                "any" => Some(Quantifier::Any),
                "all" => Some(Quantifier::All),
                "none" => Some(Quantifier::None),
                _ => None,
            },
            (Tok::Int(n), Tok::Ident(of)) if of == "of" => {
                Some(Quantifier::AtLeast(usize::try_from(*n).unwrap_or(0)))
            }
            _ => None,
        };
        if let Some(quantifier) = quantifier {
            self.next();
            self.next();
            let set = self.string_set()?;
            return Ok(Condition::Of { quantifier, set });
        }

        match self.peek().clone() {
            Tok::LParen => {
                self.next();
                let inner = self.expression()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::Ident(w) if w == "true" || w == "false" => {
                self.next();
                Ok(Condition::Bool(w == "true"))
            }
            Tok::StrId(id) => {
                self.next();
                if id.ends_with('*') {
                    return Err(self.error(format!("wildcard '{}' is only valid in a set", id)));
                }
                if self.is_keyword("at") || self.is_keyword("in") {
                    return Err(self.error("string offsets ('at'/'in') are not supported"));
                }
                Ok(Condition::Pattern(id))
            }
            _ => {
                let left = self.operand()?;
                let op = match self.next() {
                    Tok::EqEq => CmpOp::Eq,
                    Tok::Ne => CmpOp::Ne,
                    Tok::Lt => CmpOp::Lt,
                    Tok::Le => CmpOp::Le,
                    Tok::Gt => CmpOp::Gt,
                    Tok::Ge => CmpOp::Ge,
                    other => {
                        return Err(self.error(format!(
                            "expected comparison operator, found {}",
                            describe(&other)
                        )))
                    }
                };
                let right = self.operand()?;
                Ok(Condition::Compare { left, op, right })
            }
        }
    }

    fn operand(&mut self) -> Result<Operand> {
        match self.next() {
            Tok::Int(v) => Ok(Operand::Integer(v)),
            Tok::Minus => match self.next() {
                Tok::Int(v) => Ok(Operand::Integer(-v)),
                other => Err(self.error(format!(
                    "expected number after '-', found {}",
                    describe(&other)
                ))),
            },
            Tok::CountId(id) => Ok(Operand::Count(id)),
            Tok::Ident(w) if w == "filesize" => Ok(Operand::FileSize),
            Tok::Ident(w) if matches!(w.as_str(), "uint8" | "uint16" | "uint32") => {
                let bits = match w.as_str() {
                    "uint8" => 8,
                    "uint16" => 16,
                    _ => 32,
                };
                self.expect(Tok::LParen, "'(' after integer function")?;
                let offset = match self.next() {
                    Tok::Int(v) => v,
                    other => {
                        return Err(self.error(format!(
                            "expected constant offset, found {}",
                            describe(&other)
                        )))
                    }
                };
                self.expect(Tok::RParen, "')'")?;
                Ok(Operand::Uint { bits, offset })
            }
            Tok::Ident(w) => Err(self.error(format!("undefined identifier '{}'", w))),
            other => Err(self.error(format!(
                "expected expression, found {}",
                describe(&other)
            ))),
        }
    }

    fn string_set(&mut self) -> Result<StringSet> {
        if self.eat_keyword("them") {
            return Ok(StringSet::Them);
        }
        self.expect(Tok::LParen, "'them' or '(' after 'of'")?;
        let mut ids = Vec::new();
        loop {
            match self.next() {
                Tok::StrId(id) => ids.push(id),
                other => {
                    return Err(self.error(format!(
                        "expected string identifier, found {}",
                        describe(&other)
                    )))
                }
            }
            match self.next() {
                Tok::Comma => continue,
                Tok::RParen => break,
                other => {
                    return Err(self.error(format!(
                        "expected ',' or ')', found {}",
                        describe(&other)
                    )))
                }
            }
        }
        Ok(StringSet::Ids(ids))
    }

    fn check_references(&self, rule: &YaraRule, line: usize) -> Result<()> {
        let ids = rule.string_ids();
        let mut missing: Option<String> = None;
        rule.condition.for_each_reference(&mut |entry| {
            if missing.is_none() && !ids.iter().any(|id| id_matches(entry, id)) {
                missing = Some(entry.to_string());
            }
        });
        if let Some(entry) = missing {
            return Err(Error::rule_compile(
                self.source_name,
                line,
                format!("undefined string identifier '{}' in rule '{}'", entry, rule.name),
            ));
        }

        let uses_them = condition_uses_them(&rule.condition);
        if uses_them && ids.is_empty() {
            return Err(Error::rule_compile(
                self.source_name,
                line,
                format!("'them' used in rule '{}' without strings", rule.name),
            ));
        }
        Ok(())
    }
}

fn condition_uses_them(condition: &Condition) -> bool {
    match condition {
        Condition::Of {
            set: StringSet::Them,
            ..
        } => true,
        Condition::And(a, b) | Condition::Or(a, b) => {
            condition_uses_them(a) || condition_uses_them(b)
        }
        Condition::Not(c) => condition_uses_them(c),
        _ => false,
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Ident(w) => format!("'{}'", w),
        Tok::StrId(id) | Tok::CountId(id) => format!("'{}'", id),
        Tok::Str(_) => "string literal".to_string(),
        Tok::Int(v) => format!("number {}", v),
        Tok::Hex(_) => "hex string".to_string(),
        Tok::Regex { .. } => "regular expression".to_string(),
        Tok::Eof => "end of file".to_string(),
        other => format!("{:?}", other),
    }
}

/// Parse one rule source into compiled rules, all tagged with `namespace`.
///
/// An empty source (only whitespace and comments) yields no rules.
pub fn parse_rules(namespace: &str, source: &str) -> Result<Vec<YaraRule>> {
    let tokens = Lexer::new(source, namespace).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        source_name: namespace,
    };
    parser.rules(namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorCategory;

    const EICAR: &[u8] = b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

    fn parse_one(source: &str) -> YaraRule {
        let mut rules = parse_rules("test.yar", source).unwrap();
        assert_eq!(rules.len(), 1);
        rules.remove(0)
    }

    fn compile_error(source: &str) -> String {
        let err = parse_rules("bad.yar", source).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Compile);
        err.to_string()
    }

    #[test]
    fn test_eicar_rule() {
        let rule = parse_one(
            r#"
            rule EICAR_Test_File : test eicar {
                meta:
                    description = "EICAR test file"
                    confidence = "high"
                    version = 2
                    enabled = true
                strings:
                    $eicar = "X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"
                condition:
                    $eicar
            }
            "#,
        );

        assert_eq!(rule.name, "EICAR_Test_File");
        assert_eq!(rule.namespace, "test.yar");
        assert_eq!(rule.tags, vec!["test", "eicar"]);
        assert_eq!(rule.meta.get_str("confidence"), Some("high"));
        assert_eq!(rule.meta.get("version"), Some(&MetaValue::Integer(2)));
        assert_eq!(rule.meta.get("enabled"), Some(&MetaValue::Boolean(true)));

        let hit = rule.matches(EICAR).unwrap();
        assert_eq!(hit.strings[0].identifier, "$eicar");
        assert!(rule.matches(b"harmless text").is_none());
    }

    #[test]
    fn test_comments_and_multiple_rules() {
        let rules = parse_rules(
            "multi.yara",
            r#"
            // line comment
            /* block
               comment */
            rule A { strings: $a = "alpha" condition: $a }
            private rule B { condition: filesize < 1KB }
            global rule C { condition: true }
            "#,
        )
        .unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules[1].is_private);
        assert!(rules[2].is_global);
        assert_eq!(
            rules[1].condition,
            Condition::Compare {
                left: Operand::FileSize,
                op: CmpOp::Lt,
                right: Operand::Integer(1024),
            }
        );
    }

    #[test]
    fn test_empty_source_has_no_rules() {
        assert!(parse_rules("empty.yar", "  // nothing here\n").unwrap().is_empty());
    }

    #[test]
    fn test_condition_grammar() {
        let rule = parse_one(
            r#"
            rule Grammar {
                strings:
                    $mz = { 4D 5A }
                    $s1 = "one" nocase
                    $s2 = "two" wide ascii
                    $re = /evil[0-9]+\.com/i
                condition:
                    uint16(0) == 0x5A4D and (2 of ($s*) or #re >= 2) and not none of them
            }
            "#,
        );

        assert!(rule.matches(b"MZ..ONE..two").is_some());
        assert!(rule.matches(b"MZ..EVIL1.com evil22.COM").is_some());
        assert!(rule.matches(b"MZ..one only").is_none());
        assert!(rule.matches(b"ZM..one two").is_none());
    }

    #[test]
    fn test_precedence_and_binds_tighter() {
        let rule = parse_one(
            r#"rule P { strings: $a = "a" $b = "b" $c = "c" condition: $a or $b and $c }"#,
        );
        assert!(rule.matches(b"a").is_some());
        assert!(rule.matches(b"b").is_none());
        assert!(rule.matches(b"bc").is_some());
    }

    #[test]
    fn test_string_escapes() {
        let rule = parse_one(r#"rule E { strings: $a = "q\"\x41\\" condition: $a }"#);
        assert_eq!(rule.strings[0].pattern, b"q\"A\\".to_vec());
    }

    #[test]
    fn test_import_is_rejected() {
        let msg = compile_error("import \"pe\"\nrule A { condition: true }");
        assert!(msg.contains("not supported"));
    }

    #[test]
    fn test_syntax_errors() {
        let msg = compile_error("rule Broken { strings: $a = \"x\" condition: $a ");
        assert!(msg.contains("bad.yar"));
        assert!(msg.contains("'}'"));

        compile_error("rule { condition: true }");
        compile_error("rule A { strings: $a = \"x\" }");
        compile_error("rule A { condition: $missing }");
        compile_error("rule A { strings: $a = \"x\" $a = \"y\" condition: $a }");
        compile_error("rule A { condition: true } rule A { condition: false }");
        compile_error("rule A { strings: $a = /unclosed( / condition: $a }");
        compile_error("rule A { strings: $a = { 4D 5 } condition: $a }");
        compile_error("rule A { strings: $a = \"x\" fullword condition: $a }");
        compile_error("rule A { strings: $a = \"x\" condition: $a at 0 }");
        compile_error("rule A { condition: pe.is_dll }");
        compile_error("rule A { condition: any of them }");
        compile_error("rule A { strings: $a = \"unterminated condition: $a }");
    }

    #[test]
    fn test_error_reports_line() {
        let err = parse_rules("lines.yar", "rule A {\n  condition:\n    $nope\n}").unwrap_err();
        match err {
            Error::RuleCompile { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
