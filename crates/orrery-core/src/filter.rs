//! Target filters
//!
//! References select capabilities through an LDAP-style filter evaluated
//! against the capability's property map:
//!
//! ```text
//! (&(level>=2)(|(region=eu*)(!(mode=test))))
//! ```
//!
//! Supported operators: `=` (equality, `*` wildcards for substrings, `k=*`
//! for presence), `~=` (approximate: case and whitespace insensitive), `>=`
//! and `<=`. Attribute names are matched case-insensitively. A literal is
//! compared as an integer, float or boolean when the property has that type
//! and the literal parses as one; strings compare lexicographically; list
//! properties match when any element matches.

use crate::properties::{PropertyMap, PropertyValue};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Filter parse failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid filter at byte {position}: {message}")]
pub struct FilterError {
    /// Byte offset into the filter text
    pub position: usize,
    /// What was expected
    pub message: String,
}

impl FilterError {
    fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// Parsed target filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Filter {
    /// All sub-filters match
    And(Vec<Filter>),
    /// At least one sub-filter matches
    Or(Vec<Filter>),
    /// The sub-filter does not match
    Not(Box<Filter>),
    /// `(key=value)`
    Equal { key: String, value: String },
    /// `(key~=value)`
    Approx { key: String, value: String },
    /// `(key>=value)`
    GreaterEq { key: String, value: String },
    /// `(key<=value)`
    LessEq { key: String, value: String },
    /// `(key=*)`
    Present { key: String },
    /// `(key=ab*cd*ef)`
    Substring {
        key: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
}

#[derive(Debug, Clone, Copy)]
enum Comparison {
    Equal,
    Approx,
    GreaterEq,
    LessEq,
}

impl Filter {
    /// Parse filter text
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let mut parser = Parser::new(input);
        parser.skip_whitespace();
        let filter = parser.filter()?;
        parser.skip_whitespace();
        if parser.pos != parser.bytes.len() {
            return Err(FilterError::new(parser.pos, "trailing characters"));
        }
        Ok(filter)
    }

    /// Equality filter built programmatically
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equal {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Evaluate against a property snapshot
    pub fn matches(&self, properties: &PropertyMap) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|filter| filter.matches(properties)),
            Filter::Or(filters) => filters.iter().any(|filter| filter.matches(properties)),
            Filter::Not(filter) => !filter.matches(properties),
            Filter::Present { key } => properties.get_ignore_case(key).is_some(),
            Filter::Equal { key, value } => {
                compare_property(properties, key, value, Comparison::Equal)
            }
            Filter::Approx { key, value } => {
                compare_property(properties, key, value, Comparison::Approx)
            }
            Filter::GreaterEq { key, value } => {
                compare_property(properties, key, value, Comparison::GreaterEq)
            }
            Filter::LessEq { key, value } => {
                compare_property(properties, key, value, Comparison::LessEq)
            }
            Filter::Substring {
                key,
                initial,
                any,
                last,
            } => properties
                .get_ignore_case(key)
                .is_some_and(|value| substring_matches(value, initial.as_deref(), any, last.as_deref())),
        }
    }
}

fn compare_property(properties: &PropertyMap, key: &str, literal: &str, op: Comparison) -> bool {
    properties
        .get_ignore_case(key)
        .is_some_and(|value| compare_value(value, literal, op))
}

fn compare_value(value: &PropertyValue, literal: &str, op: Comparison) -> bool {
    match value {
        PropertyValue::List(items) => items.iter().any(|item| compare_value(item, literal, op)),
        PropertyValue::Int(actual) => literal
            .trim()
            .parse::<i64>()
            .is_ok_and(|expected| ordering_satisfies(actual.cmp(&expected), op)),
        PropertyValue::Float(actual) => literal.trim().parse::<f64>().is_ok_and(|expected| {
            actual
                .partial_cmp(&expected)
                .is_some_and(|ordering| ordering_satisfies(ordering, op))
        }),
        PropertyValue::Bool(actual) => match op {
            Comparison::Equal | Comparison::Approx => literal
                .trim()
                .parse::<bool>()
                .or_else(|_| literal.trim().to_ascii_lowercase().parse::<bool>())
                .is_ok_and(|expected| *actual == expected),
            Comparison::GreaterEq | Comparison::LessEq => false,
        },
        PropertyValue::String(actual) => match op {
            Comparison::Approx => normalize(actual) == normalize(literal),
            _ => ordering_satisfies(actual.as_str().cmp(literal), op),
        },
    }
}

fn ordering_satisfies(ordering: Ordering, op: Comparison) -> bool {
    match op {
        Comparison::Equal | Comparison::Approx => ordering == Ordering::Equal,
        Comparison::GreaterEq => ordering != Ordering::Less,
        Comparison::LessEq => ordering != Ordering::Greater,
    }
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn substring_matches(
    value: &PropertyValue,
    initial: Option<&str>,
    any: &[String],
    last: Option<&str>,
) -> bool {
    match value {
        PropertyValue::List(items) => items
            .iter()
            .any(|item| substring_matches(item, initial, any, last)),
        PropertyValue::String(text) => {
            let mut rest = text.as_str();
            if let Some(prefix) = initial {
                match rest.strip_prefix(prefix) {
                    Some(remaining) => rest = remaining,
                    None => return false,
                }
            }
            for part in any {
                match rest.find(part.as_str()) {
                    Some(index) => rest = &rest[index + part.len()..],
                    None => return false,
                }
            }
            match last {
                Some(suffix) => rest.ends_with(suffix),
                None => true,
            }
        }
        _ => false,
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            input,
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: u8) -> Result<(), FilterError> {
        match self.peek() {
            Some(b) if b == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => Err(FilterError::new(
                self.pos,
                format!("expected '{}', found '{}'", expected as char, b as char),
            )),
            None => Err(FilterError::new(
                self.pos,
                format!("expected '{}', found end of input", expected as char),
            )),
        }
    }

    fn filter(&mut self) -> Result<Filter, FilterError> {
        self.expect(b'(')?;
        self.skip_whitespace();
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                self.skip_whitespace();
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(FilterError::new(self.pos, "unexpected end of input")),
        };
        self.skip_whitespace();
        self.expect(b')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> Result<Vec<Filter>, FilterError> {
        let mut filters = Vec::new();
        self.skip_whitespace();
        while self.peek() == Some(b'(') {
            filters.push(self.filter()?);
            self.skip_whitespace();
        }
        if filters.is_empty() {
            return Err(FilterError::new(self.pos, "empty filter list"));
        }
        Ok(filters)
    }

    fn item(&mut self) -> Result<Filter, FilterError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'=' | b'<' | b'>' | b'~' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let key = self.input[start..self.pos].trim().to_string();
        if key.is_empty() {
            return Err(FilterError::new(start, "missing attribute name"));
        }

        let operator_at = self.pos;
        let operator = match (self.peek(), self.bytes.get(self.pos + 1).copied()) {
            (Some(b'='), _) => {
                self.pos += 1;
                b'='
            }
            (Some(op @ (b'~' | b'>' | b'<')), Some(b'=')) => {
                self.pos += 2;
                op
            }
            _ => return Err(FilterError::new(operator_at, "expected an operator")),
        };

        let parts = self.value()?;
        match operator {
            b'=' => Ok(equality_or_substring(key, parts)),
            op => {
                if parts.len() > 1 {
                    return Err(FilterError::new(
                        operator_at,
                        "wildcards are only allowed with '='",
                    ));
                }
                let value = parts.into_iter().next().unwrap_or_default();
                Ok(match op {
                    b'~' => Filter::Approx { key, value },
                    b'>' => Filter::GreaterEq { key, value },
                    _ => Filter::LessEq { key, value },
                })
            }
        }
    }

    /// Reads a value up to the closing parenthesis, splitting on unescaped `*`
    fn value(&mut self) -> Result<Vec<String>, FilterError> {
        let mut parts = vec![String::new()];
        loop {
            match self.peek() {
                None => return Err(FilterError::new(self.pos, "unterminated value")),
                Some(b')') => break,
                Some(b'(') => {
                    return Err(FilterError::new(self.pos, "unescaped '(' in value"));
                }
                Some(b'*') => {
                    self.pos += 1;
                    parts.push(String::new());
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let ch = self.next_char().ok_or_else(|| {
                        FilterError::new(self.pos, "dangling escape at end of input")
                    })?;
                    if let Some(current) = parts.last_mut() {
                        current.push(ch);
                    }
                }
                Some(_) => {
                    let ch = self
                        .next_char()
                        .ok_or_else(|| FilterError::new(self.pos, "unterminated value"))?;
                    if let Some(current) = parts.last_mut() {
                        current.push(ch);
                    }
                }
            }
        }
        Ok(parts)
    }

    fn next_char(&mut self) -> Option<char> {
        let ch = self.input[self.pos..].chars().next()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }
}

fn equality_or_substring(key: String, mut parts: Vec<String>) -> Filter {
    if parts.len() == 1 {
        let value = parts.pop().unwrap_or_default();
        return Filter::Equal { key, value };
    }
    if parts.len() == 2 && parts.iter().all(String::is_empty) {
        return Filter::Present { key };
    }
    let last = parts.pop().filter(|part| !part.is_empty());
    let mut rest = parts.into_iter();
    let initial = rest.next().filter(|part| !part.is_empty());
    let any = rest.filter(|part| !part.is_empty()).collect();
    Filter::Substring {
        key,
        initial,
        any,
        last,
    }
}

fn escape(value: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for ch in value.chars() {
        if matches!(ch, '\\' | '(' | ')' | '*') {
            f.write_str("\\")?;
        }
        write!(f, "{ch}")?;
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(filters) | Filter::Or(filters) => {
                f.write_str(if matches!(self, Filter::And(_)) { "(&" } else { "(|" })?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                f.write_str(")")
            }
            Filter::Not(filter) => write!(f, "(!{filter})"),
            Filter::Present { key } => write!(f, "({key}=*)"),
            Filter::Equal { key, value }
            | Filter::Approx { key, value }
            | Filter::GreaterEq { key, value }
            | Filter::LessEq { key, value } => {
                let op = match self {
                    Filter::Equal { .. } => "=",
                    Filter::Approx { .. } => "~=",
                    Filter::GreaterEq { .. } => ">=",
                    _ => "<=",
                };
                write!(f, "({key}{op}")?;
                escape(value, f)?;
                f.write_str(")")
            }
            Filter::Substring {
                key,
                initial,
                any,
                last,
            } => {
                write!(f, "({key}=")?;
                if let Some(initial) = initial {
                    escape(initial, f)?;
                }
                f.write_str("*")?;
                for part in any {
                    escape(part, f)?;
                    f.write_str("*")?;
                }
                if let Some(last) = last {
                    escape(last, f)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Filter::parse(s)
    }
}

impl TryFrom<String> for Filter {
    type Error = FilterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Filter::parse(&value)
    }
}

impl From<Filter> for String {
    fn from(filter: Filter) -> Self {
        filter.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn props() -> PropertyMap {
        PropertyMap::new()
            .with("level", 3i64)
            .with("region", "eu-west")
            .with("mode", "prod")
            .with("enabled", true)
            .with("tags", vec!["fast", "cheap"])
            .with("weight", 0.5)
    }

    #[test]
    fn test_equality_and_comparisons() {
        let p = props();
        assert!(Filter::parse("(level=3)").unwrap().matches(&p));
        assert!(Filter::parse("(level>=2)").unwrap().matches(&p));
        assert!(!Filter::parse("(level<=2)").unwrap().matches(&p));
        assert!(Filter::parse("(weight<=0.75)").unwrap().matches(&p));
        assert!(Filter::parse("(enabled=true)").unwrap().matches(&p));
        assert!(!Filter::parse("(enabled>=true)").unwrap().matches(&p));
    }

    #[test]
    fn test_composites() {
        let p = props();
        let filter = Filter::parse("(&(level>=2)(|(region=us*)(!(mode=test))))").unwrap();
        assert!(filter.matches(&p));
        let filter = Filter::parse("(&(level>=2)(mode=test))").unwrap();
        assert!(!filter.matches(&p));
    }

    #[test]
    fn test_presence_substring_and_lists() {
        let p = props();
        assert!(Filter::parse("(region=*)").unwrap().matches(&p));
        assert!(!Filter::parse("(missing=*)").unwrap().matches(&p));
        assert!(Filter::parse("(region=eu*)").unwrap().matches(&p));
        assert!(Filter::parse("(region=*-*st)").unwrap().matches(&p));
        assert!(!Filter::parse("(region=us*)").unwrap().matches(&p));
        assert!(Filter::parse("(tags=cheap)").unwrap().matches(&p));
        assert!(Filter::parse("(tags=fa*)").unwrap().matches(&p));
    }

    #[test]
    fn test_approx_and_case_insensitive_keys() {
        let p = props();
        assert!(Filter::parse("(MODE~= P rod)").unwrap().matches(&p));
        assert!(Filter::parse("(Level=3)").unwrap().matches(&p));
    }

    #[test]
    fn test_escaped_values_round_trip() {
        let filter = Filter::parse(r"(name=a\*b\(c\))").unwrap();
        assert_eq!(filter, Filter::equal("name", "a*b(c)"));
        assert_eq!(filter.to_string(), r"(name=a\*b\(c\))");
        let p = PropertyMap::new().with("name", "a*b(c)");
        assert!(filter.matches(&p));
    }

    #[test]
    fn test_parse_errors_carry_position() {
        assert_matches!(Filter::parse("level=3"), Err(FilterError { position: 0, .. }));
        assert_matches!(Filter::parse("(level=3"), Err(FilterError { position: 8, .. }));
        assert_matches!(Filter::parse("(&)"), Err(_));
        assert_matches!(Filter::parse("(=3)"), Err(_));
        assert_matches!(Filter::parse("(a>=b*)"), Err(_));
        assert_matches!(Filter::parse("(a=1)(b=2)"), Err(_));
    }

    #[test]
    fn test_serde_as_string() {
        let filter = Filter::parse("(&(a=1)(b>=2))").unwrap();
        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, "\"(&(a=1)(b>=2))\"");
        let back: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, filter);
        assert!(serde_json::from_str::<Filter>("\"(broken\"").is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Integer comparisons agree with native ordering
            #[test]
            fn int_comparison_matches_native(actual in -1000i64..1000, literal in -1000i64..1000) {
                let p = PropertyMap::new().with("n", actual);
                let ge = Filter::parse(&format!("(n>={literal})")).unwrap();
                let le = Filter::parse(&format!("(n<={literal})")).unwrap();
                prop_assert_eq!(ge.matches(&p), actual >= literal);
                prop_assert_eq!(le.matches(&p), actual <= literal);
            }

            /// Negation always inverts the inner result
            #[test]
            fn not_inverts(value in "[a-z]{1,8}", probe in "[a-z]{1,8}") {
                let p = PropertyMap::new().with("k", value.as_str());
                let inner = Filter::parse(&format!("(k={probe})")).unwrap();
                let negated = Filter::Not(Box::new(inner.clone()));
                prop_assert_eq!(negated.matches(&p), !inner.matches(&p));
            }
        }
    }
}
