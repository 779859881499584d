//! Prometheus text exposition parsing.
//!
//! Only the parts of the format the scraper needs are handled: a sample line
//! is `name[{labels}] value [timestamp]`. The value is always the first
//! token after the name and label block, so trailing timestamps never leak
//! into the result and label values containing spaces (`model="Tesla T4"`)
//! cannot shift it.

use std::collections::HashMap;

/// Extracts the value of `name` from a full exposition payload.
///
/// Returns `None` when the payload is empty or no sample line carries
/// exactly that metric name. Name matching is exact: `foo` never matches
/// `foo_total`.
#[must_use]
pub fn parse_value(payload: &str, name: &str) -> Option<f64> {
    if name.is_empty() {
        return None;
    }
    payload
        .lines()
        .filter_map(parse_sample_line)
        .find_map(|(metric, value)| (metric == name).then_some(value))
}

/// Returns the value of the first alias present in the payload, or 0.
#[must_use]
pub fn first_found(payload: &str, aliases: &[&str]) -> f64 {
    aliases
        .iter()
        .find_map(|alias| parse_value(payload, alias))
        .unwrap_or(0.0)
}

/// An indexed view over one exposition payload.
///
/// Parsing is done once; each lookup is then a hash probe. When a metric
/// name appears on several lines (one per label set), the first line with
/// a parseable value wins, matching [`parse_value`].
#[derive(Debug, Clone, Default)]
pub struct Exposition<'a> {
    samples: HashMap<&'a str, f64>,
}

impl<'a> Exposition<'a> {
    /// Parses a payload into an index keyed by bare metric name.
    #[must_use]
    pub fn parse(payload: &'a str) -> Self {
        let mut samples = HashMap::new();
        for (metric, value) in payload.lines().filter_map(parse_sample_line) {
            samples.entry(metric).or_insert(value);
        }
        Self { samples }
    }

    /// Returns the value for an exact metric name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.samples.get(name).copied()
    }

    /// Returns the value of the first alias present, if any.
    #[must_use]
    pub fn find(&self, aliases: &[&str]) -> Option<f64> {
        aliases.iter().find_map(|alias| self.get(alias))
    }

    /// Returns the value of the first alias present, or 0.
    #[must_use]
    pub fn first_found(&self, aliases: &[&str]) -> f64 {
        self.find(aliases).unwrap_or(0.0)
    }

    /// Returns the number of distinct metric names in the payload.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the payload contained no sample lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Splits one line into `(metric name, value)`.
///
/// Returns `None` for blank lines, comments, unterminated label blocks and
/// values that do not parse as a float.
fn parse_sample_line(line: &str) -> Option<(&str, f64)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let (metric, rest) = line.split_at(name_end);
    if metric.is_empty() {
        return None;
    }

    let rest = if rest.starts_with('{') {
        let close = label_block_end(rest)?;
        &rest[close + 1..]
    } else {
        rest
    };

    let value = rest.split_whitespace().next()?;
    let value = value.parse::<f64>().ok()?;
    Some((metric, value))
}

/// Finds the byte offset of the `}` closing a label block that starts at
/// offset 0. Braces inside quoted label values are skipped.
fn label_block_end(block: &str) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (idx, c) in block.char_indices().skip(1) {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '}' if !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}
