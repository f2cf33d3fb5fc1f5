// SPDX-License-Identifier: MIT OR Apache-2.0

//! Annotated-context parsing.
//!
//! A context is free text split into named regions by header lines of the
//! form `[[NAME]]`. Text before the first header belongs to the implicit
//! region `SHARED`. Region names are case-insensitive and stored upper-case.
//!
//! ```text
//! [[SHARED]]
//! Be terse.
//! [[POSITIVE]]
//! {{SHARED}} Be happy.
//! [[NEGATIVE]]
//! {{SHARED}} Be sad.
//! ```
//!
//! `{{NAME}}` placeholders in the resolved texts are replaced by the raw
//! text of region `NAME` in a single pass.
//!
//! # Precedence
//!
//! - `positive`: the `POSITIVE` region, else the last-declared
//!   `POSITIVE*` extra (promoted out of the extras), else `SHARED`, else the
//!   whole context.
//! - `negative`: the `NEGATIVE` region, else the last-declared `NEGATIVE*`
//!   extra (promoted), else empty.
//! - A duplicated region name keeps its first position and its last text.

/// Name of the implicit region holding text before the first header.
pub const SHARED: &str = "SHARED";
/// Name of the base positive region.
pub const POSITIVE: &str = "POSITIVE";
/// Name of the base negative region.
pub const NEGATIVE: &str = "NEGATIVE";

// ---------------------------------------------------------------------------
// RegionMap
// ---------------------------------------------------------------------------

/// Insertion-ordered map from region name to text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionMap {
    /// `(name, text)` in first-encounter order.
    entries: Vec<(String, String)>,
}

impl RegionMap {
    /// Create an empty map.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert or overwrite `name`. An overwritten entry keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, text: impl Into<String>) {
        let name = name.into();
        let text = text.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = text,
            None => self.entries.push((name, text)),
        }
    }

    /// Look up a region's text.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.as_str())
    }

    /// Whether `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove and return the last-inserted entry.
    pub fn pop_last(&mut self) -> Option<(String, String)> {
        self.entries.pop()
    }

    /// Iterate `(name, text)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t.as_str()))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply `f` to every text in place.
    fn map_texts(&mut self, mut f: impl FnMut(&str) -> String) {
        for (_, text) in &mut self.entries {
            *text = f(text);
        }
    }
}

// ---------------------------------------------------------------------------
// ParsedRegions
// ---------------------------------------------------------------------------

/// Result of parsing one annotated context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedRegions {
    /// Raw (pre-substitution) region texts.
    pub regions: RegionMap,
    /// Resolved base positive text.
    pub positive: String,
    /// Resolved base negative text (empty when absent).
    pub negative: String,
    /// Resolved `POSITIVE*` extras, keyed by full region name.
    pub positive_extras: RegionMap,
    /// Resolved `NEGATIVE*` extras, keyed by full region name.
    pub negative_extras: RegionMap,
}

impl ParsedRegions {
    /// Whether any negative content exists (base or extras).
    #[must_use]
    pub fn has_negative(&self) -> bool {
        !self.negative.is_empty() || !self.negative_extras.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Where the scanner currently is.
enum ScanState {
    /// No header seen yet; lines accumulate into `SHARED`.
    BeforeFirstHeader,
    /// Inside the region with the given name.
    InRegion(String),
}

/// Parse an annotated context into its regions.
///
/// Never fails: lines that look like malformed headers (`[[]]`, unmatched
/// brackets, trailing text) are kept as ordinary text.
#[must_use]
pub fn parse(context: &str) -> ParsedRegions {
    let regions = scan_regions(context);

    let mut positive_extras = RegionMap::new();
    let mut negative_extras = RegionMap::new();
    for (name, text) in regions.iter() {
        if name.starts_with(POSITIVE) && name != POSITIVE {
            positive_extras.insert(name, text);
        }
        if name.starts_with(NEGATIVE) && name != NEGATIVE {
            negative_extras.insert(name, text);
        }
    }

    let positive = if let Some(text) = regions.get(POSITIVE) {
        text.to_owned()
    } else if let Some((_, text)) = positive_extras.pop_last() {
        text
    } else if let Some(text) = regions.get(SHARED) {
        text.to_owned()
    } else {
        context.to_owned()
    };

    let negative = if let Some(text) = regions.get(NEGATIVE) {
        text.to_owned()
    } else if let Some((_, text)) = negative_extras.pop_last() {
        text
    } else {
        String::new()
    };

    let positive = substitute(&positive, &regions);
    let negative = substitute(&negative, &regions);
    positive_extras.map_texts(|t| substitute(t, &regions));
    negative_extras.map_texts(|t| substitute(t, &regions));

    ParsedRegions {
        regions,
        positive,
        negative,
        positive_extras,
        negative_extras,
    }
}

/// Split the context into raw regions with a line scanner.
fn scan_regions(context: &str) -> RegionMap {
    let mut regions = RegionMap::new();
    let mut state = ScanState::BeforeFirstHeader;
    let mut buffer = String::new();
    let mut lines_seen = 0_usize;

    for line in context.split_inclusive('\n') {
        if let Some(name) = header_name(line) {
            match std::mem::replace(&mut state, ScanState::InRegion(name)) {
                ScanState::BeforeFirstHeader => {
                    if lines_seen > 0 {
                        regions.insert(SHARED, std::mem::take(&mut buffer));
                    }
                }
                ScanState::InRegion(previous) => {
                    regions.insert(previous, std::mem::take(&mut buffer));
                }
            }
        } else {
            buffer.push_str(line);
        }
        lines_seen += 1;
    }

    match state {
        ScanState::BeforeFirstHeader => regions.insert(SHARED, buffer),
        ScanState::InRegion(name) => regions.insert(name, buffer),
    }
    regions
}

/// Return the normalised region name if `line` is a header line.
fn header_name(line: &str) -> Option<String> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    let inner = line.strip_prefix("[[")?.strip_suffix("]]")?;
    let name = inner.trim();
    if name.is_empty() || name.contains('[') || name.contains(']') {
        return None;
    }
    Some(name.to_uppercase())
}

/// Replace every `{{NAME}}` whose `NAME` is a region with that region's
/// raw text. Replacement text is not rescanned; unknown names stay verbatim.
fn substitute(text: &str, regions: &RegionMap) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        match regions.get(&after[..close]) {
            Some(raw) => {
                out.push_str(raw);
                rest = &after[close + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn plain_context_is_positive_verbatim() {
        let text = "You are a pirate.\nSpeak like one.";
        let parsed = parse(text);
        assert_eq!(parsed.positive, text);
        assert!(parsed.negative.is_empty());
        assert!(parsed.positive_extras.is_empty());
        assert!(!parsed.has_negative());
    }

    #[test]
    fn empty_context_yields_empty_shared() {
        let parsed = parse("");
        assert_eq!(parsed.positive, "");
        assert_eq!(parsed.regions.get(SHARED), Some(""));
    }

    #[test]
    fn positive_and_negative_regions() {
        let parsed = parse("[[POSITIVE]]\nA\n[[NEGATIVE]]\nB\n");
        assert_eq!(parsed.positive, "A\n");
        assert_eq!(parsed.negative, "B\n");
        assert!(parsed.positive_extras.is_empty());
        assert!(parsed.negative_extras.is_empty());
        assert!(!parsed.regions.contains(SHARED));
    }

    #[test]
    fn leading_text_becomes_shared() {
        let parsed = parse("intro\n[[NEGATIVE]]\nbad\n");
        assert_eq!(parsed.regions.get(SHARED), Some("intro\n"));
        assert_eq!(parsed.positive, "intro\n");
        assert_eq!(parsed.negative, "bad\n");
    }

    #[test]
    fn substitution_uses_raw_text() {
        let parsed = parse("[[SHARED]]\nx\n[[POSITIVE]]\n{{SHARED}}y");
        assert_eq!(parsed.positive, "x\ny");

        // A header with trailing text is not a header: everything is SHARED,
        // and the self-reference expands once.
        let parsed = parse("x[[POSITIVE]]\n{{SHARED}}y");
        assert_eq!(parsed.positive, "x[[POSITIVE]]\nx[[POSITIVE]]\n{{SHARED}}yy");
    }

    #[test]
    fn substitution_is_order_independent() {
        let a = parse("[[SHARED]]\nx\n[[POSITIVE]]\n{{SHARED}}y");
        let b = parse("[[POSITIVE]]\n{{SHARED}}y\n[[SHARED]]\nx\n");
        assert_eq!(a.positive, "x\ny");
        assert_eq!(b.positive, "x\ny\n");
    }

    #[test]
    fn substitution_is_single_pass() {
        let parsed = parse("[[A]]\n{{B}}\n[[B]]\nleaf\n[[POSITIVE]]\n{{A}}");
        assert_eq!(parsed.positive, "{{B}}\n");
    }

    #[test]
    fn unresolved_placeholder_left_verbatim() {
        let parsed = parse("[[POSITIVE]]\nhello {{NOBODY}} and {{ unclosed");
        assert_eq!(parsed.positive, "hello {{NOBODY}} and {{ unclosed");
    }

    #[test]
    fn names_are_case_insensitive() {
        let parsed = parse("[[positive]]\nup\n[[ Negative ]]\ndown\n");
        assert_eq!(parsed.positive, "up\n");
        assert_eq!(parsed.negative, "down\n");
    }

    #[test]
    fn extras_are_collected_in_order() {
        let parsed = parse(
            "[[POSITIVE]]\np\n[[POSITIVE-FORMAL]]\nformal\n[[POSITIVE-CALM]]\ncalm\n\
             [[NEGATIVE-RUDE]]\nrude\n",
        );
        let names: Vec<_> = parsed.positive_extras.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["POSITIVE-FORMAL", "POSITIVE-CALM"]);
        // No NEGATIVE region: the last negative extra is promoted.
        assert_eq!(parsed.negative, "rude\n");
        assert!(parsed.negative_extras.is_empty());
    }

    #[test]
    fn last_positive_extra_promoted_when_no_base() {
        let parsed = parse("[[POSITIVE-A]]\na\n[[POSITIVE-B]]\nb\n");
        assert_eq!(parsed.positive, "b\n");
        assert_eq!(parsed.positive_extras.len(), 1);
        assert_eq!(parsed.positive_extras.get("POSITIVE-A"), Some("a\n"));
    }

    #[test]
    fn duplicate_region_keeps_position_and_last_text() {
        let parsed = parse("[[POSITIVE]]\nfirst\n[[NEGATIVE]]\nn\n[[POSITIVE]]\nsecond\n");
        assert_eq!(parsed.positive, "second\n");
        let names: Vec<_> = parsed.regions.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["POSITIVE", "NEGATIVE"]);
    }

    #[test]
    fn malformed_headers_are_text() {
        let text = "[[]]\nbody\n[[A]] trailing\n[[B\n";
        let parsed = parse(text);
        assert_eq!(parsed.positive, text);
        assert_eq!(parsed.regions.len(), 1);
    }

    #[test]
    fn header_only_context_falls_back_to_whole_text() {
        let text = "[[STYLE]]\nterse\n";
        let parsed = parse(text);
        assert_eq!(parsed.positive, text);
    }

    #[test]
    fn crlf_headers_are_recognised() {
        let parsed = parse("[[POSITIVE]]\r\nyes\r\n[[NEGATIVE]]\r\nno\r\n");
        assert_eq!(parsed.positive, "yes\r\n");
        assert_eq!(parsed.negative, "no\r\n");
    }
}
