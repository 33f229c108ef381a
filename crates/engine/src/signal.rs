//! Signal extractor: derives a WIP verdict from a pull request snapshot.
//!
//! Two independent signals are checked, title first:
//!
//! 1. **Title**: any configured [`TitlePattern`] matches the title
//!    (case-insensitive; anywhere, or prefix-only with
//!    [`TitleMatchMode::Prefix`]).
//! 2. **Label**: any label on the pull request is a configured WIP label
//!    (case-insensitive).
//!
//! Either signal alone makes the pull request a work in progress. When both
//! fire the title is reported as the matched signal; that choice only affects
//! diagnostics.
//!
//! [`evaluate`] is pure: no I/O, no clock, no shared state.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::{RepositoryConfig, TitleMatchMode};
use crate::{PatternError, PullRequestSnapshot};

/// Title markers used when a repository configures none.
pub const DEFAULT_TITLE_PATTERNS: &[&str] = &["wip", "[wip]", "🚧", "do not merge"];

/// Label names used when a repository configures none.
pub const DEFAULT_WIP_LABELS: &[&str] = &["wip"];

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Which signal decided the verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "kebab-case")]
pub enum MatchedSignal {
    /// A title pattern matched.
    TitlePattern {
        /// The pattern as configured.
        pattern: String,
    },
    /// A WIP label is present.
    Label {
        /// The label name as it appears on the pull request.
        name: String,
    },
    /// Nothing matched.
    None,
}

/// The outcome of [`evaluate`]. Derived per event, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipVerdict {
    /// `true` when at least one signal fired.
    pub is_wip: bool,
    /// The signal that fired, for diagnostics.
    pub matched: MatchedSignal,
}

impl WipVerdict {
    /// A verdict for a pull request with no WIP signal.
    pub fn ready() -> Self {
        Self {
            is_wip: false,
            matched: MatchedSignal::None,
        }
    }

    fn from_signal(matched: MatchedSignal) -> Self {
        Self {
            is_wip: !matches!(matched, MatchedSignal::None),
            matched,
        }
    }
}

// ---------------------------------------------------------------------------
// Title patterns
// ---------------------------------------------------------------------------

/// One title marker.
///
/// Written as plain text it is a literal, matched case-insensitively on token
/// boundaries: an alphanumeric first (last) character of the marker must not
/// be preceded (followed) by another alphanumeric character, so `wip` matches
/// `"WIP: login"` but not `"Swipe support"`. Written as `/…/` it is a
/// case-insensitive regular expression.
///
/// No Unicode normalisation is applied: `🚧` only matches that exact code point
/// sequence.
#[derive(Debug, Clone)]
pub struct TitlePattern {
    source: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    /// Lowercased marker.
    Literal(String),
    Regex(Regex),
}

impl TitlePattern {
    /// Parses a configured pattern.
    ///
    /// # Errors
    ///
    /// [`PatternError::Empty`] for blank patterns and `//`;
    /// [`PatternError::InvalidRegex`] for `/…/` patterns that do not compile.
    pub fn parse(source: &str) -> Result<Self, PatternError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Empty);
        }

        let regex_body = (trimmed.len() >= 2)
            .then(|| trimmed.strip_prefix('/').and_then(|s| s.strip_suffix('/')))
            .flatten();

        let matcher = match regex_body {
            Some("") => return Err(PatternError::Empty),
            Some(body) => {
                let regex = RegexBuilder::new(body)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| PatternError::InvalidRegex {
                        pattern: trimmed.to_string(),
                        message: e.to_string(),
                    })?;
                Matcher::Regex(regex)
            }
            None => Matcher::Literal(trimmed.to_lowercase()),
        };

        Ok(Self {
            source: trimmed.to_string(),
            matcher,
        })
    }

    fn literal(marker: &str) -> Self {
        Self {
            source: marker.to_string(),
            matcher: Matcher::Literal(marker.to_lowercase()),
        }
    }

    /// The pattern as configured.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// `lowered` must be `title.to_lowercase()`; passed in so callers checking
    /// several patterns lowercase the title once.
    fn is_match(&self, title: &str, lowered: &str, mode: TitleMatchMode) -> bool {
        match &self.matcher {
            Matcher::Literal(marker) => {
                let haystack = match mode {
                    TitleMatchMode::Anywhere => lowered,
                    TitleMatchMode::Prefix => lowered.trim_start(),
                };
                literal_match(haystack, marker, mode)
            }
            Matcher::Regex(regex) => match mode {
                TitleMatchMode::Anywhere => regex.is_match(title),
                // The leftmost match starts at 0 iff any match does.
                TitleMatchMode::Prefix => regex
                    .find(title.trim_start())
                    .is_some_and(|m| m.start() == 0),
            },
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn literal_match(haystack: &str, marker: &str, mode: TitleMatchMode) -> bool {
    let guard_left = marker.chars().next().is_some_and(is_word_char);
    let guard_right = marker.chars().next_back().is_some_and(is_word_char);

    let mut from = 0;
    while let Some(offset) = haystack[from..].find(marker) {
        let start = from + offset;
        if mode == TitleMatchMode::Prefix && start != 0 {
            return false;
        }
        let end = start + marker.len();

        let left_ok = !guard_left
            || haystack[..start]
                .chars()
                .next_back()
                .is_none_or(|c| !is_word_char(c));
        let right_ok = !guard_right
            || haystack[end..]
                .chars()
                .next()
                .is_none_or(|c| !is_word_char(c));
        if left_ok && right_ok {
            return true;
        }

        // Step one character so overlapping occurrences are still examined.
        from = start
            + haystack[start..]
                .chars()
                .next()
                .map_or(1, char::len_utf8);
    }
    false
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// The compiled signal set for one repository.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    title_patterns: Vec<TitlePattern>,
    /// Lowercased.
    wip_labels: Vec<String>,
    title_match: TitleMatchMode,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            title_patterns: default_title_patterns(),
            wip_labels: DEFAULT_WIP_LABELS.iter().map(|l| l.to_lowercase()).collect(),
            title_match: TitleMatchMode::default(),
        }
    }
}

fn default_title_patterns() -> Vec<TitlePattern> {
    DEFAULT_TITLE_PATTERNS
        .iter()
        .map(|marker| TitlePattern::literal(marker))
        .collect()
}

impl SignalConfig {
    /// Builds a signal set from already-parsed parts.
    pub fn new(
        title_patterns: Vec<TitlePattern>,
        wip_labels: impl IntoIterator<Item = impl AsRef<str>>,
        title_match: TitleMatchMode,
    ) -> Self {
        Self {
            title_patterns,
            wip_labels: normalise_labels(wip_labels),
            title_match,
        }
    }

    /// Compiles a repository's configuration.
    ///
    /// Absent fields take the defaults. If any title pattern is unusable the
    /// whole title set falls back to [`DEFAULT_TITLE_PATTERNS`] and the
    /// problems are returned alongside the config so the caller can report
    /// them; a bad pattern never fails the event.
    pub fn from_repository(config: &RepositoryConfig) -> (Self, Vec<PatternError>) {
        let mut issues = Vec::new();

        let title_patterns = match &config.title_patterns {
            None => default_title_patterns(),
            Some(raw) => {
                let mut parsed = Vec::with_capacity(raw.len());
                for pattern in raw {
                    match TitlePattern::parse(pattern) {
                        Ok(p) => parsed.push(p),
                        Err(e) => issues.push(e),
                    }
                }
                if issues.is_empty() {
                    parsed
                } else {
                    default_title_patterns()
                }
            }
        };

        let wip_labels = match &config.wip_labels {
            None => normalise_labels(DEFAULT_WIP_LABELS),
            Some(raw) => normalise_labels(raw),
        };

        let config = Self {
            title_patterns,
            wip_labels,
            title_match: config.title_match.unwrap_or_default(),
        };
        (config, issues)
    }

    /// The configured title patterns, as written.
    pub fn title_patterns(&self) -> impl Iterator<Item = &str> {
        self.title_patterns.iter().map(TitlePattern::as_str)
    }

    /// The configured WIP labels, lowercased.
    pub fn wip_labels(&self) -> &[String] {
        &self.wip_labels
    }

    /// Where title patterns may match.
    pub fn title_match(&self) -> TitleMatchMode {
        self.title_match
    }
}

fn normalise_labels(labels: impl IntoIterator<Item = impl AsRef<str>>) -> Vec<String> {
    labels
        .into_iter()
        .map(|l| l.as_ref().to_lowercase())
        .filter(|l| !l.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Computes the WIP verdict for `snapshot` under `config`.
pub fn evaluate(snapshot: &PullRequestSnapshot, config: &SignalConfig) -> WipVerdict {
    if let Some(pattern) = title_signal(&snapshot.title, config) {
        return WipVerdict::from_signal(MatchedSignal::TitlePattern {
            pattern: pattern.as_str().to_string(),
        });
    }
    if let Some(label) = label_signal(&snapshot.labels, config) {
        return WipVerdict::from_signal(MatchedSignal::Label {
            name: label.to_string(),
        });
    }
    WipVerdict::ready()
}

fn title_signal<'c>(title: &str, config: &'c SignalConfig) -> Option<&'c TitlePattern> {
    if title.is_empty() {
        return None;
    }
    let lowered = title.to_lowercase();
    config
        .title_patterns
        .iter()
        .find(|p| p.is_match(title, &lowered, config.title_match))
}

fn label_signal<'l>(labels: &'l [String], config: &SignalConfig) -> Option<&'l str> {
    labels
        .iter()
        .find(|label| config.wip_labels.contains(&label.to_lowercase()))
        .map(String::as_str)
}
