//! Console output filters

use std::ops::Range;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Lines containing any of these are treated as errors
const ERROR_KEYWORDS: &[&str] = &[
    "error",
    "exception",
    "fatal",
    "warning",
    "warn",
    "failed",
    "failure",
    "critical",
    "panic",
    "stack trace",
    "traceback",
];

/// Keywords that get highlighted, first listed wins
const HIGHLIGHT_KEYWORDS: &[&str] = &["error", "exception", "fatal", "warning", "warn", "failed"];

/// Outcome of filtering one line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterMatch {
    pub included: bool,
    /// Byte range to highlight
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight: Option<Range<usize>>,
}

impl FilterMatch {
    fn include() -> Self {
        Self {
            included: true,
            highlight: None,
        }
    }

    fn exclude() -> Self {
        Self {
            included: false,
            highlight: None,
        }
    }

    fn highlighted(range: Range<usize>) -> Self {
        Self {
            included: true,
            highlight: Some(range),
        }
    }
}

/// Serializable filter request, as sent by a viewer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FilterRequest {
    #[default]
    None,
    Errors,
    Search {
        pattern: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    Regex {
        pattern: String,
        #[serde(default)]
        case_sensitive: bool,
    },
}

/// Compiled output filter
#[derive(Debug, Clone)]
pub enum OutputFilter {
    None,
    ErrorKeywords,
    Search {
        pattern: String,
        case_sensitive: bool,
    },
    Regex(Regex),
}

impl OutputFilter {
    /// Compile a request. Only an invalid regex can fail. An empty regex pattern matches everything.
    pub fn compile(request: &FilterRequest) -> Result<Self, regex::Error> {
        Ok(match request {
            FilterRequest::None => OutputFilter::None,
            FilterRequest::Errors => OutputFilter::ErrorKeywords,
            FilterRequest::Search {
                pattern,
                case_sensitive,
            } => OutputFilter::Search {
                pattern: pattern.clone(),
                case_sensitive: *case_sensitive,
            },
            FilterRequest::Regex { pattern, .. } if pattern.is_empty() => OutputFilter::None,
            FilterRequest::Regex {
                pattern,
                case_sensitive,
            } => OutputFilter::Regex(
                RegexBuilder::new(pattern)
                    .case_insensitive(!case_sensitive)
                    .build()?,
            ),
        })
    }

    pub fn apply(&self, line: &str) -> FilterMatch {
        match self {
            OutputFilter::None => FilterMatch::include(),
            OutputFilter::ErrorKeywords => {
                let lower = line.to_ascii_lowercase();
                if !ERROR_KEYWORDS.iter().any(|k| lower.contains(k)) {
                    return FilterMatch::exclude();
                }
                HIGHLIGHT_KEYWORDS
                    .iter()
                    .find_map(|k| lower.find(k).map(|idx| idx..idx + k.len()))
                    .map_or_else(FilterMatch::include, FilterMatch::highlighted)
            }
            OutputFilter::Search {
                pattern,
                case_sensitive,
            } => {
                if pattern.is_empty() {
                    return FilterMatch::include();
                }
                let found = if *case_sensitive {
                    line.find(pattern.as_str())
                } else {
                    line.to_ascii_lowercase()
                        .find(&pattern.to_ascii_lowercase())
                };
                match found {
                    Some(idx) => FilterMatch::highlighted(idx..idx + pattern.len()),
                    None => FilterMatch::exclude(),
                }
            }
            OutputFilter::Regex(re) => match re.find(line) {
                Some(m) => FilterMatch::highlighted(m.range()),
                None => FilterMatch::exclude(),
            },
        }
    }

    /// Keep only included lines
    pub fn filter_lines(&self, lines: Vec<String>) -> Vec<String> {
        if matches!(self, OutputFilter::None) {
            return lines;
        }
        lines
            .into_iter()
            .filter(|line| self.apply(line).included)
            .collect()
    }
}
