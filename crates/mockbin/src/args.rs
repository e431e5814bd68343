// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Argument patterns and the positional matcher behind expectations.
//!
//! Expectations match the argument vector *after* argv[0]; the dispatcher
//! strips the program name before consulting the set, and `Call::args` keeps
//! the full vector for handlers that want it.

use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Outcome of matching an argument vector against a pattern.
///
/// `match_count` measures literal-character agreement and is only used to
/// rank near-misses when nothing matched exactly; `explanation` names the
/// first failing position.
#[derive(Debug, Clone, Default)]
pub struct ArgumentsMatchResult {
    pub is_match: bool,
    pub match_count: usize,
    pub explanation: String,
}

/// One positional pattern atom.
#[derive(Clone)]
pub enum Matcher {
    /// Exact string equality.
    Literal(String),
    /// Any single argument.
    Any,
    /// Accepts every remaining argument; only meaningful in last position.
    AnyRemaining,
    /// Regular expression match.
    Pattern(Regex),
    /// User predicate with a human-readable description.
    Func {
        description: String,
        f: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    },
}

/// Matches any single argument.
pub fn match_any() -> Matcher {
    Matcher::Any
}

/// Matches every remaining argument; place it last in the pattern.
pub fn match_any_remaining() -> Matcher {
    Matcher::AnyRemaining
}

/// Matches an argument against a regular expression.
///
/// # Panics
///
/// Panics when `pattern` is not a valid regular expression, since patterns
/// are written inline in test code.
pub fn match_pattern(pattern: &str) -> Matcher {
    match Regex::new(pattern) {
        Ok(re) => Matcher::Pattern(re),
        Err(err) => panic!("invalid pattern {pattern:?}: {err}"),
    }
}

/// Matches an argument with a predicate; `description` shows up in
/// diagnostics and in the stable string form of the pattern.
pub fn match_fn(
    description: impl Into<String>,
    f: impl Fn(&str) -> bool + Send + Sync + 'static,
) -> Matcher {
    Matcher::Func {
        description: description.into(),
        f: Arc::new(f),
    }
}

impl Matcher {
    pub(crate) fn accepts(&self, actual: &str) -> bool {
        match self {
            Matcher::Literal(expected) => expected == actual,
            Matcher::Any | Matcher::AnyRemaining => true,
            Matcher::Pattern(re) => re.is_match(actual),
            Matcher::Func { f, .. } => f(actual),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Literal(s) => write!(f, "{s:?}"),
            Matcher::Any => f.write_str("*"),
            Matcher::AnyRemaining => f.write_str("..."),
            Matcher::Pattern(re) => f.write_str(re.as_str()),
            Matcher::Func { description, .. } => f.write_str(description),
        }
    }
}

impl From<&str> for Matcher {
    fn from(s: &str) -> Self {
        Matcher::Literal(s.to_owned())
    }
}

impl From<String> for Matcher {
    fn from(s: String) -> Self {
        Matcher::Literal(s)
    }
}

impl From<&String> for Matcher {
    fn from(s: &String) -> Self {
        Matcher::Literal(s.clone())
    }
}

type HolisticFn = Arc<dyn Fn(&[String]) -> ArgumentsMatchResult + Send + Sync>;

#[derive(Clone)]
struct Holistic {
    description: String,
    f: HolisticFn,
}

/// An ordered argument pattern: one matcher atom per position, or a holistic
/// predicate over the whole vector.
#[derive(Clone, Default)]
pub struct Arguments {
    matchers: Vec<Matcher>,
    holistic: Option<Holistic>,
}

impl Arguments {
    pub fn new(matchers: Vec<Matcher>) -> Self {
        Arguments {
            matchers,
            holistic: None,
        }
    }

    /// Accepts any argument vector, including an empty one.
    pub(crate) fn any() -> Self {
        Self::default().with_holistic("*", |actual| ArgumentsMatchResult {
            is_match: true,
            match_count: actual.len(),
            explanation: String::new(),
        })
    }

    pub(crate) fn with_holistic(
        mut self,
        description: impl Into<String>,
        f: impl Fn(&[String]) -> ArgumentsMatchResult + Send + Sync + 'static,
    ) -> Self {
        self.holistic = Some(Holistic {
            description: description.into(),
            f: Arc::new(f),
        });
        self
    }

    /// Positional match of `actual` against this pattern.
    pub fn match_against(&self, actual: &[String]) -> ArgumentsMatchResult {
        if let Some(holistic) = &self.holistic {
            return (holistic.f)(actual);
        }

        let mut match_count = 0;
        let last = self.matchers.len().saturating_sub(1);
        for (i, matcher) in self.matchers.iter().enumerate() {
            if matches!(matcher, Matcher::AnyRemaining) && i == last {
                return ArgumentsMatchResult {
                    is_match: true,
                    match_count: match_count + 1,
                    explanation: String::new(),
                };
            }

            let Some(actual_arg) = actual.get(i) else {
                return ArgumentsMatchResult {
                    is_match: false,
                    match_count,
                    explanation: format!(
                        "Argument #{} doesn't match: Expected {matcher}, but missing an argument",
                        i + 1
                    ),
                };
            };

            match matcher {
                Matcher::Literal(expected) => {
                    let (chars, expected_rest, actual_rest) =
                        split_common_prefix(expected, actual_arg);
                    match_count += chars;
                    if expected != actual_arg {
                        return ArgumentsMatchResult {
                            is_match: false,
                            match_count,
                            explanation: format!(
                                "Argument #{} doesn't match: Differs at character {}, expected {expected_rest:?}, got {actual_rest:?}",
                                i + 1,
                                chars + 1
                            ),
                        };
                    }
                }
                other => {
                    if other.accepts(actual_arg) {
                        match_count += 1;
                    } else {
                        return ArgumentsMatchResult {
                            is_match: false,
                            match_count,
                            explanation: format!(
                                "Argument #{} doesn't match: Expected {other}, got {actual_arg:?}",
                                i + 1
                            ),
                        };
                    }
                }
            }
        }

        if actual.len() > self.matchers.len() {
            return ArgumentsMatchResult {
                is_match: false,
                match_count,
                explanation: format!(
                    "Argument #{} doesn't match: Unexpected extra argument",
                    self.matchers.len() + 1
                ),
            };
        }

        ArgumentsMatchResult {
            is_match: true,
            match_count,
            explanation: String::new(),
        }
    }
}

impl fmt::Display for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(holistic) = &self.holistic {
            return f.write_str(&holistic.description);
        }
        let mut first = true;
        for matcher in &self.matchers {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{matcher}")?;
            first = false;
        }
        Ok(())
    }
}

impl fmt::Debug for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<()> for Arguments {
    fn from((): ()) -> Self {
        Arguments::default()
    }
}

impl<M: Into<Matcher>, const N: usize> From<[M; N]> for Arguments {
    fn from(matchers: [M; N]) -> Self {
        Arguments::new(matchers.into_iter().map(Into::into).collect())
    }
}

impl<M: Into<Matcher> + Clone> From<&[M]> for Arguments {
    fn from(matchers: &[M]) -> Self {
        Arguments::new(matchers.iter().cloned().map(Into::into).collect())
    }
}

impl<M: Into<Matcher>> From<Vec<M>> for Arguments {
    fn from(matchers: Vec<M>) -> Self {
        Arguments::new(matchers.into_iter().map(Into::into).collect())
    }
}

/// Character-wise common prefix; returns the prefix length in characters and
/// the two remainders.
fn split_common_prefix<'a>(expected: &'a str, actual: &'a str) -> (usize, &'a str, &'a str) {
    let mut chars = 0;
    let mut expected_rest = expected;
    let mut actual_rest = actual;
    let mut expected_iter = expected.char_indices();
    let mut actual_iter = actual.char_indices();
    loop {
        match (expected_iter.next(), actual_iter.next()) {
            (Some((ei, ec)), Some((ai, ac))) if ec == ac => {
                chars += 1;
                expected_rest = &expected[ei + ec.len_utf8()..];
                actual_rest = &actual[ai + ac.len_utf8()..];
            }
            _ => break,
        }
    }
    (chars, expected_rest, actual_rest)
}
