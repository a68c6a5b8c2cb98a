//! Test catalog: which stacks to compare and how to run them.
//!
//! ```toml
//! [defaults]
//! base = "nose Cython"
//! parser = "nose"
//!
//! [scipy-dev]
//! old = "numpy==1.7.1"
//! new = "git+https://github.com/numpy/numpy.git@main"
//! run = "python -c 'import scipy; scipy.test()'"
//! ```
//!
//! Every top-level table except `[defaults]` names one test. Keys missing
//! from a test table are taken from `[defaults]`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::parser::{Dialect, UnknownDialect};

/// Table holding fallback values.
pub const DEFAULTS_TABLE: &str = "defaults";

/// Errors raised while loading a catalog or selecting tests.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogError {
    /// The catalog file could not be read.
    #[error("failed to read catalog {}: {source}", path.display())]
    Io {
        /// Catalog path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Invalid TOML or unknown keys.
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required key is absent from both the test and `[defaults]`.
    #[error("test '{test}': missing key '{key}'")]
    MissingKey {
        /// Test name.
        test: String,
        /// Missing key.
        key: &'static str,
    },

    /// The `parser` key names no known dialect.
    #[error("test '{test}': {source}")]
    UnknownDialect {
        /// Test name.
        test: String,
        /// Resolution error.
        source: UnknownDialect,
    },

    /// The test name cannot be used as a file-name component.
    #[error("invalid test name '{0}': use ASCII letters, digits, '-', '_' and '.'")]
    InvalidName(String),

    /// The selection matched no test.
    #[error("no tests match {}", patterns.join(" "))]
    NothingSelected {
        /// Patterns given on the command line.
        patterns: Vec<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    base: Option<String>,
    old: Option<String>,
    new: Option<String>,
    run: Option<String>,
    parser: Option<String>,
}

/// One catalog entry, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSpec {
    /// Test name; also a file-name component.
    pub name: String,
    /// Installed first in both variants.
    pub base: Vec<String>,
    /// The "old" variant.
    pub old: Vec<String>,
    /// The "new" variant.
    pub new: Vec<String>,
    /// Shell command run inside the environment.
    pub run: String,
    /// Transcript dialect of `run`.
    pub dialect: Dialect,
}

/// All tests of a catalog, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    tests: Vec<TestSpec>,
}

impl Catalog {
    /// Load a catalog file.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Io`] if the file cannot be read, or any
    /// error of [`Catalog::from_toml`].
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a catalog from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid TOML, unknown keys, invalid names,
    /// missing keys or unknown parser names.
    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        let mut raw: BTreeMap<String, RawEntry> = toml::from_str(content)?;
        let defaults = raw.remove(DEFAULTS_TABLE).unwrap_or_default();

        let tests = raw
            .into_iter()
            .map(|(name, entry)| resolve(name, entry, &defaults))
            .collect::<Result<_, _>>()?;
        Ok(Self { tests })
    }

    /// Build a catalog from already resolved entries.
    #[must_use]
    pub fn from_tests(mut tests: Vec<TestSpec>) -> Self {
        tests.sort_by(|a, b| a.name.cmp(&b.name));
        Self { tests }
    }

    /// All tests.
    #[must_use]
    pub fn tests(&self) -> &[TestSpec] {
        &self.tests
    }

    /// Look up a test by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TestSpec> {
        self.tests.iter().find(|t| t.name == name)
    }

    /// Tests matching any of `patterns` (exact names or `*`/`?`
    /// wildcards), in catalog order. No patterns selects everything.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NothingSelected`] when the result is empty.
    pub fn select<S: AsRef<str>>(&self, patterns: &[S]) -> Result<Vec<&TestSpec>, CatalogError> {
        let selected: Vec<&TestSpec> = if patterns.is_empty() {
            self.tests.iter().collect()
        } else {
            for pattern in patterns {
                let pattern = pattern.as_ref();
                if !self.tests.iter().any(|t| wildcard_match(pattern, &t.name)) {
                    tracing::warn!(pattern, "pattern matches no test");
                }
            }
            self.tests
                .iter()
                .filter(|t| patterns.iter().any(|p| wildcard_match(p.as_ref(), &t.name)))
                .collect()
        };

        if selected.is_empty() {
            return Err(CatalogError::NothingSelected {
                patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
            });
        }
        Ok(selected)
    }
}

fn resolve(name: String, entry: RawEntry, defaults: &RawEntry) -> Result<TestSpec, CatalogError> {
    if !is_valid_name(&name) {
        return Err(CatalogError::InvalidName(name));
    }
    let pick = |own: Option<String>, fallback: &Option<String>, key: &'static str| {
        own.or_else(|| fallback.clone())
            .ok_or_else(|| CatalogError::MissingKey {
                test: name.clone(),
                key,
            })
    };

    let base = pick(entry.base, &defaults.base, "base")?;
    let old = pick(entry.old, &defaults.old, "old")?;
    let new = pick(entry.new, &defaults.new, "new")?;
    let run = pick(entry.run, &defaults.run, "run")?;
    let parser = pick(entry.parser, &defaults.parser, "parser")?;
    let dialect = parser
        .trim()
        .parse::<Dialect>()
        .map_err(|source| CatalogError::UnknownDialect {
            test: name.clone(),
            source,
        })?;

    Ok(TestSpec {
        base: split_specs(&base),
        old: split_specs(&old),
        new: split_specs(&new),
        run: run.trim().to_string(),
        dialect,
        name,
    })
}

fn split_specs(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "-_.".contains(ch))
}

/// One element of a compiled glob pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GlobToken {
    /// `*`: any run of characters, including none.
    AnyRun,
    /// `?`: exactly one character.
    AnyOne,
    /// `[...]` or `[!...]`: one character from (or outside) the ranges.
    Class {
        negated: bool,
        ranges: Vec<(char, char)>,
    },
    Literal(char),
}

impl GlobToken {
    fn matches(&self, ch: char) -> bool {
        match self {
            Self::AnyRun | Self::AnyOne => true,
            Self::Class { negated, ranges } => {
                ranges.iter().any(|&(lo, hi)| lo <= ch && ch <= hi) != *negated
            },
            Self::Literal(lit) => *lit == ch,
        }
    }
}

/// Split `pattern` into tokens. A `[` without a closing `]` is literal, and
/// a `]` right after `[` or `[!` belongs to the class.
fn compile_glob(pattern: &str) -> Vec<GlobToken> {
    let p: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::with_capacity(p.len());
    let mut i = 0;
    while i < p.len() {
        match p[i] {
            '*' => tokens.push(GlobToken::AnyRun),
            '?' => tokens.push(GlobToken::AnyOne),
            '[' => {
                if let Some((token, next)) = compile_class(&p, i + 1) {
                    tokens.push(token);
                    i = next;
                    continue;
                }
                tokens.push(GlobToken::Literal('['));
            },
            ch => tokens.push(GlobToken::Literal(ch)),
        }
        i += 1;
    }
    tokens
}

/// Class body starting at `p[start]`; returns the token and the index
/// after the closing `]`.
fn compile_class(p: &[char], start: usize) -> Option<(GlobToken, usize)> {
    let mut i = start;
    let negated = matches!(p.get(i), Some('!'));
    if negated {
        i += 1;
    }
    let body_start = i;
    let mut ranges = Vec::new();
    loop {
        let ch = *p.get(i)?;
        if ch == ']' && i > body_start {
            return Some((GlobToken::Class { negated, ranges }, i + 1));
        }
        match (p.get(i + 1), p.get(i + 2)) {
            (Some('-'), Some(&hi)) if hi != ']' => {
                ranges.push((ch, hi));
                i += 3;
            },
            _ => {
                ranges.push((ch, ch));
                i += 1;
            },
        }
    }
}

/// Shell-glob match of `text` against `pattern`: `*` matches any run of
/// characters, `?` exactly one, `[abc]`, `[a-z]` and `[!...]` one
/// character from (or outside) a set. Everything else is literal.
#[must_use]
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p = compile_glob(pattern);
    let t: Vec<char> = text.chars().collect();

    let mut dp = vec![vec![false; t.len() + 1]; p.len() + 1];
    dp[0][0] = true;
    for i in 1..=p.len() {
        if p[i - 1] == GlobToken::AnyRun {
            dp[i][0] = dp[i - 1][0];
        }
    }

    for i in 1..=p.len() {
        for j in 1..=t.len() {
            dp[i][j] = match &p[i - 1] {
                GlobToken::AnyRun => dp[i - 1][j] || dp[i][j - 1],
                token => token.matches(t[j - 1]) && dp[i - 1][j - 1],
            };
        }
    }

    dp[p.len()][t.len()]
}
