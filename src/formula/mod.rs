//! Calculated-indicator formulas.
//!
//! A formula is an infix arithmetic expression over indicator IDs, e.g.
//! `"malaria_cases / population * 1000"`. This module extracts the IDs a
//! formula references, decides whether a formula is usable, and parses it into
//! a post-aggregation tree.

mod parser;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

pub use parser::parse_formula;

/// Identifier-like tokens: a letter followed by letters, digits or underscores.
///
/// The leading word boundary stops number fragments such as the `e5` in `1e5`
/// from being read as identifiers.
pub(crate) static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z][A-Za-z0-9_]*").unwrap());

/// Marker used in deployment configs for formulas still waiting on real data.
pub const DEFAULT_PLACEHOLDER_MARKER: &str = "XXX";

/// Errors describing why a formula cannot be compiled.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormulaError {
    #[error("Formula '{formula}' references no indicators")]
    NoTokens { formula: String },

    #[error("Formula '{formula}' contains placeholder marker '{marker}'")]
    PlaceholderMarker { formula: String, marker: String },

    #[error("Formula '{formula}' could not be parsed: {message}")]
    Syntax { formula: String, message: String },

    #[error("Formula '{formula}' uses unsupported construct '{construct}'")]
    Unsupported { formula: String, construct: String },
}

pub type FormulaResult<T> = Result<T, FormulaError>;

/// Extract the set of identifier tokens (constituent IDs) in `formula`.
pub fn tokenize(formula: &str) -> BTreeSet<String> {
    TOKEN_PATTERN
        .find_iter(formula)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Accepts or rejects formulas before compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaValidator {
    placeholder_markers: Vec<String>,
}

impl Default for FormulaValidator {
    fn default() -> Self {
        Self::new([DEFAULT_PLACEHOLDER_MARKER])
    }
}

impl FormulaValidator {
    pub fn new<I, S>(placeholder_markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            placeholder_markers: placeholder_markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.is_empty())
                .collect(),
        }
    }

    /// Check `formula` and return its constituent tokens.
    ///
    /// Rejects formulas with no tokens and formulas containing any configured
    /// placeholder marker.
    pub fn validate(&self, formula: &str) -> FormulaResult<BTreeSet<String>> {
        if let Some(marker) = self
            .placeholder_markers
            .iter()
            .find(|marker| formula.contains(marker.as_str()))
        {
            return Err(FormulaError::PlaceholderMarker {
                formula: formula.to_string(),
                marker: marker.clone(),
            });
        }

        let tokens = tokenize(formula);
        if tokens.is_empty() {
            return Err(FormulaError::NoTokens {
                formula: formula.to_string(),
            });
        }
        Ok(tokens)
    }

    pub fn is_valid(&self, formula: &str) -> bool {
        self.validate(formula).is_ok()
    }
}

/// [`FormulaValidator::is_valid`] with the default placeholder marker.
pub fn is_valid(formula: &str) -> bool {
    FormulaValidator::default().is_valid(formula)
}
