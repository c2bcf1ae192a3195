//! Rule fact extraction.
//!
//! Rule text is opaque except for directive comments:
//!
//! ```text
//! <!-- nomic: win_score = 200 -->
//! <!-- nomic: majority_after_circuits = 3 -->
//! ```
//!
//! Only whitelisted keys are read. Declaring a key twice with different
//! values makes the rules self-contradictory, which halts the game.

use std::collections::BTreeMap;
use thiserror::Error;

const DIRECTIVE_OPEN: &str = "<!--";
const DIRECTIVE_CLOSE: &str = "-->";
const DIRECTIVE_TAG: &str = "nomic:";

/// Errors that make the rule text impossible to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// A key was declared with two different values
    #[error("paradox: {key} is both {first} and {second}")]
    Paradox {
        key: String,
        first: String,
        second: String,
    },

    /// A whitelisted key carries a value of the wrong type
    #[error("{key} must be a non-negative integer, got {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Whitelisted facts read from the rules. `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleFacts {
    pub win_score: Option<u64>,
    pub majority_after_circuits: Option<u32>,
}

/// Extract whitelisted facts from rule text.
pub fn extract(text: &str) -> Result<RuleFacts, ExtractError> {
    let mut seen: BTreeMap<String, String> = BTreeMap::new();

    for (key, value) in directives(text) {
        match seen.get(&key) {
            Some(first) if *first != value => {
                return Err(ExtractError::Paradox {
                    key,
                    first: first.clone(),
                    second: value,
                });
            }
            Some(_) => {}
            None => {
                seen.insert(key, value);
            }
        }
    }

    let mut facts = RuleFacts::default();
    for (key, value) in &seen {
        match key.as_str() {
            "win_score" => facts.win_score = Some(parse(key, value)?),
            "majority_after_circuits" => facts.majority_after_circuits = Some(parse(key, value)?),
            other => tracing::warn!(key = other, "Ignoring unknown rule directive"),
        }
    }
    Ok(facts)
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ExtractError> {
    value.parse().map_err(|_| ExtractError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// `(key, value)` pairs of every `<!-- nomic: key = value -->` comment.
fn directives(text: &str) -> impl Iterator<Item = (String, String)> + '_ {
    let mut rest = text;
    std::iter::from_fn(move || loop {
        let start = rest.find(DIRECTIVE_OPEN)?;
        let after = &rest[start + DIRECTIVE_OPEN.len()..];
        let end = after.find(DIRECTIVE_CLOSE)?;
        let body = after[..end].trim();
        rest = &after[end + DIRECTIVE_CLOSE.len()..];

        let Some(body) = body.strip_prefix(DIRECTIVE_TAG) else {
            continue;
        };
        if let Some((key, value)) = body.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                return Some((key.to_string(), value.trim().to_string()));
            }
        }
    })
}
