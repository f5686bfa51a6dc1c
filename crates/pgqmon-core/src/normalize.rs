//! Normalization of SQL text into canonical signatures.
//!
//! Replaces literal values and positional parameters with placeholders so
//! that `WHERE id = $1` and `WHERE id = $5`, or `IN ($1,$2,$3)` and
//! `IN ($7,$8)`, map to the same signature. This is a lexical pass, not a
//! parser: anything it cannot scan is passed through unchanged.
//!
//! Normalization is deterministic but not idempotent. For example a
//! statement ending in `;;` loses one terminator per pass.

use std::sync::LazyLock;

use regex::{NoExpand, Regex};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

pub const STRING_PLACEHOLDER: &str = "'?'";
pub const NUMBER_PLACEHOLDER: &str = "?";
pub const PARAM_PLACEHOLDER: &str = "$?";
pub const LIST_PLACEHOLDER: &str = "in (...)";

/// A bare number not glued to an identifier or a `$n` marker.
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^\w$])\d+(?:\.\d+)?\b").expect("static regex")
});

/// `in (...)` over parameter markers or literal placeholders.
static IN_LIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bin\s*\(\s*(?:\$\d+|\?|'\?')(?:\s*,\s*(?:\$\d+|\?|'\?'))*\s*\)")
        .expect("static regex")
});

static PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\d+").expect("static regex"));

#[derive(Debug, PartialEq, Eq)]
enum NormalizationError {
    /// Opening quote at the given byte offset is never closed.
    UnterminatedLiteral(usize),
    UnterminatedIdentifier(usize),
}

/// Normalizes raw SQL text into its canonical signature.
///
/// Never fails: text that cannot be scanned (for example an unterminated
/// string literal) is returned unchanged.
pub fn normalize_query(raw: &str) -> String {
    match try_normalize(raw) {
        Ok(normalized) => normalized,
        Err(e) => {
            debug!(error = ?e, "query text left unnormalized");
            raw.to_string()
        }
    }
}

/// Stable hex digest of a normalized text. Also used for raw query text.
pub fn query_hash(text: &str) -> String {
    format!("{:016x}", xxh3_64(text.as_bytes()))
}

/// Normalized text truncated to `len` characters, used to match running
/// queries against a continuous kill target.
pub fn signature(raw: &str, len: usize) -> String {
    truncate_chars(&normalize_query(raw), len)
}

pub(crate) fn truncate_chars(s: &str, len: usize) -> String {
    match s.char_indices().nth(len) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

fn try_normalize(raw: &str) -> Result<String, NormalizationError> {
    let mut s = collapse_whitespace(raw).to_lowercase();
    if let Some(stripped) = s.strip_suffix(';') {
        s = stripped.trim_end().to_string();
    }

    let s = replace_string_literals(&s)?;

    // Every `"` left delimits an identifier: odd segments are quoted names.
    let mut out = String::with_capacity(s.len());
    for (i, part) in s.split('"').enumerate() {
        if i > 0 {
            out.push('"');
        }
        if i % 2 == 1 {
            out.push_str(part);
        } else {
            out.push_str(&replace_values(part));
        }
    }
    Ok(out)
}

/// Numbers, `in` lists and positional parameters of unquoted SQL.
fn replace_values(s: &str) -> String {
    let s = NUMBER_RE.replace_all(s, "${1}?");
    let s = IN_LIST_RE.replace_all(&s, NoExpand(LIST_PLACEHOLDER));
    PARAM_RE.replace_all(&s, NoExpand(PARAM_PLACEHOLDER)).into_owned()
}

/// Trims and collapses every whitespace run to a single space.
fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for word in s.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Replaces `'...'` literals (with `''` escapes) by a placeholder.
/// Double-quoted identifiers are copied verbatim.
fn replace_string_literals(s: &str) -> Result<String, NormalizationError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        match c {
            '\'' => {
                loop {
                    match chars.next() {
                        Some((_, '\'')) => {
                            if matches!(chars.peek(), Some((_, '\''))) {
                                chars.next();
                                continue;
                            }
                            break;
                        }
                        Some(_) => {}
                        None => return Err(NormalizationError::UnterminatedLiteral(start)),
                    }
                }
                out.push_str(STRING_PLACEHOLDER);
            }
            '"' => {
                out.push('"');
                loop {
                    match chars.next() {
                        Some((_, '"')) => {
                            out.push('"');
                            break;
                        }
                        Some((_, inner)) => out.push(inner),
                        None => return Err(NormalizationError::UnterminatedIdentifier(start)),
                    }
                }
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}
