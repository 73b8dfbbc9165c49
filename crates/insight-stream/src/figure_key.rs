//! Canonical figure keys.
//!
//! Placeholders written by the model (`[fig_description-Revenue Mix]`) and the
//! keys carried by image events are produced independently, so both sides are
//! reduced to a [`MediaKey`] and every plausible spelling is registered.

use std::fmt;

/// Prefix used by inline figure placeholders.
pub const FIG_DESCRIPTION_PREFIX: &str = "fig_description-";

const BARE_PREFIX: &str = "fig_description";

/// Normalized figure key: trimmed, whitespace-collapsed, smart punctuation
/// replaced and lowercased.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct MediaKey(String);

impl MediaKey {
    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalizes a raw key. Returns `None` when nothing is left.
pub fn normalize(key: &str) -> Option<MediaKey> {
    let mut out = String::with_capacity(key.len());
    for word in key.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        for ch in word.chars() {
            match ch {
                '\u{2018}' | '\u{2019}' => out.push('\''),
                '\u{201C}' | '\u{201D}' => out.push('"'),
                '\u{2013}' | '\u{2014}' => out.push('-'),
                other => out.extend(other.to_lowercase()),
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(MediaKey(out))
    }
}

/// Returns the de-duplicated lookup candidates for a raw key, in order:
/// the key itself, the key without a `fig_description` prefix, and the key
/// with the canonical `fig_description-` prefix.
pub fn candidates(raw_key: &str) -> Vec<MediaKey> {
    let stripped = strip_prefix(raw_key);
    let prefixed = format!("{FIG_DESCRIPTION_PREFIX}{stripped}");

    let mut keys: Vec<MediaKey> = Vec::with_capacity(3);
    for key in [
        normalize(raw_key),
        normalize(stripped),
        normalize(&prefixed),
    ]
    .into_iter()
    .flatten()
    {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

fn strip_prefix(raw_key: &str) -> &str {
    let key = raw_key.trim_start();
    for prefix in [FIG_DESCRIPTION_PREFIX, BARE_PREFIX] {
        if let Some(head) = key.get(..prefix.len())
            && head.eq_ignore_ascii_case(prefix)
        {
            return &key[prefix.len()..];
        }
    }
    raw_key
}
