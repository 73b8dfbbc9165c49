use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::figure_key::{self, MediaKey};

static HTTP_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://").expect("valid http regex"));
static BASE64_BODY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/]+={0,2}$").expect("valid base64 regex"));

const MIN_BASE64_LEN: usize = 100;

/// Turns a raw media reference from an image event into a renderable URI.
///
/// Total function: unknown shapes pass through unchanged and only an absent
/// or empty reference yields `None`.
pub fn resolve_media_uri(raw: Option<&str>, base_url: &str) -> Option<String> {
    let raw = raw.filter(|r| !r.is_empty())?;

    if raw.starts_with("data:image/") || HTTP_URL.is_match(raw) {
        return Some(raw.to_string());
    }
    if raw.starts_with('/') {
        return Some(format!("{}{raw}", base_url.trim_end_matches('/')));
    }
    if looks_like_base64(raw) {
        return Some(format!("data:image/png;base64,{raw}"));
    }
    if raw.starts_with("base64,") {
        return Some(format!("data:image/png;{raw}"));
    }
    Some(raw.to_string())
}

fn looks_like_base64(raw: &str) -> bool {
    raw.len() >= MIN_BASE64_LEN
        && !raw.chars().any(char::is_whitespace)
        && BASE64_BODY.is_match(raw)
}

/// Per-request map from normalized figure keys to resolved image URIs.
///
/// The first registration of a key wins; later registrations of the same
/// key and empty URIs are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MediaRegistry {
    entries: BTreeMap<MediaKey, String>,
}

impl MediaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every candidate spelling of `raw_key` for `uri`.
    ///
    /// Returns the keys that were newly inserted.
    pub fn register(&mut self, raw_key: &str, uri: &str) -> Vec<MediaKey> {
        if uri.trim().is_empty() {
            return Vec::new();
        }
        let mut inserted = Vec::new();
        for key in figure_key::candidates(raw_key) {
            if self.entries.contains_key(&key) {
                continue;
            }
            self.entries.insert(key.clone(), uri.to_string());
            inserted.push(key);
        }
        inserted
    }

    pub fn get(&self, key: &MediaKey) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Looks up the candidates of `raw_key` in order and returns the first hit.
    pub fn lookup(&self, raw_key: &str) -> Option<&str> {
        figure_key::candidates(raw_key)
            .iter()
            .find_map(|key| self.get(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MediaKey, &str)> {
        self.entries.iter().map(|(k, v)| (k, v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://api.example.com/";

    #[test]
    fn empty_reference_resolves_to_none() {
        assert_eq!(resolve_media_uri(None, BASE), None);
        assert_eq!(resolve_media_uri(Some(""), BASE), None);
    }

    #[test]
    fn absolute_and_data_uris_pass_through() {
        let data = "data:image/jpeg;base64,AAAA";
        assert_eq!(resolve_media_uri(Some(data), BASE).as_deref(), Some(data));
        let url = "http://cdn.example.com/a.png";
        assert_eq!(resolve_media_uri(Some(url), BASE).as_deref(), Some(url));
    }

    #[test]
    fn relative_path_is_joined_with_base() {
        assert_eq!(
            resolve_media_uri(Some("/charts/x.png"), BASE).as_deref(),
            Some("https://api.example.com/charts/x.png")
        );
    }

    #[test]
    fn long_base64_is_wrapped_as_png_data_uri() {
        let raw = "iVBORw0K".repeat(25);
        assert_eq!(raw.len(), 200);
        let uri = resolve_media_uri(Some(&raw), BASE).expect("uri");
        assert!(uri.starts_with("data:image/png;base64,"));
        assert!(uri.ends_with(&raw));
    }

    #[test]
    fn short_or_spaced_base64_is_not_wrapped() {
        assert_eq!(resolve_media_uri(Some("abc123=="), BASE).as_deref(), Some("abc123=="));
        let spaced = format!("{} {}", "A".repeat(60), "B".repeat(60));
        assert_eq!(resolve_media_uri(Some(&spaced), BASE), Some(spaced.clone()));
    }

    #[test]
    fn base64_comma_prefix_gets_png_header() {
        assert_eq!(
            resolve_media_uri(Some("base64,QUJD"), BASE).as_deref(),
            Some("data:image/png;base64,QUJD")
        );
    }

    #[test]
    fn registry_registers_all_candidates_and_first_registration_wins() {
        let mut registry = MediaRegistry::new();
        let inserted = registry.register("Fig A", "https://x/1.png");
        assert_eq!(inserted.len(), 2);
        assert_eq!(registry.lookup("fig_description-fig  a"), Some("https://x/1.png"));

        let inserted = registry.register("fig a", "https://x/2.png");
        assert!(inserted.is_empty());
        assert_eq!(registry.lookup("FIG A"), Some("https://x/1.png"));
    }

    #[test]
    fn registry_ignores_empty_uris() {
        let mut registry = MediaRegistry::new();
        assert!(registry.register("Fig A", "  ").is_empty());
        assert!(registry.is_empty());
        registry.register("Fig A", "https://x/1.png");
        registry.register("Fig A", "");
        assert_eq!(registry.lookup("Fig A"), Some("https://x/1.png"));
    }
}
