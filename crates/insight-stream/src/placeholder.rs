use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::media::MediaRegistry;

static FIG_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[fig_description-([^\]]+)\]").expect("valid placeholder regex"));

/// Replaces `[fig_description-KEY]` placeholders with inline images for every
/// key the registry can resolve.
///
/// Unresolved placeholders are kept verbatim so a later pass can pick them up
/// once the matching image event arrives.
pub fn resolve_placeholders<'a>(markdown: &'a str, registry: &MediaRegistry) -> Cow<'a, str> {
    if registry.is_empty() {
        return Cow::Borrowed(markdown);
    }
    FIG_PLACEHOLDER.replace_all(markdown, |caps: &Captures<'_>| {
        let key = &caps[1];
        match registry.lookup(key) {
            Some(uri) => format!("\n\n![{key}]({uri})\n\n"),
            None => caps[0].to_string(),
        }
    })
}
