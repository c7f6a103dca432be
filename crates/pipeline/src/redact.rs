//! Credential scrubbing for free text that leaves the pipeline.
//!
//! Pull request descriptions and release notes are copied into the
//! knowledge graph and the documentation portal. Anything that looks like an
//! AWS access key, a GitHub personal token, or an SSH public key is replaced
//! with a fixed marker first.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

pub const AWS_KEY_MARKER: &str = "‹AWS_KEY_REDACTED›";
pub const GITHUB_TOKEN_MARKER: &str = "‹GH_TOKEN_REDACTED›";
pub const SSH_KEY_MARKER: &str = "‹SSH_KEY_REDACTED›";

// The token pattern captures the character after the token so that a longer
// alphanumeric run is left alone; the replacement puts it back.
static RULES: LazyLock<Vec<(Regex, String)>> = LazyLock::new(|| {
    [
        (r"AKIA[0-9A-Z]{16}", AWS_KEY_MARKER.to_string()),
        (
            r"ghp_[0-9A-Za-z]{36,40}([^0-9A-Za-z]|$)",
            format!("{GITHUB_TOKEN_MARKER}${{1}}"),
        ),
        (
            r"(?:ssh-rsa|ssh-ed25519)\s+[A-Za-z0-9/+]+={0,3}",
            SSH_KEY_MARKER.to_string(),
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, marker)| Regex::new(pattern).ok().map(|re| (re, marker)))
    .collect()
});

/// Replaces credential-shaped substrings of `text` with redaction markers.
/// Borrows when nothing matched.
pub fn redact_secrets(text: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(text);
    for (pattern, marker) in RULES.iter() {
        let replaced = match pattern.replace_all(&out, marker.as_str()) {
            Cow::Owned(replaced) => Some(replaced),
            Cow::Borrowed(_) => None,
        };
        if let Some(replaced) = replaced {
            out = Cow::Owned(replaced);
        }
    }
    out
}
