use std::sync::LazyLock;

use regex::Regex;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\b(?:https?|wss?)://[^\s"'<>]+"#).unwrap());
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[\w.+-]+@[\w-]+(?:\.[\w-]+)+\b").unwrap());

/// Mask URLs and e-mail addresses in upstream error text before it reaches
/// a client.
pub fn desensitize(text: &str) -> String {
    let masked = URL_RE.replace_all(text, "<url>");
    EMAIL_RE.replace_all(&masked, "<email>").into_owned()
}
