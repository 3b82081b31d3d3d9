/// Upload filename hygiene and resource key derivation
use crate::config::types::{RenderboxError, ResourceKey, Result, MAX_KEY_LEN};

/// Reduce an untrusted upload name to a safe, flat file name.
///
/// Non-ASCII characters are dropped, path separators and whitespace runs
/// become `_`, anything outside `[A-Za-z0-9._-]` is removed and leading
/// or trailing `.`/`_` are trimmed. The result never contains a path
/// component and may be empty.
pub fn sanitize_filename(name: &str) -> String {
    let flattened: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");

    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Split a sanitized name into stem and lowercase extension
fn split_extension(name: &str) -> (&str, Option<String>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => {
            (&name[..idx], Some(name[idx + 1..].to_ascii_lowercase()))
        }
        _ => (name, None),
    }
}

/// Lowercase extension of an upload name, if any
pub fn extension_of(filename: &str) -> Option<String> {
    split_extension(&sanitize_filename(filename)).1
}

/// Derive the canonical resource key from an upload name (`scene.blend` -> `scene`)
pub fn derive_key(filename: &str) -> Result<ResourceKey> {
    let sanitized = sanitize_filename(filename);
    let (stem, _) = split_extension(&sanitized);
    let stem = stem.trim_end_matches(|c| c == '.' || c == '_');

    if stem.is_empty() {
        return Err(RenderboxError::InvalidKey {
            key: filename.to_string(),
            reason: "file name has no usable characters".to_string(),
        });
    }

    let truncated = if stem.len() > MAX_KEY_LEN {
        &stem[..MAX_KEY_LEN]
    } else {
        stem
    };
    ResourceKey::parse(truncated)
}

/// Whether the upload name carries one of the allowed extensions.
/// Advisory only: the signature check decides.
pub fn has_allowed_extension(filename: &str, allowed: &[String]) -> bool {
    match extension_of(filename) {
        Some(ext) => allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext)),
        None => false,
    }
}
