use unicode_normalization::UnicodeNormalization;

use crate::error::{Error, Result};

const MAX_ALIAS_LEN: usize = 48;

/// Fallback base when a source offers neither a usable title nor an id.
pub const FALLBACK_ALIAS: &str = "download";

/// Check a caller-supplied alias. Aliases double as directory names under the
/// downloads directory, so separators and leading dots are refused.
pub fn validate(alias: &str) -> Result<()> {
    if alias.is_empty() {
        return Err(Error::Input("alias must not be empty".to_string()));
    }
    if alias.starts_with('.') {
        return Err(Error::Input(format!("alias must not start with '.': {alias}")));
    }
    if let Some(c) = alias
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(Error::Input(format!("alias {alias:?} contains invalid character {c:?}")));
    }
    Ok(())
}

/// Reduce a free-form title to an alias: decomposed, ASCII alphanumerics kept,
/// everything else collapsed to single underscores, lower-cased.
pub fn slugify(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_sep = false;
    for c in title.nfkd() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else if !unicode_normalization::char::is_combining_mark(c) {
            pending_sep = true;
        }
        if out.len() >= MAX_ALIAS_LEN {
            break;
        }
    }
    out.truncate(MAX_ALIAS_LEN);
    out.trim_end_matches('_').to_string()
}

/// Base alias for a download without an explicit alias: title, then id, then a fixed fallback.
pub fn derive_base(title: Option<&str>, id: Option<&str>) -> String {
    [title, id]
        .into_iter()
        .flatten()
        .map(slugify)
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_ALIAS.to_string())
}

/// `base`, `base_2`, `base_3`, ...
pub fn with_suffix(base: &str, n: u32) -> String {
    if n <= 1 {
        base.to_string()
    } else {
        format!("{}_{}", base, n)
    }
}
