/// Canonicalizes raw message addresses into a comparable form.
///
/// Multi-recipient addresses arrive comma-delimited; each part is normalized
/// on its own and the parts are rejoined with ", ". Normalization is
/// idempotent: running it over already-normalized output is a no-op.
pub fn normalize(raw: &str) -> String {
    if raw.contains(',') {
        return raw
            .split(',')
            .map(|part| normalize(part.trim()))
            .collect::<Vec<_>>()
            .join(", ");
    }
    normalize_part(raw.trim())
}

fn normalize_part(raw: &str) -> String {
    let mut s = raw.strip_prefix("tel:").unwrap_or(raw).to_string();
    if let Some(rest) = s.strip_prefix('+') {
        s = rest.to_string();
    }
    // Email-style handles keep their punctuation.
    if !s.contains('@') {
        s.retain(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')' | '_'));
    }
    if s.len() == 11 && s.starts_with('1') && s.chars().all(|c| c.is_ascii_digit()) {
        s = s[1..].to_string();
    }
    s.retain(|c| c != '/');
    s
}
