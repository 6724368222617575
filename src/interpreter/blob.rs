//! Best-effort, lossy extraction of readable text from embedded binary
//! blobs (plist-style recipient lists, archived attributed strings). Not a
//! parser; it only has to surface plain-text fragments.

const MIN_RUN_LEN: usize = 8;

pub(crate) fn extract_readable_fragments(bytes: &[u8]) -> Vec<String> {
    if bytes.starts_with(b"<?xml") || bytes.starts_with(b"<plist") {
        tagged_fragments(bytes)
    } else {
        printable_runs(bytes)
    }
}

/// Pulls the contents of `<string>...</string>` elements out of a textual
/// property list without building a document tree.
fn tagged_fragments(bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let mut fragments = Vec::new();
    let mut rest = text.as_ref();
    while let Some(open) = rest.find("<string>") {
        rest = &rest[open + "<string>".len()..];
        let Some(close) = rest.find("</string>") else {
            break;
        };
        let value = rest[..close].trim();
        if !value.is_empty() {
            fragments.push(value.to_string());
        }
        rest = &rest[close + "</string>".len()..];
    }
    fragments
}

/// Fallback for opaque binary blobs: any run of printable ASCII at least
/// MIN_RUN_LEN long counts as a fragment.
fn printable_runs(bytes: &[u8]) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut run = String::new();
    for &b in bytes {
        if (0x20..0x7f).contains(&b) {
            run.push(b as char);
        } else {
            if run.trim().len() >= MIN_RUN_LEN {
                fragments.push(run.trim().to_string());
            }
            run.clear();
        }
    }
    if run.trim().len() >= MIN_RUN_LEN {
        fragments.push(run.trim().to_string());
    }
    fragments
}
