//! Firmware version strings as the controller reports them (`2.2`, `v2.3.1`).
use std::cmp::Ordering;

/// Values a UI shows while the real version is still being read.
const PLACEHOLDERS: &[&str] = &["", "-", "--", "?", "...", "…", "unknown", "loading", "loading...", "n/a"];

fn segments(version: &str) -> Vec<u64> {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
    trimmed.split('.').map(|s| s.trim().parse::<u64>().unwrap_or(0)).collect()
}

/// Segment-wise numeric comparison; missing trailing segments count as 0.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (segments(a), segments(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// True if the update check should offer `remote` over `local`.
///
/// Walks the segments left to right. The first position where both versions
/// carry a segment and the numbers differ decides by numeric order. A
/// difference against a missing (zero-padded) segment counts as newer, so
/// `1.2` against `1.2.3` offers an update while `2.0` against `2.0.0` does
/// not.
pub fn is_newer_version(remote: &str, local: &str) -> bool {
    let (remote, local) = (segments(remote), segments(local));
    let len = remote.len().max(local.len());
    for i in 0..len {
        match (remote.get(i), local.get(i)) {
            (Some(r), Some(l)) if r != l => return r > l,
            (Some(_), Some(_)) => continue,
            (r, l) => {
                if r.copied().unwrap_or(0) != l.copied().unwrap_or(0) {
                    return true;
                }
            }
        }
    }
    false
}

/// Post-update check: exact text match once a leading `v` is dropped.
pub fn versions_match(expected: &str, reported: &str) -> bool {
    strip_prefix(expected) == strip_prefix(reported)
}

fn strip_prefix(version: &str) -> &str {
    let v = version.trim();
    v.strip_prefix(['v', 'V']).unwrap_or(v)
}

pub fn is_placeholder_version(version: &str) -> bool {
    let v = version.trim().to_ascii_lowercase();
    PLACEHOLDERS.contains(&v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_not_lexical() {
        assert!(is_newer_version("2.10.0", "2.9.9"));
        assert!(!is_newer_version("2.9.9", "2.10.0"));
    }

    #[test]
    fn padded_segments_that_differ_offer_an_update() {
        assert!(is_newer_version("2.10.0", "2.9.9"));
        assert!(!is_newer_version("2.0", "2.0.0"));
        assert!(is_newer_version("1.2", "1.2.3"));

        assert!(!is_newer_version("2.0.0", "2.0"));
        assert!(is_newer_version("1.2.3", "1.2"));
        assert!(!is_newer_version("1.1", "1.2.3"));
    }

    #[test]
    fn ordering_pads_with_zero() {
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.2", "1.2.3"), Ordering::Less);
    }

    #[test]
    fn prefix_and_junk_segments() {
        assert_eq!(compare_versions("v2.3", "2.3"), Ordering::Equal);
        assert!(is_newer_version("2.3", "2.3-beta"));
        assert!(!is_newer_version("2.2", "2.2"));
    }

    #[test]
    fn validation_match_ignores_leading_v_only() {
        assert!(versions_match("2.3", "v2.3"));
        assert!(versions_match("v2.3", "2.3"));
        assert!(!versions_match("2.3", "2.4"));
        assert!(!versions_match("2.3", "2.3.0"));
    }

    #[test]
    fn placeholders() {
        assert!(is_placeholder_version("Loading..."));
        assert!(is_placeholder_version("  "));
        assert!(!is_placeholder_version("2.2"));
    }
}
