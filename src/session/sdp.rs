//! Text level fixes applied to session descriptions.

const BUNDLE_PREFIX: &str = "a=group:BUNDLE";

/// Make sure the answer's bundle group names group `0`.
///
/// An empty `a=group:BUNDLE` line is filled in with `0`. If the engine wrote no
/// bundle line at all, one is inserted before the first media section. A line
/// that already lists mids is left alone.
pub fn ensure_bundle_group(sdp: &str) -> String {
    let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };

    let mut lines: Vec<String> = sdp.lines().map(str::to_string).collect();
    let trailing_eol = sdp.ends_with('\n');

    let bundle = lines.iter().position(|l| l.starts_with(BUNDLE_PREFIX));

    match bundle {
        Some(i) => {
            if lines[i][BUNDLE_PREFIX.len()..].trim().is_empty() {
                lines[i] = format!("{BUNDLE_PREFIX} 0");
            }
        }
        None => {
            let at = lines
                .iter()
                .position(|l| l.starts_with("m="))
                .unwrap_or(lines.len());
            lines.insert(at, format!("{BUNDLE_PREFIX} 0"));
        }
    }

    let mut out = lines.join(eol);
    if trailing_eol {
        out.push_str(eol);
    }
    out
}

/// The first `a=mid:` value in a description, which local candidates are
/// reported against.
pub fn first_mid(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|l| l.trim_end().strip_prefix("a=mid:"))
        .map(str::to_string)
}

/// Number of media sections.
pub fn media_count(sdp: &str) -> usize {
    sdp.lines().filter(|l| l.starts_with("m=")).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: &str = "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n";

    #[test]
    fn fills_empty_bundle_group() {
        let sdp = format!("{HEAD}a=group:BUNDLE \r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\n");
        let fixed = ensure_bundle_group(&sdp);

        assert!(fixed.contains("a=group:BUNDLE 0\r\n"));
        assert!(!fixed.contains("a=group:BUNDLE \r\n"));
        assert!(fixed.ends_with("a=mid:0\r\n"));
    }

    #[test]
    fn fills_bundle_group_without_trailing_space() {
        let sdp = format!("{HEAD}a=group:BUNDLE\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        assert!(ensure_bundle_group(&sdp).contains("a=group:BUNDLE 0\r\n"));
    }

    #[test]
    fn keeps_populated_bundle_group() {
        let sdp = format!("{HEAD}a=group:BUNDLE 0 1 2\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        assert_eq!(ensure_bundle_group(&sdp), sdp);
    }

    #[test]
    fn inserts_missing_bundle_group() {
        let sdp = format!("{HEAD}m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\n");
        let fixed = ensure_bundle_group(&sdp);

        let bundle = fixed.find("a=group:BUNDLE 0\r\n").unwrap();
        let media = fixed.find("m=video").unwrap();
        assert!(bundle < media);
    }

    #[test]
    fn finds_first_mid_and_media_count() {
        let sdp = format!("{HEAD}m=video 9 X 96\r\na=mid:v0\r\nm=video 9 X 96\r\na=mid:v1\r\n");
        assert_eq!(first_mid(&sdp).as_deref(), Some("v0"));
        assert_eq!(media_count(&sdp), 2);
        assert_eq!(first_mid(HEAD), None);
    }
}
