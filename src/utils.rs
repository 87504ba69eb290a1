/// Utility helpers for melobot

/// Replace anything outside `[A-Za-z0-9_-]` so a track id is safe as a file
/// name component.
pub fn sanitize_file_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Strip HTML tags and collapse whitespace runs. Search APIs wrap matched
/// keywords in `<em>` markers.
pub fn clean_title(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_tag = false;
    for ch in raw.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }

    let mut compact = String::with_capacity(out.len());
    let mut prev_space = false;
    for ch in out.chars() {
        if ch.is_whitespace() {
            if !prev_space && !compact.is_empty() {
                compact.push(' ');
            }
            prev_space = true;
        } else {
            compact.push(ch);
            prev_space = false;
        }
    }
    compact.trim_end().to_string()
}

/// Parse `ss`, `mm:ss` or `hh:mm:ss` into seconds. Unparseable input is 0.
pub fn parse_duration(raw: &str) -> u32 {
    let parts: Vec<&str> = raw.split(':').collect();
    let nums: Option<Vec<u32>> = parts.iter().map(|p| p.trim().parse().ok()).collect();
    match nums.as_deref() {
        Some([s]) => *s,
        Some([m, s]) => m * 60 + s,
        Some([h, m, s]) => h * 3600 + m * 60 + s,
        _ => 0,
    }
}

/// Render a byte count as mebibytes with two decimals, for stats output.
pub fn format_mib(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_non_ascii() {
        assert_eq!(sanitize_file_component("BV1xy/..z"), "BV1xy___z");
        assert_eq!(sanitize_file_component(""), "unknown");
    }

    #[test]
    fn clean_title_strips_markup() {
        assert_eq!(
            clean_title("<em class=\"kw\">Lemon</em>  - 米津玄師"),
            "Lemon - 米津玄師"
        );
        assert_eq!(clean_title("plain title"), "plain title");
    }

    #[test]
    fn parse_duration_accepts_clock_formats() {
        assert_eq!(parse_duration("4:21"), 261);
        assert_eq!(parse_duration("1:02:03"), 3723);
        assert_eq!(parse_duration("95"), 95);
        assert_eq!(parse_duration("n/a"), 0);
    }
}
