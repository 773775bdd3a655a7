// src/parse.rs
//! Filter-list line classification: raw feed content → candidate patterns.
//!
//! Classification only. Whether a candidate actually compiles is decided by
//! the syntax stage of the validation pipeline.

use std::collections::HashSet;

use crate::model::{Candidate, PatternKind};

/// Lines longer than this are skipped outright.
pub const MAX_LINE_BYTES: usize = 2048;

/// Adblock separator placeholder (`^`).
const SEPARATOR_CLASS: &str = r"(?:[^\w.%-]|$)";
/// Leading `||` anchor: any scheme, optional subdomains.
const HOST_ANCHOR: &str = r"^[a-z][a-z0-9+.-]*://(?:[^/?#]*\.)?";

/// Parse a whole feed body into deduplicated candidates, in first-seen order.
pub fn parse_feed(source: &str, body: &str) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for line in body.lines() {
        let Some((kind, pattern)) = parse_line(line) else {
            continue;
        };
        if !seen.insert((kind, pattern.clone())) {
            continue;
        }
        out.push(Candidate {
            raw: line.trim().to_string(),
            kind,
            pattern,
            source: source.to_string(),
        });
    }
    out
}

/// Classify a single line. `None` for comments, exceptions and noise.
pub fn parse_line(line: &str) -> Option<(PatternKind, String)> {
    let line = line.trim();
    if line.is_empty() || line.len() > MAX_LINE_BYTES {
        return None;
    }
    if line.starts_with('!') || line.starts_with("[Adblock") || line.starts_with("@@") {
        return None;
    }
    if line.starts_with('#') && !line.starts_with("##") {
        return None;
    }

    if let Some(host) = hosts_entry(line) {
        return normalize_domain(host).map(|d| (PatternKind::Domain, d));
    }

    // cosmetic rules; `#@#` is an exception, `#?#`/`#$#` are extended syntax
    if line.contains("#@#") || line.contains("#?#") || line.contains("#$#") {
        return None;
    }
    if let Some(idx) = line.find("##") {
        let selector = line[idx + 2..].trim();
        return css_rule(selector).map(|p| (PatternKind::CssRegex, p));
    }

    if let Some(body) = slash_regex(line) {
        return Some((PatternKind::UrlRegex, body.to_string()));
    }

    let filter = strip_options(line);
    if filter.is_empty() {
        return None;
    }

    if let Some(rest) = filter.strip_prefix("||") {
        let host = rest.strip_suffix('^').unwrap_or(rest);
        if let Some(d) = normalize_domain(host) {
            return Some((PatternKind::Domain, d));
        }
    }

    if filter.contains(['/', '*', '^', '|']) {
        return Some((PatternKind::UrlRegex, wildcard_to_regex(filter)));
    }

    normalize_domain(filter).map(|d| (PatternKind::Domain, d))
}

/// Lowercase, drop trailing dot and leading `www.`; `None` if not a host name.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let mut d = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if let Some(rest) = d.strip_prefix("www.") {
        d = rest.to_string();
    }
    is_host_name(&d).then_some(d)
}

fn is_host_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = s.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let label_ok = |l: &&str| {
        !l.is_empty()
            && l.len() <= 63
            && !l.starts_with('-')
            && !l.ends_with('-')
            && l.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
    };
    labels.iter().all(label_ok)
}

fn hosts_entry(line: &str) -> Option<&str> {
    let mut parts = line.split_whitespace();
    let addr = parts.next()?;
    if addr != "0.0.0.0" && addr != "127.0.0.1" {
        return None;
    }
    let host = parts.next()?;
    if host == "localhost" || host == "0.0.0.0" || host.starts_with('#') {
        return None;
    }
    Some(host)
}

fn css_rule(selector: &str) -> Option<String> {
    if selector.is_empty() {
        return None;
    }
    if selector.len() > 2 && selector.starts_with('/') && selector.ends_with('/') {
        return Some(selector[1..selector.len() - 1].to_string());
    }
    Some(regex::escape(selector))
}

/// `/body/` or `/body/$options`; a lone leading slash is a path filter.
fn slash_regex(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let tail = &rest[end + 1..];
    if !(tail.is_empty() || tail.starts_with('$')) {
        return None;
    }
    let body = &rest[..end];
    (!body.is_empty()).then_some(body)
}

fn strip_options(filter: &str) -> &str {
    match filter.rfind('$') {
        Some(idx) => filter[..idx].trim(),
        None => filter,
    }
}

/// Translate adblock wildcard syntax into a regex source string.
pub fn wildcard_to_regex(filter: &str) -> String {
    let mut out = String::with_capacity(filter.len() * 2);
    let mut rest = filter;
    if let Some(r) = rest.strip_prefix("||") {
        out.push_str(HOST_ANCHOR);
        rest = r;
    } else if let Some(r) = rest.strip_prefix('|') {
        out.push('^');
        rest = r;
    }
    let (rest, anchored_end) = match rest.strip_suffix('|') {
        Some(r) => (r, true),
        None => (rest, false),
    };
    let mut buf = [0u8; 4];
    for c in rest.chars() {
        match c {
            '*' => out.push_str(".*"),
            '^' => out.push_str(SEPARATOR_CLASS),
            '|' => out.push_str(r"\|"),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    if anchored_end {
        out.push('$');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_comments_and_exceptions() {
        for l in [
            "",
            "! Title: EasyPrivacy",
            "[Adblock Plus 2.0]",
            "# hosts comment",
            "@@||mailchimp.com^",
            "example.com#@#.ad",
        ] {
            assert_eq!(parse_line(l), None, "line `{l}`");
        }
        let long = format!("||{}.com^", "a".repeat(MAX_LINE_BYTES));
        assert_eq!(parse_line(&long), None);
    }

    #[test]
    fn domain_forms_normalize() {
        let d = |s: &str| parse_line(s).map(|(_, p)| p);
        assert_eq!(d("||Tracker.Example.COM^"), Some("tracker.example.com".into()));
        assert_eq!(
            d("||pixel.mailtrack.io^$third-party,image"),
            Some("pixel.mailtrack.io".into())
        );
        assert_eq!(d("0.0.0.0 www.spy.net"), Some("spy.net".into()));
        assert_eq!(d("127.0.0.1 track.example.org. # comment"), Some("track.example.org".into()));
        assert_eq!(d("open.sendgrid.net"), Some("open.sendgrid.net".into()));
        assert_eq!(parse_line("0.0.0.0 localhost"), None);
        assert_eq!(parse_line("justaword"), None);
    }

    #[test]
    fn regex_and_css_forms() {
        assert_eq!(
            parse_line(r"/\/track\/open\/[0-9a-f]{32}/$image"),
            Some((PatternKind::UrlRegex, r"\/track\/open\/[0-9a-f]{32}".into()))
        );
        assert_eq!(
            parse_line("##/display:\\s*none/"),
            Some((PatternKind::CssRegex, "display:\\s*none".into()))
        );
        let (kind, re) = parse_line("example.com##.tracking-pixel").unwrap();
        assert_eq!(kind, PatternKind::CssRegex);
        let compiled = regex::Regex::new(&re).unwrap();
        assert!(compiled.is_match("img.tracking-pixel { width: 1px }"));
        assert!(!compiled.is_match("img#tracking-pixel"));
    }

    #[test]
    fn wildcard_filters_translate() {
        let (kind, re) = parse_line("||list-manage.com/track/open*").unwrap();
        assert_eq!(kind, PatternKind::UrlRegex);
        let compiled = regex::Regex::new(&re).unwrap();
        assert!(compiled.is_match("https://us3.list-manage.com/track/open.php?u=1"));
        assert!(!compiled.is_match("https://example.com/track/open"));

        let (_, re) = parse_line("/pixel.gif?").unwrap();
        let compiled = regex::Regex::new(&re).unwrap();
        assert!(compiled.is_match("https://x.example/img/pixel.gif?id=3"));
        assert!(!compiled.is_match("https://x.example/img/pixelXgif"));

        let (_, re) = parse_line("/beacon^").unwrap();
        let compiled = regex::Regex::new(&re).unwrap();
        assert!(compiled.is_match("https://a.example/beacon?x"));
        assert!(compiled.is_match("https://a.example/beacon"));
        assert!(!compiled.is_match("https://a.example/beacons"));
    }

    #[test]
    fn feed_dedupes_within_source() {
        let body = "||a.example.com^\n||A.example.com^\n0.0.0.0 a.example.com\n||b.example.com^\n";
        let c = parse_feed("A", body);
        assert_eq!(c.len(), 2);
        assert!(c.iter().all(|c| c.source == "A"));
        assert_eq!(c[0].pattern, "a.example.com");
        assert_eq!(c[0].raw, "||a.example.com^");
    }
}
