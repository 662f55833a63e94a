//! Domain name normalization.
//!
//! Both the blocklist loader and the query path reduce names to the same
//! canonical form before touching the membership index, so a hosts file
//! entry `WWW.Ads.Example.com.` matches a query for `ads.example.com`.

use std::fmt;
use std::net::IpAddr;

/// Hostnames that hosts-format blocklists carry as boilerplate.
const PLACEHOLDER_NAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
    "0.0.0.0",
];

/// A canonical, comparable domain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedName(String);

impl NormalizedName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NormalizedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a raw domain token.
///
/// Lowercases, keeps only the host of anything that looks like a URL,
/// strips leading `www.` labels and trailing `/` or `.` characters.
/// The result is a fixed point: normalizing it again changes nothing.
///
/// # Arguments
/// * `raw` - A query name, URL or blocklist token.
///
/// # Returns
/// The canonical name. It may be empty; callers decide what that means.
pub fn normalize(raw: &str) -> NormalizedName {
    let lowered = raw.trim().to_lowercase();
    let mut name = lowered.as_str();

    if let Some(pos) = name.find("://") {
        name = host_portion(&name[pos + 3..]);
    }

    loop {
        name = name.trim_start();
        match name.strip_prefix("www.") {
            Some(rest) => name = rest,
            None => break,
        }
    }

    let name = name.trim_end_matches(|c: char| c == '/' || c == '.' || c.is_whitespace());
    NormalizedName(name.to_string())
}

/// Host part of the text following a URL scheme separator.
fn host_portion(rest: &str) -> &str {
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let host = match authority.rfind('@') {
        Some(at) => &authority[at + 1..],
        None => authority,
    };
    match host.rfind(':') {
        Some(colon)
            if !host.starts_with('[')
                && colon + 1 < host.len()
                && host[colon + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &host[..colon]
        }
        _ => host,
    }
}

/// Pull the domain token out of one blocklist source line.
///
/// Accepts hosts-file lines (`0.0.0.0 ads.example.com`) and plain domain
/// lists. Blank lines and `#` comments yield `None`.
pub fn extract_domain(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = match line.find('#') {
        Some(pos) => line[..pos].trim_end(),
        None => line,
    };

    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;
    if first.parse::<IpAddr>().is_ok() {
        return tokens.next();
    }
    Some(first)
}

/// True for hosts-file boilerplate names that must never be blocked.
pub fn is_placeholder(name: &NormalizedName) -> bool {
    PLACEHOLDER_NAMES.contains(&name.as_str())
}

/// Turn raw blocklist lines into index entries.
pub fn entries_from_lines<I, S>(lines: I) -> Vec<NormalizedName>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|line| extract_domain(line.as_ref()).map(normalize))
        .filter(|name| !name.is_empty() && !is_placeholder(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lowercases_and_trims() {
        assert_eq!(normalize("  Ads.Example.COM \n").as_str(), "ads.example.com");
    }

    #[test]
    fn strips_scheme_path_and_www() {
        assert_eq!(normalize("https://www.example.com/").as_str(), "example.com");
        assert_eq!(normalize("http://example.com/path?q=1").as_str(), "example.com");
        assert_eq!(normalize("HTTP://user@tracker.net:8080/x").as_str(), "tracker.net");
    }

    #[test]
    fn strips_trailing_dot_from_query_names() {
        assert_eq!(normalize("a.b.blocked.com.").as_str(), "a.b.blocked.com");
        assert_eq!(normalize("www.0fb.info").as_str(), "0fb.info");
    }

    #[test]
    fn repeated_www_labels_are_all_removed() {
        assert_eq!(normalize("www.www.example.com").as_str(), "example.com");
    }

    #[test]
    fn root_name_normalizes_to_empty() {
        assert!(normalize(".").is_empty());
        assert!(normalize("").is_empty());
    }

    #[test]
    fn hosts_lines_take_second_token_after_ip() {
        assert_eq!(extract_domain("0.0.0.0 ads.example.com"), Some("ads.example.com"));
        assert_eq!(extract_domain("127.0.0.1\ttracker.net extra"), Some("tracker.net"));
        assert_eq!(extract_domain(":: ipv6.tracker.net"), Some("ipv6.tracker.net"));
        assert_eq!(extract_domain("0.0.0.0"), None);
    }

    #[test]
    fn plain_lines_take_first_token() {
        assert_eq!(extract_domain("doubleclick.net"), Some("doubleclick.net"));
        assert_eq!(extract_domain("doubleclick.net some note"), Some("doubleclick.net"));
        assert_eq!(extract_domain("ads.example.com # added 2024"), Some("ads.example.com"));
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        assert_eq!(extract_domain(""), None);
        assert_eq!(extract_domain("   "), None);
        assert_eq!(extract_domain("# AdAway default blocklist"), None);
        assert_eq!(extract_domain("   # indented comment"), None);
    }

    #[test]
    fn entries_drop_placeholders() {
        let lines = [
            "# header",
            "127.0.0.1 localhost",
            "::1 ip6-localhost",
            "0.0.0.0 0.0.0.0",
            "0.0.0.0 Ads.Example.com",
            "",
            "https://www.tracker.net/",
        ];

        let entries = entries_from_lines(lines);

        let names: Vec<&str> = entries.iter().map(NormalizedName::as_str).collect();
        assert_eq!(names, vec!["ads.example.com", "tracker.net"]);
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(raw in "[ -~]{0,48}") {
            let once = normalize(&raw);
            let twice = normalize(once.as_str());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn normalize_is_idempotent_on_url_like_input(
            scheme in "(https?|ftp)?(://)?",
            www in "(www\\.|WWW\\.){0,2}",
            host in "[a-zA-Z0-9-]{1,12}(\\.[a-zA-Z0-9-]{1,12}){0,3}",
            tail in "(:[0-9]{1,5})?(/[a-z]{0,6})?[./ ]{0,3}",
        ) {
            let raw = format!("{scheme}{www}{host}{tail}");
            let once = normalize(&raw);
            prop_assert_eq!(normalize(once.as_str()), once);
        }
    }
}
