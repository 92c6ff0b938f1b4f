//! Access-log line parser
//!
//! Proxy access logs have drifted across releases: the source address appears
//! either bare (`from 178.176.86.81:16708`) or transport-tagged
//! (`from tcp:178.176.86.81:16708`), and the owning account trails the line as
//! an `email:` field. Patterns are tried in order; the first match wins.
//! Anything unrecognized is simply not an event - the caller counts skips.

use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;

/// Fields extracted from one valid access-log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedConnection {
    pub account: String,
    pub ip: IpAddr,
    pub port: u16,
}

static SOURCE_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
static ACCOUNT_PATTERN: OnceLock<Regex> = OnceLock::new();

fn source_patterns() -> &'static [Regex] {
    SOURCE_PATTERNS.get_or_init(|| {
        vec![
            // transport-tagged source, current log format
            Regex::new(r"from (?:tcp|udp):(?P<ip>\d{1,3}(?:\.\d{1,3}){3}):(?P<port>\d{1,5})")
                .unwrap(),
            // bare source, older format
            Regex::new(r"from (?P<ip>\d{1,3}(?:\.\d{1,3}){3}):(?P<port>\d{1,5})").unwrap(),
            // bracketed IPv6 source, tag optional
            Regex::new(r"from (?:(?:tcp|udp):)?\[(?P<ip>[0-9A-Fa-f:]+)\]:(?P<port>\d{1,5})")
                .unwrap(),
        ]
    })
}

fn account_pattern() -> &'static Regex {
    ACCOUNT_PATTERN.get_or_init(|| Regex::new(r"email:\s*(?P<account>\S+)").unwrap())
}

/// Parse one log line into a connection observation.
///
/// Returns `None` for every line that is not a complete connection record:
/// missing account tag, unparsable source, or plain garbage. The panel prefixes
/// account emails with `user_`; that prefix is stripped here so the id matches
/// what the policy service keys on.
pub fn parse_line(line: &str) -> Option<ParsedConnection> {
    let caps = account_pattern().captures(line)?;
    let raw_account = caps.name("account")?.as_str();
    let account = raw_account.strip_prefix("user_").unwrap_or(raw_account);
    if account.is_empty() {
        return None;
    }

    for pattern in source_patterns() {
        if let Some(caps) = pattern.captures(line) {
            let ip: IpAddr = match caps.name("ip")?.as_str().parse() {
                Ok(ip) => ip,
                // matched shape but bogus address (e.g. octet > 255); try next
                Err(_) => continue,
            };
            let port: u16 = match caps.name("port")?.as_str().parse() {
                Ok(port) => port,
                Err(_) => continue,
            };
            return Some(ParsedConnection {
                account: account.to_string(),
                ip,
                port,
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAGGED_LINE: &str = "2025/12/07 15:02:32.056701 from tcp:178.176.86.81:16708 accepted tcp:142.250.74.110:443 [VLESS-TCP >> direct] email: user_848055128";
    const BARE_LINE: &str = "2025/12/07 15:02:32.056701 from 178.176.86.81:16708 accepted tcp:142.250.74.110:443 [VLESS-TCP >> direct] email: user_848055128";

    #[test]
    fn test_tagged_source_line() {
        let parsed = parse_line(TAGGED_LINE).unwrap();
        assert_eq!(parsed.account, "848055128");
        assert_eq!(parsed.ip.to_string(), "178.176.86.81");
        assert_eq!(parsed.port, 16708);
    }

    #[test]
    fn test_bare_source_line() {
        let parsed = parse_line(BARE_LINE).unwrap();
        assert_eq!(parsed.account, "848055128");
        assert_eq!(parsed.ip.to_string(), "178.176.86.81");
        assert_eq!(parsed.port, 16708);
    }

    #[test]
    fn test_both_formats_extract_identical_fields() {
        assert_eq!(parse_line(TAGGED_LINE), parse_line(BARE_LINE));
    }

    #[test]
    fn test_ipv6_source_line() {
        let line = "2025/12/07 15:02:32 from tcp:[2001:db8::17]:40102 accepted tcp:142.250.74.110:443 email: user_7";
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.account, "7");
        assert_eq!(parsed.ip.to_string(), "2001:db8::17");
        assert_eq!(parsed.port, 40102);
    }

    #[test]
    fn test_account_without_user_prefix() {
        let line = "2025/12/07 15:02:32 from 10.1.2.3:555 accepted tcp:1.1.1.1:443 email: alice@example.net";
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.account, "alice@example.net");
    }

    #[test]
    fn test_line_without_account_is_skipped() {
        let line = "2025/12/07 15:02:32.056701 from 178.176.86.81:16708 accepted tcp:142.250.74.110:443";
        assert_eq!(parse_line(line), None);
    }

    #[test]
    fn test_line_without_source_is_skipped() {
        let line = "2025/12/07 15:02:32 [Warning] core: Xray 1.8.4 started email: user_848055128";
        assert_eq!(parse_line(line), None);
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        for line in [
            "",
            "   ",
            "panic: runtime error",
            "from :16708 accepted email: user_1",
            "email: user_",
        ] {
            assert_eq!(parse_line(line), None, "line {:?} must not parse", line);
        }
    }

    #[test]
    fn test_destination_address_is_not_the_source() {
        // Only the "from" address counts; the accepted destination must not
        // leak into the parsed source fields.
        let parsed = parse_line(BARE_LINE).unwrap();
        assert_ne!(parsed.ip.to_string(), "142.250.74.110");
        assert_ne!(parsed.port, 443);
    }

    #[test]
    fn test_interleaved_garbage_yields_only_valid_events() {
        let log = [
            "noise",
            TAGGED_LINE,
            "2025/12/07 15:02:33 [Info] transport: dialing",
            BARE_LINE,
            "",
        ];
        let events: Vec<_> = log.iter().filter_map(|l| parse_line(l)).collect();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.account == "848055128"));
    }

    #[test]
    fn test_bogus_octets_rejected() {
        let line = "from 999.1.2.3:16708 accepted tcp:1.1.1.1:443 email: user_1";
        assert_eq!(parse_line(line), None);
    }
}
