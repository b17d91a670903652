//! Proxy rule parsing: `<bind_host>:<bind_port>:<local_host>:<local_port>`
//! (§4.8/§9). Hosts may be bracketed IPv6 literals (`[::1]:9000:...`).
//!
//! Parsed right-to-left, skipping balanced `[...]` segments, per the design
//! note in §9: splitting naively on `:` breaks as soon as any host contains
//! one, which every IPv6 literal does.

use std::fmt;

/// One parsed `<bind_host>:<bind_port>:<local_host>:<local_port>` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRule {
    /// Public host the server should bind on behalf of this client.
    pub bind_host: String,
    /// Public port the server should bind.
    pub bind_port: u16,
    /// Local host to dial when an external connection arrives.
    pub local_host: String,
    /// Local port to dial.
    pub local_port: u16,
}

/// Why a proxy rule string failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleParseError {
    reason: String,
}

impl fmt::Display for RuleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for RuleParseError {}

fn err(reason: impl Into<String>) -> RuleParseError {
    RuleParseError {
        reason: reason.into(),
    }
}

/// Splits `rule` into its four `:`-delimited segments, right to left,
/// treating a `[...]` span as opaque so a bracketed IPv6 literal's internal
/// colons are never mistaken for segment separators.
fn split_segments(rule: &str) -> Result<[String; 4], RuleParseError> {
    let mut segments: Vec<String> = Vec::with_capacity(4);
    let mut rest = rule;

    for _ in 0..3 {
        let split_at = find_last_separator(rest)?;
        let (head, tail) = rest.split_at(split_at);
        segments.push(tail[1..].to_string());
        rest = head;
    }
    segments.push(rest.to_string());
    segments.reverse();

    segments
        .try_into()
        .map_err(|_| err("proxy rule did not split into exactly 4 segments"))
}

/// Finds the byte index of the rightmost top-level `:` in `s` (one not
/// enclosed in a balanced `[...]` pair counted from the right).
fn find_last_separator(s: &str) -> Result<usize, RuleParseError> {
    let bytes = s.as_bytes();
    let mut depth: i32 = 0;
    for (i, &b) in bytes.iter().enumerate().rev() {
        match b {
            b']' => depth += 1,
            b'[' => depth -= 1,
            b':' if depth == 0 => return Ok(i),
            _ => {}
        }
    }
    Err(err(format!("missing ':' separator in {s:?}")))
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

fn parse_port(segment: &str) -> Result<u16, RuleParseError> {
    segment
        .parse()
        .map_err(|_| err(format!("invalid port {segment:?}")))
}

impl ProxyRule {
    /// Parses `<bind_host>:<bind_port>:<local_host>:<local_port>`.
    ///
    /// # Errors
    ///
    /// Returns [`RuleParseError`] if the rule does not split into exactly
    /// four segments or either port segment is not a valid `u16`.
    pub fn parse(rule: &str) -> Result<Self, RuleParseError> {
        let [bind_host, bind_port, local_host, local_port] = split_segments(rule)?;
        Ok(Self {
            bind_host: strip_brackets(&bind_host).to_string(),
            bind_port: parse_port(&bind_port)?,
            local_host: strip_brackets(&local_host).to_string(),
            local_port: parse_port(&local_port)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_hostnames() {
        let rule = ProxyRule::parse("0.0.0.0:9000:127.0.0.1:22").unwrap();
        assert_eq!(
            rule,
            ProxyRule {
                bind_host: "0.0.0.0".to_string(),
                bind_port: 9000,
                local_host: "127.0.0.1".to_string(),
                local_port: 22,
            }
        );
    }

    #[test]
    fn parses_bracketed_ipv6_bind_host() {
        let rule = ProxyRule::parse("[::1]:9000:127.0.0.1:22").unwrap();
        assert_eq!(rule.bind_host, "::1");
        assert_eq!(rule.bind_port, 9000);
    }

    #[test]
    fn parses_bracketed_ipv6_on_both_sides() {
        let rule = ProxyRule::parse("[::]:9000:[::1]:22").unwrap();
        assert_eq!(rule.bind_host, "::");
        assert_eq!(rule.local_host, "::1");
        assert_eq!(rule.local_port, 22);
    }

    #[test]
    fn rejects_missing_segment() {
        assert!(ProxyRule::parse("0.0.0.0:9000:127.0.0.1").is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(ProxyRule::parse("0.0.0.0:abc:127.0.0.1:22").is_err());
    }
}
