// ABOUTME: Jump host address parsing.
// ABOUTME: Parses formats like "host", "user@host", "host:port", "user@host:port".

use serde::Deserialize;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
}

impl HostSpec {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("host address cannot be empty".to_string());
        }

        // [user@]host[:port]
        let (user_part, rest) = match s.rfind('@') {
            Some(at_pos) => (Some(&s[..at_pos]), &s[at_pos + 1..]),
            None => (None, s),
        };

        if user_part.is_some_and(str::is_empty) {
            return Err("user cannot be empty".to_string());
        }

        let (host, port) = if let Some(inner) = rest.strip_prefix('[') {
            // [v6::addr] or [v6::addr]:port
            let close = inner
                .find(']')
                .ok_or_else(|| format!("unterminated IPv6 address: {}", rest))?;
            let host = &inner[..close];
            let after = &inner[close + 1..];
            let port = match after.strip_prefix(':') {
                Some(port_str) => parse_port(port_str)?,
                None if after.is_empty() => DEFAULT_SSH_PORT,
                None => return Err(format!("unexpected text after address: {}", after)),
            };
            (host, port)
        } else if let Some(colon_pos) = rest.rfind(':') {
            (&rest[..colon_pos], parse_port(&rest[colon_pos + 1..])?)
        } else {
            (rest, DEFAULT_SSH_PORT)
        };

        if host.is_empty() {
            return Err("hostname cannot be empty".to_string());
        }

        Ok(HostSpec {
            user: user_part.map(|s| s.to_string()),
            host: host.to_string(),
            port,
        })
    }
}

fn parse_port(port_str: &str) -> Result<u16, String> {
    port_str
        .parse::<u16>()
        .map_err(|_| format!("invalid port: {}", port_str))
}

impl std::fmt::Display for HostSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl std::str::FromStr for HostSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for HostSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        HostSpec::parse(&s).map_err(serde::de::Error::custom)
    }
}
