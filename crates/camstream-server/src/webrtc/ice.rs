//! STUN/TURN server URLs
//!
//! Accepts `[(stun|turn|turns)(:|://)][username:password@]hostname[:port][?transport=(udp|tcp|tls)]`,
//! the same shape for server defaults and for hints supplied by callers.

use std::fmt;
use std::str::FromStr;

use camstream_protocol::{IceServerDescription, IceServerKind, RelayType};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_STUN_PORT: u16 = 3478;
pub const DEFAULT_TURNS_PORT: u16 = 5349;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IceServerError {
    #[error("empty ICE server")]
    Empty,

    #[error("unsupported ICE server scheme: {0}")]
    Scheme(String),

    #[error("missing hostname in ICE server: {0}")]
    Hostname(String),

    #[error("invalid port in ICE server: {0}")]
    Port(String),

    #[error("unsupported transport in ICE server: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub kind: IceServerKind,
    pub relay_type: RelayType,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn parse(input: &str) -> Result<Self, IceServerError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(IceServerError::Empty);
        }

        let (scheme, rest) = split_scheme(input)?;
        let (kind, mut relay_type) = match scheme {
            "stun" => (IceServerKind::Stun, RelayType::TurnUdp),
            "turn" => (IceServerKind::Turn, RelayType::TurnUdp),
            "turns" => (IceServerKind::Turn, RelayType::TurnTls),
            other => return Err(IceServerError::Scheme(other.to_string())),
        };

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };

        if let Some(query) = query {
            for param in query.split('&') {
                if let Some(transport) = param.strip_prefix("transport=") {
                    relay_type = match (transport, relay_type) {
                        ("udp", RelayType::TurnUdp) => RelayType::TurnUdp,
                        ("tcp", RelayType::TurnTls) => RelayType::TurnTls,
                        ("tcp", _) => RelayType::TurnTcp,
                        ("tls", _) => RelayType::TurnTls,
                        _ => return Err(IceServerError::Transport(input.to_string())),
                    };
                }
            }
        }

        let (credentials, address) = match rest.rsplit_once('@') {
            Some((credentials, address)) => (Some(credentials), address),
            None => (None, rest),
        };
        let (username, credential) = match credentials {
            Some(credentials) => match credentials.split_once(':') {
                Some((user, pass)) => (user.to_string(), pass.to_string()),
                None => (credentials.to_string(), String::new()),
            },
            None => (String::new(), String::new()),
        };

        let default_port = if relay_type == RelayType::TurnTls {
            DEFAULT_TURNS_PORT
        } else {
            DEFAULT_STUN_PORT
        };
        let (hostname, port) = split_host_port(address, input)?;
        if hostname.is_empty() {
            return Err(IceServerError::Hostname(input.to_string()));
        }

        Ok(Self {
            kind,
            relay_type,
            hostname: hostname.to_string(),
            port: port.unwrap_or(default_port),
            username,
            credential,
        })
    }

    /// Parse a comma separated list, e.g. from configuration
    pub fn parse_list(list: &str) -> Result<Vec<Self>, IceServerError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// URL in the form RTCIceServer.urls expects
    pub fn url(&self) -> String {
        let host = if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        };

        match (self.kind, self.relay_type) {
            (IceServerKind::Stun, _) => format!("stun:{}:{}", host, self.port),
            (IceServerKind::Turn, RelayType::TurnUdp) => {
                format!("turn:{}:{}?transport=udp", host, self.port)
            }
            (IceServerKind::Turn, RelayType::TurnTcp) => {
                format!("turn:{}:{}?transport=tcp", host, self.port)
            }
            (IceServerKind::Turn, RelayType::TurnTls) => {
                format!("turns:{}:{}?transport=tcp", host, self.port)
            }
        }
    }

    pub fn describe(&self) -> IceServerDescription {
        IceServerDescription {
            hostname: self.hostname.clone(),
            port: self.port,
            kind: self.kind,
            relay_type: self.relay_type,
        }
    }
}

impl FromStr for IceServer {
    type Err = IceServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for IceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

fn split_scheme(input: &str) -> Result<(&str, &str), IceServerError> {
    if let Some((scheme, rest)) = input.split_once("://") {
        return Ok((scheme, rest));
    }

    for scheme in ["stun", "turns", "turn"] {
        if let Some(rest) = input
            .strip_prefix(scheme)
            .and_then(|rest| rest.strip_prefix(':'))
        {
            return Ok((scheme, rest));
        }
    }

    Ok(("stun", input))
}

fn split_host_port<'a>(
    address: &'a str,
    input: &str,
) -> Result<(&'a str, Option<u16>), IceServerError> {
    let (host, port) = if let Some(bracketed) = address.strip_prefix('[') {
        let (host, rest) = bracketed
            .split_once(']')
            .ok_or_else(|| IceServerError::Hostname(input.to_string()))?;
        (host, rest.strip_prefix(':'))
    } else {
        match address.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (address, None),
        }
    };

    let port = port
        .map(|p| {
            p.parse::<u16>()
                .map_err(|_| IceServerError::Port(input.to_string()))
        })
        .transpose()?;

    Ok((host, port))
}

/// Merge server defaults with caller-supplied hints.
///
/// Hints are dropped entirely when `disable_client_ice` is set; otherwise
/// non-string and unparseable entries are skipped.
pub fn merge_ice_servers(
    defaults: &[IceServer],
    hints: &[Value],
    disable_client_ice: bool,
) -> Vec<IceServer> {
    let mut servers = defaults.to_vec();

    for hint in hints {
        let Some(hint) = hint.as_str() else {
            tracing::debug!("ICE server hint is not a string, ignoring");
            continue;
        };

        if disable_client_ice {
            tracing::debug!(hint, "Ignoring ICE server hint, client ICE servers are disabled");
            continue;
        }

        match IceServer::parse(hint) {
            Ok(server) => {
                tracing::debug!(hint, "Added ICE server from request");
                servers.push(server);
            }
            Err(e) => tracing::warn!(hint, "Ignoring ICE server hint: {}", e),
        }
    }

    servers
}
