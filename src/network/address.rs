//! Bus address parsing
//!
//! `transport:key=value,key=value;transport:...` with `%XX` escapes in values.

use std::fmt;
use std::path::PathBuf;

use crate::error::AddressError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixAddress {
    Path(PathBuf),
    /// Abstract namespace name, without the leading NUL.
    Abstract(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAddress {
    Unix(UnixAddress),
    Tcp { host: String, port: u16 },
}

impl BusAddress {
    pub fn transport_name(&self) -> &'static str {
        match self {
            BusAddress::Unix(_) => "unix",
            BusAddress::Tcp { .. } => "tcp",
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusAddress::Unix(UnixAddress::Path(p)) => write!(f, "unix:path={}", p.display()),
            BusAddress::Unix(UnixAddress::Abstract(n)) => write!(f, "unix:abstract={n}"),
            BusAddress::Tcp { host, port } => write!(f, "tcp:host={host},port={port}"),
        }
    }
}

/// Parse a `;`-separated list of addresses, in order.
pub fn parse_addresses(input: &str) -> Result<Vec<BusAddress>, AddressError> {
    let addresses = input
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_address)
        .collect::<Result<Vec<_>, _>>()?;
    if addresses.is_empty() {
        return Err(AddressError::Empty);
    }
    Ok(addresses)
}

/// Parse exactly one address.
pub fn parse_address(input: &str) -> Result<BusAddress, AddressError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AddressError::Empty);
    }
    let (transport, rest) = input
        .split_once(':')
        .ok_or_else(|| AddressError::InvalidAddress(format!("missing transport in {input:?}")))?;

    let mut pairs = Vec::new();
    for pair in rest.split(',').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| AddressError::InvalidAddress(format!("expected key=value, got {pair:?}")))?;
        pairs.push((key, unescape(value)?));
    }
    let lookup = |name: &str| {
        pairs
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.clone())
    };

    match transport {
        "unix" => {
            match (lookup("path"), lookup("abstract")) {
                (Some(path), None) => {
                    let path = PathBuf::from(path);
                    if !path.is_absolute() {
                        return Err(AddressError::InvalidAddress(format!(
                            "unix path must be absolute: {}",
                            path.display()
                        )));
                    }
                    Ok(BusAddress::Unix(UnixAddress::Path(path)))
                }
                (None, Some(name)) => {
                    if !name.starts_with('/') {
                        return Err(AddressError::InvalidAddress(format!(
                            "abstract name must start with '/': {name:?}"
                        )));
                    }
                    Ok(BusAddress::Unix(UnixAddress::Abstract(name)))
                }
                (Some(_), Some(_)) => Err(AddressError::InvalidAddress(
                    "unix address has both path and abstract".into(),
                )),
                (None, None) => Err(AddressError::InvalidAddress(
                    "unix address needs path or abstract".into(),
                )),
            }
        }
        "tcp" => {
            let host = lookup("host").unwrap_or_else(|| "localhost".to_string());
            let port = lookup("port")
                .ok_or_else(|| AddressError::InvalidAddress("tcp address needs port".into()))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| AddressError::InvalidAddress(format!("bad tcp port {port:?}")))?;
            Ok(BusAddress::Tcp { host, port })
        }
        other => Err(AddressError::UnsupportedTransport(other.to_string())),
    }
}

fn unescape(value: &str) -> Result<String, AddressError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| AddressError::InvalidAddress(format!("truncated escape in {value:?}")))?;
            let mut decoded = [0u8; 1];
            hex::decode_to_slice(hex, &mut decoded)
                .map_err(|_| AddressError::InvalidAddress(format!("bad escape in {value:?}")))?;
            out.push(decoded[0]);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| AddressError::InvalidAddress(format!("{value:?} is not UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_path() {
        let addr = parse_address("unix:path=/run/dbus/system_bus_socket").unwrap();
        assert_eq!(
            addr,
            BusAddress::Unix(UnixAddress::Path("/run/dbus/system_bus_socket".into()))
        );
    }

    #[test]
    fn test_abstract_ignores_extra_keys() {
        assert_eq!(
            parse_address("unix:abstract=/foo,guid=0123").unwrap(),
            BusAddress::Unix(UnixAddress::Abstract("/foo".into()))
        );
    }

    #[test]
    fn test_relative_path_rejected() {
        assert!(matches!(
            parse_address("unix:path=relative/sock"),
            Err(AddressError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_abstract_requires_leading_slash() {
        assert!(matches!(
            parse_address("unix:abstract=foo"),
            Err(AddressError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_unix_needs_exactly_one_location() {
        assert!(parse_address("unix:guid=1").is_err());
        assert!(parse_address("unix:path=/a,abstract=/b").is_err());
    }

    #[test]
    fn test_unsupported_transport() {
        assert_eq!(
            parse_address("launchd:env=X"),
            Err(AddressError::UnsupportedTransport("launchd".into()))
        );
    }

    #[test]
    fn test_tcp_defaults_host() {
        assert_eq!(
            parse_address("tcp:port=1234").unwrap(),
            BusAddress::Tcp {
                host: "localhost".into(),
                port: 1234
            }
        );
        assert!(parse_address("tcp:host=x").is_err());
    }

    #[test]
    fn test_escapes_and_alternatives() {
        let list = parse_addresses("unix:path=/tmp/a%20b;tcp:host=127.0.0.1,port=9").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0], BusAddress::Unix(UnixAddress::Path("/tmp/a b".into())));
        assert!(parse_address("unix:path=/x%2").is_err());
        assert_eq!(parse_addresses(" ; "), Err(AddressError::Empty));
    }
}
