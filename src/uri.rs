//! Resource locators: `file://`, `rtp://` and `rtsp://`

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Transport a stream is received over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    File,
    Rtp,
    Rtsp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::File => "file",
            Protocol::Rtp => "rtp",
            Protocol::Rtsp => "rtsp",
        }
    }

    pub fn is_network(self) -> bool {
        !matches!(self, Protocol::File)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed resource locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    /// Original string as given
    pub string: String,
    pub protocol: Protocol,
    /// File path for `file`, host for network protocols
    pub location: String,
    /// Request path for rtsp (`/test` in `rtsp://host:8554/test`), empty otherwise
    pub path: String,
    pub port: Option<u16>,
    /// Lower-cased file extension, empty when absent
    pub extension: String,
}

impl Uri {
    /// Parse `scheme://location`. Strings without a scheme are file paths.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ConfigError::EmptyResource);
        }

        let (scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("file".to_string(), input),
        };

        let protocol = match scheme.as_str() {
            "file" => Protocol::File,
            "rtp" => Protocol::Rtp,
            "rtsp" => Protocol::Rtsp,
            _ => return Err(ConfigError::UnsupportedProtocol(scheme)),
        };

        match protocol {
            Protocol::File => {
                let extension = Path::new(rest)
                    .extension()
                    .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
                    .unwrap_or_default();
                Ok(Self {
                    string: input.to_string(),
                    protocol,
                    location: rest.to_string(),
                    path: String::new(),
                    port: None,
                    extension,
                })
            }
            Protocol::Rtp | Protocol::Rtsp => {
                let (authority, path) = match rest.find('/') {
                    Some(idx) => (&rest[..idx], &rest[idx..]),
                    None => (rest, ""),
                };
                let (host, port) = split_port(authority, input)?;
                Ok(Self {
                    string: input.to_string(),
                    protocol,
                    location: host.to_string(),
                    path: path.to_string(),
                    port,
                    extension: String::new(),
                })
            }
        }
    }

    /// Filesystem path of a `file` resource.
    pub fn file_path(&self) -> Option<PathBuf> {
        (self.protocol == Protocol::File).then(|| PathBuf::from(&self.location))
    }

    /// Multicast group to join for rtp, `None` when listening on any interface.
    pub fn multicast_group(&self) -> Option<&str> {
        match self.location.as_str() {
            "" | "@" | "0.0.0.0" => None,
            host => Some(host),
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string)
    }
}

fn split_port<'a>(authority: &'a str, input: &str) -> Result<(&'a str, Option<u16>), ConfigError> {
    // bracketed IPv6 hosts keep their colons
    let port_sep = match authority.rfind(']') {
        Some(end) => authority[end..].find(':').map(|idx| idx + end),
        None => authority.rfind(':'),
    };

    let Some(idx) = port_sep else {
        return Ok((authority, None));
    };

    let port = authority[idx + 1..]
        .parse::<u16>()
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| ConfigError::InvalidPort(input.to_string()))?;
    Ok((&authority[..idx], Some(port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtp_any_interface() {
        let uri = Uri::parse("rtp://@:5000").unwrap();
        assert_eq!(uri.protocol, Protocol::Rtp);
        assert_eq!(uri.port, Some(5000));
        assert_eq!(uri.multicast_group(), None);
    }

    #[test]
    fn rtp_multicast_group() {
        let uri = Uri::parse("rtp://224.0.0.1:1234").unwrap();
        assert_eq!(uri.multicast_group(), Some("224.0.0.1"));
        assert_eq!(uri.port, Some(1234));
    }

    #[test]
    fn rtsp_keeps_path() {
        let uri = Uri::parse("rtsp://127.0.0.1:8554/test").unwrap();
        assert_eq!(uri.protocol, Protocol::Rtsp);
        assert_eq!(uri.location, "127.0.0.1");
        assert_eq!(uri.path, "/test");
        assert_eq!(uri.port, Some(8554));
        assert_eq!(uri.to_string(), "rtsp://127.0.0.1:8554/test");
    }

    #[test]
    fn bare_path_is_file() {
        let uri = Uri::parse("/data/clips/Video.MKV").unwrap();
        assert_eq!(uri.protocol, Protocol::File);
        assert_eq!(uri.extension, "mkv");
        assert_eq!(uri.file_path(), Some(PathBuf::from("/data/clips/Video.MKV")));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(Uri::parse("  "), Err(ConfigError::EmptyResource));
        assert!(matches!(
            Uri::parse("v4l2:///dev/video0"),
            Err(ConfigError::UnsupportedProtocol(p)) if p == "v4l2"
        ));
        assert!(matches!(Uri::parse("rtp://@:0"), Err(ConfigError::InvalidPort(_))));
        assert!(matches!(Uri::parse("rtp://@:port"), Err(ConfigError::InvalidPort(_))));
    }
}
