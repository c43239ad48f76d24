//! Networking utilities for proxy clients.
//!
//! This library provides helpers for:
//! - Reading and rewriting `wg-quick` style WireGuard configuration files
//! - WireGuard key validation
//! - MTU validation

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid MTU value.
    #[error("invalid MTU: {value} (must be between {min} and {max})")]
    InvalidMtu { value: u16, min: u16, max: u16 },

    /// Invalid WireGuard key.
    #[error("invalid WireGuard key: {0}")]
    InvalidKey(String),

    /// Malformed configuration line.
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

// ============================================================================
// WireGuard Configuration
// ============================================================================

/// Default WireGuard port.
pub const WIREGUARD_DEFAULT_PORT: u16 = 51820;

/// Default WireGuard MTU.
pub const WIREGUARD_DEFAULT_MTU: u16 = 1420;

/// WireGuard public key (base64-encoded, 32 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WgPublicKey(String);

impl WgPublicKey {
    /// Create from a base64-encoded string.
    pub fn from_base64(s: &str) -> Result<Self, NetworkError> {
        let decoded = STANDARD
            .decode(s)
            .map_err(|_| NetworkError::InvalidKey(format!("invalid base64: {}", s)))?;

        if decoded.len() != 32 {
            return Err(NetworkError::InvalidKey(format!(
                "key must be 32 bytes, got {}",
                decoded.len()
            )));
        }

        Ok(Self(s.to_string()))
    }

    /// Get the base64-encoded key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WgPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Section(String),
    Entry { key: String, value: String },
    /// Comments and blank lines, kept verbatim.
    Other(String),
}

/// A parsed `wg-quick` configuration file.
///
/// Rendering a parsed file reproduces every section, key, comment and blank
/// line in order; only values changed through the setters differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgConfig {
    lines: Vec<Line>,
}

impl WgConfig {
    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self, NetworkError> {
        let mut lines = Vec::new();
        let mut in_section = false;

        for (idx, raw) in text.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                lines.push(Line::Other(raw.to_string()));
                continue;
            }

            if let Some(name) = trimmed.strip_prefix('[') {
                let Some(name) = name.strip_suffix(']') else {
                    return Err(NetworkError::Parse {
                        line: idx + 1,
                        message: format!("unterminated section header '{}'", trimmed),
                    });
                };
                lines.push(Line::Section(name.trim().to_string()));
                in_section = true;
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(NetworkError::Parse {
                    line: idx + 1,
                    message: format!("expected 'Key = Value', got '{}'", trimmed),
                });
            };
            if !in_section {
                return Err(NetworkError::Parse {
                    line: idx + 1,
                    message: "entry outside of any section".to_string(),
                });
            }
            lines.push(Line::Entry {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            });
        }

        Ok(Self { lines })
    }

    /// Render back to `wg-quick` format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Section(name) => {
                    out.push('[');
                    out.push_str(name);
                    out.push(']');
                }
                Line::Entry { key, value } => {
                    out.push_str(key);
                    out.push_str(" = ");
                    out.push_str(value);
                }
                Line::Other(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }

    /// Index range of the entries belonging to the `n`-th section named `name`.
    fn section_range(&self, name: &str, n: usize) -> Option<std::ops::Range<usize>> {
        let start = self
            .lines
            .iter()
            .enumerate()
            .filter(|(_, l)| matches!(l, Line::Section(s) if s.eq_ignore_ascii_case(name)))
            .nth(n)?
            .0
            + 1;
        let end = self.lines[start..]
            .iter()
            .position(|l| matches!(l, Line::Section(_)))
            .map_or(self.lines.len(), |p| start + p);
        Some(start..end)
    }

    fn get(&self, section: &str, key: &str) -> Option<&str> {
        let range = self.section_range(section, 0)?;
        self.lines[range].iter().find_map(|l| match l {
            Line::Entry { key: k, value } if k.eq_ignore_ascii_case(key) => Some(value.as_str()),
            _ => None,
        })
    }

    /// Number of `[Peer]` sections.
    pub fn peer_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| matches!(l, Line::Section(s) if s.eq_ignore_ascii_case("Peer")))
            .count()
    }

    /// `Endpoint` of the first peer, if set.
    pub fn peer_endpoint(&self) -> Option<&str> {
        self.get("Peer", "Endpoint")
    }

    /// `PublicKey` of the first peer.
    pub fn peer_public_key(&self) -> Result<WgPublicKey, NetworkError> {
        let raw = self
            .get("Peer", "PublicKey")
            .ok_or_else(|| NetworkError::Config("peer has no PublicKey".to_string()))?;
        WgPublicKey::from_base64(raw)
    }

    /// Interface MTU, validated, falling back to the WireGuard default.
    pub fn mtu(&self) -> Result<u16, NetworkError> {
        match self.get("Interface", "MTU") {
            None => Ok(WIREGUARD_DEFAULT_MTU),
            Some(raw) => {
                let value = raw
                    .parse::<u16>()
                    .map_err(|_| NetworkError::Config(format!("invalid MTU '{}'", raw)))?;
                validate_mtu(value)
            }
        }
    }

    /// Point the first peer at `endpoint` (`host:port`), returning the
    /// previous value. Adds the key when the peer had none.
    pub fn set_peer_endpoint(&mut self, endpoint: &str) -> Result<Option<String>, NetworkError> {
        let range = self
            .section_range("Peer", 0)
            .ok_or_else(|| NetworkError::Config("no [Peer] section".to_string()))?;

        for line in &mut self.lines[range.clone()] {
            if let Line::Entry { key, value } = line {
                if key.eq_ignore_ascii_case("Endpoint") {
                    return Ok(Some(std::mem::replace(value, endpoint.to_string())));
                }
            }
        }

        // Insert after the last entry so trailing comments stay put.
        let at = self.lines[range.clone()]
            .iter()
            .rposition(|l| matches!(l, Line::Entry { .. }))
            .map_or(range.start, |p| range.start + p + 1);
        self.lines.insert(
            at,
            Line::Entry {
                key: "Endpoint".to_string(),
                value: endpoint.to_string(),
            },
        );
        Ok(None)
    }
}

// ============================================================================
// MTU Configuration
// ============================================================================

/// Minimum MTU for IPv6.
pub const MTU_MIN_IPV6: u16 = 1280;

/// Maximum MTU for jumbo frames.
pub const MTU_MAX_JUMBO: u16 = 9000;

/// Validate an MTU value.
pub fn validate_mtu(mtu: u16) -> Result<u16, NetworkError> {
    if !(MTU_MIN_IPV6..=MTU_MAX_JUMBO).contains(&mtu) {
        return Err(NetworkError::InvalidMtu {
            value: mtu,
            min: MTU_MIN_IPV6,
            max: MTU_MAX_JUMBO,
        });
    }
    Ok(mtu)
}
