//! Protocol versioning for Tether.
//!
//! The server announces its major version in the `hello` frame; clients
//! refuse to talk to a server with a different major version.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Check the major version announced by a peer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] if the peer speaks another major version.
    pub fn accept_peer(&self, peer_major: u8) -> Result<(), ProtocolError> {
        if self.major == peer_major {
            Ok(())
        } else {
            Err(ProtocolError::Invalid(format!(
                "peer speaks protocol {peer_major}.x, expected {}.x",
                self.major
            )))
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v1_0 = Version::new(1, 0);
        let v1_3 = Version::new(1, 3);
        let v2_0 = Version::new(2, 0);

        assert!(v1_0.is_compatible_with(&v1_3));
        assert!(!v1_0.is_compatible_with(&v2_0));
    }

    #[test]
    fn test_accept_peer() {
        assert!(PROTOCOL_VERSION.accept_peer(1).is_ok());
        assert!(matches!(
            PROTOCOL_VERSION.accept_peer(2),
            Err(ProtocolError::Invalid(_))
        ));
    }
}
