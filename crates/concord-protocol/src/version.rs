//! Protocol version negotiation

use crate::error::ProtocolError;
use crate::Result;

/// Version string exchanged in the `peer.init` request
pub const PROTOCOL_VERSION: &str = "0.0.1";

/// Check a peer's announced version against ours
pub fn check(remote: &str) -> Result<()> {
    if remote == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(ProtocolError::VersionMismatch {
            local: PROTOCOL_VERSION.to_string(),
            remote: remote.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_version_accepted() {
        assert!(check(PROTOCOL_VERSION).is_ok());
    }

    #[test]
    fn test_mismatch_rejected() {
        let err = check("9.9.9").unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { .. }));
    }
}
