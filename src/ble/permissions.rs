//! Capability gating.
//!
//! The host platform decides whether the radio may be used; the session
//! asks before every scan or connect and never attempts a transport call
//! without all capabilities granted.

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A runtime capability required to use the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Capability {
    /// Permission to scan for advertisements.
    Scan,
    /// Permission to open links to peripherals.
    Connect,
    /// Location access (required for scanning on some platforms).
    Location,
}

impl Capability {
    /// Every capability the session checks, in check order.
    pub const ALL: [Capability; 3] = [Capability::Scan, Capability::Connect, Capability::Location];
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scan => write!(f, "Scan"),
            Self::Connect => write!(f, "Connect"),
            Self::Location => write!(f, "Location"),
        }
    }
}

/// Answers whether a capability is currently granted.
#[cfg_attr(test, mockall::automock)]
pub trait PermissionGate: Send + Sync {
    /// Check a single capability.
    fn has_capability(&self, capability: Capability) -> bool;
}

/// A gate that grants everything.
///
/// Suitable for desktop platforms where the OS prompts on first use.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantAll;

impl PermissionGate for GrantAll {
    fn has_capability(&self, _capability: Capability) -> bool {
        true
    }
}

/// Require every capability, failing on the first missing one.
pub fn require_capabilities(gate: &dyn PermissionGate) -> Result<()> {
    for capability in Capability::ALL {
        let granted = gate.has_capability(capability);
        debug!("Permission check - {}: {}", capability, granted);

        if !granted {
            warn!("Required capability {} not granted", capability);
            return Err(Error::PermissionDenied { capability });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[test]
    fn test_grant_all() {
        assert!(require_capabilities(&GrantAll).is_ok());
    }

    #[test]
    fn test_missing_capability_reported() {
        let mut gate = MockPermissionGate::new();
        gate.expect_has_capability()
            .with(eq(Capability::Scan))
            .return_const(true);
        gate.expect_has_capability()
            .with(eq(Capability::Connect))
            .return_const(false);
        gate.expect_has_capability()
            .with(eq(Capability::Location))
            .never();

        match require_capabilities(&gate) {
            Err(Error::PermissionDenied { capability }) => {
                assert_eq!(capability, Capability::Connect)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_capability_display() {
        assert_eq!(format!("{}", Capability::Location), "Location");
    }
}
