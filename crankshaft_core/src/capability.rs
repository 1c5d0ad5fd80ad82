//! Capability kinds and scopes.
//!
//! A [`CapabilityKind`] names one class of core-service operation. The set is
//! closed: adding a kind is a host-version change and bumps
//! [`CAPABILITY_SET_VERSION`]. A [`Scope`] optionally narrows a kind to a
//! subset of resources, matched according to the kind's [`ScopeRule`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of the capability kind set understood by this host.
pub const CAPABILITY_SET_VERSION: u32 = 1;

/// Wildcard segment accepted at the end of prefix-scoped grants.
pub const SCOPE_WILDCARD: &str = "*";

/// Core-service operation classes an extension may be granted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityKind {
    ReadSettings,
    WriteSettings,
    RegisterView,
    NetworkAccess,
    Location,
    Filesystem,
    Event,
    Bluetooth,
    Wireless,
    Audio,
    Contacts,
    Phone,
}

impl CapabilityKind {
    /// Every kind recognized by this host, in declaration order.
    pub const ALL: [CapabilityKind; 12] = [
        Self::ReadSettings,
        Self::WriteSettings,
        Self::RegisterView,
        Self::NetworkAccess,
        Self::Location,
        Self::Filesystem,
        Self::Event,
        Self::Bluetooth,
        Self::Wireless,
        Self::Audio,
        Self::Contacts,
        Self::Phone,
    ];

    /// Stable string id used in manifests and audit records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadSettings => "read-settings",
            Self::WriteSettings => "write-settings",
            Self::RegisterView => "register-view",
            Self::NetworkAccess => "network-access",
            Self::Location => "location",
            Self::Filesystem => "filesystem",
            Self::Event => "event",
            Self::Bluetooth => "bluetooth",
            Self::Wireless => "wireless",
            Self::Audio => "audio",
            Self::Contacts => "contacts",
            Self::Phone => "phone",
        }
    }

    /// User-facing short description.
    pub fn description(self) -> &'static str {
        match self {
            Self::ReadSettings => "Read host settings values",
            Self::WriteSettings => "Change host settings values",
            Self::RegisterView => "Contribute views to the host shell",
            Self::NetworkAccess => "Reach remote network services",
            Self::Location => "Read the current position",
            Self::Filesystem => "Read and write files inside a granted directory",
            Self::Event => "Publish and subscribe to host events",
            Self::Bluetooth => "Discover and pair Bluetooth devices",
            Self::Wireless => "Inspect and configure wireless networks",
            Self::Audio => "Play audio and control volume",
            Self::Contacts => "Read the contact list",
            Self::Phone => "Place and answer calls",
        }
    }

    /// How scopes of this kind are matched.
    pub fn scope_rule(self) -> ScopeRule {
        match self {
            Self::ReadSettings | Self::WriteSettings | Self::RegisterView | Self::Event => {
                ScopeRule::Prefix { separator: '.' }
            }
            Self::Filesystem => ScopeRule::Prefix { separator: '/' },
            _ => ScopeRule::Exact,
        }
    }

    /// Checks that `scope` is well formed for this kind.
    pub fn validate_scope(self, scope: &Scope) -> Result<(), ScopeError> {
        let raw = scope.as_str();
        match self.scope_rule() {
            ScopeRule::Exact => {
                if raw.contains('*') {
                    return Err(ScopeError::WildcardNotAllowed {
                        kind: self,
                        scope: raw.to_string(),
                    });
                }
            }
            ScopeRule::Prefix { separator } => {
                if raw == SCOPE_WILDCARD {
                    return Ok(());
                }
                let misplaced = || ScopeError::MisplacedWildcard {
                    kind: self,
                    scope: raw.to_string(),
                };
                let body = match raw.strip_suffix(SCOPE_WILDCARD) {
                    Some(rest) => rest.strip_suffix(separator).ok_or_else(misplaced)?,
                    None => raw,
                };
                if body.is_empty() || body.contains('*') {
                    return Err(misplaced());
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityKind {
    type Err = UnknownCapabilityKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownCapabilityKind(s.to_string()))
    }
}

/// A capability kind string not recognized by this host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized capability kind: {0}")]
pub struct UnknownCapabilityKind(pub String);

/// Scope matching rule declared per capability kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeRule {
    /// Scopes match only when identical.
    Exact,
    /// `a.b.*` style grants cover every scope below `a.b`.
    Prefix { separator: char },
}

impl ScopeRule {
    /// Returns true when a token granted with `granted` authorizes a request
    /// for `requested`.
    ///
    /// An unscoped grant covers everything; a scoped grant never covers an
    /// unscoped request.
    pub fn permits(self, granted: Option<&Scope>, requested: Option<&Scope>) -> bool {
        let granted = match granted {
            None => return true,
            Some(granted) => granted.as_str(),
        };
        let requested = match requested {
            None => return false,
            Some(requested) => requested.as_str(),
        };
        if granted == requested {
            return true;
        }

        match self {
            ScopeRule::Exact => false,
            ScopeRule::Prefix { separator } => {
                if granted == SCOPE_WILDCARD {
                    return true;
                }
                match wildcard_prefix(granted, separator) {
                    Some(prefix) => {
                        requested == prefix
                            || requested
                                .strip_prefix(prefix)
                                .is_some_and(|rest| rest.starts_with(separator))
                    }
                    None => false,
                }
            }
        }
    }

    /// Returns true when `child` describes a subset of `parent`.
    ///
    /// Used for attenuation: a derived token may only narrow its parent.
    pub fn narrows(self, parent: Option<&Scope>, child: Option<&Scope>) -> bool {
        let child = match child {
            None => return parent.is_none(),
            Some(child) => child,
        };
        let separator = match self {
            ScopeRule::Exact => return self.permits(parent, Some(child)),
            ScopeRule::Prefix { separator } => separator,
        };

        if child.as_str() == SCOPE_WILDCARD {
            return parent.map_or(true, |p| p.as_str() == SCOPE_WILDCARD);
        }
        let prefix = match wildcard_prefix(child.as_str(), separator) {
            Some(prefix) => prefix,
            None => return self.permits(parent, Some(child)),
        };

        // A wildcard child is covered when its own prefix lies under a
        // wildcard parent.
        match parent {
            None => true,
            Some(parent) if parent == child => true,
            Some(parent) if parent.as_str() == SCOPE_WILDCARD => true,
            Some(parent) => {
                wildcard_prefix(parent.as_str(), separator).is_some()
                    && self.permits(Some(parent), Some(&Scope(prefix.to_string())))
            }
        }
    }
}

fn wildcard_prefix(scope: &str, separator: char) -> Option<&str> {
    scope
        .strip_suffix(SCOPE_WILDCARD)
        .and_then(|rest| rest.strip_suffix(separator))
}

/// An optional refinement of a capability kind, such as a settings key
/// prefix (`ui.*`) or a filesystem directory (`/media/*`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Scope(String);

impl Scope {
    /// Parse a scope string.
    pub fn new(value: impl Into<String>) -> Result<Self, ScopeError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(ScopeError::Empty);
        }
        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ScopeError::InvalidCharacters(value));
        }
        Ok(Self(value))
    }

    /// The raw scope string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Scope {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Scope {
    type Error = ScopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.0
    }
}

/// Scope parse and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("scope must not be empty")]
    Empty,

    #[error("scope contains whitespace or control characters: {0:?}")]
    InvalidCharacters(String),

    #[error("capability {kind} does not accept wildcard scopes: {scope}")]
    WildcardNotAllowed { kind: CapabilityKind, scope: String },

    #[error("wildcard must be the final segment of a {kind} scope: {scope}")]
    MisplacedWildcard { kind: CapabilityKind, scope: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(value: &str) -> Scope {
        Scope::new(value).unwrap()
    }

    #[test]
    fn test_kind_round_trips_through_strings() {
        for kind in CapabilityKind::ALL {
            assert_eq!(kind.as_str().parse::<CapabilityKind>().unwrap(), kind);
        }
        assert_eq!(
            "teleport".parse::<CapabilityKind>().unwrap_err(),
            UnknownCapabilityKind("teleport".to_string())
        );
    }

    #[test]
    fn test_kind_serde_uses_kebab_case() {
        let json = serde_json::to_string(&CapabilityKind::ReadSettings).unwrap();
        assert_eq!(json, "\"read-settings\"");
    }

    #[test]
    fn test_prefix_scope_matching() {
        let rule = CapabilityKind::ReadSettings.scope_rule();
        let granted = scope("ui.*");

        assert!(rule.permits(Some(&granted), Some(&scope("ui.language"))));
        assert!(rule.permits(Some(&granted), Some(&scope("ui.theme.accent"))));
        assert!(rule.permits(Some(&granted), Some(&scope("ui"))));
        assert!(!rule.permits(Some(&granted), Some(&scope("uix.language"))));
        assert!(!rule.permits(Some(&granted), Some(&scope("audio.volume"))));
        assert!(!rule.permits(Some(&granted), None));
        assert!(rule.permits(None, Some(&scope("anything.at.all"))));
        assert!(rule.permits(Some(&scope("*")), Some(&scope("audio.volume"))));
    }

    #[test]
    fn test_exact_scope_matching() {
        let rule = CapabilityKind::NetworkAccess.scope_rule();
        let granted = scope("api.weather.example");

        assert!(rule.permits(Some(&granted), Some(&scope("api.weather.example"))));
        assert!(!rule.permits(Some(&granted), Some(&scope("api.weather.example.evil"))));
    }

    #[test]
    fn test_validate_scope() {
        assert!(CapabilityKind::ReadSettings.validate_scope(&scope("ui.*")).is_ok());
        assert!(CapabilityKind::ReadSettings.validate_scope(&scope("*")).is_ok());
        assert!(CapabilityKind::Filesystem.validate_scope(&scope("/media/*")).is_ok());
        assert!(matches!(
            CapabilityKind::ReadSettings.validate_scope(&scope("ui*")),
            Err(ScopeError::MisplacedWildcard { .. })
        ));
        assert!(matches!(
            CapabilityKind::ReadSettings.validate_scope(&scope("ui.*.x")),
            Err(ScopeError::MisplacedWildcard { .. })
        ));
        assert!(matches!(
            CapabilityKind::NetworkAccess.validate_scope(&scope("*.example")),
            Err(ScopeError::WildcardNotAllowed { .. })
        ));
    }

    #[test]
    fn test_narrows() {
        let rule = CapabilityKind::ReadSettings.scope_rule();

        assert!(rule.narrows(None, Some(&scope("ui.*"))));
        assert!(rule.narrows(Some(&scope("ui.*")), Some(&scope("ui.language"))));
        assert!(rule.narrows(Some(&scope("ui.*")), Some(&scope("ui.theme.*"))));
        assert!(rule.narrows(Some(&scope("ui.*")), Some(&scope("ui.*"))));
        assert!(!rule.narrows(Some(&scope("ui.language")), Some(&scope("ui.*"))));
        assert!(!rule.narrows(Some(&scope("ui.*")), Some(&scope("*"))));
        assert!(!rule.narrows(Some(&scope("ui.*")), None));
        assert!(!rule.narrows(Some(&scope("ui.*")), Some(&scope("audio.volume"))));
    }

    #[test]
    fn test_scope_rejects_blank_and_whitespace() {
        assert_eq!(Scope::new("  ").unwrap_err(), ScopeError::Empty);
        assert!(matches!(
            Scope::new("ui. language"),
            Err(ScopeError::InvalidCharacters(_))
        ));
    }
}
