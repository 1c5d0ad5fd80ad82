//! Capability tokens and the opaque handles that name them.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crankshaft_core::capability::{CapabilityKind, Scope};
use crankshaft_core::id::ExtensionId;

/// Opaque reference to one token in the registry.
///
/// Handles can only be minted inside this crate. The registry resolves a
/// handle against its owner's arena, so a handle is meaningless outside the
/// identity it was issued to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TokenHandle {
    owner: ExtensionId,
    slot: usize,
}

impl TokenHandle {
    pub(crate) fn new(owner: ExtensionId, slot: usize) -> Self {
        Self { owner, slot }
    }

    /// The identity this handle belongs to.
    pub fn owner(&self) -> ExtensionId {
        self.owner
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }
}

/// A grant of one capability kind, optionally scoped, to one identity.
///
/// Tokens are owned by the registry. Callers only ever see clones taken as
/// snapshots; revocation flips `revoked` in the registry's copy.
#[derive(Clone, Debug, Serialize)]
pub struct CapabilityToken {
    handle: TokenHandle,
    kind: CapabilityKind,
    scope: Option<Scope>,
    issued_at: DateTime<Utc>,
    revoked: bool,
    parent: Option<TokenHandle>,
    #[serde(skip)]
    pub(crate) children: Vec<usize>,
}

impl CapabilityToken {
    pub(crate) fn issue(
        handle: TokenHandle,
        kind: CapabilityKind,
        scope: Option<Scope>,
        parent: Option<TokenHandle>,
    ) -> Self {
        Self {
            handle,
            kind,
            scope,
            issued_at: Utc::now(),
            revoked: false,
            parent,
            children: Vec::new(),
        }
    }

    pub fn handle(&self) -> TokenHandle {
        self.handle
    }

    pub fn owner(&self) -> ExtensionId {
        self.handle.owner
    }

    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked
    }

    /// The token this one was attenuated from, if any.
    pub fn parent(&self) -> Option<TokenHandle> {
        self.parent
    }

    /// Returns true when this token, if active, authorizes `(kind, scope)`.
    pub fn covers(&self, kind: CapabilityKind, scope: Option<&Scope>) -> bool {
        self.kind == kind && kind.scope_rule().permits(self.scope.as_ref(), scope)
    }

    /// Returns true when the token was granted for exactly `(kind, scope)`.
    pub fn is_exactly(&self, kind: CapabilityKind, scope: Option<&Scope>) -> bool {
        self.kind == kind && self.scope.as_ref() == scope
    }

    /// Mark revoked. Returns true if the token was active before the call.
    pub(crate) fn revoke(&mut self) -> bool {
        !std::mem::replace(&mut self.revoked, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoke_is_monotonic() {
        let handle = TokenHandle::new(ExtensionId::new(), 0);
        let mut token = CapabilityToken::issue(handle, CapabilityKind::Audio, None, None);

        assert!(!token.is_revoked());
        assert!(token.revoke());
        assert!(!token.revoke());
        assert!(token.is_revoked());
    }

    #[test]
    fn test_covers_uses_scope_rule() {
        let handle = TokenHandle::new(ExtensionId::new(), 0);
        let token = CapabilityToken::issue(
            handle,
            CapabilityKind::ReadSettings,
            Some(Scope::new("ui.*").unwrap()),
            None,
        );

        assert!(token.covers(CapabilityKind::ReadSettings, Some(&Scope::new("ui.language").unwrap())));
        assert!(!token.covers(CapabilityKind::WriteSettings, Some(&Scope::new("ui.language").unwrap())));
        assert!(!token.covers(CapabilityKind::ReadSettings, None));
        assert!(token.is_exactly(CapabilityKind::ReadSettings, Some(&Scope::new("ui.*").unwrap())));
    }
}
