//! Capability Registry
//!
//! Issues, checks and revokes capability tokens. Every identity owns an
//! arena of tokens behind its own lock, so grant, check and revoke for one
//! identity are linearizable while different identities never contend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crankshaft_core::capability::{CapabilityKind, Scope};
use crankshaft_core::error::{display_scope, CapabilityError};
use crankshaft_core::id::ExtensionId;

use crate::token::{CapabilityToken, TokenHandle};

type Result<T> = std::result::Result<T, CapabilityError>;

/// Per-identity token arena.
#[derive(Debug, Default)]
struct IdentityTable {
    tokens: Vec<CapabilityToken>,

    /// Set once `revoke_all` starts; no grant may succeed afterwards.
    closing: bool,
}

impl IdentityTable {
    fn has_active_exact(&self, kind: CapabilityKind, scope: Option<&Scope>) -> bool {
        self.tokens
            .iter()
            .any(|t| !t.is_revoked() && t.is_exactly(kind, scope))
    }

    fn token(&self, handle: TokenHandle) -> Result<&CapabilityToken> {
        self.tokens
            .get(handle.slot())
            .filter(|t| t.handle() == handle)
            .ok_or(CapabilityError::InvalidHandle)
    }

    fn push(
        &mut self,
        owner: ExtensionId,
        kind: CapabilityKind,
        scope: Option<Scope>,
        parent: Option<TokenHandle>,
    ) -> TokenHandle {
        let handle = TokenHandle::new(owner, self.tokens.len());
        self.tokens
            .push(CapabilityToken::issue(handle, kind, scope, parent));
        if let Some(parent) = parent {
            if let Some(parent) = self.tokens.get_mut(parent.slot()) {
                parent.children.push(handle.slot());
            }
        }
        handle
    }

    /// Revoke the given slots and everything attenuated from them.
    fn revoke_slots(&mut self, roots: Vec<usize>) -> usize {
        let mut stack = roots;
        let mut revoked = 0;
        while let Some(slot) = stack.pop() {
            if let Some(token) = self.tokens.get_mut(slot) {
                if token.revoke() {
                    revoked += 1;
                }
                stack.extend(token.children.iter().copied());
            }
        }
        revoked
    }

    fn slots_where(&self, predicate: impl Fn(&CapabilityToken) -> bool) -> Vec<usize> {
        self.tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_revoked() && predicate(t))
            .map(|(slot, _)| slot)
            .collect()
    }
}

/// The authority for which identity holds which capability.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    identities: DashMap<ExtensionId, Arc<Mutex<IdentityTable>>>,
    halted: AtomicBool,
    halt_reason: RwLock<Option<String>>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, identity: ExtensionId) -> Result<Arc<Mutex<IdentityTable>>> {
        // Clone the Arc so the map shard lock is released before the table lock is taken.
        self.identities
            .get(&identity)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(CapabilityError::UnknownIdentity(identity))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.halted.load(Ordering::SeqCst) {
            let reason = self
                .halt_reason
                .read()
                .clone()
                .unwrap_or_else(|| "integrity violation".to_string());
            return Err(CapabilityError::RegistryHalted(reason));
        }
        Ok(())
    }

    /// Make an identity known to the registry. Registering twice is a no-op.
    pub fn register_identity(&self, identity: ExtensionId) {
        self.identities.entry(identity).or_default();
        debug!(identity = %identity, "Registered extension identity");
    }

    /// Returns true if the identity is registered and not yet forgotten.
    pub fn is_registered(&self, identity: ExtensionId) -> bool {
        self.identities.contains_key(&identity)
    }

    /// All registered identities.
    pub fn identities(&self) -> Vec<ExtensionId> {
        self.identities.iter().map(|entry| *entry.key()).collect()
    }

    /// Returns true once an integrity violation stopped further grants.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Grant a capability to an identity.
    ///
    /// # Arguments
    ///
    /// * `identity` - The registered identity receiving the grant.
    /// * `kind` - The capability kind.
    /// * `scope` - Optional refinement; `None` grants the whole capability.
    ///
    /// # Returns
    ///
    /// * `Ok(TokenHandle)` - Handle of the newly issued token.
    /// * `Err(CapabilityError)` - Unknown identity, duplicate active grant,
    ///   closing identity, malformed scope, or a halted registry.
    pub fn grant(
        &self,
        identity: ExtensionId,
        kind: CapabilityKind,
        scope: Option<Scope>,
    ) -> Result<TokenHandle> {
        self.ensure_running()?;
        if let Some(scope) = &scope {
            kind.validate_scope(scope)?;
        }

        let table = self.table(identity)?;
        let mut table = table.lock();

        if table.closing {
            return Err(CapabilityError::IdentityClosing(identity));
        }
        if table.has_active_exact(kind, scope.as_ref()) {
            return Err(CapabilityError::DuplicateGrant {
                identity,
                kind,
                scope,
            });
        }

        let scope_label = display_scope(&scope);
        let handle = table.push(identity, kind, scope, None);
        info!(identity = %identity, kind = %kind, scope = %scope_label, "Granted capability");
        Ok(handle)
    }

    /// Returns true iff an active token of `identity` covers `(kind, scope)`.
    pub fn check(
        &self,
        identity: ExtensionId,
        kind: CapabilityKind,
        scope: Option<&Scope>,
    ) -> Result<bool> {
        let table = self.table(identity)?;
        let table = table.lock();
        Ok(table
            .tokens
            .iter()
            .any(|t| !t.is_revoked() && t.covers(kind, scope)))
    }

    /// Like [`check`](Self::check), but reports why access is refused.
    ///
    /// Returns the handle of the first active covering token, otherwise
    /// `CapabilityRevoked` when only revoked tokens would have covered the
    /// request, and `CapabilityDenied` when nothing ever did.
    pub fn authorize(
        &self,
        identity: ExtensionId,
        kind: CapabilityKind,
        scope: Option<&Scope>,
    ) -> Result<TokenHandle> {
        let table = self.table(identity)?;
        let table = table.lock();

        let mut saw_revoked = false;
        for token in table.tokens.iter().filter(|t| t.covers(kind, scope)) {
            if !token.is_revoked() {
                return Ok(token.handle());
            }
            saw_revoked = true;
        }

        let scope = scope.cloned();
        if saw_revoked {
            Err(CapabilityError::CapabilityRevoked { kind, scope })
        } else {
            Err(CapabilityError::CapabilityDenied { kind, scope })
        }
    }

    /// Revoke the tokens granted for exactly `(kind, scope)`, along with any
    /// token attenuated from them.
    ///
    /// `scope = None` targets only the unscoped grant of `kind`; use
    /// [`revoke_kind`](Self::revoke_kind) to remove every scope. Revoking
    /// something already revoked, or never granted, is a no-op.
    ///
    /// # Returns
    ///
    /// The number of tokens newly revoked.
    pub fn revoke(
        &self,
        identity: ExtensionId,
        kind: CapabilityKind,
        scope: Option<&Scope>,
    ) -> Result<usize> {
        let table = self.table(identity)?;
        let mut table = table.lock();

        let roots = table.slots_where(|t| t.is_exactly(kind, scope));
        let revoked = table.revoke_slots(roots);
        if revoked > 0 {
            let scope_label = display_scope(&scope.cloned());
            info!(identity = %identity, kind = %kind, scope = %scope_label, revoked, "Revoked capability");
        }
        Ok(revoked)
    }

    /// Revoke every token of `kind` held by `identity`, whatever its scope.
    pub fn revoke_kind(&self, identity: ExtensionId, kind: CapabilityKind) -> Result<usize> {
        let table = self.table(identity)?;
        let mut table = table.lock();

        let roots = table.slots_where(|t| t.kind() == kind);
        let revoked = table.revoke_slots(roots);
        if revoked > 0 {
            info!(identity = %identity, kind = %kind, revoked, "Revoked capability kind");
        }
        Ok(revoked)
    }

    /// Revoke a single token and its descendants.
    pub fn revoke_handle(&self, handle: TokenHandle) -> Result<usize> {
        let table = self.table(handle.owner())?;
        let mut table = table.lock();

        table.token(handle)?;
        let revoked = table.revoke_slots(vec![handle.slot()]);
        debug!(identity = %handle.owner(), slot = handle.slot(), revoked, "Revoked token");
        Ok(revoked)
    }

    /// Revoke everything an identity holds and forget the identity.
    ///
    /// The identity is marked closing under its lock before any token is
    /// touched, so no grant can interleave with the teardown. Afterwards
    /// every operation on the identity fails with `UnknownIdentity`.
    pub fn revoke_all(&self, identity: ExtensionId) -> Result<usize> {
        let table = self.table(identity)?;
        let mut guard = table.lock();

        if guard.closing {
            return Err(CapabilityError::IdentityClosing(identity));
        }
        guard.closing = true;

        let all = (0..guard.tokens.len()).collect();
        let revoked = guard.revoke_slots(all);
        self.identities.remove(&identity);
        drop(guard);

        info!(identity = %identity, revoked, "Revoked all capabilities");
        Ok(revoked)
    }

    /// Derive a token whose scope is covered by the parent token's scope.
    ///
    /// The child is owned by the same identity and is revoked whenever the
    /// parent is.
    pub fn attenuate(&self, parent: TokenHandle, scope: Option<Scope>) -> Result<TokenHandle> {
        self.ensure_running()?;

        let identity = parent.owner();
        let table = self.table(identity)?;
        let mut table = table.lock();

        if table.closing {
            return Err(CapabilityError::IdentityClosing(identity));
        }

        let parent_token = table.token(parent)?;
        let kind = parent_token.kind();
        if parent_token.is_revoked() {
            return Err(CapabilityError::CapabilityRevoked {
                kind,
                scope: parent_token.scope().cloned(),
            });
        }
        if let Some(scope) = &scope {
            kind.validate_scope(scope)?;
        }
        if !kind.scope_rule().narrows(parent_token.scope(), scope.as_ref()) {
            return Err(CapabilityError::ScopeEscalation {
                kind,
                parent: parent_token.scope().cloned(),
                requested: scope,
            });
        }
        if table.has_active_exact(kind, scope.as_ref()) {
            return Err(CapabilityError::DuplicateGrant {
                identity,
                kind,
                scope,
            });
        }

        let handle = table.push(identity, kind, scope, Some(parent));
        debug!(identity = %identity, kind = %kind, parent = parent.slot(), "Attenuated capability");
        Ok(handle)
    }

    /// Snapshot of every token, active or revoked, held by `identity`.
    pub fn tokens(&self, identity: ExtensionId) -> Result<Vec<CapabilityToken>> {
        let table = self.table(identity)?;
        let table = table.lock();
        Ok(table.tokens.clone())
    }

    /// Number of active tokens held by `identity`.
    pub fn active_count(&self, identity: ExtensionId) -> Result<usize> {
        let table = self.table(identity)?;
        let table = table.lock();
        Ok(table.tokens.iter().filter(|t| !t.is_revoked()).count())
    }

    /// Check registry invariants and halt further grants on any violation.
    ///
    /// Verified per identity: every token belongs to the identity that holds
    /// it and sits in its own slot, no two active tokens share a
    /// `(kind, scope)`, parents precede children, and no active token
    /// descends from a revoked one.
    pub fn verify_integrity(&self) -> Result<()> {
        self.ensure_running()?;

        // Snapshot first: revoke_all removes map entries while holding a table lock.
        let tables: Vec<(ExtensionId, Arc<Mutex<IdentityTable>>)> = self
            .identities
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        for (identity, table) in tables {
            let table = table.lock();

            if let Some(reason) = find_violation(identity, &table) {
                return Err(self.halt(reason));
            }
        }

        debug!(identities = self.identities.len(), "Registry integrity verified");
        Ok(())
    }

    fn halt(&self, reason: String) -> CapabilityError {
        error!(reason = %reason, "Capability registry integrity violation, halting grants");
        *self.halt_reason.write() = Some(reason.clone());
        self.halted.store(true, Ordering::SeqCst);
        CapabilityError::RegistryHalted(reason)
    }
}

fn find_violation(identity: ExtensionId, table: &IdentityTable) -> Option<String> {
    let mut active = std::collections::HashSet::new();

    for (slot, token) in table.tokens.iter().enumerate() {
        if token.owner() != identity || token.handle().slot() != slot {
            return Some(format!("token in slot {slot} of {identity} is misfiled"));
        }
        if !token.is_revoked() && !active.insert((token.kind(), token.scope().cloned())) {
            return Some(format!(
                "{identity} holds duplicate active {} tokens",
                token.kind()
            ));
        }
        if let Some(parent) = token.parent() {
            let Some(parent_token) = table.tokens.get(parent.slot()).filter(|_| parent.slot() < slot)
            else {
                warn!(identity = %identity, slot, "Token parent is out of order");
                return Some(format!("token in slot {slot} of {identity} has a dangling parent"));
            };
            if parent_token.is_revoked() && !token.is_revoked() {
                return Some(format!(
                    "token in slot {slot} of {identity} outlived its revoked parent"
                ));
            }
        }
    }
    None
}
