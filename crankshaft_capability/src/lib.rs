//! # Crankshaft Capability
//!
//! Capability-based mediation between extensions and core services.
//!
//! Key concepts:
//!
//! 1. **Token**: an unforgeable, individually revocable grant of one
//!    capability kind (optionally scoped) to one extension identity.
//!
//! 2. **Registry**: the single authority on which identity holds which
//!    token; revocation there takes effect before the revoking call returns.
//!
//! 3. **Proxy**: the only call surface extensions get. It authorizes,
//!    audits, then forwards.
//!
//! 4. **Audit log**: an append-only record of every mediated call.

pub mod audit;
pub mod proxy;
pub mod registry;
pub mod token;

pub use audit::{
    AuditEntry, AuditLog, AuditOutcome, AuditQuery, AuditRecord, AuditStore, JsonlAuditStore,
    MemoryAuditStore,
};
pub use proxy::{CoreService, ExtensionProxy, ServiceRequest, ServiceTable};
pub use registry::CapabilityRegistry;
pub use token::{CapabilityToken, TokenHandle};
