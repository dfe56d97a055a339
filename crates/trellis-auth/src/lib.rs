//! # trellis-auth
//!
//! Credential subsystem for the trellis session gateway.
//!
//! This crate owns three concerns:
//!
//! - **Claims** - the signed, time-bounded payload bound to one session
//! - **TokenAuthority** - HS256 issue/validate with a proactive refresh window
//! - **UserDirectory** - principal lookup and password verification behind a
//!   seam, so the gateway never depends on where users are stored
//!
//! Login attempts (success and failure alike) are reported through the
//! [`AuditSink`] seam; the default implementation writes structured logs.

pub mod audit;
pub mod authority;
pub mod claims;
pub mod directory;
pub mod error;

pub use audit::{AuditSink, TracingAudit};
pub use authority::{IssuedToken, TokenAuthority};
pub use claims::Claims;
pub use directory::{ApiUser, InMemoryDirectory, Principal, UserDirectory};
pub use error::AuthError;
