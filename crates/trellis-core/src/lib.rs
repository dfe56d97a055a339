//! # trellis-core
//!
//! Session tracking, message dispatch, and idle reaping for the Trellis
//! gateway.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Session** - Per-connection state with a serialized send path
//! - **SessionRegistry** - Every live connection, by id, with broadcast
//! - **Dispatcher** - Two-level (`route`, `type`) demultiplexer with the
//!   reserved client-management behavior built in
//! - **IdleReaper** - Periodic eviction of dead and abandoned connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│ Dispatcher  │────▶│ RouteHandler│
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   │
//!        ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐
//! │   Session   │◀────│  Registry   │◀──── IdleReaper
//! └─────────────┘     └─────────────┘
//! ```

pub mod dispatch;
pub mod error;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod testing;

pub use dispatch::{Dispatcher, RouteHandler};
pub use error::CoreError;
pub use reaper::{IdleReaper, ReaperConfig};
pub use registry::{SessionRegistry, DEFAULT_MAX_IN_FLIGHT};
pub use session::{EnvelopeSink, Session};
