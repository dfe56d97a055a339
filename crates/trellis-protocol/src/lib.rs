//! # trellis-protocol
//!
//! Wire envelope definitions for the trellis session gateway.
//!
//! Every message on a persistent connection is a single JSON object, an
//! [`Envelope`]. Requests are dispatched on the (`route`, `type`) pair;
//! responses are stamped with the session id and a server timestamp before
//! they hit the wire.
//!
//! ## Example
//!
//! ```rust
//! use trellis_protocol::{codec, reserved, Envelope};
//!
//! let envelope = Envelope::request(reserved::CLIENT_ROUTE, reserved::types::KEEPALIVE);
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.routing(), envelope.routing());
//! ```

pub mod codec;
pub mod envelope;
pub mod error;
pub mod reserved;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{Credentials, Envelope};
pub use error::{ApiError, ErrorPayload};
