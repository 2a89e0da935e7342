//! Wire layer shared by both ends of a connection.
//!
//! # Architecture
//!
//! - **protocol**: frame kinds and the Request/Response/CancellationRequest envelopes
//! - **codec**: `[kind][len][payload]` framing over AsyncRead/AsyncWrite
//! - **slice**: bounded inbound stream bodies and declared-length outbound bodies

pub mod codec;
pub mod protocol;
pub mod slice;
