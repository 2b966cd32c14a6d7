//! Transport collaborators.
//!
//! The channel never touches sockets itself. A [`Connector`] turns an
//! [`Address`] into a connected [`Transport`]; the transport carries framed
//! requests and reports its own liveness through [`Transport::closed`]. A
//! [`Codec`] converts typed messages to and from payload bytes.
//!
//! [`TonicConnector`] is the production connector, built on tonic's HTTP/2
//! channel.

mod http2;

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use wayfinder_types::{Address, Code, Metadata, Status};

pub use self::http2::{TonicConnector, status_from_tonic, status_to_tonic};

/// A single request handed to a transport.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    /// Method path, `/service/method`.
    pub path: String,
    /// Request metadata.
    pub metadata: Metadata,
    /// Time remaining until the call's deadline, if it has one.
    pub timeout: Option<Duration>,
    /// Encoded request message.
    pub payload: Bytes,
}

/// How a transport stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The peer closed the connection cleanly or it idled out.
    Idle,
    /// The connection died.
    Failed(Status),
}

/// A connected byte-stream to one address.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends a unary request and waits for the response payload.
    fn send(&self, request: OutgoingRequest) -> BoxFuture<'static, Result<Bytes, Status>>;

    /// Resolves once the connection is gone.
    fn closed(&self) -> BoxFuture<'static, Disconnect>;

    /// Closes the connection. The default does nothing.
    fn shutdown(&self) {}
}

/// Opens transports.
pub trait Connector: Send + Sync + fmt::Debug {
    /// Connects to `address`. Failures are reported as UNAVAILABLE statuses.
    fn connect(&self, address: &Address) -> BoxFuture<'static, Result<Arc<dyn Transport>, Status>>;
}

/// Message serialization.
pub trait Codec<T>: Send + Sync {
    /// Encodes a message.
    ///
    /// # Errors
    ///
    /// Returns an INTERNAL status when the message cannot be encoded.
    fn encode(&self, message: &T) -> Result<Bytes, Status>;

    /// Decodes a message.
    ///
    /// # Errors
    ///
    /// Returns an INTERNAL status when the payload is malformed.
    fn decode(&self, payload: Bytes) -> Result<T, Status>;
}

/// JSON message codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec {
    fn encode(&self, message: &T) -> Result<Bytes, Status> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| Status::new(Code::Internal, format!("failed to encode message: {e}")))
    }

    fn decode(&self, payload: Bytes) -> Result<T, Status> {
        serde_json::from_slice(&payload)
            .map_err(|e| Status::new(Code::Internal, format!("failed to decode message: {e}")))
    }
}
