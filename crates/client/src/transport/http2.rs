//! HTTP/2 transport built on tonic.
//!
//! The connector dials the socket itself and hands tonic exactly that one
//! connection. The socket wrapper reports how the connection ended, which is
//! what [`Transport::closed`] resolves with; tonic never reconnects behind
//! the subchannel's back.

use std::{
    future::{Ready, ready},
    io,
    pin::Pin,
    sync::{Arc, LazyLock},
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes};
use futures::{FutureExt, future::BoxFuture};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tonic::{
    codec::{Codec as TonicCodec, DecodeBuf, Decoder, EncodeBuf, Encoder},
    codegen::{
        Service,
        http::{Uri, uri::PathAndQuery},
    },
    metadata::{
        AsciiMetadataKey, AsciiMetadataValue, BinaryMetadataKey, BinaryMetadataValue,
        KeyAndValueRef, MetadataMap,
    },
    transport::{Channel, Endpoint},
};
use wayfinder_types::{Address, Code, Metadata, MetadataValue, Status};

use super::{Connector, Disconnect, OutgoingRequest, Transport};
use crate::deadline::encode_timeout;

/// HTTP/2 keep-alive interval for idle connections.
const HTTP2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// HTTP/2 keep-alive timeout.
const HTTP2_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to TCP addresses over plaintext HTTP/2.
///
/// Each connection is a dedicated tonic [`Channel`] pinned to one socket;
/// load balancing happens above it, in the wayfinder channel.
#[derive(Debug, Clone, bon::Builder)]
pub struct TonicConnector {
    /// HTTP/2 PING interval.
    #[builder(default = HTTP2_KEEPALIVE_INTERVAL)]
    keepalive_interval: Duration,
    /// How long to wait for a PING acknowledgement.
    #[builder(default = HTTP2_KEEPALIVE_TIMEOUT)]
    keepalive_timeout: Duration,
}

impl Default for TonicConnector {
    fn default() -> Self {
        Self::builder().build()
    }
}

static SHARED: LazyLock<Arc<dyn Connector>> = LazyLock::new(|| Arc::new(TonicConnector::default()));

impl TonicConnector {
    /// The process-wide default connector. Channels built without a
    /// connector use it, so they can share subchannels in the global pool.
    #[must_use]
    pub fn shared() -> Arc<dyn Connector> {
        Arc::clone(&SHARED)
    }

    fn configure_endpoint(&self, endpoint: Endpoint) -> Endpoint {
        endpoint
            .http2_keep_alive_interval(self.keepalive_interval)
            .keep_alive_timeout(self.keepalive_timeout)
            .keep_alive_while_idle(true)
    }
}

impl Connector for TonicConnector {
    fn connect(&self, address: &Address) -> BoxFuture<'static, Result<Arc<dyn Transport>, Status>> {
        let connector = self.clone();
        let address = address.clone();
        async move {
            if !address.is_tcp() {
                return Err(Status::new(
                    Code::Unimplemented,
                    format!("{address}: unix domain sockets are not supported over HTTP/2"),
                ));
            }

            let endpoint = Endpoint::from_shared(format!("http://{address}")).map_err(|e| {
                Status::unavailable(format!("invalid endpoint for {address}: {e}"))
            })?;
            let stream = TcpStream::connect(address.to_string())
                .await
                .map_err(|e| Status::unavailable(format!("failed to connect to {address}: {e}")))?;
            if let Err(error) = stream.set_nodelay(true) {
                tracing::trace!(%address, %error, "could not disable Nagle's algorithm");
            }

            let liveness = Arc::new(Liveness::default());
            let stream = MonitoredStream { inner: stream, liveness: Arc::clone(&liveness) };
            let channel = connector
                .configure_endpoint(endpoint)
                .connect_with_connector(SingleConnection::new(stream))
                .await
                .map_err(|e| Status::unavailable(format!("HTTP/2 handshake with {address} failed: {e}")))?;

            tracing::debug!(%address, "HTTP/2 connection established");
            let transport: Arc<dyn Transport> = Arc::new(TonicTransport { channel, liveness });
            Ok(transport)
        }
        .boxed()
    }
}

/// How the socket under a transport ended. The first report wins.
#[derive(Debug, Default)]
struct Liveness {
    outcome: Mutex<Option<Disconnect>>,
    gone: CancellationToken,
}

impl Liveness {
    fn report(&self, disconnect: Disconnect) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            tracing::trace!(?disconnect, "HTTP/2 connection ended");
            *outcome = Some(disconnect);
            self.gone.cancel();
        }
    }

    async fn ended(&self) -> Disconnect {
        self.gone.cancelled().await;
        self.outcome.lock().clone().unwrap_or(Disconnect::Idle)
    }
}

/// A TCP stream that reports EOF as a clean close and I/O errors as
/// failures. Being dropped, which is how hyper lets go of a dead
/// connection, counts as a clean close.
#[derive(Debug)]
struct MonitoredStream {
    inner: TcpStream,
    liveness: Arc<Liveness>,
}

impl MonitoredStream {
    fn observe<T>(&self, result: &Poll<io::Result<T>>) {
        if let Poll::Ready(Err(error)) = result {
            self.liveness.report(Disconnect::Failed(Status::unavailable(format!("connection error: {error}"))));
        }
    }
}

impl AsyncRead for MonitoredStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        this.observe(&result);
        if matches!(result, Poll::Ready(Ok(()))) && buf.filled().len() == before && buf.remaining() > 0 {
            this.liveness.report(Disconnect::Idle);
        }
        result
    }
}

impl AsyncWrite for MonitoredStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.observe(&result);
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_flush(cx);
        this.observe(&result);
        result
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.observe(&result);
        result
    }
}

impl Drop for MonitoredStream {
    fn drop(&mut self) {
        self.liveness.report(Disconnect::Idle);
    }
}

/// Connector service handing tonic one already-dialed socket. Every later
/// request fails, so tonic cannot reconnect on its own.
#[derive(Debug, Clone)]
struct SingleConnection {
    stream: Arc<Mutex<Option<MonitoredStream>>>,
}

impl SingleConnection {
    fn new(stream: MonitoredStream) -> Self {
        Self { stream: Arc::new(Mutex::new(Some(stream))) }
    }
}

impl Service<Uri> for SingleConnection {
    type Response = TokioIo<MonitoredStream>;
    type Error = io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        ready(self.stream.lock().take().map(TokioIo::new).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "connection closed; the subchannel reconnects")
        }))
    }
}

#[derive(Debug)]
struct TonicTransport {
    channel: Channel,
    liveness: Arc<Liveness>,
}

impl Transport for TonicTransport {
    fn send(&self, request: OutgoingRequest) -> BoxFuture<'static, Result<Bytes, Status>> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        async move {
            let path = PathAndQuery::try_from(request.path.as_str()).map_err(|e| {
                Status::new(Code::Internal, format!("invalid method path '{}': {e}", request.path))
            })?;

            let mut outgoing = tonic::Request::new(request.payload);
            *outgoing.metadata_mut() = metadata_to_tonic(&request.metadata);
            if let Some(timeout) = request.timeout {
                let encoded = encode_timeout(timeout)?;
                let value = encoded.parse::<AsciiMetadataValue>().map_err(|e| {
                    Status::new(Code::Internal, format!("invalid grpc-timeout '{encoded}': {e}"))
                })?;
                outgoing.metadata_mut().insert("grpc-timeout", value);
            }

            grpc.ready().await.map_err(|e| Status::unavailable(e.to_string()))?;
            grpc.unary(outgoing, path, RawCodec)
                .await
                .map(tonic::Response::into_inner)
                .map_err(|status| status_from_tonic(&status))
        }
        .boxed()
    }

    fn closed(&self) -> BoxFuture<'static, Disconnect> {
        let liveness = Arc::clone(&self.liveness);
        async move { liveness.ended().await }.boxed()
    }

    fn shutdown(&self) {
        self.liveness.report(Disconnect::Idle);
    }
}

/// Passes payload bytes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
struct RawCodec;

impl TonicCodec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawCodec;
    type Decoder = RawCodec;

    fn encoder(&mut self) -> Self::Encoder {
        RawCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawCodec
    }
}

impl Encoder for RawCodec {
    type Item = Bytes;
    type Error = tonic::Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for RawCodec {
    type Item = Bytes;
    type Error = tonic::Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let len = src.remaining();
        Ok(Some(src.copy_to_bytes(len)))
    }
}

fn metadata_to_tonic(metadata: &Metadata) -> MetadataMap {
    let mut map = MetadataMap::new();
    for (key, value) in metadata.iter() {
        match value {
            MetadataValue::Ascii(text) => {
                let (Ok(key), Ok(value)) = (
                    AsciiMetadataKey::from_bytes(key.as_bytes()),
                    AsciiMetadataValue::try_from(text.as_str()),
                ) else {
                    tracing::trace!(key, "dropping metadata entry tonic rejects");
                    continue;
                };
                map.append(key, value);
            },
            MetadataValue::Binary(bytes) => {
                let Ok(key) = BinaryMetadataKey::from_bytes(key.as_bytes()) else {
                    tracing::trace!(key, "dropping metadata entry tonic rejects");
                    continue;
                };
                map.append_bin(key, BinaryMetadataValue::from_bytes(bytes));
            },
        }
    }
    map
}

fn metadata_from_tonic(map: &MetadataMap) -> Metadata {
    let mut metadata = Metadata::new();
    for entry in map.iter() {
        let appended = match entry {
            KeyAndValueRef::Ascii(key, value) => match value.to_str() {
                Ok(text) => metadata.append(key.as_str(), text).is_ok(),
                Err(_) => false,
            },
            KeyAndValueRef::Binary(key, value) => match value.to_bytes() {
                Ok(bytes) => metadata.append_binary(key.as_str(), bytes.to_vec()).is_ok(),
                Err(_) => false,
            },
        };
        if !appended {
            tracing::trace!("dropping undecodable response metadata entry");
        }
    }
    metadata
}

/// Converts a tonic status, keeping its code, message and metadata.
#[must_use]
pub fn status_from_tonic(status: &tonic::Status) -> Status {
    Status::builder()
        .code(Code::from_i32(status.code() as i32))
        .details(status.message())
        .metadata(metadata_from_tonic(status.metadata()))
        .build()
}

/// Converts a status for a tonic-based peer.
#[must_use]
pub fn status_to_tonic(status: &Status) -> tonic::Status {
    tonic::Status::with_metadata(
        tonic::Code::from_i32(status.code().as_i32()),
        status.details(),
        metadata_to_tonic(status.metadata()),
    )
}
