//! Shared helpers for integration tests: an in-process server and a raw
//! wire-protocol client.

#![allow(dead_code)] // not every test binary uses every helper

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use larch::backend::inmemory::MemoryBackend;
use larch::clientconn;
use larch::clientconn::ConnOpts;
use larch::clientconn::Mode;
use larch::document::Document;
use larch::handler::BackendHandler;
use larch::metrics::ConnMetrics;
use larch::wire;
use larch::wire::MsgBody;
use larch::wire::MsgHeader;
use larch::wire::OpCode;
use larch::wire::OpMsg;

/// An in-process server over its own in-memory backend.
pub struct TestServer {
    /// Bound address to connect clients to.
    pub addr: SocketAddr,
    /// The server's shared counters.
    pub metrics: Arc<ConnMetrics>,
    token: CancellationToken,
}

impl TestServer {
    /// Start a `normal`-mode server.
    pub async fn start() -> Self {
        Self::start_with(Mode::Normal, None, None).await
    }

    /// Start a server with the given mode, upstream, and recording dir.
    pub async fn start_with(
        mode: Mode,
        proxy_addr: Option<String>,
        record_dir: Option<PathBuf>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let metrics = Arc::new(ConnMetrics::new());
        let token = CancellationToken::new();

        let opts = ConnOpts {
            mode,
            handler: Arc::new(BackendHandler::new(MemoryBackend::new())),
            metrics: Arc::clone(&metrics),
            proxy_addr,
            record_dir,
            max_message_len: wire::MAX_MESSAGE_LEN,
        };

        let server_token = token.clone();
        tokio::spawn(async move {
            let _ = clientconn::serve(listener, opts, server_token).await;
        });

        Self {
            addr,
            metrics,
            token,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Raw wire-protocol client driving one TCP connection.
pub struct TestClient {
    stream: TcpStream,
    next_request_id: i32,
}

impl TestClient {
    /// Connect to a server.
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            next_request_id: 0,
        }
    }

    /// Send one message and return the request id used.
    pub async fn send(&mut self, op_code: OpCode, body: &MsgBody) -> i32 {
        self.next_request_id += 1;
        let header = MsgHeader {
            message_length: 0, // recomputed on write
            request_id: self.next_request_id,
            response_to: 0,
            op_code,
        };
        wire::write_message(&mut self.stream, &header, body)
            .await
            .unwrap();
        self.stream.flush().await.unwrap();
        self.next_request_id
    }

    /// Send raw bytes as-is.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Read one message.
    pub async fn read(&mut self) -> (MsgHeader, MsgBody) {
        wire::read_message(&mut self.stream).await.unwrap()
    }

    /// Read, expecting the stream to be closed by the server instead.
    pub async fn read_closed(&mut self) -> bool {
        wire::read_message(&mut self.stream).await.is_err()
    }

    /// Send a command document as OP_MSG and return (request id, response
    /// header, response document).
    pub async fn command(&mut self, document: Document) -> (i32, MsgHeader, Document) {
        let request_id = self
            .send(OpCode::Msg, &MsgBody::Msg(OpMsg::new(document)))
            .await;
        let (header, body) = self.read().await;
        let MsgBody::Msg(msg) = body else {
            panic!("expected an OP_MSG response, got {}", header.op_code);
        };
        (request_id, header, msg.document().clone())
    }

    /// Close the sending half without reading further.
    pub async fn shutdown(mut self) {
        self.stream.shutdown().await.unwrap();
    }
}
