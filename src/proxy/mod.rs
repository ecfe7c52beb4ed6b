//! Upstream proxy client used by the mirrored connection modes.
//!
//! A [`Router`] owns at most one TCP connection to the reference server,
//! dialed lazily on first use and reused afterwards. One exchange is in
//! flight at a time; serialization is the connection runner's job (each
//! runner owns its router exclusively).
//!
//! Proxy failures never tear down the client connection: they are reported
//! as a synthesized error response.

use tokio::io::AsyncWriteExt;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tracing::debug;
use tracing::warn;

use crate::error::ProtocolError;
use crate::wire;
use crate::wire::MsgBody;
use crate::wire::MsgHeader;
use crate::wire::OpMsg;

/// Lazily-connected client for one upstream wire-protocol server.
pub struct Router {
    addr: String,
    stream: Option<BufStream<TcpStream>>,
}

impl Router {
    /// Create a router for `addr` without dialing it yet.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
        }
    }

    /// Forward one encoded request and read one response.
    ///
    /// Any failure along the way (dial, write, read, decode) drops the
    /// upstream connection, so the next call re-dials, and yields a
    /// synthesized internal-error response instead of an error.
    pub async fn route(
        &mut self,
        req_header: &MsgHeader,
        req_body: &MsgBody,
    ) -> (MsgHeader, MsgBody) {
        match self.exchange(req_header, req_body).await {
            Ok(response) => response,
            Err(err) => {
                warn!(addr = %self.addr, error = %err, "proxy exchange failed");
                self.stream = None;
                synthesized_error_response(req_header, &err)
            }
        }
    }

    async fn exchange(
        &mut self,
        req_header: &MsgHeader,
        req_body: &MsgBody,
    ) -> anyhow::Result<(MsgHeader, MsgBody)> {
        use anyhow::Context;

        if self.stream.is_none() {
            debug!(addr = %self.addr, "dialing proxy upstream");
            let stream = TcpStream::connect(&self.addr)
                .await
                .with_context(|| format!("failed to dial upstream {}", self.addr))?;
            self.stream = Some(BufStream::new(stream));
        }
        let stream = self.stream.as_mut().expect("stream was just set");

        wire::write_message(stream, req_header, req_body)
            .await
            .context("failed to forward request upstream")?;
        stream
            .flush()
            .await
            .context("failed to flush upstream stream")?;

        let (res_header, res_body) = wire::read_message(stream)
            .await
            .context("failed to read upstream response")?;
        Ok((res_header, res_body))
    }
}

fn synthesized_error_response(req_header: &MsgHeader, err: &anyhow::Error) -> (MsgHeader, MsgBody) {
    let body = MsgBody::Msg(OpMsg::new(
        ProtocolError::internal(format!("proxy: {err:#}")).document(),
    ));

    let header = MsgHeader {
        message_length: (wire::HEADER_LEN + body.marshal().len()) as i32,
        request_id: 0,
        response_to: req_header.request_id,
        op_code: body.op_code(),
    };
    (header, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::document::Value;
    use crate::wire::OpCode;

    #[tokio::test]
    async fn unreachable_upstream_synthesizes_an_error_response() {
        // Reserved port with nothing listening.
        let mut router = Router::new("127.0.0.1:1");

        let body = MsgBody::Msg(OpMsg::new(doc! {"ping" => Value::Int32(1)}));
        let header = MsgHeader {
            message_length: 0,
            request_id: 42,
            response_to: 0,
            op_code: OpCode::Msg,
        };

        let (res_header, res_body) = router.route(&header, &body).await;
        assert_eq!(res_header.response_to, 42);

        let MsgBody::Msg(msg) = res_body else {
            panic!("expected an OP_MSG response");
        };
        assert_eq!(msg.document().get("ok"), Some(&Value::Double(0.0)));
    }
}
