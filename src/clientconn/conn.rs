//! Per-connection runner: the loop that reads, dispatches, mirrors, diffs,
//! and writes.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use futures::FutureExt;
use similar::TextDiff;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::BufWriter;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::command;
use crate::document::Value;
use crate::error::ProtocolError;
use crate::handler::Handler;
use crate::handler::RequestContext;
use crate::metrics::ConnMetrics;
use crate::proxy::Router;
use crate::wire;
use crate::wire::MsgBody;
use crate::wire::MsgHeader;
use crate::wire::OpCode;
use crate::wire::OpMsg;
use crate::wire::HEADER_LEN;

use super::mode::Mode;
use super::recorder::Recorder;
use super::recorder::RecordingReader;

/// Options for one connection runner.
#[derive(Clone)]
pub struct ConnOpts {
    /// Operation mode.
    pub mode: Mode,
    /// The command-semantics collaborator.
    pub handler: Arc<dyn Handler>,
    /// Shared request/response counters.
    pub metrics: Arc<ConnMetrics>,
    /// Upstream address; required for every mode except `normal`.
    pub proxy_addr: Option<String>,
    /// Directory for raw traffic recordings; disabled when `None`.
    pub record_dir: Option<PathBuf>,
    /// Upper bound on a message's declared length.
    pub max_message_len: i32,
}

pub(super) struct Conn {
    mode: Mode,
    handler: Arc<dyn Handler>,
    metrics: Arc<ConnMetrics>,
    proxy: Option<Router>,
    record_dir: Option<PathBuf>,
    max_message_len: i32,
    last_request_id: AtomicI32,
}

struct Routed {
    header: MsgHeader,
    body: Option<MsgBody>,
    close_conn: bool,
}

impl Conn {
    pub(super) fn new(opts: ConnOpts) -> anyhow::Result<Self> {
        let proxy = if opts.mode.proxies() {
            let addr = opts
                .proxy_addr
                .with_context(|| format!("mode {} requires a proxy address", opts.mode))?;
            Some(Router::new(addr))
        } else {
            None
        };

        Ok(Self {
            mode: opts.mode,
            handler: opts.handler,
            metrics: opts.metrics,
            proxy,
            record_dir: opts.record_dir,
            max_message_len: opts.max_message_len,
            last_request_id: AtomicI32::new(0),
        })
    }

    /// Run the connection until the client disconnects, the context is
    /// canceled, or a fatal error or panic is encountered.
    ///
    /// `Ok(())` means a clean zero-read disconnect; the caller closes the
    /// socket either way.
    pub(super) async fn run(
        mut self,
        stream: TcpStream,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        let recorder = match &self.record_dir {
            Some(dir) => {
                Some(Recorder::create(dir).context("failed to create traffic recording")?)
            }
            None => None,
        };

        let mut reader = BufReader::new(RecordingReader::new(read_half, recorder));
        let mut writer = BufWriter::new(write_half);

        let cx = RequestContext { token, peer_addr };

        let served = AssertUnwindSafe(self.serve(&mut reader, &mut writer, &cx))
            .catch_unwind()
            .await;
        let result = match served {
            Ok(result) => result,
            Err(payload) => {
                let payload = panic_message(payload.as_ref());
                error!(panic = %payload, "connection runner panicked");
                Err(anyhow::anyhow!("connection runner panicked: {payload}"))
            }
        };

        // Flush whatever buffered output remains; a flush failure only
        // surfaces if the loop itself ended cleanly.
        let result = match (result, writer.flush().await) {
            (Ok(()), Err(err)) => Err(err).context("failed to flush response stream"),
            (result, _) => result,
        };

        if let Some(recorder) = reader.get_mut().take_recorder() {
            if result.is_ok() {
                match recorder.commit() {
                    Ok(path) => debug!(path = %path.display(), "traffic recording stored"),
                    Err(err) => warn!(error = %err, "failed to store traffic recording"),
                }
            } else {
                recorder.discard();
            }
        }

        result
    }

    async fn serve<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        cx: &RequestContext,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let message = tokio::select! {
                message = wire::read_message_limited(reader, self.max_message_len) => message,
                () = cx.token.cancelled() => bail!("connection context canceled"),
            };

            let (req_header, req_body) = match message {
                Ok(message) => message,
                Err(err) if err.is_zero_read() => return Ok(()),
                Err(err) if err.is_validation() => {
                    // Answer on the wire and keep reading; the framing may
                    // still be intact.
                    debug!(error = %err, "request failed validation");

                    let (op_code, response_to) = match err.request_header() {
                        Some(header) => (header.op_code, header.request_id),
                        None => (OpCode::Msg, 0),
                    };
                    let body =
                        MsgBody::Msg(OpMsg::new(ProtocolError::from_validation(&err).document()));
                    let header = MsgHeader {
                        message_length: (HEADER_LEN + body.marshal().len()) as i32,
                        request_id: self.next_request_id(),
                        response_to,
                        op_code,
                    };

                    wire::write_message(writer, &header, &body)
                        .await
                        .context("failed to write validation error response")?;
                    writer
                        .flush()
                        .await
                        .context("failed to flush validation error response")?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            debug!(header = %req_header, "request");

            // Mirror to the upstream first: local handling may freeze or
            // normalize the request documents, and the proxy encoder must
            // see them untouched.
            let proxy_response = match &mut self.proxy {
                Some(router) if self.mode.proxies() => {
                    Some(router.route(&req_header, &req_body).await)
                }
                _ => None,
            };

            let mut diff_severity = Severity::Debug;

            let local_response = if self.mode.handles() {
                let routed = self.route(cx, &req_header, &req_body).await;
                diff_severity = diff_severity.max(log_response(
                    "response",
                    &routed.header,
                    routed.body.as_ref(),
                    routed.close_conn,
                ));
                Some(routed)
            } else {
                None
            };

            // Logged after the local response to keep the two readable in
            // sequence.
            if let Some((header, body)) = &proxy_response {
                diff_severity =
                    diff_severity.max(log_response("proxy response", header, Some(body), false));
            }

            if self.mode.diffs() {
                let (proxy_header, proxy_body) = proxy_response
                    .as_ref()
                    .expect("diff mode requires a proxy response");
                let local = local_response
                    .as_ref()
                    .expect("diff mode requires a local response");

                let header_diff = unified_diff(
                    &local.header.to_string(),
                    &proxy_header.to_string(),
                    "res header",
                    "proxy header",
                );
                let body_diff = unified_diff(
                    &local
                        .body
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    &proxy_body.to_string(),
                    "res body",
                    "proxy body",
                );

                // Agreeing bodies diff at debug; diverging ones are at least
                // a warning. Headers always differ (independent id counters)
                // and do not drive the level.
                let diff_level = if body_diff.is_empty() {
                    Severity::Debug
                } else {
                    diff_severity.max(Severity::Warn)
                };
                log_at(
                    diff_level,
                    &format!("header diff:\n{header_diff}\nbody diff:\n{body_diff}"),
                );
            }

            let close_conn = local_response
                .as_ref()
                .map(|routed| routed.close_conn)
                .unwrap_or(false);

            let (res_header, res_body) = if self.mode.responds_from_proxy() {
                let (header, body) =
                    proxy_response.expect("proxy-responding mode requires a proxy response");
                (header, Some(body))
            } else {
                let routed = local_response.expect("handling mode requires a local response");
                (routed.header, routed.body)
            };

            match res_body {
                Some(body) => {
                    wire::write_message(writer, &res_header, &body)
                        .await
                        .context("failed to write response")?;
                    writer.flush().await.context("failed to flush response")?;
                }
                // The routing error was already logged; nothing to send.
                None if close_conn => {}
                None => panic!("no response to send to client"),
            }

            if close_conn {
                bail!("fatal handler error");
            }
        }
    }

    /// Dispatch one request to the handler, producing the response header,
    /// optional body, and the close flag.
    async fn route(
        &self,
        cx: &RequestContext,
        req_header: &MsgHeader,
        req_body: &MsgBody,
    ) -> Routed {
        let mut command = String::from("unknown");
        let mut argument = String::from("unknown");
        let result: String;

        let mut res_op = req_header.op_code;
        let mut close_conn = false;
        let mut body: Option<MsgBody> = None;

        match req_body {
            MsgBody::Msg(msg) => {
                command = msg.document().command().to_owned();
                res_op = OpCode::Msg;

                let dispatched =
                    AssertUnwindSafe(command::dispatch(self.handler.as_ref(), cx, msg))
                        .catch_unwind()
                        .await;
                match dispatched {
                    Ok(Ok(response)) => {
                        body = Some(MsgBody::Msg(response));
                        result = "ok".to_owned();
                    }
                    Ok(Err(err)) => {
                        if let Some(arg) = err.argument() {
                            argument = arg.to_owned();
                        }
                        result = err.result_label().to_owned();
                        body = Some(MsgBody::Msg(OpMsg::new(err.document())));
                    }
                    Err(payload) => {
                        // Handlers must not panic on bad input; one that
                        // does takes the connection down with it.
                        result = "panic".to_owned();
                        close_conn = true;
                        error!(
                            command = %command,
                            panic = %panic_message(payload.as_ref()),
                            "handler panicked",
                        );
                    }
                }
            }

            MsgBody::Query(query) => {
                command = query.query.command().to_owned();
                res_op = OpCode::Reply;

                match self.handler.cmd_query(cx, query).await {
                    Ok(reply) => {
                        body = Some(MsgBody::Reply(reply));
                        result = "ok".to_owned();
                    }
                    Err(err) => {
                        // There is no error framing for OP_REPLY here.
                        close_conn = true;
                        result = "unhandled".to_owned();
                        error!(
                            opcode = %req_header.op_code,
                            error = %err,
                            "handler error for unhandled response opcode",
                        );
                    }
                }
            }

            // OP_REPLY is a response form; receiving one as a request is as
            // fatal as any other unrouted opcode.
            MsgBody::Reply(_) => {
                close_conn = true;
                result = "unhandled".to_owned();
                error!(opcode = %req_header.op_code, "handler error for unhandled opcode");
            }

            MsgBody::Legacy { op_code, .. } if op_code.is_known() => {
                close_conn = true;
                result = "unhandled".to_owned();
                error!(opcode = %op_code, "handler error for unhandled opcode");
            }

            MsgBody::Legacy { op_code, .. } => {
                close_conn = true;
                result = "unexpected".to_owned();
                error!(opcode = %op_code, "handler error for unexpected opcode");
            }
        }

        self.metrics
            .inc_request(&req_header.op_code.to_string(), &command);

        let header = MsgHeader {
            message_length: body
                .as_ref()
                .map(|body| (HEADER_LEN + body.marshal().len()) as i32)
                .unwrap_or(HEADER_LEN as i32),
            request_id: self.next_request_id(),
            response_to: req_header.request_id,
            op_code: res_op,
        };

        self.metrics
            .inc_response(&res_op.to_string(), &command, &argument, &result);

        Routed {
            header,
            body,
            close_conn,
        }
    }

    fn next_request_id(&self) -> i32 {
        self.last_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Logging severity for one response, most severe last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Severity {
    Debug,
    Warn,
    Error,
}

fn log_at(severity: Severity, message: &str) {
    match severity {
        Severity::Debug => debug!("{message}"),
        Severity::Warn => warn!("{message}"),
        Severity::Error => error!("{message}"),
    }
}

/// Log a response and report the severity it deserved: debug when it is an
/// ok-response, warning when it carries an error, error when the connection
/// is going down with it.
fn log_response(
    who: &str,
    header: &MsgHeader,
    body: Option<&MsgBody>,
    close_conn: bool,
) -> Severity {
    let mut severity = Severity::Debug;
    if let Some(MsgBody::Msg(msg)) = body {
        let ok = matches!(msg.document().get("ok"), Some(Value::Double(ok)) if *ok == 1.0);
        if !ok {
            severity = if close_conn {
                Severity::Error
            } else {
                Severity::Warn
            };
        }
    }

    log_at(severity, &format!("{who} header: {header}"));
    log_at(
        severity,
        &format!(
            "{who} message:\n{}",
            body.map(ToString::to_string).unwrap_or_default()
        ),
    );
    severity
}

fn unified_diff(local: &str, proxy: &str, from: &str, to: &str) -> String {
    TextDiff::from_lines(local, proxy)
        .unified_diff()
        .context_radius(1)
        .header(from, to)
        .to_string()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
