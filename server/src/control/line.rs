//! Line protocol over TCP for operators: `METHOD path [json body]` in,
//! `status [json body]` out, one call per line

use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::ErrorResponse;
use super::router::{ControlResponse, ControlRouter};

/// Longest request line accepted, newline included
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, PartialEq)]
enum RequestLine {
    Line(String),
    /// Over `MAX_LINE_BYTES`; the rest of it was skipped
    TooLong,
    Closed,
}

/// Read one line, never buffering more than `MAX_LINE_BYTES` of it
async fn read_request_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<RequestLine> {
    buf.clear();
    let read = (&mut *reader)
        .take(MAX_LINE_BYTES as u64)
        .read_until(b'\n', buf)
        .await?;
    if read == 0 {
        return Ok(RequestLine::Closed);
    }
    if buf.last() == Some(&b'\n') || read < MAX_LINE_BYTES {
        return Ok(RequestLine::Line(String::from_utf8_lossy(buf).into_owned()));
    }

    loop {
        buf.clear();
        let read = (&mut *reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', buf)
            .await?;
        if read == 0 || buf.last() == Some(&b'\n') {
            return Ok(RequestLine::TooLong);
        }
    }
}

/// Split a request line into method, path and body
pub fn parse_line(line: &str) -> Option<(&str, &str, &str)> {
    let line = line.trim();
    let (method, rest) = line.split_once(char::is_whitespace)?;
    let rest = rest.trim_start();
    let (path, body) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    if path.is_empty() {
        return None;
    }
    Some((method, path, body.trim()))
}

pub fn render(response: &ControlResponse) -> String {
    match &response.body {
        Some(body) => format!("{} {}\n", response.status, body),
        None => format!("{}\n", response.status),
    }
}

pub async fn serve(listener: TcpListener, router: Arc<ControlRouter>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Control listener stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!(addr = %addr, "Control client connected");
                    let router = router.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, &router).await {
                            warn!(addr = %addr, error = %e, "Control client failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Control accept failed"),
            }
        }
    }
}

async fn handle_client(stream: TcpStream, router: &ControlRouter) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        let response = match read_request_line(&mut reader, &mut buf).await? {
            RequestLine::Closed => return Ok(()),
            RequestLine::TooLong => {
                warn!(max = MAX_LINE_BYTES, "Control line too long, skipped");
                bad_line(format!("Line exceeds {MAX_LINE_BYTES} bytes"))
            }
            RequestLine::Line(line) if line.trim().is_empty() => continue,
            RequestLine::Line(line) => match parse_line(&line) {
                Some((method, path, body)) => router.route(method, path, body.as_bytes()).await,
                None => bad_line("Expected: METHOD path [body]"),
            },
        };
        write_response(&mut writer, &response).await?;
    }
}

fn bad_line(message: impl Into<String>) -> ControlResponse {
    let error = ErrorResponse::bad_request(message);
    ControlResponse {
        status: error.http_status,
        body: serde_json::to_value(error).ok(),
    }
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &ControlResponse) -> std::io::Result<()> {
    writer.write_all(render(response).as_bytes()).await?;
    writer.flush().await
}
