//! Minimal HTTP/1.1 transfer protocol served during a sync session.
//!
//! Three endpoints, one request per connection (`Connection: close`):
//!
//! - `GET /api/files` — JSON array of note names and sizes
//! - `GET /notes/<filename>` — raw note content, streamed in fixed chunks
//! - `POST /api/sync-complete` — peer signals it is finished
//!
//! The handler is generic over [`embedded_io_async::Write`] so the firmware
//! can hand it a TCP socket and tests can hand it a buffer. Request bodies
//! are ignored; only the request line matters.

use core::fmt::Write as _;

use alloc::string::String;
use embassy_time::Instant;
use embedded_io_async::Write;
use log::{debug, warn};

use crate::config::DOWNLOAD_CHUNK;
use crate::creds::KvStore;
use crate::engine::{SyncEngine, SyncRadio};
use crate::files::{CatalogKind, FileStore};
use crate::storage::StorageService;

const NOTES_PREFIX: &str = "/notes/";

/// Response head buffer. Status line plus three short headers.
type HeadString = heapless::String<128>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A parsed request line. The head buffer outlives the request, so the path
/// is borrowed rather than copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
}

/// Parse the request line out of a raw request head. Returns `None` for
/// anything that is not a well-formed `GET`/`POST` line.
pub fn parse_request(head: &str) -> Option<Request<'_>> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = match parts.next()? {
        "GET" => Method::Get,
        "POST" => Method::Post,
        _ => return None,
    };
    let path = parts.next()?;
    if !path.starts_with('/') {
        return None;
    }
    Some(Request { method, path })
}

/// Serve one request and write the full response to `socket`.
///
/// Every request counts as activity for the idle timeout, including ones
/// that produce an error response.
pub async fn handle<S, R, K, W>(
    engine: &mut SyncEngine<R, K>,
    files: &mut FileStore<S>,
    request: &Request<'_>,
    socket: &mut W,
    now: Instant,
) -> Result<(), W::Error>
where
    S: StorageService,
    R: SyncRadio,
    K: KvStore,
    W: Write,
{
    engine.note_activity(now);
    debug!("request: {:?} {}", request.method, request.path);

    match (request.method, request.path) {
        (Method::Get, "/api/files") => send_file_list(files, socket).await,
        (Method::Post, "/api/sync-complete") => {
            send_text(socket, 200, "OK").await?;
            engine.complete_sync(now);
            Ok(())
        }
        (Method::Get, path) if path.starts_with(NOTES_PREFIX) => {
            send_note(engine, files, &path[NOTES_PREFIX.len()..], socket).await
        }
        _ => send_text(socket, 404, "Not found").await,
    }
}

async fn send_file_list<S: StorageService, W: Write>(
    files: &mut FileStore<S>,
    socket: &mut W,
) -> Result<(), W::Error> {
    // Re-scan so the peer sees notes created since the session began.
    if let Err(e) = files.refresh(CatalogKind::Notes) {
        warn!("file list refresh failed: {e}");
        return send_response(socket, 500, "application/json", b"[]").await;
    }

    let mut body = String::new();
    body.push('[');
    for i in 0..files.notes().len() {
        let name = files.notes()[i].filename.clone();
        let size = files.note_size(&name).unwrap_or(0);
        if i > 0 {
            body.push(',');
        }
        body.push_str("{\"name\":\"");
        for c in name.chars() {
            if c == '"' || c == '\\' {
                body.push('\\');
            }
            body.push(c);
        }
        let _ = write!(body, "\",\"size\":{size}}}");
    }
    body.push(']');

    send_response(socket, 200, "application/json", body.as_bytes()).await
}

async fn send_note<S, R, K, W>(
    engine: &mut SyncEngine<R, K>,
    files: &mut FileStore<S>,
    name: &str,
    socket: &mut W,
) -> Result<(), W::Error>
where
    S: StorageService,
    R: SyncRadio,
    K: KvStore,
    W: Write,
{
    // The path segment must be a bare filename.
    if name.is_empty() || name.contains('/') {
        return send_text(socket, 404, "Not found").await;
    }
    let size = match files.note_size(name) {
        Ok(size) => size,
        Err(e) => {
            warn!("download of {name} refused: {e}");
            return send_text(socket, 404, "Not found").await;
        }
    };

    socket
        .write_all(head(200, "text/plain", size).as_bytes())
        .await?;

    let mut buf = [0u8; DOWNLOAD_CHUNK];
    let mut offset = 0u64;
    while offset < size {
        let n = match files.read_note_at(name, offset, &mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                // The length was already promised; the peer sees a short
                // body and discards the transfer.
                warn!("read of {name} failed at offset {offset}: {e}");
                break;
            }
        };
        socket.write_all(&buf[..n]).await?;
        offset += n as u64;
    }

    engine.record_sent(name);
    Ok(())
}

async fn send_text<W: Write>(socket: &mut W, status: u16, body: &str) -> Result<(), W::Error> {
    send_response(socket, status, "text/plain", body.as_bytes()).await
}

async fn send_response<W: Write>(
    socket: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<(), W::Error> {
    socket
        .write_all(head(status, content_type, body.len() as u64).as_bytes())
        .await?;
    socket.write_all(body).await
}

fn head(status: u16, content_type: &str, content_length: u64) -> HeadString {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let mut head = HeadString::new();
    let _ = write!(
        head,
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\n\
         Content-Length: {content_length}\r\nConnection: close\r\n\r\n"
    );
    head
}
