//! HTTP transfer server task.
//!
//! One socket, one request per connection. The listener only accepts while
//! the engine is in its serving window; outside it the task naps and the
//! port is closed.

use embassy_net::Stack;
use embassy_net::tcp::TcpSocket;
use embassy_time::{Duration, Instant, Timer, with_timeout};
use log::{debug, warn};

use quill_core::config::HTTP_PORT;
use quill_core::protocol;

use crate::CoreMutex;

const SOCKET_BUF: usize = 2048;
/// Request heads are a single line plus a few headers; anything bigger is
/// not a sync client.
const MAX_HEAD: usize = 1024;

#[embassy_executor::task]
pub async fn http_task(stack: Stack<'static>, core: &'static CoreMutex) {
    let mut rx_buffer = [0u8; SOCKET_BUF];
    let mut tx_buffer = [0u8; SOCKET_BUF];
    let mut head = [0u8; MAX_HEAD];

    loop {
        if !core.lock().await.engine.is_serving() {
            Timer::after(Duration::from_millis(250)).await;
            continue;
        }

        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(Some(Duration::from_secs(10)));

        // Bounded accept so the serving gate is re-checked when the session
        // ends without a connection.
        let accepted = with_timeout(Duration::from_secs(1), socket.accept(HTTP_PORT)).await;
        match accepted {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("accept failed: {e:?}");
                continue;
            }
            Err(_) => continue,
        }
        debug!("client connected: {:?}", socket.remote_endpoint());

        let len = match read_head(&mut socket, &mut head).await {
            Some(len) => len,
            None => {
                socket.abort();
                continue;
            }
        };

        let Ok(text) = core::str::from_utf8(&head[..len]) else {
            socket.abort();
            continue;
        };
        let Some(request) = protocol::parse_request(text) else {
            debug!("unparseable request head");
            socket.abort();
            continue;
        };

        {
            let mut guard = core.lock().await;
            let ctx = &mut *guard;
            if let Err(e) = protocol::handle(
                &mut ctx.engine,
                &mut ctx.files,
                &request,
                &mut socket,
                Instant::now(),
            )
            .await
            {
                warn!("response not delivered: {e:?}");
            }
        }

        socket.close();
        let _ = with_timeout(Duration::from_secs(2), socket.flush()).await;
    }
}

/// Read until the blank line that ends the head, the buffer fills, or the
/// peer goes quiet.
async fn read_head(socket: &mut TcpSocket<'_>, buf: &mut [u8]) -> Option<usize> {
    let mut len = 0;
    loop {
        let n = match socket.read(&mut buf[len..]).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => n,
        };
        len += n;
        if buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
            return Some(len);
        }
        if len == buf.len() {
            return None;
        }
    }
}
