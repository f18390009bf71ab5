//! The dispatcher worker: accepts TCP connections on the public port, reads
//! the HTTP upgrade head, and hands the raw socket to a syncer worker. If
//! the handoff fails, the dispatcher completes the upgrade itself and
//! immediately closes the socket with a protocol-error close frame.

use std::{
    os::fd::AsRawFd,
    os::unix::net::UnixStream,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
};

use dispatcher::{
    handoff::send_handoff,
    supervisor::inherited_handoff_channels,
    HandoffFrame,
    SerializedRequest,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::{
        TcpListener,
        TcpStream,
    },
    signal::unix::{
        signal,
        SignalKind,
    },
    task::JoinSet,
};
use crate::{
    config::ZeroConfig,
    ws_util,
};

const MAX_REQUEST_HEAD_BYTES: usize = 16 * 1024;

pub async fn run(config: ZeroConfig) -> anyhow::Result<()> {
    let channels: Vec<Arc<Mutex<UnixStream>>> = {
        let mut inherited: Vec<_> = inherited_handoff_channels()?.into_iter().collect();
        anyhow::ensure!(!inherited.is_empty(), "Dispatcher has no syncer channels");
        inherited.sort_by_key(|(index, _)| *index);
        inherited
            .into_iter()
            .map(|(_, channel)| Arc::new(Mutex::new(channel)))
            .collect()
    };
    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Dispatcher listening on {}", config.listen_addr);

    let next_worker = Arc::new(AtomicUsize::new(0));
    let mut connections = JoinSet::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let channels = channels.clone();
                let next_worker = next_worker.clone();
                connections.spawn(async move {
                    if let Err(e) = handle_connection(socket, &channels, &next_worker).await {
                        tracing::warn!("Connection from {peer} failed: {e:#}");
                    }
                });
                // Opportunistically reap finished connection tasks.
                while connections.try_join_next().is_some() {}
            },
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }
    // Drain: stop accepting, let in-flight handoffs complete.
    drop(listener);
    tracing::info!("Dispatcher draining {} in-flight connections", connections.len());
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn handle_connection(
    mut socket: TcpStream,
    channels: &[Arc<Mutex<UnixStream>>],
    next_worker: &AtomicUsize,
) -> anyhow::Result<()> {
    let (request, head) = read_request_head(&mut socket).await?;
    let worker = next_worker.fetch_add(1, Ordering::Relaxed) % channels.len();
    let frame = HandoffFrame {
        message: request,
        head,
        payload: json!({ "worker": worker }),
    };

    let std_socket = socket.into_std()?;
    std_socket.set_nonblocking(false)?;
    let channel = channels[worker].clone();
    let handoff = {
        let frame = frame.clone();
        let fd = std_socket.as_raw_fd();
        tokio::task::spawn_blocking(move || {
            let mut channel = channel.lock();
            send_handoff(&mut channel, fd, &frame)
        })
        .await?
    };
    match handoff {
        Ok(()) => {
            // The worker owns a duplicate of the fd now; our copy closes
            // here.
            drop(std_socket);
            Ok(())
        },
        Err(e) => {
            tracing::error!("Handoff to syncer-{worker} failed: {e:#}");
            std_socket.set_nonblocking(true)?;
            let mut socket = TcpStream::from_std(std_socket)?;
            close_after_upgrade(&mut socket, &frame.message, "Service unavailable during handoff")
                .await?;
            Err(e)
        },
    }
}

/// Read and minimally parse the HTTP request head; returns any bytes
/// buffered past the end of the head.
async fn read_request_head(
    socket: &mut TcpStream,
) -> anyhow::Result<(SerializedRequest, Vec<u8>)> {
    let mut buffer = Vec::with_capacity(1024);
    let end = loop {
        anyhow::ensure!(
            buffer.len() <= MAX_REQUEST_HEAD_BYTES,
            "Request head exceeds {MAX_REQUEST_HEAD_BYTES} bytes"
        );
        if let Some(pos) = find_head_end(&buffer) {
            break pos;
        }
        let mut chunk = [0u8; 4096];
        let n = socket.read(&mut chunk).await?;
        anyhow::ensure!(n > 0, "Connection closed before request head");
        buffer.extend_from_slice(&chunk[..n]);
    };
    let head = buffer.split_off(end + 4);
    let text = std::str::from_utf8(&buffer)
        .map_err(|_| anyhow::anyhow!("Request head is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty request"))?;
    let mut parts = request_line.split(' ');
    let (Some(method), Some(uri)) = (parts.next(), parts.next()) else {
        anyhow::bail!("Malformed request line {request_line:?}");
    };
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Malformed header line {line:?}"))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
    }
    Ok((
        SerializedRequest {
            method: method.to_owned(),
            uri: uri.to_owned(),
            headers,
        },
        head,
    ))
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Failure path: finish the WebSocket upgrade so the client gets a clean
/// protocol-level close (code 1002) instead of a TCP reset.
async fn close_after_upgrade(
    socket: &mut TcpStream,
    request: &SerializedRequest,
    reason: &str,
) -> anyhow::Result<()> {
    ws_util::write_upgrade_response(socket, request).await?;
    ws_util::write_close(socket, 1002, reason).await
}

#[cfg(test)]
mod tests {
    use super::find_head_end;

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(14));
        assert_eq!(find_head_end(b"partial\r\n"), None);
    }
}
