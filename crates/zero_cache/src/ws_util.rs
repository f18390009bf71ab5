//! Small helpers for completing WebSocket upgrades by hand. Both the
//! dispatcher (failure path) and the syncers (normal path) finish the
//! handshake themselves, because the socket changes hands between the two.

use dispatcher::SerializedRequest;
use errors::clamp_close_reason;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
};
use tungstenite::handshake::derive_accept_key;

pub fn header<'a>(request: &'a SerializedRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|(header_name, _)| header_name == name)
        .map(|(_, value)| value.as_str())
}

/// Write the 101 response for `request`, echoing the first offered
/// subprotocol (the client packs its init-connection payload there and
/// expects it confirmed).
pub async fn write_upgrade_response(
    socket: &mut TcpStream,
    request: &SerializedRequest,
) -> anyhow::Result<()> {
    let key = header(request, "sec-websocket-key")
        .ok_or_else(|| anyhow::anyhow!("Upgrade request missing Sec-WebSocket-Key"))?;
    let accept = derive_accept_key(key.as_bytes());
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(protocol) = header(request, "sec-websocket-protocol") {
        if let Some(first) = protocol.split(',').next() {
            response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", first.trim()));
        }
    }
    response.push_str("\r\n");
    socket.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Write a single close frame and shut the socket down.
pub async fn write_close(socket: &mut TcpStream, code: u16, reason: &str) -> anyhow::Result<()> {
    socket.write_all(&close_frame_bytes(code, reason)).await?;
    socket.shutdown().await?;
    Ok(())
}

pub fn close_frame_bytes(code: u16, reason: &str) -> Vec<u8> {
    let reason = clamp_close_reason(reason);
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    // Server-to-client frames are unmasked; a close payload is always <=125
    // bytes, so the short length form suffices.
    let mut frame = vec![0x88, payload.len() as u8];
    frame.extend_from_slice(&payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::close_frame_bytes;

    #[test]
    fn test_close_frame_shape() {
        let frame = close_frame_bytes(1002, "bad handoff");
        assert_eq!(frame[0], 0x88);
        assert_eq!(frame[1] as usize, frame.len() - 2);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 1002);
        assert_eq!(&frame[4..], b"bad handoff");

        // Oversized reasons are clamped to fit a single control frame.
        let frame = close_frame_bytes(1002, &"x".repeat(500));
        assert!(frame.len() <= 2 + 125);
    }
}
