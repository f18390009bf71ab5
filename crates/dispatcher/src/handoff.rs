//! Transfer of an accepted TCP socket from the dispatcher process to a
//! worker, together with the HTTP upgrade context the worker needs to
//! complete the WebSocket handshake itself.
//!
//! The raw fd rides an SCM_RIGHTS control message attached to a 4-byte
//! length prefix; the JSON frame body follows as ordinary stream data. The
//! receiver reconstructs the upgrade request from `message` plus any bytes
//! (`head`) the dispatcher had already buffered past the request head.

use std::{
    io::{
        IoSlice,
        IoSliceMut,
        Read,
        Write,
    },
    os::fd::{
        AsRawFd,
        FromRawFd,
        OwnedFd,
        RawFd,
    },
    os::unix::net::UnixStream,
};

use nix::sys::socket::{
    recvmsg,
    sendmsg,
    ControlMessage,
    ControlMessageOwned,
    MsgFlags,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

/// The subset of the HTTP upgrade request a worker needs to finish the
/// handshake: method/uri plus the headers (notably `Sec-WebSocket-Key` and
/// `Sec-WebSocket-Protocol`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffFrame {
    pub message: SerializedRequest,
    /// Bytes the dispatcher read past the end of the request head.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub head: Vec<u8>,
    /// Worker-specific routing info (which syncer, connection id, ...).
    #[serde(default)]
    pub payload: JsonValue,
}

impl HandoffFrame {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        anyhow::ensure!(
            body.len() <= u32::MAX as usize,
            "Handoff frame too large: {} bytes",
            body.len()
        );
        Ok(body)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| anyhow::anyhow!("Invalid handoff frame: {e}"))
    }
}

/// Send `frame` and the socket `fd` over the worker channel. Blocking; the
/// dispatcher calls this from its handoff thread.
pub fn send_handoff(channel: &mut UnixStream, fd: RawFd, frame: &HandoffFrame) -> anyhow::Result<()> {
    let body = frame.encode()?;
    let len = (body.len() as u32).to_be_bytes();
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&len)];
    let sent = sendmsg::<()>(
        channel.as_raw_fd(),
        &iov,
        &cmsg,
        MsgFlags::empty(),
        None,
    )?;
    anyhow::ensure!(sent == len.len(), "Short write on handoff length prefix");
    channel.write_all(&body)?;
    Ok(())
}

/// Receive one handoff: the transferred socket plus its frame.
pub fn recv_handoff(channel: &mut UnixStream) -> anyhow::Result<(OwnedFd, HandoffFrame)> {
    let mut len_buf = [0u8; 4];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let fd = {
        let mut iov = [IoSliceMut::new(&mut len_buf)];
        let msg = recvmsg::<()>(
            channel.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )?;
        anyhow::ensure!(msg.bytes == 4, "Peer hung up mid-handoff");
        let mut received = None;
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                anyhow::ensure!(fds.len() == 1, "Expected exactly one fd in handoff");
                received = Some(unsafe { OwnedFd::from_raw_fd(fds[0]) });
            }
        }
        received.ok_or_else(|| anyhow::anyhow!("Handoff message carried no fd"))?
    };
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    channel.read_exact(&mut body)?;
    Ok((fd, HandoffFrame::decode(&body)?))
}

#[cfg(test)]
mod tests {
    use std::{
        io::{
            Read,
            Write,
        },
        os::fd::AsRawFd,
        os::unix::net::UnixStream,
    };

    use serde_json::json;

    use super::{
        recv_handoff,
        send_handoff,
        HandoffFrame,
        SerializedRequest,
    };

    fn frame() -> HandoffFrame {
        HandoffFrame {
            message: SerializedRequest {
                method: "GET".to_owned(),
                uri: "/sync/v21/connect?clientID=c1".to_owned(),
                headers: vec![
                    ("upgrade".to_owned(), "websocket".to_owned()),
                    ("sec-websocket-key".to_owned(), "dGhlIHNhbXBsZQ==".to_owned()),
                ],
            },
            head: b"extra".to_vec(),
            payload: json!({"worker": 2}),
        }
    }

    #[test]
    fn test_frame_codec_round_trip() {
        let encoded = frame().encode().unwrap();
        assert_eq!(HandoffFrame::decode(&encoded).unwrap(), frame());
        assert!(HandoffFrame::decode(b"not json").is_err());
    }

    #[test]
    fn test_fd_transfer_round_trip() {
        let (mut dispatcher_side, mut worker_side) = UnixStream::pair().unwrap();
        // The "accepted socket": one end goes across, the other stays here
        // so we can observe writes coming out of the transferred fd.
        let (transferred, mut observer) = UnixStream::pair().unwrap();

        send_handoff(&mut dispatcher_side, transferred.as_raw_fd(), &frame()).unwrap();
        let (fd, received) = recv_handoff(&mut worker_side).unwrap();
        assert_eq!(received, frame());

        let mut adopted = UnixStream::from(fd);
        adopted.write_all(b"hello from worker").unwrap();
        drop(adopted);
        drop(transferred);

        let mut out = String::new();
        observer.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello from worker");
    }
}
