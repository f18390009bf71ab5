use std::{
    error::Error as StdError,
    io::{
        Error as IoError,
        ErrorKind as IoErrorKind,
    },
};

use tungstenite::error::{
    Error as TungsteniteError,
    ProtocolError,
};

/// Whether an error anywhere in `e`'s source chain is just the peer going
/// away. The axum → tungstenite close path reports an error even on a
/// successful close, so these are logged as disconnects, not failures.
pub fn is_connection_closed_error(e: &(dyn StdError + 'static)) -> bool {
    let mut cur: Option<&(dyn StdError + 'static)> = Some(e);
    while let Some(e) = cur {
        let closed = matches!(
            e.downcast_ref(),
            Some(
                TungsteniteError::ConnectionClosed
                    | TungsteniteError::AlreadyClosed
                    | TungsteniteError::Protocol(
                        ProtocolError::SendAfterClosing
                            | ProtocolError::ResetWithoutClosingHandshake
                    )
            )
        ) || matches!(
            e.downcast_ref::<IoError>(),
            Some(e) if matches!(e.kind(), IoErrorKind::BrokenPipe | IoErrorKind::ConnectionReset)
        );
        if closed {
            return true;
        }
        cur = e.source();
    }
    false
}
