//! Bidirectional tunneling.
//!
//! Pumps bytes between the client and the remote server until both
//! directions have drained. Each direction runs independently: when one
//! side stops sending, the peer's write half is shut down (a TCP FIN on
//! socket halves) while the opposite direction keeps flowing to its own
//! natural end. This preserves HTTP/1.1 keep-alive and TLS close_notify
//! behavior for protocols that rely on half-close signalling.

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Buffer size for each copy direction.
const COPY_BUF_SIZE: usize = 8 * 1024;

/// Byte counts for a finished tunnel.
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelStats {
    /// Bytes the client sent to the remote server.
    pub bytes_sent: u64,
    /// Bytes the remote server sent back to the client.
    pub bytes_received: u64,
}

/// Tunnels bytes between `client` and `remote` until both directions are
/// done, then returns the per-direction byte counts. Copy errors end
/// their own direction only.
pub async fn run<C, R>(client: C, remote: R) -> TunnelStats
where
    C: AsyncRead + AsyncWrite,
    R: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = io::split(client);
    let (mut remote_read, mut remote_write) = io::split(remote);

    let (bytes_sent, bytes_received) = tokio::join!(
        copy_half(&mut client_read, &mut remote_write),
        copy_half(&mut remote_read, &mut client_write),
    );

    TunnelStats {
        bytes_sent,
        bytes_received,
    }
}

/// Copies from `src` to `dst` until EOF or error, then shuts down the
/// write half of `dst`. Returns the number of bytes written.
async fn copy_half<R, W>(src: &mut R, dst: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(err) = dst.write_all(&buf[..n]).await {
                    debug!("tunnel direction finished on write: {}", err);
                    break;
                }
                total += n as u64;
            }
            Err(err) => {
                debug!("tunnel direction finished on read: {}", err);
                break;
            }
        }
    }

    let _ = dst.shutdown().await;

    total
}
