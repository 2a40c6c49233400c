//! Raw-session plumbing: socket pairs handed to local attachments and the
//! byte pump spliced between bus-to-bus hops.

use std::os::fd::OwnedFd;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Chunk size for the full-duplex splice.
const PUMP_BUF_LEN: usize = 4096;

/// Create the socket pair backing a raw session between two local
/// attachments: one end per side, handed out through `GetSessionFd`.
pub fn socket_pair() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let (a, b) = std::os::unix::net::UnixStream::pair()?;
    Ok((a.into(), b.into()))
}

/// Copy bytes between two streams in both directions until either side
/// closes or errors. This is what turns the router into a middleman for a
/// raw session it forwards.
pub async fn stream_pump<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let forward = async move {
        let mut buf = [0u8; PUMP_BUF_LEN];
        loop {
            match a_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if a_wr_to(&mut b_wr, &buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = b_wr.shutdown().await;
    };
    let backward = async move {
        let mut buf = [0u8; PUMP_BUF_LEN];
        loop {
            match b_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if a_wr_to(&mut a_wr, &buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = a_wr.shutdown().await;
    };

    trace!("raw stream pump starting");
    tokio::join!(forward, backward);
    debug!("raw stream pump finished");
}

async fn a_wr_to<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> std::io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pump_copies_both_directions_until_close() {
        let (client_a, daemon_a) = tokio::io::duplex(256);
        let (client_b, daemon_b) = tokio::io::duplex(256);
        let pump = tokio::spawn(stream_pump(daemon_a, daemon_b));

        let (mut a_rd, mut a_wr) = tokio::io::split(client_a);
        let (mut b_rd, mut b_wr) = tokio::io::split(client_b);

        a_wr.write_all(b"ping").await.unwrap();
        a_wr.flush().await.unwrap();
        let mut buf = [0u8; 4];
        b_rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_wr.write_all(b"pong").await.unwrap();
        b_wr.flush().await.unwrap();
        a_rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one side winds the pump down.
        drop(a_wr);
        drop(a_rd);
        drop(b_wr);
        let mut rest = Vec::new();
        let _ = b_rd.read_to_end(&mut rest).await;
        pump.await.unwrap();
    }

    #[test]
    fn socket_pair_yields_two_fds() {
        let (a, b) = socket_pair().unwrap();
        use std::os::fd::AsRawFd;
        assert_ne!(a.as_raw_fd(), b.as_raw_fd());
    }
}
