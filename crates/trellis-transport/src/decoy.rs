//! HTTP decoy framing.
//!
//! Every internet peer stream opens with a cosmetic HTTP/1.1 exchange so a
//! passive observer sees an ordinary proxied connection: the client writes a
//! `CONNECT` request, the server answers `200 OK`. Each side scans the
//! incoming bytes until four consecutive CR/LF bytes have been seen, after
//! which the stream is unwrapped and carries the peer protocol verbatim.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransportError};

/// Which side of the decoy exchange this stream plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoyRole {
    /// Writes the CONNECT request, reads the 200 response.
    Client,
    /// Reads the CONNECT request, writes the 200 response.
    Server,
}

/// Upper bound on decoy header bytes before the exchange is considered hostile.
const MAX_DECOY_BYTES: usize = 1024;

/// Run the decoy exchange on a fresh stream.
///
/// `host` is the target host string placed in the CONNECT line (client role
/// only; ignored for servers). On return the stream is positioned at the
/// first peer-protocol byte.
///
/// # Errors
///
/// `DecoyAborted` if the peer closes the stream before the terminator, or
/// keeps talking past [`MAX_DECOY_BYTES`] without producing one.
pub async fn exchange_decoy<S>(stream: &mut S, role: DecoyRole, host: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match role {
        DecoyRole::Client => {
            let request = format!("CONNECT {host} HTTP/1.1\r\n\r\n");
            stream.write_all(request.as_bytes()).await?;
            stream.flush().await?;
            read_until_crlf_run(stream).await
        }
        DecoyRole::Server => {
            read_until_crlf_run(stream).await?;
            stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
            stream.flush().await?;
            Ok(())
        }
    }
}

/// Consume bytes until four consecutive CR/LF bytes have been seen.
///
/// Any byte that is not CR or LF resets the run counter.
async fn read_until_crlf_run<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut run = 0usize;
    let mut total = 0usize;
    let mut byte = [0u8; 1];

    while run < 4 {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TransportError::DecoyAborted);
        }
        total += 1;
        if total > MAX_DECOY_BYTES {
            return Err(TransportError::DecoyAborted);
        }
        if byte[0] == b'\r' || byte[0] == b'\n' {
            run += 1;
        } else {
            run = 0;
        }
    }
    Ok(())
}
