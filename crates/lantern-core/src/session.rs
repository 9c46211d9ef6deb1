//! Newline-framed chat sessions and the bootstrap echo responder.
//!
//! A frame is a line of UTF-8 ending in `\n`. There is no length prefix and
//! no checksum; framing integrity is owed to the stream, not the session.
//! Each inbound stream is served independently: one misbehaving peer tears
//! down only its own session.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::identity::NodeId;
use crate::transport::PeerStream;

/// Protocol label for chat sessions.
pub const CHAT_PROTOCOL: &str = "/chat/1.0.0";

/// Longest frame accepted on the wire, newline included. A peer sending more
/// without a terminator gets an error instead of growing our buffer forever.
pub const MAX_FRAME: usize = 64 * 1024;

/// Write one frame: the payload followed by a newline, then flush.
///
/// # Errors
///
/// `InvalidInput` if the payload itself contains a newline, since that would
/// be read back as two frames, or if it would exceed [`MAX_FRAME`]. I/O
/// errors from the underlying stream.
pub async fn write_frame<W>(writer: &mut W, frame: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if frame.contains('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame payload may not contain a newline",
        ));
    }
    if frame.len() + 1 > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame payload exceeds the frame limit",
        ));
    }
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Read one frame, stripping the trailing newline.
///
/// Returns `None` on clean end-of-stream before any byte of a frame. At most
/// [`MAX_FRAME`] bytes are consumed per call.
///
/// # Errors
///
/// `UnexpectedEof` if the stream ends mid-frame, `InvalidData` if the frame
/// limit is hit before a newline, plus any underlying I/O error.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = String::new();
    let n = (&mut *reader)
        .take(MAX_FRAME as u64)
        .read_line(&mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        if n == MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds the frame limit",
            ));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended mid-frame",
        ));
    }
    line.pop();
    Ok(Some(line))
}

/// Drive a duplex chat session until either side ends it.
///
/// Frames arriving from `peer` are delivered on `inbound`; strings taken from
/// `outbound` are framed and sent. The two directions run as separate tasks,
/// and whichever direction finishes first signals the other to wind down. A
/// frame already being written when teardown begins is completed, never
/// truncated.
///
/// Returns once both directions have settled. Closing the `outbound` channel
/// ends the session locally: the read side is torn down and the stream is
/// shut down so the peer sees a clean EOF. A session ending in an I/O error
/// is aborted instead, so the peer observes a reset rather than a clean
/// close.
///
/// # Errors
///
/// The first I/O error from either direction, reads preferred.
pub async fn run_chat(
    peer: NodeId,
    stream: Box<dyn PeerStream>,
    outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<String>,
) -> io::Result<()> {
    let (read_half, write_half) = tokio::io::split(stream);
    let (teardown_tx, teardown_rx) = watch::channel(false);
    let teardown_tx = Arc::new(teardown_tx);

    let reader_teardown = Arc::clone(&teardown_tx);
    let mut reader_signal = teardown_rx.clone();
    let read_task = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let result = loop {
            // A frame half-read when teardown fires is discarded along with
            // the stream.
            let read = tokio::select! {
                _ = reader_signal.changed() => break Ok(()),
                read = read_frame(&mut reader) => read,
            };
            match read {
                Ok(Some(frame)) => {
                    debug!(peer = %peer, len = frame.len(), "frame received");
                    if inbound.send(frame).await.is_err() {
                        break Ok(());
                    }
                }
                Ok(None) => {
                    debug!(peer = %peer, "peer closed its write side");
                    break Ok(());
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "read side failed");
                    break Err(e);
                }
            }
        };
        let _ = reader_teardown.send(true);
        (result, reader.into_inner())
    });

    let write_task = tokio::spawn(write_loop(write_half, outbound, teardown_tx, teardown_rx));

    let (read_res, write_res) = tokio::join!(read_task, write_task);
    let (read_res, read_half) = read_res.map_err(io::Error::other)?;
    let (write_res, write_half) = write_res.map_err(io::Error::other)?;

    // Reunite the halves so the failure path can reset the stream instead of
    // closing it cleanly.
    let mut stream = read_half.unsplit(write_half);
    match read_res.and(write_res) {
        Ok(()) => {
            let _ = stream.shutdown().await;
            Ok(())
        }
        Err(e) => {
            stream.abort();
            Err(e)
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<String>,
    teardown_tx: Arc<watch::Sender<bool>>,
    mut teardown_rx: watch::Receiver<bool>,
) -> (io::Result<()>, W)
where
    W: AsyncWrite + Unpin,
{
    let result = loop {
        // Teardown is only honored between frames. write_frame itself is
        // never raced against it.
        let frame = tokio::select! {
            _ = teardown_rx.changed() => break Ok(()),
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else {
            break Ok(());
        };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            break Err(e);
        }
    };
    let _ = teardown_tx.send(true);
    (result, writer)
}

/// Serve one bootstrap echo exchange on an inbound stream.
///
/// Reads a single frame and writes it back unchanged. On success the stream
/// is closed gracefully; on any failure it is aborted so the initiator
/// observes an error rather than a clean close.
///
/// # Errors
///
/// The I/O error that caused the abort.
pub async fn echo_once(mut stream: Box<dyn PeerStream>) -> io::Result<()> {
    let echoed = async {
        let frame = {
            let mut reader = BufReader::new(&mut stream);
            read_frame(&mut reader).await?
        };
        match frame {
            Some(frame) => write_frame(&mut stream, &frame).await,
            // EOF before any frame: nothing to echo, still a clean exchange.
            None => Ok(()),
        }
    }
    .await;

    match echoed {
        Ok(()) => stream.shutdown().await,
        Err(e) => {
            warn!(error = %e, "echo exchange failed, aborting stream");
            stream.abort();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryStream;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, b) = duplex(256);
        write_frame(&mut a, "hello there").await.unwrap();
        drop(a);

        let mut reader = BufReader::new(b);
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Some("hello there".to_string())
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_frame_is_a_frame() {
        let (mut a, b) = duplex(64);
        write_frame(&mut a, "").await.unwrap();
        drop(a);

        let mut reader = BufReader::new(b);
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(String::new()));
    }

    #[tokio::test]
    async fn embedded_newline_is_rejected() {
        let (mut a, _b) = duplex(64);
        let err = write_frame(&mut a, "two\nframes").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut a, b) = duplex(64);
        a.write_all(b"no terminator").await.unwrap();
        drop(a);

        let mut reader = BufReader::new(b);
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn unterminated_oversized_frame_is_rejected() {
        let (mut a, b) = duplex(2 * MAX_FRAME);
        a.write_all(&vec![b'x'; MAX_FRAME + 16]).await.unwrap();

        let mut reader = BufReader::new(b);
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn oversized_frame_is_not_written() {
        let (mut a, _b) = duplex(64);
        let payload = "y".repeat(MAX_FRAME);
        let err = write_frame(&mut a, &payload).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn local_input_eof_settles_against_a_silent_peer() {
        let (local, _remote) = MemoryStream::pair();
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(1);
        let (inbound_tx, _inbound_rx) = mpsc::channel(4);
        // Local input ends immediately; the peer keeps its stream open and
        // never sends a byte.
        drop(outbound_tx);

        let session = run_chat(
            NodeId::from_bytes([7; 32]),
            Box::new(local),
            outbound_rx,
            inbound_tx,
        );
        timeout(Duration::from_secs(5), session)
            .await
            .expect("session settles once local input ends")
            .unwrap();
    }

    #[tokio::test]
    async fn mid_session_error_resets_the_stream() {
        let (local, mut remote) = MemoryStream::pair();
        let (_outbound_tx, outbound_rx) = mpsc::channel::<String>(1);
        let (inbound_tx, _inbound_rx) = mpsc::channel(4);

        let session = tokio::spawn(run_chat(
            NodeId::from_bytes([9; 32]),
            Box::new(local),
            outbound_rx,
            inbound_tx,
        ));

        remote.write_all(b"half a frame").await.unwrap();
        remote.shutdown().await.unwrap();

        let err = timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        // The failed session ends with a reset, not a clean close.
        let mut buf = [0u8; 8];
        let err = remote.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
