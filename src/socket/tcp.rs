//! TCP transport adapter.
//!
//! Frames are length-prefixed (u32 little-endian) on the stream. The
//! adapter owns a reader task that delivers inbound frames into the
//! virtual socket and a writer task fed by the outbox sink; either side
//! failing drops the whole socket.

use super::VirtualSocket;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Refuse frames larger than this.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Depth of the writer channel between the outbox sink and the stream.
const WRITER_BACKLOG: usize = 1024;

/// Bind a virtual socket to an established TCP stream.
///
/// Spawns the reader and writer tasks; the returned socket is live
/// immediately and drops itself when the connection closes.
pub fn attach(stream: TcpStream, capacity: usize) -> io::Result<VirtualSocket> {
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();

    let socket = VirtualSocket::new(capacity);

    let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(WRITER_BACKLOG);
    socket
        .connect_sink(Box::new(move |frame| frame_tx.try_send(frame).is_ok()))
        .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "socket outbox unavailable"))?;

    tokio::spawn(write_loop(write_half, frame_rx, peer));
    tokio::spawn(read_loop(read_half, socket.clone(), peer));

    debug!(%peer, "tcp adapter attached");
    Ok(socket)
}

/// Connect to a remote listener and attach.
pub async fn connect<A: ToSocketAddrs>(addr: A, capacity: usize) -> io::Result<VirtualSocket> {
    let stream = TcpStream::connect(addr).await?;
    attach(stream, capacity)
}

/// Bind a listener and hand one attached socket per accepted connection
/// to the returned channel.
pub async fn listen<A: ToSocketAddrs>(
    addr: A,
    capacity: usize,
) -> io::Result<(SocketAddr, mpsc::Receiver<VirtualSocket>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted tcp connection");
                    match attach(stream, capacity) {
                        Ok(socket) => {
                            if tx.send(socket).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => error!(%peer, error = %e, "failed to attach tcp stream"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "tcp accept failed");
                    break;
                }
            }
        }
    });

    Ok((local, rx))
}

async fn read_loop(mut read_half: OwnedReadHalf, socket: VirtualSocket, peer: SocketAddr) {
    loop {
        let mut len_bytes = [0u8; 4];
        if let Err(e) = read_half.read_exact(&mut len_bytes).await {
            debug!(%peer, error = %e, "tcp read side closed");
            break;
        }
        let frame_len = u32::from_le_bytes(len_bytes) as usize;
        if frame_len > MAX_FRAME_LEN {
            error!(%peer, frame_len, "oversized frame, dropping connection");
            break;
        }
        let mut frame = vec![0u8; frame_len];
        if let Err(e) = read_half.read_exact(&mut frame).await {
            debug!(%peer, error = %e, "tcp read side closed mid-frame");
            break;
        }
        socket.deliver(frame);
    }
    socket.drop_all();
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Vec<u8>>,
    peer: SocketAddr,
) {
    while let Some(frame) = frames.recv().await {
        let len = (frame.len() as u32).to_le_bytes();
        let write = async {
            write_half.write_all(&len).await?;
            write_half.write_all(&frame).await?;
            write_half.flush().await
        };
        if let Err(e) = write.await {
            debug!(%peer, error = %e, "tcp write side closed");
            break;
        }
    }
}
