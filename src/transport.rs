use crate::protocol::{ProtocolError, LENGTH_PREFIX};
use bytes::Bytes;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Finds the address of the interface this host uses to reach `target`.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick a
/// route and a source address.
pub fn probe_local_ip(target: SocketAddr) -> Option<IpAddr> {
    let bind_addr: SocketAddr = if target.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind_addr).ok()?;
    socket.connect(target).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() { None } else { Some(ip) }
}

/// Binds a TCP listener on all interfaces with address reuse enabled.
pub fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    // Restarted daemons must be able to rebind while old connections linger
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Opens a connection, writes the whole frame, and closes. Connect and write
/// together must finish within `timeout`.
pub async fn send_frame(
    addr: SocketAddr,
    frame: Bytes,
    timeout: Duration,
) -> Result<(), TransportError> {
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&frame).await?;
        stream.shutdown().await?;
        Ok::<_, io::Error>(())
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;
    Ok(())
}

/// Reads one length-prefixed frame, prefix included, within `timeout`.
///
/// Returns `Ok(None)` when the peer closes before the length prefix is
/// complete. A peer that closes early leaves a frame shorter than its prefix
/// declares; `protocol::decode` rejects it.
pub async fn read_frame(
    stream: &mut TcpStream,
    max_frame_bytes: u64,
    timeout: Duration,
) -> Result<Option<Bytes>, TransportError> {
    tokio::time::timeout(timeout, read_declared(stream, max_frame_bytes))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
}

async fn read_declared(
    stream: &mut TcpStream,
    max_frame_bytes: u64,
) -> Result<Option<Bytes>, TransportError> {
    let mut header = [0u8; LENGTH_PREFIX];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let declared = u64::from_be_bytes(header);
    if declared > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            declared,
            limit: max_frame_bytes,
        }
        .into());
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + declared.min(64 * 1024) as usize);
    frame.extend_from_slice(&header);
    stream.take(declared).read_to_end(&mut frame).await?;
    Ok(Some(Bytes::from(frame)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, encode};

    #[tokio::test]
    async fn test_send_and_read_frame() {
        let listener = bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let frame = encode("over the wire", &[7u8; 10_000]).unwrap();
        let sender = tokio::spawn(send_frame(
            SocketAddr::from(([127, 0, 0, 1], port)),
            frame,
            Duration::from_secs(5),
        ));

        let (mut stream, _) = listener.accept().await.unwrap();
        let frame = read_frame(&mut stream, 1 << 20, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        sender.await.unwrap().unwrap();

        let envelope = decode(frame).unwrap();
        assert_eq!(envelope.description(), "over the wire");
        assert_eq!(envelope.image().len(), 10_000);
    }

    #[tokio::test]
    async fn test_close_before_header() {
        let listener = bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            s.write_all(&[0, 0, 0]).await.unwrap();
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        client.await.unwrap();
        let frame = read_frame(&mut stream, 1 << 20, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_close_mid_payload() {
        let listener = bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let frame = encode("truncated", &[9u8; 256]).unwrap();
        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            s.write_all(&frame[..frame.len() - 5]).await.unwrap();
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        client.await.unwrap();
        let frame = read_frame(&mut stream, 1 << 20, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            decode(frame),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let listener = bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            s.write_all(&u64::MAX.to_be_bytes()).await.unwrap();
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        client.await.unwrap();
        let err = read_frame(&mut stream, 1024, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_stalled_sender_times_out() {
        let listener = bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        // Header promises 100 bytes, only 3 arrive, and the socket stays open.
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(&100u64.to_be_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();

        let (mut stream, _) = listener.accept().await.unwrap();
        let err = read_frame(&mut stream, 1 << 20, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        drop(client);
    }

    #[tokio::test]
    async fn test_send_to_closed_port_fails() {
        // Grab a free port, then release it so nothing is listening.
        let port = bind_listener(0).unwrap().local_addr().unwrap().port();
        let result = send_frame(
            SocketAddr::from(([127, 0, 0, 1], port)),
            Bytes::from_static(b"x"),
            Duration::from_secs(2),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_probe_loopback() {
        let ip = probe_local_ip(SocketAddr::from(([127, 0, 0, 1], 9)));
        assert_eq!(ip, Some(IpAddr::from([127, 0, 0, 1])));
    }
}
