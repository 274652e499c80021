//! Datagram socket transport
//!
//! Owns the Unix datagram socket bound at the device's well-known path. The
//! listener does not know its peer up front: a peer announces itself with an
//! ATTACH signal frame and its socket address becomes the destination for
//! every request after that.
//!
//! Request/reply round trips are bounded by the reply timeout so a stalled
//! peer cannot hang the caller. While a round trip is in flight, signal
//! polling is suspended; signal frames that arrive in the meantime are queued
//! and handed out by the next poll.

use crate::error::TransportError;
use protocol::{MAX_PAYLOAD, PeerSignal, ProtocolError, TransferReply};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixDatagram;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Default bound on a single request/reply round trip
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest valid reply: status byte plus a full payload
const MAX_REPLY_FRAME: usize = MAX_PAYLOAD + 1;

/// One byte past the largest frame, so an oversized datagram shows up as
/// longer than [`MAX_REPLY_FRAME`] instead of being cut to fit
const RECV_BUFFER_SIZE: usize = MAX_REPLY_FRAME + 1;

/// The bound socket, registered with tokio for awaited receives
///
/// `raw` is a non-blocking duplicate used for the non-blocking drain and
/// poll paths, which must hit the socket even before the reactor has seen
/// it become readable.
struct Endpoint {
    socket: UnixDatagram,
    raw: std::os::unix::net::UnixDatagram,
}

/// Datagram endpoint for one virtual device
pub struct Transport {
    socket: Option<Endpoint>,
    path: PathBuf,
    peer: Option<PathBuf>,
    reply_timeout: Duration,
    signals_suspended: bool,
    queued_signals: VecDeque<(PeerSignal, Option<PathBuf>)>,
}

impl Transport {
    /// Bind the listening endpoint at `path`
    ///
    /// A stale socket file left behind by a previous run is removed first. A
    /// path with a live listener behind it is refused. Must be called from
    /// within a tokio runtime.
    pub fn bind_listen(
        path: impl AsRef<Path>,
        reply_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let bind_failed = |source: io::Error| TransportError::BindFailed {
            path: path.clone(),
            source,
        };

        if path.exists() {
            if listener_is_live(&path) {
                return Err(bind_failed(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "socket path has a live listener",
                )));
            }
            debug!("Removing stale socket at {}", path.display());
            std::fs::remove_file(&path).map_err(bind_failed)?;
        }

        let raw = std::os::unix::net::UnixDatagram::bind(&path).map_err(bind_failed)?;
        raw.set_nonblocking(true).map_err(bind_failed)?;
        let socket = raw
            .try_clone()
            .and_then(UnixDatagram::from_std)
            .map_err(bind_failed)?;
        info!("Listening on {}", path.display());

        Ok(Self {
            socket: Some(Endpoint { socket, raw }),
            path,
            peer: None,
            reply_timeout,
            signals_suspended: false,
            queued_signals: VecDeque::new(),
        })
    }

    /// Path the endpoint is bound to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Address of the attached peer, if any
    pub fn peer(&self) -> Option<&Path> {
        self.peer.as_deref()
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Send exactly one frame to the attached peer
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let socket = &self.socket.as_ref().ok_or(TransportError::Closed)?.socket;
        let peer = self.peer.as_ref().ok_or(TransportError::NoPeer)?;

        let sent = tokio::time::timeout(self.reply_timeout, socket.send_to(frame, peer))
            .await
            .map_err(|_| TransportError::Timeout(self.reply_timeout))?
            .map_err(TransportError::SendFailed)?;

        if sent != frame.len() {
            return Err(TransportError::PartialSend {
                sent,
                expected: frame.len(),
            });
        }

        trace!("Sent {} byte frame to {}", sent, peer.display());
        Ok(())
    }

    /// Wait up to the reply timeout for the peer's reply
    ///
    /// Signal frames are never replies: they are queued for the next poll
    /// whoever sent them, and the wait goes on. Anything else from a sender
    /// other than the peer is dropped. OK data longer than `max_len` is
    /// truncated to `max_len`.
    pub async fn recv_reply(&mut self, max_len: usize) -> Result<TransferReply, TransportError> {
        let socket = &self.socket.as_ref().ok_or(TransportError::Closed)?.socket;
        let peer = self.peer.as_deref().ok_or(TransportError::NoPeer)?;
        let deadline = Instant::now() + self.reply_timeout;
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        loop {
            let (len, addr) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout(self.reply_timeout))?
                .map_err(TransportError::PeerGone)?;
            let frame = &buf[..len];
            let sender = addr.as_pathname();

            if let Some(signal) = PeerSignal::from_frame(frame) {
                debug!("Queued {:?} signal received during round trip", signal);
                self.queued_signals
                    .push_back((signal, sender.map(Path::to_path_buf)));
                continue;
            }

            if sender != Some(peer) {
                trace!("Dropped {} byte datagram from non-peer sender", len);
                continue;
            }

            if len > MAX_REPLY_FRAME {
                return Err(TransportError::InvalidReply(ProtocolError::PayloadTooLarge {
                    size: len - 1,
                    max: MAX_PAYLOAD,
                }));
            }

            trace!("Received {} byte reply", len);
            let reply = TransferReply::decode(frame).map_err(TransportError::InvalidReply)?;

            return Ok(match reply {
                TransferReply::Ok(mut data) if data.len() > max_len => {
                    debug!(
                        "Truncating {} byte reply to requested {} bytes",
                        data.len(),
                        max_len
                    );
                    data.truncate(max_len);
                    TransferReply::Ok(data)
                }
                reply => reply,
            });
        }
    }

    /// Discard frames that were queued before a new request goes out
    ///
    /// These are late replies to timed-out requests. Signal frames are kept
    /// for the next poll. Returns the number of dropped frames.
    pub fn drain_stale(&mut self) -> usize {
        let Some(endpoint) = self.socket.as_ref() else {
            return 0;
        };
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let mut dropped = 0;

        loop {
            match endpoint.raw.recv_from(&mut buf) {
                Ok((len, addr)) => match PeerSignal::from_frame(&buf[..len]) {
                    Some(signal) => self
                        .queued_signals
                        .push_back((signal, addr.as_pathname().map(Path::to_path_buf))),
                    None => dropped += 1,
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Stopped draining socket: {}", e);
                    break;
                }
            }
        }

        if dropped > 0 {
            debug!("Dropped {} stale frame(s)", dropped);
        }
        dropped
    }

    /// True if a queued signal will detach or rebind the current peer
    ///
    /// A request sent now would go to a peer that has already left.
    pub fn peer_change_pending(&self) -> bool {
        self.queued_signals.iter().any(|(signal, sender)| match signal {
            PeerSignal::Detach => true,
            PeerSignal::Attach => sender.is_some(),
        })
    }

    /// Stop delivering signals until [`Transport::resume_signals`]
    pub fn suspend_signals(&mut self) {
        self.signals_suspended = true;
    }

    pub fn resume_signals(&mut self) {
        self.signals_suspended = false;
    }

    pub fn signals_suspended(&self) -> bool {
        self.signals_suspended
    }

    /// Non-blocking check for an out-of-band signal
    ///
    /// Unrecognised frames are skipped. Returns `None` while suspended.
    pub fn poll_signal(&mut self) -> Option<PeerSignal> {
        if self.signals_suspended {
            return None;
        }

        while let Some((signal, sender)) = self.queued_signals.pop_front() {
            if let Some(signal) = self.accept_signal(signal, sender) {
                return Some(signal);
            }
        }

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let endpoint = self.socket.as_ref()?;
            match endpoint.raw.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    let sender = addr.as_pathname().map(Path::to_path_buf);
                    match PeerSignal::from_frame(&buf[..len]) {
                        Some(signal) => {
                            if let Some(signal) = self.accept_signal(signal, sender) {
                                return Some(signal);
                            }
                        }
                        None => debug!("Ignoring unrecognised {} byte out-of-band frame", len),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) => {
                    debug!("Signal poll failed: {}", e);
                    return None;
                }
            }
        }
    }

    /// Wait for the next out-of-band signal
    ///
    /// Cancel safe. Never resolves while signals are suspended or after close.
    pub async fn wait_signal(&mut self) -> Result<PeerSignal, TransportError> {
        if self.signals_suspended {
            return std::future::pending().await;
        }

        while let Some((signal, sender)) = self.queued_signals.pop_front() {
            if let Some(signal) = self.accept_signal(signal, sender) {
                return Ok(signal);
            }
        }

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let Some(endpoint) = self.socket.as_ref() else {
                return std::future::pending().await;
            };
            let (len, addr) = endpoint
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(TransportError::PeerGone)?;
            let sender = addr.as_pathname().map(Path::to_path_buf);

            match PeerSignal::from_frame(&buf[..len]) {
                Some(signal) => {
                    if let Some(signal) = self.accept_signal(signal, sender) {
                        return Ok(signal);
                    }
                }
                None => debug!("Ignoring unrecognised {} byte out-of-band frame", len),
            }
        }
    }

    /// Apply late binding for a received signal
    fn accept_signal(&mut self, signal: PeerSignal, sender: Option<PathBuf>) -> Option<PeerSignal> {
        match signal {
            PeerSignal::Attach => match sender {
                Some(sender) => {
                    info!("Peer attached from {}", sender.display());
                    self.peer = Some(sender);
                    Some(PeerSignal::Attach)
                }
                None => {
                    warn!("Ignoring ATTACH from an unnamed socket; it cannot be replied to");
                    None
                }
            },
            PeerSignal::Detach => {
                info!("Peer detached");
                self.peer = None;
                Some(PeerSignal::Detach)
            }
        }
    }

    /// Close the socket and remove its path
    ///
    /// Idempotent; errors are logged, not returned.
    pub fn close(&mut self) {
        if self.socket.take().is_none() {
            return;
        }
        self.peer = None;
        self.queued_signals.clear();
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            debug!("Failed to remove {}: {}", self.path.display(), e);
        }
        info!("Closed socket at {}", self.path.display());
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

/// True if something is accepting datagrams at `path`
fn listener_is_live(path: &Path) -> bool {
    std::os::unix::net::UnixDatagram::unbound()
        .and_then(|socket| socket.connect(path))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::TransferRequest;

    async fn peer_socket(dir: &Path) -> (UnixDatagram, PathBuf) {
        let path = dir.join("peer.sock");
        (UnixDatagram::bind(&path).unwrap(), path)
    }

    #[tokio::test]
    async fn test_bind_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.sock");

        {
            // Bound then dropped leaves the socket file behind without a listener
            let stale = std::os::unix::net::UnixDatagram::bind(&path).unwrap();
            drop(stale);
        }
        assert!(path.exists());

        let transport = Transport::bind_listen(&path, DEFAULT_REPLY_TIMEOUT).unwrap();
        assert_eq!(transport.path(), path);
        assert!(transport.peer().is_none());
    }

    #[tokio::test]
    async fn test_bind_refuses_live_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.sock");
        let _live = Transport::bind_listen(&path, DEFAULT_REPLY_TIMEOUT).unwrap();

        let result = Transport::bind_listen(&path, DEFAULT_REPLY_TIMEOUT);
        assert!(matches!(result, Err(TransportError::BindFailed { .. })));
    }

    #[tokio::test]
    async fn test_send_without_peer() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            Transport::bind_listen(dir.path().join("dev.sock"), DEFAULT_REPLY_TIMEOUT).unwrap();
        assert!(matches!(
            transport.send_frame(&[0x01, 0x00]).await,
            Err(TransportError::NoPeer)
        ));
    }

    #[tokio::test]
    async fn test_attach_binds_peer() {
        let dir = tempfile::tempdir().unwrap();
        let dev_path = dir.path().join("dev.sock");
        let mut transport = Transport::bind_listen(&dev_path, DEFAULT_REPLY_TIMEOUT).unwrap();
        let (peer, peer_path) = peer_socket(dir.path()).await;

        peer.send_to(&[0x42], &dev_path).await.unwrap();
        peer.send_to(&[0xFF], &dev_path).await.unwrap();

        let signal = transport.wait_signal().await.unwrap();
        assert_eq!(signal, PeerSignal::Attach);
        assert_eq!(transport.peer(), Some(peer_path.as_path()));

        let frame = TransferRequest::In { endpoint: 1 }.encode().unwrap();
        transport.send_frame(&frame).await.unwrap();
        let mut buf = [0u8; 8];
        let len = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[0x01, 0x01]);
    }

    #[tokio::test]
    async fn test_poll_signal_suspended() {
        let dir = tempfile::tempdir().unwrap();
        let dev_path = dir.path().join("dev.sock");
        let mut transport = Transport::bind_listen(&dev_path, DEFAULT_REPLY_TIMEOUT).unwrap();
        let (peer, _) = peer_socket(dir.path()).await;

        peer.send_to(&[0xFE], &dev_path).await.unwrap();
        transport.suspend_signals();
        assert_eq!(transport.poll_signal(), None);

        transport.resume_signals();
        assert_eq!(transport.poll_signal(), Some(PeerSignal::Detach));
        assert_eq!(transport.poll_signal(), None);
    }

    #[tokio::test]
    async fn test_recv_reply_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let dev_path = dir.path().join("dev.sock");
        let mut transport =
            Transport::bind_listen(&dev_path, Duration::from_millis(50)).unwrap();
        let (peer, _) = peer_socket(dir.path()).await;
        peer.send_to(&[0xFF], &dev_path).await.unwrap();
        transport.wait_signal().await.unwrap();

        assert!(matches!(
            transport.recv_reply(64).await,
            Err(TransportError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_recv_reply_truncates_to_max_len() {
        let dir = tempfile::tempdir().unwrap();
        let dev_path = dir.path().join("dev.sock");
        let mut transport = Transport::bind_listen(&dev_path, DEFAULT_REPLY_TIMEOUT).unwrap();
        let (peer, _) = peer_socket(dir.path()).await;
        peer.send_to(&[0xFF], &dev_path).await.unwrap();
        transport.wait_signal().await.unwrap();

        peer.send_to(&[0x00, 1, 2, 3, 4], &dev_path).await.unwrap();
        let reply = transport.recv_reply(2).await.unwrap();
        assert_eq!(reply, TransferReply::Ok(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_recv_reply_queues_peer_signal() {
        let dir = tempfile::tempdir().unwrap();
        let dev_path = dir.path().join("dev.sock");
        let mut transport = Transport::bind_listen(&dev_path, DEFAULT_REPLY_TIMEOUT).unwrap();
        let (peer, _) = peer_socket(dir.path()).await;
        peer.send_to(&[0xFF], &dev_path).await.unwrap();
        transport.wait_signal().await.unwrap();

        peer.send_to(&[0xFE], &dev_path).await.unwrap();
        peer.send_to(&[0x00, 0x01], &dev_path).await.unwrap();
        let reply = transport.recv_reply(8).await.unwrap();
        assert_eq!(reply, TransferReply::Ok(vec![0x01]));
        assert!(transport.peer_change_pending());

        assert_eq!(transport.poll_signal(), Some(PeerSignal::Detach));
        assert!(transport.peer().is_none());
        assert!(!transport.peer_change_pending());
    }

    #[tokio::test]
    async fn test_recv_reply_rejects_oversized_frame() {
        let dir = tempfile::tempdir().unwrap();
        let dev_path = dir.path().join("dev.sock");
        let mut transport = Transport::bind_listen(&dev_path, DEFAULT_REPLY_TIMEOUT).unwrap();
        let (peer, _) = peer_socket(dir.path()).await;
        peer.send_to(&[0xFF], &dev_path).await.unwrap();
        transport.wait_signal().await.unwrap();

        let mut frame = vec![0x00];
        frame.extend_from_slice(&[0xAB; 300]);
        peer.send_to(&frame, &dev_path).await.unwrap();
        assert!(matches!(
            transport.recv_reply(usize::MAX).await,
            Err(TransportError::InvalidReply(ProtocolError::PayloadTooLarge { .. }))
        ));

        let mut frame = vec![0x00];
        frame.extend_from_slice(&[0xAB; MAX_PAYLOAD]);
        peer.send_to(&frame, &dev_path).await.unwrap();
        let reply = transport.recv_reply(usize::MAX).await.unwrap();
        assert_eq!(reply.data().len(), MAX_PAYLOAD);
    }

    #[tokio::test]
    async fn test_drain_keeps_signals() {
        let dir = tempfile::tempdir().unwrap();
        let dev_path = dir.path().join("dev.sock");
        let mut transport = Transport::bind_listen(&dev_path, DEFAULT_REPLY_TIMEOUT).unwrap();
        let (peer, _) = peer_socket(dir.path()).await;

        peer.send_to(&[0x00, 0xAA], &dev_path).await.unwrap();
        peer.send_to(&[0xFE], &dev_path).await.unwrap();

        assert_eq!(transport.drain_stale(), 1);
        assert_eq!(transport.poll_signal(), Some(PeerSignal::Detach));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let dev_path = dir.path().join("dev.sock");
        let mut transport = Transport::bind_listen(&dev_path, DEFAULT_REPLY_TIMEOUT).unwrap();

        transport.close();
        assert!(transport.is_closed());
        assert!(!dev_path.exists());
        transport.close();
        assert!(matches!(
            transport.send_frame(&[0]).await,
            Err(TransportError::Closed)
        ));
    }
}
