//! Test utilities for usb-socket
//!
//! Provides a mock peer that speaks the socket protocol and helper functions
//! for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_device_descriptor;
//!
//! let descriptor = create_mock_device_descriptor();
//! assert_eq!(descriptor[0], 0x12);
//! ```

use protocol::{PeerSignal, TransferReply, TransferRequest};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixDatagram;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Simulated remote USB device
///
/// Binds its own datagram socket so the device under test can late-bind to
/// it when it announces itself with an ATTACH signal.
pub struct MockPeer {
    socket: UnixDatagram,
    path: PathBuf,
    device_path: PathBuf,
}

impl MockPeer {
    /// Bind the peer socket at `path`, talking to the device bound at `device_path`
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>, device_path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path)?;
        Ok(Self {
            socket,
            path,
            device_path: device_path.as_ref().to_path_buf(),
        })
    }

    /// Path this peer is bound to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send the ATTACH signal (0xFF)
    pub async fn announce(&self) -> io::Result<()> {
        self.send_raw(&[PeerSignal::Attach.tag()]).await
    }

    /// Send the DETACH signal (0xFE)
    pub async fn detach(&self) -> io::Result<()> {
        self.send_raw(&[PeerSignal::Detach.tag()]).await
    }

    /// Send an arbitrary datagram to the device
    pub async fn send_raw(&self, frame: &[u8]) -> io::Result<()> {
        self.socket.send_to(frame, &self.device_path).await?;
        Ok(())
    }

    /// Receive and decode the next request frame
    pub async fn recv_request(&self) -> io::Result<TransferRequest> {
        let mut buf = [0u8; 512];
        let len = self.socket.recv(&mut buf).await?;
        TransferRequest::decode(&buf[..len])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Send a reply frame to the device
    pub async fn reply(&self, reply: &TransferReply) -> io::Result<()> {
        self.send_raw(&reply.encode()).await
    }

    /// Receive one request and answer it with `reply`
    pub async fn serve(&self, reply: TransferReply) -> io::Result<TransferRequest> {
        let request = self.recv_request().await?;
        self.reply(&reply).await?;
        Ok(request)
    }

    /// True if no datagram arrives within `within`
    pub async fn is_silent_for(&self, within: Duration) -> bool {
        let mut buf = [0u8; 512];
        tokio::time::timeout(within, self.socket.recv(&mut buf))
            .await
            .is_err()
    }
}

impl Drop for MockPeer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Create a mock USB descriptor response (GET_DESCRIPTOR Device)
///
/// Returns a standard 18-byte device descriptor
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x10, 0x01, // bcdUSB (1.10)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x08, // bMaxPacketSize0 (8 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x00, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}
