//! Virtual USB device state machine
//!
//! Tracks the attach/reset/address lifecycle of the socket-backed device and
//! gates which tokens may reach the peer. Lifecycle events are resolved
//! locally; SETUP/IN/OUT tokens that pass the guard are handed to the
//! [`TransferHandler`].
//!
//! ```text
//! NotAttached --ATTACH--> Attached --RESET--> Default --SET_ADDRESS(n), status IN--> AddressAssigned
//!      ^                                                                                   |
//!      +------------------------------------DETACH (any state)------------------------------+
//! ```

use crate::error::TransportError;
use crate::transfer::TransferHandler;
use crate::transport::Transport;
use crate::usb::{UsbPacket, UsbResponse, UsbToken};
use common::TransferMetrics;
use protocol::{PeerSignal, SetupPacket, TransferReply};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// USB device lifecycle state, in enumeration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceState {
    NotAttached,
    Attached,
    /// Reset and answering on address 0
    Default,
    AddressAssigned,
}

/// The single virtual USB device bound to a socket path
pub struct Device {
    handler: TransferHandler,
    state: DeviceState,
    address: u8,
    remote_wakeup: bool,
    metrics: Arc<TransferMetrics>,
}

impl Device {
    /// Bind the device's socket at `path`
    ///
    /// The device starts out `NotAttached`; a peer connection only exists
    /// once the peer sends an ATTACH signal.
    pub fn bind(path: impl AsRef<Path>, reply_timeout: Duration) -> Result<Self, TransportError> {
        let transport = Transport::bind_listen(path, reply_timeout)?;
        let metrics = Arc::new(TransferMetrics::new());
        Ok(Self {
            handler: TransferHandler::new(transport, metrics.clone()),
            state: DeviceState::NotAttached,
            address: 0,
            remote_wakeup: false,
            metrics,
        })
    }

    pub fn path(&self) -> &Path {
        self.handler.transport().path()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Bus address currently answered to
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn pending_address(&self) -> Option<u8> {
        self.handler.pending_address()
    }

    pub fn control_read_in_progress(&self) -> bool {
        self.handler.control_read_in_progress()
    }

    pub fn remote_wakeup(&self) -> bool {
        self.remote_wakeup
    }

    /// Address of the attached peer, if any
    pub fn peer(&self) -> Option<&Path> {
        self.handler.transport().peer()
    }

    pub fn metrics(&self) -> &Arc<TransferMetrics> {
        &self.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.handler.transport().is_closed()
    }

    pub fn attach(&mut self) {
        info!("{}: attached", self.path().display());
        self.state = DeviceState::Attached;
    }

    pub fn detach(&mut self) {
        info!("{}: detached", self.path().display());
        self.state = DeviceState::NotAttached;
        self.address = 0;
        self.remote_wakeup = false;
        self.handler.clear();
    }

    /// Bus reset: back to the default address
    pub fn reset(&mut self) {
        if self.state == DeviceState::NotAttached {
            debug!("{}: ignoring reset while not attached", self.path().display());
            return;
        }
        debug!("{}: reset", self.path().display());
        self.state = DeviceState::Default;
        self.address = 0;
        self.remote_wakeup = false;
        self.handler.clear();
    }

    /// Apply an out-of-band peer signal to the lifecycle
    pub fn apply_signal(&mut self, signal: PeerSignal) {
        match signal {
            PeerSignal::Attach => self.attach(),
            PeerSignal::Detach => self.detach(),
        }
    }

    /// Non-blocking check for a peer signal; applies it if one arrived
    pub fn poll_signal(&mut self) -> Option<PeerSignal> {
        let signal = self.handler.transport_mut().poll_signal()?;
        self.apply_signal(signal);
        Some(signal)
    }

    /// Wait for the next peer signal and apply it
    ///
    /// Cancel safe, for use in `select!`.
    pub async fn next_signal(&mut self) -> Result<PeerSignal, TransportError> {
        let signal = self.handler.transport_mut().wait_signal().await?;
        self.apply_signal(signal);
        Ok(signal)
    }

    /// Whether a token for `address` may be forwarded in the current state
    pub fn accepts(&self, address: u8) -> bool {
        self.state >= DeviceState::Default && address == self.address
    }

    /// Execute one host token
    pub async fn handle_packet(&mut self, packet: &UsbPacket) -> UsbResponse {
        if !self.accepts(packet.device_address) {
            debug!(
                "Rejecting token for address {} (state {:?}, address {})",
                packet.device_address, self.state, self.address
            );
            self.metrics.record_rejected();
            return UsbResponse::NoDevice;
        }

        let Some(token) = UsbToken::from_pid(packet.pid) else {
            debug!("Unsupported token pid {:#04x}", packet.pid);
            return UsbResponse::Stall;
        };

        match token {
            UsbToken::Setup => self.handle_setup(&packet.data).await,
            UsbToken::In => self.handle_in(packet.endpoint, packet.max_len).await,
            UsbToken::Out => match self.handler.data_out(packet.endpoint, &packet.data).await {
                Ok(reply) => reply.into(),
                Err(e) => self.transfer_failed("OUT", e),
            },
        }
    }

    async fn handle_setup(&mut self, request: &[u8]) -> UsbResponse {
        match self.handler.setup(request).await {
            Ok(reply) => {
                if matches!(reply, TransferReply::Ok(_))
                    && let Some(enabled) = SetupPacket::parse(request)
                        .ok()
                        .and_then(|setup| setup.remote_wakeup_change())
                {
                    debug!("Remote wakeup {}", if enabled { "enabled" } else { "disabled" });
                    self.remote_wakeup = enabled;
                }
                reply.into()
            }
            Err(e) => self.transfer_failed("SETUP", e),
        }
    }

    async fn handle_in(&mut self, endpoint: u8, max_len: usize) -> UsbResponse {
        match self.handler.data_in(endpoint, max_len).await {
            Ok(completion) => {
                if let Some(address) = completion.applied_address {
                    self.assign_address(address);
                }
                completion.reply.into()
            }
            Err(e) => self.transfer_failed("IN", e),
        }
    }

    fn assign_address(&mut self, address: u8) {
        self.address = address;
        self.state = if address == 0 {
            DeviceState::Default
        } else {
            DeviceState::AddressAssigned
        };
        info!("{}: address {} assigned", self.path().display(), address);
    }

    fn transfer_failed(&self, stage: &str, error: TransportError) -> UsbResponse {
        let response = error.response();
        match &error {
            TransportError::Timeout(_) | TransportError::PeerGone(_) => {
                warn!("{} transfer failed: {}", stage, error)
            }
            _ => debug!("{} transfer failed: {}", stage, error),
        }
        response
    }

    /// Stop listening and close the socket
    ///
    /// Idempotent. Registration is released by whoever registered the device.
    pub fn close(&mut self) {
        self.state = DeviceState::NotAttached;
        self.handler.clear();
        self.handler.transport_mut().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DEFAULT_REPLY_TIMEOUT;
    use common::test_utils::MockPeer;

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = Device::bind(dir.path().join("dev.sock"), DEFAULT_REPLY_TIMEOUT).unwrap();
        assert_eq!(device.state(), DeviceState::NotAttached);

        device.reset();
        assert_eq!(device.state(), DeviceState::NotAttached);

        device.attach();
        assert_eq!(device.state(), DeviceState::Attached);

        device.reset();
        assert_eq!(device.state(), DeviceState::Default);
        assert_eq!(device.address(), 0);

        device.detach();
        assert_eq!(device.state(), DeviceState::NotAttached);
    }

    #[tokio::test]
    async fn test_tokens_rejected_before_reset() {
        let dir = tempfile::tempdir().unwrap();
        let dev_path = dir.path().join("dev.sock");
        let mut device = Device::bind(&dev_path, DEFAULT_REPLY_TIMEOUT).unwrap();
        let peer = MockPeer::bind(dir.path().join("peer.sock"), &dev_path).unwrap();
        peer.announce().await.unwrap();
        assert_eq!(device.next_signal().await.unwrap(), PeerSignal::Attach);
        assert_eq!(device.state(), DeviceState::Attached);

        let response = device.handle_packet(&UsbPacket::data_in(0, 0, 8)).await;
        assert_eq!(response, UsbResponse::NoDevice);
        assert!(peer.is_silent_for(Duration::from_millis(50)).await);
        assert_eq!(device.metrics().snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_unknown_pid_stalls() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = Device::bind(dir.path().join("dev.sock"), DEFAULT_REPLY_TIMEOUT).unwrap();
        device.attach();
        device.reset();

        let packet = UsbPacket {
            pid: 0xA5,
            ..UsbPacket::data_in(0, 0, 0)
        };
        assert_eq!(device.handle_packet(&packet).await, UsbResponse::Stall);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let dev_path = dir.path().join("dev.sock");
        let mut device = Device::bind(&dev_path, DEFAULT_REPLY_TIMEOUT).unwrap();

        device.close();
        device.close();
        assert!(device.is_closed());
        assert!(!dev_path.exists());
    }
}
