//! Socket-backed virtual USB device
//!
//! A virtual USB device whose transfers are answered by a peer process over a
//! Unix datagram socket. The host side delivers SETUP/IN/OUT tokens and
//! lifecycle events; the [`Device`] gates them by state and bus address and
//! forwards the legal ones to the peer as single request/reply round trips.
//!
//! # Example
//!
//! ```no_run
//! use device::{ChannelNotifier, HostAdapter};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let adapter = HostAdapter::default();
//! let (handle, task) = adapter.create_device("/tmp/usb-socket.sock")?;
//! let (tx, _notices) = async_channel::unbounded();
//! tokio::spawn(task.run(ChannelNotifier::new(tx)));
//!
//! handle.attach().await?;
//! adapter.shutdown_all();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod registry;
pub mod transfer;
pub mod transport;
pub mod usb;

pub use config::DeviceConfig;
pub use device::{Device, DeviceState};
pub use error::{HostError, TransportError};
pub use host::{
    ChannelNotifier, DeviceHandle, DeviceNotice, DeviceTask, HostAdapter, HostEvent, HostNotifier,
    control_read, control_write, enumerate, run_device,
};
pub use registry::DeviceRegistry;
pub use transfer::{InCompletion, TransferHandler};
pub use transport::{DEFAULT_REPLY_TIMEOUT, Transport};
pub use usb::{UsbPacket, UsbResponse, UsbToken};
