//! Host framework adapter
//!
//! The host side of the device lives on the other end of a channel: lifecycle
//! events and USB tokens are sent as [`HostEvent`]s to a [`DeviceTask`] that
//! owns the [`Device`]. The task multiplexes those events with the peer's
//! out-of-band signals and reports attach/detach to a [`HostNotifier`].
//!
//! Only one event is processed at a time, so at most one round trip is ever
//! in flight and peer signals are not read while it is.

use crate::device::Device;
use crate::error::{HostError, TransportError};
use crate::registry::DeviceRegistry;
use crate::transport::DEFAULT_REPLY_TIMEOUT;
use crate::usb::{UsbPacket, UsbResponse};
use async_channel::{Receiver, Sender};
use protocol::{DESCRIPTOR_TYPE_DEVICE, PeerSignal, SetupPacket};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Length of a standard device descriptor
pub const DEVICE_DESCRIPTOR_SIZE: u16 = 18;

/// Descriptor prefix read at address 0, enough to learn bMaxPacketSize0
const DESCRIPTOR_PROBE_SIZE: u16 = 8;

/// Events delivered from the host to a device task
#[derive(Debug)]
pub enum HostEvent {
    Attach,
    Detach,
    Reset,
    Packet {
        packet: UsbPacket,
        reply: oneshot::Sender<UsbResponse>,
    },
    /// Stop the task; queued events are dropped
    Shutdown,
}

/// Receives the device's attach/detach notifications
pub trait HostNotifier: Send {
    fn device_attached(&mut self, path: &Path);
    fn device_detached(&mut self, path: &Path);
}

/// Notification forwarded by [`ChannelNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceNotice {
    Attached(PathBuf),
    Detached(PathBuf),
}

/// [`HostNotifier`] that forwards notices over a channel
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: Sender<DeviceNotice>,
}

impl ChannelNotifier {
    pub fn new(tx: Sender<DeviceNotice>) -> Self {
        Self { tx }
    }

    fn notify(&self, notice: DeviceNotice) {
        if let Err(e) = self.tx.try_send(notice) {
            debug!("Dropped device notice: {}", e);
        }
    }
}

impl HostNotifier for ChannelNotifier {
    fn device_attached(&mut self, path: &Path) {
        self.notify(DeviceNotice::Attached(path.to_path_buf()));
    }

    fn device_detached(&mut self, path: &Path) {
        self.notify(DeviceNotice::Detached(path.to_path_buf()));
    }
}

/// Host-side handle to a running device task
#[derive(Debug)]
pub struct DeviceHandle {
    path: PathBuf,
    events: Sender<HostEvent>,
}

impl DeviceHandle {
    pub fn new(path: PathBuf, events: Sender<HostEvent>) -> Self {
        Self { path, events }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once the task has stopped or [`DeviceHandle::close`] was called
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    async fn send(&self, event: HostEvent) -> Result<(), HostError> {
        self.events
            .send(event)
            .await
            .map_err(|_| HostError::DeviceGone)
    }

    pub async fn attach(&self) -> Result<(), HostError> {
        self.send(HostEvent::Attach).await
    }

    pub async fn detach(&self) -> Result<(), HostError> {
        self.send(HostEvent::Detach).await
    }

    pub async fn reset(&self) -> Result<(), HostError> {
        self.send(HostEvent::Reset).await
    }

    /// Deliver one token and wait for the device's response
    pub async fn submit(&self, packet: UsbPacket) -> Result<UsbResponse, HostError> {
        let (reply, response) = oneshot::channel();
        self.send(HostEvent::Packet { packet, reply }).await?;
        response.await.map_err(|_| HostError::DeviceGone)
    }

    /// Ask the task to stop and close the event channel
    ///
    /// Idempotent. The task closes the device's socket on its way out.
    pub fn close(&self) {
        let _ = self.events.try_send(HostEvent::Shutdown);
        self.events.close();
    }
}

/// A bound device waiting to be driven by [`DeviceTask::run`]
pub struct DeviceTask {
    device: Device,
    events: Receiver<HostEvent>,
}

impl DeviceTask {
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Drive the device until shutdown; returns the closed device
    pub async fn run<N: HostNotifier>(self, notifier: N) -> Device {
        run_device(self.device, self.events, notifier).await
    }
}

/// Event loop for one device
pub async fn run_device<N: HostNotifier>(
    mut device: Device,
    events: Receiver<HostEvent>,
    mut notifier: N,
) -> Device {
    info!("Device task started for {}", device.path().display());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(HostEvent::Attach) => device.attach(),
                Ok(HostEvent::Detach) => device.detach(),
                Ok(HostEvent::Reset) => device.reset(),
                Ok(HostEvent::Packet { packet, reply }) => {
                    let response = device.handle_packet(&packet).await;
                    if reply.send(response).is_err() {
                        debug!("Host dropped the reply for a {:#04x} token", packet.pid);
                    }
                }
                Ok(HostEvent::Shutdown) | Err(_) => break,
            },
            signal = device.next_signal() => match signal {
                Ok(PeerSignal::Attach) => notifier.device_attached(device.path()),
                Ok(PeerSignal::Detach) => notifier.device_detached(device.path()),
                Err(e) => warn!("Signal receive failed on {}: {}", device.path().display(), e),
            },
        }
    }

    events.close();
    device.close();
    info!("Device task stopped for {}", device.path().display());
    device
}

/// Creates devices and owns the registry of live ones
pub struct HostAdapter {
    registry: DeviceRegistry,
    reply_timeout: Duration,
}

impl Default for HostAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_REPLY_TIMEOUT)
    }
}

impl HostAdapter {
    pub fn new(reply_timeout: Duration) -> Self {
        Self {
            registry: DeviceRegistry::new(),
            reply_timeout,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Bind a device at `path` and register it
    ///
    /// The returned task must be spawned (or awaited) for the handle to do
    /// anything.
    pub fn create_device(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(Arc<DeviceHandle>, DeviceTask), TransportError> {
        let path = path.as_ref();
        let device = Device::bind(path, self.reply_timeout)?;
        let (tx, rx) = async_channel::unbounded();
        let handle = Arc::new(DeviceHandle::new(path.to_path_buf(), tx));

        if !self.registry.register(&handle) {
            return Err(TransportError::BindFailed {
                path: path.to_path_buf(),
                source: io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "a live device is registered at this path",
                ),
            });
        }

        info!("Created device at {}", path.display());
        Ok((handle, DeviceTask { device, events: rx }))
    }

    pub fn get(&self, path: &Path) -> Option<Arc<DeviceHandle>> {
        self.registry.get(path)
    }

    /// Tear down the device at `path`
    ///
    /// Idempotent; returns whether a live device was found.
    pub fn destroy_device(&self, path: &Path) -> bool {
        match self.registry.unregister(path) {
            Some(handle) => {
                handle.close();
                info!("Destroyed device at {}", path.display());
                true
            }
            None => false,
        }
    }

    /// Close every live device; the process exit hook
    pub fn shutdown_all(&self) -> usize {
        let devices = self.registry.live_devices();
        for handle in &devices {
            self.registry.unregister(handle.path());
            handle.close();
        }
        self.registry.prune();
        if !devices.is_empty() {
            info!("Shut down {} device(s)", devices.len());
        }
        devices.len()
    }
}

fn expect_complete(stage: &'static str, response: UsbResponse) -> Result<Vec<u8>, HostError> {
    match response {
        UsbResponse::Complete(data) => Ok(data),
        response => Err(HostError::StageFailed { stage, response }),
    }
}

/// Run a device-to-host control transfer: SETUP, IN data stage, OUT status
pub async fn control_read(
    handle: &DeviceHandle,
    address: u8,
    setup: SetupPacket,
) -> Result<Vec<u8>, HostError> {
    expect_complete(
        "SETUP",
        handle
            .submit(UsbPacket::setup(address, setup.to_bytes()))
            .await?,
    )?;
    let data = expect_complete(
        "DATA IN",
        handle
            .submit(UsbPacket::data_in(address, 0, usize::from(setup.length)))
            .await?,
    )?;
    expect_complete(
        "STATUS OUT",
        handle
            .submit(UsbPacket::data_out(address, 0, Vec::new()))
            .await?,
    )?;
    Ok(data)
}

/// Run a host-to-device control transfer: SETUP, optional OUT data, IN status
pub async fn control_write(
    handle: &DeviceHandle,
    address: u8,
    setup: SetupPacket,
    data: &[u8],
) -> Result<(), HostError> {
    expect_complete(
        "SETUP",
        handle
            .submit(UsbPacket::setup(address, setup.to_bytes()))
            .await?,
    )?;
    if !data.is_empty() {
        expect_complete(
            "DATA OUT",
            handle
                .submit(UsbPacket::data_out(address, 0, data.to_vec()))
                .await?,
        )?;
    }
    expect_complete(
        "STATUS IN",
        handle.submit(UsbPacket::data_in(address, 0, 0)).await?,
    )?;
    Ok(())
}

/// Enumerate a freshly attached device and return its device descriptor
///
/// Reset, read the descriptor prefix at address 0, assign `address`, then
/// read the full descriptor at the new address.
pub async fn enumerate(handle: &DeviceHandle, address: u8) -> Result<Vec<u8>, HostError> {
    handle.reset().await?;

    let prefix = control_read(
        handle,
        0,
        SetupPacket::get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, DESCRIPTOR_PROBE_SIZE),
    )
    .await?;
    debug!("Descriptor prefix: {:02x?}", prefix);

    control_write(handle, 0, SetupPacket::set_address(address), &[]).await?;

    let descriptor = control_read(
        handle,
        address,
        SetupPacket::get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, DEVICE_DESCRIPTOR_SIZE),
    )
    .await?;
    info!(
        "Enumerated {} at address {} ({} byte descriptor)",
        handle.path().display(),
        address,
        descriptor.len()
    );
    Ok(descriptor)
}
