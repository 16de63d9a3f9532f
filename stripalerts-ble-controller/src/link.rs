//! Transport seam between the wizard and the radio.

use stripalerts_proto::Channel;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// A discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Platform peripheral id, stable for the lifetime of the adapter.
    pub id: String,
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
}

/// Something the peripheral pushed, or the link itself going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification { channel: Channel, value: Vec<u8> },
    /// The connection dropped without being asked to.
    Disconnected,
}

pub type EventSender = mpsc::UnboundedSender<LinkEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// One physical session to one peripheral.
///
/// Operations take `&mut self`, so at most one of them is in flight at a
/// time and writes to the same channel are never interleaved.
#[async_trait::async_trait]
pub trait TransportLink: Send + Sync {
    /// Find a peripheral advertising the configured name prefix.
    async fn discover(&mut self) -> Result<DeviceHandle, TransportError>;

    /// Connect and resolve all six channels. Fails as a whole with
    /// `ChannelMissing` if any channel is absent.
    async fn connect(&mut self, device: &DeviceHandle) -> Result<(), TransportError>;

    /// Deliver notifications of `channel` to `events`. Subscriptions are
    /// remembered and restored by [`TransportLink::reconnect`].
    async fn subscribe(&mut self, channel: Channel, events: EventSender)
    -> Result<(), TransportError>;

    /// Write one raw frame.
    async fn write_frame(&mut self, channel: Channel, frame: &[u8]) -> Result<(), TransportError>;

    async fn read(&mut self, channel: Channel) -> Result<Vec<u8>, TransportError>;

    /// Re-establish the session to the last connected device, re-resolve the
    /// channels and re-subscribe. Never replays writes.
    async fn reconnect(&mut self) -> Result<(), TransportError>;

    async fn is_connected(&self) -> bool;

    /// Close the session. No `Disconnected` event is produced for it.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
