//! BLE transport for StripAlerts devices
//!
//! [`BleLink`] implements [`TransportLink`] on top of btleplug: scanning,
//! connecting, resolving the six provisioning characteristics, and pumping
//! notifications and disconnects into the wizard's event queue.

use std::collections::HashMap;
use std::time::Duration;

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use stripalerts_proto::Channel;
use stripalerts_proto::ble::matches_prefix;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::TransportError;
use crate::link::{DeviceHandle, EventSender, LinkEvent, TransportLink};

/// How often the connection watchdog checks the link.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

/// Map a GATT characteristic onto its provisioning channel, using the
/// protocol crate's UUID table.
fn channel_of(uuid: Uuid) -> Option<Channel> {
    Channel::from_uuid(&uuid.to_string())
}

fn backend(e: btleplug::Error) -> TransportError {
    match e {
        btleplug::Error::NotConnected => TransportError::NotConnected,
        btleplug::Error::DeviceNotFound => TransportError::NotFound("device".into()),
        other => TransportError::Backend(other.to_string()),
    }
}

/// A device seen during a scan
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub device: DeviceHandle,
    pub is_stripalerts: bool,
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await.map_err(|_| TransportError::LinkUnavailable)?;
    let adapters = manager.adapters().await.map_err(|_| TransportError::LinkUnavailable)?;
    adapters.into_iter().next().ok_or(TransportError::LinkUnavailable)
}

async fn handle_of(peripheral: &Peripheral) -> Result<Option<DeviceHandle>, TransportError> {
    let Some(props) = peripheral.properties().await.map_err(backend)? else {
        return Ok(None);
    };
    Ok(Some(DeviceHandle {
        id: peripheral.id().to_string(),
        name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
        address: peripheral.address().to_string(),
        rssi: props.rssi,
    }))
}

async fn scan_devices(adapter: &Adapter, duration: Duration) -> Result<Vec<DeviceHandle>, TransportError> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(backend)?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await.map_err(backend)?;
    let mut found = Vec::new();
    for peripheral in peripherals {
        if let Some(handle) = handle_of(&peripheral).await? {
            found.push(handle);
        }
    }

    adapter.stop_scan().await.map_err(backend)?;
    Ok(found)
}

/// Scan for BLE devices
///
/// Returns every device seen; StripAlerts devices have `is_stripalerts = true`.
pub async fn scan(duration: Duration, prefix: &str) -> Result<Vec<ScannedDevice>, TransportError> {
    let adapter = get_adapter().await?;
    let found = scan_devices(&adapter, duration).await?;
    Ok(found
        .into_iter()
        .map(|device| ScannedDevice {
            is_stripalerts: matches_prefix(&device.name, prefix),
            device,
        })
        .collect())
}

/// btleplug-backed [`TransportLink`].
pub struct BleLink {
    adapter: Option<Adapter>,
    /// Name or address fragment; `None` picks the first device with `prefix`.
    target: Option<String>,
    prefix: String,
    scan_duration: Duration,
    device: Option<DeviceHandle>,
    peripheral: Option<Peripheral>,
    characteristics: HashMap<Channel, Characteristic>,
    subscriptions: Vec<Channel>,
    events: Option<EventSender>,
    tasks: Vec<JoinHandle<()>>,
}

impl BleLink {
    pub fn new(target: Option<String>, prefix: impl Into<String>, scan_duration: Duration) -> Self {
        Self {
            adapter: None,
            target,
            prefix: prefix.into(),
            scan_duration,
            device: None,
            peripheral: None,
            characteristics: HashMap::new(),
            subscriptions: Vec::new(),
            events: None,
            tasks: Vec::new(),
        }
    }

    async fn adapter(&mut self) -> Result<Adapter, TransportError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let adapter = get_adapter().await?;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    fn matches(&self, device: &DeviceHandle) -> bool {
        match &self.target {
            Some(t) => {
                device.name.contains(t.as_str())
                    || device.address.contains(t.as_str())
                    || device.id == *t
            }
            None => matches_prefix(&device.name, &self.prefix),
        }
    }

    fn peripheral(&self) -> Result<&Peripheral, TransportError> {
        self.peripheral.as_ref().ok_or(TransportError::NotConnected)
    }

    fn characteristic(&self, channel: Channel) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(&channel)
            .ok_or(TransportError::ChannelMissing(channel))
    }

    /// Connect to `device` and resolve every channel. Nothing is kept unless
    /// all six are present.
    async fn open(&mut self, device: &DeviceHandle) -> Result<(), TransportError> {
        let adapter = self.adapter().await?;
        let peripherals = adapter.peripherals().await.map_err(backend)?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.id().to_string() == device.id)
            .ok_or_else(|| TransportError::NotFound(device.name.clone()))?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral
                .connect()
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        }
        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let characteristics: HashMap<Channel, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .filter_map(|c| channel_of(c.uuid).map(|channel| (channel, c)))
            .collect();
        if let Some(missing) = Channel::ALL
            .into_iter()
            .find(|c| !characteristics.contains_key(c))
        {
            let _ = peripheral.disconnect().await;
            return Err(TransportError::ChannelMissing(missing));
        }

        self.characteristics = characteristics;
        self.peripheral = Some(peripheral);
        self.device = Some(device.clone());
        Ok(())
    }

    /// Forward notifications and watch for the link dropping.
    fn start_tasks(&mut self) {
        let (Some(peripheral), Some(events)) = (&self.peripheral, &self.events) else {
            return;
        };
        if !self.tasks.is_empty() {
            return;
        }

        let pump_peripheral = peripheral.clone();
        let pump_events = events.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut stream = match pump_peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("notification stream unavailable: {e}");
                    return;
                }
            };
            while let Some(notification) = stream.next().await {
                let Some(channel) = channel_of(notification.uuid) else {
                    log::debug!("notification from unknown {}", notification.uuid);
                    continue;
                };
                log::debug!("{channel} notified {} byte(s)", notification.value.len());
                let event = LinkEvent::Notification {
                    channel,
                    value: notification.value,
                };
                if pump_events.send(event).is_err() {
                    break;
                }
            }
        }));

        let watch_peripheral = peripheral.clone();
        let watch_events = events.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCHDOG_INTERVAL).await;
                if !watch_peripheral.is_connected().await.unwrap_or(false) {
                    log::warn!("watchdog: peripheral disconnected");
                    let _ = watch_events.send(LinkEvent::Disconnected);
                    break;
                }
            }
        }));
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Classify a failed operation: a dropped link is retried by the writer,
    /// anything else is reported as-is.
    async fn failure(&self, e: btleplug::Error) -> TransportError {
        let connected = match &self.peripheral {
            Some(p) => p.is_connected().await.unwrap_or(false),
            None => false,
        };
        if !connected || matches!(e, btleplug::Error::NotConnected) {
            TransportError::LinkLost
        } else {
            TransportError::Backend(e.to_string())
        }
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

#[async_trait::async_trait]
impl TransportLink for BleLink {
    async fn discover(&mut self) -> Result<DeviceHandle, TransportError> {
        let adapter = self.adapter().await?;
        log::info!("scanning for {} devices ({:?})", self.prefix, self.scan_duration);
        let found = scan_devices(&adapter, self.scan_duration).await?;
        found
            .into_iter()
            .find(|device| self.matches(device))
            .ok_or_else(|| {
                TransportError::NotFound(self.target.clone().unwrap_or_else(|| self.prefix.clone()))
            })
    }

    async fn connect(&mut self, device: &DeviceHandle) -> Result<(), TransportError> {
        self.stop_tasks();
        self.subscriptions.clear();
        self.open(device).await?;
        log::info!("connected to {} ({})", device.name, device.address);
        Ok(())
    }

    async fn subscribe(
        &mut self,
        channel: Channel,
        events: EventSender,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(channel)?.clone();
        self.peripheral()?
            .subscribe(&characteristic)
            .await
            .map_err(backend)?;
        if !self.subscriptions.contains(&channel) {
            self.subscriptions.push(channel);
        }
        self.events = Some(events);
        self.start_tasks();
        Ok(())
    }

    async fn write_frame(&mut self, channel: Channel, frame: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(channel)?.clone();
        let peripheral = self.peripheral()?.clone();
        match peripheral
            .write(&characteristic, frame, WriteType::WithResponse)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => match self.failure(e).await {
                TransportError::Backend(reason) => Err(TransportError::WriteFailed { channel, reason }),
                other => Err(other),
            },
        }
    }

    async fn read(&mut self, channel: Channel) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(channel)?.clone();
        let peripheral = self.peripheral()?.clone();
        match peripheral.read(&characteristic).await {
            Ok(value) => Ok(value),
            Err(e) => match self.failure(e).await {
                TransportError::Backend(reason) => Err(TransportError::ReadFailed { channel, reason }),
                other => Err(other),
            },
        }
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        let device = self.device.clone().ok_or(TransportError::NotConnected)?;
        self.stop_tasks();
        log::info!("reconnecting to {}", device.name);
        self.open(&device).await?;

        let channels = self.subscriptions.clone();
        for channel in channels {
            let characteristic = self.characteristic(channel)?.clone();
            self.peripheral()?
                .subscribe(&characteristic)
                .await
                .map_err(backend)?;
        }
        self.start_tasks();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match &self.peripheral {
            Some(p) => p.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_tasks();
        self.characteristics.clear();
        if let Some(peripheral) = self.peripheral.take() {
            peripheral.disconnect().await.map_err(backend)?;
        }
        Ok(())
    }
}
