//! In-memory peripheral for tests.
//!
//! Applies written frames with the peripheral's Start/Append semantics and
//! answers the wifiTest commands with the same notifications the firmware
//! sends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use stripalerts_proto::ble::{DEVICE_NAME, DEVICE_NAME_PREFIX, commands, results, status};
use stripalerts_proto::reassembly::encode_framed;
use stripalerts_proto::{Channel, FieldBuffer, Network, ReassemblyMode};

use crate::error::TransportError;
use crate::link::{DeviceHandle, EventSender, LinkEvent, TransportLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success,
    Failure,
    /// Never answer.
    Silent,
}

pub struct FakeState {
    pub discoverable: bool,
    pub missing: Option<Channel>,
    pub connected: bool,
    pub connect_calls: u32,
    pub reconnect_calls: u32,
    pub reconnect_ok: bool,
    /// Number of upcoming frame writes that fail with a lost link.
    pub lose_link_on_writes: u32,
    pub announce_ready: bool,
    pub status: String,
    pub networks: Vec<Network>,
    pub mode: ReassemblyMode,
    pub test_reply: Reply,
    pub save_reply: Reply,
    pub fields: HashMap<Channel, FieldBuffer>,
    pub frames: Vec<(Channel, Vec<u8>)>,
    pub commands: Vec<String>,
    pub subscribed: Vec<Channel>,
    events: Option<EventSender>,
}

impl FakeState {
    fn notify(&mut self, channel: Channel, value: &[u8]) {
        if channel == Channel::Status {
            self.status = String::from_utf8_lossy(value).into_owned();
        }
        if !self.subscribed.contains(&channel) {
            return;
        }
        if let Some(events) = &self.events {
            let _ = events.send(LinkEvent::Notification {
                channel,
                value: value.to_vec(),
            });
        }
    }

    fn send_networks(&mut self) {
        self.notify(Channel::Status, status::SCANNING.as_bytes());
        let payload = serde_json::to_vec(&self.networks).unwrap();
        match self.mode {
            ReassemblyMode::Direct => self.notify(Channel::Networks, &payload),
            ReassemblyMode::Framed => {
                for frame in encode_framed(&payload, 17) {
                    self.notify(Channel::Networks, &frame.to_bytes());
                }
            }
        }
        self.notify(Channel::Status, status::SCAN_COMPLETE.as_bytes());
        self.notify(Channel::Status, status::READY.as_bytes());
    }

    fn run_command(&mut self, command: &str) {
        self.commands.push(command.to_string());
        match command {
            commands::RESCAN => self.send_networks(),
            commands::TEST => {
                self.notify(Channel::Status, status::TESTING.as_bytes());
                match self.test_reply {
                    Reply::Success => self.notify(Channel::WifiTest, results::SUCCESS.as_bytes()),
                    Reply::Failure => {
                        self.notify(Channel::Status, status::WIFI_FAILED.as_bytes());
                        self.notify(Channel::WifiTest, results::FAILED.as_bytes());
                    }
                    Reply::Silent => {}
                }
            }
            commands::SAVE => {
                self.notify(Channel::Status, status::SAVING.as_bytes());
                match self.save_reply {
                    Reply::Success => self.notify(Channel::Status, status::SAVED.as_bytes()),
                    Reply::Failure => {
                        self.notify(Channel::Status, b"Save failed: missing fields")
                    }
                    Reply::Silent => {}
                }
            }
            _ => {}
        }
    }
}

#[derive(Clone)]
pub struct FakePeripheral {
    inner: Arc<Mutex<FakeState>>,
}

impl FakePeripheral {
    pub fn new() -> Self {
        let state = FakeState {
            discoverable: true,
            missing: None,
            connected: false,
            connect_calls: 0,
            reconnect_calls: 0,
            reconnect_ok: true,
            lose_link_on_writes: 0,
            announce_ready: true,
            status: String::new(),
            networks: vec![
                Network {
                    ssid: "Home".into(),
                    rssi: -42,
                },
                Network {
                    ssid: "Café".into(),
                    rssi: -77,
                },
            ],
            mode: ReassemblyMode::Direct,
            test_reply: Reply::Success,
            save_reply: Reply::Success,
            fields: HashMap::new(),
            frames: Vec::new(),
            commands: Vec::new(),
            subscribed: Vec::new(),
            events: None,
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn link(&self) -> FakeLink {
        FakeLink {
            peripheral: self.clone(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.inner.lock().unwrap()
    }

    pub fn field(&self, channel: Channel) -> String {
        self.state()
            .fields
            .get(&channel)
            .and_then(|f| f.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn notify(&self, channel: Channel, value: &[u8]) {
        self.state().notify(channel, value);
    }

    /// Simulate the radio link dropping.
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.connected = false;
        if let Some(events) = &state.events {
            let _ = events.send(LinkEvent::Disconnected);
        }
    }
}

pub struct FakeLink {
    peripheral: FakePeripheral,
}

#[async_trait::async_trait]
impl TransportLink for FakeLink {
    async fn discover(&mut self) -> Result<DeviceHandle, TransportError> {
        if !self.peripheral.state().discoverable {
            return Err(TransportError::NotFound(DEVICE_NAME_PREFIX.to_string()));
        }
        Ok(DeviceHandle {
            id: "fake-0".into(),
            name: DEVICE_NAME.into(),
            address: "00:11:22:33:44:55".into(),
            rssi: Some(-50),
        })
    }

    async fn connect(&mut self, _device: &DeviceHandle) -> Result<(), TransportError> {
        let mut state = self.peripheral.state();
        state.connect_calls += 1;
        if let Some(channel) = state.missing {
            return Err(TransportError::ChannelMissing(channel));
        }
        state.connected = true;
        Ok(())
    }

    async fn subscribe(
        &mut self,
        channel: Channel,
        events: EventSender,
    ) -> Result<(), TransportError> {
        let mut state = self.peripheral.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.events = Some(events);
        if !state.subscribed.contains(&channel) {
            state.subscribed.push(channel);
        }
        if channel == Channel::Status && state.announce_ready {
            state.notify(Channel::Status, status::READY.as_bytes());
        }
        Ok(())
    }

    async fn write_frame(&mut self, channel: Channel, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.peripheral.state();
        if state.lose_link_on_writes > 0 {
            state.lose_link_on_writes -= 1;
            state.connected = false;
            return Err(TransportError::LinkLost);
        }
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.frames.push((channel, frame.to_vec()));
        let field = state.fields.entry(channel).or_default();
        field.apply(frame);
        let command = field.as_str().map(|s| s.trim().to_lowercase());
        if channel == Channel::WifiTest {
            if let Some(command) = command {
                state.run_command(&command);
            }
        }
        Ok(())
    }

    async fn read(&mut self, channel: Channel) -> Result<Vec<u8>, TransportError> {
        let state = self.peripheral.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(match channel {
            Channel::Status => state.status.as_bytes().to_vec(),
            other => state
                .fields
                .get(&other)
                .map(|f| f.as_bytes().to_vec())
                .unwrap_or_default(),
        })
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.peripheral.state();
        state.reconnect_calls += 1;
        if !state.reconnect_ok {
            return Err(TransportError::ConnectFailed("device out of range".into()));
        }
        state.connected = true;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.state().connected
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.peripheral.state().connected = false;
        Ok(())
    }
}
