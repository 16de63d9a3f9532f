//! Provisioning wizard.
//!
//! Drives a device through `Device → Wifi → Api → Confirm → Complete`. User
//! actions and link events are both consumed by one task, so every transition
//! sees a consistent [`WizardState`]. Test and save results arrive as
//! notifications and are matched against a pending result that remembers the
//! step it was started in; anything that does not match is dropped.

use std::fmt;

use stripalerts_proto::ble::{commands, results, status};
use stripalerts_proto::{Channel, Network, NetworksDecoder};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::ProvisioningConfig;
use crate::error::{ValidationError, WizardError};
use crate::link::{DeviceHandle, EventReceiver, EventSender, LinkEvent, TransportLink};
use crate::reconnect::{LinkState, ReconnectPolicy, Recovery};
use crate::writer::ChunkedWriter;

/// Longest SSID allowed by 802.11.
pub const MAX_SSID_LEN: usize = 32;
/// Longest WPA2 passphrase.
pub const MAX_PASSWORD_LEN: usize = 64;
/// Path segment every event endpoint contains.
pub const REQUIRED_SEGMENT: &str = "/events/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    Device,
    Wifi,
    Api,
    Confirm,
    Complete,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Device => "device",
            Step::Wifi => "wifi",
            Step::Api => "api",
            Step::Confirm => "confirm",
            Step::Complete => "complete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WizardState {
    pub step: Step,
    pub ssid: String,
    pub password: String,
    pub api_url: String,
    pub device_ready: bool,
    pub wifi_test_success: bool,
    pub save_in_flight: bool,
}

impl Default for WizardState {
    fn default() -> Self {
        Self {
            step: Step::Device,
            ssid: String::new(),
            password: String::new(),
            api_url: String::new(),
            device_ready: false,
            wifi_test_success: false,
            save_in_flight: false,
        }
    }
}

/// Emitted to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    StepChanged(Step),
    Error { step: Step, error: WizardError },
    NetworksUpdated(Vec<Network>),
    StatusChanged(String),
    Completed,
    /// A transport sequence started (`true`) or finished (`false`); input for
    /// the current step should be disabled meanwhile.
    Busy(bool),
}

/// Requests from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    /// Discover and connect. After automatic recovery failed, this is also
    /// the manual retry and keeps the current step.
    BeginScan,
    SubmitWifi { ssid: String, password: String },
    SubmitEndpoint(String),
    ConfirmSave,
    RequestRescan,
    GoBack,
}

pub fn validate_credentials(ssid: &str, password: &str) -> Result<(), ValidationError> {
    if ssid.is_empty() {
        return Err(ValidationError::EmptySsid);
    }
    if password.is_empty() {
        return Err(ValidationError::EmptyPassword);
    }
    if ssid.len() > MAX_SSID_LEN {
        return Err(ValidationError::SsidTooLong {
            len: ssid.len(),
            max: MAX_SSID_LEN,
        });
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(ValidationError::PasswordTooLong {
            len: password.len(),
            max: MAX_PASSWORD_LEN,
        });
    }
    Ok(())
}

/// Accept only `https` URLs whose path contains `/events/`.
pub fn validate_endpoint(endpoint: &str) -> Result<(), ValidationError> {
    let url = url::Url::parse(endpoint.trim())
        .map_err(|e| ValidationError::MalformedEndpoint(e.to_string()))?;
    if url.scheme() != "https" {
        return Err(ValidationError::InsecureScheme(url.scheme().to_string()));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ValidationError::MalformedEndpoint("missing host".into()));
    }
    if !url.path().contains(REQUIRED_SEGMENT) {
        return Err(ValidationError::MissingSegment(REQUIRED_SEGMENT));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Test,
    Save,
}

#[derive(Debug, Clone, Copy)]
struct PendingResult {
    kind: PendingKind,
    step: Step,
    deadline: Instant,
}

/// Outcome of a test or save as reported by the peripheral.
enum Outcome {
    Success,
    Failure(String),
}

pub struct ProvisioningWizard<L> {
    link: L,
    config: ProvisioningConfig,
    writer: ChunkedWriter,
    policy: ReconnectPolicy,
    state: WizardState,
    networks: NetworksDecoder,
    events_tx: EventSender,
    events_rx: EventReceiver,
    ui: mpsc::UnboundedSender<UiEvent>,
    device: Option<DeviceHandle>,
    pending: Option<PendingResult>,
    last_status: String,
}

impl<L: TransportLink> ProvisioningWizard<L> {
    pub fn new(link: L, config: ProvisioningConfig) -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (ui, ui_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let wizard = Self {
            link,
            writer: ChunkedWriter::new(),
            policy: ReconnectPolicy::new(&config.reconnect),
            networks: NetworksDecoder::new(config.reassembly),
            config,
            state: WizardState::default(),
            events_tx,
            events_rx,
            ui,
            device: None,
            pending: None,
            last_status: String::new(),
        };
        (wizard, ui_rx)
    }

    pub fn state(&self) -> &WizardState {
        &self.state
    }

    /// The connected device, once discovery succeeded.
    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    /// Consume actions and link events until the flow completes or `actions`
    /// is closed. The link is disconnected on the way out.
    pub async fn run(mut self, mut actions: mpsc::UnboundedReceiver<UserAction>) -> WizardState {
        while self.state.step != Step::Complete {
            let deadline = self.pending.map(|p| p.deadline);
            // Link events first, so results already delivered are applied
            // before the next user action is looked at.
            tokio::select! {
                biased;
                Some(event) = self.events_rx.recv() => self.handle_link_event(event).await,
                _ = sleep_until(deadline) => self.expire_pending(),
                action = actions.recv() => match action {
                    Some(action) => self.handle_action(action).await,
                    None => break,
                },
            }
        }
        if let Err(e) = self.link.disconnect().await {
            log::debug!("disconnect: {e}");
        }
        self.state
    }

    pub async fn handle_action(&mut self, action: UserAction) {
        if self.state.step == Step::Complete {
            log::debug!("flow complete, ignoring input");
            return;
        }
        match action {
            UserAction::BeginScan => self.begin_scan().await,
            UserAction::SubmitWifi { ssid, password } => self.submit_wifi(ssid, password).await,
            UserAction::SubmitEndpoint(endpoint) => self.submit_endpoint(endpoint),
            UserAction::ConfirmSave => self.confirm_save().await,
            UserAction::RequestRescan => self.request_rescan().await,
            UserAction::GoBack => self.go_back(),
        }
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Notification { channel, value } => self.on_notification(channel, &value).await,
            LinkEvent::Disconnected => self.on_disconnect().await,
        }
    }

    /// Fail the pending test or save if its deadline passed. A pending result
    /// whose step is no longer current is dropped without an error.
    pub fn expire_pending(&mut self) {
        let Some(pending) = self.pending else {
            return;
        };
        if Instant::now() < pending.deadline {
            return;
        }
        self.pending = None;
        if pending.step != self.state.step {
            log::debug!("dropping expired {:?} for step {}", pending.kind, pending.step);
            if pending.kind == PendingKind::Save {
                self.state.save_in_flight = false;
            }
            self.emit(UiEvent::Busy(false));
            return;
        }
        let error = match pending.kind {
            PendingKind::Test => WizardError::TestTimeout,
            PendingKind::Save => {
                self.state.save_in_flight = false;
                WizardError::SaveTimeout
            }
        };
        log::warn!("{error}");
        self.emit(UiEvent::Busy(false));
        self.fail(error);
    }

    async fn begin_scan(&mut self) {
        let step = self.state.step;
        if step != Step::Device && self.policy.state() == LinkState::Attached {
            log::debug!("already connected, ignoring scan request at {step}");
            return;
        }
        self.emit(UiEvent::Busy(true));
        let result = self.connect_device().await;
        self.emit(UiEvent::Busy(false));
        if let Err(e) = result {
            self.fail(e);
            return;
        }
        if step == Step::Device {
            self.set_step(Step::Wifi);
        }
        if self.state.step == Step::Wifi {
            tokio::time::sleep(self.config.timings.rescan_settle()).await;
            if let Err(e) = self.rescan().await {
                self.fail(e);
            }
        }
    }

    async fn connect_device(&mut self) -> Result<(), WizardError> {
        self.state.device_ready = false;
        self.policy.mark_detached();
        if self.link.is_connected().await {
            let _ = self.link.disconnect().await;
        }

        let device = self.link.discover().await?;
        log::info!("connecting to {} ({})", device.name, device.address);
        self.link.connect(&device).await?;
        for channel in Channel::NOTIFY {
            self.link.subscribe(channel, self.events_tx.clone()).await?;
        }
        self.networks.reset();
        self.device = Some(device);
        self.policy.mark_attached();
        self.wait_ready().await
    }

    /// Wait for a "Ready" status notification, then fall back to polling the
    /// status channel.
    async fn wait_ready(&mut self) -> Result<(), WizardError> {
        let timings = self.config.timings.clone();
        let deadline = Instant::now() + timings.ready_wait();
        while !self.state.device_ready {
            match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_link_event(event).await,
                Ok(None) | Err(_) => break,
            }
        }
        if self.state.device_ready {
            return Ok(());
        }

        log::debug!("no ready notification, polling status");
        for attempt in 0..timings.ready_poll_attempts {
            if attempt > 0 {
                tokio::time::sleep(timings.ready_poll_interval()).await;
            }
            match self.link.read(Channel::Status).await {
                Ok(raw) => {
                    self.on_status(&raw);
                    if self.state.device_ready {
                        return Ok(());
                    }
                }
                Err(e) => log::warn!("status poll {attempt}: {e}"),
            }
        }
        Err(WizardError::DeviceNotReady)
    }

    async fn rescan(&mut self) -> Result<(), WizardError> {
        self.networks.reset();
        self.writer
            .write(&mut self.link, Channel::WifiTest, commands::RESCAN)
            .await?;
        Ok(())
    }

    async fn request_rescan(&mut self) {
        if self.state.step != Step::Wifi {
            log::debug!("rescan only available at the wifi step");
            return;
        }
        if let Err(e) = self.rescan().await {
            self.fail(e);
        }
    }

    async fn submit_wifi(&mut self, ssid: String, password: String) {
        if self.state.step != Step::Wifi {
            log::debug!("ignoring wifi submission at {}", self.state.step);
            return;
        }
        if self.pending.is_some_and(|p| p.kind == PendingKind::Test) {
            log::debug!("wifi test already in progress");
            return;
        }
        if let Err(e) = validate_credentials(&ssid, &password) {
            self.fail(e.into());
            return;
        }
        self.state.ssid = ssid;
        self.state.password = password;
        self.state.wifi_test_success = false;

        self.emit(UiEvent::Busy(true));
        match self.send_test().await {
            Ok(()) => {
                self.pending = Some(PendingResult {
                    kind: PendingKind::Test,
                    step: Step::Wifi,
                    deadline: Instant::now() + self.config.timings.test_timeout(),
                });
            }
            Err(e) => {
                self.emit(UiEvent::Busy(false));
                self.fail(e);
            }
        }
    }

    async fn send_test(&mut self) -> Result<(), WizardError> {
        let settle = self.config.timings.settle();
        self.writer
            .write(&mut self.link, Channel::Ssid, &self.state.ssid)
            .await?;
        tokio::time::sleep(settle).await;
        self.writer
            .write(&mut self.link, Channel::Password, &self.state.password)
            .await?;
        tokio::time::sleep(settle).await;
        self.writer
            .write(&mut self.link, Channel::WifiTest, commands::TEST)
            .await?;
        Ok(())
    }

    fn submit_endpoint(&mut self, endpoint: String) {
        if self.state.step != Step::Api {
            log::debug!("ignoring endpoint at {}", self.state.step);
            return;
        }
        if let Err(e) = validate_endpoint(&endpoint) {
            self.fail(e.into());
            return;
        }
        self.state.api_url = endpoint.trim().to_string();
        self.set_step(Step::Confirm);
    }

    async fn confirm_save(&mut self) {
        if self.state.step != Step::Confirm {
            log::debug!("ignoring save at {}", self.state.step);
            return;
        }
        if self.state.save_in_flight {
            log::debug!("save already in progress");
            return;
        }
        if !self.state.wifi_test_success {
            self.fail(ValidationError::WifiNotTested.into());
            return;
        }
        if let Err(e) = validate_endpoint(&self.state.api_url) {
            self.fail(e.into());
            return;
        }

        self.state.save_in_flight = true;
        self.emit(UiEvent::Busy(true));
        match self.send_save().await {
            Ok(()) => {
                self.pending = Some(PendingResult {
                    kind: PendingKind::Save,
                    step: Step::Confirm,
                    deadline: Instant::now() + self.config.timings.save_timeout(),
                });
            }
            Err(e) => {
                self.state.save_in_flight = false;
                self.emit(UiEvent::Busy(false));
                self.fail(e);
            }
        }
    }

    /// Re-assert every field, then commit.
    async fn send_save(&mut self) -> Result<(), WizardError> {
        let settle = self.config.timings.settle();
        let fields = [
            (Channel::Ssid, self.state.ssid.clone()),
            (Channel::Password, self.state.password.clone()),
            (Channel::ApiUrl, self.state.api_url.clone()),
        ];
        for (channel, value) in fields {
            self.writer.write(&mut self.link, channel, &value).await?;
            tokio::time::sleep(settle).await;
        }
        self.writer
            .write(&mut self.link, Channel::WifiTest, commands::SAVE)
            .await?;
        Ok(())
    }

    fn go_back(&mut self) {
        match self.state.step {
            Step::Api => self.set_step(Step::Wifi),
            Step::Confirm => self.set_step(Step::Api),
            step => log::debug!("cannot go back from {step}"),
        }
    }

    async fn on_notification(&mut self, channel: Channel, value: &[u8]) {
        match channel {
            Channel::Status => {
                let text = self.on_status(value);
                if text.starts_with(status::SAVED) {
                    self.resolve(PendingKind::Save, Outcome::Success).await;
                } else if text.starts_with(status::SAVE_FAILED) {
                    let detail = failure_detail(&text);
                    self.resolve(PendingKind::Save, Outcome::Failure(detail)).await;
                }
            }
            Channel::Networks => {
                if let Some(networks) = self.networks.decode(value) {
                    log::debug!("{} network(s) reported", networks.len());
                    self.emit(UiEvent::NetworksUpdated(networks));
                }
            }
            Channel::WifiTest => {
                let text = String::from_utf8_lossy(value).trim().to_string();
                let lower = text.to_lowercase();
                let kind = match self.pending {
                    Some(p) => p.kind,
                    None => {
                        log::debug!("discarding wifiTest {text:?} with nothing pending");
                        return;
                    }
                };
                // Test and save results are not interchangeable; anything the
                // pending kind does not expect is a leftover from an earlier round.
                let outcome = match (kind, lower.as_str()) {
                    (PendingKind::Test, results::SUCCESS) => Outcome::Success,
                    (PendingKind::Test, results::FAILED) => Outcome::Failure(String::new()),
                    (PendingKind::Save, s) if s == status::SAVED.to_lowercase() => Outcome::Success,
                    (PendingKind::Save, s) if s.starts_with(&status::SAVE_FAILED.to_lowercase()) => {
                        Outcome::Failure(failure_detail(&text))
                    }
                    _ => {
                        log::debug!("ignoring wifiTest {text:?} while {kind:?} is pending");
                        return;
                    }
                };
                self.resolve(kind, outcome).await;
            }
            other => log::debug!("unexpected notification on {other}"),
        }
    }

    /// Record a status text. Returns it trimmed.
    fn on_status(&mut self, raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw).trim().to_string();
        log::debug!("status: {text}");
        if text == status::READY {
            self.state.device_ready = true;
        }
        if !text.is_empty() {
            self.last_status = text.clone();
        }
        self.emit(UiEvent::StatusChanged(text.clone()));
        text
    }

    async fn resolve(&mut self, kind: PendingKind, outcome: Outcome) {
        match self.pending {
            Some(p) if p.kind == kind && p.step == self.state.step => self.pending = None,
            Some(p) if p.kind == kind => {
                log::warn!("discarding stale {kind:?} result for step {}", p.step);
                self.pending = None;
                if kind == PendingKind::Save {
                    self.state.save_in_flight = false;
                }
                self.emit(UiEvent::Busy(false));
                return;
            }
            _ => {
                log::debug!("discarding {kind:?} result with nothing pending");
                return;
            }
        }

        match (kind, outcome) {
            (PendingKind::Test, Outcome::Success) => {
                log::info!("wifi test passed");
                self.state.wifi_test_success = true;
                self.emit(UiEvent::Busy(false));
                self.set_step(Step::Api);
            }
            (PendingKind::Test, Outcome::Failure(_)) => {
                let detail = self.test_failure_detail().await;
                log::warn!("wifi test failed: {detail}");
                self.emit(UiEvent::Busy(false));
                self.fail(WizardError::TestFailed(detail));
            }
            (PendingKind::Save, Outcome::Success) => {
                log::info!("configuration saved, device is restarting");
                self.state.save_in_flight = false;
                self.set_step(Step::Complete);
                self.emit(UiEvent::Completed);
            }
            (PendingKind::Save, Outcome::Failure(detail)) => {
                log::warn!("save failed: {detail}");
                self.state.save_in_flight = false;
                self.emit(UiEvent::Busy(false));
                self.fail(WizardError::SaveFailed(detail));
            }
        }
    }

    /// Prefer what the device currently reports over the generic result.
    async fn test_failure_detail(&mut self) -> String {
        let read = match self.link.read(Channel::Status).await {
            Ok(raw) => String::from_utf8_lossy(&raw).trim().to_string(),
            Err(e) => {
                log::warn!("reading status after failed test: {e}");
                String::new()
            }
        };
        let detail = if read.is_empty() || read == status::TESTING {
            self.last_status.clone()
        } else {
            read
        };
        if detail.is_empty() || detail == status::TESTING {
            "device could not join the network".to_string()
        } else {
            detail
        }
    }

    async fn on_disconnect(&mut self) {
        let step = self.state.step;
        if self.device.is_none() {
            log::debug!("disconnect before any connection, ignoring");
            return;
        }
        log::warn!("device disconnected at step {step}");
        match self.policy.on_disconnect(&mut self.link, step).await {
            Recovery::Ignored => {}
            Recovery::Recovered { rescan } => {
                self.networks.reset();
                if rescan {
                    tokio::time::sleep(self.config.timings.rescan_settle()).await;
                    if let Err(e) = self.rescan().await {
                        self.fail(e);
                    }
                }
            }
            Recovery::Failed => self.fail(WizardError::ReconnectFailed),
        }
    }

    fn set_step(&mut self, step: Step) {
        if self.state.step != step {
            log::info!("step {} -> {step}", self.state.step);
            self.state.step = step;
            self.emit(UiEvent::StepChanged(step));
        }
    }

    fn fail(&mut self, error: WizardError) {
        log::warn!("{} step: {error}", self.state.step);
        self.emit(UiEvent::Error {
            step: self.state.step,
            error,
        });
    }

    fn emit(&self, event: UiEvent) {
        // The presentation layer may have gone away; the flow still finishes.
        let _ = self.ui.send(event);
    }
}

/// `"Save failed: missing fields"` → `"missing fields"`.
fn failure_detail(text: &str) -> String {
    match text.split_once(':') {
        Some((_, detail)) if !detail.trim().is_empty() => detail.trim().to_string(),
        _ => text.to_string(),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
