use stripalerts_proto::Channel;

/// Failure of a single transport operation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no Bluetooth adapter found")]
    LinkUnavailable,
    #[error("no device matching {0:?} found")]
    NotFound(String),
    #[error("failed to connect: {0}")]
    ConnectFailed(String),
    #[error("{0} characteristic not found")]
    ChannelMissing(Channel),
    #[error("not connected to a device")]
    NotConnected,
    #[error("link to the device was lost")]
    LinkLost,
    #[error("failed to write {channel}: {reason}")]
    WriteFailed { channel: Channel, reason: String },
    #[error("failed to read {channel}: {reason}")]
    ReadFailed { channel: Channel, reason: String },
    #[error("bluetooth error: {0}")]
    Backend(String),
}

impl TransportError {
    /// True when the operation failed because the connection went away, which
    /// is the only case the writer answers with a reconnect.
    pub fn is_link_lost(&self) -> bool {
        matches!(self, TransportError::LinkLost | TransportError::NotConnected)
    }
}

/// Local input check that blocks a step without touching the transport.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("network name is required")]
    EmptySsid,
    #[error("password is required")]
    EmptyPassword,
    #[error("network name is {len} bytes, at most {max} allowed")]
    SsidTooLong { len: usize, max: usize },
    #[error("password is {len} bytes, at most {max} allowed")]
    PasswordTooLong { len: usize, max: usize },
    #[error("endpoint is not a valid URL: {0}")]
    MalformedEndpoint(String),
    #[error("endpoint must use https, got {0:?}")]
    InsecureScheme(String),
    #[error("endpoint path must contain {0:?}")]
    MissingSegment(&'static str),
    #[error("WiFi credentials have not passed a connection test")]
    WifiNotTested,
}

/// Errors reported to the presentation layer.
///
/// Nothing here is fatal to the process: every kind is recovered by retrying
/// the step's action or re-running discovery.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WizardError {
    #[error("Bluetooth is not available on this machine")]
    LinkUnavailable,
    #[error("no StripAlerts device found")]
    DeviceNotFound,
    #[error("could not connect to the device: {0}")]
    ConnectFailed(String),
    #[error("device is missing the {0} characteristic")]
    ChannelMissing(Channel),
    #[error("device did not report ready")]
    DeviceNotReady,
    #[error("{0}")]
    WriteFailed(String),
    #[error("{0}")]
    ReadFailed(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("WiFi test failed: {0}")]
    TestFailed(String),
    #[error("WiFi test timed out")]
    TestTimeout,
    #[error("saving failed: {0}")]
    SaveFailed(String),
    #[error("saving timed out, please retry")]
    SaveTimeout,
    #[error("connection lost, scan again to reconnect")]
    ReconnectFailed,
}

impl From<TransportError> for WizardError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::LinkUnavailable => WizardError::LinkUnavailable,
            TransportError::NotFound(_) => WizardError::DeviceNotFound,
            TransportError::ChannelMissing(channel) => WizardError::ChannelMissing(channel),
            TransportError::ConnectFailed(reason) => WizardError::ConnectFailed(reason),
            TransportError::ReadFailed { .. } => WizardError::ReadFailed(e.to_string()),
            TransportError::NotConnected
            | TransportError::LinkLost
            | TransportError::WriteFailed { .. }
            | TransportError::Backend(_) => WizardError::WriteFailed(e.to_string()),
        }
    }
}
