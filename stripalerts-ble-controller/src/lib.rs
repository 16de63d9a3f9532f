//! StripAlerts BLE Controller
//!
//! BLE client that provisions StripAlerts devices: WiFi credentials, a
//! connection test, the event endpoint, and the final commit.
//!
//! # Example
//!
//! ```ignore
//! use stripalerts_ble_controller::{BleLink, ProvisioningConfig, ProvisioningWizard, UserAction};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProvisioningConfig::discover(None)?;
//!     let link = BleLink::new(None, config.name_prefix.clone(), config.scan_duration());
//!     let (wizard, mut ui) = ProvisioningWizard::new(link, config);
//!
//!     let (actions, actions_rx) = tokio::sync::mpsc::unbounded_channel();
//!     let flow = tokio::spawn(wizard.run(actions_rx));
//!
//!     actions.send(UserAction::BeginScan)?;
//!     while let Some(event) = ui.recv().await {
//!         println!("{event:?}");
//!     }
//!     flow.await?;
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod config;
pub mod error;
pub mod link;
pub mod reconnect;
pub mod wizard;
pub mod writer;

#[cfg(test)]
mod fake;

pub use ble::BleLink;
pub use config::{ConfigError, ProvisioningConfig};
pub use error::{TransportError, ValidationError, WizardError};
pub use link::{DeviceHandle, LinkEvent, TransportLink};
pub use reconnect::{LinkState, ReconnectPolicy, Recovery};
pub use wizard::{ProvisioningWizard, Step, UiEvent, UserAction, WizardState};
pub use writer::ChunkedWriter;
