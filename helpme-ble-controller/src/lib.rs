//! HelpMe BLE Controller
//!
//! Pushes Wi-Fi credentials to a HelpMe alarm over BLE, polls it until it
//! has joined the network and hands its identity to a [`DeviceRegistry`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use helpme_ble_controller::{BtleplugBackend, ProvisionConfig, Provisioner};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (status, mut reports) = tokio::sync::mpsc::unbounded_channel();
//!     let mut provisioner = Provisioner::new(
//!         Arc::new(BtleplugBackend::new()),
//!         my_registry,
//!         status,
//!         ProvisionConfig::default(),
//!     );
//!
//!     provisioner.start("MySSID", "MyPassword").await?;
//!     let summary = provisioner.run().await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod discovery;
pub mod driver;
pub mod engine;
pub mod error;
pub mod gatt;
pub mod link;
pub mod registry;

pub use ble::BtleplugBackend;
pub use discovery::Selection;
pub use driver::{Provisioner, StatusSink};
pub use engine::{Event, Machine, ProvisionConfig, Report, State, StateKind};
pub use error::{BackendError, LinkError, ProvisionError, ValidationError};
pub use gatt::{Capabilities, CharacteristicRef, PeripheralHandle, PeripheralId};
pub use link::{BleBackend, LinkManager};
pub use registry::{DeviceRegistry, Registration};
