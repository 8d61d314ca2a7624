//! IngeLight - reactive BLE central session layer
//!
//! Tracks discovered peripherals, mediates the connect/disconnect lifecycle of
//! a single active connection, caches discovered services and characteristics,
//! and turns the radio's callback-style events into awaitable operations and
//! observable state.
//!
//! ```no_run
//! use ingelight::ble::{MockRadio, SessionManager};
//! use ingelight::config::SessionConfig;
//!
//! # async fn demo() -> Result<(), ingelight::IngeLightError> {
//! let radio = MockRadio::powered_on();
//! let manager = SessionManager::new(radio, SessionConfig::default());
//! manager.start_scanning(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod ble;
pub mod config;

use thiserror::Error;

pub use ble::{
    CharacteristicSession, ConnectionState, DeviceSession, Observable, ServiceSession,
    SessionError, SessionManager, Updates,
};
pub use config::SessionConfig;

/// Crate-level error
#[derive(Error, Debug)]
pub enum IngeLightError {
    #[error("BLE session error: {0}")]
    Session(#[from] ble::SessionError),

    #[error("Radio adapter error: {0}")]
    Adapter(#[from] ble::AdapterError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}
