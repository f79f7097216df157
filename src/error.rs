//! Error types for the companion service.
//!
//! Transport, D-Bus, configuration and link lifecycle errors all funnel into
//! [`LinkError`].

use smol_str::SmolStr;
use thiserror::Error;

/// Main error type for the companion service.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   /// Radio is off, the adapter is missing, or access was refused.
   #[error("Transport unavailable: {0}")]
   TransportUnavailable(SmolStr),

   #[error("No matching device within the discovery window")]
   DiscoveryTimeout,

   #[error("Negotiation failed: {0}")]
   NegotiationFailure(SmolStr),

   #[error("Transport failure: {0}")]
   TransportFailure(SmolStr),

   #[error("A scan is already in progress")]
   ScanInProgress,

   #[error("Unknown command: {0}")]
   UnknownCommand(String),

   #[error("Invalid configuration: {0}")]
   InvalidConfig(&'static str),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Controller has been shut down")]
   ControllerShutdown,
}

impl LinkError {
   pub fn unavailable(reason: impl Into<SmolStr>) -> Self {
      Self::TransportUnavailable(reason.into())
   }

   pub const fn is_unavailable(&self) -> bool {
      matches!(self, Self::TransportUnavailable(_))
   }
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;
