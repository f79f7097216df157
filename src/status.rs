//! Link status published to observers.
//!
//! The controller owns a single [`StatusBoard`]; observers subscribe and see
//! the latest published [`Status`], never a history of values.

use log::debug;
use tokio::sync::watch;

/// Coarse-grained state of the link to the device.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
   strum::EnumIter,
)]
pub enum Status {
   #[default]
   Stopped,
   Started,
   Scanning,
   Connecting,
   DiscoveringService,
   DiscoveringCharacteristic,
   Connected,
   Receiving,
   Stopping,
   BluetoothRequested,
   WaitingForBluetooth,
}

impl Status {
   pub fn to_str(self) -> &'static str {
      self.into()
   }

   /// States with an open data channel.
   pub const fn has_link(self) -> bool {
      matches!(self, Self::Connected | Self::Receiving)
   }
}

/// Single authoritative status value with change notification.
#[derive(Debug)]
pub struct StatusBoard {
   tx: watch::Sender<Status>,
}

impl Default for StatusBoard {
   fn default() -> Self {
      Self::new()
   }
}

impl StatusBoard {
   pub fn new() -> Self {
      let (tx, _) = watch::channel(Status::Stopped);
      Self { tx }
   }

   pub fn current(&self) -> Status {
      *self.tx.borrow()
   }

   /// Publishes `status`; returns `false` if it was already current.
   pub fn set(&self, status: Status) -> bool {
      self.tx.send_if_modified(|current| {
         if *current == status {
            return false;
         }
         debug!("status: {current} -> {status}");
         *current = status;
         true
      })
   }

   pub fn subscribe(&self) -> watch::Receiver<Status> {
      self.tx.subscribe()
   }
}
