//! Device session: one connection to the Forumslader and its negotiation.
//!
//! After connecting, the session walks the link through service discovery and
//! notification subscription. Every notification refreshes the activity
//! timestamp the controller's liveness check reads.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::time::Instant;

use crate::{
   bluetooth::transport::{GattTarget, Link, LinkEvent, LinkEvents, Payload, Transport},
   error::{LinkError, Result},
   status::{Status, StatusBoard},
};

/// Lock-free view of the current session, readable from any thread.
#[derive(Debug, Default)]
pub struct SessionInfo {
   address: AtomicCell<Option<Address>>,
   last_activity: AtomicCell<Option<Instant>>,
}

impl SessionInfo {
   fn begin(&self, address: Address, now: Instant) {
      self.address.store(Some(address));
      self.last_activity.store(Some(now));
   }

   fn touch(&self, now: Instant) {
      self.last_activity.store(Some(now));
   }

   pub fn clear(&self) {
      self.address.store(None);
      self.last_activity.store(None);
   }

   pub fn address(&self) -> Option<Address> {
      self.address.load()
   }

   pub fn last_activity(&self) -> Option<Instant> {
      self.last_activity.load()
   }

   pub fn seconds_since_activity(&self) -> Option<u64> {
      self.last_activity().map(|last| last.elapsed().as_secs())
   }

   /// Converts the session state to a JSON representation.
   pub fn to_json(&self, status: Status) -> serde_json::Value {
      json!({
         "status": status.to_str(),
         "connected": status.has_link(),
         "address": self.address().map(|a| a.to_string()),
         "seconds_since_activity": self.seconds_since_activity(),
      })
   }
}

/// One physical connection attempt and its lifetime.
pub struct DeviceSession<L: Link> {
   address: Address,
   link: L,
   events: LinkEvents,
   target: GattTarget,
   threshold: Duration,
   info: Arc<SessionInfo>,
   released: AtomicBool,
   channel_open: bool,
}

impl<L: Link> DeviceSession<L> {
   /// Starts connecting to `address`.
   pub async fn open<T>(
      transport: &T,
      address: Address,
      target: GattTarget,
      threshold: Duration,
      info: Arc<SessionInfo>,
      status: &StatusBoard,
   ) -> Result<Self>
   where
      T: Transport<Link = L>,
   {
      info!("Connecting to {address}");
      status.set(Status::Connecting);
      let (link, events) = transport.connect(address).await?;
      info.begin(address, Instant::now());

      Ok(Self {
         address,
         link,
         events,
         target,
         threshold,
         info,
         released: AtomicBool::new(false),
         channel_open: false,
      })
   }

   pub const fn address(&self) -> Address {
      self.address
   }

   pub fn is_released(&self) -> bool {
      self.released.load(Ordering::Acquire)
   }

   pub async fn next_event(&mut self) -> LinkEvent {
      self.events.next().await
   }

   /// Advances the negotiation for one transport event.
   pub async fn handle_event(&mut self, event: LinkEvent, status: &StatusBoard) {
      let address = self.address;
      if self.is_released() {
         debug!("{address}: ignoring {event:?} after teardown");
         return;
      }

      match event {
         LinkEvent::Connected => {
            info!("{address}: connected, discovering services");
            advance(status, Status::DiscoveringService);
            if let Err(e) = self.link.discover_services().await {
               warn!("{address}: service discovery could not start: {e}");
               self.disconnect().await;
            }
         },
         LinkEvent::Failed(reason) => {
            warn!("{address}: {}", LinkError::TransportFailure(reason));
            self.disconnect().await;
         },
         LinkEvent::Disconnected => {
            info!("{address}: disconnected by transport");
            self.disconnect().await;
         },
         LinkEvent::ServicesDiscovered(ok) => {
            advance(status, Status::DiscoveringCharacteristic);
            if !ok {
               warn!("{address}: service discovery failed");
               self.disconnect().await;
               return;
            }
            match self.link.enable_notifications(self.target).await {
               Ok(()) => debug!("{address}: notification subscription requested"),
               Err(e @ LinkError::NegotiationFailure(_)) => {
                  // Link stays up without a data channel; the watch reaps it.
                  error!("{address}: {e}");
               },
               Err(e) => {
                  warn!("{address}: failed to enable notifications: {e}");
                  self.disconnect().await;
               },
            }
         },
         LinkEvent::DescriptorWritten(true) => {
            if !self.channel_open {
               self.channel_open = true;
               info!("{address}: data channel open");
               advance(status, Status::Connected);
            }
         },
         LinkEvent::DescriptorWritten(false) => {
            error!("{address}: cannot write notification descriptor");
            self.disconnect().await;
         },
         LinkEvent::CharacteristicChanged(payload) => {
            self.info.touch(Instant::now());
            debug!("← {address}: {}", format_payload(&payload));
            advance(status, Status::Receiving);
         },
      }
   }

   /// Whether nothing arrived within the liveness threshold as of `now`.
   pub fn is_dead_at(&self, now: Instant) -> bool {
      self
         .info
         .last_activity()
         .is_none_or(|last| now.saturating_duration_since(last) > self.threshold)
   }

   pub fn is_dead(&self) -> bool {
      self.is_dead_at(Instant::now())
   }

   /// Releases the transport. Safe to call repeatedly and concurrently.
   pub async fn disconnect(&self) {
      if self.released.swap(true, Ordering::AcqRel) {
         return;
      }
      self.link.disconnect().await;
      info!("Disconnected from {}", self.address);
   }
}

/// Publishes link progress unless the radio is gone or the controller is
/// stopping.
fn advance(status: &StatusBoard, next: Status) {
   let current = status.current();
   if matches!(current, Status::WaitingForBluetooth | Status::Stopping) {
      debug!("Keeping {current}, not publishing {next}");
      return;
   }
   status.set(next);
}

fn format_payload(payload: &Payload) -> String {
   if payload.len() < 16 {
      hex::encode(payload)
   } else {
      format!(
         "{}..{} ({} bytes)",
         hex::encode(&payload[..8]),
         hex::encode(&payload[payload.len() - 8..]),
         payload.len()
      )
   }
}
