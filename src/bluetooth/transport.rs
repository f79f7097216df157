//! Transport capability consumed by the controller.
//!
//! A transport scans for the device, opens connections and reports every
//! asynchronous outcome as a tagged event on a channel. The controller never
//! sees the driver's callbacks directly.

use std::{future::Future, time::Duration};

use bluer::Address;
use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::{sync::mpsc, task::JoinHandle, time};
use uuid::Uuid;

use crate::error::{LinkError, Result};

/// Opaque notification payload.
pub type Payload = SmallVec<[u8; 32]>;

/// Buffer size for discovery and link event channels
pub const EVENT_BUFFER_SIZE: usize = 128;

/// GATT service and notify characteristic the data channel lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattTarget {
   pub service: Uuid,
   pub characteristic: Uuid,
}

/// Advertised-service filter used while scanning. Never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryFilter {
   service: Uuid,
}

impl DiscoveryFilter {
   pub fn new(service: Uuid) -> Result<Self> {
      if service.is_nil() {
         return Err(LinkError::InvalidConfig("discovery filter must not be empty"));
      }
      Ok(Self { service })
   }

   pub const fn service(&self) -> Uuid {
      self.service
   }

   /// Checks an advertised service list against the filter.
   pub fn matches<'a>(&self, advertised: impl IntoIterator<Item = &'a Uuid>) -> bool {
      advertised.into_iter().any(|u| *u == self.service)
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
   Found(Address),
   Failed(SmolStr),
}

/// A running scan. Dropping it stops the scan and discards pending results.
#[derive(Debug)]
pub struct Discovery {
   rx: mpsc::Receiver<DiscoveryEvent>,
   task: JoinHandle<()>,
}

impl Discovery {
   pub fn channel() -> (mpsc::Sender<DiscoveryEvent>, mpsc::Receiver<DiscoveryEvent>) {
      mpsc::channel(EVENT_BUFFER_SIZE)
   }

   /// Wraps the receiving half and the task feeding it.
   pub fn new(rx: mpsc::Receiver<DiscoveryEvent>, task: JoinHandle<()>) -> Self {
      Self { rx, task }
   }

   /// Waits up to `window` for the first matching address.
   pub async fn first_match(&mut self, window: Duration) -> Result<Address> {
      match time::timeout(window, self.rx.recv()).await {
         Ok(Some(DiscoveryEvent::Found(address))) => Ok(address),
         Ok(Some(DiscoveryEvent::Failed(reason))) => Err(LinkError::TransportFailure(reason)),
         Ok(None) | Err(_) => Err(LinkError::DiscoveryTimeout),
      }
   }
}

impl Drop for Discovery {
   fn drop(&mut self) {
      self.task.abort();
   }
}

/// Everything a connection reports back to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
   Connected,
   Disconnected,
   /// Non-success connection-level status.
   Failed(SmolStr),
   ServicesDiscovered(bool),
   DescriptorWritten(bool),
   CharacteristicChanged(Payload),
}

/// Receiving side of a connection's event stream.
#[derive(Debug)]
pub struct LinkEvents {
   rx: mpsc::Receiver<LinkEvent>,
   closed: bool,
}

impl LinkEvents {
   pub fn channel() -> (mpsc::Sender<LinkEvent>, Self) {
      let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
      (tx, Self { rx, closed: false })
   }

   /// Next event from the transport.
   ///
   /// A closed stream is reported once as `Disconnected`; afterwards this
   /// never resolves.
   pub async fn next(&mut self) -> LinkEvent {
      if !self.closed {
         if let Some(event) = self.rx.recv().await {
            return event;
         }
         self.closed = true;
         return LinkEvent::Disconnected;
      }
      std::future::pending().await
   }
}

/// Scan and connect capability of the radio driver.
pub trait Transport: Send + Sync + 'static {
   type Link: Link;

   /// Fails with `TransportUnavailable` when the radio is off or access is
   /// not permitted.
   fn ensure_available(&self) -> impl Future<Output = Result<()>> + Send;

   /// Starts a filtered scan reporting matches as `DiscoveryEvent`s.
   fn start_discovery(
      &self,
      filter: &DiscoveryFilter,
   ) -> impl Future<Output = Result<Discovery>> + Send;

   /// Starts connecting to `address`. Progress arrives on the event stream.
   fn connect(
      &self,
      address: Address,
   ) -> impl Future<Output = Result<(Self::Link, LinkEvents)>> + Send;
}

/// Handle to one connection.
pub trait Link: Send + Sync + 'static {
   /// Requests service discovery; reported as `ServicesDiscovered`.
   fn discover_services(&self) -> impl Future<Output = Result<()>> + Send;

   /// Subscribes to `target`'s characteristic; reported as
   /// `DescriptorWritten`, then `CharacteristicChanged` per notification.
   ///
   /// Fails with `NegotiationFailure` if the service or characteristic is
   /// missing.
   fn enable_notifications(&self, target: GattTarget) -> impl Future<Output = Result<()>> + Send;

   /// Releases the connection. Must be idempotent.
   fn disconnect(&self) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_filter_rejects_nil() {
      assert!(DiscoveryFilter::new(Uuid::nil()).is_err());
   }

   #[test]
   fn test_filter_matches_advertised_list() {
      let service = crate::config::RX_TX_SERVICE;
      let filter = DiscoveryFilter::new(service).unwrap();
      let other = Uuid::from_u128(0x180f);
      assert!(filter.matches(&[other, service]));
      assert!(!filter.matches(&[other]));
      assert!(!filter.matches(Vec::<Uuid>::new().iter()));
   }

   #[tokio::test(start_paused = true)]
   async fn test_first_match_times_out() {
      let (tx, rx) = Discovery::channel();
      let task = tokio::spawn(async move {
         let _tx = tx;
         std::future::pending::<()>().await;
      });
      let mut discovery = Discovery::new(rx, task);
      let started = time::Instant::now();
      let res = discovery.first_match(Duration::from_millis(5000)).await;
      assert!(matches!(res, Err(LinkError::DiscoveryTimeout)));
      assert!(started.elapsed() >= Duration::from_millis(5000));
   }

   #[tokio::test]
   async fn test_first_match_returns_address() {
      let (tx, rx) = Discovery::channel();
      let address = Address::new([1, 2, 3, 4, 5, 6]);
      tx.send(DiscoveryEvent::Found(address)).await.unwrap();
      let mut discovery = Discovery::new(rx, tokio::spawn(async {}));
      let found = discovery.first_match(Duration::from_secs(5)).await.unwrap();
      assert_eq!(found, address);
   }

   #[tokio::test]
   async fn test_closed_link_reports_disconnect_once() {
      let (tx, mut events) = LinkEvents::channel();
      tx.send(LinkEvent::Connected).await.unwrap();
      drop(tx);
      assert_eq!(events.next().await, LinkEvent::Connected);
      assert_eq!(events.next().await, LinkEvent::Disconnected);
      let again = time::timeout(Duration::from_millis(10), events.next()).await;
      assert!(again.is_err());
   }
}
