//! Scripted in-memory transport for controller and session tests.

use std::{
   collections::VecDeque,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU32, Ordering},
   },
};

use bluer::Address;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
   bluetooth::transport::{
      Discovery, DiscoveryEvent, DiscoveryFilter, GattTarget, Link, LinkEvent, LinkEvents,
      Transport,
   },
   error::{LinkError, Result},
};

#[derive(Default)]
struct MockState {
   available: bool,
   fail_connect: bool,
   discoveries: VecDeque<Option<Address>>,
   scans: u32,
   links: Vec<MockLink>,
}

/// Transport whose scan results are queued up front by the test.
#[derive(Clone)]
pub struct MockTransport {
   state: Arc<Mutex<MockState>>,
}

impl MockTransport {
   pub fn new() -> Self {
      Self {
         state: Arc::new(Mutex::new(MockState {
            available: true,
            ..Default::default()
         })),
      }
   }

   pub fn set_available(&self, available: bool) {
      self.state.lock().available = available;
   }

   pub fn fail_connect(&self) {
      self.state.lock().fail_connect = true;
   }

   /// Queues the outcome of the next scan; `None` finds nothing.
   pub fn push_discovery(&self, address: Option<Address>) {
      self.state.lock().discoveries.push_back(address);
   }

   pub fn scans(&self) -> u32 {
      self.state.lock().scans
   }

   pub fn links(&self) -> Vec<MockLink> {
      self.state.lock().links.clone()
   }

   pub fn last_link(&self) -> Option<MockLink> {
      self.state.lock().links.last().cloned()
   }
}

impl Transport for MockTransport {
   type Link = MockLink;

   async fn ensure_available(&self) -> Result<()> {
      if self.state.lock().available {
         Ok(())
      } else {
         Err(LinkError::unavailable("radio off"))
      }
   }

   async fn start_discovery(&self, _filter: &DiscoveryFilter) -> Result<Discovery> {
      let next = {
         let mut state = self.state.lock();
         state.scans += 1;
         state.discoveries.pop_front().flatten()
      };
      let (tx, rx) = Discovery::channel();
      let task = tokio::spawn(async move {
         if let Some(address) = next {
            let _ = tx.send(DiscoveryEvent::Found(address)).await;
         }
         // Keep the scan open until the discovery is dropped.
         std::future::pending::<()>().await;
      });
      Ok(Discovery::new(rx, task))
   }

   async fn connect(&self, address: Address) -> Result<(MockLink, LinkEvents)> {
      let mut state = self.state.lock();
      if state.fail_connect {
         return Err(LinkError::TransportFailure("connect refused".into()));
      }
      let (tx, events) = LinkEvents::channel();
      let link = MockLink {
         inner: Arc::new(MockLinkInner {
            address,
            events: tx,
            calls: Mutex::new(Vec::new()),
            disconnects: AtomicU32::new(0),
            missing_characteristic: AtomicBool::new(false),
         }),
      };
      state.links.push(link.clone());
      Ok((link, events))
   }
}

struct MockLinkInner {
   address: Address,
   events: mpsc::Sender<LinkEvent>,
   calls: Mutex<Vec<&'static str>>,
   disconnects: AtomicU32,
   missing_characteristic: AtomicBool,
}

/// Connection handle that lets the test play the transport's callbacks.
#[derive(Clone)]
pub struct MockLink {
   inner: Arc<MockLinkInner>,
}

impl MockLink {
   pub fn address(&self) -> Address {
      self.inner.address
   }

   pub async fn emit(&self, event: LinkEvent) {
      self.inner.events.send(event).await.unwrap();
   }

   pub fn calls(&self) -> Vec<&'static str> {
      self.inner.calls.lock().clone()
   }

   pub fn disconnects(&self) -> u32 {
      self.inner.disconnects.load(Ordering::SeqCst)
   }

   pub fn set_missing_characteristic(&self) {
      self.inner.missing_characteristic.store(true, Ordering::SeqCst);
   }
}

impl Link for MockLink {
   async fn discover_services(&self) -> Result<()> {
      self.inner.calls.lock().push("discover_services");
      Ok(())
   }

   async fn enable_notifications(&self, target: GattTarget) -> Result<()> {
      self.inner.calls.lock().push("enable_notifications");
      if self.inner.missing_characteristic.load(Ordering::SeqCst) {
         return Err(LinkError::NegotiationFailure(
            format!("characteristic {} not found", target.characteristic).into(),
         ));
      }
      Ok(())
   }

   async fn disconnect(&self) {
      self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
   }
}
