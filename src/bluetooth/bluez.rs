//! BlueZ transport built on `bluer`.
//!
//! Scans with an LE service filter, connects through BlueZ and forwards GATT
//! notifications of the data characteristic as [`LinkEvent`]s.

use std::{
   collections::HashSet,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
   DiscoveryTransport, Session, gatt::remote::Characteristic,
};
use futures::{StreamExt, pin_mut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::ToSmolStr;
use tokio::{
   sync::mpsc,
   task::{JoinHandle, JoinSet},
   time,
};

use crate::{
   bluetooth::{
      command::RadioState,
      controller::ConnectionController,
      transport::{
         Discovery, DiscoveryEvent, DiscoveryFilter, GattTarget, Link, LinkEvent, LinkEvents,
         Payload, Transport,
      },
   },
   error::{LinkError, Result},
};

/// Maximum time to wait for the LE connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum time to wait for BlueZ to resolve GATT services
const SERVICE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport bound to one BlueZ adapter.
pub struct BluezTransport {
   _session: Session,
   adapter: Adapter,
   scanning: Arc<AtomicBool>,
}

impl BluezTransport {
   pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match adapter_name {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      info!("Using adapter {}", adapter.name());

      Ok(Self {
         _session: session,
         adapter,
         scanning: Arc::new(AtomicBool::new(false)),
      })
   }

   pub const fn adapter(&self) -> &Adapter {
      &self.adapter
   }
}

/// Forwards power changes of `adapter` to `controller`.
pub fn monitor_radio(adapter: Adapter, controller: ConnectionController) -> JoinHandle<()> {
   tokio::spawn(async move {
      let events = match adapter.events().await {
         Ok(events) => events,
         Err(e) => {
            warn!("Cannot monitor adapter {}: {e}", adapter.name());
            return;
         },
      };
      pin_mut!(events);

      while let Some(event) = events.next().await {
         if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            let state = RadioState::from_powered(powered);
            if controller.on_radio_state_changed(state).await.is_err() {
               break;
            }
         }
      }
      debug!("Radio monitor for {} stopped", adapter.name());
   })
}

/// Clears the single-scan flag when the scan task ends.
struct ScanGuard(Arc<AtomicBool>);

impl Drop for ScanGuard {
   fn drop(&mut self) {
      self.0.store(false, Ordering::Release);
   }
}

async fn advertises(adapter: &Adapter, address: Address, filter: &DiscoveryFilter) -> Result<bool> {
   let uuids = adapter.device(address)?.uuids().await?;
   Ok(uuids.is_some_and(|uuids| filter.matches(&uuids)))
}

impl Transport for BluezTransport {
   type Link = BluezLink;

   async fn ensure_available(&self) -> Result<()> {
      match self.adapter.is_powered().await {
         Ok(true) => Ok(()),
         Ok(false) => Err(LinkError::unavailable("adapter is powered off")),
         Err(e) => Err(LinkError::unavailable(e.to_smolstr())),
      }
   }

   async fn start_discovery(&self, filter: &DiscoveryFilter) -> Result<Discovery> {
      if self.scanning.swap(true, Ordering::AcqRel) {
         return Err(LinkError::ScanInProgress);
      }
      let guard = ScanGuard(self.scanning.clone());

      let mut bluez_filter = bluer::DiscoveryFilter::default();
      bluez_filter.uuids = HashSet::from([filter.service()]);
      bluez_filter.transport = DiscoveryTransport::Le;
      self.adapter.set_discovery_filter(bluez_filter).await?;
      let events = self.adapter.discover_devices().await?;
      debug!("Scanning for service {}", filter.service());

      let adapter = self.adapter.clone();
      let filter = *filter;
      let (tx, rx) = Discovery::channel();
      let task = tokio::spawn(async move {
         let _guard = guard;
         pin_mut!(events);

         while let Some(event) = events.next().await {
            let AdapterEvent::DeviceAdded(address) = event else {
               continue;
            };
            match advertises(&adapter, address, &filter).await {
               Ok(true) => {
                  debug!("Scan result: {address}");
                  if tx.send(DiscoveryEvent::Found(address)).await.is_err() {
                     return;
                  }
               },
               Ok(false) => {},
               Err(e) => debug!("{address}: cannot read advertised services: {e}"),
            }
         }
         let _ = tx
            .send(DiscoveryEvent::Failed("discovery stream ended".into()))
            .await;
      });

      Ok(Discovery::new(rx, task))
   }

   async fn connect(&self, address: Address) -> Result<(BluezLink, LinkEvents)> {
      let device = self.adapter.device(address)?;
      let (tx, events) = LinkEvents::channel();
      let link = BluezLink {
         device: device.clone(),
         events: tx.clone(),
         tasks: Mutex::new(JoinSet::new()),
         released: AtomicBool::new(false),
      };
      link.tasks.lock().spawn(connect_task(device, tx));
      Ok((link, events))
   }
}

async fn connect_task(device: Device, tx: mpsc::Sender<LinkEvent>) {
   let address = device.address();

   // Subscribe before connecting so an early drop is not missed.
   let events = match device.events().await {
      Ok(events) => events,
      Err(e) => {
         let _ = tx.send(LinkEvent::Failed(e.to_smolstr())).await;
         return;
      },
   };

   let failure = match time::timeout(CONNECT_TIMEOUT, device.connect()).await {
      Ok(Ok(())) => None,
      Ok(Err(e)) => Some(e.to_smolstr()),
      Err(_) => Some("connection timed out".into()),
   };
   if let Some(reason) = failure {
      let _ = tx.send(LinkEvent::Failed(reason)).await;
      return;
   }
   debug!("{address}: LE link up");
   if tx.send(LinkEvent::Connected).await.is_err() {
      return;
   }

   pin_mut!(events);
   while let Some(event) = events.next().await {
      if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
         break;
      }
   }
   let _ = tx.send(LinkEvent::Disconnected).await;
}

async fn wait_services_resolved(device: &Device) -> Result<()> {
   let events = device.events().await?;
   if device.is_services_resolved().await? {
      return Ok(());
   }

   pin_mut!(events);
   while let Some(event) = events.next().await {
      if let DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true)) = event {
         return Ok(());
      }
   }
   Err(LinkError::TransportFailure("device event stream ended".into()))
}

/// One BlueZ connection. Dropping it aborts its background tasks.
pub struct BluezLink {
   device: Device,
   events: mpsc::Sender<LinkEvent>,
   tasks: Mutex<JoinSet<()>>,
   released: AtomicBool,
}

impl Drop for BluezLink {
   fn drop(&mut self) {
      self.tasks.get_mut().abort_all();
   }
}

impl BluezLink {
   async fn find_characteristic(&self, target: GattTarget) -> Result<Characteristic> {
      for service in self.device.services().await? {
         if service.uuid().await? != target.service {
            continue;
         }
         for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == target.characteristic {
               return Ok(characteristic);
            }
         }
         return Err(LinkError::NegotiationFailure(
            format!("cannot find characteristic {}", target.characteristic).into(),
         ));
      }
      Err(LinkError::NegotiationFailure(
         format!("cannot find service {}", target.service).into(),
      ))
   }
}

impl Link for BluezLink {
   async fn discover_services(&self) -> Result<()> {
      let device = self.device.clone();
      let tx = self.events.clone();
      self.tasks.lock().spawn(async move {
         let ok = match time::timeout(SERVICE_RESOLVE_TIMEOUT, wait_services_resolved(&device)).await
         {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
               warn!("{}: service resolution failed: {e}", device.address());
               false
            },
            Err(_) => {
               warn!("{}: service resolution timed out", device.address());
               false
            },
         };
         let _ = tx.send(LinkEvent::ServicesDiscovered(ok)).await;
      });
      Ok(())
   }

   async fn enable_notifications(&self, target: GattTarget) -> Result<()> {
      let characteristic = self.find_characteristic(target).await?;
      let address = self.device.address();
      let tx = self.events.clone();

      self.tasks.lock().spawn(async move {
         // BlueZ writes the client configuration descriptor on StartNotify.
         let values = match characteristic.notify().await {
            Ok(values) => values,
            Err(e) => {
               warn!("{address}: cannot enable notifications: {e}");
               let _ = tx.send(LinkEvent::DescriptorWritten(false)).await;
               return;
            },
         };
         if tx.send(LinkEvent::DescriptorWritten(true)).await.is_err() {
            return;
         }

         pin_mut!(values);
         while let Some(value) = values.next().await {
            let payload = Payload::from_vec(value);
            if tx.send(LinkEvent::CharacteristicChanged(payload)).await.is_err() {
               return;
            }
         }
         debug!("{address}: notification stream ended");
      });
      Ok(())
   }

   async fn disconnect(&self) {
      if self.released.swap(true, Ordering::AcqRel) {
         return;
      }
      self.tasks.lock().abort_all();
      if let Err(e) = self.device.disconnect().await {
         debug!("{}: disconnect: {e}", self.device.address());
      }
   }
}
