//! Connection controller for the Forumslader link.
//!
//! A single actor task owns the transport, the device session and the status.
//! External requests, timers and radio changes all arrive as [`Command`]s on
//! one queue, so retries can never race with explicit start/stop requests.

use std::{
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use log::{debug, info, warn};
use tokio::{
   select,
   sync::{Notify, mpsc, watch},
   time,
};

use crate::{
   bluetooth::{
      command::{Command, RadioState},
      session::{DeviceSession, SessionInfo},
      transport::{DiscoveryFilter, GattTarget, Link, LinkEvent, Transport},
   },
   config::{Config, Timings},
   error::{LinkError, Result},
   status::{Status, StatusBoard},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

/// Handle to the controller actor.
///
/// This type is cheaply cloneable; the actor runs until it processes `Stop`
/// or every handle is dropped.
#[derive(Clone)]
pub struct ConnectionController {
   inbox: mpsc::Sender<Command>,
   interrupt: Arc<Interrupt>,
   status: watch::Receiver<Status>,
   session: Arc<SessionInfo>,
}

/// Supersedes discovery while a `Stop` or `WaitForBluetooth` is queued.
#[derive(Debug, Default)]
struct Interrupt {
   pending: AtomicUsize,
   notify: Notify,
}

impl Interrupt {
   fn raise(&self) {
      self.pending.fetch_add(1, Ordering::AcqRel);
      self.notify.notify_waiters();
   }

   /// Called once the worker has taken the interrupting command.
   fn consume(&self) {
      let _ = self
         .pending
         .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
   }

   fn is_pending(&self) -> bool {
      self.pending.load(Ordering::Acquire) > 0
   }
}

impl ConnectionController {
   /// Spawns the controller actor for `transport`.
   pub fn new<T: Transport>(transport: T, config: &Config) -> Result<Self> {
      let (handle, actor) = ControllerActor::new(transport, config)?;
      tokio::spawn(actor.run());
      Ok(handle)
   }

   /// Enqueues `cmd` behind everything already queued.
   pub async fn submit(&self, cmd: Command) -> Result<()> {
      if matches!(cmd, Command::Stop | Command::WaitForBluetooth) {
         // Supersede a scan the worker is running or about to start.
         self.interrupt.raise();
      }
      self
         .inbox
         .send(cmd)
         .await
         .map_err(|_| LinkError::ControllerShutdown)
   }

   pub async fn on_radio_state_changed(&self, state: RadioState) -> Result<()> {
      debug!("Radio state changed: {state}");
      match state.command() {
         Some(cmd) => self.submit(cmd).await,
         None => Ok(()),
      }
   }

   pub fn status(&self) -> Status {
      *self.status.borrow()
   }

   pub fn subscribe(&self) -> watch::Receiver<Status> {
      self.status.clone()
   }

   pub fn session_info(&self) -> &SessionInfo {
      &self.session
   }

   /// Resolves once the actor has shut down and published `Stopped`.
   pub async fn stopped(&self) {
      self.inbox.closed().await;
   }
}

fn schedule(loopback: mpsc::WeakSender<Command>, cmd: Command, delay: Duration) {
   debug!("Scheduling {cmd:?} in {delay:?}");
   tokio::spawn(async move {
      time::sleep(delay).await;
      if let Some(tx) = loopback.upgrade() {
         let _ = tx.send(cmd).await;
      }
   });
}

async fn next_link_event<L: Link>(session: &mut Option<DeviceSession<L>>) -> LinkEvent {
   match session {
      Some(session) => session.next_event().await,
      None => std::future::pending().await,
   }
}

// === Controller Actor ===

struct ControllerActor<T: Transport> {
   transport: T,
   filter: DiscoveryFilter,
   target: GattTarget,
   timings: Timings,
   rearm_watch: bool,

   inbox: mpsc::Receiver<Command>,
   loopback: mpsc::WeakSender<Command>,
   interrupt: Arc<Interrupt>,

   // State
   status: StatusBoard,
   session: Option<DeviceSession<T::Link>>,
   info: Arc<SessionInfo>,
   retry_scheduled: bool,
}

impl<T: Transport> ControllerActor<T> {
   fn new(transport: T, config: &Config) -> Result<(ConnectionController, Self)> {
      config.validate()?;
      let filter = DiscoveryFilter::new(config.service_uuid)?;
      let (inbox_tx, inbox) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let status = StatusBoard::new();
      let info = Arc::new(SessionInfo::default());
      let interrupt = Arc::new(Interrupt::default());

      let handle = ConnectionController {
         inbox: inbox_tx.clone(),
         interrupt: interrupt.clone(),
         status: status.subscribe(),
         session: info.clone(),
      };
      let actor = Self {
         transport,
         filter,
         target: GattTarget {
            service: config.service_uuid,
            characteristic: config.characteristic_uuid,
         },
         timings: config.timings(),
         rearm_watch: config.rearm_watch,
         inbox,
         loopback: inbox_tx.downgrade(),
         interrupt,
         status,
         session: None,
         info,
         retry_scheduled: false,
      };
      Ok((handle, actor))
   }

   async fn run(mut self) {
      info!("Connection controller starting up");

      loop {
         select! {
            cmd = self.inbox.recv() => {
               let Some(cmd) = cmd else {
                  info!("All controller handles dropped, shutting down");
                  break;
               };
               if !self.handle_command(cmd).await {
                  break;
               }
            }
            event = next_link_event(&mut self.session) => {
               if let Some(session) = self.session.as_mut() {
                  session.handle_event(event, &self.status).await;
               }
            }
         }
      }

      self.cleanup().await;
   }

   /// Processes one command; returns `false` once the loop must end.
   async fn handle_command(&mut self, cmd: Command) -> bool {
      debug!("Handling {cmd:?} in state {}", self.status.current());
      match cmd {
         Command::Start if self.retry_scheduled => {
            debug!("Retry already scheduled, ignoring start");
         },
         Command::Start | Command::Retry => {
            self.handle_retry().await;
         },
         Command::WaitForBluetooth => {
            self.interrupt.consume();
            self.status.set(Status::WaitingForBluetooth);
         },
         Command::RetryAfterBluetoothRebirth => {
            self.status.set(Status::Started);
            self.schedule(Command::Retry, self.timings.retry_delay);
         },
         Command::Watch => {
            self.handle_watch().await;
         },
         Command::Stop => {
            self.interrupt.consume();
            self.release_session().await;
            self.status.set(Status::Stopping);
            return false;
         },
      }
      true
   }

   async fn handle_retry(&mut self) {
      if self.status.current() == Status::WaitingForBluetooth {
         debug!("Waiting for bluetooth, skipping discovery");
         return;
      }
      if let Some(address) = self.live_session() {
         // A connected device stops advertising; keep the link instead.
         debug!("{address} still connected, skipping discovery");
         self.retry_scheduled = false;
         self.schedule(Command::Watch, self.timings.watch_delay);
         return;
      }

      match self.find_device().await {
         Ok(Some(address)) => {
            self.status.set(Status::Started);
            self.open_session(address).await;
            self.retry_scheduled = false;
            self.schedule(Command::Watch, self.timings.watch_delay);
         },
         Ok(None) => {
            debug!("Discovery superseded");
         },
         Err(e) if e.is_unavailable() => {
            warn!("Cannot scan: {e}");
            self.status.set(Status::BluetoothRequested);
         },
         Err(e) => {
            if matches!(e, LinkError::DiscoveryTimeout) {
               debug!("No device found");
            } else {
               warn!("Discovery failed: {e}");
            }
            self.retry_scheduled = true;
            self.schedule(Command::Retry, self.timings.retry_delay);
         },
      }
   }

   /// Address of a held session that is neither torn down nor silent.
   fn live_session(&self) -> Option<Address> {
      self
         .session
         .as_ref()
         .filter(|session| !session.is_released() && !session.is_dead())
         .map(DeviceSession::address)
   }

   /// Scans for the device for at most one scan window.
   ///
   /// `Ok(None)` means the scan was superseded by a stop or radio loss, either
   /// queued before the scan started or submitted while it runs.
   async fn find_device(&self) -> Result<Option<Address>> {
      let interrupt = self.interrupt.clone();
      let interrupted = interrupt.notify.notified();
      if interrupt.is_pending() {
         return Ok(None);
      }

      self.transport.ensure_available().await?;
      if interrupt.is_pending() {
         return Ok(None);
      }

      self.status.set(Status::Scanning);
      let mut discovery = self.transport.start_discovery(&self.filter).await?;
      select! {
         found = discovery.first_match(self.timings.scan_window) => {
            let address = found?;
            info!("Found device at {address}");
            Ok(Some(address))
         }
         () = interrupted => Ok(None),
      }
   }

   async fn open_session(&mut self, address: Address) {
      self.release_session().await;
      match DeviceSession::open(
         &self.transport,
         address,
         self.target,
         self.timings.liveness_threshold,
         self.info.clone(),
         &self.status,
      )
      .await
      {
         Ok(session) => self.session = Some(session),
         Err(e) => warn!("Failed to connect to {address}: {e}"),
      }
   }

   async fn handle_watch(&mut self) {
      match &self.session {
         Some(session) if !session.is_dead() => {
            debug!("{} is alive", session.address());
            if self.rearm_watch {
               self.schedule(Command::Watch, self.timings.watch_delay);
            }
         },
         Some(session) => {
            warn!("{} went silent, releasing session", session.address());
            self.release_session().await;
            self.schedule(Command::Retry, self.timings.retry_delay);
         },
         None => {
            debug!("No session to watch");
            self.schedule(Command::Retry, self.timings.retry_delay);
         },
      }
   }

   async fn release_session(&mut self) {
      if let Some(session) = self.session.take() {
         session.disconnect().await;
      }
      self.info.clear();
   }

   fn schedule(&self, cmd: Command, delay: Duration) {
      schedule(self.loopback.clone(), cmd, delay);
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up connection controller");
      self.release_session().await;
      self.status.set(Status::Stopped);
   }
}
