//! Forumslader companion D-Bus service
//!
//! Keeps a Bluetooth LE link to a Forumslader bike dynamo charger alive and
//! exposes the connection status on the session bus.

use log::{debug, info, warn};
use tokio::{select, signal};
use zbus::{Connection, connection};

use bluetooth::{
   bluez::{self, BluezTransport},
   command::Command,
   controller::ConnectionController,
};
use dbus::{BUS_NAME, CompanionService, OBJECT_PATH};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod status;

use crate::{dbus::CompanionServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting Forumslader companion service...");

   let config = config::Config::load()?;
   info!(
      "Loaded configuration, watching service {}",
      config.service_uuid
   );

   let transport = BluezTransport::new(config.adapter.as_deref()).await?;
   let adapter = transport.adapter().clone();
   let controller = ConnectionController::new(transport, &config)?;
   let monitor = bluez::monitor_radio(adapter, controller.clone());

   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, CompanionService::new(controller.clone()))?
      .build()
      .await?;

   info!("Companion D-Bus service started at {BUS_NAME}");

   spawn_status_dispatcher(&connection, &controller).await?;

   controller.submit(Command::Start).await?;

   let res = wait_for_shutdown(&controller, signal::ctrl_c()).await;
   monitor.abort();
   res
}

/// Runs until `shutdown` fires or the controller stops on its own, e.g.
/// after a `Stop` over D-Bus. Returns once the controller has stopped.
async fn wait_for_shutdown(
   controller: &ConnectionController,
   shutdown: impl Future<Output = std::io::Result<()>>,
) -> Result<()> {
   select! {
      res = shutdown => {
         res?;
         info!("Shutting down companion service...");
         if controller.submit(Command::Stop).await.is_err() {
            debug!("Controller already stopped");
         }
         controller.stopped().await;
      }
      () = controller.stopped() => {
         info!("Controller stopped, exiting");
      }
   }
   Ok(())
}

/// Forwards every status transition as a `StatusChanged` signal.
async fn spawn_status_dispatcher(
   connection: &Connection,
   controller: &ConnectionController,
) -> Result<()> {
   let iface = connection
      .object_server()
      .interface::<_, CompanionService>(OBJECT_PATH)
      .await?;
   let mut rx = controller.subscribe();

   tokio::spawn(async move {
      while rx.changed().await.is_ok() {
         let status = *rx.borrow_and_update();
         if let Err(e) = iface.status_changed(status.to_str()).await {
            warn!("Error emitting status change: {e}");
         }
      }
   });

   Ok(())
}
