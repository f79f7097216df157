use std::str::FromStr;

use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::{command::HostCommand, controller::ConnectionController},
   error::LinkError,
};

pub const BUS_NAME: &str = "org.flcompanion";
pub const OBJECT_PATH: &str = "/org/flcompanion/controller";

pub struct CompanionService {
   controller: ConnectionController,
}

impl CompanionService {
   pub const fn new(controller: ConnectionController) -> Self {
      Self { controller }
   }

   async fn send(&self, cmd: HostCommand) -> zbus::fdo::Result<bool> {
      info!("Host requested {cmd}");
      self
         .controller
         .submit(cmd.into())
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   fn state_json(&self) -> String {
      self
         .controller
         .session_info()
         .to_json(self.controller.status())
         .to_string()
   }
}

#[interface(name = "org.flcompanion.Controller")]
impl CompanionService {
   async fn start(&self) -> zbus::fdo::Result<bool> {
      self.send(HostCommand::Start).await
   }

   async fn stop(&self) -> zbus::fdo::Result<bool> {
      self.send(HostCommand::Stop).await
   }

   async fn send_command(&self, command: String) -> zbus::fdo::Result<bool> {
      let cmd = HostCommand::from_str(&command)
         .map_err(|_| zbus::fdo::Error::InvalidArgs(LinkError::UnknownCommand(command).to_string()))?;
      self.send(cmd).await
   }

   async fn get_status(&self) -> String {
      self.controller.status().to_string()
   }

   async fn get_state(&self) -> String {
      self.state_json()
   }

   // Signals
   #[zbus(signal)]
   pub async fn status_changed(emitter: &SignalEmitter<'_>, status: &str) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn state(&self) -> String {
      self.state_json()
   }
}
