//! Commands accepted by the connection controller.

/// Closed vocabulary processed by the controller worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
   Start,
   Stop,
   Retry,
   WaitForBluetooth,
   RetryAfterBluetoothRebirth,
   Watch,
}

/// Commands the host may request by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum HostCommand {
   Start,
   Stop,
}

impl From<HostCommand> for Command {
   fn from(cmd: HostCommand) -> Self {
      match cmd {
         HostCommand::Start => Self::Start,
         HostCommand::Stop => Self::Stop,
      }
   }
}

/// Availability of the local radio as reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RadioState {
   Off,
   TurningOff,
   On,
   TurningOn,
}

impl RadioState {
   pub const fn from_powered(powered: bool) -> Self {
      if powered { Self::On } else { Self::Off }
   }

   /// Command the controller should process for this radio transition.
   pub const fn command(self) -> Option<Command> {
      match self {
         Self::Off | Self::TurningOff => Some(Command::WaitForBluetooth),
         Self::On => Some(Command::RetryAfterBluetoothRebirth),
         Self::TurningOn => None,
      }
   }
}
