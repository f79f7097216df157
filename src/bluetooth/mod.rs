//! Bluetooth LE link to the Forumslader.
//!
//! The controller drives device sessions over a [`transport::Transport`];
//! `bluez` provides the real one.

pub mod bluez;
pub mod command;
pub mod controller;
#[cfg(test)]
pub mod mock;
pub mod session;
pub mod transport;
