//! winkeyd — eye-gesture keyboard daemon.
//!
//! Owns the camera sessions, drives key injection from eye state and serves
//! the `org.winkey.Tracker1` D-Bus interface. The library target exists so
//! the CLI can share configuration loading.

pub mod config;
pub mod dbus_interface;
pub mod display;
pub mod engine;
pub mod inject;
pub mod session;

/// Well-known bus name of the daemon.
pub const BUS_NAME: &str = "org.winkey.Tracker1";
/// Object path of [`dbus_interface::TrackerService`].
pub const OBJECT_PATH: &str = "/org/winkey/Tracker1";
