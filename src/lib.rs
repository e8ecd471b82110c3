mod command;
mod config;
mod discovery;
mod executor;
mod identity;
mod platform;
mod session;
pub mod service;

pub use command::*;
pub use config::*;
pub use discovery::*;
pub use executor::*;
pub use identity::*;
pub use platform::*;
pub use session::*;

pub use rumqttc::QoS;
