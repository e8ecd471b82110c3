use std::sync::Arc;

use crate::{CommandFamily, Device};

const TOPIC_ROOT: &str = "go-commands";
const ID_PREFIX: &str = "go_commands";
const MODEL: &str = "Go Commands Service";
const MANUFACTURER: &str = "Timmo";

/// Naming for one running instance, derived from the host name.
///
/// The device descriptor is built once and shared by every discovery document.
#[derive(Debug, Clone)]
pub struct Identity {
    unique_id: String,
    base_topic: String,
    device: Arc<Device>,
}

impl Identity {
    pub fn new(hostname: &str) -> Self {
        let unique_id = format!("{ID_PREFIX}_{hostname}");
        let base_topic = format!("{TOPIC_ROOT}/{unique_id}");
        let device = Arc::new(Device {
            identifiers: vec![unique_id.clone()],
            name: format!("Go Commands - {hostname}"),
            model: MODEL.to_owned(),
            manufacturer: MANUFACTURER.to_owned(),
        });
        Self {
            unique_id,
            base_topic,
            device,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    pub fn device(&self) -> Arc<Device> {
        Arc::clone(&self.device)
    }

    pub fn availability_topic(&self) -> String {
        format!("{}/availability", self.base_topic)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/status", self.base_topic)
    }

    pub fn command_topic(&self, family: CommandFamily, slug: &str) -> String {
        format!("{}/{family}/{slug}", self.base_topic)
    }
}
