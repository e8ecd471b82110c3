use std::sync::Arc;

use serde::Serialize;

use crate::{Command, CommandFamily, CommandRegistry, Identity};

/// Topic prefix Home Assistant listens on for discovery documents.
pub const DISCOVERY_PREFIX: &str = "homeassistant";

/// Turn a command name into its topic/unique id component: lowercase, with spaces and `/`
/// replaced by `_`.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '/' { '_' } else { c })
        .collect()
}

/// `homeassistant/<component>/<node_id>/<object_id>/config`
pub fn discovery_topic(component: Component, node_id: &str, object_id: &str) -> String {
    format!(
        "{DISCOVERY_PREFIX}/{}/{node_id}/{object_id}/config",
        component.as_str()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Sensor,
    Button,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Button => "button",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub identifiers: Vec<String>,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
}

/// Discovery payload for one entity. Buttons carry `command_topic`, sensors `state_topic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryDocument {
    pub name: String,
    pub unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,
    pub availability_topic: String,
    pub icon: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_by_default: Option<bool>,
    pub device: Arc<Device>,
}

/// A discovery document together with where it is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEntry {
    pub component: Component,
    pub object_id: String,
    pub document: DiscoveryDocument,
}

impl DiscoveryEntry {
    pub fn topic(&self, node_id: &str) -> String {
        discovery_topic(self.component, node_id, &self.object_id)
    }
}

/// Button document for `command`. Returns the slug alongside the document.
pub fn button_document(
    identity: &Identity,
    family: CommandFamily,
    command: &Command,
) -> (String, DiscoveryDocument) {
    let slug = slugify(command.name);
    let document = DiscoveryDocument {
        name: command.name.to_owned(),
        unique_id: format!("{}_{family}_{slug}", identity.unique_id()),
        command_topic: Some(identity.command_topic(family, &slug)),
        state_topic: None,
        availability_topic: identity.availability_topic(),
        icon: command.icon.to_owned(),
        enabled_by_default: family.enabled_by_default(),
        device: identity.device(),
    };
    (slug, document)
}

/// The "Status" sensor fed by the heartbeat.
pub fn status_sensor_document(identity: &Identity) -> DiscoveryDocument {
    DiscoveryDocument {
        name: "Status".to_owned(),
        unique_id: format!("{}_status", identity.unique_id()),
        command_topic: None,
        state_topic: Some(identity.status_topic()),
        availability_topic: identity.availability_topic(),
        icon: "mdi:server".to_owned(),
        enabled_by_default: None,
        device: identity.device(),
    }
}

/// Every discovery entry for one instance: the status sensor, then one button per command,
/// in registry order.
pub fn discovery_entries<'a>(
    identity: &Identity,
    families: impl IntoIterator<Item = &'a CommandRegistry>,
) -> Vec<DiscoveryEntry> {
    let mut entries = vec![DiscoveryEntry {
        component: Component::Sensor,
        object_id: "status".to_owned(),
        document: status_sensor_document(identity),
    }];

    for registry in families {
        let family = registry.family();
        entries.extend(registry.iter().map(|command| {
            let (slug, document) = button_document(identity, family, command);
            DiscoveryEntry {
                component: Component::Button,
                object_id: format!("{family}_{slug}"),
                document,
            }
        }));
    }
    entries
}
