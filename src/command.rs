use std::{fmt::Display, ops::Deref};

use crate::Platform;

/// Abstract host action. The executor maps each action to per-platform invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Shutdown,
    Restart,
    Sleep,
    Hibernate,
    Lock,
    Logout,
    /// Reboot once into the firmware's Windows Boot Manager entry. Linux only.
    RestartToWindows,
    PlayPause,
    NextTrack,
    PreviousTrack,
    VolumeUp,
    VolumeDown,
    Mute,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::Restart => "restart",
            Self::Sleep => "sleep",
            Self::Hibernate => "hibernate",
            Self::Lock => "lock",
            Self::Logout => "logout",
            Self::RestartToWindows => "restart to windows",
            Self::PlayPause => "play/pause",
            Self::NextTrack => "next track",
            Self::PreviousTrack => "previous track",
            Self::VolumeUp => "volume up",
            Self::VolumeDown => "volume down",
            Self::Mute => "mute",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command family. Each family has its own registry and topic namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandFamily {
    Power,
    Media,
}

impl CommandFamily {
    /// Topic and unique id segment for this family.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Power => "power",
            Self::Media => "media",
        }
    }

    /// Value of the `enabled_by_default` discovery flag for buttons of this family.
    pub fn enabled_by_default(&self) -> Option<bool> {
        match self {
            Self::Power => None,
            Self::Media => Some(true),
        }
    }
}

impl Display for CommandFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: &'static str,
    /// UI hint passed through to the discovery document, e.g. `mdi:power`.
    pub icon: &'static str,
    pub description: &'static str,
    pub action: Action,
}

impl Command {
    pub const fn new(
        name: &'static str,
        icon: &'static str,
        description: &'static str,
        action: Action,
    ) -> Self {
        Self {
            name,
            icon,
            description,
            action,
        }
    }
}

const POWER_COMMANDS: [Command; 6] = [
    Command::new("Shutdown", "mdi:power", "Shutdown the system", Action::Shutdown),
    Command::new("Restart", "mdi:restart", "Restart the system", Action::Restart),
    Command::new("Sleep", "mdi:power-sleep", "Put the system to sleep", Action::Sleep),
    Command::new("Hibernate", "mdi:power-sleep", "Hibernate the system", Action::Hibernate),
    Command::new("Lock", "mdi:lock", "Lock the system", Action::Lock),
    Command::new("Logout", "mdi:logout", "Log out the current user", Action::Logout),
];

const RESTART_TO_WINDOWS: Command = Command::new(
    "Restart to Windows",
    "mdi:microsoft-windows",
    "Restart the system to Windows",
    Action::RestartToWindows,
);

const MEDIA_COMMANDS: [Command; 6] = [
    Command::new("Play/Pause", "mdi:play-pause", "Toggle media playback", Action::PlayPause),
    Command::new("Next Track", "mdi:skip-next", "Play next track", Action::NextTrack),
    Command::new("Previous Track", "mdi:skip-previous", "Play previous track", Action::PreviousTrack),
    Command::new("Volume Up", "mdi:volume-plus", "Increase volume", Action::VolumeUp),
    Command::new("Volume Down", "mdi:volume-minus", "Decrease volume", Action::VolumeDown),
    Command::new("Mute", "mdi:volume-mute", "Toggle mute", Action::Mute),
];

/// Immutable, ordered catalog of the commands of one family.
///
/// Registries are plain values: build one per family at startup, or build one for another
/// platform in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRegistry {
    family: CommandFamily,
    commands: Vec<Command>,
}

impl Deref for CommandRegistry {
    type Target = [Command];

    fn deref(&self) -> &Self::Target {
        &self.commands
    }
}

impl CommandRegistry {
    pub fn new(family: CommandFamily, commands: Vec<Command>) -> Self {
        Self { family, commands }
    }

    /// Power commands available on `platform`. "Restart to Windows" is only listed on Linux.
    pub fn power(platform: Platform) -> Self {
        let mut commands = POWER_COMMANDS.to_vec();
        if platform.is_linux() {
            commands.push(RESTART_TO_WINDOWS);
        }
        Self::new(CommandFamily::Power, commands)
    }

    pub fn media() -> Self {
        Self::new(CommandFamily::Media, MEDIA_COMMANDS.to_vec())
    }

    /// Both registries for `platform`, power first.
    pub fn all(platform: Platform) -> [Self; 2] {
        [Self::power(platform), Self::media()]
    }

    pub fn family(&self) -> CommandFamily {
        self.family
    }

    pub fn find(&self, name: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.name == name)
    }
}
