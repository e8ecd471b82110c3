use std::{fmt::Display, io, process::ExitStatus};

use thiserror::Error;

use crate::{Action, Platform};

/// Marker searched for in `efibootmgr` output to find the Windows entry.
pub const WINDOWS_BOOT_MARKER: &str = "Windows Boot Manager";

/// One external program call: program name plus argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How an action is carried out on a platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Ordered candidates; the first that succeeds wins. Usually a single entry.
    Fallback(Vec<Invocation>),
    /// Select the Windows entry via `efibootmgr --bootnext`, then reboot.
    BootNextWindows,
    Unsupported,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` exited with {status}")]
    Status { program: String, status: ExitStatus },
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{action} is not supported on {platform}")]
    Unsupported { action: Action, platform: Platform },
    #[error(transparent)]
    Invocation(#[from] RunError),
    #[error("all {} candidate commands for {action} failed", .errors.len())]
    Exhausted {
        action: Action,
        errors: Vec<RunError>,
    },
    #[error("failed to list boot entries: {0}")]
    BootEntryList(#[source] RunError),
    #[error("no boot entry matching \"{marker}\" found")]
    BootEntryNotFound { marker: &'static str },
    #[error("boot entry line too short to hold an entry number: {line:?}")]
    BootEntryMalformed { line: String },
    #[error("failed to set next boot entry {entry}: {source}")]
    SetBootNext {
        entry: String,
        #[source]
        source: RunError,
    },
}

impl ExecError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// Runs external programs. `SystemRunner` is the real one; tests script their own.
pub trait CommandRunner: Send + Sync {
    /// Run to completion, reducing the outcome to success or failure.
    fn run(&self, invocation: &Invocation) -> Result<(), RunError>;
    /// Run to completion and return stdout.
    fn output(&self, invocation: &Invocation) -> Result<String, RunError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    fn command(invocation: &Invocation) -> std::process::Command {
        let mut cmd = std::process::Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd
    }

    fn check(invocation: &Invocation, status: ExitStatus) -> Result<(), RunError> {
        if status.success() {
            Ok(())
        } else {
            Err(RunError::Status {
                program: invocation.program.clone(),
                status,
            })
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<(), RunError> {
        let status = Self::command(invocation)
            .status()
            .map_err(|source| RunError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;
        Self::check(invocation, status)
    }

    fn output(&self, invocation: &Invocation) -> Result<String, RunError> {
        let output = Self::command(invocation)
            .output()
            .map_err(|source| RunError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;
        Self::check(invocation, output.status)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn single(program: &str, args: &[&str]) -> Strategy {
    Strategy::Fallback(vec![Invocation::new(program, args)])
}

fn osascript(script: &str) -> Strategy {
    single("osascript", &["-e", script])
}

fn send_media_key(code: u8) -> Strategy {
    let script = format!("(New-Object -ComObject WScript.Shell).SendKeys([char]{code})");
    single("powershell", &["-Command", &script])
}

fn mpris(method: &str) -> Strategy {
    let member = format!("org.mpris.MediaPlayer2.Player.{method}");
    single(
        "dbus-send",
        &[
            "--type=method_call",
            "--dest=org.mpris.MediaPlayer2.playerctld",
            "/org/mpris/MediaPlayer2",
            &member,
        ],
    )
}

/// Strategy table keyed by (action, platform). Pairs without an entry are `Unsupported`.
pub fn strategy(action: Action, platform: Platform) -> Strategy {
    use Action::*;
    use Platform::*;

    match (action, platform) {
        (Shutdown, Windows) => single("shutdown", &["/s"]),
        (Shutdown, Linux) => single("shutdown", &["-h", "now"]),
        (Shutdown, MacOs) => osascript("tell application \"System Events\" to shut down"),

        (Restart, Windows) => single("shutdown", &["/r"]),
        (Restart, Linux) => single("shutdown", &["-r", "now"]),
        (Restart, MacOs) => osascript("tell application \"System Events\" to restart"),

        (Sleep, Windows) => single("rundll32.exe", &["powrprof.dll,SetSuspendState", "0,1,0"]),
        (Sleep, Linux) => single("systemctl", &["suspend"]),
        (Sleep, MacOs) => osascript("tell application \"System Events\" to sleep"),

        (Hibernate, Windows) => single("shutdown", &["/h"]),
        (Hibernate, Linux) => single("systemctl", &["hibernate"]),

        (Lock, Windows) => single("rundll32.exe", &["user32.dll,LockWorkStation"]),
        // Desktop environments differ; try each locker in turn.
        (Lock, Linux) => Strategy::Fallback(vec![
            Invocation::new("loginctl", &["lock-session"]),
            Invocation::new("gnome-screensaver-command", &["-l"]),
            Invocation::new(
                "qdbus",
                &["org.freedesktop.ScreenSaver", "/ScreenSaver", "Lock"],
            ),
            Invocation::new("xdg-screensaver", &["lock"]),
            Invocation::new("xscreensaver-command", &["-lock"]),
            Invocation::new("xlock", &[]),
        ]),
        (Lock, MacOs) => osascript(
            "tell application \"System Events\" to keystroke \"q\" using {command down, control down}",
        ),

        (Logout, Windows) => single("shutdown", &["/l"]),
        (Logout, Linux) => Strategy::Fallback(vec![
            Invocation::new("gnome-session-quit", &["--no-prompt"]),
            Invocation::new(
                "qdbus",
                &["org.kde.ksmserver", "/KSMServer", "logout", "0", "0", "0"],
            ),
            // sh expands $USER; argv passed to loginctl directly would not.
            Invocation::new("sh", &["-c", "loginctl terminate-user \"$USER\""]),
        ]),
        (Logout, MacOs) => osascript("tell application \"System Events\" to log out"),

        (RestartToWindows, Linux) => Strategy::BootNextWindows,

        (PlayPause, Windows) => send_media_key(179),
        (PlayPause, Linux) => mpris("PlayPause"),
        (PlayPause, MacOs) => {
            osascript("tell application \"System Events\" to key code 16 using {command down}")
        }

        (NextTrack, Windows) => send_media_key(176),
        (NextTrack, Linux) => mpris("Next"),
        (NextTrack, MacOs) => {
            osascript("tell application \"System Events\" to key code 17 using {command down}")
        }

        (PreviousTrack, Windows) => send_media_key(177),
        (PreviousTrack, Linux) => mpris("Previous"),
        (PreviousTrack, MacOs) => {
            osascript("tell application \"System Events\" to key code 16 using {command down}")
        }

        (VolumeUp, Windows) => send_media_key(175),
        (VolumeUp, Linux) => single("pactl", &["set-sink-volume", "@DEFAULT_SINK@", "+5%"]),
        (VolumeUp, MacOs) => {
            osascript("set volume output volume (output volume of (get volume settings) + 6)")
        }

        (VolumeDown, Windows) => send_media_key(174),
        (VolumeDown, Linux) => single("pactl", &["set-sink-volume", "@DEFAULT_SINK@", "-5%"]),
        (VolumeDown, MacOs) => {
            osascript("set volume output volume (output volume of (get volume settings) - 6)")
        }

        (Mute, Windows) => send_media_key(173),
        (Mute, Linux) => single("pactl", &["set-sink-mute", "@DEFAULT_SINK@", "toggle"]),
        (Mute, MacOs) => {
            osascript("set volume with output muted (not output muted of (get volume settings))")
        }

        _ => Strategy::Unsupported,
    }
}

/// Extract the boot entry number from `efibootmgr` output.
///
/// The entry is read from columns 4..8 of the first line containing `marker`, which matches
/// lines like `Boot0001* Windows Boot Manager`. This is a fixed-column parse of another tool's
/// output: anything that does not follow that layout yields a wrong entry or an error.
pub fn parse_boot_entry(output: &str, marker: &'static str) -> Result<String, ExecError> {
    let line = output
        .lines()
        .find(|line| line.contains(marker))
        .ok_or(ExecError::BootEntryNotFound { marker })?;

    line.get(4..8)
        .map(str::to_owned)
        .ok_or_else(|| ExecError::BootEntryMalformed {
            line: line.to_owned(),
        })
}

/// Runs actions using the strategy table for one platform.
#[derive(Debug, Clone)]
pub struct Executor<R = SystemRunner> {
    platform: Platform,
    runner: R,
}

impl Executor<SystemRunner> {
    /// Executor for the running OS using real process calls.
    pub fn system() -> Self {
        Self::new(Platform::current(), SystemRunner)
    }
}

impl<R: CommandRunner> Executor<R> {
    pub fn new(platform: Platform, runner: R) -> Self {
        Self { platform, runner }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Execute `action`, blocking until the external program(s) finish.
    pub fn execute(&self, action: Action) -> Result<(), ExecError> {
        match strategy(action, self.platform) {
            Strategy::Unsupported => Err(ExecError::Unsupported {
                action,
                platform: self.platform,
            }),
            Strategy::Fallback(candidates) => self.run_fallback(action, candidates),
            Strategy::BootNextWindows => self.restart_to_windows(),
        }
    }

    fn run_fallback(&self, action: Action, candidates: Vec<Invocation>) -> Result<(), ExecError> {
        let mut errors = Vec::new();
        for invocation in &candidates {
            log::debug!("[{action}] running `{invocation}`");
            match self.runner.run(invocation) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::debug!("[{action}] `{invocation}` failed: {err}");
                    errors.push(err);
                }
            }
        }

        if errors.len() == 1 {
            if let Some(err) = errors.pop() {
                return Err(ExecError::Invocation(err));
            }
        }
        Err(ExecError::Exhausted { action, errors })
    }

    fn restart_to_windows(&self) -> Result<(), ExecError> {
        let listing = self
            .runner
            .output(&Invocation::new("efibootmgr", &[]))
            .map_err(ExecError::BootEntryList)?;

        let entry = parse_boot_entry(&listing, WINDOWS_BOOT_MARKER)?;
        log::info!("Setting next boot entry to {entry}");

        self.runner
            .run(&Invocation::new("efibootmgr", &["--bootnext", &entry]))
            .map_err(|source| ExecError::SetBootNext {
                entry: entry.clone(),
                source,
            })?;

        self.runner.run(&Invocation::new("reboot", &[]))?;
        Ok(())
    }
}
