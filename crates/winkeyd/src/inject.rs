//! Input-injection adapters.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use winkey_core::{InjectError, InputInjector, Key};

use crate::config::{Config, InjectorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Down,
    Up,
    Tap,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Up => "up",
            Self::Tap => "tap",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    Xdotool,
    Wtype,
}

/// How long one tool invocation may run before it is killed.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

const EXIT_POLL: Duration = Duration::from_millis(2);

/// Drives keys by running `xdotool` (X11) or `wtype` (Wayland) once per event.
///
/// Each call waits for the tool to exit so key-down and key-up arrive in
/// order, but never longer than the timeout: a hung tool is killed and the
/// event reported as failed.
pub struct CommandInjector {
    tool: Tool,
    program: String,
    timeout: Duration,
    left_key: String,
    right_key: String,
}

impl CommandInjector {
    pub fn xdotool(left_key: impl Into<String>, right_key: impl Into<String>) -> Self {
        Self::new(Tool::Xdotool, left_key.into(), right_key.into())
    }

    pub fn wtype(left_key: impl Into<String>, right_key: impl Into<String>) -> Self {
        Self::new(Tool::Wtype, left_key.into(), right_key.into())
    }

    fn new(tool: Tool, left_key: String, right_key: String) -> Self {
        let program = match tool {
            Tool::Xdotool => "xdotool",
            Tool::Wtype => "wtype",
        };
        Self {
            tool,
            program: program.to_string(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            left_key,
            right_key,
        }
    }

    /// Run `program` instead of the tool found on `PATH`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn key_name(&self, key: Key) -> &str {
        match key {
            Key::LeftAction => &self.left_key,
            Key::RightAction => &self.right_key,
        }
    }

    fn args(&self, action: Action, key: Key) -> Vec<String> {
        let name = self.key_name(key).to_string();
        match self.tool {
            Tool::Xdotool => {
                let verb = match action {
                    Action::Down => "keydown",
                    Action::Up => "keyup",
                    Action::Tap => "key",
                };
                vec![verb.to_string(), name]
            }
            Tool::Wtype => {
                match action {
                    Action::Down => vec!["-P".to_string(), name],
                    Action::Up => vec!["-p".to_string(), name],
                    Action::Tap => vec!["-P".to_string(), name.clone(), "-p".to_string(), name],
                }
            }
        }
    }

    fn run(&self, action: Action, key: Key) -> Result<(), InjectError> {
        let program = self.program.as_str();
        let args = self.args(action, key);
        tracing::debug!(program, ?args, key = key.as_str(), action = action.as_str(), "injecting key");
        let spawn_error = |source| InjectError::Spawn {
            program: program.to_string(),
            source,
        };
        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(spawn_error)?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait().map_err(spawn_error)? {
                break status;
            }
            if Instant::now() >= deadline {
                if let Err(e) = child.kill() {
                    tracing::warn!(program, error = %e, "could not kill injector command");
                }
                let _ = child.wait();
                return Err(InjectError::TimedOut {
                    program: program.to_string(),
                    after: self.timeout,
                });
            }
            std::thread::sleep(EXIT_POLL);
        };
        if status.success() {
            Ok(())
        } else {
            Err(InjectError::ExitStatus {
                program: program.to_string(),
                status: status.to_string(),
            })
        }
    }
}

impl InputInjector for CommandInjector {
    fn key_down(&mut self, key: Key) -> Result<(), InjectError> {
        self.run(Action::Down, key)
    }

    fn key_up(&mut self, key: Key) -> Result<(), InjectError> {
        self.run(Action::Up, key)
    }

    fn tap(&mut self, key: Key) -> Result<(), InjectError> {
        self.run(Action::Tap, key)
    }
}

/// Dry run: logs key events and sends nothing to the OS.
#[derive(Default)]
pub struct LogInjector;

impl InputInjector for LogInjector {
    fn key_down(&mut self, key: Key) -> Result<(), InjectError> {
        tracing::info!(key = key.as_str(), "key down (dry run)");
        Ok(())
    }

    fn key_up(&mut self, key: Key) -> Result<(), InjectError> {
        tracing::info!(key = key.as_str(), "key up (dry run)");
        Ok(())
    }

    fn tap(&mut self, key: Key) -> Result<(), InjectError> {
        tracing::info!(key = key.as_str(), "key tap (dry run)");
        Ok(())
    }
}

/// The injector selected by `config.injector`.
pub fn build_injector(config: &Config) -> Box<dyn InputInjector> {
    tracing::info!(
        injector = %config.injector,
        left_key = %config.left_key,
        right_key = %config.right_key,
        "input injector selected"
    );
    match config.injector {
        InjectorKind::Xdotool => Box::new(CommandInjector::xdotool(
            config.left_key.clone(),
            config.right_key.clone(),
        )),
        InjectorKind::Wtype => Box::new(CommandInjector::wtype(
            config.left_key.clone(),
            config.right_key.clone(),
        )),
        InjectorKind::Log => Box::new(LogInjector),
    }
}
