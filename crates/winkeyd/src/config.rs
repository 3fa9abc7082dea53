use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use winkey_core::hysteresis::{DEFAULT_CLOSE_THRESHOLD, DEFAULT_OPEN_THRESHOLD};
use winkey_core::{ThresholdError, Thresholds};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse settings update: {0}")]
    Update(#[source] toml::de::Error),
    #[error("invalid configuration:\n  {}", .0.join("\n  "))]
    Invalid(Vec<String>),
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSource {
    /// A V4L2 device, `/dev/video<camera_index>`.
    V4l,
    /// A directory of still images played back in a loop.
    Replay(PathBuf),
}

impl FromStr for CameraSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "v4l" {
            return Ok(Self::V4l);
        }
        match s.strip_prefix("replay:") {
            Some(dir) if !dir.is_empty() => Ok(Self::Replay(PathBuf::from(dir))),
            _ => Err(format!(
                "camera_source must be \"v4l\" or \"replay:<dir>\", got {s:?}"
            )),
        }
    }
}

/// Which input-injection tool drives the keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectorKind {
    Xdotool,
    Wtype,
    /// Log key events without touching the OS.
    Log,
}

impl fmt::Display for InjectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Xdotool => "xdotool",
            Self::Wtype => "wtype",
            Self::Log => "log",
        })
    }
}

impl FromStr for InjectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xdotool" => Ok(Self::Xdotool),
            "wtype" => Ok(Self::Wtype),
            "log" => Ok(Self::Log),
            other => Err(format!(
                "injector must be one of xdotool, wtype, log; got {other:?}"
            )),
        }
    }
}

/// Daemon configuration.
///
/// Layered as built-in defaults, then the TOML file, then `WINKEY_*`
/// environment variables. Camera settings apply from the next session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Camera to open when a request does not name one.
    pub camera_index: u32,
    /// `v4l` or `replay:<dir>`.
    pub camera_source: String,
    /// Requested capture size and rate. The device may negotiate others.
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Openness below which an open eye closes.
    pub close_threshold: f32,
    /// Openness above which a closed eye reopens.
    pub open_threshold: f32,
    /// Run the landmark model on every Nth frame.
    pub process_interval: u32,
    /// Minimum spacing between camera reads.
    pub min_frame_interval_ms: u64,
    /// Sleep after a failed read before retrying.
    pub read_backoff_ms: u64,
    /// Consecutive failed reads before the session gives up; 0 retries forever.
    pub max_read_failures: u32,
    /// How long both keys stay down for the both-eyes-closed pulse.
    pub pulse_ms: u64,
    /// How long a stop waits for the worker thread to exit.
    pub join_timeout_ms: u64,
    /// Key names passed to the injector for each action.
    pub left_key: String,
    pub right_key: String,
    pub injector: InjectorKind,
    /// Face-landmark ONNX model.
    pub model_path: PathBuf,
    /// Relay captured frames to the display consumer.
    pub display_enabled: bool,
    /// Mark the tracked eye contours on relayed frames.
    pub show_landmarks: bool,
    /// Start a preview session when the daemon starts.
    pub preview_on_start: bool,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_index: 0,
            camera_source: "v4l".to_string(),
            width: 320,
            height: 240,
            fps: 30,
            close_threshold: DEFAULT_CLOSE_THRESHOLD,
            open_threshold: DEFAULT_OPEN_THRESHOLD,
            process_interval: 1,
            min_frame_interval_ms: 15,
            read_backoff_ms: 100,
            max_read_failures: 50,
            pulse_ms: 50,
            join_timeout_ms: 3500,
            left_key: "x".to_string(),
            right_key: "c".to_string(),
            injector: InjectorKind::Xdotool,
            model_path: winkey_core::default_model_path(),
            display_enabled: true,
            show_landmarks: true,
            preview_on_start: true,
            session_bus: true,
        }
    }
}

/// `$XDG_CONFIG_HOME/winkey/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("winkey")
        .join("config.toml")
}

impl Config {
    /// Load from `explicit`, else `WINKEY_CONFIG`, else the default path,
    /// then apply `WINKEY_*` overrides and validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(explicit, |key| std::env::var(key).ok())
    }

    /// Like [`Config::load`] with environment lookups going through `lookup`.
    ///
    /// A file named explicitly must exist; the default file is optional.
    pub fn load_with<F>(explicit: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let named = explicit
            .map(Path::to_path_buf)
            .or_else(|| lookup("WINKEY_CONFIG").map(PathBuf::from));
        let mut config = match named {
            Some(path) => Self::from_file(&path)?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };

        let mut problems = config.apply_env(&lookup);
        problems.extend(config.problems());
        if problems.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `WINKEY_*` overrides. Returns one message per unparsable value.
    fn apply_env(&mut self, lookup: &dyn Fn(&str) -> Option<String>) -> Vec<String> {
        let mut errors = Vec::new();
        let mut env = EnvLayer {
            lookup,
            errors: &mut errors,
        };
        env.parse("WINKEY_CAMERA_INDEX", &mut self.camera_index);
        env.parse("WINKEY_CAMERA_SOURCE", &mut self.camera_source);
        env.parse("WINKEY_WIDTH", &mut self.width);
        env.parse("WINKEY_HEIGHT", &mut self.height);
        env.parse("WINKEY_FPS", &mut self.fps);
        env.parse("WINKEY_CLOSE_THRESHOLD", &mut self.close_threshold);
        env.parse("WINKEY_OPEN_THRESHOLD", &mut self.open_threshold);
        env.parse("WINKEY_PROCESS_INTERVAL", &mut self.process_interval);
        env.parse("WINKEY_MIN_FRAME_INTERVAL_MS", &mut self.min_frame_interval_ms);
        env.parse("WINKEY_READ_BACKOFF_MS", &mut self.read_backoff_ms);
        env.parse("WINKEY_MAX_READ_FAILURES", &mut self.max_read_failures);
        env.parse("WINKEY_PULSE_MS", &mut self.pulse_ms);
        env.parse("WINKEY_JOIN_TIMEOUT_MS", &mut self.join_timeout_ms);
        env.parse("WINKEY_LEFT_KEY", &mut self.left_key);
        env.parse("WINKEY_RIGHT_KEY", &mut self.right_key);
        env.parse("WINKEY_INJECTOR", &mut self.injector);
        env.parse("WINKEY_MODEL_PATH", &mut self.model_path);
        env.flag("WINKEY_DISPLAY", &mut self.display_enabled);
        env.flag("WINKEY_SHOW_LANDMARKS", &mut self.show_landmarks);
        env.flag("WINKEY_PREVIEW_ON_START", &mut self.preview_on_start);
        env.flag("WINKEY_SESSION_BUS", &mut self.session_bus);
        errors
    }

    /// Every rule the current values break.
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if let Err(e) = self.camera_source() {
            problems.push(e);
        }
        for (name, value) in [
            ("width", self.width),
            ("height", self.height),
            ("fps", self.fps),
            ("process_interval", self.process_interval),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be greater than 0"));
            }
        }
        for (name, value) in [
            ("close_threshold", self.close_threshold),
            ("open_threshold", self.open_threshold),
        ] {
            if !(value > 0.0 && value < 1.0) {
                problems.push(format!("{name} must be between 0 and 1, got {value}"));
            }
        }
        if self.close_threshold >= self.open_threshold {
            problems.push(format!(
                "close_threshold ({}) must be lower than open_threshold ({})",
                self.close_threshold, self.open_threshold
            ));
        }
        for (name, value) in [("left_key", &self.left_key), ("right_key", &self.right_key)] {
            if value.trim().is_empty() {
                problems.push(format!("{name} must not be empty"));
            }
        }
        if self.join_timeout_ms == 0 {
            problems.push("join_timeout_ms must be greater than 0".to_string());
        }

        problems
    }

    /// Check every rule, reporting all failures together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn camera_source(&self) -> Result<CameraSource, String> {
        self.camera_source.parse()
    }

    pub fn thresholds(&self) -> Result<Thresholds, ThresholdError> {
        Thresholds::new(self.close_threshold, self.open_threshold)
    }

    /// A copy of this config with `update` applied, validated as a whole.
    pub fn with_update(&self, update: &SettingsUpdate) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        let fields = [
            (&mut next.width, update.width),
            (&mut next.height, update.height),
            (&mut next.fps, update.fps),
            (&mut next.process_interval, update.process_interval),
            (&mut next.max_read_failures, update.max_read_failures),
        ];
        for (target, value) in fields {
            if let Some(value) = value {
                *target = value;
            }
        }
        let millis = [
            (&mut next.pulse_ms, update.pulse_ms),
            (&mut next.min_frame_interval_ms, update.min_frame_interval_ms),
            (&mut next.read_backoff_ms, update.read_backoff_ms),
            (&mut next.join_timeout_ms, update.join_timeout_ms),
        ];
        for (target, value) in millis {
            if let Some(value) = value {
                *target = value;
            }
        }
        if let Some(value) = update.close_threshold {
            next.close_threshold = value;
        }
        if let Some(value) = update.open_threshold {
            next.open_threshold = value;
        }
        if let Some(value) = update.show_landmarks {
            next.show_landmarks = value;
        }
        next.validate()?;
        Ok(next)
    }

    pub fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn min_frame_interval(&self) -> Duration {
        Duration::from_millis(self.min_frame_interval_ms)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }
}

/// Settings a running daemon can take without a restart.
///
/// Sent over D-Bus as a TOML table. Thresholds, the processing interval,
/// frame pacing and landmark marking reach a running worker on its next
/// frame. A new capture size or rate restarts the active session. The rest
/// apply from the next session start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulse_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_frame_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_read_failures: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_landmarks: Option<bool>,
}

impl SettingsUpdate {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(ConfigError::Update)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

struct EnvLayer<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
    errors: &'a mut Vec<String>,
}

impl EnvLayer<'_> {
    fn parse<T>(&mut self, key: &str, target: &mut T)
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(raw) = (self.lookup)(key) else {
            return;
        };
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(e) => self.errors.push(format!("{key}={raw:?}: {e}")),
        }
    }

    fn flag(&mut self, key: &str, target: &mut bool) {
        let Some(raw) = (self.lookup)(key) else {
            return;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *target = true,
            "0" | "false" | "no" | "off" => *target = false,
            _ => self.errors.push(format!("{key}={raw:?}: expected a boolean")),
        }
    }
}
