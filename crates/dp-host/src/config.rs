//! Host-facing configuration (§6): mode selection plus the buffering and
//! balancing knobs, loaded from an optional TOML file and then overridden by
//! environment variables. Explicit commit parameters (passed directly to a
//! `Device` constructor) take precedence over both, by virtue of being
//! applied after `Config::apply_env` in the caller's own code.

use serde::Deserialize;
use std::{env, fs, path::PathBuf};
use tracing::{info, warn};

/// How the process group bootstraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Collocated,
    Listen,
    Connect,
    Launch,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Collocated
    }
}

impl Mode {
    fn parse(s: &str) -> Option<Mode> {
        match s.to_ascii_lowercase().as_str() {
            "collocated" => Some(Mode::Collocated),
            "listen" => Some(Mode::Listen),
            "connect" => Some(Mode::Connect),
            "launch" => Some(Mode::Launch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub mode: Mode,
    pub port: u16,
    pub host: String,
    pub launch_command: String,
    pub dynamic_load_balancer: bool,
    pub preallocated_tiles: u32,
    pub write_buffer_scale: f32,
    pub force_compression: bool,
    pub load_modules: Vec<String>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            port: 35125,
            host: "127.0.0.1".to_string(),
            launch_command: String::new(),
            dynamic_load_balancer: false,
            preallocated_tiles: 0,
            write_buffer_scale: 1.0,
            force_compression: false,
            load_modules: Vec::new(),
        }
    }
}

/// Parsed (or defaulted) configuration, plus the raw file text if one was
/// read — kept around the way `core-config` keeps `raw`, in case a caller
/// wants to report what was actually loaded.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub raw: Option<String>,
    pub file: ConfigFile,
}

/// Best-effort config path: a local `offload.toml` takes precedence, falling
/// back to the platform config directory.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("offload.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("offload-core").join("offload.toml");
    }
    PathBuf::from("offload.toml")
}

/// Load from `path` (or `discover()`'s result), falling back to
/// `Config::default()` on a missing or unparseable file rather than failing
/// startup outright.
pub fn load_from(path: Option<PathBuf>) -> Config {
    let path = path.unwrap_or_else(discover);
    let Ok(content) = fs::read_to_string(&path) else {
        return Config::default();
    };
    match toml::from_str::<ConfigFile>(&content) {
        Ok(file) => {
            info!(target: "host.config", path = %path.display(), "loaded config file");
            Config {
                raw: Some(content),
                file,
            }
        }
        Err(err) => {
            warn!(
                target: "host.config",
                path = %path.display(),
                %err,
                "failed to parse config file, falling back to defaults"
            );
            Config::default()
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Apply §6's environment-variable overrides in place. A malformed
    /// value is logged and ignored rather than treated as fatal, matching
    /// the file loader's own resilience policy.
    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("DP_DEVICE") {
            match Mode::parse(&v) {
                Some(mode) => self.file.mode = mode,
                None => warn!(target: "host.config", value = %v, "DP_DEVICE did not name a known mode"),
            }
        }
        if let Ok(v) = env::var("DP_FORCE_COMPRESSION") {
            match parse_bool(&v) {
                Some(b) => self.file.force_compression = b,
                None => warn!(target: "host.config", value = %v, "DP_FORCE_COMPRESSION was not a boolean"),
            }
        }
        if let Ok(v) = env::var("DP_WRITE_BUFFER_SCALE") {
            match v.parse::<f32>() {
                Ok(scale) => self.file.write_buffer_scale = scale,
                Err(_) => warn!(target: "host.config", value = %v, "DP_WRITE_BUFFER_SCALE was not a number"),
            }
        }
        if let Ok(v) = env::var("DP_DYNAMIC_LOAD_BALANCER") {
            match parse_bool(&v) {
                Some(b) => self.file.dynamic_load_balancer = b,
                None => warn!(target: "host.config", value = %v, "DP_DYNAMIC_LOAD_BALANCER was not a boolean"),
            }
        }
        if let Ok(v) = env::var("DP_PREALLOCATED_TILES") {
            match v.parse::<u32>() {
                Ok(n) => self.file.preallocated_tiles = n,
                Err(_) => warn!(target: "host.config", value = %v, "DP_PREALLOCATED_TILES was not an integer"),
            }
        }
        if let Ok(v) = env::var("DP_LOAD_MODULES") {
            self.file.load_modules = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        // DP_LOG_LEVEL is consumed directly by the binary's tracing-subscriber
        // EnvFilter, not stored here.
    }

    /// Buffer policy derived from `write_buffer_scale`, layered atop C4's
    /// documented defaults. `preallocated_tiles` and `force_compression` are
    /// accepted and stored but currently have no downstream effect: no
    /// compression layer exists yet in the codec, and C6 sizes its tile
    /// table from the framebuffer's own dimensions rather than a hint.
    pub fn buffer_policy(&self) -> dp_buffer::BufferPolicy {
        let scale = f64::from(self.file.write_buffer_scale.max(0.0));
        dp_buffer::BufferPolicy {
            auto_flush_bytes: scale_usize(dp_buffer::DEFAULT_AUTO_FLUSH_BYTES, scale),
            ..dp_buffer::BufferPolicy::default()
        }
    }

    /// Dispatcher tunables mirrored from this config, for whatever process
    /// constructs the worker-side `Dispatcher`s in this run.
    pub fn dispatch_config(&self) -> dp_dispatch::DispatchConfig {
        dp_dispatch::DispatchConfig {
            dynamic_load_balancer: self.file.dynamic_load_balancer,
            samples_per_pixel: 1,
        }
    }
}

fn scale_usize(base: usize, scale: f64) -> usize {
    ((base as f64) * scale).round().max(1.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn default_config_when_missing_file() {
        let cfg = load_from(Some(PathBuf::from("__nonexistent_offload_toml__")));
        assert_eq!(cfg.file.mode, Mode::Collocated);
        assert_eq!(cfg.file.port, 35125);
    }

    #[test]
    fn parses_mode_and_balancer_fields() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "mode = \"listen\"\nport = 9999\ndynamic_load_balancer = true\n",
        )
        .unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf()));
        assert_eq!(cfg.file.mode, Mode::Listen);
        assert_eq!(cfg.file.port, 9999);
        assert!(cfg.file.dynamic_load_balancer);
    }

    #[test]
    fn unparseable_file_falls_back_to_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "not valid toml {{{").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf()));
        assert_eq!(cfg.file.mode, Mode::Collocated);
    }

    #[test]
    fn write_buffer_scale_multiplies_auto_flush_bytes() {
        let mut cfg = Config::default();
        cfg.file.write_buffer_scale = 2.0;
        let policy = cfg.buffer_policy();
        assert_eq!(policy.auto_flush_bytes, dp_buffer::DEFAULT_AUTO_FLUSH_BYTES * 2);
    }

    #[test]
    fn env_overrides_take_precedence_over_file() {
        // SAFETY (test-only): no other test in this process reads or writes
        // this particular variable concurrently.
        unsafe {
            env::set_var("DP_DEVICE", "launch");
        }
        let mut cfg = Config::default();
        cfg.apply_env();
        assert_eq!(cfg.file.mode, Mode::Launch);
        unsafe {
            env::remove_var("DP_DEVICE");
        }
    }
}
