//! Configuration file – reads/writes `~/.backplane/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backplane_http::{HttpConfig, LinkMode};
use backplane_middleware::{RouterConfig, RouterMode};
use backplane_runtime::BridgeConfig;
use backplane_types::BackplaneError;
use serde::{Deserialize, Serialize};

/// Settings shared by every role. Every field has a default, so a partial
/// file (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address peers use to reach the router.
    #[serde(default = "default_router_address")]
    pub router_address: String,

    /// Address the router and the HTTP listener bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Peers publish to the router here.
    #[serde(default = "default_publish_port")]
    pub publish_port: u16,

    /// Peers subscribe to the router here.
    #[serde(default = "default_subscribe_port")]
    pub subscribe_port: u16,

    /// Direct-pair front-end link.
    #[serde(default = "default_pair_port")]
    pub pair_port: u16,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default)]
    pub router_mode: RouterMode,

    /// Boards `1..=report_boards` have their reports relayed to front-ends.
    #[serde(default = "default_report_boards")]
    pub report_boards: u16,

    /// Idle sleep of every poll loop.
    #[serde(default = "default_quantum_ms")]
    pub quantum_ms: u64,

    /// Retry interval of connecting endpoints.
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,

    /// Reply polls before an i2c read gives up.
    #[serde(default = "default_i2c_max_attempts")]
    pub i2c_max_attempts: u32,
}

fn default_router_address() -> String {
    "127.0.0.1".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_publish_port() -> u16 {
    43124
}
fn default_subscribe_port() -> u16 {
    43125
}
fn default_pair_port() -> u16 {
    43123
}
fn default_http_port() -> u16 {
    backplane_http::DEFAULT_PORT
}
fn default_report_boards() -> u16 {
    backplane_types::MAX_BOARD
}
fn default_quantum_ms() -> u64 {
    1
}
fn default_reconnect_ms() -> u64 {
    500
}
fn default_i2c_max_attempts() -> u32 {
    backplane_runtime::bridge::DEFAULT_I2C_MAX_ATTEMPTS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router_address: default_router_address(),
            bind_address: default_bind_address(),
            publish_port: default_publish_port(),
            subscribe_port: default_subscribe_port(),
            pair_port: default_pair_port(),
            http_port: default_http_port(),
            router_mode: RouterMode::default(),
            report_boards: default_report_boards(),
            quantum_ms: default_quantum_ms(),
            reconnect_ms: default_reconnect_ms(),
            i2c_max_attempts: default_i2c_max_attempts(),
        }
    }
}

impl Config {
    pub fn quantum(&self) -> Duration {
        Duration::from_millis(self.quantum_ms)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }

    /// Where a peer connects to publish.
    pub fn publish_addr(&self) -> String {
        format!("{}:{}", self.router_address, self.publish_port)
    }

    /// Where a peer connects to subscribe.
    pub fn subscribe_addr(&self) -> String {
        format!("{}:{}", self.router_address, self.subscribe_port)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            bind_address: self.bind_address.clone(),
            publish_port: self.publish_port,
            subscribe_port: self.subscribe_port,
            pair_port: self.pair_port,
            report_boards: self.report_boards,
            quantum: self.quantum(),
            mode: self.router_mode,
        }
    }

    pub fn bridge_config(&self, board: u16) -> BridgeConfig {
        BridgeConfig {
            board,
            quantum: self.quantum(),
            i2c_max_attempts: self.i2c_max_attempts,
        }
    }

    pub fn http_config(&self, link: LinkMode) -> HttpConfig {
        HttpConfig {
            bind_address: self.bind_address.clone(),
            port: self.http_port,
            router_address: self.router_address.clone(),
            publish_port: self.publish_port,
            subscribe_port: self.subscribe_port,
            pair_port: self.pair_port,
            report_boards: self.report_boards,
            reconnect: self.reconnect(),
            link,
        }
    }
}

/// Return the path to `~/.backplane/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".backplane").join("config.toml")
}

/// Load `path` (or the default location), fall back to defaults when the
/// file is absent, then apply environment overrides.
pub fn resolve(path: Option<&Path>) -> Result<Config, BackplaneError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let mut cfg = load_from(&path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path. `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, BackplaneError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        BackplaneError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| BackplaneError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `BACKPLANE_*` environment variable overrides to `cfg`. Values that
/// do not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `BACKPLANE_ROUTER_ADDRESS` | `router_address` |
/// | `BACKPLANE_PUBLISH_PORT` | `publish_port` |
/// | `BACKPLANE_SUBSCRIBE_PORT` | `subscribe_port` |
/// | `BACKPLANE_PAIR_PORT` | `pair_port` |
/// | `BACKPLANE_HTTP_PORT` | `http_port` |
/// | `BACKPLANE_ROUTER_MODE` | `router_mode` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("BACKPLANE_ROUTER_ADDRESS")
        && !v.trim().is_empty()
    {
        cfg.router_address = v.trim().to_string();
    }
    for (var, field) in [
        ("BACKPLANE_PUBLISH_PORT", &mut cfg.publish_port),
        ("BACKPLANE_SUBSCRIBE_PORT", &mut cfg.subscribe_port),
        ("BACKPLANE_PAIR_PORT", &mut cfg.pair_port),
        ("BACKPLANE_HTTP_PORT", &mut cfg.http_port),
    ] {
        if let Ok(v) = std::env::var(var)
            && let Ok(port) = v.trim().parse::<u16>()
        {
            *field = port;
        }
    }
    if let Ok(v) = std::env::var("BACKPLANE_ROUTER_MODE")
        && let Ok(mode) = v.parse::<RouterMode>()
    {
        cfg.router_mode = mode;
    }
}

/// Save the config to a specific path, creating its directory.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), BackplaneError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            BackplaneError::Config(format!("failed to create config directory: {e}"))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                BackplaneError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BackplaneError::Config(format!("failed to serialize config: {e}")))?;
    let write_error =
        |e: std::io::Error| BackplaneError::Config(format!("failed to write {}: {e}", path.display()));
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_error)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, Config::default());
        assert_eq!(loaded.publish_port, 43124);
        assert_eq!(loaded.subscribe_port, 43125);
        assert_eq!(loaded.pair_port, 43123);
        assert_eq!(loaded.http_port, 50208);
        assert_eq!(loaded.router_mode, RouterMode::Forwarder);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "router_mode = \"direct-pair\"\nhttp_port = 8081\n").unwrap();

        let loaded = load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.router_mode, RouterMode::DirectPair);
        assert_eq!(loaded.http_port, 8081);
        assert_eq!(loaded.router_address, "127.0.0.1");
        assert_eq!(loaded.i2c_max_attempts, 1000);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "publish_port = \"lots\"\n").unwrap();
        assert!(matches!(load_from(&path), Err(BackplaneError::Config(_))));
    }

    #[test]
    fn config_path_points_to_backplane_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".backplane"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn derived_role_configs() {
        let cfg = Config {
            router_address: "10.0.0.5".into(),
            ..Config::default()
        };
        assert_eq!(cfg.publish_addr(), "10.0.0.5:43124");
        assert_eq!(cfg.subscribe_addr(), "10.0.0.5:43125");
        assert_eq!(cfg.router_config().pair_port, 43123);
        assert_eq!(cfg.bridge_config(4).board, 4);
        let http = cfg.http_config(LinkMode::Pair);
        assert_eq!(http.router_address, "10.0.0.5");
        assert_eq!(http.port, 50208);
        assert_eq!(http.link, LinkMode::Pair);
    }

    // Each test below touches a different variable.

    #[test]
    fn apply_env_overrides_changes_router_address() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("BACKPLANE_ROUTER_ADDRESS", "192.168.2.7") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.router_address, "192.168.2.7");
        unsafe { std::env::remove_var("BACKPLANE_ROUTER_ADDRESS") };
    }

    #[test]
    fn apply_env_overrides_changes_http_port() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("BACKPLANE_HTTP_PORT", "8181") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.http_port, 8181);
        unsafe { std::env::remove_var("BACKPLANE_HTTP_PORT") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_port() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("BACKPLANE_PAIR_PORT", "not-a-port") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.pair_port, 43123);
        unsafe { std::env::remove_var("BACKPLANE_PAIR_PORT") };
    }

    #[test]
    fn apply_env_overrides_changes_router_mode() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("BACKPLANE_ROUTER_MODE", "direct-pair") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.router_mode, RouterMode::DirectPair);
        unsafe { std::env::remove_var("BACKPLANE_ROUTER_MODE") };
    }
}
