use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::errors::FleetError;

const DEFAULT_PORT: u16 = 4300;
const DEFAULT_MIN_AVAILABLE: i64 = 5;
const DEFAULT_MAX_TOTAL: i64 = 10;
const DEFAULT_MONTHLY_LIMIT_USD: f64 = 20.0;
const DEFAULT_SUBSCRIPTION_PRICE_CENTS: i64 = 2_900;
const DEFAULT_MAX_PARALLEL_NODE_OPS: usize = 8;
const DEFAULT_NODE_OS_TAG: &str = "ubuntu-22.04";

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// REST API port (default: 4300).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,fleetd=trace" (default: "info").
    log: Option<String>,
    /// Minimum warm-pool size the pool maintainer keeps available (default: 5).
    min_available: Option<i64>,
    /// Hard cap on total non-error nodes (default: 10).
    max_total: Option<i64>,
    /// Default monthly model-router spend limit minted per new user, in USD.
    default_monthly_limit_usd: Option<f64>,
    /// Default subscription price, in cents.
    default_subscription_price_cents: Option<i64>,
    /// Maximum number of cross-node operations running concurrently.
    max_parallel_node_ops: Option<usize>,
    /// Node provider OS image tag used for new pool nodes.
    node_os_tag: Option<String>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── Secrets (.env) ────────────────────────────────────────────────────────────

/// Credential bundle loaded from `.env` (via `dotenvy`) or the process
/// environment directly. Missing any of these at startup is `FatalConfig`
/// — the binary refuses to start rather than run with a half-wired
/// credential set, mirroring the teacher's "auth token is required"
/// fatal-startup-error shape in `main.rs`.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub node_provider_base_url: String,
    pub node_provider_api_token: String,
    pub model_router_base_url: String,
    pub model_router_admin_key: String,
    pub google_oauth_client_id: String,
    pub apple_oauth_bundle_id: String,
    pub admin_chat_webhook_url: Option<String>,
    pub sales_chatbot_webhook_url: Option<String>,
    pub payment_gateway_webhook_secret: String,
    pub payment_gateway_base_url: String,
    pub payment_gateway_api_key: String,
    pub rest_bearer_token: String,
}

impl Secrets {
    pub fn load_from_env() -> Result<Self, FleetError> {
        dotenvy::dotenv().ok();

        let required = |name: &str| -> Result<String, FleetError> {
            std::env::var(name).map_err(|_| {
                FleetError::FatalConfig(format!("required secret {name} is not set"))
            })
        };

        Ok(Self {
            node_provider_base_url: required("FLEETD_NODE_PROVIDER_BASE_URL")?,
            node_provider_api_token: required("FLEETD_NODE_PROVIDER_API_TOKEN")?,
            model_router_base_url: required("FLEETD_MODEL_ROUTER_BASE_URL")?,
            model_router_admin_key: required("FLEETD_MODEL_ROUTER_ADMIN_KEY")?,
            google_oauth_client_id: required("FLEETD_GOOGLE_OAUTH_CLIENT_ID")?,
            apple_oauth_bundle_id: required("FLEETD_APPLE_OAUTH_BUNDLE_ID")?,
            admin_chat_webhook_url: std::env::var("FLEETD_ADMIN_CHAT_WEBHOOK_URL").ok(),
            sales_chatbot_webhook_url: std::env::var("FLEETD_SALES_CHATBOT_WEBHOOK_URL").ok(),
            payment_gateway_webhook_secret: required("FLEETD_PAYMENT_GATEWAY_WEBHOOK_SECRET")?,
            payment_gateway_base_url: required("FLEETD_PAYMENT_GATEWAY_BASE_URL")?,
            payment_gateway_api_key: required("FLEETD_PAYMENT_GATEWAY_API_KEY")?,
            rest_bearer_token: required("FLEETD_REST_BEARER_TOKEN")?,
        })
    }
}

// ─── FleetConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub min_available: i64,
    pub max_total: i64,
    pub default_monthly_limit_usd: f64,
    pub default_subscription_price_cents: i64,
    pub max_parallel_node_ops: usize,
    pub node_os_tag: String,
}

impl FleetConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let min_available = toml.min_available.unwrap_or(DEFAULT_MIN_AVAILABLE);
        let max_total = toml.max_total.unwrap_or(DEFAULT_MAX_TOTAL);
        let default_monthly_limit_usd = toml
            .default_monthly_limit_usd
            .unwrap_or(DEFAULT_MONTHLY_LIMIT_USD);
        let default_subscription_price_cents = toml
            .default_subscription_price_cents
            .unwrap_or(DEFAULT_SUBSCRIPTION_PRICE_CENTS);
        let max_parallel_node_ops = toml
            .max_parallel_node_ops
            .unwrap_or(DEFAULT_MAX_PARALLEL_NODE_OPS);
        let node_os_tag = toml
            .node_os_tag
            .unwrap_or_else(|| DEFAULT_NODE_OS_TAG.to_string());

        Self {
            port,
            data_dir,
            log,
            min_available,
            max_total,
            default_monthly_limit_usd,
            default_subscription_price_cents,
            max_parallel_node_ops,
            node_os_tag,
        }
    }
}

// ─── Hot-reloadable config subset ─────────────────────────────────────────────

/// Non-critical config fields that can be changed without restarting the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct HotConfig {
    pub log_level: String,
    pub min_available: i64,
    pub max_total: i64,
}

/// Watches `config.toml` for changes and reloads non-critical fields.
///
/// Uses the `notify` crate (kqueue on macOS, inotify on Linux) to detect
/// file modifications. Only `log_level`, `min_available`, and `max_total`
/// are reloaded; port and other startup-only fields require a full restart.
pub struct ConfigWatcher {
    pub hot: Arc<RwLock<HotConfig>>,
    // Hold the watcher alive; dropping it stops the file watch.
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    /// Start watching `{data_dir}/config.toml` for changes.
    ///
    /// Returns `None` if the watcher could not be created (non-fatal; the
    /// orchestrator runs fine without hot-reload).
    pub fn start(data_dir: &Path) -> Option<Self> {
        let config_path = data_dir.join("config.toml");
        let initial = load_hot_config(&config_path);
        let hot = Arc::new(RwLock::new(initial));

        let hot_clone = hot.clone();
        let config_path_clone = config_path.clone();
        let rt_handle = tokio::runtime::Handle::current();

        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    let relevant = events.iter().any(|e| {
                        use notify_debouncer_full::notify::EventKind;
                        matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    });
                    if relevant {
                        let hot = hot_clone.clone();
                        let path = config_path_clone.clone();
                        rt_handle.spawn(async move {
                            let new_config = load_hot_config(&path);
                            let mut guard = hot.write().await;
                            if guard.log_level != new_config.log_level
                                || guard.min_available != new_config.min_available
                                || guard.max_total != new_config.max_total
                            {
                                info!(
                                    log_level = %new_config.log_level,
                                    min_available = new_config.min_available,
                                    max_total = new_config.max_total,
                                    "config.toml reloaded"
                                );
                                *guard = new_config;
                            }
                        });
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                let watch_path = config_path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) = debouncer.watcher().watch(
                    watch_path,
                    notify_debouncer_full::notify::RecursiveMode::NonRecursive,
                ) {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "config hot-reload watcher started");
                Some(Self {
                    hot,
                    _watcher: debouncer,
                })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

/// Load only the hot-reloadable fields from config.toml.
fn load_hot_config(path: &Path) -> HotConfig {
    let toml = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| toml::from_str::<TomlConfig>(&s).ok())
        .unwrap_or_default();
    HotConfig {
        log_level: toml.log.unwrap_or_else(|| "info".to_string()),
        min_available: toml.min_available.unwrap_or(DEFAULT_MIN_AVAILABLE),
        max_total: toml.max_total.unwrap_or(DEFAULT_MAX_TOTAL),
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("fleetd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("fleetd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("fleetd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("fleetd");
        }
    }
    PathBuf::from(".fleetd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FleetConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.min_available, DEFAULT_MIN_AVAILABLE);
        assert_eq!(cfg.max_total, DEFAULT_MAX_TOTAL);
    }

    #[test]
    fn explicit_port_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FleetConfig::new(Some(9999), Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, 9999);
    }
}
