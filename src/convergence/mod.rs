//! Converges a node's remote state to a `DesiredSpec` and verifies the
//! result, or fails with a precise diagnosis. Every apply/verify step goes
//! through the Remote Shell Driver — nothing here talks to the network
//! directly.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::scheduler::backoff::{backoff_sleep, BackoffConfig};
use crate::ssh_driver::{self, DriverError, RemoteSession};

const MAX_ATTEMPTS: u32 = 5;
const POST_RESTART_SETTLE: Duration = Duration::from_secs(12);
const POST_REAPPLY_SETTLE: Duration = Duration::from_secs(8);
const LOOP_DEADLINE: Duration = Duration::from_secs(300);
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConvergenceError {
    #[error("transport error: {0}")]
    Transport(#[from] DriverError),
    #[error("verification failed: {0:?}")]
    VerificationFailed(Vec<String>),
    #[error("convergence loop deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmPolicy {
    Pairing,
    Open,
}

/// Every fingerprinted knob the orchestrator converges a node's remote
/// state to. Extra/unknown fields arriving from external payloads (e.g.
/// webhook metadata) are preserved opaquely in `extra` but never acted on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredSpec {
    pub provider_credential: String,
    pub channel_token: String,
    pub active_model: String,
    pub fallback_models: Vec<String>,
    pub auth_profile_name: String,
    pub dm_policy: DmPolicy,
    pub allow_from: Vec<String>,
    pub volume_permissions: String,
    pub extension_enabled: bool,
    pub search_adapter_enabled: bool,
    pub watchdog_enabled: bool,
    #[serde(default)]
    pub extra: serde_json::Value,
}

const AGENT_WORKSPACE: &str = "/opt/agent";
const RUNTIME_SPEC_PATH: &str = "/opt/agent/runtime-spec.yaml";
const AUTH_PROFILES_PATH: &str = "/opt/agent/auth-profiles.json";
const ALLOW_LIST_PATH: &str = "/opt/agent/allow-list.json";
const CONTAINER_NAME: &str = "agent-runtime";

// Fixed runtime characteristics of the gateway every node runs — not a
// fingerprinted knob of `DesiredSpec`, so these never vary per user.
const RUNTIME_PROVIDER_NAME: &str = "model-router";
const GATEWAY_MODE: &str = "single-user";
const GATEWAY_BIND: &str = "127.0.0.1:8080";
const GATEWAY_AUTH_TYPE: &str = "bearer";
const GATEWAY_GROUP_POLICY: &str = "disabled";
const GATEWAY_STREAM_MODE: &str = "sse";
const LIMIT_MAX_TOKENS_PER_MESSAGE: u32 = 4096;
const LIMIT_MAX_CONTEXT_MESSAGES: u32 = 200;

/// §6's documented YAML shape for the per-user runtime spec file — distinct
/// from `DesiredSpec`'s internal field names, which this is built from.
#[derive(Debug, Serialize)]
struct RuntimeSpecFile {
    provider: String,
    model: String,
    api_key: String,
    gateway: GatewaySection,
    channels: ChannelsSection,
    limits: LimitsSection,
}

#[derive(Debug, Serialize)]
struct GatewaySection {
    mode: String,
    bind: String,
    auth: GatewayAuthSection,
    #[serde(rename = "controlUi")]
    control_ui: ControlUiSection,
}

#[derive(Debug, Serialize)]
struct GatewayAuthSection {
    #[serde(rename = "type")]
    kind: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct ControlUiSection {
    #[serde(rename = "allowedOrigins")]
    allowed_origins: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChannelsSection {
    telegram: TelegramSection,
}

#[derive(Debug, Serialize)]
struct TelegramSection {
    enabled: bool,
    #[serde(rename = "botToken")]
    bot_token: String,
    #[serde(rename = "dmPolicy")]
    dm_policy: DmPolicy,
    #[serde(rename = "allowFrom")]
    allow_from: Vec<String>,
    #[serde(rename = "groupPolicy")]
    group_policy: String,
    #[serde(rename = "streamMode")]
    stream_mode: String,
}

#[derive(Debug, Serialize)]
struct LimitsSection {
    max_tokens_per_message: u32,
    max_context_messages: u32,
}

impl RuntimeSpecFile {
    fn from_spec(spec: &DesiredSpec, gateway_token: &str) -> Self {
        Self {
            provider: RUNTIME_PROVIDER_NAME.to_string(),
            model: spec.active_model.clone(),
            api_key: spec.provider_credential.clone(),
            gateway: GatewaySection {
                mode: GATEWAY_MODE.to_string(),
                bind: GATEWAY_BIND.to_string(),
                auth: GatewayAuthSection {
                    kind: GATEWAY_AUTH_TYPE.to_string(),
                    token: gateway_token.to_string(),
                },
                control_ui: ControlUiSection {
                    allowed_origins: vec![],
                },
            },
            channels: ChannelsSection {
                telegram: TelegramSection {
                    enabled: !spec.channel_token.is_empty(),
                    bot_token: spec.channel_token.clone(),
                    dm_policy: spec.dm_policy,
                    allow_from: spec.allow_from.clone(),
                    group_policy: GATEWAY_GROUP_POLICY.to_string(),
                    stream_mode: GATEWAY_STREAM_MODE.to_string(),
                },
            },
            limits: LimitsSection {
                max_tokens_per_message: LIMIT_MAX_TOKENS_PER_MESSAGE,
                max_context_messages: LIMIT_MAX_CONTEXT_MESSAGES,
            },
        }
    }
}

// ─── Warm / quick / full deploy ─────────────────────────────────────────────

/// Unbound node: installs transport-level dependencies (container engine
/// presence, image pull, headless browser install inside the container,
/// extension skeleton, watchdog cron entry, generic search/browser
/// adapters). Idempotent — every step here is safe to re-run.
pub async fn warm_deploy(session: &RemoteSession) -> Result<(), ConvergenceError> {
    info!("warm_deploy: installing transport-level dependencies");
    run(session, "command -v docker || (curl -fsSL https://get.docker.com | sh)").await?;
    run(session, &format!("docker pull {} || true", runtime_image())).await?;
    run(session, "mkdir -p /opt/agent/skills /opt/agent/extensions").await?;
    run(
        session,
        "(crontab -l 2>/dev/null | grep -q agent-watchdog) || \
         (crontab -l 2>/dev/null; echo '*/5 * * * * /opt/agent/watchdog.sh') | crontab -",
    )
    .await?;
    Ok(())
}

/// Warmed node just bound to a user: overlay user-specific files, force
/// container recreate, run `apply_and_verify`, enable per-user extension
/// if requested, expose the gateway token.
pub async fn quick_deploy(
    session: &RemoteSession,
    spec: &DesiredSpec,
    gateway_token: &str,
) -> Result<(), ConvergenceError> {
    apply_and_verify(session, spec, gateway_token).await?;
    if spec.extension_enabled {
        enable_extension(session, None).await?;
    }
    run(
        session,
        &format!(
            "echo {} > /opt/agent/gateway-token",
            ssh_driver::shell_quote(gateway_token)
        ),
    )
    .await?;
    Ok(())
}

/// Cold-path equivalent: `warm_deploy` then `quick_deploy` back to back on
/// a freshly created node.
pub async fn full_deploy(
    session: &RemoteSession,
    spec: &DesiredSpec,
    gateway_token: &str,
) -> Result<(), ConvergenceError> {
    warm_deploy(session).await?;
    quick_deploy(session, spec, gateway_token).await
}

pub async fn set_model(session: &RemoteSession, model: &str) -> Result<(), ConvergenceError> {
    run(
        session,
        &format!(
            "docker exec {CONTAINER_NAME} agent-cli config set active_model {}",
            ssh_driver::shell_quote(model)
        ),
    )
    .await?;
    Ok(())
}

pub async fn install_skill(
    session: &RemoteSession,
    name: &str,
    source_url: &str,
) -> Result<(), ConvergenceError> {
    run(
        session,
        &format!(
            "git clone --depth 1 {} /opt/agent/skills/{}",
            ssh_driver::shell_quote(source_url),
            ssh_driver::shell_quote(name)
        ),
    )
    .await?;
    Ok(())
}

pub async fn uninstall_skill(session: &RemoteSession, name: &str) -> Result<(), ConvergenceError> {
    run(
        session,
        &format!("rm -rf /opt/agent/skills/{}", ssh_driver::shell_quote(name)),
    )
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct ExtensionOverrides {
    pub config_json: Option<String>,
}

pub async fn enable_extension(
    session: &RemoteSession,
    overrides: Option<ExtensionOverrides>,
) -> Result<(), ConvergenceError> {
    if let Some(overrides) = overrides.and_then(|o| o.config_json) {
        ssh_driver::upload(
            session,
            overrides.into_bytes(),
            "/opt/agent/extensions/config.json",
        )
        .await?;
    }
    run(
        session,
        &format!("docker exec {CONTAINER_NAME} agent-cli extension enable"),
    )
    .await?;
    Ok(())
}

/// Stops the runtime container without deleting it — used by the sweeper
/// when a subscription expires. The node row itself outlives this; an
/// operator may reactivate later.
pub async fn stop_runtime_container(session: &RemoteSession) -> Result<(), ConvergenceError> {
    run(session, &format!("docker stop {CONTAINER_NAME} 2>/dev/null || true")).await?;
    Ok(())
}

pub async fn disable_extension(session: &RemoteSession) -> Result<(), ConvergenceError> {
    run(
        session,
        &format!("docker exec {CONTAINER_NAME} agent-cli extension disable"),
    )
    .await?;
    Ok(())
}

pub async fn verify_extension(session: &RemoteSession) -> Result<(bool, Vec<String>), ConvergenceError> {
    let out = run(
        session,
        &format!("docker exec {CONTAINER_NAME} agent-cli extension status"),
    )
    .await?;
    let ok = out.stdout.contains("enabled");
    Ok((ok, vec![out.stdout]))
}

// ─── apply_and_verify ────────────────────────────────────────────────────────

/// The retry loop. Reuses `scheduler::backoff` for the inter-attempt wait
/// (tuned close to the spec's `5 * attempt` schedule) and fixed settle
/// sleeps for the two waits inside every attempt.
pub async fn apply_and_verify(
    session: &RemoteSession,
    spec: &DesiredSpec,
    gateway_token: &str,
) -> Result<(), ConvergenceError> {
    let backoff_cfg = BackoffConfig {
        base_ms: 5_000,
        max_ms: 30_000,
        multiplier: 1.5,
        jitter_fraction: 0.1,
    };

    let fut = async {
        let mut last_failures = Vec::new();
        for attempt in 1..=MAX_ATTEMPTS {
            fix_permissions(session).await?;
            apply_all(session, spec, gateway_token).await?;
            restart_runtime_container(session).await?;
            tokio::time::sleep(POST_RESTART_SETTLE).await;

            fix_permissions(session).await?;
            apply_all(session, spec, gateway_token).await?;
            tokio::time::sleep(POST_REAPPLY_SETTLE).await;

            let (ok, failures) = verify(session, spec).await?;
            if ok {
                return Ok(());
            }
            warn!(attempt, ?failures, "convergence verification failed");
            last_failures = failures;
            if attempt < MAX_ATTEMPTS {
                backoff_sleep(attempt, &backoff_cfg).await;
            }
        }
        Err(ConvergenceError::VerificationFailed(last_failures))
    };

    match tokio::time::timeout(LOOP_DEADLINE, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConvergenceError::DeadlineExceeded),
    }
}

async fn fix_permissions(session: &RemoteSession) -> Result<(), ConvergenceError> {
    run(session, &format!("chown -R 1000:1000 {AGENT_WORKSPACE}")).await?;
    Ok(())
}

async fn apply_all(
    session: &RemoteSession,
    spec: &DesiredSpec,
    gateway_token: &str,
) -> Result<(), ConvergenceError> {
    let runtime_spec = RuntimeSpecFile::from_spec(spec, gateway_token);
    let yaml = serde_yaml::to_string(&runtime_spec).map_err(|e| {
        ConvergenceError::Transport(DriverError::Io(format!("spec serialize failed: {e}")))
    })?;
    ssh_driver::upload(session, yaml.into_bytes(), RUNTIME_SPEC_PATH).await?;

    let auth_profiles = serde_json::json!({
        "profiles": {
            spec.auth_profile_name.clone(): {
                "provider": RUNTIME_PROVIDER_NAME,
                "apiKey": spec.provider_credential.clone(),
            },
        },
        "default": spec.auth_profile_name.clone(),
    });
    ssh_driver::upload(
        session,
        serde_json::to_vec_pretty(&auth_profiles).unwrap_or_default(),
        AUTH_PROFILES_PATH,
    )
    .await?;

    let allow_list = serde_json::json!({ "version": 1, "allowFrom": spec.allow_from });
    ssh_driver::upload(
        session,
        serde_json::to_vec_pretty(&allow_list).unwrap_or_default(),
        ALLOW_LIST_PATH,
    )
    .await?;

    Ok(())
}

async fn restart_runtime_container(session: &RemoteSession) -> Result<(), ConvergenceError> {
    run(
        session,
        &format!(
            "docker rm -f {CONTAINER_NAME} 2>/dev/null; \
             docker run -d --name {CONTAINER_NAME} -v {AGENT_WORKSPACE}:{AGENT_WORKSPACE} {} ",
            runtime_image()
        ),
    )
    .await?;
    Ok(())
}

fn runtime_image() -> &'static str {
    "fleetd/agent-runtime:latest"
}

// ─── verify() — seven read-only probes ──────────────────────────────────────

async fn verify(
    session: &RemoteSession,
    spec: &DesiredSpec,
) -> Result<(bool, Vec<String>), ConvergenceError> {
    let mut failures = Vec::new();

    if !probe_dm_policy(session, spec).await? {
        failures.push("dm policy mismatch".to_string());
    }
    if !probe_startup_model(session, spec).await? {
        failures.push("startup log missing expected model prefix".to_string());
    }
    if !probe_auth_profile(session, spec).await? {
        failures.push("auth profile file missing or credential mismatch".to_string());
    }
    if !probe_container_running(session).await? {
        failures.push("container engine reports runtime not running".to_string());
    }
    if !probe_no_permission_denied(session).await? {
        failures.push("recent logs contain permission-denied entries".to_string());
    }
    if !probe_channel_startup(session).await? {
        failures.push("messaging-channel provider startup line not found".to_string());
    }
    if !probe_allow_list(session, spec).await? {
        failures.push("allow-list file missing expected peer id".to_string());
    }

    Ok((failures.is_empty(), failures))
}

async fn probe_dm_policy(session: &RemoteSession, spec: &DesiredSpec) -> Result<bool, ConvergenceError> {
    let out = run(
        session,
        &format!("docker exec {CONTAINER_NAME} agent-cli config get dm_policy"),
    )
    .await?;
    let expected = match spec.dm_policy {
        DmPolicy::Pairing => "pairing",
        DmPolicy::Open => "open",
    };
    Ok(out.stdout.trim() == expected)
}

async fn probe_startup_model(
    session: &RemoteSession,
    spec: &DesiredSpec,
) -> Result<bool, ConvergenceError> {
    let out = run(
        session,
        &format!("docker logs --tail 50 {CONTAINER_NAME} 2>&1 | grep '^agent model:' || true"),
    )
    .await?;
    Ok(out.stdout.contains(&spec.active_model))
}

async fn probe_auth_profile(
    session: &RemoteSession,
    spec: &DesiredSpec,
) -> Result<bool, ConvergenceError> {
    let out = run(session, &format!("cat {AUTH_PROFILES_PATH} 2>/dev/null || true")).await?;
    Ok(out.stdout.contains(&spec.provider_credential))
}

async fn probe_container_running(session: &RemoteSession) -> Result<bool, ConvergenceError> {
    let out = run(
        session,
        &format!("docker inspect -f '{{{{.State.Status}}}}' {CONTAINER_NAME} 2>/dev/null || true"),
    )
    .await?;
    Ok(out.stdout.trim() == "running")
}

async fn probe_no_permission_denied(session: &RemoteSession) -> Result<bool, ConvergenceError> {
    let out = run(
        session,
        &format!("docker logs --tail 20 {CONTAINER_NAME} 2>&1 | grep -ic 'permission denied' || true"),
    )
    .await?;
    Ok(out.stdout.trim() == "0")
}

async fn probe_channel_startup(session: &RemoteSession) -> Result<bool, ConvergenceError> {
    let out = run(
        session,
        &format!("docker logs --tail 50 {CONTAINER_NAME} 2>&1 | grep -i 'channel.*connected' || true"),
    )
    .await?;
    Ok(!out.stdout.trim().is_empty())
}

async fn probe_allow_list(session: &RemoteSession, spec: &DesiredSpec) -> Result<bool, ConvergenceError> {
    let out = run(session, &format!("cat {ALLOW_LIST_PATH} 2>/dev/null || true")).await?;
    if spec.allow_from.iter().any(|p| p == "*") {
        return Ok(out.stdout.contains('*'));
    }
    Ok(spec.allow_from.iter().all(|peer| out.stdout.contains(peer)))
}

async fn run(
    session: &RemoteSession,
    cmd: &str,
) -> Result<ssh_driver::ExecOutput, ConvergenceError> {
    Ok(ssh_driver::exec(session, cmd, EXEC_TIMEOUT).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> DesiredSpec {
        DesiredSpec {
            provider_credential: "sk-test".into(),
            channel_token: "chan-tok".into(),
            active_model: "claude-test".into(),
            fallback_models: vec![],
            auth_profile_name: "default".into(),
            dm_policy: DmPolicy::Pairing,
            allow_from: vec!["peer-1".into()],
            volume_permissions: "0700".into(),
            extension_enabled: false,
            search_adapter_enabled: false,
            watchdog_enabled: true,
            extra: serde_json::Value::Null,
        }
    }

    #[test]
    fn desired_spec_roundtrips_through_yaml() {
        let spec = sample_spec();
        let yaml = serde_yaml::to_string(&spec).unwrap();
        let back: DesiredSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.active_model, spec.active_model);
        assert_eq!(back.allow_from, spec.allow_from);
    }

    #[test]
    fn wildcard_allow_from_matches_anything_in_list_output() {
        let mut spec = sample_spec();
        spec.allow_from = vec!["*".into()];
        assert!(spec.allow_from.iter().any(|p| p == "*"));
    }

    #[test]
    fn runtime_spec_file_matches_documented_wire_keys() {
        let spec = sample_spec();
        let runtime_spec = RuntimeSpecFile::from_spec(&spec, "gw-tok");
        let yaml = serde_yaml::to_string(&runtime_spec).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(value["provider"].as_str().unwrap(), RUNTIME_PROVIDER_NAME);
        assert_eq!(value["model"].as_str().unwrap(), spec.active_model);
        assert_eq!(value["api_key"].as_str().unwrap(), spec.provider_credential);
        assert_eq!(value["gateway"]["auth"]["token"].as_str().unwrap(), "gw-tok");
        assert_eq!(
            value["channels"]["telegram"]["botToken"].as_str().unwrap(),
            spec.channel_token
        );
        assert_eq!(value["channels"]["telegram"]["dmPolicy"].as_str().unwrap(), "pairing");
        assert!(value["limits"]["max_tokens_per_message"].as_u64().unwrap() > 0);
    }

    #[test]
    fn auth_profiles_file_uses_profiles_default_wrapper() {
        let spec = sample_spec();
        let auth_profiles = serde_json::json!({
            "profiles": {
                spec.auth_profile_name.clone(): {
                    "provider": RUNTIME_PROVIDER_NAME,
                    "apiKey": spec.provider_credential.clone(),
                },
            },
            "default": spec.auth_profile_name.clone(),
        });
        assert_eq!(auth_profiles["default"], "default");
        assert_eq!(
            auth_profiles["profiles"]["default"]["apiKey"],
            "sk-test"
        );
    }

    #[test]
    fn allow_list_file_uses_version_allow_from_wrapper() {
        let spec = sample_spec();
        let allow_list = serde_json::json!({ "version": 1, "allowFrom": spec.allow_from });
        assert_eq!(allow_list["version"], 1);
        assert_eq!(allow_list["allowFrom"][0], "peer-1");
    }
}
