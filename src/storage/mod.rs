use anyhow::Result;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the orchestrator indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
/// Returns an error if the operation takes longer than `QUERY_TIMEOUT`.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

// ─── Row types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub auth_provider: String,
    pub identity_provider_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub id: String,
    pub user_id: String,
    pub active: bool,
    pub auto_renew: bool,
    pub status: String,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    pub saved_payment_method_token: Option<String>,
    pub cancelled_at: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentRow {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub is_recurring: bool,
    pub external_payment_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeRow {
    pub id: String,
    pub provider_node_id: Option<String>,
    pub ip: Option<String>,
    pub ssh_user: String,
    pub ssh_password: Option<String>,
    pub ssh_port: i64,
    pub state: String,
    pub deployment_stage: String,
    pub runtime_running: bool,
    pub extension_installed: bool,
    pub gateway_token: Option<String>,
    pub binding_user: Option<String>,
    pub host_key_fingerprint: Option<String>,
    pub last_error: Option<String>,
    pub last_health_check: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserProfileRow {
    pub user_id: String,
    pub selected_model: Option<String>,
    pub subscription_status_cache: Option<String>,
    pub model_router_key: Option<String>,
    pub model_router_key_id: Option<String>,
    pub usage_cache_used_usd: f64,
    pub usage_cache_limit_usd: f64,
    pub bot_token: Option<String>,
    pub bot_username: Option<String>,
    pub extension_enabled: bool,
}

#[derive(Clone)]
pub struct NodeStore {
    pool: SqlitePool,
}

/// Kept as an alias so existing call sites and tests written against the
/// teacher's naming keep working during the transition.
pub type Storage = NodeStore;

impl NodeStore {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("fleetd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Users ──────────────────────────────────────────────────────────────

    pub async fn upsert_user(
        &self,
        email: &str,
        auth_provider: &str,
        identity_provider_id: &str,
    ) -> Result<UserRow> {
        if let Some(existing) = self.get_user_by_email(email).await? {
            return Ok(existing);
        }
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO users (id, email, auth_provider, identity_provider_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(email)
        .bind(auth_provider)
        .bind(identity_provider_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_user(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user not found after insert"))
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    // ─── Subscriptions ──────────────────────────────────────────────────────

    pub async fn get_subscription(&self, user_id: &str) -> Result<Option<SubscriptionRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM subscriptions WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Activate or extend a subscription for `user_id`, setting
    /// `period_end = now + 30d`. Creates the row if it does not yet exist.
    pub async fn activate_or_extend_subscription(
        &self,
        user_id: &str,
        saved_payment_method_token: Option<&str>,
    ) -> Result<SubscriptionRow> {
        let now = Utc::now();
        let period_end = (now + chrono::Duration::days(30)).to_rfc3339();
        let now_str = now.to_rfc3339();

        if self.get_subscription(user_id).await?.is_some() {
            sqlx::query(
                "UPDATE subscriptions SET active = 1, status = 'active', period_start = ?,
                 period_end = ?, saved_payment_method_token = COALESCE(?, saved_payment_method_token),
                 cancelled_at = NULL WHERE user_id = ?",
            )
            .bind(&now_str)
            .bind(&period_end)
            .bind(saved_payment_method_token)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        } else {
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO subscriptions
                 (id, user_id, active, auto_renew, status, period_start, period_end, saved_payment_method_token)
                 VALUES (?, ?, 1, 1, 'active', ?, ?, ?)",
            )
            .bind(&id)
            .bind(user_id)
            .bind(&now_str)
            .bind(&period_end)
            .bind(saved_payment_method_token)
            .execute(&self.pool)
            .await?;
        }
        self.get_subscription(user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("subscription not found after upsert"))
    }

    pub async fn list_expiring_subscriptions(&self) -> Result<Vec<SubscriptionRow>> {
        let now = Utc::now().to_rfc3339();
        Ok(sqlx::query_as(
            "SELECT * FROM subscriptions WHERE active = 1 AND period_end <= ?",
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn mark_subscription_expired(&self, user_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET active = 0, status = 'expired' WHERE user_id = ?",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Payments ───────────────────────────────────────────────────────────

    /// Inserts the payment row, ignoring a duplicate `external_payment_id`.
    /// Returns the row plus `true` iff this call performed the insert (a
    /// fresh event) or `false` iff a prior call already recorded it (a
    /// webhook replay) — callers must gate any one-time side effect
    /// (dispatching the Assignment Coordinator) on that flag so a replay
    /// never re-triggers it.
    pub async fn record_payment(
        &self,
        user_id: &str,
        amount: i64,
        currency: &str,
        status: &str,
        is_recurring: bool,
        external_payment_id: &str,
    ) -> Result<(PaymentRow, bool)> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO payments (id, user_id, amount, currency, status, is_recurring, external_payment_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(external_payment_id) DO NOTHING",
        )
        .bind(&id)
        .bind(user_id)
        .bind(amount)
        .bind(currency)
        .bind(status)
        .bind(is_recurring)
        .bind(external_payment_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        let is_new = result.rows_affected() > 0;
        let row = sqlx::query_as("SELECT * FROM payments WHERE external_payment_id = ?")
            .bind(external_payment_id)
            .fetch_one(&self.pool)
            .await?;
        Ok((row, is_new))
    }

    // ─── Nodes ──────────────────────────────────────────────────────────────

    pub async fn create_node(&self) -> Result<NodeRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO nodes (id, state, deployment_stage, created_at, updated_at)
             VALUES (?, 'creating', 'none', ?, ?)",
        )
        .bind(&id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_node(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("node not found after insert"))
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<NodeRow>> {
        Ok(sqlx::query_as("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_nodes_by_state(&self, state: &str) -> Result<Vec<NodeRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM nodes WHERE state = ? ORDER BY created_at")
                    .bind(state)
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    pub async fn list_unbound_nodes_by_state(&self, state: &str) -> Result<Vec<NodeRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM nodes WHERE state = ? AND binding_user IS NULL ORDER BY created_at",
        )
        .bind(state)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn count_nodes_where(&self, predicate_sql: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM nodes WHERE {predicate_sql}");
        let row: (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(row.0)
    }

    /// Atomically claims an unbound node for `user_id`. Returns `true` if
    /// the claim succeeded (a row was affected), `false` if another caller
    /// already bound the node first. Same shape as the teacher's
    /// `claim_session_for_run` — an UPDATE-returning-affected-rows claim,
    /// never a SELECT-then-UPDATE.
    pub async fn claim_node_for_user(&self, node_id: &str, user_id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE nodes SET binding_user = ?, state = 'active', updated_at = ?
             WHERE id = ? AND binding_user IS NULL",
        )
        .bind(user_id)
        .bind(&now)
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_node_state(&self, id: &str, state: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE nodes SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_deployment_stage(&self, id: &str, stage: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE nodes SET deployment_stage = ?, updated_at = ? WHERE id = ?")
            .bind(stage)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_node_error(&self, id: &str, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE nodes SET state = 'error', last_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_runtime_running(&self, id: &str, running: bool) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE nodes SET runtime_running = ?, updated_at = ? WHERE id = ?")
            .bind(running)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_gateway_token(&self, id: &str, token: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE nodes SET gateway_token = ?, updated_at = ? WHERE id = ?")
            .bind(token)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_host_key_fingerprint(&self, id: &str, fingerprint: &str) -> Result<()> {
        sqlx::query("UPDATE nodes SET host_key_fingerprint = ? WHERE id = ?")
            .bind(fingerprint)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_health_check(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE nodes SET last_health_check = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_node_provisioning_info(
        &self,
        id: &str,
        provider_node_id: &str,
        ip: &str,
        ssh_password: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE nodes SET provider_node_id = ?, ip = ?, ssh_password = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(provider_node_id)
        .bind(ip)
        .bind(ssh_password)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Only valid after `deactivated` and provider-side deletion; the pool
    /// maintainer and sweeper are the only callers.
    pub async fn delete_node(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Startup recovery: finds nodes left in a transient deployment stage
    /// by a crashed process, so they are not silently left looking like
    /// they're still converging. Does not mutate anything itself — the
    /// caller (`main::requeue_stranded_node`) drives each row the rest of
    /// the way to `ready` or `error` through the Lifecycle Controller.
    pub async fn recover_stale_nodes(&self) -> Result<Vec<NodeRow>> {
        let transient_stages = [
            "pool_assigned",
            "configuring_keys",
            "deploying_runtime",
            "installing_agents",
            "configuring_search",
        ];
        let mut recovered = Vec::new();
        for stage in transient_stages {
            let nodes: Vec<NodeRow> = sqlx::query_as(
                "SELECT * FROM nodes WHERE deployment_stage = ? AND state != 'error'",
            )
            .bind(stage)
            .fetch_all(&self.pool)
            .await?;
            recovered.extend(nodes);
        }
        Ok(recovered)
    }

    // ─── User profiles ──────────────────────────────────────────────────────

    pub async fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfileRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM user_profiles WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn ensure_user_profile(&self, user_id: &str) -> Result<UserProfileRow> {
        if let Some(existing) = self.get_user_profile(user_id).await? {
            return Ok(existing);
        }
        sqlx::query("INSERT INTO user_profiles (user_id) VALUES (?)")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        self.get_user_profile(user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("profile not found after insert"))
    }

    pub async fn set_profile_model_router_key(
        &self,
        user_id: &str,
        secret: &str,
        handle: &str,
        limit_usd: f64,
    ) -> Result<()> {
        self.ensure_user_profile(user_id).await?;
        sqlx::query(
            "UPDATE user_profiles SET model_router_key = ?, model_router_key_id = ?,
             usage_cache_limit_usd = ?, usage_cache_used_usd = 0 WHERE user_id = ?",
        )
        .bind(secret)
        .bind(handle)
        .bind(limit_usd)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_profile_bot_credentials(
        &self,
        user_id: &str,
        bot_token: &str,
        bot_username: Option<&str>,
    ) -> Result<()> {
        self.ensure_user_profile(user_id).await?;
        sqlx::query("UPDATE user_profiles SET bot_token = ?, bot_username = ? WHERE user_id = ?")
            .bind(bot_token)
            .bind(bot_username)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_profile_selected_model(&self, user_id: &str, model: &str) -> Result<()> {
        self.ensure_user_profile(user_id).await?;
        sqlx::query("UPDATE user_profiles SET selected_model = ? WHERE user_id = ?")
            .bind(model)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_profile_extension_enabled(&self, user_id: &str, enabled: bool) -> Result<()> {
        self.ensure_user_profile(user_id).await?;
        sqlx::query("UPDATE user_profiles SET extension_enabled = ? WHERE user_id = ?")
            .bind(enabled)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Settings (generic key/value) ───────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> NodeStore {
        let dir = tempfile::tempdir().unwrap();
        NodeStore::new(dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_node() {
        let store = test_store().await;
        let node = store.create_node().await.unwrap();
        assert_eq!(node.state, "creating");
        let fetched = store.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, node.id);
    }

    #[tokio::test]
    async fn claim_node_for_user_is_exactly_once() {
        let store = test_store().await;
        let node = store.create_node().await.unwrap();
        store.set_node_state(&node.id, "active").await.unwrap();

        let user_a = store
            .upsert_user("a@example.com", "google", "g-1")
            .await
            .unwrap();
        let user_b = store
            .upsert_user("b@example.com", "google", "g-2")
            .await
            .unwrap();

        let first = store.claim_node_for_user(&node.id, &user_a.id).await.unwrap();
        let second = store.claim_node_for_user(&node.id, &user_b.id).await.unwrap();

        assert!(first);
        assert!(!second);

        let fetched = store.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(fetched.binding_user.as_deref(), Some(user_a.id.as_str()));
    }

    #[tokio::test]
    async fn concurrent_claims_only_one_wins() {
        use std::sync::Arc;
        let store = Arc::new(test_store().await);
        let node = store.create_node().await.unwrap();
        store.set_node_state(&node.id, "active").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let node_id = node.id.clone();
            handles.push(tokio::spawn(async move {
                let user = store
                    .upsert_user(&format!("user{i}@example.com"), "google", &format!("g-{i}"))
                    .await
                    .unwrap();
                store.claim_node_for_user(&node_id, &user.id).await.unwrap()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let store = test_store().await;
        assert!(store.get_setting("foo").await.unwrap().is_none());
        store.set_setting("foo", "bar").await.unwrap();
        assert_eq!(store.get_setting("foo").await.unwrap().as_deref(), Some("bar"));
        store.set_setting("foo", "baz").await.unwrap();
        assert_eq!(store.get_setting("foo").await.unwrap().as_deref(), Some("baz"));
    }
}
