//! kubegraph
//!
//! Mirrors the live state of a Kubernetes cluster into a Neo4j property graph:
//! - per-kind watch subscriptions feeding idempotent node upserts
//! - owner, scheduling, selection and usage relationships between resources
//! - multi-instance staleness cleanup keyed by cluster name and instance hash
//! - time-based retention for Event nodes

pub mod handlers;
pub mod metrics;
pub mod neo4j;
pub mod pipeline;
pub mod retention;

use anyhow::{bail, Context, Result};
use handlers::{default_handlers, HandlerContext, OwnerKindRegistry};
use neo4j::{ClusterIdentity, GraphStore, KindCount, Neo4jClient, Neo4jSettings, PropertyMap};
use pipeline::{ClusterSource, EventPipeline, HandlerRegistry, PipelineError, PipelineSettings};
use retention::{RetentionSweeper, SweepReport};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub neo4j: Neo4jYamlConfig,
    pub cluster: ClusterYamlConfig,
    pub sync: SyncYamlConfig,
}

/// Neo4j configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Neo4jYamlConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: usize,
    pub fetch_size: usize,
    pub connect_timeout_secs: u64,
}

impl Default for Neo4jYamlConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".into(),
            user: "neo4j".into(),
            password: "kubegraph".into(),
            database: "neo4j".into(),
            max_connections: 16,
            fetch_size: 200,
            connect_timeout_secs: 10,
        }
    }
}

/// Cluster identity section
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ClusterYamlConfig {
    /// Logical cluster name shared by every instance mirroring the cluster.
    pub name: String,
    /// Per-process identity; generated when absent.
    pub instance_hash: Option<String>,
}

/// Synchronization and retention section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncYamlConfig {
    pub sync_timeout_secs: u64,
    pub liveness_interval_secs: u64,
    /// Event node retention; zero or negative disables event ingestion.
    pub event_retention_days: i64,
    pub ttl_sweep_interval_secs: u64,
    /// Concurrent handler lanes per kind; one object always stays on one lane.
    pub workers_per_kind: usize,
}

impl Default for SyncYamlConfig {
    fn default() -> Self {
        Self {
            sync_timeout_secs: 300,
            liveness_interval_secs: 30,
            event_retention_days: 7,
            ttl_sweep_interval_secs: 3600,
            workers_per_kind: 8,
        }
    }
}

// ============================================================================
// Resolved configuration
// ============================================================================

/// Application configuration (YAML + env var overrides)
#[derive(Debug, Clone)]
pub struct Config {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub neo4j_database: String,
    pub neo4j_max_connections: usize,
    pub neo4j_fetch_size: usize,
    pub neo4j_connect_timeout: Duration,
    pub cluster_name: String,
    pub instance_hash: String,
    /// True when neither `INSTANCE_HASH` nor `cluster.instance_hash` was set
    /// and this process made up its own hash.
    pub instance_hash_generated: bool,
    pub sync_timeout: Duration,
    pub liveness_interval: Duration,
    pub event_retention_days: i64,
    pub ttl_sweep_interval: Duration,
    pub workers_per_kind: usize,
}

/// Upper bound on `event_retention_days` (one century).
const MAX_EVENT_RETENTION_DAYS: i64 = 36_500;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Config {
    /// Load configuration with priority: env var > YAML file > default.
    ///
    /// An explicitly named file must be readable; the default `config.yaml`
    /// is optional.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let yaml = Self::load_yaml(yaml_path)?;

        let cluster_name = std::env::var("CLUSTER_NAME").unwrap_or(yaml.cluster.name);
        if cluster_name.trim().is_empty() {
            bail!("cluster name is not configured (set CLUSTER_NAME or cluster.name)");
        }
        let configured_hash = std::env::var("INSTANCE_HASH")
            .ok()
            .or(yaml.cluster.instance_hash)
            .filter(|h| !h.is_empty());
        let instance_hash_generated = configured_hash.is_none();
        let instance_hash =
            configured_hash.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        Ok(Self {
            neo4j_uri: std::env::var("NEO4J_URI").unwrap_or(yaml.neo4j.uri),
            neo4j_user: std::env::var("NEO4J_USER").unwrap_or(yaml.neo4j.user),
            neo4j_password: std::env::var("NEO4J_PASSWORD").unwrap_or(yaml.neo4j.password),
            neo4j_database: std::env::var("NEO4J_DATABASE").unwrap_or(yaml.neo4j.database),
            neo4j_max_connections: env_parse("NEO4J_MAX_CONNECTIONS")
                .unwrap_or(yaml.neo4j.max_connections),
            neo4j_fetch_size: yaml.neo4j.fetch_size,
            neo4j_connect_timeout: Duration::from_secs(yaml.neo4j.connect_timeout_secs),
            cluster_name,
            instance_hash,
            instance_hash_generated,
            sync_timeout: Duration::from_secs(
                env_parse("SYNC_TIMEOUT_SECS")
                    .unwrap_or(yaml.sync.sync_timeout_secs)
                    .max(1),
            ),
            liveness_interval: Duration::from_secs(
                env_parse("LIVENESS_INTERVAL_SECS")
                    .unwrap_or(yaml.sync.liveness_interval_secs)
                    .max(1),
            ),
            event_retention_days: env_parse("EVENT_RETENTION_DAYS")
                .unwrap_or(yaml.sync.event_retention_days)
                .min(MAX_EVENT_RETENTION_DAYS),
            ttl_sweep_interval: Duration::from_secs(yaml.sync.ttl_sweep_interval_secs.max(1)),
            workers_per_kind: yaml.sync.workers_per_kind.max(1),
        })
    }

    fn load_yaml(yaml_path: Option<&Path>) -> Result<YamlConfig> {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    Ok(config)
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Ok(YamlConfig::default())
                }
            },
            Err(e) if yaml_path.is_some() => {
                Err(e).with_context(|| format!("Failed to read config file {}", path.display()))
            }
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                Ok(YamlConfig::default())
            }
        }
    }

    pub fn identity(&self) -> ClusterIdentity {
        ClusterIdentity::new(&self.cluster_name, &self.instance_hash)
    }

    /// Fail unless the instance hash names a running synchronizer, i.e. it
    /// was configured rather than generated by this process.
    pub fn require_configured_instance(&self) -> Result<()> {
        if self.instance_hash_generated {
            bail!(
                "instance hash is not configured; set INSTANCE_HASH (or cluster.instance_hash) \
                 to the hash of the running synchronizer"
            );
        }
        Ok(())
    }

    pub fn neo4j_settings(&self) -> Neo4jSettings {
        Neo4jSettings {
            uri: self.neo4j_uri.clone(),
            user: self.neo4j_user.clone(),
            password: self.neo4j_password.clone(),
            database: self.neo4j_database.clone(),
            max_connections: self.neo4j_max_connections,
            fetch_size: self.neo4j_fetch_size,
            connect_timeout: self.neo4j_connect_timeout,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            sync_timeout: self.sync_timeout,
            liveness_interval: self.liveness_interval,
            workers_per_kind: self.workers_per_kind,
        }
    }
}

// ============================================================================
// Application state
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn GraphStore>,
    pub registry: Arc<HandlerRegistry>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Connect to Neo4j and build the handler set for this instance.
    pub async fn new(config: Config) -> Result<Self> {
        let client = Neo4jClient::connect(&config.neo4j_settings()).await?;
        let registry = Self::build_registry(&config)?;

        let mut labels = registry.kinds();
        labels.push(neo4j::CLUSTER_LABEL.to_string());
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        client.ensure_constraints(&labels).await?;

        Ok(Self::with_store(Arc::new(client), registry, config))
    }

    pub fn with_store(store: Arc<dyn GraphStore>, registry: Arc<HandlerRegistry>, config: Config) -> Self {
        Self {
            store,
            registry,
            config: Arc::new(config),
        }
    }

    /// One owner registry and handler list per process.
    pub fn build_registry(config: &Config) -> Result<Arc<HandlerRegistry>> {
        let ctx = HandlerContext::new(config.identity(), Arc::new(OwnerKindRegistry::new()));
        let handlers = default_handlers(&ctx, config.event_retention_days)
            .context("Failed to register resource handlers")?;
        Ok(Arc::new(HandlerRegistry::new(handlers)))
    }

    pub fn sweeper(&self) -> RetentionSweeper {
        RetentionSweeper::new(
            self.store.clone(),
            self.config.identity(),
            self.config.event_retention_days,
            self.config.ttl_sweep_interval,
        )
    }

    /// Write this instance's `Cluster` node. Retried, since a missing
    /// cluster node would leave this instance's resources unattributed.
    pub async fn register_cluster(&self) -> Result<()> {
        let identity = self.config.identity();
        let mut props = PropertyMap::new();
        props.insert(neo4j::UID.into(), identity.cluster_uid().into());
        props.insert(neo4j::NAME.into(), identity.cluster_name.clone().into());
        props.insert(neo4j::CLUSTER_NAME.into(), identity.cluster_name.clone().into());
        props.insert(neo4j::INSTANCE_HASH.into(), identity.instance_hash.clone().into());
        props.insert(
            "startedAt".into(),
            neo4j::format_timestamp(chrono::Utc::now()).into(),
        );
        self.store
            .upsert_node_with_transaction(&[neo4j::CLUSTER_LABEL], &props, neo4j::UID)
            .await
            .context("Failed to register cluster node")
    }

    /// Run the synchronizer until `cancel` fires.
    ///
    /// Startup order: cluster node, watch subscriptions, initial sync,
    /// instance cleanup; then the TTL sweep and liveness ticker run
    /// alongside the watch tasks.
    pub async fn run(&self, source: Arc<dyn ClusterSource>, cancel: CancellationToken) -> Result<()> {
        let identity = self.config.identity();
        tracing::info!(
            cluster = %identity.cluster_name,
            instance = %identity.instance_hash,
            kinds = self.registry.handlers().len(),
            "Starting synchronizer"
        );
        self.register_cluster().await?;

        let pipeline = Arc::new(EventPipeline::new(
            self.registry.clone(),
            source,
            self.store.clone(),
            self.config.pipeline_settings(),
        ));
        let mut tasks = match pipeline.start(&cancel).await {
            Ok(tasks) => tasks,
            Err(PipelineError::Cancelled) => {
                tracing::info!("Shutdown requested during initial sync");
                return Ok(());
            }
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };

        let sweeper = Arc::new(self.sweeper());
        if let Err(e) = sweeper.sweep_stale_instances(&self.registry.kinds()).await {
            tracing::warn!(error = %e, "Instance cleanup failed");
        }

        tasks.push(tokio::spawn({
            let sweeper = sweeper.clone();
            let cancel = cancel.clone();
            async move { sweeper.run_ttl(cancel).await }
        }));
        tasks.push(tokio::spawn({
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            async move { pipeline.run_liveness(cancel).await }
        }));

        cancel.cancelled().await;
        tracing::info!("Shutting down");
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        Ok(())
    }

    /// One-shot instance cleanup across every handled kind.
    ///
    /// Everything not written by the configured instance is removed, so a
    /// generated hash is refused.
    pub async fn cleanup(&self) -> Result<SweepReport> {
        self.config.require_configured_instance()?;
        self.sweeper()
            .sweep_stale_instances(&self.registry.kinds())
            .await
    }

    /// One-shot TTL sweep.
    pub async fn prune_events(&self) -> Result<u64> {
        self.sweeper().prune_events().await
    }

    /// Node counts per label for this instance.
    pub async fn counts(&self) -> Result<Vec<KindCount>> {
        self.config.require_configured_instance()?;
        let identity = self.config.identity();
        self.store
            .count_nodes_by_kind(&identity.cluster_name, &identity.instance_hash)
            .await
    }
}
