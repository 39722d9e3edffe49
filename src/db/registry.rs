// Connection Registry
// Owns live engines by connection id and dispatches operations to them

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::SourceDescriptor;
use crate::db::factory::EngineFactory;
use crate::db::traits::{
    DatabaseEngine, DatabaseError, DatabaseInfo, ExecutionPlan, QueryParams, QueryResult,
    SchemaList, TableDetail, TableList,
};

/// One live connection: a source bound to its engine
pub struct ConnectionRecord {
    pub id: String,
    pub source: SourceDescriptor,
    pub engine: Arc<dyn DatabaseEngine>,
    pub created_at: DateTime<Utc>,
    last_used_micros: AtomicI64,
    active: AtomicBool,
}

pub type ConnectionHandle = Arc<ConnectionRecord>;

impl ConnectionRecord {
    fn new(id: String, source: SourceDescriptor, engine: Arc<dyn DatabaseEngine>) -> Self {
        let now = Utc::now();
        Self {
            id,
            source,
            engine,
            created_at: now,
            last_used_micros: AtomicI64::new(now.timestamp_micros()),
            active: AtomicBool::new(true),
        }
    }

    fn touch(&self) {
        self.last_used_micros
            .fetch_max(Utc::now().timestamp_micros(), Ordering::Relaxed);
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.last_used_micros.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    async fn retire(&self) {
        self.active.store(false, Ordering::Release);
        self.engine.dispose().await;
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            connection_id: self.id.clone(),
            source_name: self.source.name.clone(),
            database_type: self.source.kind.as_str().to_string(),
            host: self.source.host.clone(),
            port: self.source.port,
            database: self.source.database.clone(),
            user: self.source.user.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at(),
            is_active: self.is_active(),
        }
    }
}

/// Serializable view of a connection for `list_connections`
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub connection_id: String,
    pub source_name: String,
    pub database_type: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Registry of live connections keyed by opaque id
pub struct ConnectionRegistry {
    factory: Arc<EngineFactory>,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<EngineFactory>) -> Self {
        Self {
            factory,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> &EngineFactory {
        &self.factory
    }

    /// Build an engine for `source`, verify it can reach the database and register it.
    /// Returns the new connection id. Nothing is registered on failure.
    pub async fn create_connection(&self, source: SourceDescriptor) -> Result<String, DatabaseError> {
        let engine = self
            .factory
            .create_engine(source.kind.as_str(), source.clone())?;

        if !engine.test_connection().await {
            engine.dispose().await;
            error!(source = %source.name, address = %source.address(), "Connection test failed");
            return Err(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to {} database '{}' at {}",
                source.kind.display_name(),
                source.name,
                source.address()
            )));
        }

        let mut connections = self.connections.write().await;
        let mut id = Uuid::new_v4().to_string();
        while connections.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }

        info!(
            connection_id = %id,
            source = %source.name,
            kind = %source.kind.as_str(),
            "Connection created"
        );
        connections.insert(
            id.clone(),
            Arc::new(ConnectionRecord::new(id.clone(), source, engine)),
        );
        Ok(id)
    }

    /// Look up an active connection and mark it as used
    pub async fn get_connection(&self, id: &str) -> Option<ConnectionHandle> {
        let connections = self.connections.read().await;
        let record = connections.get(id).filter(|r| r.is_active())?;
        record.touch();
        Some(Arc::clone(record))
    }

    /// Remove a connection and dispose its pool. Returns false if the id is unknown.
    pub async fn close_connection(&self, id: &str) -> bool {
        let removed = self.connections.write().await.remove(id);

        match removed {
            Some(record) => {
                record.retire().await;
                info!(connection_id = %id, source = %record.source.name, "Connection closed");
                true
            }
            None => {
                debug!(connection_id = %id, "Close requested for unknown connection");
                false
            }
        }
    }

    /// Close every connection, returning how many were closed
    pub async fn close_all(&self) -> usize {
        let drained: Vec<ConnectionHandle> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, record)| record).collect()
        };

        join_all(drained.iter().map(|record| record.retire())).await;

        if !drained.is_empty() {
            info!(count = drained.len(), "Closed all connections");
        }
        drained.len()
    }

    /// Active connections, oldest first
    pub async fn list_connections(&self) -> Vec<ConnectionSummary> {
        let connections = self.connections.read().await;
        let mut summaries: Vec<ConnectionSummary> = connections
            .values()
            .filter(|r| r.is_active())
            .map(|r| r.summary())
            .collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.connection_id.cmp(&b.connection_id))
        });
        summaries
    }

    /// Evict connections idle for at least `max_age_hours`. Returns the number evicted.
    pub async fn cleanup_inactive(&self, max_age_hours: u64) -> usize {
        let cutoff = i64::try_from(max_age_hours)
            .ok()
            .and_then(TimeDelta::try_hours)
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let cutoff = cutoff.timestamp_micros();

        let evicted: Vec<ConnectionHandle> = {
            let mut connections = self.connections.write().await;
            let stale: Vec<String> = connections
                .iter()
                .filter(|(_, r)| r.last_used_micros.load(Ordering::Relaxed) <= cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            stale.iter().filter_map(|id| connections.remove(id)).collect()
        };

        join_all(evicted.iter().map(|record| record.retire())).await;
        for record in &evicted {
            info!(
                connection_id = %record.id,
                source = %record.source.name,
                "Cleaned up inactive connection"
            );
        }
        evicted.len()
    }

    async fn engine_for(&self, id: &str) -> Result<Arc<dyn DatabaseEngine>, DatabaseError> {
        self.get_connection(id)
            .await
            .map(|record| Arc::clone(&record.engine))
            .ok_or_else(|| DatabaseError::ConnectionNotFound(id.to_string()))
    }

    pub async fn execute_sql(
        &self,
        id: &str,
        sql: &str,
        params: Option<&QueryParams>,
    ) -> Result<QueryResult, DatabaseError> {
        let engine = self.engine_for(id).await?;
        debug!(connection_id = %id, sql = %sql, "Executing SQL");
        engine
            .execute_query(sql, params)
            .await
            .inspect_err(|e| error!(connection_id = %id, "Query failed: {}", e))
    }

    pub async fn list_tables(&self, id: &str) -> Result<TableList, DatabaseError> {
        self.engine_for(id).await?.list_tables().await
    }

    pub async fn get_database_info(&self, id: &str) -> Result<DatabaseInfo, DatabaseError> {
        self.engine_for(id).await?.get_database_info().await
    }

    pub async fn explain_plan(&self, id: &str, sql: &str) -> Result<ExecutionPlan, DatabaseError> {
        let engine = self.engine_for(id).await?;
        debug!(connection_id = %id, sql = %sql, "Explaining SQL");
        engine
            .explain_plan(sql)
            .await
            .inspect_err(|e| error!(connection_id = %id, "Plan retrieval failed: {}", e))
    }

    pub async fn list_schemas(&self, id: &str) -> Result<SchemaList, DatabaseError> {
        self.engine_for(id).await?.list_schemas().await
    }

    pub async fn describe_table(&self, id: &str, table: &str) -> Result<TableDetail, DatabaseError> {
        self.engine_for(id).await?.describe_table(table).await
    }
}

/// Periodically evict idle connections until the task is aborted
pub fn spawn_idle_sweeper(
    registry: Arc<ConnectionRegistry>,
    every: Duration,
    max_age_hours: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = registry.cleanup_inactive(max_age_hours).await;
            if evicted > 0 {
                info!(evicted, "Idle sweep removed connections");
            } else {
                debug!("Idle sweep found nothing to remove");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{fake_factory, fake_source};
    use std::collections::HashSet;

    fn registry(healthy: bool) -> (Arc<ConnectionRegistry>, Arc<std::sync::atomic::AtomicUsize>) {
        let (factory, disposals) = fake_factory(healthy);
        (Arc::new(ConnectionRegistry::new(Arc::new(factory))), disposals)
    }

    #[tokio::test]
    async fn test_same_source_yields_distinct_ids() {
        let (registry, _) = registry(true);
        let a = registry.create_connection(fake_source("shop")).await.unwrap();
        let b = registry.create_connection(fake_source("shop")).await.unwrap();

        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
        assert!(registry.get_connection(&a).await.is_some());
        assert!(registry.get_connection(&b).await.is_some());
        assert_eq!(registry.list_connections().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_connection_leaves_no_trace() {
        let (registry, disposals) = registry(false);
        let result = registry.create_connection(fake_source("shop")).await;

        match result {
            Err(DatabaseError::ConnectionFailed(msg)) => assert!(msg.contains("shop")),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(registry.list_connections().await.is_empty());
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_kind_is_rejected() {
        let registry = ConnectionRegistry::new(Arc::new(EngineFactory::new()));
        let result = registry.create_connection(fake_source("shop")).await;
        assert!(matches!(result, Err(DatabaseError::UnsupportedKind(_))));
    }

    #[tokio::test]
    async fn test_close_connection() {
        let (registry, disposals) = registry(true);
        let id = registry.create_connection(fake_source("shop")).await.unwrap();

        assert!(!registry.close_connection("missing").await);
        assert!(registry.close_connection(&id).await);
        assert!(registry.get_connection(&id).await.is_none());
        assert!(!registry.close_connection(&id).await);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_operations_on_closed_id_are_not_found() {
        let (registry, _) = registry(true);
        let id = registry.create_connection(fake_source("shop")).await.unwrap();
        registry.close_connection(&id).await;

        let err = registry.execute_sql(&id, "SELECT 1", None).await.unwrap_err();
        assert_eq!(err.to_string(), format!("Connection {} not found or inactive", id));
        assert!(matches!(
            registry.list_tables(&id).await,
            Err(DatabaseError::ConnectionNotFound(_))
        ));
        assert!(matches!(
            registry.explain_plan(&id, "SELECT 1").await,
            Err(DatabaseError::ConnectionNotFound(_))
        ));
        assert!(matches!(
            registry.describe_table(&id, "orders").await,
            Err(DatabaseError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delegates_to_engine() {
        let (registry, _) = registry(true);
        let id = registry.create_connection(fake_source("shop")).await.unwrap();

        let tables = registry.list_tables(&id).await.unwrap();
        assert_eq!(tables.tables, vec!["customers", "orders"]);
        assert_eq!(tables.count, 2);

        let info = registry.get_database_info(&id).await.unwrap();
        assert_eq!(info.version, "FakeDB 1.0");
        assert_eq!(info.size, "42 MB");

        let schemas = registry.list_schemas(&id).await.unwrap();
        assert_eq!(schemas.count, 2);

        let detail = registry.describe_table(&id, "orders").await.unwrap();
        assert_eq!(detail.columns.len(), 1);
        assert!(!detail.columns[0].is_nullable);

        match registry.execute_sql(&id, "DELETE FROM orders", None).await.unwrap() {
            QueryResult::Affected { row_count, .. } => assert_eq!(row_count, 3),
            other => panic!("unexpected result: {:?}", other),
        }

        let plan = registry.explain_plan(&id, "SELECT * FROM orders").await.unwrap();
        assert_eq!(plan.plan_type, "FAKE");
        assert!(!plan.advice.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_refreshes_last_used() {
        let (registry, _) = registry(true);
        let id = registry.create_connection(fake_source("shop")).await.unwrap();
        let before = registry.get_connection(&id).await.unwrap().last_used_at();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let after = registry.get_connection(&id).await.unwrap().last_used_at();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_cleanup_inactive() {
        let (registry, disposals) = registry(true);
        for _ in 0..3 {
            registry.create_connection(fake_source("shop")).await.unwrap();
        }

        assert_eq!(registry.cleanup_inactive(u64::MAX).await, 0);
        assert_eq!(registry.cleanup_inactive(24).await, 0);
        assert_eq!(registry.list_connections().await.len(), 3);

        assert_eq!(registry.cleanup_inactive(0).await, 3);
        assert!(registry.list_connections().await.is_empty());
        assert_eq!(disposals.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_close_all() {
        let (registry, disposals) = registry(true);
        registry.create_connection(fake_source("a")).await.unwrap();
        registry.create_connection(fake_source("b")).await.unwrap();

        assert_eq!(registry.close_all().await, 2);
        assert_eq!(registry.close_all().await, 0);
        assert_eq!(disposals.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_summary_hides_password() {
        let (registry, _) = registry(true);
        registry.create_connection(fake_source("shop")).await.unwrap();

        let summaries = registry.list_connections().await;
        let json = serde_json::to_value(&summaries[0]).unwrap();
        assert_eq!(json["source_name"], "shop");
        assert_eq!(json["database_type"], "postgres");
        assert_eq!(json["port"], 5432);
        assert_eq!(json["is_active"], true);
        assert!(!json.to_string().contains("secret"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_and_cleanup() {
        let (registry, _) = registry(true);

        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                if i % 8 == 0 {
                    registry.cleanup_inactive(0).await;
                    None
                } else {
                    registry.create_connection(fake_source("shop")).await.ok()
                }
            }));
        }

        let mut created = HashSet::new();
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                assert!(created.insert(id));
            }
        }

        for summary in registry.list_connections().await {
            assert!(created.contains(&summary.connection_id));
            assert!(registry.get_connection(&summary.connection_id).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_idle_sweeper_evicts_on_interval() {
        let (registry, _) = registry(true);
        registry.create_connection(fake_source("shop")).await.unwrap();

        let handle = spawn_idle_sweeper(Arc::clone(&registry), Duration::from_millis(20), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(registry.list_connections().await.is_empty());
        handle.abort();
    }
}
