// Engine Factory
// Maps database kind names to engine constructors

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::SourceDescriptor;
use crate::db::engines::{MySqlEngine, OracleEngine, PostgresEngine};
use crate::db::traits::{DatabaseEngine, DatabaseError};

/// Builds an engine for a source. Construction never touches the network.
pub type EngineConstructor = Arc<dyn Fn(SourceDescriptor) -> Arc<dyn DatabaseEngine> + Send + Sync>;

/// Wrap a concrete engine constructor, e.g. `engine_constructor(PostgresEngine::new)`
pub fn engine_constructor<E, F>(build: F) -> EngineConstructor
where
    E: DatabaseEngine + 'static,
    F: Fn(SourceDescriptor) -> E + Send + Sync + 'static,
{
    Arc::new(move |source| Arc::new(build(source)) as Arc<dyn DatabaseEngine>)
}

/// Registry of engine constructors keyed by lowercase kind name
pub struct EngineFactory {
    constructors: HashMap<String, EngineConstructor>,
}

impl EngineFactory {
    /// Create a factory with no engines registered
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Create a factory with the built-in PostgreSQL, MySQL and Oracle engines
    pub fn with_default_engines() -> Self {
        let mut factory = Self::new();

        let postgres = engine_constructor(PostgresEngine::new);
        factory.register_engine("postgres", Arc::clone(&postgres));
        factory.register_engine("postgresql", postgres);
        factory.register_engine("mysql", engine_constructor(MySqlEngine::new));
        factory.register_engine("oracle", engine_constructor(OracleEngine::new));

        factory
    }

    /// Register (or replace) the constructor for a kind
    pub fn register_engine(&mut self, kind: &str, constructor: EngineConstructor) {
        let kind = kind.trim().to_ascii_lowercase();
        debug!(kind = %kind, "Registered database engine");
        self.constructors.insert(kind, constructor);
    }

    /// Create an engine for `source` using the constructor registered for `kind`
    pub fn create_engine(
        &self,
        kind: &str,
        source: SourceDescriptor,
    ) -> Result<Arc<dyn DatabaseEngine>, DatabaseError> {
        let key = kind.trim().to_ascii_lowercase();
        let constructor = self.constructors.get(&key).ok_or_else(|| {
            DatabaseError::UnsupportedKind(format!(
                "{} (supported: {})",
                kind,
                self.list_supported_kinds().join(", ")
            ))
        })?;
        Ok(constructor(source))
    }

    pub fn is_supported(&self, kind: &str) -> bool {
        self.constructors
            .contains_key(&kind.trim().to_ascii_lowercase())
    }

    /// Registered kind names, sorted
    pub fn list_supported_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.constructors.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for EngineFactory {
    fn default() -> Self {
        Self::with_default_engines()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseKind;

    fn source(kind: DatabaseKind) -> SourceDescriptor {
        SourceDescriptor::new("src", kind, "localhost", kind.default_port(), "app", "user", "pw")
    }

    #[test]
    fn test_create_engine_is_case_insensitive() {
        let factory = EngineFactory::with_default_engines();

        let pg = factory.create_engine("PostgreSQL", source(DatabaseKind::Postgres)).unwrap();
        assert_eq!(pg.kind(), DatabaseKind::Postgres);

        let pg = factory.create_engine("Postgres", source(DatabaseKind::Postgres)).unwrap();
        assert_eq!(pg.kind(), DatabaseKind::Postgres);

        let my = factory.create_engine("MYSQL", source(DatabaseKind::Mysql)).unwrap();
        assert_eq!(my.kind(), DatabaseKind::Mysql);

        let ora = factory.create_engine("Oracle", source(DatabaseKind::Oracle)).unwrap();
        assert_eq!(ora.kind(), DatabaseKind::Oracle);
        assert_eq!(ora.source().name, "src");
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let factory = EngineFactory::with_default_engines();
        match factory.create_engine("sqlserver", source(DatabaseKind::Postgres)) {
            Err(DatabaseError::UnsupportedKind(msg)) => {
                assert!(msg.contains("sqlserver"));
                assert!(msg.contains("mysql"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn test_supported_kinds() {
        let factory = EngineFactory::with_default_engines();
        assert_eq!(
            factory.list_supported_kinds(),
            vec!["mysql", "oracle", "postgres", "postgresql"]
        );
        assert!(factory.is_supported(" ORACLE "));
        assert!(!factory.is_supported("sqlite"));
        assert!(EngineFactory::new().list_supported_kinds().is_empty());
    }

    #[test]
    fn test_register_engine_extends_factory() {
        let mut factory = EngineFactory::new();
        factory.register_engine("Warehouse", engine_constructor(PostgresEngine::new));
        assert!(factory.is_supported("warehouse"));
        assert!(factory
            .create_engine("WAREHOUSE", source(DatabaseKind::Postgres))
            .is_ok());
    }
}
