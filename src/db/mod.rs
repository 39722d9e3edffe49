// Database Module
// Backend engines, the engine factory and the connection registry

pub mod engines;
pub mod factory;
pub mod params;
pub mod registry;
pub mod statement;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use engines::{MySqlEngine, OracleEngine, PoolSettings, PostgresEngine};
pub use factory::{engine_constructor, EngineConstructor, EngineFactory};
pub use registry::{spawn_idle_sweeper, ConnectionHandle, ConnectionRegistry, ConnectionSummary};
pub use traits::{
    CellValue, ColumnDetail, DatabaseEngine, DatabaseError, DatabaseInfo, ExecutionPlan,
    QueryParams, QueryResult, Row, SchemaList, TableDetail, TableList,
};
