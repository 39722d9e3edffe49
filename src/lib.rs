// PostgreSQL, MySQL and Oracle exposed as MCP tools

// Module declarations
pub mod cli;
pub mod config;
pub mod db;
pub mod server;
pub mod tools;
