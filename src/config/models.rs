// Source Descriptor Models
// Validated, immutable descriptions of the databases the server can reach

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::ConfigError;

/// Supported database kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgres,
    Mysql,
    Oracle,
}

impl DatabaseKind {
    /// Canonical lowercase identifier, also the factory lookup key
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "postgres",
            DatabaseKind::Mysql => "mysql",
            DatabaseKind::Oracle => "oracle",
        }
    }

    /// Display name for logs and tool output
    pub fn display_name(&self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "PostgreSQL",
            DatabaseKind::Mysql => "MySQL",
            DatabaseKind::Oracle => "Oracle",
        }
    }

    /// Default port for the database kind
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseKind::Postgres => 5432,
            DatabaseKind::Mysql => 3306,
            DatabaseKind::Oracle => 1521,
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DatabaseKind::Postgres),
            "mysql" => Ok(DatabaseKind::Mysql),
            "oracle" => Ok(DatabaseKind::Oracle),
            other => Err(ConfigError::UnsupportedKind(other.to_string())),
        }
    }
}

/// Dialect-specific extras, one variant per database kind
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "dialect", rename_all = "lowercase")]
pub enum DialectOptions {
    Postgres {
        schema: Option<String>,
        sslmode: Option<String>,
    },
    Mysql {
        charset: Option<String>,
        sslmode: Option<String>,
    },
    Oracle {
        service_name: Option<String>,
        sid: Option<String>,
        schema: Option<String>,
    },
}

impl DialectOptions {
    /// Empty extras for the given kind
    pub fn empty(kind: DatabaseKind) -> Self {
        match kind {
            DatabaseKind::Postgres => DialectOptions::Postgres {
                schema: None,
                sslmode: None,
            },
            DatabaseKind::Mysql => DialectOptions::Mysql {
                charset: None,
                sslmode: None,
            },
            DatabaseKind::Oracle => DialectOptions::Oracle {
                service_name: None,
                sid: None,
                schema: None,
            },
        }
    }

    pub fn kind(&self) -> DatabaseKind {
        match self {
            DialectOptions::Postgres { .. } => DatabaseKind::Postgres,
            DialectOptions::Mysql { .. } => DatabaseKind::Mysql,
            DialectOptions::Oracle { .. } => DatabaseKind::Oracle,
        }
    }
}

/// A validated database source
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub name: String,
    pub kind: DatabaseKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Per-statement timeout in seconds
    pub timeout: Option<u64>,
    #[serde(flatten)]
    pub dialect: DialectOptions,
}

impl SourceDescriptor {
    pub fn new(
        name: impl Into<String>,
        kind: DatabaseKind,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: password.into(),
            timeout: None,
            dialect: DialectOptions::empty(kind),
        }
    }

    /// Replace the dialect extras. The variant must match `kind`.
    pub fn with_dialect(mut self, dialect: DialectOptions) -> Result<Self, ConfigError> {
        if dialect.kind() != self.kind {
            return Err(ConfigError::InvalidSource {
                name: self.name,
                reason: format!(
                    "{} options given for a {} source",
                    dialect.kind(),
                    self.kind
                ),
            });
        }
        self.dialect = dialect;
        Ok(self)
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Configured schema (Postgres search path, Oracle owner)
    pub fn schema(&self) -> Option<&str> {
        match &self.dialect {
            DialectOptions::Postgres { schema, .. } | DialectOptions::Oracle { schema, .. } => {
                schema.as_deref()
            }
            DialectOptions::Mysql { .. } => None,
        }
    }

    pub fn sslmode(&self) -> Option<&str> {
        match &self.dialect {
            DialectOptions::Postgres { sslmode, .. } | DialectOptions::Mysql { sslmode, .. } => {
                sslmode.as_deref()
            }
            DialectOptions::Oracle { .. } => None,
        }
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| *t > 0).map(Duration::from_secs)
    }

    /// `host:port`, used in log lines and error messages
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A source entry as it appears in `tools.yaml`, before validation
#[derive(Debug, Clone, Deserialize)]
pub struct RawSource {
    pub kind: String,
    pub host: String,
    pub port: i64,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub sslmode: Option<String>,
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl RawSource {
    /// Validate the entry and fold the flat extras into the kind's dialect options.
    /// Returns the descriptor plus the names of extras that do not apply to the kind.
    pub fn into_descriptor(
        self,
        name: &str,
    ) -> Result<(SourceDescriptor, Vec<&'static str>), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSource {
            name: name.to_string(),
            reason,
        };

        let kind = DatabaseKind::from_str(&self.kind).map_err(|_| {
            invalid(format!(
                "database kind must be one of postgres, mysql, oracle (got '{}')",
                self.kind
            ))
        })?;

        let port = u16::try_from(self.port)
            .ok()
            .filter(|p| *p >= 1)
            .ok_or_else(|| invalid(format!("port must be between 1 and 65535 (got {})", self.port)))?;

        if self.host.trim().is_empty() {
            return Err(invalid("host is required".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(invalid("user is required".to_string()));
        }

        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let mut ignored = Vec::new();

        let dialect = match kind {
            DatabaseKind::Postgres => {
                if self.charset.is_some() {
                    ignored.push("charset");
                }
                if self.service_name.is_some() {
                    ignored.push("service_name");
                }
                if self.sid.is_some() {
                    ignored.push("sid");
                }
                DialectOptions::Postgres {
                    schema: non_empty(self.schema),
                    sslmode: non_empty(self.sslmode),
                }
            }
            DatabaseKind::Mysql => {
                if self.schema.is_some() {
                    ignored.push("schema");
                }
                if self.service_name.is_some() {
                    ignored.push("service_name");
                }
                if self.sid.is_some() {
                    ignored.push("sid");
                }
                DialectOptions::Mysql {
                    charset: non_empty(self.charset),
                    sslmode: non_empty(self.sslmode),
                }
            }
            DatabaseKind::Oracle => {
                if self.sslmode.is_some() {
                    ignored.push("sslmode");
                }
                if self.charset.is_some() {
                    ignored.push("charset");
                }
                DialectOptions::Oracle {
                    service_name: non_empty(self.service_name),
                    sid: non_empty(self.sid),
                    schema: non_empty(self.schema),
                }
            }
        };

        let descriptor = SourceDescriptor {
            name: name.to_string(),
            kind,
            host: self.host,
            port,
            database: self.database,
            user: self.user,
            password: self.password,
            timeout: self.timeout,
            dialect,
        };

        Ok((descriptor, ignored))
    }
}
