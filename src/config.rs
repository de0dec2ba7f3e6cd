//! Per-slot configuration: connection parameters, publication/slot names,
//! and which message handler to run. A fixed, explicit set of fields —
//! no dynamic reflection, no extra surface.

use clap::Parser;

use crate::errors::{ReplicationError, ReplicationResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl: bool,
}

impl ConnectionParams {
    /// libpq keyword/value connection string.
    pub fn to_conninfo(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} replication=database",
            escape(&self.host),
            self.port,
            escape(&self.database),
            escape(&self.user),
            escape(&self.password),
            if self.ssl { "require" } else { "prefer" },
        )
    }
}

fn escape(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConfig {
    pub id: String,
    pub connection: ConnectionParams,
    pub publication: String,
    pub slot_name: String,
}

impl SlotConfig {
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.id.trim().is_empty() {
            return Err(ReplicationError::config("slot id must not be empty"));
        }
        if self.publication.trim().is_empty() {
            return Err(ReplicationError::config("publication name must not be empty"));
        }
        if self.slot_name.trim().is_empty() {
            return Err(ReplicationError::config("slot name must not be empty"));
        }
        if self.connection.host.trim().is_empty() {
            return Err(ReplicationError::config("connection host must not be empty"));
        }
        if self.connection.database.trim().is_empty() {
            return Err(ReplicationError::config("connection database must not be empty"));
        }
        Ok(())
    }
}

/// CLI surface, built on `clap::Parser`, with every field resolvable from
/// an environment variable so the engine can run unmodified in a container.
#[derive(Parser, Debug)]
#[command(
    name = "wal2xpipe",
    about = "CDC ingestion engine for a PostgreSQL logical replication slot",
    version
)]
pub struct Args {
    #[arg(long, env = "SLOT_ID")]
    pub id: String,

    #[arg(long, env = "PGHOST", default_value = "localhost")]
    pub host: String,

    #[arg(long, env = "PGPORT", default_value_t = 5432)]
    pub port: u16,

    #[arg(long, env = "PGDATABASE")]
    pub database: String,

    #[arg(long, env = "PGUSER", default_value = "postgres")]
    pub user: String,

    #[arg(long, env = "PGPASSWORD", default_value = "")]
    pub password: String,

    #[arg(long, env = "PGSSLMODE")]
    pub ssl: bool,

    #[arg(long, env = "PUBLICATION_NAME", default_value = "pub")]
    pub publication: String,

    #[arg(long, env = "SLOT_NAME", default_value = "sub")]
    pub slot_name: String,
}

impl From<Args> for SlotConfig {
    fn from(args: Args) -> Self {
        SlotConfig {
            id: args.id,
            connection: ConnectionParams {
                host: args.host,
                port: args.port,
                database: args.database,
                user: args.user,
                password: args.password,
                ssl: args.ssl,
            },
            publication: args.publication,
            slot_name: args.slot_name,
        }
    }
}

/// Load configuration from `clap`-parsed CLI args / environment variables,
/// validating before returning.
pub fn load_config_from_args(args: Args) -> ReplicationResult<SlotConfig> {
    let config = SlotConfig::from(args);
    config.validate()?;
    Ok(config)
}
