//! Relation cache: maps a table OID to its decoded column list, augmented
//! with primary-key flags fetched from `pg_index` on first sight.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::connection::PgConnection;
use crate::errors::{ReplicationError, ReplicationResult};
use crate::utils::Oid;

/// Resolves a relation's true primary-key column names, decoupling the
/// assembler from a live catalog connection so it can be driven by a fake
/// in tests. `PgConnection` is the production implementation, backed by
/// a `pg_index` lookup over a pooled catalog connection.
pub trait PrimaryKeyResolver {
    fn primary_key_columns(&self, schema: &str, table: &str) -> ReplicationResult<Vec<String>>;
}

impl PrimaryKeyResolver for PgConnection {
    fn primary_key_columns(&self, schema: &str, table: &str) -> ReplicationResult<Vec<String>> {
        fetch_primary_key_columns(self, schema, table)
    }
}

/// One column of a decoded `Relation` message.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    /// The decoder's own "this is part of the key" flag. Ignored for PK
    /// purposes when replica identity is FULL (every column gets it then).
    pub decoder_flags_pk: bool,
    pub is_pk: bool,
}

/// A relation (table) as known to the session: schema-qualified name plus
/// its ordered column list.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationInfo {
    pub oid: Oid,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<ColumnInfo>,
}

impl RelationInfo {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Replica identity byte `'f'` (FULL) per the Relation message.
    pub fn is_replica_identity_full(&self) -> bool {
        self.replica_identity == b'f'
    }

    pub fn pk_column_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_pk)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Session-local cache of relation metadata, reset on reconnect.
#[derive(Default)]
pub struct RelationCache {
    relations: HashMap<Oid, RelationInfo>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, oid: Oid) -> Option<&RelationInfo> {
        self.relations.get(&oid)
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.relations.contains_key(&oid)
    }

    /// Insert a freshly decoded `Relation` message, overwriting any prior
    /// entry for the same OID, and resolve primary-key columns via `resolver`.
    pub fn insert_and_resolve_pk(
        &mut self,
        mut relation: RelationInfo,
        resolver: &dyn PrimaryKeyResolver,
    ) -> ReplicationResult<()> {
        if relation.is_replica_identity_full() {
            debug!(
                relation = %relation.qualified_name(),
                "replica identity FULL: every column is a key candidate, still resolving true pk via catalog"
            );
        }

        let pk_names = resolver.primary_key_columns(&relation.namespace, &relation.name)?;
        for column in relation.columns.iter_mut() {
            column.is_pk = pk_names.iter().any(|n| n == &column.name);
        }

        debug!(
            oid = relation.oid,
            relation = %relation.qualified_name(),
            pk = ?pk_names,
            "cached relation"
        );
        self.relations.insert(relation.oid, relation);
        Ok(())
    }
}

fn fetch_primary_key_columns(
    catalog: &PgConnection,
    schema: &str,
    table: &str,
) -> ReplicationResult<Vec<String>> {
    let qualified = format!("{schema}.{table}");
    let query = format!(
        "SELECT a.attname FROM pg_index i \
         JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
         WHERE i.indrelid = '{}'::regclass AND i.indisprimary",
        escape_literal(&qualified)
    );
    let result = catalog.execute(&query).map_err(|e| {
        ReplicationError::catalog(format!("pg_index lookup for {qualified} failed: {e}"))
    })?;
    let names = result
        .rows()
        .iter()
        .filter_map(|row| row.first().cloned())
        .collect::<Vec<_>>();
    if names.is_empty() {
        warn!(relation = %qualified, "no primary key columns found");
    }
    Ok(names)
}

/// `'` and `\` are the only characters that matter inside a single-quoted
/// regclass literal here; table/schema names from `Relation` are
/// Postgres-validated identifiers, not arbitrary input.
fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            type_oid: 23,
            type_modifier: -1,
            decoder_flags_pk: false,
            is_pk: false,
        }
    }

    #[test]
    fn qualified_name_joins_namespace_and_name() {
        let r = RelationInfo {
            oid: 1,
            namespace: "public".into(),
            name: "users".into(),
            replica_identity: b'd',
            columns: vec![col("id"), col("name")],
        };
        assert_eq!(r.qualified_name(), "public.users");
        assert!(!r.is_replica_identity_full());
    }

    struct FakeResolver(Vec<String>);

    impl PrimaryKeyResolver for FakeResolver {
        fn primary_key_columns(&self, _schema: &str, _table: &str) -> ReplicationResult<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn insert_and_resolve_pk_marks_only_resolved_columns() {
        let mut cache = RelationCache::new();
        let relation = RelationInfo {
            oid: 1,
            namespace: "public".into(),
            name: "users".into(),
            replica_identity: b'd',
            columns: vec![col("id"), col("name")],
        };
        cache
            .insert_and_resolve_pk(relation, &FakeResolver(vec!["id".to_string()]))
            .unwrap();
        let cached = cache.get(1).unwrap();
        assert!(cached.columns[0].is_pk);
        assert!(!cached.columns[1].is_pk);
    }
}
