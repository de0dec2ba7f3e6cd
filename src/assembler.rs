//! Transaction assembler: buffers row changes between `Begin` and `Commit`
//! and emits one ordered, enriched batch per committed transaction.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::casts::{cast, CastValue, PgType};
use crate::errors::{ReplicationError, ReplicationResult};
use crate::lsn::Lsn;
use crate::protocol::{LogicalMessage, TupleData, TupleSlot};
use crate::relation::{PrimaryKeyResolver, RelationCache, RelationInfo};
use crate::utils::Oid;

/// One change inside an assembled transaction, before relation enrichment.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Insert {
        relation_oid: Oid,
        new: TupleData,
    },
    Update {
        relation_oid: Oid,
        old: Option<TupleData>,
        new: TupleData,
    },
    Delete {
        relation_oid: Oid,
        key_or_old: TupleData,
    },
}

impl RowChange {
    pub fn relation_oid(&self) -> Oid {
        match self {
            RowChange::Insert { relation_oid, .. }
            | RowChange::Update { relation_oid, .. }
            | RowChange::Delete { relation_oid, .. } => *relation_oid,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            RowChange::Insert { .. } => "insert",
            RowChange::Update { .. } => "update",
            RowChange::Delete { .. } => "delete",
        }
    }
}

/// A `RowChange` joined to its relation, decoded fields, and dispatch
/// metadata. `relation` is always present by the time this type exists,
/// because the assembler refuses to enrich against a relation it has
/// not cached.
#[derive(Debug, Clone)]
pub struct EnrichedChange {
    pub change: RowChange,
    pub relation: RelationInfo,
    pub commit_lsn: Lsn,
    pub commit_ts: i64,
    pub seq: u64,
    pub trace_id: uuid::Uuid,
    /// Decoded `column_name -> value`, built from whichever tuple carries
    /// data for this change (the `new` tuple for insert/update, the
    /// key-or-old tuple for delete). Unchanged-TOAST columns are absent,
    /// not `Null` — a consumer must distinguish "not sent" from "set to
    /// null" when merging into its own materialized copy.
    pub fields: HashMap<String, CastValue>,
    /// Present only for `Update` under REPLICA IDENTITY FULL.
    pub old_fields: Option<HashMap<String, CastValue>>,
}

/// One committed transaction, ready for the subscription router.
#[derive(Debug, Clone)]
pub struct TransactionFrame {
    pub xid: u32,
    pub commit_lsn: Lsn,
    pub commit_ts: i64,
    pub changes: Vec<EnrichedChange>,
}

enum AssemblerState {
    Idle,
    Open {
        xid: u32,
        begin_lsn: Lsn,
        begin_ts: i64,
        buffered: Vec<RowChange>,
    },
    Fatal,
}

/// Per-session state machine: `Idle -> Open -> Idle`, buffering row changes
/// and emitting one [`TransactionFrame`] per `Commit`.
pub struct Assembler {
    state: AssemblerState,
    relations: RelationCache,
    next_seq: u64,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            state: AssemblerState::Idle,
            relations: RelationCache::new(),
            // Starts at 1, not 0: the persistor uses 0 as its "no chunk
            // advanced the cursor yet" sentinel (store.rs), so a seq of 0
            // must never be a value a real change can carry.
            next_seq: 1,
        }
    }

    /// Feed one decoded logical message. Returns `Some(frame)` exactly when
    /// a `Commit` closes out a transaction.
    pub fn apply(
        &mut self,
        message: LogicalMessage,
        resolver: &dyn PrimaryKeyResolver,
    ) -> ReplicationResult<Option<TransactionFrame>> {
        if matches!(self.state, AssemblerState::Fatal) {
            return Err(ReplicationError::protocol(
                "assembler is in a fatal state from a prior protocol violation",
            ));
        }

        match message {
            LogicalMessage::Relation {
                oid,
                namespace,
                name,
                replica_identity,
                columns,
            } => {
                let relation = RelationInfo {
                    oid,
                    namespace,
                    name,
                    replica_identity,
                    columns,
                };
                self.relations.insert_and_resolve_pk(relation, resolver)?;
                Ok(None)
            }
            LogicalMessage::Begin {
                final_lsn,
                commit_ts,
                xid,
            } => {
                if let AssemblerState::Open { .. } = self.state {
                    self.state = AssemblerState::Fatal;
                    return Err(ReplicationError::protocol(
                        "received Begin while a transaction was already open",
                    ));
                }
                self.state = AssemblerState::Open {
                    xid,
                    begin_lsn: Lsn::from(final_lsn),
                    begin_ts: commit_ts,
                    buffered: Vec::new(),
                };
                Ok(None)
            }
            LogicalMessage::Insert { relation_oid, new } => {
                self.push_change(RowChange::Insert { relation_oid, new })?;
                Ok(None)
            }
            LogicalMessage::Update {
                relation_oid,
                old_kind: _,
                old,
                new,
            } => {
                self.push_change(RowChange::Update {
                    relation_oid,
                    old,
                    new,
                })?;
                Ok(None)
            }
            LogicalMessage::Delete {
                relation_oid,
                key_kind: _,
                key_or_old,
            } => {
                self.push_change(RowChange::Delete {
                    relation_oid,
                    key_or_old,
                })?;
                Ok(None)
            }
            LogicalMessage::Truncate { relation_oids, .. } => {
                info!(relations = ?relation_oids, "truncate received, not dispatched this release");
                Ok(None)
            }
            LogicalMessage::Type { oid, name, .. } => {
                debug!(oid, name, "type message received, decoded only");
                Ok(None)
            }
            LogicalMessage::Origin { name, .. } => {
                debug!(origin = name, "origin message received, decoded only");
                Ok(None)
            }
            LogicalMessage::Unknown(tag) => {
                let reason = ReplicationError::UnknownMessage(format!(
                    "unrecognized logical message tag '{tag}'"
                ));
                warn!(error = %reason, "skipping unknown message, not advancing LSN");
                Ok(None)
            }
            LogicalMessage::Commit {
                flags: _,
                commit_lsn,
                end_lsn: _,
                commit_ts,
            } => self.close_transaction(commit_lsn, commit_ts),
        }
    }

    fn push_change(&mut self, change: RowChange) -> ReplicationResult<()> {
        match &mut self.state {
            AssemblerState::Open { buffered, .. } => {
                buffered.push(change);
                Ok(())
            }
            _ => {
                self.state = AssemblerState::Fatal;
                Err(ReplicationError::protocol(
                    "received a row change outside of an open transaction",
                ))
            }
        }
    }

    fn close_transaction(
        &mut self,
        commit_lsn: u64,
        commit_ts: i64,
    ) -> ReplicationResult<Option<TransactionFrame>> {
        let AssemblerState::Open {
            xid,
            begin_lsn,
            begin_ts,
            buffered,
        } = std::mem::replace(&mut self.state, AssemblerState::Idle)
        else {
            self.state = AssemblerState::Fatal;
            return Err(ReplicationError::protocol(
                "received Commit while no transaction was open",
            ));
        };

        let commit_lsn = Lsn::from(commit_lsn);
        if commit_lsn != begin_lsn || commit_ts != begin_ts {
            self.state = AssemblerState::Fatal;
            return Err(ReplicationError::protocol(format!(
                "Commit (lsn={commit_lsn}, ts={commit_ts}) disagrees with enclosing Begin (lsn={begin_lsn}, ts={begin_ts})"
            )));
        }

        let mut changes = Vec::with_capacity(buffered.len());
        for change in buffered {
            changes.push(self.enrich(change, commit_lsn, commit_ts)?);
        }

        Ok(Some(TransactionFrame {
            xid,
            commit_lsn,
            commit_ts,
            changes,
        }))
    }

    fn enrich(
        &mut self,
        change: RowChange,
        commit_lsn: Lsn,
        commit_ts: i64,
    ) -> ReplicationResult<EnrichedChange> {
        let relation_oid = change.relation_oid();
        let relation = self.relations.get(relation_oid).cloned().ok_or_else(|| {
            ReplicationError::catalog(format!(
                "no cached relation for oid {relation_oid}; a Relation message must precede its changes"
            ))
        })?;

        let seq = self.next_seq;
        self.next_seq += 1;

        let (fields, old_fields) = match &change {
            RowChange::Insert { new, .. } => (decode_tuple(&relation, new), None),
            RowChange::Update { old, new, .. } => (
                decode_tuple(&relation, new),
                old.as_ref().map(|t| decode_tuple(&relation, t)),
            ),
            RowChange::Delete { key_or_old, .. } => (decode_tuple(&relation, key_or_old), None),
        };

        Ok(EnrichedChange {
            change,
            relation,
            commit_lsn,
            commit_ts,
            seq,
            trace_id: uuid::Uuid::new_v4(),
            fields,
            old_fields,
        })
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the `column_name -> value` map for one tuple, skipping
/// unchanged-TOAST slots entirely (they are absent from the map, not
/// `Null`) and casting `Null`/`Text` slots against the column's type.
fn decode_tuple(relation: &RelationInfo, tuple: &TupleData) -> HashMap<String, CastValue> {
    let mut fields = HashMap::with_capacity(tuple.columns.len());
    for (column, slot) in relation.columns.iter().zip(tuple.columns.iter()) {
        match slot {
            TupleSlot::UnchangedToast => continue,
            TupleSlot::Null => {
                fields.insert(column.name.clone(), CastValue::Null);
            }
            TupleSlot::Text(text) => {
                let pg_type = PgType::from_oid(column.type_oid);
                fields.insert(column.name.clone(), cast(&pg_type, text));
            }
        }
    }
    if relation.columns.len() != tuple.columns.len() {
        warn!(
            relation = %relation.qualified_name(),
            expected = relation.columns.len(),
            got = tuple.columns.len(),
            "tuple column count does not match cached relation"
        );
    }
    fields
}
