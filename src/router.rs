//! Subscription router: matches each enriched change against consumer and
//! pipeline subscriptions and produces the emissions the persistor writes.

use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::assembler::{EnrichedChange, RowChange};
use crate::casts::CastValue;

/// Whether a consumer receives one row per change (`Event`) or maintains
/// latest-state-per-key rows (`Record`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Event,
    Record,
}

/// A predicate over `{schema, table, action}` plus optional per-column
/// filters. Deliberately a small matcher rather than an arbitrary closure
/// so it can be built from `MessageHandler::context` without compiling
/// code at runtime.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub schema: Option<String>,
    pub table: Option<String>,
    pub actions: Option<Vec<&'static str>>,
    pub column_filters: Vec<(String, CastValue)>,
}

impl Predicate {
    pub fn matches(&self, change: &EnrichedChange) -> bool {
        if let Some(schema) = &self.schema {
            if schema != &change.relation.namespace {
                return false;
            }
        }
        if let Some(table) = &self.table {
            if table != &change.relation.name {
                return false;
            }
        }
        if let Some(actions) = &self.actions {
            if !actions.contains(&change.change.action()) {
                return false;
            }
        }
        self.column_filters
            .iter()
            .all(|(column, expected)| change.fields.get(column) == Some(expected))
    }
}

#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: Uuid,
    pub message_kind: MessageKind,
    pub predicate: Predicate,
    /// Columns used to derive a record's `group_id` for `Record` consumers.
    /// Falls back to the relation's primary-key columns when empty.
    pub grouping_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub id: Uuid,
    pub predicate: Predicate,
}

/// Row inserted into a consumer's per-change event queue.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerEvent {
    pub consumer_id: Uuid,
    pub commit_lsn: crate::lsn::Lsn,
    pub seq: u64,
    pub action: &'static str,
    pub relation_oid: u32,
    pub fields: std::collections::HashMap<String, CastValue>,
}

/// Insertion or deletion against a consumer's latest-state-per-key table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConsumerRecord {
    Upsert {
        consumer_id: Uuid,
        table_oid: u32,
        group_id: String,
        fields: std::collections::HashMap<String, CastValue>,
    },
    Delete {
        consumer_id: Uuid,
        table_oid: u32,
        record_pks: Vec<CastValue>,
        /// The same join-on-comma-of-display-values key an `Upsert` for
        /// this row would have used, so a store keying its latest-state
        /// table by `group_id` can match a delete against it. Derived
        /// from `record_pks`, the row's primary-key values.
        group_id: String,
    },
}

/// Row inserted into a pipeline's raw WAL-event stream.
#[derive(Debug, Clone, Serialize)]
pub struct WalEvent {
    pub pipeline_id: Uuid,
    pub commit_lsn: crate::lsn::Lsn,
    pub seq: u64,
    pub action: &'static str,
    pub relation_oid: u32,
}

#[derive(Debug, Default)]
pub struct RoutedBatch {
    pub consumer_events: Vec<ConsumerEvent>,
    pub consumer_records: Vec<ConsumerRecord>,
    pub consumer_deletes: Vec<ConsumerRecord>,
    pub wal_events: Vec<WalEvent>,
}

/// Route every change in a transaction frame against the given consumers
/// and pipelines. Evaluation order across subscriptions is unspecified;
/// this implementation iterates consumers then pipelines per change, which
/// is commutative with respect to the emitted rows.
pub fn route(
    changes: &[EnrichedChange],
    consumers: &[Consumer],
    pipelines: &[Pipeline],
) -> RoutedBatch {
    let mut batch = RoutedBatch::default();

    for change in changes {
        let mut any_matched = false;

        for consumer in consumers {
            if !consumer.predicate.matches(change) {
                continue;
            }
            any_matched = true;
            match consumer.message_kind {
                MessageKind::Event => batch.consumer_events.push(ConsumerEvent {
                    consumer_id: consumer.id,
                    commit_lsn: change.commit_lsn,
                    seq: change.seq,
                    action: change.change.action(),
                    relation_oid: change.relation.oid,
                    fields: change.fields.clone(),
                }),
                MessageKind::Record => {
                    route_record(consumer, change, &mut batch);
                }
            }
        }

        for pipeline in pipelines {
            if pipeline.predicate.matches(change) {
                any_matched = true;
                batch.wal_events.push(WalEvent {
                    pipeline_id: pipeline.id,
                    commit_lsn: change.commit_lsn,
                    seq: change.seq,
                    action: change.change.action(),
                    relation_oid: change.relation.oid,
                });
            }
        }

        if !any_matched {
            trace!(
                relation = %change.relation.qualified_name(),
                action = change.change.action(),
                "filtered: no subscription matched"
            );
        }
    }

    batch
}

fn route_record(consumer: &Consumer, change: &EnrichedChange, batch: &mut RoutedBatch) {
    if matches!(change.change, RowChange::Delete { .. }) {
        let pks = primary_key_values(change, change.old_fields.as_ref().unwrap_or(&change.fields));
        let group_id = format_group_id(&pks);
        batch.consumer_deletes.push(ConsumerRecord::Delete {
            consumer_id: consumer.id,
            table_oid: change.relation.oid,
            record_pks: pks,
            group_id,
        });
        return;
    }

    let group_columns = if consumer.grouping_columns.is_empty() {
        change.relation.pk_column_names().into_iter().map(String::from).collect()
    } else {
        consumer.grouping_columns.clone()
    };
    let group_id = group_columns
        .iter()
        .map(|c| display_value(change.fields.get(c)))
        .collect::<Vec<_>>()
        .join(",");

    batch.consumer_records.push(ConsumerRecord::Upsert {
        consumer_id: consumer.id,
        table_oid: change.relation.oid,
        group_id,
        fields: change.fields.clone(),
    });
}

/// Join already-resolved `CastValue`s with the same `,`-joined display
/// format `route_record`'s pk-fallback group_id uses, so a delete's key
/// matches the insert it is meant to remove.
fn format_group_id(values: &[CastValue]) -> String {
    values
        .iter()
        .map(|v| display_value(Some(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn primary_key_values(
    change: &EnrichedChange,
    fields: &std::collections::HashMap<String, CastValue>,
) -> Vec<CastValue> {
    change
        .relation
        .pk_column_names()
        .into_iter()
        .map(|name| fields.get(name).cloned().unwrap_or(CastValue::Null))
        .collect()
}

fn display_value(value: Option<&CastValue>) -> String {
    match value {
        None | Some(CastValue::Null) => String::new(),
        Some(CastValue::Int(v)) => v.to_string(),
        Some(CastValue::Text(v)) | Some(CastValue::Raw(v)) | Some(CastValue::Decimal(v)) => {
            v.clone()
        }
        Some(other) => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::RowChange;
    use crate::relation::{ColumnInfo, RelationInfo};
    use std::collections::HashMap;

    fn change(action: RowChange, pk_value: i64) -> EnrichedChange {
        let relation = RelationInfo {
            oid: 1,
            namespace: "public".into(),
            name: "users".into(),
            replica_identity: b'd',
            columns: vec![ColumnInfo {
                name: "id".into(),
                type_oid: 23,
                type_modifier: -1,
                decoder_flags_pk: true,
                is_pk: true,
            }],
        };
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), CastValue::Int(pk_value));
        EnrichedChange {
            change: action,
            relation,
            commit_lsn: crate::lsn::Lsn::from(0x1A0),
            commit_ts: 0,
            seq: 0,
            trace_id: Uuid::new_v4(),
            fields,
            old_fields: None,
        }
    }

    #[test]
    fn delete_emits_record_delete_keyed_by_pk() {
        let consumer = Consumer {
            id: Uuid::new_v4(),
            message_kind: MessageKind::Record,
            predicate: Predicate {
                schema: None,
                table: None,
                actions: None,
                column_filters: vec![],
            },
            grouping_columns: vec![],
        };
        let c = change(RowChange::Delete { relation_oid: 1, key_or_old: Default::default() }, 1);
        let batch = route(&[c], &[consumer], &[]);
        assert_eq!(batch.consumer_deletes.len(), 1);
        assert!(batch.consumer_records.is_empty());
    }

    #[test]
    fn delete_group_id_matches_an_upsert_for_the_same_pk_fallback() {
        let consumer = Consumer {
            id: Uuid::new_v4(),
            message_kind: MessageKind::Record,
            predicate: Predicate {
                schema: None,
                table: None,
                actions: None,
                column_filters: vec![],
            },
            grouping_columns: vec![],
        };
        let insert = change(RowChange::Insert { relation_oid: 1, new: Default::default() }, 7);
        let delete = change(RowChange::Delete { relation_oid: 1, key_or_old: Default::default() }, 7);

        let upsert_batch = route(&[insert], &[consumer.clone()], &[]);
        let delete_batch = route(&[delete], &[consumer], &[]);

        let ConsumerRecord::Upsert { group_id: upsert_id, .. } = &upsert_batch.consumer_records[0]
        else {
            panic!("expected upsert");
        };
        let ConsumerRecord::Delete { group_id: delete_id, .. } = &delete_batch.consumer_deletes[0]
        else {
            panic!("expected delete");
        };
        assert_eq!(upsert_id, delete_id);
    }

    #[test]
    fn insert_emits_consumer_event_when_predicate_matches() {
        let consumer = Consumer {
            id: Uuid::new_v4(),
            message_kind: MessageKind::Event,
            predicate: Predicate {
                schema: Some("public".into()),
                table: Some("users".into()),
                actions: Some(vec!["insert"]),
                column_filters: vec![],
            },
            grouping_columns: vec![],
        };
        let c = change(RowChange::Insert { relation_oid: 1, new: Default::default() }, 1);
        let batch = route(&[c], &[consumer], &[]);
        assert_eq!(batch.consumer_events.len(), 1);
    }
}
