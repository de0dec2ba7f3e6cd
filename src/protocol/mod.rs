//! PostgreSQL logical replication protocol: frame tagging and
//! protocol-version-1 logical message decoding and encoding.

pub mod decoder;
pub mod encoder;
pub mod frame;

pub use decoder::{decode, LogicalMessage, OldTupleKind, TupleData, TupleSlot};
pub use encoder::encode;
pub use frame::{parse_frame, Frame, KeepaliveFrame, XLogDataFrame};
