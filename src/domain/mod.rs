//! Domain layer: schemas, records, snapshots and schema operations.
//!
//! Everything here is pure data. Nothing in this module talks to the
//! store; the SQL lives in [`crate::persistence`].

pub mod field;
pub mod operation;
pub mod record;
pub mod record_id;
pub mod schema;
pub mod snapshot;
pub mod value;

pub use field::{FieldDef, LinkTarget};
pub use operation::SchemaOperation;
pub use record::{Record, RecordState};
pub use record_id::RecordId;
pub use schema::{LiveSchema, ShadowSchema, derive_shadow_schema};
pub use snapshot::{RevertTarget, Snapshot};
pub use value::{FieldKind, Value};
