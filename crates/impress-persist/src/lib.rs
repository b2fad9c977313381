//! Impress Persist - Typed local persistence for the impress client SDK
//!
//! - **Schema**: table and column declarations with static row-type inference
//! - **Query**: predicates, sort keys, joins and patches as plain data
//! - **Adapter**: the raw backend contract ([`RawAdapter`])
//! - **Typed**: schema-checked operations and typed change feeds over any backend
//! - **Memory**: the reference in-memory backend
//! - **Config**: TOML-loadable settings
//!
//! # Architecture
//!
//! ```text
//! TableHandle<M> ──validate──▶ RawAdapter ──commit──▶ TableChange ──▶ subscribers
//!      ▲                          │
//!      └──── decode rows ◀────────┘
//! ```
//!
//! Backends are checked against one shared conformance suite
//! (`impress-persist-conformance`).

pub mod adapter;
pub mod change;
pub mod config;
pub mod error;
pub mod eval;
pub mod memory;
pub mod model;
pub mod query;
pub mod schema;
pub mod typed;
pub mod validate;
pub mod value;

pub use adapter::RawAdapter;
pub use change::{ChangeCallback, ChangeOp, SubscriptionHandle, TableChange};
pub use config::{ConfigError, MemoryConfig, PersistConfig};
pub use error::{ConstraintViolation, PersistError, Result, SchemaError};
pub use memory::{create_memory_db, memory_adapter, MemoryAdapter, MemoryDb};
pub use model::{Col, Model, RowCodec};
pub use query::{JoinKind, JoinSpec, Patch, Predicate, Query, SortDescriptor};
pub use schema::{
    boolean, bytes, json, number, schema, string, table, timestamp, Column, ColumnDef,
    ColumnValue, ForeignKey, InferColumnType, Schema, TableDef, TypedColumn,
};
pub use typed::{
    typed_adapter, typed_adapter_with_config, Joined, TableHandle, TypedAdapter, TypedChange,
};
pub use value::{Key, Row, Value, ValueType};
