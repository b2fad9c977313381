use async_trait::async_trait;
use std::sync::Arc;

use crate::change::{ChangeCallback, SubscriptionHandle};
use crate::error::Result;
use crate::query::{Patch, Predicate, Query};
use crate::schema::Schema;
use crate::value::Row;

/// The contract every storage backend implements.
///
/// Rows handed to a backend have already been validated against the schema
/// by the typed layer; the backend owns atomicity and the key, uniqueness and
/// reference constraints. Joins are resolved by the typed layer, so `query`
/// receives an empty `joins` list.
///
/// Requirements shared by all backends:
/// - mutations on a table are serialized and atomic: a failed mutation
///   leaves the store unchanged;
/// - every committed row mutation produces exactly one
///   [`TableChange`](crate::change::TableChange), in commit order, delivered
///   to matching subscribers before the mutating call returns;
/// - queries observe either the full pre- or full post-mutation state;
/// - rows are ordered per the sort keys, then by ascending primary key.
///
/// Subscribers may read and write the store from inside their callback.
/// Reads see the committed post-mutation state. A write issued from a
/// callback commits immediately, but its own changes are queued behind the
/// change being delivered, so that nested call returns before they reach
/// subscribers. The outermost mutating call returns only once the queue is
/// empty, and commit order holds throughout. Writes to a different store
/// from a callback are not nested and deliver before returning.
#[async_trait]
pub trait RawAdapter: Send + Sync {
    /// Backend name used in logs and test reports.
    fn name(&self) -> &str;

    /// Prepare storage for `schema`. Fails with `AdapterUnavailable` when the
    /// backend cannot be reached or initialized.
    async fn open(&self, schema: Arc<Schema>) -> Result<()>;

    /// Insert a row. Returns the stored row.
    async fn insert(&self, table: &str, row: Row) -> Result<Row>;

    /// Insert several rows atomically: all are committed or none.
    async fn insert_batch(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>>;

    /// Apply `patch` to every row matching `filter`. Returns the number of rows changed.
    async fn update(&self, table: &str, filter: &Predicate, patch: &Patch) -> Result<usize>;

    /// Remove every row matching `filter`. Returns the number of rows removed.
    async fn delete(&self, table: &str, filter: &Predicate) -> Result<usize>;

    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Row>>;

    async fn count(&self, table: &str, filter: Option<&Predicate>) -> Result<usize> {
        let query = Query {
            filter: filter.cloned(),
            ..Query::default()
        };
        Ok(self.query(table, &query).await?.len())
    }

    /// Register `callback` for changes on `table` matching `filter`.
    async fn subscribe(
        &self,
        table: &str,
        filter: Option<Predicate>,
        callback: ChangeCallback,
    ) -> Result<SubscriptionHandle>;

    /// Release a subscription. Idempotent, and safe after the adapter is closed.
    async fn unsubscribe(&self, handle: SubscriptionHandle);
}
