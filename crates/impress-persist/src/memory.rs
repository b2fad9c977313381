//! Reference in-memory backend.
//!
//! Behaviour of this adapter is the baseline every other backend is held to
//! by the conformance suite. Everything executes synchronously behind the
//! async [`RawAdapter`] interface.

use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::adapter::RawAdapter;
use crate::change::{
    deliver, ChangeCallback, ChangeOp, SubscriberRegistry, SubscriptionHandle, TableChange,
};
use crate::config::MemoryConfig;
use crate::error::{ConstraintViolation, PersistError, Result};
use crate::eval::{apply_patch, matches, matches_filter, paginate, sort_rows};
use crate::query::{Patch, Predicate, Query};
use crate::schema::{Schema, TableDef};
use crate::value::{Key, Row};

type TableRows = BTreeMap<Key, Row>;

thread_local! {
    /// Stores this thread is currently delivering changes for, by address.
    static DELIVERING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn is_delivering(store: usize) -> bool {
    DELIVERING.with(|d| d.borrow().contains(&store))
}

struct DeliveryGuard(usize);

impl DeliveryGuard {
    fn enter(store: usize) -> Self {
        DELIVERING.with(|d| d.borrow_mut().push(store));
        DeliveryGuard(store)
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        DELIVERING.with(|d| {
            let mut stores = d.borrow_mut();
            if let Some(at) = stores.iter().rposition(|s| *s == self.0) {
                stores.remove(at);
            }
        });
    }
}

struct Pending {
    change: TableChange,
    callbacks: Vec<ChangeCallback>,
}

#[derive(Default)]
struct DbState {
    schema: Option<Arc<Schema>>,
    tables: HashMap<String, TableRows>,
    sequence: u64,
    closed: bool,
}

impl DbState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(PersistError::AdapterUnavailable(
                "memory adapter is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn schema(&self) -> Result<Arc<Schema>> {
        self.ensure_open()?;
        self.schema.clone().ok_or_else(|| {
            PersistError::AdapterUnavailable("memory adapter has not been opened".to_string())
        })
    }

    fn table_def(&self, table: &str) -> Result<Arc<TableDef>> {
        self.schema()?
            .table(table)
            .cloned()
            .ok_or_else(|| PersistError::UnknownTable(table.to_string()))
    }

    fn rows(&self, table: &str) -> Result<&TableRows> {
        self.tables
            .get(table)
            .ok_or_else(|| PersistError::UnknownTable(table.to_string()))
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

/// Volatile store: one map per table from primary key to row, plus the
/// subscriber registry shared by every adapter opened on it.
pub struct MemoryDb {
    config: MemoryConfig,
    state: RwLock<DbState>,
    subscribers: Mutex<SubscriberRegistry>,
    commit: Mutex<()>,
    outbox: Mutex<VecDeque<Pending>>,
}

/// Create an empty in-memory store.
pub fn create_memory_db() -> Arc<MemoryDb> {
    MemoryDb::with_config(MemoryConfig::default())
}

/// Wrap a store in the raw adapter interface.
pub fn memory_adapter(db: Arc<MemoryDb>) -> MemoryAdapter {
    MemoryAdapter { db }
}

fn unavailable<E: std::fmt::Display>(e: E) -> PersistError {
    PersistError::AdapterUnavailable(e.to_string())
}

impl MemoryDb {
    pub fn with_config(config: MemoryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: RwLock::new(DbState::default()),
            subscribers: Mutex::new(SubscriberRegistry::new()),
            commit: Mutex::new(()),
            outbox: Mutex::new(VecDeque::new()),
        })
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, DbState>> {
        self.state.read().map_err(unavailable)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, DbState>> {
        self.state.write().map_err(unavailable)
    }

    /// Snapshot of a table's rows in primary-key order. Synchronous, so it can
    /// be called from inside a subscriber callback.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let state = self.read()?;
        state.ensure_open()?;
        Ok(state.rows(table)?.values().cloned().collect())
    }

    /// Drop all rows and subscriptions and restart the commit sequence.
    /// The schema stays attached.
    pub fn reset(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.tables.values_mut().for_each(BTreeMap::clear);
        state.sequence = 0;
        state.closed = false;
        drop(state);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Tear down: later operations fail with `AdapterUnavailable`.
    pub fn close(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!(adapter = %self.config.label, "memory adapter closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run `op` as one atomic commit, then deliver its changes.
    ///
    /// Mutations are serialized by the commit lock, which stays held until
    /// delivery finishes so events reach subscribers in commit order. A
    /// mutation issued from inside one of this store's callbacks already runs
    /// under that lock; its events are queued behind the event being
    /// delivered. Other stores mutated from the same callback commit and
    /// deliver independently.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut DbState) -> Result<(T, Vec<TableChange>)>,
    ) -> Result<T> {
        if is_delivering(self.address()) {
            let (out, changes) = self.commit_changes(op)?;
            self.enqueue(changes);
            return Ok(out);
        }
        let _commit = self.commit.lock().map_err(unavailable)?;
        let (out, changes) = self.commit_changes(op)?;
        self.enqueue(changes);
        self.drain();
        Ok(out)
    }

    fn commit_changes<T>(
        &self,
        op: impl FnOnce(&mut DbState) -> Result<(T, Vec<TableChange>)>,
    ) -> Result<(T, Vec<TableChange>)> {
        let mut state = self.write()?;
        state.ensure_open()?;
        op(&mut *state)
    }

    fn enqueue(&self, changes: Vec<TableChange>) {
        if changes.is_empty() {
            return;
        }
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        for change in changes {
            let callbacks = subscribers.snapshot(&change);
            outbox.push_back(Pending { change, callbacks });
        }
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }

    fn drain(&self) {
        let _delivering = DeliveryGuard::enter(self.address());
        loop {
            let next = self
                .outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(pending) = next else {
                break;
            };
            if self.config.log_changes {
                tracing::trace!(
                    adapter = %self.config.label,
                    table = %pending.change.table,
                    operation = ?pending.change.operation,
                    key = %pending.change.primary_key,
                    sequence = pending.change.sequence,
                    subscribers = pending.callbacks.len(),
                    "delivering change"
                );
            }
            deliver(&pending.change, &pending.callbacks);
        }
    }
}

fn primary_key_of(def: &TableDef, row: &Row) -> Result<Key> {
    let pk = def.primary_key();
    match row.get(&pk.name) {
        Some(value) if !value.is_null() => Ok(Key(value.clone())),
        _ => Err(ConstraintViolation::NotNull {
            table: def.name().to_string(),
            column: pk.name.clone(),
        }
        .into()),
    }
}

/// Non-null values of unique columns may not repeat in any other row.
fn check_unique(def: &TableDef, rows: &TableRows, key: &Key, row: &Row) -> Result<()> {
    for column in def.columns().iter().filter(|c| c.unique && !c.primary_key) {
        let Some(value) = row.get(&column.name).filter(|v| !v.is_null()) else {
            continue;
        };
        let clash = rows.iter().any(|(other_key, other)| {
            other_key != key
                && other
                    .get(&column.name)
                    .is_some_and(|existing| existing.same_as(value))
        });
        if clash {
            return Err(ConstraintViolation::Unique {
                table: def.name().to_string(),
                column: column.name.clone(),
                value: value.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

/// Every non-null foreign key must name an existing target row. With
/// `changed`, only the patched columns are checked.
fn check_references(
    def: &TableDef,
    schema: &Schema,
    tables: &HashMap<String, TableRows>,
    row: &Row,
    changed: Option<&Patch>,
) -> Result<()> {
    for column in def.columns() {
        let Some(fk) = &column.references else {
            continue;
        };
        if changed.is_some_and(|patch| patch.get(&column.name).is_none()) {
            continue;
        }
        let Some(value) = row.get(&column.name).filter(|v| !v.is_null()) else {
            continue;
        };
        let target_def = schema
            .table(&fk.table)
            .ok_or_else(|| PersistError::UnknownTable(fk.table.clone()))?;
        let found = tables.get(&fk.table).is_some_and(|rows| {
            if target_def.primary_key().name == fk.column {
                rows.contains_key(&Key(value.clone()))
            } else {
                rows.values()
                    .any(|t| t.get(&fk.column).is_some_and(|v| v.same_as(value)))
            }
        });
        if !found {
            return Err(ConstraintViolation::ForeignKey {
                table: def.name().to_string(),
                column: column.name.clone(),
                value: value.to_string(),
                target_table: fk.table.clone(),
                target_column: fk.column.clone(),
            }
            .into());
        }
    }
    Ok(())
}

fn insert_rows(
    state: &mut DbState,
    table: &str,
    rows: Vec<Row>,
) -> Result<(Vec<Row>, Vec<TableChange>)> {
    let schema = state.schema()?;
    let def = state.table_def(table)?;
    let existing = state.rows(table)?;

    let mut staged: TableRows = BTreeMap::new();
    let mut order = Vec::with_capacity(rows.len());
    for row in rows {
        let key = primary_key_of(&def, &row)?;
        if existing.contains_key(&key) || staged.contains_key(&key) {
            return Err(ConstraintViolation::DuplicatePrimaryKey {
                table: table.to_string(),
                key: key.to_string(),
            }
            .into());
        }
        check_unique(&def, existing, &key, &row)?;
        check_unique(&def, &staged, &key, &row)?;
        check_references(&def, &schema, &state.tables, &row, None)?;
        order.push(key.clone());
        staged.insert(key, row);
    }

    let mut stored = Vec::with_capacity(order.len());
    let mut changes = Vec::with_capacity(order.len());
    for key in order {
        let Some(row) = staged.remove(&key) else {
            continue;
        };
        let sequence = state.next_sequence();
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.clone(), row.clone());
        changes.push(TableChange {
            table: table.to_string(),
            operation: ChangeOp::Insert,
            primary_key: key,
            before: None,
            after: Some(row.clone()),
            sequence,
        });
        stored.push(row);
    }
    Ok((stored, changes))
}

fn update_rows(
    state: &mut DbState,
    table: &str,
    filter: &Predicate,
    patch: &Patch,
) -> Result<(usize, Vec<TableChange>)> {
    let schema = state.schema()?;
    let def = state.table_def(table)?;
    let existing = state.rows(table)?;
    let targets: Vec<(Key, Row)> = existing
        .iter()
        .filter(|(_, row)| matches(filter, row))
        .map(|(k, r)| (k.clone(), r.clone()))
        .collect();
    if targets.is_empty() {
        return Ok((0, Vec::new()));
    }

    let pk = &def.primary_key().name;
    if let Some(new_key) = patch.get(pk) {
        if targets.iter().any(|(key, _)| !key.value().same_as(new_key)) {
            return Err(ConstraintViolation::PrimaryKeyImmutable {
                table: table.to_string(),
                column: pk.clone(),
            }
            .into());
        }
    }

    let mut next = existing.clone();
    let mut updated = Vec::with_capacity(targets.len());
    for (key, before) in targets {
        let after = apply_patch(&before, patch);
        next.insert(key.clone(), after.clone());
        updated.push((key, before, after));
    }
    for (key, _, after) in &updated {
        check_unique(&def, &next, key, after)?;
        check_references(&def, &schema, &state.tables, after, Some(patch))?;
    }

    state.tables.insert(table.to_string(), next);
    let count = updated.len();
    let changes = updated
        .into_iter()
        .map(|(key, before, after)| TableChange {
            table: table.to_string(),
            operation: ChangeOp::Update,
            primary_key: key,
            before: Some(before),
            after: Some(after),
            sequence: state.next_sequence(),
        })
        .collect();
    Ok((count, changes))
}

fn delete_rows(
    state: &mut DbState,
    table: &str,
    filter: &Predicate,
) -> Result<(usize, Vec<TableChange>)> {
    state.table_def(table)?;
    let keys: Vec<Key> = state
        .rows(table)?
        .iter()
        .filter(|(_, row)| matches(filter, row))
        .map(|(k, _)| k.clone())
        .collect();

    let mut changes = Vec::with_capacity(keys.len());
    for key in keys {
        let removed = state.tables.get_mut(table).and_then(|rows| rows.remove(&key));
        if let Some(before) = removed {
            let sequence = state.next_sequence();
            changes.push(TableChange {
                table: table.to_string(),
                operation: ChangeOp::Delete,
                primary_key: key,
                before: Some(before),
                after: None,
                sequence,
            });
        }
    }
    Ok((changes.len(), changes))
}

/// [`RawAdapter`] over a [`MemoryDb`].
#[derive(Clone)]
pub struct MemoryAdapter {
    db: Arc<MemoryDb>,
}

impl MemoryAdapter {
    pub fn db(&self) -> &Arc<MemoryDb> {
        &self.db
    }

    pub fn close(&self) {
        self.db.close();
    }
}

#[async_trait]
impl RawAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        self.db.label()
    }

    async fn open(&self, schema: Arc<Schema>) -> Result<()> {
        let mut state = self.db.write()?;
        state.ensure_open()?;
        for name in schema.table_names() {
            state.tables.entry(name.to_string()).or_default();
        }
        state.tables.retain(|name, _| schema.table(name).is_some());
        tracing::debug!(
            adapter = %self.db.label(),
            tables = schema.len(),
            "memory adapter opened"
        );
        state.schema = Some(schema);
        Ok(())
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row> {
        let mut stored = self
            .db
            .mutate(|state| insert_rows(state, table, vec![row]))?;
        stored
            .pop()
            .ok_or_else(|| PersistError::AdapterUnavailable("insert produced no row".into()))
    }

    async fn insert_batch(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>> {
        let stored = self.db.mutate(|state| insert_rows(state, table, rows))?;
        tracing::debug!(adapter = %self.db.label(), table, rows = stored.len(), "batch insert committed");
        Ok(stored)
    }

    async fn update(&self, table: &str, filter: &Predicate, patch: &Patch) -> Result<usize> {
        self.db
            .mutate(|state| update_rows(state, table, filter, patch))
    }

    async fn delete(&self, table: &str, filter: &Predicate) -> Result<usize> {
        self.db.mutate(|state| delete_rows(state, table, filter))
    }

    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Row>> {
        let state = self.db.read()?;
        let def = state.table_def(table)?;
        let mut rows: Vec<Row> = state
            .rows(table)?
            .values()
            .filter(|row| matches_filter(query.filter.as_ref(), row))
            .cloned()
            .collect();
        drop(state);
        sort_rows(&mut rows, &query.sort, &def.primary_key().name);
        Ok(paginate(rows, query.offset, query.limit))
    }

    async fn count(&self, table: &str, filter: Option<&Predicate>) -> Result<usize> {
        let state = self.db.read()?;
        state.table_def(table)?;
        Ok(state
            .rows(table)?
            .values()
            .filter(|row| matches_filter(filter, row))
            .count())
    }

    async fn subscribe(
        &self,
        table: &str,
        filter: Option<Predicate>,
        callback: ChangeCallback,
    ) -> Result<SubscriptionHandle> {
        self.db.read()?.table_def(table)?;
        let handle = self
            .db
            .subscribers
            .lock()
            .map_err(unavailable)?
            .register(table, filter, callback);
        tracing::debug!(adapter = %self.db.label(), table, %handle, "subscribed");
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let released = self
            .db
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(handle);
        if released {
            tracing::debug!(adapter = %self.db.label(), %handle, "unsubscribed");
        }
    }
}
