//! Change feed: events emitted on commit and the subscriber registry that
//! routes them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

use crate::eval::matches;
use crate::query::Predicate;
use crate::value::{Key, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One committed row mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    pub table: String,
    pub operation: ChangeOp,
    pub primary_key: Key,
    pub before: Option<Row>,
    pub after: Option<Row>,
    /// Adapter-wide commit sequence; strictly increasing.
    pub sequence: u64,
}

impl TableChange {
    /// A change matches a filter when the row matched it before or after the
    /// mutation, so subscribers also see rows leaving their filter.
    pub fn matches(&self, filter: Option<&Predicate>) -> bool {
        let Some(filter) = filter else {
            return true;
        };
        [&self.before, &self.after]
            .into_iter()
            .flatten()
            .any(|row| matches(filter, row))
    }
}

pub type ChangeCallback = Arc<dyn Fn(&TableChange) + Send + Sync>;

/// Returned by `subscribe`; pass it to `unsubscribe` to release the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(Uuid);

impl SubscriptionHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

struct Subscriber {
    handle: SubscriptionHandle,
    filter: Option<Predicate>,
    callback: ChangeCallback,
}

/// Subscribers per table, in registration order.
#[derive(Default)]
pub struct SubscriberRegistry {
    by_table: HashMap<String, Vec<Subscriber>>,
    owners: HashMap<SubscriptionHandle, String>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        table: &str,
        filter: Option<Predicate>,
        callback: ChangeCallback,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle::new();
        self.by_table
            .entry(table.to_string())
            .or_default()
            .push(Subscriber {
                handle,
                filter,
                callback,
            });
        self.owners.insert(handle, table.to_string());
        handle
    }

    /// Remove a subscription. Returns false if it was already released.
    pub fn release(&mut self, handle: SubscriptionHandle) -> bool {
        let Some(table) = self.owners.remove(&handle) else {
            return false;
        };
        if let Some(subs) = self.by_table.get_mut(&table) {
            subs.retain(|s| s.handle != handle);
            if subs.is_empty() {
                self.by_table.remove(&table);
            }
        }
        true
    }

    /// Callbacks of the subscribers currently interested in `change`.
    pub fn snapshot(&self, change: &TableChange) -> Vec<ChangeCallback> {
        self.by_table
            .get(&change.table)
            .map(|subs| {
                subs.iter()
                    .filter(|s| change.matches(s.filter.as_ref()))
                    .map(|s| Arc::clone(&s.callback))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_table.clear();
        self.owners.clear();
    }
}

/// Invoke each callback with `change`. A panicking callback is logged and
/// does not stop delivery to the rest. Returns the number of callbacks that
/// panicked.
pub fn deliver(change: &TableChange, callbacks: &[ChangeCallback]) -> usize {
    let mut failed = 0;
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(change))).is_err() {
            failed += 1;
            tracing::warn!(
                table = %change.table,
                sequence = change.sequence,
                "subscriber callback panicked; continuing delivery"
            );
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;
    use crate::value::Value;
    use std::sync::Mutex;

    fn change(table: &str, before: Option<Row>, after: Option<Row>) -> TableChange {
        TableChange {
            table: table.into(),
            operation: ChangeOp::Update,
            primary_key: Key::from("u1"),
            before,
            after,
            sequence: 1,
        }
    }

    #[test]
    fn change_serde_round_trip() {
        let c = change("users", Some(row! {"id" => "u1"}), None);
        let json = serde_json::to_string(&c).unwrap();
        let back: TableChange = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn filter_matches_before_or_after() {
        let pred = Predicate::Eq("name".into(), Value::from("Alice"));
        let leaving = change(
            "users",
            Some(row! {"name" => "Alice"}),
            Some(row! {"name" => "Bob"}),
        );
        assert!(leaving.matches(Some(&pred)));
        let unrelated = change("users", None, Some(row! {"name" => "Carol"}));
        assert!(!unrelated.matches(Some(&pred)));
        assert!(unrelated.matches(None));
    }

    #[test]
    fn registry_routes_by_table_and_releases_idempotently() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reg = SubscriberRegistry::new();
        let log = Arc::clone(&seen);
        let h = reg.register(
            "users",
            None,
            Arc::new(move |c: &TableChange| log.lock().unwrap().push(c.sequence)),
        );
        reg.register("messages", None, Arc::new(|_: &TableChange| {}));
        assert_eq!(reg.len(), 2);

        let c = change("users", None, Some(row! {"id" => "u1"}));
        let callbacks = reg.snapshot(&c);
        assert_eq!(callbacks.len(), 1);
        deliver(&c, &callbacks);
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        assert!(reg.release(h));
        assert!(!reg.release(h));
        assert!(reg.snapshot(&c).is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let callbacks: Vec<ChangeCallback> = vec![
            Arc::new(|_: &TableChange| panic!("boom")),
            Arc::new(move |_: &TableChange| *counter.lock().unwrap() += 1),
        ];
        let failed = deliver(&change("users", None, None), &callbacks);
        assert_eq!(failed, 1);
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
