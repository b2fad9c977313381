//! Typed adapter: schema-checked operations over any [`RawAdapter`].
//!
//! Every argument is validated against the schema before it reaches the
//! backend, and rows are converted to and from the caller's row type.
//! Joins are resolved here so backends only ever answer single-table
//! queries.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::adapter::RawAdapter;
use crate::change::{ChangeCallback, ChangeOp, SubscriptionHandle, TableChange};
use crate::config::PersistConfig;
use crate::error::{PersistError, Result};
use crate::eval::paginate;
use crate::model::{from_row, Model, RowCodec};
use crate::query::{JoinKind, JoinSpec, Patch, Predicate, Query};
use crate::schema::{Schema, TableDef};
use crate::validate::{check_join, check_patch, check_predicate, check_sort, prepare_insert};
use crate::value::{Key, Row, Value};

/// Open `raw` with `schema` and wrap it in the typed interface.
pub async fn typed_adapter(raw: Arc<dyn RawAdapter>, schema: Schema) -> Result<TypedAdapter> {
    typed_adapter_with_config(raw, schema, PersistConfig::default()).await
}

pub async fn typed_adapter_with_config(
    raw: Arc<dyn RawAdapter>,
    schema: Schema,
    config: PersistConfig,
) -> Result<TypedAdapter> {
    let schema = Arc::new(schema);
    raw.open(Arc::clone(&schema)).await?;
    tracing::debug!(
        adapter = raw.name(),
        tables = schema.len(),
        strict = config.strict_mutations,
        "typed adapter ready"
    );
    Ok(TypedAdapter {
        raw,
        schema,
        config: Arc::new(config),
    })
}

#[derive(Clone)]
pub struct TypedAdapter {
    raw: Arc<dyn RawAdapter>,
    schema: Arc<Schema>,
    config: Arc<PersistConfig>,
}

impl TypedAdapter {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn raw(&self) -> &Arc<dyn RawAdapter> {
        &self.raw
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    /// Handle on the table a [`Model`] belongs to.
    pub fn table<M: Model>(&self) -> Result<TableHandle<M>> {
        self.handle(M::TABLE)
    }

    /// Handle on a table by name, working with untyped [`Row`]s.
    pub fn table_named(&self, name: &str) -> Result<TableHandle<Row>> {
        self.handle(name)
    }

    fn handle<R: RowCodec>(&self, name: &str) -> Result<TableHandle<R>> {
        let def = self
            .schema
            .table(name)
            .cloned()
            .ok_or_else(|| PersistError::UnknownTable(name.to_string()))?;
        Ok(TableHandle {
            adapter: self.clone(),
            def,
            _row: PhantomData,
        })
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.raw.unsubscribe(handle).await;
    }
}

/// A driving row plus the rows each join attached to it, keyed by alias.
/// An optional join without a match has no entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Joined<R> {
    pub row: R,
    pub related: BTreeMap<String, Vec<Row>>,
}

impl<R> Joined<R> {
    pub fn related(&self, alias: &str) -> Option<&[Row]> {
        self.related.get(alias).map(Vec::as_slice)
    }

    /// Decode the rows under `alias` as `M`.
    pub fn related_as<M: Model>(&self, alias: &str) -> Result<Option<Vec<M>>> {
        let Some(rows) = self.related.get(alias) else {
            return Ok(None);
        };
        rows.iter()
            .cloned()
            .map(|row| {
                from_row(row).map_err(|message| PersistError::Codec {
                    table: M::TABLE.to_string(),
                    message,
                })
            })
            .collect::<Result<Vec<M>>>()
            .map(Some)
    }
}

/// A [`TableChange`] with rows decoded into the subscriber's row type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedChange<R> {
    pub table: String,
    pub operation: ChangeOp,
    pub primary_key: Key,
    pub before: Option<R>,
    pub after: Option<R>,
    pub sequence: u64,
}

impl<R: RowCodec> TypedChange<R> {
    fn decode(change: &TableChange, def: &TableDef) -> Result<Self> {
        let decode = |row: &Option<Row>| {
            row.clone()
                .map(|row| R::decode(row, def))
                .transpose()
        };
        Ok(Self {
            table: change.table.clone(),
            operation: change.operation,
            primary_key: change.primary_key.clone(),
            before: decode(&change.before)?,
            after: decode(&change.after)?,
            sequence: change.sequence,
        })
    }
}

type Slots = BTreeMap<String, Vec<Row>>;

/// Operations on one declared table.
pub struct TableHandle<R> {
    adapter: TypedAdapter,
    def: Arc<TableDef>,
    _row: PhantomData<fn() -> R>,
}

impl<R> Clone for TableHandle<R> {
    fn clone(&self) -> Self {
        Self {
            adapter: self.adapter.clone(),
            def: Arc::clone(&self.def),
            _row: PhantomData,
        }
    }
}

impl<R: RowCodec> TableHandle<R> {
    pub fn name(&self) -> &str {
        self.def.name()
    }

    pub fn def(&self) -> &TableDef {
        &self.def
    }

    fn raw(&self) -> &dyn RawAdapter {
        self.adapter.raw.as_ref()
    }

    /// Insert one row. Omitted columns take their default, or null when
    /// nullable. Returns the row as stored.
    pub async fn insert(&self, row: &R) -> Result<R> {
        let row = prepare_insert(&self.def, row.encode(&self.def)?)?;
        let stored = self.raw().insert(self.name(), row).await?;
        R::decode(stored, &self.def)
    }

    /// Insert several rows; either all are stored or none.
    pub async fn insert_batch(&self, rows: &[R]) -> Result<Vec<R>> {
        let rows = rows
            .iter()
            .map(|row| prepare_insert(&self.def, row.encode(&self.def)?))
            .collect::<Result<Vec<_>>>()?;
        let stored = self.raw().insert_batch(self.name(), rows).await?;
        stored
            .into_iter()
            .map(|row| R::decode(row, &self.def))
            .collect()
    }

    /// Apply `patch` to every row matching `filter`. Returns the number of
    /// rows changed.
    pub async fn update(&self, filter: Predicate, patch: Patch) -> Result<usize> {
        self.update_with(filter, patch, self.adapter.config.strict_mutations)
            .await
    }

    /// Like [`update`](Self::update), but matching nothing is `NotFound`.
    pub async fn update_strict(&self, filter: Predicate, patch: Patch) -> Result<usize> {
        self.update_with(filter, patch, true).await
    }

    async fn update_with(&self, filter: Predicate, patch: Patch, strict: bool) -> Result<usize> {
        check_predicate(&self.def, &filter)?;
        check_patch(&self.def, &patch)?;
        let changed = self.raw().update(self.name(), &filter, &patch).await?;
        if strict && changed == 0 {
            return Err(PersistError::NotFound(format!(
                "no row in `{}` matches the update filter",
                self.name()
            )));
        }
        Ok(changed)
    }

    /// Remove every row matching `filter`. Returns the number removed.
    pub async fn delete(&self, filter: Predicate) -> Result<usize> {
        self.delete_with(filter, self.adapter.config.strict_mutations)
            .await
    }

    pub async fn delete_strict(&self, filter: Predicate) -> Result<usize> {
        self.delete_with(filter, true).await
    }

    async fn delete_with(&self, filter: Predicate, strict: bool) -> Result<usize> {
        check_predicate(&self.def, &filter)?;
        let removed = self.raw().delete(self.name(), &filter).await?;
        if strict && removed == 0 {
            return Err(PersistError::NotFound(format!(
                "no row in `{}` matches the delete filter",
                self.name()
            )));
        }
        Ok(removed)
    }

    /// Look a row up by primary key.
    pub async fn find(&self, key: impl Into<Key>) -> Result<Option<R>> {
        let pk = Predicate::Eq(self.def.primary_key().name.clone(), key.into().into_value());
        check_predicate(&self.def, &pk)?;
        let mut rows = self
            .raw()
            .query(self.name(), &Query::new().filter(pk).limit(1))
            .await?;
        rows.pop().map(|row| R::decode(row, &self.def)).transpose()
    }

    pub async fn count(&self, filter: Option<Predicate>) -> Result<usize> {
        if let Some(filter) = &filter {
            check_predicate(&self.def, filter)?;
        }
        self.raw().count(self.name(), filter.as_ref()).await
    }

    /// Rows matching `query`. Required joins still drop driving rows without
    /// a match; use [`query_joined`](Self::query_joined) to read the joined rows.
    pub async fn query(&self, query: Query) -> Result<Vec<R>> {
        self.fetch(query)
            .await?
            .into_iter()
            .map(|(row, _)| R::decode(row, &self.def))
            .collect()
    }

    pub async fn query_joined(&self, query: Query) -> Result<Vec<Joined<R>>> {
        self.fetch(query)
            .await?
            .into_iter()
            .map(|(row, related)| {
                Ok(Joined {
                    row: R::decode(row, &self.def)?,
                    related,
                })
            })
            .collect()
    }

    /// Filter, join, sort, then paginate.
    ///
    /// Without joins the whole query goes to the backend. With joins the
    /// driving rows are fetched filtered and sorted, each join runs as one
    /// `In` query against its table, and pagination applies to what remains.
    async fn fetch(&self, query: Query) -> Result<Vec<(Row, Slots)>> {
        if let Some(filter) = &query.filter {
            check_predicate(&self.def, filter)?;
        }
        check_sort(&self.def, &query.sort)?;
        for join in &query.joins {
            check_join(&self.adapter.schema, &self.def, join)?;
        }

        if query.joins.is_empty() {
            let rows = self.raw().query(self.name(), &query).await?;
            return Ok(rows.into_iter().map(|row| (row, Slots::new())).collect());
        }

        let driving = Query {
            filter: query.filter.clone(),
            sort: query.sort.clone(),
            ..Query::default()
        };
        let mut composite: Vec<(Row, Slots)> = self
            .raw()
            .query(self.name(), &driving)
            .await?
            .into_iter()
            .map(|row| (row, Slots::new()))
            .collect();

        for join in &query.joins {
            let related = self.fetch_related(join, &composite).await?;
            composite = composite
                .into_iter()
                .filter_map(|(row, mut slots)| {
                    let matched = row
                        .get(&join.local_column)
                        .filter(|v| !v.is_null())
                        .and_then(|v| related.get(&Key(v.clone())));
                    match (matched, join.kind) {
                        (Some(rows), _) => {
                            slots.insert(join.alias.clone(), rows.clone());
                            Some((row, slots))
                        }
                        (None, JoinKind::Required) => None,
                        (None, JoinKind::Optional) => Some((row, slots)),
                    }
                })
                .collect();
        }

        Ok(paginate(composite, query.offset, query.limit))
    }

    /// Rows of the join's table whose foreign column holds one of the
    /// driving rows' local values, grouped by that value in primary-key order.
    async fn fetch_related(
        &self,
        join: &JoinSpec,
        driving: &[(Row, Slots)],
    ) -> Result<BTreeMap<Key, Vec<Row>>> {
        let values: BTreeSet<Key> = driving
            .iter()
            .filter_map(|(row, _)| row.get(&join.local_column))
            .filter(|v| !v.is_null())
            .map(|v| Key(v.clone()))
            .collect();
        if values.is_empty() {
            return Ok(BTreeMap::new());
        }
        let lookup = Query::new().filter(Predicate::In(
            join.foreign_column.clone(),
            values.into_iter().map(Key::into_value).collect::<Vec<Value>>(),
        ));
        let mut grouped: BTreeMap<Key, Vec<Row>> = BTreeMap::new();
        for row in self.raw().query(&join.table, &lookup).await? {
            if let Some(value) = row.get(&join.foreign_column).filter(|v| !v.is_null()) {
                grouped.entry(Key(value.clone())).or_default().push(row);
            }
        }
        Ok(grouped)
    }

    /// Call `callback` for every committed change on this table that matches
    /// `filter` before or after the mutation.
    pub async fn subscribe<F>(
        &self,
        filter: Option<Predicate>,
        callback: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(TypedChange<R>) + Send + Sync + 'static,
    {
        if let Some(filter) = &filter {
            check_predicate(&self.def, filter)?;
        }
        let def = Arc::clone(&self.def);
        let raw_callback: ChangeCallback = Arc::new(move |change: &TableChange| {
            match TypedChange::decode(change, &def) {
                Ok(typed) => callback(typed),
                Err(err) => tracing::warn!(
                    table = %change.table,
                    sequence = change.sequence,
                    error = %err,
                    "dropping change that does not decode"
                ),
            }
        });
        self.raw().subscribe(self.name(), filter, raw_callback).await
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.raw().unsubscribe(handle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConstraintViolation;
    use crate::memory::{create_memory_db, memory_adapter};
    use crate::model::Col;
    use crate::row;
    use crate::schema::{boolean, number, schema, string, table};
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
        #[serde(default)]
        active: bool,
    }

    impl Model for User {
        const TABLE: &'static str = "users";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Post {
        id: String,
        author: String,
        score: f64,
    }

    impl Model for Post {
        const TABLE: &'static str = "posts";
    }

    const ID: Col<String> = Col::new("id");
    const NAME: Col<String> = Col::new("name");
    const NICKNAME: Col<Option<String>> = Col::new("nickname");
    const SCORE: Col<f64> = Col::new("score");

    fn test_schema() -> Schema {
        let users = table(
            "users",
            [
                string("id").primary_key().into(),
                string("name").into(),
                string("nickname").nullable().into(),
                boolean("active").default(true).into(),
            ],
        )
        .unwrap();
        let posts = table(
            "posts",
            [
                string("id").primary_key().into(),
                string("author").references("users", "id").into(),
                number("score").into(),
            ],
        )
        .unwrap();
        schema([users, posts]).unwrap()
    }

    async fn adapter_with(config: PersistConfig) -> TypedAdapter {
        let raw = Arc::new(memory_adapter(create_memory_db()));
        typed_adapter_with_config(raw, test_schema(), config)
            .await
            .unwrap()
    }

    async fn adapter() -> TypedAdapter {
        adapter_with(PersistConfig::default()).await
    }

    fn user(id: &str, name: &str) -> User {
        User {
            id: id.into(),
            name: name.into(),
            nickname: None,
            active: true,
        }
    }

    fn post(id: &str, author: &str, score: f64) -> Post {
        Post {
            id: id.into(),
            author: author.into(),
            score,
        }
    }

    #[tokio::test]
    async fn users_scenario() {
        let db = adapter().await;
        let users = db.table::<User>().unwrap();

        users.insert(&user("u1", "Alice")).await.unwrap();
        let found = users.query(Query::new().filter(ID.eq("u1"))).await.unwrap();
        assert_eq!(found, vec![user("u1", "Alice")]);

        let changed = users
            .update(ID.eq("u1"), Patch::new().set(&NAME, "Bob"))
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(users.find("u1").await.unwrap().unwrap().name, "Bob");

        assert_eq!(users.delete(ID.eq("u1")).await.unwrap(), 1);
        assert_eq!(users.delete(ID.eq("u1")).await.unwrap(), 0);
        assert!(users.find("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_fills_defaults_and_nulls() {
        let db = adapter().await;
        let users = db.table_named("users").unwrap();
        let stored = users
            .insert(&row! { "id" => "u1", "name" => "Alice" })
            .await
            .unwrap();
        assert_eq!(stored.get("active"), Some(&Value::Boolean(true)));
        assert_eq!(stored.get("nickname"), Some(&Value::Null));

        let err = users.insert(&row! { "id" => "u2" }).await.unwrap_err();
        assert!(matches!(
            err,
            PersistError::Constraint(ConstraintViolation::NotNull { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_ill_typed_rows_before_reaching_the_backend() {
        let db = adapter().await;
        let users = db.table_named("users").unwrap();
        let err = users
            .insert(&row! { "id" => "u1", "name" => 3 })
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::TypeMismatch { .. }));

        let err = users
            .query(Query::new().filter(Predicate::Eq("name".into(), Value::from(1))))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::TypeMismatch { .. }));

        let err = users
            .query(Query::new().filter(Predicate::Eq("missing".into(), Value::from("x"))))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::UnknownColumn { .. }));
    }

    #[tokio::test]
    async fn primary_key_patch_is_rejected() {
        let db = adapter().await;
        let users = db.table::<User>().unwrap();
        users.insert(&user("u1", "Alice")).await.unwrap();
        let err = users
            .update(ID.eq("u1"), Patch::new().set(&ID, "u9"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PersistError::Constraint(ConstraintViolation::PrimaryKeyImmutable { .. })
        ));
    }

    #[tokio::test]
    async fn strict_mutations_report_not_found() {
        let db = adapter().await;
        let users = db.table::<User>().unwrap();
        let err = users
            .update_strict(ID.eq("nope"), Patch::new().set(&NAME, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::NotFound(_)));
        let err = users.delete_strict(ID.eq("nope")).await.unwrap_err();
        assert!(matches!(err, PersistError::NotFound(_)));

        let strict = adapter_with(PersistConfig {
            strict_mutations: true,
            ..PersistConfig::default()
        })
        .await;
        let err = strict
            .table::<User>()
            .unwrap()
            .delete(ID.eq("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::NotFound(_)));
    }

    #[tokio::test]
    async fn nullable_predicates() {
        let db = adapter().await;
        let users = db.table::<User>().unwrap();
        let mut nick = user("u2", "Bea");
        nick.nickname = Some("B".into());
        users
            .insert_batch(&[user("u1", "Al"), nick])
            .await
            .unwrap();

        let unnamed = users
            .query(Query::new().filter(NICKNAME.is_null()))
            .await
            .unwrap();
        assert_eq!(unnamed.len(), 1);
        assert_eq!(unnamed[0].id, "u1");
        assert_eq!(users.count(Some(NICKNAME.is_not_null())).await.unwrap(), 1);
        assert_eq!(users.count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn joins_attach_related_rows() {
        let db = adapter().await;
        let users = db.table::<User>().unwrap();
        let posts = db.table::<Post>().unwrap();
        users
            .insert_batch(&[user("u1", "Al"), user("u2", "Bea"), user("u3", "Cy")])
            .await
            .unwrap();
        posts
            .insert_batch(&[
                post("p2", "u1", 2.0),
                post("p1", "u1", 5.0),
                post("p3", "u2", 1.0),
            ])
            .await
            .unwrap();

        let required = Query::new()
            .join(JoinSpec::required("posts", "posts", "id", "author"))
            .sort_by(NAME.asc());
        let joined = users.query_joined(required.clone()).await.unwrap();
        assert_eq!(joined.len(), 2);
        let first: Vec<Post> = joined[0].related_as("posts").unwrap().unwrap();
        assert_eq!(
            first.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["p1", "p2"]
        );
        assert_eq!(users.query(required.limit(1).offset(1)).await.unwrap()[0].id, "u2");

        let optional = users
            .query_joined(
                Query::new()
                    .join(JoinSpec::optional("posts", "posts", "id", "author"))
                    .filter(ID.eq("u3")),
            )
            .await
            .unwrap();
        assert_eq!(optional.len(), 1);
        assert!(optional[0].related("posts").is_none());
    }

    #[tokio::test]
    async fn join_on_mismatched_types_fails() {
        let db = adapter().await;
        let err = db
            .table::<Post>()
            .unwrap()
            .query(Query::new().join(JoinSpec::required("u", "users", "score", "id")))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn typed_subscription_receives_decoded_changes() {
        let db = adapter().await;
        let posts = db.table::<Post>().unwrap();
        db.table::<User>()
            .unwrap()
            .insert(&user("u1", "Al"))
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = posts
            .subscribe(Some(SCORE.gte(10.0)), move |change: TypedChange<Post>| {
                sink.lock().unwrap().push((change.operation, change.after));
            })
            .await
            .unwrap();

        posts.insert(&post("p1", "u1", 1.0)).await.unwrap();
        posts.insert(&post("p2", "u1", 12.0)).await.unwrap();
        posts
            .update(ID.eq("p2"), Patch::new().set(&SCORE, 3.0))
            .await
            .unwrap();
        posts.unsubscribe(handle).await;
        posts.delete(Predicate::all()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (ChangeOp::Insert, Some(post("p2", "u1", 12.0))));
        assert_eq!(seen[1], (ChangeOp::Update, Some(post("p2", "u1", 3.0))));
    }

    #[tokio::test]
    async fn unknown_model_table_is_rejected() {
        #[derive(Serialize, Deserialize)]
        struct Ghost {
            id: String,
        }
        impl Model for Ghost {
            const TABLE: &'static str = "ghosts";
        }
        let db = adapter().await;
        assert!(matches!(
            db.table::<Ghost>(),
            Err(PersistError::UnknownTable(name)) if name == "ghosts"
        ));
    }
}
