//! The conformance cases. Each receives a freshly reset and opened fixture
//! and fails by panicking.

use std::sync::{Arc, Mutex};

use impress_persist::{
    create_memory_db, memory_adapter, ChangeOp, ConstraintViolation, JoinSpec, Key, Patch,
    PersistError, Predicate, Query, Row, TableChange, TableHandle, TypedChange, Value,
};
use serde_json::json;

use crate::fixture::*;

fn violation(err: &PersistError) -> Option<&ConstraintViolation> {
    match err {
        PersistError::Constraint(v) => Some(v),
        _ => None,
    }
}

async fn seed_people(fx: &Fixture) {
    fx.users
        .insert_batch(&people())
        .await
        .expect("seeding users");
}

async fn seed_conversations(fx: &Fixture) {
    fx.conversations
        .insert_batch(&[
            conversation("c1", "u1", 0),
            conversation("c2", "u1", 10),
            conversation("c3", "u3", 20),
        ])
        .await
        .expect("seeding conversations");
}

async fn ids(users: &TableHandle<User>, query: Query) -> Vec<String> {
    users
        .query(query)
        .await
        .expect("query")
        .into_iter()
        .map(|u| u.id)
        .collect()
}

async fn matching(fx: &Fixture, pred: Predicate) -> Vec<String> {
    ids(&fx.users, Query::new().filter(pred)).await
}

pub async fn insert_and_find_round_trip(fx: Fixture) {
    let alice = User {
        email: Some("alice@example.com".into()),
        ..user("u1", "Alice")
    };
    assert_eq!(fx.users.insert(&alice).await.unwrap(), alice);
    assert_eq!(fx.users.find("u1").await.unwrap(), Some(alice));
    assert_eq!(fx.users.find("nobody").await.unwrap(), None);

    let conv = conversation("c1", "u1", 0);
    assert_eq!(fx.conversations.insert(&conv).await.unwrap(), conv);
    let msg = Message {
        metadata: Some(json!({ "reactions": ["+1"], "edited": false })),
        ..message("m1", "c1", "u1", 5)
    };
    fx.messages.insert(&msg).await.unwrap();
    assert_eq!(fx.messages.find("m1").await.unwrap(), Some(msg));
    assert_eq!(fx.messages.count(None).await.unwrap(), 1);
}

pub async fn users_scenario(fx: Fixture) {
    fx.users.insert(&user("u1", "Alice")).await.unwrap();
    let found = fx
        .users
        .query(Query::new().filter(User::ID.eq("u1")))
        .await
        .unwrap();
    assert_eq!(found, vec![user("u1", "Alice")]);

    let changed = fx
        .users
        .update(User::ID.eq("u1"), Patch::new().set(&User::NAME, "Bob"))
        .await
        .unwrap();
    assert_eq!(changed, 1);
    let found = fx.users.find("u1").await.unwrap().unwrap();
    assert_eq!(found.name, "Bob");

    assert_eq!(fx.users.delete(User::ID.eq("u1")).await.unwrap(), 1);
    assert_eq!(fx.users.delete(User::ID.eq("u1")).await.unwrap(), 0);
}

pub async fn insert_fills_defaults(fx: Fixture) {
    let users = fx.db.table_named("users").unwrap();
    let stored = users
        .insert(&impress_persist::row! { "id" => "u1", "name" => "Alice" })
        .await
        .unwrap();
    assert_eq!(stored.get("age"), Some(&Value::Number(0.0)));
    assert_eq!(stored.get("active"), Some(&Value::Boolean(true)));
    assert_eq!(stored.get("email"), Some(&Value::Null));
    assert_eq!(
        fx.users.find("u1").await.unwrap(),
        Some(User {
            age: 0.0,
            ..user("u1", "Alice")
        })
    );

    let err = users
        .insert(&impress_persist::row! { "id" => "u2" })
        .await
        .unwrap_err();
    assert!(matches!(
        violation(&err),
        Some(ConstraintViolation::NotNull { column, .. }) if column == "name"
    ));
}

pub async fn duplicate_primary_key_rejected(fx: Fixture) {
    fx.users.insert(&user("u1", "Alice")).await.unwrap();
    let err = fx.users.insert(&user("u1", "Impostor")).await.unwrap_err();
    assert!(matches!(
        violation(&err),
        Some(ConstraintViolation::DuplicatePrimaryKey { .. })
    ));
    assert_eq!(fx.users.count(None).await.unwrap(), 1);
    assert_eq!(fx.users.find("u1").await.unwrap().unwrap().name, "Alice");
}

pub async fn unique_violation_rejected(fx: Fixture) {
    seed_people(&fx).await;
    let clash = User {
        email: Some("alice@example.com".into()),
        ..user("u5", "Eve")
    };
    let err = fx.users.insert(&clash).await.unwrap_err();
    assert!(matches!(
        violation(&err),
        Some(ConstraintViolation::Unique { column, .. }) if column == "email"
    ));

    // nulls never collide
    fx.users.insert(&user("u6", "Frank")).await.unwrap();

    let err = fx
        .users
        .update(
            User::ID.eq("u3"),
            Patch::new().set(&User::EMAIL, Some("alice@example.com".to_string())),
        )
        .await
        .unwrap_err();
    assert!(violation(&err).is_some());
    let carol = fx.users.find("u3").await.unwrap().unwrap();
    assert_eq!(carol.email.as_deref(), Some("carol@example.com"));
}

pub async fn foreign_key_violation_rejected(fx: Fixture) {
    seed_people(&fx).await;
    let err = fx
        .conversations
        .insert(&conversation("c1", "ghost", 0))
        .await
        .unwrap_err();
    assert!(matches!(
        violation(&err),
        Some(ConstraintViolation::ForeignKey { target_table, .. }) if target_table == "users"
    ));

    fx.conversations
        .insert(&conversation("c1", "u1", 0))
        .await
        .unwrap();
    let err = fx
        .messages
        .insert(&message("m1", "missing", "u1", 1))
        .await
        .unwrap_err();
    assert!(matches!(
        violation(&err),
        Some(ConstraintViolation::ForeignKey { target_table, .. }) if target_table == "conversations"
    ));

    let err = fx
        .conversations
        .update(
            Conversation::ID.eq("c1"),
            Patch::new().set(&Conversation::OWNER_ID, "ghost"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        violation(&err),
        Some(ConstraintViolation::ForeignKey { .. })
    ));
    let moved = fx
        .conversations
        .update(
            Conversation::ID.eq("c1"),
            Patch::new().set(&Conversation::OWNER_ID, "u2"),
        )
        .await
        .unwrap();
    assert_eq!(moved, 1);
}

pub async fn primary_key_is_immutable(fx: Fixture) {
    fx.users.insert(&user("u1", "Alice")).await.unwrap();
    let err = fx
        .users
        .update(User::ID.eq("u1"), Patch::new().set(&User::ID, "u2"))
        .await
        .unwrap_err();
    assert!(matches!(
        violation(&err),
        Some(ConstraintViolation::PrimaryKeyImmutable { .. })
    ));
    assert!(fx.users.find("u1").await.unwrap().is_some());
}

pub async fn failed_mutations_leave_state_unchanged(fx: Fixture) {
    seed_people(&fx).await;
    let log = ChangeLog::new();
    fx.raw()
        .subscribe("users", None, log.callback())
        .await
        .unwrap();
    let before = fx.snapshot().await.unwrap();

    // second row collides with the first inside the same patch
    let err = fx
        .users
        .update(
            User::AGE.eq(34.0),
            Patch::new().set(&User::EMAIL, Some("shared@example.com".to_string())),
        )
        .await
        .unwrap_err();
    assert!(violation(&err).is_some());

    let err = fx
        .users
        .insert_batch(&[user("u7", "Gus"), user("u1", "Dup")])
        .await
        .unwrap_err();
    assert!(violation(&err).is_some());

    let err = fx
        .db
        .table_named("users")
        .unwrap()
        .insert(&impress_persist::row! { "id" => "u8", "name" => 8 })
        .await
        .unwrap_err();
    assert!(matches!(err, PersistError::TypeMismatch { .. }));

    assert_eq!(fx.snapshot().await.unwrap(), before);
    assert!(log.is_empty(), "failed mutations emitted {:?}", log.changes());
}

pub async fn comparison_operators(fx: Fixture) {
    seed_people(&fx).await;
    assert_eq!(matching(&fx, User::AGE.eq(34.0)).await, ["u1", "u3"]);
    assert_eq!(matching(&fx, User::AGE.neq(34.0)).await, ["u2", "u4"]);
    assert_eq!(matching(&fx, User::AGE.lt(27.0)).await, ["u4"]);
    assert_eq!(matching(&fx, User::AGE.lte(27.0)).await, ["u2", "u4"]);
    assert_eq!(matching(&fx, User::AGE.gt(27.0)).await, ["u1", "u3"]);
    assert_eq!(matching(&fx, User::AGE.gte(27.0)).await, ["u1", "u2", "u3"]);
    assert_eq!(matching(&fx, User::NAME.gt("Bob")).await, ["u3", "u4"]);
    assert_eq!(
        matching(&fx, User::NAME.is_in(["Bob", "Dave", "Zed"])).await,
        ["u2", "u4"]
    );
    assert!(matching(&fx, User::NAME.is_in(Vec::<String>::new()))
        .await
        .is_empty());
    assert_eq!(matching(&fx, User::ACTIVE.eq(false)).await, ["u2"]);

    // null handling
    assert_eq!(matching(&fx, User::EMAIL.is_null()).await, ["u2", "u4"]);
    assert_eq!(matching(&fx, User::EMAIL.is_not_null()).await, ["u1", "u3"]);
    assert_eq!(
        matching(&fx, User::EMAIL.eq(Some("alice@example.com".to_string()))).await,
        ["u1"]
    );
    // null cells have no ordering
    assert_eq!(
        matching(&fx, User::EMAIL.lt(Some("z".to_string()))).await,
        ["u1", "u3"]
    );
}

pub async fn timestamp_ordering(fx: Fixture) {
    seed_people(&fx).await;
    seed_conversations(&fx).await;
    let recent = fx
        .conversations
        .query(
            Query::new()
                .filter(Conversation::CREATED_AT.gte(at(10)))
                .sort_by(Conversation::CREATED_AT.desc()),
        )
        .await
        .unwrap();
    let ids: Vec<_> = recent.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, ["c3", "c2"]);
}

pub async fn predicate_combinators(fx: Fixture) {
    seed_people(&fx).await;
    assert_eq!(
        matching(&fx, User::AGE.eq(34.0).and(User::ACTIVE.eq(true))).await,
        ["u1", "u3"]
    );
    assert_eq!(
        matching(&fx, User::NAME.eq("Alice").or(User::NAME.eq("Dave"))).await,
        ["u1", "u4"]
    );
    assert_eq!(matching(&fx, !User::ACTIVE.eq(true)).await, ["u2"]);
    assert_eq!(
        matching(
            &fx,
            User::AGE
                .lt(20.0)
                .or(User::AGE.gt(30.0))
                .and(!User::NAME.eq("Carol"))
        )
        .await,
        ["u1", "u4"]
    );
    assert_eq!(
        matching(&fx, Predicate::And(Vec::new())).await,
        ["u1", "u2", "u3", "u4"]
    );
    assert!(matching(&fx, Predicate::Or(Vec::new())).await.is_empty());
    assert_eq!(
        matching(&fx, !User::EMAIL.eq(Some("alice@example.com".to_string()))).await,
        ["u2", "u3", "u4"]
    );
}

pub async fn sort_is_deterministic(fx: Fixture) {
    seed_people(&fx).await;
    let by_age = Query::new().sort_by(User::AGE.desc());
    assert_eq!(ids(&fx.users, by_age.clone()).await, ["u1", "u3", "u2", "u4"]);
    assert_eq!(ids(&fx.users, by_age).await, ["u1", "u3", "u2", "u4"]);

    let multi = Query::new()
        .sort_by(User::ACTIVE.asc())
        .sort_by(User::NAME.desc());
    assert_eq!(ids(&fx.users, multi).await, ["u2", "u4", "u3", "u1"]);

    // nulls sort first, ties fall back to the primary key
    let by_email = Query::new().sort_by(User::EMAIL.asc());
    assert_eq!(ids(&fx.users, by_email).await, ["u2", "u4", "u1", "u3"]);
}

pub async fn pagination(fx: Fixture) {
    seed_people(&fx).await;
    let by_name = || Query::new().sort_by(User::NAME.asc());
    assert_eq!(ids(&fx.users, by_name().offset(1).limit(2)).await, ["u2", "u3"]);
    assert_eq!(ids(&fx.users, by_name().offset(3)).await, ["u4"]);
    assert!(ids(&fx.users, by_name().offset(10)).await.is_empty());
    assert!(ids(&fx.users, by_name().limit(0)).await.is_empty());
}

pub async fn required_join(fx: Fixture) {
    seed_people(&fx).await;
    seed_conversations(&fx).await;
    let owned = Query::new().join(JoinSpec::required(
        "conversations",
        "conversations",
        "id",
        "owner_id",
    ));
    let rows = fx.users.query_joined(owned.clone()).await.unwrap();
    let shape: Vec<(String, Vec<String>)> = rows
        .iter()
        .map(|j| {
            let convs: Vec<Conversation> = j.related_as("conversations").unwrap().unwrap();
            (j.row.id.clone(), convs.into_iter().map(|c| c.id).collect())
        })
        .collect();
    assert_eq!(
        shape,
        vec![
            ("u1".to_string(), vec!["c1".to_string(), "c2".to_string()]),
            ("u3".to_string(), vec!["c3".to_string()]),
        ]
    );
    // pagination applies after the join dropped unmatched rows
    assert_eq!(ids(&fx.users, owned.offset(1).limit(1)).await, ["u3"]);

    fx.messages
        .insert(&message("m1", "c3", "u2", 30))
        .await
        .unwrap();
    let threaded = fx
        .messages
        .query_joined(
            Query::new()
                .join(JoinSpec::required(
                    "conversation",
                    "conversations",
                    "conversation_id",
                    "id",
                ))
                .join(JoinSpec::required("author", "users", "author_id", "id")),
        )
        .await
        .unwrap();
    assert_eq!(threaded.len(), 1);
    let author: Vec<User> = threaded[0].related_as("author").unwrap().unwrap();
    assert_eq!(author[0].name, "Bob");
    let conv = threaded[0].related("conversation").unwrap();
    assert_eq!(conv[0].get("owner_id"), Some(&Value::from("u3")));
}

pub async fn optional_join(fx: Fixture) {
    seed_people(&fx).await;
    let query = Query::new()
        .join(JoinSpec::optional(
            "conversations",
            "conversations",
            "id",
            "owner_id",
        ))
        .sort_by(User::NAME.asc());

    let rows = fx.users.query_joined(query.clone()).await.unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|j| j.related("conversations").is_none()));

    seed_conversations(&fx).await;
    let rows = fx.users.query_joined(query).await.unwrap();
    let counts: Vec<(String, Option<usize>)> = rows
        .iter()
        .map(|j| {
            (
                j.row.id.clone(),
                j.related("conversations").map(<[Row]>::len),
            )
        })
        .collect();
    assert_eq!(
        counts,
        vec![
            ("u1".to_string(), Some(2)),
            ("u2".to_string(), None),
            ("u3".to_string(), Some(1)),
            ("u4".to_string(), None),
        ]
    );
}

pub async fn subscription_delivers_each_change_once_in_order(fx: Fixture) {
    let first = ChangeLog::new();
    let second = ChangeLog::new();
    fx.raw()
        .subscribe("users", None, first.callback())
        .await
        .unwrap();
    fx.raw()
        .subscribe("users", None, second.callback())
        .await
        .unwrap();

    fx.users
        .insert_batch(&[user("u1", "Alice"), user("u2", "Bob")])
        .await
        .unwrap();
    fx.users
        .update(Predicate::all(), Patch::new().set(&User::AGE, 40.0))
        .await
        .unwrap();
    fx.users.delete(User::ID.eq("u1")).await.unwrap();
    fx.users.delete(User::ID.eq("u1")).await.unwrap();

    let changes = first.changes();
    let shape: Vec<(ChangeOp, String)> = changes
        .iter()
        .map(|c| (c.operation, c.primary_key.to_string()))
        .collect();
    let key = |id: &str| Key::from(id).to_string();
    assert_eq!(
        shape,
        vec![
            (ChangeOp::Insert, key("u1")),
            (ChangeOp::Insert, key("u2")),
            (ChangeOp::Update, key("u1")),
            (ChangeOp::Update, key("u2")),
            (ChangeOp::Delete, key("u1")),
        ]
    );
    assert!(changes.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(second.changes(), changes);
}

pub async fn subscription_payloads(fx: Fixture) {
    let seen: Arc<Mutex<Vec<TypedChange<User>>>> = Arc::default();
    let sink = Arc::clone(&seen);
    fx.users
        .subscribe(None, move |change| sink.lock().unwrap().push(change))
        .await
        .unwrap();

    let alice = user("u1", "Alice");
    let renamed = User {
        name: "Alicia".into(),
        ..alice.clone()
    };
    fx.users.insert(&alice).await.unwrap();
    fx.users
        .update(User::ID.eq("u1"), Patch::new().set(&User::NAME, "Alicia"))
        .await
        .unwrap();
    fx.users.delete(User::ID.eq("u1")).await.unwrap();

    let seen = seen.lock().unwrap();
    let payloads: Vec<_> = seen
        .iter()
        .map(|c| {
            (
                c.table.as_str(),
                c.operation,
                c.primary_key.clone(),
                c.before.clone(),
                c.after.clone(),
            )
        })
        .collect();
    assert_eq!(
        payloads,
        vec![
            ("users", ChangeOp::Insert, Key::from("u1"), None, Some(alice.clone())),
            (
                "users",
                ChangeOp::Update,
                Key::from("u1"),
                Some(alice),
                Some(renamed.clone())
            ),
            ("users", ChangeOp::Delete, Key::from("u1"), Some(renamed), None),
        ]
    );
}

pub async fn subscription_filter_and_unsubscribe(fx: Fixture) {
    let alices = ChangeLog::new();
    let everything = ChangeLog::new();
    let handle = fx
        .raw()
        .subscribe("users", Some(User::NAME.eq("Alice")), alices.callback())
        .await
        .unwrap();
    fx.raw()
        .subscribe("conversations", None, everything.callback())
        .await
        .unwrap();

    fx.users.insert(&user("u1", "Alice")).await.unwrap();
    fx.users.insert(&user("u2", "Bob")).await.unwrap();
    // leaves the filter: still reported
    fx.users
        .update(User::ID.eq("u1"), Patch::new().set(&User::NAME, "Alicia"))
        .await
        .unwrap();
    // matches neither before nor after
    fx.users
        .update(User::ID.eq("u1"), Patch::new().set(&User::NAME, "Ally"))
        .await
        .unwrap();
    assert_eq!(alices.len(), 2);
    assert!(everything.is_empty());

    fx.db.unsubscribe(handle).await;
    fx.db.unsubscribe(handle).await;
    fx.users.insert(&user("u3", "Alice")).await.unwrap();
    assert_eq!(alices.len(), 2);
}

pub async fn panicking_subscriber_is_isolated(fx: Fixture) {
    let log = ChangeLog::new();
    fx.raw()
        .subscribe(
            "users",
            None,
            Arc::new(|_: &TableChange| panic!("subscriber failure")),
        )
        .await
        .unwrap();
    fx.raw()
        .subscribe("users", None, log.callback())
        .await
        .unwrap();

    fx.users.insert(&user("u1", "Alice")).await.unwrap();
    assert_eq!(log.len(), 1);
    assert!(fx.users.find("u1").await.unwrap().is_some());
}

pub async fn subscriber_reads_post_mutation_state(fx: Fixture) {
    let snapshots: Arc<Mutex<Vec<(ChangeOp, Vec<(String, f64)>)>>> = Arc::default();
    let sink = Arc::clone(&snapshots);
    let raw = Arc::clone(fx.raw());
    fx.raw()
        .subscribe(
            "users",
            None,
            Arc::new(move |change: &TableChange| {
                let rows = futures::executor::block_on(raw.query("users", &Query::new()))
                    .expect("query from inside a callback");
                let state = rows
                    .iter()
                    .map(|row| {
                        let id = row.get("id").map(ToString::to_string).unwrap_or_default();
                        let age = match row.get("age") {
                            Some(Value::Number(age)) => *age,
                            _ => f64::NAN,
                        };
                        (id, age)
                    })
                    .collect();
                sink.lock().unwrap().push((change.operation, state));
            }),
        )
        .await
        .unwrap();

    fx.users.insert(&user("u1", "Alice")).await.unwrap();
    fx.users
        .update(User::ID.eq("u1"), Patch::new().set(&User::AGE, 41.0))
        .await
        .unwrap();
    fx.users.delete(User::ID.eq("u1")).await.unwrap();

    let id = Value::from("u1").to_string();
    assert_eq!(
        *snapshots.lock().unwrap(),
        vec![
            (ChangeOp::Insert, vec![(id.clone(), 30.0)]),
            (ChangeOp::Update, vec![(id, 41.0)]),
            (ChangeOp::Delete, vec![]),
        ]
    );
}

pub async fn delete_is_idempotent(fx: Fixture) {
    let log = ChangeLog::new();
    fx.raw()
        .subscribe("users", None, log.callback())
        .await
        .unwrap();
    assert_eq!(fx.users.delete(Predicate::all()).await.unwrap(), 0);
    fx.users.insert(&user("u1", "Alice")).await.unwrap();
    assert_eq!(fx.users.delete(User::ID.eq("u1")).await.unwrap(), 1);
    assert_eq!(fx.users.delete(User::ID.eq("u1")).await.unwrap(), 0);
    assert!(matches!(
        fx.users.delete_strict(User::ID.eq("u1")).await,
        Err(PersistError::NotFound(_))
    ));
    assert_eq!(log.len(), 2);
}

pub async fn batch_insert_is_atomic(fx: Fixture) {
    seed_people(&fx).await;
    fx.conversations
        .insert(&conversation("c1", "u1", 0))
        .await
        .unwrap();
    let err = fx
        .messages
        .insert_batch(&[
            message("m1", "c1", "u1", 1),
            message("m2", "c1", "ghost", 2),
        ])
        .await
        .unwrap_err();
    assert!(matches!(
        violation(&err),
        Some(ConstraintViolation::ForeignKey { .. })
    ));
    assert_eq!(fx.messages.count(None).await.unwrap(), 0);

    let stored = fx
        .messages
        .insert_batch(&[message("m9", "c1", "u2", 3), message("m1", "c1", "u1", 1)])
        .await
        .unwrap();
    let order: Vec<_> = stored.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(order, ["m9", "m1"]);
    assert_eq!(
        fx.messages
            .count(Some(Message::CONVERSATION_ID.eq("c1")))
            .await
            .unwrap(),
        2
    );
}

/// Stable label for a step's outcome, comparable across backends.
fn outcome(result: impress_persist::Result<usize>) -> String {
    match result {
        Ok(n) => format!("ok {n}"),
        Err(PersistError::Constraint(v)) => match v {
            ConstraintViolation::DuplicatePrimaryKey { .. } => "duplicate primary key".into(),
            ConstraintViolation::Unique { column, .. } => format!("unique {column}"),
            ConstraintViolation::ForeignKey { column, .. } => format!("foreign key {column}"),
            ConstraintViolation::NotNull { column, .. } => format!("not null {column}"),
            ConstraintViolation::PrimaryKeyImmutable { .. } => "primary key immutable".into(),
        },
        Err(other) => format!("error {other}"),
    }
}

async fn mixed_script(fx: &Fixture) -> Vec<String> {
    let users = &fx.users;
    let convs = &fx.conversations;
    let msgs = &fx.messages;
    vec![
        outcome(users.insert_batch(&people()).await.map(|r| r.len())),
        outcome(
            convs
                .insert_batch(&[conversation("c1", "u1", 0), conversation("c2", "u3", 1)])
                .await
                .map(|r| r.len()),
        ),
        outcome(
            msgs.insert_batch(&[
                message("m1", "c1", "u1", 2),
                message("m2", "c1", "u2", 3),
                message("m3", "c2", "u3", 4),
            ])
            .await
            .map(|r| r.len()),
        ),
        outcome(users.insert(&user("u1", "Again")).await.map(|_| 1)),
        outcome(
            users
                .update(User::AGE.lt(30.0), Patch::new().set(&User::AGE, 30.0))
                .await,
        ),
        outcome(
            msgs.update(
                Message::CONVERSATION_ID.eq("c1"),
                Patch::new().set(&Message::BODY, "edited"),
            )
            .await,
        ),
        outcome(convs.insert(&conversation("c3", "ghost", 5)).await.map(|_| 1)),
        outcome(msgs.delete(Message::AUTHOR_ID.eq("u2")).await),
        outcome(
            users
                .update(
                    User::ID.eq("u3"),
                    Patch::new().set(&User::EMAIL, Some("alice@example.com".to_string())),
                )
                .await,
        ),
        outcome(msgs.delete(Message::ID.eq("m404")).await),
        outcome(
            convs
                .update(
                    Conversation::ID.eq("c2"),
                    Patch::new().set(&Conversation::ARCHIVED, true),
                )
                .await,
        ),
        outcome(users.delete(User::ACTIVE.eq(false)).await),
        outcome(
            msgs.insert_batch(&[message("m4", "c2", "u4", 6), message("m5", "c1", "u1", 7)])
                .await
                .map(|r| r.len()),
        ),
        outcome(
            users
                .update(
                    User::NAME.is_in(["Alice", "Dave"]),
                    Patch::new().set(&User::ACTIVE, false),
                )
                .await,
        ),
    ]
}

struct Observed {
    outcomes: Vec<String>,
    changes: Vec<TableChange>,
    snapshot: Vec<Vec<Row>>,
}

async fn observe(fx: &Fixture) -> Observed {
    let log = ChangeLog::new();
    for table in ["users", "conversations", "messages"] {
        fx.raw()
            .subscribe(table, None, log.callback())
            .await
            .expect("subscribe");
    }
    let outcomes = mixed_script(fx).await;
    let mut changes = log.changes();
    assert!(
        changes.windows(2).all(|w| w[0].sequence < w[1].sequence),
        "change sequence must be strictly increasing"
    );
    // absolute sequence numbers are backend specific
    changes.iter_mut().for_each(|c| c.sequence = 0);
    Observed {
        outcomes,
        changes,
        snapshot: fx.snapshot().await.expect("snapshot"),
    }
}

pub async fn mixed_sequence_matches_memory(fx: Fixture) {
    let reference = Fixture::open(Arc::new(memory_adapter(create_memory_db())))
        .await
        .expect("reference memory adapter");
    let expected = observe(&reference).await;
    let actual = observe(&fx).await;

    assert_eq!(actual.outcomes, expected.outcomes);
    assert_eq!(actual.changes.len(), expected.changes.len());
    for (i, (a, e)) in actual.changes.iter().zip(&expected.changes).enumerate() {
        assert_eq!(a, e, "change #{i} differs from the memory adapter");
    }
    assert_eq!(actual.snapshot, expected.snapshot);
}
