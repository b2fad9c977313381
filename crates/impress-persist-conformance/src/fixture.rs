//! The schema, row types and helpers every case runs against.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

use impress_persist::{
    boolean, json, number, schema, string, table, timestamp, ChangeCallback, Col, Model,
    Query, RawAdapter, Result, Row, Schema, SchemaError, TableChange, TableHandle,
    TypedAdapter,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub age: f64,
    pub active: bool,
}

impl Model for User {
    const TABLE: &'static str = "users";
}

impl User {
    pub const ID: Col<String> = Col::new("id");
    pub const NAME: Col<String> = Col::new("name");
    pub const EMAIL: Col<Option<String>> = Col::new("email");
    pub const AGE: Col<f64> = Col::new("age");
    pub const ACTIVE: Col<bool> = Col::new("active");
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub owner_id: String,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

impl Model for Conversation {
    const TABLE: &'static str = "conversations";
}

impl Conversation {
    pub const ID: Col<String> = Col::new("id");
    pub const OWNER_ID: Col<String> = Col::new("owner_id");
    pub const ARCHIVED: Col<bool> = Col::new("archived");
    pub const CREATED_AT: Col<DateTime<Utc>> = Col::new("created_at");
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub author_id: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

impl Model for Message {
    const TABLE: &'static str = "messages";
}

impl Message {
    pub const ID: Col<String> = Col::new("id");
    pub const CONVERSATION_ID: Col<String> = Col::new("conversation_id");
    pub const AUTHOR_ID: Col<String> = Col::new("author_id");
    pub const BODY: Col<String> = Col::new("body");
    pub const SENT_AT: Col<DateTime<Utc>> = Col::new("sent_at");
}

/// users ← conversations.owner_id, conversations ← messages.conversation_id,
/// users ← messages.author_id.
pub fn fixture_schema() -> std::result::Result<Schema, SchemaError> {
    let users = table(
        "users",
        [
            string("id").primary_key().into(),
            string("name").into(),
            string("email").nullable().unique().into(),
            number("age").default(0.0).into(),
            boolean("active").default(true).into(),
        ],
    )?;
    let conversations = table(
        "conversations",
        [
            string("id").primary_key().into(),
            string("title").into(),
            string("owner_id").references("users", "id").into(),
            boolean("archived").default(false).into(),
            timestamp("created_at").into(),
        ],
    )?;
    let messages = table(
        "messages",
        [
            string("id").primary_key().into(),
            string("conversation_id")
                .references("conversations", "id")
                .into(),
            string("author_id").references("users", "id").into(),
            string("body").into(),
            timestamp("sent_at").into(),
            json("metadata").nullable().into(),
        ],
    )?;
    schema([users, conversations, messages])
}

/// A typed adapter opened on the fixture schema, with a handle per table.
pub struct Fixture {
    pub db: TypedAdapter,
    pub users: TableHandle<User>,
    pub conversations: TableHandle<Conversation>,
    pub messages: TableHandle<Message>,
}

impl Fixture {
    pub async fn open(raw: Arc<dyn RawAdapter>) -> Result<Self> {
        let db = impress_persist::typed_adapter(raw, fixture_schema()?).await?;
        Ok(Self {
            users: db.table()?,
            conversations: db.table()?,
            messages: db.table()?,
            db,
        })
    }

    pub fn raw(&self) -> &Arc<dyn RawAdapter> {
        self.db.raw()
    }

    /// Every row of every fixture table, in primary-key order.
    pub async fn snapshot(&self) -> Result<Vec<Vec<Row>>> {
        let mut tables = Vec::new();
        for name in [User::TABLE, Conversation::TABLE, Message::TABLE] {
            tables.push(self.raw().query(name, &Query::new()).await?);
        }
        Ok(tables)
    }
}

/// Fixed point in time plus `minutes`.
pub fn at(minutes: i64) -> DateTime<Utc> {
    DateTime::<Utc>::default() + Duration::days(19_723) + Duration::minutes(minutes)
}

pub fn user(id: &str, name: &str) -> User {
    User {
        id: id.into(),
        name: name.into(),
        email: None,
        age: 30.0,
        active: true,
    }
}

pub fn conversation(id: &str, owner_id: &str, minute: i64) -> Conversation {
    Conversation {
        id: id.into(),
        title: format!("conversation {id}"),
        owner_id: owner_id.into(),
        archived: false,
        created_at: at(minute),
    }
}

pub fn message(id: &str, conversation_id: &str, author_id: &str, minute: i64) -> Message {
    Message {
        id: id.into(),
        conversation_id: conversation_id.into(),
        author_id: author_id.into(),
        body: format!("message {id}"),
        sent_at: at(minute),
        metadata: None,
    }
}

/// Four users: two aged 34, one inactive, two without email.
pub fn people() -> Vec<User> {
    vec![
        User {
            email: Some("alice@example.com".into()),
            age: 34.0,
            ..user("u1", "Alice")
        },
        User {
            age: 27.0,
            active: false,
            ..user("u2", "Bob")
        },
        User {
            email: Some("carol@example.com".into()),
            age: 34.0,
            ..user("u3", "Carol")
        },
        User {
            age: 19.0,
            ..user("u4", "Dave")
        },
    ]
}

/// Records every change delivered to its callbacks.
#[derive(Clone, Default)]
pub struct ChangeLog(Arc<Mutex<Vec<TableChange>>>);

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> ChangeCallback {
        let log = Arc::clone(&self.0);
        Arc::new(move |change: &TableChange| {
            log.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(change.clone());
        })
    }

    pub fn changes(&self) -> Vec<TableChange> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
