//! Document-store layer: schemaless collections of versioned JSON documents
//! with one-shot queries, live subscriptions and atomic read-then-write
//! transactions. The rest of the crate only talks to this API.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

mod memory;

pub use memory::{MemoryStore, Txn};

/// Collection names used by the storefront.
pub mod collections {
    pub const PRODUCTS: &str = "products";
    pub const CARTS: &str = "carts";
    pub const ORDERS: &str = "orders";
    pub const USERS: &str = "users";
    pub const AUDIT_LOGS: &str = "audit_logs";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {id} not found in `{collection}`")]
    NotFound { collection: &'static str, id: Uuid },

    #[error("transaction aborted after {attempts} conflicting attempts")]
    TransactionConflict { attempts: u32 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored document: its id, a write-version used for conflict detection,
/// and the JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub version: u64,
    pub data: Value,
}

impl Document {
    pub fn to<T: DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

#[derive(Debug, Clone)]
enum Clause {
    FieldEq { field: &'static str, value: Value },
    IdIn(Vec<Uuid>),
}

/// Conjunction of equality clauses, the query subset the repositories need.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn field_eq(mut self, field: &'static str, value: Value) -> Self {
        self.clauses.push(Clause::FieldEq { field, value });
        self
    }

    /// Membership test on document ids, the batch-fetch primitive used by
    /// cart reconciliation.
    pub fn id_in(mut self, ids: Vec<Uuid>) -> Self {
        self.clauses.push(Clause::IdIn(ids));
        self
    }

    fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::FieldEq { field, value } => doc.data.get(field) == Some(value),
            Clause::IdIn(ids) => ids.contains(&doc.id),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    field: &'static str,
    direction: Direction,
}

impl OrderBy {
    pub fn asc(field: &'static str) -> Self {
        Self {
            field,
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: &'static str) -> Self {
        Self {
            field,
            direction: Direction::Desc,
        }
    }

    fn sort(&self, docs: &mut [Document]) {
        docs.sort_by(|a, b| {
            let ordering = cmp_values(
                a.data.get(self.field).unwrap_or(&Value::Null),
                b.data.get(self.field).unwrap_or(&Value::Null),
            );
            match self.direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            }
        });
    }
}

/// Comparison over the JSON value kinds that appear in ordering fields.
/// RFC 3339 UTC timestamps compare correctly as strings.
fn cmp_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}
