//! Query descriptors and pages.
//!
//! A [`QueryDescriptor`] is produced by the upstream query builder. The
//! adapter never inspects the query text; it only forwards it and interprets
//! the shape of the store's response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::document::ResourceDocument;

/// Alias under which search queries project the resource document.
pub const ROOT_ALIAS: &str = "r";

/// A named query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParameter {
    /// Parameter name, including the store's sigil (e.g. `@resourceType`).
    pub name: String,
    /// Parameter value.
    pub value: Value,
}

/// Query text plus bound parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Store query text.
    pub text: String,
    /// Bound parameters.
    pub parameters: Vec<QueryParameter>,
}

impl QuerySpec {
    /// Creates a query without parameters.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    /// Binds a parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.push(QueryParameter {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

/// Which partitions a query covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueryPartition {
    /// Fan out over all partitions.
    #[default]
    All,
    /// Restrict to one partition key.
    Single(String),
}

/// Opaque query produced by the query builder.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    /// Partition scope.
    pub partition: QueryPartition,
    /// Filter and projection.
    pub query: QuerySpec,
    /// Page size; must be greater than zero.
    pub max_item_count: u32,
    /// Raw store continuation, used when no opaque cursor is supplied.
    pub continuation: Option<String>,
    /// Return only the total count.
    pub count_only: bool,
    /// Property each result item nests the document under, if any.
    pub root_alias: Option<String>,
}

impl QueryDescriptor {
    /// Creates a cross-partition descriptor with a page size of 10.
    pub fn new(query: QuerySpec) -> Self {
        Self {
            partition: QueryPartition::All,
            query,
            max_item_count: 10,
            continuation: None,
            count_only: false,
            root_alias: None,
        }
    }

    /// Sets the page size.
    pub fn with_max_item_count(mut self, max_item_count: u32) -> Self {
        self.max_item_count = max_item_count;
        self
    }

    /// Restricts the query to one partition.
    pub fn in_partition(mut self, partition_key: impl Into<String>) -> Self {
        self.partition = QueryPartition::Single(partition_key.into());
        self
    }

    /// Resumes from a raw store continuation.
    pub fn with_continuation(mut self, continuation: impl Into<String>) -> Self {
        self.continuation = Some(continuation.into());
        self
    }

    /// Asks for the total count only.
    pub fn count_only(mut self) -> Self {
        self.count_only = true;
        self
    }

    /// Unwraps result items from the given property.
    pub fn with_root_alias(mut self, alias: impl Into<String>) -> Self {
        self.root_alias = Some(alias.into());
        self
    }

    /// Partition key to pass to the store, if the query is single-partition.
    pub fn partition_key(&self) -> Option<&str> {
        match &self.partition {
            QueryPartition::All => None,
            QueryPartition::Single(key) => Some(key),
        }
    }
}

/// Caller-held pagination state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PaginationState {
    /// Opaque cursor returned by the previous page, if continuing.
    pub cursor: Option<String>,
}

impl PaginationState {
    /// Starts from the first page.
    pub fn first_page() -> Self {
        Self::default()
    }

    /// Continues from an opaque cursor.
    pub fn from_cursor(cursor: impl Into<String>) -> Self {
        Self {
            cursor: Some(cursor.into()),
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryPage {
    /// Documents in store order. Empty for count-only queries.
    pub documents: Vec<ResourceDocument>,
    /// Opaque cursor for the next page; `None` at the end of the results.
    pub next_cursor: Option<String>,
    /// Total count, for count-only queries.
    pub total_count: Option<u64>,
}

impl QueryPage {
    /// Whether another page can be fetched.
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}
