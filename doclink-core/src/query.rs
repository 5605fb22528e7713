//! Query specifications sent to a feed.
//!
//! The query text is opaque to the access layer and evaluated by the service; this module only
//! packages it with its named parameters in the shape the service expects.
//!
//! ```ignore
//! use doclink::query::QuerySpec;
//!
//! let query = QuerySpec::builder("SELECT * FROM root r WHERE r.owner = @owner")
//!     .parameter("@owner", "alice")
//!     .build();
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParameter {
    pub name: String,
    pub value: Value,
}

/// A query and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub query: String,
    #[serde(default)]
    pub parameters: Vec<QueryParameter>,
}

impl QuerySpec {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into(), parameters: Vec::new() }
    }

    pub fn builder(query: impl Into<String>) -> QuerySpecBuilder {
        QuerySpecBuilder { spec: QuerySpec::new(query) }
    }
}

#[derive(Debug, Clone)]
pub struct QuerySpecBuilder {
    spec: QuerySpec,
}

impl QuerySpecBuilder {
    /// Binds `name` (including its leading `@`) to `value`.
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.spec.parameters.push(QueryParameter {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn build(self) -> QuerySpec {
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let spec = QuerySpec::builder("SELECT * FROM root r WHERE r.n > @n")
            .parameter("@n", 3)
            .build();

        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            json!({
                "query": "SELECT * FROM root r WHERE r.n > @n",
                "parameters": [{ "name": "@n", "value": 3 }],
            })
        );
    }
}
