//! View queries and results

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Options of a view query; keys are arbitrary JSON values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewQuery {
    pub key: Option<Value>,
    pub startkey: Option<Value>,
    pub endkey: Option<Value>,
    pub include_docs: bool,
    pub descending: bool,
    pub limit: Option<u64>,
}

impl ViewQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows with `start <= key <= end` in view collation order
    pub fn range(start: Value, end: Value) -> Self {
        Self {
            startkey: Some(start),
            endkey: Some(end),
            ..Default::default()
        }
    }

    pub fn key(mut self, key: Value) -> Self {
        self.key = Some(key);
        self
    }

    pub fn include_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Query string parameters, keys JSON-encoded
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(key) = &self.key {
            params.push(("key", key.to_string()));
        }
        if let Some(start) = &self.startkey {
            params.push(("startkey", start.to_string()));
        }
        if let Some(end) = &self.endkey {
            params.push(("endkey", end.to_string()));
        }
        if self.include_docs {
            params.push(("include_docs", "true".to_string()));
        }
        if self.descending {
            params.push(("descending", "true".to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    #[serde(default)]
    pub id: Option<String>,
    pub key: Value,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewResult {
    #[serde(default)]
    pub total_rows: u64,
    #[serde(default)]
    pub offset: u64,
    pub rows: Vec<ViewRow>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_encode_keys_as_json() {
        let query = ViewQuery::range(json!([["a", "b"]]), json!([["a", "b"], {}])).limit(10);

        assert_eq!(
            query.to_params(),
            vec![
                ("startkey", r#"[["a","b"]]"#.to_string()),
                ("endkey", r#"[["a","b"],{}]"#.to_string()),
                ("limit", "10".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_result() {
        let result: ViewResult = serde_json::from_value(json!({
            "total_rows": 2,
            "offset": 0,
            "rows": [
                {"id": "a", "key": ["x", 1], "value": {"name": "T1"}},
                {"id": "b", "key": ["x", 2], "value": null}
            ]
        }))
        .unwrap();

        assert_eq!(result.total_rows, 2);
        assert_eq!(result.rows[0].id.as_deref(), Some("a"));
        assert_eq!(result.rows[0].value["name"], "T1");
        assert_eq!(result.rows[1].doc, None);
    }
}
