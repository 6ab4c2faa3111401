use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Field the remote uses to carry its identifier.
pub const SERVER_ID_FIELD: &str = "_id";
/// Field a create carries so the remote echo can be matched to the local row.
pub const CORRELATION_FIELD: &str = "_cid";

const RESERVED_FIELDS: [&str; 5] = [
    "localId",
    "serverId",
    "collection",
    "correlationId",
    SERVER_ID_FIELD,
];

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Document must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Remote document is missing its `_id` field")]
    MissingServerId,

    #[error("Invalid document JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// A record in one logical collection.
///
/// `local_id` is assigned by the local store and never leaves this device;
/// `server_id` is assigned by the remote on the first successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub local_id: Option<i64>,
    pub server_id: Option<String>,
    #[serde(default)]
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// The identity a document is addressed by: server id when known, local id otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Server(String),
    Local(i64),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Server(id) => write!(f, "{}", id),
            Identity::Local(id) => write!(f, "local-{}", id),
        }
    }
}

/// How a caller refers to a document when deleting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocRef {
    Local(i64),
    Server(String),
}

impl DocRef {
    /// Numeric input is a local id; anything else is a server id.
    pub fn parse(s: &str) -> Self {
        match s.trim().parse::<i64>() {
            Ok(id) => DocRef::Local(id),
            Err(_) => DocRef::Server(s.trim().to_string()),
        }
    }
}

impl From<i64> for DocRef {
    fn from(id: i64) -> Self {
        DocRef::Local(id)
    }
}

impl From<&str> for DocRef {
    fn from(id: &str) -> Self {
        DocRef::Server(id.to_string())
    }
}

impl From<String> for DocRef {
    fn from(id: String) -> Self {
        DocRef::Server(id)
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocRef::Local(id) => write!(f, "{}", id),
            DocRef::Server(id) => write!(f, "{}", id),
        }
    }
}

impl Document {
    pub fn new(collection: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            local_id: None,
            server_id: None,
            collection: collection.into(),
            correlation_id: None,
            fields,
        }
    }

    /// Builds a document from caller JSON. Identity keys (`localId`, `serverId`,
    /// `_id`) are lifted out of the payload.
    pub fn from_value(collection: impl Into<String>, value: Value) -> Result<Self, DocumentError> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => return Err(DocumentError::NotAnObject(json_kind(&other))),
        };

        let local_id = fields.remove("localId").and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        });
        let server_id = fields
            .remove("serverId")
            .and_then(id_string)
            .or_else(|| fields.remove(SERVER_ID_FIELD).and_then(id_string));
        let correlation_id = fields
            .remove("correlationId")
            .and_then(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()));
        fields.remove("collection");

        Ok(Self {
            local_id,
            server_id,
            collection: collection.into(),
            correlation_id,
            fields,
        })
    }

    /// Parses a row returned by the remote. The row must carry `_id`.
    pub fn from_remote(collection: impl Into<String>, value: Value) -> Result<Self, DocumentError> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => return Err(DocumentError::NotAnObject(json_kind(&other))),
        };

        let server_id = fields
            .remove(SERVER_ID_FIELD)
            .and_then(id_string)
            .ok_or(DocumentError::MissingServerId)?;
        let correlation_id = fields
            .remove(CORRELATION_FIELD)
            .and_then(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()));
        for key in RESERVED_FIELDS {
            fields.remove(key);
        }

        Ok(Self {
            local_id: None,
            server_id: Some(server_id),
            collection: collection.into(),
            correlation_id,
            fields,
        })
    }

    /// Returns a structurally independent copy. Everything handed to the
    /// outbox or the local store goes through here so later edits to the
    /// caller's value never reach an already-enqueued payload.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Body sent to the remote: payload fields plus the correlation id.
    /// Local-only identity never leaves the device.
    pub fn to_remote_body(&self) -> Value {
        let mut body = self.fields.clone();
        for key in RESERVED_FIELDS {
            body.remove(key);
        }
        if let Some(cid) = self.correlation_id {
            body.insert(CORRELATION_FIELD.to_string(), Value::String(cid.to_string()));
        }
        Value::Object(body)
    }

    pub fn identity(&self) -> Option<Identity> {
        match (&self.server_id, self.local_id) {
            (Some(server_id), _) => Some(Identity::Server(server_id.clone())),
            (None, Some(local_id)) => Some(Identity::Local(local_id)),
            (None, None) => None,
        }
    }

    /// Normalised `name`/`title`. Keeps an unsent local row alive across a
    /// refresh while a create of the same name is pending.
    pub fn fingerprint(&self) -> Option<String> {
        ["name", "title"]
            .iter()
            .find_map(|key| self.fields.get(*key).and_then(Value::as_str))
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }
}

fn id_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_lifts_identity_keys() {
        let doc = Document::from_value(
            "projects",
            json!({"localId": 3, "serverId": "abc", "collection": "other", "name": "Demo"}),
        )
        .unwrap();

        assert_eq!(doc.local_id, Some(3));
        assert_eq!(doc.server_id.as_deref(), Some("abc"));
        assert_eq!(doc.collection, "projects");
        assert_eq!(doc.fields.len(), 1);
        assert_eq!(doc.get("name"), Some(&json!("Demo")));
    }

    #[test]
    fn test_from_value_accepts_remote_id_key() {
        let doc = Document::from_value("projects", json!({"_id": "xyz", "name": "A"})).unwrap();
        assert_eq!(doc.server_id.as_deref(), Some("xyz"));
        assert!(doc.get("_id").is_none());
    }

    #[test]
    fn test_from_value_rejects_non_object() {
        let err = Document::from_value("projects", json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_from_remote_requires_server_id() {
        let err = Document::from_remote("projects", json!({"name": "A"})).unwrap_err();
        assert!(matches!(err, DocumentError::MissingServerId));
    }

    #[test]
    fn test_from_remote_numeric_id_and_correlation() {
        let cid = Uuid::new_v4();
        let doc = Document::from_remote(
            "projects",
            json!({"_id": 42, "_cid": cid.to_string(), "name": "A"}),
        )
        .unwrap();

        assert_eq!(doc.server_id.as_deref(), Some("42"));
        assert_eq!(doc.correlation_id, Some(cid));
        assert_eq!(doc.local_id, None);
        assert!(doc.get("_cid").is_none());
    }

    #[test]
    fn test_remote_body_never_carries_local_identity() {
        let mut doc = Document::new("projects", Map::new()).with_field("name", "Demo");
        doc.local_id = Some(7);
        doc.server_id = Some("abc".into());
        doc.correlation_id = Some(Uuid::new_v4());

        let body = doc.to_remote_body();
        let obj = body.as_object().unwrap();
        assert!(!obj.contains_key("localId"));
        assert!(!obj.contains_key("collection"));
        assert!(!obj.contains_key("_id"));
        assert!(obj.contains_key("_cid"));
        assert_eq!(obj.get("name"), Some(&json!("Demo")));
    }

    #[test]
    fn test_snapshot_is_independent() {
        let original = Document::new("projects", Map::new()).with_field("files", json!(["a"]));
        let snapshot = original.snapshot();

        let mut edited = original;
        edited.fields.insert("files".into(), json!(["a", "b"]));

        assert_eq!(snapshot.get("files"), Some(&json!(["a"])));
    }

    #[test]
    fn test_identity_prefers_server_id() {
        let mut doc = Document::new("projects", Map::new());
        assert_eq!(doc.identity(), None);

        doc.local_id = Some(1);
        assert_eq!(doc.identity(), Some(Identity::Local(1)));

        doc.server_id = Some("abc".into());
        assert_eq!(doc.identity(), Some(Identity::Server("abc".into())));
    }

    #[test]
    fn test_fingerprint_normalises_name() {
        let doc = Document::new("projects", Map::new()).with_field("name", "  My Site ");
        assert_eq!(doc.fingerprint().as_deref(), Some("my site"));

        let titled = Document::new("projects", Map::new()).with_field("title", "Landing");
        assert_eq!(titled.fingerprint().as_deref(), Some("landing"));

        let blank = Document::new("projects", Map::new()).with_field("name", "   ");
        assert_eq!(blank.fingerprint(), None);
    }

    #[test]
    fn test_serde_shape() {
        let mut doc = Document::new("projects", Map::new()).with_field("name", "Demo");
        doc.local_id = Some(1);

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            value,
            json!({"localId": 1, "serverId": null, "collection": "projects", "name": "Demo"})
        );

        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_doc_ref_parse() {
        assert_eq!(DocRef::parse("12"), DocRef::Local(12));
        assert_eq!(
            DocRef::parse("65a1f0c2e4"),
            DocRef::Server("65a1f0c2e4".into())
        );
    }
}
