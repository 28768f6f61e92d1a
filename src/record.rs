use crate::error::SnapError;
use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;

pub type Fields = serde_json::Map<String, Value>;

pub const HOST_ID: &str = "bk_host_id";
pub const CLOUD_ID: &str = "bk_cloud_id";
pub const INNER_IP: &str = "bk_host_innerip";
pub const OUTER_IP: &str = "bk_host_outerip";
pub const OWNER_ID: &str = "bk_supplier_account";

/// Identity of a host inside the index: cloud (network segment) id plus inner IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub cloud_id: String,
    pub ip: String,
}

impl HostKey {
    pub fn new(cloud_id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            cloud_id: cloud_id.into(),
            ip: ip.into(),
        }
    }

    /// Key of a row coming from the host table, if it carries both identity fields.
    pub fn from_row(row: &Fields) -> Option<Self> {
        let cloud_id = row.get(CLOUD_ID).map(value_text)?;
        let ip = row.get(INNER_IP).map(value_text)?;
        Some(Self { cloud_id, ip })
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.cloud_id, self.ip)
    }
}

#[derive(Debug, Default)]
pub struct HostRecord {
    data: RwLock<Fields>,
}

impl HostRecord {
    pub fn new(data: Fields) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.data.read().get(field).cloned()
    }

    pub fn snapshot(&self) -> Fields {
        self.data.read().clone()
    }

    pub fn set(&self, field: impl Into<String>, value: Value) {
        self.data.write().insert(field.into(), value);
    }

    /// Copies every field of `fields` into the record, one write per field.
    pub fn apply(&self, fields: &Fields) {
        for (field, value) in fields {
            self.set(field.clone(), value.clone());
        }
    }

    pub fn host_id(&self) -> Result<i64, SnapError> {
        match self.get(HOST_ID) {
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| SnapError::InvalidHostId(n.to_string())),
            Some(other) => Err(SnapError::InvalidHostId(other.to_string())),
            None => Err(SnapError::InvalidHostId("missing".to_string())),
        }
    }

    pub fn inner_ip(&self) -> Result<String, SnapError> {
        match self.get(INNER_IP) {
            Some(Value::String(ip)) => Ok(ip),
            other => Err(SnapError::UnexpectedShape(format!(
                "{INNER_IP} is not a string: {other:?}"
            ))),
        }
    }

    pub fn outer_ip(&self) -> Option<String> {
        match self.get(OUTER_IP) {
            Some(Value::String(ip)) => Some(ip),
            _ => None,
        }
    }
}

/// Text form of a loosely typed value: strings as-is, everything else as JSON text.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
