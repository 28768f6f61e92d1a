//! Contracts of the services the snapshot pipeline depends on.

use crate::error::SnapError;
use crate::record::Fields;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const HOST_OBJECT_ID: &str = "host";

#[async_trait]
pub trait HostStore: Send + Sync {
    /// One page of the full host table scan.
    async fn find_page(&self, start: u64, limit: u64) -> Result<Vec<Fields>, SnapError>;

    /// Hosts of `owner_id` in cloud `cloud_id` whose inner IP is one of `ips`.
    async fn find_by_ips(
        &self,
        cloud_id: i64,
        ips: &[String],
        owner_id: &str,
    ) -> Result<Vec<Fields>, SnapError>;
}

#[async_trait]
pub trait CoreService: Send + Sync {
    async fn update_host(&self, host_id: i64, fields: &Fields) -> Result<(), SnapError>;

    async fn get_host(&self, host_id: i64) -> Result<Fields, SnapError>;

    async fn host_module_relations(&self, host_ids: &[i64]) -> Result<Vec<ModuleHost>, SnapError>;

    async fn audit_header(&self, object_id: &str) -> Result<Vec<AuditHeader>, SnapError>;

    async fn save_audit_log(&self, entry: &AuditLog) -> Result<(), SnapError>;
}

#[async_trait]
pub trait SnapshotCache: Send + Sync {
    async fn set_snapshot(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), SnapError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleHost {
    #[serde(rename = "bk_biz_id", default)]
    pub biz_id: i64,
    #[serde(rename = "bk_set_id", default)]
    pub set_id: i64,
    #[serde(rename = "bk_module_id", default)]
    pub module_id: i64,
    #[serde(rename = "bk_host_id", default)]
    pub host_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditHeader {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOpType {
    Modify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditContent {
    pub pre_data: Fields,
    pub cur_data: Fields,
    pub headers: Vec<AuditHeader>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    #[serde(rename = "bk_host_id")]
    pub host_id: i64,
    pub model: String,
    pub content: AuditContent,
    pub op_desc: String,
    pub op_type: AuditOpType,
    pub ext_key: String,
    #[serde(rename = "bk_biz_id")]
    pub biz_id: i64,
}
