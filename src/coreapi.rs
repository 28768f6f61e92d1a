//! HTTP client of the core service v3 API.
//!
//! Every endpoint answers with the same envelope:
//! `{"result": bool, "bk_error_code": int, "bk_error_msg": str, "data": ...}`.
//! A `result` of `false` is a downstream failure regardless of HTTP status.

use crate::config::CoreServiceConfig;
use crate::error::SnapError;
use crate::record::{Fields, CLOUD_ID, HOST_ID, INNER_IP, OWNER_ID};
use crate::services::{AuditHeader, AuditLog, CoreService, HostStore, ModuleHost};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const SUPPLIER_HEADER: &str = "HTTP_BLUEKING_SUPPLIER_ID";
const USER_HEADER: &str = "BK_User";

#[derive(Debug, Deserialize)]
struct BaseResp<T> {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    bk_error_code: i64,
    #[serde(default)]
    bk_error_msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ListData<T> {
    #[serde(default = "Vec::new")]
    info: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Attribute {
    #[serde(default)]
    bk_property_id: String,
    #[serde(default)]
    bk_property_name: String,
}

#[derive(Debug, Clone)]
pub struct CoreApiClient {
    http: Client,
    base_url: String,
    owner_id: String,
    user: String,
}

impl CoreApiClient {
    pub fn new(cfg: &CoreServiceConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            owner_id: cfg.owner_id.clone(),
            user: cfg.user.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v3/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        op: &'static str,
        request: RequestBuilder,
    ) -> Result<Option<T>, SnapError> {
        let response = request
            .header(SUPPLIER_HEADER, &self.owner_id)
            .header(USER_HEADER, &self.user)
            .send()
            .await
            .map_err(|source| SnapError::Transport { op, source })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| SnapError::Transport { op, source })?;
        debug!(op, %status, bytes = body.len(), "core service responded");
        decode_envelope(op, &body)
    }

    async fn search_hosts(
        &self,
        op: &'static str,
        condition: Value,
        start: u64,
        limit: u64,
    ) -> Result<Vec<Fields>, SnapError> {
        let body = json!({
            "condition": condition,
            "page": {"start": start, "limit": limit},
        });
        let request = self.http.post(self.url("read/model/host/instances")).json(&body);
        let data: Option<ListData<Fields>> = self.call(op, request).await?;
        Ok(data.map(|d| d.info).unwrap_or_default())
    }
}

fn decode_envelope<T: DeserializeOwned>(op: &'static str, body: &str) -> Result<Option<T>, SnapError> {
    let resp: BaseResp<T> =
        serde_json::from_str(body).map_err(|source| SnapError::Decode { op, source })?;
    if !resp.result {
        return Err(SnapError::Downstream {
            op,
            code: resp.bk_error_code,
            message: resp.bk_error_msg,
        });
    }
    Ok(resp.data)
}

fn require<T>(op: &'static str, data: Option<T>) -> Result<T, SnapError> {
    data.ok_or_else(|| SnapError::UnexpectedShape(format!("{op} response carries no data")))
}

fn ip_condition(cloud_id: i64, ips: &[String], owner_id: &str) -> Value {
    json!({
        CLOUD_ID: cloud_id,
        INNER_IP: {"$in": ips},
        OWNER_ID: owner_id,
    })
}

#[async_trait]
impl HostStore for CoreApiClient {
    async fn find_page(&self, start: u64, limit: u64) -> Result<Vec<Fields>, SnapError> {
        self.search_hosts("find_page", json!({}), start, limit).await
    }

    async fn find_by_ips(
        &self,
        cloud_id: i64,
        ips: &[String],
        owner_id: &str,
    ) -> Result<Vec<Fields>, SnapError> {
        let condition = ip_condition(cloud_id, ips, owner_id);
        self.search_hosts("find_by_ips", condition, 0, ips.len().max(1) as u64)
            .await
    }
}

#[async_trait]
impl CoreService for CoreApiClient {
    async fn update_host(&self, host_id: i64, fields: &Fields) -> Result<(), SnapError> {
        let body = json!({
            "condition": {HOST_ID: host_id},
            "data": fields,
        });
        let request = self.http.put(self.url("update/model/host/instance")).json(&body);
        let _: Option<Value> = self.call("update_host", request).await?;
        Ok(())
    }

    async fn get_host(&self, host_id: i64) -> Result<Fields, SnapError> {
        let request = self.http.get(self.url(&format!("find/host/{host_id}")));
        let data = self.call("get_host", request).await?;
        require("get_host", data)
    }

    async fn host_module_relations(&self, host_ids: &[i64]) -> Result<Vec<ModuleHost>, SnapError> {
        let request = self
            .http
            .post(self.url("read/module/host/relation"))
            .json(&json!({HOST_ID: host_ids}));
        let data: Option<ListData<ModuleHost>> =
            self.call("host_module_relations", request).await?;
        Ok(data.map(|d| d.info).unwrap_or_default())
    }

    async fn audit_header(&self, object_id: &str) -> Result<Vec<AuditHeader>, SnapError> {
        let request = self
            .http
            .post(self.url("read/model/host/attributes"))
            .json(&json!({"condition": {"bk_obj_id": object_id}}));
        let attrs: Option<Vec<Attribute>> = self.call("audit_header", request).await?;
        Ok(attrs
            .unwrap_or_default()
            .into_iter()
            .map(|attr| AuditHeader {
                key: attr.bk_property_id,
                value: attr.bk_property_name,
            })
            .collect())
    }

    async fn save_audit_log(&self, entry: &AuditLog) -> Result<(), SnapError> {
        let request = self.http.post(self.url("create/auditlog")).json(entry);
        let _: Option<Value> = self.call("save_audit_log", request).await?;
        Ok(())
    }
}
