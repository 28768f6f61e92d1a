use crate::detector::ChangeDetector;
use crate::error::SnapError;
use crate::index::HostIndex;
use crate::limiter::RateLimiter;
use crate::metrics::Metrics;
use crate::services::{
    AuditContent, AuditLog, AuditOpType, CoreService, SnapshotCache, HOST_OBJECT_ID,
};
use crate::snapshot::{HostFacts, Snapshot};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const SNAPSHOT_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    RateLimited,
    Updated,
}

impl Outcome {
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Unchanged => "unchanged",
            Outcome::RateLimited => "rate_limited",
            Outcome::Updated => "updated",
        }
    }
}

/// Turns host snapshots into rate-limited, audited host record updates.
pub struct HostSnap {
    index: Arc<HostIndex>,
    detector: ChangeDetector,
    limiter: RateLimiter,
    core: Arc<dyn CoreService>,
    cache: Arc<dyn SnapshotCache>,
    metrics: Arc<Metrics>,
    key_prefix: String,
}

impl HostSnap {
    pub fn new(
        index: Arc<HostIndex>,
        detector: ChangeDetector,
        limiter: RateLimiter,
        core: Arc<dyn CoreService>,
        cache: Arc<dyn SnapshotCache>,
        metrics: Arc<Metrics>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            index,
            detector,
            limiter,
            core,
            cache,
            metrics,
            key_prefix: key_prefix.into(),
        }
    }

    pub async fn handle_snapshot(&self, raw: &str) -> Result<Outcome, SnapError> {
        let result = self.process(raw).await;
        match &result {
            Ok(outcome) => self.metrics.inc_outcome(outcome.label()),
            Err(err) => {
                self.metrics.inc_outcome(err.outcome_label());
                if let Some(op) = err.op() {
                    self.metrics.inc_downstream_error(op);
                }
            }
        }
        result
    }

    async fn process(&self, raw: &str) -> Result<Outcome, SnapError> {
        let snapshot = Snapshot::parse(raw);
        let report = &snapshot.report;
        let ips = report.candidate_ips();

        let Some(host) = self
            .index
            .resolve(&report.cloud_id, &report.owner_id, &ips)
            .await
        else {
            warn!(cloud_id = %report.cloud_id, ?ips, "host not found, snapshot skipped");
            return Err(SnapError::HostNotFound {
                cloud_id: report.cloud_id.clone(),
                ips,
            });
        };

        let host_id = host.host_id().inspect_err(|err| {
            warn!(error = %err, "host record has no usable id, snapshot skipped");
        })?;

        let key = format!("{}{}", self.key_prefix, host_id);
        if let Err(err) = self
            .cache
            .set_snapshot(&key, &snapshot.payload, SNAPSHOT_TTL)
            .await
        {
            self.metrics.inc_cache_error();
            error!(error = %err, key = %key, "failed to cache snapshot");
        }

        let inner_ip = host.inner_ip()?;
        let outer_ip = host.outer_ip().unwrap_or_else(|| {
            debug!(host_id, "outer ip is not a string, treated as empty");
            String::new()
        });

        let fields = HostFacts::extract(&report.data, &inner_ip, &outer_ip).to_fields();
        if !self.detector.needs_update(&fields, &host) {
            return Ok(Outcome::Unchanged);
        }
        if !self.limiter.try_accept() {
            warn!(host_id, ip = %inner_ip, "host update skipped by rate limit");
            return Ok(Outcome::RateLimited);
        }

        self.core.update_host(host_id, &fields).await?;
        let pre_data = host.snapshot();
        host.apply(&fields);

        let cur_data = self.core.get_host(host_id).await?;
        let relations = self.core.host_module_relations(&[host_id]).await?;
        let headers = self.core.audit_header(HOST_OBJECT_ID).await?;
        let biz_id = relations.first().map(|r| r.biz_id).unwrap_or(0);

        let entry = AuditLog {
            host_id,
            model: HOST_OBJECT_ID.to_string(),
            content: AuditContent {
                pre_data,
                cur_data,
                headers,
            },
            op_desc: format!("update {HOST_OBJECT_ID}"),
            op_type: AuditOpType::Modify,
            ext_key: inner_ip.clone(),
            biz_id,
        };
        self.core.save_audit_log(&entry).await?;

        info!(host_id, ip = %inner_ip, biz_id, "host updated from snapshot");
        Ok(Outcome::Updated)
    }
}
