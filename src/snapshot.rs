//! Parsing of agent host snapshots.
//!
//! Agents publish either the bare report or an envelope carrying the report
//! as an escaped JSON string under `data`. Every part of the report is
//! optional: a field of the wrong type is treated as absent rather than
//! failing the whole message.

use crate::record::{value_text, Fields};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

pub const OS_TYPE_LINUX: &str = "1";
pub const OS_TYPE_WINDOWS: &str = "2";
pub const OS_TYPE_AIX: &str = "3";

pub const FIELD_CPU: &str = "bk_cpu";
pub const FIELD_CPU_MODULE: &str = "bk_cpu_module";
pub const FIELD_CPU_MHZ: &str = "bk_cpu_mhz";
pub const FIELD_DISK: &str = "bk_disk";
pub const FIELD_MEM: &str = "bk_mem";
pub const FIELD_OS_TYPE: &str = "bk_os_type";
pub const FIELD_OS_NAME: &str = "bk_os_name";
pub const FIELD_OS_VERSION: &str = "bk_os_version";
pub const FIELD_HOST_NAME: &str = "bk_host_name";
pub const FIELD_OUTER_MAC: &str = "bk_outer_mac";
pub const FIELD_INNER_MAC: &str = "bk_mac";
pub const FIELD_OS_BIT: &str = "bk_os_bit";
pub const FIELD_DOCKER_CLIENT_VERSION: &str = "docker_client_version";
pub const FIELD_DOCKER_SERVER_VERSION: &str = "docker_server_version";

const LOOPBACK_PREFIX: &str = "127.0.0.";

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// The unwrapped report text, as cached for point lookups.
    pub payload: String,
    pub report: Report,
}

impl Snapshot {
    pub fn parse(raw: &str) -> Self {
        let payload = unwrap_envelope(raw);
        let report = if payload.trim().is_empty() {
            Report::default()
        } else {
            match serde_json::from_str::<Report>(&payload) {
                Ok(report) => report,
                Err(err) => {
                    warn!(error = %err, "malformed snapshot report, treating as empty");
                    Report::default()
                }
            }
        };
        Self { payload, report }
    }
}

fn unwrap_envelope(raw: &str) -> String {
    let doc: Value = match serde_json::from_str(raw) {
        Ok(doc) => doc,
        Err(err) => {
            warn!(error = %err, "snapshot message is not valid JSON");
            return String::new();
        }
    };
    if doc.get("cloudid").is_some() {
        return raw.to_string();
    }
    doc.get("data").map(value_text).unwrap_or_default()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Report {
    #[serde(deserialize_with = "loose_text")]
    pub ip: String,
    #[serde(rename = "cloudid", deserialize_with = "loose_text")]
    pub cloud_id: String,
    #[serde(rename = "bizid", deserialize_with = "loose_text")]
    pub owner_id: String,
    #[serde(deserialize_with = "lenient")]
    pub data: ReportData,
}

impl Report {
    /// Addresses to try when resolving the host, in priority order: the
    /// declared IP first, then every interface address, loopback excluded.
    pub fn candidate_ips(&self) -> Vec<String> {
        let mut ips = Vec::new();
        let declared = self.ip.trim();
        if !declared.is_empty() && !declared.starts_with(LOOPBACK_PREFIX) {
            ips.push(declared.to_string());
        }
        for iface in &self.data.net.interfaces {
            for addr in &iface.addrs {
                let ip = strip_prefix_len(&addr.addr);
                if ip.is_empty() || ip.starts_with(LOOPBACK_PREFIX) {
                    continue;
                }
                ips.push(ip.to_string());
            }
        }
        ips
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportData {
    #[serde(deserialize_with = "lenient")]
    pub cpu: CpuSection,
    #[serde(deserialize_with = "lenient")]
    pub disk: DiskSection,
    #[serde(deserialize_with = "lenient")]
    pub mem: MemSection,
    #[serde(deserialize_with = "lenient")]
    pub system: SystemSection,
    #[serde(deserialize_with = "lenient")]
    pub net: NetSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CpuSection {
    #[serde(rename = "cpuinfo", deserialize_with = "lenient_items")]
    pub cpus: Vec<CpuInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CpuInfo {
    #[serde(deserialize_with = "loose_number")]
    pub cores: Option<f64>,
    #[serde(rename = "modelName", deserialize_with = "loose_text")]
    pub model_name: String,
    #[serde(deserialize_with = "loose_number")]
    pub mhz: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiskSection {
    #[serde(deserialize_with = "lenient_items")]
    pub usage: Vec<DiskUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiskUsage {
    #[serde(deserialize_with = "loose_number")]
    pub total: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemSection {
    #[serde(deserialize_with = "lenient")]
    pub meminfo: MemInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemInfo {
    #[serde(deserialize_with = "loose_number")]
    pub total: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SystemSection {
    #[serde(deserialize_with = "lenient")]
    pub info: SystemInfo,
    #[serde(deserialize_with = "lenient")]
    pub docker: DockerInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    #[serde(deserialize_with = "loose_text")]
    pub hostname: String,
    #[serde(deserialize_with = "loose_text")]
    pub os: String,
    #[serde(deserialize_with = "loose_text")]
    pub platform: String,
    #[serde(rename = "platformVersion", deserialize_with = "loose_text")]
    pub platform_version: String,
    #[serde(rename = "systemtype", deserialize_with = "loose_text")]
    pub system_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DockerInfo {
    #[serde(rename = "Client", deserialize_with = "lenient")]
    pub client: DockerVersion,
    #[serde(rename = "Server", deserialize_with = "lenient")]
    pub server: DockerVersion,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DockerVersion {
    #[serde(rename = "Version", deserialize_with = "loose_text")]
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetSection {
    #[serde(rename = "interface", deserialize_with = "lenient_items")]
    pub interfaces: Vec<NetInterface>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetInterface {
    #[serde(rename = "hardwareaddr", deserialize_with = "loose_text")]
    pub hardware_addr: String,
    #[serde(deserialize_with = "lenient_items")]
    pub addrs: Vec<NetAddr>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetAddr {
    #[serde(deserialize_with = "loose_text")]
    pub addr: String,
}

/// Normalized host facts extracted from one report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostFacts {
    pub cpu_cores: i64,
    pub cpu_module: String,
    pub cpu_mhz: i64,
    pub disk_gb: u64,
    pub mem_mb: u64,
    pub os_type: String,
    pub os_name: String,
    pub os_version: String,
    pub host_name: String,
    pub outer_mac: String,
    pub inner_mac: String,
    pub os_bit: String,
    pub docker_client_version: String,
    pub docker_server_version: String,
}

impl HostFacts {
    pub fn extract(data: &ReportData, inner_ip: &str, outer_ip: &str) -> Self {
        let cpus = &data.cpu.cpus;
        let cpu_cores = cpus
            .iter()
            .filter_map(|c| c.cores)
            .map(|cores| cores as i64)
            .sum();
        let cpu_module = cpus
            .first()
            .map(|c| c.model_name.trim().to_string())
            .unwrap_or_default();
        let cpu_mhz = cpus
            .first()
            .and_then(|c| c.mhz)
            .map(|mhz| mhz as i64)
            .unwrap_or(0);

        let disk_gb = data
            .disk
            .usage
            .iter()
            .filter_map(|u| u.total)
            .map(|total| (total as u64) >> 30)
            .sum();
        let mem_mb = data.mem.meminfo.total.map(|t| (t as u64) >> 20).unwrap_or(0);

        let info = &data.system.info;
        let (os_type, os_name, os_version) =
            normalize_os(&info.os, &info.platform, &info.platform_version);
        let (inner_mac, outer_mac) = correlate_macs(&data.net.interfaces, inner_ip, outer_ip);

        let facts = Self {
            cpu_cores,
            cpu_module,
            cpu_mhz,
            disk_gb,
            mem_mb,
            os_type,
            os_name,
            os_version,
            host_name: info.hostname.trim().to_string(),
            outer_mac,
            inner_mac,
            os_bit: info.system_type.trim().to_string(),
            docker_client_version: data.system.docker.client.version.trim().to_string(),
            docker_server_version: data.system.docker.server.version.trim().to_string(),
        };
        facts.log_missing(inner_ip, outer_ip);
        facts
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(FIELD_CPU.into(), self.cpu_cores.into());
        fields.insert(FIELD_CPU_MODULE.into(), self.cpu_module.clone().into());
        fields.insert(FIELD_CPU_MHZ.into(), self.cpu_mhz.into());
        fields.insert(FIELD_DISK.into(), self.disk_gb.into());
        fields.insert(FIELD_MEM.into(), self.mem_mb.into());
        fields.insert(FIELD_OS_TYPE.into(), self.os_type.clone().into());
        fields.insert(FIELD_OS_NAME.into(), self.os_name.clone().into());
        fields.insert(FIELD_OS_VERSION.into(), self.os_version.clone().into());
        fields.insert(FIELD_HOST_NAME.into(), self.host_name.clone().into());
        fields.insert(FIELD_OUTER_MAC.into(), self.outer_mac.clone().into());
        fields.insert(FIELD_INNER_MAC.into(), self.inner_mac.clone().into());
        fields.insert(FIELD_OS_BIT.into(), self.os_bit.clone().into());
        fields.insert(
            FIELD_DOCKER_CLIENT_VERSION.into(),
            self.docker_client_version.clone().into(),
        );
        fields.insert(
            FIELD_DOCKER_SERVER_VERSION.into(),
            self.docker_server_version.clone().into(),
        );
        fields
    }

    fn log_missing(&self, inner_ip: &str, outer_ip: &str) {
        let missing = [
            (FIELD_CPU, self.cpu_cores <= 0),
            (FIELD_CPU_MODULE, self.cpu_module.is_empty()),
            (FIELD_CPU_MHZ, self.cpu_mhz <= 0),
            (FIELD_DISK, self.disk_gb == 0),
            (FIELD_MEM, self.mem_mb == 0),
            (FIELD_OS_TYPE, self.os_type.is_empty()),
            (FIELD_OS_NAME, self.os_name.is_empty()),
            (FIELD_OS_VERSION, self.os_version.is_empty()),
            (FIELD_HOST_NAME, self.host_name.is_empty()),
            (
                FIELD_OUTER_MAC,
                !outer_ip.is_empty() && self.outer_mac.is_empty(),
            ),
            (FIELD_INNER_MAC, self.inner_mac.is_empty()),
        ];
        for (field, is_missing) in missing {
            if is_missing {
                debug!(field, ip = inner_ip, "field not found in snapshot");
            }
        }
    }
}

fn normalize_os(os: &str, platform: &str, version: &str) -> (String, String, String) {
    let os = os.trim();
    let mut platform = platform.trim().to_string();
    let mut version = version.to_string();

    let (os_type, os_name) = match os.to_lowercase().as_str() {
        "linux" => {
            version = version.replacen(".x86_64", "", 1);
            version = version.replacen(".i386", "", 1);
            (OS_TYPE_LINUX.to_string(), format!("{os} {platform}"))
        }
        "windows" => {
            version = version.replacen("Microsoft ", "", 1);
            platform = platform.replacen("Microsoft ", "", 1);
            (OS_TYPE_WINDOWS.to_string(), platform)
        }
        "aix" => (OS_TYPE_AIX.to_string(), platform),
        _ => (os.to_string(), platform),
    };

    (
        os_type,
        os_name.trim().to_string(),
        version.trim().to_string(),
    )
}

fn correlate_macs(interfaces: &[NetInterface], inner_ip: &str, outer_ip: &str) -> (String, String) {
    let mut inner_mac = String::new();
    let mut outer_mac = String::new();
    for iface in interfaces {
        for addr in &iface.addrs {
            let ip = strip_prefix_len(&addr.addr);
            if ip.is_empty() {
                continue;
            }
            if ip == inner_ip {
                inner_mac = iface.hardware_addr.trim().to_string();
            } else if ip == outer_ip {
                outer_mac = iface.hardware_addr.trim().to_string();
            }
        }
    }
    (inner_mac, outer_mac)
}

fn strip_prefix_len(addr: &str) -> &str {
    addr.split('/').next().unwrap_or_default()
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_items<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    let Value::Array(items) = value else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

fn loose_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_text(&value))
}

fn loose_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}
