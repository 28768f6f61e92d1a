use crate::record::{Fields, HostRecord};
use crate::snapshot::{FIELD_CPU, FIELD_CPU_MHZ, FIELD_DISK, FIELD_MEM};
use serde_json::Value;

/// Hardware counters that jitter between polls and are compared within a band.
const TOLERANCE_FIELDS: [&str; 4] = [FIELD_CPU, FIELD_CPU_MHZ, FIELD_DISK, FIELD_MEM];

#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    change_range_percent: u32,
}

impl ChangeDetector {
    pub fn new(change_range_percent: u32) -> Self {
        Self {
            change_range_percent,
        }
    }

    pub fn needs_update(&self, candidate: &Fields, current: &HostRecord) -> bool {
        candidate
            .iter()
            .any(|(field, value)| self.differs(field, value, current.get(field).as_ref()))
    }

    fn differs(&self, field: &str, candidate: &Value, current: Option<&Value>) -> bool {
        let current = current.filter(|v| !v.is_null());
        if current.is_none() && candidate.as_str() == Some("") {
            return false;
        }
        if current == Some(candidate) {
            return false;
        }
        if !TOLERANCE_FIELDS.contains(&field) {
            return true;
        }

        // Values that cannot be compared numerically never trigger an update.
        let (Some(candidate), Some(current)) = (as_f64(candidate), current.and_then(as_f64))
        else {
            return false;
        };
        let tolerance = current * (f64::from(self.change_range_percent) / 100.0);
        let diff = candidate - current;
        !(-tolerance < diff && diff < tolerance)
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
