//! Wait behavior - add latency before a response.

use crate::scripting;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wait behavior: a fixed number of milliseconds, a min/max range, or a
/// script that returns the delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitBehavior {
    /// Fixed delay in milliseconds. Negative values are rejected at apply
    /// time (serde would accept them through the i64).
    Fixed(i64),
    /// Random delay within a range
    Range {
        #[serde(rename = "min")]
        min_ms: u64,
        #[serde(rename = "max")]
        max_ms: u64,
    },
    /// Script that returns a non-negative integer of milliseconds
    Function(String),
}

impl WaitBehavior {
    /// Resolve the delay for one request.
    pub fn resolve(&self, request: &Value, port: u16) -> Result<u64, String> {
        match self {
            WaitBehavior::Fixed(ms) => {
                if *ms < 0 {
                    Err(format!("wait must be non-negative, got {ms}"))
                } else {
                    Ok(*ms as u64)
                }
            }
            WaitBehavior::Range { min_ms, max_ms } => {
                use rand::Rng;
                let (lo, hi) = (*min_ms.min(max_ms), *min_ms.max(max_ms));
                Ok(rand::thread_rng().gen_range(lo..=hi))
            }
            WaitBehavior::Function(script) => scripting::eval_wait(script, request, port)
                .map(|ms| ms as u64)
                .map_err(|e| e.to_string()),
        }
    }
}
