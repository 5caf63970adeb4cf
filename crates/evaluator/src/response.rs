use serde::{Deserialize, Serialize};

/// Outcome of one run.
///
/// When `timeout` is set the buffers hold only what the unit produced before
/// the connection was cut, possibly mid-line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponse {
    pub stdout: String,
    pub stderr: String,
    pub timeout: bool,
    /// At least one stream exceeded the capture limit and was cut short.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}
