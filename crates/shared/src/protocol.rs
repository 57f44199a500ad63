use serde::{Deserialize, Serialize};

use crate::domain::{ProfileRole, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub db_status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardSummary {
    pub threat_count: i64,
    pub compliance_score: f64,
    pub pending_vendor_assessments: i64,
    pub user_role_focus: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardResponse {
    pub user_id: UserId,
    pub user_role: ProfileRole,
    pub summary: DashboardSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleUpdate {
    pub user_id: UserId,
    pub role: ProfileRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub report_type: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
    pub message: String,
    #[serde(default)]
    pub scan_id: Option<serde_json::Value>,
    #[serde(default)]
    pub threat_id: Option<serde_json::Value>,
    #[serde(default)]
    pub incident_id: Option<serde_json::Value>,
}

/// Acknowledgement shape shared by the mutating endpoints. Anything beyond
/// `message` is passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserListing {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<ProfileRole>,
}
