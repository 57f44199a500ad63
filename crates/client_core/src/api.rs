use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    error::ApiError,
    protocol::{
        DashboardResponse, HealthResponse, MessageResponse, ReportRequest, RoleUpdate,
        ScanRequest, ScanResponse, UserListing,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::{error::ApiClientError, session::Session};

/// A file handed to one of the multipart upload endpoints.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    fn into_form(self) -> Result<multipart::Form, ApiClientError> {
        let mut part = multipart::Part::bytes(self.bytes).file_name(self.filename);
        if let Some(mime_type) = self.mime_type {
            part = part.mime_str(&mime_type)?;
        }
        Ok(multipart::Form::new().part("file", part))
    }
}

/// Client for the CSaaS REST API. Protected calls carry the session's access
/// token; a 401 comes back as [`ApiClientError::Unauthorized`] and is left to
/// the caller.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiClientError> {
        let mut base_url = Url::parse(base_url.trim())?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiClientError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    fn authorized(&self, request: RequestBuilder, session: &Session) -> RequestBuilder {
        request.header(reqwest::header::AUTHORIZATION, session.bearer_header())
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ApiClientError> {
        let response = check_status(request.send().await?).await?;
        let text = response.text().await?;
        let text = if text.trim().is_empty() {
            "null"
        } else {
            text.as_str()
        };
        serde_json::from_str(text).map_err(|err| ApiClientError::Decode(err.to_string()))
    }

    pub async fn health(&self) -> Result<HealthResponse, ApiClientError> {
        self.execute(self.http.get(self.endpoint("api/health")?))
            .await
    }

    pub async fn dashboard_summary(
        &self,
        session: &Session,
    ) -> Result<DashboardResponse, ApiClientError> {
        let request = self.http.get(self.endpoint("api/dashboard/summary")?);
        self.execute(self.authorized(request, session)).await
    }

    pub async fn list_vendors(&self, session: &Session) -> Result<Vec<Value>, ApiClientError> {
        let request = self.http.get(self.endpoint("api/vendors")?);
        let vendors: Option<Vec<Value>> = self.execute(self.authorized(request, session)).await?;
        Ok(vendors.unwrap_or_default())
    }

    pub async fn get_vendor(&self, session: &Session, id: &str) -> Result<Value, ApiClientError> {
        let request = self.http.get(self.endpoint(&format!("api/vendors/{id}"))?);
        self.execute(self.authorized(request, session)).await
    }

    pub async fn create_vendor(
        &self,
        session: &Session,
        vendor: &Value,
    ) -> Result<Value, ApiClientError> {
        let request = self.http.post(self.endpoint("api/vendors")?).json(vendor);
        self.execute(self.authorized(request, session)).await
    }

    pub async fn update_vendor(
        &self,
        session: &Session,
        id: &str,
        vendor: &Value,
    ) -> Result<Value, ApiClientError> {
        let request = self
            .http
            .put(self.endpoint(&format!("api/vendors/{id}"))?)
            .json(vendor);
        self.execute(self.authorized(request, session)).await
    }

    pub async fn upload_vendor_evidence(
        &self,
        session: &Session,
        id: &str,
        upload: FileUpload,
    ) -> Result<Value, ApiClientError> {
        debug!(vendor_id = id, filename = %upload.filename, "api: uploading vendor evidence");
        let request = self
            .http
            .post(self.endpoint(&format!("api/vendors/{id}/evidence"))?)
            .multipart(upload.into_form()?);
        self.execute(self.authorized(request, session)).await
    }

    pub async fn initiate_scan(
        &self,
        session: &Session,
        target: &str,
    ) -> Result<ScanResponse, ApiClientError> {
        let request = self
            .http
            .post(self.endpoint("api/scans/initiate")?)
            .json(&ScanRequest {
                target: target.to_string(),
            });
        self.execute(self.authorized(request, session)).await
    }

    pub async fn generate_report(
        &self,
        session: &Session,
        report_type: &str,
    ) -> Result<MessageResponse, ApiClientError> {
        let request = self
            .http
            .post(self.endpoint("api/reports/generate")?)
            .json(&ReportRequest {
                report_type: report_type.to_string(),
                user_id: session.user.id,
            });
        self.execute(self.authorized(request, session)).await
    }

    pub async fn analyze_content(
        &self,
        session: &Session,
        upload: FileUpload,
    ) -> Result<Value, ApiClientError> {
        debug!(filename = %upload.filename, "api: submitting content for analysis");
        let request = self
            .http
            .post(self.endpoint("api/reports/analyze-content")?)
            .multipart(upload.into_form()?);
        self.execute(self.authorized(request, session)).await
    }

    pub async fn list_users(&self, session: &Session) -> Result<Vec<UserListing>, ApiClientError> {
        let request = self.http.get(self.endpoint("api/admin/users")?);
        self.execute(self.authorized(request, session)).await
    }

    /// Runs without a session right after sign-up, before the account is
    /// verified.
    pub async fn set_user_role(
        &self,
        session: Option<&Session>,
        update: &RoleUpdate,
    ) -> Result<MessageResponse, ApiClientError> {
        let mut request = self
            .http
            .post(self.endpoint("api/admin/set-user-role")?)
            .json(update);
        if let Some(session) = session {
            request = self.authorized(request, session);
        }
        self.execute(request).await
    }
}

async fn check_status(response: Response) -> Result<Response, ApiClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().path().to_string();
    let text = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ApiError>(&text)
        .ok()
        .and_then(|body| body.message())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    warn!(status = status.as_u16(), path = %url, detail = %detail, "api: request failed");

    Err(match status {
        StatusCode::UNAUTHORIZED => ApiClientError::Unauthorized,
        StatusCode::FORBIDDEN => ApiClientError::Forbidden(detail),
        _ => ApiClientError::Status {
            status: status.as_u16(),
            detail,
        },
    })
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
