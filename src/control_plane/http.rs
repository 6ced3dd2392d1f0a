use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ControlPlane, InstanceInfo, InstanceState};
use crate::error::ControlPlaneError;

// Instance description as returned by GET /instances/{id}
#[derive(Deserialize)]
struct DescribeBody {
    #[serde(default)]
    instance_id: Option<String>,
    state: String,
    #[serde(default)]
    private_ip: Option<String>,
    #[serde(default)]
    public_ip: Option<String>,
    #[serde(default)]
    launched_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// Control plane reached over a small REST/JSON API.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpControlPlane {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ControlPlaneError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlPlaneError::permanent("ClientSetup", e.to_string()))?;

        // add http:// if not present
        let base_url = base_url.trim().trim_end_matches('/');
        let base_url = if base_url.starts_with("http") {
            base_url.to_string()
        } else {
            format!("http://{}", base_url)
        };

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn power_call(&self, instance_id: &str, verb: &str) -> Result<(), ControlPlaneError> {
        let path = format!("/instances/{}/{}", instance_id, verb);
        let res = self
            .request(reqwest::Method::POST, &path)
            .send()
            .await
            .map_err(classify_transport)?;

        if res.status().is_success() {
            debug!(%instance_id, %verb, "control plane accepted power call");
            return Ok(());
        }
        Err(classify_response(res).await)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn describe(&self, instance_id: &str) -> Result<InstanceInfo, ControlPlaneError> {
        let res = self
            .request(reqwest::Method::GET, &format!("/instances/{}", instance_id))
            .send()
            .await
            .map_err(classify_transport)?;

        if !res.status().is_success() {
            return Err(classify_response(res).await);
        }

        let body: DescribeBody = res.json().await.map_err(classify_transport)?;
        Ok(InstanceInfo {
            instance_id: body.instance_id.unwrap_or_else(|| instance_id.to_string()),
            state: InstanceState::parse(&body.state),
            private_ip: body.private_ip.filter(|ip| !ip.is_empty()),
            public_ip: body.public_ip.filter(|ip| !ip.is_empty()),
            launched_at: body.launched_at,
        })
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), ControlPlaneError> {
        self.power_call(instance_id, "start").await
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), ControlPlaneError> {
        self.power_call(instance_id, "stop").await
    }
}

fn classify_transport(e: reqwest::Error) -> ControlPlaneError {
    if e.is_decode() {
        return ControlPlaneError::permanent("InvalidResponse", e.to_string());
    }
    // timeouts, refused connections, resets
    ControlPlaneError::Transient(e.to_string())
}

async fn classify_response(res: reqwest::Response) -> ControlPlaneError {
    let status = res.status();
    let text = res.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
    let message = body
        .message
        .unwrap_or_else(|| if text.is_empty() { status.to_string() } else { text.clone() });

    if is_transient(status) {
        warn!(%status, %message, "transient control plane response");
        return ControlPlaneError::Transient(message);
    }

    let code = body.code.unwrap_or_else(|| match status {
        StatusCode::NOT_FOUND => "InstanceNotFound".to_string(),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "AccessDenied".to_string(),
        _ => format!("Http{}", status.as_u16()),
    });
    ControlPlaneError::Permanent { code, message }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}
