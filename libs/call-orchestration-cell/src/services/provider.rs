// libs/call-orchestration-cell/src/services/provider.rs
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use shared_config::AppConfig;

use crate::models::CallOrchestrationError;

/// Video provider operations consumed by the orchestration core. Media
/// transport, codecs and bandwidth are the provider's problem entirely; the
/// core only creates meetings and toggles recordings.
#[async_trait]
pub trait MeetingProvider: Send + Sync {
    /// Create a meeting and return its opaque reference.
    async fn create_meeting(&self) -> Result<String, CallOrchestrationError>;

    /// Release a meeting. Providers expire meetings on their own; this is
    /// best-effort cleanup.
    async fn end_meeting(&self, meeting_ref: &str) -> Result<(), CallOrchestrationError>;

    async fn start_recording(&self, meeting_ref: &str) -> Result<(), CallOrchestrationError>;

    async fn stop_recording(&self, meeting_ref: &str) -> Result<(), CallOrchestrationError>;

    async fn health_check(&self) -> Result<bool, CallOrchestrationError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MeetingResponse {
    #[serde(rename = "meetingRef")]
    meeting_ref: String,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(rename = "errorDescription", skip_serializing_if = "Option::is_none")]
    error_description: Option<String>,
}

/// REST client for the realtime meeting provider's management API.
pub struct RealtimeMeetingClient {
    client: Client,
    app_id: String,
    api_token: String,
    base_url: String,
}

impl RealtimeMeetingClient {
    pub fn new(config: &AppConfig) -> Result<Self, CallOrchestrationError> {
        if !config.is_video_provider_configured() {
            return Err(CallOrchestrationError::ProviderNotConfigured);
        }

        Ok(Self {
            client: Client::new(),
            app_id: config.video_provider_app_id.clone(),
            api_token: config.video_provider_api_token.clone(),
            base_url: config.video_provider_base_url.clone(),
        })
    }

    async fn post(&self, url: &str) -> Result<String, CallOrchestrationError> {
        debug!("Sending provider request to: {}", url);

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Content-Type", "application/json")
            .send()
            .await?;

        let status = response.status();
        let response_text = response.text().await?;

        if !status.is_success() {
            error!("Provider request failed: {} - {}", status, response_text);
            return Err(CallOrchestrationError::ProviderApiError {
                message: format!("HTTP {}: {}", status, response_text),
            });
        }

        Ok(response_text)
    }

    fn check_meeting_errors(&self, response: &MeetingResponse) -> Result<(), CallOrchestrationError> {
        if let Some(error_code) = &response.error_code {
            let message = response
                .error_description
                .as_deref()
                .unwrap_or("Unknown error");
            error!("Provider meeting error: {} - {}", error_code, message);
            return Err(CallOrchestrationError::ProviderApiError {
                message: format!("{}: {}", error_code, message),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MeetingProvider for RealtimeMeetingClient {
    /// POST /apps/{appId}/meetings/new
    async fn create_meeting(&self) -> Result<String, CallOrchestrationError> {
        info!("Creating new provider meeting");

        let url = format!("{}/apps/{}/meetings/new", self.base_url, self.app_id);
        let response_text = self.post(&url).await?;

        let meeting: MeetingResponse = serde_json::from_str(&response_text).map_err(|e| {
            CallOrchestrationError::ProviderApiError {
                message: format!("Failed to parse meeting response: {}", e),
            }
        })?;

        self.check_meeting_errors(&meeting)?;

        info!("Successfully created provider meeting: {}", meeting.meeting_ref);
        Ok(meeting.meeting_ref)
    }

    /// POST /apps/{appId}/meetings/{meetingRef}/end
    async fn end_meeting(&self, meeting_ref: &str) -> Result<(), CallOrchestrationError> {
        let url = format!(
            "{}/apps/{}/meetings/{}/end",
            self.base_url, self.app_id, meeting_ref
        );
        self.post(&url).await?;
        info!("Ended provider meeting: {}", meeting_ref);
        Ok(())
    }

    /// POST /apps/{appId}/meetings/{meetingRef}/recording/start
    async fn start_recording(&self, meeting_ref: &str) -> Result<(), CallOrchestrationError> {
        let url = format!(
            "{}/apps/{}/meetings/{}/recording/start",
            self.base_url, self.app_id, meeting_ref
        );
        self.post(&url).await?;
        info!("Provider confirmed recording start for meeting: {}", meeting_ref);
        Ok(())
    }

    /// POST /apps/{appId}/meetings/{meetingRef}/recording/stop
    async fn stop_recording(&self, meeting_ref: &str) -> Result<(), CallOrchestrationError> {
        let url = format!(
            "{}/apps/{}/meetings/{}/recording/stop",
            self.base_url, self.app_id, meeting_ref
        );
        self.post(&url).await?;
        info!("Provider confirmed recording stop for meeting: {}", meeting_ref);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, CallOrchestrationError> {
        debug!("Performing provider API health check");

        let url = format!("{}/apps/{}", self.base_url, self.app_id);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .await?;

        // 404 is expected from the bare app-info endpoint
        let is_healthy = response.status().is_success() || response.status() == 404;

        if is_healthy {
            debug!("Provider API health check passed");
        } else {
            warn!("Provider API health check failed: {}", response.status());
        }

        Ok(is_healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> AppConfig {
        AppConfig {
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            video_provider_app_id: "test-app-id".to_string(),
            video_provider_api_token: "test-token".to_string(),
            video_provider_base_url: "https://test.provider.example/v1".to_string(),
        }
    }

    #[test]
    fn test_client_creation() {
        let config = create_test_config();
        let client = RealtimeMeetingClient::new(&config);
        assert!(client.is_ok());
    }

    #[test]
    fn test_client_creation_fails_without_config() {
        let mut config = create_test_config();
        config.video_provider_app_id = "".to_string();

        let client = RealtimeMeetingClient::new(&config);
        assert!(matches!(client, Err(CallOrchestrationError::ProviderNotConfigured)));
    }

    #[test]
    fn test_meeting_error_envelope_is_rejected() {
        let config = create_test_config();
        let client = RealtimeMeetingClient::new(&config).unwrap();

        let response = MeetingResponse {
            meeting_ref: "mtg_1".to_string(),
            error_code: Some("M1001".to_string()),
            error_description: Some("app quota exceeded".to_string()),
        };

        let result = client.check_meeting_errors(&response);
        assert!(matches!(result, Err(CallOrchestrationError::ProviderApiError { .. })));
    }
}
