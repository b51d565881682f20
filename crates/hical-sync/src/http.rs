//! HTTP client for the `member-data-sync` edge function.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hical_core::{AppResult, CloudConfig, ConfigError, ReqwestErrorExt, TransportError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::backend::{
    BackupReceipt, BackupSnapshot, CloudBackend, PullResponse, RemoteChange, UploadAck,
};

const FUNCTION_PATH: &str = "/functions/v1/member-data-sync";

pub struct HttpCloudBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    user_id: String,
}

#[derive(Serialize)]
struct SyncRequest<'a> {
    user_id: &'a str,
    changes: &'a [RemoteChange],
}

#[derive(Serialize)]
struct PullRequest<'a> {
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    since: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct UserRequest<'a> {
    user_id: &'a str,
}

#[derive(Serialize)]
struct RestoreRequest<'a> {
    user_id: &'a str,
    backup_data: &'a BackupSnapshot,
}

#[derive(Deserialize)]
struct BackupResponse {
    backup: BackupSnapshot,
    #[serde(default)]
    stats: Option<BackupStats>,
}

#[derive(Deserialize)]
struct BackupStats {
    events_count: usize,
}

#[derive(Deserialize)]
struct MessageResponse {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl HttpCloudBackend {
    /// Build a client from configuration.
    ///
    /// # Errors
    /// `AppError::Config` when the API key or member id is missing.
    pub fn new(config: &CloudConfig) -> AppResult<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("cloud.api_key is not set".to_string()))?;
        let user_id = config
            .user_id
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("cloud.user_id is not set".to_string()))?;
        Ok(Self::new_with_base_url(api_key, user_id, &config.base_url))
    }

    pub fn new_with_base_url(api_key: &str, user_id: &str, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            user_id: user_id.to_string(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    async fn call<B, T>(&self, action: &str, body: &B) -> Result<T, TransportError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, FUNCTION_PATH);
        let response = self
            .client
            .post(&url)
            .query(&[("action", action)])
            .header("Authorization", self.auth_header())
            .json(body)
            .send()
            .await
            .map_err(|e| e.into_transport_error())?;

        self.handle_response(response).await
    }

    /// Helper to handle function responses and errors.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| TransportError::Serialization(format!("JSON parse error: {}", e)));
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or(text);

        match status.as_u16() {
            401 | 403 => Err(TransportError::Unauthorized),
            400 | 422 => Err(TransportError::Rejected(message)),
            code => Err(TransportError::ServerError {
                status: code,
                message,
            }),
        }
    }
}

#[async_trait]
impl CloudBackend for HttpCloudBackend {
    #[instrument(skip(self, changes), fields(count = changes.len()), level = "info")]
    async fn upload(&self, changes: &[RemoteChange]) -> AppResult<UploadAck> {
        let request = SyncRequest {
            user_id: &self.user_id,
            changes,
        };
        Ok(self.call("sync", &request).await?)
    }

    /// `action=pull` is not among the service's published actions
    /// (`sync`, `backup`, `restore`, `member-upgrade`); the deployment has to provide it.
    #[instrument(skip(self), level = "info")]
    async fn download(&self, since: Option<DateTime<Utc>>) -> AppResult<PullResponse> {
        let request = PullRequest {
            user_id: &self.user_id,
            since,
        };
        Ok(self.call("pull", &request).await?)
    }

    #[instrument(skip(self), level = "info")]
    async fn create_backup(&self) -> AppResult<BackupReceipt> {
        let request = UserRequest {
            user_id: &self.user_id,
        };
        let response: BackupResponse = self.call("backup", &request).await?;
        let events_count = response
            .stats
            .map(|s| s.events_count)
            .unwrap_or(response.backup.events.len());
        Ok(BackupReceipt {
            events_count,
            snapshot: response.backup,
        })
    }

    #[instrument(skip(self, snapshot), fields(count = snapshot.events.len()), level = "info")]
    async fn restore(&self, snapshot: &BackupSnapshot) -> AppResult<()> {
        let request = RestoreRequest {
            user_id: &self.user_id,
            backup_data: snapshot,
        };
        let response: MessageResponse = self.call("restore", &request).await?;
        if let Some(message) = response.message {
            tracing::debug!("Restore: {}", message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use chrono::TimeZone;
    use hical_core::AppError;
    use hical_events::Event;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> HttpCloudBackend {
        HttpCloudBackend::new_with_base_url("test_key", "member-1", &server.uri())
    }

    #[tokio::test]
    async fn test_upload_posts_changes() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(FUNCTION_PATH))
            .and(query_param("action", "sync"))
            .and(header("Authorization", "Bearer test_key"))
            .and(body_partial_json(serde_json::json!({ "user_id": "member-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accepted": 2,
                "server_time": "2024-06-01T12:00:00Z"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let changes = vec![
            RemoteChange::upsert(Event::new("Lunch")),
            RemoteChange::tombstone("gone", Utc::now()),
        ];
        let ack = backend(&mock_server).upload(&changes).await.unwrap();

        assert_eq!(ack.accepted, 2);
        assert_eq!(ack.server_time, Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_download_parses_tombstones() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(FUNCTION_PATH))
            .and(query_param("action", "pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "changes": [
                    { "id": "e1", "updated_at": "2024-06-01T10:00:00Z", "deleted": true }
                ],
                "server_time": "2024-06-01T12:00:00Z"
            })))
            .mount(&mock_server)
            .await;

        let pull = backend(&mock_server).download(None).await.unwrap();
        assert_eq!(pull.changes.len(), 1);
        assert!(pull.changes[0].deleted);
        assert!(pull.changes[0].event.is_none());
    }

    #[tokio::test]
    async fn test_backup_reads_stats() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(query_param("action", "backup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "Backup created successfully",
                "backup": {
                    "events": [],
                    "backup_timestamp": "2024-06-01T12:00:00Z",
                    "version": "1.0"
                },
                "stats": { "events_count": 0 }
            })))
            .mount(&mock_server)
            .await;

        let receipt = backend(&mock_server).create_backup().await.unwrap();
        assert_eq!(receipt.events_count, 0);
        assert_eq!(receipt.snapshot.version, "1.0");
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;

        let result = backend(&mock_server).download(None).await;
        assert!(matches!(
            result,
            Err(AppError::Transport(TransportError::Unauthorized))
        ));
    }

    #[tokio::test]
    async fn test_server_error_keeps_function_message() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_json(serde_json::json!({ "error": "Member user not found" })),
            )
            .mount(&mock_server)
            .await;

        match backend(&mock_server).create_backup().await {
            Err(AppError::Transport(TransportError::ServerError { status, message })) => {
                assert_eq!(status, 500);
                assert_eq!(message, "Member user not found");
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.events_count)),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_serialization_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let result = backend(&mock_server).upload(&[]).await;
        assert!(matches!(
            result,
            Err(AppError::Transport(TransportError::Serialization(_)))
        ));
    }

    #[test]
    fn test_new_requires_credentials() {
        let config = CloudConfig {
            api_key: None,
            ..CloudConfig::default()
        };
        assert!(matches!(HttpCloudBackend::new(&config), Err(AppError::Config(_))));
    }
}
