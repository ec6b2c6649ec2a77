use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::models::{self, NewTimeEntry, Project, Tag, TimeEntry, Workspace};

const API_BASE: &str = "https://api.track.toggl.com/api/v9";
const CREATED_WITH: &str = "toggl-now";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TogglError {
    #[error("Invalid API token.")]
    Unauthorized,
    #[error("This Toggl feature requires a paid plan.")]
    PaymentRequired,
    #[error("Toggl rate limit reached, try again shortly.")]
    RateLimited,
    #[error("{0}")]
    ServerError(String),
    #[error("{0}")]
    Network(String),
    #[error("No workspaces found.")]
    NoWorkspace,
}

#[async_trait]
pub trait TrackerApi: Send + Sync {
    async fn fetch_active_entry(&self) -> Result<Option<TimeEntry>, TogglError>;

    async fn fetch_projects(&self) -> Result<Vec<Project>, TogglError>;

    async fn fetch_clients(&self) -> Result<Vec<models::Client>, TogglError>;

    async fn fetch_tags(&self) -> Result<Vec<Tag>, TogglError>;

    async fn create_and_start(
        &self,
        description: &str,
        project_id: Option<u64>,
        tag_ids: &[u64],
    ) -> Result<TimeEntry, TogglError>;

    async fn stop_entry(&self, id: u64) -> Result<TimeEntry, TogglError>;
}

#[derive(Clone)]
pub struct TogglClient {
    client: Client,
    token: String,
    workspace_id: u64,
}

impl TogglClient {
    pub async fn connect(token: String, workspace_id: Option<u64>) -> Result<Self, TogglError> {
        let client = Client::builder()
            .user_agent("toggl-now")
            .build()
            .map_err(|err| TogglError::Network(err.to_string()))?;
        let mut toggl = Self {
            client,
            token,
            workspace_id: 0,
        };

        toggl.workspace_id = match workspace_id {
            Some(id) => id,
            None => toggl
                .fetch_workspaces()
                .await?
                .first()
                .map(|workspace| workspace.id)
                .ok_or(TogglError::NoWorkspace)?,
        };
        debug!(workspace_id = toggl.workspace_id, "toggl client ready");
        Ok(toggl)
    }

    pub async fn fetch_workspaces(&self) -> Result<Vec<Workspace>, TogglError> {
        self.fetch(Method::GET, format!("{API_BASE}/workspaces"))
            .await
    }

    fn workspace_url(&self, path: &str) -> String {
        format!("{API_BASE}/workspaces/{}/{path}", self.workspace_id)
    }

    async fn fetch<T: DeserializeOwned>(&self, method: Method, url: String) -> Result<T, TogglError> {
        self.send(self.client.request(method, url)).await
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, TogglError> {
        let credentials = STANDARD.encode(format!("{}:api_token", self.token));
        let response = request
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Basic {}", credentials))
            .send()
            .await
            .map_err(|err| TogglError::Network(err.to_string()))?;

        if let Some(err) = status_error(response.status()) {
            return Err(err);
        }

        response
            .json::<T>()
            .await
            .map_err(|err| TogglError::Network(err.to_string()))
    }
}

#[async_trait]
impl TrackerApi for TogglClient {
    async fn fetch_active_entry(&self) -> Result<Option<TimeEntry>, TogglError> {
        self.fetch(Method::GET, format!("{API_BASE}/me/time_entries/current"))
            .await
    }

    async fn fetch_projects(&self) -> Result<Vec<Project>, TogglError> {
        let projects: Option<Vec<Project>> =
            self.fetch(Method::GET, self.workspace_url("projects")).await?;
        Ok(projects.unwrap_or_default())
    }

    async fn fetch_clients(&self) -> Result<Vec<models::Client>, TogglError> {
        let clients: Option<Vec<models::Client>> =
            self.fetch(Method::GET, self.workspace_url("clients")).await?;
        Ok(clients.unwrap_or_default())
    }

    async fn fetch_tags(&self) -> Result<Vec<Tag>, TogglError> {
        let tags: Option<Vec<Tag>> = self.fetch(Method::GET, self.workspace_url("tags")).await?;
        Ok(tags.unwrap_or_default())
    }

    async fn create_and_start(
        &self,
        description: &str,
        project_id: Option<u64>,
        tag_ids: &[u64],
    ) -> Result<TimeEntry, TogglError> {
        let body = NewTimeEntry {
            created_with: CREATED_WITH.to_string(),
            description: description.to_string(),
            project_id,
            tag_ids: tag_ids.to_vec(),
            workspace_id: self.workspace_id,
            start: Utc::now(),
            duration: -1,
        };
        let request = self
            .client
            .post(self.workspace_url("time_entries"))
            .json(&body);
        self.send(request).await
    }

    async fn stop_entry(&self, id: u64) -> Result<TimeEntry, TogglError> {
        let url = self.workspace_url(&format!("time_entries/{id}/stop"));
        self.fetch(Method::PATCH, url).await
    }
}

fn status_error(status: StatusCode) -> Option<TogglError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Some(TogglError::Unauthorized);
    }

    if status == StatusCode::PAYMENT_REQUIRED {
        return Some(TogglError::PaymentRequired);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(TogglError::RateLimited);
    }

    if status.is_server_error() {
        return Some(TogglError::ServerError(format!("Toggl API error: {status}")));
    }

    if !status.is_success() {
        return Some(TogglError::Network(format!("Toggl API error: {status}")));
    }

    None
}
