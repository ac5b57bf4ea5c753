//! HTTP implementation of [`TestLabService`] on top of `reqwest`.
//!
//! Every request uses a short total timeout and a shorter connect timeout.
//! Transport failures and non-success responses are fatal and never retried
//! here; an operator re-invokes the run.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::wire::{
    ListStepsResponse, ListTestCasesResponse, Page, ProjectSettings, WireStep, WireTestCase,
    WireTestMatrix, summarize_error,
};
use super::{PAGE_SIZE, TestLabService};
use crate::config::{AuthConfig, LabConfig};
use crate::error::{LabError, LabResult};
use crate::model::{MatrixAck, ResultLocation, StepResult, TestCaseResult, TestMatrix};
use crate::submission::TestMatrixPayload;

/// Upper bound on how long the token command may run.
const TOKEN_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the bearer token comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// Read from an environment variable.
    Env(String),
    /// Trimmed stdout of a command, run once.
    Command(String),
    /// A fixed token.
    Static(String),
}

impl TokenSource {
    pub fn from_config(auth: &AuthConfig) -> Self {
        match &auth.token_command {
            Some(cmd) if !cmd.trim().is_empty() => TokenSource::Command(cmd.clone()),
            _ => TokenSource::Env(auth.token_env.clone()),
        }
    }

    async fn resolve(&self) -> LabResult<String> {
        let token = match self {
            TokenSource::Static(token) => token.clone(),
            TokenSource::Env(var) => std::env::var(var).map_err(|_| {
                LabError::Auth(format!("environment variable {var} is not set"))
            })?,
            TokenSource::Command(command) => {
                run_token_command(command, TOKEN_COMMAND_TIMEOUT).await?
            }
        };

        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(LabError::Auth("access token is empty".to_string()));
        }
        Ok(token)
    }
}

async fn run_token_command(command: &str, timeout: Duration) -> LabResult<String> {
    let parts = shell_words::split(command)
        .map_err(|e| LabError::Auth(format!("cannot parse token command: {e}")))?;
    let (program, args) = parts
        .split_first()
        .ok_or_else(|| LabError::Auth("token command is empty".to_string()))?;

    debug!("Fetching access token with: {}", command);

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            LabError::Auth(format!(
                "token command timed out after {}s",
                timeout.as_secs_f64()
            ))
        })?
        .map_err(|e| LabError::Auth(format!("failed to run token command: {e}")))?;

    if !output.status.success() {
        return Err(LabError::Auth(format!(
            "token command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Endpoints of the two APIs a run talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    testing: String,
    tool_results: String,
}

impl Endpoints {
    pub fn new(testing: &str, tool_results: &str) -> Self {
        Self {
            testing: testing.trim_end_matches('/').to_string(),
            tool_results: tool_results.trim_end_matches('/').to_string(),
        }
    }

    pub fn settings(&self, project: &str) -> String {
        format!("{}/projects/{}/settings", self.tool_results, project)
    }

    pub fn initialize_settings(&self, project: &str) -> String {
        format!("{}/projects/{}:initializeSettings", self.tool_results, project)
    }

    pub fn matrices(&self, project: &str) -> String {
        format!("{}/projects/{}/testMatrices", self.testing, project)
    }

    pub fn matrix(&self, project: &str, matrix_id: &str) -> String {
        format!("{}/{}", self.matrices(project), matrix_id)
    }

    pub fn steps(&self, project: &str, location: &ResultLocation) -> String {
        format!(
            "{}/projects/{}/histories/{}/executions/{}/steps",
            self.tool_results, project, location.history_id, location.execution_id
        )
    }

    pub fn test_cases(&self, project: &str, location: &ResultLocation, step_id: &str) -> String {
        format!("{}/{}/testCases", self.steps(project, location), step_id)
    }
}

/// Test Lab client over HTTPS.
///
/// The access token and the default bucket are resolved lazily and cached
/// for the lifetime of the client.
pub struct HttpTestLabClient {
    http: Client,
    endpoints: Endpoints,
    token_source: TokenSource,
    token: OnceCell<String>,
    default_bucket: OnceCell<String>,
}

impl HttpTestLabClient {
    /// Creates a client from the `[lab]` and `[auth]` tables.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Config`] if the HTTP client cannot be built.
    pub fn from_config(lab: &LabConfig, auth: &AuthConfig) -> LabResult<Self> {
        Self::new(
            Endpoints::new(&lab.testing_api, &lab.tool_results_api),
            TokenSource::from_config(auth),
            Duration::from_secs(lab.request_timeout_secs),
            Duration::from_secs(lab.connect_timeout_secs),
        )
    }

    pub fn new(
        endpoints: Endpoints,
        token_source: TokenSource,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> LabResult<Self> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .user_agent(concat!("devicelab/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LabError::config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoints,
            token_source,
            token: OnceCell::new(),
            default_bucket: OnceCell::new(),
        })
    }

    async fn access_token(&self) -> LabResult<&str> {
        let token = self
            .token
            .get_or_try_init(|| self.token_source.resolve())
            .await?;
        Ok(token.as_str())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: &str,
        query: &[(&str, String)],
    ) -> LabResult<T> {
        let url = reqwest::Url::parse_with_params(url, query)
            .map_err(|e| LabError::config(format!("invalid API URL '{url}': {e}")))?;
        self.send(operation, self.http.get(url)).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: &str,
        body: Option<&B>,
    ) -> LabResult<T> {
        let mut request = self.http.post(url);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(operation, request).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> LabResult<T> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(operation, e))?;

        if !status.is_success() {
            return Err(LabError::Protocol(format!(
                "{operation} failed: {}",
                summarize_error(status.as_u16(), &body)
            )));
        }

        serde_json::from_str(&body).map_err(|e| {
            LabError::Protocol(format!("{operation} returned an unreadable response: {e}"))
        })
    }

    /// Follows `nextPageToken` until the listing is exhausted.
    ///
    /// A token that repeats the previous one is a protocol error.
    async fn fetch_all<P: Page>(&self, operation: &'static str, url: &str) -> LabResult<Vec<P::Item>> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("pageSize", PAGE_SIZE.to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let page: P = self.get_json(operation, url, &query).await?;
            let (mut batch, next) = page.into_parts();
            items.append(&mut batch);

            match next {
                Some(token) if page_token.as_deref() == Some(token.as_str()) => {
                    return Err(LabError::Protocol(format!(
                        "{operation} returned page token '{token}' twice in a row"
                    )));
                }
                Some(token) => page_token = Some(token),
                None => return Ok(items),
            }
        }
    }

    async fn resolve_default_bucket(&self, project: &str) -> LabResult<String> {
        let settings: ProjectSettings = self
            .get_json("get project settings", &self.endpoints.settings(project), &[])
            .await?;

        if let Some(bucket) = settings.default_bucket.filter(|b| !b.is_empty()) {
            return Ok(bucket);
        }

        info!("Initializing Test Lab settings for project {}", project);
        let settings: ProjectSettings = self
            .post_json::<(), _>(
                "initialize project settings",
                &self.endpoints.initialize_settings(project),
                None,
            )
            .await?;

        settings
            .default_bucket
            .filter(|b| !b.is_empty())
            .ok_or_else(|| LabError::protocol("project settings do not name a default bucket"))
    }
}

fn transport_error(operation: &'static str, err: reqwest::Error) -> LabError {
    let message = if err.is_timeout() {
        format!("timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    };
    LabError::Transport { operation, message }
}

#[async_trait]
impl TestLabService for HttpTestLabClient {
    async fn default_bucket(&self, project: &str) -> LabResult<String> {
        let bucket = self
            .default_bucket
            .get_or_try_init(|| self.resolve_default_bucket(project))
            .await?;
        Ok(bucket.clone())
    }

    async fn submit_matrix(
        &self,
        project: &str,
        payload: &TestMatrixPayload,
    ) -> LabResult<MatrixAck> {
        let wire: WireTestMatrix = self
            .post_json("submit test matrix", &self.endpoints.matrices(project), Some(payload))
            .await?;
        Ok(wire.into_ack())
    }

    async fn get_matrix(&self, project: &str, matrix_id: &str) -> LabResult<TestMatrix> {
        let wire: WireTestMatrix = self
            .get_json("get test matrix", &self.endpoints.matrix(project, matrix_id), &[])
            .await?;
        Ok(wire.into_matrix(matrix_id))
    }

    async fn list_steps(
        &self,
        project: &str,
        location: &ResultLocation,
    ) -> LabResult<Vec<StepResult>> {
        let url = self.endpoints.steps(project, location);
        self.fetch_all::<ListStepsResponse>("list steps", &url)
            .await?
            .into_iter()
            .map(WireStep::into_step)
            .collect()
    }

    async fn list_test_cases(
        &self,
        project: &str,
        location: &ResultLocation,
        step_id: &str,
    ) -> LabResult<Vec<TestCaseResult>> {
        let url = self.endpoints.test_cases(project, location, step_id);
        Ok(self
            .fetch_all::<ListTestCasesResponse>("list test cases", &url)
            .await?
            .into_iter()
            .map(WireTestCase::into_test_case)
            .collect())
    }

    fn name(&self) -> &str {
        "firebase-test-lab"
    }
}
