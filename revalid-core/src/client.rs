use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("{message}")]
    Server {
        status: StatusCode,
        message: String,
        body: String,
    },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid upload mime type: {0}")]
    MimeType(String),
    #[error("failed to read upload source {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ApiError {
    /// The server was reached and answered with a non-success status.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ApiError::Server { .. })
    }

    /// The call never completed: dropped connection, refused connect or deadline.
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::Timeout(_))
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Server { status, .. } => Some(*status),
            ApiError::Transport(err) => err.status(),
            _ => None,
        }
    }

    fn from_transport(err: reqwest::Error, deadline: Duration) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(deadline)
        } else {
            ApiError::Transport(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }

    fn as_reqwest(&self) -> Method {
        match self {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local file picked for upload. Serialized as `{uri, name, type}` so it can
/// travel inside a queued request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
}

impl FileDescriptor {
    pub fn new(
        uri: impl Into<String>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn local_path(&self) -> PathBuf {
        let raw = self.uri.strip_prefix("file://").unwrap_or(&self.uri);
        PathBuf::from(raw)
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    timeout: Duration,
}

impl ApiClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn upload_timeout(&self) -> Duration {
        self.timeout.saturating_mul(2)
    }

    pub async fn get(&self, endpoint: &str, token: Option<&str>) -> Result<Value, ApiError> {
        self.request(HttpMethod::Get, endpoint, None, token).await
    }

    pub async fn request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint(endpoint)?;
        let mut request = self
            .http
            .request(method.as_reqwest(), url)
            .timeout(self.timeout)
            .header("Accept", "application/json");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body.filter(|_| method.is_write()) {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ApiError::from_transport(err, self.timeout))?;
        Self::handle_response(response, self.timeout).await
    }

    /// Multipart upload: one `file` part plus flat string fields.
    pub async fn upload(
        &self,
        endpoint: &str,
        file: &FileDescriptor,
        token: Option<&str>,
        fields: &Map<String, Value>,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint(endpoint)?;
        let bytes = read_upload_source(&file.local_path()).await?;
        let part = Part::bytes(bytes)
            .file_name(file.name.clone())
            .mime_str(&file.mime_type)
            .map_err(|_| ApiError::MimeType(file.mime_type.clone()))?;
        let mut form = Form::new().part("file", part);
        for (key, value) in fields {
            if let Some(text) = flat_field_value(value) {
                form = form.text(key.clone(), text);
            }
        }

        let deadline = self.upload_timeout();
        let mut request = self.http.post(url).timeout(deadline).multipart(form);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ApiError::from_transport(err, deadline))?;
        Self::handle_response(response, deadline).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response(
        response: reqwest::Response,
        deadline: Duration,
    ) -> Result<Value, ApiError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ApiError::from_transport(err, deadline))?;
        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            Ok(serde_json::from_str(&body)?)
        } else {
            let message = extract_error_message(&body)
                .unwrap_or_else(|| format!("request failed with status {}", status.as_u16()));
            Err(ApiError::Server {
                status,
                message,
                body,
            })
        }
    }
}

async fn read_upload_source(path: &Path) -> Result<Vec<u8>, ApiError> {
    tokio::fs::read(path).await.map_err(|source| ApiError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn flat_field_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Pulls a human-readable message out of an error body: `error`, `message`,
/// then `errors`; non-JSON bodies are used as raw text.
pub fn extract_error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return Some(trimmed.to_string());
    };
    let Value::Object(map) = &value else {
        return value.as_str().map(str::to_string);
    };

    if let Some(message) = map.get("error").and_then(message_from_value) {
        return Some(message);
    }
    if let Some(message) = map.get("message").and_then(message_from_value) {
        return Some(message);
    }
    map.get("errors").and_then(message_from_errors)
}

fn message_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("msg"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn message_from_errors(value: &Value) -> Option<String> {
    let parts: Vec<String> = match value {
        Value::String(text) => vec![text.clone()],
        Value::Array(items) => items.iter().filter_map(message_from_value).collect(),
        Value::Object(fields) => fields
            .iter()
            .flat_map(|(field, messages)| match messages {
                Value::Array(items) => items
                    .iter()
                    .filter_map(message_from_value)
                    .map(|msg| format!("{field}: {msg}"))
                    .collect::<Vec<_>>(),
                other => message_from_value(other)
                    .map(|msg| vec![format!("{field}: {msg}")])
                    .unwrap_or_default(),
            })
            .collect(),
        _ => Vec::new(),
    };
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}
