//! The external batch-inference provider, abstracted as a trait the way the
//! corpus abstracts `HttpClient` — one production `reqwest` implementation,
//! one test double that records calls and replays canned responses.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderBatchState {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
}

impl ProviderBatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i64>,
    pub cached_tokens: Option<i64>,
    pub reasoning_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ProviderBatchStatus {
    pub status: ProviderBatchState,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub request_counts: Option<RequestCounts>,
    pub usage: Option<Usage>,
    pub error_message: Option<String>,
}

/// One per-model-provider submission surface: upload a file, create a
/// batch against it, poll for completion, fetch the result files. Modeled
/// on OpenAI's Batch API (spec §1, §6).
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn upload_file(&self, ndjson: Vec<u8>) -> Result<String>;
    async fn create_batch(&self, input_file_id: &str, endpoint: &str) -> Result<String>;
    async fn retrieve_batch(&self, provider_batch_id: &str) -> Result<ProviderBatchStatus>;
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>>;
    async fn cancel_batch(&self, provider_batch_id: &str) -> Result<()>;
}

pub struct ReqwestProviderClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ReqwestProviderClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.into(), api_key: api_key.into() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn classify_error(response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 404 {
            return ProviderError::NotFound(body);
        }
        if status.as_u16() == 429 && body.to_lowercase().contains("token") {
            return ProviderError::TokenLimitExceeded(body);
        }
        ProviderError::Api { status: Some(status.as_u16()), message: body }
    }
}

#[async_trait]
impl ProviderClient for ReqwestProviderClient {
    async fn upload_file(&self, ndjson: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(ndjson).file_name("batch.ndjson");
        let form = reqwest::multipart::Form::new().text("purpose", "batch").part("file", part);
        let response = self
            .client
            .post(self.url("/files"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::classify_error(response).await);
        }
        #[derive(Deserialize)]
        struct FileResponse {
            id: String,
        }
        Ok(response.json::<FileResponse>().await?.id)
    }

    async fn create_batch(&self, input_file_id: &str, endpoint: &str) -> Result<String> {
        let body = serde_json::json!({
            "input_file_id": input_file_id,
            "endpoint": endpoint,
            "completion_window": "24h",
        });
        let response = self
            .client
            .post(self.url("/batches"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::classify_error(response).await);
        }
        #[derive(Deserialize)]
        struct BatchResponse {
            id: String,
        }
        Ok(response.json::<BatchResponse>().await?.id)
    }

    async fn retrieve_batch(&self, provider_batch_id: &str) -> Result<ProviderBatchStatus> {
        let response = self
            .client
            .get(self.url(&format!("/batches/{provider_batch_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::classify_error(response).await);
        }

        #[derive(Deserialize)]
        struct BatchStatusResponse {
            status: ProviderBatchState,
            output_file_id: Option<String>,
            error_file_id: Option<String>,
            request_counts: Option<RequestCounts>,
            usage: Option<Usage>,
            #[serde(default)]
            errors: Option<serde_json::Value>,
        }
        let parsed: BatchStatusResponse = response.json().await?;
        Ok(ProviderBatchStatus {
            status: parsed.status,
            output_file_id: parsed.output_file_id,
            error_file_id: parsed.error_file_id,
            request_counts: parsed.request_counts,
            usage: parsed.usage,
            error_message: parsed.errors.map(|v| v.to_string()),
        })
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.url(&format!("/files/{file_id}/content")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::classify_error(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn cancel_batch(&self, provider_batch_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/batches/{provider_batch_id}/cancel")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::classify_error(response).await);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum MockCall {
    UploadFile(Vec<u8>),
    CreateBatch { input_file_id: String, endpoint: String },
    RetrieveBatch(String),
    DownloadFile(String),
    CancelBatch(String),
}

/// Records every call it receives and replays one canned result per call,
/// in order, the way the corpus's `MockHttpClient` replays a response
/// queue.
pub struct MockProviderClient {
    upload_file: Mutex<Vec<Result<String>>>,
    create_batch: Mutex<Vec<Result<String>>>,
    retrieve_batch: Mutex<Vec<Result<ProviderBatchStatus>>>,
    download_file: Mutex<Vec<Result<Vec<u8>>>>,
    cancel_batch: Mutex<Vec<Result<()>>>,
    pub calls: Mutex<Vec<MockCall>>,
}

impl Default for MockProviderClient {
    fn default() -> Self {
        Self {
            upload_file: Mutex::new(Vec::new()),
            create_batch: Mutex::new(Vec::new()),
            retrieve_batch: Mutex::new(Vec::new()),
            download_file: Mutex::new(Vec::new()),
            cancel_batch: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockProviderClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_upload_file(&self, result: Result<String>) {
        self.upload_file.lock().unwrap().push(result);
    }

    pub fn push_create_batch(&self, result: Result<String>) {
        self.create_batch.lock().unwrap().push(result);
    }

    pub fn push_retrieve_batch(&self, result: Result<ProviderBatchStatus>) {
        self.retrieve_batch.lock().unwrap().push(result);
    }

    pub fn push_download_file(&self, result: Result<Vec<u8>>) {
        self.download_file.lock().unwrap().push(result);
    }

    pub fn push_cancel_batch(&self, result: Result<()>) {
        self.cancel_batch.lock().unwrap().push(result);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn pop_or_exhausted<T>(queue: &Mutex<Vec<Result<T>>>, what: &str) -> Result<T> {
    let mut queue = queue.lock().unwrap();
    if queue.is_empty() {
        return Err(ProviderError::Api { status: None, message: format!("no mock response queued for {what}") });
    }
    queue.remove(0)
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn upload_file(&self, ndjson: Vec<u8>) -> Result<String> {
        self.calls.lock().unwrap().push(MockCall::UploadFile(ndjson.clone()));
        pop_or_exhausted(&self.upload_file, "upload_file")
    }

    async fn create_batch(&self, input_file_id: &str, endpoint: &str) -> Result<String> {
        self.calls.lock().unwrap().push(MockCall::CreateBatch {
            input_file_id: input_file_id.to_string(),
            endpoint: endpoint.to_string(),
        });
        pop_or_exhausted(&self.create_batch, "create_batch")
    }

    async fn retrieve_batch(&self, provider_batch_id: &str) -> Result<ProviderBatchStatus> {
        self.calls.lock().unwrap().push(MockCall::RetrieveBatch(provider_batch_id.to_string()));
        pop_or_exhausted(&self.retrieve_batch, "retrieve_batch")
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(MockCall::DownloadFile(file_id.to_string()));
        pop_or_exhausted(&self.download_file, "download_file")
    }

    async fn cancel_batch(&self, provider_batch_id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(MockCall::CancelBatch(provider_batch_id.to_string()));
        pop_or_exhausted(&self.cancel_batch, "cancel_batch")
    }
}
