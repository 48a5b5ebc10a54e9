//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the backend HTTP API (workflow submission, image upload,
//! history retrieval, output listing, LoRA discovery) using [`reqwest`].

use serde::Deserialize;

/// File extension carried by LoRA adapter files on the backend.
const LORA_EXTENSION: &str = ".safetensors";

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the `/prompt` endpoint after successfully
/// queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued job.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i32,
}

/// Response returned by the `/upload/image` endpoint.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    /// Server-side name of the stored image; referenced by edit graphs.
    pub name: String,
}

/// Errors from the REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The configured base URL could not be parsed.
    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),
}

impl ComfyUIApi {
    /// Create a new API client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    /// Base HTTP URL this client targets.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /prompt` with the workflow JSON and the client
    /// correlation id. Returns the server-assigned `prompt_id`.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Upload a source image for edit-mode workflows.
    ///
    /// Sends `POST /upload/image` as a multipart form with
    /// `overwrite=true`. The returned name is what edit graphs must
    /// reference.
    pub async fn upload_image(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "true");

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve the ledger entry for a specific job.
    ///
    /// Sends `GET /history/{prompt_id}`. The returned JSON is keyed by
    /// the prompt id and contains the entry's outputs once execution
    /// has finished.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve the full job ledger, keyed by job id.
    ///
    /// Each entry carries its outputs and the originating graph under a
    /// `prompt` field.
    pub async fn get_full_history(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve the raw output-file listing (fallback when the ledger
    /// is unavailable).
    pub async fn list_output_files(&self) -> Result<Vec<String>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/internal/files/output", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Discover available LoRA names.
    ///
    /// Queries `GET /object_info/LoraLoader` and extracts the
    /// `lora_name` option list, filtered to `.safetensors` files with
    /// the extension stripped. An unexpected response shape yields an
    /// empty list rather than an error; only transport failures
    /// propagate.
    pub async fn list_lora_names(&self) -> Result<Vec<String>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/object_info/LoraLoader", self.api_url))
            .send()
            .await?;

        let info: serde_json::Value = Self::parse_response(response).await?;
        Ok(extract_lora_names(&info))
    }

    /// Build the canonical display locator for an output image.
    ///
    /// Query arguments are percent-encoded; the resulting URL is what
    /// history entries store and the presentation layer fetches.
    pub fn view_url(
        &self,
        filename: &str,
        subfolder: &str,
        file_type: &str,
    ) -> Result<String, ComfyUIApiError> {
        let mut url = reqwest::Url::parse(&self.api_url)
            .map_err(|e| ComfyUIApiError::InvalidUrl(e.to_string()))?;
        url.set_path("/view");
        url.query_pairs_mut()
            .append_pair("filename", filename)
            .append_pair("subfolder", subfolder)
            .append_pair("type", file_type);
        Ok(url.to_string())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::Api`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Pull the LoRA filename list out of an `/object_info/LoraLoader`
/// response: `LoraLoader.input.required.lora_name[0]` is an array of
/// filenames.
fn extract_lora_names(info: &serde_json::Value) -> Vec<String> {
    let Some(names) = info
        .pointer("/LoraLoader/input/required/lora_name/0")
        .and_then(|v| v.as_array())
    else {
        tracing::warn!("Unexpected /object_info/LoraLoader response shape");
        return Vec::new();
    };

    names
        .iter()
        .filter_map(|v| v.as_str())
        .filter_map(|name| name.strip_suffix(LORA_EXTENSION))
        .map(str::to_string)
        .collect()
}
