//! Agave-compatible REST client used by the remote execution backend and
//! the remote data handler.
//!
//! All calls go through a retry wrapper: transport errors, 429 and 5xx
//! responses are retried with bounded exponential backoff; 4xx responses
//! propagate immediately.

use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use geneflow_core::config::RemoteConfig;

use crate::error::{EngineError, Result};
use crate::step::MapItemStatus;

/// Connection settings for a remote REST backend.
#[derive(Debug, Clone)]
pub struct RemoteAuth {
    /// API base URL, e.g. `https://agave.example.org`.
    pub base_url: String,

    /// OAuth bearer token. Acquisition happens outside the engine.
    pub token: String,
}

/// One entry of a remote job's history.
#[derive(Debug, Clone, Deserialize)]
pub struct JobHistoryEntry {
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub description: String,
}

/// One entry of a remote file listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFileEntry {
    pub name: String,

    #[serde(rename = "type", default)]
    pub entry_type: String,
}

impl RemoteFileEntry {
    pub fn is_dir(&self) -> bool {
        self.entry_type == "dir"
    }
}

pub struct AgaveClient {
    base_url: String,
    token: String,
    client: Client,
    retries: u32,
    backoff_base: Duration,
}

impl AgaveClient {
    pub fn new(auth: &RemoteAuth, config: &RemoteConfig) -> Result<AgaveClient> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .timeout(Duration::from_secs(config.read_timeout))
            .build()?;
        Ok(AgaveClient {
            base_url: auth.base_url.trim_end_matches('/').to_string(),
            token: auth.token.clone(),
            client,
            retries: config.retries,
            backoff_base: Duration::from_secs(config.backoff_base),
        })
    }

    /// The current bearer token (also attached to notifications).
    pub fn bearer_token(&self) -> &str {
        &self.token
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, retrying transient failures, and return the
    /// `result` member of the response envelope.
    fn send_with_retry(&self, build: impl Fn() -> RequestBuilder) -> Result<Value> {
        let mut delay = self.backoff_base;
        let mut attempt = 0;
        loop {
            let outcome = build().bearer_auth(&self.token).send();
            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: Value = response.json().unwrap_or(Value::Null);
                        return Ok(body.get("result").cloned().unwrap_or(body));
                    }
                    let transient = status.is_server_error()
                        || status == StatusCode::TOO_MANY_REQUESTS;
                    let message = response.text().unwrap_or_default();
                    if !transient || attempt >= self.retries {
                        return Err(EngineError::RemoteApi {
                            status: status.as_u16(),
                            message,
                        });
                    }
                    warn!(status = %status, attempt, "transient remote error, retrying");
                }
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(EngineError::Http(err));
                    }
                    warn!(error = %err, attempt, "remote request failed, retrying");
                }
            }
            thread::sleep(delay);
            delay = delay.saturating_mul(2);
            attempt += 1;
        }
    }

    // --- jobs ---

    /// Submit a job manifest; returns the remote job id.
    pub fn jobs_submit(&self, manifest: &Value) -> Result<String> {
        debug!(manifest = %manifest, "submitting remote job");
        let result =
            self.send_with_retry(|| self.client.post(self.url("/jobs/v2")).json(manifest))?;
        result
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::Backend("remote job submission returned no id".to_string()))
    }

    /// Current state string of a remote job.
    pub fn jobs_status(&self, job_id: &str) -> Result<String> {
        let result = self
            .send_with_retry(|| self.client.get(self.url(&format!("/jobs/v2/{}", job_id))))?;
        result
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::Backend(format!("remote job {} reported no status", job_id))
            })
    }

    pub fn jobs_history(&self, job_id: &str) -> Result<Vec<JobHistoryEntry>> {
        let result = self.send_with_retry(|| {
            self.client
                .get(self.url(&format!("/jobs/v2/{}/history", job_id)))
        })?;
        Ok(serde_json::from_value(result).unwrap_or_default())
    }

    // --- files ---

    /// Server-side import of `src_uri` into `system:dest_path/dest_name`.
    pub fn files_import_from_remote(
        &self,
        system: &str,
        dest_path: &str,
        dest_name: &str,
        src_uri: &str,
    ) -> Result<()> {
        let body = json!({
            "urlToIngest": src_uri,
            "fileName": dest_name,
        });
        self.send_with_retry(|| {
            self.client
                .post(self.url(&format!("/files/v2/media/system/{}{}", system, dest_path)))
                .json(&body)
        })?;
        Ok(())
    }

    /// Raw listing of a path. Directory listings include the directory
    /// itself as "."; file listings are the single file entry.
    pub fn files_list(&self, system: &str, path: &str) -> Result<Vec<RemoteFileEntry>> {
        let result = self.send_with_retry(|| {
            self.client
                .get(self.url(&format!("/files/v2/listings/system/{}{}", system, path)))
        })?;
        Ok(serde_json::from_value(result).unwrap_or_default())
    }

    pub fn files_mkdir(&self, system: &str, path: &str, name: &str) -> Result<()> {
        let body = json!({ "action": "mkdir", "path": name });
        self.send_with_retry(|| {
            self.client
                .put(self.url(&format!("/files/v2/media/system/{}{}", system, path)))
                .json(&body)
        })?;
        Ok(())
    }

    pub fn files_delete(&self, system: &str, path: &str) -> Result<()> {
        self.send_with_retry(|| {
            self.client
                .delete(self.url(&format!("/files/v2/media/system/{}{}", system, path)))
        })?;
        Ok(())
    }

    pub fn files_exists(&self, system: &str, path: &str) -> Result<bool> {
        let outcome = self.send_with_retry(|| {
            self.client
                .get(self.url(&format!("/files/v2/listings/system/{}{}", system, path)))
        });
        match outcome {
            Ok(_) => Ok(true),
            Err(EngineError::RemoteApi { status: 404, .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn files_upload(&self, system: &str, dest_path: &str, local: &Path) -> Result<()> {
        let bytes = std::fs::read(local)?;
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        self.send_with_retry(|| {
            let part = reqwest::blocking::multipart::Part::bytes(bytes.clone())
                .file_name(file_name.clone());
            let form = reqwest::blocking::multipart::Form::new().part("fileToUpload", part);
            self.client
                .post(self.url(&format!("/files/v2/media/system/{}{}", system, dest_path)))
                .multipart(form)
        })?;
        Ok(())
    }

    pub fn files_download(&self, system: &str, path: &str, local: &Path) -> Result<()> {
        let mut delay = self.backoff_base;
        let mut attempt = 0;
        loop {
            let outcome = self
                .client
                .get(self.url(&format!("/files/v2/media/system/{}{}", system, path)))
                .bearer_auth(&self.token)
                .send();
            match outcome {
                Ok(response) if response.status().is_success() => {
                    let bytes = response.bytes()?;
                    std::fs::write(local, &bytes)?;
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    let transient = status.is_server_error()
                        || status == StatusCode::TOO_MANY_REQUESTS;
                    if !transient || attempt >= self.retries {
                        return Err(EngineError::RemoteApi {
                            status: status.as_u16(),
                            message: response.text().unwrap_or_default(),
                        });
                    }
                }
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(EngineError::Http(err));
                    }
                }
            }
            thread::sleep(delay);
            delay = delay.saturating_mul(2);
            attempt += 1;
        }
    }

    // --- apps ---

    /// Register or update a remote app definition; returns the app id.
    pub fn apps_add_update(&self, definition: &Value) -> Result<String> {
        let result =
            self.send_with_retry(|| self.client.post(self.url("/apps/v2")).json(definition))?;
        result
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::Backend("remote app registration returned no id".to_string()))
    }

    pub fn apps_publish(&self, app_id: &str) -> Result<()> {
        let body = json!({ "action": "publish" });
        self.send_with_retry(|| {
            self.client
                .put(self.url(&format!("/apps/v2/{}", app_id)))
                .json(&body)
        })?;
        Ok(())
    }
}

/// Map a remote job state string to the engine's map-item status.
pub fn remote_state_to_status(state: &str) -> MapItemStatus {
    match state {
        "PENDING" | "PROCESSING_INPUTS" | "STAGING_INPUTS" | "STAGED" | "STAGING_JOB"
        | "SUBMITTING" | "QUEUED" => MapItemStatus::Pending,
        "RUNNING" | "CLEANING_UP" | "ARCHIVING" => MapItemStatus::Running,
        "FINISHED" | "ARCHIVING_FINISHED" => MapItemStatus::Finished,
        "FAILED" | "STOPPED" | "KILLED" | "ARCHIVING_FAILED" => MapItemStatus::Failed,
        _ => MapItemStatus::Unknown,
    }
}
