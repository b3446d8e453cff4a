//! Multipart uploads for file attachments and voice clips.
//!
//! Both endpoints take a single multipart field and the anti-forgery token in
//! `X-CSRFToken`. Uploads run on their own task; the caller gets a
//! [`PendingUpload`] it may await or simply drop.

use std::path::Path;
use std::time::Duration;

use reqwest::header::{COOKIE, ORIGIN, REFERER};
use reqwest::multipart::{Form, Part};
use reqwest::Url;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ChatError;
use crate::transport::{cookie_header, Endpoints};
use crate::voice::VoiceClip;

/// Header carrying the anti-forgery token.
pub const CSRF_HEADER: &str = "X-CSRFToken";
/// Multipart field for file attachments.
pub const FILE_FIELD: &str = "file";
/// Multipart field for voice clips.
pub const VOICE_FIELD: &str = "audio";

/// A file read into memory, ready to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub async fn from_path(path: &Path) -> Result<Self, ChatError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ChatError::io(path, e))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self { file_name, bytes })
    }
}

/// Outcome of a successful (2xx) upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub status: u16,
    pub url: String,
}

/// HTTP side of the session: posts attachments and voice clips.
#[derive(Debug, Clone)]
pub struct Uploader {
    client: reqwest::Client,
    endpoints: Endpoints,
    session_id: Option<String>,
}

impl Uploader {
    pub fn new(endpoints: Endpoints, session_id: Option<String>) -> Self {
        // Falls back to a default client instead of panicking.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoints,
            session_id,
        }
    }


    /// POST `attachment` to `/upload-file/<room>/` as field `file`.
    pub async fn upload_file(
        &self,
        room_id: &str,
        csrf_token: &str,
        attachment: Attachment,
    ) -> Result<UploadReceipt, ChatError> {
        let url = self.endpoints.upload_file(room_id)?;
        let part = Part::bytes(attachment.bytes).file_name(attachment.file_name);
        self.post_part(url, FILE_FIELD, part, csrf_token).await
    }

    /// POST `clip` to `/upload-voice/<room>/` as field `audio`.
    pub async fn upload_voice(
        &self,
        room_id: &str,
        csrf_token: &str,
        clip: VoiceClip,
    ) -> Result<UploadReceipt, ChatError> {
        let url = self.endpoints.upload_voice(room_id)?;
        let file_name = clip.file_name();
        let part = Part::bytes(clip.data)
            .file_name(file_name)
            .mime_str(clip.mime)?;
        self.post_part(url, VOICE_FIELD, part, csrf_token).await
    }

    async fn post_part(
        &self,
        url: Url,
        field: &'static str,
        part: Part,
        csrf_token: &str,
    ) -> Result<UploadReceipt, ChatError> {
        let origin = self.endpoints.origin();
        let mut request = self
            .client
            .post(url.clone())
            .header(CSRF_HEADER, csrf_token)
            .header(ORIGIN, origin.as_str())
            .header(REFERER, format!("{origin}/"))
            .multipart(Form::new().part(field, part));
        if let Some(cookie) = cookie_header(csrf_token, self.session_id.as_deref()) {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(UploadReceipt {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

/// An upload running on its own task.
///
/// Dropping it detaches the task: the upload still completes but nobody looks
/// at the result. [`PendingUpload::wait`] makes the outcome observable.
#[derive(Debug)]
pub struct PendingUpload {
    handle: JoinHandle<Result<UploadReceipt, ChatError>>,
}

impl PendingUpload {
    /// Spawn `upload` and log its failure at debug level.
    pub fn spawn<F>(what: &'static str, upload: F) -> Self
    where
        F: std::future::Future<Output = Result<UploadReceipt, ChatError>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let result = upload.await;
            match &result {
                Ok(receipt) => debug!(kind = what, status = receipt.status, url = %receipt.url, "upload finished"),
                Err(e) => debug!(kind = what, error = %e, "upload failed"),
            }
            result
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the upload to finish.
    pub async fn wait(self) -> Result<UploadReceipt, ChatError> {
        self.handle.await.map_err(|_| ChatError::TaskAborted)?
    }
}
