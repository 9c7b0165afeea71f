//! WebDAV remote sync.
//!
//! Remote sync is optional: an empty URL in [`WebdavSettings`] means no
//! client is built and every remote operation reports [`RemoteOutcome::NoRemote`].
//! Uploads retry a fixed number of times with a fixed delay; a failed sync
//! never touches the local copy. Only trigger-created archives reach the
//! remote tier, so remote names are plain ASCII and need no extra encoding.

use crate::config::WebdavSettings;
use crate::error::{Result, VaultError};
use reqwest::{Client, Method, StatusCode};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Total attempts per upload (first try plus two retries).
pub const UPLOAD_ATTEMPTS: u32 = 3;

/// Fixed pause between attempts; deliberately not exponential.
const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Trigger-level result of a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Completed on the remote.
    Done,
    /// No remote target configured; nothing was attempted.
    NoRemote,
    /// All attempts failed. The local tier is unaffected.
    Failed,
}

impl RemoteOutcome {
    /// Remote retention only makes sense after a completed sync.
    pub fn reached_remote(&self) -> bool {
        matches!(self, RemoteOutcome::Done)
    }
}

pub struct WebdavClient {
    http: Client,
    base_url: String,
    remote_dir: String,
    username: String,
    password: String,
}

impl WebdavClient {
    /// Builds a client when a remote target is configured. An empty URL
    /// disables sync without error.
    pub fn from_settings(settings: &WebdavSettings) -> Result<Option<WebdavClient>> {
        let url = settings.url.trim();
        if url.is_empty() {
            return Ok(None);
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()?;

        Ok(Some(WebdavClient {
            http,
            base_url: url.trim_end_matches('/').to_string(),
            remote_dir: settings.remote_dir.trim_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        }))
    }

    fn dir_url(&self) -> String {
        format!("{}/{}", self.base_url, self.remote_dir)
    }

    fn file_url(&self, remote_name: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.remote_dir, remote_name)
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        if !self.username.is_empty() {
            req = req.basic_auth(&self.username, Some(&self.password));
        }
        req
    }

    fn webdav_method(name: &'static str) -> Result<Method> {
        Method::from_bytes(name.as_bytes())
            .map_err(|e| VaultError::Remote(format!("invalid WebDAV method {name}: {e}")))
    }

    /// Create-if-missing for the remote backup directory. A 405 means the
    /// collection already exists, which counts as success.
    async fn ensure_remote_dir(&self) -> Result<()> {
        let resp = self
            .request(Self::webdav_method("MKCOL")?, &self.dir_url())
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            s => Err(VaultError::Remote(format!(
                "MKCOL {} returned {}",
                self.dir_url(),
                s
            ))),
        }
    }

    async fn put_file(&self, local_path: &Path, url: &str) -> Result<()> {
        let bytes = tokio::fs::read(local_path).await?;
        let resp = self
            .request(Method::PUT, url)
            .header("Content-Type", "application/zip")
            .body(bytes)
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(VaultError::Remote(format!(
                "PUT {} returned {}",
                url,
                resp.status()
            )))
        }
    }

    /// Uploads an archive, retrying with a fixed delay. Each attempt re-runs
    /// the idempotent directory creation so a briefly unreachable server is
    /// retried as a whole.
    pub async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<()> {
        let url = self.file_url(remote_name);
        let mut last_err = None;

        for attempt in 1..=UPLOAD_ATTEMPTS {
            let result = async {
                self.ensure_remote_dir().await?;
                self.put_file(local_path, &url).await
            }
            .await;

            match result {
                Ok(()) => {
                    info!(archive = %remote_name, attempt, "archive uploaded to WebDAV remote");
                    return Ok(());
                }
                Err(e) => {
                    warn!(archive = %remote_name, attempt, error = %e, "WebDAV upload attempt failed");
                    last_err = Some(e);
                    if attempt < UPLOAD_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| VaultError::Remote("upload failed".into())))
    }

    /// Deletes a remote archive. A 404 is treated as already deleted.
    pub async fn delete(&self, remote_name: &str) -> Result<()> {
        let url = self.file_url(remote_name);
        let resp = self.request(Method::DELETE, &url).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            s => Err(VaultError::Remote(format!("DELETE {} returned {}", url, s))),
        }
    }

    /// Lists archive names in the remote backup directory via a Depth-1
    /// PROPFIND. A missing collection lists as empty.
    pub async fn list(&self) -> Result<Vec<String>> {
        let resp = self
            .request(Self::webdav_method("PROPFIND")?, &self.dir_url())
            .header("Depth", "1")
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(VaultError::Remote(format!(
                "PROPFIND {} returned {}",
                self.dir_url(),
                resp.status()
            )));
        }

        let body = resp.text().await?;
        let names: Vec<String> = extract_hrefs(&body)
            .into_iter()
            .filter_map(|href| archive_name_from_href(&href))
            .collect();
        debug!(remote_dir = %self.remote_dir, count = names.len(), "listed remote archives");
        Ok(names)
    }
}

/// Pulls the text of every `href` element out of a multistatus body without
/// caring which namespace prefix the server chose.
fn extract_hrefs(body: &str) -> Vec<String> {
    let mut hrefs = Vec::new();
    let mut rest = body;

    loop {
        let Some(lt) = rest.find('<') else { break };
        let after = &rest[lt + 1..];
        let Some(gt) = after.find('>') else { break };
        let tag = after[..gt].trim();

        // Inline attributes (an xmlns declaration, typically) are not part
        // of the element name.
        let tag_name = tag.split_whitespace().next().unwrap_or(tag);
        let local = tag_name.rsplit(':').next().unwrap_or(tag_name);
        if !tag_name.starts_with('/') && local.eq_ignore_ascii_case("href") {
            let content = &after[gt + 1..];
            let Some(end) = content.find('<') else { break };
            let href = content[..end].trim();
            if !href.is_empty() {
                hrefs.push(href.to_string());
            }
            rest = &content[end..];
        } else {
            rest = &after[gt + 1..];
        }
    }

    hrefs
}

/// Last path segment of an href when it names an archive; the collection
/// href itself and non-zip files map to `None`.
fn archive_name_from_href(href: &str) -> Option<String> {
    let trimmed = href.trim_end_matches('/');
    let name = trimmed.rsplit('/').next()?;
    if name.ends_with(".zip") {
        Some(name.to_string())
    } else {
        None
    }
}

/// Pushes a freshly built archive when a remote is configured.
pub async fn push_archive(
    client: Option<&WebdavClient>,
    local_path: &Path,
    remote_name: &str,
) -> RemoteOutcome {
    let Some(client) = client else {
        return RemoteOutcome::NoRemote;
    };
    match client.upload(local_path, remote_name).await {
        Ok(()) => RemoteOutcome::Done,
        Err(e) => {
            warn!(archive = %remote_name, error = %e, "remote sync failed, local archive retained");
            RemoteOutcome::Failed
        }
    }
}
