use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// Remote torrent status as reported by the debrid service.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DebridStatus {
    Downloaded,
    MagnetError,
    MagnetConversion,
    WaitingFilesSelection,
    Queued,
    Downloading,
    Error,
    Virus,
    Compressing,
    Uploading,
    Dead,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AddedTorrent {
    pub id: String,
    #[serde(default)]
    pub uri: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TorrentInfo {
    pub filename: String,
    #[serde(default)]
    pub original_filename: String,
    pub status: DebridStatus,
}

/// Which files of a torrent to start on the remote.
#[derive(Clone, Debug)]
pub enum FileSelection {
    All,
    Files(Vec<String>),
}

impl FileSelection {
    fn as_form_value(&self) -> String {
        match self {
            FileSelection::All => "all".to_owned(),
            FileSelection::Files(ids) => ids.join(","),
        }
    }
}

#[async_trait]
pub trait DebridApi: Send + Sync {
    async fn add_magnet(&self, magnet: &str) -> Result<AddedTorrent>;
    async fn add_torrent(&self, torrent: Vec<u8>) -> Result<AddedTorrent>;
    async fn select_files(&self, id: &str, selection: FileSelection) -> Result<()>;
    async fn get_info(&self, id: &str) -> Result<TorrentInfo>;
    async fn remove(&self, id: &str) -> Result<()>;
}

pub struct DebridClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

async fn check_response(r: reqwest::Response) -> Result<reqwest::Response> {
    if r.status().is_success() {
        return Ok(r);
    }
    let status = r.status();
    let url = r.url().to_string();
    let body = r.text().await.unwrap_or_default();
    Err(Error::UpstreamStatus { url, status, body })
}

async fn json_response<T: serde::de::DeserializeOwned>(r: reqwest::Response) -> Result<T> {
    let r = check_response(r).await?;
    Ok(r.json().await?)
}

fn retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default().with_max_times(2)
}

impl DebridClient {
    pub fn new(base_url: Url, api_key: String) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url,
            api_key,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .expect("the base URL is validated to be http(s) at startup")
            .pop_if_empty()
            .extend(segments);
        url
    }
}

#[async_trait]
impl DebridApi for DebridClient {
    async fn add_magnet(&self, magnet: &str) -> Result<AddedTorrent> {
        let url = self.endpoint(&["torrents", "addMagnet"]);
        debug!("adding magnet");
        (|| async {
            let form = reqwest::multipart::Form::new().text("magnet", magnet.to_owned());
            let response = self
                .client
                .post(url.clone())
                .bearer_auth(&self.api_key)
                .multipart(form)
                .send()
                .await?;
            json_response(response).await
        })
        .retry(retry_policy())
        .when(Error::is_transient)
        .await
    }

    async fn add_torrent(&self, torrent: Vec<u8>) -> Result<AddedTorrent> {
        let url = self.endpoint(&["torrents", "addTorrent"]);
        debug!(len = torrent.len(), "uploading torrent file");
        (|| async {
            let response = self
                .client
                .put(url.clone())
                .bearer_auth(&self.api_key)
                .body(torrent.clone())
                .send()
                .await?;
            json_response(response).await
        })
        .retry(retry_policy())
        .when(Error::is_transient)
        .await
    }

    async fn select_files(&self, id: &str, selection: FileSelection) -> Result<()> {
        let url = self.endpoint(&["torrents", "selectFiles", id]);
        (|| async {
            let response = self
                .client
                .post(url.clone())
                .bearer_auth(&self.api_key)
                .form(&[("files", selection.as_form_value())])
                .send()
                .await?;
            check_response(response).await.map(|_| ())
        })
        .retry(retry_policy())
        .when(Error::is_transient)
        .await
    }

    async fn get_info(&self, id: &str) -> Result<TorrentInfo> {
        let url = self.endpoint(&["torrents", "info", id]);
        (|| async {
            let response = self
                .client
                .get(url.clone())
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            json_response(response).await
        })
        .retry(retry_policy())
        .when(Error::is_transient)
        .await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let url = self.endpoint(&["torrents", "delete", id]);
        (|| async {
            let response = self
                .client
                .delete(url.clone())
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            // 204 on success; anything else is the service complaining.
            check_response(response).await.map(|_| ())
        })
        .retry(retry_policy())
        .when(Error::is_transient)
        .await
    }
}
