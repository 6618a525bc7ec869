use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// The flavor of media manager behind an instance. Both speak the same v3
/// API for the operations the bridge uses.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArrKind {
    #[serde(alias = "Sonarr")]
    Sonarr,
    #[serde(alias = "Radarr")]
    Radarr,
}

impl std::fmt::Display for ArrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArrKind::Sonarr => f.write_str("sonarr"),
            ArrKind::Radarr => f.write_str("radarr"),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum HistoryEventType {
    Unknown,
    Grabbed,
    SeriesFolderImported,
    MovieFolderImported,
    DownloadFolderImported,
    DownloadFailed,
    EpisodeFileDeleted,
    MovieFileDeleted,
    EpisodeFileRenamed,
    MovieFileRenamed,
    DownloadIgnored,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryData {
    #[serde(default)]
    pub torrent_info_hash: Option<String>,
    #[serde(default)]
    pub release_type: Option<String>,
}

/// Only present on episode-based history records.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEpisode {
    pub id: u64,
    #[serde(default)]
    pub series_id: u64,
    #[serde(default)]
    pub season_number: u32,
    #[serde(default)]
    pub episode_number: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: u64,
    #[serde(default)]
    pub source_title: String,
    pub event_type: HistoryEventType,
    #[serde(default)]
    pub data: HistoryData,
    #[serde(default)]
    pub episode: Option<HistoryEpisode>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
    #[serde(default)]
    pub total_records: u64,
    #[serde(default)]
    pub records: Vec<HistoryRecord>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CommandResponse {
    pub id: u64,
    pub name: String,
}

#[async_trait]
pub trait ArrApi: Send + Sync {
    /// Asks the media app to look at its download client for finished items.
    async fn refresh_monitored_downloads(&self) -> Result<CommandResponse>;
    async fn get_history(&self, page_size: u32) -> Result<HistoryResponse>;
    async fn fail_history_item(&self, id: u64) -> Result<()>;
}

pub struct ArrClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    kind: ArrKind,
}

impl ArrClient {
    pub fn new(kind: ArrKind, base_url: Url, api_key: String) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url,
            api_key,
            kind,
        })
    }

    pub fn kind(&self) -> ArrKind {
        self.kind
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .expect("the base URL is validated to be http(s) at startup")
            .pop_if_empty()
            .extend(["api", "v3"])
            .extend(segments);
        url
    }

    async fn check(r: reqwest::Response) -> Result<reqwest::Response> {
        if r.status().is_success() {
            return Ok(r);
        }
        let status = r.status();
        let url = r.url().to_string();
        let body = r.text().await.unwrap_or_default();
        Err(Error::UpstreamStatus { url, status, body })
    }
}

fn retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default().with_max_times(2)
}

#[async_trait]
impl ArrApi for ArrClient {
    async fn refresh_monitored_downloads(&self) -> Result<CommandResponse> {
        let url = self.endpoint(&["command"]);
        debug!(kind = %self.kind, "requesting RefreshMonitoredDownloads");
        (|| async {
            let response = self
                .client
                .post(url.clone())
                .header("X-Api-Key", &self.api_key)
                .json(&serde_json::json!({"name": "RefreshMonitoredDownloads"}))
                .send()
                .await?;
            let response = Self::check(response).await?;
            Ok(response.json().await?)
        })
        .retry(retry_policy())
        .when(Error::is_transient)
        .await
    }

    async fn get_history(&self, page_size: u32) -> Result<HistoryResponse> {
        let url = self.endpoint(&["history"]);
        (|| async {
            let response = self
                .client
                .get(url.clone())
                .header("X-Api-Key", &self.api_key)
                .query(&[("pageSize", page_size)])
                .send()
                .await?;
            let response = Self::check(response).await?;
            Ok(response.json().await?)
        })
        .retry(retry_policy())
        .when(Error::is_transient)
        .await
    }

    async fn fail_history_item(&self, id: u64) -> Result<()> {
        let url = self.endpoint(&["history", "failed", &id.to_string()]);
        (|| async {
            let response = self
                .client
                .post(url.clone())
                .header("X-Api-Key", &self.api_key)
                .send()
                .await?;
            Self::check(response).await.map(|_| ())
        })
        .retry(retry_policy())
        .when(Error::is_transient)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_record_parses_sonarr_payload() {
        let payload = r#"{
            "page": 1,
            "pageSize": 50,
            "totalRecords": 2,
            "records": [
                {
                    "id": 7,
                    "sourceTitle": "Alpha S01E01",
                    "eventType": "grabbed",
                    "data": {
                        "torrentInfoHash": "150947B245DA89629349290C2812ECDB6D0308C7",
                        "releaseType": "SingleEpisode"
                    },
                    "episode": {
                        "id": 12,
                        "seriesId": 3,
                        "seasonNumber": 1,
                        "episodeNumber": 1
                    }
                },
                {
                    "id": 8,
                    "sourceTitle": "Alpha S01E01",
                    "eventType": "downloadFolderImported",
                    "data": {}
                }
            ]
        }"#;
        let parsed: HistoryResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].event_type, HistoryEventType::Grabbed);
        assert_eq!(
            parsed.records[0].data.torrent_info_hash.as_deref(),
            Some("150947B245DA89629349290C2812ECDB6D0308C7")
        );
        assert_eq!(parsed.records[0].episode.as_ref().unwrap().season_number, 1);
        assert_eq!(
            parsed.records[1].event_type,
            HistoryEventType::DownloadFolderImported
        );
    }

    #[test]
    fn test_unknown_event_types_do_not_break_parsing() {
        let payload = r#"{"id": 1, "eventType": "somethingBrandNew"}"#;
        let parsed: HistoryRecord = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed.event_type, HistoryEventType::Other);
    }

    #[test]
    fn test_kind_parses_from_yaml() {
        let kind: ArrKind = serde_yaml::from_str("sonarr").unwrap();
        assert_eq!(kind, ArrKind::Sonarr);
        let kind: ArrKind = serde_yaml::from_str("Radarr").unwrap();
        assert_eq!(kind, ArrKind::Radarr);
    }
}
