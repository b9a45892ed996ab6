use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::SourceError;
use crate::formats::{SourceItem, SourcePage};

/// Half-open time window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// A forward-only, non-restartable paginated reader.
///
/// Implementations are not internally synchronized; share one behind a mutex.
#[async_trait]
pub trait SourcePager: Send {
    type Item: Send + 'static;

    /// Returns `Ok(None)` once the feed is exhausted.
    async fn next_page(&mut self) -> Result<Option<Vec<Self::Item>>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct AnnotationSourceClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl AnnotationSourceClient {
    pub fn new(base_url: Url, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build annotation source http client")?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    pub fn changed_items(&self, window: SyncWindow, page_size: usize) -> ChangedItemsPager {
        ChangedItemsPager {
            client: self.clone(),
            window,
            page_size,
            page: 0,
            exhausted: false,
        }
    }

    pub fn deleted_ids(&self, window: SyncWindow, page_size: usize) -> DeletedIdsPager {
        DeletedIdsPager {
            client: self.clone(),
            window,
            page_size,
            page: 0,
            exhausted: false,
        }
    }

    pub async fn fetch_changed(
        &self,
        window: SyncWindow,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<SourceItem>, SourceError> {
        let items = self
            .fetch_page::<serde_json::Value>("annotations/changed", window, page, page_size)
            .await?;
        Ok(items.into_iter().map(SourceItem::decode).collect())
    }

    pub async fn fetch_deleted(
        &self,
        window: SyncWindow,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<String>, SourceError> {
        self.fetch_page("annotations/deleted", window, page, page_size)
            .await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.as_str().trim_end_matches('/'))
    }

    async fn fetch_page<T: DeserializeOwned>(
        &self,
        path: &str,
        window: SyncWindow,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<T>, SourceError> {
        let url = self.endpoint(path);
        let mut query = vec![
            ("page", page.to_string()),
            ("pageSize", page_size.to_string()),
            ("from", window.from.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ("to", window.to.to_rfc3339_opts(SecondsFormat::Millis, true)),
        ];
        if let Some(api_key) = &self.api_key {
            query.push(("apikey", api_key.clone()));
        }

        let response = self
            .client
            .get(&url)
            .header(USER_AGENT, concat!("annosync/", env!("CARGO_PKG_VERSION")))
            .header(ACCEPT, "application/json")
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        let raw = response.text().await?;
        if !status.is_success() {
            return Err(SourceError::Status { status, url, body: raw });
        }

        let page: SourcePage<T> = serde_json::from_str(&raw).map_err(|err| SourceError::Decode {
            url,
            message: err.to_string(),
        })?;
        Ok(page.items)
    }
}

/// Pages through annotations created or modified inside the window.
#[derive(Debug)]
pub struct ChangedItemsPager {
    client: AnnotationSourceClient,
    window: SyncWindow,
    page_size: usize,
    page: u32,
    exhausted: bool,
}

#[async_trait]
impl SourcePager for ChangedItemsPager {
    type Item = SourceItem;

    async fn next_page(&mut self) -> Result<Option<Vec<SourceItem>>, SourceError> {
        if self.exhausted {
            return Ok(None);
        }
        let items = self
            .client
            .fetch_changed(self.window, self.page, self.page_size)
            .await?;
        // The counter only moves after a successful fetch so a retry asks
        // for the same page again.
        self.page += 1;
        if items.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        Ok(Some(items))
    }
}

/// Pages through ids of annotations deleted inside the window.
#[derive(Debug)]
pub struct DeletedIdsPager {
    client: AnnotationSourceClient,
    window: SyncWindow,
    page_size: usize,
    page: u32,
    exhausted: bool,
}

#[async_trait]
impl SourcePager for DeletedIdsPager {
    type Item = String;

    async fn next_page(&mut self) -> Result<Option<Vec<String>>, SourceError> {
        if self.exhausted {
            return Ok(None);
        }
        let ids = self
            .client
            .fetch_deleted(self.window, self.page, self.page_size)
            .await?;
        self.page += 1;
        if ids.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        Ok(Some(ids))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;

    fn spawn_source_server(
        fail_first_deleted: bool,
    ) -> (String, mpsc::Receiver<String>, mpsc::Sender<()>, thread::JoinHandle<()>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
        let base_url = format!("http://{}", server.server_addr());
        let (seen_tx, seen_rx) = mpsc::channel::<String>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            let mut deleted_calls = 0;
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let url = request.url().to_string();
                let _ = seen_tx.send(url.clone());
                let path = url.split('?').next().unwrap_or(&url);
                let page0 = url.contains("page=0&");
                let (status, body) = match path {
                    "/annotations/changed" if page0 => (
                        200,
                        r#"{"items":[
                            {"id":"a1","motivation":"subtitling",
                             "target":{"scope":"http://data.europeana.eu/item/1/a","source":"https://m/1.mp4"},
                             "body":{"value":"WEBVTT\n","format":"text/vtt","language":"en"}},
                            {"id":"a2","motivation":"subtitling",
                             "target":{"scope":"http://data.europeana.eu/item/1/b","source":"https://m/2.mp4"},
                             "body":{"value":"WEBVTT\n","format":"text/vtt","language":"de","edmRights":"r"},
                             "creator":{"name":"someone"},"created":"2024-01-01T00:00:00Z"}
                        ]}"#
                        .to_owned(),
                    ),
                    "/annotations/changed" => (200, r#"{"items":[]}"#.to_owned()),
                    "/annotations/deleted" => {
                        deleted_calls += 1;
                        if fail_first_deleted && deleted_calls == 1 {
                            (503, "busy".to_owned())
                        } else if page0 {
                            (200, r#"{"items":["d1"]}"#.to_owned())
                        } else {
                            (200, r#"{"items":[]}"#.to_owned())
                        }
                    }
                    _ => (404, "not found".to_owned()),
                };
                let _ = request
                    .respond(tiny_http::Response::from_string(body).with_status_code(status));
            }
        });

        (base_url, seen_rx, shutdown_tx, handle)
    }

    fn window() -> SyncWindow {
        SyncWindow {
            from: DateTime::UNIX_EPOCH,
            to: DateTime::UNIX_EPOCH + chrono::Duration::days(1),
        }
    }

    #[tokio::test]
    async fn changed_pager_yields_items_then_terminates() -> anyhow::Result<()> {
        let (base_url, seen_rx, shutdown_tx, handle) = spawn_source_server(false);
        let client = AnnotationSourceClient::new(
            Url::parse(&base_url)?,
            Some("secret".to_owned()),
            Duration::from_secs(5),
        )?;

        let mut pager = client.changed_items(window(), 2);
        let first = pager.next_page().await?.unwrap_or_default();
        assert_eq!(first.len(), 2);
        assert!(matches!(&first[1], SourceItem::Decoded(item) if item.body.rights.as_deref() == Some("r")));
        assert!(pager.next_page().await?.is_none());
        assert!(pager.next_page().await?.is_none());

        let urls = seen_rx.try_iter().collect::<Vec<_>>();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].contains("pageSize=2"));
        assert!(urls[0].contains("apikey=secret"));
        assert!(urls[0].contains("from=1970-01-01T00%3A00%3A00.000Z"));
        assert!(urls[1].contains("page=1&"));

        let _ = shutdown_tx.send(());
        let _ = handle.join();
        Ok(())
    }

    #[tokio::test]
    async fn failed_fetch_does_not_advance_page() -> anyhow::Result<()> {
        let (base_url, seen_rx, shutdown_tx, handle) = spawn_source_server(true);
        let client = AnnotationSourceClient::new(Url::parse(&base_url)?, None, Duration::from_secs(5))?;

        let mut pager = client.deleted_ids(window(), 10);
        let err = pager.next_page().await.unwrap_err();
        assert!(matches!(err, SourceError::Status { .. }));
        assert_eq!(pager.next_page().await?, Some(vec!["d1".to_owned()]));
        assert!(pager.next_page().await?.is_none());

        let urls = seen_rx.try_iter().collect::<Vec<_>>();
        assert!(urls[0].contains("page=0&"));
        assert!(urls[1].contains("page=0&"));
        assert!(!urls[0].contains("apikey"));

        let _ = shutdown_tx.send(());
        let _ = handle.join();
        Ok(())
    }
}
