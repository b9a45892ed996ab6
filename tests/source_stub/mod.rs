#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

/// What the stub serves. Editable between runs through [`SourceStub::update`].
#[derive(Debug, Clone, Default)]
pub struct StubFeeds {
    pub changed: Vec<Value>,
    pub deleted: Vec<String>,
    /// Answer every request with 503.
    pub unavailable: bool,
}

pub struct SourceStub {
    pub base_url: String,
    feeds: Arc<Mutex<StubFeeds>>,
    requests: mpsc::Receiver<String>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SourceStub {
    pub fn spawn(feeds: StubFeeds) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start source stub server");
        let base_url = format!("http://{}/api", server.server_addr());
        let feeds = Arc::new(Mutex::new(feeds));
        let (requests_tx, requests) = mpsc::channel::<String>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let shared = Arc::clone(&feeds);
        let handle = thread::spawn(move || {
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
                let _ = requests_tx.send(url.clone());
                let feeds = shared.lock().expect("lock stub feeds").clone();
                let (status, body) = respond(&feeds, &url);

                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("build header");
                let response = tiny_http::Response::from_string(body)
                    .with_status_code(status)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            feeds,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn update(&self, edit: impl FnOnce(&mut StubFeeds)) {
        edit(&mut self.feeds.lock().expect("lock stub feeds"));
    }

    /// Request urls seen since the last call.
    pub fn drain_requests(&self) -> Vec<String> {
        self.requests.try_iter().collect()
    }
}

impl Drop for SourceStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn respond(feeds: &StubFeeds, url: &str) -> (u16, String) {
    if feeds.unavailable {
        return (503, "maintenance".to_owned());
    }
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let param = |name: &str| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == name)
            .and_then(|(_, value)| value.parse::<usize>().ok())
    };
    let page = param("page").unwrap_or(0);
    let page_size = param("pageSize").unwrap_or(100).max(1);

    let items = match path {
        "/api/annotations/changed" => paginate(&feeds.changed, page, page_size),
        "/api/annotations/deleted" => {
            let ids = feeds.deleted.iter().cloned().map(Value::String).collect::<Vec<_>>();
            paginate(&ids, page, page_size)
        }
        _ => return (404, "not found".to_owned()),
    };
    (200, json!({ "items": items }).to_string())
}

fn paginate(all: &[Value], page: usize, page_size: usize) -> Vec<Value> {
    all.iter()
        .skip(page * page_size)
        .take(page_size)
        .cloned()
        .collect()
}

pub fn subtitle_item(id: &str, local_id: &str, format: &str, payload: &str) -> Value {
    json!({
        "id": id,
        "motivation": "subtitling",
        "target": {
            "scope": format!("http://data.europeana.eu/item/2048/{local_id}"),
            "source": format!("https://media.example/{local_id}.mp4"),
        },
        "body": {
            "value": payload,
            "format": format,
            "language": "en",
            "edmRights": "http://creativecommons.org/licenses/by/4.0/",
        },
    })
}

pub fn vtt_item(id: &str, local_id: &str, text: &str) -> Value {
    subtitle_item(
        id,
        local_id,
        "text/vtt",
        &format!("WEBVTT\n\n00:00.000 --> 00:01.500\n{text}\n"),
    )
}
