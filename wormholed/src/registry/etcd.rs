//! etcd v2 keys API over HTTP.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;
use super::{Registry, RegistryError, RegistryNode, WatchHandle};

/// Header carrying the etcd index current at the time of an answer
const ETCD_INDEX_HEADER: &str = "x-etcd-index";

/// A raw keys API answer
struct KeysAnswer {
    status: StatusCode,
    /// `X-Etcd-Index`, when present
    index: Option<u64>,
    body: String,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: Option<RegistryNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: u64,
    message: String,
    #[serde(default)]
    cause: String,
}

/// Endpoints shared between the registry and the watch handles it opens.
struct Endpoints {
    urls: Vec<Url>,
    /// Index of the endpoint that last answered
    active: AtomicUsize,
}

/// etcd client speaking the v2 keys API, with failover across endpoints
#[derive(Clone)]
pub struct EtcdRegistry {
    client: reqwest::Client,
    endpoints: Arc<Endpoints>,
    /// etcd index seen by the latest successful read; 0 before the first one
    read_index: Arc<AtomicU64>,
    request_timeout: Duration,
}

impl EtcdRegistry {
    /// Create a client for the given endpoint base URLs, e.g. `http://127.0.0.1:2379`.
    /// `request_timeout` applies to reads; watches only end when the server answers.
    pub fn new(endpoints: &[String], request_timeout: Duration) -> Result<Self, RegistryError> {
        if endpoints.is_empty() {
            return Err(RegistryError::InvalidEndpoint("no endpoints given".to_string()));
        }

        let urls = endpoints
            .iter()
            .map(|e| {
                let url = Url::parse(e).map_err(|err| RegistryError::InvalidEndpoint(format!("{}: {}", e, err)))?;
                match url.scheme() {
                    "http" | "https" => Ok(url),
                    other => Err(RegistryError::InvalidEndpoint(format!("{}: unsupported scheme '{}'", e, other))),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            client: reqwest::Client::new(),
            endpoints: Arc::new(Endpoints {
                urls,
                active: AtomicUsize::new(0),
            }),
            read_index: Arc::new(AtomicU64::new(0)),
            request_timeout,
        })
    }

    /// Issue a GET against `/v2/keys{key}` on each endpoint in turn, starting with the
    /// last one that answered. Only connection-level failures move on to the next endpoint.
    async fn get_keys(
        client: &reqwest::Client,
        endpoints: &Endpoints,
        key: &str,
        query: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> Result<KeysAnswer, RegistryError> {
        let count = endpoints.urls.len();
        let start = endpoints.active.load(Ordering::Relaxed) % count;
        let mut last_err = None;

        for offset in 0..count {
            let idx = (start + offset) % count;
            let url = keys_url(&endpoints.urls[idx], key);

            let mut request = client.get(&url).query(query);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            let result = async {
                let response = request.send().await?;
                let status = response.status();
                let index = etcd_index(response.headers());
                let body = response.text().await?;
                Ok::<_, reqwest::Error>(KeysAnswer { status, index, body })
            }
            .await;

            match result {
                Ok(answer) => {
                    endpoints.active.store(idx, Ordering::Relaxed);
                    return Ok(answer);
                }
                Err(e) if e.is_connect() && offset + 1 < count => {
                    warn!("etcd endpoint {} unreachable: {}", endpoints.urls[idx], e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_err.map(RegistryError::from).unwrap_or(RegistryError::Closed))
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    type Watch = EtcdWatch;

    fn watch(&self, key: &str) -> EtcdWatch {
        EtcdWatch {
            client: self.client.clone(),
            endpoints: self.endpoints.clone(),
            read_index: self.read_index.clone(),
            key: key.to_string(),
            wait_index: None,
        }
    }

    async fn read_tree(&self, key: &str) -> Result<Option<RegistryNode>, RegistryError> {
        let query = [("recursive", "true".to_string()), ("sorted", "false".to_string())];
        let answer =
            Self::get_keys(&self.client, &self.endpoints, key, &query, Some(self.request_timeout)).await?;

        let node = match decode_response(answer.status, &answer.body) {
            Ok(resp) => resp.and_then(|r| r.node),
            Err(e) if e.is_key_not_found() => None,
            Err(e) => return Err(e),
        };
        if let Some(index) = answer.index {
            self.read_index.fetch_max(index, Ordering::Relaxed);
        }
        Ok(node)
    }
}

/// A recursive etcd wait. The cursor advances past every event it has seen so
/// that no change between two calls is lost. A fresh handle starts right after
/// the latest read made through the same registry.
pub struct EtcdWatch {
    client: reqwest::Client,
    endpoints: Arc<Endpoints>,
    read_index: Arc<AtomicU64>,
    key: String,
    wait_index: Option<u64>,
}

impl EtcdWatch {
    /// Index the next wait will start from, if any is known yet.
    pub fn wait_index(&self) -> Option<u64> {
        self.wait_index.or_else(|| match self.read_index.load(Ordering::Relaxed) {
            0 => None,
            index => Some(index + 1),
        })
    }
}

#[async_trait]
impl WatchHandle for EtcdWatch {
    async fn next(&mut self) -> Result<(), RegistryError> {
        let mut query = vec![("wait", "true".to_string()), ("recursive", "true".to_string())];
        self.wait_index = self.wait_index();
        if let Some(index) = self.wait_index {
            query.push(("waitIndex", index.to_string()));
        }

        let answer = EtcdRegistry::get_keys(&self.client, &self.endpoints, &self.key, &query, None).await?;

        match decode_response(answer.status, &answer.body)? {
            Some(KeysResponse { node: Some(node), .. }) => {
                debug!(key = %node.key, index = node.modified_index, "etcd change observed");
                self.wait_index = Some(node.modified_index + 1);
            }
            // Server closed the long poll without an event
            _ => debug!(key = %self.key, "etcd watch returned without event"),
        }
        Ok(())
    }
}

fn etcd_index(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(ETCD_INDEX_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn keys_url(endpoint: &Url, key: &str) -> String {
    let base = endpoint.as_str().trim_end_matches('/');
    let key = key.trim_start_matches('/');
    format!("{}/v2/keys/{}", base, key)
}

/// Decode a keys API answer. An empty successful body yields `Ok(None)`.
fn decode_response(status: StatusCode, body: &str) -> Result<Option<KeysResponse>, RegistryError> {
    if !status.is_success() {
        return match serde_json::from_str::<ErrorBody>(body) {
            Ok(err) => Err(RegistryError::Etcd {
                code: err.error_code,
                message: err.message,
                cause: err.cause,
            }),
            Err(_) => Err(RegistryError::Decode(format!("unexpected status {}: {}", status, body.trim()))),
        };
    }

    if body.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(body)
        .map(Some)
        .map_err(|e| RegistryError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_url() {
        let endpoint = Url::parse("http://127.0.0.1:2379").unwrap();
        assert_eq!(keys_url(&endpoint, "/pulcy/wormhole"), "http://127.0.0.1:2379/v2/keys/pulcy/wormhole");
        assert_eq!(keys_url(&endpoint, "/"), "http://127.0.0.1:2379/v2/keys/");

        let endpoint = Url::parse("https://etcd.local:4001/").unwrap();
        assert_eq!(keys_url(&endpoint, "services"), "https://etcd.local:4001/v2/keys/services");
    }

    #[test]
    fn test_new_rejects_bad_endpoints() {
        let timeout = Duration::from_secs(1);
        assert!(EtcdRegistry::new(&[], timeout).is_err());
        assert!(EtcdRegistry::new(&["not a url".to_string()], timeout).is_err());
        assert!(EtcdRegistry::new(&["unix:///tmp/etcd".to_string()], timeout).is_err());
        assert!(EtcdRegistry::new(&["http://127.0.0.1:2379".to_string()], timeout).is_ok());
    }

    #[test]
    fn test_decode_get_response() {
        let body = r#"{"action":"get","node":{"key":"/services","dir":true,"nodes":[
            {"key":"/services/h:web:80","value":"10.0.0.1:8080","modifiedIndex":9,"createdIndex":9}
        ],"modifiedIndex":2,"createdIndex":2}}"#;
        let resp = decode_response(StatusCode::OK, body).unwrap().unwrap();
        let node = resp.node.unwrap();
        assert_eq!(node.key, "/services");
        assert_eq!(node.nodes.len(), 1);
    }

    #[test]
    fn test_decode_key_not_found() {
        let body = r#"{"errorCode":100,"message":"Key not found","cause":"/services","index":12}"#;
        let err = decode_response(StatusCode::NOT_FOUND, body).unwrap_err();
        assert!(err.is_key_not_found());
    }

    #[test]
    fn test_decode_index_cleared() {
        let body = r#"{"errorCode":401,"message":"The event in requested index is outdated and cleared","cause":"the requested history has been cleared [1008/4]","index":2007}"#;
        let err = decode_response(StatusCode::BAD_REQUEST, body).unwrap_err();
        assert!(matches!(err, RegistryError::Etcd { code: 401, .. }));
        assert!(!err.is_key_not_found());
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode_response(StatusCode::INTERNAL_SERVER_ERROR, "oops").unwrap_err();
        assert!(matches!(err, RegistryError::Decode(_)));

        let err = decode_response(StatusCode::OK, "{not json").unwrap_err();
        assert!(matches!(err, RegistryError::Decode(_)));
    }

    #[test]
    fn test_decode_empty_body() {
        assert!(decode_response(StatusCode::OK, "\n").unwrap().is_none());
    }

    #[test]
    fn test_etcd_index_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(etcd_index(&headers), None);

        headers.insert(ETCD_INDEX_HEADER, "1042".parse().unwrap());
        assert_eq!(etcd_index(&headers), Some(1042));

        headers.insert(ETCD_INDEX_HEADER, "soon".parse().unwrap());
        assert_eq!(etcd_index(&headers), None);
    }

    #[test]
    fn test_fresh_watch_resumes_after_last_read() {
        let registry = EtcdRegistry::new(&["http://127.0.0.1:2379".to_string()], Duration::from_secs(1)).unwrap();
        let early = registry.watch("/services");
        assert_eq!(early.wait_index(), None, "Nothing read yet");

        // A read answered at index 41 with an empty subtree
        let body = r#"{"errorCode":100,"message":"Key not found","cause":"/services","index":41}"#;
        assert!(decode_response(StatusCode::NOT_FOUND, body).unwrap_err().is_key_not_found());
        let mut headers = HeaderMap::new();
        headers.insert(ETCD_INDEX_HEADER, "41".parse().unwrap());
        registry.read_index.fetch_max(etcd_index(&headers).unwrap(), Ordering::Relaxed);

        assert_eq!(early.wait_index(), Some(42), "Handle opened before the read starts after it");
        assert_eq!(registry.watch("/services").wait_index(), Some(42));

        // An older answer from a lagging endpoint never moves the cursor back
        registry.read_index.fetch_max(30, Ordering::Relaxed);
        assert_eq!(registry.watch("/services").wait_index(), Some(42));
    }

    #[test]
    fn test_event_cursor_wins_over_read_index() {
        let registry = EtcdRegistry::new(&["http://127.0.0.1:2379".to_string()], Duration::from_secs(1)).unwrap();
        registry.read_index.store(41, Ordering::Relaxed);

        let mut watch = registry.watch("/services");
        watch.wait_index = Some(57);
        assert_eq!(watch.wait_index(), Some(57));
    }
}
