//! Request and response value objects carried through the pipeline.
//!
//! A [`Request`] is owned by exactly one component at a time; every queue
//! handoff moves it. Its `tag` selects the handler that will process the
//! matching [`Response`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// A unit of fetch work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Target of the fetch.
    pub url: Url,
    /// Selects the handler that processes the response.
    pub tag: String,
    /// Fetch attempts that failed with a transient error so far.
    pub network_try_count: u32,
    /// Free-form data handed from the creator of the request to its handler.
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl Request {
    /// Creates a request for `url` dispatched to the handler registered under `tag`.
    pub fn new(url: Url, tag: impl Into<String>) -> Self {
        Request {
            url,
            tag: tag.into(),
            network_try_count: 0,
            meta: Map::new(),
        }
    }

    /// Parses `url` and creates a request for it.
    pub fn parse(url: &str, tag: impl Into<String>) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(url)?, tag))
    }

    /// Attaches a meta value, replacing any previous value under `key`.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Looks up a meta value.
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }
}

/// Result of a successful fetch, paired with the request that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Final URL after any redirects the transport followed.
    pub url: Url,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn new(url: Url, status: u16, body: impl Into<Bytes>) -> Self {
        Response {
            url,
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header value matching `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
