//! HTTP access used by the collectors and the raster cache.
//!
//! Everything that talks to the network goes through the [`Transport`]
//! trait so the pipeline can run against canned responses in tests.

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[cfg(feature = "indicatif")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::commons::config::Config;
use crate::error::{DhmvError, Result};

#[cfg(feature = "indicatif")]
fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {bytes:>10}/{total_bytes:10} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// Status and body of a completed GET request
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        HttpResponse {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-success response into a `ServiceStatus` error.
    /// The message is the problem-details `title` when the body carries one.
    pub fn error_for_status(self, service: &'static str) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let message = serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| v.get("title").and_then(|t| t.as_str()).map(String::from))
            .unwrap_or_else(|| String::from_utf8_lossy(&self.body).trim().to_string());
        Err(DhmvError::ServiceStatus {
            service,
            status: self.status,
            message,
        })
    }

    pub fn json<T: DeserializeOwned>(&self, service: &'static str) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| DhmvError::malformed(service, e.to_string()))
    }
}

/// Blocking HTTP access
pub trait Transport: Send + Sync {
    /// GET `url` with the given query parameters
    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<HttpResponse>;

    /// Stream the body of `url` into `sink`, returning the number of bytes written.
    /// A non-success status is a `DownloadFailed` error.
    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64>;
}

/// reqwest implementation of [`Transport`]
pub struct HttpTransport {
    client: Client,
    download_client: Client,
    show_progress: bool,
}

impl HttpTransport {
    pub fn new(http_timeout: Duration, download_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(http_timeout).build()?;
        let download_client = Client::builder().timeout(download_timeout).build()?;
        Ok(HttpTransport {
            client,
            download_client,
            show_progress: false,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut transport = Self::new(config.http_timeout(), config.download_timeout())?;
        transport.show_progress = config.show_progress;
        Ok(transport)
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<HttpResponse> {
        debug!(url, ?query, "GET");
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .query(query)
            .send()?;
        let status = response.status().as_u16();
        let body = response.bytes()?.to_vec();
        debug!(url, status, bytes = body.len(), "response");
        Ok(HttpResponse { status, body })
    }

    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
        let download_failed = |reason: String| DhmvError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .download_client
            .get(url)
            .send()
            .map_err(|e| download_failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(download_failed(format!("HTTP {}", response.status())));
        }

        #[cfg(feature = "indicatif")]
        if self.show_progress {
            let pb = match response.content_length() {
                Some(len) => ProgressBar::new(len),
                None => ProgressBar::new_spinner(),
            };
            pb.set_style(progress_style());
            pb.set_message("Downloading");
            let mut writer = pb.wrap_write(sink);
            let written = response
                .copy_to(&mut writer)
                .map_err(|e| download_failed(e.to_string()))?;
            pb.finish_with_message("Downloaded");
            return Ok(written);
        }

        response
            .copy_to(sink)
            .map_err(|e| download_failed(e.to_string()))
    }
}

/// Append path segments to a base URL (`https://host/v1` + `["gebouwen", "42"]`)
pub fn endpoint(base: &str, segments: &[&str]) -> Result<String> {
    let mut url = Url::parse(base)
        .map_err(|e| DhmvError::InvalidInput(format!("Invalid base URL '{}': {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| DhmvError::InvalidInput(format!("Base URL '{}' cannot have a path", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url.to_string())
}

/// Canned responses keyed by URL, for unit tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeTransport {
        responses: HashMap<String, HttpResponse>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(mut self, url: &str, status: u16, body: impl Into<Vec<u8>>) -> Self {
            self.responses
                .insert(url.to_string(), HttpResponse::new(status, body));
            self
        }

        /// Number of requests made to URLs starting with `prefix`
        pub fn calls_to(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|url| url.starts_with(prefix))
                .count()
        }

        fn lookup(&self, url: &str) -> Option<HttpResponse> {
            self.calls.lock().unwrap().push(url.to_string());
            self.responses.get(url).cloned()
        }
    }

    impl Transport for FakeTransport {
        fn get(&self, url: &str, _query: &[(&str, String)]) -> Result<HttpResponse> {
            Ok(self
                .lookup(url)
                .unwrap_or_else(|| HttpResponse::new(404, r#"{"title":"Not found"}"#)))
        }

        fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
            match self.lookup(url) {
                Some(response) if response.is_success() => {
                    sink.write_all(&response.body)?;
                    Ok(response.body.len() as u64)
                }
                Some(response) => Err(DhmvError::DownloadFailed {
                    url: url.to_string(),
                    reason: format!("HTTP {}", response.status),
                }),
                None => Err(DhmvError::DownloadFailed {
                    url: url.to_string(),
                    reason: "HTTP 404".to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        assert_eq!(
            endpoint("https://api.basisregisters.vlaanderen.be/v1", &["gebouwen", "42"]).unwrap(),
            "https://api.basisregisters.vlaanderen.be/v1/gebouwen/42"
        );
        assert_eq!(
            endpoint("http://localhost:8080/", &["adresmatch"]).unwrap(),
            "http://localhost:8080/adresmatch"
        );
        assert!(endpoint("not a url", &["x"]).is_err());
    }

    #[test]
    fn test_error_for_status_uses_problem_title() {
        let response = HttpResponse::new(
            400,
            r#"{"type":"about:blank","title":"Ongeldige postcode.","status":400}"#,
        );
        match response.error_for_status("Basisregisters") {
            Err(DhmvError::ServiceStatus {
                status, message, ..
            }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Ongeldige postcode.");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_json_malformed() {
        let response = HttpResponse::new(200, "<html>");
        let parsed: Result<serde_json::Value> = response.json("Geopunt");
        assert!(matches!(
            parsed,
            Err(DhmvError::MalformedResponse { service: "Geopunt", .. })
        ));
    }
}
