//! Network seam: the REST backend the façade and the sync coordinator talk to.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::transaction::{ErrorClass, Method};

/// Failure of a single HTTP exchange.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
  #[error("request timed out: {0}")]
  Timeout(String),

  #[error("server unreachable: {0}")]
  Unreachable(String),

  #[error("server returned {status}: {body}")]
  Status { status: u16, body: String },

  #[error("failed to decode response: {0}")]
  Decode(String),

  #[error("request failed: {0}")]
  Request(String),
}

impl RemoteError {
  /// Retry classifier. Client errors will fail identically on every replay,
  /// except the few that signal "try again later".
  pub fn class(&self) -> ErrorClass {
    match self {
      RemoteError::Status { status, .. } => match *status {
        408 | 425 | 429 => ErrorClass::Transient,
        400..=499 => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
      },
      _ => ErrorClass::Transient,
    }
  }

  /// True when the server was never reached.
  pub fn is_transport(&self) -> bool {
    matches!(self, RemoteError::Timeout(_) | RemoteError::Unreachable(_))
  }
}

/// One HTTP call, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
  pub method: Method,
  pub url: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
}

impl RemoteRequest {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      query: Vec::new(),
      body: None,
    }
  }

  pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
    self.query = query;
    self
  }

  pub fn with_body(mut self, body: Option<Value>) -> Self {
    self.body = body;
    self
  }
}

/// JSON-over-HTTP transport. Implementations must resolve every call to a
/// response or an error; timeouts are reported as errors.
#[async_trait]
pub trait Remote: Send + Sync {
  /// Perform the request. `Ok(None)` means a successful response without a body.
  async fn send(&self, request: RemoteRequest) -> Result<Option<Value>, RemoteError>;
}

/// reqwest-backed transport with bearer authentication.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
}

impl HttpRemote {
  pub fn new(timeout: Duration, token: Option<&str>) -> Result<Self, RemoteError> {
    let mut headers = HeaderMap::new();
    if let Some(token) = token {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| RemoteError::Request(format!("invalid token: {}", e)))?;
      headers.insert(AUTHORIZATION, value);
    }

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .default_headers(headers)
      .build()
      .map_err(|e| RemoteError::Request(e.to_string()))?;

    Ok(Self { client })
  }
}

fn map_reqwest_error(e: reqwest::Error) -> RemoteError {
  if e.is_timeout() {
    RemoteError::Timeout(e.to_string())
  } else if e.is_connect() {
    RemoteError::Unreachable(e.to_string())
  } else if e.is_decode() {
    RemoteError::Decode(e.to_string())
  } else {
    RemoteError::Request(e.to_string())
  }
}

#[async_trait]
impl Remote for HttpRemote {
  async fn send(&self, request: RemoteRequest) -> Result<Option<Value>, RemoteError> {
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self.client.request(method, &request.url);
    if !request.query.is_empty() {
      builder = builder.query(&request.query);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    debug!(method = %request.method, url = %request.url, "sending request");
    let response = builder.send().await.map_err(map_reqwest_error)?;
    let status = response.status();

    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(RemoteError::Status {
        status: status.as_u16(),
        body,
      });
    }

    // From here on the server has accepted the call. A body we cannot read
    // must not turn that into a failure, or the write would be sent again.
    let bytes = match response.bytes().await {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(url = %request.url, status = status.as_u16(), error = %e, "response body unreadable");
        return Ok(None);
      }
    };

    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
      return Ok(None);
    }

    match serde_json::from_slice(&bytes) {
      Ok(value) => Ok(Some(value)),
      Err(e) => {
        debug!(url = %request.url, status = status.as_u16(), error = %e, "response body is not JSON");
        Ok(None)
      }
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn status(code: u16) -> RemoteError {
    RemoteError::Status {
      status: code,
      body: String::new(),
    }
  }

  #[test]
  fn test_client_errors_are_permanent() {
    assert_eq!(status(400).class(), ErrorClass::Permanent);
    assert_eq!(status(404).class(), ErrorClass::Permanent);
    assert_eq!(status(422).class(), ErrorClass::Permanent);
  }

  #[test]
  fn test_retryable_statuses_are_transient() {
    assert_eq!(status(408).class(), ErrorClass::Transient);
    assert_eq!(status(429).class(), ErrorClass::Transient);
    assert_eq!(status(500).class(), ErrorClass::Transient);
    assert_eq!(status(503).class(), ErrorClass::Transient);
  }

  #[test]
  fn test_transport_failures_are_transient() {
    let timeout = RemoteError::Timeout("30s".into());
    assert_eq!(timeout.class(), ErrorClass::Transient);
    assert!(timeout.is_transport());
    assert!(RemoteError::Unreachable("x".into()).is_transport());
    assert!(!status(503).is_transport());
  }

  /// Serve exactly one HTTP exchange on a local port with a canned response.
  async fn serve_once(response: &'static str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut request = Vec::new();
      let mut buf = [0u8; 4096];
      // Read the headers, then as much body as Content-Length announces.
      loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
          break;
        }
        request.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&request).to_string();
        if let Some(end) = text.find("\r\n\r\n") {
          let length = text[..end]
            .lines()
            .find_map(|line| {
              let (name, value) = line.split_once(':')?;
              name
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
            })
            .unwrap_or(0);
          if request.len() >= end + 4 + length {
            break;
          }
        }
      }
      socket.write_all(response.as_bytes()).await.unwrap();
      socket.shutdown().await.unwrap();
    });
    format!("http://{}/companies/c1/people", addr)
  }

  fn http_remote() -> HttpRemote {
    HttpRemote::new(Duration::from_secs(5), Some("token")).unwrap()
  }

  #[tokio::test]
  async fn test_success_with_plain_text_body_is_not_an_error() {
    let url = serve_once(
      "HTTP/1.1 201 Created\r\nContent-Type: text/plain\r\nContent-Length: 7\r\nConnection: close\r\n\r\nCreated",
    )
    .await;
    let request =
      RemoteRequest::new(Method::Post, url).with_body(Some(serde_json::json!({"name": "Alice"})));
    assert_eq!(http_remote().send(request).await, Ok(None));
  }

  #[tokio::test]
  async fn test_success_with_json_body_is_decoded() {
    let url = serve_once(
      "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 14\r\nConnection: close\r\n\r\n{\"personId\":4}",
    )
    .await;
    let response = http_remote().send(RemoteRequest::new(Method::Get, url)).await;
    assert_eq!(response, Ok(Some(serde_json::json!({"personId": 4}))));
  }

  #[tokio::test]
  async fn test_error_status_keeps_body() {
    let url = serve_once(
      "HTTP/1.1 422 Unprocessable Entity\r\nContent-Length: 8\r\nConnection: close\r\n\r\nbad name",
    )
    .await;
    let response = http_remote().send(RemoteRequest::new(Method::Get, url)).await;
    assert_eq!(
      response,
      Err(RemoteError::Status {
        status: 422,
        body: "bad name".into()
      })
    );
  }

  #[tokio::test]
  async fn test_stub_answers_in_script_order() {
    let stub = testing::StubRemote::new();
    stub.ok(serde_json::json!({"n": 1})).status(500);

    let first = stub.send(RemoteRequest::new(Method::Get, "http://a")).await;
    let second = stub.send(RemoteRequest::new(Method::Get, "http://b")).await;
    let third = stub.send(RemoteRequest::new(Method::Get, "http://c")).await;

    assert_eq!(first, Ok(Some(serde_json::json!({"n": 1}))));
    assert_eq!(second, Err(status(500)));
    assert!(matches!(third, Err(RemoteError::Unreachable(_))));
    assert_eq!(stub.requests().len(), 3);
  }
}
