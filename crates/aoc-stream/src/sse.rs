//! Server-sent events transport.

use eventsource_stream::{Event, Eventsource};
use futures_util::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::{StreamError, StreamResult};
use crate::manager::{OpenRequest, RawMessage};
use crate::runtime::{Connector, MessageStream};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Clone)]
pub struct SseConnector {
    client: reqwest::Client,
}

impl SseConnector {
    pub fn new() -> StreamResult<Self> {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(timeout: Duration) -> StreamResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|err| StreamError::transport(format!("http client: {err}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Connector for SseConnector {
    fn connect(
        &self,
        request: OpenRequest,
    ) -> impl Future<Output = StreamResult<MessageStream>> + Send {
        let client = self.client.clone();
        async move { open_event_stream(client, request).await }
    }
}

async fn open_event_stream(
    client: reqwest::Client,
    request: OpenRequest,
) -> StreamResult<MessageStream> {
    let mut builder = client
        .get(&request.url)
        .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
        .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Some(id) = request.last_event_id.as_deref() {
        match HeaderValue::from_str(id) {
            Ok(value) => builder = builder.header(LAST_EVENT_ID, value),
            Err(_) => debug!(event = "sse_resume_id_skipped", id),
        }
    }

    let response = builder
        .send()
        .await
        .map_err(|err| StreamError::transport(format!("sse request: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(StreamError::transport(format!("sse status {status}")));
    }
    if let Some(content_type) = response.headers().get(CONTENT_TYPE) {
        let content_type = content_type.to_str().unwrap_or("");
        if !content_type.contains("text/event-stream") {
            return Err(StreamError::transport(format!(
                "sse content type '{content_type}'"
            )));
        }
    }

    let connection = request.connection_id;
    let stream = response
        .bytes_stream()
        .eventsource()
        .filter_map(move |item| async move {
            match item {
                Ok(event) => raw_message(event),
                Err(err) => {
                    debug!(event = "sse_stream_error", connection = %connection, error = %err);
                    Some(Err(StreamError::transport(format!("sse stream: {err}"))))
                }
            }
        })
        .boxed();
    Ok(stream)
}

/// Keep-alive events carry no data and are skipped.
fn raw_message(event: Event) -> Option<StreamResult<RawMessage>> {
    if event.data.trim().is_empty() {
        return None;
    }
    let message = RawMessage::new(event.data);
    if event.id.is_empty() {
        Some(Ok(message))
    } else {
        Some(Ok(message.with_id(event.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ConnectionId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serves one canned HTTP response and hands back the request head.
    async fn serve_once(response: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}/events", listener.local_addr().expect("addr"));
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let read = socket.read(&mut buf).await.expect("read");
                if read == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..read]);
            }
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.expect("shutdown");
            String::from_utf8_lossy(&head).to_ascii_lowercase()
        });
        (url, server)
    }

    fn request(url: String, last_event_id: Option<&str>) -> OpenRequest {
        OpenRequest {
            connection_id: ConnectionId::from_raw(1),
            url,
            last_event_id: last_event_id.map(str::to_string),
        }
    }

    const EVENT_STREAM_OK: &str = "HTTP/1.1 200 OK\r\n\
        content-type: text/event-stream\r\n\
        connection: close\r\n\r\n\
        id: e5\ndata: {\"type\":\"heartbeat\"}\n\n";

    #[tokio::test]
    async fn resume_sends_last_event_id_header() {
        let (url, server) = serve_once(EVENT_STREAM_OK).await;
        let mut stream = open_event_stream(reqwest::Client::new(), request(url, Some("e4")))
            .await
            .expect("open");

        let message = stream.next().await.expect("message").expect("ok");
        assert_eq!(message.id.as_deref(), Some("e5"));
        assert_eq!(message.data, r#"{"type":"heartbeat"}"#);

        let head = server.await.expect("server");
        assert!(head.starts_with("get /events "));
        assert!(head.contains("last-event-id: e4\r\n"));
        assert!(head.contains("accept: text/event-stream\r\n"));
        assert!(head.contains("cache-control: no-cache\r\n"));
    }

    #[tokio::test]
    async fn first_open_and_unusable_ids_send_no_header() {
        let (url, server) = serve_once(EVENT_STREAM_OK).await;
        open_event_stream(reqwest::Client::new(), request(url, None))
            .await
            .expect("open");
        assert!(!server.await.expect("server").contains("last-event-id"));

        let (url, server) = serve_once(EVENT_STREAM_OK).await;
        open_event_stream(reqwest::Client::new(), request(url, Some("e\n4")))
            .await
            .expect("open");
        assert!(!server.await.expect("server").contains("last-event-id"));
    }

    #[tokio::test]
    async fn error_status_is_a_transport_failure() {
        let (url, server) = serve_once(
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let err = open_event_stream(reqwest::Client::new(), request(url, None))
            .await
            .err()
            .expect("status error");
        assert!(matches!(err, StreamError::Transport(_)), "{err:?}");
        assert!(err.is_retryable());
        server.await.expect("server");
    }

    #[tokio::test]
    async fn html_response_is_a_transport_failure() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: 2\r\nconnection: close\r\n\r\nhi",
        )
        .await;
        let err = open_event_stream(reqwest::Client::new(), request(url, None))
            .await
            .err()
            .expect("content type error");
        assert!(matches!(err, StreamError::Transport(_)), "{err:?}");
        server.await.expect("server");
    }

    fn event(data: &str, id: &str) -> Event {
        Event {
            event: "message".to_string(),
            data: data.to_string(),
            id: id.to_string(),
            retry: None,
        }
    }

    #[test]
    fn carries_sse_id_through() {
        let message = raw_message(event(r#"{"type":"heartbeat"}"#, "e12"))
            .expect("message")
            .expect("ok");
        assert_eq!(message.id.as_deref(), Some("e12"));
        assert_eq!(message.data, r#"{"type":"heartbeat"}"#);

        let message = raw_message(event("{}", "")).expect("message").expect("ok");
        assert!(message.id.is_none());
    }

    #[test]
    fn keep_alives_are_skipped() {
        assert!(raw_message(event("", "e1")).is_none());
        assert!(raw_message(event("  \n", "")).is_none());
    }
}
