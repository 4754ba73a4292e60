//! WebSocket transport. Every text frame is one envelope; the resume position
//! travels as the `last_event_id` query parameter.

use futures_util::StreamExt;
use std::future::Future;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use crate::error::{StreamError, StreamResult};
use crate::manager::{OpenRequest, RawMessage};
use crate::runtime::{Connector, MessageStream};

pub const RESUME_QUERY_PARAM: &str = "last_event_id";

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect(
        &self,
        request: OpenRequest,
    ) -> impl Future<Output = StreamResult<MessageStream>> + Send {
        async move { open_socket(request).await }
    }
}

async fn open_socket(request: OpenRequest) -> StreamResult<MessageStream> {
    let url = resume_url(&request.url, request.last_event_id.as_deref())?;
    let (socket, _) = connect_async(url)
        .await
        .map_err(|err| StreamError::transport(format!("ws connect: {err}")))?;

    let connection = request.connection_id;
    let stream = socket
        .filter_map(move |frame| async move {
            match frame {
                Ok(Message::Text(text)) => Some(Ok(RawMessage::new(text))),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Some(Ok(RawMessage::new(text))),
                    Err(_) => {
                        debug!(event = "ws_binary_frame_dropped", connection = %connection);
                        None
                    }
                },
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "closed by server".to_string());
                    Some(Err(StreamError::transport(format!("ws close: {reason}"))))
                }
                Ok(_) => None,
                Err(err) => Some(Err(StreamError::transport(format!("ws read: {err}")))),
            }
        })
        .boxed();
    Ok(stream)
}

pub(crate) fn resume_url(raw: &str, last_event_id: Option<&str>) -> StreamResult<Url> {
    let mut url =
        Url::parse(raw).map_err(|err| StreamError::transport(format!("ws url '{raw}': {err}")))?;
    if let Some(id) = last_event_id.filter(|id| !id.is_empty()) {
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != RESUME_QUERY_PARAM)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        pairs.append_pair(RESUME_QUERY_PARAM, id);
    }
    Ok(url)
}
