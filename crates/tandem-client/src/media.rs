//! Typed wrapper for the media-streaming request family.

use std::sync::Arc;

use tandem_core::messages::{MediaRequest, MediaResponse, StreamId};
use tandem_core::{TandemError, TandemResult};

use crate::client::TandemClient;

/// A stream opened with [`MediaClient::start_stream`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHandle {
    pub stream_id: StreamId,
    pub frame_rate: f64,
}

pub struct MediaClient {
    client: Arc<TandemClient>,
}

impl MediaClient {
    pub fn new(client: Arc<TandemClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<TandemClient> {
        &self.client
    }

    /// Media files the server is willing to stream.
    pub async fn list_media(&self) -> TandemResult<Vec<String>> {
        match self.ask(MediaRequest::ListMedia).await? {
            MediaResponse::MediaList { files } => Ok(files),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn start_stream(&self, filename: &str) -> TandemResult<StreamHandle> {
        let request = MediaRequest::StartStream {
            filename: filename.to_string(),
        };
        match self.ask(request).await? {
            MediaResponse::StreamStarted {
                stream_id,
                frame_rate,
            } => Ok(StreamHandle {
                stream_id,
                frame_rate,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// The next encoded frame, or `None` once the stream is exhausted.
    pub async fn next_frame(&self, stream_id: &str) -> TandemResult<Option<Vec<u8>>> {
        let request = MediaRequest::NextFrame {
            stream_id: stream_id.to_string(),
        };
        match self.ask(request).await? {
            MediaResponse::Frame { data } => Ok(Some(data)),
            MediaResponse::EndOfStream => Ok(None),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn close_stream(&self, stream_id: &str) -> TandemResult<()> {
        let request = MediaRequest::CloseStream {
            stream_id: stream_id.to_string(),
        };
        match self.ask(request).await? {
            MediaResponse::StreamClosed => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn ask(&self, request: MediaRequest) -> TandemResult<MediaResponse> {
        self.client.ask(&request).await
    }
}

fn unexpected(response: &MediaResponse) -> TandemError {
    TandemError::Other(format!("unexpected media response: {response:?}"))
}
