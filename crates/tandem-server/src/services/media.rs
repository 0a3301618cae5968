//! Media streaming service.
//!
//! Streams are files from the media root cut into fixed-size frames. Each
//! open stream owns a producer task that reads ahead into a bounded channel;
//! `NextFrame` pops from that channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rand::RngCore;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tandem_core::messages::{MediaRequest, MediaResponse, StreamId};
use tandem_core::{ServiceError, TandemResult};

use crate::handler::Handler;
use crate::registry::ConnectionId;

/// File extensions recognised as media.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mkv", "mov", "flv", "wmv", "mpg", "mpeg", "m4v", "3gp", "3g2",
];

const ERROR_KIND: &str = "StreamingError";

#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Directory scanned once at startup.
    pub root_dir: PathBuf,
    /// Frame rate reported to clients on `StartStream`.
    pub frame_rate: f64,
    /// Bytes per frame.
    pub frame_size: usize,
    /// Frames buffered ahead of the reader.
    pub prefetch: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./videos"),
            frame_rate: 24.0,
            frame_size: 64 * 1024,
            prefetch: 16,
        }
    }
}

struct Stream {
    owner: ConnectionId,
    frames: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    producer: JoinHandle<()>,
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

pub struct MediaService {
    config: MediaConfig,
    files: Vec<String>,
    streams: Mutex<HashMap<StreamId, Stream>>,
}

impl MediaService {
    /// Scan `config.root_dir` and build the service.
    pub fn new(config: MediaConfig) -> TandemResult<Self> {
        let files = scan_media(&config.root_dir)?;
        info!(
            root = %config.root_dir.display(),
            count = files.len(),
            "media library scanned"
        );
        Ok(Self {
            config,
            files,
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Number of open streams.
    pub async fn open_streams(&self) -> usize {
        self.streams.lock().await.len()
    }

    async fn start_stream(&self, owner: ConnectionId, filename: &str) -> Result<MediaResponse, ServiceError> {
        if !self.files.iter().any(|f| f == filename) {
            return Err(ServiceError::new(
                ERROR_KIND,
                format!("file {filename} does not exist"),
            ));
        }

        let path = self.config.root_dir.join(filename);
        let file = File::open(&path).await.map_err(|e| {
            warn!(path = %path.display(), error = %e, "failed to open media file");
            ServiceError::new(ERROR_KIND, format!("cannot open {filename}: {e}"))
        })?;

        let (tx, rx) = mpsc::channel(self.config.prefetch.max(1));
        let stream_id = generate_stream_id();
        let producer = tokio::spawn(produce_frames(
            file,
            self.config.frame_size,
            tx,
            stream_id.clone(),
        ));

        self.streams.lock().await.insert(
            stream_id.clone(),
            Stream {
                owner,
                frames: Arc::new(Mutex::new(rx)),
                producer,
            },
        );
        info!(conn_id = owner, stream_id = %stream_id, file = %filename, "stream started");

        Ok(MediaResponse::StreamStarted {
            stream_id,
            frame_rate: self.config.frame_rate,
        })
    }

    async fn next_frame(&self, stream_id: &str) -> Result<MediaResponse, ServiceError> {
        let frames = self
            .streams
            .lock()
            .await
            .get(stream_id)
            .map(|s| s.frames.clone())
            .ok_or_else(|| stream_not_found(stream_id))?;

        // The map lock is released here; only this stream's readers contend.
        let frame = frames.lock().await.recv().await;
        Ok(match frame {
            Some(data) => MediaResponse::Frame { data },
            None => MediaResponse::EndOfStream,
        })
    }

    async fn close_stream(&self, stream_id: &str) -> Result<MediaResponse, ServiceError> {
        match self.streams.lock().await.remove(stream_id) {
            Some(_) => {
                debug!(stream_id, "stream closed");
                Ok(MediaResponse::StreamClosed)
            }
            None => Err(stream_not_found(stream_id)),
        }
    }
}

impl Handler for MediaService {
    type Request = MediaRequest;
    type Response = MediaResponse;

    async fn handle(&self, conn: ConnectionId, request: MediaRequest) -> Result<MediaResponse, ServiceError> {
        match request {
            MediaRequest::ListMedia => Ok(MediaResponse::MediaList {
                files: self.files.clone(),
            }),
            MediaRequest::StartStream { filename } => self.start_stream(conn, &filename).await,
            MediaRequest::NextFrame { stream_id } => self.next_frame(&stream_id).await,
            MediaRequest::CloseStream { stream_id } => self.close_stream(&stream_id).await,
        }
    }

    async fn disconnected(&self, conn: ConnectionId) {
        let mut streams = self.streams.lock().await;
        let before = streams.len();
        streams.retain(|_, s| s.owner != conn);
        let closed = before - streams.len();
        if closed > 0 {
            debug!(conn_id = conn, closed, "closed streams of departed connection");
        }
    }
}

fn stream_not_found(stream_id: &str) -> ServiceError {
    ServiceError::new(ERROR_KIND, format!("stream {stream_id} not found"))
}

/// Generate a random stream ID (32 hex chars).
fn generate_stream_id() -> StreamId {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// List media files directly under `root`, sorted by name.
fn scan_media(root: &std::path::Path) -> TandemResult<Vec<String>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let is_media = name
            .rsplit_once('.')
            .map(|(_, ext)| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_media {
            files.push(name);
        }
    }
    files.sort();
    Ok(files)
}

/// Read `file` in `frame_size` chunks into `tx` until EOF or the stream is closed.
async fn produce_frames(mut file: File, frame_size: usize, tx: mpsc::Sender<Vec<u8>>, stream_id: StreamId) {
    let mut produced = 0u64;
    loop {
        let mut frame = Vec::with_capacity(frame_size);
        match (&mut file).take(frame_size as u64).read_to_end(&mut frame).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(stream_id = %stream_id, error = %e, "frame read failed, ending stream");
                break;
            }
        }
        if tx.send(frame).await.is_err() {
            // Receiver dropped: stream closed.
            return;
        }
        produced += 1;
    }
    debug!(stream_id = %stream_id, frames = produced, "producer finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library(files: &[(&str, &[u8])]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, data) in files {
            std::fs::write(dir.path().join(name), data).unwrap();
        }
        dir
    }

    fn service(dir: &tempfile::TempDir, frame_size: usize) -> MediaService {
        MediaService::new(MediaConfig {
            root_dir: dir.path().to_path_buf(),
            frame_rate: 24.0,
            frame_size,
            prefetch: 2,
        })
        .unwrap()
    }

    async fn start(svc: &MediaService, conn: ConnectionId, name: &str) -> StreamId {
        match svc
            .handle(conn, MediaRequest::StartStream { filename: name.into() })
            .await
            .unwrap()
        {
            MediaResponse::StreamStarted { stream_id, frame_rate } => {
                assert_eq!(frame_rate, 24.0);
                stream_id
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn scan_keeps_only_media_files() {
        let dir = library(&[("b.mp4", b""), ("a.MKV", b""), ("notes.txt", b""), ("noext", b"")]);
        std::fs::create_dir(dir.path().join("sub.mp4")).unwrap();
        let svc = service(&dir, 4);
        assert_eq!(svc.files(), ["a.MKV", "b.mp4"]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = MediaService::new(MediaConfig {
            root_dir: dir.path().join("nope"),
            ..MediaConfig::default()
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn frames_then_end_of_stream() {
        let dir = library(&[("clip.mp4", b"0123456789")]);
        let svc = service(&dir, 4);
        let id = start(&svc, 1, "clip.mp4").await;
        assert_eq!(id.len(), 32);

        let mut frames = Vec::new();
        loop {
            match svc.handle(1, MediaRequest::NextFrame { stream_id: id.clone() }).await.unwrap() {
                MediaResponse::Frame { data } => frames.push(data),
                MediaResponse::EndOfStream => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(frames, vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]);

        // Exhausted streams stay open until closed.
        assert_eq!(
            svc.handle(1, MediaRequest::NextFrame { stream_id: id.clone() }).await.unwrap(),
            MediaResponse::EndOfStream
        );
        assert_eq!(
            svc.handle(1, MediaRequest::CloseStream { stream_id: id.clone() }).await.unwrap(),
            MediaResponse::StreamClosed
        );
        let err = svc
            .handle(1, MediaRequest::NextFrame { stream_id: id.clone() })
            .await
            .unwrap_err();
        assert_eq!(err.kind, "StreamingError");
        assert_eq!(err.message, format!("stream {id} not found"));
    }

    #[tokio::test]
    async fn unknown_file_is_rejected() {
        let dir = library(&[("clip.mp4", b"x")]);
        let svc = service(&dir, 4);
        let err = svc
            .handle(1, MediaRequest::StartStream { filename: "../etc/passwd".into() })
            .await
            .unwrap_err();
        assert_eq!(err.kind, "StreamingError");
        assert_eq!(err.message, "file ../etc/passwd does not exist");
    }

    #[tokio::test]
    async fn close_unknown_stream_fails() {
        let dir = library(&[]);
        let svc = service(&dir, 4);
        let err = svc
            .handle(1, MediaRequest::CloseStream { stream_id: "missing".into() })
            .await
            .unwrap_err();
        assert_eq!(err.message, "stream missing not found");
    }

    #[tokio::test]
    async fn disconnect_closes_only_owned_streams() {
        let dir = library(&[("clip.mp4", &[7u8; 64])]);
        let svc = service(&dir, 8);
        let mine = start(&svc, 1, "clip.mp4").await;
        let theirs = start(&svc, 2, "clip.mp4").await;
        assert_ne!(mine, theirs);
        assert_eq!(svc.open_streams().await, 2);

        svc.disconnected(1).await;
        assert_eq!(svc.open_streams().await, 1);
        assert!(svc.handle(2, MediaRequest::NextFrame { stream_id: theirs }).await.is_ok());
        assert!(svc.handle(2, MediaRequest::NextFrame { stream_id: mine }).await.is_err());
    }
}
