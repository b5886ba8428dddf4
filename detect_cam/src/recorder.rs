//! Recording of the composite stream into a downloadable file.
//!
use std::{
    io::{Cursor, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, Stdio},
    sync::Arc,
    thread,
};

use anyhow::{anyhow, Context};
use bytes::{Bytes, BytesMut};
use image::{codecs::jpeg::JpegEncoder, ColorType, RgbImage};
use serde::Serialize;
use tokio::{
    sync::{
        broadcast::error::RecvError,
        mpsc::{unbounded_channel, UnboundedReceiver},
        Mutex,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{config::AppConfig, AppError, FrameReceiver};

/// File name of a saved recording, without extension.
pub const RECORDING_FILE_STEM: &str = "recorded_video";

/// Size of the reads from the encoder output pipe.
const PIPE_READ_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Container {
    WebM,
    MotionJpeg,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::WebM => "webm",
            Container::MotionJpeg => "mjpeg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Container::WebM => "video/webm",
            Container::MotionJpeg => "video/x-motion-jpeg",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{RECORDING_FILE_STEM}.{}", self.extension())
    }
}

/// Turns composite frames into opaque media chunks.
///
/// Concatenating the chunks of one session in order, followed by the output of
/// [`ChunkEncoder::finish`], must yield a valid file of the encoder's container.
pub trait ChunkEncoder: Send {
    fn encode(&mut self, frame: &RgbImage) -> Result<Bytes, AppError>;

    /// Flush buffered output at the end of a session.
    fn finish(&mut self) -> Result<Bytes, AppError> {
        Ok(Bytes::new())
    }
}

/// Encodes every frame as one JPEG, a Motion-JPEG stream when concatenated.
pub struct JpegChunkEncoder {
    quality: u8,
}

impl JpegChunkEncoder {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }
}

impl ChunkEncoder for JpegChunkEncoder {
    fn encode(&mut self, frame: &RgbImage) -> Result<Bytes, AppError> {
        encode_jpeg(frame, self.quality)
    }
}

/// Encode a frame as JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Bytes, AppError> {
    let (width, height) = frame.dimensions();
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        frame.as_raw(),
        width,
        height,
        ColorType::Rgb8,
    )?;

    Ok(Bytes::from(buf.into_inner()))
}

/// VP8 in WebM, encoded by an FFmpeg child process.
///
/// Raw RGB frames go to the stdin of FFmpeg, the WebM stream is collected from its stdout by a
/// reader thread. Frames are timestamped on arrival, so the variable frame loop rate is kept.
pub struct WebmChunkEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    output_rx: UnboundedReceiver<Bytes>,
    reader: Option<thread::JoinHandle<()>>,
    width: u32,
    height: u32,
}

impl WebmChunkEncoder {
    /// Start FFmpeg for frames of `width` x `height`.
    pub fn spawn(ffmpeg: &Path, width: u32, height: u32) -> Result<Self, AppError> {
        let video_size = format!("{width}x{height}");
        let mut child = Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-use_wallclock_as_timestamps", "1"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-video_size", &video_size])
            .args(["-i", "pipe:0"])
            .args(["-c:v", "libvpx", "-deadline", "realtime", "-b:v", "2M", "-an"])
            .args(["-f", "webm", "pipe:1"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn {}", ffmpeg.display()))
            .map_err(AppError::Encoder)?;

        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Encoder(anyhow!("no stdout pipe to ffmpeg")))?;

        let (output_tx, output_rx) = unbounded_channel();
        let reader = thread::spawn(move || {
            let mut buf = vec![0u8; PIPE_READ_SIZE];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        log::warn!("Failed to read ffmpeg output: {err}");
                        break;
                    }
                }
            }
        });
        log::info!("Started ffmpeg for {video_size} WebM");

        Ok(Self {
            child,
            stdin,
            output_rx,
            reader: Some(reader),
            width,
            height,
        })
    }

    /// Output produced so far.
    fn drain_output(&mut self) -> Bytes {
        let mut output = BytesMut::new();
        while let Ok(chunk) = self.output_rx.try_recv() {
            output.extend_from_slice(&chunk);
        }
        output.freeze()
    }
}

impl ChunkEncoder for WebmChunkEncoder {
    fn encode(&mut self, frame: &RgbImage) -> Result<Bytes, AppError> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(AppError::Encoder(anyhow!(
                "frame of {:?} does not match the {}x{} stream",
                frame.dimensions(),
                self.width,
                self.height
            )));
        }

        self.stdin
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg input already closed"))
            .and_then(|stdin| {
                stdin
                    .write_all(frame.as_raw())
                    .context("failed to write frame to ffmpeg")
            })
            .map_err(AppError::Encoder)?;

        Ok(self.drain_output())
    }

    fn finish(&mut self) -> Result<Bytes, AppError> {
        // EOF on stdin makes ffmpeg flush and exit
        drop(self.stdin.take());
        if let Some(reader) = self.reader.take() {
            reader
                .join()
                .map_err(|_| AppError::Encoder(anyhow!("ffmpeg output reader panicked")))?;
        }

        let status = self
            .child
            .wait()
            .context("failed to wait for ffmpeg")
            .map_err(AppError::Encoder)?;
        if !status.success() {
            return Err(AppError::Encoder(anyhow!("ffmpeg exited with {status}")));
        }

        Ok(self.drain_output())
    }
}

impl Drop for WebmChunkEncoder {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Stopped,
    Recording,
}

/// A finished recording, ready for download.
#[derive(Debug)]
pub struct Recording {
    pub file_name: String,
    pub content_type: &'static str,
    pub data: Bytes,
}

/// Creates the encoder of a session for frames of the given width and height.
pub type EncoderFactory =
    Box<dyn Fn(u32, u32) -> Result<Box<dyn ChunkEncoder>, AppError> + Send + Sync>;

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Buffers encoded chunks of the composite stream between start and stop.
pub struct Recorder {
    container: Container,
    new_encoder: EncoderFactory,
    chunks: Arc<Mutex<Vec<Bytes>>>,
    session: Mutex<Option<Session>>,
}

impl Recorder {
    pub fn new(container: Container, new_encoder: EncoderFactory) -> Self {
        Self {
            container,
            new_encoder,
            chunks: Arc::new(Mutex::new(Vec::new())),
            session: Mutex::new(None),
        }
    }

    /// Recorder writing WebM through the `ffmpeg` executable.
    pub fn webm(ffmpeg: PathBuf) -> Self {
        Self::new(
            Container::WebM,
            Box::new(
                move |width, height| -> Result<Box<dyn ChunkEncoder>, AppError> {
                    Ok(Box::new(WebmChunkEncoder::spawn(&ffmpeg, width, height)?))
                },
            ),
        )
    }

    /// Recorder writing Motion-JPEG.
    pub fn jpeg(quality: u8) -> Self {
        Self::new(
            Container::MotionJpeg,
            Box::new(move |_, _| -> Result<Box<dyn ChunkEncoder>, AppError> {
                Ok(Box::new(JpegChunkEncoder::new(quality)))
            }),
        )
    }

    /// Recorder for the configured container.
    pub fn from_config(config: &AppConfig) -> Self {
        match config.container {
            Container::WebM => Self::webm(config.ffmpeg_path.clone()),
            Container::MotionJpeg => Self::jpeg(config.jpeg_quality),
        }
    }

    pub fn container(&self) -> Container {
        self.container
    }

    pub async fn state(&self) -> RecorderState {
        match *self.session.lock().await {
            Some(_) => RecorderState::Recording,
            None => RecorderState::Stopped,
        }
    }

    pub async fn chunk_count(&self) -> usize {
        self.chunks.lock().await.len()
    }

    /// Start a new session on `frames` of `width` x `height`, discarding the chunks of the
    /// previous one.
    pub async fn start(
        &self,
        frames: FrameReceiver,
        (width, height): (u32, u32),
    ) -> Result<(), AppError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(AppError::AlreadyRecording);
        }

        let encoder = (self.new_encoder)(width, height)?;
        self.chunks.lock().await.clear();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(capture_chunks(
            frames,
            encoder,
            Arc::clone(&self.chunks),
            cancel.clone(),
        ));
        *session = Some(Session { cancel, handle });
        log::info!("Recording started");

        Ok(())
    }

    /// Stop the session after encoding the frames already published, returns the chunk count.
    ///
    /// The session stays locked until its capture task has finished, so a following start or
    /// save only sees complete sessions.
    pub async fn stop(&self) -> Result<usize, AppError> {
        let mut session = self.session.lock().await;
        let Session { cancel, handle } = session.take().ok_or(AppError::NotRecording)?;

        cancel.cancel();
        handle
            .await
            .map_err(|err| AppError::Internal(err.into()))?;
        drop(session);

        let count = self.chunk_count().await;
        log::info!("Recording stopped with {count} chunks");

        Ok(count)
    }

    /// Assemble the chunks of the last session into one file.
    pub async fn save(&self) -> Result<Recording, AppError> {
        if self.session.lock().await.is_some() {
            return Err(AppError::StillRecording);
        }

        let chunks = self.chunks.lock().await;
        if chunks.is_empty() {
            return Err(AppError::EmptyRecording);
        }

        let mut data = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks.iter() {
            data.extend_from_slice(chunk);
        }
        log::info!(
            "Saving recording of {} chunks ({} bytes)",
            chunks.len(),
            data.len()
        );

        Ok(Recording {
            file_name: self.container.file_name(),
            content_type: self.container.content_type(),
            data: data.freeze(),
        })
    }
}

/// Run `op` on the encoder on a blocking thread, handing the encoder back.
async fn on_encoder<F>(
    mut encoder: Box<dyn ChunkEncoder>,
    op: F,
) -> Option<(Box<dyn ChunkEncoder>, Result<Bytes, AppError>)>
where
    F: FnOnce(&mut dyn ChunkEncoder) -> Result<Bytes, AppError> + Send + 'static,
{
    let res = tokio::task::spawn_blocking(move || {
        let chunk = op(encoder.as_mut());
        (encoder, chunk)
    })
    .await;

    match res {
        Ok(done) => Some(done),
        Err(err) => {
            log::error!("Encoder task failed: {err}");
            None
        }
    }
}

async fn capture_chunks(
    mut frames_rx: FrameReceiver,
    mut encoder: Box<dyn ChunkEncoder>,
    chunks: Arc<Mutex<Vec<Bytes>>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = frames_rx.recv() => match res {
                Ok(frame) => frame,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Recorder lagging, skipped {skipped} frames");
                    continue;
                }
                Err(RecvError::Closed) => {
                    log::info!("Composite stream closed");
                    break;
                }
            }
        };

        let Some((returned, chunk)) = on_encoder(encoder, move |enc| enc.encode(&frame)).await
        else {
            return;
        };
        encoder = returned;
        push_chunk(chunk, &chunks).await;
    }

    // Frames published before the stop request still belong to the session
    while let Ok(frame) = frames_rx.try_recv() {
        let Some((returned, chunk)) = on_encoder(encoder, move |enc| enc.encode(&frame)).await
        else {
            return;
        };
        encoder = returned;
        push_chunk(chunk, &chunks).await;
    }

    if let Some((_, tail)) = on_encoder(encoder, |enc| enc.finish()).await {
        push_chunk(tail, &chunks).await;
    }
}

async fn push_chunk(chunk: Result<Bytes, AppError>, chunks: &Mutex<Vec<Bytes>>) {
    match chunk {
        Ok(chunk) if chunk.is_empty() => {}
        Ok(chunk) => chunks.lock().await.push(chunk),
        Err(err) => log::warn!("Dropping frame from recording: {err}"),
    }
}
