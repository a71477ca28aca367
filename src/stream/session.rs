//! Per-connection stream session
//!
//! The socket task runs the command loop; each `play`/`seek` spawns a
//! streaming run on its own task so the loop stays responsive. Runs carry
//! a monotonically increasing `stream_id` and a cancellation token.
//! Preempting a run cancels its token, waits for the task to exit, then
//! installs the successor's id — and every outbound message re-checks the
//! id under the send lock, so a late frame from a dead run is dropped
//! instead of interleaving with its successor on the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{DvrError, Result};
use crate::format::AudioRecord;
use crate::seek::{self, VpsAnchor};
use crate::state::AppState;
use crate::storage::StorageManager;
use crate::stream::wire::{
    self, encode_audio_frame, encode_video_frame, Command, Event, FrameKind, AUDIO_SAMPLE_RATE,
    BASE_FPS,
};

/// Playback rates the device UI exposes are 0.5–4×; tolerate a bit more.
const MIN_RATE: f64 = 0.1;
const MAX_RATE: f64 = 16.0;

/// `active_id` value while no run is installed.
const NO_RUN: u64 = 0;

/// Current pacing rate, shared between the command loop and the run task.
pub struct SpeedControl(AtomicU64);

impl SpeedControl {
    pub fn new(rate: f64) -> Self {
        Self(AtomicU64::new(rate.to_bits()))
    }

    pub fn set(&self, rate: f64) {
        self.0.store(rate.clamp(MIN_RATE, MAX_RATE).to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Seconds between frames at the current rate.
    pub fn interval_secs(&self) -> f64 {
        1.0 / (BASE_FPS * self.get())
    }
}

/// Outcome of a guarded send.
enum SendResult {
    Sent,
    /// Dropped: the frame belongs to a preempted run.
    Stale,
    /// The socket is gone.
    Closed,
}

/// Serialised, id-guarded write half of the socket.
struct SessionSender {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    active_id: AtomicU64,
}

impl SessionSender {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
            active_id: AtomicU64::new(NO_RUN),
        }
    }

    /// Send one whole message if `stream_id` is still the active run.
    /// The id check happens under the sink lock: a preemption that lands
    /// between check and write cannot interleave bytes.
    async fn send(&self, stream_id: u64, msg: Message) -> SendResult {
        let mut sink = self.sink.lock().await;
        if stream_id != self.active_id.load(Ordering::Acquire) {
            return SendResult::Stale;
        }
        match sink.send(msg).await {
            Ok(()) => SendResult::Sent,
            Err(_) => SendResult::Closed,
        }
    }

    async fn send_event(&self, stream_id: u64, event: &Event) -> SendResult {
        let text = serde_json::to_string(event).expect("event serializes");
        self.send(stream_id, Message::Text(text.into())).await
    }

    async fn send_error(&self, stream_id: u64, message: &str) -> SendResult {
        let text = serde_json::json!({ "error": message }).to_string();
        self.send(stream_id, Message::Text(text.into())).await
    }

    async fn send_binary(&self, stream_id: u64, frame: Bytes) -> SendResult {
        self.send(stream_id, Message::Binary(frame)).await
    }
}

struct ActiveRun {
    id: u64,
    token: CancellationToken,
    speed: Arc<SpeedControl>,
    handle: JoinHandle<()>,
}

/// Drive one WebSocket connection to completion.
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sink, stream) = socket.split();
    let sender = Arc::new(SessionSender::new(sink));
    let mut session = Session {
        state,
        sender,
        next_stream_id: NO_RUN,
        run: None,
    };
    session.command_loop(stream).await;
    session.stop_run().await;
    tracing::debug!("session closed");
}

struct Session {
    state: Arc<AppState>,
    sender: Arc<SessionSender>,
    next_stream_id: u64,
    run: Option<ActiveRun>,
}

impl Session {
    async fn command_loop(&mut self, mut stream: SplitStream<WebSocket>) {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<Command>(&text) {
                    Ok(cmd) => self.handle_command(cmd).await,
                    Err(e) => {
                        tracing::debug!(error = %e, "malformed command");
                        let _ = self.sender.send_error(self.current_id(), "invalid json").await;
                    }
                },
                Ok(Message::Close(_)) => break,
                // Pings are answered by the socket layer; binary input is
                // not part of the protocol.
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "socket error");
                    break;
                }
            }
        }
    }

    fn current_id(&self) -> u64 {
        self.run.as_ref().map(|r| r.id).unwrap_or(NO_RUN)
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Play { channel, timestamp, speed, audio }
            | Command::Seek { channel, timestamp, speed, audio } => {
                self.start_run(channel, timestamp, speed, audio).await;
            }
            Command::Pause {} => {
                tracing::debug!("pause");
                self.stop_run().await;
            }
            Command::Speed { rate } => {
                if let Some(run) = &self.run {
                    tracing::debug!(rate, "speed change");
                    run.speed.set(rate);
                }
            }
        }
    }

    /// Preempt any active run and start a new one.
    async fn start_run(&mut self, channel: u16, timestamp: u32, speed: f64, audio: bool) {
        self.stop_run().await;

        self.next_stream_id += 1;
        let id = self.next_stream_id;
        let token = CancellationToken::new();
        let speed = Arc::new(SpeedControl::new(speed.clamp(MIN_RATE, MAX_RATE)));

        // Install the new id before the task starts so nothing written by
        // it can race an older id.
        self.sender.active_id.store(id, Ordering::Release);

        tracing::info!(stream_id = id, channel, timestamp, audio, "starting stream");

        let run = RunContext {
            state: self.state.clone(),
            sender: self.sender.clone(),
            id,
            token: token.clone(),
            speed: speed.clone(),
            channel,
            timestamp,
            audio,
        };
        let handle = tokio::spawn(run.drive());

        self.run = Some(ActiveRun { id, token, speed, handle });
    }

    /// Cancel the active run and wait for it to observe the cancellation
    /// and exit.
    async fn stop_run(&mut self) {
        if let Some(run) = self.run.take() {
            run.token.cancel();
            if let Err(e) = run.handle.await {
                tracing::warn!(stream_id = run.id, error = %e, "run task failed");
            }
            self.sender.active_id.store(NO_RUN, Ordering::Release);
        }
    }
}

/// Everything one streaming run needs.
struct RunContext {
    state: Arc<AppState>,
    sender: Arc<SessionSender>,
    id: u64,
    token: CancellationToken,
    speed: Arc<SpeedControl>,
    channel: u16,
    timestamp: u32,
    audio: bool,
}

impl RunContext {
    async fn drive(self) {
        match self.stream().await {
            Ok(()) => {}
            Err(e) => {
                tracing::debug!(stream_id = self.id, error = %e, "run ended with error");
                let _ = self.sender.send_error(self.id, &e.client_message()).await;
            }
        }
    }

    async fn stream(&self) -> Result<()> {
        let storage = self
            .state
            .storage()
            .ok_or_else(|| DvrError::VolumeNotReady("no volume mounted".into()))?;

        let target = seek::resolve(&storage, self.timestamp, self.channel).await?;
        let file_index = target.segment.file_index;

        let cached = storage
            .cached_segment(file_index)
            .ok_or(DvrError::SeekNotFound)?;
        let anchors: Vec<VpsAnchor> = storage.i_frame_positions(file_index, self.channel);
        let audio_records: Vec<AudioRecord> =
            if self.audio { cached.audio().to_vec() } else { Vec::new() };
        let has_audio = !audio_records.is_empty();

        let started = self
            .sender
            .send_event(
                self.id,
                &Event::StreamStart {
                    channel: self.channel,
                    segment_start: target.segment.start_time,
                    segment_end: target.segment.end_time,
                    actual_start_time: target.actual_start_time,
                    has_audio,
                    audio_format: wire::AUDIO_FORMAT,
                    audio_sample_rate: AUDIO_SAMPLE_RATE,
                },
            )
            .await;
        if !matches!(started, SendResult::Sent) {
            return Ok(());
        }

        // Decoder prologue, oldest-to-newest dependency order.
        let mut ts_ms = u64::from(target.actual_start_time) * 1000;
        let header = &target.header;
        for (kind, payload) in [
            (FrameKind::Vps, &header.vps),
            (FrameKind::Sps, &header.sps),
            (FrameKind::Pps, &header.pps),
            (FrameKind::Key, &header.idr),
        ] {
            match self.sender.send_binary(self.id, encode_video_frame(kind, ts_ms, payload)).await {
                SendResult::Sent => {}
                SendResult::Stale | SendResult::Closed => return Ok(()),
            }
        }

        let mut reader = storage
            .open_stream_reader(file_index, target.resume_offset, ts_ms, self.channel)
            .await?;

        // Audio is flushed by container offset, starting at the IDR.
        let idr_offset = header.idr_offset as u64;
        let mut audio = if has_audio {
            Some(AudioFlusher::open(&storage, file_index, &audio_records, idr_offset).await?)
        } else {
            None
        };

        loop {
            if self.token.is_cancelled() {
                return Ok(());
            }
            let batch = reader.next_batch().await?;
            if batch.is_empty() {
                let _ = self.sender.send_event(self.id, &Event::StreamEnd {}).await;
                tracing::debug!(stream_id = self.id, "stream end");
                return Ok(());
            }

            for nal in batch {
                if self.token.is_cancelled() {
                    return Ok(());
                }
                let Some(kind) = FrameKind::from_nal(nal.nal_type) else {
                    continue;
                };

                if let Some(flusher) = &mut audio {
                    flusher.flush_through(self, nal.offset).await?;
                }

                let interval_ms = (self.speed.interval_secs() * 1000.0) as u64;
                match kind {
                    FrameKind::Key => {
                        ts_ms = (seek::fine_time_at(&anchors, &target.segment, nal.offset)
                            * 1000.0) as u64;
                    }
                    FrameKind::Predicted => {
                        ts_ms += interval_ms;
                    }
                    // Mid-stream parameter sets ride the current clock.
                    _ => {}
                }

                match self
                    .sender
                    .send_binary(self.id, encode_video_frame(kind, ts_ms, &nal.payload))
                    .await
                {
                    SendResult::Sent => {}
                    SendResult::Stale | SendResult::Closed => return Ok(()),
                }

                if matches!(kind, FrameKind::Key | FrameKind::Predicted) {
                    let pace = std::time::Duration::from_secs_f64(self.speed.interval_secs());
                    tokio::select! {
                        _ = self.token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(pace) => {}
                    }
                }
            }
        }
    }
}

/// Reads audio payloads at their recorded offsets and pushes every frame
/// that precedes the current video position.
struct AudioFlusher {
    file: tokio::fs::File,
    records: Vec<AudioRecord>,
    cursor: usize,
}

impl AudioFlusher {
    async fn open(
        storage: &StorageManager,
        file_index: u32,
        records: &[AudioRecord],
        start_offset: u64,
    ) -> Result<Self> {
        let path = storage.container_path(file_index);
        let file = tokio::fs::File::open(&path).await.map_err(DvrError::StreamIo)?;
        // Skip audio that precedes the playback start.
        let cursor = records.partition_point(|a| u64::from(a.file_offset) < start_offset);
        Ok(Self { file, records: records.to_vec(), cursor })
    }

    /// Emit every pending audio frame with `file_offset <= video_offset`.
    async fn flush_through(&mut self, run: &RunContext, video_offset: u64) -> Result<()> {
        while let Some(rec) = self.records.get(self.cursor) {
            if u64::from(rec.file_offset) > video_offset {
                break;
            }
            let rec = *rec;
            self.cursor += 1;
            if rec.frame_size == 0 {
                continue;
            }

            let mut payload = vec![0u8; rec.frame_size as usize];
            self.file
                .seek(std::io::SeekFrom::Start(u64::from(rec.file_offset)))
                .await
                .map_err(DvrError::StreamIo)?;
            self.file.read_exact(&mut payload).await.map_err(DvrError::StreamIo)?;

            // Audio carries its own ground-truth clock; it never moves the
            // video timeline.
            let audio_ts = u64::from(rec.unix_timestamp) * 1000;
            match run
                .sender
                .send_binary(run.id, encode_audio_frame(audio_ts, AUDIO_SAMPLE_RATE, &payload))
                .await
            {
                SendResult::Sent => {}
                SendResult::Stale | SendResult::Closed => break,
            }
        }
        Ok(())
    }
}
