//! Speech playback with an exactly-one-clip-at-a-time contract.
//!
//! The rodio output stream is not `Send`, so a worker thread owns the sink;
//! callers talk to it through commands and observe a shared drained flag.
//! Playback failure is reported through a distinct signal but advances the
//! session exactly like completion.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use rodio::buffer::SamplesBuffer;
use rodio::{Decoder, OutputStream, Sink, Source};
use tracing::{debug, warn};

use crate::error::VoiceError;

/// One exclusive speech output endpoint.
pub trait AudioOutput: Send + Sync {
    /// Replace whatever is playing with the given encoded clip (MP3/WAV).
    fn play_encoded(&self, bytes: Vec<u8>) -> Result<(), VoiceError>;

    /// Append raw PCM16 to the current queue (realtime audio deltas).
    fn append_pcm16(&self, samples: Vec<i16>, sample_rate: u32) -> Result<(), VoiceError>;

    /// Cut playback and clear the queue. Idempotent.
    fn stop(&self);

    /// True once the queue has fully drained (or playback failed).
    fn idle(&self) -> bool;

    /// Failure recorded since the last clip started, if any.
    fn take_error(&self) -> Option<String>;
}

enum OutputCmd {
    PlayEncoded(Vec<u8>),
    AppendPcm16 { samples: Vec<i16>, sample_rate: u32 },
    Stop,
    Shutdown,
}

/// rodio-backed speech output.
pub struct RodioOutput {
    cmd_tx: Sender<OutputCmd>,
    active: Arc<AtomicBool>,
    error: Arc<Mutex<Option<String>>>,
    worker: Option<JoinHandle<()>>,
}

impl RodioOutput {
    /// Open the default output device.
    ///
    /// # Errors
    ///
    /// Returns `Audio` when no output device can be opened.
    pub fn new() -> Result<Self, VoiceError> {
        let (cmd_tx, cmd_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let active = Arc::new(AtomicBool::new(false));
        let error = Arc::new(Mutex::new(None));
        let thread_active = Arc::clone(&active);
        let thread_error = Arc::clone(&error);

        let worker = thread::Builder::new()
            .name("iasted-speaker".into())
            .spawn(move || run_output_thread(cmd_rx, ready_tx, thread_active, thread_error))
            .map_err(|e| VoiceError::Audio(format!("failed to spawn output thread: {e}")))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(Self {
                cmd_tx,
                active,
                error,
                worker: Some(worker),
            }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => Err(VoiceError::Audio(
                "output thread did not report readiness".into(),
            )),
        }
    }

    fn send(&self, cmd: OutputCmd) -> Result<(), VoiceError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| VoiceError::Playback("output worker is gone".into()))
    }
}

impl AudioOutput for RodioOutput {
    fn play_encoded(&self, bytes: Vec<u8>) -> Result<(), VoiceError> {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = None;
        // Mark busy before the worker picks the clip up so callers polling
        // idle() immediately after cannot observe a false drain.
        self.active.store(true, Ordering::SeqCst);
        self.send(OutputCmd::PlayEncoded(bytes))
    }

    fn append_pcm16(&self, samples: Vec<i16>, sample_rate: u32) -> Result<(), VoiceError> {
        self.active.store(true, Ordering::SeqCst);
        self.send(OutputCmd::AppendPcm16 {
            samples,
            sample_rate,
        })
    }

    fn stop(&self) {
        let _ = self.cmd_tx.send(OutputCmd::Stop);
    }

    fn idle(&self) -> bool {
        !self.active.load(Ordering::SeqCst)
    }

    fn take_error(&self) -> Option<String> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(OutputCmd::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_output_thread(
    cmd_rx: crossbeam_channel::Receiver<OutputCmd>,
    ready_tx: Sender<Result<(), VoiceError>>,
    active: Arc<AtomicBool>,
    error: Arc<Mutex<Option<String>>>,
) {
    let (stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(err) => {
            let _ = ready_tx.send(Err(VoiceError::Audio(format!(
                "no output device: {err}"
            ))));
            return;
        }
    };
    let mut sink = match Sink::try_new(&handle) {
        Ok(sink) => sink,
        Err(err) => {
            let _ = ready_tx.send(Err(VoiceError::Audio(format!(
                "cannot create playback sink: {err}"
            ))));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let record_error = |error: &Mutex<Option<String>>, message: String| {
        warn!(error = %message, "playback failure");
        *error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    };

    loop {
        match cmd_rx.recv_timeout(Duration::from_millis(25)) {
            Ok(OutputCmd::PlayEncoded(bytes)) => {
                // One clip at a time: a fresh sink guarantees the previous
                // queue is gone before the new clip starts.
                sink.stop();
                match Sink::try_new(&handle) {
                    Ok(fresh) => sink = fresh,
                    Err(err) => {
                        record_error(&error, format!("cannot recreate sink: {err}"));
                        active.store(false, Ordering::SeqCst);
                        continue;
                    }
                }
                match Decoder::new(Cursor::new(bytes)) {
                    Ok(decoder) => sink.append(decoder.convert_samples::<f32>()),
                    Err(err) => {
                        record_error(&error, format!("clip decode failed: {err}"));
                        active.store(false, Ordering::SeqCst);
                    }
                }
            }
            Ok(OutputCmd::AppendPcm16 {
                samples,
                sample_rate,
            }) => {
                sink.append(SamplesBuffer::new(1, sample_rate, samples));
            }
            Ok(OutputCmd::Stop) => {
                sink.stop();
                if let Ok(fresh) = Sink::try_new(&handle) {
                    sink = fresh;
                }
                active.store(false, Ordering::SeqCst);
            }
            Ok(OutputCmd::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if sink.empty() {
            active.store(false, Ordering::SeqCst);
        }
    }
    sink.stop();
    drop(stream);
    debug!("output stream released");
}

/// Drives one playback to completion and reports how it ended.
///
/// Owns the exactly-one-playback rule at the session level: `play_to_end`
/// replaces any current clip, and `interrupt` is the barge-in path.
pub struct PlaybackController {
    output: Arc<dyn AudioOutput>,
    poll: Duration,
}

impl PlaybackController {
    pub fn new(output: Arc<dyn AudioOutput>, poll: Duration) -> Self {
        Self { output, poll }
    }

    /// Play an encoded clip and resolve when the queue drains.
    ///
    /// # Errors
    ///
    /// `Playback` when the clip could not be decoded or rendered; the state
    /// machine treats this exactly like completion, the caller surfaces the
    /// distinct signal.
    pub async fn play_to_end(&self, bytes: Vec<u8>) -> Result<(), VoiceError> {
        self.output.play_encoded(bytes)?;
        self.wait_drained().await
    }

    /// Resolve once the current queue (if any) has drained.
    pub async fn wait_drained(&self) -> Result<(), VoiceError> {
        loop {
            if self.output.idle() {
                return match self.output.take_error() {
                    Some(message) => Err(VoiceError::Playback(message)),
                    None => Ok(()),
                };
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Cut the current playback (explicit stop or barge-in).
    pub fn interrupt(&self) {
        self.output.stop();
    }
}
