//! The session manager: single authority for `VoiceState` and the only
//! mutator of conversation history.
//!
//! Runs as an actor task. Commands arrive over a channel; capture, the
//! remote turn chain, playback, and the realtime channel all run as
//! subtasks that report back with the epoch they were spawned under.
//! Anything reporting a stale epoch is discarded, which is what makes
//! `stop()` safe mid-connect, mid-transcription, and mid-playback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::input::{AudioInput, FrameStream};
use crate::audio::output::{AudioOutput, PlaybackController};
use crate::audio::{resample, wav};
use crate::config::VoiceConfig;
use crate::error::{RemoteServiceKind, VoiceError};
use crate::history::{ConversationHistory, Utterance};
use crate::meter;
use crate::notify::Notifier;
use crate::realtime::{self, ChannelEvent, ChannelSignal, RealtimeChannel, RealtimeHandle};
use crate::remote::{ChatMessage, Completer, CredentialIssuer, Synthesizer, Transcriber};
use crate::sound::{Earcon, SoundEffects};
use crate::state::{transition_allowed, TransportMode, VoiceState};
use crate::turn::{GateConfig, GateDecision, SilenceGate, TurnStrategy};
use crate::vad::{self, VadDecision, VadEngine};

/// PCM rate of the realtime channel in both directions.
const REALTIME_SAMPLE_RATE: u32 = 24_000;

/// Credential fetch plus channel handshake must finish within this window
/// or the attempt fails; the session must never sit in connecting.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Injected collaborators for the turn-based transport.
#[derive(Clone)]
pub struct Collaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub completer: Arc<dyn Completer>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

/// Transport selection, carrying whatever the mode needs.
pub enum Transport {
    TurnBased(Collaborators),
    Realtime { issuer: Arc<dyn CredentialIssuer> },
}

impl Transport {
    fn mode(&self) -> TransportMode {
        match self {
            Transport::TurnBased(_) => TransportMode::TurnBased,
            Transport::Realtime { .. } => TransportMode::RealtimeChannel,
        }
    }
}

/// Observable session happenings for the hosting surface.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(VoiceState),
    /// Input level on the 0–100 scale, emitted while capturing.
    Level(u8),
    UserTurn(String),
    AssistantTurn(String),
}

enum Command {
    Start,
    Stop,
    Toggle,
    FinishTurn,
    History(tokio::sync::oneshot::Sender<Vec<Utterance>>),
    Shutdown,
}

struct Clip {
    samples: Vec<f32>,
    sample_rate: u32,
    speech_seen: bool,
}

enum TurnOutcome {
    Reply {
        user_text: String,
        reply_text: String,
        audio: Vec<u8>,
    },
    NoSpeech,
}

enum Internal {
    CaptureLevel {
        epoch: u64,
        level: u8,
    },
    CaptureDone {
        epoch: u64,
        clip: Clip,
    },
    Connected {
        epoch: u64,
        result: Result<(RealtimeHandle, mpsc::UnboundedReceiver<ChannelSignal>), VoiceError>,
    },
    TurnResolved {
        epoch: u64,
        outcome: Result<TurnOutcome, VoiceError>,
    },
    PlaybackDone {
        epoch: u64,
        result: Result<(), VoiceError>,
    },
    Channel {
        epoch: u64,
        signal: ChannelSignal,
    },
}

#[derive(Default)]
struct CaptureControl {
    cancel: AtomicBool,
    submit: AtomicBool,
}

/// Handle to a running session actor.
///
/// Commands are fire-and-forget; observe effects through the state watch
/// and the event stream. Dropping the handle shuts the actor down.
pub struct VoiceSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<VoiceState>,
    event_tx: broadcast::Sender<SessionEvent>,
    task: Option<JoinHandle<()>>,
}

impl VoiceSession {
    /// Build and spawn the actor.
    pub fn spawn(
        cfg: VoiceConfig,
        transport: Transport,
        input: Box<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
        notifier: Notifier,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(VoiceState::Idle);
        let (event_tx, _) = broadcast::channel(64);

        let sounds = SoundEffects::new(Arc::clone(&output), cfg.sound_effects);
        let core = SessionCore {
            cfg,
            transport,
            input,
            output,
            sounds,
            notifier,
            state: VoiceState::Idle,
            state_tx,
            event_tx: event_tx.clone(),
            internal_tx,
            epoch: 0,
            history: ConversationHistory::new(),
            capture_ctl: None,
            turn_task: None,
            channel: None,
            pending_reply: None,
        };
        let task = tokio::spawn(core.run(cmd_rx, internal_rx));

        Self {
            cmd_tx,
            state_rx,
            event_tx,
            task: Some(task),
        }
    }

    pub fn start(&self) {
        let _ = self.cmd_tx.send(Command::Start);
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    pub fn toggle(&self) {
        let _ = self.cmd_tx.send(Command::Toggle);
    }

    /// Close the current turn explicitly (push-to-talk stop).
    pub fn finish_turn(&self) {
        let _ = self.cmd_tx.send(Command::FinishTurn);
    }

    /// Snapshot of the conversation so far (empty once the session ends).
    pub async fn history(&self) -> Vec<Utterance> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        if self.cmd_tx.send(Command::History(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub fn state(&self) -> VoiceState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<VoiceState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Tear the session down and wait for the actor to finish.
    pub async fn shutdown(mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

struct SessionCore {
    cfg: VoiceConfig,
    transport: Transport,
    input: Box<dyn AudioInput>,
    output: Arc<dyn AudioOutput>,
    sounds: SoundEffects,
    notifier: Notifier,
    state: VoiceState,
    state_tx: watch::Sender<VoiceState>,
    event_tx: broadcast::Sender<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    /// Bumped on every start and teardown; subtask results carrying an
    /// older value are ignored.
    epoch: u64,
    history: ConversationHistory,
    capture_ctl: Option<Arc<CaptureControl>>,
    /// In-flight transcribe→complete→synthesize chain, if any.
    turn_task: Option<JoinHandle<()>>,
    channel: Option<RealtimeHandle>,
    pending_reply: Option<String>,
}

impl SessionCore {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(Command::Start) => self.handle_start(),
                    Some(Command::Stop) => self.teardown(true),
                    Some(Command::Toggle) => {
                        if self.state == VoiceState::Idle {
                            self.handle_start();
                        } else {
                            self.teardown(true);
                        }
                    }
                    Some(Command::FinishTurn) => self.handle_finish_turn(),
                    Some(Command::History(reply)) => {
                        let _ = reply.send(self.history.entries().to_vec());
                    }
                    Some(Command::Shutdown) | None => {
                        self.teardown(true);
                        break;
                    }
                },
                Some(message) = internal_rx.recv() => self.handle_internal(message),
            }
        }
        debug!("session actor finished");
    }

    fn set_state(&mut self, next: VoiceState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            transition_allowed(self.state, next),
            "illegal transition {} -> {}",
            self.state.label(),
            next.label()
        );
        debug!(from = self.state.label(), to = next.label(), "state change");
        self.state = next;
        let _ = self.state_tx.send(next);
        let _ = self.event_tx.send(SessionEvent::StateChanged(next));
    }

    fn handle_start(&mut self) {
        if self.state != VoiceState::Idle {
            debug!(state = self.state.label(), "start ignored; session active");
            return;
        }
        self.epoch += 1;
        self.set_state(VoiceState::Connecting);
        info!(epoch = self.epoch, mode = ?self.transport.mode(), "session starting");

        match &self.transport {
            Transport::TurnBased(_) => match self.arm_capture() {
                Ok(()) => {
                    self.sounds.play(Earcon::SessionStart);
                    self.set_state(VoiceState::Listening);
                }
                Err(err) => self.fail(err),
            },
            Transport::Realtime { issuer } => {
                let issuer = Arc::clone(issuer);
                let epoch = self.epoch;
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    // A fresh short-lived credential on every attempt; the
                    // client never holds a reusable secret.
                    let attempt = async {
                        let credential = issuer.issue().await?;
                        RealtimeChannel::connect(&credential).await
                    };
                    let result = match tokio::time::timeout(CONNECT_TIMEOUT, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(VoiceError::TransportSetup(
                            "connection attempt timed out".into(),
                        )),
                    };
                    let _ = tx.send(Internal::Connected { epoch, result });
                });
            }
        }
    }

    fn handle_finish_turn(&mut self) {
        if self.state != VoiceState::Listening {
            debug!(state = self.state.label(), "finish-turn ignored");
            return;
        }
        if self.cfg.strategy != TurnStrategy::PushToTalk {
            // Silence detection and explicit stop are mutually exclusive.
            debug!("finish-turn ignored; session uses silence detection");
            return;
        }
        if let Some(ctl) = &self.capture_ctl {
            ctl.submit.store(true, Ordering::Relaxed);
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::CaptureLevel { epoch, level } => {
                if epoch == self.epoch {
                    let _ = self.event_tx.send(SessionEvent::Level(level));
                }
            }
            Internal::CaptureDone { epoch, clip } => {
                if epoch != self.epoch {
                    return;
                }
                self.handle_capture_done(clip);
            }
            Internal::Connected { epoch, result } => {
                if epoch != self.epoch {
                    // The session moved on while we were connecting; close
                    // the channel if one actually came up.
                    if let Ok((handle, _)) = result {
                        handle.close();
                    }
                    return;
                }
                self.handle_connected(result);
            }
            Internal::TurnResolved { epoch, outcome } => {
                if epoch != self.epoch {
                    debug!("discarding stale turn result");
                    return;
                }
                self.handle_turn_resolved(outcome);
            }
            Internal::PlaybackDone { epoch, result } => {
                if epoch != self.epoch {
                    return;
                }
                self.handle_playback_done(result);
            }
            Internal::Channel { epoch, signal } => {
                if epoch != self.epoch {
                    return;
                }
                self.handle_channel_signal(signal);
            }
        }
    }

    // --- turn-based flow -------------------------------------------------

    fn arm_capture(&mut self) -> Result<(), VoiceError> {
        let stream = self.input.start()?;
        let ctl = Arc::new(CaptureControl::default());
        self.capture_ctl = Some(Arc::clone(&ctl));

        let engine = vad::build_engine(
            self.cfg.vad_engine,
            self.cfg.silence_threshold,
            stream.sample_rate,
            self.cfg.level_poll_ms,
        );
        let strategy = self.cfg.strategy;
        let gate_cfg = self.cfg.gate();
        let poll = self.cfg.level_poll();
        let epoch = self.epoch;
        let tx = self.internal_tx.clone();
        tokio::task::spawn_blocking(move || {
            run_capture_pump(stream, strategy, gate_cfg, engine, poll, ctl, tx, epoch);
        });
        Ok(())
    }

    fn handle_capture_done(&mut self, clip: Clip) {
        if self.state != VoiceState::Listening {
            return;
        }
        // Release the microphone for the thinking/speaking phases so the
        // assistant's own voice can never be captured as user input.
        self.input.stop();
        self.capture_ctl = None;

        let clip_ms = clip.samples.len() as u64 * 1000 / u64::from(clip.sample_rate.max(1));
        if !clip.speech_seen || clip_ms < self.cfg.min_capture_ms {
            debug!(clip_ms, speech = clip.speech_seen, "clip discarded as noise");
            self.resolve_no_speech();
            return;
        }

        let collaborators = match &self.transport {
            Transport::TurnBased(collaborators) => collaborators.clone(),
            Transport::Realtime { .. } => return,
        };
        self.set_state(VoiceState::Thinking);

        let messages = self.chat_messages();
        let target_rate = self.cfg.target_sample_rate;
        let epoch = self.epoch;
        let tx = self.internal_tx.clone();
        self.turn_task = Some(tokio::spawn(async move {
            let outcome = run_turn_chain(collaborators, messages, clip, target_rate).await;
            let _ = tx.send(Internal::TurnResolved { epoch, outcome });
        }));
    }

    fn handle_turn_resolved(&mut self, outcome: Result<TurnOutcome, VoiceError>) {
        self.turn_task = None;
        match outcome {
            Ok(TurnOutcome::Reply {
                user_text,
                reply_text,
                audio,
            }) => {
                self.history.push_user(user_text.clone());
                self.history.push_assistant(reply_text.clone());
                let _ = self.event_tx.send(SessionEvent::UserTurn(user_text));
                let _ = self.event_tx.send(SessionEvent::AssistantTurn(reply_text));
                self.set_state(VoiceState::Speaking);
                self.spawn_playback(audio);
            }
            Ok(TurnOutcome::NoSpeech) => self.resolve_no_speech(),
            Err(err) => self.fail(err),
        }
    }

    fn spawn_playback(&self, audio: Vec<u8>) {
        let controller = PlaybackController::new(Arc::clone(&self.output), self.cfg.playback_poll());
        let epoch = self.epoch;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = controller.play_to_end(audio).await;
            let _ = tx.send(Internal::PlaybackDone { epoch, result });
        });
    }

    fn handle_playback_done(&mut self, result: Result<(), VoiceError>) {
        if let Err(err) = &result {
            // Distinct signal for silent failure, but the state machine
            // advances exactly as if playback completed.
            self.notifier.session_error(err);
        }
        match self.transport.mode() {
            TransportMode::TurnBased => {
                if self.cfg.continuous {
                    match self.arm_capture() {
                        Ok(()) => self.set_state(VoiceState::Listening),
                        Err(err) => self.fail(err),
                    }
                } else {
                    self.set_state(VoiceState::Idle);
                }
            }
            TransportMode::RealtimeChannel => {
                if self.cfg.continuous {
                    // A drain report can trail a barge-in; only leave
                    // speaking if that is still where we are.
                    if self.state == VoiceState::Speaking {
                        self.set_state(VoiceState::Listening);
                    }
                } else {
                    self.teardown(true);
                }
            }
        }
    }

    /// Nothing was said: no history entry, no notice.
    fn resolve_no_speech(&mut self) {
        if self.cfg.continuous {
            match self.arm_capture() {
                Ok(()) => self.set_state(VoiceState::Listening),
                Err(err) => self.fail(err),
            }
        } else {
            self.set_state(VoiceState::Idle);
        }
    }

    fn chat_messages(&self) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.cfg.system_prompt.clone())];
        messages.extend(self.history.entries().iter().map(|utterance| ChatMessage {
            role: utterance.role.as_str().into(),
            content: utterance.content.clone(),
        }));
        messages
    }

    // --- realtime flow ---------------------------------------------------

    fn handle_connected(
        &mut self,
        result: Result<(RealtimeHandle, mpsc::UnboundedReceiver<ChannelSignal>), VoiceError>,
    ) {
        let (handle, mut signal_rx) = match result {
            Ok(pair) => pair,
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        if let Err(err) = handle.send_session_update(
            &self.cfg.system_prompt,
            &self.cfg.remote.realtime_voice,
        ) {
            self.fail(err);
            return;
        }

        let epoch = self.epoch;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                if tx.send(Internal::Channel { epoch, signal }).is_err() {
                    break;
                }
            }
        });

        match self.arm_stream(handle.clone()) {
            Ok(()) => {
                self.channel = Some(handle);
                self.sounds.play(Earcon::SessionStart);
                // Listening is announced by the channel's session-created
                // event; until then we stay in connecting.
            }
            Err(err) => {
                handle.close();
                self.fail(err);
            }
        }
    }

    fn arm_stream(&mut self, handle: RealtimeHandle) -> Result<(), VoiceError> {
        let stream = self.input.start()?;
        let ctl = Arc::new(CaptureControl::default());
        self.capture_ctl = Some(Arc::clone(&ctl));

        let poll = self.cfg.level_poll();
        let epoch = self.epoch;
        let tx = self.internal_tx.clone();
        tokio::task::spawn_blocking(move || {
            run_stream_pump(stream, poll, ctl, handle, tx, epoch);
        });
        Ok(())
    }

    fn handle_channel_signal(&mut self, signal: ChannelSignal) {
        let event = match signal {
            ChannelSignal::Event(event) => event,
            ChannelSignal::Closed(reason) => {
                if self.state.is_active() {
                    let detail = reason.unwrap_or_else(|| "connection lost".into());
                    self.fail(VoiceError::TransportSetup(format!(
                        "channel closed: {detail}"
                    )));
                }
                return;
            }
        };
        match event {
            ChannelEvent::SessionCreated => {
                if self.state == VoiceState::Connecting {
                    self.set_state(VoiceState::Listening);
                }
            }
            ChannelEvent::SpeechStarted => {
                if self.state == VoiceState::Speaking {
                    // Barge-in: the server's VAD heard the user; cut local
                    // playback and listen again.
                    self.output.stop();
                    self.set_state(VoiceState::Listening);
                }
            }
            ChannelEvent::SpeechStopped => {
                if self.state == VoiceState::Listening {
                    self.set_state(VoiceState::Thinking);
                }
            }
            ChannelEvent::UserTranscript { transcript } => {
                let transcript = transcript.trim().to_string();
                if !transcript.is_empty() {
                    self.history.push_user(transcript.clone());
                    let _ = self.event_tx.send(SessionEvent::UserTurn(transcript));
                }
            }
            ChannelEvent::AudioDelta { delta } => match realtime::decode_audio_delta(&delta) {
                Ok(pcm) => {
                    // A delta racing ahead of session-created stays queued
                    // without forcing an illegal transition.
                    if matches!(self.state, VoiceState::Listening | VoiceState::Thinking) {
                        self.set_state(VoiceState::Speaking);
                    }
                    if let Err(err) = self.output.append_pcm16(pcm, REALTIME_SAMPLE_RATE) {
                        warn!(error = %err, "dropping audio delta");
                    }
                }
                Err(err) => warn!(error = %err, "undecodable audio delta"),
            },
            ChannelEvent::AudioDone => {}
            ChannelEvent::ReplyTranscript { transcript } => {
                self.pending_reply = Some(transcript);
            }
            ChannelEvent::ResponseDone => {
                if let Some(reply) = self.pending_reply.take() {
                    let reply = reply.trim().to_string();
                    if !reply.is_empty() {
                        self.history.push_assistant(reply.clone());
                        let _ = self.event_tx.send(SessionEvent::AssistantTurn(reply));
                    }
                }
                // The reply audio is already queued; report back once the
                // sink drains so re-arm timing is signal-driven.
                let controller =
                    PlaybackController::new(Arc::clone(&self.output), self.cfg.playback_poll());
                let epoch = self.epoch;
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = controller.wait_drained().await;
                    let _ = tx.send(Internal::PlaybackDone { epoch, result });
                });
            }
            ChannelEvent::ServiceError { error } => {
                let message = error.message.unwrap_or_else(|| "unspecified".into());
                self.fail(VoiceError::remote(RemoteServiceKind::Service, message));
            }
            ChannelEvent::Unknown => {}
        }
    }

    // --- teardown --------------------------------------------------------

    /// Error path: surface the notice, then release everything.
    fn fail(&mut self, err: VoiceError) {
        warn!(error = %err, "session failure");
        self.notifier.session_error(&err);
        self.teardown(false);
        // Queued after teardown's sink reset; anything queued before it
        // would be cut off unplayed.
        self.sounds.play(Earcon::Failure);
    }

    /// Release every resource and return to idle. Idempotent; safe while
    /// any subtask is still in flight thanks to the epoch bump.
    fn teardown(&mut self, play_end_cue: bool) {
        let was_active = self.state.is_active();
        self.epoch += 1;
        if let Some(ctl) = self.capture_ctl.take() {
            ctl.cancel.store(true, Ordering::Relaxed);
        }
        if let Some(task) = self.turn_task.take() {
            // Do not wait on in-flight remote calls; drop them outright.
            task.abort();
        }
        self.input.stop();
        self.output.stop();
        if let Some(handle) = self.channel.take() {
            handle.close();
        }
        self.pending_reply = None;
        self.history.clear();
        self.set_state(VoiceState::Idle);
        if was_active {
            info!("session released");
            if play_end_cue {
                self.sounds.play(Earcon::SessionEnd);
            }
        }
    }
}

async fn run_turn_chain(
    collaborators: Collaborators,
    mut messages: Vec<ChatMessage>,
    clip: Clip,
    target_rate: u32,
) -> Result<TurnOutcome, VoiceError> {
    let mono = resample::resample(&clip.samples, clip.sample_rate, target_rate);
    let wav_bytes = wav::encode_pcm16_wav(&mono, target_rate);

    let transcript = collaborators.transcriber.transcribe(&wav_bytes).await?;
    let transcript = transcript.trim().to_string();
    if transcript.is_empty() {
        return Ok(TurnOutcome::NoSpeech);
    }

    messages.push(ChatMessage::user(transcript.clone()));
    let reply = collaborators.completer.complete(&messages).await?;
    let audio = collaborators.synthesizer.synthesize(&reply).await?;
    Ok(TurnOutcome::Reply {
        user_text: transcript,
        reply_text: reply,
        audio,
    })
}

/// Blocking capture loop for the turn-based transport.
///
/// Accumulates mono samples, reports levels, and closes the turn via the
/// silence gate or the explicit submit flag. Cancellation discards the
/// capture entirely.
fn run_capture_pump(
    stream: FrameStream,
    strategy: TurnStrategy,
    gate_cfg: GateConfig,
    mut engine: Box<dyn VadEngine>,
    poll: Duration,
    ctl: Arc<CaptureControl>,
    tx: mpsc::UnboundedSender<Internal>,
    epoch: u64,
) {
    let mut gate = match strategy {
        TurnStrategy::SilenceDetect => Some(SilenceGate::new(gate_cfg.clone(), Instant::now())),
        TurnStrategy::PushToTalk => None,
    };
    let mut samples: Vec<f32> = Vec::new();
    let mut speech_seen = false;
    let started = Instant::now();

    loop {
        if ctl.cancel.load(Ordering::Relaxed) {
            return;
        }
        if ctl.submit.load(Ordering::Relaxed) {
            break;
        }
        let decision = match stream.frames.recv_timeout(poll) {
            Ok(frame) => {
                let mono = resample::to_mono(&frame, stream.channels);
                let level = meter::level_from_samples(&mono);
                let _ = tx.send(Internal::CaptureLevel { epoch, level });
                let label = engine.process_frame(&mono);
                if label == VadDecision::Speech {
                    speech_seen = true;
                }
                samples.extend_from_slice(&mono);
                gate.as_mut().map(|g| g.observe(label, Instant::now()))
            }
            Err(RecvTimeoutError::Timeout) => gate.as_mut().map(|g| g.poll(Instant::now())),
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Some(GateDecision::Submit(reason)) = decision {
            debug!(?reason, "turn closed");
            break;
        }
        // Push-to-talk still honors the hard capture cap.
        if gate.is_none() && started.elapsed() >= gate_cfg.max_capture {
            break;
        }
    }

    if ctl.cancel.load(Ordering::Relaxed) {
        return;
    }
    let _ = tx.send(Internal::CaptureDone {
        epoch,
        clip: Clip {
            samples,
            sample_rate: stream.sample_rate,
            speech_seen,
        },
    });
}

/// Blocking capture loop for the realtime transport: frames go straight up
/// the channel; the server's VAD owns turn-taking.
fn run_stream_pump(
    stream: FrameStream,
    poll: Duration,
    ctl: Arc<CaptureControl>,
    handle: RealtimeHandle,
    tx: mpsc::UnboundedSender<Internal>,
    epoch: u64,
) {
    loop {
        if ctl.cancel.load(Ordering::Relaxed) {
            return;
        }
        match stream.frames.recv_timeout(poll) {
            Ok(frame) => {
                let mono = resample::to_mono(&frame, stream.channels);
                let level = meter::level_from_samples(&mono);
                let _ = tx.send(Internal::CaptureLevel { epoch, level });
                let upsampled =
                    resample::resample_linear(&mono, stream.sample_rate, REALTIME_SAMPLE_RATE);
                let pcm: Vec<i16> = upsampled.iter().map(|s| wav::pcm16_from_f32(*s)).collect();
                if handle.send_audio(&pcm).is_err() {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
