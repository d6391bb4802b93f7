//! End-to-end session behavior against scripted devices and collaborators.
//!
//! Timings are compressed (10 ms level polls, 80–200 ms silence windows) so
//! the suite exercises real wall-clock gating without being slow.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_channel::{unbounded, Sender};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use iasted::audio::input::{AudioInput, FrameStream};
use iasted::audio::output::AudioOutput;
use iasted::remote::{ChatMessage, Completer, Synthesizer, Transcriber};
use iasted::session::{Collaborators, Transport, VoiceSession};
use iasted::{
    Notice, Notifier, RemoteServiceKind, Role, TurnStrategy, VoiceConfig, VoiceError, VoiceState,
};

// --- scripted microphone -------------------------------------------------

#[derive(Default)]
struct MicState {
    sender: Option<Sender<Vec<f32>>>,
    starts: usize,
    stops: usize,
    active: bool,
    fail_start: bool,
}

#[derive(Clone, Default)]
struct ScriptedMic(Arc<Mutex<MicState>>);

impl ScriptedMic {
    fn input(&self) -> MicInput {
        MicInput(self.clone())
    }

    fn push(&self, frame: Vec<f32>) {
        let sender = self.0.lock().unwrap().sender.clone();
        if let Some(sender) = sender {
            let _ = sender.send(frame);
        }
    }

    /// Deliver ~`ms` of audible speech, one frame per 10 ms.
    async fn speak_for(&self, ms: u64) {
        for _ in 0..(ms / 10).max(1) {
            self.push(vec![0.3f32; 160]);
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Deliver ~`ms` of room silence.
    async fn quiet_for(&self, ms: u64) {
        for _ in 0..(ms / 10).max(1) {
            self.push(vec![0.0f32; 160]);
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn starts(&self) -> usize {
        self.0.lock().unwrap().starts
    }

    fn active(&self) -> bool {
        self.0.lock().unwrap().active
    }

    fn set_fail_start(&self, fail: bool) {
        self.0.lock().unwrap().fail_start = fail;
    }
}

struct MicInput(ScriptedMic);

impl AudioInput for MicInput {
    fn start(&mut self) -> Result<FrameStream, VoiceError> {
        let mut state = self.0 .0.lock().unwrap();
        if state.fail_start {
            return Err(VoiceError::PermissionDenied("refused by test".into()));
        }
        let (tx, rx) = unbounded();
        state.sender = Some(tx);
        state.starts += 1;
        state.active = true;
        Ok(FrameStream {
            frames: rx,
            sample_rate: 16_000,
            channels: 1,
        })
    }

    fn stop(&mut self) {
        let mut state = self.0 .0.lock().unwrap();
        if state.active {
            state.stops += 1;
        }
        state.active = false;
        state.sender = None;
    }

    fn is_active(&self) -> bool {
        self.0 .0.lock().unwrap().active
    }
}

// --- scripted speaker ----------------------------------------------------

#[derive(Default)]
struct SpeakerState {
    active: bool,
    error: Option<String>,
    fail_next_play: bool,
    plays: usize,
}

#[derive(Clone)]
struct FakeSpeaker {
    state: Arc<Mutex<SpeakerState>>,
    drain: Duration,
}

impl FakeSpeaker {
    fn new(drain_ms: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SpeakerState::default())),
            drain: Duration::from_millis(drain_ms),
        }
    }

    fn plays(&self) -> usize {
        self.state.lock().unwrap().plays
    }

    fn fail_next_play(&self) {
        self.state.lock().unwrap().fail_next_play = true;
    }
}

impl AudioOutput for FakeSpeaker {
    fn play_encoded(&self, _bytes: Vec<u8>) -> Result<(), VoiceError> {
        let mut state = self.state.lock().unwrap();
        state.plays += 1;
        if state.fail_next_play {
            state.fail_next_play = false;
            state.error = Some("decode failed by test".into());
            state.active = false;
            return Ok(());
        }
        state.active = true;
        drop(state);
        let state = Arc::clone(&self.state);
        let drain = self.drain;
        std::thread::spawn(move || {
            std::thread::sleep(drain);
            state.lock().unwrap().active = false;
        });
        Ok(())
    }

    fn append_pcm16(&self, _samples: Vec<i16>, _rate: u32) -> Result<(), VoiceError> {
        Ok(())
    }

    fn stop(&self) {
        self.state.lock().unwrap().active = false;
    }

    fn idle(&self) -> bool {
        !self.state.lock().unwrap().active
    }

    fn take_error(&self) -> Option<String> {
        self.state.lock().unwrap().error.take()
    }
}

// --- scripted collaborators ----------------------------------------------

struct MockTranscriber {
    text: String,
    fail: Option<RemoteServiceKind>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockTranscriber {
    fn returning(text: &str) -> Self {
        Self {
            text: text.into(),
            fail: None,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _wav: &[u8]) -> Result<String, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        match self.fail {
            Some(kind) => Err(VoiceError::remote(kind, "scripted failure")),
            None => Ok(self.text.clone()),
        }
    }
}

struct MockCompleter {
    reply: String,
    fail: Option<RemoteServiceKind>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockCompleter {
    fn returning(reply: &str) -> Self {
        Self {
            reply: reply.into(),
            fail: None,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Completer for MockCompleter {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        match self.fail {
            Some(kind) => Err(VoiceError::remote(kind, "scripted failure")),
            None => Ok(self.reply.clone()),
        }
    }
}

struct MockSynthesizer {
    calls: Arc<AtomicUsize>,
}

impl MockSynthesizer {
    fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0u8; 64])
    }
}

// --- harness --------------------------------------------------------------

fn fast_cfg() -> VoiceConfig {
    VoiceConfig {
        silence_threshold: 10,
        silence_window_ms: 80,
        level_poll_ms: 10,
        min_capture_ms: 0,
        max_capture_ms: 5_000,
        playback_poll_ms: 5,
        sound_effects: false,
        ..VoiceConfig::default()
    }
}

struct Harness {
    session: VoiceSession,
    mic: ScriptedMic,
    speaker: FakeSpeaker,
    notices: UnboundedReceiver<Notice>,
}

impl Harness {
    fn spawn(cfg: VoiceConfig, collaborators: Collaborators) -> Self {
        Self::spawn_with_transport(cfg, Transport::TurnBased(collaborators))
    }

    fn spawn_with_transport(cfg: VoiceConfig, transport: Transport) -> Self {
        let mic = ScriptedMic::default();
        let speaker = FakeSpeaker::new(50);
        let (notifier, notices) = Notifier::channel();
        let session = VoiceSession::spawn(
            cfg,
            transport,
            Box::new(mic.input()),
            Arc::new(speaker.clone()),
            notifier,
        );
        Self {
            session,
            mic,
            speaker,
            notices,
        }
    }

    async fn wait_for_state(&self, want: VoiceState, ms: u64) {
        let mut rx = self.session.state_watch();
        let result = timeout(Duration::from_millis(ms), async {
            loop {
                if *rx.borrow_and_update() == want {
                    return;
                }
                if rx.changed().await.is_err() {
                    panic!("state channel closed while waiting for {want:?}");
                }
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "timed out waiting for {want:?}; current state is {:?}",
            self.session.state()
        );
    }

    fn drain_notices(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }
}

fn collaborators(
    transcriber: MockTranscriber,
    completer: MockCompleter,
    synthesizer: MockSynthesizer,
) -> Collaborators {
    Collaborators {
        transcriber: Arc::new(transcriber),
        completer: Arc::new(completer),
        synthesizer: Arc::new(synthesizer),
    }
}

// --- scenarios -------------------------------------------------------------

#[tokio::test]
async fn bonjour_roundtrip_ends_idle_with_both_turns() {
    let transcriber = MockTranscriber::returning("bonjour");
    let completer = MockCompleter::returning("Bonjour, comment puis-je vous aider ?");
    let synthesizer = MockSynthesizer::new();
    let synth_calls = Arc::clone(&synthesizer.calls);
    let mut harness = Harness::spawn(fast_cfg(), collaborators(transcriber, completer, synthesizer));

    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;

    harness.mic.speak_for(60).await;
    let history_task = async {
        harness.wait_for_state(VoiceState::Speaking, 2_000).await;
        harness.session.history().await
    };
    let quiet_task = harness.mic.quiet_for(200);
    let (history, ()) = tokio::join!(history_task, quiet_task);

    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "bonjour");
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, "Bonjour, comment puis-je vous aider ?");

    harness.wait_for_state(VoiceState::Idle, 2_000).await;
    assert_eq!(synth_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.speaker.plays(), 1);
    assert!(!harness.mic.active(), "microphone must be released at idle");
    assert!(
        harness.drain_notices().is_empty(),
        "clean roundtrip posts no notices"
    );
}

#[tokio::test]
async fn continuous_mode_rearms_capture_after_playback() {
    let cfg = VoiceConfig {
        continuous: true,
        ..fast_cfg()
    };
    let harness = Harness::spawn(
        cfg,
        collaborators(
            MockTranscriber::returning("bonjour"),
            MockCompleter::returning("Oui ?"),
            MockSynthesizer::new(),
        ),
    );

    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;
    assert_eq!(harness.mic.starts(), 1);

    harness.mic.speak_for(60).await;
    harness.mic.quiet_for(200).await;

    // Playback ends, and listening re-arms with a fresh acquisition.
    harness.wait_for_state(VoiceState::Speaking, 2_000).await;
    harness.wait_for_state(VoiceState::Listening, 2_000).await;
    assert_eq!(harness.mic.starts(), 2, "microphone must be reacquired");
    assert!(harness.mic.active());

    harness.session.stop();
    harness.wait_for_state(VoiceState::Idle, 1_000).await;
    assert!(!harness.mic.active());
}

#[tokio::test]
async fn non_continuous_mode_does_not_reacquire() {
    let harness = Harness::spawn(
        fast_cfg(),
        collaborators(
            MockTranscriber::returning("bonjour"),
            MockCompleter::returning("Oui ?"),
            MockSynthesizer::new(),
        ),
    );
    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;
    harness.mic.speak_for(60).await;
    harness.mic.quiet_for(200).await;
    harness.wait_for_state(VoiceState::Idle, 3_000).await;
    assert_eq!(harness.mic.starts(), 1, "no reacquisition in one-shot mode");
}

#[tokio::test]
async fn stop_is_idempotent() {
    let mut harness = Harness::spawn(
        fast_cfg(),
        collaborators(
            MockTranscriber::returning("x"),
            MockCompleter::returning("y"),
            MockSynthesizer::new(),
        ),
    );
    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;

    harness.session.stop();
    harness.wait_for_state(VoiceState::Idle, 1_000).await;
    let after_first = (harness.session.state(), harness.mic.active());

    harness.session.stop();
    sleep(Duration::from_millis(50)).await;
    let after_second = (harness.session.state(), harness.mic.active());

    assert_eq!(after_first, after_second);
    assert_eq!(after_second, (VoiceState::Idle, false));
    assert!(harness.drain_notices().is_empty(), "stop is not an error");
}

#[tokio::test]
async fn late_reply_after_stop_never_changes_state() {
    let mut transcriber = MockTranscriber::returning("bonjour");
    transcriber.delay = Duration::from_millis(200);
    let completer = MockCompleter::returning("trop tard");
    let completer_calls = Arc::clone(&completer.calls);
    let harness = Harness::spawn(
        fast_cfg(),
        collaborators(transcriber, completer, MockSynthesizer::new()),
    );

    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;
    harness.mic.speak_for(60).await;
    harness.mic.quiet_for(150).await;
    harness.wait_for_state(VoiceState::Thinking, 1_000).await;

    harness.session.stop();
    harness.wait_for_state(VoiceState::Idle, 1_000).await;

    // Let the delayed transcription resolve; its epoch is stale.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(harness.session.state(), VoiceState::Idle);
    assert!(harness.session.history().await.is_empty());
    assert_eq!(
        completer_calls.load(Ordering::SeqCst),
        0,
        "stale turn must not continue down the chain"
    );
}

#[tokio::test]
async fn push_to_talk_submits_once_and_ignores_repeat() {
    let cfg = VoiceConfig {
        strategy: TurnStrategy::PushToTalk,
        ..fast_cfg()
    };
    let transcriber = MockTranscriber::returning("bonjour");
    let transcriber_calls = Arc::clone(&transcriber.calls);
    let mut completer = MockCompleter::returning("Oui ?");
    completer.delay = Duration::from_millis(150);
    let completer_calls = Arc::clone(&completer.calls);
    let harness = Harness::spawn(
        cfg,
        collaborators(transcriber, completer, MockSynthesizer::new()),
    );

    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;
    harness.mic.speak_for(60).await;

    harness.session.finish_turn();
    harness.wait_for_state(VoiceState::Thinking, 1_000).await;
    // A second submit while the first is unresolved must be ignored.
    harness.session.finish_turn();
    harness.session.finish_turn();

    harness.wait_for_state(VoiceState::Idle, 3_000).await;
    assert_eq!(transcriber_calls.load(Ordering::SeqCst), 1);
    assert_eq!(completer_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn renewed_speech_cancels_pending_auto_submit() {
    let cfg = VoiceConfig {
        silence_window_ms: 200,
        ..fast_cfg()
    };
    let transcriber = MockTranscriber::returning("bonjour");
    let transcriber_calls = Arc::clone(&transcriber.calls);
    let harness = Harness::spawn(
        cfg,
        collaborators(
            transcriber,
            MockCompleter::returning("Oui ?"),
            MockSynthesizer::new(),
        ),
    );

    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;

    harness.mic.speak_for(50).await;
    harness.mic.quiet_for(100).await; // window opens, not yet elapsed
    harness.mic.speak_for(150).await; // debounce: window cancelled
    assert_eq!(harness.session.state(), VoiceState::Listening);
    assert_eq!(transcriber_calls.load(Ordering::SeqCst), 0);

    harness.mic.quiet_for(300).await; // full window elapses
    harness.wait_for_state(VoiceState::Thinking, 1_000).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        transcriber_calls.load(Ordering::SeqCst),
        1,
        "exactly one auto-submit"
    );
}

#[tokio::test]
async fn empty_transcription_is_silent_and_appends_nothing() {
    let transcriber = MockTranscriber::returning("   ");
    let completer = MockCompleter::returning("ne devrait pas arriver");
    let completer_calls = Arc::clone(&completer.calls);
    let mut harness = Harness::spawn(
        fast_cfg(),
        collaborators(transcriber, completer, MockSynthesizer::new()),
    );

    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;
    harness.mic.speak_for(60).await;
    harness.mic.quiet_for(200).await;
    harness.wait_for_state(VoiceState::Idle, 2_000).await;

    assert!(harness.session.history().await.is_empty());
    assert_eq!(completer_calls.load(Ordering::SeqCst), 0);
    assert!(
        harness.drain_notices().is_empty(),
        "no speech is not an error"
    );
}

#[tokio::test]
async fn empty_transcription_in_continuous_mode_relistens() {
    let cfg = VoiceConfig {
        continuous: true,
        ..fast_cfg()
    };
    let harness = Harness::spawn(
        cfg,
        collaborators(
            MockTranscriber::returning(""),
            MockCompleter::returning("x"),
            MockSynthesizer::new(),
        ),
    );
    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;
    harness.mic.speak_for(60).await;
    harness.mic.quiet_for(200).await;
    harness.wait_for_state(VoiceState::Thinking, 1_000).await;
    harness.wait_for_state(VoiceState::Listening, 2_000).await;
    assert!(harness.mic.active(), "capture re-armed after empty result");
    harness.session.stop();
}

#[tokio::test]
async fn silent_clip_is_discarded_without_remote_calls() {
    let cfg = VoiceConfig {
        strategy: TurnStrategy::PushToTalk,
        ..fast_cfg()
    };
    let transcriber = MockTranscriber::returning("bonjour");
    let transcriber_calls = Arc::clone(&transcriber.calls);
    let harness = Harness::spawn(
        cfg,
        collaborators(
            transcriber,
            MockCompleter::returning("x"),
            MockSynthesizer::new(),
        ),
    );
    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;
    harness.mic.quiet_for(80).await;
    harness.session.finish_turn();
    harness.wait_for_state(VoiceState::Idle, 1_000).await;
    assert_eq!(
        transcriber_calls.load(Ordering::SeqCst),
        0,
        "a clip with no speech never reaches the transcriber"
    );
}

#[tokio::test]
async fn rate_limit_failure_surfaces_specific_notice_and_idles() {
    let mut completer = MockCompleter::returning("x");
    completer.fail = Some(RemoteServiceKind::RateLimited);
    let mut harness = Harness::spawn(
        fast_cfg(),
        collaborators(
            MockTranscriber::returning("bonjour"),
            completer,
            MockSynthesizer::new(),
        ),
    );

    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;
    harness.mic.speak_for(60).await;
    harness.mic.quiet_for(200).await;
    harness.wait_for_state(VoiceState::Idle, 2_000).await;

    let notices = harness.drain_notices();
    assert_eq!(notices.len(), 1);
    assert!(
        notices[0].message.contains("saturé"),
        "rate-limit message must be specific, got: {}",
        notices[0].message
    );
    assert!(harness.session.history().await.is_empty());
}

#[tokio::test]
async fn permission_denied_surfaces_and_stays_idle() {
    let mut harness = Harness::spawn(
        fast_cfg(),
        collaborators(
            MockTranscriber::returning("x"),
            MockCompleter::returning("y"),
            MockSynthesizer::new(),
        ),
    );
    harness.mic.set_fail_start(true);

    harness.session.start();
    harness.wait_for_state(VoiceState::Idle, 1_000).await;

    let notices = harness.drain_notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].message.contains("micro"));
    assert!(!harness.mic.active());

    // The session remains usable: a later start succeeds.
    harness.mic.set_fail_start(false);
    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;
    harness.session.stop();
}

#[tokio::test]
async fn playback_failure_is_distinct_but_advances_like_completion() {
    let mut harness = Harness::spawn(
        fast_cfg(),
        collaborators(
            MockTranscriber::returning("bonjour"),
            MockCompleter::returning("Oui ?"),
            MockSynthesizer::new(),
        ),
    );
    harness.speaker.fail_next_play();

    harness.session.start();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;
    harness.mic.speak_for(60).await;
    harness.mic.quiet_for(200).await;

    // Never stuck in speaking: the failure counts as playback end.
    harness.wait_for_state(VoiceState::Idle, 3_000).await;
    let notices = harness.drain_notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].message.contains("lecture"));
}

#[tokio::test]
async fn toggle_starts_then_stops() {
    let harness = Harness::spawn(
        fast_cfg(),
        collaborators(
            MockTranscriber::returning("x"),
            MockCompleter::returning("y"),
            MockSynthesizer::new(),
        ),
    );
    harness.session.toggle();
    harness.wait_for_state(VoiceState::Listening, 1_000).await;
    harness.session.toggle();
    harness.wait_for_state(VoiceState::Idle, 1_000).await;
    assert!(!harness.mic.active());
}

#[tokio::test]
async fn realtime_credential_failure_returns_idle() {
    struct FailingIssuer;

    #[async_trait]
    impl iasted::remote::CredentialIssuer for FailingIssuer {
        async fn issue(&self) -> Result<iasted::remote::RealtimeCredential, VoiceError> {
            Err(VoiceError::TransportSetup("credential endpoint down".into()))
        }
    }

    let cfg = VoiceConfig {
        transport: iasted::TransportMode::RealtimeChannel,
        ..fast_cfg()
    };
    let mut harness = Harness::spawn_with_transport(
        cfg,
        Transport::Realtime {
            issuer: Arc::new(FailingIssuer),
        },
    );

    harness.session.start();
    harness.wait_for_state(VoiceState::Idle, 1_000).await;
    let notices = harness.drain_notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].message.contains("Connexion"));
    assert!(!harness.mic.active());
}

// Arbitrary command sequences always settle back to idle with the
// microphone released once a final stop lands.
#[tokio::test]
async fn command_storms_always_settle_idle_and_released() {
    let sequences: Vec<Vec<u8>> = vec![
        vec![0, 1],
        vec![0, 0, 1, 1],
        vec![2, 2, 2],
        vec![0, 2, 0, 1, 2],
        vec![1, 1, 0, 3, 1],
        vec![0, 3, 3, 2, 1, 0, 1],
        vec![2, 0, 1, 2, 1, 2, 0, 2],
    ];
    for sequence in sequences {
        let harness = Harness::spawn(
            fast_cfg(),
            collaborators(
                MockTranscriber::returning("bonjour"),
                MockCompleter::returning("Oui ?"),
                MockSynthesizer::new(),
            ),
        );
        for command in &sequence {
            match command {
                0 => harness.session.start(),
                1 => harness.session.stop(),
                2 => harness.session.toggle(),
                _ => harness.session.finish_turn(),
            }
            sleep(Duration::from_millis(15)).await;
        }
        harness.session.stop();
        harness.wait_for_state(VoiceState::Idle, 1_000).await;
        sleep(Duration::from_millis(30)).await;
        assert_eq!(
            harness.session.state(),
            VoiceState::Idle,
            "sequence {sequence:?} must settle idle"
        );
        assert!(
            !harness.mic.active(),
            "sequence {sequence:?} leaked the microphone"
        );
        assert!(harness.session.history().await.is_empty());
        harness.session.shutdown().await;
    }
}
