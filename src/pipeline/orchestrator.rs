//! The dialogue orchestrator: one state machine per kiosk session.
//!
//! Capture and segmentation run as independent tasks feeding a bounded
//! queue; turns are then processed strictly one at a time:
//!
//! ```text
//! AudioFrameSource → [frames] → TurnSegmenter → [turns] → orchestrator
//!                                                           │
//!   transcribe → retrieve → generate → synthesize → align → play
//! ```

use crate::audio::aligner::PlaybackBufferAligner;
use crate::audio::capture::AudioFrameSource;
use crate::audio::pcm::PcmAudio;
use crate::audio::playback::AudioSink;
use crate::config::{DialogueConfig, KioskConfig, SegmenterConfig};
use crate::error::{KioskError, Result};
use crate::intent::{Intent, IntentRouter};
use crate::knowledge::{KnowledgeRetriever, PassageIndex, RetrievalContext};
use crate::llm::{GenerationError, PromptBuilder, ResponseGenerator};
use crate::pipeline::messages::{AudioFrame, SegmentEvent, Utterance};
use crate::runtime::RuntimeEvent;
use crate::session::{
    ConversationTurn, DialogueState, SessionSettings, SessionState, StageLatencies, TurnStatus,
};
use crate::stt::{Transcriber, WhisperServerTranscriber};
use crate::tts::SpeechSynthesizer;
use crate::vad::TurnSegmenter;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RUNTIME_EVENT_CAPACITY: usize = 64;

/// The external services a turn runs through.
pub struct DialogueServices {
    /// Speech-to-text.
    pub transcriber: Box<dyn Transcriber>,
    /// Context passages for the prompt.
    pub retriever: Box<dyn KnowledgeRetriever>,
    /// Ordered generation providers.
    pub generator: ResponseGenerator,
    /// Two-tier synthesis.
    pub synthesizer: SpeechSynthesizer,
    /// Output device (or file sink).
    pub sink: Box<dyn AudioSink>,
}

/// Listening/Idle hints from the segmenter task. They travel apart from
/// utterances so they never take a slot in the turn queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateHint {
    SpeechStarted,
    Discarded,
}

const STATE_HINT_CAPACITY: usize = 16;

/// Everything decided about a turn before it is spoken.
struct TurnDraft {
    transcript: String,
    intent: Intent,
    context: RetrievalContext,
    reply: String,
    status: TurnStatus,
    provider: Option<String>,
}

impl TurnDraft {
    fn apology(transcript: String, apology: &str, status: TurnStatus) -> Self {
        Self {
            transcript,
            intent: Intent::Unknown,
            context: RetrievalContext::empty(),
            reply: apology.to_owned(),
            status,
            provider: None,
        }
    }
}

/// Drives turns through the pipeline and owns the [`SessionState`].
pub struct DialogueOrchestrator {
    services: DialogueServices,
    prompt: PromptBuilder,
    intents: IntentRouter,
    aligner: PlaybackBufferAligner,
    dialogue: DialogueConfig,
    segmenter: SegmenterConfig,
    frame_queue: usize,
    session: SessionState,
    /// Written only here; read by the segmenter task for echo suppression.
    speaking: Arc<AtomicBool>,
    runtime_tx: broadcast::Sender<RuntimeEvent>,
}

impl DialogueOrchestrator {
    /// Create an orchestrator around already-built services.
    pub fn new(config: &KioskConfig, services: DialogueServices) -> Self {
        let (runtime_tx, _) = broadcast::channel(RUNTIME_EVENT_CAPACITY);
        let session = SessionState::new(SessionSettings::from_config(config));
        info!(
            session_id = %session.session_id,
            providers = ?services.generator.provider_names(),
            primary_voice = services.synthesizer.primary_name().unwrap_or("none"),
            "dialogue session started"
        );
        Self {
            services,
            prompt: PromptBuilder::new(&config.dialogue, &config.generation),
            intents: IntentRouter::new(&config.intents),
            aligner: PlaybackBufferAligner::new(config.audio.sample_width),
            dialogue: config.dialogue.clone(),
            segmenter: config.segmenter.clone(),
            frame_queue: config.audio.frame_queue.max(1),
            session,
            speaking: Arc::new(AtomicBool::new(false)),
            runtime_tx,
        }
    }

    /// Build the standard services from configuration and play replies
    /// through `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Generation`] when no generation provider has a
    /// credential; the kiosk cannot answer anything without one.
    pub fn from_config(config: &KioskConfig, sink: Box<dyn AudioSink>) -> Result<Self> {
        let generator = ResponseGenerator::from_config(&config.generation);
        if generator.is_empty() {
            return Err(KioskError::Generation(GenerationError::NoProviders));
        }
        let services = DialogueServices {
            transcriber: Box::new(WhisperServerTranscriber::new(&config.transcription)),
            retriever: Box::new(PassageIndex::load_or_empty(&config.retrieval)),
            generator,
            synthesizer: SpeechSynthesizer::from_config(&config.synthesis),
            sink,
        };
        Ok(Self::new(config, services))
    }

    /// Session state: history, credential validity, current state.
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Subscribe to runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.runtime_tx.subscribe()
    }

    /// Run the capture → segment → turn loop until `cancel` fires or the
    /// source is exhausted.
    ///
    /// When the source runs dry every queued utterance is answered before
    /// returning. Cancellation returns after the turn in progress; anything
    /// still queued is dropped.
    ///
    /// # Errors
    ///
    /// Returns the audio source's error if capture failed.
    pub async fn run(
        &mut self,
        source: Box<dyn AudioFrameSource>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let stages = cancel.child_token();
        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(self.frame_queue);
        let (turn_tx, mut turn_rx) =
            mpsc::channel::<Utterance>(self.dialogue.utterance_queue.max(1));
        let (hint_tx, mut hint_rx) = mpsc::channel::<StateHint>(STATE_HINT_CAPACITY);

        let capture = {
            let cancel = stages.clone();
            tokio::spawn(async move { source.run(frame_tx, cancel).await })
        };
        let segmenter = {
            let stage = SegmenterStage {
                segmenter: TurnSegmenter::new(&self.segmenter),
                speaking: Arc::clone(&self.speaking),
                runtime_tx: self.runtime_tx.clone(),
            };
            let cancel = stages.clone();
            tokio::spawn(async move { stage.run(frame_rx, turn_tx, hint_tx, cancel).await })
        };

        info!("listening");
        let mut hints_open = true;
        loop {
            // Hints are sent before the utterance they precede, so draining
            // them first keeps Listening ahead of Processing.
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                hint = hint_rx.recv(), if hints_open => match hint {
                    Some(StateHint::SpeechStarted) => {
                        if self.session.state == DialogueState::Idle {
                            self.set_state(DialogueState::Listening);
                        }
                    }
                    Some(StateHint::Discarded) => {
                        if self.session.state == DialogueState::Listening {
                            self.set_state(DialogueState::Idle);
                        }
                    }
                    None => hints_open = false,
                },
                utterance = turn_rx.recv() => match utterance {
                    Some(utterance) => {
                        self.process_utterance(&utterance).await;
                    }
                    None => {
                        info!("audio source finished");
                        break;
                    }
                },
            }
        }

        stages.cancel();
        let _ = segmenter.await;
        match capture.await {
            Ok(result) => result,
            Err(e) => Err(KioskError::Pipeline(format!("capture task failed: {e}"))),
        }
    }

    /// Run one full turn for a segmented utterance.
    ///
    /// Never fails: transcription and generation failures are spoken as an
    /// apology and recorded on the returned turn.
    pub async fn process_utterance(&mut self, utterance: &Utterance) -> ConversationTurn {
        let id = Uuid::new_v4();
        self.set_state(DialogueState::Processing);
        let mut latencies = StageLatencies::default();

        let started = Instant::now();
        let transcription = self.services.transcriber.transcribe(utterance).await;
        latencies.transcription = started.elapsed();

        let draft = match transcription {
            Ok(text) => {
                debug!(
                    ms = latencies.transcription.as_millis() as u64,
                    audio_ms = utterance.duration().as_millis() as u64,
                    "transcription finished"
                );
                self.answer(id, text, &mut latencies).await
            }
            Err(e) => {
                error!(error = %e, "transcription failed");
                self.set_state(DialogueState::Error);
                TurnDraft::apology(
                    String::new(),
                    &self.dialogue.apology,
                    TurnStatus::TranscriptionFailed,
                )
            }
        };

        self.speak_and_record(id, draft, latencies).await
    }

    /// Run one turn from typed text, skipping capture and transcription.
    pub async fn process_text(&mut self, text: &str) -> ConversationTurn {
        let id = Uuid::new_v4();
        self.set_state(DialogueState::Processing);
        let mut latencies = StageLatencies::default();
        let draft = self.answer(id, text.to_owned(), &mut latencies).await;
        self.speak_and_record(id, draft, latencies).await
    }

    /// Scripted reply, or retrieval and generation, for a transcript.
    async fn answer(
        &mut self,
        id: Uuid,
        transcript: String,
        latencies: &mut StageLatencies,
    ) -> TurnDraft {
        let query = transcript.trim().to_owned();
        if query.is_empty() {
            info!("nothing intelligible heard, asking the visitor to repeat");
            return TurnDraft {
                transcript,
                intent: Intent::Unknown,
                context: RetrievalContext::empty(),
                reply: self.dialogue.clarification.clone(),
                status: TurnStatus::EmptyTranscript,
                provider: None,
            };
        }

        info!(turn_id = %id, "visitor: {query}");
        self.emit(RuntimeEvent::Transcript {
            turn_id: id,
            text: query.clone(),
        });

        let intent = self.intents.classify(&query);
        if let Some(reply) = self
            .intents
            .scripted_reply(intent, self.session.history().len())
        {
            info!(turn_id = %id, %intent, "answering from script");
            return TurnDraft {
                transcript: query,
                intent,
                context: RetrievalContext::empty(),
                reply: reply.to_owned(),
                status: TurnStatus::Scripted,
                provider: None,
            };
        }
        debug!(%intent, "routing to retrieval and generation");

        let started = Instant::now();
        let context = self.services.retriever.retrieve(&query).await;
        latencies.retrieval = started.elapsed();
        debug!(
            passages = context.len(),
            best_score = context.best_score().unwrap_or(0.0),
            ms = latencies.retrieval.as_millis() as u64,
            "retrieval finished"
        );

        let history = self.session.recent_messages(self.dialogue.history_turns);
        let request = self
            .prompt
            .build(&query, &context, history, latencies.before_generation());

        let started = Instant::now();
        let result = self
            .services
            .generator
            .generate(&request, &mut self.session.credentials)
            .await;
        latencies.generation = started.elapsed();

        match result {
            Ok(reply) => TurnDraft {
                transcript: query,
                intent,
                context,
                reply: reply.text,
                status: TurnStatus::Completed,
                provider: Some(reply.provider),
            },
            Err(e) => {
                error!(error = %e, "reply generation failed");
                self.set_state(DialogueState::Error);
                TurnDraft {
                    intent,
                    context,
                    ..TurnDraft::apology(query, &self.dialogue.apology, TurnStatus::GenerationFailed)
                }
            }
        }
    }

    /// Synthesize, align and play the reply, then append the turn to history.
    async fn speak_and_record(
        &mut self,
        id: Uuid,
        draft: TurnDraft,
        mut latencies: StageLatencies,
    ) -> ConversationTurn {
        self.set_state(DialogueState::Speaking);
        self.speaking.store(true, Ordering::SeqCst);
        self.emit(RuntimeEvent::Reply {
            turn_id: id,
            text: draft.reply.clone(),
            provider: draft.provider.clone(),
        });

        let started = Instant::now();
        let outcome = self
            .services
            .synthesizer
            .synthesize(&draft.reply, &mut self.session.credentials)
            .await;
        latencies.synthesis = started.elapsed();
        let audio = PcmAudio::new(
            self.aligner.align_vec(outcome.audio.bytes),
            outcome.audio.sample_rate,
        );

        let started = Instant::now();
        if let Err(e) = self.services.sink.play(&audio).await {
            error!(error = %e, "playback failed");
        }
        latencies.playback = started.elapsed();
        self.speaking.store(false, Ordering::SeqCst);

        let turn = ConversationTurn {
            id,
            transcript: draft.transcript,
            intent: draft.intent,
            context: draft.context,
            reply: draft.reply,
            audio,
            latencies,
            status: draft.status,
            provider: draft.provider,
            synthesis_degraded: outcome.degraded,
            completed_at: Utc::now(),
        };

        info!(
            turn_id = %id,
            status = ?turn.status,
            intent = %turn.intent,
            provider = turn.provider.as_deref().unwrap_or("none"),
            stt_ms = latencies.transcription.as_millis() as u64,
            retrieval_ms = latencies.retrieval.as_millis() as u64,
            llm_ms = latencies.generation.as_millis() as u64,
            tts_ms = latencies.synthesis.as_millis() as u64,
            playback_ms = latencies.playback.as_millis() as u64,
            degraded = turn.synthesis_degraded,
            "turn finished"
        );

        self.session.record_turn(turn.clone());
        self.emit(RuntimeEvent::TurnFinished {
            turn_id: id,
            status: turn.status,
            latencies,
            synthesis_degraded: turn.synthesis_degraded,
        });
        self.set_state(DialogueState::Idle);
        turn
    }

    fn set_state(&mut self, to: DialogueState) {
        let from = self.session.state;
        if from == to {
            return;
        }
        debug!("state {from} -> {to}");
        self.session.state = to;
        self.emit(RuntimeEvent::StateChanged { from, to });
    }

    fn emit(&self, event: RuntimeEvent) {
        // No subscribers is fine.
        let _ = self.runtime_tx.send(event);
    }
}

/// Segmentation task state.
struct SegmenterStage {
    segmenter: TurnSegmenter,
    speaking: Arc<AtomicBool>,
    runtime_tx: broadcast::Sender<RuntimeEvent>,
}

impl SegmenterStage {
    /// Drain frames into the segmenter and forward utterances and hints.
    ///
    /// Never awaits the orchestrator: a full turn queue drops the utterance
    /// so the frame queue keeps draining.
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<AudioFrame>,
        tx: mpsc::Sender<Utterance>,
        hints: mpsc::Sender<StateHint>,
        cancel: CancellationToken,
    ) {
        // Set when any part of the current turn overlapped our own playback.
        let mut overlapped = false;

        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(f) => f,
                    None => break,
                },
            };

            let speaking = self.speaking.load(Ordering::SeqCst);
            if speaking && self.segmenter.in_turn() {
                overlapped = true;
            }

            let Some(event) = self.segmenter.observe(&frame) else {
                continue;
            };
            match event {
                SegmentEvent::SpeechStarted => {
                    overlapped = speaking;
                    if !speaking {
                        // Losing a hint under load is harmless.
                        let _ = hints.try_send(StateHint::SpeechStarted);
                    }
                }
                SegmentEvent::SpeechContinuing => {}
                SegmentEvent::TurnDiscarded => {
                    debug!("segment discarded as noise");
                    overlapped = false;
                    let _ = hints.try_send(StateHint::Discarded);
                }
                SegmentEvent::TurnComplete(utterance) => {
                    if std::mem::take(&mut overlapped) {
                        warn!(
                            ms = utterance.duration().as_millis() as u64,
                            "dropping utterance that overlapped playback"
                        );
                        let _ = self.runtime_tx.send(RuntimeEvent::UtteranceDropped {
                            reason: "overlapped playback",
                        });
                        continue;
                    }
                    debug!(
                        ms = utterance.duration().as_millis() as u64,
                        frames = utterance.frames.len(),
                        "utterance complete"
                    );
                    match tx.try_send(utterance) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!("turn queue full, dropping utterance");
                            let _ = self.runtime_tx.send(RuntimeEvent::UtteranceDropped {
                                reason: "turn queue full",
                            });
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::audio::replay::WavReplaySource;
    use crate::llm::{GenerationProvider, GenerationRequest, ProviderError};
    use crate::stt::TranscriptionError;
    use crate::tts::{LocalSynthesizer, SynthesisBackend, SynthesisError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FixedTranscriber(std::result::Result<String, TranscriptionError>);

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, _u: &Utterance) -> std::result::Result<String, TranscriptionError> {
            self.0.clone()
        }
    }

    struct NoKnowledge;

    #[async_trait]
    impl KnowledgeRetriever for NoKnowledge {
        async fn retrieve(&self, _query: &str) -> RetrievalContext {
            RetrievalContext::empty()
        }
    }

    struct Canned(Option<&'static str>);

    #[async_trait]
    impl GenerationProvider for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> std::result::Result<String, ProviderError> {
            self.0
                .map(str::to_owned)
                .ok_or_else(|| ProviderError::Network("down".into()))
        }
    }

    struct BrokenPrimary;

    #[async_trait]
    impl SynthesisBackend for BrokenPrimary {
        fn name(&self) -> &str {
            "remote"
        }

        async fn synthesize(&self, _text: &str) -> std::result::Result<PcmAudio, SynthesisError> {
            Err(SynthesisError::QuotaExhausted("429".into()))
        }
    }

    /// Emits an odd-length buffer, as some backends do.
    struct OddLocal;

    #[async_trait]
    impl LocalSynthesizer for OddLocal {
        async fn synthesize(&self, _text: &str) -> PcmAudio {
            PcmAudio::new(vec![1, 0, 2, 0, 3], 16_000)
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<PcmAudio>>>);

    #[async_trait]
    impl AudioSink for Recorder {
        async fn play(&mut self, audio: &PcmAudio) -> Result<()> {
            self.0.lock().unwrap().push(audio.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AudioSink for FailingSink {
        async fn play(&mut self, _audio: &PcmAudio) -> Result<()> {
            Err(KioskError::Audio("device unplugged".into()))
        }
    }

    fn orchestrator(
        transcript: std::result::Result<&str, TranscriptionError>,
        reply: Option<&'static str>,
        sink: Box<dyn AudioSink>,
    ) -> DialogueOrchestrator {
        orchestrator_with(&KioskConfig::default(), transcript, reply, sink)
    }

    fn orchestrator_with(
        config: &KioskConfig,
        transcript: std::result::Result<&str, TranscriptionError>,
        reply: Option<&'static str>,
        sink: Box<dyn AudioSink>,
    ) -> DialogueOrchestrator {
        let services = DialogueServices {
            transcriber: Box::new(FixedTranscriber(transcript.map(str::to_owned))),
            retriever: Box::new(NoKnowledge),
            generator: ResponseGenerator::new(vec![Box::new(Canned(reply))]),
            synthesizer: SpeechSynthesizer::new(Some(Box::new(BrokenPrimary)), Box::new(OddLocal)),
            sink,
        };
        DialogueOrchestrator::new(config, services)
    }

    fn utterance() -> Utterance {
        let now = Instant::now();
        Utterance {
            frames: vec![AudioFrame {
                seq: 0,
                samples: vec![4000; 1600],
                sample_rate: 16_000,
                captured_at: now,
            }],
            started_at: now,
            ended_at: now,
        }
    }

    #[tokio::test]
    async fn pool_question_end_to_end() {
        let recorder = Recorder::default();
        let mut orch = orchestrator(
            Ok("what time does the pool close"),
            Some("The pool closes at 10pm"),
            Box::new(recorder.clone()),
        );

        let turn = orch.process_utterance(&utterance()).await;

        assert_eq!(turn.reply, "The pool closes at 10pm");
        assert_eq!(turn.transcript, "what time does the pool close");
        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(turn.audio.len() % 2, 0);
        assert_eq!(turn.audio.len(), 4);
        assert!(turn.synthesis_degraded);
        assert_eq!(turn.provider.as_deref(), Some("canned"));
        assert_eq!(orch.session().history().len(), 1);
        assert_eq!(orch.session().state, DialogueState::Idle);
        assert_eq!(recorder.0.lock().unwrap()[0].len(), 4);
    }

    #[tokio::test]
    async fn transcription_failure_speaks_apology() {
        let mut orch = orchestrator(
            Err(TranscriptionError::Unavailable("connection refused".into())),
            Some("unused"),
            Box::new(Recorder::default()),
        );
        let mut events = orch.subscribe();

        let turn = orch.process_utterance(&utterance()).await;
        assert_eq!(turn.status, TurnStatus::TranscriptionFailed);
        assert_eq!(turn.reply, DialogueConfig::default().apology);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RuntimeEvent::StateChanged { to, .. } = event {
                states.push(to);
            }
        }
        assert_eq!(
            states,
            vec![
                DialogueState::Processing,
                DialogueState::Error,
                DialogueState::Speaking,
                DialogueState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn generation_failure_speaks_apology_and_keeps_history_clean() {
        let mut orch = orchestrator(
            Ok("¿Dónde está el gimnasio?"),
            None,
            Box::new(Recorder::default()),
        );
        let turn = orch.process_utterance(&utterance()).await;
        assert_eq!(turn.status, TurnStatus::GenerationFailed);
        assert_eq!(turn.transcript, "¿Dónde está el gimnasio?");
        assert_eq!(turn.intent, Intent::Info);
        assert!(!turn.audio.is_empty());
        assert!(orch.session().recent_messages(5).is_empty());
    }

    #[tokio::test]
    async fn empty_transcript_asks_to_repeat() {
        let mut orch = orchestrator(Ok("  "), Some("unused"), Box::new(Recorder::default()));
        let turn = orch.process_utterance(&utterance()).await;
        assert_eq!(turn.status, TurnStatus::EmptyTranscript);
        assert_eq!(turn.reply, DialogueConfig::default().clarification);
    }

    #[tokio::test]
    async fn playback_failure_still_completes_turn() {
        let mut orch = orchestrator(Ok("unused"), Some("Sí, hay wifi."), Box::new(FailingSink));
        let turn = orch.process_text("¿Hay wifi en la habitación?").await;
        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(orch.session().history().len(), 1);
        assert_eq!(orch.session().state, DialogueState::Idle);
    }

    #[tokio::test]
    async fn greeting_is_answered_from_script_without_generation() {
        let recorder = Recorder::default();
        // Generation would fail; a scripted turn never reaches it.
        let mut orch = orchestrator(Ok("¡Hola, buenos días!"), None, Box::new(recorder.clone()));
        let mut events = orch.subscribe();

        let turn = orch.process_utterance(&utterance()).await;

        let greetings = KioskConfig::default().intents.greeting_replies;
        assert_eq!(turn.status, TurnStatus::Scripted);
        assert_eq!(turn.intent, Intent::Greeting);
        assert_eq!(turn.reply, greetings[0]);
        assert!(turn.provider.is_none());
        assert!(turn.context.is_empty());
        assert_eq!(turn.latencies.generation, Duration::ZERO);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
        assert_eq!(orch.session().recent_messages(5).len(), 2);
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RuntimeEvent::StateChanged { to, .. } = event {
                states.push(to);
            }
        }
        assert_eq!(
            states,
            vec![
                DialogueState::Processing,
                DialogueState::Speaking,
                DialogueState::Idle,
            ]
        );

        // The next greeting uses the next variant.
        let again = orch.process_text("hola").await;
        assert_eq!(again.reply, greetings[1]);
    }

    #[tokio::test]
    async fn contact_request_gets_the_configured_script() {
        let mut config = KioskConfig::default();
        config.intents.contact_reply = "Marque el 9 para recepción.".into();
        let mut orch = orchestrator_with(&config, Ok("unused"), None, Box::new(Recorder::default()));

        let turn = orch.process_text("Quiero hablar con alguien").await;
        assert_eq!(turn.status, TurnStatus::Scripted);
        assert_eq!(turn.intent, Intent::Contact);
        assert_eq!(turn.reply, "Marque el 9 para recepción.");
    }

    #[tokio::test]
    async fn disabled_routing_sends_greetings_to_generation() {
        let mut config = KioskConfig::default();
        config.intents.enabled = false;
        let mut orch = orchestrator_with(
            &config,
            Ok("unused"),
            Some("¡Hola! ¿Qué tal?"),
            Box::new(Recorder::default()),
        );

        let turn = orch.process_text("hola").await;
        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(turn.intent, Intent::Greeting);
        assert_eq!(turn.reply, "¡Hola! ¿Qué tal?");
        assert_eq!(turn.provider.as_deref(), Some("canned"));
    }

    #[tokio::test]
    async fn text_turns_build_history() {
        let mut orch = orchestrator(Ok("unused"), Some("ok"), Box::new(Recorder::default()));
        orch.process_text("first").await;
        orch.process_text("second").await;
        let msgs = orch.session().recent_messages(5);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[2].content, "second");
    }

    #[tokio::test]
    async fn run_processes_replayed_speech() {
        let recorder = Recorder::default();
        let mut orch = orchestrator(
            Ok("what time does the pool close"),
            Some("The pool closes at 10pm"),
            Box::new(recorder.clone()),
        );
        let config = KioskConfig::default();
        let mut samples = vec![0i16; 8_000];
        samples.extend(std::iter::repeat_n(6_000i16, 8_000));
        let source =
            WavReplaySource::from_samples(samples, &config.audio, Duration::from_secs(2), false);
        let mut events = orch.subscribe();

        orch.run(Box::new(source), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(orch.session().history().len(), 1);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
        assert_eq!(orch.session().state, DialogueState::Idle);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RuntimeEvent::StateChanged { to, .. } = event {
                states.push(to);
            }
        }
        assert_eq!(
            states,
            vec![
                DialogueState::Listening,
                DialogueState::Processing,
                DialogueState::Speaking,
                DialogueState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn run_with_silence_only_produces_no_turns() {
        let mut orch = orchestrator(Ok("x"), Some("y"), Box::new(Recorder::default()));
        let config = KioskConfig::default();
        let source = WavReplaySource::from_samples(
            vec![0i16; 16_000],
            &config.audio,
            Duration::from_secs(2),
            false,
        );
        orch.run(Box::new(source), CancellationToken::new())
            .await
            .unwrap();
        assert!(orch.session().history().is_empty());
    }

    /// 400 ms of speech then 1.5 s of silence per utterance, 100 ms frames.
    fn spoken_frames(utterances: usize) -> Vec<AudioFrame> {
        let now = Instant::now();
        let mut frames = Vec::new();
        for _ in 0..utterances {
            for amplitude in [6_000i16; 4].into_iter().chain([0; 16]) {
                frames.push(AudioFrame {
                    seq: frames.len() as u64,
                    samples: vec![amplitude; 1_600],
                    sample_rate: 16_000,
                    captured_at: now,
                });
            }
        }
        frames
    }

    struct StageRun {
        utterances: Vec<Utterance>,
        hints: Vec<StateHint>,
        dropped: Vec<&'static str>,
    }

    /// Run the segmenter task over `frames` with nothing draining its output.
    async fn run_stage(frames: Vec<AudioFrame>, queue: usize, speaking: bool) -> StageRun {
        let (runtime_tx, mut runtime_rx) = broadcast::channel(RUNTIME_EVENT_CAPACITY);
        let stage = SegmenterStage {
            segmenter: TurnSegmenter::new(&SegmenterConfig::default()),
            speaking: Arc::new(AtomicBool::new(speaking)),
            runtime_tx,
        };

        let (frame_tx, frame_rx) = mpsc::channel(frames.len().max(1));
        for frame in frames {
            frame_tx.try_send(frame).unwrap();
        }
        drop(frame_tx);
        let (turn_tx, mut turn_rx) = mpsc::channel(queue);
        let (hint_tx, mut hint_rx) = mpsc::channel(STATE_HINT_CAPACITY);

        stage
            .run(frame_rx, turn_tx, hint_tx, CancellationToken::new())
            .await;

        let mut run = StageRun {
            utterances: Vec::new(),
            hints: Vec::new(),
            dropped: Vec::new(),
        };
        while let Ok(utterance) = turn_rx.try_recv() {
            run.utterances.push(utterance);
        }
        while let Ok(hint) = hint_rx.try_recv() {
            run.hints.push(hint);
        }
        while let Ok(event) = runtime_rx.try_recv() {
            if let RuntimeEvent::UtteranceDropped { reason } = event {
                run.dropped.push(reason);
            }
        }
        run
    }

    #[tokio::test]
    async fn turn_queue_holds_its_full_capacity_of_utterances() {
        let capacity = DialogueConfig::default().utterance_queue;
        let run = run_stage(spoken_frames(capacity + 1), capacity, false).await;

        assert_eq!(run.utterances.len(), capacity);
        assert!(run.utterances.iter().all(Utterance::is_contiguous));
        assert_eq!(run.hints, vec![StateHint::SpeechStarted; capacity + 1]);
        assert_eq!(run.dropped, vec!["turn queue full"]);
    }

    #[tokio::test]
    async fn speech_during_playback_is_dropped_and_reported() {
        let run = run_stage(spoken_frames(1), 4, true).await;

        assert!(run.utterances.is_empty());
        assert!(run.hints.is_empty());
        assert_eq!(run.dropped, vec!["overlapped playback"]);
    }
}
