// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The cascade pipeline: STT → orchestrator → TTS.
//!
//! Three concurrent activities share the bounded speech-event queue:
//!
//! - the **input task** feeds transport audio into the recognizer and turns
//!   its events into queue entries (speech-start short-circuits into the
//!   barge-in controller instead);
//! - the **driver** (this task) dequeues final transcripts and runs one
//!   orchestrator turn at a time — finals that arrive while a turn is in
//!   flight wait in the queue;
//! - the **playback task** renders text deltas through the synthesizer and
//!   writes audio to the transport, preserving model order.
//!
//! Barge-in: the controller cancels the turn token; the playback task
//! observes the same token, drains its synthesis stream and sends the
//! transport-level stop signal.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxa_agents::AgentCatalog;
use voxa_config::{OrchestratorConfig, TimeoutsConfig};
use voxa_core::{
    BargeInController, Orchestrator, RuntimeMetrics, SessionError, SessionEvent, SharedPhase,
    TurnPhase,
};
use voxa_speech::{SttStream, TranscriptEvent, TtsClient, TtsStream, VoiceSelection};

use crate::{
    queue::SpeechEventQueue,
    transport::{TransportFrame, TransportSink, TransportSource},
};

pub struct CascadePipeline {
    session_id: String,
    cfg: OrchestratorConfig,
    timeouts: TimeoutsConfig,
    catalog: Arc<AgentCatalog>,
    orchestrator: Orchestrator,
    phase: SharedPhase,
    bargein: Arc<BargeInController>,
    metrics: Arc<RuntimeMetrics>,
    session_cancel: CancellationToken,
}

impl CascadePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        orchestrator: Orchestrator,
        phase: SharedPhase,
        metrics: Arc<RuntimeMetrics>,
        cfg: OrchestratorConfig,
        timeouts: TimeoutsConfig,
        catalog: Arc<AgentCatalog>,
        session_cancel: CancellationToken,
    ) -> Self {
        let bargein = Arc::new(BargeInController::new(phase.clone()));
        Self {
            session_id: session_id.into(),
            cfg,
            timeouts,
            catalog,
            orchestrator,
            phase,
            bargein,
            metrics,
            session_cancel,
        }
    }

    /// Cancelling this token ends the session loop (shutdown, transport
    /// close).
    pub fn cancel_token(&self) -> CancellationToken {
        self.session_cancel.clone()
    }

    /// Run the pipeline until the transport closes or the session token is
    /// cancelled.  Consumes the pipeline; teardown is the caller's job
    /// (pool release, final memory flush).
    pub async fn run(
        mut self,
        sink: Box<dyn TransportSink>,
        source: Box<dyn TransportSource>,
        stt: Box<dyn SttStream>,
        tts: Arc<dyn TtsClient>,
    ) -> Result<(), SessionError> {
        let queue = Arc::new(SpeechEventQueue::new(
            self.cfg.speech_queue_capacity,
            Duration::from_millis(self.timeouts.final_enqueue_ms),
        ));
        let (ev_tx, ev_rx) = mpsc::channel::<SessionEvent>(256);
        let turn_slot = Arc::new(Mutex::new(CancellationToken::new()));

        let input = tokio::spawn(input_task(
            source,
            stt,
            Arc::clone(&queue),
            Arc::clone(&self.bargein),
            self.session_cancel.clone(),
        ));

        let playback = tokio::spawn(playback_task(
            ev_rx,
            sink,
            tts,
            Arc::clone(&self.catalog),
            self.orchestrator.active_agent().to_string(),
            Arc::clone(&turn_slot),
            self.cfg.clone(),
            self.timeouts.clone(),
            Arc::clone(&self.metrics),
        ));

        // Greet the caller before the first utterance.
        self.orchestrator.speak_initial_greeting(&ev_tx).await;

        // Driver loop: one turn at a time, finals queue up behind it.
        loop {
            let event = tokio::select! {
                biased;
                _ = self.session_cancel.cancelled() => break,
                ev = queue.pop() => ev,
            };
            let text = match event {
                TranscriptEvent::Final { text, .. } => text,
                // Partials only matter for queue-pressure semantics.
                _ => continue,
            };
            if text.trim().is_empty() {
                continue;
            }

            self.phase.transition(TurnPhase::ReceivingUser);
            let turn_token = self.session_cancel.child_token();
            *turn_slot.lock().unwrap() = turn_token.clone();
            self.bargein.arm(turn_token.clone());

            debug!(session_id = %self.session_id, "starting turn");
            let result = self.orchestrator.run_turn(&text, &ev_tx, turn_token).await;
            self.bargein.disarm();

            if let Err(e) = result {
                warn!(session_id = %self.session_id, error = %e, "turn failed; ending session");
                self.session_cancel.cancel();
                drop(ev_tx);
                let _ = playback.await;
                input.abort();
                return Err(e);
            }

            // Barge-in leaves the phase Interrupted; the caller is already
            // speaking again.
            if self.phase.get() == TurnPhase::Interrupted {
                self.phase.transition(TurnPhase::ReceivingUser);
            }
        }

        // Session over: let playback drain, stop the input task.
        drop(ev_tx);
        let _ = tokio::time::timeout(Duration::from_millis(self.timeouts.drain_tools_ms), playback)
            .await;
        input.abort();
        Ok(())
    }
}

/// Feed transport audio into the recognizer and its events into the queue.
/// Speech-start fires the barge-in controller directly — it must not wait
/// behind queued transcripts.
async fn input_task(
    mut source: Box<dyn TransportSource>,
    mut stt: Box<dyn SttStream>,
    queue: Arc<SpeechEventQueue>,
    bargein: Arc<BargeInController>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = source.recv() => match frame {
                None => {
                    debug!("transport closed; ending session");
                    cancel.cancel();
                    break;
                }
                Some(TransportFrame::Audio(audio)) => {
                    if stt.push_audio(audio).await.is_err() {
                        warn!("recognizer rejected audio frame");
                    }
                }
                Some(TransportFrame::Control(v)) => {
                    if v.get("type").and_then(|t| t.as_str()) == Some("hangup") {
                        cancel.cancel();
                        break;
                    }
                    debug!(control = %v, "ignoring control frame");
                }
            },
            event = stt.next_event() => match event {
                None => break,
                Some(TranscriptEvent::SpeechStarted) => {
                    if bargein.fire() {
                        debug!("barge-in fired from speech start");
                    }
                }
                Some(ev) => {
                    queue.push(ev).await;
                }
            },
        }
    }
}

/// Render orchestrator events through the synthesizer and write audio to
/// the transport.  Handles the tool-execution filler phrase, agent-switch
/// voice changes (the synthesis buffer is cleared before the next agent's
/// greeting), and barge-in draining.
#[allow(clippy::too_many_arguments)]
async fn playback_task(
    mut ev_rx: mpsc::Receiver<SessionEvent>,
    mut sink: Box<dyn TransportSink>,
    tts: Arc<dyn TtsClient>,
    catalog: Arc<AgentCatalog>,
    mut current_agent: String,
    turn_slot: Arc<Mutex<CancellationToken>>,
    cfg: OrchestratorConfig,
    timeouts: TimeoutsConfig,
    metrics: Arc<RuntimeMetrics>,
) {
    let mut stream: Option<Box<dyn TtsStream>> = None;
    let mut filler_deadline: Option<Instant> = None;
    // After a barge-in drain, stale deltas of the cancelled turn are dropped
    // until its TurnComplete arrives.
    let mut muted = false;
    let mut first_chunk_t0: Option<Instant> = None;

    loop {
        let turn_token = turn_slot.lock().unwrap().clone();
        let speaking = stream.is_some();
        let filler_at = filler_deadline;

        tokio::select! {
            biased;
            _ = turn_token.cancelled(), if speaking => {
                if let Some(mut s) = stream.take() {
                    s.cancel();
                }
                let _ = sink.send(TransportFrame::stop_playback()).await;
                filler_deadline = None;
                muted = true;
                debug!("playback drained after turn cancellation");
            }
            _ = sleep_until_instant(filler_at), if filler_at.is_some() => {
                filler_deadline = None;
                if !muted {
                    speak_chunk(
                        &mut stream, &tts, &catalog, &current_agent, &cfg.filler_phrase,
                        &mut sink, &timeouts, &metrics, &mut first_chunk_t0,
                    )
                    .await;
                }
            }
            ev = ev_rx.recv() => match ev {
                None => {
                    finish_stream(&mut stream, &mut sink, &timeouts).await;
                    break;
                }
                Some(SessionEvent::TextDelta(text)) => {
                    filler_deadline = None;
                    if !muted {
                        if first_chunk_t0.is_none() {
                            first_chunk_t0 = Some(Instant::now());
                        }
                        speak_chunk(
                            &mut stream, &tts, &catalog, &current_agent, &text,
                            &mut sink, &timeouts, &metrics, &mut first_chunk_t0,
                        )
                        .await;
                    }
                }
                Some(SessionEvent::ToolCallStarted { .. }) => {
                    filler_deadline =
                        Some(Instant::now() + Duration::from_millis(cfg.filler_delay_ms));
                }
                Some(SessionEvent::ToolCallFinished { .. }) => {
                    filler_deadline = None;
                }
                Some(SessionEvent::AgentSwitched { to, .. }) => {
                    // Clear the synthesis buffer before the next agent speaks.
                    if let Some(mut s) = stream.take() {
                        s.cancel();
                    }
                    current_agent = to;
                }
                Some(SessionEvent::TurnComplete) => {
                    finish_stream(&mut stream, &mut sink, &timeouts).await;
                    filler_deadline = None;
                    muted = false;
                    first_chunk_t0 = None;
                }
                Some(SessionEvent::Error(e)) => {
                    warn!("session event error: {e}");
                }
            },
        }
    }
}

async fn sleep_until_instant(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Push one text chunk through the synthesizer and forward the resulting
/// audio to the transport.  The stream is opened lazily with the current
/// agent's voice.
#[allow(clippy::too_many_arguments)]
async fn speak_chunk(
    stream: &mut Option<Box<dyn TtsStream>>,
    tts: &Arc<dyn TtsClient>,
    catalog: &Arc<AgentCatalog>,
    agent: &str,
    text: &str,
    sink: &mut Box<dyn TransportSink>,
    timeouts: &TimeoutsConfig,
    metrics: &Arc<RuntimeMetrics>,
    first_chunk_t0: &mut Option<Instant>,
) {
    if stream.is_none() {
        let voice = catalog
            .get(agent)
            .map(|a| a.voice.clone())
            .unwrap_or_else(VoiceSelection::default);
        match tts.open_stream(&voice).await {
            Ok(s) => *stream = Some(s),
            Err(e) => {
                warn!(error = %e, "failed to open synthesis stream");
                return;
            }
        }
    }
    let s = match stream.as_mut() {
        Some(s) => s,
        None => return,
    };
    if let Err(e) = s.push_text(text).await {
        warn!(error = %e, "synthesis rejected chunk");
        return;
    }
    let chunk_limit = Duration::from_millis(timeouts.tts_chunk_ms);
    match tokio::time::timeout(chunk_limit, s.next_audio()).await {
        Ok(Some(frame)) => {
            if let Some(t0) = first_chunk_t0.take() {
                metrics.tts_first_chunk.record(t0.elapsed());
            }
            let _ = sink.send(TransportFrame::Audio(frame)).await;
        }
        Ok(None) => {}
        Err(_) => warn!("synthesis chunk deadline exceeded"),
    }
}

/// Finish and fully drain the current synthesis stream, preserving order.
async fn finish_stream(
    stream: &mut Option<Box<dyn TtsStream>>,
    sink: &mut Box<dyn TransportSink>,
    timeouts: &TimeoutsConfig,
) {
    if let Some(mut s) = stream.take() {
        let _ = s.finish().await;
        let chunk_limit = Duration::from_millis(timeouts.tts_chunk_ms);
        while let Ok(Some(frame)) = tokio::time::timeout(chunk_limit, s.next_audio()).await {
            let _ = sink.send(TransportFrame::Audio(frame)).await;
        }
    }
}
