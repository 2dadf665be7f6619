//! Entry point for the orchestration layer: one playback engine and one
//! capture process, owned together.

use crossbeam::channel::{self, RecvTimeoutError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::audio::CaptureManager;
use crate::config::JunoConfig;
use crate::engine::{CompletionCallback, PlaybackEngine, PlaybackOutcome};
use crate::error::{Error, Result};
use crate::timing::Sample;

/// How long `export_audio` waits for playback to begin.
const START_TIMEOUT: Duration = Duration::from_secs(2);
const FINISH_SLACK: Duration = Duration::from_secs(2);

pub struct Studio {
    config: JunoConfig,
    engine: Arc<PlaybackEngine>,
    capture: Arc<CaptureManager>,
    /// Capture was started by a streaming session and should end with it
    owns_capture: Arc<AtomicBool>,
}

impl Studio {
    pub fn new(config: JunoConfig) -> Result<Self> {
        let capture = CaptureManager::new(config.audio.clone())?;
        Ok(Self::with_parts(
            config,
            Arc::new(PlaybackEngine::new()),
            Arc::new(capture),
        ))
    }

    pub fn with_parts(
        config: JunoConfig,
        engine: Arc<PlaybackEngine>,
        capture: Arc<CaptureManager>,
    ) -> Self {
        Self {
            config,
            engine,
            capture,
            owns_capture: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &JunoConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<PlaybackEngine> {
        &self.engine
    }

    pub fn capture(&self) -> &Arc<CaptureManager> {
        &self.capture
    }

    /// Opens the configured MIDI output.
    pub fn connect(&self) -> Result<String> {
        self.engine.connect(&self.config.midi_port)
    }

    /// Starts playback, replacing any running session. With `stream`, capture
    /// is started too if it isn't running, and stopped again when this
    /// session completes.
    pub fn play(
        &self,
        sample: &Sample,
        stream: bool,
        on_complete: Option<CompletionCallback>,
    ) -> Result<()> {
        if !self.engine.is_connected() {
            return Err(Error::NotConnected);
        }
        let started_capture = stream && !self.capture.is_capturing();
        if started_capture {
            self.capture.try_start()?;
            self.owns_capture.store(true, Ordering::Release);
        }

        let capture = self.capture.clone();
        let owns_capture = self.owns_capture.clone();
        let callback: CompletionCallback = Box::new(move |outcome| {
            if outcome == PlaybackOutcome::Completed && owns_capture.swap(false, Ordering::AcqRel)
            {
                info!("Session complete; stopping capture");
                capture.stop();
            }
            if let Some(callback) = on_complete {
                callback(outcome);
            }
        });
        let result = self.engine.play(sample, Some(callback));
        if result.is_err() && started_capture && self.owns_capture.swap(false, Ordering::AcqRel) {
            self.capture.stop();
        }
        result
    }

    /// Stops playback, and capture if a streaming session started it.
    pub fn stop(&self) {
        self.engine.stop();
        if self.owns_capture.swap(false, Ordering::AcqRel) {
            self.capture.stop();
        }
    }

    /// Plays `sample` while recording the synth, returning the take as WAV.
    ///
    /// Playback runs on its own thread; recording begins once it has started
    /// and lasts for the sample plus `extra_time` seconds of release tail.
    pub fn export_audio(&self, sample: &Sample, extra_time: f64) -> Result<Vec<u8>> {
        if !self.engine.is_connected() {
            return Err(Error::NotConnected);
        }
        let budget = Duration::try_from_secs_f64(sample.duration_seconds() + extra_time.max(0.0))
            .map_err(|_| Error::RecordFailed(format!("invalid release tail {extra_time}s")))?
            + FINISH_SLACK;
        let started_capture = !self.capture.is_capturing();
        if started_capture {
            self.capture.try_start()?;
        }

        let (started_tx, started_rx) = channel::bounded::<Result<()>>(1);
        let engine = self.engine.clone();
        let owned = sample.clone();
        let player = thread::Builder::new()
            .name("juno-export".to_string())
            .spawn(move || {
                let (done_tx, done_rx) = channel::bounded(1);
                let result = engine.play(
                    &owned,
                    Some(Box::new(move |outcome| {
                        let _ = done_tx.send(outcome);
                    })),
                );
                let ok = result.is_ok();
                let _ = started_tx.send(result);
                if ok && done_rx.recv_timeout(budget).is_err() {
                    warn!("Export playback did not finish in time");
                    engine.stop();
                }
            })?;

        let recorded = match started_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => self.capture.record(sample.duration_seconds(), extra_time),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => {
                self.engine.stop();
                Err(Error::Timeout("export playback to start".into()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::RecordFailed("export playback thread exited".into()))
            }
        };

        if recorded.is_err() {
            self.engine.stop();
        }
        if player.join().is_err() {
            warn!("Export playback thread panicked");
        }
        if started_capture {
            self.capture.stop();
        }
        recorded
    }
}

impl Drop for Studio {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::WorkerCommand;
    use crate::config::AudioConfig;
    use crate::midi::MemorySink;
    use crate::timing::{Layer, Note, SoundType};

    fn sample() -> Sample {
        let lead = Layer::new("lead", SoundType::Lead, vec![Note::new("A4", 0.0, 1.0, 90)]);
        Sample::new("studio", 200, 1, vec![lead]).unwrap()
    }

    fn studio(worker: &str) -> (Studio, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let capture = CaptureManager::with_command(
            AudioConfig::default(),
            WorkerCommand::new("sh").arg("-c").arg(worker),
        );
        let studio = Studio::with_parts(
            JunoConfig::default(),
            Arc::new(PlaybackEngine::with_sink(sink.clone())),
            Arc::new(capture),
        );
        (studio, sink)
    }

    #[test]
    fn test_play_requires_connection() {
        let studio = Studio::with_parts(
            JunoConfig::default(),
            Arc::new(PlaybackEngine::new()),
            Arc::new(CaptureManager::with_command(
                AudioConfig::default(),
                WorkerCommand::new("true"),
            )),
        );
        assert!(matches!(
            studio.play(&sample(), false, None),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            studio.export_audio(&sample(), 0.5),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_stream_start_failure_is_reported() {
        let (studio, sink) = studio("exit 3");
        let err = studio.play(&sample(), true, None).unwrap_err();
        assert!(matches!(err, Error::ProcessStartFailure(_)));
        assert!(!studio.engine().is_playing());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_failed_play_releases_its_capture() {
        let (studio, sink) = studio("exec sleep 30");
        let bad = Layer::new("lead", SoundType::Lead, vec![Note::new("X9", 0.0, 1.0, 90)]);
        let sample = Sample::new("bad", 120, 1, vec![bad]).unwrap();

        let err = studio.play(&sample, true, None).unwrap_err();
        assert!(matches!(err, Error::InvalidPitch(_)));
        assert!(!studio.capture().is_capturing());
        assert!(!studio.engine().is_playing());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_export_rejects_unbounded_tail() {
        let (studio, sink) = studio("exec sleep 30");
        let err = studio.export_audio(&sample(), f64::INFINITY).unwrap_err();
        assert!(matches!(err, Error::RecordFailed(_)));
        assert!(!studio.capture().is_capturing());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_streaming_session_stops_its_capture() {
        let (studio, _sink) = studio("exec sleep 30");
        let (tx, rx) = channel::bounded(1);
        studio
            .play(
                &sample(),
                true,
                Some(Box::new(move |outcome| {
                    let _ = tx.send(outcome);
                })),
            )
            .unwrap();
        assert!(studio.capture().is_capturing());

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert!(!studio.capture().is_capturing());
    }

    #[test]
    fn test_export_fails_when_capture_dies() {
        let (studio, sink) = studio("sleep 0.5");
        let err = studio.export_audio(&sample(), 0.5).unwrap_err();
        assert!(matches!(err, Error::RecordFailed(_)));
        assert!(!studio.engine().is_playing());
        assert!(!sink.is_empty());
    }
}
