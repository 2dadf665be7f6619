use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{MidiMessage, ScheduledEvent};
use crate::midi::{self, MidiOutputPort, MidiSink};
use crate::timing::{self, Patch, Sample, SoundType};

/// Longest sleep between two checks of the event list.
const FIRE_TICK: Duration = Duration::from_millis(1);
/// Sleep while holding for the tail of the sample after the last event.
const HOLD_TICK: Duration = Duration::from_millis(5);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Slack on top of the sample duration before `play_sync` gives up.
const SYNC_SLACK: Duration = Duration::from_secs(2);
const PREVIEW_NOTE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Completed,
    Stopped,
}

/// How a session ended, handed to the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Stopped,
}

pub type CompletionCallback = Box<dyn FnOnce(PlaybackOutcome) + Send + 'static>;

struct Shared {
    state: Mutex<PlaybackState>,
    /// f64 seconds stored as bits
    position: AtomicU64,
    /// Bumped for every new session; a superseded firing thread must not
    /// touch state that now belongs to its successor.
    generation: AtomicU64,
}

impl Shared {
    fn set_position(&self, seconds: f64) {
        self.position.store(seconds.to_bits(), Ordering::Relaxed);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }
}

struct Session {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    done_rx: Receiver<()>,
}

/// Owns the MIDI output and at most one playback session.
pub struct PlaybackEngine {
    sink: Mutex<Option<Arc<dyn MidiSink>>>,
    session: Mutex<Option<Session>>,
    /// Held across teardown, spawn and store so only one session is ever live.
    control: Mutex<()>,
    shared: Arc<Shared>,
}

impl PlaybackEngine {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            session: Mutex::new(None),
            control: Mutex::new(()),
            shared: Arc::new(Shared {
                state: Mutex::new(PlaybackState::Idle),
                position: AtomicU64::new(0f64.to_bits()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_sink(sink: Arc<dyn MidiSink>) -> Self {
        let engine = Self::new();
        *engine.sink.lock() = Some(sink);
        engine
    }

    /// Opens the first MIDI output whose name contains `port_pattern`.
    pub fn connect(&self, port_pattern: &str) -> Result<String> {
        let port = MidiOutputPort::open(port_pattern)?;
        let name = port.port_name.clone();
        self.attach(Arc::new(port));
        Ok(name)
    }

    /// Binds an already opened sink, replacing (and resetting) any previous one.
    pub fn attach(&self, sink: Arc<dyn MidiSink>) {
        if self.is_connected() {
            self.disconnect();
        }
        *self.sink.lock() = Some(sink);
    }

    pub fn disconnect(&self) {
        self.stop();
        if self.sink.lock().take().is_some() {
            info!("MIDI output released");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub fn state(&self) -> PlaybackState {
        *self.shared.state.lock()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    /// Seconds since the current session started; zero when idle.
    pub fn get_position(&self) -> f64 {
        f64::from_bits(self.shared.position.load(Ordering::Relaxed))
    }

    /// Starts playing `sample`, replacing whatever was playing.
    ///
    /// Returns once the firing thread is running. `on_complete` runs exactly
    /// once on that thread, whether the session completes or is stopped.
    pub fn play(&self, sample: &Sample, on_complete: Option<CompletionCallback>) -> Result<()> {
        let sink = self.sink.lock().clone().ok_or(Error::NotConnected)?;
        let events = timing::compile(sample)?;
        let total = sample.duration_seconds();

        let _control = self.control.lock();
        self.teardown_session();
        midi::send_panic(sink.as_ref());

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.shared.state.lock() = PlaybackState::Playing;
        self.shared.set_position(0.0);

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = channel::bounded(1);

        info!(
            "Playing '{}': {} events over {:.2}s",
            sample.name,
            events.len(),
            total
        );

        let session = FireLoop {
            events,
            total,
            sink,
            stop: Arc::clone(&stop),
            shared: Arc::clone(&self.shared),
            generation,
        };
        let handle = thread::Builder::new()
            .name("juno-playback".to_string())
            .spawn(move || session.run(on_complete, done_tx))
            .inspect_err(|_| *self.shared.state.lock() = PlaybackState::Idle)?;

        *self.session.lock() = Some(Session {
            stop,
            handle,
            done_rx,
        });
        Ok(())
    }

    /// Plays `sample` and blocks until the session ends.
    pub fn play_sync(&self, sample: &Sample) -> Result<PlaybackOutcome> {
        let (tx, rx) = channel::bounded(1);
        self.play(
            sample,
            Some(Box::new(move |outcome| {
                let _ = tx.send(outcome);
            })),
        )?;

        let budget = Duration::try_from_secs_f64(sample.duration_seconds())
            .unwrap_or(Duration::ZERO)
            + SYNC_SLACK;
        rx.recv_timeout(budget)
            .map_err(|_| Error::Timeout(format!("playback of '{}'", sample.name)))
    }

    /// Stops playback and resets the device. Safe to call at any time.
    pub fn stop(&self) {
        let _control = self.control.lock();
        let was_playing = self.teardown_session() && self.state() == PlaybackState::Playing;

        *self.shared.state.lock() = if was_playing {
            PlaybackState::Stopped
        } else {
            PlaybackState::Idle
        };
        self.shared.set_position(0.0);

        self.panic();
    }

    /// Sends the all-channels reset if a sink is bound; otherwise a no-op.
    pub fn panic(&self) {
        if let Some(sink) = self.sink.lock().clone() {
            midi::send_panic(sink.as_ref());
        }
    }

    /// Bank select + program change for the sound's channel.
    pub fn select_patch(&self, sound: SoundType, patch: &Patch) -> Result<()> {
        let sink = self.sink.lock().clone().ok_or(Error::NotConnected)?;
        info!("Selecting {} patch: {}", sound.as_str(), patch.name);
        for message in timing::patch_messages(sound.channel(), patch) {
            sink.send(&message)?;
        }
        Ok(())
    }

    /// Selects the patch, then plays a short test note in the background.
    pub fn preview_patch(&self, sound: SoundType, patch: &Patch) -> Result<()> {
        self.select_patch(sound, patch)?;
        let sink = self.sink.lock().clone().ok_or(Error::NotConnected)?;

        let channel = sound.channel();
        let pitch = match sound {
            SoundType::Bass => 36,
            SoundType::Pad | SoundType::Lead => 60,
        };
        thread::Builder::new()
            .name("juno-preview".to_string())
            .spawn(move || {
                let on = MidiMessage::NoteOn {
                    channel,
                    pitch,
                    velocity: 100,
                };
                if let Err(e) = sink.send(&on) {
                    warn!("Preview note failed: {}", e);
                    return;
                }
                thread::sleep(PREVIEW_NOTE);
                if let Err(e) = sink.send(&MidiMessage::NoteOff { channel, pitch }) {
                    warn!("Preview note off failed: {}", e);
                }
            })?;
        Ok(())
    }

    /// Signals the running session to stop and joins it with a bounded wait.
    /// Returns whether a session was present.
    fn teardown_session(&self) -> bool {
        let Some(session) = self.session.lock().take() else {
            return false;
        };
        session.stop.store(true, Ordering::Release);

        if session.handle.thread().id() == thread::current().id() {
            // Called from the completion callback; the thread is already on its way out.
            return true;
        }

        match session.done_rx.recv_timeout(STOP_JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if session.handle.join().is_err() {
                    warn!("Playback thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{}; detaching playback thread",
                    Error::Timeout("playback thread to exit".into())
                );
            }
        }
        true
    }
}

impl Default for PlaybackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FireLoop {
    events: Vec<ScheduledEvent>,
    total: f64,
    sink: Arc<dyn MidiSink>,
    stop: Arc<AtomicBool>,
    shared: Arc<Shared>,
    generation: u64,
}

impl FireLoop {
    fn run(self, on_complete: Option<CompletionCallback>, done_tx: Sender<()>) {
        let start = Instant::now();
        let stopped = || self.stop.load(Ordering::Acquire);
        let mut cursor = 0;

        while !stopped() && cursor < self.events.len() {
            let elapsed = start.elapsed().as_secs_f64();
            self.publish_position(elapsed);

            while cursor < self.events.len() && self.events[cursor].time <= elapsed {
                let event = &self.events[cursor];
                if let Err(e) = self.sink.send(&event.message) {
                    warn!("Dropped {:?} at {:.3}s: {}", event.message, event.time, e);
                }
                cursor += 1;
            }

            if let Some(next) = self.events.get(cursor) {
                let wait = Duration::try_from_secs_f64(next.time - elapsed).unwrap_or(FIRE_TICK);
                thread::sleep(wait.min(FIRE_TICK));
            }
        }

        // Hold until the full sample length so release tails are not cut.
        loop {
            let elapsed = start.elapsed().as_secs_f64();
            if stopped() || elapsed >= self.total {
                break;
            }
            self.publish_position(elapsed);
            let remaining = Duration::try_from_secs_f64(self.total - elapsed).unwrap_or(HOLD_TICK);
            thread::sleep(remaining.min(HOLD_TICK));
        }

        let outcome = if stopped() {
            PlaybackOutcome::Stopped
        } else {
            PlaybackOutcome::Completed
        };

        if self.shared.is_current(self.generation) {
            if outcome == PlaybackOutcome::Completed {
                *self.shared.state.lock() = PlaybackState::Completed;
            }
            self.shared.set_position(0.0);
        }

        debug!("Playback session {} ended: {:?}", self.generation, outcome);
        if let Some(callback) = on_complete {
            callback(outcome);
        }
        let _ = done_tx.send(());
    }

    fn publish_position(&self, elapsed: f64) {
        if self.shared.is_current(self.generation) {
            self.shared.set_position(elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MemorySink;
    use crate::timing::{Layer, Note};
    use std::sync::atomic::AtomicUsize;

    fn short_sample(bars: u32) -> Sample {
        // 200 bpm, 4/4: 1.2s per bar
        let lead = Layer::new(
            "lead",
            SoundType::Lead,
            vec![Note::new("C4", 0.0, 0.5, 90), Note::new("E4", 0.5, 0.5, 90)],
        );
        Sample::new("short", 200, bars, vec![lead]).unwrap()
    }

    fn engine() -> (PlaybackEngine, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (PlaybackEngine::with_sink(sink.clone()), sink)
    }

    fn note_bytes(sent: &[Vec<u8>]) -> Vec<Vec<u8>> {
        sent.iter()
            .filter(|b| matches!(b[0] & 0xF0, 0x80 | 0x90))
            .cloned()
            .collect()
    }

    #[test]
    fn test_play_without_connection_fails() {
        let engine = PlaybackEngine::new();
        let err = engine.play(&short_sample(1), None).unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_play_sync_sends_events_in_order() {
        let (engine, sink) = engine();
        let sample = short_sample(1);

        let started = Instant::now();
        let outcome = engine.play_sync(&sample).unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert!(started.elapsed().as_secs_f64() >= sample.duration_seconds() - 0.01);
        assert_eq!(engine.state(), PlaybackState::Completed);
        assert_eq!(engine.get_position(), 0.0);

        let notes = note_bytes(&sink.sent());
        assert_eq!(
            notes,
            vec![
                vec![0x92, 60, 90],
                vec![0x82, 60, 0],
                vec![0x92, 64, 90],
                vec![0x82, 64, 0],
            ]
        );
    }

    #[test]
    fn test_completion_callback_runs_once() {
        let (engine, _sink) = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel::bounded(1);

        let counter = calls.clone();
        engine
            .play(
                &short_sample(1),
                Some(Box::new(move |outcome| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(outcome);
                })),
            )
            .unwrap();
        assert!(engine.is_playing());

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed);
        engine.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_is_idempotent_and_panics() {
        let (engine, sink) = engine();
        engine.play(&short_sample(4), None).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(engine.get_position() > 0.0);

        engine.stop();
        assert_eq!(engine.state(), PlaybackState::Stopped);

        sink.clear();
        engine.stop();
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert!(!engine.is_playing());
        assert_eq!(sink.len(), 64);
    }

    #[test]
    fn test_stop_reports_stopped_outcome() {
        let (engine, _sink) = engine();
        let (tx, rx) = channel::bounded(1);
        engine
            .play(
                &short_sample(4),
                Some(Box::new(move |outcome| {
                    let _ = tx.send(outcome);
                })),
            )
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        engine.stop();
        assert_eq!(rx.try_recv().unwrap(), PlaybackOutcome::Stopped);
    }

    #[test]
    fn test_play_replaces_running_session() {
        let (engine, sink) = engine();
        let (tx, rx) = channel::bounded(2);

        let first_tx = tx.clone();
        engine
            .play(
                &short_sample(4),
                Some(Box::new(move |o| {
                    let _ = first_tx.send(("first", o));
                })),
            )
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        sink.clear();

        engine
            .play(
                &short_sample(1),
                Some(Box::new(move |o| {
                    let _ = tx.send(("second", o));
                })),
            )
            .unwrap();

        // The superseded session ends before the replacement begins, and the
        // device is reset in between.
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            ("first", PlaybackOutcome::Stopped)
        );
        assert!(sink.len() >= 64);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ("second", PlaybackOutcome::Completed)
        );
    }

    #[test]
    fn test_far_future_note_keeps_engine_stoppable() {
        let (engine, _sink) = engine();
        // Built directly: `Sample::new` would refuse a note this far out.
        let sample = Sample {
            name: "far".into(),
            bpm: 120,
            bars: 1,
            time_signature: (4, 4),
            layers: vec![Layer::new(
                "lead",
                SoundType::Lead,
                vec![Note::new("C4", 0.0, 0.5, 90), Note::new("E4", 1e20, 0.5, 90)],
            )],
        };
        let (tx, rx) = channel::bounded(1);
        engine
            .play(
                &sample,
                Some(Box::new(move |outcome| {
                    let _ = tx.send(outcome);
                })),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(engine.is_playing());

        engine.stop();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PlaybackOutcome::Stopped
        );
        assert_eq!(engine.state(), PlaybackState::Stopped);
        engine.stop();
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_concurrent_play_keeps_one_session() {
        let sink = Arc::new(MemorySink::new());
        let engine = Arc::new(PlaybackEngine::with_sink(sink.clone()));
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let (tx, rx) = channel::bounded(2);

        let players: Vec<_> = (0..2)
            .map(|_| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    barrier.wait();
                    engine
                        .play(
                            &short_sample(4),
                            Some(Box::new(move |outcome| {
                                let _ = tx.send(outcome);
                            })),
                        )
                        .unwrap();
                })
            })
            .collect();
        for player in players {
            player.join().unwrap();
        }

        engine.stop();
        for _ in 0..2 {
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(1)).unwrap(),
                PlaybackOutcome::Stopped
            );
        }

        sink.clear();
        thread::sleep(Duration::from_millis(300));
        assert!(note_bytes(&sink.sent()).is_empty());
        assert!(!engine.is_playing());
    }

    #[test]
    fn test_panic_without_session() {
        let (engine, sink) = engine();
        engine.panic();
        assert_eq!(sink.len(), 64);

        // No sink bound: nothing to do, nothing to fail
        PlaybackEngine::new().panic();
    }

    #[test]
    fn test_select_patch() {
        let (engine, sink) = engine();
        let patch = Patch {
            id: "warm-pad".into(),
            name: "Warm Pad".into(),
            bank_msb: 63,
            bank_lsb: 1,
            program: 5,
        };
        engine.select_patch(SoundType::Pad, &patch).unwrap();
        assert_eq!(
            sink.sent(),
            vec![vec![0xB1, 0, 63], vec![0xB1, 32, 1], vec![0xC1, 5]]
        );

        let disconnected = PlaybackEngine::new();
        assert!(matches!(
            disconnected.select_patch(SoundType::Pad, &patch),
            Err(Error::NotConnected)
        ));
    }
}
