//! Supervision of the isolated capture process.
//!
//! The process owns the audio input and shares no memory with us: PCM chunks
//! arrive framed on its stdout, a reader thread moves them into a bounded
//! queue (dropping on overflow) and the dispatcher fans them out. Closing the
//! process's stdin asks it to stop.

use bytes::Bytes;
use crossbeam::channel::{self, RecvTimeoutError, TrySendError};
use parking_lot::Mutex;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::dispatcher::{self, DispatchStats, SubscriberRegistry, Subscription, SubscriptionId};
use super::{ipc, wav};
use crate::config::AudioConfig;
use crate::error::{Error, Result};

/// How long a fresh process must stay alive to count as started.
const STARTUP_GRACE: Duration = Duration::from_millis(250);
const POLL: Duration = Duration::from_millis(10);
const EXIT_TIMEOUT: Duration = Duration::from_secs(1);
const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Extra wall time a recording may take beyond its audio length.
const RECORD_SLACK: Duration = Duration::from_secs(2);
const RECORD_POLL: Duration = Duration::from_millis(100);

/// Program and arguments that run the capture process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-runs this executable as `capture-worker --config <ron>`.
    pub fn current_exe(config: &AudioConfig) -> Result<Self> {
        let exe = std::env::current_exe()?;
        let ron = ron::ser::to_string(config).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self::new(exe).arg("capture-worker").arg("--config").arg(ron))
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
    }
}

struct CaptureProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: JoinHandle<u64>,
    dispatcher: JoinHandle<DispatchStats>,
}

pub struct CaptureManager {
    config: AudioConfig,
    command: WorkerCommand,
    registry: Arc<SubscriberRegistry>,
    capturing: Arc<AtomicBool>,
    process: Mutex<Option<CaptureProcess>>,
}

impl CaptureManager {
    pub fn new(config: AudioConfig) -> Result<Self> {
        let command = WorkerCommand::current_exe(&config)?;
        Ok(Self::with_command(config, command))
    }

    pub fn with_command(config: AudioConfig, command: WorkerCommand) -> Self {
        Self {
            config,
            command,
            registry: Arc::new(SubscriberRegistry::new()),
            capturing: Arc::new(AtomicBool::new(false)),
            process: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<SubscriberRegistry> {
        self.registry.clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire)
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Bytes) -> Result<()> + Send + Sync + 'static,
    {
        self.registry.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// Starts the capture process if it isn't running. Returns false if it
    /// could not be spawned or exited during the startup grace period.
    pub fn start(&self) -> bool {
        match self.try_start() {
            Ok(()) => true,
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    pub fn try_start(&self) -> Result<()> {
        let mut slot = self.process.lock();
        if slot.is_some() {
            if self.is_capturing() {
                return Ok(());
            }
            // The previous process ended on its own; reap it first.
            if let Some(process) = slot.take() {
                self.shutdown(process);
            }
        }

        let mut child = self
            .command
            .spawn()
            .map_err(|e| Error::ProcessStartFailure(format!("{}: {}", self.command.program.display(), e)))?;

        let grace_end = Instant::now() + STARTUP_GRACE;
        while Instant::now() < grace_end {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(Error::ProcessStartFailure(format!(
                        "capture process exited during startup ({status})"
                    )));
                }
                Ok(None) => thread::sleep(POLL),
                Err(e) => {
                    reap(&mut child);
                    return Err(e.into());
                }
            }
        }

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            reap(&mut child);
            return Err(Error::ProcessStartFailure("capture process pipes unavailable".into()));
        };

        let (tx, rx) = channel::bounded::<Bytes>(self.config.ipc_capacity.max(1));
        let reader = match thread::Builder::new()
            .name("capture-reader".to_string())
            .spawn(move || read_chunks(stdout, tx))
        {
            Ok(reader) => reader,
            Err(e) => {
                reap(&mut child);
                return Err(e.into());
            }
        };

        self.capturing.store(true, Ordering::Release);
        let dispatcher = match dispatcher::spawn(
            rx,
            self.registry.clone(),
            self.config.max_backlog,
            self.capturing.clone(),
        ) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                // The reader exits on its own once the queue has no receiver.
                self.capturing.store(false, Ordering::Release);
                drop(stdin);
                reap(&mut child);
                drop(reader);
                return Err(e.into());
            }
        };

        info!(
            "Capture started (pid {}, {} Hz, {} frames per chunk)",
            child.id(),
            self.config.sample_rate,
            self.config.chunk_frames
        );
        *slot = Some(CaptureProcess {
            child,
            stdin: Some(stdin),
            reader,
            dispatcher,
        });
        Ok(())
    }

    /// Stops the capture process. Safe to call when nothing is running.
    pub fn stop(&self) {
        let Some(process) = self.process.lock().take() else {
            return;
        };
        self.shutdown(process);
        info!("Capture stopped");
    }

    fn shutdown(&self, mut process: CaptureProcess) {
        self.capturing.store(false, Ordering::Release);
        // EOF on stdin is the worker's stop signal.
        drop(process.stdin.take());

        let deadline = Instant::now() + EXIT_TIMEOUT;
        loop {
            match process.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Capture process exited: {}", status);
                    break;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(POLL),
                Ok(None) => {
                    warn!(
                        "{}; killing capture process",
                        Error::Timeout("capture process to exit".into())
                    );
                    let _ = process.child.kill();
                    let _ = process.child.wait();
                    break;
                }
                Err(e) => {
                    warn!("Failed to poll capture process: {}", e);
                    let _ = process.child.kill();
                    let _ = process.child.wait();
                    break;
                }
            }
        }

        if process.dispatcher.join().is_err() {
            warn!("Dispatcher thread panicked");
        }

        // The pipe can outlive the process if it left children holding it.
        let deadline = Instant::now() + READER_JOIN_TIMEOUT;
        while !process.reader.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL);
        }
        if process.reader.is_finished() {
            match process.reader.join() {
                Ok(dropped) if dropped > 0 => {
                    warn!("{} chunks dropped on a full capture queue", dropped)
                }
                Ok(_) => {}
                Err(_) => warn!("Capture reader thread panicked"),
            }
        } else {
            warn!("Capture pipe still open; detaching reader thread");
        }
    }

    /// Records `duration + extra_time` seconds of capture and returns it as a
    /// WAV file. Starts capture if needed, and stops it afterwards only if it
    /// was started here. If capture ends early or the deadline passes the
    /// result is an error, never a shortened recording.
    pub fn record(&self, duration: f64, extra_time: f64) -> Result<Vec<u8>> {
        let seconds = duration + extra_time.max(0.0);
        let length = Duration::try_from_secs_f64(seconds)
            .ok()
            .filter(|_| seconds > 0.0)
            .ok_or_else(|| Error::RecordFailed(format!("invalid length {seconds}s")))?;
        let frame_bytes = AudioConfig::OUTPUT_CHANNELS as usize * AudioConfig::BYTES_PER_SAMPLE;
        let target_bytes = (seconds * self.config.sample_rate as f64).round() as usize * frame_bytes;

        let (tx, rx) = channel::unbounded::<Bytes>();
        let subscription = Subscription::new(self.registry.clone(), move |chunk| {
            tx.send(chunk.clone())
                .map_err(|_| Error::RecordFailed("recorder went away".into()))
        });

        let started_here = !self.is_capturing();
        if started_here && !self.start() {
            return Err(Error::RecordFailed("capture did not start".into()));
        }
        info!("Recording {:.2}s (subscription {})", seconds, subscription.id());

        let deadline = Instant::now() + length + RECORD_SLACK;
        let mut pcm = Vec::with_capacity(target_bytes);
        let outcome = loop {
            if pcm.len() >= target_bytes {
                break Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(Error::Timeout(format!("{seconds:.2}s of capture")));
            }
            match rx.recv_timeout((deadline - now).min(RECORD_POLL)) {
                Ok(chunk) => pcm.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) if self.is_capturing() => {}
                Err(_) => {
                    break Err(Error::RecordFailed(format!(
                        "capture ended after {:.2}s of {:.2}s",
                        pcm.len() as f64 / (frame_bytes as f64 * self.config.sample_rate as f64),
                        seconds
                    )));
                }
            }
        };

        drop(subscription);
        if started_here {
            self.stop();
        }
        outcome?;

        pcm.truncate(target_bytes);
        wav::encode(&pcm, self.config.sample_rate, AudioConfig::OUTPUT_CHANNELS)
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Kills a capture process that will not be supervised, and waits for it.
fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("Capture process already gone: {}", e);
    }
    if let Err(e) = child.wait() {
        warn!("Failed to reap capture process: {}", e);
    }
}

/// Moves frames from the worker's stdout into the queue without ever
/// blocking on it. Returns the number of chunks dropped on a full queue.
fn read_chunks(stdout: ChildStdout, tx: channel::Sender<Bytes>) -> u64 {
    let mut reader = BufReader::new(stdout);
    let mut dropped = 0u64;
    loop {
        match ipc::read_frame(&mut reader) {
            Ok(Some(chunk)) => match tx.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Disconnected(_)) => break,
            },
            Ok(None) => {
                debug!("Capture pipe closed");
                break;
            }
            Err(e) => {
                warn!("Capture pipe error: {}", e);
                break;
            }
        }
    }
    dropped
}
