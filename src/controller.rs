//! Playback controller: session bring-up, stimulus loading, and the
//! play / pause / rewind / reset state machine.
//!
//! A controller is the sole owner of its device and every named region on it.
//! It is single-owner, single-thread: callers must not run two operations on
//! the same controller concurrently. Only [`InterruptHandle`] crosses threads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

use crate::buffers::{BufferManager, PlaybackPosition};
use crate::cancellation::InterruptHandle;
use crate::config::{ms_to_samples, SessionConfig};
use crate::device::{tags, Device, SoftTrigger, WordFormat, STATUS_RUNNING};
use crate::error::{Error, Result};
use crate::events::{read_button_presses, ButtonPresses};
use crate::metrics::{op_names, OpTimings, TimingSummary};
use crate::paradigm::{ParadigmProfile, SampleEncoding};
use crate::state_machine::{PlaybackState, PlaybackStateMachine};
use crate::stimulus::{StimulusBuffer, StimulusLoader, Trigger};
use crate::timing::{Clock, SystemClock, EVENT_SETTLE, PAUSE_SETTLE};

/// Scaler units per volt for 16-bit packed paradigms.
const PACKED_VOLT_UNIT: f64 = 1.0 / 32_768.0;

pub struct Controller<D: Device> {
    session_id: String,
    config: SessionConfig,
    buffers: BufferManager<D>,
    loader: StimulusLoader,
    state: PlaybackStateMachine,
    interrupts: InterruptHandle,
    timings: OpTimings,
    sample_rate: f64,
    /// Stop register value of the last play command.
    stop_sample: u64,
}

impl<D: Device> Controller<D> {
    /// Validate `config` and wrap `device`. Nothing is sent to the device yet.
    pub fn new(device: D, config: SessionConfig) -> Result<Self> {
        Self::with_clock(device, config, Arc::new(SystemClock))
    }

    /// Like [`Controller::new`] with an injected clock for settle and poll delays.
    pub fn with_clock(device: D, config: SessionConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let profile = config.validate()?;
        let session_id = uuid::Uuid::new_v4().to_string();
        info!(session = %session_id, paradigm = %profile.id, "controller_created");
        Ok(Self {
            session_id,
            loader: StimulusLoader::new(profile, config.scaling),
            buffers: BufferManager::new(device, profile, clock),
            config,
            state: PlaybackStateMachine::new(),
            interrupts: InterruptHandle::new(),
            timings: OpTimings::new(),
            sample_rate: 0.0,
            stop_sample: 0,
        })
    }

    /// Validate, connect and bring the device up in one step.
    pub fn open(device: D, config: SessionConfig) -> Result<Self> {
        let mut controller = Self::new(device, config)?;
        controller.connect()?;
        Ok(controller)
    }

    fn span(&self, op: &'static str) -> tracing::span::EnteredSpan {
        info_span!("controller", session = %self.session_id, op).entered()
    }

    // --- lifecycle ---

    /// Connect, load and verify the circuit, start it, program the session
    /// registers, and clear all buffers. Any failure after the connection was
    /// made tears it down again.
    pub fn connect(&mut self) -> Result<()> {
        let _span = self.span("connect");
        let current = self.state.current();
        if current.is_connected() {
            return Err(Error::InvalidTransition {
                from: current,
                to: PlaybackState::Idle,
            });
        }
        let started = Instant::now();

        self.buffers.device_mut().connect()?;
        if let Err(e) = self.bring_up() {
            error!(error = %e, "bring_up_failed");
            self.teardown();
            return Err(e);
        }
        self.state.transition(PlaybackState::Idle)?;
        self.timings.record_since(op_names::CONNECT, started);
        info!(sample_rate = self.sample_rate, "controller_connected");
        Ok(())
    }

    fn bring_up(&mut self) -> Result<()> {
        let circuit = &self.config.circuit;
        let device = self.buffers.device_mut();
        device.load_circuit(&circuit.path, self.config.sample_rate)?;

        let actual: Vec<i32> = device
            .read_buffer(
                tags::CIRCUIT_INFO,
                0,
                circuit.descriptor.len(),
                WordFormat::I32,
            )?
            .into_iter()
            .map(|w| w as i32)
            .collect();
        if actual != circuit.descriptor {
            return Err(Error::CircuitVersionMismatch {
                expected: circuit.descriptor.clone(),
                actual,
            });
        }

        device.run()?;
        let status = device.status();
        if status != STATUS_RUNNING {
            return Err(Error::DeviceNotRunning { status });
        }
        self.sample_rate = device.sample_rate();
        if self.sample_rate <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "device reports sample rate {}",
                self.sample_rate
            )));
        }

        self.program_session_registers()?;
        self.buffers.reset_buffers(true)?;
        Ok(())
    }

    fn program_session_registers(&mut self) -> Result<()> {
        let profile = *self.buffers.profile();
        let scaling = self.config.scaling;
        let unit = match profile.encoding {
            SampleEncoding::Float32Separate => 1.0,
            SampleEncoding::Int16Interleaved => PACKED_VOLT_UNIT,
        };
        let channel2 = if profile.channel_count == 1 {
            if scaling.channel2 != 0.0 {
                warn!(volts = scaling.channel2, "channel 2 scaling ignored in mono paradigm");
            }
            0.0
        } else {
            scaling.channel2 * unit
        };
        let trigger_samples = ms_to_samples(self.config.trigger_duration_ms, self.sample_rate);
        let hold_samples = ms_to_samples(self.config.button_hold_ms, self.sample_rate);

        self.buffers.set_register(tags::SCALE_CH1, scaling.channel1 * unit)?;
        self.buffers.set_register(tags::SCALE_CH2, channel2)?;
        self.buffers.set_register(tags::TRIGGER_DURATION, f64::from(trigger_samples))?;
        self.buffers.set_register(tags::BUTTON_HOLD, f64::from(hold_samples))?;
        self.buffers
            .set_register(tags::XOR_MASK, f64::from(self.config.button_xor_mask))?;
        debug!(
            trigger_samples,
            hold_samples,
            xor_mask = self.config.button_xor_mask,
            "session_registers_programmed"
        );
        Ok(())
    }

    fn teardown(&mut self) {
        let device = self.buffers.device_mut();
        device.halt();
        device.disconnect();
        self.buffers.set_status("not connected");
        warn!("device_connection_torn_down");
    }

    /// Halt and disconnect. The controller can be connected again afterwards.
    pub fn close(&mut self) {
        if !self.state.current().is_connected() {
            return;
        }
        let _span = self.span("close");
        let device = self.buffers.device_mut();
        device.halt();
        device.disconnect();
        self.buffers.set_stim_size(0);
        self.buffers.set_status("not connected");
        self.stop_sample = 0;
        self.state.force(PlaybackState::Uninitialized);
        info!("controller_closed");
    }

    // --- stimulus ---

    /// Validate and write a stimulus. Rejected payloads leave the device
    /// untouched; loading while playing is refused (pause first).
    pub fn load(&mut self, audio: &StimulusBuffer, triggers: &[Trigger]) -> Result<()> {
        let _span = self.span("load");
        self.require_connected()?;
        if self.state.current() == PlaybackState::Playing {
            return Err(Error::InvalidTransition {
                from: PlaybackState::Playing,
                to: PlaybackState::Loaded,
            });
        }
        self.state.ensure(PlaybackState::Loaded)?;

        let started = Instant::now();
        let result = self.loader.load(&mut self.buffers, audio, triggers);
        self.track(result)?;
        self.stop_sample = 0;
        self.state.transition(PlaybackState::Loaded)?;
        self.timings.record_since(op_names::LOAD, started);
        Ok(())
    }

    // --- playback ---

    /// Start playback up to `stop` (default: end of stimulus) and return
    /// immediately. Never rewinds on its own.
    pub fn play(&mut self, stop: Option<u64>) -> Result<()> {
        let _span = self.span("play");
        self.start(stop)
    }

    fn start(&mut self, stop: Option<u64>) -> Result<()> {
        self.require_connected()?;
        let stim_size = self.buffers.stim_size();
        if stim_size == 0 {
            return Err(Error::NoStimulusLoaded);
        }
        // A zero stop register means "halted" to the device; samples are 1-based.
        if stop == Some(0) {
            return Err(Error::ZeroStopPoint);
        }
        self.state.ensure(PlaybackState::Playing)?;

        let result = self.buffers.check_position(false);
        let position = self.track(result)?;
        let stop = stop.unwrap_or(stim_size);
        if stop > stim_size {
            return Err(Error::StopPointBeyondStimulus { stop, stim_size });
        }
        if stop < position.sample() {
            return Err(Error::StopPointAlreadyPassed {
                stop,
                position: position.sample(),
            });
        }

        let result = self.fire_play(stop);
        self.track(result)?;
        self.stop_sample = stop;
        self.buffers.set_status(format!("playing to index {stop}"));
        self.state.transition(PlaybackState::Playing)?;
        info!(from = position.sample(), stop, "playback_started");
        Ok(())
    }

    fn fire_play(&mut self, stop: u64) -> Result<()> {
        self.buffers.set_register(tags::STOP_SAMPLE, stop as f64)?;
        self.buffers.fire(SoftTrigger::Play)
    }

    /// Stop playback where it is. The position is kept; `play` resumes from it.
    pub fn pause(&mut self) -> Result<PlaybackPosition> {
        let _span = self.span("pause");
        self.require_connected()?;
        self.state.ensure(PlaybackState::Stopped)?;
        let result = self.halt_playback();
        self.track(result)
    }

    fn halt_playback(&mut self) -> Result<PlaybackPosition> {
        self.buffers.set_register(tags::STOP_SAMPLE, 0.0)?;
        self.buffers.sleep(PAUSE_SETTLE);
        let position = self.buffers.check_position(false)?;
        self.buffers
            .set_status(format!("stopped at index {}", position.sample()));
        self.state.transition(PlaybackState::Stopped)?;
        Ok(position)
    }

    /// Play and wait until the device reaches the stop point, polling the
    /// position every poll interval. Interruptible through [`InterruptHandle`].
    pub fn play_blocking(&mut self, stop: Option<u64>) -> Result<PlaybackPosition> {
        let run = self.interrupts.arm();
        let result = self.play_blocking_with(stop, run.token());
        if run.is_cancelled() {
            debug!(generation = run.generation(), "blocking_run_interrupted");
        }
        result
    }

    /// [`Controller::play_blocking`] with a caller-supplied cancellation token.
    ///
    /// On cancellation, timeout or any device error inside the loop the device
    /// is paused before the error is returned.
    pub fn play_blocking_with(
        &mut self,
        stop: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<PlaybackPosition> {
        let _span = self.span("play_blocking");
        self.start(stop)?;

        let started = Instant::now();
        let stop = self.stop_sample;
        let stim_size = self.buffers.stim_size();
        let poll = self.config.timing.poll_interval();
        let max_wait = self.config.timing.max_blocking_wait();
        let mut waited = Duration::ZERO;
        let mut polls = 0u64;

        let outcome = loop {
            if cancel.is_cancelled() {
                break Err(Error::Interrupted);
            }
            self.buffers.sleep(poll);
            waited += poll;
            polls += 1;
            if cancel.is_cancelled() {
                break Err(Error::Interrupted);
            }
            match self.buffers.check_position(false) {
                Ok(position) if reached_stop(position.sample(), stop, stim_size) => {
                    break Ok(position)
                }
                Ok(_) => {}
                Err(e) => break Err(e),
            }
            if let Some(max) = max_wait {
                if waited >= max {
                    break Err(Error::PlaybackTimedOut { waited });
                }
            }
        };

        match outcome {
            Ok(position) => {
                self.buffers
                    .set_status(format!("stopped at index {}", position.sample()));
                self.state.transition(PlaybackState::Stopped)?;
                self.timings.record_since(op_names::PLAY_BLOCKING, started);
                info!(polls, position = position.sample(), "blocking_playback_finished");
                Ok(position)
            }
            Err(e) => {
                warn!(error = %e, polls, "blocking_playback_aborted");
                if let Err(pause_err) = self.halt_playback() {
                    error!(error = %pause_err, "pause_after_abort_failed");
                    self.track::<()>(Err(pause_err)).ok();
                }
                self.track(Err(e))
            }
        }
    }

    /// Rewind to the start without clearing the stimulus. Response history is cleared.
    pub fn rewind(&mut self) -> Result<PlaybackPosition> {
        let _span = self.span("rewind");
        self.require_connected()?;
        let started = Instant::now();
        let result = self.buffers.reset_buffers(false);
        let position = self.track(result)?;
        self.stop_sample = 0;
        let next = if self.buffers.stim_size() > 0 {
            PlaybackState::Loaded
        } else {
            PlaybackState::Idle
        };
        self.state.transition(next)?;
        self.timings.record_since(op_names::RESET, started);
        Ok(position)
    }

    /// Rewind and clear everything; the controller returns to `Idle`.
    pub fn reset(&mut self) -> Result<PlaybackPosition> {
        let _span = self.span("reset");
        self.require_connected()?;
        let started = Instant::now();
        let result = self.buffers.reset_buffers(true);
        let position = self.track(result)?;
        self.stop_sample = 0;
        self.state.transition(PlaybackState::Idle)?;
        self.timings.record_since(op_names::RESET, started);
        Ok(position)
    }

    /// Emit an arbitrary digital event now. Not locked to the sample clock.
    pub fn send_event(&mut self, value: u32) -> Result<()> {
        let _span = self.span("send_event");
        self.require_connected()?;
        let result = self.emit_event(value);
        self.track(result)?;
        debug!(value, "event_sent");
        Ok(())
    }

    fn emit_event(&mut self, value: u32) -> Result<()> {
        self.buffers.set_register(tags::EVENT_VALUE, f64::from(value))?;
        self.buffers.sleep(EVENT_SETTLE);
        self.buffers.fire(SoftTrigger::Event)
    }

    // --- readout ---

    /// Button presses recorded since the last rewind or reset.
    pub fn button_presses(&mut self) -> Result<ButtonPresses> {
        let _span = self.span("button_presses");
        self.require_connected()?;
        let started = Instant::now();
        let result = read_button_presses(&mut self.buffers);
        let presses = self.track(result)?;
        self.timings.record_since(op_names::BUTTON_READ, started);
        Ok(presses)
    }

    /// Fully checked position. A diverging counter pair rewinds the buffers
    /// and is reported as an error.
    pub fn position(&mut self) -> Result<PlaybackPosition> {
        let _span = self.span("position");
        self.require_connected()?;
        let result = self.buffers.check_position(true);
        self.track(result)
    }

    /// Channel-1 position in seconds at the device's sample rate.
    pub fn position_seconds(&mut self) -> Result<f64> {
        let position = self.position()?;
        Ok(position.sample() as f64 / self.sample_rate)
    }

    // --- accessors ---

    pub fn state(&self) -> PlaybackState {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }

    /// Logical sample count of the loaded stimulus (pad included), 0 if empty.
    pub fn stim_size(&self) -> u64 {
        self.buffers.stim_size()
    }

    pub fn status(&self) -> &str {
        self.buffers.status()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn profile(&self) -> &ParadigmProfile {
        self.buffers.profile()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupts.clone()
    }

    pub fn timings(&self) -> std::collections::HashMap<String, TimingSummary> {
        self.timings.summary()
    }

    pub fn device(&self) -> &D {
        self.buffers.device()
    }

    fn require_connected(&self) -> Result<()> {
        if self.state.current().is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Move to `Error` when a failure leaves device contents suspect.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.taints_device() && self.state.current().is_connected() {
                error!(error = %e, "device_fault");
                self.state.force(PlaybackState::Error);
            }
        }
        result
    }
}

impl<D: Device> Drop for Controller<D> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Whether a blocking run is finished: past an explicit stop point, or wrapped
/// back to 0 when playing to the end of the stimulus.
fn reached_stop(sample: u64, stop: u64, stim_size: u64) -> bool {
    sample > stop || (stop >= stim_size && sample == 0)
}
