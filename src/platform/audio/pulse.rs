// Linux loopback capture from a PulseAudio monitor source

use super::AudioSource;
use crate::core::session::Lifecycle;
use crate::core::wait::{drive_until, Progress, WaitOutcome, EVENT_LOOP_TIMEOUT};
use crate::models::audio::{
    AudioDeviceConfig, AudioError, AudioResult, NegotiatedFormat, SampleFormat,
};
use libpulse_binding::context::{Context, FlagSet as ContextFlags, State as ContextState};
use libpulse_binding::def::BufferAttr;
use libpulse_binding::error::PAErr;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::{FlagSet as StreamFlags, PeekResult, State as StreamState, Stream};
use std::cell::RefCell;
use std::fmt::Display;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Loopback source of the default sink
const DEFAULT_MONITOR: &str = "@DEFAULT_MONITOR@";

const APPLICATION_NAME: &str = "capture-devices";

/// Pause between non-blocking mainloop iterations
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Bytes the read callback accumulated during the current pull
#[derive(Default)]
struct PullBuffer {
    bytes: Vec<u8>,
    ready: bool,
}

impl PullBuffer {
    fn reset(&mut self) {
        self.bytes.clear();
        self.ready = false;
    }
}

/// Record stream, disconnected when dropped
struct StreamGuard {
    stream: Rc<RefCell<Stream>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut stream = self.stream.borrow_mut();
        stream.set_read_callback(None);
        if stream.get_state().is_good() {
            if let Err(e) = stream.disconnect() {
                debug!("Stream disconnect failed: {}", e);
            }
        }
    }
}

/// Server connection, disconnected when dropped
struct ContextGuard {
    context: Context,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.context.disconnect();
    }
}

/// Bytes covering `buffer_ms` of 16-bit audio, used for both maxlength and fragsize
fn fragment_bytes(config: &AudioDeviceConfig) -> u32 {
    (config.sample_rate as u64 * config.channels as u64 * 2 * config.buffer_ms as u64 / 1000)
        as u32
}

fn source_name(config: &AudioDeviceConfig) -> &str {
    if config.device_id.is_empty() {
        DEFAULT_MONITOR
    } else {
        &config.device_id
    }
}

/// PulseAudio record session on one source.
///
/// Fields are declared in release order: stream, context, then the mainloop
/// both were created on.
pub struct PulseSession {
    lifecycle: Lifecycle,
    format: NegotiatedFormat,
    pull: Rc<RefCell<PullBuffer>>,
    stream: StreamGuard,
    context: ContextGuard,
    mainloop: Mainloop,
}

impl PulseSession {
    pub fn connect(config: &AudioDeviceConfig) -> AudioResult<Self> {
        let mut lifecycle = Lifecycle::new("pulse");
        lifecycle.begin()?;

        match Self::acquire(config) {
            Ok((mainloop, context, stream, pull, format)) => {
                lifecycle.ready()?;
                Ok(Self {
                    lifecycle,
                    format,
                    pull,
                    stream,
                    context,
                    mainloop,
                })
            }
            Err(e) => {
                lifecycle.fail(&e.to_string());
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn acquire(
        config: &AudioDeviceConfig,
    ) -> AudioResult<(
        Mainloop,
        ContextGuard,
        StreamGuard,
        Rc<RefCell<PullBuffer>>,
        NegotiatedFormat,
    )> {
        let channels = u8::try_from(config.channels).map_err(|_| {
            AudioError::InvalidConfig(format!("{} channels", config.channels))
        })?;
        let spec = Spec {
            format: Format::S16le,
            rate: config.sample_rate,
            channels,
        };
        if !spec.is_valid() {
            return Err(AudioError::InvalidConfig(format!(
                "PulseAudio rejects {} Hz with {} channels",
                config.sample_rate, config.channels
            )));
        }

        let mut mainloop = Mainloop::new().ok_or_else(|| {
            AudioError::ResourceAcquisition("Failed to create PulseAudio mainloop".to_string())
        })?;

        let context = Context::new(&mainloop, APPLICATION_NAME).ok_or_else(|| {
            AudioError::ResourceAcquisition("Failed to create PulseAudio context".to_string())
        })?;
        let mut context = ContextGuard { context };

        context
            .context
            .connect(None, ContextFlags::NOFLAGS, None)
            .map_err(|e| {
                AudioError::ResourceAcquisition(format!("Failed to connect to PulseAudio: {}", e))
            })?;

        wait_until_ready(&mut mainloop, "context", || match context.context.get_state() {
            ContextState::Ready => Progress::Done(()),
            ContextState::Failed | ContextState::Terminated => Progress::Failed(format!(
                "PulseAudio context failed: {}",
                context.context.errno()
            )),
            _ => Progress::Pending,
        })?;
        debug!("PulseAudio context ready");

        let stream = Stream::new(&mut context.context, "record", &spec, None).ok_or_else(|| {
            AudioError::ResourceAcquisition("Failed to create PulseAudio stream".to_string())
        })?;
        let stream = StreamGuard {
            stream: Rc::new(RefCell::new(stream)),
        };

        let pull = Rc::new(RefCell::new(PullBuffer::default()));
        install_read_callback(&stream.stream, &pull);

        let fragment = fragment_bytes(config);
        let attr = BufferAttr {
            maxlength: fragment,
            tlength: u32::MAX,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: fragment,
        };
        let source = source_name(config);

        stream
            .stream
            .borrow_mut()
            .connect_record(
                Some(source),
                Some(&attr),
                StreamFlags::ADJUST_LATENCY | StreamFlags::AUTO_TIMING_UPDATE,
            )
            .map_err(|e| {
                AudioError::DeviceNotFound(format!("Failed to record from {}: {}", source, e))
            })?;

        wait_until_ready(&mut mainloop, "stream", || {
            match stream.stream.borrow().get_state() {
                StreamState::Ready => Progress::Done(()),
                StreamState::Failed | StreamState::Terminated => Progress::Failed(format!(
                    "PulseAudio stream for {} failed: {}",
                    source,
                    context.context.errno()
                )),
                _ => Progress::Pending,
            }
        })?;

        // The server may settle on a different fragment size than requested
        let frame_bytes = 2 * config.channels as u32;
        let granted = stream
            .stream
            .borrow_mut()
            .get_buffer_attr()
            .map(|attr| attr.fragsize)
            .filter(|size| *size > 0 && *size != u32::MAX)
            .unwrap_or(fragment);

        let format = NegotiatedFormat {
            sample_rate: config.sample_rate,
            channels: config.channels,
            sample_format: SampleFormat::S16,
            buffer_frames: (granted / frame_bytes).max(1),
        };
        debug!(source, fragsize = granted, "PulseAudio stream ready");

        Ok((mainloop, context, stream, pull, format))
    }
}

/// Iterate `mainloop` until `check` settles, within the event loop budget
fn wait_until_ready<F>(mainloop: &mut Mainloop, what: &str, mut check: F) -> AudioResult<()>
where
    F: FnMut() -> Progress<()>,
{
    let outcome = drive_until(EVENT_LOOP_TIMEOUT, || {
        if let IterateResult::Quit(_) | IterateResult::Err(_) = mainloop.iterate(false) {
            return Progress::Failed("PulseAudio mainloop stopped".to_string());
        }
        match check() {
            Progress::Pending => {
                std::thread::sleep(POLL_INTERVAL);
                Progress::Pending
            }
            settled => settled,
        }
    });

    match outcome {
        WaitOutcome::Done(()) => Ok(()),
        WaitOutcome::Failed(reason) => Err(AudioError::ResourceAcquisition(reason)),
        WaitOutcome::TimedOut(elapsed) => {
            warn!(what, ?elapsed, "PulseAudio connection timed out");
            Err(AudioError::Timeout(elapsed.as_millis() as u64))
        }
    }
}

/// Result of one peek at the record stream
enum Fragment<'a> {
    Data(&'a [u8]),
    /// Bytes the server lost, nothing to read
    Hole(usize),
    Empty,
}

/// Read side of a record stream: peek at the current fragment, then discard it
trait RecordFragments {
    type Error: Display;

    fn peek(&mut self) -> Result<Fragment<'_>, Self::Error>;

    fn discard(&mut self) -> Result<(), Self::Error>;
}

impl RecordFragments for Stream {
    type Error = PAErr;

    fn peek(&mut self) -> Result<Fragment<'_>, PAErr> {
        Ok(match Stream::peek(self)? {
            PeekResult::Data(data) => Fragment::Data(data),
            PeekResult::Hole(size) => Fragment::Hole(size),
            PeekResult::Empty => Fragment::Empty,
        })
    }

    fn discard(&mut self) -> Result<(), PAErr> {
        Stream::discard(self)
    }
}

/// Move the current fragment into `pull`. Data and holes are discarded exactly
/// once; an empty or failed peek took nothing and is left alone.
fn on_readable<R: RecordFragments>(source: &mut R, pull: &mut PullBuffer) {
    let acknowledge = match source.peek() {
        Ok(Fragment::Data(data)) => {
            pull.bytes.extend_from_slice(data);
            pull.ready = true;
            true
        }
        Ok(Fragment::Hole(size)) => {
            debug!(size, "Hole in PulseAudio record stream");
            true
        }
        Ok(Fragment::Empty) => false,
        Err(e) => {
            warn!("Failed to read from PulseAudio stream: {}", e);
            false
        }
    };

    if acknowledge {
        if let Err(e) = source.discard() {
            warn!("Failed to drop PulseAudio fragment: {}", e);
        }
    }
}

fn install_read_callback(stream: &Rc<RefCell<Stream>>, pull: &Rc<RefCell<PullBuffer>>) {
    let weak: Weak<RefCell<Stream>> = Rc::downgrade(stream);
    let pull = Rc::clone(pull);

    stream
        .borrow_mut()
        .set_read_callback(Some(Box::new(move |_readable: usize| {
            let Some(stream) = weak.upgrade() else {
                return;
            };
            on_readable(&mut *stream.borrow_mut(), &mut pull.borrow_mut());
        })));
}

enum PullEvent {
    Data,
    StreamEnded,
}

impl AudioSource for PulseSession {
    fn format(&self) -> NegotiatedFormat {
        self.format
    }

    fn read_raw(&mut self, out: &mut Vec<u8>) -> AudioResult<()> {
        out.clear();
        self.lifecycle.ensure_ready()?;
        self.pull.borrow_mut().reset();

        let mainloop = &mut self.mainloop;
        let stream = &self.stream.stream;
        let context = &self.context.context;
        let pull = &self.pull;

        let outcome = drive_until(EVENT_LOOP_TIMEOUT, || {
            if let IterateResult::Quit(_) | IterateResult::Err(_) = mainloop.iterate(false) {
                return Progress::Failed("PulseAudio mainloop stopped".to_string());
            }
            if pull.borrow().ready {
                return Progress::Done(PullEvent::Data);
            }
            match stream.borrow().get_state() {
                StreamState::Terminated => Progress::Done(PullEvent::StreamEnded),
                StreamState::Failed => {
                    Progress::Failed(format!("PulseAudio stream failed: {}", context.errno()))
                }
                _ => {
                    std::thread::sleep(POLL_INTERVAL);
                    Progress::Pending
                }
            }
        });

        match outcome {
            WaitOutcome::Done(PullEvent::Data) => {
                out.extend_from_slice(&self.pull.borrow().bytes);
                Ok(())
            }
            WaitOutcome::Done(PullEvent::StreamEnded) => {
                self.lifecycle.terminate();
                Err(AudioError::NotConnected(
                    "PulseAudio stream terminated by the server".to_string(),
                ))
            }
            WaitOutcome::Failed(reason) => {
                self.lifecycle.fail(&reason);
                Err(AudioError::CaptureFailed(reason))
            }
            WaitOutcome::TimedOut(elapsed) => {
                Err(AudioError::Timeout(elapsed.as_millis() as u64))
            }
        }
    }
}
