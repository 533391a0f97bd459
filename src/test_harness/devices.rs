use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::encoding::device::{DeviceResult, OutputBuffer};
use crate::encoding::{
    BufferFlags, BufferInfo, ContainerFormat, ContainerMuxer, DeviceFactory, EncoderFormat, HardwareEncoder,
    InputDequeue, OutputDequeue, TrackFormat, MIME_VIDEO_AVC,
};
use crate::error::DeviceError;

/// Bytes the mock puts in front of every encoded payload; muxed samples must not contain them
pub const SAMPLE_PREFIX: [u8; 4] = [0xAA; 4];

/// Start code at the beginning of every mock payload
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

// ── Encoder ─────────────────────────────────────────────────────────

/// Behaviour knobs for [`MockEncoder`]
#[derive(Debug, Clone)]
pub struct MockEncoderConfig {
    pub input_slots: usize,
    /// Capacity of each input slot; defaults to one planar frame
    pub input_capacity: Option<usize>,
    /// Announce the output format before the first output buffer
    pub announce_format: bool,
    pub fail_start: bool,
    /// `stop()` reports failure (the encoder still stops)
    pub fail_stop: bool,
    /// `release()` reports failure (the handle is still released)
    pub fail_release: bool,
}

impl Default for MockEncoderConfig {
    fn default() -> Self {
        Self {
            input_slots: 4,
            input_capacity: None,
            announce_format: true,
            fail_start: false,
            fail_stop: false,
            fail_release: false,
        }
    }
}

/// One entry in the encoder call journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderCall {
    Configure,
    Start,
    Stop,
    Release,
    DequeueInput,
    InputBuffer(usize),
    QueueInput {
        index: usize,
        size: usize,
        pts_us: i64,
        flags: BufferFlags,
    },
    DequeueOutput,
    OutputBuffer(usize),
    OutputFormat,
    ReleaseOutput(usize),
}

#[derive(Debug)]
struct EncoderState {
    config: MockEncoderConfig,
    format: Option<EncoderFormat>,
    started: bool,
    released: bool,
    starved: bool,
    free_inputs: VecDeque<usize>,
    queued_inputs: usize,
    outstanding_outputs: usize,
    calls: Vec<EncoderCall>,
}

#[derive(Debug, Clone)]
struct Sample {
    data: Vec<u8>,
    info: BufferInfo,
}

/// In-memory encoder with one frame of output latency.
///
/// Each queued frame becomes a fake H.264 access unit once the next frame
/// (or end-of-stream) is queued. End-of-stream is set on the held-back last
/// frame, so the final sample carries both data and the flag.
pub struct MockEncoder {
    state: Arc<Mutex<EncoderState>>,
    inputs: Vec<Vec<u8>>,
    held: Option<Sample>,
    ready: VecDeque<Sample>,
    outputs: HashMap<usize, Sample>,
    next_output: usize,
    frames_seen: u64,
    format_announced: bool,
    eos_queued: bool,
}

type StateGuard<'a> = parking_lot::MutexGuard<'a, EncoderState>;

/// Journal the call and refuse it once released
fn enter(state: &Mutex<EncoderState>, call: EncoderCall) -> DeviceResult<StateGuard<'_>> {
    let mut state = state.lock();
    state.calls.push(call);
    if state.released {
        return Err(DeviceError::Released);
    }
    Ok(state)
}

fn require_started(state: &Mutex<EncoderState>, call: EncoderCall) -> DeviceResult<StateGuard<'_>> {
    let state = enter(state, call)?;
    if !state.started {
        return Err(DeviceError::InvalidState("encoder not started"));
    }
    Ok(state)
}

impl MockEncoder {
    pub fn new(config: MockEncoderConfig) -> (Self, MockEncoderProbe) {
        let state = Arc::new(Mutex::new(EncoderState {
            config,
            format: None,
            started: false,
            released: false,
            starved: false,
            free_inputs: VecDeque::new(),
            queued_inputs: 0,
            outstanding_outputs: 0,
            calls: Vec::new(),
        }));
        let encoder = Self {
            state: state.clone(),
            inputs: Vec::new(),
            held: None,
            ready: VecDeque::new(),
            outputs: HashMap::new(),
            next_output: 0,
            frames_seen: 0,
            format_announced: false,
            eos_queued: false,
        };
        (encoder, MockEncoderProbe { state })
    }

    fn checked_out(state: &EncoderState, inputs: usize, index: usize) -> DeviceResult<()> {
        if index >= inputs || state.free_inputs.contains(&index) {
            return Err(DeviceError::InvalidIndex(index));
        }
        Ok(())
    }

    fn key_frame_every(&self) -> u64 {
        let state = self.state.lock();
        state
            .format
            .as_ref()
            .map(|f| (f.key_frame_interval_secs as u64 * f.frame_rate as u64).max(1))
            .unwrap_or(1)
    }

    fn encode(&mut self, index: usize, size: usize, pts_us: i64) {
        let key = self.frames_seen % self.key_frame_every() == 0;
        self.frames_seen += 1;

        let mut data = SAMPLE_PREFIX.to_vec();
        data.extend_from_slice(&START_CODE);
        data.extend_from_slice(&self.inputs[index][..size.min(16)]);
        let info = BufferInfo {
            offset: SAMPLE_PREFIX.len(),
            size: data.len() - SAMPLE_PREFIX.len(),
            presentation_time_us: pts_us,
            flags: if key { BufferFlags::KEY_FRAME } else { BufferFlags::empty() },
        };

        if let Some(previous) = self.held.replace(Sample { data, info }) {
            self.ready.push_back(previous);
        }
    }

    fn end_stream(&mut self, pts_us: i64) {
        let last = match self.held.take() {
            Some(mut sample) => {
                sample.info.flags |= BufferFlags::END_OF_STREAM;
                sample
            }
            None => Sample {
                data: Vec::new(),
                info: BufferInfo {
                    offset: 0,
                    size: 0,
                    presentation_time_us: pts_us,
                    flags: BufferFlags::END_OF_STREAM,
                },
            },
        };
        self.ready.push_back(last);
        self.eos_queued = true;
    }
}

impl HardwareEncoder for MockEncoder {
    fn configure(&mut self, format: &EncoderFormat) -> DeviceResult<()> {
        let mut state = enter(&self.state, EncoderCall::Configure)?;
        if state.started {
            return Err(DeviceError::InvalidState("configure while started"));
        }
        let frame_len = format.width as usize * format.height as usize * 3 / 2;
        let capacity = state.config.input_capacity.unwrap_or(frame_len);
        let slots = state.config.input_slots;
        state.format = Some(format.clone());
        state.free_inputs = (0..slots).collect();
        drop(state);
        self.inputs = vec![vec![0; capacity]; slots];
        Ok(())
    }

    fn start(&mut self) -> DeviceResult<()> {
        let mut state = enter(&self.state, EncoderCall::Start)?;
        if state.config.fail_start {
            return Err(DeviceError::Backend("mock encoder refused to start".into()));
        }
        if state.format.is_none() {
            return Err(DeviceError::InvalidState("encoder not configured"));
        }
        state.started = true;
        Ok(())
    }

    fn stop(&mut self) -> DeviceResult<()> {
        let mut state = enter(&self.state, EncoderCall::Stop)?;
        state.started = false;
        if state.config.fail_stop {
            return Err(DeviceError::Backend("mock encoder stop failed".into()));
        }
        Ok(())
    }

    fn release(&mut self) -> DeviceResult<()> {
        let mut state = enter(&self.state, EncoderCall::Release)?;
        state.released = true;
        state.started = false;
        if state.config.fail_release {
            return Err(DeviceError::Backend("mock encoder release failed".into()));
        }
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> DeviceResult<InputDequeue> {
        let mut state = require_started(&self.state, EncoderCall::DequeueInput)?;
        if state.starved {
            return Ok(InputDequeue::TryAgainLater);
        }
        Ok(match state.free_inputs.pop_front() {
            Some(index) => InputDequeue::Slot(index),
            None => InputDequeue::TryAgainLater,
        })
    }

    fn input_buffer(&mut self, index: usize) -> DeviceResult<&mut [u8]> {
        {
            let state = require_started(&self.state, EncoderCall::InputBuffer(index))?;
            Self::checked_out(&state, self.inputs.len(), index)?;
        }
        Ok(&mut self.inputs[index][..])
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> DeviceResult<()> {
        {
            let mut state = require_started(&self.state, EncoderCall::QueueInput {
                index,
                size,
                pts_us: presentation_time_us,
                flags,
            })?;
            Self::checked_out(&state, self.inputs.len(), index)?;
            if size > self.inputs[index].len() {
                return Err(DeviceError::Backend(format!(
                    "queued {} bytes into a {} byte slot",
                    size,
                    self.inputs[index].len()
                )));
            }
            if self.eos_queued {
                return Err(DeviceError::InvalidState("input queued after end of stream"));
            }
            state.free_inputs.push_back(index);
            if size > 0 {
                state.queued_inputs += 1;
            }
        }

        if flags.contains(BufferFlags::END_OF_STREAM) {
            self.end_stream(presentation_time_us);
        } else if size > 0 {
            self.encode(index, size, presentation_time_us);
        }
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> DeviceResult<OutputDequeue> {
        let mut state = require_started(&self.state, EncoderCall::DequeueOutput)?;
        if state.config.announce_format && !self.format_announced && (self.frames_seen > 0 || self.eos_queued) {
            self.format_announced = true;
            return Ok(OutputDequeue::FormatChanged);
        }
        match self.ready.pop_front() {
            Some(sample) => {
                let index = self.next_output;
                self.next_output += 1;
                self.outputs.insert(index, sample);
                state.outstanding_outputs += 1;
                Ok(OutputDequeue::Buffer(index))
            }
            None => Ok(OutputDequeue::TryAgainLater),
        }
    }

    fn output_buffer(&mut self, index: usize) -> DeviceResult<OutputBuffer<'_>> {
        drop(enter(&self.state, EncoderCall::OutputBuffer(index))?);
        let sample = self.outputs.get(&index).ok_or(DeviceError::InvalidIndex(index))?;
        Ok(OutputBuffer {
            data: &sample.data,
            info: sample.info,
        })
    }

    fn output_format(&mut self) -> DeviceResult<TrackFormat> {
        let state = enter(&self.state, EncoderCall::OutputFormat)?;
        let format = match (&state.format, self.format_announced) {
            (Some(format), true) => format,
            _ => return Err(DeviceError::InvalidState("output format not available yet")),
        };
        Ok(TrackFormat {
            mime: format.mime.clone(),
            width: format.width,
            height: format.height,
            frame_rate: format.frame_rate,
            codec_specific_data: vec![0x01, 0x42, 0xC0, 0x1F],
        })
    }

    fn release_output_buffer(&mut self, index: usize, _render: bool) -> DeviceResult<()> {
        let mut state = enter(&self.state, EncoderCall::ReleaseOutput(index))?;
        if self.outputs.remove(&index).is_none() {
            return Err(DeviceError::InvalidIndex(index));
        }
        state.outstanding_outputs -= 1;
        Ok(())
    }
}

/// Test-side view of a [`MockEncoder`] that outlives the session owning it
#[derive(Clone)]
pub struct MockEncoderProbe {
    state: Arc<Mutex<EncoderState>>,
}

impl MockEncoderProbe {
    pub fn configured_format(&self) -> Option<EncoderFormat> {
        self.state.lock().format.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    pub fn calls(&self) -> Vec<EncoderCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Frames accepted with a non-empty payload
    pub fn queued_inputs(&self) -> usize {
        self.state.lock().queued_inputs
    }

    pub fn free_input_slots(&self) -> usize {
        self.state.lock().free_inputs.len()
    }

    pub fn outstanding_output_buffers(&self) -> usize {
        self.state.lock().outstanding_outputs
    }

    /// Make every input dequeue time out
    pub fn set_input_starved(&self, starved: bool) {
        self.state.lock().starved = starved;
    }

    /// What an input dequeue would return now, without taking a slot
    pub fn probe_dequeue_input(&self) -> DeviceResult<InputDequeue> {
        let state = self.state.lock();
        if state.released {
            return Err(DeviceError::Released);
        }
        Ok(match state.free_inputs.front() {
            Some(&index) if !state.starved => InputDequeue::Slot(index),
            _ => InputDequeue::TryAgainLater,
        })
    }
}

// ── Muxer ───────────────────────────────────────────────────────────

/// One entry in the muxer call journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxerCall {
    AddTrack(TrackFormat),
    Start,
    Write { track: usize, size: usize, pts_us: i64 },
    Stop,
    Release,
}

/// A sample as the muxer received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSample {
    pub track: usize,
    pub data: Vec<u8>,
    pub info: BufferInfo,
}

#[derive(Debug)]
struct MuxerState {
    path: PathBuf,
    tracks: Vec<TrackFormat>,
    started: bool,
    released: bool,
    fail_stop: bool,
    fail_release: bool,
    samples: Vec<RecordedSample>,
    calls: Vec<MuxerCall>,
}

/// Muxer that records what it is given and enforces call order
pub struct MockMuxer {
    state: Arc<Mutex<MuxerState>>,
}

impl MockMuxer {
    pub fn new(path: &Path) -> (Self, MockMuxerProbe) {
        let state = Arc::new(Mutex::new(MuxerState {
            path: path.to_path_buf(),
            tracks: Vec::new(),
            started: false,
            released: false,
            fail_stop: false,
            fail_release: false,
            samples: Vec::new(),
            calls: Vec::new(),
        }));
        (Self { state: state.clone() }, MockMuxerProbe { state })
    }

    fn enter(&self, call: MuxerCall) -> DeviceResult<parking_lot::MutexGuard<'_, MuxerState>> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.released {
            return Err(DeviceError::Released);
        }
        Ok(state)
    }
}

impl ContainerMuxer for MockMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> DeviceResult<usize> {
        let mut state = self.enter(MuxerCall::AddTrack(format.clone()))?;
        if state.started {
            return Err(DeviceError::InvalidState("track added after start"));
        }
        state.tracks.push(format.clone());
        Ok(state.tracks.len() - 1)
    }

    fn start(&mut self) -> DeviceResult<()> {
        let mut state = self.enter(MuxerCall::Start)?;
        if state.tracks.is_empty() {
            return Err(DeviceError::InvalidState("muxer started without tracks"));
        }
        state.started = true;
        Ok(())
    }

    fn write_sample_data(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> DeviceResult<()> {
        let mut state = self.enter(MuxerCall::Write {
            track,
            size: data.len(),
            pts_us: info.presentation_time_us,
        })?;
        if !state.started {
            return Err(DeviceError::InvalidState("sample written before start"));
        }
        if track >= state.tracks.len() {
            return Err(DeviceError::InvalidIndex(track));
        }
        if data.len() != info.size {
            return Err(DeviceError::Backend(format!(
                "sample is {} bytes but info says {}",
                data.len(),
                info.size
            )));
        }
        state.samples.push(RecordedSample {
            track,
            data: data.to_vec(),
            info: *info,
        });
        Ok(())
    }

    fn stop(&mut self) -> DeviceResult<()> {
        let mut state = self.enter(MuxerCall::Stop)?;
        if !state.started {
            return Err(DeviceError::InvalidState("muxer not started"));
        }
        state.started = false;
        if state.fail_stop {
            return Err(DeviceError::Backend("mock muxer failed to finalize".into()));
        }
        Ok(())
    }

    fn release(&mut self) -> DeviceResult<()> {
        let mut state = self.enter(MuxerCall::Release)?;
        state.released = true;
        if state.fail_release {
            return Err(DeviceError::Backend("mock muxer release failed".into()));
        }
        Ok(())
    }
}

/// Test-side view of a [`MockMuxer`]
#[derive(Clone)]
pub struct MockMuxerProbe {
    state: Arc<Mutex<MuxerState>>,
}

impl MockMuxerProbe {
    pub fn path(&self) -> PathBuf {
        self.state.lock().path.clone()
    }

    pub fn tracks(&self) -> Vec<TrackFormat> {
        self.state.lock().tracks.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    pub fn samples(&self) -> Vec<RecordedSample> {
        self.state.lock().samples.clone()
    }

    pub fn calls(&self) -> Vec<MuxerCall> {
        self.state.lock().calls.clone()
    }

    pub fn fail_stop(&self, fail: bool) {
        self.state.lock().fail_stop = fail;
    }

    pub fn fail_release(&self, fail: bool) {
        self.state.lock().fail_release = fail;
    }
}

// ── Factory ─────────────────────────────────────────────────────────

/// Hands out mock devices and keeps a probe for each one created
pub struct MockDeviceFactory {
    config: MockEncoderConfig,
    encoders: Mutex<Vec<MockEncoderProbe>>,
    muxers: Mutex<Vec<MockMuxerProbe>>,
    fail_muxer: AtomicBool,
}

impl MockDeviceFactory {
    pub fn new() -> Self {
        Self::with_config(MockEncoderConfig::default())
    }

    pub fn with_config(config: MockEncoderConfig) -> Self {
        Self {
            config,
            encoders: Mutex::new(Vec::new()),
            muxers: Mutex::new(Vec::new()),
            fail_muxer: AtomicBool::new(false),
        }
    }

    pub fn fail_muxer_creation(&self, fail: bool) {
        self.fail_muxer.store(fail, Ordering::SeqCst);
    }

    /// Probe for the `index`th encoder created. Panics if there is none.
    pub fn encoder(&self, index: usize) -> MockEncoderProbe {
        self.encoders.lock()[index].clone()
    }

    /// Probe for the `index`th muxer created. Panics if there is none.
    pub fn muxer(&self, index: usize) -> MockMuxerProbe {
        self.muxers.lock()[index].clone()
    }

    pub fn encoders_created(&self) -> usize {
        self.encoders.lock().len()
    }

    pub fn muxers_created(&self) -> usize {
        self.muxers.lock().len()
    }
}

impl Default for MockDeviceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceFactory for MockDeviceFactory {
    fn create_encoder(&self, mime: &str) -> DeviceResult<Box<dyn HardwareEncoder>> {
        if mime != MIME_VIDEO_AVC {
            return Err(DeviceError::Backend(format!("no mock encoder for {}", mime)));
        }
        let (encoder, probe) = MockEncoder::new(self.config.clone());
        self.encoders.lock().push(probe);
        Ok(Box::new(encoder))
    }

    fn create_muxer(&self, path: &Path, _container: ContainerFormat) -> DeviceResult<Box<dyn ContainerMuxer>> {
        if self.fail_muxer.load(Ordering::SeqCst) {
            return Err(DeviceError::Backend(format!("cannot open {:?}", path)));
        }
        let (muxer, probe) = MockMuxer::new(path);
        self.muxers.lock().push(probe);
        Ok(Box::new(muxer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{EncodingOptions, Resolution};

    fn configured() -> (MockEncoder, MockEncoderProbe) {
        let (mut encoder, probe) = MockEncoder::new(MockEncoderConfig::default());
        let options = EncodingOptions::new(Resolution::new(4, 2, 30).unwrap(), "/tmp", "m.mp4");
        encoder.configure(&EncoderFormat::avc(&options)).unwrap();
        encoder.start().unwrap();
        (encoder, probe)
    }

    fn queue_frame(encoder: &mut MockEncoder, pts: i64) {
        let InputDequeue::Slot(index) = encoder.dequeue_input_buffer(Duration::ZERO).unwrap() else {
            panic!("no input slot");
        };
        encoder.input_buffer(index).unwrap().fill(7);
        encoder.queue_input_buffer(index, 12, pts, BufferFlags::empty()).unwrap();
    }

    #[test]
    fn test_output_lags_one_frame_and_eos_rides_last_sample() {
        let (mut encoder, _probe) = configured();
        queue_frame(&mut encoder, 0);
        assert_eq!(encoder.dequeue_output_buffer(Duration::ZERO).unwrap(), OutputDequeue::FormatChanged);
        assert_eq!(encoder.dequeue_output_buffer(Duration::ZERO).unwrap(), OutputDequeue::TryAgainLater);

        queue_frame(&mut encoder, 100);
        let OutputDequeue::Buffer(first) = encoder.dequeue_output_buffer(Duration::ZERO).unwrap() else {
            panic!("expected output");
        };
        let info = encoder.output_buffer(first).unwrap().info;
        assert_eq!(info.presentation_time_us, 0);
        assert!(info.is_key_frame());
        encoder.release_output_buffer(first, false).unwrap();

        let InputDequeue::Slot(index) = encoder.dequeue_input_buffer(Duration::ZERO).unwrap() else {
            panic!("no input slot");
        };
        encoder.queue_input_buffer(index, 0, 100, BufferFlags::END_OF_STREAM).unwrap();
        let OutputDequeue::Buffer(last) = encoder.dequeue_output_buffer(Duration::ZERO).unwrap() else {
            panic!("expected output");
        };
        let buffer = encoder.output_buffer(last).unwrap();
        assert!(buffer.info.is_end_of_stream());
        assert_eq!(buffer.info.presentation_time_us, 100);
        assert_eq!(&buffer.data[buffer.info.range()][..4], &START_CODE);
    }

    #[test]
    fn test_calls_after_release_fail() {
        let (mut encoder, probe) = configured();
        encoder.release().unwrap();
        assert_eq!(encoder.dequeue_input_buffer(Duration::ZERO), Err(DeviceError::Released));
        assert_eq!(probe.probe_dequeue_input(), Err(DeviceError::Released));
        assert_eq!(probe.calls().last(), Some(&EncoderCall::DequeueInput));
    }

    #[test]
    fn test_unknown_index_rejected() {
        let (mut encoder, _probe) = configured();
        assert_eq!(
            encoder.queue_input_buffer(0, 1, 0, BufferFlags::empty()),
            Err(DeviceError::InvalidIndex(0))
        );
        assert_eq!(encoder.release_output_buffer(3, false), Err(DeviceError::InvalidIndex(3)));
    }

    #[test]
    fn test_muxer_enforces_start_before_write() {
        let (mut muxer, probe) = MockMuxer::new(Path::new("/tmp/a.mp4"));
        let info = BufferInfo {
            size: 2,
            ..Default::default()
        };
        assert!(muxer.write_sample_data(0, &[1, 2], &info).is_err());
        assert!(muxer.start().is_err());

        let track = muxer.add_track(&TrackFormat::default()).unwrap();
        muxer.start().unwrap();
        muxer.write_sample_data(track, &[1, 2], &info).unwrap();
        assert!(muxer.add_track(&TrackFormat::default()).is_err());
        assert_eq!(probe.samples().len(), 1);
    }
}
