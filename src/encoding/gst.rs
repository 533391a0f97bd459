//! GStreamer-backed encoder and muxer devices
//!
//! `GstHardwareEncoder` runs `appsrc ! queue ! videoconvert ! <h264 encoder>
//! ! h264parse ! appsink` and exposes it through the slot/buffer protocol of
//! [`HardwareEncoder`]. Encoded samples arrive on the appsink streaming
//! thread and are handed to the session over a channel.
//!
//! `GstContainerMuxer` runs `appsrc ! h264parse ! mp4mux ! filesink`; the
//! pipeline is built once the encoder has reported its output caps.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use super::device::{DeviceResult, OutputBuffer};
use super::{
    BufferFlags, BufferInfo, ContainerFormat, ContainerMuxer, DeviceFactory, EncoderFormat, HardwareEncoder,
    InputDequeue, OutputDequeue, TrackFormat, MIME_VIDEO_AVC,
};
use crate::error::DeviceError;
use crate::gstreamer_init::init_gstreamer_env;

/// H.264 encoder elements in order of preference, hardware first
pub const H264_ENCODER_PREFERENCE: &[&str] =
    &["nvh264enc", "qsvh264enc", "vah264enc", "amfh264enc", "vtenc_h264", "x264enc"];

/// Input slots handed out by the encoder
const INPUT_SLOTS: usize = 4;

/// How long `stop()` waits for the muxer to finalize the file
const FINALIZE_TIMEOUT_SECS: u64 = 5;

/// Pick the first H.264 encoder element installed
pub fn detect_best_h264_encoder() -> Option<&'static str> {
    H264_ENCODER_PREFERENCE
        .iter()
        .copied()
        .find(|name| gst::ElementFactory::find(name).is_some())
}

/// All installed H.264 encoder elements, most preferred first
pub fn available_h264_encoders() -> Vec<&'static str> {
    H264_ENCODER_PREFERENCE
        .iter()
        .copied()
        .filter(|name| gst::ElementFactory::find(name).is_some())
        .collect()
}

fn backend(context: &str, err: impl std::fmt::Display) -> DeviceError {
    DeviceError::Backend(format!("{}: {}", context, err))
}

fn make_element(factory: &str) -> DeviceResult<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| backend(&format!("Failed to create {}", factory), e))
}

/// Set a property from its string form if the element has it
fn set_if_present(element: &gst::Element, name: &str, value: &str) {
    if element.find_property(name).is_some() {
        element.set_property_from_str(name, value);
    } else {
        log::debug!("[Encoder] {:?} has no property {}", element.name(), name);
    }
}

fn h264_avc_caps() -> gst::Caps {
    gst::Caps::builder("video/x-h264")
        .field("stream-format", "avc")
        .field("alignment", "au")
        .build()
}

/// Property settings for an H.264 encoder element, as strings
///
/// Frame reordering is turned off on every element: the muxer is fed with
/// presentation timestamps only, which must not go backwards.
fn encoder_properties(element_name: &str, format: &EncoderFormat) -> Vec<(&'static str, String)> {
    // Every candidate takes kbit/s
    let kbps = (format.bitrate / 1000).max(1).to_string();
    let gop = format
        .key_frame_interval_secs
        .saturating_mul(format.frame_rate)
        .clamp(1, i32::MAX as u32)
        .to_string();

    let mut props = vec![("bitrate", kbps)];
    match element_name {
        "x264enc" => {
            props.push(("key-int-max", gop));
            props.push(("bframes", "0".to_string()));
            props.push(("speed-preset", "ultrafast".to_string()));
            if format.low_latency {
                props.push(("tune", "zerolatency".to_string()));
            }
        }
        "vah264enc" => {
            props.push(("key-int-max", gop));
            props.push(("b-frames", "0".to_string()));
        }
        "vtenc_h264" => {
            props.push(("max-keyframe-interval", gop));
            props.push(("allow-frame-reordering", "false".to_string()));
            if format.low_latency {
                props.push(("realtime", "true".to_string()));
            }
        }
        _ => {
            props.push(("gop-size", gop));
            props.push(("b-frames", "0".to_string()));
            if format.low_latency {
                props.push(("zerolatency", "true".to_string()));
            }
        }
    }
    props
}

// ── Encoder ─────────────────────────────────────────────────────────

/// What the appsink callbacks report
enum SinkEvent {
    Sample {
        data: Vec<u8>,
        info: BufferInfo,
        codec_data: Option<Vec<u8>>,
    },
    Eos,
}

struct Sample {
    data: Vec<u8>,
    info: BufferInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncoderPhase {
    Created,
    Configured,
    Started,
    Stopped,
    Released,
}

struct EncoderPipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    events: Receiver<SinkEvent>,
}

/// H.264 encoder running as a GStreamer pipeline
pub struct GstHardwareEncoder {
    element_name: &'static str,
    phase: EncoderPhase,
    format: Option<EncoderFormat>,
    pipeline: Option<EncoderPipeline>,
    inputs: Vec<Vec<u8>>,
    free_inputs: VecDeque<usize>,
    track_format: Option<TrackFormat>,
    /// Last sample seen, kept back so end-of-stream can be set on it
    held: Option<Sample>,
    ready: VecDeque<Sample>,
    outputs: HashMap<usize, Sample>,
    next_output: usize,
    eos_sent: bool,
    eos_received: bool,
}

impl GstHardwareEncoder {
    pub fn new(element_name: &'static str) -> Self {
        Self {
            element_name,
            phase: EncoderPhase::Created,
            format: None,
            pipeline: None,
            inputs: Vec::new(),
            free_inputs: VecDeque::new(),
            track_format: None,
            held: None,
            ready: VecDeque::new(),
            outputs: HashMap::new(),
            next_output: 0,
            eos_sent: false,
            eos_received: false,
        }
    }

    fn check_alive(&self) -> DeviceResult<()> {
        if self.phase == EncoderPhase::Released {
            return Err(DeviceError::Released);
        }
        Ok(())
    }

    fn running(&mut self) -> DeviceResult<&mut EncoderPipeline> {
        self.check_alive()?;
        if self.phase != EncoderPhase::Started {
            return Err(DeviceError::InvalidState("encoder not started"));
        }
        self.pipeline
            .as_mut()
            .ok_or(DeviceError::InvalidState("encoder has no pipeline"))
    }

    fn checked_out(&self, index: usize) -> DeviceResult<()> {
        if index >= self.inputs.len() || self.free_inputs.contains(&index) {
            return Err(DeviceError::InvalidIndex(index));
        }
        Ok(())
    }

    fn create_encoder_element(&self, format: &EncoderFormat) -> DeviceResult<gst::Element> {
        let encoder = make_element(self.element_name)?;
        for (name, value) in encoder_properties(self.element_name, format) {
            set_if_present(&encoder, name, &value);
        }
        if format.priority != 0 {
            log::debug!("[Encoder] Priority {} has no GStreamer equivalent, ignored", format.priority);
        }
        Ok(encoder)
    }

    fn create_pipeline(&self, format: &EncoderFormat) -> DeviceResult<EncoderPipeline> {
        let pipeline = gst::Pipeline::new();
        let frame_len = format.width as usize * format.height as usize * 3 / 2;

        // NV12 matches the converter's interleaved chroma plane
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "NV12")
            .field("width", format.width as i32)
            .field("height", format.height as i32)
            .field("framerate", gst::Fraction::new(format.frame_rate as i32, 1))
            .build();

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&caps)
            .format(gst::Format::Time)
            .is_live(true)
            .max_bytes((frame_len * INPUT_SLOTS) as u64)
            .stream_type(gst_app::AppStreamType::Stream)
            .build();

        let queue = gst::ElementFactory::make("queue")
            .property("max-size-buffers", INPUT_SLOTS as u32)
            .property("max-size-time", 0u64)
            .property("max-size-bytes", 0u32)
            .build()
            .map_err(|e| backend("Failed to create queue", e))?;
        let videoconvert = make_element("videoconvert")?;
        let encoder = self.create_encoder_element(format)?;
        let parser = make_element("h264parse")?;
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", h264_avc_caps())
            .build()
            .map_err(|e| backend("Failed to create capsfilter", e))?;
        let appsink = gst_app::AppSink::builder().name("sink").sync(false).build();

        pipeline
            .add_many([
                appsrc.upcast_ref::<gst::Element>(),
                &queue,
                &videoconvert,
                &encoder,
                &parser,
                &capsfilter,
                appsink.upcast_ref::<gst::Element>(),
            ])
            .map_err(|e| backend("Failed to add elements", e))?;
        gst::Element::link_many([
            appsrc.upcast_ref::<gst::Element>(),
            &queue,
            &videoconvert,
            &encoder,
            &parser,
            &capsfilter,
            appsink.upcast_ref::<gst::Element>(),
        ])
        .map_err(|e| backend("Failed to link elements", e))?;

        let (sender, events) = crossbeam_channel::unbounded();
        let eos_sender = sender.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let Some(buffer) = sample.buffer() else {
                        return Ok(gst::FlowSuccess::Ok);
                    };
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let data = map.as_slice().to_vec();

                    let mut flags = BufferFlags::empty();
                    if !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT) {
                        flags |= BufferFlags::KEY_FRAME;
                    }
                    if buffer.flags().contains(gst::BufferFlags::HEADER) {
                        flags |= BufferFlags::CODEC_CONFIG;
                    }
                    let info = BufferInfo {
                        offset: 0,
                        size: data.len(),
                        presentation_time_us: buffer.pts().map(|t| t.useconds() as i64).unwrap_or(0),
                        flags,
                    };

                    let event = SinkEvent::Sample {
                        data,
                        info,
                        codec_data: codec_data(&sample),
                    };
                    sender.send(event).map_err(|_| gst::FlowError::Flushing)?;
                    Ok(gst::FlowSuccess::Ok)
                })
                .eos(move |_sink| {
                    let _ = eos_sender.send(SinkEvent::Eos);
                })
                .build(),
        );

        Ok(EncoderPipeline {
            pipeline,
            appsrc,
            events,
        })
    }

    /// Move the oldest ready sample into an output slot
    fn hand_out(&mut self) -> Option<usize> {
        let sample = self.ready.pop_front()?;
        let index = self.next_output;
        self.next_output += 1;
        self.outputs.insert(index, sample);
        Some(index)
    }

    fn finish_stream(&mut self) {
        self.eos_received = true;
        let last = match self.held.take() {
            Some(mut sample) => {
                sample.info.flags |= BufferFlags::END_OF_STREAM;
                sample
            }
            None => Sample {
                data: Vec::new(),
                info: BufferInfo {
                    flags: BufferFlags::END_OF_STREAM,
                    ..Default::default()
                },
            },
        };
        self.ready.push_back(last);
    }

    fn shutdown_pipeline(&mut self) {
        if let Some(running) = self.pipeline.take() {
            if let Err(e) = running.pipeline.set_state(gst::State::Null) {
                log::warn!("[Encoder] Failed to stop pipeline: {:?}", e);
            }
        }
    }
}

fn codec_data(sample: &gst::Sample) -> Option<Vec<u8>> {
    let caps = sample.caps()?;
    let structure = caps.structure(0)?;
    let buffer = structure.get::<gst::Buffer>("codec_data").ok()?;
    let map = buffer.map_readable().ok()?;
    Some(map.as_slice().to_vec())
}

impl HardwareEncoder for GstHardwareEncoder {
    fn configure(&mut self, format: &EncoderFormat) -> DeviceResult<()> {
        self.check_alive()?;
        if self.phase != EncoderPhase::Created {
            return Err(DeviceError::InvalidState("encoder already configured"));
        }
        if format.mime != MIME_VIDEO_AVC {
            return Err(DeviceError::Backend(format!("unsupported mime {}", format.mime)));
        }

        let pipeline = self.create_pipeline(format)?;
        let frame_len = format.width as usize * format.height as usize * 3 / 2;
        self.inputs = vec![vec![0; frame_len]; INPUT_SLOTS];
        self.free_inputs = (0..INPUT_SLOTS).collect();
        self.pipeline = Some(pipeline);
        self.format = Some(format.clone());
        self.phase = EncoderPhase::Configured;

        log::debug!(
            "[Encoder] {} configured for {}x{}@{} at {} bps",
            self.element_name,
            format.width,
            format.height,
            format.frame_rate,
            format.bitrate
        );
        Ok(())
    }

    fn start(&mut self) -> DeviceResult<()> {
        self.check_alive()?;
        if self.phase != EncoderPhase::Configured {
            return Err(DeviceError::InvalidState("encoder not configured"));
        }
        let running = self
            .pipeline
            .as_ref()
            .ok_or(DeviceError::InvalidState("encoder has no pipeline"))?;
        running
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| backend("Failed to start pipeline", format!("{:?}", e)))?;
        self.phase = EncoderPhase::Started;
        Ok(())
    }

    fn stop(&mut self) -> DeviceResult<()> {
        self.check_alive()?;
        self.shutdown_pipeline();
        self.phase = EncoderPhase::Stopped;
        Ok(())
    }

    fn release(&mut self) -> DeviceResult<()> {
        self.check_alive()?;
        self.shutdown_pipeline();
        self.inputs.clear();
        self.outputs.clear();
        self.ready.clear();
        self.held = None;
        self.phase = EncoderPhase::Released;
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> DeviceResult<InputDequeue> {
        let running = self.running()?;
        if running.appsrc.current_level_bytes() >= running.appsrc.max_bytes() {
            return Ok(InputDequeue::TryAgainLater);
        }
        Ok(match self.free_inputs.pop_front() {
            Some(index) => InputDequeue::Slot(index),
            None => InputDequeue::TryAgainLater,
        })
    }

    fn input_buffer(&mut self, index: usize) -> DeviceResult<&mut [u8]> {
        self.running()?;
        self.checked_out(index)?;
        Ok(&mut self.inputs[index][..])
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> DeviceResult<()> {
        self.running()?;
        self.checked_out(index)?;
        if size > self.inputs[index].len() {
            return Err(DeviceError::Backend(format!(
                "queued {} bytes into a {} byte slot",
                size,
                self.inputs[index].len()
            )));
        }
        self.free_inputs.push_back(index);

        let frame_rate = self.format.as_ref().map(|f| f.frame_rate).unwrap_or(30).max(1);
        let data = self.inputs[index][..size].to_vec();
        let eos_sent = self.eos_sent;
        let running = self.running()?;

        if size > 0 && !eos_sent {
            let mut buffer = gst::Buffer::from_mut_slice(data);
            {
                let buffer_ref = buffer.make_mut();
                buffer_ref.set_pts(gst::ClockTime::from_useconds(presentation_time_us.max(0) as u64));
                buffer_ref.set_duration(gst::ClockTime::from_useconds(1_000_000 / frame_rate as u64));
            }
            running
                .appsrc
                .push_buffer(buffer)
                .map_err(|e| backend("Failed to push buffer", format!("{:?}", e)))?;
        }

        if flags.contains(BufferFlags::END_OF_STREAM) && !eos_sent {
            running
                .appsrc
                .end_of_stream()
                .map_err(|e| backend("Failed to send EOS", format!("{:?}", e)))?;
            self.eos_sent = true;
        }
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> DeviceResult<OutputDequeue> {
        self.running()?;
        if let Some(index) = self.hand_out() {
            return Ok(OutputDequeue::Buffer(index));
        }
        if self.eos_received {
            return Ok(OutputDequeue::TryAgainLater);
        }

        let running = self.running()?;
        let event = match running.events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                if let Some(bus) = running.pipeline.bus() {
                    if let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
                        if let gst::MessageView::Error(err) = msg.view() {
                            return Err(DeviceError::Backend(format!(
                                "Pipeline error: {} ({:?})",
                                err.error(),
                                err.debug()
                            )));
                        }
                    }
                }
                return Ok(OutputDequeue::TryAgainLater);
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(DeviceError::Backend("encoder output closed".into()));
            }
        };

        match event {
            SinkEvent::Sample { data, info, codec_data } => {
                let sample = Sample { data, info };
                if let Some(previous) = self.held.replace(sample) {
                    self.ready.push_back(previous);
                }
                if self.track_format.is_none() {
                    let format = self.format.as_ref();
                    self.track_format = Some(TrackFormat {
                        mime: MIME_VIDEO_AVC.to_string(),
                        width: format.map(|f| f.width).unwrap_or(0),
                        height: format.map(|f| f.height).unwrap_or(0),
                        frame_rate: format.map(|f| f.frame_rate).unwrap_or(0),
                        codec_specific_data: codec_data.unwrap_or_default(),
                    });
                    return Ok(OutputDequeue::FormatChanged);
                }
            }
            SinkEvent::Eos => self.finish_stream(),
        }

        Ok(match self.hand_out() {
            Some(index) => OutputDequeue::Buffer(index),
            None => OutputDequeue::TryAgainLater,
        })
    }

    fn output_buffer(&mut self, index: usize) -> DeviceResult<OutputBuffer<'_>> {
        self.check_alive()?;
        let sample = self.outputs.get(&index).ok_or(DeviceError::InvalidIndex(index))?;
        Ok(OutputBuffer {
            data: &sample.data,
            info: sample.info,
        })
    }

    fn output_format(&mut self) -> DeviceResult<TrackFormat> {
        self.check_alive()?;
        self.track_format
            .clone()
            .ok_or(DeviceError::InvalidState("output format not available yet"))
    }

    fn release_output_buffer(&mut self, index: usize, _render: bool) -> DeviceResult<()> {
        self.check_alive()?;
        self.outputs
            .remove(&index)
            .map(|_| ())
            .ok_or(DeviceError::InvalidIndex(index))
    }
}

impl Drop for GstHardwareEncoder {
    fn drop(&mut self) {
        self.shutdown_pipeline();
    }
}

// ── Muxer ───────────────────────────────────────────────────────────

/// MP4 writer fed with already encoded H.264 access units
pub struct GstContainerMuxer {
    path: PathBuf,
    container: ContainerFormat,
    track: Option<TrackFormat>,
    pipeline: Option<gst::Pipeline>,
    appsrc: Option<gst_app::AppSrc>,
    started: bool,
    released: bool,
}

impl GstContainerMuxer {
    pub fn new(path: &Path, container: ContainerFormat) -> Self {
        Self {
            path: path.to_path_buf(),
            container,
            track: None,
            pipeline: None,
            appsrc: None,
            started: false,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_alive(&self) -> DeviceResult<()> {
        if self.released {
            return Err(DeviceError::Released);
        }
        Ok(())
    }

    fn gst_muxer(&self) -> &'static str {
        match self.container {
            ContainerFormat::Mp4 => "mp4mux",
        }
    }

    fn create_pipeline(&self, format: &TrackFormat) -> DeviceResult<(gst::Pipeline, gst_app::AppSrc)> {
        let pipeline = gst::Pipeline::new();

        let mut caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "avc")
            .field("alignment", "au")
            .field("width", format.width as i32)
            .field("height", format.height as i32)
            .field("framerate", gst::Fraction::new(format.frame_rate.max(1) as i32, 1));
        if !format.codec_specific_data.is_empty() {
            caps = caps.field("codec_data", gst::Buffer::from_slice(format.codec_specific_data.clone()));
        }

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&caps.build())
            .format(gst::Format::Time)
            .is_live(true)
            .build();
        let parser = make_element("h264parse")?;
        let muxer = make_element(self.gst_muxer())?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", self.path.to_string_lossy().to_string())
            .property("async", false)
            .build()
            .map_err(|e| backend("Failed to create filesink", e))?;

        pipeline
            .add_many([appsrc.upcast_ref::<gst::Element>(), &parser, &muxer, &filesink])
            .map_err(|e| backend("Failed to add elements", e))?;
        gst::Element::link_many([appsrc.upcast_ref::<gst::Element>(), &parser, &muxer, &filesink])
            .map_err(|e| backend("Failed to link elements", e))?;

        Ok((pipeline, appsrc))
    }

    fn shutdown_pipeline(&mut self) {
        self.appsrc = None;
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                log::warn!("[Muxer] Failed to stop pipeline: {:?}", e);
            }
        }
    }
}

impl ContainerMuxer for GstContainerMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> DeviceResult<usize> {
        self.check_alive()?;
        if self.started {
            return Err(DeviceError::InvalidState("track added after start"));
        }
        if self.track.is_some() {
            return Err(DeviceError::InvalidState("only one video track is supported"));
        }
        if format.mime != MIME_VIDEO_AVC {
            return Err(DeviceError::Backend(format!("unsupported track mime {}", format.mime)));
        }

        let (pipeline, appsrc) = self.create_pipeline(format)?;
        self.pipeline = Some(pipeline);
        self.appsrc = Some(appsrc);
        self.track = Some(format.clone());
        Ok(0)
    }

    fn start(&mut self) -> DeviceResult<()> {
        self.check_alive()?;
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or(DeviceError::InvalidState("muxer started without tracks"))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| backend("Failed to start muxer", format!("{:?}", e)))?;
        self.started = true;
        log::info!("[Muxer] Writing {:?}", self.path);
        Ok(())
    }

    fn write_sample_data(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> DeviceResult<()> {
        self.check_alive()?;
        if !self.started {
            return Err(DeviceError::InvalidState("sample written before start"));
        }
        if track != 0 {
            return Err(DeviceError::InvalidIndex(track));
        }
        // SPS/PPS already travel in the caps as codec_data
        if info.flags.contains(BufferFlags::CODEC_CONFIG) {
            return Ok(());
        }
        let appsrc = self
            .appsrc
            .as_ref()
            .ok_or(DeviceError::InvalidState("muxer has no pipeline"))?;

        let mut buffer = gst::Buffer::from_slice(data.to_vec());
        {
            let buffer_ref = buffer.make_mut();
            // Encoders run without reordering, so decode order is presentation order
            let pts = gst::ClockTime::from_useconds(info.presentation_time_us.max(0) as u64);
            buffer_ref.set_pts(pts);
            buffer_ref.set_dts(pts);
            if !info.is_key_frame() {
                buffer_ref.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }
        appsrc
            .push_buffer(buffer)
            .map_err(|e| backend("Failed to push sample", format!("{:?}", e)))?;
        Ok(())
    }

    fn stop(&mut self) -> DeviceResult<()> {
        self.check_alive()?;
        if !self.started {
            return Err(DeviceError::InvalidState("muxer not started"));
        }
        self.started = false;

        let (Some(pipeline), Some(appsrc)) = (self.pipeline.as_ref(), self.appsrc.as_ref()) else {
            return Err(DeviceError::InvalidState("muxer has no pipeline"));
        };
        if let Err(e) = appsrc.end_of_stream() {
            log::warn!("[Muxer] Failed to send EOS: {:?}", e);
        }

        let mut pipeline_error: Option<String> = None;
        let mut got_eos = false;
        if let Some(bus) = pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(FINALIZE_TIMEOUT_SECS)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => {
                        got_eos = true;
                        break;
                    }
                    gst::MessageView::Error(err) => {
                        pipeline_error = Some(format!("Pipeline error: {} ({:?})", err.error(), err.debug()));
                        break;
                    }
                    _ => {}
                }
            }
        }
        self.shutdown_pipeline();

        if let Some(err) = pipeline_error {
            return Err(DeviceError::Backend(err));
        }
        if !got_eos {
            log::warn!("[Muxer] Did not receive EOS, file may be incomplete");
        }
        let file_size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        log::info!("[Muxer] Finished {:?} ({} bytes)", self.path, file_size);
        Ok(())
    }

    fn release(&mut self) -> DeviceResult<()> {
        self.check_alive()?;
        self.shutdown_pipeline();
        self.released = true;
        Ok(())
    }
}

impl Drop for GstContainerMuxer {
    fn drop(&mut self) {
        // Leaves no pipeline running if stop() was never reached
        self.shutdown_pipeline();
    }
}

// ── Factory ─────────────────────────────────────────────────────────

/// Creates GStreamer-backed devices
pub struct GstDeviceFactory {
    element_name: &'static str,
}

impl GstDeviceFactory {
    /// Initialize GStreamer and pick the best H.264 encoder
    pub fn new() -> DeviceResult<Self> {
        init_gstreamer_env()?;
        let element_name =
            detect_best_h264_encoder().ok_or_else(|| DeviceError::Backend("No H.264 encoder available".into()))?;
        log::info!("[Encoder] Selected {} for H.264 encoding", element_name);
        Ok(Self { element_name })
    }

    /// Use a specific encoder element, e.g. `x264enc`
    pub fn with_encoder(element_name: &'static str) -> DeviceResult<Self> {
        init_gstreamer_env()?;
        if gst::ElementFactory::find(element_name).is_none() {
            return Err(DeviceError::Backend(format!("{} is not installed", element_name)));
        }
        Ok(Self { element_name })
    }

    pub fn encoder_element(&self) -> &'static str {
        self.element_name
    }
}

impl DeviceFactory for GstDeviceFactory {
    fn create_encoder(&self, mime: &str) -> DeviceResult<Box<dyn HardwareEncoder>> {
        if mime != MIME_VIDEO_AVC {
            return Err(DeviceError::Backend(format!("no encoder for {}", mime)));
        }
        Ok(Box::new(GstHardwareEncoder::new(self.element_name)))
    }

    fn create_muxer(&self, path: &Path, container: ContainerFormat) -> DeviceResult<Box<dyn ContainerMuxer>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| backend("Failed to create output directory", e))?;
        }
        Ok(Box::new(GstContainerMuxer::new(path, container)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_encoder_is_last_resort() {
        assert_eq!(H264_ENCODER_PREFERENCE.last(), Some(&"x264enc"));
    }

    fn avc_format() -> EncoderFormat {
        let resolution = crate::encoding::Resolution::new(1280, 720, 30).unwrap();
        EncoderFormat::avc(&crate::encoding::EncodingOptions::new(resolution, "/tmp", "x.mp4"))
    }

    fn property<'a>(props: &'a [(&'static str, String)], name: &str) -> Option<&'a str> {
        props.iter().find(|(n, _)| *n == name).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_encoder_properties_bitrate_and_gop() {
        let format = avc_format();
        let props = encoder_properties("x264enc", &format);
        assert_eq!(property(&props, "bitrate"), Some("4008"));
        assert_eq!(property(&props, "key-int-max"), Some("30"));
        assert_eq!(property(&props, "tune"), None);

        let nv = encoder_properties("nvh264enc", &format);
        assert_eq!(property(&nv, "gop-size"), Some("30"));
    }

    #[test]
    fn test_huge_key_frame_interval_saturates() {
        let format = EncoderFormat {
            key_frame_interval_secs: u32::MAX,
            ..avc_format()
        };
        let props = encoder_properties("nvh264enc", &format);
        assert_eq!(property(&props, "gop-size"), Some("2147483647"));
    }

    #[test]
    fn test_frame_reordering_disabled_everywhere() {
        let format = avc_format();
        for element in H264_ENCODER_PREFERENCE {
            let props = encoder_properties(element, &format);
            let disabled = property(&props, "bframes") == Some("0")
                || property(&props, "b-frames") == Some("0")
                || property(&props, "allow-frame-reordering") == Some("false");
            assert!(disabled, "{} may emit B-frames", element);
        }
    }

    #[test]
    fn test_encoder_unusable_after_release() {
        let mut encoder = GstHardwareEncoder::new("x264enc");
        encoder.release().unwrap();
        assert_eq!(
            encoder.dequeue_input_buffer(Duration::ZERO),
            Err(DeviceError::Released)
        );
        assert_eq!(encoder.release(), Err(DeviceError::Released));
    }

    #[test]
    fn test_muxer_rejects_write_before_start() {
        let mut muxer = GstContainerMuxer::new(Path::new("/tmp/never.mp4"), ContainerFormat::Mp4);
        let info = BufferInfo::default();
        assert_eq!(
            muxer.write_sample_data(0, &[], &info),
            Err(DeviceError::InvalidState("sample written before start"))
        );
        assert!(muxer.start().is_err());
    }

    #[test]
    fn test_unconfigured_encoder_refuses_start() {
        let mut encoder = GstHardwareEncoder::new("x264enc");
        assert_eq!(encoder.start(), Err(DeviceError::InvalidState("encoder not configured")));
    }
}
