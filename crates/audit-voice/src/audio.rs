//! Audio capture and playback using CPAL and Rodio
//!
//! Both device streams are `!Send`, so each lives on its own thread. Capture pushes
//! fixed-size mono frames into a bounded channel; playback is driven by ordered commands.
//! Device errors surface from `open_*` before the caller creates any interview state.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate sent upstream in Hz (default: 16000)
    pub sample_rate: u32,

    /// Samples per frame (default: 1024)
    pub frame_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_samples: 1024,
        }
    }
}

/// Encode mono f32 samples as base64 PCM16 little-endian.
pub fn encode_pcm16(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    B64.encode(bytes)
}

/// Decode base64 PCM16 little-endian into samples. A trailing odd byte is dropped.
pub fn decode_pcm16(data: &str) -> VoiceResult<Vec<i16>> {
    let bytes = B64
        .decode(data.trim())
        .map_err(|e| VoiceError::Decode(e.to_string()))?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Playing time of `samples` mono samples at `sample_rate`.
pub fn pcm_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(samples as u64 * 1_000_000_000 / sample_rate as u64)
}

/// Downmixes interleaved device samples to mono, resamples linearly to the target
/// rate and cuts fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    channels: usize,
    step: f64,
    frame_samples: usize,
    channel_sum: f32,
    channel_idx: usize,
    input_count: u64,
    next_pos: f64,
    prev: f32,
    frame: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(input_rate: u32, channels: u16, output_rate: u32, frame_samples: usize) -> Self {
        Self {
            channels: channels.max(1) as usize,
            step: input_rate as f64 / output_rate.max(1) as f64,
            frame_samples: frame_samples.max(1),
            channel_sum: 0.0,
            channel_idx: 0,
            input_count: 0,
            next_pos: 0.0,
            prev: 0.0,
            frame: Vec::with_capacity(frame_samples),
        }
    }

    /// Feed interleaved samples; returns every frame completed by them.
    pub fn push<I: IntoIterator<Item = f32>>(&mut self, interleaved: I) -> Vec<Vec<f32>> {
        let mut ready = Vec::new();
        for sample in interleaved {
            self.channel_sum += sample;
            self.channel_idx += 1;
            if self.channel_idx < self.channels {
                continue;
            }
            let mono = self.channel_sum / self.channels as f32;
            self.channel_sum = 0.0;
            self.channel_idx = 0;

            let index = self.input_count as f64;
            while self.next_pos <= index {
                let frac = (self.next_pos - (index - 1.0)) as f32;
                self.frame.push(self.prev + (mono - self.prev) * frac);
                self.next_pos += self.step;
                if self.frame.len() == self.frame_samples {
                    ready.push(std::mem::replace(&mut self.frame, Vec::with_capacity(self.frame_samples)));
                }
            }
            self.prev = mono;
            self.input_count += 1;
        }
        ready
    }
}

/// A running capture stream.
pub trait CaptureHandle: Send {
    /// Stop capturing. Best effort: failures are reported but the handle is spent.
    fn stop(&mut self) -> VoiceResult<()>;
}

/// A playback device accepting decoded PCM in order.
pub trait PlaybackSink: Send {
    fn play(&mut self, samples: Vec<i16>, sample_rate: u32) -> VoiceResult<()>;
    /// Drop everything queued and fall silent.
    fn interrupt(&mut self) -> VoiceResult<()>;
    fn close(&mut self);
}

/// Device access for the interview engine.
pub trait AudioBackend: Send + Sync {
    /// Open the input device and start sending frames. At most one frame is buffered in
    /// `frames`; newer frames are dropped while the consumer lags.
    fn open_capture(&self, config: &CaptureConfig, frames: mpsc::Sender<Vec<f32>>) -> VoiceResult<Box<dyn CaptureHandle>>;

    fn open_playback(&self, sample_rate: u32) -> VoiceResult<Box<dyn PlaybackSink>>;
}

/// Default host devices via CPAL (input) and Rodio (output).
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceBackend;

impl DeviceBackend {
    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        Ok(host.input_devices()?.filter_map(|d| d.name().ok()).collect())
    }
}

impl AudioBackend for DeviceBackend {
    fn open_capture(&self, config: &CaptureConfig, frames: mpsc::Sender<Vec<f32>>) -> VoiceResult<Box<dyn CaptureHandle>> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = config.clone();

        let thread = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match start_input_stream(&config, frames) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Block until stop or handle drop.
                let _ = stop_rx.recv();
                if let Err(e) = stream.pause() {
                    warn!("Audio capture pause failed: {}", e);
                }
                drop(stream);
                debug!("audio capture thread ended");
            })?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::AudioDevice("capture thread exited during startup".to_string()))??;

        Ok(Box::new(DeviceCapture {
            stop: Some(stop_tx),
            thread: Some(thread),
        }))
    }

    fn open_playback(&self, sample_rate: u32) -> VoiceResult<Box<dyn PlaybackSink>> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<PlaybackCommand>();

        let thread = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || run_playback_thread(ready_tx, cmd_rx))?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("playback thread exited during startup".to_string()))??;

        info!("🔊 Audio playback ready ({}Hz)", sample_rate);
        Ok(Box::new(DevicePlayback {
            commands: cmd_tx,
            thread: Some(thread),
        }))
    }
}

fn start_input_stream(config: &CaptureConfig, frames: mpsc::Sender<Vec<f32>>) -> VoiceResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
    let supported = device.default_input_config()?;
    info!(
        "🎤 Capturing from {} ({}Hz x{} -> {}Hz mono, {} samples/frame)",
        device.name().unwrap_or_else(|_| "Unknown".to_string()),
        supported.sample_rate().0,
        supported.channels(),
        config.sample_rate,
        config.frame_samples
    );

    let assembler = FrameAssembler::new(
        supported.sample_rate().0,
        supported.channels(),
        config.sample_rate,
        config.frame_samples,
    );
    let stream_config: cpal::StreamConfig = supported.config();
    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_input::<f32>(&device, &stream_config, assembler, frames)?,
        cpal::SampleFormat::I16 => build_input::<i16>(&device, &stream_config, assembler, frames)?,
        cpal::SampleFormat::U16 => build_input::<u16>(&device, &stream_config, assembler, frames)?,
        other => {
            return Err(VoiceError::AudioDevice(format!("unsupported sample format {other:?}")));
        }
    };
    stream.play()?;
    Ok(stream)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut assembler: FrameAssembler,
    frames: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in assembler.push(data.iter().map(|s| f32::from_sample(*s))) {
                // Full channel means the consumer lags; drop rather than queue.
                let _ = frames.try_send(frame);
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )
}

struct DeviceCapture {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle for DeviceCapture {
    fn stop(&mut self) -> VoiceResult<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| VoiceError::AudioStream("capture thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

enum PlaybackCommand {
    Play { samples: Vec<i16>, sample_rate: u32 },
    Interrupt,
    Close,
}

fn run_playback_thread(ready: std_mpsc::Sender<VoiceResult<()>>, commands: std_mpsc::Receiver<PlaybackCommand>) {
    let (_stream, handle) = match rodio::OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(VoiceError::Playback(e.to_string())));
            return;
        }
    };
    let mut sink = match rodio::Sink::try_new(&handle) {
        Ok(sink) => sink,
        Err(e) => {
            let _ = ready.send(Err(VoiceError::Playback(e.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while let Ok(command) = commands.recv() {
        match command {
            PlaybackCommand::Play { samples, sample_rate } => {
                sink.append(rodio::buffer::SamplesBuffer::new(1, sample_rate, samples));
            }
            PlaybackCommand::Interrupt => {
                sink.stop();
                // A stopped sink does not resume; start a fresh one.
                match rodio::Sink::try_new(&handle) {
                    Ok(fresh) => sink = fresh,
                    Err(e) => {
                        warn!("Audio playback could not restart after interruption: {}", e);
                        break;
                    }
                }
                debug!("⏹️ Audio playback interrupted");
            }
            PlaybackCommand::Close => break,
        }
    }
    sink.stop();
    debug!("audio playback thread ended");
}

struct DevicePlayback {
    commands: std_mpsc::Sender<PlaybackCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DevicePlayback {
    fn send(&self, command: PlaybackCommand) -> VoiceResult<()> {
        self.commands
            .send(command)
            .map_err(|_| VoiceError::Playback("playback thread is gone".to_string()))
    }
}

impl PlaybackSink for DevicePlayback {
    fn play(&mut self, samples: Vec<i16>, sample_rate: u32) -> VoiceResult<()> {
        self.send(PlaybackCommand::Play { samples, sample_rate })
    }

    fn interrupt(&mut self) -> VoiceResult<()> {
        self.send(PlaybackCommand::Interrupt)
    }

    fn close(&mut self) {
        let _ = self.send(PlaybackCommand::Close);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DevicePlayback {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_config_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.frame_samples, 1024);
    }

    #[test]
    fn pcm16_round_trip_keeps_sign_and_scale() {
        let encoded = encode_pcm16(&[0.0, 1.0, -1.0, 2.0]);
        let decoded = decode_pcm16(&encoded).unwrap();
        assert_eq!(decoded, vec![0, i16::MAX, -i16::MAX, i16::MAX]);
    }

    #[test]
    fn decode_rejects_invalid_base64() {
        assert!(matches!(decode_pcm16("***"), Err(VoiceError::Decode(_))));
    }

    #[test]
    fn duration_follows_sample_rate() {
        assert_eq!(pcm_duration(24_000, 24_000), Duration::from_secs(1));
        assert_eq!(pcm_duration(12_000, 24_000), Duration::from_millis(500));
        assert_eq!(pcm_duration(10, 0), Duration::ZERO);
    }

    #[test]
    fn assembler_passes_through_at_same_rate() {
        let mut a = FrameAssembler::new(16_000, 1, 16_000, 4);
        let frames = a.push((0..10).map(|i| i as f32));
        assert_eq!(frames, vec![vec![0.0, 1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0, 7.0]]);
        let frames = a.push([10.0, 11.0]);
        assert_eq!(frames, vec![vec![8.0, 9.0, 10.0, 11.0]]);
    }

    #[test]
    fn assembler_downmixes_and_decimates() {
        // 48 kHz stereo -> 16 kHz mono: 3072 stereo pairs yield exactly one 1024 frame.
        let mut a = FrameAssembler::new(48_000, 2, 16_000, 1024);
        let input = std::iter::repeat([0.25f32, 0.75f32]).take(3072).flatten();
        let frames = a.push(input);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 1024);
        assert!(frames[0][1..].iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_list_devices() {
        let devices = DeviceBackend::list_input_devices().unwrap();
        println!("Available input devices: {:?}", devices);
    }
}
