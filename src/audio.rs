//! Local audio plumbing.
//!
//! The protocol side only ever sees channels of 16-bit mono PCM:
//!
//! - **Playback**: RX task → [`AudioSink`] → output device
//! - **Capture**: input device → [`AudioFeeder`] (fixed 20 ms chunks) → [`AudioSource`] → TX task
//!
//! With the `audio` feature, [`cpal_backend`] wires these to real devices.
//! Without it the client runs receive-only into a null sink.
#![cfg_attr(not(feature = "audio"), allow(dead_code))]

use tokio::sync::mpsc;
use tracing::debug;

/// Buffers queued between the audio thread and the async side.
pub const AUDIO_CHANNEL_CAPACITY: usize = 32;

// ═══════════════════════════════════════════════════════════════════════
//  Playback
// ═══════════════════════════════════════════════════════════════════════

/// Where received voice goes, at the device rate.
///
/// Never blocks: a full queue drops the frame.
pub struct AudioSink {
    tx: Option<mpsc::Sender<Vec<i16>>>,
    sample_rate: u32,
}

impl AudioSink {
    pub fn channel(sample_rate: u32, capacity: usize) -> (Self, mpsc::Receiver<Vec<i16>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (AudioSink { tx: Some(tx), sample_rate }, rx)
    }

    /// Sink that discards everything.
    pub fn null(sample_rate: u32) -> Self {
        AudioSink { tx: None, sample_rate }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Queue samples for playback; false if they were dropped.
    pub fn write(&self, samples: Vec<i16>) -> bool {
        match &self.tx {
            Some(tx) =>
                match tx.try_send(samples) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(error = %e, "playback frame dropped");
                        false
                    }
                }
            None => true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Capture
// ═══════════════════════════════════════════════════════════════════════

/// Microphone chunks of exactly `chunk_samples` at the device rate.
pub struct AudioSource {
    rx: mpsc::Receiver<Vec<i16>>,
    sample_rate: u32,
}

impl AudioSource {
    pub fn new(sample_rate: u32, chunk_samples: usize, capacity: usize) -> (AudioFeeder, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let feeder = AudioFeeder {
            tx,
            chunk_samples,
            pending: Vec::with_capacity(chunk_samples * 2),
        };
        (feeder, AudioSource { rx, sample_rate })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Next chunk; `None` once the capture side is gone.
    pub async fn recv(&mut self) -> Option<Vec<i16>> {
        self.rx.recv().await
    }
}

/// Capture-side half: takes whatever the device hands over and emits
/// fixed-size chunks.
pub struct AudioFeeder {
    tx: mpsc::Sender<Vec<i16>>,
    chunk_samples: usize,
    pending: Vec<i16>,
}

impl AudioFeeder {
    /// Append mono samples. Returns the number of whole chunks dropped
    /// because the consumer fell behind.
    pub fn push(&mut self, samples: &[i16]) -> usize {
        self.pending.extend_from_slice(samples);
        let mut dropped = 0;
        while self.pending.len() >= self.chunk_samples {
            let rest = self.pending.split_off(self.chunk_samples);
            let chunk = std::mem::replace(&mut self.pending, rest);
            if self.tx.try_send(chunk).is_err() {
                dropped += 1;
            }
        }
        dropped
    }
}

/// First channel of interleaved frames.
pub fn first_channel<T: Copy>(data: &[T], channels: usize) -> Vec<T> {
    data.iter().step_by(channels.max(1)).copied().collect()
}

#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    (sample as f32) / (i16::MAX as f32)
}

#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * (i16::MAX as f32)) as i16
}

// ═══════════════════════════════════════════════════════════════════════
//  cpal devices
// ═══════════════════════════════════════════════════════════════════════

#[cfg(feature = "audio")]
pub mod cpal_backend {
    use std::collections::VecDeque;

    use anyhow::{ anyhow, Context };
    use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
    use cpal::SampleFormat;
    use tokio::sync::mpsc;
    use tracing::{ error, info, warn };

    use super::{ f32_to_i16, first_channel, i16_to_f32, AudioFeeder, AudioSink, AudioSource, AUDIO_CHANNEL_CAPACITY };

    /// Open streams. Dropping this stops capture and playback, so it lives
    /// on the main task for the whole run.
    pub struct CpalAudio {
        _output: cpal::Stream,
        _input: Option<cpal::Stream>,
    }

    fn find_device(name: Option<&str>, for_input: bool) -> anyhow::Result<cpal::Device> {
        let host = cpal::default_host();
        let Some(name) = name else {
            let dev = if for_input { host.default_input_device() } else { host.default_output_device() };
            return dev.ok_or_else(|| anyhow!("no default {} device", if for_input { "input" } else { "output" }));
        };
        let devices = if for_input { host.input_devices()? } else { host.output_devices()? };
        for device in devices {
            if device.name().map(|n| n == name).unwrap_or(false) {
                return Ok(device);
            }
        }
        Err(anyhow!("audio device not found: {name}"))
    }

    fn stream_config(supported: &cpal::SupportedStreamConfig, sample_rate: u32) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }

    /// Open the output device (and the input device unless `input` is
    /// false) at `sample_rate`. Output failure is fatal; input failure
    /// yields no source.
    pub fn open(
        output_name: Option<&str>,
        input_name: Option<&str>,
        input: bool,
        sample_rate: u32,
        chunk_samples: usize
    ) -> anyhow::Result<(CpalAudio, AudioSink, Option<AudioSource>)> {
        let (sink, rx) = AudioSink::channel(sample_rate, AUDIO_CHANNEL_CAPACITY);
        let output = open_output(output_name, sample_rate, rx)?;

        // a missing microphone only costs us transmit
        let (input_stream, source) = if input {
            let (feeder, source) = AudioSource::new(sample_rate, chunk_samples, AUDIO_CHANNEL_CAPACITY);
            match open_input(input_name, sample_rate, feeder) {
                Ok(stream) => (Some(stream), Some(source)),
                Err(e) => {
                    warn!(error = %e, "input device unavailable, receive only");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        Ok((CpalAudio { _output: output, _input: input_stream }, sink, source))
    }

    fn open_output(name: Option<&str>, sample_rate: u32, rx: mpsc::Receiver<Vec<i16>>) -> anyhow::Result<cpal::Stream> {
        let device = find_device(name, false)?;
        let supported = device.default_output_config().context("no default output config")?;
        let config = stream_config(&supported, sample_rate);
        let channels = config.channels as usize;
        info!(device = %device.name().unwrap_or_default(), sample_rate, channels, "🔊 output device");

        // keep at most 0.5 s queued; older samples are discarded
        let mut player = Player::new(rx, (sample_rate / 2) as usize);
        let stream = match supported.sample_format() {
            SampleFormat::I16 =>
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| player.fill(data, channels, |s| s),
                    |err| error!("output stream error: {}", err),
                    None
                )?,
            SampleFormat::F32 =>
                device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| player.fill(data, channels, i16_to_f32),
                    |err| error!("output stream error: {}", err),
                    None
                )?,
            other => {
                return Err(anyhow!("unsupported output sample format: {other}"));
            }
        };
        stream.play().context("failed to start output stream")?;
        Ok(stream)
    }

    fn open_input(name: Option<&str>, sample_rate: u32, mut feeder: AudioFeeder) -> anyhow::Result<cpal::Stream> {
        let device = find_device(name, true)?;
        let supported = device.default_input_config().context("no default input config")?;
        let config = stream_config(&supported, sample_rate);
        let channels = config.channels as usize;
        info!(device = %device.name().unwrap_or_default(), sample_rate, channels, "🎙️  input device");

        let stream = match supported.sample_format() {
            SampleFormat::I16 =>
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        feeder.push(&first_channel(data, channels));
                    },
                    |err| error!("input stream error: {}", err),
                    None
                )?,
            SampleFormat::F32 =>
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let mono: Vec<i16> = first_channel(data, channels).into_iter().map(f32_to_i16).collect();
                        feeder.push(&mono);
                    },
                    |err| error!("input stream error: {}", err),
                    None
                )?,
            other => {
                return Err(anyhow!("unsupported input sample format: {other}"));
            }
        };
        stream.play().context("failed to start input stream")?;
        Ok(stream)
    }

    /// Output-callback state: queued mono samples, duplicated to every channel.
    struct Player {
        rx: mpsc::Receiver<Vec<i16>>,
        pending: VecDeque<i16>,
        max_pending: usize,
    }

    impl Player {
        fn new(rx: mpsc::Receiver<Vec<i16>>, max_pending: usize) -> Self {
            Player { rx, pending: VecDeque::new(), max_pending }
        }

        fn fill<T: Copy>(&mut self, data: &mut [T], channels: usize, convert: impl Fn(i16) -> T) {
            while let Ok(buf) = self.rx.try_recv() {
                self.pending.extend(buf);
            }
            if self.pending.len() > self.max_pending {
                let excess = self.pending.len() - self.max_pending;
                self.pending.drain(..excess);
            }
            for frame in data.chunks_mut(channels.max(1)) {
                let v = convert(self.pending.pop_front().unwrap_or(0));
                frame.fill(v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feeder_emits_fixed_chunks() {
        let (mut feeder, mut source) = AudioSource::new(8_000, 160, 8);
        assert_eq!(feeder.push(&[1; 100]), 0);
        assert_eq!(feeder.push(&[2; 250]), 0);
        let a = source.recv().await.unwrap();
        let b = source.recv().await.unwrap();
        assert_eq!((a.len(), b.len()), (160, 160));
        assert_eq!(a[99], 1);
        assert_eq!(a[100], 2);
        // 30 samples still pending
        assert!(source.rx.try_recv().is_err());
    }

    #[test]
    fn test_feeder_counts_drops_when_full() {
        let (mut feeder, _source) = AudioSource::new(8_000, 10, 1);
        assert_eq!(feeder.push(&[0; 30]), 2);
    }

    #[tokio::test]
    async fn test_sink_drops_when_full() {
        let (sink, mut rx) = AudioSink::channel(48_000, 1);
        assert!(sink.write(vec![1]));
        assert!(!sink.write(vec![2]));
        assert_eq!(rx.recv().await, Some(vec![1]));
        assert!(AudioSink::null(8_000).write(vec![0; 160]));
    }

    #[test]
    fn test_first_channel_and_conversions() {
        assert_eq!(first_channel(&[1, 9, 2, 9, 3, 9], 2), vec![1, 2, 3]);
        assert_eq!(first_channel(&[1, 2], 1), vec![1, 2]);
        assert_eq!(i16_to_f32(i16::MAX), 1.0);
        assert_eq!(f32_to_i16(1.5), i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
    }
}
