use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::Producer;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::mixer::{Mixer, MixerCommand, MixerQueues};
use super::output::{AudioError, AudioOutput};
use crate::kernel::audio::segment::DecodedSegment;
use crate::kernel::event::{AudioNotice, HandleId};
use crate::kernel::time::ClockTime;

/// Default output device, mixed in software.
///
/// The cpal stream is not `Send`, so it lives on a dedicated thread for as
/// long as this value exists. Scheduling goes through a lock-free command
/// queue; the clock is the count of frames the device has consumed.
/// Segments the mixer retires are dropped here, on the owner's thread.
pub struct CpalOutput {
    queues: MixerQueues,
    frames: Arc<AtomicU64>,
    volume: Arc<AtomicU32>,
    failed: Arc<AtomicBool>,
    sample_rate: u32,
    _shutdown: std_mpsc::Sender<()>,
}

impl CpalOutput {
    pub fn open(
        preferred_rate: Option<u32>,
        notices: mpsc::UnboundedSender<AudioNotice>,
    ) -> Result<Self, AudioError> {
        let frames = Arc::new(AtomicU64::new(0));
        let volume = Arc::new(AtomicU32::new(1.0f32.to_bits()));
        let failed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(u32, MixerQueues), AudioError>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread_frames = frames.clone();
        let thread_volume = volume.clone();
        let thread_failed = failed.clone();
        std::thread::Builder::new()
            .name("narrator-audio".to_string())
            .spawn(move || {
                let stream = build_stream(
                    preferred_rate,
                    thread_frames,
                    thread_volume,
                    thread_failed,
                    notices,
                );
                match stream {
                    Ok((stream, rate, queues)) => {
                        let _ = ready_tx.send(Ok((rate, queues)));
                        // Park until the owner goes away.
                        let _ = shutdown_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        let (sample_rate, queues) = ready_rx.recv().map_err(|_| AudioError::Closed)??;
        info!(sample_rate, "Audio output ready");

        Ok(Self {
            queues,
            frames,
            volume,
            failed,
            sample_rate,
            _shutdown: shutdown_tx,
        })
    }

    fn push(&mut self, command: MixerCommand) -> Result<(), AudioError> {
        self.queues.reclaim();
        if self.failed.load(Ordering::Relaxed) {
            return Err(AudioError::Closed);
        }
        self.queues.commands.try_push(command).map_err(|_| AudioError::QueueFull)
    }
}

fn build_stream(
    preferred_rate: Option<u32>,
    frames: Arc<AtomicU64>,
    volume: Arc<AtomicU32>,
    failed: Arc<AtomicBool>,
    notices: mpsc::UnboundedSender<AudioNotice>,
) -> Result<(cpal::Stream, u32, MixerQueues), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Device("no output device available".to_string()))?;
    info!("Audio Output Device: {}", device.name().unwrap_or_default());

    let default = device
        .default_output_config()
        .map_err(|e| AudioError::Device(e.to_string()))?;

    let mut selected = None;
    if let Some(rate) = preferred_rate {
        let ranges = device
            .supported_output_configs()
            .map_err(|e| AudioError::Device(e.to_string()))?;
        for range in ranges {
            if range.sample_format() == default.sample_format()
                && range.min_sample_rate().0 <= rate
                && range.max_sample_rate().0 >= rate
            {
                selected = Some(range.with_sample_rate(cpal::SampleRate(rate)));
                break;
            }
        }
        if selected.is_none() {
            warn!(rate, "Preferred output rate unsupported, using device default");
        }
    }
    let config = selected.unwrap_or(default);
    let rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    info!("Audio Config Selected: Rate={}Hz, Channels={}", rate, channels);

    let error_notices = notices.clone();
    let err_fn = move |err: cpal::StreamError| {
        error!("an error occurred on output stream: {}", err);
        failed.store(true, Ordering::Relaxed);
        let _ = error_notices.send(AudioNotice::DeviceError(err.to_string()));
    };

    let (mut mixer, queues) = Mixer::new(rate, channels, frames, volume, notices);

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &config.into(),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| mixer.render(data),
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::with_capacity(16_384);
            device.build_output_stream(
                &config.into(),
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    mixer.render(&mut scratch);
                    for (out, s) in data.iter_mut().zip(scratch.iter()) {
                        *out = (s * i16::MAX as f32) as i16;
                    }
                },
                err_fn,
                None,
            )
        }
        other => return Err(AudioError::Device(format!("unsupported sample format {:?}", other))),
    }
    .map_err(|e| AudioError::Stream(e.to_string()))?;

    stream.play().map_err(|e| AudioError::Stream(e.to_string()))?;
    Ok((stream, rate, queues))
}

impl AudioOutput for CpalOutput {
    fn now(&self) -> ClockTime {
        self.frames.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }

    fn sample_rate(&self) -> Option<u32> {
        Some(self.sample_rate)
    }

    fn start(
        &mut self,
        handle: HandleId,
        segment: Arc<DecodedSegment>,
        start_at: ClockTime,
        rate: f32,
    ) -> Result<(), AudioError> {
        let start_frame = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        self.push(MixerCommand::Start {
            handle,
            segment,
            start_frame,
            rate,
        })
    }

    fn stop(&mut self, handle: HandleId) {
        if self.push(MixerCommand::Stop(handle)).is_err() {
            warn!(?handle, "Could not queue stop");
        }
    }

    fn set_rate(&mut self, handle: HandleId, rate: f32) {
        if self.push(MixerCommand::SetRate(handle, rate)).is_err() {
            warn!(?handle, "Could not queue rate change");
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}
