use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::kernel::audio::segment::DecodedSegment;
use crate::kernel::event::{AudioNotice, HandleId};

pub const COMMAND_CAPACITY: usize = 512;

/// Voices that can sound at once. Reserved up front; a start beyond this
/// fails its handle.
pub const MAX_VOICES: usize = 64;

const RETIRED_CAPACITY: usize = COMMAND_CAPACITY + MAX_VOICES;

pub enum MixerCommand {
    Start {
        handle: HandleId,
        segment: Arc<DecodedSegment>,
        start_frame: u64,
        rate: f32,
    },
    Stop(HandleId),
    SetRate(HandleId, f32),
}

/// The owner's ends of the mixer queues.
pub struct MixerQueues {
    pub commands: HeapProd<MixerCommand>,
    /// Segments the mixer is done with. Drained (and dropped) by the owner.
    pub retired: HeapCons<Arc<DecodedSegment>>,
}

impl MixerQueues {
    /// Drop retired segments here instead of on the device thread.
    pub fn reclaim(&mut self) -> usize {
        let mut count = 0;
        while self.retired.try_pop().is_some() {
            count += 1;
        }
        count
    }
}

struct Voice {
    handle: HandleId,
    segment: Arc<DecodedSegment>,
    start_frame: u64,
    /// Read position in source frames.
    position: f64,
    rate: f32,
}

impl Voice {
    fn step(&self, output_rate: u32) -> f64 {
        self.rate as f64 * self.segment.sample_rate as f64 / output_rate as f64
    }

    /// Linear interpolation between neighbouring source frames.
    fn sample(&self) -> f32 {
        let samples = &self.segment.samples;
        let i = self.position.floor() as usize;
        let frac = (self.position - i as f64) as f32;
        let a = samples.get(i).copied().unwrap_or(0.0);
        let b = samples.get(i + 1).copied().unwrap_or(a);
        a + (b - a) * frac
    }

    fn finished(&self) -> bool {
        self.position >= self.segment.samples.len() as f64
    }
}

/// Runs inside the device callback. Owns every active voice.
///
/// `render` neither allocates nor frees sample buffers: voice storage is
/// reserved at construction and finished segments leave through the
/// retired queue.
pub struct Mixer {
    commands: HeapCons<MixerCommand>,
    retired: HeapProd<Arc<DecodedSegment>>,
    voices: Vec<Voice>,
    output_rate: u32,
    channels: usize,
    frames: Arc<AtomicU64>,
    volume: Arc<AtomicU32>,
    notices: mpsc::UnboundedSender<AudioNotice>,
}

impl Mixer {
    pub fn new(
        output_rate: u32,
        channels: usize,
        frames: Arc<AtomicU64>,
        volume: Arc<AtomicU32>,
        notices: mpsc::UnboundedSender<AudioNotice>,
    ) -> (Self, MixerQueues) {
        let (command_tx, command_rx) = HeapRb::<MixerCommand>::new(COMMAND_CAPACITY).split();
        let (retired_tx, retired_rx) = HeapRb::<Arc<DecodedSegment>>::new(RETIRED_CAPACITY).split();
        let mixer = Self {
            commands: command_rx,
            retired: retired_tx,
            voices: Vec::with_capacity(MAX_VOICES),
            output_rate,
            channels: channels.max(1),
            frames,
            volume,
            notices,
        };
        let queues = MixerQueues {
            commands: command_tx,
            retired: retired_rx,
        };
        (mixer, queues)
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    fn retire(&mut self, segment: Arc<DecodedSegment>) {
        // Only if the owner stopped draining does the drop happen here.
        let _ = self.retired.try_push(segment);
    }

    fn drain_commands(&mut self) {
        while let Some(command) = self.commands.try_pop() {
            match command {
                MixerCommand::Start {
                    handle,
                    segment,
                    start_frame,
                    rate,
                } => {
                    if self.voices.len() >= MAX_VOICES {
                        let _ = self.notices.send(AudioNotice::Failed {
                            handle,
                            message: "mixer voice limit reached".to_string(),
                        });
                        self.retire(segment);
                        continue;
                    }
                    self.voices.push(Voice {
                        handle,
                        segment,
                        start_frame,
                        position: 0.0,
                        rate,
                    });
                }
                MixerCommand::Stop(handle) => {
                    if let Some(i) = self.voices.iter().position(|v| v.handle == handle) {
                        let voice = self.voices.swap_remove(i);
                        self.retire(voice.segment);
                    }
                }
                MixerCommand::SetRate(handle, rate) => {
                    if let Some(voice) = self.voices.iter_mut().find(|v| v.handle == handle) {
                        voice.rate = rate;
                    }
                }
            }
        }
    }

    pub fn render(&mut self, data: &mut [f32]) {
        self.drain_commands();
        let volume = f32::from_bits(self.volume.load(Ordering::Relaxed));
        let base = self.frames.load(Ordering::Relaxed);
        let frame_count = data.len() / self.channels;

        for (offset, frame) in data.chunks_mut(self.channels).enumerate() {
            let now = base + offset as u64;
            let mut mixed = 0.0f32;
            for voice in self.voices.iter_mut() {
                if now < voice.start_frame || voice.finished() {
                    continue;
                }
                mixed += voice.sample();
                voice.position += voice.step(self.output_rate);
            }
            let value = (mixed * volume).clamp(-1.0, 1.0);
            for sample in frame.iter_mut() {
                *sample = value;
            }
        }

        let mut i = 0;
        while i < self.voices.len() {
            if self.voices[i].finished() {
                let voice = self.voices.swap_remove(i);
                let _ = self.notices.send(AudioNotice::Ended(voice.handle));
                self.retire(voice.segment);
            } else {
                i += 1;
            }
        }
        self.frames.fetch_add(frame_count as u64, Ordering::Relaxed);
    }
}
