use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{info, warn};

use crate::AUDIO_BLOCK_SAMPLES;
use crate::mixer::{AudioBlock, Mixer};

/// Host audio output. The mixer runs inside the device callback, one block
/// of [`AUDIO_BLOCK_SAMPLES`] frames at a time.
pub struct AudioOutput {
    _stream: cpal::Stream,
    sample_rate: u32,
    channels: u16,
}

/// Default output rate of the default device, for sizing the emulation
/// before the stream is opened.
pub fn probe_sample_rate() -> Result<u32> {
    let device = default_device()?;
    let supported = device
        .default_output_config()
        .context("failed to query default audio config")?;
    Ok(supported.sample_rate().0)
}

fn default_device() -> Result<cpal::Device> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| anyhow!("no default audio output device"))
}

impl AudioOutput {
    pub fn new(mixer: Mixer) -> Result<Self> {
        let device = default_device()?;
        let supported = device
            .default_output_config()
            .context("failed to query default audio config")?;

        let stream_config: cpal::StreamConfig = supported.config();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels;
        let mut source = BlockSource::new(mixer);

        let err_fn = |err| {
            warn!("audio stream error: {err}");
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _| source.fill(data, channels as usize, pcm_to_f32),
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _| source.fill(data, channels as usize, |s| s),
                err_fn,
                None,
            ),
            cpal::SampleFormat::U16 => device.build_output_stream(
                &stream_config,
                move |data: &mut [u16], _| source.fill(data, channels as usize, pcm_to_u16),
                err_fn,
                None,
            ),
            other => {
                return Err(anyhow!("unsupported audio sample format: {other:?}"));
            }
        }
        .context("failed to build audio output stream")?;

        stream
            .play()
            .context("failed to start audio output stream")?;
        info!("audio output running at {sample_rate} Hz, {channels} channel(s)");

        Ok(Self {
            _stream: stream,
            sample_rate,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

fn pcm_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

fn pcm_to_u16(sample: i16) -> u16 {
    (sample as i32 + 32768) as u16
}

/// Adapts the mixer's fixed blocks to whatever frame count the device asks
/// for. Both blocks live inline, so the callback never allocates.
struct BlockSource {
    mixer: Mixer,
    left: AudioBlock,
    right: AudioBlock,
    position: usize,
}

impl BlockSource {
    fn new(mixer: Mixer) -> Self {
        Self {
            mixer,
            left: [0; AUDIO_BLOCK_SAMPLES],
            right: [0; AUDIO_BLOCK_SAMPLES],
            position: AUDIO_BLOCK_SAMPLES,
        }
    }

    fn next_frame(&mut self) -> (i16, i16) {
        if self.position == AUDIO_BLOCK_SAMPLES {
            self.mixer.next_block(&mut self.left, &mut self.right);
            self.position = 0;
        }
        let frame = (self.left[self.position], self.right[self.position]);
        self.position += 1;
        frame
    }

    /// Mono devices get the average of both sides; channels past the second
    /// are left silent.
    fn fill<T: Copy>(&mut self, data: &mut [T], channels: usize, convert: impl Fn(i16) -> T) {
        let channels = channels.max(1);
        let silence = convert(0);
        for frame in data.chunks_mut(channels) {
            let (left, right) = self.next_frame();
            match frame {
                [mono] => *mono = convert(((left as i32 + right as i32) / 2) as i16),
                [l, r, rest @ ..] => {
                    *l = convert(left);
                    *r = convert(right);
                    rest.fill(silence);
                }
                [] => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::{AudioStream, BlockPool, StereoBlock, audio_graph};

    struct Ramp {
        next: i16,
    }

    impl AudioStream for Ramp {
        fn update(&mut self, pool: &mut BlockPool) -> Option<StereoBlock> {
            let mut block = pool.allocate_stereo()?;
            for (l, r) in block.left.iter_mut().zip(block.right.iter_mut()) {
                *l = self.next;
                *r = -self.next;
                self.next += 1;
            }
            Some(block)
        }
    }

    #[test]
    fn frames_span_block_boundaries() {
        let (mut manager, mixer) = audio_graph(4);
        manager.connect(Box::new(Ramp { next: 0 })).expect("connect");
        let mut source = BlockSource::new(mixer);

        let mut data = vec![0i16; (AUDIO_BLOCK_SAMPLES + 3) * 2];
        source.fill(&mut data, 2, |s| s);
        assert_eq!(&data[..4], &[0, 0, 1, -1]);
        let last = AUDIO_BLOCK_SAMPLES + 2;
        assert_eq!(data[last * 2], last as i16);
        assert_eq!(data[last * 2 + 1], -(last as i16));
        assert_eq!(manager.stats().cycles, 2);
    }

    #[test]
    fn mono_and_surround_layouts() {
        let (mut manager, mixer) = audio_graph(4);
        manager.connect(Box::new(Ramp { next: 10 })).expect("connect");
        let mut source = BlockSource::new(mixer);

        let mut mono = [1i16; 2];
        source.fill(&mut mono, 1, |s| s);
        assert_eq!(mono, [0, 0]);

        let mut quad = [1i16; 4];
        source.fill(&mut quad, 4, |s| s);
        assert_eq!(quad, [12, -12, 0, 0]);
    }

    #[test]
    fn sample_format_conversions() {
        assert_eq!(pcm_to_u16(i16::MIN), 0);
        assert_eq!(pcm_to_u16(0), 32768);
        assert_eq!(pcm_to_u16(i16::MAX), u16::MAX);
        assert_eq!(pcm_to_f32(i16::MIN), -1.0);
        assert_eq!(pcm_to_f32(0), 0.0);
    }

    #[test]
    fn empty_graph_is_silent() {
        let (_manager, mixer) = audio_graph(2);
        let mut source = BlockSource::new(mixer);
        let mut data = [7.0f32; 8];
        source.fill(&mut data, 2, pcm_to_f32);
        assert!(data.iter().all(|&s| s == 0.0));
    }
}
