use {
    crate::errors::TranscodeError,
    audiopus::{
        coder::{Decoder as OpusDecoder, Encoder as OpusEncoder},
        Application, Channels, MutSignals, Packet, SampleRate,
    },
    std::convert::TryFrom,
    bytes::Bytes,
    rubato::{FftFixedIn, Resampler},
    sluice_engine::media::AudioFrame,
};

/// Samples per Opus frame at 48 kHz (20 ms).
pub const OPUS_FRAME_SAMPLES: usize = 960;

fn channels_of(count: u8) -> Result<Channels, TranscodeError> {
    match count {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(TranscodeError::Audio(format!(
            "unsupported channel count {other}"
        ))),
    }
}

fn sample_rate_of(rate: u32) -> Result<SampleRate, TranscodeError> {
    match rate {
        8_000 => Ok(SampleRate::Hz8000),
        12_000 => Ok(SampleRate::Hz12000),
        16_000 => Ok(SampleRate::Hz16000),
        24_000 => Ok(SampleRate::Hz24000),
        48_000 => Ok(SampleRate::Hz48000),
        other => Err(TranscodeError::Audio(format!(
            "opus cannot run at {other} Hz"
        ))),
    }
}

/// Opus decoder front: packets in, interleaved f32 PCM out.
pub struct AudioDecoder {
    inner: OpusDecoder,
    sample_rate: u32,
    channels: u8,
    scratch: Vec<f32>,
}

impl AudioDecoder {
    pub fn new(sample_rate: u32, channels: u8) -> Result<Self, TranscodeError> {
        let inner = OpusDecoder::new(sample_rate_of(sample_rate)?, channels_of(channels)?)
            .map_err(|e| TranscodeError::Audio(e.to_string()))?;
        Ok(Self {
            inner,
            sample_rate,
            channels,
            // 120 ms at 48 kHz stereo is the decoder's worst case.
            scratch: vec![0f32; 5_760 * 2],
        })
    }

    pub fn decode(&mut self, packet: &[u8], pts_us: i64) -> Result<AudioFrame, TranscodeError> {
        let input = Packet::try_from(packet).map_err(|e| TranscodeError::Audio(e.to_string()))?;
        let output = MutSignals::try_from(&mut self.scratch[..])
            .map_err(|e| TranscodeError::Audio(e.to_string()))?;
        let samples_per_channel = self
            .inner
            .decode_float(Some(input), output, false)
            .map_err(|e| TranscodeError::Audio(e.to_string()))?;
        let total = samples_per_channel * self.channels as usize;
        Ok(AudioFrame {
            pts_us,
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples: self.scratch[..total].to_vec(),
        })
    }
}

/// Sample-rate converter between decoder and encoder; absent when rates
/// already match.
pub struct AudioResampler {
    inner: FftFixedIn<f32>,
    channels: usize,
    input_chunk: usize,
    /// Planar staging until a full resampler chunk accumulates.
    staging: Vec<Vec<f32>>,
}

impl AudioResampler {
    pub fn new(
        from_rate: u32,
        to_rate: u32,
        channels: u8,
    ) -> Result<Self, TranscodeError> {
        let input_chunk = from_rate as usize / 50; // 20 ms
        let inner = FftFixedIn::new(
            from_rate as usize,
            to_rate as usize,
            input_chunk,
            2,
            channels as usize,
        )
        .map_err(|e| TranscodeError::Resampler(e.to_string()))?;
        Ok(Self {
            inner,
            channels: channels as usize,
            input_chunk,
            staging: vec![Vec::new(); channels as usize],
        })
    }

    /// Feed interleaved samples; returns interleaved output as chunks
    /// complete (possibly empty).
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>, TranscodeError> {
        for frame in interleaved.chunks(self.channels) {
            for (channel, &sample) in frame.iter().enumerate() {
                self.staging[channel].push(sample);
            }
        }

        let mut out = Vec::new();
        while self.staging[0].len() >= self.input_chunk {
            let chunk: Vec<Vec<f32>> = self
                .staging
                .iter_mut()
                .map(|c| c.drain(..self.input_chunk).collect())
                .collect();
            let resampled = self
                .inner
                .process(&chunk, None)
                .map_err(|e| TranscodeError::Resampler(e.to_string()))?;
            let frames = resampled[0].len();
            for i in 0..frames {
                for plane in &resampled {
                    out.push(plane[i]);
                }
            }
        }
        Ok(out)
    }
}

/// Opus encoder tail: 20 ms frames out, one packet each.
pub struct AudioEncoder {
    inner: OpusEncoder,
    channels: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    scratch: Vec<u8>,
}

impl AudioEncoder {
    pub fn new(sample_rate: u32, channels: u8, bitrate_kbps: u32) -> Result<Self, TranscodeError> {
        let mut inner = OpusEncoder::new(
            sample_rate_of(sample_rate)?,
            channels_of(channels)?,
            Application::Audio,
        )
        .map_err(|e| TranscodeError::Audio(e.to_string()))?;
        inner
            .set_bitrate(audiopus::Bitrate::BitsPerSecond(
                (bitrate_kbps * 1_000) as i32,
            ))
            .map_err(|e| TranscodeError::Audio(e.to_string()))?;
        Ok(Self {
            inner,
            channels: channels as usize,
            sample_rate,
            pending: Vec::new(),
            scratch: vec![0u8; 4_000],
        })
    }

    /// Frame size in samples per channel at this encoder's rate.
    fn frame_samples(&self) -> usize {
        (self.sample_rate as usize / 1_000) * 20
    }

    /// Feed interleaved PCM; returns encoded packets with their sample
    /// counts for timestamp advancement.
    pub fn encode(&mut self, interleaved: &[f32]) -> Result<Vec<(Bytes, usize)>, TranscodeError> {
        self.pending.extend_from_slice(interleaved);
        let frame_len = self.frame_samples() * self.channels;

        let mut packets = Vec::new();
        while self.pending.len() >= frame_len {
            let frame: Vec<f32> = self.pending.drain(..frame_len).collect();
            let written = self
                .inner
                .encode_float(&frame, &mut self.scratch[..])
                .map_err(|e| TranscodeError::Audio(e.to_string()))?;
            packets.push((
                Bytes::copy_from_slice(&self.scratch[..written]),
                self.frame_samples(),
            ));
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mapping() {
        assert!(channels_of(1).is_ok());
        assert!(channels_of(2).is_ok());
        assert!(channels_of(6).is_err());
    }

    #[test]
    fn test_sample_rate_mapping() {
        assert!(sample_rate_of(48_000).is_ok());
        assert!(sample_rate_of(44_100).is_err());
    }

    #[test]
    fn test_resampler_ratio() {
        let mut resampler = AudioResampler::new(48_000, 24_000, 2).unwrap();
        // 40 ms of stereo input: two full 20 ms chunks.
        let input = vec![0.25f32; 48 * 40 * 2];
        let output = resampler.process(&input).unwrap();
        // Roughly half the frames (fft resampler may hold transients).
        assert!(!output.is_empty());
        assert_eq!(output.len() % 2, 0);
        assert!(output.len() <= input.len() / 2 + 2_048);
    }
}
