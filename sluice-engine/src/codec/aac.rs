use {
    super::errors::CodecError,
    bytes::{BufMut, Bytes, BytesMut},
};

const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// MPEG-4 AudioSpecificConfig: the two (or more) bytes of out-of-band AAC
/// configuration carried by RTMP sequence headers and CMAF init segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub channel_configuration: u8,
}

impl AudioSpecificConfig {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 2 {
            return Err(CodecError::MalformedConfigurationRecord);
        }
        let object_type = data[0] >> 3;
        let sample_rate_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
        let channel_configuration = (data[1] >> 3) & 0x0F;
        if sample_rate_index as usize >= SAMPLE_RATES.len() {
            return Err(CodecError::UnsupportedSampleRateIndex(sample_rate_index));
        }
        Ok(Self {
            object_type,
            sample_rate_index,
            channel_configuration,
        })
    }

    #[must_use]
    pub fn marshal(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(2);
        out.put_u8((self.object_type << 3) | (self.sample_rate_index >> 1));
        out.put_u8(((self.sample_rate_index & 0x01) << 7) | (self.channel_configuration << 3));
        out.freeze()
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES[self.sample_rate_index as usize]
    }

    pub fn from_params(object_type: u8, sample_rate: u32, channels: u8) -> Result<Self, CodecError> {
        let sample_rate_index = SAMPLE_RATES
            .iter()
            .position(|&r| r == sample_rate)
            .ok_or(CodecError::UnsupportedSampleRateIndex(0xFF))? as u8;
        Ok(Self {
            object_type,
            sample_rate_index,
            channel_configuration: channels,
        })
    }

    /// Wrap one raw AAC frame in a 7-byte ADTS header (no CRC).
    #[must_use]
    pub fn adts_frame(&self, raw: &[u8]) -> BytesMut {
        let frame_len = raw.len() + 7;
        let mut out = BytesMut::with_capacity(frame_len);
        out.put_u8(0xFF);
        out.put_u8(0xF1); // MPEG-4, layer 0, no CRC
        out.put_u8(
            (((self.object_type - 1) & 0x03) << 6)
                | ((self.sample_rate_index & 0x0F) << 2)
                | ((self.channel_configuration >> 2) & 0x01),
        );
        out.put_u8(((self.channel_configuration & 0x03) << 6) | ((frame_len >> 11) & 0x03) as u8);
        out.put_u8(((frame_len >> 3) & 0xFF) as u8);
        out.put_u8((((frame_len & 0x07) << 5) | 0x1F) as u8);
        out.put_u8(0xFC);
        out.put_slice(raw);
        out
    }
}

/// Parsed 7-byte ADTS header plus the raw frame behind it.
#[derive(Debug, Clone)]
pub struct AdtsFrame {
    pub config: AudioSpecificConfig,
    pub payload: Bytes,
    /// Total frame length including the header, for walking concatenated
    /// ADTS frames.
    pub frame_len: usize,
}

/// Strip the ADTS header off one frame, recovering the equivalent
/// AudioSpecificConfig. Round-trips with [`AudioSpecificConfig::adts_frame`].
pub fn demux_adts(data: &[u8]) -> Result<AdtsFrame, CodecError> {
    if data.len() < 7 || data[0] != 0xFF || (data[1] & 0xF0) != 0xF0 {
        return Err(CodecError::MalformedAdtsHeader);
    }
    let protection_absent = data[1] & 0x01 == 1;
    let header_len = if protection_absent { 7 } else { 9 };
    let object_type = ((data[2] >> 6) & 0x03) + 1;
    let sample_rate_index = (data[2] >> 2) & 0x0F;
    let channel_configuration = ((data[2] & 0x01) << 2) | ((data[3] >> 6) & 0x03);
    let frame_len =
        ((data[3] as usize & 0x03) << 11) | ((data[4] as usize) << 3) | ((data[5] as usize) >> 5);
    if frame_len < header_len || frame_len > data.len() {
        return Err(CodecError::MalformedAdtsHeader);
    }
    if sample_rate_index as usize >= SAMPLE_RATES.len() {
        return Err(CodecError::UnsupportedSampleRateIndex(sample_rate_index));
    }
    Ok(AdtsFrame {
        config: AudioSpecificConfig {
            object_type,
            sample_rate_index,
            channel_configuration,
        },
        payload: Bytes::copy_from_slice(&data[header_len..frame_len]),
        frame_len,
    })
}

/// Number of PCM samples per AAC frame (AAC-LC).
pub const SAMPLES_PER_FRAME: u32 = 1_024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asc_round_trip() {
        // AAC-LC, 44.1 kHz, stereo.
        let config = AudioSpecificConfig::from_params(2, 44_100, 2).unwrap();
        let bytes = config.marshal();
        assert_eq!(bytes.as_ref(), &[0x12, 0x10]);
        let parsed = AudioSpecificConfig::parse(&bytes).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.sample_rate(), 44_100);
    }

    #[test]
    fn test_asc_48k_mono() {
        let config = AudioSpecificConfig::from_params(2, 48_000, 1).unwrap();
        let parsed = AudioSpecificConfig::parse(&config.marshal()).unwrap();
        assert_eq!(parsed.sample_rate(), 48_000);
        assert_eq!(parsed.channel_configuration, 1);
    }

    #[test]
    fn test_adts_round_trip() {
        let config = AudioSpecificConfig::from_params(2, 48_000, 2).unwrap();
        let raw = [0xDEu8, 0xAD, 0xBE, 0xEF, 0x42];
        let adts = config.adts_frame(&raw);
        assert_eq!(adts.len(), raw.len() + 7);
        let demuxed = demux_adts(&adts).unwrap();
        assert_eq!(demuxed.payload.as_ref(), &raw);
        assert_eq!(demuxed.config, config);
    }

    #[test]
    fn test_adts_rejects_bad_syncword() {
        assert!(demux_adts(&[0x00; 16]).is_err());
    }

    #[test]
    fn test_adts_rejects_truncated_frame() {
        let config = AudioSpecificConfig::from_params(2, 48_000, 2).unwrap();
        let adts = config.adts_frame(&[0u8; 32]);
        assert!(demux_adts(&adts[..10]).is_err());
    }

    #[test]
    fn test_unsupported_sample_rate() {
        assert!(AudioSpecificConfig::from_params(2, 13_370, 2).is_err());
    }
}
