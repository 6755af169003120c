use {
    super::errors::CodecError,
    crate::bytesio::{bits::BitReader, bytes_reader::BytesReader, bytes_writer::BytesWriter},
    byteorder::BigEndian,
    bytes::{BufMut, Bytes, BytesMut},
};

pub mod nal_type {
    pub const SLICE: u8 = 1;
    pub const IDR: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
}

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// ISO/IEC 14496-15 AVCDecoderConfigurationRecord: the out-of-band SPS/PPS
/// carried by RTMP sequence headers and CMAF init segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcDecoderConfigurationRecord {
    pub profile_indication: u8,
    pub profile_compatibility: u8,
    pub level_indication: u8,
    pub nalu_length_size: usize,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcDecoderConfigurationRecord {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = BytesReader::new(BytesMut::from(data));

        let version = reader.read_u8()?;
        if version != 1 {
            return Err(CodecError::MalformedConfigurationRecord);
        }
        let profile_indication = reader.read_u8()?;
        let profile_compatibility = reader.read_u8()?;
        let level_indication = reader.read_u8()?;
        let nalu_length_size = (reader.read_u8()? & 0x03) as usize + 1;

        let sps_count = (reader.read_u8()? & 0x1F) as usize;
        let mut sps = Vec::with_capacity(sps_count);
        for _ in 0..sps_count {
            let len = reader.read_u16::<BigEndian>()? as usize;
            sps.push(reader.read_bytes(len)?.freeze());
        }

        let pps_count = reader.read_u8()? as usize;
        let mut pps = Vec::with_capacity(pps_count);
        for _ in 0..pps_count {
            let len = reader.read_u16::<BigEndian>()? as usize;
            pps.push(reader.read_bytes(len)?.freeze());
        }

        Ok(Self {
            profile_indication,
            profile_compatibility,
            level_indication,
            nalu_length_size,
            sps,
            pps,
        })
    }

    pub fn marshal(&self) -> Result<Bytes, CodecError> {
        let mut writer = BytesWriter::new();
        writer.write_u8(1)?;
        writer.write_u8(self.profile_indication)?;
        writer.write_u8(self.profile_compatibility)?;
        writer.write_u8(self.level_indication)?;
        writer.write_u8(0xFC | ((self.nalu_length_size - 1) as u8 & 0x03))?;
        writer.write_u8(0xE0 | (self.sps.len() as u8 & 0x1F))?;
        for sps in &self.sps {
            writer.write_u16::<BigEndian>(sps.len() as u16)?;
            writer.write(sps)?;
        }
        writer.write_u8(self.pps.len() as u8)?;
        for pps in &self.pps {
            writer.write_u16::<BigEndian>(pps.len() as u16)?;
            writer.write(pps)?;
        }
        Ok(writer.extract_current_bytes().freeze())
    }

    /// Build a record from bare SPS/PPS NAL units (WebRTC and RTSP ingest,
    /// where parameter sets arrive in-band).
    pub fn from_parameter_sets(sps: Bytes, pps: Bytes) -> Result<Self, CodecError> {
        if sps.len() < 4 {
            return Err(CodecError::MalformedConfigurationRecord);
        }
        Ok(Self {
            profile_indication: sps[1],
            profile_compatibility: sps[2],
            level_indication: sps[3],
            nalu_length_size: 4,
            sps: vec![sps],
            pps: vec![pps],
        })
    }

    /// SPS/PPS as an Annex-B prefix for in-band insertion before IDR frames.
    #[must_use]
    pub fn annexb_parameter_sets(&self) -> Bytes {
        let mut out = BytesMut::new();
        for nal in self.sps.iter().chain(self.pps.iter()) {
            out.put_slice(&START_CODE);
            out.put_slice(nal);
        }
        out.freeze()
    }
}

/// Convert a length-prefixed (AVCC) access unit to start-code (Annex-B)
/// framing. Round-trips with [`annexb_to_avcc`] modulo the framing bytes.
pub fn avcc_to_annexb(data: &[u8], nalu_length_size: usize) -> Result<BytesMut, CodecError> {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + nalu_length_size > data.len() {
            return Err(CodecError::TruncatedNalUnit);
        }
        let mut len = 0usize;
        for &b in &data[pos..pos + nalu_length_size] {
            len = (len << 8) | b as usize;
        }
        pos += nalu_length_size;
        if pos + len > data.len() {
            return Err(CodecError::TruncatedNalUnit);
        }
        out.put_slice(&START_CODE);
        out.put_slice(&data[pos..pos + len]);
        pos += len;
    }
    Ok(out)
}

/// Convert an Annex-B access unit to 4-byte length-prefixed (AVCC) framing.
pub fn annexb_to_avcc(data: &[u8]) -> Result<BytesMut, CodecError> {
    let nals = split_annexb(data);
    if nals.is_empty() {
        return Err(CodecError::MissingStartCode);
    }
    let mut out = BytesMut::with_capacity(data.len() + 16);
    for nal in nals {
        out.put_u32(nal.len() as u32);
        out.put_slice(nal);
    }
    Ok(out)
}

/// Split an Annex-B stream into NAL unit slices (start codes stripped).
/// Accepts both 3- and 4-byte start codes.
#[must_use]
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut start = None;
    let mut i = 0usize;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                if code_start > s {
                    nals.push(&data[s..code_start]);
                }
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if s < data.len() {
            nals.push(&data[s..]);
        }
    }
    nals
}

/// Whether an access unit contains an IDR slice.
#[must_use]
pub fn is_keyframe(data: &[u8], avcc: bool, nalu_length_size: usize) -> bool {
    if avcc {
        let mut pos = 0usize;
        while pos + nalu_length_size < data.len() {
            let mut len = 0usize;
            for &b in &data[pos..pos + nalu_length_size] {
                len = (len << 8) | b as usize;
            }
            pos += nalu_length_size;
            if pos >= data.len() || pos + len > data.len() {
                return false;
            }
            if data[pos] & 0x1F == nal_type::IDR {
                return true;
            }
            pos += len;
        }
        false
    } else {
        split_annexb(data)
            .iter()
            .any(|nal| !nal.is_empty() && nal[0] & 0x1F == nal_type::IDR)
    }
}

/// The subset of SPS fields the origin needs: profile/level and coded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

impl SpsInfo {
    /// Parse a bare SPS NAL unit (header byte included).
    pub fn parse(nal: &[u8]) -> Result<Self, CodecError> {
        if nal.len() < 4 || nal[0] & 0x1F != nal_type::SPS {
            return Err(CodecError::MalformedConfigurationRecord);
        }
        let rbsp = strip_emulation_prevention(&nal[1..]);
        let mut r = BitReader::new(&rbsp);

        let profile_idc = r.read_bits(8)? as u8;
        r.read_bits(8)?; // constraint flags + reserved
        let level_idc = r.read_bits(8)? as u8;
        r.read_ue()?; // seq_parameter_set_id

        let mut chroma_format_idc = 1u64;
        if matches!(
            profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            chroma_format_idc = r.read_ue()?;
            if chroma_format_idc == 3 {
                r.read_bit()?; // separate_colour_plane_flag
            }
            r.read_ue()?; // bit_depth_luma_minus8
            r.read_ue()?; // bit_depth_chroma_minus8
            r.read_bit()?; // qpprime_y_zero_transform_bypass_flag
            if r.read_bit()? == 1 {
                // seq_scaling_matrix_present
                let count = if chroma_format_idc == 3 { 12 } else { 8 };
                for i in 0..count {
                    if r.read_bit()? == 1 {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        r.read_ue()?; // log2_max_frame_num_minus4
        let pic_order_cnt_type = r.read_ue()?;
        if pic_order_cnt_type == 0 {
            r.read_ue()?;
        } else if pic_order_cnt_type == 1 {
            r.read_bit()?;
            r.read_se()?;
            r.read_se()?;
            let cycles = r.read_ue()?;
            for _ in 0..cycles {
                r.read_se()?;
            }
        }
        r.read_ue()?; // max_num_ref_frames
        r.read_bit()?; // gaps_in_frame_num_value_allowed_flag

        let pic_width_in_mbs_minus1 = r.read_ue()?;
        let pic_height_in_map_units_minus1 = r.read_ue()?;
        let frame_mbs_only_flag = r.read_bit()?;
        if frame_mbs_only_flag == 0 {
            r.read_bit()?; // mb_adaptive_frame_field_flag
        }
        r.read_bit()?; // direct_8x8_inference_flag

        let mut width = (pic_width_in_mbs_minus1 as u32 + 1) * 16;
        let mut height =
            (pic_height_in_map_units_minus1 as u32 + 1) * 16 * (2 - u32::from(frame_mbs_only_flag));

        if r.read_bit()? == 1 {
            // frame_cropping_flag
            let crop_left = r.read_ue()? as u32;
            let crop_right = r.read_ue()? as u32;
            let crop_top = r.read_ue()? as u32;
            let crop_bottom = r.read_ue()? as u32;
            let (sub_w, sub_h) = match chroma_format_idc {
                0 => (1, 2 - u32::from(frame_mbs_only_flag)),
                1 => (2, 2 * (2 - u32::from(frame_mbs_only_flag))),
                2 => (2, 2 - u32::from(frame_mbs_only_flag)),
                _ => (1, 2 - u32::from(frame_mbs_only_flag)),
            };
            width -= (crop_left + crop_right) * sub_w;
            height -= (crop_top + crop_bottom) * sub_h;
        }

        Ok(Self {
            profile_idc,
            level_idc,
            width,
            height,
        })
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), CodecError> {
    let mut last_scale = 8i64;
    let mut next_scale = 8i64;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal baseline SPS, 64x64: profile 66, level 30, 4x4 macroblocks,
    // frame_mbs_only, no cropping, no VUI.
    const SPS_64X64: [u8; 7] = [0x67, 0x42, 0x00, 0x1E, 0xF4, 0x21, 0x32];

    #[test]
    fn test_avcc_annexb_round_trip() {
        // Two NAL units, 4-byte length prefixes.
        let avcc: &[u8] = &[
            0, 0, 0, 3, 0x65, 0xAA, 0xBB, // IDR slice
            0, 0, 0, 2, 0x06, 0x01, // SEI
        ];
        let annexb = avcc_to_annexb(avcc, 4).unwrap();
        assert_eq!(
            annexb.as_ref(),
            &[0, 0, 0, 1, 0x65, 0xAA, 0xBB, 0, 0, 0, 1, 0x06, 0x01]
        );
        let back = annexb_to_avcc(&annexb).unwrap();
        assert_eq!(back.as_ref(), avcc);
    }

    #[test]
    fn test_split_annexb_mixed_start_codes() {
        let data: &[u8] = &[0, 0, 1, 0x67, 0x11, 0, 0, 0, 1, 0x68, 0x22];
        let nals = split_annexb(data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x67, 0x11]);
        assert_eq!(nals[1], &[0x68, 0x22]);
    }

    #[test]
    fn test_keyframe_detection() {
        let idr_avcc: &[u8] = &[0, 0, 0, 2, 0x65, 0x00];
        let non_key_avcc: &[u8] = &[0, 0, 0, 2, 0x41, 0x00];
        assert!(is_keyframe(idr_avcc, true, 4));
        assert!(!is_keyframe(non_key_avcc, true, 4));

        let idr_annexb: &[u8] = &[0, 0, 0, 1, 0x65, 0x00];
        assert!(is_keyframe(idr_annexb, false, 4));
    }

    #[test]
    fn test_configuration_record_round_trip() {
        let record = AvcDecoderConfigurationRecord {
            profile_indication: 0x42,
            profile_compatibility: 0xC0,
            level_indication: 0x1F,
            nalu_length_size: 4,
            sps: vec![Bytes::from_static(&SPS_64X64)],
            pps: vec![Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80])],
        };
        let marshalled = record.marshal().unwrap();
        let parsed = AvcDecoderConfigurationRecord::parse(&marshalled).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_configuration_record_rejects_bad_version() {
        assert!(AvcDecoderConfigurationRecord::parse(&[2, 0x42, 0, 0x1F, 0xFF, 0xE0]).is_err());
    }

    #[test]
    fn test_sps_dimensions() {
        let info = SpsInfo::parse(&SPS_64X64).unwrap();
        assert_eq!(info.profile_idc, 0x42);
        assert_eq!(info.width, 64);
        assert_eq!(info.height, 64);
    }

    #[test]
    fn test_truncated_avcc_rejected() {
        let bad: &[u8] = &[0, 0, 0, 9, 0x65];
        assert!(avcc_to_annexb(bad, 4).is_err());
    }

    #[test]
    fn test_emulation_prevention_strip() {
        let data = [0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00];
        assert_eq!(
            strip_emulation_prevention(&data),
            vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }
}
