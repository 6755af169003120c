use {
    super::rtp::RtpPacket,
    bytes::{BufMut, Bytes, BytesMut},
};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// A depacketized access unit with its RTP timestamp.
pub struct AccessUnit {
    pub timestamp: u32,
    pub data: Bytes,
    pub keyframe: bool,
}

/// Reassembles H.264 access units from RTP payloads (RFC 6184): single
/// NAL, STAP-A aggregation, and FU-A fragmentation. NAL units sharing one
/// RTP timestamp form one access unit, closed by the marker bit or a
/// timestamp change.
pub struct H264Depacketizer {
    assembling: BytesMut,
    fragment: BytesMut,
    timestamp: u32,
    has_idr: bool,
}

impl Default for H264Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl H264Depacketizer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            assembling: BytesMut::new(),
            fragment: BytesMut::new(),
            timestamp: 0,
            has_idr: false,
        }
    }

    pub fn push(&mut self, packet: &RtpPacket) -> Option<AccessUnit> {
        let mut finished = None;
        if !self.assembling.is_empty() && packet.timestamp != self.timestamp {
            finished = self.take_unit();
        }
        self.timestamp = packet.timestamp;

        let payload = &packet.payload;
        if payload.is_empty() {
            return finished;
        }
        let nal_type = payload[0] & 0x1F;
        match nal_type {
            1..=23 => self.append_nal(payload),
            24 => {
                // STAP-A: u16-length-prefixed NAL units after the header.
                let mut offset = 1usize;
                while offset + 2 <= payload.len() {
                    let len =
                        u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                    offset += 2;
                    if offset + len > payload.len() {
                        break;
                    }
                    self.append_nal(&payload[offset..offset + len]);
                    offset += len;
                }
            }
            28 => {
                // FU-A.
                if payload.len() < 2 {
                    return finished;
                }
                let indicator = payload[0];
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                if start {
                    self.fragment.clear();
                    let reconstructed = (indicator & 0xE0) | (fu_header & 0x1F);
                    self.fragment.put_u8(reconstructed);
                }
                self.fragment.put_slice(&payload[2..]);
                if end && !self.fragment.is_empty() {
                    let nal = self.fragment.split();
                    self.append_nal(&nal);
                }
            }
            _ => {
                tracing::trace!(nal_type, "ignoring unsupported h264 rtp payload");
            }
        }

        if packet.marker {
            if let Some(unit) = self.take_unit() {
                // A marker-closed unit supersedes any timestamp-change
                // flush from the same packet (they cannot both be Some).
                return finished.or(Some(unit));
            }
        }
        finished
    }

    fn append_nal(&mut self, nal: &[u8]) {
        if nal.is_empty() {
            return;
        }
        if nal[0] & 0x1F == crate::codec::h264::nal_type::IDR {
            self.has_idr = true;
        }
        self.assembling.put_slice(&START_CODE);
        self.assembling.put_slice(nal);
    }

    fn take_unit(&mut self) -> Option<AccessUnit> {
        if self.assembling.is_empty() {
            return None;
        }
        let data = self.assembling.split().freeze();
        let keyframe = self.has_idr;
        self.has_idr = false;
        Some(AccessUnit {
            timestamp: self.timestamp,
            data,
            keyframe,
        })
    }
}

/// H.265 reassembly (RFC 7798): single NAL, AP (48), FU (49).
pub struct H265Depacketizer {
    assembling: BytesMut,
    fragment: BytesMut,
    timestamp: u32,
    has_irap: bool,
}

impl Default for H265Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl H265Depacketizer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            assembling: BytesMut::new(),
            fragment: BytesMut::new(),
            timestamp: 0,
            has_irap: false,
        }
    }

    pub fn push(&mut self, packet: &RtpPacket) -> Option<AccessUnit> {
        let mut finished = None;
        if !self.assembling.is_empty() && packet.timestamp != self.timestamp {
            finished = self.take_unit();
        }
        self.timestamp = packet.timestamp;

        let payload = &packet.payload;
        if payload.len() < 2 {
            return finished;
        }
        let nal_type = (payload[0] >> 1) & 0x3F;
        match nal_type {
            48 => {
                let mut offset = 2usize;
                while offset + 2 <= payload.len() {
                    let len =
                        u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                    offset += 2;
                    if offset + len > payload.len() {
                        break;
                    }
                    self.append_nal(&payload[offset..offset + len]);
                    offset += len;
                }
            }
            49 => {
                if payload.len() < 3 {
                    return finished;
                }
                let fu_header = payload[2];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                if start {
                    self.fragment.clear();
                    let fu_type = fu_header & 0x3F;
                    self.fragment.put_u8((payload[0] & 0x81) | (fu_type << 1));
                    self.fragment.put_u8(payload[1]);
                }
                self.fragment.put_slice(&payload[3..]);
                if end && !self.fragment.is_empty() {
                    let nal = self.fragment.split();
                    self.append_nal(&nal);
                }
            }
            0..=47 => self.append_nal(payload),
            _ => {}
        }

        if packet.marker {
            if let Some(unit) = self.take_unit() {
                return finished.or(Some(unit));
            }
        }
        finished
    }

    fn append_nal(&mut self, nal: &[u8]) {
        if nal.is_empty() {
            return;
        }
        let nal_type = (nal[0] >> 1) & 0x3F;
        if (16..=23).contains(&nal_type) {
            self.has_irap = true;
        }
        self.assembling.put_slice(&START_CODE);
        self.assembling.put_slice(nal);
    }

    fn take_unit(&mut self) -> Option<AccessUnit> {
        if self.assembling.is_empty() {
            return None;
        }
        let data = self.assembling.split().freeze();
        let keyframe = self.has_irap;
        self.has_irap = false;
        Some(AccessUnit {
            timestamp: self.timestamp,
            data,
            keyframe,
        })
    }
}

/// VP8 reassembly (RFC 7741): payload descriptor stripped, partitions
/// concatenated until the marker bit closes the frame. Keyframes are
/// detected from the VP8 frame header P bit.
pub struct Vp8Depacketizer {
    assembling: BytesMut,
    timestamp: u32,
}

impl Default for Vp8Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Vp8Depacketizer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            assembling: BytesMut::new(),
            timestamp: 0,
        }
    }

    pub fn push(&mut self, packet: &RtpPacket) -> Option<AccessUnit> {
        let payload = &packet.payload;
        if payload.is_empty() {
            return None;
        }
        if !self.assembling.is_empty() && packet.timestamp != self.timestamp {
            // Lost the marker of the previous frame; drop the partial.
            self.assembling.clear();
        }
        self.timestamp = packet.timestamp;

        // Payload descriptor: X flag opens extension fields.
        let first = payload[0];
        let extended = first & 0x80 != 0;
        let start_of_partition = first & 0x10 != 0;
        let mut offset = 1usize;
        if extended {
            if payload.len() < 2 {
                return None;
            }
            let ext = payload[1];
            offset += 1;
            if ext & 0x80 != 0 {
                // PictureID, one or two bytes
                if payload.len() <= offset {
                    return None;
                }
                offset += if payload[offset] & 0x80 != 0 { 2 } else { 1 };
            }
            if ext & 0x40 != 0 {
                offset += 1; // TL0PICIDX
            }
            if ext & 0x30 != 0 {
                offset += 1; // TID/KEYIDX
            }
        }
        if payload.len() <= offset {
            return None;
        }
        if self.assembling.is_empty() && !start_of_partition {
            return None; // mid-frame join, wait for next frame start
        }
        self.assembling.put_slice(&payload[offset..]);

        if packet.marker {
            let data = self.assembling.split().freeze();
            let keyframe = !data.is_empty() && data[0] & 0x01 == 0;
            return Some(AccessUnit {
                timestamp: self.timestamp,
                data,
                keyframe,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp(sequence: u16, timestamp: u32, marker: bool, payload: &[u8]) -> RtpPacket {
        RtpPacket {
            marker,
            payload_type: 96,
            sequence,
            timestamp,
            ssrc: 1,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_single_nal_with_marker() {
        let mut depack = H264Depacketizer::new();
        let unit = depack.push(&rtp(1, 3_000, true, &[0x65, 0xAA, 0xBB])).unwrap();
        assert!(unit.keyframe);
        assert_eq!(unit.data.as_ref(), &[0, 0, 0, 1, 0x65, 0xAA, 0xBB]);
    }

    #[test]
    fn test_fua_reassembly() {
        let mut depack = H264Depacketizer::new();
        // Fragmented IDR (type 5), NRI bits 0x60.
        assert!(depack
            .push(&rtp(1, 3_000, false, &[0x7C, 0x85, 0x01, 0x02]))
            .is_none());
        assert!(depack
            .push(&rtp(2, 3_000, false, &[0x7C, 0x05, 0x03]))
            .is_none());
        let unit = depack
            .push(&rtp(3, 3_000, true, &[0x7C, 0x45, 0x04]))
            .unwrap();
        assert!(unit.keyframe);
        // Reconstructed header: (0x7C & 0xE0) | 5 = 0x65.
        assert_eq!(unit.data.as_ref(), &[0, 0, 0, 1, 0x65, 1, 2, 3, 4]);
    }

    #[test]
    fn test_stap_a_splits() {
        let mut depack = H264Depacketizer::new();
        let mut stap = vec![0x78]; // STAP-A
        stap.extend_from_slice(&[0x00, 0x02, 0x67, 0x42]); // SPS
        stap.extend_from_slice(&[0x00, 0x02, 0x68, 0xCE]); // PPS
        let unit = depack.push(&rtp(1, 0, true, &stap)).unwrap();
        assert_eq!(
            unit.data.as_ref(),
            &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE]
        );
    }

    #[test]
    fn test_timestamp_change_flushes_previous_unit() {
        let mut depack = H264Depacketizer::new();
        assert!(depack.push(&rtp(1, 3_000, false, &[0x41, 0x01])).is_none());
        // Next timestamp arrives without a marker on the previous one.
        let unit = depack.push(&rtp(2, 6_000, true, &[0x41, 0x02])).unwrap();
        assert_eq!(unit.timestamp, 3_000);
        assert_eq!(unit.data.as_ref(), &[0, 0, 0, 1, 0x41, 0x01]);
    }

    #[test]
    fn test_vp8_keyframe_reassembly() {
        let mut depack = Vp8Depacketizer::new();
        // Simple descriptor, start of partition; keyframe (P bit 0).
        assert!(depack.push(&rtp(1, 0, false, &[0x10, 0x00, 0x12])).is_none());
        let unit = depack.push(&rtp(2, 0, true, &[0x00, 0x34])).unwrap();
        assert!(unit.keyframe);
        assert_eq!(unit.data.as_ref(), &[0x00, 0x12, 0x34]);
    }

    #[test]
    fn test_vp8_extended_descriptor_with_picture_id() {
        let mut depack = Vp8Depacketizer::new();
        // X set, I set, 15-bit picture id (2 bytes), start bit set.
        let unit = depack
            .push(&rtp(1, 3_000, true, &[0x90, 0x80, 0x81, 0x02, 0x01, 0xAA]))
            .unwrap();
        // P bit of 0x01 is 1: inter frame.
        assert!(!unit.keyframe);
        assert_eq!(unit.data.as_ref(), &[0x01, 0xAA]);
    }

    #[test]
    fn test_h265_fu_reassembly() {
        let mut depack = H265Depacketizer::new();
        // FU carrying IDR_W_RADL (type 19): payload hdr type 49 = 0x62.
        assert!(depack
            .push(&rtp(1, 0, false, &[0x62, 0x01, 0x93, 0xAA]))
            .is_none());
        let unit = depack
            .push(&rtp(2, 0, true, &[0x62, 0x01, 0x53, 0xBB]))
            .unwrap();
        assert!(unit.keyframe);
        // Reconstructed: (0x62 & 0x81) | (19 << 1) = 0x26.
        assert_eq!(unit.data.as_ref(), &[0, 0, 0, 1, 0x26, 0x01, 0xAA, 0xBB]);
    }
}
