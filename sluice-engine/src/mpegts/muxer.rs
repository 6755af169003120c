use {
    super::{
        define,
        errors::MpegTsError,
        pat::{Pat, PatEntry},
        pes,
        pmt::{Pmt, PmtMuxer, PmtStream},
    },
    crate::bytesio::bytes_writer::BytesWriter,
    bytes::{BufMut, Bytes, BytesMut},
};

pub const MPEG_FLAG_IDR_FRAME: u16 = 0x0001;

struct TsStream {
    pid: u16,
    stream_type: u8,
    continuity_counter: u8,
    es_info: Bytes,
}

impl TsStream {
    fn pes_stream_id(&self) -> u8 {
        match self.stream_type {
            define::PSI_STREAM_H264 | define::PSI_STREAM_H265 => pes::stream_id::VIDEO,
            define::PSI_STREAM_AAC => pes::stream_id::AUDIO,
            _ => pes::stream_id::PRIVATE_1,
        }
    }
}

/// Packetises elementary streams into 188-byte transport stream packets.
///
/// PAT and PMT are re-emitted before every keyframe and at least every
/// [`define::PSI_INTERVAL_PACKETS`] media packets so a subscriber joining
/// mid-stream always sees tables before media. Continuity counters are
/// consistent per PID for the lifetime of the muxer, across `reset()`.
pub struct TsMuxer {
    writer: BytesWriter,
    streams: Vec<TsStream>,
    next_pid: u16,
    pat_continuity: u8,
    pmt_continuity: u8,
    packets_since_psi: usize,
    psi_written: bool,
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsMuxer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writer: BytesWriter::new(),
            streams: Vec::new(),
            next_pid: define::FIRST_ES_PID,
            pat_continuity: 0,
            pmt_continuity: 0,
            packets_since_psi: 0,
            psi_written: false,
        }
    }

    /// Register an elementary stream; returns its PID.
    pub fn add_stream(&mut self, stream_type: u8, es_info: BytesMut) -> Result<u16, MpegTsError> {
        if self.streams.len() >= define::MAX_ELEMENTARY_STREAMS {
            return Err(MpegTsError::TooManyStreams);
        }
        let pid = self.next_pid;
        self.next_pid += 1;
        self.streams.push(TsStream {
            pid,
            stream_type,
            continuity_counter: 0,
            es_info: es_info.freeze(),
        });
        Ok(pid)
    }

    /// PID used as the PCR reference: the first video stream, else the
    /// first stream.
    fn pcr_pid(&self) -> u16 {
        self.streams
            .iter()
            .find(|s| {
                matches!(
                    s.stream_type,
                    define::PSI_STREAM_H264 | define::PSI_STREAM_H265
                )
            })
            .or_else(|| self.streams.first())
            .map_or(define::PID_NULL, |s| s.pid)
    }

    /// Write one access unit. `pts`/`dts` are in the 90 kHz clock; `flags`
    /// carries [`MPEG_FLAG_IDR_FRAME`] for keyframes.
    pub fn write(
        &mut self,
        pid: u16,
        pts: i64,
        dts: i64,
        flags: u16,
        payload: BytesMut,
    ) -> Result<(), MpegTsError> {
        let is_idr = flags & MPEG_FLAG_IDR_FRAME != 0;
        if !self.psi_written || is_idr || self.packets_since_psi >= define::PSI_INTERVAL_PACKETS {
            self.write_psi()?;
        }
        self.packets_since_psi += 1;

        let stream_idx = self
            .streams
            .iter()
            .position(|s| s.pid == pid)
            .ok_or(MpegTsError::UnknownPid(pid))?;
        let sid = self.streams[stream_idx].pes_stream_id();
        let pcr_pid = self.pcr_pid();

        let mut pes_writer = BytesWriter::new();
        pes::write_pes_header(&mut pes_writer, sid, payload.len(), pts, dts)?;
        pes_writer.write(&payload)?;
        let pes = pes_writer.extract_current_bytes();

        let write_pcr = pid == pcr_pid;
        self.write_pes_packets(stream_idx, &pes, write_pcr.then_some(dts))?;
        Ok(())
    }

    fn write_pes_packets(
        &mut self,
        stream_idx: usize,
        pes: &[u8],
        pcr: Option<i64>,
    ) -> Result<(), MpegTsError> {
        let pid = self.streams[stream_idx].pid;
        let mut remaining = pes;
        let mut first = true;

        while !remaining.is_empty() {
            let cc = {
                let stream = &mut self.streams[stream_idx];
                let cc = stream.continuity_counter;
                stream.continuity_counter = (cc + 1) & 0x0F;
                cc
            };

            let mut packet = BytesMut::with_capacity(define::TS_PACKET_SIZE);
            packet.put_u8(define::TS_SYNC_BYTE);
            let pusi = if first { 0x40u16 } else { 0x00 };
            packet.put_u16(pusi | (pid & 0x1FFF));

            // Adaptation field needed for PCR on the first packet or for
            // stuffing when less than a full payload remains.
            let pcr_here = first.then_some(pcr).flatten();
            let adaptation_base = if pcr_here.is_some() { 8 } else { 0 };
            let available = 184 - adaptation_base;
            let chunk_len = remaining.len().min(available);
            let needs_stuffing = chunk_len < available;

            if pcr_here.is_some() || needs_stuffing {
                packet.put_u8(0x30 | (cc & 0x0F)); // adaptation + payload
                let af_len = (184 - chunk_len - 1) as u8;
                packet.put_u8(af_len);
                if af_len > 0 {
                    let mut af_flags = 0u8;
                    if pcr_here.is_some() {
                        af_flags |= 0x10;
                    }
                    packet.put_u8(af_flags);
                    let mut stuffing = af_len as usize - 1;
                    if let Some(pcr_val) = pcr_here {
                        let base = (pcr_val as u64) & 0x1_FFFF_FFFF;
                        packet.put_u8((base >> 25) as u8);
                        packet.put_u8((base >> 17) as u8);
                        packet.put_u8((base >> 9) as u8);
                        packet.put_u8((base >> 1) as u8);
                        packet.put_u8((((base & 0x01) as u8) << 7) | 0x7E);
                        packet.put_u8(0x00);
                        stuffing -= 6;
                    }
                    packet.put_bytes(0xFF, stuffing);
                }
            } else {
                packet.put_u8(0x10 | (cc & 0x0F)); // payload only
            }

            packet.put_slice(&remaining[..chunk_len]);
            remaining = &remaining[chunk_len..];
            first = false;

            debug_assert_eq!(packet.len(), define::TS_PACKET_SIZE);
            self.writer.write(&packet)?;
        }
        Ok(())
    }

    fn write_psi(&mut self) -> Result<(), MpegTsError> {
        let pat = Pat {
            transport_stream_id: 1,
            version_number: 0,
            programs: vec![PatEntry {
                program_number: 1,
                pmt_pid: define::PMT_PID,
            }],
        };
        let pat_section = pat.marshal()?;
        let pat_cc = self.pat_continuity;
        self.pat_continuity = (self.pat_continuity + 1) & 0x0F;
        self.write_section(define::PAT_PID, pat_cc, &pat_section)?;

        let pmt = Pmt {
            program_number: 1,
            pcr_pid: self.pcr_pid(),
            version_number: 0,
            streams: self
                .streams
                .iter()
                .map(|s| PmtStream {
                    stream_type: s.stream_type,
                    elementary_pid: s.pid,
                    es_info: s.es_info.clone(),
                })
                .collect(),
        };
        let pmt_section = PmtMuxer::new().write(&pmt)?;
        let pmt_cc = self.pmt_continuity;
        self.pmt_continuity = (self.pmt_continuity + 1) & 0x0F;
        self.write_section(define::PMT_PID, pmt_cc, &pmt_section)?;

        self.packets_since_psi = 0;
        self.psi_written = true;
        Ok(())
    }

    fn write_section(&mut self, pid: u16, cc: u8, section: &[u8]) -> Result<(), MpegTsError> {
        let mut packet = BytesMut::with_capacity(define::TS_PACKET_SIZE);
        packet.put_u8(define::TS_SYNC_BYTE);
        packet.put_u16(0x4000 | (pid & 0x1FFF));
        packet.put_u8(0x10 | (cc & 0x0F));
        packet.put_u8(0x00); // pointer field
        packet.put_slice(section);
        packet.put_bytes(0xFF, define::TS_PACKET_SIZE - packet.len());
        self.writer.write(&packet)?;
        Ok(())
    }

    /// Take everything muxed so far.
    pub fn get_data(&mut self) -> BytesMut {
        self.writer.extract_current_bytes()
    }

    /// Start a new segment: forces PSI before the next packet but keeps
    /// continuity counters, so segment boundaries have no CC gaps.
    pub fn reset(&mut self) {
        self.psi_written = false;
        self.writer.extract_current_bytes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_is_packet_aligned() {
        let mut muxer = TsMuxer::new();
        let v = muxer
            .add_stream(define::PSI_STREAM_H264, BytesMut::new())
            .unwrap();
        muxer
            .write(v, 0, 0, MPEG_FLAG_IDR_FRAME, BytesMut::from(&[0u8; 1000][..]))
            .unwrap();
        let data = muxer.get_data();
        assert_eq!(data.len() % define::TS_PACKET_SIZE, 0);
        assert!(data.iter().step_by(define::TS_PACKET_SIZE).all(|&b| b == 0x47));
    }

    #[test]
    fn test_psi_precedes_media() {
        let mut muxer = TsMuxer::new();
        let v = muxer
            .add_stream(define::PSI_STREAM_H264, BytesMut::new())
            .unwrap();
        muxer
            .write(v, 0, 0, MPEG_FLAG_IDR_FRAME, BytesMut::from(&[0u8; 10][..]))
            .unwrap();
        let data = muxer.get_data();
        let pid0 = u16::from_be_bytes([data[1], data[2]]) & 0x1FFF;
        let pid1 = u16::from_be_bytes([data[189], data[190]]) & 0x1FFF;
        assert_eq!(pid0, define::PAT_PID);
        assert_eq!(pid1, define::PMT_PID);
    }

    #[test]
    fn test_continuity_survives_reset() {
        let mut muxer = TsMuxer::new();
        let v = muxer
            .add_stream(define::PSI_STREAM_H264, BytesMut::new())
            .unwrap();
        muxer
            .write(v, 0, 0, MPEG_FLAG_IDR_FRAME, BytesMut::from(&[0u8; 10][..]))
            .unwrap();
        let seg1 = muxer.get_data();
        muxer.reset();
        muxer
            .write(v, 3_000, 3_000, MPEG_FLAG_IDR_FRAME, BytesMut::from(&[1u8; 10][..]))
            .unwrap();
        let seg2 = muxer.get_data();

        let cc_of = |data: &BytesMut, pid: u16| -> Vec<u8> {
            data.chunks(define::TS_PACKET_SIZE)
                .filter(|p| u16::from_be_bytes([p[1], p[2]]) & 0x1FFF == pid)
                .map(|p| p[3] & 0x0F)
                .collect()
        };
        let mut all = cc_of(&seg1, v);
        all.extend(cc_of(&seg2, v));
        for pair in all.windows(2) {
            assert_eq!((pair[0] + 1) & 0x0F, pair[1], "cc gap in {all:?}");
        }
    }

    #[test]
    fn test_unknown_pid_rejected() {
        let mut muxer = TsMuxer::new();
        assert!(matches!(
            muxer.write(0x777, 0, 0, 0, BytesMut::new()),
            Err(MpegTsError::UnknownPid(0x777))
        ));
    }
}
