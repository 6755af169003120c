use {
    super::{define, errors::MpegTsError, pat, pes, pmt},
    crate::media::TimestampExtender,
    bytes::{BufMut, BytesMut},
    std::collections::HashMap,
};

/// One elementary stream announced by the PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementaryStream {
    pub pid: u16,
    pub stream_type: u8,
    pub es_info: bytes::Bytes,
}

/// A fully assembled PES unit with extended (64-bit) timestamps in the
/// 90 kHz clock.
#[derive(Debug)]
pub struct PesUnit {
    pub pid: u16,
    pub stream_type: u8,
    pub pts: i64,
    pub dts: i64,
    pub payload: BytesMut,
}

#[derive(Debug)]
pub enum TsDemuxEvent {
    /// PAT+PMT resolved; emitted once and again on PMT version change.
    Program(Vec<ElementaryStream>),
    Pes(PesUnit),
}

struct PesAssembler {
    stream_type: u8,
    buffer: BytesMut,
    started: bool,
}

/// Incremental 188-byte transport stream demuxer.
///
/// Feed arbitrary byte chunks; events come out as PAT/PMT resolve and PES
/// units complete. Resyncs on lost sync bytes and counts continuity gaps
/// instead of failing, since UDP ingest loses packets routinely.
pub struct TsDemuxer {
    buffer: BytesMut,
    pmt_pids: Vec<u16>,
    pmt_version: Option<u8>,
    assemblers: HashMap<u16, PesAssembler>,
    extenders: HashMap<u16, (TimestampExtender, TimestampExtender)>,
    last_continuity: HashMap<u16, u8>,
    pub continuity_gaps: u64,
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsDemuxer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            pmt_pids: Vec::new(),
            pmt_version: None,
            assemblers: HashMap::new(),
            extenders: HashMap::new(),
            last_continuity: HashMap::new(),
            continuity_gaps: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Result<Vec<TsDemuxEvent>, MpegTsError> {
        self.buffer.put_slice(data);
        let mut events = Vec::new();

        loop {
            // Resync: drop bytes until a sync byte leads the buffer.
            while !self.buffer.is_empty() && self.buffer[0] != define::TS_SYNC_BYTE {
                let skip = self
                    .buffer
                    .iter()
                    .position(|&b| b == define::TS_SYNC_BYTE)
                    .unwrap_or(self.buffer.len());
                tracing::debug!(skipped = skip, "ts resync");
                let _ = self.buffer.split_to(skip);
            }
            if self.buffer.len() < define::TS_PACKET_SIZE {
                break;
            }
            let packet = self.buffer.split_to(define::TS_PACKET_SIZE);
            self.parse_packet(&packet, &mut events)?;
        }

        Ok(events)
    }

    /// Flush any PES data still being assembled (end of stream).
    pub fn flush(&mut self) -> Result<Vec<TsDemuxEvent>, MpegTsError> {
        let mut events = Vec::new();
        let pids: Vec<u16> = self.assemblers.keys().copied().collect();
        for pid in pids {
            self.finish_pes(pid, &mut events)?;
        }
        Ok(events)
    }

    fn parse_packet(
        &mut self,
        packet: &[u8],
        events: &mut Vec<TsDemuxEvent>,
    ) -> Result<(), MpegTsError> {
        let pusi = packet[1] & 0x40 != 0;
        let pid = u16::from_be_bytes([packet[1], packet[2]]) & 0x1FFF;
        let afc = (packet[3] >> 4) & 0x03;
        let cc = packet[3] & 0x0F;

        if pid == define::PID_NULL {
            return Ok(());
        }

        // Continuity accounting on payload-bearing packets.
        if afc & 0x01 != 0 {
            if let Some(&last) = self.last_continuity.get(&pid) {
                if (last + 1) & 0x0F != cc {
                    self.continuity_gaps += 1;
                }
            }
            self.last_continuity.insert(pid, cc);
        }

        let mut offset = 4usize;
        if afc & 0x02 != 0 {
            let af_len = packet[offset] as usize;
            offset += 1 + af_len;
            if offset > define::TS_PACKET_SIZE {
                return Err(MpegTsError::LostSync);
            }
        }
        if afc & 0x01 == 0 || offset >= define::TS_PACKET_SIZE {
            return Ok(());
        }
        let payload = &packet[offset..];

        if pid == define::PAT_PID {
            return self.parse_pat(payload);
        }
        if self.pmt_pids.contains(&pid) {
            return self.parse_pmt(payload, events);
        }

        if let Some(assembler) = self.assemblers.get_mut(&pid) {
            if pusi {
                self.finish_pes(pid, events)?;
                let assembler = self
                    .assemblers
                    .get_mut(&pid)
                    .ok_or(MpegTsError::UnknownPid(pid))?;
                assembler.started = true;
                assembler.buffer.put_slice(payload);
            } else if assembler.started {
                assembler.buffer.put_slice(payload);
            }
        }
        Ok(())
    }

    fn parse_pat(&mut self, payload: &[u8]) -> Result<(), MpegTsError> {
        let pointer = payload[0] as usize;
        if 1 + pointer >= payload.len() {
            return Err(MpegTsError::LostSync);
        }
        let pat = pat::Pat::parse(&payload[1 + pointer..])?;
        self.pmt_pids = pat.programs.iter().map(|p| p.pmt_pid).collect();
        Ok(())
    }

    fn parse_pmt(
        &mut self,
        payload: &[u8],
        events: &mut Vec<TsDemuxEvent>,
    ) -> Result<(), MpegTsError> {
        let pointer = payload[0] as usize;
        if 1 + pointer >= payload.len() {
            return Err(MpegTsError::LostSync);
        }
        let pmt = pmt::parse(&payload[1 + pointer..])?;

        if self.pmt_version == Some(pmt.version_number) && !self.assemblers.is_empty() {
            return Ok(());
        }
        self.pmt_version = Some(pmt.version_number);

        let mut streams = Vec::new();
        for stream in &pmt.streams {
            self.assemblers
                .entry(stream.elementary_pid)
                .or_insert_with(|| PesAssembler {
                    stream_type: stream.stream_type,
                    buffer: BytesMut::new(),
                    started: false,
                });
            self.extenders
                .entry(stream.elementary_pid)
                .or_insert_with(|| (TimestampExtender::mpeg(), TimestampExtender::mpeg()));
            streams.push(ElementaryStream {
                pid: stream.elementary_pid,
                stream_type: stream.stream_type,
                es_info: stream.es_info.clone(),
            });
        }
        events.push(TsDemuxEvent::Program(streams));
        Ok(())
    }

    fn finish_pes(&mut self, pid: u16, events: &mut Vec<TsDemuxEvent>) -> Result<(), MpegTsError> {
        let assembler = self
            .assemblers
            .get_mut(&pid)
            .ok_or(MpegTsError::UnknownPid(pid))?;
        if !assembler.started || assembler.buffer.is_empty() {
            assembler.buffer.clear();
            return Ok(());
        }
        let data = assembler.buffer.split();
        let stream_type = assembler.stream_type;
        assembler.started = false;

        let header = pes::parse_pes_header(&data)?;
        let raw_pts = header.pts.unwrap_or(0);
        let raw_dts = header.dts.unwrap_or(raw_pts);
        let (pts_ext, dts_ext) = self
            .extenders
            .get_mut(&pid)
            .ok_or(MpegTsError::UnknownPid(pid))?;
        let pts = pts_ext.extend(raw_pts as u64);
        let dts = dts_ext.extend(raw_dts as u64);

        let mut payload = BytesMut::new();
        payload.put_slice(&data[header.payload_offset..]);
        events.push(TsDemuxEvent::Pes(PesUnit {
            pid,
            stream_type,
            pts,
            dts,
            payload,
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpegts::muxer::{TsMuxer, MPEG_FLAG_IDR_FRAME};

    #[test]
    fn test_mux_demux_round_trip() {
        let mut muxer = TsMuxer::new();
        let v = muxer
            .add_stream(define::PSI_STREAM_H264, BytesMut::new())
            .unwrap();
        let a = muxer
            .add_stream(define::PSI_STREAM_AAC, BytesMut::new())
            .unwrap();

        let video_payload = vec![0x42u8; 700];
        let audio_payload = vec![0x11u8; 120];
        muxer
            .write(
                v,
                93_000,
                90_000,
                MPEG_FLAG_IDR_FRAME,
                BytesMut::from(&video_payload[..]),
            )
            .unwrap();
        muxer
            .write(a, 91_000, 91_000, 0, BytesMut::from(&audio_payload[..]))
            .unwrap();
        let data = muxer.get_data();

        let mut demuxer = TsDemuxer::new();
        let mut events = demuxer.push(&data).unwrap();
        events.extend(demuxer.flush().unwrap());

        let mut saw_program = false;
        let mut pes_units = Vec::new();
        for event in events {
            match event {
                TsDemuxEvent::Program(streams) => {
                    saw_program = true;
                    assert_eq!(streams.len(), 2);
                    assert_eq!(streams[0].stream_type, define::PSI_STREAM_H264);
                }
                TsDemuxEvent::Pes(unit) => pes_units.push(unit),
            }
        }
        assert!(saw_program);
        assert_eq!(pes_units.len(), 2);
        assert_eq!(pes_units[0].pid, v);
        assert_eq!(pes_units[0].dts, 90_000);
        assert_eq!(pes_units[0].pts, 93_000);
        assert_eq!(pes_units[0].payload.as_ref(), &video_payload[..]);
        assert_eq!(pes_units[1].payload.as_ref(), &audio_payload[..]);
        assert_eq!(demuxer.continuity_gaps, 0);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut muxer = TsMuxer::new();
        let v = muxer
            .add_stream(define::PSI_STREAM_H264, BytesMut::new())
            .unwrap();
        muxer
            .write(v, 0, 0, MPEG_FLAG_IDR_FRAME, BytesMut::from(&[0xAAu8; 64][..]))
            .unwrap();
        let clean = muxer.get_data();

        let mut dirty = BytesMut::new();
        dirty.put_slice(&[0x00, 0x13, 0x37]);
        dirty.put_slice(&clean);

        let mut demuxer = TsDemuxer::new();
        let mut events = demuxer.push(&dirty).unwrap();
        events.extend(demuxer.flush().unwrap());
        assert!(events
            .iter()
            .any(|e| matches!(e, TsDemuxEvent::Pes(u) if u.payload.as_ref() == [0xAAu8; 64])));
    }

    #[test]
    fn test_split_feed() {
        let mut muxer = TsMuxer::new();
        let v = muxer
            .add_stream(define::PSI_STREAM_H264, BytesMut::new())
            .unwrap();
        muxer
            .write(v, 0, 0, MPEG_FLAG_IDR_FRAME, BytesMut::from(&[0x55u8; 300][..]))
            .unwrap();
        let data = muxer.get_data();

        let mut demuxer = TsDemuxer::new();
        let mut events = Vec::new();
        for chunk in data.chunks(61) {
            events.extend(demuxer.push(chunk).unwrap());
        }
        events.extend(demuxer.flush().unwrap());
        assert!(events
            .iter()
            .any(|e| matches!(e, TsDemuxEvent::Pes(u) if u.payload.len() == 300)));
    }
}
