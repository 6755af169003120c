use {
    crate::{
        bytesio::{bytes_writer::BytesWriter, errors::BytesWriteError},
        codec::aac::AudioSpecificConfig,
        media::{CodecId, MediaKind, MediaTrack},
    },
    byteorder::BigEndian,
    bytes::{Bytes, BytesMut},
};

#[derive(Debug, thiserror::Error)]
pub enum CmafError {
    #[error("bytes write error: {0}")]
    BytesWriteError(#[from] BytesWriteError),
    #[error("track {0} missing extradata for init segment")]
    MissingExtradata(u32),
    #[error("unsupported codec for cmaf: {0}")]
    UnsupportedCodec(CodecId),
}

/// One sample inside a CMAF fragment. Video data must be length-prefixed
/// (AVCC), matching the `avcC` configuration in the init segment.
pub struct CmafSample {
    pub dts: i64,
    /// pts - dts in the track timescale.
    pub composition_offset: i32,
    pub duration: u32,
    pub keyframe: bool,
    pub data: Bytes,
}

/// Track layout the muxer was initialised with.
struct CmafTrack {
    track_id: u32,
    /// 1-based MP4 track id.
    mp4_id: u32,
    timescale: u32,
    kind: MediaKind,
}

/// CMAF (fragmented MP4) muxer for LL-HLS: one init segment up front,
/// then an independent `moof`+`mdat` pair per part.
pub struct CmafMuxer {
    tracks: Vec<CmafTrack>,
    sequence_number: u32,
}

impl CmafMuxer {
    pub fn new(tracks: &[MediaTrack]) -> Result<Self, CmafError> {
        let mut layout = Vec::new();
        for (index, track) in tracks.iter().enumerate() {
            let timescale = match track.kind {
                MediaKind::Video | MediaKind::Data => 90_000,
                MediaKind::Audio => track.audio.map_or(48_000, |a| a.sample_rate),
            };
            layout.push(CmafTrack {
                track_id: track.id,
                mp4_id: index as u32 + 1,
                timescale,
                kind: track.kind,
            });
        }
        Ok(Self {
            tracks: layout,
            sequence_number: 0,
        })
    }

    #[must_use]
    pub fn timescale_for(&self, track_id: u32) -> Option<u32> {
        self.tracks
            .iter()
            .find(|t| t.track_id == track_id)
            .map(|t| t.timescale)
    }

    /// Build `ftyp` + `moov` from the track extradata.
    pub fn init_segment(&self, tracks: &[MediaTrack]) -> Result<Bytes, CmafError> {
        let mut writer = BytesWriter::new();

        write_box(&mut writer, b"ftyp", |w| {
            w.write(b"cmfc")?; // major brand
            w.write_u32::<BigEndian>(0)?;
            w.write(b"cmfciso6mp41")?; // compatible brands
            Ok(())
        })?;

        write_box(&mut writer, b"moov", |w| {
            write_box(w, b"mvhd", |w| {
                w.write_u32::<BigEndian>(0)?; // version+flags
                w.write_u32::<BigEndian>(0)?; // creation
                w.write_u32::<BigEndian>(0)?; // modification
                w.write_u32::<BigEndian>(1_000)?; // timescale
                w.write_u32::<BigEndian>(0)?; // duration (live)
                w.write_u32::<BigEndian>(0x0001_0000)?; // rate 1.0
                w.write_u16::<BigEndian>(0x0100)?; // volume
                w.write_u16::<BigEndian>(0)?;
                w.write_u64::<BigEndian>(0)?;
                for value in IDENTITY_MATRIX {
                    w.write_u32::<BigEndian>(value)?;
                }
                for _ in 0..6 {
                    w.write_u32::<BigEndian>(0)?; // predefined
                }
                w.write_u32::<BigEndian>(self.tracks.len() as u32 + 1)?; // next track
                Ok(())
            })?;

            for (layout, track) in self.tracks.iter().zip(tracks.iter()) {
                write_trak(w, layout, track)?;
            }

            write_box(w, b"mvex", |w| {
                for layout in &self.tracks {
                    write_box(w, b"trex", |w| {
                        w.write_u32::<BigEndian>(0)?;
                        w.write_u32::<BigEndian>(layout.mp4_id)?;
                        w.write_u32::<BigEndian>(1)?; // default sample description
                        w.write_u32::<BigEndian>(0)?;
                        w.write_u32::<BigEndian>(0)?;
                        w.write_u32::<BigEndian>(0)?;
                        Ok(())
                    })?;
                }
                Ok(())
            })?;
            Ok(())
        })?;

        Ok(writer.extract_current_bytes().freeze())
    }

    /// Build one fragment (`moof` + `mdat`) from per-track sample runs.
    /// Tracks with no samples in this part are omitted.
    pub fn fragment(&mut self, runs: &[(u32, Vec<CmafSample>)]) -> Result<Bytes, CmafError> {
        self.sequence_number += 1;
        let sequence_number = self.sequence_number;
        let mut writer = BytesWriter::new();

        // Data offsets inside mdat are patched after moof is sized.
        let mut trun_offset_positions = Vec::new();
        let moof_start = writer.len();

        write_box(&mut writer, b"moof", |w| {
            write_box(w, b"mfhd", |w| {
                w.write_u32::<BigEndian>(0)?;
                w.write_u32::<BigEndian>(sequence_number)?;
                Ok(())
            })?;

            for (track_id, samples) in runs {
                if samples.is_empty() {
                    continue;
                }
                let Some(layout) = self.tracks.iter().find(|t| t.track_id == *track_id) else {
                    continue;
                };
                write_box(w, b"traf", |w| {
                    write_box(w, b"tfhd", |w| {
                        // default-base-is-moof
                        w.write_u32::<BigEndian>(0x0002_0000)?;
                        w.write_u32::<BigEndian>(layout.mp4_id)?;
                        Ok(())
                    })?;
                    write_box(w, b"tfdt", |w| {
                        w.write_u8(1)?; // version 1: 64-bit time
                        w.write_u24::<BigEndian>(0)?;
                        w.write_u64::<BigEndian>(samples[0].dts.max(0) as u64)?;
                        Ok(())
                    })?;
                    write_box(w, b"trun", |w| {
                        // version 1 (signed cts), flags: data-offset |
                        // duration | size | flags | cts
                        w.write_u8(1)?;
                        w.write_u24::<BigEndian>(0x000F01)?;
                        w.write_u32::<BigEndian>(samples.len() as u32)?;
                        trun_offset_positions.push(w.len());
                        w.write_u32::<BigEndian>(0)?; // patched below
                        for sample in samples {
                            w.write_u32::<BigEndian>(sample.duration)?;
                            w.write_u32::<BigEndian>(sample.data.len() as u32)?;
                            let flags: u32 = if sample.keyframe {
                                0x0200_0000 // depends on nothing
                            } else {
                                0x0101_0000 // depends, non-sync
                            };
                            w.write_u32::<BigEndian>(flags)?;
                            w.write_u32::<BigEndian>(sample.composition_offset as u32)?;
                        }
                        Ok(())
                    })?;
                    Ok(())
                })?;
            }
            Ok(())
        })?;

        let moof_len = writer.len() - moof_start;

        // mdat: sample data in run order; patch each traf's data offset.
        let mut data_offset = moof_len + 8;
        let mut patch_index = 0usize;
        for (_, samples) in runs {
            if samples.is_empty() {
                continue;
            }
            if let Some(&position) = trun_offset_positions.get(patch_index) {
                writer.write_u32_at::<BigEndian>(position, data_offset as u32)?;
            }
            patch_index += 1;
            data_offset += samples.iter().map(|s| s.data.len()).sum::<usize>();
        }

        let mdat_len: usize = 8 + runs
            .iter()
            .flat_map(|(_, samples)| samples.iter())
            .map(|s| s.data.len())
            .sum::<usize>();
        writer.write_u32::<BigEndian>(mdat_len as u32)?;
        writer.write(b"mdat")?;
        for (_, samples) in runs {
            for sample in samples {
                writer.write(&sample.data)?;
            }
        }

        Ok(writer.extract_current_bytes().freeze())
    }
}

const IDENTITY_MATRIX: [u32; 9] = [
    0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000,
];

fn write_box<F>(writer: &mut BytesWriter, name: &[u8; 4], body: F) -> Result<(), CmafError>
where
    F: FnOnce(&mut BytesWriter) -> Result<(), CmafError>,
{
    let start = writer.len();
    writer.write_u32::<BigEndian>(0)?;
    writer.write(name)?;
    body(writer)?;
    let size = (writer.len() - start) as u32;
    writer.write_u32_at::<BigEndian>(start, size)?;
    Ok(())
}

fn write_trak(
    writer: &mut BytesWriter,
    layout: &CmafTrack,
    track: &MediaTrack,
) -> Result<(), CmafError> {
    write_box(writer, b"trak", |w| {
        write_box(w, b"tkhd", |w| {
            w.write_u8(0)?;
            w.write_u24::<BigEndian>(0x07)?; // enabled, in movie+preview
            w.write_u32::<BigEndian>(0)?;
            w.write_u32::<BigEndian>(0)?;
            w.write_u32::<BigEndian>(layout.mp4_id)?;
            w.write_u32::<BigEndian>(0)?;
            w.write_u32::<BigEndian>(0)?; // duration
            w.write_u64::<BigEndian>(0)?;
            w.write_u16::<BigEndian>(0)?; // layer
            w.write_u16::<BigEndian>(0)?; // alternate group
            w.write_u16::<BigEndian>(if layout.kind == MediaKind::Audio {
                0x0100
            } else {
                0
            })?;
            w.write_u16::<BigEndian>(0)?;
            for value in IDENTITY_MATRIX {
                w.write_u32::<BigEndian>(value)?;
            }
            let (width, height) = track.video.map_or((0, 0), |v| (v.width, v.height));
            w.write_u32::<BigEndian>(width << 16)?;
            w.write_u32::<BigEndian>(height << 16)?;
            Ok(())
        })?;
        write_box(w, b"mdia", |w| {
            write_box(w, b"mdhd", |w| {
                w.write_u32::<BigEndian>(0)?;
                w.write_u32::<BigEndian>(0)?;
                w.write_u32::<BigEndian>(0)?;
                w.write_u32::<BigEndian>(layout.timescale)?;
                w.write_u32::<BigEndian>(0)?;
                w.write_u16::<BigEndian>(0x55C4)?; // "und"
                w.write_u16::<BigEndian>(0)?;
                Ok(())
            })?;
            write_box(w, b"hdlr", |w| {
                w.write_u32::<BigEndian>(0)?;
                w.write_u32::<BigEndian>(0)?;
                w.write(if layout.kind == MediaKind::Audio {
                    b"soun"
                } else {
                    b"vide"
                })?;
                w.write_u32::<BigEndian>(0)?;
                w.write_u32::<BigEndian>(0)?;
                w.write_u32::<BigEndian>(0)?;
                w.write(b"SluiceHandler\0")?;
                Ok(())
            })?;
            write_box(w, b"minf", |w| {
                if layout.kind == MediaKind::Audio {
                    write_box(w, b"smhd", |w| {
                        w.write_u32::<BigEndian>(0)?;
                        w.write_u32::<BigEndian>(0)?;
                        Ok(())
                    })?;
                } else {
                    write_box(w, b"vmhd", |w| {
                        w.write_u32::<BigEndian>(1)?;
                        w.write_u64::<BigEndian>(0)?;
                        Ok(())
                    })?;
                }
                write_box(w, b"dinf", |w| {
                    write_box(w, b"dref", |w| {
                        w.write_u32::<BigEndian>(0)?;
                        w.write_u32::<BigEndian>(1)?;
                        write_box(w, b"url ", |w| {
                            w.write_u32::<BigEndian>(1)?; // self-contained
                            Ok(())
                        })
                    })
                })?;
                write_box(w, b"stbl", |w| {
                    write_box(w, b"stsd", |w| {
                        w.write_u32::<BigEndian>(0)?;
                        w.write_u32::<BigEndian>(1)?;
                        write_sample_entry(w, layout, track)
                    })?;
                    for name in [b"stts", b"stsc", b"stco"] {
                        write_box(w, name, |w| {
                            w.write_u32::<BigEndian>(0)?;
                            w.write_u32::<BigEndian>(0)?;
                            Ok(())
                        })?;
                    }
                    write_box(w, b"stsz", |w| {
                        w.write_u32::<BigEndian>(0)?;
                        w.write_u32::<BigEndian>(0)?;
                        w.write_u32::<BigEndian>(0)?;
                        Ok(())
                    })?;
                    Ok(())
                })?;
                Ok(())
            })?;
            Ok(())
        })?;
        Ok(())
    })
}

fn write_sample_entry(
    writer: &mut BytesWriter,
    layout: &CmafTrack,
    track: &MediaTrack,
) -> Result<(), CmafError> {
    let extradata = track
        .extradata
        .clone()
        .ok_or(CmafError::MissingExtradata(track.id))?;
    match track.codec {
        CodecId::H264 | CodecId::H265 => {
            let name: &[u8; 4] = if track.codec == CodecId::H264 {
                b"avc1"
            } else {
                b"hvc1"
            };
            let config_name: &[u8; 4] = if track.codec == CodecId::H264 {
                b"avcC"
            } else {
                b"hvcC"
            };
            write_box(writer, name, |w| {
                w.write(&[0u8; 6])?; // reserved
                w.write_u16::<BigEndian>(1)?; // data reference index
                w.write(&[0u8; 16])?; // predefined/reserved
                let (width, height) = track.video.map_or((0, 0), |v| (v.width, v.height));
                w.write_u16::<BigEndian>(width as u16)?;
                w.write_u16::<BigEndian>(height as u16)?;
                w.write_u32::<BigEndian>(0x0048_0000)?; // 72 dpi
                w.write_u32::<BigEndian>(0x0048_0000)?;
                w.write_u32::<BigEndian>(0)?;
                w.write_u16::<BigEndian>(1)?; // frame count
                w.write(&[0u8; 32])?; // compressor name
                w.write_u16::<BigEndian>(0x0018)?; // depth
                w.write_u16::<BigEndian>(0xFFFF)?; // predefined
                write_box(w, config_name, |w| {
                    w.write(&extradata)?;
                    Ok(())
                })
            })
        }
        CodecId::Aac => {
            let asc = AudioSpecificConfig::parse(&extradata)
                .map_err(|_| CmafError::MissingExtradata(track.id))?;
            write_box(writer, b"mp4a", |w| {
                w.write(&[0u8; 6])?;
                w.write_u16::<BigEndian>(1)?;
                w.write_u64::<BigEndian>(0)?; // reserved
                w.write_u16::<BigEndian>(u16::from(asc.channel_configuration))?;
                w.write_u16::<BigEndian>(16)?; // sample size
                w.write_u32::<BigEndian>(0)?;
                w.write_u32::<BigEndian>(layout.timescale << 16)?;
                write_esds(w, &extradata)
            })
        }
        CodecId::Opus => write_box(writer, b"Opus", |w| {
            w.write(&[0u8; 6])?;
            w.write_u16::<BigEndian>(1)?;
            w.write_u64::<BigEndian>(0)?;
            w.write_u16::<BigEndian>(2)?;
            w.write_u16::<BigEndian>(16)?;
            w.write_u32::<BigEndian>(0)?;
            w.write_u32::<BigEndian>(48_000 << 16)?;
            write_box(w, b"dOps", |w| {
                // Identification header minus the magic, per ISO/Opus.
                w.write_u8(0)?; // version
                w.write(&extradata[9..].to_vec())?;
                Ok(())
            })
        }),
        CodecId::Vp8 => Err(CmafError::UnsupportedCodec(CodecId::Vp8)),
    }
}

fn write_esds(writer: &mut BytesWriter, asc: &[u8]) -> Result<(), CmafError> {
    write_box(writer, b"esds", |w| {
        w.write_u32::<BigEndian>(0)?; // version+flags
        // ES descriptor
        w.write_u8(0x03)?;
        w.write_u8(23 + asc.len() as u8)?;
        w.write_u16::<BigEndian>(1)?; // ES id
        w.write_u8(0)?;
        // DecoderConfig descriptor
        w.write_u8(0x04)?;
        w.write_u8(15 + asc.len() as u8)?;
        w.write_u8(0x40)?; // AAC
        w.write_u8(0x15)?; // audio stream
        w.write_u24::<BigEndian>(0)?; // buffer size
        w.write_u32::<BigEndian>(0)?; // max bitrate
        w.write_u32::<BigEndian>(0)?; // avg bitrate
        // DecoderSpecificInfo
        w.write_u8(0x05)?;
        w.write_u8(asc.len() as u8)?;
        w.write(asc)?;
        // SLConfig
        w.write_u8(0x06)?;
        w.write_u8(0x01)?;
        w.write_u8(0x02)?;
        Ok(())
    })
}

/// Walk top-level boxes of a buffer; used by tests and the recording
/// sink's truncation recovery.
#[must_use]
pub fn box_names(data: &[u8]) -> Vec<[u8; 4]> {
    let mut names = Vec::new();
    let mut offset = 0usize;
    while offset + 8 <= data.len() {
        let size = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let mut name = [0u8; 4];
        name.copy_from_slice(&data[offset + 4..offset + 8]);
        names.push(name);
        if size < 8 || offset + size > data.len() {
            break;
        }
        offset += size;
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioParams, Timebase, VideoParams};

    fn tracks() -> Vec<MediaTrack> {
        let record = crate::codec::h264::AvcDecoderConfigurationRecord {
            profile_indication: 0x42,
            profile_compatibility: 0,
            level_indication: 0x1E,
            nalu_length_size: 4,
            sps: vec![Bytes::from_static(&[0x67, 0x42, 0x00, 0x1E, 0xF4, 0x21, 0x32])],
            pps: vec![Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80])],
        };
        let asc = AudioSpecificConfig::from_params(2, 48_000, 2).unwrap();
        vec![
            MediaTrack::video(
                0,
                CodecId::H264,
                Timebase::MPEG,
                VideoParams {
                    width: 1280,
                    height: 720,
                    fps_milli: 30_000,
                },
            )
            .with_extradata(record.marshal().unwrap()),
            MediaTrack::audio(
                1,
                CodecId::Aac,
                Timebase::rtp(48_000),
                AudioParams {
                    sample_rate: 48_000,
                    channels: 2,
                },
            )
            .with_extradata(asc.marshal()),
        ]
    }

    #[test]
    fn test_init_segment_structure() {
        let tracks = tracks();
        let muxer = CmafMuxer::new(&tracks).unwrap();
        let init = muxer.init_segment(&tracks).unwrap();
        let names = box_names(&init);
        assert_eq!(&names[0], b"ftyp");
        assert_eq!(&names[1], b"moov");
        // moov must contain both traks: search raw bytes for the sample
        // entry fourccs.
        let raw = init.as_ref();
        assert!(raw.windows(4).any(|w| w == b"avc1"));
        assert!(raw.windows(4).any(|w| w == b"mp4a"));
        assert!(raw.windows(4).any(|w| w == b"avcC"));
        assert!(raw.windows(4).any(|w| w == b"esds"));
    }

    #[test]
    fn test_init_requires_extradata() {
        let mut bare = tracks();
        bare[0].extradata = None;
        let muxer = CmafMuxer::new(&bare).unwrap();
        assert!(matches!(
            muxer.init_segment(&bare),
            Err(CmafError::MissingExtradata(0))
        ));
    }

    #[test]
    fn test_fragment_structure_and_offsets() {
        let tracks = tracks();
        let mut muxer = CmafMuxer::new(&tracks).unwrap();
        let video_samples = vec![CmafSample {
            dts: 0,
            composition_offset: 3_000,
            duration: 3_000,
            keyframe: true,
            data: Bytes::from_static(&[0, 0, 0, 2, 0x65, 0x88]),
        }];
        let audio_samples = vec![
            CmafSample {
                dts: 0,
                composition_offset: 0,
                duration: 1_024,
                keyframe: false,
                data: Bytes::from_static(&[0x11; 32]),
            },
            CmafSample {
                dts: 1_024,
                composition_offset: 0,
                duration: 1_024,
                keyframe: false,
                data: Bytes::from_static(&[0x22; 32]),
            },
        ];
        let fragment = muxer
            .fragment(&[(0, video_samples), (1, audio_samples)])
            .unwrap();
        let names = box_names(&fragment);
        assert_eq!(&names[0], b"moof");
        assert_eq!(&names[1], b"mdat");

        // mdat holds exactly the sample bytes.
        let moof_size = u32::from_be_bytes([fragment[0], fragment[1], fragment[2], fragment[3]]) as usize;
        let mdat_size =
            u32::from_be_bytes(fragment[moof_size..moof_size + 4].try_into().unwrap()) as usize;
        assert_eq!(mdat_size, 8 + 6 + 32 + 32);

        // The first traf's data offset points at the first video byte.
        let first_video = moof_size + 8;
        assert_eq!(&fragment[first_video..first_video + 6], &[0, 0, 0, 2, 0x65, 0x88]);
    }

    #[test]
    fn test_fragment_sequence_increments() {
        let tracks = tracks();
        let mut muxer = CmafMuxer::new(&tracks).unwrap();
        let f1 = muxer.fragment(&[(0, vec![])]).unwrap();
        let f2 = muxer.fragment(&[(0, vec![])]).unwrap();
        // mfhd sequence number lives at a fixed offset: moof(8) mfhd(8) + 4.
        let seq = |f: &Bytes| u32::from_be_bytes(f[20..24].try_into().unwrap());
        assert_eq!(seq(&f2), seq(&f1) + 1);
    }
}
