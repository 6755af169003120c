use {
    crate::errors::TranscodeError,
    bytes::Bytes,
    openh264::{
        decoder::Decoder,
        encoder::{BitRate, Encoder, EncoderConfig, FrameRate, RateControlMode},
        formats::{YUVBuffer, YUVSource},
        OpenH264API,
    },
    sluice_engine::media::{VideoFrame},
};

/// H.264 decoder front of a graph: Annex-B access units in, planar YUV
/// frames out.
pub struct VideoDecoder {
    inner: Decoder,
}

impl VideoDecoder {
    pub fn new() -> Result<Self, TranscodeError> {
        Ok(Self {
            inner: Decoder::new().map_err(|e| TranscodeError::Decoder(e.to_string()))?,
        })
    }

    /// Decode one access unit; encoders may buffer, so output is optional.
    pub fn decode(&mut self, annexb: &[u8], pts_us: i64) -> Result<Option<VideoFrame>, TranscodeError> {
        let decoded = self
            .inner
            .decode(annexb)
            .map_err(|e| TranscodeError::Decoder(e.to_string()))?;
        let Some(yuv) = decoded else {
            return Ok(None);
        };
        let (width, height) = yuv.dimensions();
        let (stride_y, stride_u, stride_v) = yuv.strides();

        let (luma, chroma) = VideoFrame::plane_sizes(width as u32, height as u32);
        let mut data = Vec::with_capacity(luma + 2 * chroma);
        copy_plane(yuv.y(), stride_y, width, height, &mut data);
        let chroma_w = width.div_ceil(2);
        let chroma_h = height.div_ceil(2);
        copy_plane(yuv.u(), stride_u, chroma_w, chroma_h, &mut data);
        copy_plane(yuv.v(), stride_v, chroma_w, chroma_h, &mut data);

        Ok(Some(VideoFrame {
            pts_us,
            width: width as u32,
            height: height as u32,
            data,
            keyframe: false,
        }))
    }
}

fn copy_plane(src: &[u8], stride: usize, width: usize, height: usize, out: &mut Vec<u8>) {
    for row in 0..height {
        let start = row * stride;
        out.extend_from_slice(&src[start..start + width]);
    }
}

/// H.264 encoder tail of a graph.
pub struct VideoEncoder {
    inner: Encoder,
    width: u32,
    height: u32,
    /// Keyframe cadence in microseconds of stream time.
    gop_us: i64,
    last_keyframe_us: Option<i64>,
}

impl VideoEncoder {
    pub fn new(
        width: u32,
        height: u32,
        bitrate_kbps: u32,
        fps: f32,
        gop_ms: u32,
    ) -> Result<Self, TranscodeError> {
        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(bitrate_kbps * 1_000))
            .max_frame_rate(FrameRate::from_hz(fps))
            .rate_control_mode(RateControlMode::Bitrate)
            .skip_frames(false);
        let inner = Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| TranscodeError::Encoder(e.to_string()))?;
        Ok(Self {
            inner,
            width,
            height,
            gop_us: i64::from(gop_ms) * 1_000,
            last_keyframe_us: None,
        })
    }

    /// Encode one frame; returns an Annex-B access unit (possibly empty
    /// when the encoder buffers) plus whether it is a keyframe.
    pub fn encode(&mut self, frame: &VideoFrame) -> Result<Option<(Bytes, bool)>, TranscodeError> {
        // Deterministic keyframe cadence aligned to the configured GOP.
        let force_keyframe = match self.last_keyframe_us {
            None => true,
            Some(last) => frame.pts_us - last >= self.gop_us,
        };
        if force_keyframe {
            self.inner.force_intra_frame();
            self.last_keyframe_us = Some(frame.pts_us);
        }

        let scaled = scale_yuv420(frame, self.width, self.height);
        let buffer = YUVBuffer::from_vec(scaled, self.width as usize, self.height as usize);
        let bitstream = self
            .inner
            .encode(&buffer)
            .map_err(|e| TranscodeError::Encoder(e.to_string()))?;
        let data = bitstream.to_vec();
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some((Bytes::from(data), force_keyframe)))
    }
}

/// Nearest-neighbour YUV 4:2:0 rescale. Plain arithmetic on planes keeps
/// the codec pool dependency-free; quality is fine for rendition ladders.
#[must_use]
pub fn scale_yuv420(frame: &VideoFrame, out_w: u32, out_h: u32) -> Vec<u8> {
    if frame.width == out_w && frame.height == out_h {
        return frame.data.clone();
    }
    let (in_w, in_h) = (frame.width as usize, frame.height as usize);
    let (out_w, out_h) = (out_w as usize, out_h as usize);
    let (in_luma, in_chroma) = VideoFrame::plane_sizes(frame.width, frame.height);

    let mut out = Vec::with_capacity(out_w * out_h * 3 / 2);
    scale_plane(&frame.data[..in_luma], in_w, in_h, out_w, out_h, &mut out);
    let in_cw = in_w.div_ceil(2);
    let in_ch = in_h.div_ceil(2);
    let out_cw = out_w.div_ceil(2);
    let out_ch = out_h.div_ceil(2);
    scale_plane(
        &frame.data[in_luma..in_luma + in_chroma],
        in_cw,
        in_ch,
        out_cw,
        out_ch,
        &mut out,
    );
    scale_plane(
        &frame.data[in_luma + in_chroma..],
        in_cw,
        in_ch,
        out_cw,
        out_ch,
        &mut out,
    );
    out
}

fn scale_plane(src: &[u8], in_w: usize, in_h: usize, out_w: usize, out_h: usize, out: &mut Vec<u8>) {
    for y in 0..out_h {
        let src_y = (y * in_h) / out_h;
        for x in 0..out_w {
            let src_x = (x * in_w) / out_w;
            out.push(src[src_y * in_w + src_x]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, value: u8) -> VideoFrame {
        let (luma, chroma) = VideoFrame::plane_sizes(width, height);
        VideoFrame {
            pts_us: 0,
            width,
            height,
            data: vec![value; luma + 2 * chroma],
            keyframe: true,
        }
    }

    #[test]
    fn test_scale_down_dimensions() {
        let frame = solid_frame(1920, 1080, 128);
        let scaled = scale_yuv420(&frame, 1280, 720);
        let (luma, chroma) = VideoFrame::plane_sizes(1280, 720);
        assert_eq!(scaled.len(), luma + 2 * chroma);
        assert!(scaled.iter().all(|&v| v == 128));
    }

    #[test]
    fn test_scale_identity_is_copy() {
        let frame = solid_frame(64, 64, 10);
        let scaled = scale_yuv420(&frame, 64, 64);
        assert_eq!(scaled, frame.data);
    }

    #[test]
    fn test_scale_preserves_gradient_ordering() {
        // A left-dark/right-bright gradient must stay ordered after scaling.
        let (luma, chroma) = VideoFrame::plane_sizes(32, 16);
        let mut data = vec![0u8; luma + 2 * chroma];
        for y in 0..16 {
            for x in 0..32 {
                data[y * 32 + x] = (x * 8) as u8;
            }
        }
        let frame = VideoFrame {
            pts_us: 0,
            width: 32,
            height: 16,
            data,
            keyframe: true,
        };
        let scaled = scale_yuv420(&frame, 16, 8);
        for y in 0..8 {
            for x in 1..16 {
                assert!(scaled[y * 16 + x] >= scaled[y * 16 + x - 1]);
            }
        }
    }
}
