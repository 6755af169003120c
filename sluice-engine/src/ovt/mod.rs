pub mod frame;
pub mod pull;
pub mod server;

use tokio_util::codec::LengthDelimitedCodec;

/// Frame size cap on the wire; one frame is one packet plus header.
const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .length_field_type::<u32>()
        .new_codec()
}
