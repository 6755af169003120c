pub mod client;
pub mod depacketize;
pub mod errors;
pub mod jitter;
pub mod rtcp;
pub mod rtp;
pub mod sdp;
