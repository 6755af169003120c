use {
    super::errors::RtmpError,
    bytes::{BufMut, BytesMut},
    hmac::{Hmac, Mac},
    rand::RngCore,
    sha2::Sha256,
};

pub const RTMP_VERSION: u8 = 3;
pub const HANDSHAKE_SIZE: usize = 1_536;
const DIGEST_SIZE: usize = 32;

const GENUINE_FMS_KEY: [u8; 68] = [
    0x47, 0x65, 0x6e, 0x75, 0x69, 0x6e, 0x65, 0x20, 0x41, 0x64, 0x6f, 0x62, 0x65, 0x20, 0x46,
    0x6c, 0x61, 0x73, 0x68, 0x20, 0x4d, 0x65, 0x64, 0x69, 0x61, 0x20, 0x53, 0x65, 0x72, 0x76,
    0x65, 0x72, 0x20, 0x30, 0x30, 0x31, // "Genuine Adobe Flash Media Server 001"
    0xf0, 0xee, 0xc2, 0x4a, 0x80, 0x68, 0xbe, 0xe8, 0x2e, 0x00, 0xd0, 0xd1, 0x02, 0x9e, 0x7e,
    0x57, 0x6e, 0xec, 0x5d, 0x2d, 0x29, 0x80, 0x6f, 0xab, 0x93, 0xb8, 0xe6, 0x36, 0xcf, 0xeb,
    0x31, 0xae,
];

const GENUINE_FP_KEY: [u8; 62] = [
    0x47, 0x65, 0x6e, 0x75, 0x69, 0x6e, 0x65, 0x20, 0x41, 0x64, 0x6f, 0x62, 0x65, 0x20, 0x46,
    0x6c, 0x61, 0x73, 0x68, 0x20, 0x50, 0x6c, 0x61, 0x79, 0x65, 0x72, 0x20, 0x30, 0x30,
    0x31, // "Genuine Adobe Flash Player 001"
    0xF0, 0xEE, 0xC2, 0x4A, 0x80, 0x68, 0xBE, 0xE8, 0x2E, 0x00, 0xD0, 0xD1, 0x02, 0x9E, 0x7E,
    0x57, 0x6E, 0xEC, 0x5D, 0x2D, 0x29, 0x80, 0x6F, 0xAB, 0x93, 0xB8, 0xE6, 0x36, 0xCF, 0xEB,
    0x31, 0xAE,
];

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Digest offset for schema 0 (offset bytes at 8..12) and schema 1
/// (offset bytes at 772..776).
fn digest_offset(c1: &[u8], schema: usize) -> usize {
    let base = if schema == 0 { 8 } else { 772 };
    let sum = c1[base] as usize + c1[base + 1] as usize + c1[base + 2] as usize + c1[base + 3] as usize;
    (sum % 728) + base + 4
}

fn compute_digest(c1: &[u8], key: &[u8], offset: usize) -> [u8; DIGEST_SIZE] {
    let mut joined = Vec::with_capacity(HANDSHAKE_SIZE - DIGEST_SIZE);
    joined.extend_from_slice(&c1[..offset]);
    joined.extend_from_slice(&c1[offset + DIGEST_SIZE..]);
    hmac_sha256(key, &joined)
}

/// Locate and verify the client digest in C1. Returns the digest when C1
/// was produced by the complex (digest) handshake.
fn find_client_digest(c1: &[u8]) -> Option<[u8; DIGEST_SIZE]> {
    for schema in [1usize, 0] {
        let offset = digest_offset(c1, schema);
        if offset + DIGEST_SIZE > c1.len() {
            continue;
        }
        let found = &c1[offset..offset + DIGEST_SIZE];
        let expected = compute_digest(c1, &GENUINE_FP_KEY[..30], offset);
        if found == expected {
            return Some(expected);
        }
    }
    None
}

fn random_block(len: usize) -> BytesMut {
    let mut block = BytesMut::with_capacity(len);
    block.resize(len, 0);
    rand::thread_rng().fill_bytes(&mut block);
    block
}

/// Server half of the RTMP handshake.
///
/// Auto-detects whether the peer used the plain or the digest handshake
/// and answers in kind; encoders in the wild send both.
pub struct HandshakeServer;

impl HandshakeServer {
    /// Consume C0+C1, produce S0+S1+S2.
    pub fn respond(c0: u8, c1: &[u8]) -> Result<BytesMut, RtmpError> {
        if c0 != RTMP_VERSION {
            return Err(RtmpError::HandshakeVersion(c0));
        }
        if c1.len() != HANDSHAKE_SIZE {
            return Err(RtmpError::HandshakeLength(c1.len()));
        }

        let mut out = BytesMut::with_capacity(1 + 2 * HANDSHAKE_SIZE);
        out.put_u8(RTMP_VERSION);

        match find_client_digest(c1) {
            Some(client_digest) => {
                // S1 carries our own digest keyed with the FMS key.
                let mut s1 = random_block(HANDSHAKE_SIZE);
                s1[0..4].copy_from_slice(&[0, 0, 0, 0]);
                s1[4..8].copy_from_slice(&[4, 5, 0, 1]); // server version
                let offset = digest_offset(&s1, 0);
                let digest = compute_digest(&s1, &GENUINE_FMS_KEY[..36], offset);
                s1[offset..offset + DIGEST_SIZE].copy_from_slice(&digest);
                out.put_slice(&s1);

                // S2: random block signed with a key derived from the
                // client digest.
                let key = hmac_sha256(&GENUINE_FMS_KEY, &client_digest);
                let mut s2 = random_block(HANDSHAKE_SIZE);
                let signature_offset = HANDSHAKE_SIZE - DIGEST_SIZE;
                let signature = hmac_sha256(&key, &s2[..signature_offset]);
                s2[signature_offset..].copy_from_slice(&signature);
                out.put_slice(&s2);
            }
            None => {
                // Simple handshake: random S1, echo C1 as S2.
                let mut s1 = random_block(HANDSHAKE_SIZE);
                s1[0..8].copy_from_slice(&[0; 8]);
                out.put_slice(&s1);
                out.put_slice(c1);
            }
        }
        Ok(out)
    }
}

/// Client half (simple handshake), used by the RTMP push publisher.
pub struct HandshakeClient;

impl HandshakeClient {
    /// Produce C0+C1.
    #[must_use]
    pub fn c0c1() -> BytesMut {
        let mut out = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
        out.put_u8(RTMP_VERSION);
        let mut c1 = random_block(HANDSHAKE_SIZE);
        c1[0..8].copy_from_slice(&[0; 8]);
        out.put_slice(&c1);
        out
    }

    /// Produce C2 from S1.
    pub fn c2(s1: &[u8]) -> Result<BytesMut, RtmpError> {
        if s1.len() != HANDSHAKE_SIZE {
            return Err(RtmpError::HandshakeLength(s1.len()));
        }
        Ok(BytesMut::from(s1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_handshake_echoes_c1() {
        let c0c1 = HandshakeClient::c0c1();
        let response = HandshakeServer::respond(c0c1[0], &c0c1[1..]).unwrap();
        assert_eq!(response.len(), 1 + 2 * HANDSHAKE_SIZE);
        assert_eq!(response[0], RTMP_VERSION);
        // S2 echoes C1 in the simple handshake.
        assert_eq!(&response[1 + HANDSHAKE_SIZE..], &c0c1[1..]);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let c1 = [0u8; HANDSHAKE_SIZE];
        assert!(matches!(
            HandshakeServer::respond(6, &c1),
            Err(RtmpError::HandshakeVersion(6))
        ));
    }

    #[test]
    fn test_short_c1_rejected() {
        assert!(HandshakeServer::respond(RTMP_VERSION, &[0u8; 100]).is_err());
    }

    #[test]
    fn test_digest_handshake_detected_and_answered() {
        // Build a C1 the way a digest-capable encoder would (schema 0).
        let mut c1 = random_block(HANDSHAKE_SIZE);
        c1[0..4].copy_from_slice(&[0, 0, 0, 0]);
        c1[4..8].copy_from_slice(&[9, 0, 124, 2]);
        let offset = digest_offset(&c1, 0);
        let digest = compute_digest(&c1, &GENUINE_FP_KEY[..30], offset);
        c1[offset..offset + DIGEST_SIZE].copy_from_slice(&digest);

        let response = HandshakeServer::respond(RTMP_VERSION, &c1).unwrap();
        assert_eq!(response.len(), 1 + 2 * HANDSHAKE_SIZE);
        // Digest path: S1 must itself carry a valid FMS digest.
        let s1 = &response[1..1 + HANDSHAKE_SIZE];
        let s1_offset = digest_offset(s1, 0);
        let expected = compute_digest(s1, &GENUINE_FMS_KEY[..36], s1_offset);
        assert_eq!(&s1[s1_offset..s1_offset + DIGEST_SIZE], expected);
    }
}
