pub mod client_session;
pub mod server_session;

use {
    super::{
        chunk::{
            packetizer::ChunkPacketizer, unpacketizer::ChunkUnpacketizer, ChunkInfo,
            DEFAULT_CHUNK_SIZE,
        },
        errors::RtmpError,
        handshake::{HandshakeClient, HandshakeServer, HANDSHAKE_SIZE},
        messages::{control, msg_type_id},
    },
    bytes::BytesMut,
    std::time::Duration,
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    },
};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(30);

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// One RTMP TCP connection: socket plus chunk (de)framing state.
pub struct Connection {
    stream: TcpStream,
    pub remote_addr: String,
    pub packetizer: ChunkPacketizer,
    pub unpacketizer: ChunkUnpacketizer,
    read_buffer: Vec<u8>,
}

impl Connection {
    #[must_use]
    pub fn new(stream: TcpStream, remote_addr: String) -> Self {
        Self {
            stream,
            remote_addr,
            packetizer: ChunkPacketizer::new(),
            unpacketizer: ChunkUnpacketizer::new(),
            read_buffer: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    /// Server side of the handshake, C0C1 → S0S1S2 → C2.
    pub async fn handshake_as_server(&mut self) -> Result<(), RtmpError> {
        let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let mut c0c1 = [0u8; 1 + HANDSHAKE_SIZE];
            self.stream.read_exact(&mut c0c1).await?;
            let response = HandshakeServer::respond(c0c1[0], &c0c1[1..])?;
            self.stream.write_all(&response).await?;
            let mut c2 = [0u8; HANDSHAKE_SIZE];
            self.stream.read_exact(&mut c2).await?;
            Ok::<(), RtmpError>(())
        })
        .await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(RtmpError::HandshakeTimeout),
        }
    }

    /// Client side (simple handshake), C0C1 → S0S1S2 → C2.
    pub async fn handshake_as_client(&mut self) -> Result<(), RtmpError> {
        let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let c0c1 = HandshakeClient::c0c1();
            self.stream.write_all(&c0c1).await?;
            let mut s0s1s2 = vec![0u8; 1 + 2 * HANDSHAKE_SIZE];
            self.stream.read_exact(&mut s0s1s2).await?;
            let c2 = HandshakeClient::c2(&s0s1s2[1..1 + HANDSHAKE_SIZE])?;
            self.stream.write_all(&c2).await?;
            Ok::<(), RtmpError>(())
        })
        .await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(RtmpError::HandshakeTimeout),
        }
    }

    /// Read until at least one complete message is available.
    pub async fn read_messages(&mut self, idle_timeout: Duration) -> Result<Vec<ChunkInfo>, RtmpError> {
        loop {
            let messages = self.unpacketizer.read_messages()?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            let n = tokio::time::timeout(idle_timeout, self.stream.read(&mut self.read_buffer))
                .await
                .map_err(|_| RtmpError::IdleTimeout)??;
            if n == 0 {
                return Err(RtmpError::PeerClosed);
            }
            self.unpacketizer.extend_data(&self.read_buffer[..n]);
        }
    }

    pub async fn send_message(
        &mut self,
        csid: u32,
        msg_type_id: u8,
        timestamp: u32,
        msg_stream_id: u32,
        payload: BytesMut,
    ) -> Result<(), RtmpError> {
        let info = ChunkInfo::new(csid, msg_type_id, timestamp, msg_stream_id, payload);
        let wire = self.packetizer.packetize(&info)?;
        self.stream.write_all(&wire).await?;
        Ok(())
    }

    /// Announce and apply our outgoing chunk size.
    pub async fn negotiate_chunk_size(&mut self) -> Result<(), RtmpError> {
        self.send_message(
            super::chunk::csid::PROTOCOL_CONTROL,
            msg_type_id::SET_CHUNK_SIZE,
            0,
            0,
            control::set_chunk_size(DEFAULT_CHUNK_SIZE as u32)?,
        )
        .await?;
        self.packetizer.update_max_chunk_size(DEFAULT_CHUNK_SIZE)?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), RtmpError> {
        self.stream.flush().await?;
        Ok(())
    }
}

/// Split `name?query` into its parts.
#[must_use]
pub fn split_query(raw: &str) -> (String, Option<String>) {
    match raw.split_once('?') {
        Some((name, query)) => (name.to_string(), Some(query.to_string())),
        None => (raw.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_query() {
        assert_eq!(split_query("s1"), ("s1".to_string(), None));
        assert_eq!(
            split_query("s1?token=abc"),
            ("s1".to_string(), Some("token=abc".to_string()))
        );
    }
}
