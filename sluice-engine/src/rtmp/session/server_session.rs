use {
    super::{split_query, Connection, IDLE_READ_TIMEOUT},
    crate::{
        access::{AccessDirection, AccessRequest, AdmissionPolicy},
        amf0::Amf0Value,
        codec::h264,
        flv::{
            demuxer::{FlvAudioDemuxer, FlvDemuxEvent, FlvVideoDemuxer},
            muxer::tag_body,
        },
        hub::{
            self,
            define::{
                HubEventSender, ProviderInfo, ProviderKind, PublishAck, SubscribeAck,
                SubscriberInfo, SubscriberKind,
            },
            stream::StreamKey,
        },
        media::{BitstreamFormat, MediaKind, MediaPacket, MediaTrack, Timebase},
        rtmp::{
            chunk::csid,
            errors::RtmpError,
            messages::{self, control, msg_type_id, RtmpMessage},
            netconnection::NetConnection,
            netstream::{status, NetStream},
        },
    },
    bytes::BytesMut,
    std::sync::Arc,
    tokio::net::TcpStream,
    uuid::Uuid,
};

const WINDOW_ACK_SIZE: u32 = 2_500_000;
/// How many A/V messages we will examine before publishing with whatever
/// tracks have been seen; most encoders send both sequence headers first.
const MAX_MESSAGES_BEFORE_PUBLISH: usize = 16;
/// Pre-publish packet buffer cap.
const PENDING_PACKET_CAP: usize = 256;

/// Conventional RTMP track ids: one video and one audio elementary stream.
pub const VIDEO_TRACK: u32 = 0;
pub const AUDIO_TRACK: u32 = 1;

enum SessionState {
    AwaitConnect,
    AwaitCommand,
    Publishing,
}

/// State for an ingest (publish) session before and after registry
/// admission.
struct IngestState {
    video_demuxer: FlvVideoDemuxer,
    audio_demuxer: FlvAudioDemuxer,
    tracks: Vec<MediaTrack>,
    pending: Vec<MediaPacket>,
    av_messages_seen: usize,
    ack: Option<PublishAck>,
}

impl IngestState {
    fn new() -> Self {
        Self {
            video_demuxer: FlvVideoDemuxer::new(VIDEO_TRACK),
            audio_demuxer: FlvAudioDemuxer::new(AUDIO_TRACK),
            tracks: Vec::new(),
            pending: Vec::new(),
            av_messages_seen: 0,
            ack: None,
        }
    }

    fn has_video_config(&self) -> bool {
        self.video_demuxer.config().is_some()
    }

    fn has_audio_config(&self) -> bool {
        self.audio_demuxer.config().is_some()
    }
}

/// One accepted RTMP connection: either an encoder pushing a stream or a
/// player pulling one.
pub struct RtmpServerSession {
    connection: Connection,
    hub: HubEventSender,
    access: Arc<dyn AdmissionPolicy>,
    vhost: String,
    pub app_name: String,
    pub stream_name: String,
    query: Option<String>,
    tc_url: String,
    state: SessionState,
    ingest: Option<IngestState>,
}

impl RtmpServerSession {
    #[must_use]
    pub fn new(
        stream: TcpStream,
        remote_addr: String,
        hub: HubEventSender,
        access: Arc<dyn AdmissionPolicy>,
        vhost: String,
    ) -> Self {
        Self {
            connection: Connection::new(stream, remote_addr),
            hub,
            access,
            vhost,
            app_name: String::new(),
            stream_name: String::new(),
            query: None,
            tc_url: String::new(),
            state: SessionState::AwaitConnect,
            ingest: None,
        }
    }

    pub async fn run(&mut self) -> Result<(), RtmpError> {
        self.connection.handshake_as_server().await?;
        tracing::debug!(remote = %self.connection.remote_addr, "rtmp handshake complete");

        let result = self.message_loop().await;

        // Whatever happened, a publishing session must release its name.
        if let Some(ingest) = self.ingest.take() {
            if let Some(ack) = ingest.ack {
                hub::api::unpublish(&self.hub, ack.handle);
            }
        }
        result
    }

    async fn message_loop(&mut self) -> Result<(), RtmpError> {
        loop {
            let messages = self.connection.read_messages(IDLE_READ_TIMEOUT).await?;
            for chunk in messages {
                match messages::parse(chunk)? {
                    RtmpMessage::SetChunkSize(size) => {
                        self.connection
                            .unpacketizer
                            .update_max_chunk_size(size as usize)?;
                    }
                    RtmpMessage::Amf0Command {
                        name,
                        transaction_id,
                        values,
                    } => {
                        if self.on_command(&name, transaction_id, values).await? {
                            return Ok(());
                        }
                    }
                    RtmpMessage::Audio { timestamp, data } => {
                        self.on_audio(timestamp, data).await?;
                    }
                    RtmpMessage::Video { timestamp, data } => {
                        self.on_video(timestamp, data).await?;
                    }
                    RtmpMessage::Amf0Data { values } => self.on_metadata(&values),
                    RtmpMessage::Acknowledgement(_)
                    | RtmpMessage::WindowAckSize(_)
                    | RtmpMessage::SetPeerBandwidth(..)
                    | RtmpMessage::UserControl { .. }
                    | RtmpMessage::Abort(_) => {}
                    RtmpMessage::Unsupported(type_id) => {
                        tracing::debug!(type_id, "ignoring unsupported rtmp message type");
                    }
                }
            }
        }
    }

    /// Returns `true` when the session is finished (play loop completed or
    /// the peer deleted its stream).
    async fn on_command(
        &mut self,
        name: &str,
        transaction_id: f64,
        values: Vec<Amf0Value>,
    ) -> Result<bool, RtmpError> {
        match name {
            "connect" => {
                self.on_connect(transaction_id, &values).await?;
                Ok(false)
            }
            "createStream" => {
                self.connection
                    .send_message(
                        csid::COMMAND,
                        msg_type_id::COMMAND_AMF0,
                        0,
                        0,
                        NetConnection::create_stream_response(transaction_id, 1.0)?,
                    )
                    .await?;
                self.state = SessionState::AwaitCommand;
                Ok(false)
            }
            "publish" => {
                self.on_publish(&values).await?;
                Ok(false)
            }
            "play" => {
                self.on_play(&values).await?;
                Ok(true)
            }
            "deleteStream" | "closeStream" | "FCUnpublish" => {
                tracing::info!(
                    app = %self.app_name,
                    stream = %self.stream_name,
                    "publisher closed stream"
                );
                Ok(matches!(self.state, SessionState::Publishing))
            }
            "releaseStream" | "FCPublish" | "getStreamLength" => Ok(false),
            other => {
                tracing::debug!(command = other, "ignoring rtmp command");
                Ok(false)
            }
        }
    }

    async fn on_connect(
        &mut self,
        transaction_id: f64,
        values: &[Amf0Value],
    ) -> Result<(), RtmpError> {
        let props = values
            .first()
            .ok_or_else(|| RtmpError::MalformedCommand("connect without properties".into()))?;
        let app = props
            .object_get("app")
            .and_then(Amf0Value::as_str)
            .ok_or_else(|| RtmpError::MalformedCommand("connect without app".into()))?;
        let (app, query) = split_query(app);
        self.app_name = app;
        self.query = query;
        self.tc_url = props
            .object_get("tcUrl")
            .and_then(Amf0Value::as_str)
            .unwrap_or_default()
            .to_string();

        self.connection
            .send_message(
                csid::PROTOCOL_CONTROL,
                msg_type_id::WIN_ACKNOWLEDGEMENT_SIZE,
                0,
                0,
                control::window_ack_size(WINDOW_ACK_SIZE)?,
            )
            .await?;
        self.connection
            .send_message(
                csid::PROTOCOL_CONTROL,
                msg_type_id::SET_PEER_BANDWIDTH,
                0,
                0,
                control::set_peer_bandwidth(WINDOW_ACK_SIZE, 2)?,
            )
            .await?;
        self.connection.negotiate_chunk_size().await?;
        self.connection
            .send_message(
                csid::COMMAND,
                msg_type_id::COMMAND_AMF0,
                0,
                0,
                NetConnection::connect_response(transaction_id)?,
            )
            .await?;
        self.state = SessionState::AwaitCommand;
        tracing::info!(app = %self.app_name, remote = %self.connection.remote_addr, "rtmp connect");
        Ok(())
    }

    fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.vhost.clone(), self.app_name.clone(), self.stream_name.clone())
    }

    fn request_url(&self) -> String {
        let mut url = if self.tc_url.is_empty() {
            format!("rtmp://unknown/{}/{}", self.app_name, self.stream_name)
        } else {
            format!("{}/{}", self.tc_url.trim_end_matches('/'), self.stream_name)
        };
        if let Some(query) = &self.query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    async fn on_publish(&mut self, values: &[Amf0Value]) -> Result<(), RtmpError> {
        let raw_name = values
            .get(1)
            .and_then(Amf0Value::as_str)
            .ok_or_else(|| RtmpError::MalformedCommand("publish without stream name".into()))?;
        let (name, query) = split_query(raw_name);
        if name.is_empty() {
            self.send_status("error", status::PUBLISH_BAD_NAME, "empty stream name")
                .await?;
            return Err(RtmpError::PublishRejected("empty stream name".into()));
        }
        self.stream_name = name;
        if query.is_some() {
            self.query = query;
        }

        let request = AccessRequest {
            direction: AccessDirection::Publish,
            protocol: "rtmp",
            url: self.request_url(),
            stream: self.stream_key(),
            remote_addr: self.connection.remote_addr.clone(),
            user_agent: None,
        };
        if let Err(denied) = self.access.admit(&request).await {
            tracing::warn!(stream = %self.stream_key(), error = %denied, "rtmp publish denied");
            self.send_status("error", status::PUBLISH_REJECTED, &denied.to_string())
                .await?;
            return Err(RtmpError::PublishRejected(denied.to_string()));
        }

        self.connection
            .send_message(
                csid::PROTOCOL_CONTROL,
                msg_type_id::USER_CONTROL_EVENT,
                0,
                0,
                control::stream_begin(1)?,
            )
            .await?;
        self.send_status("status", status::PUBLISH_START, "publishing").await?;
        self.state = SessionState::Publishing;
        self.ingest = Some(IngestState::new());
        tracing::info!(stream = %self.stream_key(), "rtmp publish accepted");
        Ok(())
    }

    fn on_metadata(&mut self, values: &[Amf0Value]) {
        // `@setDataFrame onMetaData {...}` carries encoder hints; track
        // identity still comes from the sequence headers.
        if let Some(Amf0Value::String(marker)) = values.first() {
            if marker == "@setDataFrame" {
                tracing::debug!(stream = %self.stream_name, "received onMetaData");
            }
        }
    }

    async fn on_video(&mut self, timestamp: u32, data: BytesMut) -> Result<(), RtmpError> {
        let Some(ingest) = self.ingest.as_mut() else {
            return Ok(());
        };
        ingest.av_messages_seen += 1;
        match ingest.video_demuxer.demux(timestamp, data) {
            Ok(FlvDemuxEvent::TrackReady(track)) => ingest.tracks.push(track),
            Ok(FlvDemuxEvent::Packet(packet)) => Self::queue_or_forward(ingest, packet).await?,
            Ok(FlvDemuxEvent::Skip) => {}
            Err(err) => {
                tracing::warn!(stream = %self.stream_name, error = %err, "video tag dropped");
            }
        }
        self.maybe_create_stream().await
    }

    async fn on_audio(&mut self, timestamp: u32, data: BytesMut) -> Result<(), RtmpError> {
        let Some(ingest) = self.ingest.as_mut() else {
            return Ok(());
        };
        ingest.av_messages_seen += 1;
        match ingest.audio_demuxer.demux(timestamp, data) {
            Ok(FlvDemuxEvent::TrackReady(track)) => ingest.tracks.push(track),
            Ok(FlvDemuxEvent::Packet(packet)) => Self::queue_or_forward(ingest, packet).await?,
            Ok(FlvDemuxEvent::Skip) => {}
            Err(err) => {
                tracing::warn!(stream = %self.stream_name, error = %err, "audio tag dropped");
            }
        }
        self.maybe_create_stream().await
    }

    async fn queue_or_forward(
        ingest: &mut IngestState,
        packet: MediaPacket,
    ) -> Result<(), RtmpError> {
        match &ingest.ack {
            Some(ack) => {
                if ack.packet_sender.send(packet).await.is_err() {
                    return Err(RtmpError::Hub(crate::hub::errors::HubError::SendError));
                }
            }
            None => {
                if ingest.pending.len() >= PENDING_PACKET_CAP {
                    ingest.pending.remove(0);
                }
                ingest.pending.push(packet);
            }
        }
        Ok(())
    }

    /// Create the stream in the registry once codec parameters have been
    /// observed: both sequence headers, or a bounded number of messages
    /// for single-track sources.
    async fn maybe_create_stream(&mut self) -> Result<(), RtmpError> {
        let key = self.stream_key();
        let Some(ingest) = self.ingest.as_mut() else {
            return Ok(());
        };
        if ingest.ack.is_some() || ingest.tracks.is_empty() {
            return Ok(());
        }
        let both_configured = ingest.has_video_config() && ingest.has_audio_config();
        if !both_configured && ingest.av_messages_seen < MAX_MESSAGES_BEFORE_PUBLISH {
            return Ok(());
        }

        let info = ProviderInfo {
            id: Uuid::new_v4(),
            kind: ProviderKind::RtmpPush,
            remote_addr: self.connection.remote_addr.clone(),
        };
        match hub::api::publish(&self.hub, key.clone(), info, ingest.tracks.clone()).await {
            Ok(mut ack) => {
                // RTMP encoders cannot produce keyframes on demand; swallow
                // the requests so the channel never backs up.
                let mut keyframe_requests =
                    std::mem::replace(&mut ack.keyframe_requests, tokio::sync::mpsc::channel(1).1);
                tokio::spawn(async move {
                    while keyframe_requests.recv().await.is_some() {
                        tracing::debug!("keyframe request ignored by rtmp ingest");
                    }
                });

                for packet in ingest.pending.drain(..) {
                    if ack.packet_sender.send(packet).await.is_err() {
                        return Err(RtmpError::Hub(crate::hub::errors::HubError::SendError));
                    }
                }
                ingest.ack = Some(ack);
                tracing::info!(stream = %key, "rtmp stream registered");
                Ok(())
            }
            Err(err) => {
                self.send_status("error", status::PUBLISH_BAD_NAME, &err.to_string())
                    .await?;
                Err(RtmpError::PublishRejected(err.to_string()))
            }
        }
    }

    async fn on_play(&mut self, values: &[Amf0Value]) -> Result<(), RtmpError> {
        let raw_name = values
            .get(1)
            .and_then(Amf0Value::as_str)
            .ok_or_else(|| RtmpError::MalformedCommand("play without stream name".into()))?;
        let (name, query) = split_query(raw_name);
        self.stream_name = name;
        if query.is_some() {
            self.query = query;
        }
        let key = self.stream_key();

        let request = AccessRequest {
            direction: AccessDirection::Play,
            protocol: "rtmp",
            url: self.request_url(),
            stream: key.clone(),
            remote_addr: self.connection.remote_addr.clone(),
            user_agent: None,
        };
        if let Err(denied) = self.access.admit(&request).await {
            self.send_status("error", status::PLAY_STREAM_NOT_FOUND, &denied.to_string())
                .await?;
            return Err(RtmpError::PlayRejected(denied.to_string()));
        }

        let info = SubscriberInfo {
            id: Uuid::new_v4(),
            kind: SubscriberKind::RtmpPlay,
            remote_addr: self.connection.remote_addr.clone(),
            request_url: self.request_url(),
        };
        let ack = match hub::api::subscribe(&self.hub, key.clone(), info.clone()).await {
            Ok(ack) => ack,
            Err(err) => {
                self.send_status("error", status::PLAY_STREAM_NOT_FOUND, &err.to_string())
                    .await?;
                return Err(RtmpError::PlayRejected(err.to_string()));
            }
        };

        self.connection
            .send_message(
                csid::PROTOCOL_CONTROL,
                msg_type_id::USER_CONTROL_EVENT,
                0,
                0,
                control::stream_begin(1)?,
            )
            .await?;
        self.send_status("status", status::PLAY_START, "playing").await?;

        let result = self.play_loop(ack).await;
        hub::api::unsubscribe(&self.hub, key, info);
        result
    }

    /// Forward routed packets to the player as FLV-in-RTMP messages.
    async fn play_loop(&mut self, mut ack: SubscribeAck) -> Result<(), RtmpError> {
        let video_track = ack.tracks.iter().find(|t| t.kind == MediaKind::Video);
        let audio_track = ack.tracks.iter().find(|t| t.kind == MediaKind::Audio);
        let video_id = video_track.map(|t| t.id);
        let audio_id = audio_track.map(|t| t.id);

        // Sequence headers first so the decoder can configure itself.
        if let Some(extradata) = video_track.and_then(|t| t.extradata.as_ref()) {
            let tag = tag_body::avc_sequence_header(extradata);
            self.connection
                .send_message(csid::VIDEO, msg_type_id::VIDEO, 0, 1, tag)
                .await?;
        }
        if let Some(extradata) = audio_track.and_then(|t| t.extradata.as_ref()) {
            let tag = tag_body::aac_sequence_header(extradata);
            self.connection
                .send_message(csid::AUDIO, msg_type_id::AUDIO, 0, 1, tag)
                .await?;
        }

        // A player that disconnects surfaces as a write error on the next
        // packet; a clean unpublish closes the receiver.
        loop {
            let Some(packet) = ack.receiver.recv().await else {
                self.send_status("status", status::PLAY_UNPUBLISH_NOTIFY, "stream ended")
                    .await?;
                return Ok(());
            };
            if packet.flags.end_of_stream {
                continue;
            }
            if Some(packet.track_id) == video_id {
                self.send_video_packet(&packet).await?;
            } else if Some(packet.track_id) == audio_id {
                self.send_audio_packet(&packet).await?;
            }
        }
    }

    async fn send_video_packet(&mut self, packet: &MediaPacket) -> Result<(), RtmpError> {
        let millis = packet.rescaled(Timebase::MILLIS);
        let cts = (millis.pts - millis.dts).clamp(0, 0xFF_FFFF) as u32;
        let avcc_payload = match packet.bitstream {
            BitstreamFormat::Avcc => packet.payload.clone(),
            BitstreamFormat::AnnexB => h264::annexb_to_avcc(&packet.payload)?.freeze(),
            _ => return Ok(()),
        };
        let tag = tag_body::avc_nalu(packet.flags.keyframe, cts, &avcc_payload);
        self.connection
            .send_message(csid::VIDEO, msg_type_id::VIDEO, millis.dts as u32, 1, tag)
            .await
    }

    async fn send_audio_packet(&mut self, packet: &MediaPacket) -> Result<(), RtmpError> {
        let millis = packet.rescaled(Timebase::MILLIS);
        let tag = tag_body::aac_raw(&packet.payload);
        self.connection
            .send_message(csid::AUDIO, msg_type_id::AUDIO, millis.dts as u32, 1, tag)
            .await
    }

    async fn send_status(
        &mut self,
        level: &str,
        code: &str,
        description: &str,
    ) -> Result<(), RtmpError> {
        let payload = NetStream::on_status(level, code, description)?;
        self.connection
            .send_message(csid::COMMAND, msg_type_id::COMMAND_AMF0, 0, 1, payload)
            .await
    }
}
