use {
    super::{
        depacketize::{AccessUnit, H264Depacketizer, H265Depacketizer},
        errors::RtspError,
        jitter::JitterBuffer,
        rtcp,
        rtp::RtpPacket,
        sdp::{self, SdpMedia},
    },
    crate::{
        codec::h264::AvcDecoderConfigurationRecord,
        hub::{
            self,
            define::{
                HubEventSender, KeyframeRequestReceiver, PacketSender, ProviderInfo,
                ProviderKind,
            },
            stream::StreamKey,
        },
        media::{
            AudioParams, BitstreamFormat, CodecId, MediaKind, MediaPacket, MediaTrack,
            PacketFlags, Timebase, TimestampExtender, VideoParams,
        },
    },
    bytes::{BufMut, Bytes, BytesMut},
    md5::{Digest, Md5},
    rand::Rng,
    std::collections::HashMap,
    std::sync::Arc,
    std::time::Duration,
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpStream, UdpSocket},
    },
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
const RECEIVER_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Default reorder window, sized for the default 50 ms jitter target at
/// typical video packet rates.
pub const DEFAULT_REORDER_WINDOW: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspTransport {
    /// RTP interleaved on the RTSP TCP connection.
    Tcp,
    /// Separate UDP socket pair per track.
    Udp,
}

#[derive(Debug, Clone)]
pub struct RtspPullConfig {
    pub url: String,
    pub key: StreamKey,
    pub credentials: Option<(String, String)>,
    pub transport: RtspTransport,
    pub reorder_window: usize,
}

/// Pulls one remote RTSP source (camera or upstream origin) into the hub,
/// reconnecting with exponential back-off for as long as it is wanted.
pub struct RtspPullSession {
    config: RtspPullConfig,
    hub: HubEventSender,
    cancel: CancellationToken,
}

impl RtspPullSession {
    #[must_use]
    pub fn new(config: RtspPullConfig, hub: HubEventSender, cancel: CancellationToken) -> Self {
        Self {
            config,
            hub,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut backoff = BACKOFF_BASE;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.pull_once().await {
                Ok(()) => backoff = BACKOFF_BASE,
                Err(err) => {
                    tracing::warn!(
                        url = %self.config.url,
                        stream = %self.config.key,
                        error = %err,
                        "rtsp pull failed, reconnecting"
                    );
                }
            }
            let jitter = rand::thread_rng().gen_range(0.8..=1.2);
            tokio::select! {
                _ = tokio::time::sleep(backoff.mul_f64(jitter)) => {}
                _ = self.cancel.cancelled() => return,
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    async fn pull_once(&self) -> Result<(), RtspError> {
        let parsed = url::Url::parse(&self.config.url)
            .map_err(|e| RtspError::BadUrl(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| RtspError::BadUrl("missing host".into()))?
            .to_string();
        let port = parsed.port().unwrap_or(554);

        let stream = TcpStream::connect((host.as_str(), port)).await?;
        let mut control = RtspControl::new(stream, self.config.url.clone());
        if let Some((user, pass)) = &self.config.credentials {
            control.set_credentials(user.clone(), pass.clone());
        }

        let describe = control
            .request("DESCRIBE", &self.config.url, &[("Accept", "application/sdp")])
            .await?;
        let description = sdp::parse(&describe.body)?;

        // SETUP each media section, then register the track set.
        let mut session_tracks = Vec::new();
        let mut udp_sockets: Vec<Option<(UdpSocket, UdpSocket)>> = Vec::new();
        for (index, media) in description.medias.iter().enumerate() {
            let control_url = resolve_control(&self.config.url, &media.control);
            match self.config.transport {
                RtspTransport::Tcp => {
                    let channels = format!("interleaved={}-{}", index * 2, index * 2 + 1);
                    let transport = format!("RTP/AVP/TCP;unicast;{channels}");
                    control
                        .request("SETUP", &control_url, &[("Transport", &transport)])
                        .await?;
                    udp_sockets.push(None);
                }
                RtspTransport::Udp => {
                    let rtp = UdpSocket::bind("0.0.0.0:0").await?;
                    let rtcp = UdpSocket::bind("0.0.0.0:0").await?;
                    let rtp_port = rtp.local_addr()?.port();
                    let transport = format!(
                        "RTP/AVP;unicast;client_port={}-{}",
                        rtp_port,
                        rtp_port + 1
                    );
                    let response = control
                        .request("SETUP", &control_url, &[("Transport", &transport)])
                        .await?;
                    if let Some((rtp_server, rtcp_server)) =
                        parse_server_ports(response.header("Transport"))
                    {
                        rtp.connect((host.as_str(), rtp_server)).await?;
                        rtcp.connect((host.as_str(), rtcp_server)).await?;
                    }
                    udp_sockets.push(Some((rtp, rtcp)));
                }
            }
            session_tracks.push(build_track(index as u32, media));
        }

        let info = ProviderInfo {
            id: Uuid::new_v4(),
            kind: ProviderKind::RtspPull,
            remote_addr: format!("{host}:{port}"),
        };
        let ack = hub::api::publish(
            &self.hub,
            self.config.key.clone(),
            info,
            session_tracks.clone(),
        )
        .await?;
        let handle = ack.handle.clone();

        control
            .request("PLAY", &self.config.url, &[("Range", "npt=now-")])
            .await?;
        tracing::info!(stream = %self.config.key, url = %self.config.url, "rtsp pull playing");

        let mut media_loop = MediaLoop::new(&self.config, &description.medias);
        let result = match self.config.transport {
            RtspTransport::Tcp => {
                media_loop
                    .run_interleaved(
                        &mut control,
                        ack.packet_sender,
                        ack.keyframe_requests,
                        &self.cancel,
                    )
                    .await
            }
            RtspTransport::Udp => {
                media_loop
                    .run_udp(
                        &mut control,
                        udp_sockets,
                        ack.packet_sender,
                        ack.keyframe_requests,
                        &self.cancel,
                    )
                    .await
            }
        };

        let _ = control.request("TEARDOWN", &self.config.url, &[]).await;
        hub::api::unpublish(&self.hub, handle);
        result
    }
}

fn build_track(track_id: u32, media: &SdpMedia) -> MediaTrack {
    match media.kind {
        MediaKind::Video => {
            let mut track = MediaTrack::video(
                track_id,
                media.codec,
                Timebase::rtp(media.clock_rate),
                VideoParams {
                    width: 0,
                    height: 0,
                    fps_milli: 0,
                },
            );
            if let Some((sps, pps)) = &media.parameter_sets {
                if let Ok(info) = crate::codec::h264::SpsInfo::parse(sps) {
                    track.video = Some(VideoParams {
                        width: info.width,
                        height: info.height,
                        fps_milli: 0,
                    });
                }
                if let Ok(record) =
                    AvcDecoderConfigurationRecord::from_parameter_sets(sps.clone(), pps.clone())
                {
                    if let Ok(extradata) = record.marshal() {
                        track = track.with_extradata(extradata);
                    }
                }
            }
            track
        }
        MediaKind::Audio | MediaKind::Data => MediaTrack::audio(
            track_id,
            media.codec,
            Timebase::rtp(media.clock_rate),
            AudioParams {
                sample_rate: media.clock_rate,
                channels: media.channels,
            },
        ),
    }
}

enum Depacketizer {
    H264(H264Depacketizer),
    H265(H265Depacketizer),
    Passthrough,
}

struct TrackPipeline {
    track_id: u32,
    timebase: Timebase,
    jitter: JitterBuffer,
    depacketizer: Depacketizer,
    extender: TimestampExtender,
    ssrc: u32,
    is_video: bool,
}

impl TrackPipeline {
    /// RTP bytes in, hub packets out.
    fn ingest(&mut self, data: &[u8], out: &mut Vec<MediaPacket>) {
        let packet = match RtpPacket::parse(data) {
            Ok(packet) => packet,
            Err(_) => {
                tracing::debug!(track = self.track_id, "malformed rtp packet skipped");
                return;
            }
        };
        self.ssrc = packet.ssrc;

        let mut ready = Vec::new();
        self.jitter.push(packet, &mut ready);
        for packet in ready {
            match &mut self.depacketizer {
                Depacketizer::H264(depack) => {
                    if let Some(unit) = depack.push(&packet) {
                        out.push(video_packet(
                            self.track_id,
                            self.timebase,
                            &mut self.extender,
                            unit,
                        ));
                    }
                }
                Depacketizer::H265(depack) => {
                    if let Some(unit) = depack.push(&packet) {
                        out.push(video_packet(
                            self.track_id,
                            self.timebase,
                            &mut self.extender,
                            unit,
                        ));
                    }
                }
                Depacketizer::Passthrough => {
                    let timestamp = self.extender.extend(u64::from(packet.timestamp));
                    out.push(MediaPacket {
                        track_id: self.track_id,
                        pts: timestamp,
                        dts: timestamp,
                        duration: 0,
                        timebase: self.timebase,
                        flags: PacketFlags::NONE,
                        bitstream: BitstreamFormat::Raw,
                        payload: packet.payload.clone(),
                    });
                }
            }
        }
    }
}

/// Per-connection media pump shared by both transports.
struct MediaLoop {
    pipelines: Vec<TrackPipeline>,
    local_ssrc: u32,
    fir_sequence: u8,
}

impl MediaLoop {
    fn new(config: &RtspPullConfig, medias: &[SdpMedia]) -> Self {
        let pipelines = medias
            .iter()
            .enumerate()
            .map(|(index, media)| TrackPipeline {
                track_id: index as u32,
                timebase: Timebase::rtp(media.clock_rate),
                jitter: JitterBuffer::new(config.reorder_window),
                depacketizer: match media.codec {
                    CodecId::H264 => Depacketizer::H264(H264Depacketizer::new()),
                    CodecId::H265 => Depacketizer::H265(H265Depacketizer::new()),
                    _ => Depacketizer::Passthrough,
                },
                extender: TimestampExtender::rtp(),
                ssrc: 0,
                is_video: media.kind == MediaKind::Video,
            })
            .collect();
        Self {
            pipelines,
            local_ssrc: rand::thread_rng().gen(),
            fir_sequence: 0,
        }
    }

    async fn run_interleaved(
        &mut self,
        control: &mut RtspControl,
        sender: PacketSender,
        mut keyframe_requests: KeyframeRequestReceiver,
        cancel: &CancellationToken,
    ) -> Result<(), RtspError> {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reports = tokio::time::interval(RECEIVER_REPORT_INTERVAL);
        reports.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            enum Step {
                Frame(u8, Bytes),
                Keyframe,
                Reports,
                Keepalive,
                Stop,
            }
            let step = tokio::select! {
                frame = control.read_interleaved() => {
                    let (channel, payload) = frame?;
                    Step::Frame(channel, payload)
                }
                _ = keyframe_requests.recv() => Step::Keyframe,
                _ = reports.tick() => Step::Reports,
                _ = keepalive.tick() => Step::Keepalive,
                _ = cancel.cancelled() => Step::Stop,
            };
            match step {
                Step::Frame(channel, payload) => {
                    let track_index = (channel / 2) as usize;
                    if channel % 2 == 0 {
                        let mut out = Vec::new();
                        if let Some(pipeline) = self.pipelines.get_mut(track_index) {
                            pipeline.ingest(&payload, &mut out);
                        }
                        for packet in out {
                            if sender.send(packet).await.is_err() {
                                return Err(RtspError::UpstreamGone);
                            }
                        }
                    } else {
                        self.on_rtcp(track_index, &payload);
                    }
                }
                Step::Keyframe => {
                    for index in 0..self.pipelines.len() {
                        let (is_video, ssrc) =
                            (self.pipelines[index].is_video, self.pipelines[index].ssrc);
                        if is_video && ssrc != 0 {
                            self.fir_sequence = self.fir_sequence.wrapping_add(1);
                            let fir = rtcp::fir(self.local_ssrc, ssrc, self.fir_sequence);
                            control.send_interleaved((index * 2 + 1) as u8, &fir).await?;
                        }
                    }
                }
                Step::Reports => {
                    for index in 0..self.pipelines.len() {
                        let ssrc = self.pipelines[index].ssrc;
                        if ssrc == 0 {
                            continue;
                        }
                        let rr = rtcp::receiver_report(self.local_ssrc);
                        control.send_interleaved((index * 2 + 1) as u8, &rr).await?;
                        let missing = self.pipelines[index].jitter.missing();
                        if !missing.is_empty() {
                            let nack = rtcp::nack(self.local_ssrc, ssrc, &missing);
                            control.send_interleaved((index * 2 + 1) as u8, &nack).await?;
                        }
                    }
                }
                Step::Keepalive => control.send_keepalive().await?,
                Step::Stop => return Ok(()),
            }
        }
    }

    async fn run_udp(
        &mut self,
        control: &mut RtspControl,
        sockets: Vec<Option<(UdpSocket, UdpSocket)>>,
        sender: PacketSender,
        mut keyframe_requests: KeyframeRequestReceiver,
        cancel: &CancellationToken,
    ) -> Result<(), RtspError> {
        // Socket reads feed one channel; the pump below is transport-blind.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<(usize, bool, Bytes)>(512);
        let mut rtcp_sockets: Vec<(usize, Arc<UdpSocket>)> = Vec::new();
        for (index, pair) in sockets.into_iter().enumerate() {
            let Some((rtp, rtcp_socket)) = pair else {
                continue;
            };
            let rtcp_socket = Arc::new(rtcp_socket);
            rtcp_sockets.push((index, rtcp_socket.clone()));
            let tx_rtp = tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65_536];
                while let Ok(len) = rtp.recv(&mut buf).await {
                    if tx_rtp
                        .send((index, false, Bytes::copy_from_slice(&buf[..len])))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
            let tx_rtcp = tx.clone();
            let rtcp_reader = rtcp_socket;
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65_536];
                while let Ok(len) = rtcp_reader.recv(&mut buf).await {
                    if tx_rtcp
                        .send((index, true, Bytes::copy_from_slice(&buf[..len])))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
        }
        drop(tx);

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reports = tokio::time::interval(RECEIVER_REPORT_INTERVAL);
        reports.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = rx.recv() => {
                    let Some((index, is_rtcp, payload)) = item else {
                        return Err(RtspError::UpstreamGone);
                    };
                    if is_rtcp {
                        self.on_rtcp(index, &payload);
                    } else {
                        let mut out = Vec::new();
                        if let Some(pipeline) = self.pipelines.get_mut(index) {
                            pipeline.ingest(&payload, &mut out);
                        }
                        for packet in out {
                            if sender.send(packet).await.is_err() {
                                return Err(RtspError::UpstreamGone);
                            }
                        }
                    }
                }
                _ = keyframe_requests.recv() => {
                    for (index, socket) in &rtcp_sockets {
                        let Some(pipeline) = self.pipelines.get(*index) else { continue };
                        if pipeline.is_video && pipeline.ssrc != 0 {
                            self.fir_sequence = self.fir_sequence.wrapping_add(1);
                            let fir = rtcp::fir(self.local_ssrc, pipeline.ssrc, self.fir_sequence);
                            let _ = socket.send(&fir).await;
                        }
                    }
                }
                _ = reports.tick() => {
                    for (index, socket) in &rtcp_sockets {
                        let Some(pipeline) = self.pipelines.get(*index) else { continue };
                        if pipeline.ssrc == 0 {
                            continue;
                        }
                        let _ = socket.send(&rtcp::receiver_report(self.local_ssrc)).await;
                        let missing = pipeline.jitter.missing();
                        if !missing.is_empty() {
                            let _ = socket
                                .send(&rtcp::nack(self.local_ssrc, pipeline.ssrc, &missing))
                                .await;
                        }
                    }
                }
                _ = keepalive.tick() => {
                    control.send_keepalive().await?;
                }
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    fn on_rtcp(&mut self, track_index: usize, data: &[u8]) {
        if let Some(report) = rtcp::parse_sender_report(data) {
            tracing::trace!(
                track_index,
                ssrc = report.ssrc,
                rtp_ts = report.rtp_timestamp,
                "sender report"
            );
        }
    }
}

fn video_packet(
    track_id: u32,
    timebase: Timebase,
    extender: &mut TimestampExtender,
    unit: AccessUnit,
) -> MediaPacket {
    let timestamp = extender.extend(u64::from(unit.timestamp));
    MediaPacket {
        track_id,
        pts: timestamp,
        dts: timestamp,
        duration: 0,
        timebase,
        flags: PacketFlags {
            keyframe: unit.keyframe,
            ..PacketFlags::NONE
        },
        bitstream: BitstreamFormat::AnnexB,
        payload: unit.data,
    }
}

struct RtspResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: String,
}

impl RtspResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// RTSP control-channel plumbing: request/response with CSeq, session and
/// digest-auth state, plus interleaved binary framing.
struct RtspControl {
    stream: TcpStream,
    base_url: String,
    cseq: u32,
    session: Option<String>,
    credentials: Option<(String, String)>,
    auth_header: Option<String>,
    buffer: BytesMut,
}

impl RtspControl {
    fn new(stream: TcpStream, base_url: String) -> Self {
        Self {
            stream,
            base_url,
            cseq: 0,
            session: None,
            credentials: None,
            auth_header: None,
            buffer: BytesMut::new(),
        }
    }

    fn set_credentials(&mut self, user: String, pass: String) {
        self.credentials = Some((user, pass));
    }

    async fn request(
        &mut self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<RtspResponse, RtspError> {
        let response = self.request_once(method, url, headers).await?;
        if response.status == 401 {
            let challenge = response
                .header("WWW-Authenticate")
                .ok_or(RtspError::AuthFailed)?
                .to_string();
            self.prepare_digest(method, url, &challenge)?;
            let retry = self.request_once(method, url, headers).await?;
            if retry.status == 401 {
                return Err(RtspError::AuthFailed);
            }
            return check_status(retry);
        }
        check_status(response)
    }

    async fn request_once(
        &mut self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<RtspResponse, RtspError> {
        self.cseq += 1;
        let mut request = format!("{method} {url} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        if let Some(session) = &self.session {
            request.push_str(&format!("Session: {session}\r\n"));
        }
        if let Some(auth) = &self.auth_header {
            request.push_str(&format!("Authorization: {auth}\r\n"));
        }
        request.push_str("User-Agent: sluice\r\n");
        for (name, value) in headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");
        self.stream.write_all(request.as_bytes()).await?;

        let response = tokio::time::timeout(RESPONSE_TIMEOUT, self.read_response())
            .await
            .map_err(|_| RtspError::MalformedResponse("response timeout".into()))??;
        if let Some(session) = response.header("Session") {
            let id = session.split(';').next().unwrap_or(session).trim();
            self.session = Some(id.to_string());
        }
        Ok(response)
    }

    fn prepare_digest(
        &mut self,
        method: &str,
        url: &str,
        challenge: &str,
    ) -> Result<(), RtspError> {
        let (user, pass) = self.credentials.clone().ok_or(RtspError::AuthFailed)?;
        let realm = challenge_field(challenge, "realm").ok_or(RtspError::AuthFailed)?;
        let nonce = challenge_field(challenge, "nonce").ok_or(RtspError::AuthFailed)?;

        let ha1 = md5_hex(&format!("{user}:{realm}:{pass}"));
        let ha2 = md5_hex(&format!("{method}:{url}"));
        let response = md5_hex(&format!("{ha1}:{nonce}:{ha2}"));
        self.auth_header = Some(format!(
            "Digest username=\"{user}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{url}\", response=\"{response}\""
        ));
        Ok(())
    }

    /// Read one RTSP response, skipping interleaved frames that arrive
    /// meanwhile.
    async fn read_response(&mut self) -> Result<RtspResponse, RtspError> {
        loop {
            if self.buffer.first() == Some(&b'$') {
                if self.try_take_interleaved()?.is_none() {
                    self.fill().await?;
                }
                continue;
            }
            if let Some(response) = self.try_take_response()? {
                return Ok(response);
            }
            self.fill().await?;
        }
    }

    fn try_take_response(&mut self) -> Result<Option<RtspResponse>, RtspError> {
        let Some(header_end) = find_subsequence(&self.buffer, b"\r\n\r\n") else {
            return Ok(None);
        };
        let header_text = String::from_utf8_lossy(&self.buffer[..header_end]).to_string();
        let mut lines = header_text.lines();
        let status_line = lines
            .next()
            .ok_or_else(|| RtspError::MalformedResponse("empty response".into()))?;
        if !status_line.starts_with("RTSP/") {
            return Err(RtspError::MalformedResponse(status_line.to_string()));
        }
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RtspError::MalformedResponse(status_line.to_string()))?;

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
        let content_length: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let total = header_end + 4 + content_length;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let frame = self.buffer.split_to(total);
        let body = String::from_utf8_lossy(&frame[header_end + 4..]).to_string();
        Ok(Some(RtspResponse {
            status,
            headers,
            body,
        }))
    }

    /// Read one interleaved frame: `$ <channel> <len:u16> <payload>`.
    async fn read_interleaved(&mut self) -> Result<(u8, Bytes), RtspError> {
        loop {
            if let Some(frame) = self.try_take_interleaved()? {
                return Ok(frame);
            }
            if self.buffer.first().is_some_and(|&b| b != b'$') {
                // Keepalive replies interleave with data; discard them.
                if self.try_take_response()?.is_some() {
                    continue;
                }
            }
            self.fill().await?;
        }
    }

    fn try_take_interleaved(&mut self) -> Result<Option<(u8, Bytes)>, RtspError> {
        if self.buffer.len() < 4 || self.buffer[0] != b'$' {
            return Ok(None);
        }
        let channel = self.buffer[1];
        let len = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        let _ = self.buffer.split_to(4);
        let payload = self.buffer.split_to(len).freeze();
        Ok(Some((channel, payload)))
    }

    async fn send_interleaved(&mut self, channel: u8, payload: &[u8]) -> Result<(), RtspError> {
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u8(b'$');
        frame.put_u8(channel);
        frame.put_u16(payload.len() as u16);
        frame.put_slice(payload);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn send_keepalive(&mut self) -> Result<(), RtspError> {
        // GET_PARAMETER without waiting for the reply; the read path
        // discards it.
        self.cseq += 1;
        let mut request = format!(
            "GET_PARAMETER {} RTSP/1.0\r\nCSeq: {}\r\n",
            self.base_url, self.cseq
        );
        if let Some(session) = &self.session {
            request.push_str(&format!("Session: {session}\r\n"));
        }
        request.push_str("\r\n");
        self.stream.write_all(request.as_bytes()).await?;
        Ok(())
    }

    async fn fill(&mut self) -> Result<(), RtspError> {
        let mut chunk = [0u8; 16_384];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RtspError::UpstreamGone);
        }
        self.buffer.put_slice(&chunk[..n]);
        Ok(())
    }
}

fn check_status(response: RtspResponse) -> Result<RtspResponse, RtspError> {
    if response.status >= 300 {
        return Err(RtspError::Status(
            response.status,
            response.body.lines().next().unwrap_or("").to_string(),
        ));
    }
    Ok(response)
}

fn challenge_field(challenge: &str, field: &str) -> Option<String> {
    let start = challenge.find(&format!("{field}=\""))? + field.len() + 2;
    let rest = &challenge[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// `Transport: ...;server_port=5000-5001` → (5000, 5001).
fn parse_server_ports(transport: Option<&str>) -> Option<(u16, u16)> {
    let transport = transport?;
    let ports = transport
        .split(';')
        .find_map(|p| p.trim().strip_prefix("server_port="))?;
    let (rtp, rtcp) = ports.split_once('-')?;
    Some((rtp.parse().ok()?, rtcp.parse().ok()?))
}

/// Resolve a (possibly relative) `a=control` value against the base URL.
fn resolve_control(base: &str, control: &str) -> String {
    if control.is_empty() || control == "*" {
        return base.to_string();
    }
    if control.starts_with("rtsp://") {
        return control.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), control)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_parse() {
        let challenge = "Digest realm=\"cam\", nonce=\"abc123\", stale=FALSE";
        assert_eq!(challenge_field(challenge, "realm").as_deref(), Some("cam"));
        assert_eq!(challenge_field(challenge, "nonce").as_deref(), Some("abc123"));
        assert_eq!(challenge_field(challenge, "opaque"), None);
    }

    #[test]
    fn test_digest_response_stable() {
        let ha1 = md5_hex("user:cam:pass");
        let ha2 = md5_hex("DESCRIBE:rtsp://h/stream");
        let response = md5_hex(&format!("{ha1}:nonce:{ha2}"));
        assert_eq!(response.len(), 32);
        assert_eq!(response, md5_hex(&format!("{ha1}:nonce:{ha2}")));
    }

    #[test]
    fn test_server_port_parse() {
        assert_eq!(
            parse_server_ports(Some("RTP/AVP;unicast;server_port=5000-5001")),
            Some((5_000, 5_001))
        );
        assert_eq!(parse_server_ports(Some("RTP/AVP;unicast")), None);
        assert_eq!(parse_server_ports(None), None);
    }

    #[test]
    fn test_resolve_control() {
        assert_eq!(
            resolve_control("rtsp://h/cam", "trackID=1"),
            "rtsp://h/cam/trackID=1"
        );
        assert_eq!(
            resolve_control("rtsp://h/cam", "rtsp://h/cam/track2"),
            "rtsp://h/cam/track2"
        );
        assert_eq!(resolve_control("rtsp://h/cam", "*"), "rtsp://h/cam");
    }

    #[test]
    fn test_build_track_from_sdp() {
        let media = SdpMedia {
            kind: MediaKind::Audio,
            codec: CodecId::Opus,
            payload_type: 97,
            clock_rate: 48_000,
            channels: 2,
            control: "trackID=1".into(),
            parameter_sets: None,
        };
        let track = build_track(1, &media);
        assert_eq!(track.codec, CodecId::Opus);
        assert_eq!(track.timebase, Timebase::rtp(48_000));
        assert_eq!(track.audio.unwrap().channels, 2);
    }

    #[test]
    fn test_pipeline_ingest_produces_ordered_packets() {
        let mut pipeline = TrackPipeline {
            track_id: 0,
            timebase: Timebase::rtp(90_000),
            jitter: JitterBuffer::new(4),
            depacketizer: Depacketizer::H264(H264Depacketizer::new()),
            extender: TimestampExtender::rtp(),
            ssrc: 0,
            is_video: true,
        };
        let mut out = Vec::new();
        // Two single-NAL keyframe packets, out of order.
        let make = |seq: u16, ts: u32| {
            let mut data = vec![
                0x80, 0xE0, 0, 0, 0, 0, 0, 0, 0xAA, 0xBB, 0xCC, 0xDD, 0x65, 0x01,
            ];
            data[2..4].copy_from_slice(&seq.to_be_bytes());
            data[4..8].copy_from_slice(&ts.to_be_bytes());
            data
        };
        pipeline.ingest(&make(1, 0), &mut out);
        pipeline.ingest(&make(2, 3_000), &mut out);
        assert_eq!(out.len(), 2);
        assert!(out[0].flags.keyframe);
        assert!(out[0].dts < out[1].dts);
        assert_eq!(out[1].dts, 3_000);
    }
}
