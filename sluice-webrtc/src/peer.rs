use {
    crate::{config::WebRtcConfig, errors::WebRtcError},
    std::sync::Arc,
    webrtc::{
        api::{
            interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
            APIBuilder,
        },
        ice_transport::ice_server::RTCIceServer,
        interceptor::registry::Registry,
        peer_connection::{
            configuration::RTCConfiguration, sdp::session_description::RTCSessionDescription,
            RTCPeerConnection,
        },
    },
};

/// Build one peer connection with the default codec set (H.264, VP8,
/// Opus) and the default interceptor stack, which carries the NACK
/// responder with its retransmission buffer and RTCP report generation.
pub async fn new_peer(config: &WebRtcConfig) -> Result<Arc<RTCPeerConnection>, WebRtcError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: config.ice_servers.clone(),
            ..Default::default()
        }],
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(rtc_config).await?))
}

/// Run the offer/answer exchange for an incoming SDP offer: returns the
/// answer once ICE candidate gathering has completed, so WHIP/WHEP can
/// respond with a complete SDP in one round trip.
pub async fn answer_offer(
    peer: &Arc<RTCPeerConnection>,
    offer_sdp: String,
) -> Result<String, WebRtcError> {
    let offer = RTCSessionDescription::offer(offer_sdp)?;
    peer.set_remote_description(offer).await?;

    let answer = peer.create_answer(None).await?;
    let mut gather_complete = peer.gathering_complete_promise().await;
    peer.set_local_description(answer).await?;
    let _ = gather_complete.recv().await;

    peer.local_description()
        .await
        .map(|d| d.sdp)
        .ok_or(WebRtcError::NoLocalDescription)
}
