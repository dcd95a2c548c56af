//! Offer/answer flows
//!
//! Three ways into a session:
//! - `request`: the server offers, the peer answers later through `answer`
//! - `answer`: completes a pending server offer by session id
//! - `offer`: the peer offers and gets an answer back in one round trip
//!
//! Candidates are not trickled; every local description is returned only
//! once gathering has finished, bounded by the configured timeout.

use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;

use camstream_protocol::{AnswerResponse, OfferResponse, SessionDescription};

use super::ice::{merge_ice_servers, IceServer};
use super::registry::SessionRegistry;
use super::session::{ClientSession, NegotiationState};
use super::transport::{PeerEvent, PeerEventHandler, Transport};

pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("No client found")]
    NotFound(String),

    #[error("Not complete")]
    Incomplete,

    #[error("{0}")]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Always offered to peers
    pub ice_servers: Vec<IceServer>,
    /// Ignore `ice_servers` supplied in requests
    pub disable_client_ice: bool,
    pub gather_timeout: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            disable_client_ice: false,
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct Negotiator {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    config: Arc<NegotiatorConfig>,
}

impl Negotiator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        config: NegotiatorConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Server-initiated offer
    pub async fn request(&self, ice_hints: &[Value]) -> Result<OfferResponse, NegotiationError> {
        let session = self.new_session(ice_hints).await?;
        tracing::info!(session = %session.id(), "Stream requested");

        match self.create_offer(&session).await {
            Ok(description) => {
                tracing::debug!(session = %session.id(), sdp = %description.sdp, "Local SDP offer");
                Ok(OfferResponse {
                    id: session.id().to_string(),
                    description,
                    ice_servers: session.ice_servers(),
                })
            }
            Err(e) => {
                self.discard(&session, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Apply the peer's answer to a pending server offer
    pub async fn answer(&self, id: &str, sdp: &str) -> Result<(), NegotiationError> {
        let session = self
            .registry
            .find(id)
            .ok_or_else(|| NegotiationError::NotFound(id.to_string()))?;

        tracing::info!(session = %session.id(), "Answer received");
        tracing::debug!(session = %session.id(), sdp, "Remote SDP answer");

        let result: Result<(), NegotiationError> = async {
            let _negotiating = session.negotiation_lock().lock().await;
            session
                .connection()
                .set_remote_description(SessionDescription::answer(sdp))
                .await?;
            session.start_streaming();
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            self.discard(&session, &e.to_string()).await;
        }
        result
    }

    /// Client-initiated offer
    pub async fn offer(
        &self,
        sdp: &str,
        ice_hints: &[Value],
    ) -> Result<AnswerResponse, NegotiationError> {
        let session = self.new_session(ice_hints).await?;
        tracing::info!(session = %session.id(), "Offer received");
        tracing::debug!(session = %session.id(), sdp, "Remote SDP offer");

        match self.create_answer(&session, sdp).await {
            Ok(description) => {
                tracing::debug!(session = %session.id(), sdp = %description.sdp, "Local SDP answer");
                Ok(AnswerResponse {
                    description,
                    ice_servers: session.ice_servers(),
                })
            }
            Err(e) => {
                self.discard(&session, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Remove every session and close its connection
    pub async fn shutdown(&self) {
        for session in self.registry.drain() {
            session.close().await;
        }
    }

    async fn new_session(&self, ice_hints: &[Value]) -> Result<Arc<ClientSession>, NegotiationError> {
        let ice_servers = merge_ice_servers(
            &self.config.ice_servers,
            ice_hints,
            self.config.disable_client_ice,
        );
        let connection = self.transport.connect(ice_servers).await?;
        let session = Arc::new(ClientSession::new(connection.clone()));

        connection.on_event(event_handler(
            Arc::downgrade(&session),
            Arc::downgrade(&self.registry),
        ));
        self.registry.insert(session.clone());
        Ok(session)
    }

    async fn attach_video(&self, session: &ClientSession) -> Result<(), NegotiationError> {
        let track = session.connection().add_video_track().await?;
        session.attach_video(track);
        Ok(())
    }

    async fn create_offer(&self, session: &ClientSession) -> Result<SessionDescription, NegotiationError> {
        self.attach_video(session).await?;

        let _negotiating = session.negotiation_lock().lock().await;
        session.connection().set_local_description().await?;
        self.complete_gathering(session).await
    }

    async fn create_answer(
        &self,
        session: &ClientSession,
        sdp: &str,
    ) -> Result<SessionDescription, NegotiationError> {
        self.attach_video(session).await?;
        session.start_streaming();

        let _negotiating = session.negotiation_lock().lock().await;
        session
            .connection()
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        session.connection().set_local_description().await?;
        self.complete_gathering(session).await
    }

    async fn complete_gathering(
        &self,
        session: &ClientSession,
    ) -> Result<SessionDescription, NegotiationError> {
        if !session.wait_for_gathering(self.config.gather_timeout).await {
            tracing::warn!(
                session = %session.id(),
                "ICE gathering did not complete within {:?}",
                self.config.gather_timeout
            );
            session.set_state(NegotiationState::TimedOut);
            return Err(NegotiationError::Incomplete);
        }

        session
            .connection()
            .local_description()
            .await
            .ok_or(NegotiationError::Incomplete)
    }

    async fn discard(&self, session: &ClientSession, reason: &str) {
        if let Some(removed) = self.registry.remove(session.id(), reason) {
            removed.close().await;
        }
    }
}

/// Engine callbacks hold only weak references; events for a session that is
/// already gone are ignored.
fn event_handler(session: Weak<ClientSession>, registry: Weak<SessionRegistry>) -> PeerEventHandler {
    Arc::new(move |event| {
        let session = session.clone();
        let registry = registry.clone();

        Box::pin(async move {
            let Some(session) = session.upgrade() else {
                return;
            };

            match event {
                PeerEvent::StateChange(state) => {
                    tracing::debug!(session = %session.id(), ?state, "Peer connection state");
                    session.on_peer_state(state);

                    if state.is_terminal() {
                        let removed = registry
                            .upgrade()
                            .and_then(|registry| registry.remove(session.id(), "stream closed"));
                        if let Some(removed) = removed {
                            // closing re-enters the engine's state callbacks
                            tokio::spawn(async move { removed.close().await });
                        }
                    }
                }
                PeerEvent::GatheringStateChange(state) => {
                    tracing::debug!(session = %session.id(), ?state, "ICE gathering state");
                    session.on_gathering_state(state);
                }
                PeerEvent::SignalingStateChange(state) => {
                    tracing::debug!(session = %session.id(), state = %state, "Signaling state");
                }
                PeerEvent::LocalDescription(description) => {
                    tracing::debug!(session = %session.id(), sdp_type = %description.sdp_type, "Local description");
                }
                PeerEvent::Track(mid) => {
                    tracing::debug!(session = %session.id(), mid = %mid, "Track");
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::CountingDevice;
    use crate::capture::Frame;
    use crate::webrtc::transport::mock::{Gathering, MockTransport};
    use crate::webrtc::transport::PeerState;
    use camstream_protocol::{IceServerKind, SdpType};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn negotiator(transport: Arc<MockTransport>, config: NegotiatorConfig) -> Negotiator {
        Negotiator::new(Arc::new(SessionRegistry::new()), transport, config)
    }

    fn fast_config() -> NegotiatorConfig {
        NegotiatorConfig {
            gather_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_request_returns_offer() {
        let transport = Arc::new(MockTransport::new(Gathering::Immediate));
        let negotiator = negotiator(transport.clone(), fast_config());

        let response = negotiator.request(&[]).await.unwrap();

        assert!(response.id.starts_with("rtc-"));
        assert_eq!(response.description.sdp_type, SdpType::Offer);
        assert!(!response.description.sdp.is_empty());
        let session = negotiator.registry().find(&response.id).unwrap();
        assert_eq!(session.state(), NegotiationState::Complete);
        assert!(transport.last().unwrap().mock_track().is_some());
    }

    #[tokio::test]
    async fn test_request_timeout_removes_session() {
        let transport = Arc::new(MockTransport::new(Gathering::Stall));
        let negotiator = negotiator(transport.clone(), fast_config());

        let err = negotiator.request(&[]).await.unwrap_err();

        assert!(matches!(err, NegotiationError::Incomplete));
        assert_eq!(err.to_string(), "Not complete");
        assert!(negotiator.registry().is_empty());
        assert!(transport.last().unwrap().closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_answer_unknown_session() {
        let transport = Arc::new(MockTransport::new(Gathering::Immediate));
        let negotiator = negotiator(transport, fast_config());

        let err = negotiator.answer("rtc-unknown", "v=0").await.unwrap_err();
        assert!(matches!(err, NegotiationError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_answer_starts_streaming() {
        let transport = Arc::new(MockTransport::new(Gathering::Immediate));
        let negotiator = negotiator(transport.clone(), fast_config());
        let response = negotiator.request(&[]).await.unwrap();

        negotiator.answer(&response.id, "v=0 answer").await.unwrap();

        let connection = transport.last().unwrap();
        let remote = connection.remote.lock().clone().unwrap();
        assert_eq!(remote.sdp_type, SdpType::Answer);
        assert_eq!(remote.sdp, "v=0 answer");
        let track = connection.mock_track().unwrap();
        assert_eq!(track.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_answer_failure_removes_session() {
        let transport = Arc::new(MockTransport::new(Gathering::Immediate));
        let negotiator = negotiator(transport.clone(), fast_config());
        let response = negotiator.request(&[]).await.unwrap();

        let connection = transport.last().unwrap();
        connection.reject_remote.store(true, Ordering::SeqCst);

        let err = negotiator.answer(&response.id, "garbage").await.unwrap_err();
        assert!(matches!(err, NegotiationError::Transport(_)));
        assert!(negotiator.registry().find(&response.id).is_none());
        assert!(connection.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_client_offer_returns_answer() {
        let transport = Arc::new(MockTransport::new(Gathering::Immediate));
        let negotiator = negotiator(transport.clone(), fast_config());

        let response = negotiator.offer("v=0 offer", &[]).await.unwrap();

        assert_eq!(response.description.sdp_type, SdpType::Answer);
        let connection = transport.last().unwrap();
        assert_eq!(connection.remote.lock().as_ref().unwrap().sdp_type, SdpType::Offer);
        assert_eq!(negotiator.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_client_offer_rejected() {
        let mut transport = MockTransport::new(Gathering::Immediate);
        transport.reject_remote = true;
        let transport = Arc::new(transport);
        let negotiator = negotiator(transport.clone(), fast_config());

        let err = negotiator.offer("bad", &[]).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid remote description");
        assert!(negotiator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_ice_hints_merged_unless_disabled() {
        let transport = Arc::new(MockTransport::new(Gathering::Immediate));
        let config = NegotiatorConfig {
            ice_servers: IceServer::parse_list("stun:default.example.org").unwrap(),
            ..fast_config()
        };
        let negotiator = negotiator(transport.clone(), config.clone());
        let hints = [json!("turn:relay.example.org"), json!(1)];

        let response = negotiator.request(&hints).await.unwrap();
        assert_eq!(response.ice_servers.len(), 2);
        assert_eq!(response.ice_servers[1].kind, IceServerKind::Turn);

        let negotiator = self::negotiator(
            transport.clone(),
            NegotiatorConfig {
                disable_client_ice: true,
                ..config
            },
        );
        let response = negotiator.request(&hints).await.unwrap();
        assert_eq!(response.ice_servers.len(), 1);
        assert_eq!(response.ice_servers[0].hostname, "default.example.org");
    }

    #[tokio::test]
    async fn test_connected_session_receives_frames_until_closed() {
        let transport = Arc::new(MockTransport::new(Gathering::Immediate));
        let negotiator = negotiator(transport.clone(), fast_config());
        let response = negotiator.request(&[]).await.unwrap();
        negotiator.answer(&response.id, "v=0").await.unwrap();

        let registry = negotiator.registry().clone();
        let connection = transport.last().unwrap();
        assert!(!registry.any_wants_frame());

        connection.transition(PeerState::Connected).await;
        assert!(registry.any_wants_frame());

        let device = CountingDevice::default();
        registry.dispatch(&Frame::new(&[1], false, &device));
        registry.dispatch(&Frame::new(&[2], true, &device));
        let track = connection.mock_track().unwrap();
        assert_eq!(track.sent_count(), 1);
        assert_eq!(device.requests(), 1);

        connection.transition(PeerState::Disconnected).await;
        assert!(registry.is_empty());
        assert!(!registry.any_wants_frame());

        // the close is spawned from the callback
        for _ in 0..50 {
            if connection.closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(connection.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_events_after_removal_are_ignored() {
        let transport = Arc::new(MockTransport::new(Gathering::Immediate));
        let negotiator = negotiator(transport.clone(), fast_config());
        let response = negotiator.request(&[]).await.unwrap();
        let connection = transport.last().unwrap();

        let id = negotiator.registry().find(&response.id).unwrap().id().clone();
        negotiator.registry().remove(&id, "test");

        // the session is gone, the weak handle no longer resolves
        connection.transition(PeerState::Failed).await;
        assert!(negotiator.registry().is_empty());
        assert!(!connection.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let transport = Arc::new(MockTransport::new(Gathering::Immediate));
        let negotiator = negotiator(transport.clone(), fast_config());
        negotiator.request(&[]).await.unwrap();
        negotiator.request(&[]).await.unwrap();

        negotiator.shutdown().await;

        assert!(negotiator.registry().is_empty());
        for connection in transport.connections.lock().iter() {
            assert!(connection.closed.load(Ordering::SeqCst));
        }
    }
}
