//! One browser peer receiving the camera stream

use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use camstream_protocol::IceServerDescription;

use super::transport::{GatheringState, PeerConnection, PeerState, VideoTrack};
use crate::capture::Frame;
use crate::gate::{Admission, KeyFrameGate};

/// Opaque random session token handed to the peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    const RANDOM_LEN: usize = 20;

    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..Self::RANDOM_LEN)
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect();
        Self(format!("rtc-{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Negotiation lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    Gathering,
    Complete,
    TimedOut,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationState::Disconnected | NegotiationState::Failed | NegotiationState::Closed
        )
    }
}

/// Single-shot "gathering complete" signal.
///
/// Completion may happen before anyone waits; the value is kept in the
/// channel so the waiter still sees it.
struct GatheringSignal {
    tx: Mutex<Option<oneshot::Sender<()>>>,
    rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl GatheringSignal {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Returns true the first time only
    fn complete(&self) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Wait up to `timeout`. Only one caller can ever wait.
    async fn wait(&self, timeout: Duration) -> bool {
        let Some(rx) = self.rx.lock().take() else {
            return false;
        };
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }
}

pub struct ClientSession {
    id: SessionId,
    connection: Arc<dyn PeerConnection>,
    video: Mutex<Option<Arc<dyn VideoTrack>>>,
    gate: Mutex<KeyFrameGate>,
    state: Mutex<NegotiationState>,
    gathered: GatheringSignal,
    /// Serializes the offer/answer steps for this peer
    negotiation: tokio::sync::Mutex<()>,
}

impl ClientSession {
    pub fn new(connection: Arc<dyn PeerConnection>) -> Self {
        Self::with_id(SessionId::generate(), connection)
    }

    pub fn with_id(id: SessionId, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            id,
            connection,
            video: Mutex::new(None),
            gate: Mutex::new(KeyFrameGate::new()),
            state: Mutex::new(NegotiationState::New),
            gathered: GatheringSignal::new(),
            negotiation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn video(&self) -> Option<Arc<dyn VideoTrack>> {
        self.video.lock().clone()
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: NegotiationState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(session = %self.id, from = ?*current, to = ?state, "Negotiation state");
            *current = state;
        }
    }

    pub(crate) fn negotiation_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.negotiation
    }

    pub fn ice_servers(&self) -> Vec<IceServerDescription> {
        self.connection.ice_servers()
    }

    /// Attach the outgoing track, once, while the session is being set up
    pub(crate) fn attach_video(&self, track: Arc<dyn VideoTrack>) {
        *self.video.lock() = Some(track);
    }

    /// Begin the media clock and start waiting for a fresh key frame
    pub fn start_streaming(&self) {
        self.gate.lock().reset();
        if let Some(video) = self.video() {
            video.start_streaming();
        }
    }

    /// Connected and the track accepts writes
    pub fn wants_frame(&self) -> bool {
        if self.connection.state() != PeerState::Connected {
            return false;
        }
        self.video
            .lock()
            .as_ref()
            .is_some_and(|video| video.is_open())
    }

    /// Run the key frame gate and forward the frame if admitted
    pub fn push_frame(&self, frame: &Frame<'_>) {
        let Some(video) = self.video() else {
            return;
        };

        let mut gate = self.gate.lock();
        let first_key_frame = !gate.had_key_frame();
        match gate.admit(frame.is_key_frame()) {
            Admission::Deliver => {
                if let Err(e) = video.send(bytes::Bytes::copy_from_slice(frame.data())) {
                    tracing::warn!(session = %self.id, "Failed to send frame: {}", e);
                    if first_key_frame {
                        // the peer never got its key frame; wait for the next one
                        gate.reset();
                    }
                }
            }
            Admission::Drop { request_key_frame } => {
                if request_key_frame {
                    tracing::debug!(session = %self.id, "Waiting for key frame, requesting one");
                    frame.device().force_key_frame();
                }
            }
        }
    }

    /// Called by the event handler when the engine reports gathering progress
    pub(crate) fn on_gathering_state(&self, state: GatheringState) {
        match state {
            GatheringState::New => {}
            GatheringState::InProgress => self.set_state(NegotiationState::Gathering),
            GatheringState::Complete => {
                if self.gathered.complete() {
                    let mut current = self.state.lock();
                    if matches!(*current, NegotiationState::New | NegotiationState::Gathering) {
                        *current = NegotiationState::Complete;
                    }
                }
            }
        }
    }

    pub(crate) fn on_peer_state(&self, state: PeerState) {
        match state {
            PeerState::Connected => self.set_state(NegotiationState::Connected),
            PeerState::Disconnected => self.set_state(NegotiationState::Disconnected),
            PeerState::Failed => self.set_state(NegotiationState::Failed),
            PeerState::Closed => self.set_state(NegotiationState::Closed),
            PeerState::New | PeerState::Connecting => {}
        }
    }

    /// Wait for candidate gathering, bounded by `timeout`
    pub(crate) async fn wait_for_gathering(&self, timeout: Duration) -> bool {
        if self.gathered.wait(timeout).await {
            return true;
        }
        // the engine may report completion through its state without an event
        self.connection.gathering_state() == GatheringState::Complete
    }

    /// Release the connection
    pub async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            tracing::warn!(session = %self.id, "Error closing peer connection: {}", e);
        }
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
