use anyhow::Context;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::capture::Outputs;
use crate::pull::PullSessionList;
use crate::webrtc::{
    IceServer, Negotiator, NegotiatorConfig, RtcTransport, SessionRegistry, Transport,
    DEFAULT_GATHER_TIMEOUT, DEFAULT_VIDEO_PAYLOAD_TYPE,
};

pub const DEFAULT_MAX_JSON_BODY: usize = 10 * 1024;
pub const DEFAULT_STREAM_MAX_PAYLOAD: usize = 2_000_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub ice_servers: Vec<IceServer>,
    pub disable_client_ice: bool,
    pub gather_timeout: Duration,
    pub max_json_body: usize,
    /// Annex-B source; `-` reads stdin
    pub h264_input: Option<String>,
    pub stream_max_payload: usize,
    pub video_payload_type: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            ice_servers: Vec::new(),
            disable_client_ice: false,
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
            max_json_body: DEFAULT_MAX_JSON_BODY,
            h264_input: None,
            stream_max_payload: DEFAULT_STREAM_MAX_PAYLOAD,
            video_payload_type: DEFAULT_VIDEO_PAYLOAD_TYPE,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Config::default();

        let bind_address = lookup("BIND_ADDRESS").unwrap_or(defaults.bind_address);

        let ice_servers = match lookup("ICE_SERVERS") {
            Some(list) => IceServer::parse_list(&list).context("invalid ICE_SERVERS")?,
            None => defaults.ice_servers,
        };

        let disable_client_ice = parse_var(&lookup, "DISABLE_CLIENT_ICE")?
            .unwrap_or(defaults.disable_client_ice);

        let gather_timeout = parse_var::<u64>(&lookup, "GATHER_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.gather_timeout);

        let max_json_body =
            parse_var(&lookup, "MAX_JSON_BODY")?.unwrap_or(defaults.max_json_body);

        let h264_input = lookup("H264_INPUT").filter(|s| !s.trim().is_empty());

        let stream_max_payload =
            parse_var(&lookup, "STREAM_MAX_PAYLOAD")?.unwrap_or(defaults.stream_max_payload);

        let video_payload_type =
            parse_var(&lookup, "VIDEO_PAYLOAD_TYPE")?.unwrap_or(defaults.video_payload_type);

        if ice_servers.is_empty() {
            tracing::debug!("No default ICE servers configured");
        }

        Ok(Config {
            bind_address,
            ice_servers,
            disable_client_ice,
            gather_timeout,
            max_json_body,
            h264_input,
            stream_max_payload,
            video_payload_type,
        })
    }

    fn negotiator_config(&self) -> NegotiatorConfig {
        NegotiatorConfig {
            ice_servers: self.ice_servers.clone(),
            disable_client_ice: self.disable_client_ice,
            gather_timeout: self.gather_timeout,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid {key}: {value:?}"))
        })
        .transpose()
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub pulls: Arc<PullSessionList>,
    pub negotiator: Negotiator,
}

impl AppState {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let pulls = Arc::new(PullSessionList::new());
        let negotiator = Negotiator::new(registry.clone(), transport, config.negotiator_config());

        Self {
            config: Arc::new(config),
            registry,
            pulls,
            negotiator,
        }
    }

    /// State backed by the webrtc-rs engine
    pub fn with_rtc(config: Config) -> anyhow::Result<Self> {
        let transport = RtcTransport::new(config.video_payload_type)
            .context("failed to set up the WebRTC engine")?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    /// Every sink the capture source feeds
    pub fn outputs(&self) -> Outputs {
        Outputs::new()
            .with_sink(self.registry.clone())
            .with_sink(self.pulls.clone())
    }

    /// Remove every session and close its connection
    pub async fn shutdown(&self) {
        self.negotiator.shutdown().await;
    }
}
