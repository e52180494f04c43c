#![forbid(unsafe_code)]

// Server configuration - worker pool sizing, RTC port range, transport policy

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};
use std::str::FromStr;
use tracing::warn;

/// All recognized options, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the media worker pool.
    pub num_workers: usize,
    /// UDP port range handed to each worker for RTP/RTCP allocation.
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Local address transports bind to.
    pub listen_ip: IpAddr,
    /// Reachable address inserted into ICE candidates. Required when peers
    /// connect across NAT.
    pub announced_ip: Option<String>,
    /// Per-transport outgoing bitrate policy.
    pub initial_available_outgoing_bitrate: u32,
    pub minimum_available_outgoing_bitrate: u32,
    /// Incoming bitrate ceiling applied to every transport after creation.
    pub max_incoming_bitrate: u32,
    /// Signaling (WebSocket) bind port.
    pub listen_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: 2,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: None,
            initial_available_outgoing_bitrate: 600_000,
            minimum_available_outgoing_bitrate: 100_000,
            max_incoming_bitrate: 1_500_000,
            listen_port: 4443,
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring unparseable {}={:?}", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

impl Config {
    /// Resolves configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut config = Self {
            num_workers: env_parse("NUM_WORKERS", defaults.num_workers),
            rtc_min_port: env_parse("RTC_MIN_PORT", defaults.rtc_min_port),
            rtc_max_port: env_parse("RTC_MAX_PORT", defaults.rtc_max_port),
            listen_ip: env_parse("LISTEN_IP", defaults.listen_ip),
            announced_ip: std::env::var("ANNOUNCED_IP").ok(),
            initial_available_outgoing_bitrate: env_parse(
                "INITIAL_AVAILABLE_OUTGOING_BITRATE",
                defaults.initial_available_outgoing_bitrate,
            ),
            minimum_available_outgoing_bitrate: env_parse(
                "MINIMUM_AVAILABLE_OUTGOING_BITRATE",
                defaults.minimum_available_outgoing_bitrate,
            ),
            max_incoming_bitrate: env_parse("MAX_INCOMING_BITRATE", defaults.max_incoming_bitrate),
            listen_port: env_parse("LISTEN_PORT", defaults.listen_port),
        };

        if config.num_workers == 0 {
            warn!("NUM_WORKERS=0 is not usable, using {}", defaults.num_workers);
            config.num_workers = defaults.num_workers;
        }
        if config.rtc_min_port > config.rtc_max_port {
            warn!(
                "RTC port range {}-{} is inverted, using {}-{}",
                config.rtc_min_port, config.rtc_max_port, defaults.rtc_min_port, defaults.rtc_max_port
            );
            config.rtc_min_port = defaults.rtc_min_port;
            config.rtc_max_port = defaults.rtc_max_port;
        }

        config
    }

    /// Builds the settings each pool worker is started with.
    pub fn worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = WorkerLogLevel::Warn;
        settings.log_tags = vec![
            WorkerLogTag::Info,
            WorkerLogTag::Ice,
            WorkerLogTag::Dtls,
            WorkerLogTag::Rtp,
            WorkerLogTag::Rtcp,
        ];
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }

    /// Router options carrying the fixed supported-codec set. Negotiation uses
    /// whatever the router ends up advertising; this list is input to router
    /// creation only.
    pub fn router_options(&self) -> RouterOptions {
        RouterOptions::new(media_codecs())
    }

    /// Options for one WebRTC transport. The initial outgoing budget never
    /// drops below the configured minimum.
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        let listen_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: self.listen_ip,
            announced_address: self.announced_ip.clone(),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };
        let mut options = WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(listen_info));
        options.enable_udp = true;
        options.enable_tcp = true;
        options.prefer_udp = true;
        options.initial_available_outgoing_bitrate = self
            .initial_available_outgoing_bitrate
            .max(self.minimum_available_outgoing_bitrate);
        options
    }
}

/// The fixed codec set every room router is created with: Opus, PCMU and PCMA
/// for audio; VP8, VP9 and baseline H.264 for video.
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(111),
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("minptime", 10_u32.into()),
                ("useinbandfec", 1_u32.into()),
            ]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Pcmu,
            preferred_payload_type: Some(0),
            clock_rate: NonZeroU32::new(8000).unwrap(),
            channels: NonZeroU8::new(1).unwrap(),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Pcma,
            preferred_payload_type: Some(8),
            clock_rate: NonZeroU32::new(8000).unwrap(),
            channels: NonZeroU8::new(1).unwrap(),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: Some(96),
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp9,
            preferred_payload_type: Some(98),
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: Some(102),
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("level-asymmetry-allowed", 1_u32.into()),
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
            ]),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.rtc_min_port, 40000);
        assert_eq!(config.rtc_max_port, 49999);
        assert_eq!(config.listen_ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.listen_port, 4443);
    }

    #[test]
    fn codec_set_covers_all_supported_kinds() {
        let codecs = media_codecs();
        let audio = codecs
            .iter()
            .filter(|c| matches!(c, RtpCodecCapability::Audio { .. }))
            .count();
        let video = codecs
            .iter()
            .filter(|c| matches!(c, RtpCodecCapability::Video { .. }))
            .count();
        assert_eq!(audio, 3);
        assert_eq!(video, 3);
    }

    #[test]
    fn initial_bitrate_never_below_minimum() {
        let config = Config {
            initial_available_outgoing_bitrate: 50_000,
            minimum_available_outgoing_bitrate: 100_000,
            ..Config::default()
        };
        let options = config.transport_options();
        assert_eq!(options.initial_available_outgoing_bitrate, 100_000);
    }
}
