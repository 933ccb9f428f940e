//! Engine configuration
//!
//! Every field has a default, so an empty configuration file yields a working
//! 2-channel node with id 1.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use zwave_protocol::{ChannelProfile, HomeId, NodeId, Speed};

use crate::error::{Result, TxError};

/// Transmission engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_node_id")]
    pub node_id: u16,

    #[serde(default)]
    pub home_id: HomeId,

    #[serde(default)]
    pub profile: ChannelProfile,

    /// Speed tried first for classic destinations
    #[serde(default = "default_speed")]
    pub default_speed: Speed,

    /// Number of transmit queue elements
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Retransmissions of one route at one speed before downgrading
    #[serde(default = "default_retries_per_route")]
    pub retries_per_route: u8,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub beam: BeamConfig,

    #[serde(default)]
    pub explore: ExploreConfig,

    /// Interval between route cache flushes to storage
    #[serde(default = "default_persist_interval")]
    pub persist_interval_ms: u64,

    /// Transmit power announced in long-range headers (dBm)
    #[serde(default = "default_lr_tx_power")]
    pub lr_tx_power_dbm: i8,
}

/// Acknowledgement and back-off timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// ACK wait after a direct frame
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Routed ACK wait, per hop
    #[serde(default = "default_routed_ack_timeout")]
    pub routed_ack_timeout_per_hop_ms: u64,

    /// Busy-channel retransmissions stop once this much time has passed
    #[serde(default = "default_lbt_window")]
    pub lbt_window_ms: u64,

    /// Pause after a routed ACK at 9.6k
    #[serde(default = "default_pause_9600")]
    pub routed_ack_pause_9600_ms: u64,

    /// Pause after a routed ACK at 40k and 100k
    #[serde(default = "default_pause_fast")]
    pub routed_ack_pause_ms: u64,
}

/// Wake-up beam timing for FLiRS destinations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeamConfig {
    /// Period of one fragment in a fragmented beam train
    #[serde(default = "default_fragment_period")]
    pub fragment_period_ms: u64,

    /// Air time of one fragment, including start-up and LBT
    #[serde(default = "default_fragment_air_time")]
    pub fragment_air_time_ms: u64,

    /// 3-channel train duration
    #[serde(default = "default_train_3ch")]
    pub train_3ch_ms: u64,

    /// Long-range train duration
    #[serde(default = "default_train_lr")]
    pub train_lr_ms: u64,
}

/// Explore frame fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploreConfig {
    #[serde(default = "default_explore_enabled")]
    pub enabled: bool,

    #[serde(default = "default_explore_ttl")]
    pub ttl: u8,

    /// Rebroadcast window in 2 ms ticks
    #[serde(default = "default_explore_interval")]
    pub random_interval: u8,

    #[serde(default = "default_explore_timeout")]
    pub result_timeout_ms: u64,

    #[serde(default = "default_explore_speed")]
    pub speed: Speed,
}

fn default_node_id() -> u16 {
    1
}

fn default_speed() -> Speed {
    Speed::Kbps100
}

fn default_queue_capacity() -> usize {
    4
}

fn default_retries_per_route() -> u8 {
    2
}

fn default_persist_interval() -> u64 {
    5000
}

fn default_lr_tx_power() -> i8 {
    14
}

fn default_ack_timeout() -> u64 {
    40
}

fn default_routed_ack_timeout() -> u64 {
    626
}

fn default_lbt_window() -> u64 {
    1200
}

fn default_pause_9600() -> u64 {
    60
}

fn default_pause_fast() -> u64 {
    15
}

fn default_fragment_period() -> u64 {
    200
}

fn default_fragment_air_time() -> u64 {
    110
}

fn default_train_3ch() -> u64 {
    3000
}

fn default_train_lr() -> u64 {
    2000
}

fn default_explore_enabled() -> bool {
    true
}

fn default_explore_ttl() -> u8 {
    zwave_protocol::explore::EXPLORE_TTL_DEFAULT
}

fn default_explore_interval() -> u8 {
    zwave_protocol::explore::EXPLORE_RANDOM_INTERVAL_DEFAULT
}

fn default_explore_timeout() -> u64 {
    4000
}

fn default_explore_speed() -> Speed {
    Speed::Kbps40
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            node_id: default_node_id(),
            home_id: HomeId::default(),
            profile: ChannelProfile::default(),
            default_speed: default_speed(),
            queue_capacity: default_queue_capacity(),
            retries_per_route: default_retries_per_route(),
            timing: TimingConfig::default(),
            beam: BeamConfig::default(),
            explore: ExploreConfig::default(),
            persist_interval_ms: default_persist_interval(),
            lr_tx_power_dbm: default_lr_tx_power(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            ack_timeout_ms: default_ack_timeout(),
            routed_ack_timeout_per_hop_ms: default_routed_ack_timeout(),
            lbt_window_ms: default_lbt_window(),
            routed_ack_pause_9600_ms: default_pause_9600(),
            routed_ack_pause_ms: default_pause_fast(),
        }
    }
}

impl Default for BeamConfig {
    fn default() -> Self {
        BeamConfig {
            fragment_period_ms: default_fragment_period(),
            fragment_air_time_ms: default_fragment_air_time(),
            train_3ch_ms: default_train_3ch(),
            train_lr_ms: default_train_lr(),
        }
    }
}

impl Default for ExploreConfig {
    fn default() -> Self {
        ExploreConfig {
            enabled: default_explore_enabled(),
            ttl: default_explore_ttl(),
            random_interval: default_explore_interval(),
            result_timeout_ms: default_explore_timeout(),
            speed: default_explore_speed(),
        }
    }
}

impl EngineConfig {
    pub fn node_id(&self) -> Result<NodeId> {
        NodeId::new(self.node_id).map_err(|e| TxError::InvalidConfig(e.to_string()))
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let node = self.node_id()?;
        if node.is_long_range() != (self.profile == ChannelProfile::LongRange) {
            return Err(TxError::InvalidConfig(format!(
                "node id {} does not match the {:?} profile",
                node, self.profile
            )));
        }
        if self.queue_capacity < 3 {
            return Err(TxError::InvalidConfig(format!(
                "queue_capacity must be at least 3, got {}",
                self.queue_capacity
            )));
        }
        if self.default_speed == Speed::Kbps100Lr {
            return Err(TxError::InvalidConfig(
                "default_speed must be a classic speed".to_string(),
            ));
        }
        if self.beam.fragment_air_time_ms > self.beam.fragment_period_ms {
            return Err(TxError::InvalidConfig(
                "beam fragment air time exceeds the fragment period".to_string(),
            ));
        }
        if self.explore.ttl > 0x0F {
            return Err(TxError::InvalidConfig(format!(
                "explore ttl {} does not fit in 4 bits",
                self.explore.ttl
            )));
        }
        Ok(())
    }

    /// Fragments in one beam train for the configured profile
    pub fn beam_fragments(&self) -> u32 {
        let train = match self.profile {
            ChannelProfile::TwoChannel => return 0,
            ChannelProfile::ThreeChannel => self.beam.train_3ch_ms,
            ChannelProfile::LongRange => self.beam.train_lr_ms,
        };
        (train / self.beam.fragment_period_ms.max(1)) as u32
    }

    /// Silence between two fragments of a beam train
    pub fn beam_gap(&self) -> Duration {
        Duration::from_millis(
            self.beam
                .fragment_period_ms
                .saturating_sub(self.beam.fragment_air_time_ms),
        )
    }

    /// Collision-avoidance pause after a routed ACK at `speed`
    pub fn routed_ack_pause(&self, speed: Speed) -> Duration {
        match speed {
            Speed::Kbps9_6 => Duration::from_millis(self.timing.routed_ack_pause_9600_ms),
            _ => Duration::from_millis(self.timing.routed_ack_pause_ms),
        }
    }

    /// ACK wait for a frame travelling over `repeaters` hops
    pub fn ack_timeout(&self, repeaters: usize) -> Duration {
        if repeaters == 0 {
            Duration::from_millis(self.timing.ack_timeout_ms)
        } else {
            Duration::from_millis(
                self.timing.routed_ack_timeout_per_hop_ms * (repeaters as u64 + 1),
            )
        }
    }
}
