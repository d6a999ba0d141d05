use crate::firmware::{CharacteristicRole, BURST_INTERVAL_MS, BURST_TICKS};
use crate::protocol::Channel;
use std::time::Duration;

/// Which waveform characteristic a channel's burst is written to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BurstRouting {
    /// Channel A's buffer goes to the waveform B characteristic and vice
    /// versa. This is what the reference client does.
    #[default]
    Crossed,
    Direct,
}

impl BurstRouting {
    pub fn target(self, channel: Channel) -> CharacteristicRole {
        let channel = match self {
            BurstRouting::Crossed => channel.opposite(),
            BurstRouting::Direct => channel,
        };
        match channel {
            Channel::A => CharacteristicRole::WaveformA,
            Channel::B => CharacteristicRole::WaveformB,
        }
    }
}

/// How power writes above the device maximum are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PowerLimit {
    /// Send as is. The codec masks to 11 bits, so large values wrap around.
    Unchecked,
    Clamp,
    #[default]
    Reject,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub burst_ticks: usize,
    pub burst_interval: Duration,
    pub burst_routing: BurstRouting,
    pub power_limit: PowerLimit,
    /// Capacity of the event broadcast channel. Slow receivers lag past this.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            burst_ticks: BURST_TICKS,
            burst_interval: Duration::from_millis(BURST_INTERVAL_MS),
            burst_routing: BurstRouting::default(),
            power_limit: PowerLimit::default(),
            event_capacity: 64,
        }
    }
}

#[test]
fn test_burst_routing() {
    assert_eq!(BurstRouting::Crossed.target(Channel::A), CharacteristicRole::WaveformB);
    assert_eq!(BurstRouting::Crossed.target(Channel::B), CharacteristicRole::WaveformA);
    assert_eq!(BurstRouting::Direct.target(Channel::A), CharacteristicRole::WaveformA);
    assert_eq!(BurstRouting::Direct.target(Channel::B), CharacteristicRole::WaveformB);
}

#[test]
fn test_defaults() {
    let config = SessionConfig::default();
    assert_eq!(config.burst_ticks, 50);
    assert_eq!(config.burst_interval, Duration::from_millis(100));
    assert_eq!(config.burst_routing, BurstRouting::Crossed);
    assert_eq!(config.power_limit, PowerLimit::Reject);
}
