use crate::firmware::CharacteristicRole;
use crate::protocol::{Channel, DecodeError};
use crate::session::Phase;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("session is not attached to a device")]
    NotAttached,

    #[error("session was already used (currently {0:?}), create a new one")]
    AlreadyAttached(Phase),

    #[error("the device does not expose the {0} characteristic")]
    RoleUnbound(CharacteristicRole),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed payload: {0}")]
    Decode(#[from] DecodeError),

    #[error("power {value} for channel {channel} exceeds the maximum of {max}")]
    PowerOutOfRange { channel: Channel, value: u16, max: u16 },

    #[error("no waveform has been set for channel {0}")]
    NoPendingWaveform(Channel),

    #[error("waveform burst interval must be greater than zero")]
    InvalidBurstInterval,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
