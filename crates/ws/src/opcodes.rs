//! Frame opcodes.
//!
//! The deployment fixes the opcode width to one byte. Values below
//! [`RESPONSE_THRESHOLD`] are requests; everything at or above it is a
//! response or server-initiated notification.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// First opcode value reserved for responses and notifications.
pub const RESPONSE_THRESHOLD: u8 = 0x80;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    // Requests.
    Ping = 0x01,
    Handshake = 0x02,
    GetBlock = 0x10,
    GetBlockWitnesses = 0x11,
    GetEpoch = 0x12,
    GetChainTip = 0x13,
    SubscribeBlocks = 0x20,
    SubscribeEpochs = 0x21,
    SubscribeMempool = 0x22,
    Unsubscribe = 0x23,

    // Responses.
    Pong = 0x81,
    HandshakeAck = 0x82,
    BlockResponse = 0x90,
    BlockWitnessesResponse = 0x91,
    EpochResponse = 0x92,
    ChainTipResponse = 0x93,
    SubscribeAck = 0xa0,
    UnsubscribeAck = 0xa1,
    Error = 0xe0,

    // Notifications.
    NewBlockNotification = 0xf0,
    EpochFinalizedNotification = 0xf1,
    MempoolTxNotification = 0xf2,
}

impl Opcode {
    pub fn is_request(&self) -> bool {
        u8::from(*self) < RESPONSE_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitioning() {
        assert!(Opcode::Ping.is_request());
        assert!(Opcode::SubscribeBlocks.is_request());
        assert!(!Opcode::Pong.is_request());
        assert!(!Opcode::Error.is_request());
        assert!(!Opcode::NewBlockNotification.is_request());
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert!(Opcode::try_from(0x7fu8).is_err());
        assert_eq!(Opcode::try_from(0x01u8).unwrap(), Opcode::Ping);
    }
}
