use crate::error::FailureReason;

/// Init: `0x90 count key_1 … key_count`.
pub const INIT: u8 = 0x90;
/// Init acknowledged: exactly `[0x91]`.
pub const INIT_ACK: u8 = 0x91;
/// Send-Message: `0x92 id payload…`.
pub const SEND_MESSAGE: u8 = 0x92;
/// Message from a node: `0x93 id payload…`.
pub const MESSAGE_RECEIVED: u8 = 0x93;
/// Message delivered: `0x94 id`.
pub const MESSAGE_SENT_ACK: u8 = 0x94;
/// Id busy: `0x70 id`.
pub const BUSY: u8 = 0x70;
/// Invalid size: `0x71 id`.
pub const INVALID_SIZE: u8 = 0x71;
/// Invalid id: `0x72 id`.
pub const INVALID_ID: u8 = 0x72;
/// Node did not acknowledge: `0x73 id`.
pub const NO_ACK: u8 = 0x73;

/// Length of an endpoint key.
pub const KEY_LEN: usize = 16;

/// Map a failure opcode to its reason.
pub fn failure_reason(opcode: u8) -> Option<FailureReason> {
    match opcode {
        BUSY => Some(FailureReason::Busy),
        INVALID_SIZE => Some(FailureReason::InvalidSize),
        INVALID_ID => Some(FailureReason::InvalidId),
        NO_ACK => Some(FailureReason::NoAck),
        _ => None,
    }
}

/// Opcode the bus master uses to report `reason`, if it has one.
///
/// [`FailureReason::Timeout`] is local and never appears on the wire.
pub fn failure_opcode(reason: FailureReason) -> Option<u8> {
    match reason {
        FailureReason::Busy => Some(BUSY),
        FailureReason::InvalidSize => Some(INVALID_SIZE),
        FailureReason::InvalidId => Some(INVALID_ID),
        FailureReason::NoAck => Some(NO_ACK),
        FailureReason::Timeout => None,
    }
}

/// True for opcodes that appear in replies from the bus master.
pub fn is_known_reply(opcode: u8) -> bool {
    matches!(opcode, INIT_ACK | MESSAGE_RECEIVED | MESSAGE_SENT_ACK)
        || failure_reason(opcode).is_some()
}
