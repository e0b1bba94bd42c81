//! Single-opcode datagram codec shared by every actuator endpoint.
//!
//! Each datagram carries exactly one command. The first byte is the opcode;
//! the remaining bytes are the opcode's fixed payload:
//!
//! | Opcode | Command | Payload |
//! |---|---|---|
//! | `0x00` | [`ActuatorCommand::Relinquish`] | none |
//! | `0x01` | [`ActuatorCommand::Claim`] | none |
//! | `0x20` | [`ActuatorCommand::Gaze`] | `x`, `y` (one byte each) |
//! | `0x30` | [`ActuatorCommand::LeftEyelid`] | `position` (one byte) |
//! | `0x31` | [`ActuatorCommand::RightEyelid`] | `position` (one byte) |
//! | `0x40..=0x45` | [`ActuatorCommand::BlinkStart`] / [`ActuatorCommand::BlinkEnd`] (left, right, both; start on even) | none |
//! | `0x50` | [`ActuatorCommand::Mouth`] | `position` (one byte) |

use bytes::{BufMut, Bytes, BytesMut};
use headctl_types::{ActuatorCommand, HeadError};

/// Longest datagram the codec produces (opcode + gaze payload).
pub const MAX_DATAGRAM_LEN: usize = 3;

/// Payload length for `opcode`, or `None` when the opcode is unknown.
pub fn payload_len(opcode: u8) -> Option<usize> {
    match opcode {
        ActuatorCommand::OP_RELINQUISH | ActuatorCommand::OP_CLAIM => Some(0),
        ActuatorCommand::OP_GAZE => Some(2),
        ActuatorCommand::OP_LEFT_EYELID
        | ActuatorCommand::OP_RIGHT_EYELID
        | ActuatorCommand::OP_MOUTH => Some(1),
        op if ActuatorCommand::blink_from_opcode(op).is_some() => Some(0),
        _ => None,
    }
}

/// Encode `command` into a datagram.
pub fn encode(command: &ActuatorCommand) -> Bytes {
    let mut buf = BytesMut::with_capacity(MAX_DATAGRAM_LEN);
    buf.put_u8(command.opcode());
    match *command {
        ActuatorCommand::Gaze { x, y } => {
            buf.put_u8(x);
            buf.put_u8(y);
        }
        ActuatorCommand::Mouth { position }
        | ActuatorCommand::LeftEyelid { position }
        | ActuatorCommand::RightEyelid { position } => buf.put_u8(position),
        ActuatorCommand::Relinquish
        | ActuatorCommand::Claim
        | ActuatorCommand::BlinkStart { .. }
        | ActuatorCommand::BlinkEnd { .. } => {}
    }
    buf.freeze()
}

/// Decode a datagram into a command.
///
/// # Errors
///
/// Returns [`HeadError::MalformedPacket`] for an empty datagram, an unknown
/// opcode, or a payload whose length does not match the opcode's arity.
pub fn decode(datagram: &[u8]) -> Result<ActuatorCommand, HeadError> {
    let (&opcode, payload) = datagram
        .split_first()
        .ok_or_else(|| HeadError::MalformedPacket("empty datagram".to_string()))?;

    let expected = payload_len(opcode)
        .ok_or_else(|| HeadError::MalformedPacket(format!("unknown opcode 0x{opcode:02x}")))?;

    if payload.len() != expected {
        return Err(HeadError::MalformedPacket(format!(
            "opcode 0x{opcode:02x} expects {expected} payload byte(s), got {}",
            payload.len()
        )));
    }

    let command = match (opcode, payload) {
        (ActuatorCommand::OP_RELINQUISH, []) => ActuatorCommand::Relinquish,
        (ActuatorCommand::OP_CLAIM, []) => ActuatorCommand::Claim,
        (ActuatorCommand::OP_GAZE, &[x, y]) => ActuatorCommand::Gaze { x, y },
        (ActuatorCommand::OP_LEFT_EYELID, &[position]) => ActuatorCommand::LeftEyelid { position },
        (ActuatorCommand::OP_RIGHT_EYELID, &[position]) => {
            ActuatorCommand::RightEyelid { position }
        }
        (ActuatorCommand::OP_MOUTH, &[position]) => ActuatorCommand::Mouth { position },
        (op, []) => ActuatorCommand::blink_from_opcode(op).ok_or_else(|| {
            HeadError::MalformedPacket(format!("unknown opcode 0x{op:02x}"))
        })?,
        _ => {
            return Err(HeadError::MalformedPacket(format!(
                "opcode 0x{opcode:02x} payload does not match its layout"
            )));
        }
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use headctl_types::Eye;
    use proptest::prelude::*;

    fn any_command() -> impl Strategy<Value = ActuatorCommand> {
        prop_oneof![
            Just(ActuatorCommand::Relinquish),
            Just(ActuatorCommand::Claim),
            (any::<u8>(), any::<u8>()).prop_map(|(x, y)| ActuatorCommand::Gaze { x, y }),
            any::<u8>().prop_map(|position| ActuatorCommand::Mouth { position }),
            any::<u8>().prop_map(|position| ActuatorCommand::LeftEyelid { position }),
            any::<u8>().prop_map(|position| ActuatorCommand::RightEyelid { position }),
            any_eye().prop_map(|eye| ActuatorCommand::BlinkStart { eye }),
            any_eye().prop_map(|eye| ActuatorCommand::BlinkEnd { eye }),
        ]
    }

    fn any_eye() -> impl Strategy<Value = Eye> {
        prop_oneof![Just(Eye::Left), Just(Eye::Right), Just(Eye::Both)]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(cmd in any_command()) {
            let wire = encode(&cmd);
            prop_assert_eq!(wire.len(), 1 + payload_len(cmd.opcode()).unwrap());
            prop_assert_eq!(decode(&wire).unwrap(), cmd);
        }

        #[test]
        fn arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..16)) {
            match decode(&data) {
                Ok(cmd) => prop_assert_eq!(&encode(&cmd)[..], data.as_slice()),
                Err(e) => prop_assert!(matches!(e, HeadError::MalformedPacket(_))),
            }
        }
    }

    #[test]
    fn gaze_wire_layout() {
        let wire = encode(&ActuatorCommand::Gaze { x: 0x7f, y: 0xff });
        assert_eq!(&wire[..], &[0x20, 0x7f, 0xff]);
    }

    #[test]
    fn eyelid_and_blink_wire_layout() {
        assert_eq!(
            &encode(&ActuatorCommand::RightEyelid { position: 0x80 })[..],
            &[0x31, 0x80]
        );
        assert_eq!(
            &encode(&ActuatorCommand::BlinkStart { eye: Eye::Both })[..],
            &[0x44]
        );
        assert_eq!(
            decode(&[0x43]).unwrap(),
            ActuatorCommand::BlinkEnd { eye: Eye::Right }
        );
        // Blinks carry no payload.
        assert!(decode(&[0x40, 0x01]).is_err());
        // 0x46..0x4f is unassigned.
        assert!(decode(&[0x46]).is_err());
    }

    #[test]
    fn empty_datagram_is_malformed() {
        assert!(matches!(decode(&[]), Err(HeadError::MalformedPacket(_))));
    }

    #[test]
    fn unknown_opcode_is_malformed() {
        let err = decode(&[0x99]).unwrap_err();
        assert!(err.to_string().contains("0x99"));
    }

    #[test]
    fn arity_mismatch_is_malformed() {
        // Gaze with one axis missing.
        assert!(decode(&[0x20, 0x10]).is_err());
        // Claim carries no payload.
        assert!(decode(&[0x01, 0x00]).is_err());
        // Mouth with a trailing byte.
        assert!(decode(&[0x50, 0x10, 0x10]).is_err());
    }
}
