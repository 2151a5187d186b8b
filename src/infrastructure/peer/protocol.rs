//! Motion Stream Protocol
//!
//! Constants shared by both roles and the orientation packet codec.

use crate::domain::models::Orientation;
use thiserror::Error;

/// Service type both peers advertise and browse under.
pub const SERVICE_TYPE: &str = "motion-control";

/// Label of the single orientation stream opened by the source.
pub const STREAM_NAME: &str = "MotionControllerStream";

/// Size of one orientation packet on the wire.
pub const PACKET_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed packet: expected {expected} bytes, got {actual}")]
    MalformedPacket { expected: usize, actual: usize },
}

/// Encode an orientation packet
///
/// # Packet Structure (12 bytes)
///
/// ```text
/// [0-3]   : Roll  (f32 little-endian)
/// [4-7]   : Pitch (f32 little-endian)
/// [8-11]  : Yaw   (f32 little-endian)
/// ```
///
/// No header, checksum or length prefix. Non-finite values are written as
/// their IEEE-754 bit patterns.
pub fn encode(orientation: &Orientation) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0..4].copy_from_slice(&orientation.roll.to_le_bytes());
    packet[4..8].copy_from_slice(&orientation.pitch.to_le_bytes());
    packet[8..12].copy_from_slice(&orientation.yaw.to_le_bytes());
    packet
}

/// Decode an orientation packet. The slice must be exactly [`PACKET_LEN`] bytes.
pub fn decode(bytes: &[u8]) -> Result<Orientation, ProtocolError> {
    let packet: &[u8; PACKET_LEN] = bytes.try_into().map_err(|_| ProtocolError::MalformedPacket {
        expected: PACKET_LEN,
        actual: bytes.len(),
    })?;

    Ok(Orientation {
        roll: f32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]),
        pitch: f32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]),
        yaw: f32::from_le_bytes([packet[8], packet[9], packet[10], packet[11]]),
    })
}
