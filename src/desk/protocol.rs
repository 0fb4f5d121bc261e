use uuid::Uuid;

use super::units::{Height, HeightAndSpeed, Speed};
use super::DeskError;

/// Linak BLE characteristic UUIDs and wire framing.
/// Based on reverse engineering of the Linak DPG (Desk Panel Gateway)
/// protocol.

/// The characteristics one desk exposes, passed into the driver at
/// construction. Plain data, no registry.
#[derive(Debug, Clone, Copy)]
pub struct DeskProtocol {
    /// Control service command characteristic (wakeup/stop/up/down).
    pub control_command: Uuid,
    /// DPG configuration characteristic (capabilities, user id, base offset).
    pub dpg: Uuid,
    /// Reference input characteristic (target height).
    pub reference_input: Uuid,
    /// Reference output characteristic (height + speed telemetry).
    pub reference_output: Uuid,
}

impl DeskProtocol {
    pub const LINAK: DeskProtocol = DeskProtocol {
        control_command: Uuid::from_u128(0x99fa0002_338a_1024_8a49_009c0215f78a),
        dpg: Uuid::from_u128(0x99fa0011_338a_1024_8a49_009c0215f78a),
        reference_input: Uuid::from_u128(0x99fa0031_338a_1024_8a49_009c0215f78a),
        reference_output: Uuid::from_u128(0x99fa0021_338a_1024_8a49_009c0215f78a),
    };
}

/// Control service commands, written as `[command, 0]` little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCommand {
    MoveDown = 70,
    MoveUp = 71,
    Wakeup = 254,
    Stop = 255,
}

impl ControlCommand {
    pub fn to_bytes(self) -> [u8; 2] {
        [self as u8, 0]
    }
}

/// DPG sub-protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DpgCommand {
    GetCapabilities = 128,
    BaseOffset = 129,
    UserId = 134,
}

/// Frame for a DPG read command (no payload).
pub fn dpg_read_frame(command: DpgCommand) -> [u8; 3] {
    [0x7F, command as u8, 0x00]
}

/// Frame for a DPG write command carrying `payload`.
pub fn dpg_write_frame(command: DpgCommand, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(3 + payload.len());
    frame.extend_from_slice(&[0x7F, command as u8, 0x80]);
    frame.extend_from_slice(payload);
    frame
}

/// Extract the payload of a DPG response. The desk flags a valid response
/// with a leading `0x01`; anything else means "no result", not an error.
pub fn parse_dpg_response(data: &[u8]) -> Option<Vec<u8>> {
    if data.first() == Some(&0x01) {
        Some(data.get(2..).unwrap_or_default().to_vec())
    } else {
        None
    }
}

/// Encode a target height for the reference input characteristic as
/// uint16 little-endian. Values outside the encodable range are rejected.
pub fn encode_target_height(height: &Height) -> Result<[u8; 2], DeskError> {
    let value = height.value();
    if !(0..=u16::MAX as i32).contains(&value) {
        return Err(DeskError::InvalidHeightValue(height.human()));
    }
    Ok((value as u16).to_le_bytes())
}

/// Decode a reference output frame: height as uint16 LE followed by speed
/// as int16 LE, both in device units.
pub fn decode_height_speed(data: &[u8], base_height: u16) -> Option<HeightAndSpeed> {
    if data.len() < 4 {
        return None;
    }
    let raw_height = u16::from_le_bytes([data[0], data[1]]);
    let raw_speed = i16::from_le_bytes([data[2], data[3]]);
    Some(HeightAndSpeed {
        height: Height::from_internal(raw_height as i32, base_height),
        speed: Speed::from_internal(raw_speed),
    })
}

/// Desk feature set reported by the DPG capabilities command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub mem_size: u8,
    pub auto_up: bool,
    pub auto_down: bool,
    pub ble_allow: bool,
    pub has_display: bool,
    pub has_light: bool,
}

/// Decode the capability response. Byte 0 is a bitfield, byte 1 is
/// reserved. Anything shorter than 2 bytes means the desk reported no
/// capability data.
pub fn decode_capabilities(data: &[u8]) -> Option<Capabilities> {
    if data.len() < 2 {
        return None;
    }
    let byte = data[0];
    Some(Capabilities {
        mem_size: byte & 7,
        auto_up: byte & 8 != 0,
        auto_down: byte & 16 != 0,
        ble_allow: byte & 32 != 0,
        has_display: byte & 64 != 0,
        has_light: byte & 128 != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_commands() {
        assert_eq!(ControlCommand::Stop.to_bytes(), [0xFF, 0x00]);
        assert_eq!(ControlCommand::Wakeup.to_bytes(), [0xFE, 0x00]);
        assert_eq!(ControlCommand::MoveUp.to_bytes(), [0x47, 0x00]);
        assert_eq!(ControlCommand::MoveDown.to_bytes(), [0x46, 0x00]);
    }

    #[test]
    fn dpg_frames() {
        assert_eq!(
            dpg_read_frame(DpgCommand::GetCapabilities),
            [0x7F, 128, 0x00]
        );
        assert_eq!(
            dpg_write_frame(DpgCommand::UserId, &[0x01, 0xAA]),
            vec![0x7F, 134, 0x80, 0x01, 0xAA]
        );
    }

    #[test]
    fn dpg_response_payload() {
        assert_eq!(
            parse_dpg_response(&[0x01, 0x00, 0xAA, 0xBB]),
            Some(vec![0xAA, 0xBB])
        );
        assert_eq!(parse_dpg_response(&[0x01]), Some(vec![]));
        assert_eq!(parse_dpg_response(&[0x00, 0x00, 0xAA]), None);
        assert_eq!(parse_dpg_response(&[]), None);
    }

    #[test]
    fn target_height_encoding() {
        let height = Height::from_internal(10500, 640);
        assert_eq!(encode_target_height(&height).unwrap(), [0x04, 0x29]);

        let below = Height::from_internal(-10, 640);
        assert!(matches!(
            encode_target_height(&below),
            Err(DeskError::InvalidHeightValue(_))
        ));
        let above = Height::from_internal(70000, 640);
        assert!(matches!(
            encode_target_height(&above),
            Err(DeskError::InvalidHeightValue(_))
        ));
    }

    #[test]
    fn height_speed_decoding() {
        let decoded = decode_height_speed(&[0xE8, 0x03, 0x4E, 0xF3], 640).unwrap();
        assert_eq!(decoded.height.value(), 1000);
        assert_eq!(decoded.height.human(), 740.0);
        assert_eq!(decoded.speed.value(), -3250);

        assert!(decode_height_speed(&[0xE8, 0x03, 0x4E], 640).is_none());
        assert!(decode_height_speed(&[], 640).is_none());
    }

    #[test]
    fn capability_bits() {
        let all = decode_capabilities(&[0xFF, 0x00]).unwrap();
        assert_eq!(all.mem_size, 7);
        assert!(all.auto_up && all.auto_down && all.ble_allow);
        assert!(all.has_display && all.has_light);

        let none = decode_capabilities(&[0x00, 0x00]).unwrap();
        assert_eq!(none.mem_size, 0);
        assert!(!none.auto_up && !none.auto_down && !none.ble_allow);
        assert!(!none.has_display && !none.has_light);
    }

    #[test]
    fn capability_short_buffer_is_unknown() {
        assert!(decode_capabilities(&[0xFF]).is_none());
        assert!(decode_capabilities(&[]).is_none());
    }
}
