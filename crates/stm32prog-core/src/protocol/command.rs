//! Serial command decoding.
//!
//! Every command byte is followed by its bitwise complement; the pair is
//! decoded once into a [`SerialCommand`] and dispatched by pattern matching.

use std::fmt;

use super::constants::*;

/// Commands understood by the serial engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialCommand {
    GetCapabilities,
    GetVersion,
    GetId,
    GetPhase,
    ReadMemory,
    ReadPartition,
    Start,
    Download,
}

/// Byte that is not a known command code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownCommand(pub u8);

impl SerialCommand {
    /// Every command, in the order reported by get-capabilities.
    pub const ALL: [SerialCommand; 8] = [
        SerialCommand::GetCapabilities,
        SerialCommand::GetVersion,
        SerialCommand::GetId,
        SerialCommand::GetPhase,
        SerialCommand::ReadMemory,
        SerialCommand::ReadPartition,
        SerialCommand::Start,
        SerialCommand::Download,
    ];

    pub const fn code(self) -> u8 {
        match self {
            SerialCommand::GetCapabilities => GET_CMD_COMMAND,
            SerialCommand::GetVersion => GET_VER_COMMAND,
            SerialCommand::GetId => GET_ID_COMMAND,
            SerialCommand::GetPhase => PHASE_COMMAND,
            SerialCommand::ReadMemory => READ_COMMAND,
            SerialCommand::ReadPartition => READ_PART_COMMAND,
            SerialCommand::Start => START_COMMAND,
            SerialCommand::Download => DOWNLOAD_COMMAND,
        }
    }

    /// Decode a command byte and its check byte.
    pub fn decode(command: u8, check: u8) -> Result<Self, FramingError> {
        if check != !command {
            return Err(FramingError::BadComplement { command, check });
        }
        Self::try_from(command).map_err(|UnknownCommand(code)| FramingError::Unknown(code))
    }
}

impl TryFrom<u8> for SerialCommand {
    type Error = UnknownCommand;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.code() == code)
            .ok_or(UnknownCommand(code))
    }
}

impl fmt::Display for SerialCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SerialCommand::GetCapabilities => "GET",
            SerialCommand::GetVersion => "GET_VERSION",
            SerialCommand::GetId => "GET_ID",
            SerialCommand::GetPhase => "GET_PHASE",
            SerialCommand::ReadMemory => "READ_MEMORY",
            SerialCommand::ReadPartition => "READ_PARTITION",
            SerialCommand::Start => "START",
            SerialCommand::Download => "DOWNLOAD",
        };
        write!(f, "{}", name)
    }
}

/// Why a command byte pair was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    BadComplement { command: u8, check: u8 },
    Unknown(u8),
}

/// XOR of every byte, as used by the serial checksum bytes.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, &b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_commands() {
        for cmd in SerialCommand::ALL {
            assert_eq!(SerialCommand::decode(cmd.code(), !cmd.code()), Ok(cmd));
        }
    }

    #[test]
    fn test_decode_bad_complement() {
        assert_eq!(
            SerialCommand::decode(DOWNLOAD_COMMAND, DOWNLOAD_COMMAND),
            Err(FramingError::BadComplement {
                command: DOWNLOAD_COMMAND,
                check: DOWNLOAD_COMMAND
            })
        );
    }

    #[test]
    fn test_decode_unknown() {
        assert_eq!(
            SerialCommand::decode(0x44, !0x44),
            Err(FramingError::Unknown(0x44))
        );
    }

    #[test]
    fn test_xor_checksum() {
        assert_eq!(xor_checksum(&[0x12, 0x34, 0x56, 0x78]), 0x08);
        assert_eq!(xor_checksum(&[]), 0);
    }
}
