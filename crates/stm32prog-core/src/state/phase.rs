//! Programming phase identifiers.

use std::fmt;

use crate::protocol::constants::*;

/// Wire-visible "what is being transferred" identifier.
///
/// Kept as an integer so layout ids map onto it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Phase(u16);

impl Phase {
    pub const LAYOUT: Phase = Phase(PHASE_FLASHLAYOUT);
    pub const CMD: Phase = Phase(PHASE_CMD);
    pub const OTP: Phase = Phase(PHASE_OTP);
    pub const PMIC: Phase = Phase(PHASE_PMIC);
    pub const END: Phase = Phase(PHASE_END);
    pub const RESET: Phase = Phase(PHASE_RESET);
    pub const DO_RESET: Phase = Phase(PHASE_DO_RESET);

    pub const fn new(id: u16) -> Self {
        Phase(id)
    }

    /// Phase of a layout partition id.
    pub const fn user(id: u8) -> Self {
        Phase(id as u16)
    }

    pub const fn id(self) -> u16 {
        self.0
    }

    /// Value sent to the host (low byte).
    pub const fn wire(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub const fn is_user(self) -> bool {
        self.0 >= PHASE_FIRST_USER && self.0 <= PHASE_LAST_USER
    }

    /// No further partition is chosen from these phases.
    pub const fn is_terminal(self) -> bool {
        matches!(self.0, PHASE_END | PHASE_RESET | PHASE_DO_RESET)
    }

    /// Phase reported with the session error text.
    pub const fn is_reset(self) -> bool {
        matches!(self.0, PHASE_RESET | PHASE_DO_RESET)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            PHASE_FLASHLAYOUT => write!(f, "FlashLayout"),
            PHASE_CMD => write!(f, "CMD"),
            PHASE_OTP => write!(f, "OTP"),
            PHASE_PMIC => write!(f, "PMIC"),
            PHASE_END => write!(f, "END"),
            PHASE_RESET => write!(f, "RESET"),
            PHASE_DO_RESET => write!(f, "DO_RESET"),
            id => write!(f, "0x{:02x}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(Phase::LAYOUT.wire(), 0x00);
        assert_eq!(Phase::RESET.wire(), 0xFF);
        assert_eq!(Phase::DO_RESET.wire(), 0xFF);
        assert_eq!(Phase::user(0x22).wire(), 0x22);
    }

    #[test]
    fn test_classification() {
        assert!(Phase::user(0x01).is_user());
        assert!(Phase::user(0xF0).is_user());
        assert!(!Phase::LAYOUT.is_user());
        assert!(!Phase::CMD.is_user());
        assert!(Phase::END.is_terminal());
        assert!(Phase::DO_RESET.is_terminal());
        assert!(!Phase::OTP.is_terminal());
        assert!(Phase::DO_RESET.is_reset());
        assert!(!Phase::END.is_reset());
    }

    #[test]
    fn test_display() {
        assert_eq!(Phase::LAYOUT.to_string(), "FlashLayout");
        assert_eq!(Phase::user(0x10).to_string(), "0x10");
    }
}
