use serde::{Deserialize, Serialize};

/// Type tag attached to every value the client reads from stdin.
///
/// The `Untyped*` variants cover reads whose static type the
/// instrumentation could not recover; they carry a width but no
/// arithmetic interpretation, so the typed descent never touches them.
///
/// Wire ids are stable (0..=14) and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputType {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Untyped8,
    Untyped16,
    Untyped32,
    Untyped64,
}

impl InputType {
    /// Decodes the stable wire id.
    pub fn from_id(id: u8) -> Option<InputType> {
        Some(match id {
            0 => InputType::Bool,
            1 => InputType::U8,
            2 => InputType::I8,
            3 => InputType::U16,
            4 => InputType::I16,
            5 => InputType::U32,
            6 => InputType::I32,
            7 => InputType::U64,
            8 => InputType::I64,
            9 => InputType::F32,
            10 => InputType::F64,
            11 => InputType::Untyped8,
            12 => InputType::Untyped16,
            13 => InputType::Untyped32,
            14 => InputType::Untyped64,
            _ => return None,
        })
    }

    pub fn to_id(self) -> u8 {
        match self {
            InputType::Bool => 0,
            InputType::U8 => 1,
            InputType::I8 => 2,
            InputType::U16 => 3,
            InputType::I16 => 4,
            InputType::U32 => 5,
            InputType::I32 => 6,
            InputType::U64 => 7,
            InputType::I64 => 8,
            InputType::F32 => 9,
            InputType::F64 => 10,
            InputType::Untyped8 => 11,
            InputType::Untyped16 => 12,
            InputType::Untyped32 => 13,
            InputType::Untyped64 => 14,
        }
    }

    pub fn num_bytes(self) -> u32 {
        match self {
            InputType::Bool | InputType::U8 | InputType::I8 | InputType::Untyped8 => 1,
            InputType::U16 | InputType::I16 | InputType::Untyped16 => 2,
            InputType::U32 | InputType::I32 | InputType::F32 | InputType::Untyped32 => 4,
            InputType::U64 | InputType::I64 | InputType::F64 | InputType::Untyped64 => 8,
        }
    }

    pub fn num_bits(self) -> u32 {
        8 * self.num_bytes()
    }

    /// A known type has a recovered arithmetic interpretation; only
    /// known types qualify for the typed descent.
    pub fn is_known(self) -> bool {
        !matches!(
            self,
            InputType::Untyped8 | InputType::Untyped16 | InputType::Untyped32 | InputType::Untyped64
        )
    }

    pub fn is_numeric(self) -> bool {
        self.is_known() && self != InputType::Bool
    }

    pub fn is_float(self) -> bool {
        matches!(self, InputType::F32 | InputType::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            InputType::I8 | InputType::I16 | InputType::I32 | InputType::I64
        )
    }
}

/// How the client process ended, as signalled by the external runner.
///
/// The engine ingests these as trace semantics: anything other than
/// `Normal` marks the final taken direction `EndExceptional`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Termination {
    Normal,
    Crash,
    Timeout,
    BoundaryViolation,
    MediumOverflow,
}

impl Termination {
    pub fn from_code(code: u8) -> Option<Termination> {
        Some(match code {
            0 => Termination::Normal,
            1 => Termination::Crash,
            2 => Termination::Timeout,
            3 => Termination::BoundaryViolation,
            4 => Termination::MediumOverflow,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        match self {
            Termination::Normal => 0,
            Termination::Crash => 1,
            Termination::Timeout => 2,
            Termination::BoundaryViolation => 3,
            Termination::MediumOverflow => 4,
        }
    }

    pub fn is_exceptional(self) -> bool {
        self != Termination::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_ids_round_trip() {
        for id in 0u8..=14 {
            let ty = InputType::from_id(id).unwrap();
            assert_eq!(ty.to_id(), id);
        }
        assert!(InputType::from_id(15).is_none());
    }

    #[test]
    fn untyped_widths_are_not_known() {
        assert!(!InputType::Untyped32.is_known());
        assert!(InputType::F64.is_known());
        assert!(!InputType::Bool.is_numeric());
    }
}
