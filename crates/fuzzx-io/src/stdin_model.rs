use crate::types::{InputType, Termination};

/// Host-side model of the client's stdin.
///
/// The engine emits a flat byte vector per round; the model replays
/// those bytes to the client's reads and fabricates data once they
/// run out, recording the type of every read so the engine can
/// rebuild the typed partition afterwards.
pub trait StdinModel {
    fn clear(&mut self);
    fn set_bytes(&mut self, bytes: &[u8]);

    /// Serves one typed read. `out.len()` must equal the type width.
    /// Fails with the termination the client would be killed with.
    fn read(&mut self, ty: InputType, out: &mut [u8]) -> Result<(), Termination>;

    /// Bytes served so far, including fabricated filler.
    fn bytes(&self) -> &[u8];
    fn types(&self) -> &[InputType];
    fn num_bytes_read(&self) -> u32;
}

/// Replays the prepared bytes, then repeats a fixed filler byte.
///
/// Reading past `max_bytes` is a boundary violation; the read that
/// crosses the limit is not served.
pub struct ReplayBytesModel {
    max_bytes: u32,
    repeat_byte: u8,
    cursor: u32,
    bytes: Vec<u8>,
    types: Vec<InputType>,
}

impl ReplayBytesModel {
    pub fn new(max_bytes: u32, repeat_byte: u8) -> Self {
        Self {
            max_bytes,
            repeat_byte,
            cursor: 0,
            bytes: Vec::new(),
            types: Vec::new(),
        }
    }
}

impl StdinModel for ReplayBytesModel {
    fn clear(&mut self) {
        self.cursor = 0;
        self.bytes.clear();
        self.types.clear();
    }

    fn set_bytes(&mut self, bytes: &[u8]) {
        self.bytes = bytes.to_vec();
        self.cursor = 0;
        self.types.clear();
    }

    fn read(&mut self, ty: InputType, out: &mut [u8]) -> Result<(), Termination> {
        let count = ty.num_bytes();
        debug_assert_eq!(out.len() as u32, count);
        if self.cursor + count > self.max_bytes {
            return Err(Termination::BoundaryViolation);
        }
        let end = (self.cursor + count) as usize;
        if end > self.bytes.len() {
            self.bytes.resize(end, self.repeat_byte);
        }
        out.copy_from_slice(&self.bytes[self.cursor as usize..end]);
        self.cursor += count;
        self.types.push(ty);
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes[..self.cursor as usize]
    }

    fn types(&self) -> &[InputType] {
        &self.types
    }

    fn num_bytes_read(&self) -> u32 {
        self.cursor
    }
}

/// The default filler byte; alternating bits give the Hamming sweep a
/// neutral starting point.
pub const DEFAULT_REPEAT_BYTE: u8 = 0x55;

/// Looks up a stdin model by its configured name.
pub fn stdin_model_by_name(name: &str, max_bytes: u32) -> Option<Box<dyn StdinModel>> {
    match name {
        "replay_bytes_then_repeat_byte" => {
            Some(Box::new(ReplayBytesModel::new(max_bytes, DEFAULT_REPEAT_BYTE)))
        }
        "replay_bytes_then_repeat_zero" => Some(Box::new(ReplayBytesModel::new(max_bytes, 0x00))),
        _ => {
            tracing::warn!(model = name, "unknown stdin model");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_then_repeats() {
        let mut model = ReplayBytesModel::new(16, 0x55);
        model.set_bytes(&[42]);
        let mut byte = [0u8; 1];
        model.read(InputType::U8, &mut byte).unwrap();
        assert_eq!(byte[0], 42);
        model.read(InputType::U8, &mut byte).unwrap();
        assert_eq!(byte[0], 0x55);
        assert_eq!(model.num_bytes_read(), 2);
        assert_eq!(model.types(), &[InputType::U8, InputType::U8]);
    }

    #[test]
    fn boundary_violation_past_max_bytes() {
        let mut model = ReplayBytesModel::new(4, 0x55);
        model.set_bytes(&[1, 2, 3, 4]);
        let mut word = [0u8; 4];
        model.read(InputType::U32, &mut word).unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(
            model.read(InputType::U8, &mut byte),
            Err(Termination::BoundaryViolation)
        );
        // The violating read served nothing.
        assert_eq!(model.num_bytes_read(), 4);
    }
}
