use std::fmt;

/// Logical light level, always within `0..=100`.
///
/// The only way to build one from untrusted input is [`LightLevel::clamped`],
/// so every level that reaches the store, the output or the broker is valid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LightLevel(u8);

impl LightLevel {
    pub const MIN: LightLevel = LightLevel(0);
    pub const MAX: LightLevel = LightLevel(100);

    /// Clamps any integer to the nearest bound of `0..=100`.
    pub fn clamped(value: i64) -> Self {
        LightLevel(value.clamp(0, 100) as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for LightLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
