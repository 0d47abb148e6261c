use std::cmp::Ordering;
use std::fmt;

use crate::data_types::KeyCodec;

/// Content of a single key slot in a B-Tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySlot {
    /// Encoded key, exactly `key_width` bytes long.
    Real(Vec<u8>),
    /// The slot holds no distinguishing key.
    Empty,
    /// Sentinel greater than every real key.
    Infinity,
}

impl KeySlot {
    /// On-disk tag of a slot holding a real key.
    pub(crate) const TAG_NONE: u8 = 0;
    /// On-disk tag of an [`KeySlot::Empty`] slot.
    pub(crate) const TAG_EMPTY: u8 = 1;
    /// On-disk tag of an [`KeySlot::Infinity`] slot.
    pub(crate) const TAG_INFINITY: u8 = 2;

    pub fn real(bytes: impl Into<Vec<u8>>) -> Self {
        KeySlot::Real(bytes.into())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, KeySlot::Empty)
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            KeySlot::Real(_) => Self::TAG_NONE,
            KeySlot::Empty => Self::TAG_EMPTY,
            KeySlot::Infinity => Self::TAG_INFINITY,
        }
    }

    /// Compares two slots. `Infinity` is greater than anything that isn't `Infinity`; `Empty` is only
    /// comparable with another `Empty`, so `None` is returned when exactly one side is `Empty`.
    pub fn compare<C: KeyCodec + ?Sized>(&self, other: &KeySlot, codec: &C) -> Option<Ordering> {
        match (self, other) {
            (KeySlot::Empty, KeySlot::Empty) => Some(Ordering::Equal),
            (KeySlot::Empty, _) | (_, KeySlot::Empty) => None,
            (KeySlot::Infinity, KeySlot::Infinity) => Some(Ordering::Equal),
            (KeySlot::Infinity, KeySlot::Real(_)) => Some(Ordering::Greater),
            (KeySlot::Real(_), KeySlot::Infinity) => Some(Ordering::Less),
            (KeySlot::Real(a), KeySlot::Real(b)) => Some(codec.compare(a, b)),
        }
    }

    /// `true` when both slots are comparable and `self < other`.
    pub fn lt<C: KeyCodec + ?Sized>(&self, other: &KeySlot, codec: &C) -> bool {
        self.compare(other, codec) == Some(Ordering::Less)
    }

    /// `true` when both slots are comparable and `self <= other`.
    pub fn le<C: KeyCodec + ?Sized>(&self, other: &KeySlot, codec: &C) -> bool {
        matches!(
            self.compare(other, codec),
            Some(Ordering::Less | Ordering::Equal)
        )
    }

    /// Smaller of two low keys, where `Empty` stands for "no key yet" and loses to anything.
    pub(crate) fn min_low<C: KeyCodec + ?Sized>(self, candidate: &KeySlot, codec: &C) -> KeySlot {
        if candidate.is_empty() {
            return self;
        }
        match self {
            KeySlot::Empty => candidate.clone(),
            current if candidate.lt(&current, codec) => candidate.clone(),
            current => current,
        }
    }
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySlot::Real(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            KeySlot::Empty => write!(f, "<empty>"),
            KeySlot::Infinity => write!(f, "<infinity>"),
        }
    }
}
