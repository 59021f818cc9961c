use std::fmt;

use crate::drivers::FaError;

/// Number of addressable channels in a subscription mask.
pub const MASK_SIZE: usize = 256;
const MASK_BYTES: usize = MASK_SIZE / 8;

/// Set of channel ids selected by a subscription, one bit per channel.
///
/// Byte `i / 8` holds bit `i % 8` for channel `i`. The wire form is the same
/// 32 bytes written as hex with the byte order reversed, so channel 0 lands in
/// the lowest bit of the rightmost byte.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelMask {
    bits: [u8; MASK_BYTES],
}

impl ChannelMask {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a mask from channel ids, rejecting anything outside 0..=255.
    pub fn build<I>(ids: I) -> Result<Self, FaError>
    where
        I: IntoIterator,
        I::Item: Into<i64>,
    {
        let mut mask = Self::empty();
        for id in ids {
            let id = id.into();
            if !(0..MASK_SIZE as i64).contains(&id) {
                return Err(FaError::InvalidChannel(id));
            }
            mask.set(id as u8);
        }
        Ok(mask)
    }

    /// Mask selecting exactly one channel.
    pub fn single(id: u8) -> Self {
        let mut mask = Self::empty();
        mask.set(id);
        mask
    }

    /// Parses the text form used on the server command line: comma separated
    /// ids or inclusive ranges, e.g. `"1,3-5,200"`.
    pub fn parse(text: &str) -> Result<Self, FaError> {
        let mut mask = Self::empty();
        for item in text.split(',').map(str::trim) {
            let (lo, hi) = match item.split_once('-') {
                Some((lo, hi)) => (parse_id(lo, text)?, parse_id(hi, text)?),
                None => {
                    let id = parse_id(item, text)?;
                    (id, id)
                }
            };
            for id in lo..=hi {
                mask.set(id);
            }
        }
        Ok(mask)
    }

    /// Decodes the 64 character wire string produced by [`ChannelMask::to_wire`].
    pub fn from_wire(hex: &str) -> Result<Self, FaError> {
        if hex.len() != 2 * MASK_BYTES || !hex.is_ascii() {
            return Err(FaError::InvalidMask(format!(
                "expected {} hex digits, got {:?}",
                2 * MASK_BYTES,
                hex
            )));
        }
        let mut bits = [0u8; MASK_BYTES];
        for (i, byte) in bits.iter_mut().rev().enumerate() {
            let pair = &hex[2 * i..2 * i + 2];
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| FaError::InvalidMask(format!("bad hex digits {pair:?}")))?;
        }
        Ok(Self { bits })
    }

    pub fn set(&mut self, id: u8) {
        self.bits[id as usize / 8] |= 1 << (id % 8);
    }

    pub fn contains(&self, id: u8) -> bool {
        self.bits[id as usize / 8] & (1 << (id % 8)) != 0
    }

    /// Number of subscribed channels.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Subscribed channel ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..MASK_SIZE).map(|i| i as u8).filter(|&id| self.contains(id))
    }

    /// Uppercase hex wire form, most significant byte first.
    pub fn to_wire(&self) -> String {
        self.bits.iter().rev().map(|b| format!("{b:02X}")).collect()
    }
}

fn parse_id(item: &str, original: &str) -> Result<u8, FaError> {
    let value: i64 = item
        .trim()
        .parse()
        .map_err(|_| FaError::InvalidMask(format!("number missing at {item:?} in {original:?}")))?;
    u8::try_from(value).map_err(|_| FaError::InvalidChannel(value))
}

impl fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl fmt::Debug for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
