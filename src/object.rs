//! Typed sparse address-keyed collection of Modbus objects: coils, discrete
//! inputs, holding registers, input registers, plus multi-word scalar and
//! string views over register collections.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::range::{self, Range};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl ObjectType {
    pub fn is_bit(self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }

    /// The maximum object count the protocol allows in a single request for
    /// this object type.
    pub fn protocol_max_length(self) -> u16 {
        if self.is_bit() { 2008 } else { 123 }
    }
}

/// A sparse, single-typed map from address to value.
///
/// All mutators that write multi-word scalars overwrite any prior entries at
/// the addresses they touch, matching the wire semantics where a register
/// write replaces whatever was there before.
#[derive(Debug, Clone)]
pub struct ObjectCollection {
    object_type: ObjectType,
    bits: BTreeMap<u16, bool>,
    words: BTreeMap<u16, u16>,
}

impl ObjectCollection {
    pub fn new(object_type: ObjectType) -> Self {
        Self {
            object_type,
            bits: BTreeMap::new(),
            words: BTreeMap::new(),
        }
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub fn len(&self) -> usize {
        if self.object_type.is_bit() {
            self.bits.len()
        } else {
            self.words.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addresses(&self) -> Vec<u16> {
        if self.object_type.is_bit() {
            self.bits.keys().copied().collect()
        } else {
            self.words.keys().copied().collect()
        }
    }

    fn require_bit(&self) -> Result<()> {
        if self.object_type.is_bit() {
            Ok(())
        } else {
            Err(Error::ObjectTypeMismatch)
        }
    }

    fn require_register(&self) -> Result<()> {
        if self.object_type.is_bit() {
            Err(Error::ObjectTypeMismatch)
        } else {
            Ok(())
        }
    }

    pub fn set_bit(&mut self, address: u16, value: bool) -> Result<()> {
        self.require_bit()?;
        self.bits.insert(address, value);
        Ok(())
    }

    pub fn get_bit(&self, address: u16) -> Result<bool> {
        self.require_bit()?;
        self.bits
            .get(&address)
            .copied()
            .ok_or(Error::AddressNotFound(address))
    }

    pub fn set_word(&mut self, address: u16, value: u16) -> Result<()> {
        self.require_register()?;
        self.words.insert(address, value);
        Ok(())
    }

    pub fn get_word(&self, address: u16) -> Result<u16> {
        self.require_register()?;
        self.words
            .get(&address)
            .copied()
            .ok_or(Error::AddressNotFound(address))
    }

    fn set_words(&mut self, address: u16, words: &[u16]) -> Result<()> {
        self.require_register()?;
        for (i, word) in words.iter().enumerate() {
            let a = address.wrapping_add(i as u16);
            self.words.insert(a, *word);
        }
        Ok(())
    }

    fn get_words(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.require_register()?;
        (0..count)
            .map(|i| {
                let a = address.wrapping_add(i);
                self.words
                    .get(&a)
                    .copied()
                    .ok_or(Error::AddressNotFound(a))
            })
            .collect()
    }

    pub fn set_u16(&mut self, address: u16, value: u16) -> Result<()> {
        self.set_word(address, value)
    }

    pub fn get_u16(&self, address: u16) -> Result<u16> {
        self.get_word(address)
    }

    pub fn set_i16(&mut self, address: u16, value: i16) -> Result<()> {
        self.set_word(address, value as u16)
    }

    pub fn get_i16(&self, address: u16) -> Result<i16> {
        self.get_word(address).map(|w| w as i16)
    }

    pub fn set_u32(&mut self, address: u16, value: u32) -> Result<()> {
        let hi = (value >> 16) as u16;
        let lo = value as u16;
        self.set_words(address, &[hi, lo])
    }

    pub fn get_u32(&self, address: u16) -> Result<u32> {
        let words = self.get_words(address, 2)?;
        Ok((u32::from(words[0]) << 16) | u32::from(words[1]))
    }

    pub fn set_i32(&mut self, address: u16, value: i32) -> Result<()> {
        self.set_u32(address, value as u32)
    }

    pub fn get_i32(&self, address: u16) -> Result<i32> {
        self.get_u32(address).map(|v| v as i32)
    }

    pub fn set_u64(&mut self, address: u16, value: u64) -> Result<()> {
        let words = [
            (value >> 48) as u16,
            (value >> 32) as u16,
            (value >> 16) as u16,
            value as u16,
        ];
        self.set_words(address, &words)
    }

    pub fn get_u64(&self, address: u16) -> Result<u64> {
        let w = self.get_words(address, 4)?;
        Ok(u64::from(w[0]) << 48
            | u64::from(w[1]) << 32
            | u64::from(w[2]) << 16
            | u64::from(w[3]))
    }

    pub fn set_i64(&mut self, address: u16, value: i64) -> Result<()> {
        self.set_u64(address, value as u64)
    }

    pub fn get_i64(&self, address: u16) -> Result<i64> {
        self.get_u64(address).map(|v| v as i64)
    }

    pub fn set_f32(&mut self, address: u16, value: f32) -> Result<()> {
        self.set_u32(address, value.to_bits())
    }

    pub fn get_f32(&self, address: u16) -> Result<f32> {
        self.get_u32(address).map(f32::from_bits)
    }

    pub fn set_f64(&mut self, address: u16, value: f64) -> Result<()> {
        self.set_u64(address, value.to_bits())
    }

    pub fn get_f64(&self, address: u16) -> Result<f64> {
        self.get_u64(address).map(f64::from_bits)
    }

    /// Packs two bytes per word, high byte first. An odd-length string is
    /// padded with a trailing zero byte.
    pub fn set_str8(&mut self, address: u16, value: &[u8]) -> Result<()> {
        let mut words = Vec::with_capacity(value.len().div_ceil(2));
        let mut chunks = value.chunks(2);
        for chunk in &mut chunks {
            let hi = chunk[0];
            let lo = chunk.get(1).copied().unwrap_or(0);
            words.push((u16::from(hi) << 8) | u16::from(lo));
        }
        self.set_words(address, &words)
    }

    pub fn get_str8(&self, address: u16, word_count: u16) -> Result<Vec<u8>> {
        let words = self.get_words(address, word_count)?;
        let mut out = Vec::with_capacity(words.len() * 2);
        for w in words {
            out.push((w >> 8) as u8);
            out.push(w as u8);
        }
        Ok(out)
    }

    /// One UTF-16 code unit per word, no surrogate interpretation.
    pub fn set_str16(&mut self, address: u16, value: &[u16]) -> Result<()> {
        self.set_words(address, value)
    }

    pub fn get_str16(&self, address: u16, word_count: u16) -> Result<Vec<u16>> {
        self.get_words(address, word_count)
    }

    /// Projects every stored address into a unit range and runs the range
    /// planner, capped at this object type's protocol length limit.
    pub fn get_ranges(&self, max_length: u16, allowed_waste: u16) -> Vec<Range> {
        let cap = self.object_type.protocol_max_length();
        let effective_max = if max_length == 0 || max_length > cap {
            cap
        } else {
            max_length
        };
        let ranges: Vec<Range> = self
            .addresses()
            .into_iter()
            .map(Range::single)
            .collect();
        range::plan(&ranges, effective_max, allowed_waste)
    }
}
