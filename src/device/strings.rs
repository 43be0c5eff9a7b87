//! String descriptor table

use crate::error::{Error, Result};
use crate::unicode;
use alloc::vec::Vec;

/// Fixed string indices
pub const MANUFACTURER: u8 = 1;
pub const PRODUCT: u8 = 2;
pub const SERIAL_NUMBER: u8 = 3;

/// Index of the Microsoft OS string descriptor
pub const MS_OS: u8 = 0xEE;

const FIRST_DYNAMIC: u8 = 4;

/// Descriptors by string index
///
/// Index zero is the language ID list and never stored here.
pub(crate) struct StringTable {
    lang_ids: Vec<u16>,
    strings: Vec<(u8, Vec<u8>)>,
    next: u8,
}

impl StringTable {
    pub fn new(lang_id: u16) -> Self {
        Self {
            lang_ids: alloc::vec![lang_id],
            strings: Vec::new(),
            next: FIRST_DYNAMIC,
        }
    }

    /// Store `text` at a fixed index, replacing what was there
    pub fn set(&mut self, index: u8, text: &str) -> Result<()> {
        let desc = unicode::string_descriptor(text.as_bytes())?;
        self.set_raw(index, desc)
    }

    /// Store a prebuilt descriptor
    pub fn set_raw(&mut self, index: u8, desc: Vec<u8>) -> Result<()> {
        if index == 0 {
            return Err(Error::Inval);
        }
        match self.strings.iter_mut().find(|(i, _)| *i == index) {
            Some((_, slot)) => *slot = desc,
            None => self.strings.push((index, desc)),
        }
        Ok(())
    }

    /// Store `text` at the next free index
    pub fn alloc(&mut self, text: &str) -> Result<u8> {
        if self.next == MS_OS {
            self.next += 1;
        }
        let index = self.next;
        if index == 0 {
            return Err(Error::NoMem);
        }
        self.set(index, text)?;
        self.next = self.next.wrapping_add(1);
        Ok(index)
    }

    /// Returns the index if something is stored there, or zero
    pub fn index_of(&self, index: u8) -> u8 {
        if self.get(index).is_some() {
            index
        } else {
            0
        }
    }

    pub fn get(&self, index: u8) -> Option<&[u8]> {
        self.strings
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, desc)| desc.as_slice())
    }

    /// Descriptor zero
    pub fn lang_ids(&self) -> Vec<u8> {
        unicode::langid_descriptor(&self.lang_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::{StringTable, MS_OS, PRODUCT};
    use crate::Error;

    #[test]
    fn allocation_skips_ms_os_index() {
        let mut table = StringTable::new(0x0409);
        assert_eq!(table.lang_ids(), [4, 3, 0x09, 0x04]);
        assert_eq!(table.alloc("cfg"), Ok(4));
        table.next = MS_OS;
        assert_eq!(table.alloc("late"), Ok(MS_OS + 1));
        table.next = 0;
        assert_eq!(table.alloc("full"), Err(Error::NoMem));
    }

    #[test]
    fn fixed_indices() {
        let mut table = StringTable::new(0x0409);
        assert_eq!(table.index_of(PRODUCT), 0);
        table.set(PRODUCT, "A").unwrap();
        table.set(PRODUCT, "B").unwrap();
        assert_eq!(table.get(PRODUCT), Some(&[4, 3, b'B', 0][..]));
        assert_eq!(table.index_of(PRODUCT), PRODUCT);
        assert_eq!(table.set(0, "x"), Err(Error::Inval));
    }
}
