//! The string pool: interned strings with stable 1-based indices.
//!
//! Indices are global across all blocks of a file; index 0 means
//! null/absent and the empty string is never stored. An append block
//! serializes only the strings interned since the previous block, which
//! the `written` watermark tracks.

use crate::wire;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Read, Write};

#[derive(Debug, Clone, Default)]
pub struct StringPool {
    by_value: HashMap<String, u64>,
    data: Vec<String>,
    /// How many entries of `data` earlier blocks already serialized.
    written: usize,
}

impl StringPool {
    pub fn new() -> StringPool {
        StringPool::default()
    }

    /// Intern a string, preserving first-insertion order. Returns its
    /// 1-based index; the empty string is not stored and yields 0.
    pub fn intern(&mut self, s: &str) -> u64 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&id) = self.by_value.get(s) {
            return id;
        }
        self.data.push(s.to_string());
        let id = self.data.len() as u64;
        self.by_value.insert(s.to_string(), id);
        id
    }

    /// Index of an already interned string, 0 for the empty string.
    pub fn id_of(&self, s: &str) -> Option<u64> {
        if s.is_empty() {
            return Some(0);
        }
        self.by_value.get(s).copied()
    }

    pub fn get(&self, id: u64) -> Option<&str> {
        if id == 0 {
            return None;
        }
        self.data.get(id as usize - 1).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop everything; a full rewrite re-prepares the pool from scratch.
    pub fn reset(&mut self) {
        self.by_value.clear();
        self.data.clear();
        self.written = 0;
    }

    /// Serialize the strings interned since the last block: v64 count,
    /// count cumulative i32 end offsets, then the UTF-8 bytes.
    pub fn write_block<W: Write>(&mut self, w: &mut W) -> io::Result<()> {
        let fresh = &self.data[self.written..];
        wire::write_v64(w, fresh.len() as u64)?;
        let mut end = 0i32;
        for s in fresh {
            end += s.len() as i32;
            w.write_i32::<LittleEndian>(end)?;
        }
        for s in fresh {
            w.write_all(s.as_bytes())?;
        }
        self.written = self.data.len();
        Ok(())
    }

    /// Read one block's strings and append them to the pool.
    pub fn read_block<R: Read>(&mut self, r: &mut R) -> io::Result<()> {
        let count = wire::read_v64(r)? as usize;
        let mut ends = Vec::with_capacity(count);
        for _ in 0..count {
            ends.push(r.read_i32::<LittleEndian>()?);
        }
        let total = *ends.last().unwrap_or(&0);
        if total < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "negative string block size",
            ));
        }
        let mut bytes = vec![0u8; total as usize];
        r.read_exact(&mut bytes)?;
        let mut start = 0usize;
        for end in ends {
            if end < start as i32 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "string offsets must not decrease",
                ));
            }
            let s = std::str::from_utf8(&bytes[start..end as usize])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.data.push(s.to_string());
            self.by_value.insert(s.to_string(), self.data.len() as u64);
            start = end as usize;
        }
        self.written = self.data.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn intern_keeps_first_insertion_order() {
        let mut pool = StringPool::new();
        assert_eq!(pool.intern("alpha"), 1);
        assert_eq!(pool.intern("beta"), 2);
        assert_eq!(pool.intern("alpha"), 1);
        assert_eq!(pool.get(2), Some("beta"));
    }

    #[test]
    fn empty_string_is_never_stored() {
        let mut pool = StringPool::new();
        assert_eq!(pool.intern(""), 0);
        assert!(pool.is_empty());
        assert_eq!(pool.id_of(""), Some(0));
        assert_eq!(pool.get(0), None);
    }

    #[test]
    fn block_round_trip_and_delta() {
        let mut pool = StringPool::new();
        pool.intern("one");
        pool.intern("two");
        let mut first = Vec::new();
        pool.write_block(&mut first).expect("write");

        pool.intern("three");
        let mut second = Vec::new();
        pool.write_block(&mut second).expect("write");

        let mut back = StringPool::new();
        back.read_block(&mut Cursor::new(&first[..])).expect("read");
        assert_eq!(back.len(), 2);
        back.read_block(&mut Cursor::new(&second[..])).expect("read");
        assert_eq!(back.len(), 3);
        assert_eq!(back.get(3), Some("three"));
        assert_eq!(back.id_of("one"), Some(1));
    }
}
