//! Small helpers for feeding payloads into UBI volumes.

use std::io::{self, Read};

pub trait ReadExt {
    /// Appends up to `read_len` bytes to `vec`, stopping early (without error) at EOF.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;

    /// Reads the whole stream, which must not be longer than `limit` bytes: an LEB or a volume
    /// can't take more than it has room for, and silently truncating would lose data.
    fn read_bounded(&mut self, limit: usize) -> io::Result<Vec<u8>> {
        let mut vec = Vec::new();
        self.read_to_vec(&mut vec, limit + 1)?;
        if vec.len() > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("input does not fit in {limit} bytes"),
            ));
        }
        Ok(vec)
    }
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        const CHUNK_SIZE: usize = 65536;

        let end = vec.len() + read_len;
        let mut cursor = vec.len();
        while cursor < end {
            vec.resize(std::cmp::min(end, cursor + CHUNK_SIZE), 0u8);

            cursor += match self.read(&mut vec[cursor..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => return Err(e),
            };
        }

        vec.truncate(cursor);
        Ok(())
    }
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    io::repeat(0xAA).read_to_vec(&mut vec, 4)?;
    assert_eq!(vec, [0xAA; 4]);
    (&[1, 2, 3][..]).read_to_vec(&mut vec, 8)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_read_bounded() -> io::Result<()> {
    assert_eq!((&[7u8; 384][..]).read_bounded(384)?, [7u8; 384]);
    assert!(io::empty().read_bounded(384)?.is_empty());

    let err = io::repeat(0).read_bounded(384).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    Ok(())
}
