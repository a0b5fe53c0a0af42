use std::io;

/// Types that can be written as the body of a frame.
pub trait Serialize<'a> {
    /// Writes the owned part of the body into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer to append the body's prefix to.
    ///
    /// # Returns
    /// An optional tail borrowed from `self`, sent right after `buf` without copying.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}

/// Types that can be read back from the body of a frame.
pub trait Deserialize<'a>: Sized {
    /// Parses `buf`, the returned value may borrow from it.
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}

pub(crate) const WORD_SIZE: usize = size_of::<u32>();

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Sequential reader over a frame body.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// The bytes not read yet.
    pub(crate) fn rest(&self) -> &'a [u8] {
        self.buf
    }

    pub(crate) fn take(&mut self, n: usize, what: &str) -> io::Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(invalid_data(format!(
                "truncated frame reading {what}: need {n} bytes, {} left",
                self.buf.len()
            )));
        }

        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub(crate) fn u32(&mut self, what: &str) -> io::Result<u32> {
        let bytes = self.take(WORD_SIZE, what)?;
        let mut word = [0; WORD_SIZE];
        word.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(word))
    }

    /// Borrows the next `n` values of type `T`, the buffer must be aligned for it.
    pub(crate) fn slice<T: bytemuck::Pod>(&mut self, n: usize, what: &str) -> io::Result<&'a [T]> {
        let len = n
            .checked_mul(size_of::<T>())
            .ok_or_else(|| invalid_data(format!("{what} length {n} overflows")))?;
        let bytes = self.take(len, what)?;

        bytemuck::try_cast_slice(bytes)
            .map_err(|e| invalid_data(format!("can't read {what} out of the frame: {e:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_walks_the_body() {
        let words = [1u32.to_be(), 2u32.to_be(), 3, 4];
        let bytes: &[u8] = bytemuck::cast_slice(&words);
        let mut reader = Reader::new(bytes);

        assert_eq!(reader.u32("first").unwrap(), 1);
        assert_eq!(reader.u32("second").unwrap(), 2);
        assert_eq!(reader.slice::<u32>(2, "rest").unwrap(), &[3, 4]);
        assert!(reader.rest().is_empty());

        let err = reader.u32("past the end").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
