/// Little-endian cursor over a borrowed frame. Every read is bounds-checked and
/// returns `None` once the buffer runs out.
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.pos.checked_add(N)?;
        let slice = self.buf.get(self.pos..end)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Some(out)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.take().map(u16::from_le_bytes)
    }

    pub fn read_i16(&mut self) -> Option<i16> {
        self.take().map(i16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.take().map(u32::from_le_bytes)
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.take().map(i32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.take().map(u64::from_le_bytes)
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let slice = self.buf.get(self.pos..).unwrap_or(&[]);
        self.pos = self.buf.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xBEEFu16.to_le_bytes());
        buf.extend_from_slice(&(-7i32).to_le_bytes());
        buf.push(9);

        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_u16(), Some(0xBEEF));
        assert_eq!(reader.read_i32(), Some(-7));
        assert_eq!(reader.remaining(), 1);
        assert_eq!(reader.read_u8(), Some(9));
        assert_eq!(reader.read_u8(), None);
    }

    #[test]
    fn short_read_does_not_advance() {
        let buf = [1u8, 2, 3];
        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_u32(), None);
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.read_bytes(3), Some(&buf[..]));
        assert!(reader.rest().is_empty());
    }
}
