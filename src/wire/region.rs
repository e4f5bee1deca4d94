//! Bounds-checked cursors over caller-provided byte regions.
//!
//! Both cursors consume from the front of their slice and can carve out a
//! contiguous sub-region, so several control lists can be packed back-to-back
//! into one pre-sized buffer. Neither ever touches memory outside the slice
//! it was built from.

use super::WireError;

/// Read cursor over an immutable byte region.
pub struct ReadRegion<'a> {
    data: &'a [u8],
}

impl<'a> ReadRegion<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Take the next `len` bytes, failing if the region is too short.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.data.len() {
            return Err(WireError::MalformedPayload("declared size exceeds region"));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    /// Split off the next `len` bytes as an independent sub-region.
    pub fn carve_out(&mut self, len: usize) -> Result<ReadRegion<'a>, WireError> {
        Ok(ReadRegion::new(self.read_bytes(len)?))
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        let b = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_le_bytes(raw))
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_bits(self.read_u32()?))
    }
}

/// Write cursor over a mutable byte region. Writes never allocate; the caller
/// sizes the region up front (see [`super::binary_size`]).
pub struct WriteRegion<'a> {
    data: &'a mut [u8],
}

impl<'a> WriteRegion<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        if bytes.len() > self.data.len() {
            return Err(WireError::RegionOverflow {
                needed: bytes.len(),
                available: self.data.len(),
            });
        }
        let data = std::mem::take(&mut self.data);
        let (head, tail) = data.split_at_mut(bytes.len());
        head.copy_from_slice(bytes);
        self.data = tail;
        Ok(())
    }

    /// Split off the next `len` bytes as an independent sub-region. The
    /// parent cursor continues past the carved range.
    pub fn carve_out(&mut self, len: usize) -> Result<WriteRegion<'a>, WireError> {
        if len > self.data.len() {
            return Err(WireError::RegionOverflow {
                needed: len,
                available: self.data.len(),
            });
        }
        let data = std::mem::take(&mut self.data);
        let (head, tail) = data.split_at_mut(len);
        self.data = tail;
        Ok(WriteRegion::new(head))
    }

    pub fn write_u8(&mut self, v: u8) -> Result<(), WireError> {
        self.write_bytes(&[v])
    }

    pub fn write_u32(&mut self, v: u32) -> Result<(), WireError> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<(), WireError> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<(), WireError> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<(), WireError> {
        self.write_bytes(&v.to_bits().to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_never_runs_past_bounds() {
        let mut region = ReadRegion::new(&[1, 2, 3]);
        assert!(region.read_u32().is_err());
        // The failed read consumed nothing.
        assert_eq!(region.remaining(), 3);
    }

    #[test]
    fn carve_out_is_contiguous() {
        let mut backing = [0u8; 8];
        let mut region = WriteRegion::new(&mut backing);
        let mut first = region.carve_out(4).unwrap();
        let mut second = region.carve_out(4).unwrap();
        second.write_u32(0xbbbb_bbbb).unwrap();
        first.write_u32(0xaaaa_aaaa).unwrap();
        assert_eq!(backing[..4], [0xaa; 4]);
        assert_eq!(backing[4..], [0xbb; 4]);
    }

    #[test]
    fn write_overflow_is_reported() {
        let mut backing = [0u8; 2];
        let mut region = WriteRegion::new(&mut backing);
        match region.write_u32(1) {
            Err(WireError::RegionOverflow { needed, available }) => {
                assert_eq!((needed, available), (4, 2));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
