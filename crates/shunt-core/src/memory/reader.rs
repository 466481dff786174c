use crate::error::Result;

/// Read access to the address space code is being patched in
pub trait ReadMemory {
    /// Fill `buffer` with the bytes starting at `address`.
    fn read_into(&self, address: usize, buffer: &mut [u8]) -> Result<()>;

    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        self.read_into(address, &mut buffer)?;
        Ok(buffer)
    }

    fn read_u32(&self, address: usize) -> Result<u32> {
        let mut buffer = [0u8; 4];
        self.read_into(address, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    fn read_u64(&self, address: usize) -> Result<u64> {
        let mut buffer = [0u8; 8];
        self.read_into(address, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Read a native pointer-sized value
    fn read_pointer(&self, address: usize) -> Result<usize> {
        let mut buffer = [0u8; size_of::<usize>()];
        self.read_into(address, &mut buffer)?;
        Ok(usize::from_le_bytes(buffer))
    }
}
