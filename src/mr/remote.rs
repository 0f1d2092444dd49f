use super::usage::Usage;
use crate::err::{Error, Result};
use crate::types::RKey;

/// Size of the fixed wire descriptor of a memory region.
pub const DESCRIPTOR_SIZE: usize = 24;

/// Remote registered memory.
///
/// This structure carries everything needed to address a peer's memory region
/// in a one-sided operation and holds no provider resource of its own. It is
/// built by decoding a wire descriptor produced on the owning side, typically
/// transported as the private data of the connection handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemoteMr {
    /// Remote virtual address of the region's start.
    pub addr: u64,
    /// Region length in bytes.
    pub len: usize,
    /// Remote access key.
    pub rkey: RKey,
    /// Usages the owning side permits.
    pub usage: Usage,
}

impl RemoteMr {
    /// Create a remote memory region description from its parts.
    pub fn new(addr: u64, len: usize, rkey: RKey, usage: Usage) -> Self {
        Self {
            addr,
            len,
            rkey,
            usage,
        }
    }

    /// Encode into the fixed little-endian wire descriptor:
    /// address (8 bytes), length (8), rkey (4), usage (1), reserved zero (3).
    pub fn to_descriptor(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut desc = [0u8; DESCRIPTOR_SIZE];
        desc[0..8].copy_from_slice(&self.addr.to_le_bytes());
        desc[8..16].copy_from_slice(&(self.len as u64).to_le_bytes());
        desc[16..20].copy_from_slice(&self.rkey.to_le_bytes());
        desc[20] = self.usage.bits();
        desc
    }

    /// Decode a wire descriptor. Anything but exactly [`DESCRIPTOR_SIZE`]
    /// bytes is invalid.
    pub fn from_descriptor(desc: &[u8]) -> Result<Self> {
        if desc.len() != DESCRIPTOR_SIZE {
            return Err(Error::Inval);
        }
        let addr = u64::from_le_bytes(desc[0..8].try_into().unwrap());
        let len = u64::from_le_bytes(desc[8..16].try_into().unwrap()) as usize;
        let rkey = u32::from_le_bytes(desc[16..20].try_into().unwrap());
        let usage = Usage::from_bits(desc[20]);
        Ok(Self {
            addr,
            len,
            rkey,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrip() {
        let mr = RemoteMr::new(
            0x7F12_3456_789A_BC00,
            4096,
            0xDEAD_BEEF,
            Usage::READ_SRC | Usage::READ_DST,
        );
        let decoded = RemoteMr::from_descriptor(&mr.to_descriptor()).unwrap();
        assert_eq!(decoded, mr);
    }

    #[test]
    fn descriptor_layout() {
        let mr = RemoteMr::new(0x0102_0304_0506_0708, 0x1000, 0x0A0B_0C0D, Usage::READ_SRC);
        let desc = mr.to_descriptor();
        assert_eq!(&desc[0..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&desc[8..16], &[0x00, 0x10, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&desc[16..20], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(desc[20], Usage::READ_SRC.bits());
        assert_eq!(&desc[21..24], &[0, 0, 0]);
    }

    #[test]
    fn wrong_length_is_invalid() {
        assert_eq!(RemoteMr::from_descriptor(&[0; 23]), Err(Error::Inval));
        assert_eq!(RemoteMr::from_descriptor(&[0; 25]), Err(Error::Inval));
        assert_eq!(RemoteMr::from_descriptor(&[]), Err(Error::Inval));
    }
}
