//! Higher-level wrappings of registered memory.

use std::ops::{Deref, DerefMut};

use crate::err::Result;
use crate::mr::{Mr, Placement, Usage};
use crate::peer::Peer;

/// A wrapper around an owned memory area registered as a memory region.
///
/// The memory is allocated on the heap and deallocated when this structure is
/// dropped, after the registration is released. Useful when the caller does
/// not want to manage the buffer lifetime against the registration manually.
pub struct RegisteredMem {
    mr: Mr<'static>,
    buf: Box<[u8]>,
}

impl RegisteredMem {
    /// Allocate a zeroed buffer of the given length and register it.
    pub fn new(peer: &Peer, len: usize, usage: Usage) -> Result<Self> {
        let buf = vec![0u8; len].into_boxed_slice();
        // SAFETY: the buffer is owned by the returned value and declared
        // before it, so the registration is released before deallocation.
        let mr = unsafe {
            Mr::reg_with_ref(
                peer,
                buf.as_ptr() as *mut u8,
                buf.len(),
                usage,
                Placement::Volatile,
                &(),
            )
        }?;
        Ok(Self { mr, buf })
    }

    /// Allocate a buffer with the same length and content as `content` and
    /// register it.
    pub fn new_with_content(peer: &Peer, content: &[u8], usage: Usage) -> Result<Self> {
        let mut this = Self::new(peer, content.len(), usage)?;
        this.buf.copy_from_slice(content);
        Ok(this)
    }

    /// Get the memory region registered over the owned buffer.
    #[inline]
    pub fn mr(&self) -> &Mr<'static> {
        &self.mr
    }
}

impl Deref for RegisteredMem {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for RegisteredMem {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}
