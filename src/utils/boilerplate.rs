/// Generate the accessors shared by every raw provider handle: a tuple
/// struct over `NonNull<$raw_ty>` gets `as_ptr`/`as_ref` plus the thread
/// markers. Destruction stays with the owning type; this macro only covers
/// reading the handle.
macro_rules! impl_raw_handle {
    ($wrapper_ty:ident => $raw_ty:ty) => {
        impl $wrapper_ty {
            /// Get the wrapped raw pointer.
            #[inline]
            pub(crate) fn as_ptr(&self) -> *mut $raw_ty {
                self.0.as_ptr()
            }

            /// Borrow the pointed-to provider structure.
            ///
            /// # Safety
            ///
            /// The handle must not have been destroyed.
            #[inline]
            pub(crate) unsafe fn as_ref(&self) -> &$raw_ty {
                self.0.as_ref()
            }
        }

        // SAFETY: provider handles may move between and be read from any
        // thread; mutation and destruction discipline is enforced by the
        // owning types.
        unsafe impl Send for $wrapper_ty {}
        unsafe impl Sync for $wrapper_ty {}
    };
}
