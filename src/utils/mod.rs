#[macro_use]
mod boilerplate;

/// Provide interoperability with C socket addresses and file descriptors.
pub(crate) mod interop;
