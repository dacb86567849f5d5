/// The error type for thread registration.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// Every identifier in `[0, MAX_THREADS)` is held by a live thread.
    ///
    /// Registration cannot succeed until some registered thread deregisters
    /// and returns its identifier to the free pool.
    #[error("thread registry is full: all {0} identifiers are in use")]
    ThreadCapExceeded(usize),

    /// The calling thread already holds an identifier.
    ///
    /// Registration is per-thread; drop the existing [`Registration`][reg]
    /// before registering again.
    ///
    /// [reg]: crate::registry::Registration
    #[error("thread is already registered")]
    DoubleRegister,
}
