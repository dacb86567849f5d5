pub(crate) mod error;

/// Upper bound on the number of concurrently registered threads.
///
/// Per-thread counter arrays and barrier phase slots are allocated eagerly at
/// this length so that scanners can index them without synchronizing with
/// registration. Raising it only costs memory (one cache line per slot per
/// counter array).
pub const MAX_THREADS: usize = 128;
