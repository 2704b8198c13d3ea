//! Trace and segment identifiers plus the generators that mint them.

use std::cell::RefCell;
use std::fmt;
use std::num::ParseIntError;

use rand::{rngs, Rng, SeedableRng};

/// A 16-byte value which identifies a given trace.
///
/// The id is valid if it contains at least one non-zero byte.
#[derive(Clone, PartialEq, Eq, Copy, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// Invalid trace id
    pub const INVALID: TraceId = TraceId(0);

    /// Create a trace id from its representation as a byte array.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        TraceId(u128::from_be_bytes(bytes))
    }

    /// Return the representation of this trace id as a byte array.
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Converts a string in base 16 to a trace id.
    ///
    /// # Examples
    ///
    /// ```
    /// use tracevine::TraceId;
    ///
    /// assert!(TraceId::from_hex("42").is_ok());
    /// assert!(TraceId::from_hex("58406520a006649127e371903a2de979").is_ok());
    ///
    /// assert!(TraceId::from_hex("not_hex").is_err());
    /// ```
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u128::from_str_radix(hex, 16).map(TraceId)
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        TraceId(value)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::LowerHex for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// An 8-byte value which identifies one segment within a trace.
///
/// The root segment's id doubles as the transaction guid. The id is valid if
/// it contains at least one non-zero byte.
#[derive(Clone, PartialEq, Eq, Copy, Hash)]
pub struct SegmentId(u64);

impl SegmentId {
    /// Invalid segment id
    pub const INVALID: SegmentId = SegmentId(0);

    /// Create a segment id from its representation as a byte array.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        SegmentId(u64::from_be_bytes(bytes))
    }

    /// Return the representation of this segment id as a byte array.
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Converts a string in base 16 to a segment id.
    ///
    /// # Examples
    ///
    /// ```
    /// use tracevine::SegmentId;
    ///
    /// assert!(SegmentId::from_hex("42").is_ok());
    /// assert!(SegmentId::from_hex("58406520a0066491").is_ok());
    ///
    /// assert!(SegmentId::from_hex("not_hex").is_err());
    /// ```
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u64::from_str_radix(hex, 16).map(SegmentId)
    }
}

impl From<u64> for SegmentId {
    fn from(value: u64) -> Self {
        SegmentId(value)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::LowerHex for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Interface for generating IDs
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new `TraceId`
    fn new_trace_id(&self) -> TraceId;

    /// Generate a new `SegmentId`
    fn new_segment_id(&self) -> SegmentId;
}

/// Default [`IdGenerator`] implementation.
///
/// Generates trace and segment ids using a random number generator.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| TraceId::from(rng.borrow_mut().random::<u128>()))
    }

    fn new_segment_id(&self) -> SegmentId {
        CURRENT_RNG.with(|rng| SegmentId::from(rng.borrow_mut().random::<u64>()))
    }
}

/// Draws a sampling priority uniformly from `[0, 1)`.
pub(crate) fn random_priority() -> f64 {
    CURRENT_RNG.with(|rng| rng.borrow_mut().random::<f64>())
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_os_rng());
}

#[cfg(any(feature = "testing", test))]
pub use increment::IncrementIdGenerator;

#[cfg(any(feature = "testing", test))]
mod increment {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use super::{IdGenerator, SegmentId, TraceId};

    /// [`IdGenerator`] implementation that increments a counter for each new ID. This helps produce
    /// predictable IDs for testing.
    #[derive(Clone, Debug)]
    pub struct IncrementIdGenerator(Arc<AtomicU64>);

    impl IncrementIdGenerator {
        /// Create a new [`IncrementIdGenerator`]
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Default for IncrementIdGenerator {
        fn default() -> Self {
            Self(Arc::new(AtomicU64::new(1)))
        }
    }

    impl IdGenerator for IncrementIdGenerator {
        fn new_trace_id(&self) -> TraceId {
            TraceId::from(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) as u128)
        }

        fn new_segment_id(&self) -> SegmentId {
            SegmentId::from(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
        }
    }
}
