//! Sampling decides at transaction start whether the finished tree will be
//! exported. Unsampled transactions still run fully (segments, naming, and
//! error bookkeeping all behave identically); they are just dropped at
//! finalize instead of handed to the exporters.

/// The sampling strategies supported by the agent.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub enum Sampler {
    /// Export every transaction.
    AlwaysOn,
    /// Export no transactions.
    AlwaysOff,
    /// Export the given fraction of transactions, decided by each
    /// transaction's sampling priority. Ratios outside `[0.0, 1.0]` are
    /// clamped.
    PriorityRatio(f64),
}

impl Sampler {
    /// Decides whether a transaction with the given priority is exported.
    ///
    /// Priorities are drawn uniformly from `[0, 1)` at transaction start, so
    /// `PriorityRatio(r)` keeps a fraction `r` of transactions.
    pub(crate) fn should_sample(&self, priority: f64) -> bool {
        match self {
            Sampler::AlwaysOn => true,
            Sampler::AlwaysOff => false,
            Sampler::PriorityRatio(ratio) => priority < ratio.clamp(0.0, 1.0),
        }
    }
}
