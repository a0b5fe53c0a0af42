use std::time::Duration;

/// Counters of the relay's activity.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FacilitatorMetrics {
    pub compute_time: Duration,

    pub forwards: u64,
    pub backwards: u64,
    pub validations: u64,
    pub rejected: u64,
}

impl FacilitatorMetrics {
    #[inline]
    pub fn record_forward(&mut self, took: Duration) {
        self.forwards += 1;
        self.compute_time += took;
    }

    #[inline]
    pub fn record_backward(&mut self, took: Duration) {
        self.backwards += 1;
        self.compute_time += took;
    }

    #[inline]
    pub fn bump_validations(&mut self) {
        self.validations += 1;
    }

    #[inline]
    pub fn bump_rejected(&mut self) {
        self.rejected += 1;
    }
}
