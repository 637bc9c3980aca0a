/// Restricts aggregation to a single cgroup. A target of 0 matches everything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    target: u64,
}

impl ScopeFilter {
    pub const ALL: Self = Self { target: 0 };

    pub const fn new(target: u64) -> Self {
        Self { target }
    }

    pub const fn target(&self) -> u64 {
        self.target
    }

    #[inline(always)]
    pub const fn matches(&self, current_scope: u64) -> bool {
        self.target == 0 || self.target == current_scope
    }
}

/// Discard policy applied to completed calls before they are emitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutcomeFilter {
    include_failed: bool,
}

impl OutcomeFilter {
    pub const fn new(include_failed: bool) -> Self {
        Self { include_failed }
    }

    /// Negative outcomes are failures and only pass when explicitly included.
    #[inline(always)]
    pub const fn admits(&self, outcome: i64) -> bool {
        self.include_failed || outcome >= 0
    }
}
