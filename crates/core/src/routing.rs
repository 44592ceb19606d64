use crate::policy::HandlerName;
use crate::suspension::Suspension;

/// Hard cap on supervisor passes per user request. A safety valve against a
/// misbehaving classifier looping handler and supervisor forever, not a
/// correctness mechanism.
pub const MAX_TURNS: i64 = 3;

/// Outcome of one supervisor pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Dispatch(HandlerName),
    Finish,
}

/// Per-conversation routing state: the loop-prevention counter and the
/// at-most-one pending suspension. Persisted alongside the transcript so a
/// parked conversation survives process restarts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoutingState {
    pub turn_count: i64,
    pub pending_suspension: Option<Suspension>,
}

impl RoutingState {
    /// A fresh user message starts a new top-level request, so the budget
    /// resets. A resolution does not: it continues the same request.
    pub fn begin_user_turn(&mut self) {
        self.turn_count = 0;
    }

    /// Every pass through the supervisor counts, including the decision to
    /// terminate.
    pub fn record_dispatch(&mut self) {
        self.turn_count += 1;
    }

    pub fn budget_exhausted(&self) -> bool {
        self.turn_count >= MAX_TURNS
    }
}
