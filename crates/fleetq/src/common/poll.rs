use std::time::{Duration, Instant};

/// Describes how a repeated observation of an external resource is paced and bounded.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    interval: Duration,
    /// The wait fails after this much time has elapsed.
    deadline: Option<Duration>,
    /// The wait fails after this many observations.
    max_attempts: Option<u32>,
}

impl PollPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            max_attempts: None,
        }
    }

    /// Observes as fast as possible, used for deterministic runs.
    pub fn no_wait() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn start(&self) -> PollState<'_> {
        PollState {
            policy: self,
            started: Instant::now(),
            attempts: 0,
        }
    }
}

/// Progress of a single wait governed by a [`PollPolicy`].
pub struct PollState<'a> {
    policy: &'a PollPolicy,
    started: Instant,
    attempts: u32,
}

impl PollState<'_> {
    /// Records one observation.
    pub fn attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns true if no further observation is allowed.
    pub fn is_exhausted(&self) -> bool {
        let attempts_reached = self
            .policy
            .max_attempts
            .is_some_and(|max| self.attempts >= max);
        let deadline_reached = self
            .policy
            .deadline
            .is_some_and(|deadline| self.elapsed() >= deadline);
        attempts_reached || deadline_reached
    }

    pub async fn sleep(&self) {
        if !self.policy.interval.is_zero() {
            tokio::time::sleep(self.policy.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PollPolicy;
    use std::time::Duration;

    #[test]
    fn unbounded_policy_is_never_exhausted() {
        let policy = PollPolicy::no_wait();
        let mut state = policy.start();
        for _ in 0..100 {
            state.attempt();
        }
        assert!(!state.is_exhausted());
    }

    #[test]
    fn attempts_bound() {
        let policy = PollPolicy::no_wait().with_max_attempts(2);
        let mut state = policy.start();
        state.attempt();
        assert!(!state.is_exhausted());
        state.attempt();
        assert!(state.is_exhausted());
    }

    #[test]
    fn zero_deadline_is_exhausted_immediately() {
        let policy = PollPolicy::new(Duration::from_secs(1)).with_deadline(Duration::ZERO);
        assert!(policy.start().is_exhausted());
    }

    #[tokio::test]
    async fn no_wait_does_not_sleep() {
        let policy = PollPolicy::no_wait();
        let state = policy.start();
        state.sleep().await;
        assert_eq!(policy.interval(), Duration::ZERO);
    }
}
