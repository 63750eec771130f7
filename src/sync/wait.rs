use std::time::Duration;

/// A bounded wait: total budget plus fixed poll cadence. Both the state
/// query and the command-confirmation paths run on this.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Number of sleep intervals that fit in the budget, at least one.
    pub fn attempts(&self) -> u64 {
        let timeout = self.timeout.as_millis();
        let interval = self.interval.as_millis().max(1);
        (timeout.div_ceil(interval)).max(1) as u64
    }
}

/// Probe immediately, then once per interval until the budget is spent.
/// Returns `None` when every probe came up empty. The probe must not block:
/// callers snapshot shared state and return, keeping the inbound path free.
pub async fn poll_until<T, F>(policy: WaitPolicy, mut probe: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    for _ in 0..policy.attempts() {
        if let Some(found) = probe() {
            return Some(found);
        }
        tokio::time::sleep(policy.interval).await;
    }
    probe()
}
