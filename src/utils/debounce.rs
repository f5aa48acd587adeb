use std::future::pending;
use tokio::time::{sleep_until, Duration, Instant};

/// Deadline tracker for debounced work: every `reset` pushes the deadline
/// out by the full window, `expired` resolves once the window has been
/// silent. Unarmed gates never fire.
pub struct DebounceGate {
    window: Duration,
    deadline: Option<Instant>,
}

impl DebounceGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    pub fn reset(&mut self) {
        self.deadline = Some(Instant::now() + self.window);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Current deadline, for select loops that need an owned future.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves when the armed deadline passes; pends forever if unarmed.
    /// Intended for use inside `tokio::select!`.
    pub async fn expired(&self) {
        wait_until(self.deadline).await
    }
}

/// Sleeps until the deadline, or forever when there is none. Takes the
/// deadline by value so the future borrows nothing.
pub async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Minimum-interval guard. `try_pass` succeeds at most once per interval;
/// rejected calls do not push the window out.
pub struct Cooldown {
    min_interval: Duration,
    last_pass: Option<Instant>,
}

impl Cooldown {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_pass: None,
        }
    }

    pub fn try_pass(&mut self) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_pass {
            if now.duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last_pass = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn gate_fires_after_silent_window() {
        let mut gate = DebounceGate::new(Duration::from_millis(500));
        gate.reset();
        advance(Duration::from_millis(300)).await;
        gate.reset();

        // 300ms after the second reset the original deadline has passed but
        // the pushed-out one has not.
        advance(Duration::from_millis(300)).await;
        assert!(gate.is_armed());
        tokio::select! {
            _ = gate.expired() => panic!("fired before the window was silent"),
            _ = tokio::time::sleep(Duration::from_millis(1)) => {}
        }

        advance(Duration::from_millis(250)).await;
        gate.expired().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_gate_never_fires() {
        let mut gate = DebounceGate::new(Duration::from_millis(100));
        gate.reset();
        gate.cancel();
        assert!(!gate.is_armed());
        advance(Duration::from_millis(500)).await;
        tokio::select! {
            _ = gate.expired() => panic!("cancelled gate fired"),
            _ = tokio::time::sleep(Duration::from_millis(1)) => {}
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_rejects_within_interval() {
        let mut cd = Cooldown::new(Duration::from_millis(500));
        assert!(cd.try_pass());
        advance(Duration::from_millis(100)).await;
        assert!(!cd.try_pass());
        // The rejection must not extend the window.
        advance(Duration::from_millis(400)).await;
        assert!(cd.try_pass());
    }
}
