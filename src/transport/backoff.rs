use crate::shutdown::CancellationToken;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    /// `None` retries forever
    max_retries: Option<u32>,
    current_attempt: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BackoffStop {
    Exhausted,
    Cancelled,
}

impl std::fmt::Display for BackoffStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStop::Exhausted => write!(f, "Maximum retry attempts exceeded"),
            BackoffStop::Cancelled => write!(f, "Retry cancelled"),
        }
    }
}

impl std::error::Error for BackoffStop {}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: Option<u32>) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    /// Delay for the next attempt, or `None` once retries are used up
    pub fn next_delay(&self) -> Option<Duration> {
        if let Some(max) = self.max_retries {
            if self.current_attempt >= max {
                return None;
            }
        }

        let factor = 2_u32.saturating_pow(self.current_attempt.min(16));
        Some(std::cmp::min(
            self.initial_delay.saturating_mul(factor),
            self.max_delay,
        ))
    }

    /// Sleep for the next delay. Returns early with `Cancelled` if the token fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), BackoffStop> {
        let delay = self.next_delay().ok_or(BackoffStop::Exhausted)?;

        match self.max_retries {
            Some(max) => log::warn!(
                "⏳ Retry attempt {} of {} in {:?}",
                self.current_attempt + 1,
                max,
                delay
            ),
            None => log::warn!("⏳ Retry attempt {} in {:?}", self.current_attempt + 1, delay),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(BackoffStop::Cancelled),
            _ = sleep(delay) => {}
        }

        self.current_attempt += 1;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(2),
            Duration::from_secs(10),
            None,
        );
        let mut delays = Vec::new();
        for _ in 0..5 {
            delays.push(backoff.next_delay().unwrap());
            backoff.current_attempt += 1;
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
    }

    #[tokio::test]
    async fn test_bounded_backoff_exhausts() {
        let cancel = CancellationToken::new();
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
            Some(2),
        );
        assert_eq!(backoff.wait(&cancel).await, Ok(()));
        assert_eq!(backoff.wait(&cancel).await, Ok(()));
        assert_eq!(backoff.wait(&cancel).await, Err(BackoffStop::Exhausted));

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay().is_some());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            None,
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), backoff.wait(&cancel)).await;
        assert_eq!(result.unwrap(), Err(BackoffStop::Cancelled));
    }
}
