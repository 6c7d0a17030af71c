// src/utils.rs

//! Small helpers shared across the crate.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{Error, Result};

mod time;

pub use time::Time;

/// Async utilities
pub mod async_utils {
    use super::*;

    /// Execute a future with a timeout
    pub async fn with_timeout<F, T>(future: F, timeout_duration: Duration) -> Result<T>
    where
        F: Future<Output = T>,
    {
        timeout(timeout_duration, future)
            .await
            .map_err(|_| Error::timeout("Operation timed out"))
    }
}

/// Timing utilities
pub mod timing {
    use super::*;

    /// Convert duration to human-readable string
    pub fn duration_to_human(duration: Duration) -> String {
        let total_seconds = duration.as_secs();
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;
        let millis = duration.subsec_millis();

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else if seconds > 0 {
            format!("{}.{:03}s", seconds, millis)
        } else {
            format!("{}ms", millis)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_to_human() {
        assert_eq!(timing::duration_to_human(Duration::from_millis(500)), "500ms");
        assert_eq!(timing::duration_to_human(Duration::from_secs(1)), "1.000s");
        assert_eq!(timing::duration_to_human(Duration::from_secs(61)), "1m 1s");
        assert_eq!(timing::duration_to_human(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_with_timeout_completes() {
        let result = tokio_test::block_on(async_utils::with_timeout(
            async { 7 },
            Duration::from_secs(1),
        ));
        assert_eq!(tokio_test::assert_ok!(result), 7);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = async_utils::with_timeout(
            tokio::time::sleep(Duration::from_millis(200)),
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(
            result.unwrap_err().kind,
            crate::error::ErrorKind::Timeout
        ));
    }
}
