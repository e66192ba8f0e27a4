use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    secs_since_epoch(SystemTime::now())
}

/// Converts a `SystemTime` to whole seconds since the unix epoch. Times before
/// the epoch collapse to zero.
#[inline]
pub fn secs_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_secs_since_epoch() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(1234);
        assert_eq!(secs_since_epoch(time), 1234);
    }

    #[test]
    fn test_secs_before_epoch_collapse() {
        let time = SystemTime::UNIX_EPOCH - Duration::from_secs(10);
        assert_eq!(secs_since_epoch(time), 0);
    }
}
