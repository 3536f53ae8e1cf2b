// SPDX-License-Identifier: Apache-2.0

//! Utility functions shared across the daemon.

/// Current unix time in whole seconds.
///
/// Returns 0 if the system clock is before the epoch, which only happens on
/// a badly misconfigured host.
pub fn now_unix_secs() -> i64 {
    std::time::UNIX_EPOCH
        .elapsed()
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Parses and validates a metric key or log path.
///
/// Keys end up embedded in a newline-delimited text protocol, so anything
/// containing whitespace or control characters would corrupt the stream and
/// is rejected at decode time. Surrounding whitespace is trimmed.
///
/// # Examples
///
/// ```
/// use logd::util::parse_stat_key;
///
/// assert_eq!(parse_stat_key("api.requests"), Some("api.requests".to_string()));
/// assert_eq!(parse_stat_key("  my/app.log "), Some("my/app.log".to_string()));
/// assert_eq!(parse_stat_key("bad key"), None);
/// assert_eq!(parse_stat_key(""), None);
/// ```
pub fn parse_stat_key(key: &str) -> Option<String> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed
        .chars()
        .any(|ch| ch.is_whitespace() || ch.is_control())
    {
        return None;
    }

    Some(trimmed.to_string())
}

/// Tracks the received-datagram total between heartbeat ticks.
///
/// `advance` returns how many arrived since the previous call, or `None`
/// when the total did not move, so idle periods stay out of the log.
#[derive(Debug, Default)]
pub struct ThroughputWindow {
    last_seen: u64,
}

impl ThroughputWindow {
    pub fn advance(&mut self, total: u64) -> Option<u64> {
        if total == self.last_seen {
            return None;
        }
        let window = total.saturating_sub(self.last_seen);
        self.last_seen = total;
        Some(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_key_valid() {
        assert_eq!(parse_stat_key("requests"), Some("requests".to_string()));
        assert_eq!(
            parse_stat_key("api.requests.2xx"),
            Some("api.requests.2xx".to_string())
        );
        assert_eq!(
            parse_stat_key("service/web.log"),
            Some("service/web.log".to_string())
        );
    }

    #[test]
    fn test_parse_stat_key_trims() {
        assert_eq!(parse_stat_key("  requests\t"), Some("requests".to_string()));
    }

    #[test]
    fn test_parse_stat_key_rejects_whitespace_and_control() {
        assert_eq!(parse_stat_key("two words"), None);
        assert_eq!(parse_stat_key("line\nbreak"), None);
        assert_eq!(parse_stat_key("nul\0byte"), None);
        assert_eq!(parse_stat_key("   "), None);
        assert_eq!(parse_stat_key(""), None);
    }

    #[test]
    fn test_throughput_window_reports_only_on_change() {
        let mut window = ThroughputWindow::default();
        assert_eq!(window.advance(0), None);
        assert_eq!(window.advance(5), Some(5));
        // Nothing new arrived: the heartbeat stays quiet.
        assert_eq!(window.advance(5), None);
        assert_eq!(window.advance(12), Some(7));
    }

    #[test]
    fn test_now_unix_secs_is_sane() {
        // 2020-01-01 as a floor; anything earlier means a broken clock.
        assert!(now_unix_secs() > 1_577_836_800);
    }
}
