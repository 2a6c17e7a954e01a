//! Start/end time parsing for clip and audio requests.
//!
//! Two input forms are accepted: a clock string `[HH:]MM:SS[.fraction]` and a
//! plain decimal number of seconds. Everything here is pure.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{Error, Result};

static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<h>\d+):)?(?P<m>\d+):(?P<s>\d+(?:\.\d+)?)$").unwrap()
});
static SECONDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d+(?:\.\d*)?|\.\d+)$").unwrap());

/// How long the derived artifact runs from its start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Span {
    Seconds(f64),
    /// Run to the end of the input; the processor knows the true length.
    ToEnd,
}

/// Normalized time range: absolute start plus a duration or the to-end sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeRange {
    pub start: f64,
    pub span: Span,
}

impl TimeRange {
    /// Absolute end time, when known.
    pub fn end(&self) -> Option<f64> {
        match self.span {
            Span::Seconds(d) => Some(self.start + d),
            Span::ToEnd => None,
        }
    }
}

/// Parse a single time specification into seconds.
pub fn parse_time(spec: &str) -> Result<f64> {
    let s = spec.trim();
    if s.is_empty() {
        return Err(Error::Input("empty time value".to_string()));
    }
    if s.starts_with('-') {
        return Err(Error::Input(format!("negative time value: {spec}")));
    }

    if s.contains(':') {
        let caps = CLOCK_RE
            .captures(s)
            .ok_or_else(|| Error::Input(format!("malformed clock time: {spec}")))?;

        let hours: f64 = match caps.name("h") {
            Some(h) => parse_component(h.as_str(), spec)?,
            None => 0.0,
        };
        let minutes = parse_component(&caps["m"], spec)?;
        let seconds = parse_component(&caps["s"], spec)?;

        if minutes >= 60.0 {
            return Err(Error::Input(format!("minutes out of range in {spec}")));
        }
        if seconds >= 60.0 {
            return Err(Error::Input(format!("seconds out of range in {spec}")));
        }
        return Ok(hours * 3600.0 + minutes * 60.0 + seconds);
    }

    if !SECONDS_RE.is_match(s) {
        return Err(Error::Input(format!("not a time value: {spec}")));
    }
    parse_component(s, spec)
}

fn parse_component(part: &str, spec: &str) -> Result<f64> {
    part.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::Input(format!("non-numeric time component in {spec}")))
}

/// Normalize a start and optional end into a [`TimeRange`].
///
/// Both times are rounded to whole milliseconds, the precision artifacts are
/// named and cut at. `end` must still be strictly after `start` after
/// rounding; without it the range runs to the end.
pub fn resolve(start: &str, end: Option<&str>) -> Result<TimeRange> {
    let start_secs = to_millis(parse_time(start)?);
    let span = match end {
        Some(end) => {
            let end_secs = to_millis(parse_time(end)?);
            if end_secs <= start_secs {
                return Err(Error::Input(format!(
                    "end ({end}) must be after start ({start})"
                )));
            }
            Span::Seconds(end_secs - start_secs)
        }
        None => Span::ToEnd,
    };
    Ok(TimeRange {
        start: start_secs,
        span,
    })
}

fn to_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

/// `HH:MM:SS.mmm`, millisecond precision.
pub fn format_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let h = total_ms / 3_600_000;
    let m = (total_ms / 60_000) % 60;
    let s = (total_ms / 1000) % 60;
    let ms = total_ms % 1000;
    format!("{:02}:{:02}:{:02}.{:03}", h, m, s, ms)
}

/// `HH:MM:SS`, for human-facing listings.
pub fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_strings() {
        assert_eq!(parse_time("00:01:30").unwrap(), 90.0);
        assert_eq!(parse_time("00:00:10.5").unwrap(), 10.5);
        assert_eq!(parse_time("01:30").unwrap(), 90.0);
        assert_eq!(parse_time("1:02:03.25").unwrap(), 3723.25);
        assert_eq!(parse_time("100:00:00").unwrap(), 360_000.0);
    }

    #[test]
    fn test_clock_matches_component_sum() {
        for h in [0u32, 1, 7, 23] {
            for m in [0u32, 9, 59] {
                for (s, frac) in [(0u32, 0u32), (5, 250), (59, 999)] {
                    let spec = format!("{h}:{m:02}:{s:02}.{frac:03}");
                    let expected = h as f64 * 3600.0 + m as f64 * 60.0 + s as f64 + frac as f64 / 1000.0;
                    let got = parse_time(&spec).unwrap();
                    assert!((got - expected).abs() < 1e-9, "{spec}: {got} != {expected}");
                }
            }
        }
    }

    #[test]
    fn test_plain_seconds() {
        assert_eq!(parse_time("42").unwrap(), 42.0);
        assert_eq!(parse_time("12.75").unwrap(), 12.75);
        assert_eq!(parse_time(" 3 ").unwrap(), 3.0);
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "abc", "1:xx", "aa:bb:cc", "1:2:3:4", "00:60:00", "00:00:60", "-5", "-00:01", "1e3", "nan", "inf"] {
            assert!(matches!(parse_time(bad), Err(Error::Input(_))), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_resolve_with_end() {
        let range = resolve("00:00:05", Some("00:00:15")).unwrap();
        assert_eq!(range.start, 5.0);
        assert_eq!(range.span, Span::Seconds(10.0));
        assert_eq!(range.end(), Some(15.0));
    }

    #[test]
    fn test_resolve_mixed_forms() {
        let range = resolve("01:30", Some("120")).unwrap();
        assert_eq!(range.start, 90.0);
        assert_eq!(range.span, Span::Seconds(30.0));
    }

    #[test]
    fn test_resolve_without_end_runs_to_end() {
        let range = resolve("10", None).unwrap();
        assert_eq!(range.span, Span::ToEnd);
        assert_eq!(range.end(), None);
    }

    #[test]
    fn test_end_not_after_start_fails() {
        for (s, e) in [("10", "10"), ("10", "5"), ("00:01:00", "59.999"), ("0", "0")] {
            assert!(matches!(resolve(s, Some(e)), Err(Error::Input(_))), "{s}..{e}");
        }
    }

    #[test]
    fn test_resolve_rounds_to_milliseconds() {
        assert_eq!(resolve("5.0001", None).unwrap().start, 5.0);
        assert_eq!(resolve("5.0004", None).unwrap().start, 5.0);
        assert_eq!(resolve("00:00:01.2346", None).unwrap().start, 1.235);
        // equal once rounded, so there is nothing left to cut
        assert!(matches!(resolve("5.0001", Some("5.0004")), Err(Error::Input(_))));
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0.0), "00:00:00.000");
        assert_eq!(format_time(90.5), "00:01:30.500");
        assert_eq!(format_time(3723.25), "01:02:03.250");
        assert_eq!(format_clock(3723.6), "01:02:04");
    }
}
