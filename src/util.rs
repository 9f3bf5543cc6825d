use std::time::SystemTime;

use time::OffsetDateTime;
use time::macros::format_description;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub fn format_timestamp(ts: Option<i64>) -> String {
    match ts {
        Some(value) => {
            let datetime = OffsetDateTime::from_unix_timestamp(value)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH);
            datetime
                .format(format_description!(
                    "[year]-[month]-[day] [hour]:[minute]:[second]"
                ))
                .unwrap_or_else(|_| value.to_string())
        }
        None => "-".to_string(),
    }
}

/// Compact stamp used in image filenames, e.g. `20250102_030405`.
pub fn file_stamp(ts: i64) -> String {
    let datetime = OffsetDateTime::from_unix_timestamp(ts).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    datetime
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| ts.to_string())
}

/// Truncate to `max` terminal columns, marking the cut with an ellipsis.
pub fn truncate(text: &str, max: usize) -> String {
    let single_line = text.replace(['\n', '\r'], " ");
    if single_line.width() <= max {
        return single_line;
    }
    let budget = max.saturating_sub(3);
    let mut used = 0;
    let mut out = String::new();
    for ch in single_line.chars() {
        let width = ch.width().unwrap_or(0);
        if used + width > budget {
            break;
        }
        used += width;
        out.push(ch);
    }
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_timestamp_renders_utc() {
        assert_eq!(format_timestamp(Some(0)), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(None), "-");
    }

    #[test]
    fn file_stamp_is_compact() {
        assert_eq!(file_stamp(1_735_787_045), "20250102_030405");
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer prompt", 10), "a much ...");
        assert_eq!(truncate("two\nlines", 20), "two lines");
        assert_eq!(truncate("猫が座っている写真", 9), "猫が座...");
    }
}
