//! AQ-010: Append-only JSONL progress log and timestamps.

use super::{ProgressEvent, TimestampedEvent};
use std::io::Write;
use std::path::Path;

/// Current UTC time as ISO 8601 with millisecond precision.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(since_epoch.as_millis() as i64)
}

/// Format milliseconds since the Unix epoch as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
fn format_utc(millis: i64) -> String {
    let secs = millis.div_euclid(1000);
    let (y, m, d) = civil_from_days(secs.div_euclid(86_400));
    let of_day = secs.rem_euclid(86_400);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        y,
        m,
        d,
        of_day / 3600,
        (of_day % 3600) / 60,
        of_day % 60,
        millis.rem_euclid(1000)
    )
}

/// Proleptic Gregorian date for a day count since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

/// Append one progress event as a JSON line, creating parent directories.
pub fn append_event(path: &Path, event: ProgressEvent) -> std::io::Result<()> {
    append_timestamped(
        path,
        &TimestampedEvent {
            ts: now_iso8601(),
            event,
        },
    )
}

/// Append an already-stamped event as a JSON line.
pub fn append_timestamped(path: &Path, event: &TimestampedEvent) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string(event).map_err(std::io::Error::other)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", json)
}

/// Read back every event in a JSONL log, skipping unparsable lines.
pub fn read_events(path: &Path) -> std::io::Result<Vec<TimestampedEvent>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aq010_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
        assert_eq!(ts.len(), 24);
    }

    #[test]
    fn test_aq010_civil_from_days() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        // 2000-02-29 is day 11016
        assert_eq!(civil_from_days(11016), (2000, 2, 29));
        // 2024-12-31 is day 20088
        assert_eq!(civil_from_days(20088), (2024, 12, 31));
    }

    #[test]
    fn test_aq010_format_utc() {
        assert_eq!(format_utc(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_utc(951_786_123_045), "2000-02-29T01:02:03.045Z");
        assert_eq!(format_utc(-1), "1969-12-31T23:59:59.999Z");
    }

    #[test]
    fn test_aq010_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("events.jsonl");
        for i in 1..=3 {
            let event = ProgressEvent::StepCompleted {
                plan_id: "p".to_string(),
                step_id: i,
                row_count: 1,
                elapsed_ms: 2,
            };
            append_event(&path, event).unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.contains("\"event\":\"step_completed\""));

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_aq010_read_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "not json\n\n").unwrap();
        append_event(
            &path,
            ProgressEvent::PlanGenerated {
                plan_id: "p".into(),
                intent: "i".into(),
                steps: 2,
            },
        )
        .unwrap();
        assert_eq!(read_events(&path).unwrap().len(), 1);
    }
}
