//! Translation of 5-field cron expressions into systemd `OnCalendar`
//! expressions for timer units.

use anyhow::{bail, Result};

const DOW_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Translate `minute hour day-of-month month day-of-week` into an
/// `OnCalendar` expression (`[dow] *-mon-dom hour:minute:00`).
///
/// Lists (`1,15`), ranges (`1-5`), and step values over the full range
/// (`*/10`) are carried through in systemd's own syntax.
pub fn cron_to_calendar(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        bail!("cron expression must have 5 fields, got {}", fields.len());
    }
    let minute = numeric_field(fields[0], 0, 59, "minute")?;
    let hour = numeric_field(fields[1], 0, 23, "hour")?;
    let dom = numeric_field(fields[2], 1, 31, "day-of-month")?;
    let month = numeric_field(fields[3], 1, 12, "month")?;
    let dow = dow_field(fields[4])?;

    let date = format!("*-{month}-{dom}");
    let time = format!("{hour}:{minute}:00");
    Ok(match dow {
        Some(days) => format!("{days} {date} {time}"),
        None => format!("{date} {time}"),
    })
}

/// Validate a numeric cron field and return it in systemd spelling.
fn numeric_field(field: &str, min: u32, max: u32, what: &str) -> Result<String> {
    if field == "*" {
        return Ok("*".to_string());
    }
    // */n keeps its meaning in systemd calendar syntax.
    if let Some(step) = field.strip_prefix("*/") {
        let step: u32 = step
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid {what} step: {field:?}"))?;
        if step == 0 || step > max {
            bail!("invalid {what} step: {field:?}");
        }
        return Ok(format!("*/{step}"));
    }
    let mut parts = Vec::new();
    for part in field.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_bounded(lo, min, max, what)?;
                let hi = parse_bounded(hi, min, max, what)?;
                if lo > hi {
                    bail!("invalid {what} range: {part:?}");
                }
                parts.push(format!("{lo}..{hi}"));
            }
            None => parts.push(parse_bounded(part, min, max, what)?.to_string()),
        }
    }
    Ok(parts.join(","))
}

fn parse_bounded(s: &str, min: u32, max: u32, what: &str) -> Result<u32> {
    let v: u32 = s
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid {what} value: {s:?}"))?;
    if v < min || v > max {
        bail!("{what} value {v} out of range {min}..={max}");
    }
    Ok(v)
}

/// Day-of-week becomes a leading weekday list; `*` elides the field.
fn dow_field(field: &str) -> Result<Option<String>> {
    if field == "*" {
        return Ok(None);
    }
    let name = |v: u32| -> Result<&'static str> {
        if v > 7 {
            bail!("day-of-week value {v} out of range 0..=7");
        }
        // Both 0 and 7 mean Sunday.
        Ok(DOW_NAMES[(v % 7) as usize])
    };
    let mut parts = Vec::new();
    for part in field.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid day-of-week: {part:?}"))?;
                let hi: u32 = hi
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid day-of-week: {part:?}"))?;
                parts.push(format!("{}..{}", name(lo)?, name(hi)?));
            }
            None => {
                let v: u32 = part
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid day-of-week: {part:?}"))?;
                parts.push(name(v)?.to_string());
            }
        }
    }
    Ok(Some(parts.join(",")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_minute() {
        assert_eq!(cron_to_calendar("* * * * *").unwrap(), "*-*-* *:*:00");
    }

    #[test]
    fn nightly_at_half_past_two() {
        assert_eq!(cron_to_calendar("30 2 * * *").unwrap(), "*-*-* 2:30:00");
    }

    #[test]
    fn weekday_mornings() {
        assert_eq!(
            cron_to_calendar("0 9 * * 1-5").unwrap(),
            "Mon..Fri *-*-* 9:0:00"
        );
    }

    #[test]
    fn sunday_aliases() {
        assert_eq!(
            cron_to_calendar("0 0 * * 0").unwrap(),
            cron_to_calendar("0 0 * * 7").unwrap()
        );
    }

    #[test]
    fn step_minutes() {
        assert_eq!(cron_to_calendar("*/10 * * * *").unwrap(), "*-*-* *:*/10:00");
    }

    #[test]
    fn monthly_on_the_first() {
        assert_eq!(cron_to_calendar("15 6 1 * *").unwrap(), "*-*-1 6:15:00");
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(cron_to_calendar("* * * *").is_err());
        assert!(cron_to_calendar("").is_err());
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(cron_to_calendar("60 * * * *").is_err());
        assert!(cron_to_calendar("* 24 * * *").is_err());
        assert!(cron_to_calendar("* * 0 * *").is_err());
        assert!(cron_to_calendar("* * * 13 *").is_err());
        assert!(cron_to_calendar("* * * * 8").is_err());
    }
}
