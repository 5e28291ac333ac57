//! Schedule date parsing.
//!
//! Dates are `YYYY-MM-DD`. A start date may carry strides,
//! `YYYY-MM-DD/dayStride[/weekStride]`, thinning matches to every Nth day
//! (or week) counted from the start date. `*` means unbounded.

use chrono::NaiveDate;
use chronod_core::{ChronodError, Result};

/// A schedule's lower bound plus its stride settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartDate {
    /// None = no lower bound (and strides are meaningless, fixed at 1).
    pub date: Option<NaiveDate>,
    pub day_stride: u32,
    pub week_stride: u32,
}

impl StartDate {
    pub fn unbounded() -> Self {
        Self {
            date: None,
            day_stride: 1,
            week_stride: 1,
        }
    }
}

/// Parse a start date field, `*` or `YYYY-MM-DD[/d[/w]]`.
pub fn parse_start_date(src: &str) -> Result<StartDate> {
    let src = src.trim();
    if src == "*" {
        return Ok(StartDate::unbounded());
    }
    let mut parts = src.split('/');
    let date = parse_date(parts.next().unwrap_or_default())?;
    let day_stride = match parts.next() {
        Some(s) => parse_stride(s, src)?,
        None => 1,
    };
    let week_stride = match parts.next() {
        Some(s) => parse_stride(s, src)?,
        None => 1,
    };
    if parts.next().is_some() {
        return Err(ChronodError::Validation(format!(
            "too many stride segments in '{src}'"
        )));
    }
    Ok(StartDate {
        date: Some(date),
        day_stride,
        week_stride,
    })
}

/// Parse an end date field, `*` or `YYYY-MM-DD`. The end date is exclusive.
pub fn parse_end_date(src: &str) -> Result<Option<NaiveDate>> {
    let src = src.trim();
    if src == "*" {
        return Ok(None);
    }
    parse_date(src).map(Some)
}

fn parse_date(src: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(src.trim(), "%Y-%m-%d")
        .map_err(|_| ChronodError::Validation(format!("bad date '{src}', expected YYYY-MM-DD")))
}

fn parse_stride(s: &str, src: &str) -> Result<u32> {
    let n: u32 = s
        .trim()
        .parse()
        .map_err(|_| ChronodError::Validation(format!("bad stride in '{src}'")))?;
    if n == 0 {
        return Err(ChronodError::Validation(format!("zero stride in '{src}'")));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_date() {
        let d = parse_start_date("2026-03-01").unwrap();
        assert_eq!(d.date, NaiveDate::from_ymd_opt(2026, 3, 1));
        assert_eq!(d.day_stride, 1);
        assert_eq!(d.week_stride, 1);
    }

    #[test]
    fn test_strided_start() {
        let d = parse_start_date("2026-03-01/3/2").unwrap();
        assert_eq!(d.day_stride, 3);
        assert_eq!(d.week_stride, 2);
    }

    #[test]
    fn test_star_is_unbounded() {
        assert_eq!(parse_start_date("*").unwrap(), StartDate::unbounded());
        assert_eq!(parse_end_date("*").unwrap(), None);
    }

    #[test]
    fn test_invalid_dates() {
        assert!(parse_start_date("2026-13-01").is_err());
        assert!(parse_start_date("2026-02-30").is_err());
        assert!(parse_start_date("2026-03-01/0").is_err());
        assert!(parse_start_date("2026-03-01/1/1/1").is_err());
        assert!(parse_end_date("yesterday").is_err());
    }
}
