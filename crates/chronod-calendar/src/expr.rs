//! Single-field recurrence expression parser.
//!
//! A field is an optional run of modifier prefixes followed by a
//! comma-separated list of terms: `*`, a single value, a 3-letter name,
//! a range `a-b` (wrapping upward past the maximum when `b < a`), or a
//! stride `a/n`. Hour fields additionally accept `am`/`pm` suffixes.

use chronod_core::{ChronodError, Result};
use std::collections::BTreeSet;

/// Direction preference for nearest-weekday resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NearestDir {
    /// Search both directions at once; ties break toward the earlier day.
    Either,
    /// Prefer the earlier day.
    Before,
    /// Prefer the later day.
    After,
}

/// Modifier prefixes attached to one field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefixes {
    /// Count values from the end (last day of month = 1, last row = 1).
    pub reverse: bool,
    /// Restrict week-row matching to complete weeks only.
    pub full_weeks: bool,
    /// Resolve a non-matching weekday to the nearest matching one.
    pub nearest: Option<NearestDir>,
}

/// One parsed and validated field. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldExpr {
    /// Ascending, duplicate-free, all within the field's [min, max].
    pub values: Vec<u32>,
    pub prefixes: Prefixes,
    pub source: String,
}

impl FieldExpr {
    pub fn contains(&self, v: u32) -> bool {
        self.values.binary_search(&v).is_ok()
    }
}

/// Per-field parse settings supplied by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions<'a> {
    /// Name → value map (lowercase 3-letter month or weekday abbreviations).
    pub names: &'a [(&'a str, u32)],
    /// Accept `am`/`pm` suffixes on plain values.
    pub am_pm: bool,
    pub allow_reverse: bool,
    pub allow_full_weeks: bool,
    pub allow_nearest: bool,
}

/// Lowercase month abbreviations, value = month number.
pub const MONTH_NAMES: [(&str, u32); 12] = [
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

/// Weekday abbreviations in Sunday-first order.
pub const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Weekday name → 1-based position map for a given week start day
/// (0 = Sunday .. 6 = Saturday). With `base_weekday = 1` (Monday),
/// "mon" maps to 1 and "sun" maps to 7.
pub fn weekday_positions(base_weekday: u32) -> Vec<(&'static str, u32)> {
    (0..7u32)
        .map(|i| {
            let name = WEEKDAY_NAMES[((base_weekday + i) % 7) as usize];
            (name, i + 1)
        })
        .collect()
}

/// Parse one field into its expanded value set.
pub fn parse_field(src: &str, min: u32, max: u32, opts: &ParseOptions<'_>) -> Result<FieldExpr> {
    let original = src.to_string();
    let mut rest = src.trim().to_ascii_lowercase();
    let mut prefixes = Prefixes::default();

    // Modifier prefixes come before the term list, in any order.
    loop {
        if opts.allow_nearest && prefixes.nearest.is_none() {
            if let Some(r) = rest.strip_prefix("n-") {
                prefixes.nearest = Some(NearestDir::Before);
                rest = r.to_string();
                continue;
            }
            if let Some(r) = rest.strip_prefix("n+") {
                prefixes.nearest = Some(NearestDir::After);
                rest = r.to_string();
                continue;
            }
            if let Some(r) = rest.strip_prefix('n') {
                prefixes.nearest = Some(NearestDir::Either);
                rest = r.to_string();
                continue;
            }
        }
        if opts.allow_reverse && !prefixes.reverse {
            if let Some(r) = rest.strip_prefix('r') {
                prefixes.reverse = true;
                rest = r.to_string();
                continue;
            }
        }
        if opts.allow_full_weeks && !prefixes.full_weeks {
            // No term in a week-row field starts with 'f', so this is safe.
            if let Some(r) = rest.strip_prefix('f') {
                prefixes.full_weeks = true;
                rest = r.to_string();
                continue;
            }
        }
        break;
    }

    let mut set = BTreeSet::new();

    if rest == "*" {
        set.extend(min..=max);
    } else {
        for term in rest.split(',') {
            let term = term.trim();
            if term.is_empty() {
                return Err(ChronodError::Validation(format!(
                    "empty term in expression '{original}'"
                )));
            }
            if let Some((a, b)) = term.split_once('-') {
                if a.contains('/') || b.contains('/') {
                    return Err(ChronodError::Validation(format!(
                        "range cannot carry a stride in '{original}'"
                    )));
                }
                let lo = resolve_value(a, min, max, opts, &original)?;
                let hi = resolve_value(b, min, max, opts, &original)?;
                // A descending range wraps past max back to min.
                let mut v = lo;
                loop {
                    set.insert(v);
                    if v == hi {
                        break;
                    }
                    v += 1;
                    if v > max {
                        v = min;
                    }
                }
            } else if let Some((a, n)) = term.split_once('/') {
                let base = resolve_value(a, min, max, opts, &original)?;
                let step: u32 = n.parse().map_err(|_| {
                    ChronodError::Validation(format!("bad stride '{n}' in '{original}'"))
                })?;
                if step == 0 {
                    return Err(ChronodError::Validation(format!(
                        "zero stride in '{original}'"
                    )));
                }
                let mut v = base;
                while v <= max {
                    set.insert(v);
                    v += step;
                }
            } else {
                set.insert(resolve_value(term, min, max, opts, &original)?);
            }
        }
    }

    if set.is_empty() {
        return Err(ChronodError::Validation(format!(
            "expression '{original}' expands to nothing"
        )));
    }

    Ok(FieldExpr {
        values: set.into_iter().collect(),
        prefixes,
        source: original,
    })
}

/// Resolve one token to a number: a name, an am/pm hour, or a plain value.
fn resolve_value(
    token: &str,
    min: u32,
    max: u32,
    opts: &ParseOptions<'_>,
    original: &str,
) -> Result<u32> {
    let token = token.trim();

    for (name, value) in opts.names {
        if token == *name {
            return check_range(*value, min, max, original);
        }
    }

    if opts.am_pm {
        if let Some(h) = token.strip_suffix("am") {
            let h = parse_num(h, original)?;
            if !(1..=12).contains(&h) {
                return Err(ChronodError::Validation(format!(
                    "hour '{token}' out of am range in '{original}'"
                )));
            }
            return check_range(if h == 12 { 0 } else { h }, min, max, original);
        }
        if let Some(h) = token.strip_suffix("pm") {
            let h = parse_num(h, original)?;
            if !(1..=12).contains(&h) {
                return Err(ChronodError::Validation(format!(
                    "hour '{token}' out of pm range in '{original}'"
                )));
            }
            return check_range(if h == 12 { 12 } else { h + 12 }, min, max, original);
        }
    }

    check_range(parse_num(token, original)?, min, max, original)
}

fn parse_num(s: &str, original: &str) -> Result<u32> {
    s.trim()
        .parse()
        .map_err(|_| ChronodError::Validation(format!("bad value '{s}' in '{original}'")))
}

fn check_range(v: u32, min: u32, max: u32, original: &str) -> Result<u32> {
    if v < min || v > max {
        return Err(ChronodError::Validation(format!(
            "value {v} outside {min}..{max} in '{original}'"
        )));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> ParseOptions<'static> {
        ParseOptions::default()
    }

    #[test]
    fn test_star_expands_full_range() {
        let f = parse_field("*", 1, 12, &plain()).unwrap();
        assert_eq!(f.values, (1..=12).collect::<Vec<_>>());
    }

    #[test]
    fn test_stride_from_base() {
        let f = parse_field("0/15", 0, 59, &plain()).unwrap();
        assert_eq!(f.values, vec![0, 15, 30, 45]);
    }

    #[test]
    fn test_month_names() {
        let opts = ParseOptions {
            names: &MONTH_NAMES,
            ..Default::default()
        };
        let f = parse_field("Jan,Jul", 1, 12, &opts).unwrap();
        assert_eq!(f.values, vec![1, 7]);
    }

    #[test]
    fn test_ascending_dedup() {
        let f = parse_field("30,10,10,20", 0, 59, &plain()).unwrap();
        assert_eq!(f.values, vec![10, 20, 30]);
    }

    #[test]
    fn test_wrapping_range() {
        let f = parse_field("11-2", 1, 12, &plain()).unwrap();
        assert_eq!(f.values, vec![1, 2, 11, 12]);
    }

    #[test]
    fn test_am_pm_hours() {
        let opts = ParseOptions {
            am_pm: true,
            ..Default::default()
        };
        assert_eq!(parse_field("12am", 0, 23, &opts).unwrap().values, vec![0]);
        assert_eq!(parse_field("12pm", 0, 23, &opts).unwrap().values, vec![12]);
        assert_eq!(parse_field("3pm", 0, 23, &opts).unwrap().values, vec![15]);
        assert!(parse_field("13pm", 0, 23, &opts).is_err());
    }

    #[test]
    fn test_reverse_prefix() {
        let opts = ParseOptions {
            allow_reverse: true,
            ..Default::default()
        };
        let f = parse_field("r1-7", 1, 31, &opts).unwrap();
        assert!(f.prefixes.reverse);
        assert_eq!(f.values, (1..=7).collect::<Vec<_>>());
    }

    #[test]
    fn test_nearest_prefixes() {
        let base = weekday_positions(0);
        let opts = ParseOptions {
            names: &base,
            allow_nearest: true,
            ..Default::default()
        };
        assert_eq!(
            parse_field("n3", 1, 7, &opts).unwrap().prefixes.nearest,
            Some(NearestDir::Either)
        );
        assert_eq!(
            parse_field("n-Wed", 1, 7, &opts).unwrap().prefixes.nearest,
            Some(NearestDir::Before)
        );
        assert_eq!(
            parse_field("n+6", 1, 7, &opts).unwrap().prefixes.nearest,
            Some(NearestDir::After)
        );
    }

    #[test]
    fn test_weekday_positions_follow_week_start() {
        // Monday-start week: mon=1 .. sun=7.
        let map = weekday_positions(1);
        assert!(map.contains(&("mon", 1)));
        assert!(map.contains(&("sun", 7)));
    }

    #[test]
    fn test_rejects_out_of_range_and_malformed() {
        assert!(parse_field("61", 0, 59, &plain()).is_err());
        assert!(parse_field("5-70", 0, 59, &plain()).is_err());
        assert!(parse_field("1-5/2", 0, 59, &plain()).is_err());
        assert!(parse_field("a", 0, 59, &plain()).is_err());
        assert!(parse_field("", 0, 59, &plain()).is_err());
    }

    #[test]
    fn test_disallowed_prefix_is_not_stripped() {
        // Reverse is not allowed here, so "r5" is just a bad value.
        assert!(parse_field("r5", 1, 31, &plain()).is_err());
    }
}
