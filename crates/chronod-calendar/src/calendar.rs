//! Month calendar construction and next-trigger computation.
//!
//! The engine owns one subject's schedule list (append-only, ids stable)
//! and exception map, caches built months in a rolling window, and walks
//! that window to find the next trigger. Timestamps are always constructed
//! from calendar components in the subject's timezone, never by adding raw
//! seconds across a day boundary, so daylight-saving shifts come out right.

use chrono::{Datelike, Duration, LocalResult, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use chronod_core::{ChronodError, Result};
use std::collections::BTreeMap;

use crate::date::{parse_end_date, parse_start_date, StartDate};
use crate::expr::{
    parse_field, weekday_positions, FieldExpr, NearestDir, ParseOptions, MONTH_NAMES,
};

/// Combination cap for the same-day fast path. A schedule firing more often
/// than this per day skips the cached-times shortcut.
const TODAY_TIMES_CAP: usize = 4096;

/// Months scanned ahead before next-trigger gives up.
const LOOKAHEAD_MONTHS: u32 = 13;

/// One parsed recurrence rule.
#[derive(Debug, Clone)]
pub struct CalendarSchedule {
    pub months: FieldExpr,
    pub weekrows: FieldExpr,
    pub weekday: FieldExpr,
    pub days: FieldExpr,
    pub hours: FieldExpr,
    pub mins: FieldExpr,
    pub secs: FieldExpr,
    pub start: StartDate,
    /// Exclusive upper bound.
    pub end: Option<NaiveDate>,
    pub duration: Option<u32>,
}

/// Redirects one source date to a destination date, optionally overriding
/// the firing time. The source date's normal firing is suppressed.
#[derive(Debug, Clone)]
pub struct ScheduleException {
    pub dest: NaiveDate,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub second: Option<u32>,
    pub duration: Option<u32>,
}

/// Firing information for one day of a built month.
#[derive(Debug, Clone, Default)]
pub struct DayEntry {
    /// Schedule ids firing normally this day.
    pub ids: Vec<usize>,
    /// (schedule id, exception source date) pairs redirected to this day.
    pub redirected: Vec<(usize, NaiveDate)>,
}

impl DayEntry {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.redirected.is_empty()
    }
}

/// One built (year, month) with only the days that fire.
#[derive(Debug, Clone)]
pub struct MonthCalendar {
    pub year: i32,
    pub month: u32,
    pub days: BTreeMap<u32, DayEntry>,
}

/// Calendar engine for one subject.
#[derive(Debug, Clone)]
pub struct CalendarEngine {
    tz: Tz,
    /// Week start day, 0 = Sunday .. 6 = Saturday.
    base_weekday: u32,
    schedules: Vec<CalendarSchedule>,
    exceptions: BTreeMap<NaiveDate, ScheduleException>,
    months: BTreeMap<(i32, u32), MonthCalendar>,
}

impl CalendarEngine {
    pub fn new(tz: Tz, base_weekday: u32) -> Self {
        Self {
            tz,
            base_weekday: base_weekday % 7,
            schedules: Vec::new(),
            exceptions: BTreeMap::new(),
            months: BTreeMap::new(),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn schedule(&self, id: usize) -> Option<&CalendarSchedule> {
        self.schedules.get(id)
    }

    /// Parse and append one schedule line, returning its id. The native
    /// form is `months weekrows weekday days hours mins secs start end
    /// [duration]`; a leading `cron` token selects the legacy positional
    /// form (5 = `min hour day month weekday`, 6 = seconds-first, 7 adds a
    /// trailing year which must be `*`, 9-10 append weekrow, dates, and an
    /// optional duration).
    pub fn add_schedule(&mut self, line: &str) -> Result<usize> {
        let mut fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();

        if fields
            .first()
            .is_some_and(|f| f.eq_ignore_ascii_case("cron"))
        {
            let today = Utc::now().with_timezone(&self.tz).date_naive();
            fields = reorder_legacy(&fields[1..], today)?;
        }

        if fields.len() < 9 || fields.len() > 10 {
            return Err(ChronodError::Validation(format!(
                "expected 9 or 10 fields, got {} in '{line}'",
                fields.len()
            )));
        }

        let weekday_names = weekday_positions(self.base_weekday);
        let months = parse_field(
            &fields[0],
            1,
            12,
            &ParseOptions {
                names: &MONTH_NAMES,
                ..Default::default()
            },
        )?;
        let weekrows = parse_field(
            &fields[1],
            1,
            6,
            &ParseOptions {
                allow_reverse: true,
                allow_full_weeks: true,
                ..Default::default()
            },
        )?;
        let weekday = parse_field(
            &fields[2],
            1,
            7,
            &ParseOptions {
                names: &weekday_names,
                allow_nearest: true,
                ..Default::default()
            },
        )?;
        let days = parse_field(
            &fields[3],
            1,
            31,
            &ParseOptions {
                allow_reverse: true,
                ..Default::default()
            },
        )?;
        let hours = parse_field(
            &fields[4],
            0,
            23,
            &ParseOptions {
                am_pm: true,
                ..Default::default()
            },
        )?;
        let mins = parse_field(&fields[5], 0, 59, &ParseOptions::default())?;
        let secs = parse_field(&fields[6], 0, 59, &ParseOptions::default())?;
        let start = parse_start_date(&fields[7])?;
        let end = parse_end_date(&fields[8])?;
        let duration = match fields.get(9) {
            Some(d) => {
                let secs: u32 = d.parse().map_err(|_| {
                    ChronodError::Validation(format!("bad duration '{d}' in '{line}'"))
                })?;
                if secs > 86400 {
                    return Err(ChronodError::Validation(format!(
                        "duration {secs} exceeds one day in '{line}'"
                    )));
                }
                Some(secs)
            }
            None => None,
        };

        self.schedules.push(CalendarSchedule {
            months,
            weekrows,
            weekday,
            days,
            hours,
            mins,
            secs,
            start,
            end,
            duration,
        });
        self.months.clear();
        Ok(self.schedules.len() - 1)
    }

    /// Register an exception redirecting `src` to `dest`. One exception per
    /// source date; a second registration replaces the first.
    pub fn add_exception(
        &mut self,
        src: &str,
        dest: &str,
        hour: Option<u32>,
        minute: Option<u32>,
        second: Option<u32>,
        duration: Option<u32>,
    ) -> Result<()> {
        let src = NaiveDate::parse_from_str(src.trim(), "%Y-%m-%d")
            .map_err(|_| ChronodError::Validation(format!("bad exception source date '{src}'")))?;
        let dest = NaiveDate::parse_from_str(dest.trim(), "%Y-%m-%d").map_err(|_| {
            ChronodError::Validation(format!("bad exception destination date '{dest}'"))
        })?;
        if hour.is_some_and(|h| h > 23)
            || minute.is_some_and(|m| m > 59)
            || second.is_some_and(|s| s > 59)
            || duration.is_some_and(|d| d > 86400)
        {
            return Err(ChronodError::Validation(
                "exception time override out of range".into(),
            ));
        }
        self.exceptions.insert(
            src,
            ScheduleException {
                dest,
                hour,
                minute,
                second,
                duration,
            },
        );
        self.months.clear();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    /// Build (or fetch) the calendar for one month, exceptions applied.
    pub fn get_calendar(&mut self, year: i32, month: u32) -> &MonthCalendar {
        if !self.months.contains_key(&(year, month)) {
            let built = self.build_month(year, month);
            self.months.insert((year, month), built);
        }
        &self.months[&(year, month)]
    }

    /// Next trigger instant strictly after `now_ts`, or None when nothing
    /// fires within the lookahead window.
    pub fn next_trigger(&mut self, now_ts: i64) -> Option<i64> {
        let now = self.tz.timestamp_opt(now_ts, 0).single()?;
        let today = now.date_naive();

        // Drop months that rolled out of the window.
        let cur = (today.year(), today.month());
        self.months.retain(|k, _| *k >= cur);

        // Remainder of today first.
        self.get_calendar(today.year(), today.month());
        if let Some(entry) = self.months[&cur].days.get(&today.day()).cloned() {
            if let Some(sod) = self.next_entry_sod(&entry, now.num_seconds_from_midnight()) {
                return self.local_ts(today, sod);
            }
        }

        // Then the rolling window, extending up to the lookahead limit.
        let (mut y, mut m) = cur;
        for _ in 0..LOOKAHEAD_MONTHS {
            self.get_calendar(y, m);
            let cal = self.months[&(y, m)].clone();
            for (&day, entry) in &cal.days {
                let Some(date) = NaiveDate::from_ymd_opt(y, m, day) else {
                    continue;
                };
                if date <= today || entry.is_empty() {
                    continue;
                }
                if let Some(sod) = self.first_entry_sod(entry) {
                    return self.local_ts(date, sod);
                }
            }
            (y, m) = if m == 12 { (y + 1, 1) } else { (y, m + 1) };
        }
        None
    }

    /// All seconds-of-day the subject fires today, ascending, for the
    /// same-day rescheduling fast path. None when today is too dense or
    /// has no firings.
    pub fn today_times(&mut self, now_ts: i64) -> Option<Vec<u32>> {
        let now = self.tz.timestamp_opt(now_ts, 0).single()?;
        let today = now.date_naive();
        self.get_calendar(today.year(), today.month());
        let entry = self
            .months
            .get(&(today.year(), today.month()))?
            .days
            .get(&today.day())?
            .clone();

        let mut times = Vec::new();
        for &id in &entry.ids {
            let s = &self.schedules[id];
            if !push_combos(&mut times, &s.hours.values, &s.mins.values, &s.secs.values) {
                return None;
            }
        }
        for (id, src) in &entry.redirected {
            let (h, m, sec) = self.redirect_times(*id, src);
            if !push_combos(&mut times, &h, &m, &sec) {
                return None;
            }
        }
        if times.is_empty() {
            return None;
        }
        times.sort_unstable();
        times.dedup();
        Some(times)
    }

    /// Effective hour/minute/second sets of one redirected firing.
    fn redirect_times(&self, id: usize, src: &NaiveDate) -> (Vec<u32>, Vec<u32>, Vec<u32>) {
        let s = &self.schedules[id];
        match self.exceptions.get(src) {
            Some(exc) => (
                exc.hour.map(|h| vec![h]).unwrap_or_else(|| s.hours.values.clone()),
                exc.minute.map(|m| vec![m]).unwrap_or_else(|| s.mins.values.clone()),
                exc.second.map(|x| vec![x]).unwrap_or_else(|| s.secs.values.clone()),
            ),
            None => (
                s.hours.values.clone(),
                s.mins.values.clone(),
                s.secs.values.clone(),
            ),
        }
    }

    /// Smallest second-of-day of an entry.
    fn first_entry_sod(&self, entry: &DayEntry) -> Option<u32> {
        let mut best: Option<u32> = None;
        for &id in &entry.ids {
            let s = &self.schedules[id];
            let sod = s.hours.values[0] * 3600 + s.mins.values[0] * 60 + s.secs.values[0];
            best = Some(best.map_or(sod, |b| b.min(sod)));
        }
        for (id, src) in &entry.redirected {
            let (h, m, sec) = self.redirect_times(*id, src);
            let sod = h[0] * 3600 + m[0] * 60 + sec[0];
            best = Some(best.map_or(sod, |b| b.min(sod)));
        }
        best
    }

    /// Smallest second-of-day of an entry strictly after `after`.
    fn next_entry_sod(&self, entry: &DayEntry, after: u32) -> Option<u32> {
        let mut best: Option<u32> = None;
        for &id in &entry.ids {
            let s = &self.schedules[id];
            if let Some(sod) =
                first_after(&s.hours.values, &s.mins.values, &s.secs.values, after)
            {
                best = Some(best.map_or(sod, |b| b.min(sod)));
            }
        }
        for (id, src) in &entry.redirected {
            let (h, m, sec) = self.redirect_times(*id, src);
            if let Some(sod) = first_after(&h, &m, &sec, after) {
                best = Some(best.map_or(sod, |b| b.min(sod)));
            }
        }
        best
    }

    /// Local-time construction. Ambiguous times resolve to the earlier
    /// instant; a spring-forward gap maps to the first instant after it.
    fn local_ts(&self, date: NaiveDate, sod: u32) -> Option<i64> {
        let naive = date.and_hms_opt(sod / 3600, (sod / 60) % 60, sod % 60)?;
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Some(dt.timestamp()),
            LocalResult::Ambiguous(a, _) => Some(a.timestamp()),
            LocalResult::None => {
                let mut candidate = naive;
                for _ in 0..16 {
                    candidate += Duration::minutes(15);
                    if let LocalResult::Single(dt) = self.tz.from_local_datetime(&candidate) {
                        return Some(dt.timestamp());
                    }
                }
                None
            }
        }
    }

    fn build_month(&self, year: i32, month: u32) -> MonthCalendar {
        let mut fire = self.raw_fire_map(year, month);

        // Exception source dates stop firing here.
        for src in self.exceptions.keys() {
            if src.year() == year && src.month() == month {
                fire.remove(&src.day());
            }
        }

        let mut days: BTreeMap<u32, DayEntry> = fire
            .into_iter()
            .map(|(d, ids)| {
                (
                    d,
                    DayEntry {
                        ids,
                        redirected: Vec::new(),
                    },
                )
            })
            .collect();

        // Destination dates pick up the source date's firings.
        for (src, exc) in &self.exceptions {
            if exc.dest.year() == year && exc.dest.month() == month {
                let moved = self.raw_ids_on(*src);
                if !moved.is_empty() {
                    let entry = days.entry(exc.dest.day()).or_default();
                    for id in moved {
                        entry.redirected.push((id, *src));
                    }
                }
            }
        }

        MonthCalendar { year, month, days }
    }

    /// Day → matching schedule ids for one month, exceptions not applied.
    fn raw_fire_map(&self, year: i32, month: u32) -> BTreeMap<u32, Vec<usize>> {
        let mut fire: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        let num_days = days_in_month(year, month);

        for (id, s) in self.schedules.iter().enumerate() {
            for day in 1..=num_days {
                let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
                    continue;
                };
                if !self.day_matches_core(s, date, num_days) {
                    continue;
                }
                let pos = self.weekday_pos(date);
                let target = if s.weekday.contains(pos) {
                    Some(day)
                } else if let Some(dir) = s.weekday.prefixes.nearest {
                    self.nearest_day(s, year, month, day, num_days, dir)
                } else {
                    None
                };
                if let Some(t) = target {
                    let entry = fire.entry(t).or_default();
                    if !entry.contains(&id) {
                        entry.push(id);
                    }
                }
            }
        }
        fire
    }

    fn raw_ids_on(&self, date: NaiveDate) -> Vec<usize> {
        self.raw_fire_map(date.year(), date.month())
            .remove(&date.day())
            .unwrap_or_default()
    }

    /// Everything but the weekday check: bounds, strides, month, week-row,
    /// day-of-month (with reversed counting).
    fn day_matches_core(&self, s: &CalendarSchedule, date: NaiveDate, num_days: u32) -> bool {
        if let Some(start) = s.start.date {
            if date < start {
                return false;
            }
            let diff = (date - start).num_days() as u64;
            if diff % s.start.day_stride as u64 != 0 {
                return false;
            }
            if (diff / 7) % s.start.week_stride as u64 != 0 {
                return false;
            }
        }
        if let Some(end) = s.end {
            if date >= end {
                return false;
            }
        }
        if !s.months.contains(date.month()) {
            return false;
        }
        if !self.weekrow_matches(s, date, num_days) {
            return false;
        }
        let day = if s.days.prefixes.reverse {
            num_days - date.day() + 1
        } else {
            date.day()
        };
        s.days.contains(day)
    }

    fn weekrow_matches(&self, s: &CalendarSchedule, date: NaiveDate, num_days: u32) -> bool {
        let Some(first) = NaiveDate::from_ymd_opt(date.year(), date.month(), 1) else {
            return false;
        };
        let first_pos = self.weekday_pos(first);
        let row = (date.day() - 1 + first_pos - 1) / 7 + 1;
        let total_rows = (num_days - 1 + first_pos - 1) / 7 + 1;
        let wr = &s.weekrows;

        let effective = if wr.prefixes.full_weeks {
            let first_full = if first_pos == 1 { 1 } else { 2 };
            let Some(last) = NaiveDate::from_ymd_opt(date.year(), date.month(), num_days) else {
                return false;
            };
            let last_full = if self.weekday_pos(last) == 7 {
                total_rows
            } else {
                total_rows - 1
            };
            if row < first_full || row > last_full {
                return false;
            }
            if wr.prefixes.reverse {
                last_full - row + 1
            } else {
                row - first_full + 1
            }
        } else if wr.prefixes.reverse {
            total_rows - row + 1
        } else {
            row
        };
        wr.contains(effective)
    }

    /// Outward search for the nearest day whose weekday is in the set.
    /// Preference direction inverts under reversed day counting; an Either
    /// tie breaks toward the earlier day (later under reversed counting).
    fn nearest_day(
        &self,
        s: &CalendarSchedule,
        year: i32,
        month: u32,
        day: u32,
        num_days: u32,
        dir: NearestDir,
    ) -> Option<u32> {
        let reversed = s.days.prefixes.reverse;
        let wd_ok = |d: u32| -> bool {
            NaiveDate::from_ymd_opt(year, month, d)
                .is_some_and(|date| s.weekday.contains(self.weekday_pos(date)))
        };

        for off in 1..num_days {
            let left = day.checked_sub(off).filter(|d| *d >= 1);
            let right = Some(day + off).filter(|d| *d <= num_days);
            let l_ok = left.is_some_and(wd_ok);
            let r_ok = right.is_some_and(wd_ok);

            let prefer_left = match dir {
                NearestDir::Either => !reversed,
                NearestDir::Before => !reversed,
                NearestDir::After => reversed,
            };
            match (l_ok, r_ok) {
                (true, true) => return if prefer_left { left } else { right },
                (true, false) => return left,
                (false, true) => return right,
                (false, false) => {}
            }
        }
        None
    }

    /// 1-based weekday position relative to the configured week start.
    fn weekday_pos(&self, date: NaiveDate) -> u32 {
        (7 + date.weekday().num_days_from_sunday() - self.base_weekday) % 7 + 1
    }
}

/// Legacy positional form, reordered into the native field order. The
/// short forms carry no dates of their own and start on `today`; the
/// extended form brings its own start and end dates.
fn reorder_legacy(fields: &[String], today: NaiveDate) -> Result<Vec<String>> {
    let start = today.format("%Y-%m-%d").to_string();
    let (secs, min, hour, day, month, weekday) = match fields.len() {
        // min hour day month weekday
        5 => (
            "0".to_string(),
            fields[0].clone(),
            fields[1].clone(),
            fields[2].clone(),
            fields[3].clone(),
            fields[4].clone(),
        ),
        // sec min hour day month weekday [year]
        6 | 7 => {
            if fields.len() == 7 && fields[6] != "*" {
                return Err(ChronodError::Validation(
                    "legacy year field must be '*'".into(),
                ));
            }
            (
                fields[0].clone(),
                fields[1].clone(),
                fields[2].clone(),
                fields[3].clone(),
                fields[4].clone(),
                fields[5].clone(),
            )
        }
        // sec min hour day month weekday weekrow start end [duration]
        9 | 10 => {
            let mut out = vec![
                fields[4].clone(),
                fields[6].clone(),
                fields[5].clone(),
                fields[3].clone(),
                fields[2].clone(),
                fields[1].clone(),
                fields[0].clone(),
                fields[7].clone(),
                fields[8].clone(),
            ];
            if let Some(duration) = fields.get(9) {
                out.push(duration.clone());
            }
            return Ok(out);
        }
        n => {
            return Err(ChronodError::Validation(format!(
                "legacy form takes 5-7 or 9-10 fields, got {n}"
            )));
        }
    };
    Ok(vec![
        month,
        "*".into(),
        weekday,
        day,
        hour,
        min,
        secs,
        start,
        "*".into(),
    ])
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.and_then(|d| d.pred_opt()).map(|d| d.day()).unwrap_or(30)
}

/// Smallest hour/minute/second combination strictly after `after`,
/// as a second-of-day. Value slices are ascending, so the first hit wins.
fn first_after(hours: &[u32], mins: &[u32], secs: &[u32], after: u32) -> Option<u32> {
    for &h in hours {
        let hb = h * 3600;
        if hb + 3599 <= after {
            continue;
        }
        for &m in mins {
            let mb = hb + m * 60;
            if mb + 59 <= after {
                continue;
            }
            for &s in secs {
                let sod = mb + s;
                if sod > after {
                    return Some(sod);
                }
            }
        }
    }
    None
}

/// Append every hour/minute/second combination, bailing out past the cap.
fn push_combos(out: &mut Vec<u32>, hours: &[u32], mins: &[u32], secs: &[u32]) -> bool {
    if out.len() + hours.len() * mins.len() * secs.len() > TODAY_TIMES_CAP {
        return false;
    }
    for &h in hours {
        for &m in mins {
            for &s in secs {
                out.push(h * 3600 + m * 60 + s);
            }
        }
    }
    true
}
