//! Recurrence expression parsing and calendar construction.
//!
//! A schedule line is an ordered list of fields
//! (`months weekrows weekday days hours mins secs startdate enddate [duration]`)
//! where each field expands to a set of values with optional modifier
//! prefixes. The [`CalendarEngine`] owns one subject's schedules and
//! exceptions, builds month calendars on demand, and walks them to find the
//! next exact trigger instant in the schedule's own timezone.

pub mod calendar;
pub mod date;
pub mod expr;

pub use calendar::{CalendarEngine, CalendarSchedule, DayEntry, MonthCalendar, ScheduleException};
pub use date::{parse_end_date, parse_start_date, StartDate};
pub use expr::{parse_field, FieldExpr, NearestDir, ParseOptions, Prefixes};
