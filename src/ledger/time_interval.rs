use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Calendar cadence of a recurring entry definition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Frequency {
    pub fn label(self) -> &'static str {
        match self {
            Frequency::Daily => "Daily",
            Frequency::Weekly => "Weekly",
            Frequency::Monthly => "Monthly",
            Frequency::Quarterly => "Quarterly",
            Frequency::Yearly => "Yearly",
        }
    }

    fn month_step(self) -> Option<i32> {
        match self {
            Frequency::Monthly => Some(1),
            Frequency::Quarterly => Some(3),
            Frequency::Yearly => Some(12),
            Frequency::Daily | Frequency::Weekly => None,
        }
    }

    /// Next occurrence strictly after `from` for a schedule anchored on `anchor`.
    ///
    /// Before the anchor the anchor itself is the next occurrence. Weekly schedules
    /// repeat on the anchor's weekday; month-based schedules repeat on the anchor's
    /// day-of-month, clamped to the last day of shorter months.
    pub fn next_after(self, anchor: NaiveDate, from: NaiveDate) -> NaiveDate {
        if from < anchor {
            return anchor;
        }
        match self {
            Frequency::Daily => from + Duration::days(1),
            Frequency::Weekly => {
                let target = anchor.weekday().num_days_from_monday() as i64;
                let current = from.weekday().num_days_from_monday() as i64;
                let mut distance = (target - current + 7).rem_euclid(7);
                if distance == 0 {
                    distance = 7;
                }
                from + Duration::days(distance)
            }
            Frequency::Monthly | Frequency::Quarterly | Frequency::Yearly => {
                let step = self.month_step().unwrap_or(1);
                let elapsed = month_index(from) - month_index(anchor);
                let mut cycles = elapsed.div_euclid(step);
                let mut candidate = shift_month(anchor, cycles * step);
                while candidate <= from {
                    cycles += 1;
                    candidate = shift_month(anchor, cycles * step);
                }
                candidate
            }
        }
    }
}

fn month_index(date: NaiveDate) -> i32 {
    date.year() * 12 + date.month() as i32 - 1
}

/// Shifts by whole months, clamping the day-of-month to the target month's length.
fn shift_month(date: NaiveDate, months: i32) -> NaiveDate {
    let index = month_index(date) + months;
    let year = index.div_euclid(12);
    let month = (index.rem_euclid(12) + 1) as u32;
    let day = date.day().min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(date)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first_next| first_next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}
