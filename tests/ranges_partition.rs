use chrono::{DateTime, Duration, Months, TimeZone, Utc};
use revelio::{partition, partition_str, RangeError, WindowSpan};

fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

/// Start of a full-length window ending at `end`.
fn step_back(end: DateTime<Utc>, span: WindowSpan) -> DateTime<Utc> {
    match span {
        WindowSpan::Days(n) => end - Duration::days(i64::from(n)),
        WindowSpan::Years(n) => end.checked_sub_months(Months::new(n * 12)).unwrap(),
    }
}

#[test]
fn windows_are_contiguous_bounded_and_cover_the_span() {
    let starts = [at(2008, 1, 1, 0), at(2019, 2, 28, 13), at(2020, 2, 29, 0)];
    let lengths_days = [1, 29, 30, 31, 365, 366, 1_000, 4_999];
    let spans = [
        WindowSpan::Days(1),
        WindowSpan::Days(7),
        WindowSpan::THIRTY_DAYS,
        WindowSpan::ONE_YEAR,
        WindowSpan::Years(2),
    ];

    for start in starts {
        for days in lengths_days {
            let end = start + Duration::days(days) + Duration::hours(5);
            for span in spans {
                let plan = partition(start, end, span).unwrap();
                let oldest: Vec<_> = plan.oldest_first().copied().collect();

                assert!(!oldest.is_empty());
                assert_eq!(oldest.first().unwrap().start, start);
                assert_eq!(oldest.last().unwrap().end, end);
                for pair in oldest.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start, "gap in plan for {span}");
                }
                for range in &oldest {
                    assert!(range.start < range.end);
                    assert!(step_back(range.end, span) <= range.start);
                }
                // every window except the oldest spans exactly one step
                for range in oldest.iter().skip(1) {
                    assert_eq!(step_back(range.end, span), range.start);
                }
            }
        }
    }
}

#[test]
fn newest_first_is_the_reverse_of_oldest_first() {
    let plan = partition(at(2015, 6, 1, 0), at(2021, 9, 15, 0), WindowSpan::ONE_YEAR).unwrap();
    let mut reversed: Vec<_> = plan.newest_first().copied().collect();
    reversed.reverse();
    let oldest: Vec<_> = plan.oldest_first().copied().collect();
    assert_eq!(reversed, oldest);
}

#[test]
fn partition_is_deterministic() {
    let a = partition_str("2008-01-01", "2021-09-15", WindowSpan::THIRTY_DAYS).unwrap();
    let b = partition_str("2008-01-01", "2021-09-15", WindowSpan::THIRTY_DAYS).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 167);
}

#[test]
fn unparsable_bound_is_reported_before_any_work() {
    let err = partition_str("yesterday", "2021-09-15", WindowSpan::THIRTY_DAYS).unwrap_err();
    assert_eq!(err, RangeError::InvalidBound("yesterday".to_string()));
}
