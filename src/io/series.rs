use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime};
use csv::ReaderBuilder;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// One observation row: naive timestamp plus measured value.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRow {
    pub time: NaiveDateTime,
    pub value: f64,
}

// Source files are ambiguous between month-first and day-first regional
// conventions. Attempts run in fixed priority order; chrono rejects a
// parse where the month field exceeds 12, so each attempt has an explicit
// success criterion. ISO-like stamps are accepted as a last resort.
const NAIVE_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M",
    "%d/%m/%Y %H:%M",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y%m%d%H%M",
];

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%z", "%m/%d/%Y %H:%M %z"];

/// Parse an observation timestamp, trying each accepted format in order.
/// Offset-carrying stamps are stripped to naive local time so that they
/// compare against the simulation window's naive timestamps.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    for fmt in NAIVE_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(t);
        }
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(t) = DateTime::parse_from_str(raw, fmt) {
            return Some(t.naive_local());
        }
    }
    None
}

/// Read a headerless two-column (timestamp, value) series file.
/// Any row that fails to parse poisons the whole file: the caller treats
/// the source as unusable and falls back, rather than assimilating a
/// partially understood series.
pub fn read_series(path: &Path) -> Result<Vec<SeriesRow>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open series file: {:?}", path))?;

    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file));

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        if record.len() < 2 || record[0].is_empty() {
            continue;
        }
        let time = parse_timestamp(&record[0])
            .with_context(|| format!("Unparsable timestamp {:?} in {:?}", &record[0], path))?;
        let value: f64 = record[1]
            .parse()
            .with_context(|| format!("Unparsable value {:?} in {:?}", &record[1], path))?;
        rows.push(SeriesRow { time, value });
    }
    Ok(rows)
}

/// Min/max timestamps of a series, or None when empty.
pub fn coverage(rows: &[SeriesRow]) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let first = rows.first()?;
    let mut min = first.time;
    let mut max = first.time;
    for row in rows {
        min = min.min(row.time);
        max = max.max(row.time);
    }
    Some((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn month_first_wins_over_day_first() {
        // 06/09 is ambiguous; the month-first attempt runs first.
        assert_eq!(parse_timestamp("06/09/2023 00:30"), Some(ts("2023-06-09 00:30")));
        // 25/06 only parses day-first.
        assert_eq!(parse_timestamp("25/06/2023 12:00"), Some(ts("2023-06-25 12:00")));
        assert_eq!(parse_timestamp("not a date"), None);
    }

    #[test]
    fn offset_stamps_become_naive() {
        assert_eq!(
            parse_timestamp("2023-06-09T06:00:00+00:00"),
            Some(ts("2023-06-09 06:00"))
        );
    }

    #[test]
    fn reads_headerless_two_column_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EMB2100002_Vertimiento_Serie.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "06/08/2023 23:30,1.5").unwrap();
        writeln!(f, "06/09/2023 00:00,1.6").unwrap();
        writeln!(f).unwrap();
        drop(f);

        let rows = read_series(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, 1.5);
        let (min, max) = coverage(&rows).unwrap();
        assert_eq!(min, ts("2023-06-08 23:30"));
        assert_eq!(max, ts("2023-06-09 00:00"));
    }

    #[test]
    fn bad_value_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "06/08/2023 23:30,not_a_number\n").unwrap();
        assert!(read_series(&path).is_err());
    }
}
