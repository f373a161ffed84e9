//! Epoch-relative time representation.
//!
//! The store's `Time` type is a double holding seconds elapsed on the TAI
//! timeline since the instant labeled 1977.01.01_00:00:00 by TAI clocks.
//! Civil labels in other zones differ by the published TAI−UTC offset (plus
//! 32.184 s for TT/TDT). The Unix epoch sits at −220924792.0 on this
//! timeline.
//!
//! Formatting follows a two-field discipline carried on each time keyword: a
//! numeric precision (positive = fractional second digits, negative =
//! truncate whole fields from the right) and a zone string. A keyword's
//! declared format string is reinterpreted at load time: if it parses as an
//! integer it is the precision; if it instead names a known zone, the zone
//! moves into the unit field and precision defaults to 0.

use chrono::{Datelike, NaiveDate};

use crate::error::{ExportError, Result};
use crate::types::missing_f64;

/// Seconds on the TAI timeline since 1977.01.01_00:00:00_TAI.
pub type Time = f64;

/// The Unix epoch (1970.01.01_00:00:00_UTC) in internal time.
pub const UNIX_EPOCH: Time = -220924792.0;

const INTERNAL_EPOCH_YMD: (i32, u32, u32) = (1977, 1, 1);

/// TAI−UTC, as (first UTC date of validity, offset seconds). Dates before
/// the first entry use 8 s, which is what the historical Unix-epoch constant
/// above implies.
const LEAP_TABLE: &[((i32, u32, u32), f64)] = &[
    ((1972, 1, 1), 10.0),
    ((1972, 7, 1), 11.0),
    ((1973, 1, 1), 12.0),
    ((1974, 1, 1), 13.0),
    ((1975, 1, 1), 14.0),
    ((1976, 1, 1), 15.0),
    ((1977, 1, 1), 16.0),
    ((1978, 1, 1), 17.0),
    ((1979, 1, 1), 18.0),
    ((1980, 1, 1), 19.0),
    ((1981, 7, 1), 20.0),
    ((1982, 7, 1), 21.0),
    ((1983, 7, 1), 22.0),
    ((1985, 7, 1), 23.0),
    ((1988, 1, 1), 24.0),
    ((1990, 1, 1), 25.0),
    ((1991, 1, 1), 26.0),
    ((1992, 7, 1), 27.0),
    ((1993, 7, 1), 28.0),
    ((1994, 7, 1), 29.0),
    ((1996, 1, 1), 30.0),
    ((1997, 7, 1), 31.0),
    ((1999, 1, 1), 32.0),
    ((2006, 1, 1), 33.0),
    ((2009, 1, 1), 34.0),
    ((2012, 7, 1), 35.0),
    ((2015, 7, 1), 36.0),
    ((2017, 1, 1), 37.0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Tai,
    Utc,
    Tt,
}

impl Zone {
    pub fn parse(s: &str) -> Option<Zone> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TAI" => Some(Zone::Tai),
            "UTC" | "UT" | "GMT" | "Z" => Some(Zone::Utc),
            "TDT" | "TT" => Some(Zone::Tt),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Zone::Tai => "TAI",
            Zone::Utc => "UTC",
            Zone::Tt => "TDT",
        }
    }
}

fn epoch_date() -> NaiveDate {
    let (y, m, d) = INTERNAL_EPOCH_YMD;
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn tai_minus_utc(date: NaiveDate) -> f64 {
    let mut offset = 8.0;
    for ((y, m, d), o) in LEAP_TABLE {
        let start = NaiveDate::from_ymd_opt(*y, *m, *d).unwrap();
        if date >= start {
            offset = *o;
        } else {
            break;
        }
    }
    offset
}

/// Zone-dependent correction added to a civil label to reach internal time.
fn zone_offset(zone: Zone, civil_date: NaiveDate) -> f64 {
    match zone {
        Zone::Tai => 0.0,
        Zone::Utc => tai_minus_utc(civil_date),
        // TT runs 32.184 s ahead of TAI, so a TT label happens earlier on
        // the TAI timeline.
        Zone::Tt => -32.184,
    }
}

/// Parse `YYYY.MM.DD[_hh:mm[:ss[.fff]]][_ZONE]`. The zone defaults to UTC.
pub fn parse_time(text: &str) -> Result<Time> {
    let text = text.trim();
    let bad = || ExportError::BadRequest(format!("cannot parse time '{text}'"));

    let mut parts: Vec<&str> = text.split('_').collect();
    if parts.is_empty() {
        return Err(bad());
    }

    let zone = match parts.last().and_then(|z| Zone::parse(z)) {
        Some(z) => {
            parts.pop();
            z
        }
        None => Zone::Utc,
    };

    if parts.is_empty() || parts.len() > 2 {
        return Err(bad());
    }

    let mut date_it = parts[0].split('.');
    let year: i32 = date_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let month: u32 = date_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let day: u32 = date_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if date_it.next().is_some() {
        return Err(bad());
    }

    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(bad)?;

    let mut tod = 0.0;
    if parts.len() == 2 {
        let mut clk = parts[1].split(':');
        let hours: f64 = clk.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let minutes: f64 = match clk.next() {
            Some(m) => m.parse().map_err(|_| bad())?,
            None => 0.0,
        };
        let seconds: f64 = match clk.next() {
            Some(s) => s.parse().map_err(|_| bad())?,
            None => 0.0,
        };
        if clk.next().is_some() {
            return Err(bad());
        }
        tod = hours * 3600.0 + minutes * 60.0 + seconds;
    }

    let days = (date - epoch_date()).num_days() as f64;
    Ok(days * 86400.0 + tod + zone_offset(zone, date))
}

/// Format an internal time as `YYYY.MM.DD_hh:mm:ss[.fff]_ZONE`.
///
/// A positive precision adds that many fractional-second digits; a negative
/// one truncates whole fields from the right (−1 omits seconds, −2 minutes,
/// −3 the entire clock). An unknown zone string formats as UTC.
pub fn format_time(t: Time, zone: &str, precision: i32) -> String {
    if t.is_nan() {
        return "MISSING".to_owned();
    }

    let zone = Zone::parse(zone).unwrap_or(Zone::Utc);

    // Undo the zone offset; the offset is date-dependent for UTC, so settle
    // with one correction pass.
    let approx = t - zone_offset(zone, date_of(t));
    let civil = t - zone_offset(zone, date_of(approx));

    let mut days = (civil / 86400.0).floor();
    let mut tod = civil - days * 86400.0;

    // Round the fractional part first so that 59.9996 at precision 0 rolls
    // over into the next minute rather than printing "60".
    let digits = precision.max(0) as u32;
    let quantum = 10f64.powi(-(digits as i32));
    tod = (tod / quantum).round() * quantum;
    if tod >= 86400.0 {
        tod -= 86400.0;
        days += 1.0;
    }

    let date = epoch_date() + chrono::Duration::days(days as i64);
    let hours = (tod / 3600.0).floor();
    let minutes = ((tod - hours * 3600.0) / 60.0).floor();
    let seconds = tod - hours * 3600.0 - minutes * 60.0;

    let mut out = format!("{:04}.{:02}.{:02}", date.year(), date.month(), date.day());

    if precision >= -2 {
        out.push_str(&format!("_{:02}", hours as u32));
    }
    if precision >= -1 {
        out.push_str(&format!(":{:02}", minutes as u32));
    }
    if precision >= 0 {
        if digits == 0 {
            out.push_str(&format!(":{:02}", seconds.round() as u32 % 60));
        } else {
            let scale = 10u64.pow(digits);
            let scaled = (seconds * scale as f64).round() as u64;
            out.push_str(&format!(
                ":{:02}.{:0width$}",
                scaled / scale,
                scaled % scale,
                width = digits as usize
            ));
        }
    }

    out.push('_');
    out.push_str(zone.label());
    out
}

fn date_of(t: Time) -> NaiveDate {
    let days = (t / 86400.0).floor() as i64;
    epoch_date() + chrono::Duration::days(days)
}

/// Reinterpret a keyword's declared (format, unit) pair into the
/// (precision, zone) pair the time formatter wants.
pub fn normalize_time_format(format: &str, unit: &str) -> (i32, String) {
    let format = format.trim();
    let unit = unit.trim();

    let zone_from_unit = || {
        if unit.is_empty() || unit.eq_ignore_ascii_case("none") || Zone::parse(unit).is_none() {
            "UTC".to_owned()
        } else {
            unit.to_owned()
        }
    };

    if let Ok(p) = format.parse::<i32>() {
        return (p, zone_from_unit());
    }

    if Zone::parse(format).is_some() {
        // The format field held a zone; it wins over the declared unit.
        return (0, format.to_owned());
    }

    (0, zone_from_unit())
}

/// The current instant in internal time.
pub fn current_time() -> Time {
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    UNIX_EPOCH + unix
}

/// The missing sentinel for times.
pub fn missing_time() -> Time {
    missing_f64()
}

/// Parse a step/duration string like `60s`, `12m`, `1h`, `7d`, or a bare
/// number of seconds. Returns seconds.
pub fn parse_duration(text: &str) -> Result<f64> {
    let text = text.trim();
    let bad = || ExportError::BadRequest(format!("cannot parse duration '{text}'"));

    if text.is_empty() {
        return Err(bad());
    }

    let (num, mult) = match text.chars().last().unwrap() {
        't' => (&text[..text.len() - 1], 0.1),
        's' => (&text[..text.len() - 1], 1.0),
        'm' => (&text[..text.len() - 1], 60.0),
        'h' => (&text[..text.len() - 1], 3600.0),
        'd' => (&text[..text.len() - 1], 86400.0),
        _ => (text, 1.0),
    };

    let v: f64 = num.trim().parse().map_err(|_| bad())?;
    Ok(v * mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_and_unix_anchor() {
        assert_eq!(parse_time("1977.01.01_00:00:00_TAI").unwrap(), 0.0);
        assert_eq!(parse_time("1970.01.01_00:00:00_UTC").unwrap(), UNIX_EPOCH);
    }

    #[test]
    fn tai_parse_is_exact_arithmetic() {
        let t0 = parse_time("1993.01.01_00:00:00_TAI").unwrap();
        let t1 = parse_time("1993.01.01_00:01:00_TAI").unwrap();
        let t2 = parse_time("1993.01.01_00:00:59.999_TAI").unwrap();
        assert_eq!(t1 - t0, 60.0);
        assert!((t2 - t0 - 59.999).abs() < 1e-9);
    }

    #[test]
    fn utc_round_trip() {
        let t = parse_time("2010.06.15_12:34:56_UTC").unwrap();
        assert_eq!(format_time(t, "UTC", 0), "2010.06.15_12:34:56_UTC");
    }

    #[test]
    fn negative_precision_truncates_fields() {
        let t = parse_time("1996.06.24_12:30:45_TAI").unwrap();
        assert_eq!(format_time(t, "TAI", -1), "1996.06.24_12:30_TAI");
        assert_eq!(format_time(t, "TAI", -2), "1996.06.24_12_TAI");
        assert_eq!(format_time(t, "TAI", -3), "1996.06.24_TAI");
    }

    #[test]
    fn fractional_precision() {
        let t = parse_time("2001.01.01_00:00:01.250_TAI").unwrap();
        assert_eq!(format_time(t, "TAI", 2), "2001.01.01_00:00:01.25_TAI");
    }

    #[test]
    fn format_reinterpretation() {
        assert_eq!(normalize_time_format("2", "TAI"), (2, "TAI".to_owned()));
        assert_eq!(normalize_time_format("UTC", "none"), (0, "UTC".to_owned()));
        assert_eq!(normalize_time_format("%f", ""), (0, "UTC".to_owned()));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("60s").unwrap(), 60.0);
        assert_eq!(parse_duration("2m").unwrap(), 120.0);
        assert_eq!(parse_duration("1d").unwrap(), 86400.0);
        assert_eq!(parse_duration("15").unwrap(), 15.0);
        assert!(parse_duration("abc").is_err());
    }
}
