//! Export file-name generation from a template.
//!
//! Template text is copied through verbatim except for `{...}` groups. A
//! group names either a proxy (`seriesname`, `recnum`, `segment`, `#` for
//! the per-run ordinal) or a keyword of the record, with an optional
//! `:layout` after the name. Layouts are printf specs; for time keywords
//! the layout is `[A|D]<precision>[,zone]`, where `A` drops the `.` and `:`
//! separators and `D` wraps the date fields in `@` so the names can be
//! scripted into date-based directory trees. Whitespace never survives into
//! the final name.

use crate::error::{ExportError, Result};
use crate::record::Record;
use crate::timefmt;
use crate::types::{PrintfArg, StoreType};

pub const DEFAULT_TEMPLATE: &str = "{seriesname}.{recnum:%lld}.{segment}";

/// Expand a file-name template for one record/segment pair. `counter` is
/// the running ordinal behind the `#` proxy, incremented on use.
pub fn make_export_filename(
    rec: &Record,
    segname: &str,
    template: Option<&str>,
    counter: &mut u64,
) -> Result<String> {
    let template = template
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(DEFAULT_TEMPLATE);

    let mut out = String::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            ExportError::BadRequest(format!("unterminated group in template '{template}'"))
        })?;

        let group = &after[..close];
        let (keyname, layout) = match group.split_once(':') {
            Some((k, l)) => (k, Some(l)),
            None => (group, None),
        };

        if keyname.is_empty() {
            return Err(ExportError::BadRequest(format!(
                "empty group in template '{template}'"
            )));
        }

        let piece = expand_group(rec, segname, keyname, layout, counter)?;
        out.push_str(&piece);

        rest = &after[close + 1..];
    }
    out.push_str(rest);

    // strip whitespace outright; blanks in file names help nobody
    Ok(out.chars().filter(|c| !c.is_whitespace()).collect())
}

fn expand_group(
    rec: &Record,
    segname: &str,
    keyname: &str,
    layout: Option<&str>,
    counter: &mut u64,
) -> Result<String> {
    match keyname {
        "#" => {
            let v = *counter;
            *counter += 1;
            Ok(crate::types::printf_one(
                layout.unwrap_or("%05d"),
                PrintfArg::Int(v as i64),
            ))
        }
        "seriesname" => Ok(rec.series.name.clone()),
        "recnum" => Ok(crate::types::printf_one(
            layout.unwrap_or("%lld"),
            PrintfArg::Int(rec.recnum),
        )),
        "segment" => {
            // for linked segments the target's file name is the real one
            let (_, seg) = rec.segment_followed(segname)?;
            if seg.filename.is_empty() {
                Ok(seg.name.clone())
            } else {
                Ok(seg.filename.clone())
            }
        }
        _ => expand_keyword(rec, keyname, layout),
    }
}

fn expand_keyword(rec: &Record, keyname: &str, layout: Option<&str>) -> Result<String> {
    let key = rec.keyword_followed(keyname)?;

    let layout = match layout {
        None => return key.snprintf_value(),
        Some(l) => l,
    };

    if key.info.ty == StoreType::Time {
        return expand_time(rec, keyname, layout);
    }

    let value = key.value_or_err()?;
    Ok(value.format_with(layout))
}

fn expand_time(rec: &Record, keyname: &str, layout: &str) -> Result<String> {
    let key = rec.keyword_followed(keyname)?;
    let t = key.value_or_err()?.as_f64()?;

    let mut rest = layout;
    let mut modifier = ' ';
    if rest
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false)
    {
        modifier = rest.chars().next().unwrap();
        rest = &rest[1..];
    }

    let (precision_text, zone_text) = match rest.split_once(',') {
        Some((p, z)) => (p, Some(z)),
        None => (rest, None),
    };

    let precision: i32 = if precision_text.is_empty() {
        0
    } else {
        precision_text.parse().map_err(|_| {
            ExportError::BadRequest(format!("bad time precision '{precision_text}' in template"))
        })?
    };

    let zone = match zone_text {
        Some(z) if !z.is_empty() => z.to_owned(),
        _ => {
            let (_, declared) = timefmt::normalize_time_format(&key.info.format, &key.info.unit);
            declared
        }
    };

    let formatted = timefmt::format_time(t, &zone, precision);

    Ok(match modifier {
        'A' => formatted.chars().filter(|c| *c != '.' && *c != ':').collect(),
        'D' => {
            let mut v = String::with_capacity(formatted.len() + 4);
            v.push('@');
            for (i, c) in formatted.chars().enumerate() {
                if c == ':' {
                    continue;
                }
                if c == '.' || i == 10 {
                    v.push('@');
                } else {
                    v.push(c);
                }
            }
            v
        }
        _ => formatted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyword::{Keyword, KeywordFlags, KeywordInfo, RecScope};
    use crate::record::{Protocol, SegmentInfo, SeriesInfo};
    use crate::types::{StoreType, StoreValue};
    use std::rc::Rc;

    fn test_record() -> Record {
        let series = Rc::new(SeriesInfo::new("lab.obs"));
        let mut rec = Record::new(series, 12345);
        rec.segments.push(SegmentInfo::new(
            "image",
            0,
            StoreType::Short,
            &[4, 4],
            Protocol::Fits,
        ));

        rec.keywords.insert(Keyword::stored(
            KeywordInfo {
                name: "t_rec".into(),
                ty: StoreType::Time,
                format: "0".into(),
                unit: "TAI".into(),
                description: String::new(),
                scope: RecScope::TsEq,
                flags: KeywordFlags::default(),
                rank: 0,
            },
            StoreValue::Time(timefmt::parse_time("1996.06.24_12:30:45_TAI").unwrap()),
        ));
        rec.keywords.insert(Keyword::stored(
            KeywordInfo {
                name: "camera".into(),
                ty: StoreType::Int,
                format: "%d".into(),
                unit: String::new(),
                description: String::new(),
                scope: RecScope::Variable,
                flags: KeywordFlags::default(),
                rank: 1,
            },
            StoreValue::Int(2),
        ));

        rec
    }

    #[test]
    fn default_template() {
        let rec = test_record();
        let mut counter = 0;
        let name = make_export_filename(&rec, "image", None, &mut counter).unwrap();
        assert_eq!(name, "lab.obs.12345.image");
    }

    #[test]
    fn keyword_and_ordinal_groups() {
        let rec = test_record();
        let mut counter = 0;
        let name = make_export_filename(
            &rec,
            "image",
            Some("{seriesname}_{camera:%02d}_{#}"),
            &mut counter,
        )
        .unwrap();
        assert_eq!(name, "lab.obs_02_00000");

        let again =
            make_export_filename(&rec, "image", Some("{#}"), &mut counter).unwrap();
        assert_eq!(again, "00001");
    }

    #[test]
    fn time_layout_with_alternate_modifier() {
        let rec = test_record();
        let mut counter = 0;

        // {T_REC:A-1} drops seconds and the separators
        let name =
            make_export_filename(&rec, "image", Some("{t_rec:A-1}"), &mut counter).unwrap();
        assert_eq!(name, "19960624_1230_TAI");
    }

    #[test]
    fn time_layout_with_zone_override() {
        let rec = test_record();
        let mut counter = 0;
        let name =
            make_export_filename(&rec, "image", Some("{t_rec:0,TAI}"), &mut counter).unwrap();
        assert_eq!(name, "1996.06.24_12:30:45_TAI");
    }

    #[test]
    fn directory_modifier_wraps_date_fields() {
        let rec = test_record();
        let mut counter = 0;
        let name =
            make_export_filename(&rec, "image", Some("{t_rec:D-1}"), &mut counter).unwrap();
        assert_eq!(name, "@1996@06@24@1230_TAI");
    }

    #[test]
    fn unknown_keyword_is_an_error() {
        let rec = test_record();
        let mut counter = 0;
        assert!(make_export_filename(&rec, "image", Some("{nope}"), &mut counter).is_err());
    }
}
