//! Record-set specification tokenizer.
//!
//! A specification is `series[filter1][filter2]…`, optionally joined by
//! commas into a union of sub-specs. Filters may themselves contain commas
//! (`series[:#12,#47]`), so the union split respects bracket depth. This is
//! a tokenizer only; filter semantics belong to the catalog.

use crate::error::{ExportError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubSpec {
    pub series: String,
    /// Filter bodies without their brackets, in order.
    pub filters: Vec<String>,
}

impl SubSpec {
    pub fn to_spec(&self) -> String {
        let mut out = self.series.clone();
        for f in &self.filters {
            out.push('[');
            out.push_str(f);
            out.push(']');
        }
        out
    }

    pub fn filter_text(&self) -> String {
        self.filters
            .iter()
            .map(|f| format!("[{f}]"))
            .collect::<String>()
    }
}

/// Split a union specification into sub-specs.
pub fn parse_spec(spec: &str) -> Result<Vec<SubSpec>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(ExportError::BadRequest("empty record-set specification".into()));
    }

    let mut subs = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();

    for c in spec.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                if depth == 0 {
                    return Err(ExportError::BadRequest(format!(
                        "unbalanced ']' in specification '{spec}'"
                    )));
                }
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                subs.push(parse_one(current.trim(), spec)?);
                current.clear();
            }
            _ => current.push(c),
        }
    }

    if depth != 0 {
        return Err(ExportError::BadRequest(format!(
            "unterminated filter in specification '{spec}'"
        )));
    }

    subs.push(parse_one(current.trim(), spec)?);
    Ok(subs)
}

fn parse_one(sub: &str, whole: &str) -> Result<SubSpec> {
    if sub.is_empty() {
        return Err(ExportError::BadRequest(format!(
            "empty sub-specification in '{whole}'"
        )));
    }

    let (series, rest) = match sub.find('[') {
        Some(pos) => sub.split_at(pos),
        None => (sub, ""),
    };

    let series = series.trim();
    if series.is_empty() {
        return Err(ExportError::BadRequest(format!(
            "sub-specification without a series name in '{whole}'"
        )));
    }

    let mut filters = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();

    for c in rest.chars() {
        match c {
            '[' => {
                if depth > 0 {
                    current.push(c);
                }
                depth += 1;
            }
            ']' => {
                depth -= 1;
                if depth == 0 {
                    filters.push(std::mem::take(&mut current));
                } else {
                    current.push(c);
                }
            }
            _ if depth > 0 => current.push(c),
            _ if c.is_whitespace() => {}
            _ => {
                return Err(ExportError::BadRequest(format!(
                    "unexpected '{c}' outside filters in '{whole}'"
                )))
            }
        }
    }

    Ok(SubSpec {
        series: series.to_owned(),
        filters,
    })
}

/// The union rejoined with the canonical `", "` separator.
pub fn canonical(subs: &[SubSpec]) -> String {
    subs.iter()
        .map(|s| s.to_spec())
        .collect::<Vec<_>>()
        .join(", ")
}

/// True when every sub-spec names the same series (case-insensitively).
pub fn single_series(subs: &[SubSpec]) -> bool {
    match subs.split_first() {
        Some((first, rest)) => rest
            .iter()
            .all(|s| s.series.eq_ignore_ascii_case(&first.series)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sub_with_filters() {
        let subs = parse_spec("hmi.m_720s[2024.01.01][? quality >= 0 ?]").unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].series, "hmi.m_720s");
        assert_eq!(subs[0].filters, vec!["2024.01.01", "? quality >= 0 ?"]);
        assert_eq!(
            subs[0].to_spec(),
            "hmi.m_720s[2024.01.01][? quality >= 0 ?]"
        );
    }

    #[test]
    fn commas_inside_filters_do_not_split() {
        let subs = parse_spec("s[:#12,#47]").unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].filters, vec![":#12,#47"]);
    }

    #[test]
    fn union_splits_at_top_level() {
        let subs = parse_spec("s[a], s[b],t[c]").unwrap();
        assert_eq!(subs.len(), 3);
        assert_eq!(subs[1].series, "s");
        assert_eq!(subs[2].series, "t");
        assert!(!single_series(&subs));
        assert!(single_series(&subs[0..2]));
    }

    #[test]
    fn bad_brackets_are_rejected() {
        assert!(parse_spec("s[a").is_err());
        assert!(parse_spec("s]a[").is_err());
        assert!(parse_spec("").is_err());
    }

    #[test]
    fn nested_brackets_stay_in_one_filter() {
        let subs = parse_spec("s[a[b]c]").unwrap();
        assert_eq!(subs[0].filters, vec!["a[b]c"]);
    }
}
