//! The keyword engine: typed, ranked, scoped keywords and the slotted-key
//! arithmetic that buckets continuous coordinates into integer slots.
//!
//! A slotted keyword is accompanied by auxiliary keywords sharing its name
//! plus a suffix: `_index` (the integer slot), `_epoch`/`_base` (the origin),
//! `_step` (the bucket width), `_unit` (the width's unit), and `_round`
//! (optional pre-quantization). Slot arithmetic lives here; looking the
//! auxiliaries up happens against the owning record's keyword set.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use tracing::warn;

use crate::error::{ExportError, Result};
use crate::timefmt;
use crate::types::{StoreType, StoreValue};

/// Keyword and segment links resolve through at most this many hops; deeper
/// chains are treated as cycles.
pub const MAX_LINK_DEPTH: usize = 16;

/// Relative tolerance for slot-boundary and duration-multiple tests.
pub const SLOT_EPSILON: f64 = 1.0e-11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecScope {
    Variable,
    Constant,
    Index,
    TsEq,
    TsSlot,
    Slot,
    Enum,
    Carr,
}

impl RecScope {
    pub fn parse(s: &str) -> Result<RecScope> {
        match s.trim().to_ascii_lowercase().as_str() {
            "variable" => Ok(RecScope::Variable),
            "constant" => Ok(RecScope::Constant),
            "index" => Ok(RecScope::Index),
            "ts_eq" => Ok(RecScope::TsEq),
            "ts_slot" => Ok(RecScope::TsSlot),
            "slot" => Ok(RecScope::Slot),
            "enum" => Ok(RecScope::Enum),
            "carr" => Ok(RecScope::Carr),
            other => Err(ExportError::BadRequest(format!(
                "unknown keyword scope '{other}'"
            ))),
        }
    }

    pub fn is_slotted(&self) -> bool {
        matches!(
            self,
            RecScope::TsEq | RecScope::TsSlot | RecScope::Slot | RecScope::Carr
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeywordFlags(pub u32);

impl KeywordFlags {
    pub const PER_SEGMENT: u32 = 1 << 0;
    pub const INTERNAL_PRIME: u32 = 1 << 1;
    pub const EXTERNAL_PRIME: u32 = 1 << 2;

    pub fn per_segment(&self) -> bool {
        self.0 & Self::PER_SEGMENT != 0
    }

    pub fn internal_prime(&self) -> bool {
        self.0 & Self::INTERNAL_PRIME != 0
    }

    pub fn external_prime(&self) -> bool {
        self.0 & Self::EXTERNAL_PRIME != 0
    }
}

#[derive(Debug, Clone)]
pub struct KeywordInfo {
    pub name: String,
    pub ty: StoreType,
    /// printf-style display format; for times, reinterpreted as a precision.
    pub format: String,
    /// physical unit; for times, the zone.
    pub unit: String,
    pub description: String,
    pub scope: RecScope,
    pub flags: KeywordFlags,
    /// 0-based ordinal, used only for deterministic iteration.
    pub rank: u32,
}

/// A keyword either stores its value or refers to a keyword of a linked
/// record.
#[derive(Debug, Clone)]
pub enum KeywordBinding {
    Stored(StoreValue),
    Link { link: String, target: String },
}

#[derive(Debug, Clone)]
pub struct Keyword {
    pub info: KeywordInfo,
    pub binding: KeywordBinding,
}

impl Keyword {
    pub fn stored(info: KeywordInfo, value: StoreValue) -> Keyword {
        Keyword {
            info,
            binding: KeywordBinding::Stored(value),
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(self.binding, KeywordBinding::Link { .. })
    }

    pub fn value(&self) -> Option<&StoreValue> {
        match &self.binding {
            KeywordBinding::Stored(v) => Some(v),
            KeywordBinding::Link { .. } => None,
        }
    }

    pub fn value_or_err(&self) -> Result<&StoreValue> {
        self.value().ok_or_else(|| {
            ExportError::Internal(format!(
                "keyword '{}' is an unresolved link",
                self.info.name
            ))
        })
    }

    /// Render the value through the keyword's declared format. Times honor
    /// the precision/zone discipline; everything else is printf.
    pub fn snprintf_value(&self) -> Result<String> {
        let value = self.value_or_err()?;

        if self.info.ty == StoreType::Time {
            let t = value.as_f64()?;
            let (precision, zone) = timefmt::normalize_time_format(&self.info.format, &self.info.unit);
            return Ok(timefmt::format_time(t, &zone, precision));
        }

        Ok(value.format_with(&self.info.format))
    }

    pub fn get_double(&self) -> Result<f64> {
        self.value_or_err()?.as_f64()
    }
}

/// Name → keyword container. Names are case-insensitively unique; iteration
/// is by rank so output order is deterministic.
#[derive(Debug, Clone, Default)]
pub struct KeywordSet {
    map: HashMap<String, Keyword>,
}

impl KeywordSet {
    pub fn new() -> KeywordSet {
        KeywordSet::default()
    }

    pub fn insert(&mut self, kw: Keyword) -> Option<Keyword> {
        self.map.insert(kw.info.name.to_ascii_lowercase(), kw)
    }

    pub fn get(&self, name: &str) -> Option<&Keyword> {
        self.map.get(&name.to_ascii_lowercase())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Keyword> {
        self.map.get_mut(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Keywords in rank order (name as a tiebreak, so equal ranks still
    /// iterate deterministically).
    pub fn iter_ranked(&self) -> Vec<&Keyword> {
        let mut all: Vec<&Keyword> = self.map.values().collect();
        all.sort_by(|a, b| {
            a.info
                .rank
                .cmp(&b.info.rank)
                .then_with(|| a.info.name.cmp(&b.info.name))
        });
        all
    }

    /// Set (or create) a stored value, preserving declared info if present.
    pub fn set_value(&mut self, name: &str, value: StoreValue) {
        if let Some(kw) = self.get_mut(name) {
            kw.binding = KeywordBinding::Stored(value);
            return;
        }

        let ty = value.store_type();
        self.insert(Keyword::stored(
            KeywordInfo {
                name: name.to_owned(),
                ty,
                format: default_format(ty).to_owned(),
                unit: String::new(),
                description: String::new(),
                scope: RecScope::Variable,
                flags: KeywordFlags::default(),
                rank: self.map.len() as u32,
            },
            value,
        ));
    }
}

pub fn default_format(ty: StoreType) -> &'static str {
    match ty {
        StoreType::Char | StoreType::Short | StoreType::Int => "%d",
        StoreType::Long => "%lld",
        StoreType::Float => "%f",
        StoreType::Double => "%lf",
        StoreType::Time => "0",
        _ => "%s",
    }
}

// ---------------------------------------------------------------------------
// slotted keywords

pub const ANC_INDEX: &str = "_index";
pub const ANC_EPOCH: &str = "_epoch";
pub const ANC_BASE: &str = "_base";
pub const ANC_STEP: &str = "_step";
pub const ANC_UNIT: &str = "_unit";
pub const ANC_ROUND: &str = "_round";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotUnit {
    TenthSecs,
    Secs,
    Mins,
    Hours,
    Days,
    Degrees,
    Arcmins,
    Arcsecs,
    MilliArcsecs,
    Rads,
    MicroRads,
}

static SLOT_UNIT_NAMES: Lazy<HashMap<&'static str, SlotUnit>> = Lazy::new(|| {
    [
        ("tenthsecs", SlotUnit::TenthSecs),
        ("secs", SlotUnit::Secs),
        ("mins", SlotUnit::Mins),
        ("hours", SlotUnit::Hours),
        ("days", SlotUnit::Days),
        ("degrees", SlotUnit::Degrees),
        ("arcmins", SlotUnit::Arcmins),
        ("arcsecs", SlotUnit::Arcsecs),
        ("milliarcsecs", SlotUnit::MilliArcsecs),
        ("rads", SlotUnit::Rads),
        ("microrads", SlotUnit::MicroRads),
    ]
    .into_iter()
    .collect()
});

impl SlotUnit {
    pub fn parse(s: &str) -> Option<SlotUnit> {
        SLOT_UNIT_NAMES.get(s.trim().to_ascii_lowercase().as_str()).copied()
    }

    /// Multiplier to the coordinate's base unit (seconds for time scopes,
    /// degrees for Carrington).
    pub fn multiplier(&self) -> f64 {
        match self {
            SlotUnit::TenthSecs => 0.1,
            SlotUnit::Secs => 1.0,
            SlotUnit::Mins => 60.0,
            SlotUnit::Hours => 3600.0,
            SlotUnit::Days => 86400.0,
            SlotUnit::Degrees => 1.0,
            SlotUnit::Arcmins => 1.0 / 60.0,
            SlotUnit::Arcsecs => 1.0 / 3600.0,
            SlotUnit::MilliArcsecs => 1.0 / 3_600_000.0,
            SlotUnit::Rads => 180.0 / std::f64::consts::PI,
            SlotUnit::MicroRads => (180.0 / std::f64::consts::PI) / 1000.0,
        }
    }
}

fn ancillary<'a>(keys: &'a KeywordSet, slotkey: &Keyword, suffix: &str) -> Option<&'a Keyword> {
    keys.get(&format!("{}{}", slotkey.info.name, suffix))
}

/// The step of a slotted keyword, in the coordinate's base unit.
///
/// The `_step` value may be numeric (interpreted through `_unit` or the
/// scope's default unit) or a duration string like `"60s"`, which fixes the
/// unit to seconds and supersedes any `_unit` keyword.
fn slot_step(keys: &KeywordSet, slotkey: &Keyword) -> Result<f64> {
    let step_key = ancillary(keys, slotkey, ANC_STEP).ok_or_else(|| {
        ExportError::BadRequest(format!(
            "slotted keyword '{}' has no {} auxiliary",
            slotkey.info.name, ANC_STEP
        ))
    })?;

    let explicit_unit = ancillary(keys, slotkey, ANC_UNIT);

    if let Some(StoreValue::String(text)) = step_key.value() {
        if text.parse::<f64>().is_err() {
            // a duration string fixes the unit
            if explicit_unit.is_some() {
                warn!(
                    slotkey = %slotkey.info.name,
                    "step specifies its own unit, ignoring the _unit keyword"
                );
            }
            return timefmt::parse_duration(text);
        }
    }

    let step = step_key.get_double()?;

    let unit = match explicit_unit {
        Some(ukey) => match ukey.value() {
            Some(StoreValue::String(uname)) => SlotUnit::parse(uname).ok_or_else(|| {
                ExportError::BadRequest(format!("unknown slot unit '{uname}'"))
            })?,
            _ => default_slot_unit(slotkey.info.scope),
        },
        None => default_slot_unit(slotkey.info.scope),
    };

    Ok(step * unit.multiplier())
}

fn default_slot_unit(scope: RecScope) -> SlotUnit {
    match scope {
        RecScope::Carr => SlotUnit::Degrees,
        _ => SlotUnit::Secs,
    }
}

fn slot_base(keys: &KeywordSet, slotkey: &Keyword) -> Result<f64> {
    match slotkey.info.scope {
        RecScope::TsEq | RecScope::TsSlot => {
            let epoch = ancillary(keys, slotkey, ANC_EPOCH).ok_or_else(|| {
                ExportError::BadRequest(format!(
                    "slotted keyword '{}' has no {} auxiliary",
                    slotkey.info.name, ANC_EPOCH
                ))
            })?;
            match epoch.value() {
                Some(StoreValue::String(text)) => timefmt::parse_time(text),
                _ => epoch.get_double(),
            }
        }
        RecScope::Carr => Ok(0.0),
        RecScope::Slot => match ancillary(keys, slotkey, ANC_BASE) {
            Some(base) => base.get_double(),
            None => Ok(0.0),
        },
        other => Err(ExportError::BadRequest(format!(
            "keyword '{}' with scope {:?} is not slotted",
            slotkey.info.name, other
        ))),
    }
}

fn slot_round(keys: &KeywordSet, slotkey: &Keyword) -> Option<f64> {
    ancillary(keys, slotkey, ANC_ROUND)
        .and_then(|k| k.get_double().ok())
        .filter(|r| *r > 0.0)
}

/// Core slot computation.
///
/// `TS_EQ` snaps a value lying within floating-point precision below a slot
/// boundary up into the slot that starts there; `TS_SLOT` (round_down) is a
/// plain floor. The optional round step quantizes the offset first.
fn calc_slot(v: f64, base: f64, step: f64, round: Option<f64>, round_down: bool) -> i64 {
    let mut x = v - base;

    if let Some(r) = round {
        x = if round_down {
            (x / r).floor() * r
        } else {
            (x / r + 0.5).floor() * r
        };
    }

    let frac = x / step;
    if round_down {
        frac.floor() as i64
    } else {
        (frac + SLOT_EPSILON * frac.abs().max(1.0)).floor() as i64
    }
}

/// Map a physical value of a slotted keyword to its integer slot.
pub fn slot_to_index(keys: &KeywordSet, slotkey: &Keyword, value: &StoreValue) -> Result<i64> {
    if !slotkey.info.scope.is_slotted() {
        return Err(ExportError::BadRequest(format!(
            "keyword '{}' is not slotted",
            slotkey.info.name
        )));
    }

    let step = slot_step(keys, slotkey)?;
    if step <= 0.0 {
        return Err(ExportError::BadRequest(format!(
            "slotted keyword '{}' has a non-positive step",
            slotkey.info.name
        )));
    }

    let base = slot_base(keys, slotkey)?;
    let round = slot_round(keys, slotkey);
    let round_down = slotkey.info.scope == RecScope::TsSlot;

    let v = match value {
        StoreValue::String(text) if slotkey.info.ty == StoreType::Time => {
            timefmt::parse_time(text)?
        }
        other => other.as_f64()?,
    };

    Ok(calc_slot(v, base, step, round, round_down))
}

/// How many slots a requested coverage duration spans.
///
/// Durations shorter than one step round up to a single slot; durations that
/// are not an integral number of steps are truncated; both cases warn.
pub fn duration_to_slots(keys: &KeywordSet, slotkey: &Keyword, duration: f64) -> Result<i64> {
    let step = slot_step(keys, slotkey)?;
    if step <= 0.0 {
        return Err(ExportError::BadRequest(format!(
            "slotted keyword '{}' has a non-positive step",
            slotkey.info.name
        )));
    }

    if duration < step {
        warn!(
            duration,
            step, "duration is smaller than the slot step, rounding up to one slot"
        );
        return Ok(1);
    }

    let exact = duration / step;
    let trunced = exact.trunc();

    if (exact - trunced).abs() > SLOT_EPSILON * (exact.abs() + trunced.abs()) {
        warn!(
            duration,
            step, "duration is not a multiple of the slot step, truncating"
        );
    }

    Ok(trunced as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, ty: StoreType, scope: RecScope) -> KeywordInfo {
        KeywordInfo {
            name: name.to_owned(),
            ty,
            format: "0".to_owned(),
            unit: String::new(),
            description: String::new(),
            scope,
            flags: KeywordFlags::default(),
            rank: 0,
        }
    }

    fn ts_key(scope: RecScope, epoch: &str, step: &str) -> (KeywordSet, Keyword) {
        let mut keys = KeywordSet::new();
        let slot = Keyword::stored(
            info("t_rec", StoreType::Time, scope),
            StoreValue::Time(0.0),
        );
        keys.insert(slot.clone());
        keys.insert(Keyword::stored(
            info("t_rec_epoch", StoreType::String, RecScope::Constant),
            StoreValue::String(epoch.to_owned()),
        ));
        keys.insert(Keyword::stored(
            info("t_rec_step", StoreType::String, RecScope::Constant),
            StoreValue::String(step.to_owned()),
        ));
        (keys, slot)
    }

    #[test]
    fn ts_eq_boundary_lands_in_starting_slot() {
        let (keys, slot) = ts_key(RecScope::TsEq, "1993.01.01_00:00:00_TAI", "60s");
        let epoch = timefmt::parse_time("1993.01.01_00:00:00_TAI").unwrap();

        let exact = StoreValue::Time(epoch + 60.0);
        assert_eq!(slot_to_index(&keys, &slot, &exact).unwrap(), 1);

        let below = StoreValue::Time(epoch + 59.999);
        assert_eq!(slot_to_index(&keys, &slot, &below).unwrap(), 0);
    }

    #[test]
    fn values_in_one_slot_share_an_index() {
        let (keys, slot) = ts_key(RecScope::TsEq, "1993.01.01_00:00:00_TAI", "60s");
        let epoch = timefmt::parse_time("1993.01.01_00:00:00_TAI").unwrap();

        for off in [120.0, 130.5, 179.999] {
            let v = StoreValue::Time(epoch + off);
            assert_eq!(slot_to_index(&keys, &slot, &v).unwrap(), 2);
        }
    }

    #[test]
    fn ts_slot_rounds_down() {
        let (keys, slot) = ts_key(RecScope::TsSlot, "1993.01.01_00:00:00_TAI", "90s");
        let epoch = timefmt::parse_time("1993.01.01_00:00:00_TAI").unwrap();

        let v = StoreValue::Time(epoch + 89.0);
        assert_eq!(slot_to_index(&keys, &slot, &v).unwrap(), 0);
        let v = StoreValue::Time(epoch + 91.0);
        assert_eq!(slot_to_index(&keys, &slot, &v).unwrap(), 1);
    }

    #[test]
    fn carrington_units() {
        let mut keys = KeywordSet::new();
        let slot = Keyword::stored(
            info("carrot", StoreType::Double, RecScope::Carr),
            StoreValue::Double(0.0),
        );
        keys.insert(slot.clone());
        keys.insert(Keyword::stored(
            info("carrot_step", StoreType::Double, RecScope::Constant),
            StoreValue::Double(30.0),
        ));
        keys.insert(Keyword::stored(
            info("carrot_unit", StoreType::String, RecScope::Constant),
            StoreValue::String("arcmins".to_owned()),
        ));

        // step = 30 arcmin = 0.5 degrees
        let v = StoreValue::Double(1.25);
        assert_eq!(slot_to_index(&keys, &slot, &v).unwrap(), 2);
    }

    #[test]
    fn durations_round_and_warn() {
        let (keys, slot) = ts_key(RecScope::TsEq, "1993.01.01_00:00:00_TAI", "60s");

        assert_eq!(duration_to_slots(&keys, &slot, 30.0).unwrap(), 1);
        assert_eq!(duration_to_slots(&keys, &slot, 600.0).unwrap(), 10);
        assert_eq!(duration_to_slots(&keys, &slot, 615.0).unwrap(), 10);
    }

    #[test]
    fn ranked_iteration_is_deterministic() {
        let mut keys = KeywordSet::new();
        for (name, rank) in [("b", 1), ("a", 0), ("c", 2)] {
            let mut i = info(name, StoreType::Int, RecScope::Variable);
            i.rank = rank;
            keys.insert(Keyword::stored(i, StoreValue::Int(0)));
        }

        let names: Vec<&str> = keys.iter_ranked().iter().map(|k| k.info.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
