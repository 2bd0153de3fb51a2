//! Datasource: one stored series and its live accumulation state
//!
//! A datasource turns timestamped raw readings into a per-second rate
//! (according to its type), spreads that rate over the interval since
//! the previous reading, and emits one primary datapoint per crossed
//! step boundary.

use crate::backend::Storage;
use crate::cell::{DoubleCell, LongCell, RrdAllocator, StringCell};
use crate::def::DsDef;
use crate::types::{normalize, DsType, Timestamp};
use crate::xml::XmlWriter;
use crate::Result;

/// 2^32, the wrap distance of a 32-bit counter
const MAX_32_BIT: f64 = 4_294_967_296.0;

/// 2^64, the wrap distance of a 64-bit counter
const MAX_64_BIT: f64 = 18_446_744_073_709_551_616.0;

/// A primary datapoint batch emitted by one datasource update:
/// `steps` consecutive step slots, all carrying `value`
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pdp {
    pub value: f64,
    pub steps: i64,
}

/// Point-in-time view of a datasource, definition plus live state
#[derive(Debug, Clone)]
pub struct DsSnapshot {
    pub name: String,
    pub ds_type: DsType,
    pub heartbeat: i64,
    pub min: f64,
    pub max: f64,
    pub last_value: f64,
    pub accum_value: f64,
    pub nan_seconds: i64,
}

pub(crate) struct Datasource {
    def: DsDef,

    // state
    last_value: DoubleCell,
    accum_value: DoubleCell,
    nan_seconds: LongCell,
}

impl Datasource {
    /// Lay out and initialize a datasource block at creation.
    ///
    /// The stretch between `start` and the step boundary preceding it
    /// has no data by construction, so it starts out counted as
    /// unknown seconds.
    pub(crate) fn create(
        alloc: &mut RrdAllocator,
        st: &mut Storage,
        def: &DsDef,
        start: Timestamp,
        step: i64,
    ) -> Result<Self> {
        let mut name = StringCell::new(alloc, true);
        let mut ds_type = StringCell::new(alloc, true);
        let mut heartbeat = LongCell::new(alloc, true);
        let mut min = DoubleCell::new(alloc, true);
        let mut max = DoubleCell::new(alloc, true);
        let mut last_value = DoubleCell::new(alloc, false);
        let mut accum_value = DoubleCell::new(alloc, false);
        let mut nan_seconds = LongCell::new(alloc, false);

        name.set(st, &def.name)?;
        ds_type.set(st, def.ds_type.name())?;
        heartbeat.set(st, def.heartbeat)?;
        min.set(st, def.min)?;
        max.set(st, def.max)?;
        last_value.set(st, f64::NAN)?;
        accum_value.set(st, f64::NAN)?;
        nan_seconds.set(st, start % step)?;

        Ok(Self {
            def: def.clone(),
            last_value,
            accum_value,
            nan_seconds,
        })
    }

    /// Lay out and read an existing datasource block
    pub(crate) fn open(alloc: &mut RrdAllocator, st: &mut Storage) -> Result<Self> {
        let mut name = StringCell::new(alloc, true);
        let mut ds_type = StringCell::new(alloc, true);
        let mut heartbeat = LongCell::new(alloc, true);
        let mut min = DoubleCell::new(alloc, true);
        let mut max = DoubleCell::new(alloc, true);
        let last_value = DoubleCell::new(alloc, false);
        let accum_value = DoubleCell::new(alloc, false);
        let nan_seconds = LongCell::new(alloc, false);

        let def = DsDef::new(
            &name.get(st)?,
            ds_type.get(st)?.parse()?,
            heartbeat.get(st)?,
            min.get(st)?,
            max.get(st)?,
        )?;

        Ok(Self {
            def,
            last_value,
            accum_value,
            nan_seconds,
        })
    }

    pub(crate) fn def(&self) -> &DsDef {
        &self.def
    }

    pub(crate) fn name(&self) -> &str {
        &self.def.name
    }

    /// Ingest one raw reading taken at `new_time`.
    ///
    /// `last_update` is the database-wide previous update time. Returns
    /// the primary datapoints produced by any crossed step boundaries;
    /// the caller dispatches them to every archive before the header's
    /// last-update timestamp moves.
    pub(crate) fn process(
        &mut self,
        st: &mut Storage,
        step: i64,
        last_update: Timestamp,
        new_time: Timestamp,
        new_value: f64,
    ) -> Result<Option<Pdp>> {
        let start_time = normalize(last_update, step);
        let end_time = start_time + step;
        let old_value = self.last_value.get(st)?;
        let update_value = self.rate(last_update, old_value, new_time, new_value);

        let pdp = if new_time < end_time {
            self.accumulate(st, last_update, new_time, update_value)?;
            None
        } else {
            let boundary = normalize(new_time, step);
            self.accumulate(st, last_update, boundary, update_value)?;
            let value = self.total(st, start_time, boundary)?;
            let steps = (boundary - end_time) / step + 1;
            self.nan_seconds.set(st, 0)?;
            self.accum_value.set(st, f64::NAN)?;
            self.accumulate(st, boundary, new_time, update_value)?;
            Some(Pdp { value, steps })
        };
        self.last_value.set(st, new_value)?;
        Ok(pdp)
    }

    /// Convert a raw reading into a per-second rate
    fn rate(
        &self,
        old_time: Timestamp,
        old_value: f64,
        new_time: Timestamp,
        new_value: f64,
    ) -> f64 {
        let elapsed = (new_time - old_time) as f64;
        if new_time - old_time > self.def.heartbeat {
            return f64::NAN;
        }
        let mut rate = f64::NAN;
        match self.def.ds_type {
            DsType::Gauge => {
                rate = new_value;
            }
            DsType::Absolute => {
                if !new_value.is_nan() {
                    rate = new_value / elapsed;
                }
            }
            DsType::Derive => {
                if !new_value.is_nan() && !old_value.is_nan() {
                    rate = (new_value - old_value) / elapsed;
                }
            }
            DsType::Counter => {
                if !new_value.is_nan() && !old_value.is_nan() {
                    let mut diff = new_value - old_value;
                    if diff < 0.0 {
                        diff += MAX_32_BIT;
                    }
                    if diff < 0.0 {
                        diff += MAX_64_BIT - MAX_32_BIT;
                    }
                    if diff >= 0.0 {
                        rate = diff / elapsed;
                    }
                }
            }
        }
        self.check_min_max(rate)
    }

    fn check_min_max(&self, rate: f64) -> f64 {
        if !rate.is_nan()
            && ((!self.def.min.is_nan() && rate < self.def.min)
                || (!self.def.max.is_nan() && rate > self.def.max))
        {
            return f64::NAN;
        }
        rate
    }

    /// Weight `update_value` into the accumulator over `[from, to]`
    fn accumulate(
        &mut self,
        st: &mut Storage,
        from: Timestamp,
        to: Timestamp,
        update_value: f64,
    ) -> Result<()> {
        if to == from {
            return Ok(());
        }
        if update_value.is_nan() {
            let nan_seconds = self.nan_seconds.get(st)?;
            self.nan_seconds.set(st, nan_seconds + (to - from))?;
        } else {
            let accum = self.accum_value.get(st)?;
            let contribution = update_value * (to - from) as f64;
            self.accum_value
                .set(st, crate::types::nan_sum(accum, contribution))?;
        }
        Ok(())
    }

    /// Close out the step `[start, boundary]` into one PDP value.
    ///
    /// The step is unknown when its unknown stretch exceeds the
    /// heartbeat or no known second remains.
    fn total(&mut self, st: &mut Storage, start: Timestamp, boundary: Timestamp) -> Result<f64> {
        let nan_seconds = self.nan_seconds.get(st)?;
        let accum = self.accum_value.get(st)?;
        let valid_seconds = boundary - start - nan_seconds;
        if nan_seconds <= self.def.heartbeat && valid_seconds > 0 && !accum.is_nan() {
            Ok(accum / valid_seconds as f64)
        } else {
            Ok(f64::NAN)
        }
    }

    pub(crate) fn snapshot(&mut self, st: &mut Storage) -> Result<DsSnapshot> {
        Ok(DsSnapshot {
            name: self.def.name.clone(),
            ds_type: self.def.ds_type,
            heartbeat: self.def.heartbeat,
            min: self.def.min,
            max: self.def.max,
            last_value: self.last_value.get(st)?,
            accum_value: self.accum_value.get(st)?,
            nan_seconds: self.nan_seconds.get(st)?,
        })
    }

    /// Overwrite the live state; used by XML restore
    pub(crate) fn set_state(
        &mut self,
        st: &mut Storage,
        last_value: f64,
        accum_value: f64,
        nan_seconds: i64,
    ) -> Result<()> {
        self.last_value.set(st, last_value)?;
        self.accum_value.set(st, accum_value)?;
        self.nan_seconds.set(st, nan_seconds)
    }

    pub(crate) fn append_xml(&mut self, st: &mut Storage, writer: &mut XmlWriter) -> Result<()> {
        let snap = self.snapshot(st)?;
        writer.start_tag("ds");
        writer.write_tag("name", &snap.name);
        writer.write_tag("type", snap.ds_type);
        writer.write_tag("minimal_heartbeat", snap.heartbeat);
        writer.write_double_tag("min", snap.min);
        writer.write_double_tag("max", snap.max);
        writer.write_comment("state");
        writer.write_double_tag("last_ds", snap.last_value);
        writer.write_double_tag("value", snap.accum_value);
        writer.write_tag("unknown_sec", snap.nan_seconds);
        writer.close_tag();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendType;
    use tempfile::TempDir;

    fn scratch_ds(spec: &str, start: Timestamp, step: i64) -> (TempDir, Storage, Datasource) {
        let temp_dir = TempDir::new().unwrap();
        let backend = BackendType::File
            .create(&temp_dir.path().join("ds.rrd"))
            .unwrap();
        let mut st = Storage::new(backend);
        st.set_length(DsDef::SIZE).unwrap();
        let mut alloc = RrdAllocator::new();
        let def = DsDef::from_spec(spec).unwrap();
        let ds = Datasource::create(&mut alloc, &mut st, &def, start, step).unwrap();
        (temp_dir, st, ds)
    }

    #[test]
    fn test_gauge_mid_step_accumulation() {
        let (_dir, mut st, mut ds) =
            scratch_ds("DS:g:GAUGE:600:U:U", 1_000_000_000, 300);
        // no boundary crossed: no PDP yet
        let pdp = ds
            .process(&mut st, 300, 1_000_000_000, 1_000_000_100, 9.0)
            .unwrap();
        assert!(pdp.is_none());

        // crossing the boundary at +300 emits one PDP of the mean rate
        let pdp = ds
            .process(&mut st, 300, 1_000_000_100, 1_000_000_300, 9.0)
            .unwrap()
            .unwrap();
        assert_eq!(pdp.steps, 1);
        assert!((pdp.value - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_counter_wrap_32bit() {
        let (_dir, mut st, mut ds) = scratch_ds("DS:c:COUNTER:600:U:U", 1_000_000, 1);
        ds.process(&mut st, 1, 1_000_000, 1_000_001, 4_294_967_291.0)
            .unwrap();
        // 2^32 - 5 -> 3 over 8 seconds: 8 counts, rate 1.0
        let pdp = ds
            .process(&mut st, 1, 1_000_001, 1_000_009, 3.0)
            .unwrap()
            .unwrap();
        assert_eq!(pdp.steps, 8);
        assert!((pdp.value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_over_heartbeat_is_unknown() {
        let (_dir, mut st, mut ds) = scratch_ds("DS:g:GAUGE:100:U:U", 1_000_000, 100);
        let pdp = ds
            .process(&mut st, 100, 1_000_000, 1_000_200, 5.0)
            .unwrap()
            .unwrap();
        assert!(pdp.value.is_nan());
        assert_eq!(pdp.steps, 2);
    }

    #[test]
    fn test_range_violation_forces_nan() {
        let (_dir, mut st, mut ds) = scratch_ds("DS:g:GAUGE:600:0:10", 1_000_000, 100);
        let pdp = ds
            .process(&mut st, 100, 1_000_000, 1_000_100, 50.0)
            .unwrap()
            .unwrap();
        assert!(pdp.value.is_nan());
    }

    #[test]
    fn test_derive_allows_negative_rate() {
        let (_dir, mut st, mut ds) = scratch_ds("DS:d:DERIVE:600:U:U", 1_000_000, 100);
        ds.process(&mut st, 100, 1_000_000, 1_000_050, 1000.0)
            .unwrap();
        let pdp = ds
            .process(&mut st, 100, 1_000_050, 1_000_100, 500.0)
            .unwrap()
            .unwrap();
        assert!((pdp.value - -10.0).abs() < 1e-9);
    }

    #[test]
    fn test_absolute_rate() {
        let (_dir, mut st, mut ds) = scratch_ds("DS:a:ABSOLUTE:600:U:U", 1_000_000, 100);
        let pdp = ds
            .process(&mut st, 100, 1_000_000, 1_000_100, 400.0)
            .unwrap()
            .unwrap();
        assert!((pdp.value - 4.0).abs() < 1e-9);
    }
}
