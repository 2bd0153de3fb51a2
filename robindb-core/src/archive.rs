//! Archive: consolidation state and round-robin storage
//!
//! An archive consolidates primary datapoints into rows at its own
//! step (database step times `steps`), keeping one accumulator and one
//! robin per datasource. Values land in the robin whenever the update
//! time crosses an archive-step boundary.

use crate::backend::Storage;
use crate::cell::{DoubleCell, DoubleMatrixCell, IntCell, LongCell, RrdAllocator, StringCell};
use crate::def::ArcDef;
use crate::fetch::{FetchData, FetchRequest};
use crate::robin::Robin;
use crate::types::{nan_max, nan_min, nan_sum, normalize, ConsolFun, Timestamp};
use crate::xml::XmlWriter;
use crate::Result;

/// Per-datasource consolidation state
pub(crate) struct ArcState {
    accum: DoubleCell,
    nan_steps: LongCell,
}

impl ArcState {
    fn create(
        alloc: &mut RrdAllocator,
        st: &mut Storage,
        start: Timestamp,
        step: i64,
        arc_step: i64,
    ) -> Result<Self> {
        let mut accum = DoubleCell::new(alloc, false);
        let mut nan_steps = LongCell::new(alloc, false);
        // steps of the current archive window that already elapsed
        // before creation carry no data
        let elapsed = (normalize(start, step) - normalize(start, arc_step)) / step;
        accum.set(st, f64::NAN)?;
        nan_steps.set(st, elapsed)?;
        Ok(Self { accum, nan_steps })
    }

    fn open(alloc: &mut RrdAllocator) -> Self {
        Self {
            accum: DoubleCell::new(alloc, false),
            nan_steps: LongCell::new(alloc, false),
        }
    }

    pub(crate) fn accum_value(&mut self, st: &mut Storage) -> Result<f64> {
        self.accum.get(st)
    }

    pub(crate) fn nan_steps(&mut self, st: &mut Storage) -> Result<i64> {
        self.nan_steps.get(st)
    }

    pub(crate) fn set(&mut self, st: &mut Storage, accum: f64, nan_steps: i64) -> Result<()> {
        self.accum.set(st, accum)?;
        self.nan_steps.set(st, nan_steps)
    }
}

/// Point-in-time view of an archive definition and its states
#[derive(Debug, Clone)]
pub struct ArcSnapshot {
    pub consol_fun: ConsolFun,
    pub xff: f64,
    pub steps: i64,
    pub rows: usize,
    /// One `(accum_value, nan_steps)` pair per datasource
    pub states: Vec<(f64, i64)>,
}

pub(crate) struct Archive {
    def: ArcDef,
    states: Vec<ArcState>,
    robins: Vec<Robin>,
}

impl Archive {
    /// Lay out and initialize an archive block at creation
    pub(crate) fn create(
        alloc: &mut RrdAllocator,
        st: &mut Storage,
        def: &ArcDef,
        version: i32,
        ds_count: usize,
        start: Timestamp,
        step: i64,
    ) -> Result<Self> {
        let mut consol_fun = StringCell::new(alloc, true);
        let mut xff = DoubleCell::new(alloc, false);
        let mut steps = IntCell::new(alloc, true);
        let mut rows = IntCell::new(alloc, true);
        consol_fun.set(st, def.consol_fun.name())?;
        xff.set(st, def.xff)?;
        steps.set(st, def.steps as i32)?;
        rows.set(st, def.rows as i32)?;

        let arc_step = step * def.steps;
        let mut states = Vec::with_capacity(ds_count);
        for _ in 0..ds_count {
            states.push(ArcState::create(alloc, st, start, step, arc_step)?);
        }

        let robins = Self::layout_robins(alloc, st, version, ds_count, def.rows, true)?;
        Ok(Self {
            def: def.clone(),
            states,
            robins,
        })
    }

    /// Lay out and read an existing archive block
    pub(crate) fn open(
        alloc: &mut RrdAllocator,
        st: &mut Storage,
        version: i32,
        ds_count: usize,
    ) -> Result<Self> {
        let mut consol_fun = StringCell::new(alloc, true);
        let mut xff = DoubleCell::new(alloc, false);
        let mut steps = IntCell::new(alloc, true);
        let mut rows = IntCell::new(alloc, true);
        let def = ArcDef::new(
            consol_fun.get(st)?.parse()?,
            xff.get(st)?,
            steps.get(st)? as i64,
            rows.get(st)? as usize,
        )?;

        let mut states = Vec::with_capacity(ds_count);
        for _ in 0..ds_count {
            states.push(ArcState::open(alloc));
        }

        let robins = Self::layout_robins(alloc, st, version, ds_count, def.rows, false)?;
        Ok(Self {
            def,
            states,
            robins,
        })
    }

    fn layout_robins(
        alloc: &mut RrdAllocator,
        st: &mut Storage,
        version: i32,
        ds_count: usize,
        rows: usize,
        initialize: bool,
    ) -> Result<Vec<Robin>> {
        let mut robins = Vec::with_capacity(ds_count);
        if version == 1 {
            for _ in 0..ds_count {
                robins.push(Robin::create_array(alloc, st, rows, initialize)?);
            }
        } else {
            let mut pointers: Vec<IntCell> =
                (0..ds_count).map(|_| IntCell::new(alloc, false)).collect();
            let matrix = DoubleMatrixCell::new(alloc, rows, ds_count);
            if initialize {
                for pointer in &mut pointers {
                    pointer.set(st, 0)?;
                }
                for row in 0..rows {
                    for col in 0..ds_count {
                        matrix.set(st, row, col, f64::NAN)?;
                    }
                }
            }
            for (column, pointer) in pointers.into_iter().enumerate() {
                robins.push(Robin::matrix_column(matrix, pointer, column));
            }
        }
        Ok(robins)
    }

    pub(crate) fn def(&self) -> &ArcDef {
        &self.def
    }

    pub(crate) fn consol_fun(&self) -> ConsolFun {
        self.def.consol_fun
    }

    /// Archive step: database step times steps-per-row
    pub(crate) fn arc_step(&self, step: i64) -> i64 {
        step * self.def.steps
    }

    /// Timestamp of the newest consolidated slot
    pub(crate) fn end_time(&self, step: i64, last_update: Timestamp) -> Timestamp {
        normalize(last_update, self.arc_step(step))
    }

    /// Timestamp of the oldest consolidated slot
    pub(crate) fn start_time(&self, step: i64, last_update: Timestamp) -> Timestamp {
        self.end_time(step, last_update) - (self.def.rows as i64 - 1) * self.arc_step(step)
    }

    /// Advance this archive's state for one datasource by
    /// `num_updates` primary datapoints, all valued `value`.
    ///
    /// Steps are consumed one at a time until the update time reaches
    /// an archive-step boundary, then whole rows of identical value
    /// are bulk-stored (at most one robin wrap), and the remainder
    /// lands in the accumulator.
    pub(crate) fn archive(
        &mut self,
        st: &mut Storage,
        ds_index: usize,
        value: f64,
        num_updates: i64,
        step: i64,
        last_update: Timestamp,
    ) -> Result<()> {
        let arc_step = self.arc_step(step);
        let cf = self.def.consol_fun;
        let xff = self.def.xff;
        let arc_steps = self.def.steps;
        let state = &mut self.states[ds_index];
        let robin = &mut self.robins[ds_index];

        let mut update_time = normalize(last_update, step) + step;
        let mut remaining = num_updates;
        // finish the current archive step
        while remaining > 0 {
            Self::accumulate(st, state, cf, value)?;
            remaining -= 1;
            if update_time % arc_step == 0 {
                Self::finalize_step(st, state, robin, cf, xff, arc_steps)?;
                break;
            }
            update_time += step;
        }
        // whole rows of the same value in one shot
        let bulk_count = (remaining / arc_steps).min(self.def.rows as i64);
        robin.bulk_store(st, value, bulk_count as usize)?;
        // partial tail stays in the accumulator
        for _ in 0..remaining % arc_steps {
            Self::accumulate(st, state, cf, value)?;
        }
        Ok(())
    }

    fn accumulate(st: &mut Storage, state: &mut ArcState, cf: ConsolFun, value: f64) -> Result<()> {
        if value.is_nan() {
            let nan_steps = state.nan_steps.get(st)?;
            state.nan_steps.set(st, nan_steps + 1)
        } else {
            let accum = state.accum.get(st)?;
            let next = match cf {
                ConsolFun::Min => nan_min(accum, value),
                ConsolFun::Max => nan_max(accum, value),
                ConsolFun::Last => value,
                ConsolFun::Average => nan_sum(accum, value),
            };
            state.accum.set(st, next)
        }
    }

    /// Close the current consolidation window into the robin and reset
    /// the accumulator. The row is unknown when more than
    /// `xff * steps` of its primary datapoints were unknown.
    fn finalize_step(
        st: &mut Storage,
        state: &mut ArcState,
        robin: &mut Robin,
        cf: ConsolFun,
        xff: f64,
        arc_steps: i64,
    ) -> Result<()> {
        let nan_steps = state.nan_steps.get(st)?;
        let mut accum = state.accum.get(st)?;
        if nan_steps as f64 <= xff * arc_steps as f64 && !accum.is_nan() {
            if cf == ConsolFun::Average {
                accum /= (arc_steps - nan_steps) as f64;
            }
            robin.store(st, accum)?;
        } else {
            robin.store(st, f64::NAN)?;
        }
        state.accum.set(st, f64::NAN)?;
        state.nan_steps.set(st, 0)
    }

    /// Assemble a dense result for `request`; `ds` pairs each output
    /// column with its datasource index, in output order
    pub(crate) fn fetch_data(
        &mut self,
        st: &mut Storage,
        request: &FetchRequest,
        step: i64,
        last_update: Timestamp,
        ds: &[(usize, String)],
    ) -> Result<FetchData> {
        let arc_step = self.arc_step(step);
        let fetch_start = normalize(request.fetch_start(), arc_step);
        let mut fetch_end = normalize(request.fetch_end(), arc_step);
        if fetch_end < request.fetch_end() {
            fetch_end += arc_step;
        }
        let start_time = self.start_time(step, last_update);
        let end_time = self.end_time(step, last_update);

        let pts_count = ((fetch_end - fetch_start) / arc_step + 1) as usize;
        let match_start = fetch_start.max(start_time);
        let match_end = fetch_end.min(end_time);

        let robin_values = if match_start <= match_end {
            let match_count = ((match_end - match_start) / arc_step + 1) as usize;
            let match_start_index = ((match_start - start_time) / arc_step) as usize;
            let mut preloaded = Vec::with_capacity(ds.len());
            for (ds_index, _) in ds {
                preloaded.push(self.robins[*ds_index].values(st, match_start_index, match_count)?);
            }
            Some(preloaded)
        } else {
            None
        };

        let mut timestamps = Vec::with_capacity(pts_count);
        let mut values: Vec<Vec<f64>> = vec![Vec::with_capacity(pts_count); ds.len()];
        for pt_index in 0..pts_count {
            let time = fetch_start + pt_index as i64 * arc_step;
            timestamps.push(time);
            for (column, column_values) in values.iter_mut().enumerate() {
                let value = match &robin_values {
                    Some(preloaded) if time >= match_start && time <= match_end => {
                        preloaded[column][((time - match_start) / arc_step) as usize]
                    }
                    _ => f64::NAN,
                };
                column_values.push(value);
            }
        }

        let ds_names = ds.iter().map(|(_, name)| name.clone()).collect();
        Ok(FetchData::new(arc_step, ds_names, timestamps, values))
    }

    pub(crate) fn snapshot(&mut self, st: &mut Storage) -> Result<ArcSnapshot> {
        let mut states = Vec::with_capacity(self.states.len());
        for state in &mut self.states {
            states.push((state.accum_value(st)?, state.nan_steps(st)?));
        }
        Ok(ArcSnapshot {
            consol_fun: self.def.consol_fun,
            xff: self.def.xff,
            steps: self.def.steps,
            rows: self.def.rows,
            states,
        })
    }

    /// Overwrite consolidation state and robin contents; used by
    /// XML restore. `rows` holds one value per datasource per row,
    /// oldest row first.
    pub(crate) fn set_state(
        &mut self,
        st: &mut Storage,
        states: &[(f64, i64)],
        rows: &[Vec<f64>],
    ) -> Result<()> {
        for (state, (accum, nan_steps)) in self.states.iter_mut().zip(states) {
            state.set(st, *accum, *nan_steps)?;
        }
        for (column, robin) in self.robins.iter_mut().enumerate() {
            let column_values: Vec<f64> = rows.iter().map(|row| row[column]).collect();
            robin.update(st, &column_values)?;
        }
        Ok(())
    }

    /// Filter every robin of this archive through the corresponding
    /// datasource bounds
    pub(crate) fn filter_values(&mut self, st: &mut Storage, bounds: &[(f64, f64)]) -> Result<()> {
        for (robin, (min, max)) in self.robins.iter_mut().zip(bounds) {
            robin.filter_values(st, *min, *max)?;
        }
        Ok(())
    }

    pub(crate) fn append_xml(
        &mut self,
        st: &mut Storage,
        writer: &mut XmlWriter,
        step: i64,
        last_update: Timestamp,
    ) -> Result<()> {
        let arc_step = self.arc_step(step);
        writer.start_tag("rra");
        writer.write_tag("cf", self.def.consol_fun);
        writer.write_comment(&format!("{} seconds", arc_step));
        writer.write_tag("pdp_per_row", self.def.steps);
        writer.write_double_tag("xff", self.def.xff);
        writer.start_tag("cdp_prep");
        for state in &mut self.states {
            let accum = state.accum_value(st)?;
            let nan_steps = state.nan_steps(st)?;
            writer.start_tag("ds");
            writer.write_double_tag("value", accum);
            writer.write_tag("unknown_datapoints", nan_steps);
            writer.close_tag();
        }
        writer.close_tag();
        writer.start_tag("database");
        let start_time = self.start_time(step, last_update);
        for row in 0..self.def.rows {
            writer.write_comment(&format!("{}", start_time + row as i64 * arc_step));
            writer.start_tag("row");
            for robin in &mut self.robins {
                writer.write_double_tag("v", robin.value(st, row)?);
            }
            writer.close_tag();
        }
        writer.close_tag();
        writer.close_tag();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendType;
    use tempfile::TempDir;

    fn scratch_archive(
        spec: &str,
        version: i32,
        ds_count: usize,
        start: Timestamp,
        step: i64,
    ) -> (TempDir, Storage, Archive) {
        let temp_dir = TempDir::new().unwrap();
        let backend = BackendType::File
            .create(&temp_dir.path().join("arc.rrd"))
            .unwrap();
        let mut st = Storage::new(backend);
        st.set_length(1 << 16).unwrap();
        let mut alloc = RrdAllocator::new();
        let def = ArcDef::from_spec(spec).unwrap();
        let archive =
            Archive::create(&mut alloc, &mut st, &def, version, ds_count, start, step).unwrap();
        (temp_dir, st, archive)
    }

    #[test]
    fn test_single_step_archive_stores_each_pdp() {
        let (_dir, mut st, mut arc) =
            scratch_archive("RRA:AVERAGE:0.5:1:10", 2, 1, 999_999_900, 300);
        // last_update on the boundary: one PDP lands as one row
        arc.archive(&mut st, 0, 4.0, 1, 300, 999_999_900).unwrap();
        arc.archive(&mut st, 0, 6.0, 1, 300, 1_000_000_200)
            .unwrap();
        let values = arc.robins[0].all_values(&mut st).unwrap();
        assert_eq!(values[8], 4.0);
        assert_eq!(values[9], 6.0);
    }

    #[test]
    fn test_xff_rule() {
        // xff 0.5, 10 steps per row
        let (_dir, mut st, mut arc) = scratch_archive("RRA:AVERAGE:0.5:10:4", 2, 1, 0, 10);
        // 6 of 10 unknown: row is NaN
        arc.archive(&mut st, 0, f64::NAN, 6, 10, 0).unwrap();
        arc.archive(&mut st, 0, 2.0, 4, 10, 60).unwrap();
        let row = arc.robins[0].value(&mut st, 3).unwrap();
        assert!(row.is_nan());

        // 5 of 10 unknown: row is the mean of the known values
        arc.archive(&mut st, 0, f64::NAN, 5, 10, 100).unwrap();
        arc.archive(&mut st, 0, 3.0, 5, 10, 150).unwrap();
        let row = arc.robins[0].value(&mut st, 3).unwrap();
        assert!((row - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_bulk_advancement_caps_at_rows() {
        let (_dir, mut st, mut arc) = scratch_archive("RRA:LAST:0.5:1:5", 2, 1, 0, 1);
        // a million missed steps still only rewrite the robin once
        arc.archive(&mut st, 0, 7.0, 1_000_000, 1, 0).unwrap();
        let values = arc.robins[0].all_values(&mut st).unwrap();
        assert!(values.iter().all(|v| *v == 7.0));
    }

    #[test]
    fn test_min_max_consolidation_ignores_nan() {
        let (_dir, mut st, mut min_arc) = scratch_archive("RRA:MIN:0.9:4:2", 2, 1, 0, 10);
        min_arc.archive(&mut st, 0, 5.0, 1, 10, 0).unwrap();
        min_arc.archive(&mut st, 0, f64::NAN, 1, 10, 10).unwrap();
        min_arc.archive(&mut st, 0, 2.0, 2, 10, 20).unwrap();
        assert_eq!(min_arc.robins[0].value(&mut st, 1).unwrap(), 2.0);

        let (_dir2, mut st2, mut max_arc) = scratch_archive("RRA:MAX:0.9:4:2", 2, 1, 0, 10);
        max_arc.archive(&mut st2, 0, 5.0, 1, 10, 0).unwrap();
        max_arc.archive(&mut st2, 0, f64::NAN, 1, 10, 10).unwrap();
        max_arc.archive(&mut st2, 0, 2.0, 2, 10, 20).unwrap();
        assert_eq!(max_arc.robins[0].value(&mut st2, 1).unwrap(), 5.0);
    }

    #[test]
    fn test_open_matches_created_layout() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("arc.rrd");
        {
            let backend = BackendType::File.create(&path).unwrap();
            let mut st = Storage::new(backend);
            st.set_length(1 << 16).unwrap();
            let mut alloc = RrdAllocator::new();
            let def = ArcDef::from_spec("RRA:AVERAGE:0.25:2:6").unwrap();
            let mut arc =
                Archive::create(&mut alloc, &mut st, &def, 2, 2, 1000, 10).unwrap();
            arc.robins[1].store(&mut st, 42.0).unwrap();
            st.close().unwrap();
        }
        let backend = BackendType::File.open(&path, false).unwrap();
        let mut st = Storage::new(backend);
        let mut alloc = RrdAllocator::new();
        let mut arc = Archive::open(&mut alloc, &mut st, 2, 2).unwrap();
        assert_eq!(arc.def().consol_fun(), ConsolFun::Average);
        assert_eq!(arc.def().xff(), 0.25);
        assert_eq!(arc.def().steps(), 2);
        assert_eq!(arc.def().rows(), 6);
        assert_eq!(arc.robins[1].value(&mut st, 5).unwrap(), 42.0);
    }
}
