//! RrdDb - the database container
//!
//! Binds one header, the datasources and the archives to a single
//! backend and orchestrates updates and fetches. A container is
//! single-writer; callers (normally the pool) serialize access.

use crate::archive::{ArcSnapshot, Archive};
use crate::backend::{BackendType, Storage};
use crate::cell::RrdAllocator;
use crate::datasource::{Datasource, DsSnapshot};
use crate::def::{ArcDef, DsDef, RrdDef};
use crate::fetch::{FetchData, FetchRequest};
use crate::header::Header;
use crate::sample::Sample;
use crate::types::Timestamp;
use crate::xml::{XmlImport, XmlWriter};
use crate::{Result, RrdError};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Best-effort canonicalization that also works for paths which do
/// not exist yet
pub(crate) fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let file_name = path.file_name().unwrap_or(path.as_os_str());
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = parent.canonicalize() {
            return dir.join(file_name);
        }
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// One open round-robin database
pub struct RrdDb {
    storage: Storage,
    path: PathBuf,
    canonical: PathBuf,
    header: Header,
    datasources: Vec<Datasource>,
    archives: Vec<Archive>,
    closed: bool,
}

impl RrdDb {
    /// Create a fresh database from a definition, using file storage
    pub fn create(def: &RrdDef) -> Result<Self> {
        Self::create_with(def, &BackendType::default())
    }

    /// Create a fresh database on the given backend
    pub fn create_with(def: &RrdDef, backend_type: &BackendType) -> Result<Self> {
        def.validate()?;
        let backend = backend_type.create(def.path())?;
        let mut storage = Storage::new(backend);
        storage.set_length(def.exact_size())?;

        let mut alloc = RrdAllocator::new();
        let header = Header::create(
            &mut alloc,
            &mut storage,
            def.version(),
            def.step(),
            def.start(),
            def.datasources().len(),
            def.archives().len(),
        )?;
        let mut datasources = Vec::with_capacity(def.datasources().len());
        for ds_def in def.datasources() {
            datasources.push(Datasource::create(
                &mut alloc,
                &mut storage,
                ds_def,
                def.start(),
                def.step(),
            )?);
        }
        let mut archives = Vec::with_capacity(def.archives().len());
        for arc_def in def.archives() {
            archives.push(Archive::create(
                &mut alloc,
                &mut storage,
                arc_def,
                def.version(),
                def.datasources().len(),
                def.start(),
                def.step(),
            )?);
        }
        debug_assert_eq!(alloc.allocated(), def.exact_size());

        info!(
            "Created RRD {:?}: step {}, {} datasource(s), {} archive(s)",
            def.path(),
            def.step(),
            datasources.len(),
            archives.len()
        );
        Ok(Self {
            storage,
            path: def.path().to_path_buf(),
            canonical: canonical_path(def.path()),
            header,
            datasources,
            archives,
            closed: false,
        })
    }

    /// Open an existing database read-write, using file storage
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, false, &BackendType::default())
    }

    /// Open an existing database on the given backend
    pub fn open_with(
        path: impl AsRef<Path>,
        read_only: bool,
        backend_type: &BackendType,
    ) -> Result<Self> {
        let path = path.as_ref();
        let backend = backend_type.open(path, read_only)?;
        let mut storage = Storage::new(backend);

        let mut alloc = RrdAllocator::new();
        let header = Header::open(&mut alloc, &mut storage)?;
        let mut datasources = Vec::with_capacity(header.ds_count());
        for _ in 0..header.ds_count() {
            datasources.push(Datasource::open(&mut alloc, &mut storage)?);
        }
        let mut archives = Vec::with_capacity(header.arc_count());
        for _ in 0..header.arc_count() {
            archives.push(Archive::open(
                &mut alloc,
                &mut storage,
                header.version(),
                header.ds_count(),
            )?);
        }
        if alloc.allocated() != storage.length()? {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid file length in {:?}: expected {}, found {}",
                path,
                alloc.allocated(),
                storage.length()?
            )));
        }

        Ok(Self {
            storage,
            path: path.to_path_buf(),
            canonical: canonical_path(path),
            header,
            datasources,
            archives,
            closed: false,
        })
    }

    /// Recreate a database from an XML dump, using file storage
    pub fn restore(path: impl AsRef<Path>, xml: &str) -> Result<Self> {
        Self::restore_with(path, xml, &BackendType::default())
    }

    /// Recreate a database from an XML dump on the given backend.
    /// Equivalent to create followed by bulk state injection.
    pub fn restore_with(
        path: impl AsRef<Path>,
        xml: &str,
        backend_type: &BackendType,
    ) -> Result<Self> {
        let path = path.as_ref();
        let import = XmlImport::parse(xml)?;

        let mut def =
            RrdDef::new(path, import.last_update, import.step).with_version(import.version)?;
        for ds in &import.datasources {
            def.add_datasource(DsDef::new(
                &ds.name,
                ds.ds_type.parse()?,
                ds.heartbeat,
                ds.min,
                ds.max,
            )?)?;
        }
        for arc in &import.archives {
            def.add_archive(ArcDef::new(
                arc.consol_fun.parse()?,
                arc.xff,
                arc.steps,
                arc.rows.len(),
            )?)?;
        }

        let mut db = Self::create_with(&def, backend_type)?;
        for (ds, imported) in db.datasources.iter_mut().zip(&import.datasources) {
            ds.set_state(
                &mut db.storage,
                imported.last_value,
                imported.accum_value,
                imported.nan_seconds,
            )?;
        }
        for (arc, imported) in db.archives.iter_mut().zip(&import.archives) {
            arc.set_state(&mut db.storage, &imported.states, &imported.rows)?;
        }
        info!("Restored RRD {:?} from XML dump", path);
        Ok(db)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(RrdError::InvalidState(format!(
                "RRD {:?} already closed",
                self.path
            )));
        }
        Ok(())
    }

    /// Path this database was opened under
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Canonical path identifying this database in the pool
    pub fn canonical_path(&self) -> &Path {
        &self.canonical
    }

    /// Seconds per primary datapoint
    pub fn step(&self) -> i64 {
        self.header.step()
    }

    /// On-disk layout version (1 or 2)
    pub fn version(&self) -> i32 {
        self.header.version()
    }

    pub fn ds_count(&self) -> usize {
        self.datasources.len()
    }

    pub fn archive_count(&self) -> usize {
        self.archives.len()
    }

    /// Timestamp of the last committed sample
    pub fn last_update_time(&mut self) -> Result<Timestamp> {
        self.check_open()?;
        self.header.last_update(&mut self.storage)
    }

    /// Datasource names in definition order
    pub fn ds_names(&self) -> Vec<String> {
        self.datasources
            .iter()
            .map(|ds| ds.name().to_string())
            .collect()
    }

    pub fn contains_ds(&self, name: &str) -> bool {
        self.datasources.iter().any(|ds| ds.name() == name)
    }

    /// Index of a datasource by name
    pub fn ds_index(&self, name: &str) -> Result<usize> {
        self.datasources
            .iter()
            .position(|ds| ds.name() == name)
            .ok_or_else(|| RrdError::InvalidArgument(format!("Unknown datasource name: {}", name)))
    }

    /// Definition and live state of one datasource
    pub fn datasource(&mut self, index: usize) -> Result<DsSnapshot> {
        self.check_open()?;
        self.datasources[index].snapshot(&mut self.storage)
    }

    /// Definition and live state of one archive
    pub fn archive(&mut self, index: usize) -> Result<ArcSnapshot> {
        self.check_open()?;
        self.archives[index].snapshot(&mut self.storage)
    }

    /// Start collecting values for a sample at `time`
    pub fn create_sample(&mut self, time: Timestamp) -> Result<Sample<'_>> {
        self.check_open()?;
        Ok(Sample::new(self, time))
    }

    /// Commit one batch of raw values; `values` in definition order.
    ///
    /// Timestamps must be strictly increasing across commits.
    pub(crate) fn store(&mut self, time: Timestamp, values: &[f64]) -> Result<()> {
        self.check_open()?;
        let step = self.header.step();
        let last_update = self.header.last_update(&mut self.storage)?;
        if time <= last_update {
            return Err(RrdError::InvalidArgument(format!(
                "Bad sample time {}: last update was {}, at least one second step is required",
                time, last_update
            )));
        }

        let mut pdps = Vec::with_capacity(self.datasources.len());
        for (ds, value) in self.datasources.iter_mut().zip(values) {
            pdps.push(ds.process(&mut self.storage, step, last_update, time, *value)?);
        }
        for archive in &mut self.archives {
            for (ds_index, pdp) in pdps.iter().enumerate() {
                if let Some(pdp) = pdp {
                    archive.archive(
                        &mut self.storage,
                        ds_index,
                        pdp.value,
                        pdp.steps,
                        step,
                        last_update,
                    )?;
                }
            }
        }
        self.header.set_last_update(&mut self.storage, time)
    }

    /// Fetch consolidated data for a request
    pub fn fetch(&mut self, request: &FetchRequest) -> Result<FetchData> {
        self.check_open()?;
        let step = self.header.step();
        let last_update = self.header.last_update(&mut self.storage)?;

        let ds: Vec<(usize, String)> = match request.filter() {
            None => self
                .datasources
                .iter()
                .enumerate()
                .map(|(i, ds)| (i, ds.name().to_string()))
                .collect(),
            Some(names) => names
                .iter()
                .map(|name| Ok((self.ds_index(name)?, name.clone())))
                .collect::<Result<_>>()?,
        };

        let arc_index = self.find_matching_archive(request, step, last_update)?;
        self.archives[arc_index].fetch_data(&mut self.storage, request, step, last_update, &ds)
    }

    /// Pick the archive serving a request: the coarsest one with full
    /// coverage whose step still satisfies the resolution, or the
    /// finest matching archive if none qualifies
    fn find_matching_archive(
        &self,
        request: &FetchRequest,
        step: i64,
        last_update: Timestamp,
    ) -> Result<usize> {
        let mut best_full: Option<(usize, i64)> = None;
        let mut finest: Option<(usize, i64)> = None;
        for (index, archive) in self.archives.iter().enumerate() {
            if archive.consol_fun() != request.consol_fun() {
                continue;
            }
            let arc_step = archive.arc_step(step);
            if finest.map_or(true, |(_, s)| arc_step < s) {
                finest = Some((index, arc_step));
            }
            let covers = archive.start_time(step, last_update) <= request.fetch_start()
                && archive.end_time(step, last_update) >= request.fetch_end();
            if covers
                && arc_step <= request.resolution()
                && best_full.map_or(true, |(_, s)| arc_step > s)
            {
                best_full = Some((index, arc_step));
            }
        }
        best_full
            .or(finest)
            .map(|(index, _)| index)
            .ok_or_else(|| {
                RrdError::InvalidArgument(format!(
                    "No {} archive in {:?}",
                    request.consol_fun(),
                    self.path
                ))
            })
    }

    /// Serialize the whole database, definition and state, as XML
    pub fn dump_xml(&mut self) -> Result<String> {
        self.check_open()?;
        let step = self.header.step();
        let last_update = self.header.last_update(&mut self.storage)?;

        let mut writer = XmlWriter::new();
        writer.start_tag("rrd");
        writer.write_tag("version", format!("{:04}", self.header.version()));
        writer.write_comment(&format!("{} seconds", step));
        writer.write_tag("step", step);
        writer.write_tag("lastupdate", last_update);
        for ds in &mut self.datasources {
            ds.append_xml(&mut self.storage, &mut writer)?;
        }
        for archive in &mut self.archives {
            archive.append_xml(&mut self.storage, &mut writer, step, last_update)?;
        }
        Ok(writer.finish())
    }

    /// NaN out archived values that fall outside their datasource's
    /// `[min, max]`; used by restore's range check
    pub fn filter_archived_values(&mut self) -> Result<()> {
        self.check_open()?;
        let bounds: Vec<(f64, f64)> = self
            .datasources
            .iter()
            .map(|ds| (ds.def().min(), ds.def().max()))
            .collect();
        for archive in &mut self.archives {
            archive.filter_values(&mut self.storage, &bounds)?;
        }
        Ok(())
    }

    /// Flush pending writes and release the backend. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.storage.close()?;
        info!("Closed RRD {:?}", self.path);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for RrdDb {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!("Error closing RRD {:?}: {}", self.path, e);
            }
        }
    }
}
