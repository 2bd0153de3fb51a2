//! robintool - command-line front-end for RobinDB
//!
//! Mirrors the classic rrdtool command surface: create, update,
//! fetch, last, dump, info and restore. Timestamps are seconds since
//! the epoch, `N`/`now`, or `now-<offset>`; `U` stands for an
//! unknown value.

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use robindb_core::{
    config, parse_double, ArcDef, DsDef, FetchRequest, RrdDb, RrdDbPool, RrdDef, Timestamp,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "robintool", version, about = "Round-robin time-series database tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new database
    Create {
        path: PathBuf,
        /// First valid sample time (exclusive)
        #[arg(short = 'b', long = "start", default_value = "now-10s")]
        start: String,
        /// Seconds per primary datapoint
        #[arg(short = 's', long = "step", default_value_t = config::DEFAULT_STEP)]
        step: i64,
        /// DS:name:TYPE:heartbeat:min:max and RRA:CF:xff:steps:rows specs
        #[arg(required = true)]
        specs: Vec<String>,
    },
    /// Commit one or more samples
    Update {
        path: PathBuf,
        /// Colon-separated subset of datasource names the values map to
        #[arg(short = 't', long = "template")]
        template: Option<String>,
        /// timestamp:value[:value...] batches; N means now
        #[arg(required = true)]
        updates: Vec<String>,
    },
    /// Fetch consolidated values
    Fetch {
        path: PathBuf,
        /// Consolidation function: AVERAGE, MIN, MAX or LAST
        cf: String,
        #[arg(short = 's', long = "start")]
        start: Option<String>,
        #[arg(short = 'e', long = "end", default_value = "now")]
        end: String,
        /// Coarsest acceptable archive step in seconds
        #[arg(short = 'r', long = "resolution", default_value_t = 1)]
        resolution: i64,
    },
    /// Print the last update time
    Last { path: PathBuf },
    /// Dump the whole database as XML
    Dump { path: PathBuf },
    /// Print definition and state of a database
    Info { path: PathBuf },
    /// Rebuild a database from an XML dump
    Restore {
        xml_path: PathBuf,
        rrd_path: PathBuf,
        /// NaN out archived values violating datasource bounds
        #[arg(short = 'r', long = "range-check")]
        range_check: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();
    run(Cli::parse())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let pool = RrdDbPool::instance();
    match cli.command {
        Command::Create {
            path,
            start,
            step,
            specs,
        } => create(pool, &path, &start, step, &specs),
        Command::Update {
            path,
            template,
            updates,
        } => update(pool, &path, template.as_deref(), &updates),
        Command::Fetch {
            path,
            cf,
            start,
            end,
            resolution,
        } => fetch(pool, &path, &cf, start.as_deref(), &end, resolution),
        Command::Last { path } => with_db(pool, &path, |db| {
            println!("{}", db.last_update_time()?);
            Ok(())
        }),
        Command::Dump { path } => with_db(pool, &path, |db| {
            print!("{}", db.dump_xml()?);
            Ok(())
        }),
        Command::Info { path } => with_db(pool, &path, |db| {
            print!("{}", info_text(db)?);
            Ok(())
        }),
        Command::Restore {
            xml_path,
            rrd_path,
            range_check,
        } => restore(pool, &xml_path, &rrd_path, range_check),
    }
}

/// Run one operation against a pooled handle, always returning the
/// handle to the pool
fn with_db<T>(
    pool: &RrdDbPool,
    path: &Path,
    op: impl FnOnce(&mut RrdDb) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let handle = pool.request(path)?;
    let result = {
        let mut db = handle.lock();
        op(&mut db)
    };
    let released = pool.release(&handle);
    let value = result?;
    released?;
    Ok(value)
}

fn create(
    pool: &RrdDbPool,
    path: &Path,
    start: &str,
    step: i64,
    specs: &[String],
) -> anyhow::Result<()> {
    let start = parse_timestamp(start)?;
    let mut def = RrdDef::new(path, start, step);
    for spec in specs {
        if spec.starts_with("DS:") {
            def.add_datasource(DsDef::from_spec(spec)?)?;
        } else if spec.starts_with("RRA:") {
            def.add_archive(ArcDef::from_spec(spec)?)?;
        } else {
            bail!("Invalid create syntax: {}", spec);
        }
    }
    let handle = pool.request_create(&def)?;
    pool.release(&handle)?;
    Ok(())
}

fn update(
    pool: &RrdDbPool,
    path: &Path,
    template: Option<&str>,
    updates: &[String],
) -> anyhow::Result<()> {
    let ds_names: Option<Vec<&str>> = template.map(|t| t.split(':').collect());
    with_db(pool, path, |db| {
        if let Some(names) = &ds_names {
            for name in names {
                if !db.contains_ds(name) {
                    bail!("Invalid datasource name: {}", name);
                }
            }
        }
        for batch in updates {
            let tokens: Vec<&str> = batch.split(':').collect();
            let expected = ds_names.as_ref().map_or(db.ds_count(), |names| names.len());
            if tokens.len() != expected + 1 {
                bail!(
                    "Expected {} values, {} found in: {}",
                    expected,
                    tokens.len() - 1,
                    batch
                );
            }
            let time = parse_timestamp(tokens[0])?;
            let mut sample = db.create_sample(time)?;
            for (position, token) in tokens[1..].iter().enumerate() {
                let value = parse_double(token)?;
                match &ds_names {
                    Some(names) => sample.set_value(names[position], value)?,
                    None => sample.set_value_at(position, value)?,
                };
            }
            sample.update()?;
        }
        Ok(())
    })
}

fn fetch(
    pool: &RrdDbPool,
    path: &Path,
    cf: &str,
    start: Option<&str>,
    end: &str,
    resolution: i64,
) -> anyhow::Result<()> {
    let cf = cf.parse()?;
    let end = parse_timestamp(end)?;
    let start = match start {
        Some(s) => parse_timestamp(s)?,
        None => end - 86_400,
    };
    with_db(pool, path, |db| {
        let request = FetchRequest::new(cf, start, end, resolution)?;
        let data = db.fetch(&request)?;
        print!("{}", data);
        Ok(())
    })
}

fn restore(
    pool: &RrdDbPool,
    xml_path: &Path,
    rrd_path: &Path,
    range_check: bool,
) -> anyhow::Result<()> {
    let xml = std::fs::read_to_string(xml_path)
        .with_context(|| format!("Cannot read {:?}", xml_path))?;
    let handle = pool.request_import(rrd_path, &xml)?;
    let result: anyhow::Result<()> = if range_check {
        handle.lock().filter_archived_values().map_err(Into::into)
    } else {
        Ok(())
    };
    let released = pool.release(&handle);
    result?;
    released?;
    Ok(())
}

fn info_text(db: &mut RrdDb) -> anyhow::Result<String> {
    use std::fmt::Write;

    let mut out = String::new();
    writeln!(out, "filename = {:?}", db.path())?;
    writeln!(out, "rrd_version = \"{:04}\"", db.version())?;
    writeln!(out, "step = {}", db.step())?;
    writeln!(out, "last_update = {}", db.last_update_time()?)?;
    for index in 0..db.ds_count() {
        let ds = db.datasource(index)?;
        writeln!(out, "ds[{}].type = \"{}\"", ds.name, ds.ds_type)?;
        writeln!(out, "ds[{}].minimal_heartbeat = {}", ds.name, ds.heartbeat)?;
        writeln!(out, "ds[{}].min = {}", ds.name, ds.min)?;
        writeln!(out, "ds[{}].max = {}", ds.name, ds.max)?;
        writeln!(out, "ds[{}].last_ds = {}", ds.name, ds.last_value)?;
        writeln!(out, "ds[{}].value = {}", ds.name, ds.accum_value)?;
        writeln!(out, "ds[{}].unknown_sec = {}", ds.name, ds.nan_seconds)?;
    }
    for index in 0..db.archive_count() {
        let arc = db.archive(index)?;
        writeln!(out, "rra[{}].cf = \"{}\"", index, arc.consol_fun)?;
        writeln!(out, "rra[{}].rows = {}", index, arc.rows)?;
        writeln!(out, "rra[{}].pdp_per_row = {}", index, arc.steps)?;
        writeln!(out, "rra[{}].xff = {}", index, arc.xff)?;
        for (ds_index, (value, nan_steps)) in arc.states.iter().enumerate() {
            writeln!(
                out,
                "rra[{}].cdp_prep[{}].value = {}",
                index, ds_index, value
            )?;
            writeln!(
                out,
                "rra[{}].cdp_prep[{}].unknown_datapoints = {}",
                index, ds_index, nan_steps
            )?;
        }
    }
    Ok(out)
}

/// Parse seconds since the epoch, `N`/`now`, or `now-<n>[smhd]`
fn parse_timestamp(input: &str) -> anyhow::Result<Timestamp> {
    let now = Utc::now().timestamp();
    if input == "N" || input == "now" {
        return Ok(now);
    }
    if let Some(offset) = input.strip_prefix("now-") {
        let (digits, unit) = match offset.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
            Some((split, _)) => offset.split_at(split),
            None => (offset, ""),
        };
        let amount: i64 = digits
            .parse()
            .with_context(|| format!("Invalid timestamp: {}", input))?;
        let scale = match unit {
            "" | "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            _ => bail!("Invalid timestamp unit in: {}", input),
        };
        return Ok(now - amount * scale);
    }
    input
        .parse()
        .with_context(|| format!("Invalid timestamp: {}", input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(parse_timestamp("1000000000").unwrap(), 1_000_000_000);
        let now = Utc::now().timestamp();
        assert!((parse_timestamp("N").unwrap() - now).abs() <= 1);
        assert!((parse_timestamp("now-10s").unwrap() - (now - 10)).abs() <= 1);
        assert!((parse_timestamp("now-2m").unwrap() - (now - 120)).abs() <= 1);
        assert!((parse_timestamp("now-1d").unwrap() - (now - 86_400)).abs() <= 1);
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("now-3w").is_err());
    }

    #[test]
    fn test_cli_shape() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
