use std::iter::Iterator;
use std::time::Duration;

use anyhow::Result;

use doc_stress::configuration::{
    HarnessConfig, StoreUris, WorkerCounts, DEFAULT_REPORT_WINDOW, DEFAULT_TICK_INTERVAL,
};
use doc_stress::version;

use crate::gocompat::flags::ParserBuilder;

const DEFAULT_URI: &str = "mongodb://localhost:27017";

pub(crate) struct DocStressArgs {
    pub uris: StoreUris,
    pub config: HarnessConfig,
}

impl DocStressArgs {
    pub fn print_configuration(&self) {
        let workers = &self.config.workers;
        println!("Configuration");
        println!("Primary:\t\t\t{}", self.uris.primary);
        println!(
            "Secondary:\t\t\t{}",
            self.uris.secondary().unwrap_or("(none)")
        );
        println!("Metadata:\t\t\t{}", self.uris.metadata);
        println!("Insert workers:\t\t\t{}", workers.insert);
        println!("Read by _id workers:\t\t{}", workers.read_by_key);
        println!("Secondary read workers:\t\t{}", workers.secondary_read);
        println!("Update workers:\t\t\t{}", workers.update);
        println!("Aggregation workers:\t\t{}", workers.aggregate);
        println!("Stat tick:\t\t\t{:?}", self.config.tick_interval);
        println!("Duration:\t\t\t{:?}", self.config.run_duration);
        println!("Reset:\t\t\t\t{}", self.config.reset);
        println!();
    }
}

pub(crate) enum ParseResult {
    Config(Box<DocStressArgs>),
    VersionDisplayed,
}

/// Parses the flags, falling back to the process environment for the
/// flags which were not given.
pub(crate) fn parse_doc_stress_args<I, S>(args: I, print_errors: bool) -> Option<ParseResult>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    parse_args_with_env(args, |var| std::env::var(var).ok(), print_errors)
}

pub(crate) fn parse_args_with_env<I, S>(
    mut args: I,
    env: impl Fn(&str) -> Option<String>,
    print_errors: bool,
) -> Option<ParseResult>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    let program_name = args
        .next()
        .map(|name| name.as_ref().to_string())
        .unwrap_or_else(|| "doc-stress-bencher".to_string());

    let mut flag = ParserBuilder::new();

    let primary_uri = flag.string_var(
        "primary-uri",
        Some("PRIMARY_URI"),
        DEFAULT_URI,
        "connection string of the store under test",
    );
    let secondary_uri = flag.string_var(
        "secondary-uri",
        Some("SECONDARY_URI"),
        "",
        "connection string of a secondary node, secondary reads are disabled if empty",
    );
    let metadata_uri = flag.string_var(
        "metadata-uri",
        Some("METADATA_URI"),
        DEFAULT_URI,
        "connection string of the store keeping coordination records",
    );

    let insert_workers = flag.u64_var(
        "insert-workers",
        Some("INSERT_WORKERS"),
        5,
        "number of insert workers",
    );
    let id_read_workers = flag.u64_var(
        "id-read-workers",
        Some("ID_READ_WORKERS"),
        5,
        "number of workers reading documents by _id from the primary",
    );
    let secondary_id_read_workers = flag.u64_var(
        "secondary-id-read-workers",
        Some("SECONDARY_ID_READ_WORKERS"),
        0,
        "number of workers reading documents by _id from the secondary",
    );
    let update_workers = flag.u64_var(
        "update-workers",
        Some("UPDATE_WORKERS"),
        2,
        "number of update workers",
    );
    let aggregation_workers = flag.u64_var(
        "aggregation-workers",
        Some("AGGREGATION_WORKERS"),
        1,
        "number of aggregation workers",
    );

    let stat_tick_millis = flag.u64_var(
        "stat-tick-speed-millis",
        Some("STAT_TICK_SPEED_MILLIS"),
        DEFAULT_TICK_INTERVAL.as_millis() as u64,
        "interval in milliseconds at which statistics are collected and the report redrawn",
    );
    let duration = flag.duration_var(
        "duration",
        Some("DURATION"),
        Duration::from_secs(600),
        "duration of the run",
    );
    let reset = flag.bool_var(
        "reset",
        Some("RESET"),
        false,
        "drop all benchmark data before starting",
    );
    let sample_buffer = flag.u64_var(
        "sample-buffer",
        Some("SAMPLE_BUFFER"),
        1024,
        "number of samples buffered between the workers and the statistics",
    );

    let print_version = flag.bool_var("version", None, false, "print version info and exit");
    let version_json = flag.bool_var(
        "version-json",
        None,
        false,
        "print version info as JSON and exit",
    );

    let (parser, desc) = flag.build();

    let result = move || -> Result<ParseResult> {
        parser.parse_args(args, env)?;

        if version_json.get() {
            println!("{}", version::format_version_info_json());
            return Ok(ParseResult::VersionDisplayed);
        }
        if print_version.get() {
            println!("{}", version::format_version_info_human());
            return Ok(ParseResult::VersionDisplayed);
        }

        let uris = StoreUris {
            primary: primary_uri.get(),
            secondary: secondary_uri.get(),
            metadata: metadata_uri.get(),
        };
        anyhow::ensure!(!uris.primary.is_empty(), "primary-uri must not be empty");
        anyhow::ensure!(!uris.metadata.is_empty(), "metadata-uri must not be empty");

        let config = HarnessConfig {
            workers: WorkerCounts {
                insert: insert_workers.get(),
                read_by_key: id_read_workers.get(),
                secondary_read: secondary_id_read_workers.get(),
                update: update_workers.get(),
                aggregate: aggregation_workers.get(),
            },
            tick_interval: Duration::from_millis(stat_tick_millis.get()),
            report_window: DEFAULT_REPORT_WINDOW,
            run_duration: duration.get(),
            sample_buffer: usize::try_from(sample_buffer.get())?,
            reset: reset.get(),
        };
        config.validate()?;

        Ok(ParseResult::Config(Box::new(DocStressArgs { uris, config })))
    }();

    match result {
        Ok(result) => Some(result),
        Err(err) => {
            if print_errors {
                eprintln!("Failed to parse flags: {err:#}");
                let _ = desc.print_help(&mut std::io::stderr(), &program_name);
            }
            None
        }
    }
}
