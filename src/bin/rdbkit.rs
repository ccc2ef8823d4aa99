/*!
 * rdbkit Command Line Entry Point
 *
 * Actions:
 * * `parse` - decode an RDB file into JSON or kv lines
 * * `dump`  - pull a snapshot from a live server, raw or decoded
 * * `load`  - replay an RDB file into one or more destination servers
 * * `trans` - pull a snapshot from a live server and replay it elsewhere
 * * `info`  - print server metadata, key statistics and big keys
 */

use anyhow::*;
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;
use rdbkit::info::BigKeyThreshold;
use rdbkit::{
    collect_info, parse_to_json, parse_to_kv, CancelToken, InfoOptions, LoadConfig, Loader,
    ParseOptions, SessionConfig, SourceSession,
};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::time::{Duration, Instant};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "rdbkit", version, about = "Decode, dump and redistribute Redis RDB snapshots")]
struct Cli {
    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Decode an RDB file
    Parse {
        /// RDB file to read
        #[arg(long)]
        rdb: String,

        #[command(flatten)]
        output: OutputArgs,

        /// Also emit aux metadata records
        #[arg(long)]
        aux: bool,
    },

    /// Pull a snapshot from a live server
    Dump {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Replay an RDB file into destination servers
    Load {
        /// RDB file to read
        #[arg(long)]
        rdb: String,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// Pull a snapshot from a live server and replay it into destinations
    Trans {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// Print snapshot metadata
    Info {
        /// RDB file to read
        #[arg(long)]
        rdb: String,

        /// Count keys and bytes per database and type
        #[arg(long)]
        stats: bool,

        /// List keys over the big-key thresholds
        #[arg(long)]
        big_key: bool,

        /// Value size in bytes above which a key is big
        #[arg(long, default_value_t = 1024)]
        big_key_size: u64,

        /// Member count from which a key is big, 0 to disable
        #[arg(long, default_value_t = 0)]
        big_key_len: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputKind {
    /// One JSON document per record
    Json,
    /// One `type:..|key:..|value:..|expire:..` line per record
    Kv,
    /// Raw RDB bytes, no decoding
    None,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Output format
    #[arg(long, value_enum, default_value = "json")]
    output: OutputKind,

    /// Output file, stdout when omitted
    #[arg(long)]
    out: Option<String>,
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Source server address
    #[arg(long, default_value = rdbkit::DEFAULT_ADDR)]
    from: String,

    #[arg(long)]
    from_user: Option<String>,

    #[arg(long)]
    from_auth: Option<String>,

    /// Read deadline for the source connection, in seconds
    #[arg(long, default_value_t = 5)]
    from_timeout: u64,

    /// Connect to the source over TLS
    #[arg(long)]
    tls: bool,
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Destination address, repeatable; workers are spread over them
    #[arg(long = "to", required = true)]
    to: Vec<String>,

    #[arg(long)]
    to_user: Option<String>,

    #[arg(long)]
    to_auth: Option<String>,

    /// Database written to before the first selector
    #[arg(long, default_value_t = 0)]
    db: u64,

    /// Worker connections
    #[arg(long, default_value_t = 1)]
    parallel: usize,

    /// Records per second, 0 for unlimited
    #[arg(long, default_value_t = 0)]
    speed: u64,

    /// Records per pipeline
    #[arg(long, default_value_t = rdbkit::loader::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Attempts per batch before the delete fallback
    #[arg(long, default_value_t = rdbkit::loader::DEFAULT_MAX_RETRY)]
    max_retry: usize,

    /// Never write key expiries
    #[arg(long)]
    ignore_expiry: bool,

    /// Milliseconds added to every expiry
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    expire_shift: i64,

    /// Replay stream entries flagged as deleted
    #[arg(long)]
    keep_deleted_stream_entries: bool,

    /// Delete every key of the snapshot instead of writing it
    #[arg(long)]
    delete: bool,

    /// Log slow pipelines
    #[arg(long)]
    debug: bool,
}

impl LoadArgs {
    fn config(&self) -> LoadConfig {
        LoadConfig {
            addrs: self.to.clone(),
            username: self.to_user.clone(),
            password: self.to_auth.clone(),
            db: self.db,
            parallel: self.parallel,
            speed: self.speed,
            ignore_expiry: self.ignore_expiry,
            expire_shift_ms: self.expire_shift,
            keep_deleted_stream_entries: self.keep_deleted_stream_entries,
            max_retry: self.max_retry,
            batch_size: self.batch_size,
            debug: self.debug,
            delete_mode: self.delete,
            ..LoadConfig::default()
        }
    }
}

impl SourceArgs {
    fn connect(&self) -> Result<SourceSession> {
        let cfg = SessionConfig {
            addr: self.from.clone(),
            user: self.from_user.clone(),
            password: self.from_auth.clone(),
            read_timeout: Duration::from_secs(self.from_timeout),
            tls: self.tls,
            ..SessionConfig::default()
        };
        SourceSession::connect(&cfg).with_context(|| format!("syncing from {}", self.from))
    }
}

fn open_output(path: Option<&str>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(p) => Box::new(BufWriter::new(
            File::create(p).with_context(|| format!("creating {}", p))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    })
}

fn write_output<R: Read>(mut reader: R, output: &OutputArgs, options: ParseOptions) -> Result<()> {
    let mut out = open_output(output.out.as_deref())?;
    let cancel = CancelToken::new();
    match output.output {
        OutputKind::Json => {
            let banner = parse_to_json(reader, &mut out, cancel, options)?;
            info!("decoded {}", banner);
        }
        OutputKind::Kv => {
            let banner = parse_to_kv(reader, &mut out, cancel, options)?;
            info!("decoded {}", banner);
        }
        OutputKind::None => {
            let n = io::copy(&mut reader, &mut out)?;
            info!("copied {} raw bytes", n);
        }
    }
    out.flush()?;
    Ok(())
}

fn load<R: Read>(reader: R, args: &LoadArgs) -> Result<()> {
    let started = Instant::now();
    let mut loader = Loader::connect(args.config(), CancelToken::new())?;
    let banner = loader.run(reader, ParseOptions::default())?;
    info!(
        "loaded {} ({} records) in {:?}",
        banner,
        loader.result().records,
        started.elapsed()
    );
    Ok(())
}

fn main() -> Result<()> {
    // Respects RUST_LOG, e.g. RUST_LOG=rdbkit=debug
    env_logger::init();
    let cli = Cli::parse();

    match cli.action {
        Action::Parse { rdb, output, aux } => {
            let file = File::open(&rdb).with_context(|| format!("opening {}", rdb))?;
            write_output(io::BufReader::new(file), &output, ParseOptions { emit_aux: aux })
        }
        Action::Dump { source, output } => {
            let session = source.connect()?;
            write_output(session.into_reader(), &output, ParseOptions::default())
        }
        Action::Load { rdb, load: args } => {
            let file = File::open(&rdb).with_context(|| format!("opening {}", rdb))?;
            load(io::BufReader::new(file), &args)
        }
        Action::Trans { source, load: args } => {
            let session = source.connect()?;
            load(session.into_reader(), &args)
        }
        Action::Info {
            rdb,
            stats,
            big_key,
            big_key_size,
            big_key_len,
        } => {
            let file = File::open(&rdb).with_context(|| format!("opening {}", rdb))?;
            let mut options = InfoOptions {
                only_info: !stats && !big_key,
                key_statistics: stats,
                big_key,
                big_key_size,
                ..InfoOptions::default()
            };
            if big_key_len > 0 {
                for kind in ["String", "List", "Hash", "Set", "SortedSet", "Stream"] {
                    options.thresholds.insert(
                        kind.to_string(),
                        BigKeyThreshold {
                            value_size: big_key_size,
                            member_len: big_key_len,
                        },
                    );
                }
            }
            let info = collect_info(io::BufReader::new(file), options, CancelToken::new())?;
            println!(
                "rdb-version:{} redis-version:{} redis-bits:{} ctime:{} used-mem:{}",
                info.rdb_version, info.redis_version, info.redis_bits, info.ctime, info.used_mem
            );
            if stats || big_key {
                println!("{}", serde_json::to_string(&info.key_statistics)?);
            }
            Ok(())
        }
    }
}
