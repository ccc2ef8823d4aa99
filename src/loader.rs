/*!
 * Redistribution Pipeline
 *
 * The [`Loader`] receives decoded records from a single parser thread and
 * fans them out to a fixed pool of worker threads, each owning one
 * destination connection.
 *
 * Dispatch model:
 * * keyed records go to one shared bounded ingress channel; whichever worker
 *   is free takes the next record
 * * a database selector is a barrier: the dispatcher waits for ingress to
 *   drain, broadcasts the new index on every worker's private control
 *   channel and waits until every worker flushed its batch and acknowledged
 * * resize hints and aux fields are counted but never written
 *
 * Workers batch up to `batch_size` records per pipeline. Each pipeline starts
 * with `SELECT <db>`. A failing batch is retried, then its keys are deleted
 * as a fallback; only when the fallback also fails does the worker latch the
 * error, which stops the whole loader.
 */

use crate::client::{Connect, Destination, RespConnector};
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::net::{self, DialOptions};
use crate::object::TypeObject;
use crate::parser::{CancelToken, Handler, ParseOptions, Parser};
use crossbeam::channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Every blocking wait in the pipeline polls at this interval
const POLL: Duration = Duration::from_millis(1);

/// Batches slower than this are logged when `debug` is set
const SLOW_BATCH: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_RETRY: usize = 3;
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Loader settings
#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Destination addresses; worker `i` uses `addrs[i % addrs.len()]`
    pub addrs: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database written to until the first selector arrives
    pub db: u64,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Worker (and connection) count
    pub parallel: usize,
    /// Records per second admitted into the pipeline, 0 for unlimited
    pub speed: u64,
    /// Never emit `PEXPIREAT`
    pub ignore_expiry: bool,
    /// Added to every absolute expiry
    pub expire_shift_ms: i64,
    /// Also replay stream entries flagged as deleted
    pub keep_deleted_stream_entries: bool,
    /// Attempts per batch, and again per delete fallback
    pub max_retry: usize,
    /// Records per pipeline
    pub batch_size: usize,
    /// Capacity of the shared ingress channel
    pub queue_len: usize,
    /// Log slow batches
    pub debug: bool,
    /// Write only `DEL` commands for every key
    pub delete_mode: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            addrs: vec![crate::DEFAULT_ADDR.into()],
            username: None,
            password: None,
            db: 0,
            dial_timeout: net::DEFAULT_TIMEOUT,
            read_timeout: net::DEFAULT_TIMEOUT,
            write_timeout: net::DEFAULT_TIMEOUT,
            parallel: 1,
            speed: 0,
            ignore_expiry: false,
            expire_shift_ms: 0,
            keep_deleted_stream_entries: false,
            max_retry: DEFAULT_MAX_RETRY,
            batch_size: DEFAULT_BATCH_SIZE,
            queue_len: 1024,
            debug: false,
            delete_mode: false,
        }
    }
}

impl LoadConfig {
    /// RESP connector built from the address, auth and deadline settings
    pub fn connector(&self) -> RespConnector {
        RespConnector {
            addrs: self.addrs.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            dial: DialOptions {
                connect_timeout: self.dial_timeout,
                read_timeout: Some(self.read_timeout),
                write_timeout: Some(self.write_timeout),
                keepalive: Some(net::DEFAULT_TIMEOUT),
            },
        }
    }
}

/// Outcome counters of a load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadResult {
    /// Records handed to the loader, control records included
    pub records: u64,
}

/// State shared by the dispatcher and every worker
struct Shared {
    error: Mutex<Option<Error>>,
    processed: AtomicU64,
    cancel: CancelToken,
}

impl Shared {
    /// First error wins; later ones are only logged
    fn latch(&self, err: Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            error!("loader stopping: {}", err);
            *slot = Some(err);
        } else {
            error!("additional loader failure: {}", err);
        }
    }

    #[inline]
    fn failed(&self) -> bool {
        self.error.lock().is_some()
    }
}

/// Parallel destination writer; implements [`Handler`]
pub struct Loader {
    ingress: Option<Sender<TypeObject>>,
    controls: Vec<Sender<u64>>,
    acks: Receiver<usize>,
    workers: Vec<JoinHandle<()>>,
    limiter: Option<RateLimiter>,
    shared: Arc<Shared>,
}

impl Loader {
    /// Connect to the configured RESP destinations and start the workers
    pub fn connect(cfg: LoadConfig, cancel: CancelToken) -> Result<Self> {
        let connector = cfg.connector();
        Self::start(cfg, connector, cancel)
    }

    /// Open `parallel` connections through `connector` and start one worker
    /// per connection
    ///
    /// # Arguments
    /// * `cfg` - Loader settings
    /// * `connector` - Opens the destination connection for each worker
    /// * `cancel` - Stops the dispatcher and every worker when fired
    ///
    /// # Returns
    /// * A running loader, or the first connection/PING failure
    pub fn start<C: Connect>(cfg: LoadConfig, connector: C, cancel: CancelToken) -> Result<Self> {
        let parallel = cfg.parallel.max(1);
        let mut conns = Vec::with_capacity(parallel);
        for i in 0..parallel {
            let mut conn = connector.connect(i)?;
            conn.ping()?;
            conns.push(conn);
        }

        let shared = Arc::new(Shared {
            error: Mutex::new(None),
            processed: AtomicU64::new(0),
            cancel,
        });
        let (ingress_tx, ingress_rx) = bounded::<TypeObject>(cfg.queue_len.max(1));
        let (ack_tx, ack_rx) = unbounded::<usize>();
        let settings = Arc::new(WorkerSettings::from(&cfg));

        let mut controls = Vec::with_capacity(parallel);
        let mut workers = Vec::with_capacity(parallel);
        for (idx, conn) in conns.into_iter().enumerate() {
            let (control_tx, control_rx) = bounded::<u64>(1);
            controls.push(control_tx);

            let worker = Worker {
                idx,
                conn,
                db: cfg.db,
                batch: Vec::with_capacity(settings.batch_size),
                settings: settings.clone(),
                shared: shared.clone(),
            };
            let ingress = ingress_rx.clone();
            let ack = ack_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("loader-{}", idx))
                .spawn(move || worker.run(ingress, control_rx, ack))?;
            workers.push(handle);
        }
        info!("loader started with {} workers", parallel);

        Ok(Self {
            ingress: Some(ingress_tx),
            controls,
            acks: ack_rx,
            workers,
            limiter: RateLimiter::new(cfg.speed),
            shared,
        })
    }

    /// Parse `reader` into this loader, then close it
    ///
    /// # Returns
    /// * The header banner on success
    /// * The first latched worker error if any, otherwise the parse error
    pub fn run<R: Read>(&mut self, reader: R, options: ParseOptions) -> Result<String> {
        let cancel = self.shared.cancel.clone();
        let mut parser = Parser::new(reader, &mut *self, cancel, options);
        let parsed = parser.parse();
        let banner = parser.version().unwrap_or_default().to_string();
        drop(parser);

        match (parsed, self.close()) {
            (_, Err(latched)) => Err(latched),
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Ok(())) => Ok(banner),
        }
    }

    /// Stop admitting records, let workers flush and exit, join them
    ///
    /// # Returns
    /// * The first error latched by a worker, if any
    pub fn close(&mut self) -> Result<()> {
        self.ingress.take();
        self.controls.clear();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                self.shared
                    .latch(Error::Destination("loader worker panicked".into()));
            }
        }
        match self.shared.error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Records handed to the loader so far
    pub fn result(&self) -> LoadResult {
        LoadResult {
            records: self.shared.processed.load(Ordering::Relaxed),
        }
    }

    fn check(&self, cancel: &CancelToken) -> Result<()> {
        if self.shared.failed() {
            return Err(Error::Stopped);
        }
        cancel.check()?;
        self.shared.cancel.check()
    }

    fn dispatch(&self, cancel: &CancelToken, mut obj: TypeObject) -> Result<()> {
        if let Some(limiter) = &self.limiter {
            loop {
                self.check(cancel)?;
                if limiter.try_acquire() {
                    break;
                }
                std::thread::sleep(POLL);
            }
        }

        let ingress = self.ingress.as_ref().ok_or(Error::Stopped)?;
        loop {
            self.check(cancel)?;
            match ingress.send_timeout(obj, POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => obj = back,
                Err(SendTimeoutError::Disconnected(_)) => return Err(Error::Stopped),
            }
        }
    }

    fn switch_db(&self, cancel: &CancelToken, index: u64) -> Result<()> {
        if let Some(ingress) = &self.ingress {
            while !ingress.is_empty() {
                self.check(cancel)?;
                std::thread::sleep(POLL);
            }
        }

        for control in &self.controls {
            loop {
                self.check(cancel)?;
                match control.send_timeout(index, POLL) {
                    Ok(()) => break,
                    Err(SendTimeoutError::Timeout(_)) => continue,
                    Err(SendTimeoutError::Disconnected(_)) => return Err(Error::Stopped),
                }
            }
        }

        let mut acked = 0;
        while acked < self.controls.len() {
            self.check(cancel)?;
            match self.acks.recv_timeout(POLL) {
                Ok(_) => acked += 1,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Stopped),
            }
        }
        debug!("all workers switched to db {}", index);
        Ok(())
    }
}

impl Handler for Loader {
    fn handle(&mut self, cancel: &CancelToken, obj: TypeObject) -> Result<()> {
        self.shared.processed.fetch_add(1, Ordering::Relaxed);
        self.check(cancel)?;
        match obj {
            TypeObject::SelectDb(s) => self.switch_db(cancel, s.index),
            TypeObject::ResizeDb(_) | TypeObject::Aux(_) => Ok(()),
            keyed => self.dispatch(cancel, keyed),
        }
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            if let Err(e) = self.close() {
                warn!("loader dropped with a pending error: {}", e);
            }
        }
    }
}

/// Per-worker copy of the settings that shape the written commands
struct WorkerSettings {
    batch_size: usize,
    max_retry: usize,
    ignore_expiry: bool,
    expire_shift_ms: i64,
    keep_deleted_stream_entries: bool,
    delete_mode: bool,
    debug: bool,
}

impl From<&LoadConfig> for WorkerSettings {
    fn from(cfg: &LoadConfig) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            max_retry: cfg.max_retry.max(1),
            ignore_expiry: cfg.ignore_expiry,
            expire_shift_ms: cfg.expire_shift_ms,
            keep_deleted_stream_entries: cfg.keep_deleted_stream_entries,
            delete_mode: cfg.delete_mode,
            debug: cfg.debug,
        }
    }
}

struct Worker<D: Destination> {
    idx: usize,
    conn: D,
    db: u64,
    batch: Vec<TypeObject>,
    settings: Arc<WorkerSettings>,
    shared: Arc<Shared>,
}

impl<D: Destination> Worker<D> {
    fn run(mut self, ingress: Receiver<TypeObject>, control: Receiver<u64>, ack: Sender<usize>) {
        debug!("loader worker {} started", self.idx);
        let mut written = 0u64;

        loop {
            if self.shared.cancel.is_cancelled() || self.shared.failed() {
                // Best effort; the run is already ending.
                if let Err(e) = self.flush() {
                    self.shared.latch(e);
                }
                break;
            }

            crossbeam::select! {
                recv(control) -> msg => {
                    if let Ok(db) = msg {
                        if let Err(e) = self.flush() {
                            self.shared.latch(e);
                            break;
                        }
                        self.db = db;
                        if ack.send(self.idx).is_err() {
                            break;
                        }
                    }
                }
                recv(ingress) -> msg => match msg {
                    Ok(obj) => {
                        self.batch.push(obj);
                        written += 1;
                        if self.batch.len() >= self.settings.batch_size {
                            if let Err(e) = self.flush() {
                                self.shared.latch(e);
                                break;
                            }
                        }
                    }
                    Err(_) => {
                        if let Err(e) = self.flush() {
                            self.shared.latch(e);
                        }
                        break;
                    }
                },
                default(POLL) => {}
            }
        }
        debug!("loader worker {} stopped after {} records", self.idx, written);
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let result = if self.settings.delete_mode {
            self.delete_batch()
        } else {
            self.write_batch()
        };
        self.batch.clear();
        result
    }

    fn write_batch(&mut self) -> Result<()> {
        let cmds = self.write_commands();
        let err = match self.exec_with_retry(&cmds, "write") {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        match self.delete_batch() {
            Ok(()) => {
                error!(
                    "worker {}: batch of {} records failed ({}); keys deleted, continuing",
                    self.idx,
                    self.batch.len(),
                    err
                );
                Ok(())
            }
            Err(del) => {
                error!(
                    "worker {}: batch failed ({}) and the delete fallback failed too",
                    self.idx, err
                );
                Err(del)
            }
        }
    }

    fn delete_batch(&mut self) -> Result<()> {
        let cmds = self.delete_commands();
        self.exec_with_retry(&cmds, "delete")
    }

    fn exec_with_retry(&mut self, cmds: &[Vec<Vec<u8>>], what: &str) -> Result<()> {
        let mut last = Error::Destination(format!("{} never attempted", what));
        for attempt in 1..=self.settings.max_retry {
            match self.exec_checked(cmds) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "worker {}: {} attempt {}/{} failed: {}",
                        self.idx, what, attempt, self.settings.max_retry, e
                    );
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn exec_checked(&mut self, cmds: &[Vec<Vec<u8>>]) -> Result<()> {
        let started = Instant::now();
        let replies = self.conn.exec(cmds)?;
        if self.settings.debug && started.elapsed() > SLOW_BATCH {
            debug!(
                "worker {}: slow pipeline of {} commands took {:?}",
                self.idx,
                cmds.len(),
                started.elapsed()
            );
        }
        if replies.len() != cmds.len() {
            return Err(Error::Destination(format!(
                "expected {} replies, got {}",
                cmds.len(),
                replies.len()
            )));
        }
        for reply in replies {
            reply.into_result()?;
        }
        Ok(())
    }

    fn select_command(&self) -> Vec<Vec<u8>> {
        vec![b"SELECT".to_vec(), self.db.to_string().into_bytes()]
    }

    fn write_commands(&self) -> Vec<Vec<Vec<u8>>> {
        let mut cmds = vec![self.select_command()];
        for obj in &self.batch {
            let cmd = match obj.command(self.settings.keep_deleted_stream_entries) {
                Some(cmd) => cmd,
                None => continue,
            };
            let has_writes = !cmd.writes.is_empty();
            cmds.extend(cmd.writes);
            if has_writes && !self.settings.ignore_expiry && cmd.expire_at_ms > 0 {
                let at = cmd.expire_at_ms.saturating_add(self.settings.expire_shift_ms);
                cmds.push(vec![
                    b"PEXPIREAT".to_vec(),
                    cmd.key,
                    at.to_string().into_bytes(),
                ]);
            }
        }
        cmds
    }

    fn delete_commands(&self) -> Vec<Vec<Vec<u8>>> {
        let mut cmds = vec![self.select_command()];
        for obj in &self.batch {
            if let Some(key) = obj.key_object() {
                cmds.push(vec![b"DEL".to_vec(), key.name.clone()]);
            }
        }
        cmds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{KeyObject, StreamEntry, StreamId, StreamValue, StringValue};
    use crate::protocol::Reply;
    use std::collections::BTreeMap;

    /// Records every pipeline it receives and answers `+OK`
    struct Recorder {
        log: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
    }

    impl Destination for Recorder {
        fn exec(&mut self, commands: &[Vec<Vec<u8>>]) -> Result<Vec<Reply>> {
            let mut log = self.log.lock();
            for c in commands {
                log.push(c.clone());
            }
            Ok(commands
                .iter()
                .map(|c| {
                    if c[0] == b"PING" {
                        Reply::Simple("PONG".into())
                    } else {
                        Reply::Simple("OK".into())
                    }
                })
                .collect())
        }
    }

    fn worker(settings: WorkerSettings) -> Worker<Recorder> {
        Worker {
            idx: 0,
            conn: Recorder {
                log: Arc::new(Mutex::new(Vec::new())),
            },
            db: 2,
            batch: Vec::new(),
            settings: Arc::new(settings),
            shared: Arc::new(Shared {
                error: Mutex::new(None),
                processed: AtomicU64::new(0),
                cancel: CancelToken::new(),
            }),
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings::from(&LoadConfig::default())
    }

    fn text(cmds: &[Vec<Vec<u8>>]) -> Vec<String> {
        cmds.iter()
            .map(|c| {
                c.iter()
                    .map(|a| String::from_utf8_lossy(a).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }

    fn string(key: &str, value: &str, exp: i64) -> TypeObject {
        TypeObject::String(StringValue {
            key: KeyObject::new(key.as_bytes(), exp),
            value: value.as_bytes().to_vec(),
        })
    }

    #[test]
    fn batch_starts_with_select_and_expiry_is_shifted() {
        let mut w = worker(WorkerSettings {
            expire_shift_ms: 500,
            ..settings()
        });
        w.batch.push(string("a", "1", 1_000));
        w.batch.push(string("b", "2", 0));
        assert_eq!(
            text(&w.write_commands()),
            vec!["SELECT 2", "SET a 1", "PEXPIREAT a 1500", "SET b 2"]
        );
    }

    #[test]
    fn ignore_expiry_drops_pexpireat() {
        let mut w = worker(WorkerSettings {
            ignore_expiry: true,
            ..settings()
        });
        w.batch.push(string("a", "1", 1_000));
        assert_eq!(text(&w.write_commands()), vec!["SELECT 2", "SET a 1"]);
    }

    #[test]
    fn stream_skips_deleted_entries_and_expiry_without_writes() {
        let mut entries = BTreeMap::new();
        entries.insert(
            StreamId::new(1, 0),
            StreamEntry {
                deleted: true,
                fields: vec![(b"f".to_vec(), b"v".to_vec())],
            },
        );
        let mut w = worker(settings());
        w.batch.push(TypeObject::Stream(StreamValue {
            key: KeyObject::new(b"s".to_vec(), 99),
            entries,
            ..Default::default()
        }));
        assert_eq!(text(&w.write_commands()), vec!["SELECT 2"]);
    }

    #[test]
    fn delete_mode_writes_only_del() {
        let mut w = worker(WorkerSettings {
            delete_mode: true,
            ..settings()
        });
        w.batch.push(string("a", "1", 1_000));
        w.batch.push(string("b", "2", 0));
        w.flush().unwrap();
        assert!(w.batch.is_empty());
        assert_eq!(
            text(&w.conn.log.lock()),
            vec!["SELECT 2", "DEL a", "DEL b"]
        );
    }

    #[test]
    fn first_latched_error_wins() {
        let shared = Shared {
            error: Mutex::new(None),
            processed: AtomicU64::new(0),
            cancel: CancelToken::new(),
        };
        shared.latch(Error::Destination("first".into()));
        shared.latch(Error::Destination("second".into()));
        match shared.error.lock().take() {
            Some(Error::Destination(m)) => assert_eq!(m, "first"),
            other => panic!("unexpected {:?}", other),
        };
    }
}
