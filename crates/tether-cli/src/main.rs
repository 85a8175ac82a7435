//! Tether Host
//!
//! A simulated embedding host. Script-side state (a connection cache and a
//! per-connection query queue) lives on the interpreter thread; queries run on
//! worker threads and their completions are forwarded back. A lifecycle timer
//! does cache maintenance while the host cycles between foreground and
//! background.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tether::{
    Barrier, CacheConfig, CacheStats, CallerThreadForwarder, KeyedSerialExecutor, TaskRunnerExt,
    TetherConfig, TetherContext, WeakIdentityCache,
};

const CYCLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(50);

/// Simulated script host exercising the tether coordination layer
#[derive(Parser, Debug)]
#[command(name = "tether-host")]
#[command(about = "Simulated script host exercising tether", long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulated connections, one query queue each
    #[arg(long, default_value = "4")]
    connections: u32,

    /// Queries issued per connection in every cycle
    #[arg(long, default_value = "8")]
    queries_per_connection: u32,

    /// Foreground/background cycles
    #[arg(long, default_value = "3")]
    cycles: u32,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = match &args.config {
        Some(path) => TetherConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => TetherConfig::default(),
    };

    info!("Starting tether host v{}", env!("CARGO_PKG_VERSION"));
    let context = TetherContext::start(config)?;

    // Build the script-side state on the interpreter thread.
    let cache_config = context.config().cache.clone();
    let executor = context.keyed_executor::<u32>();
    let (ready_tx, ready_rx) = mpsc::channel();
    context.runner().post(move || {
        install_host(cache_config, executor);
        let _ = ready_tx.send(());
    })?;
    ready_rx
        .recv_timeout(CYCLE_TIMEOUT)
        .context("interpreter thread did not come up")?;

    let maintenance = context.lifecycle_timer();
    maintenance.start(MAINTENANCE_INTERVAL, || {
        with_host(Host::maintain);
    });

    for cycle in 1..=args.cycles {
        let (done_tx, done_rx) = mpsc::channel();
        let (connections, queries) = (args.connections, args.queries_per_connection);
        context
            .runner()
            .post(move || submit_cycle(cycle, connections, queries, done_tx))?;
        done_rx
            .recv_timeout(CYCLE_TIMEOUT)
            .with_context(|| format!("cycle {cycle} did not finish"))?;

        context.lifecycle().enter_background();
        context.lifecycle().enter_foreground();
    }

    let (summary_tx, summary_rx) = mpsc::channel();
    context.runner().post(move || {
        let summary = HOST.with(|host| host.borrow_mut().take()).map(Host::into_summary);
        let _ = summary_tx.send(summary);
    })?;
    let summary = summary_rx
        .recv_timeout(CYCLE_TIMEOUT)
        .context("interpreter thread stopped answering")?
        .context("host state missing")?;

    drop(maintenance);
    context.shutdown()?;

    summary.print(&args);
    if summary.overlaps > 0 {
        anyhow::bail!("{} queries overlapped on the same connection", summary.overlaps);
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tether=info,tether_runtime=info,tether_host=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interpreter-side state
// ─────────────────────────────────────────────────────────────────────────────

/// Native handle wrapped for the script side. One instance per id while alive.
struct Connection {
    id: u32,
    queries: Cell<u32>,
}

struct Host {
    connections: WeakIdentityCache<u32, Rc<Connection>>,
    queries: KeyedSerialExecutor<u32>,
    in_flight: HashSet<u32>,
    overlaps: u32,
    expected: u32,
    completed: u32,
    rows: u64,
    maintenance_runs: u32,
    cycle_done: Option<mpsc::Sender<()>>,
}

thread_local! {
    static HOST: RefCell<Option<Host>> = const { RefCell::new(None) };
}

/// Run `f` against the host state. `None` off the interpreter thread or after
/// teardown.
fn with_host<T>(f: impl FnOnce(&mut Host) -> T) -> Option<T> {
    HOST.with(|host| host.borrow_mut().as_mut().map(f))
}

fn install_host(cache: CacheConfig, queries: KeyedSerialExecutor<u32>) {
    let connections = WeakIdentityCache::builder()
        .config(cache)
        .creator(|id: &u32| {
            debug!(connection = id, "Opening connection");
            Rc::new(Connection {
                id: *id,
                queries: Cell::new(0),
            })
        })
        .cleaner(|id: &u32| debug!(connection = id, "Connection released"))
        .build();

    HOST.with(|host| {
        *host.borrow_mut() = Some(Host {
            connections,
            queries,
            in_flight: HashSet::new(),
            overlaps: 0,
            expected: 0,
            completed: 0,
            rows: 0,
            maintenance_runs: 0,
            cycle_done: None,
        });
    });
}

impl Host {
    fn maintain(&mut self) {
        self.connections.purge();
        self.maintenance_runs += 1;
        let stats = self.connections.stats();
        debug!(
            live = self.connections.len(),
            hits = stats.hits,
            created = stats.created,
            "Connection cache maintenance"
        );
    }

    fn into_summary(mut self) -> Summary {
        Summary {
            completed: self.completed,
            overlaps: self.overlaps,
            rows: self.rows,
            maintenance_runs: self.maintenance_runs,
            live_connections: self.connections.keys().len(),
            cache: self.connections.stats(),
        }
    }
}

fn submit_cycle(cycle: u32, connections: u32, queries: u32, done: mpsc::Sender<()>) {
    let total = connections * queries;
    let executor = with_host(|host| {
        host.expected += total;
        host.cycle_done = Some(done.clone());
        host.queries.clone()
    });
    let Some(executor) = executor else {
        warn!(cycle, "Host state missing; cycle skipped");
        return;
    };
    info!(cycle, queries = total, "Submitting query cycle");
    if total == 0 {
        let _ = done.send(());
        return;
    }

    // The executor may start a task inline, so no host borrow is held here.
    for query in 0..queries {
        for id in 0..connections {
            executor.push_task(id, move |barrier| run_query(id, query, barrier));
        }
    }
}

fn run_query(id: u32, query: u32, barrier: Barrier<u32>) {
    let done = match CallerThreadForwarder::on_caller_thread(move |rows: u64| {
        finish_query(id, rows, barrier)
    }) {
        Ok(done) => done,
        Err(err) => {
            warn!(connection = id, %err, "Cannot route query completion; query dropped");
            return;
        }
    };

    let started = with_host(|host| {
        let connection = host.connections.get(&id)?;
        if !host.in_flight.insert(id) {
            host.overlaps += 1;
        }
        connection.queries.set(connection.queries.get() + 1);
        Some(connection.id)
    })
    .flatten();
    let Some(connection) = started else {
        return;
    };

    let worker = thread::Builder::new()
        .name(format!("query-{connection}"))
        .spawn(move || {
            thread::sleep(Duration::from_millis(1 + u64::from(query % 3)));
            done.call(u64::from(connection) * 1000 + u64::from(query));
        });
    if let Err(err) = worker {
        warn!(connection, %err, "Failed to start query worker");
        with_host(|host| host.in_flight.remove(&connection));
    }
}

fn finish_query(id: u32, rows: u64, barrier: Barrier<u32>) {
    let cycle_done = with_host(|host| {
        host.in_flight.remove(&id);
        host.completed += 1;
        host.rows += rows;
        if host.completed == host.expected {
            host.cycle_done.take()
        } else {
            None
        }
    })
    .flatten();
    drop(barrier);

    if let Some(done) = cycle_done {
        let _ = done.send(());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Summary
// ─────────────────────────────────────────────────────────────────────────────

struct Summary {
    completed: u32,
    overlaps: u32,
    rows: u64,
    maintenance_runs: u32,
    live_connections: usize,
    cache: CacheStats,
}

impl Summary {
    fn print(&self, args: &Args) {
        println!("tether host summary");
        println!("  cycles:              {}", args.cycles);
        println!("  queries completed:   {}", self.completed);
        println!("  overlapping queries: {}", self.overlaps);
        println!("  rows returned:       {}", self.rows);
        println!("  maintenance runs:    {}", self.maintenance_runs);
        println!("  live connections:    {}", self.live_connections);
        println!(
            "  cache:               {} hits, {} misses, {} created, {} evicted, {} cleaned",
            self.cache.hits,
            self.cache.misses,
            self.cache.created,
            self.cache.evictions,
            self.cache.cleaned
        );
    }
}
