// FLOOD HUB — Orchestrator
// Bring-up runs top to bottom; any failure before the loop starts is fatal
// with a distinct exit code. After that the only fatal is pool exhaustion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flood_hub::engine::config::{ConfigError, HubConfig, USAGE};
use flood_hub::engine::mbuf::PacketPool;
use flood_hub::engine::runtime::{
    allowed_cpu_count, calibrate_tsc, current_cpu_node, fatal, pin_to_core, Clock,
    E_AFFINITY_FAIL, E_CONFIG, E_POOL_ALLOC, E_POOL_EXHAUSTED, E_PORT_COUNT, E_PORT_INIT};
use flood_hub::network::afpacket::AfPacketNic;
use flood_hub::network::datapath::PollLoop;
use flood_hub::network::Nic;

const TSC_CAL_WINDOW: Duration = Duration::from_millis(100);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
extern "C" fn signal_handler(_sig: i32) { SHUTDOWN.store(true, Ordering::Relaxed); }

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // SAFETY: signal_handler is a valid extern "C" fn with stable address. It only performs
    // a single atomic store (Relaxed), which is async-signal-safe per POSIX.
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }

    let cfg = match HubConfig::from_env_args() {
        Ok(cfg) => cfg,
        Err(ConfigError::Help) => {
            println!("{}", USAGE);
            return;
        }
        Err(e @ ConfigError::PortCount(_)) => fatal(E_PORT_COUNT, &e.to_string()),
        Err(e) => {
            eprintln!("{}", USAGE);
            fatal(E_CONFIG, &e.to_string());
        }
    };

    run_executive(&cfg);
}

// ── THE EXECUTIVE ────────────────────────────────────────────────────────

fn run_executive(cfg: &HubConfig) {
    match cfg.core {
        Some(core) => {
            if let Err(e) = pin_to_core(core) {
                error!(target: "hub::exec", "cannot pin to core {}: {}", core, e);
                fatal(E_AFFINITY_FAIL, "sched_setaffinity failed");
            }
        }
        None => {
            let n = allowed_cpu_count();
            if n > 1 {
                warn!(target: "hub::exec",
                    "not pinned ({} CPUs allowed); use --core for stable latency and NUMA locality", n);
            }
        }
    }
    let (cpu, node) = current_cpu_node();

    // TSC calibration after pinning so the counter read is the core we poll on.
    let cal = calibrate_tsc(TSC_CAL_WINDOW);
    if cal.is_valid() {
        info!(target: "hub::tsc", "drain clock: TSC at {}.{:03} MHz", cal.freq_khz() / 1000, cal.freq_khz() % 1000);
    } else {
        info!(target: "hub::tsc", "drain clock: CLOCK_MONOTONIC");
    }

    let pool = match PacketPool::new(cfg.pool_size(), cfg.frame_size) {
        Ok(p) => p,
        Err(e) => {
            error!(target: "hub::exec", "{}", e);
            fatal(E_POOL_ALLOC, "cannot create packet pool");
        }
    };
    info!(target: "hub::exec", "packet pool: {} frames x {} bytes", pool.capacity(), pool.frame_size());

    let nic = match AfPacketNic::open(&cfg.interfaces) {
        Ok(nic) => nic,
        Err(e) => {
            error!(target: "hub::nic", "{:#}", e);
            fatal(E_PORT_INIT, "port initialization failed");
        }
    };
    for port in 0..nic.port_count() {
        info!(target: "hub::nic", "Port {} ({}) MAC: {}", port, nic.port_name(port), nic.mac_addr(port));
    }

    let mut dp = PollLoop::new(nic, pool, cfg.drain_interval_ns(), cal.now_ns());
    dp.check_port_affinity(node);

    info!(target: "hub::exec", "Core {} forwarding packets. [Ctrl+C to quit]", cpu);
    if let Err(e) = dp.run(&cal, &SHUTDOWN) {
        error!(target: "hub::dp", "{}", e);
        fatal(E_POOL_EXHAUSTED, "packet pool exhausted");
    }

    let parked = dp.shutdown();
    info!(target: "hub::exec", "shutdown: released {} queued frame(s)", parked);
    dp.log_summary();
}
