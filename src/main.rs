//! MME EMM detach daemon
//!
//! Runs the detach slice of the NAS task: drains expired T3422 timers and
//! logs the SAP hand-offs towards the sibling tasks. The access stratum,
//! session manager and SGs gateway are external processes wired up to the
//! SAP endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use mme_emmd::detach::EmmCore;
use mme_emmd::metrics::LogCounterSink;
use mme_emmd::sap::SapHub;

/// EPS Mobility Management detach daemon
#[derive(Parser, Debug)]
#[command(name = "mme-emmd", version, about)]
struct Args {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Scheduling tick in milliseconds
    #[arg(long, default_value_t = 50)]
    tick_ms: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .parse_filters(&args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("mme-emmd starting");

    let (hub, endpoints) = SapHub::channel();
    let core = EmmCore::new(hub, Arc::new(LogCounterSink));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        r.store(false, Ordering::SeqCst);
    })?;

    while running.load(Ordering::SeqCst) {
        core.process_expired_timers()?;

        for req in endpoints.emm_as.try_iter() {
            log::info!("[{}] EMM-AS data request: {:?}", req.ue_id, req.info);
        }
        for prim in endpoints.esm.try_iter() {
            log::info!("ESM primitive: {prim:?}");
        }
        for prim in endpoints.emm_reg.try_iter() {
            log::info!("EMMREG primitive: {prim:?}");
        }
        for prim in endpoints.sgs.try_iter() {
            log::info!("SGS primitive: {prim:?}");
        }
        for prim in endpoints.app.try_iter() {
            log::info!("APP primitive: {prim:?}");
        }

        std::thread::sleep(Duration::from_millis(args.tick_ms));
    }

    log::info!("mme-emmd terminated ({} UE contexts)", core.ues().len());
    Ok(())
}
