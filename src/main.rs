use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use medsched::config::Settings;
use medsched::generator::{self, GeneratorConfig};
use medsched::notify::NotifyHub;
use medsched::offers::{OfferBlocker, OfferPolicy};
use medsched::reaper;
use medsched::scheduler::Scheduler;
use medsched::store::{RecordStore, Store};
use medsched::timer::TokioTimers;

const GENERATED_PATIENTS: usize = 20;
const GENERATED_MAX_PER_DAY: usize = 64;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    medsched::observability::init_tracing();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    medsched::observability::init(settings.metrics_port)?;

    std::fs::create_dir_all(&settings.data_dir)?;
    let wal_path = settings.data_dir.join("medsched.wal");
    let store = Arc::new(Store::new(wal_path.clone())?);

    if store.resource_ids().is_empty() && settings.seed_rooms > 0 {
        for n in 1..=settings.seed_rooms {
            store.create_resource(Ulid::new(), Some(format!("Room {n}"))).await?;
        }
        info!(rooms = settings.seed_rooms, "seeded examination rooms");
    }

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        store.clone(),
        settings.calendar,
        settings.search_horizon_days,
    ));
    let blocker = Arc::new(OfferBlocker::new(
        scheduler.clone(),
        Arc::new(TokioTimers::new()),
        Arc::new(NotifyHub::new()),
        OfferPolicy::from_settings(&settings),
    ));

    info!("medsched started");
    info!("  wal: {}", wal_path.display());
    info!("  resources: {}", store.resource_ids().len());
    info!("  search horizon: {} days", settings.search_horizon_days);
    info!("  offer horizons: {:?} days", settings.offer_horizons_days);

    tokio::spawn(reaper::run_reaper(blocker.clone(), store.clone() as Arc<dyn RecordStore>));
    tokio::spawn(reaper::run_compactor(store.clone(), settings.compact_threshold));

    if let Some(gen_settings) = &settings.generate {
        let patients: Vec<Ulid> = (0..GENERATED_PATIENTS).map(|_| Ulid::new()).collect();
        let cfg = GeneratorConfig {
            from: gen_settings.from,
            to: gen_settings.to,
            free_weekdays: gen_settings.free_weekdays.clone(),
            seed: gen_settings.seed,
            max_per_day: GENERATED_MAX_PER_DAY,
        };
        match generator::generate_random_appointments(&scheduler, &patients, &generator::sample_examinations(), &cfg)
            .await
        {
            Ok(report) => info!(created = report.appointments_created, "calendar generation finished"),
            Err(e) => tracing::error!("calendar generation failed: {e}"),
        }
    }

    // Graceful shutdown on SIGTERM/ctrl-c
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutdown signal received");

    if let Err(e) = store.compact_wal().await {
        tracing::warn!("final WAL compaction failed: {e}");
    }

    info!("medsched stopped");
    Ok(())
}
