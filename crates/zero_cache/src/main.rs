//! The zero-cache server binary. Without a worker-kind environment it runs
//! as the supervisor and forks the fleet: one dispatcher accepting public
//! WebSocket upgrades, N syncer workers serving them, and one
//! change-streamer maintaining the replica.

mod change_streamer;
mod client_groups;
mod config;
mod dispatcher_main;
mod syncer;
mod view_syncer;
mod ws_util;

use common::knobs::NUM_SYNCER_WORKERS;
use dispatcher::{
    Supervisor,
    WorkerKind,
};

use crate::config::ZeroConfig;

fn main() -> anyhow::Result<()> {
    common::env::config_service();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let config = ZeroConfig::from_env()?;
    match WorkerKind::from_env() {
        None => {
            let num_syncers = match *NUM_SYNCER_WORKERS {
                0 => std::thread::available_parallelism()?.get(),
                n => n,
            };
            tracing::info!("Starting zero-cache with {num_syncers} syncer workers");
            let supervisor = Supervisor::spawn(std::env::current_exe()?, num_syncers)?;
            supervisor.run().await
        },
        Some((WorkerKind::Dispatcher, _)) => dispatcher_main::run(config).await,
        Some((WorkerKind::Syncer, index)) => syncer::run(config, index).await,
        Some((WorkerKind::ChangeStreamer, _)) => change_streamer::run(config).await,
    }
}
