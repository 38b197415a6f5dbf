//! lb-sim: run a coupled lattice-Boltzmann / rigid-particle simulation
//!
//! Usage: `lb-sim <config.json>`. Set `RUST_LOG` to adjust verbosity.

use std::process::ExitCode;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lb_sim=info,lb_orchestrator=info,lb_kernel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(config_path) = std::env::args().nth(1) else {
        tracing::error!("usage: lb-sim <config.json>");
        return ExitCode::FAILURE;
    };

    match lb_orchestrator::run_from_file(&config_path) {
        Ok(summary) => {
            tracing::info!("Finished {} iterations", summary.steps);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
