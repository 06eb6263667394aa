//! Simulated update command implementation.
//!
//! Runs the real engine against [`SimulatedDevice`]. A supervisor task drives
//! the progress bar and turns Ctrl-C or `--cancel-after-windows` into an
//! `abort_update` call while the transfer is running.

use anyhow::{Context, Result};
use console::style;
use ergota::sim::{SimConfig, SimulatedDevice};
use ergota::{FirmwareImage, OtaConfig, OtaEngine, UpdateOutcome};
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use crate::commands::info::plan_for;
use crate::config::Config;
use crate::{Cli, CliError, SimulateArgs, use_fancy_output, was_interrupted};

type SimEngine = OtaEngine<Arc<SimulatedDevice>, Arc<SimulatedDevice>>;

/// How often the supervisor checks for Ctrl-C.
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// Everything needed to run one simulated update.
#[derive(Debug, Clone)]
struct Simulation {
    device: SimConfig,
    ota: OtaConfig,
    /// Abort once this many bytes were sent.
    cancel_at: Option<usize>,
    quiet: bool,
}

/// Simulate command implementation.
pub(crate) fn cmd_simulate(cli: &Cli, config: &Config, args: &SimulateArgs) -> Result<()> {
    if args.cancel_after_windows == Some(0) {
        return Err(CliError::Usage("--cancel-after-windows must be at least 1".to_string()).into());
    }

    let params = args.plan.resolve(config)?;
    let image = FirmwareImage::from_file(&args.firmware)
        .with_context(|| format!("Failed to load firmware {}", args.firmware.display()))?;
    let plan = plan_for(&image, &params)?;

    let mut device = SimConfig {
        attr: params.attr,
        buffer: params.buffer,
        fault: args.fault.map(|fault| fault.into_fault(args.fault_at)),
        ..config.sim_config()
    };
    if let Some(ms) = args.reply_delay_ms {
        device.reply_delay = Duration::from_millis(ms);
    }

    let mut ota = config.ota_config();
    if let Some(ms) = args.transfer_timeout_ms {
        ota = ota.with_transfer_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = args.abort_timeout_ms {
        ota = ota.with_abort_timeout(Duration::from_millis(ms));
    }

    if !cli.quiet {
        eprintln!(
            "{} Loaded firmware {} ({}, md5 {})",
            style("📦").cyan(),
            args.firmware.display(),
            HumanBytes(u64::from(image.size())),
            image.digest_hex()
        );
        eprintln!(
            "{} Simulated device: attr={} buffer={} ({} packages in {} windows)",
            style("🔌").cyan(),
            params.attr,
            params.buffer,
            plan.package_count(),
            plan.window_count()
        );
        if let Some(fault) = device.fault {
            eprintln!("{} Injecting fault: {fault:?}", style("⚠").yellow());
        }
    }

    let simulation = Simulation {
        device,
        ota,
        cancel_at: args
            .cancel_after_windows
            .map(|windows| windows.saturating_mul(plan.window_bytes())),
        quiet: cli.quiet,
    };
    let pb = progress_bar(cli.quiet, u64::from(image.size()));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run_simulation(&image, simulation, pb))
}

fn progress_bar(quiet: bool, total: u64) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

async fn run_simulation(image: &FirmwareImage, simulation: Simulation, pb: ProgressBar) -> Result<()> {
    let device = Arc::new(SimulatedDevice::new(simulation.device));
    let engine =
        Arc::new(OtaEngine::new(Arc::clone(&device), Arc::clone(&device)).with_config(simulation.ota));

    let supervisor = tokio::spawn(supervise(
        Arc::clone(&engine),
        pb.clone(),
        simulation.cancel_at,
        image.as_bytes().len(),
    ));

    match engine.perform_update(image.as_bytes()).await {
        Ok(UpdateOutcome::Completed) => {
            supervisor.abort();
            pb.finish_with_message("complete");

            if device.installed_image().as_deref() != Some(image.as_bytes()) {
                anyhow::bail!("Simulated device did not install the image");
            }
            if !simulation.quiet {
                eprintln!(
                    "\n{} Update installed, device verified md5 {}",
                    style("🎉").green().bold(),
                    image.digest_hex()
                );
            }
            Ok(())
        },
        Ok(UpdateOutcome::Cancelled) => {
            let aborted = supervisor.await.context("Abort task failed")?;
            pb.abandon_with_message("aborted");

            match aborted {
                Some((sent, Ok(()))) => Err(CliError::Cancelled(format!(
                    "Update aborted after {sent} of {} bytes",
                    image.size()
                ))
                .into()),
                Some((_, Err(e))) => Err(anyhow::Error::new(e).context("Abort failed")),
                None => Err(CliError::Cancelled("Update cancelled".to_string()).into()),
            }
        },
        Err(err) => {
            supervisor.abort();
            pb.abandon_with_message("failed");

            let message = err
                .as_ota()
                .map_or("update failed", ergota::OtaError::user_message);
            Err(anyhow::Error::new(err).context(format!("Update failed, {message}")))
        },
    }
}

/// Follow progress until the update ends or an abort is requested.
///
/// Returns the bytes sent when the abort was issued and its result.
async fn supervise(
    engine: Arc<SimEngine>,
    pb: ProgressBar,
    cancel_at: Option<usize>,
    total: usize,
) -> Option<(usize, ergota::Result<()>)> {
    let mut progress = engine.subscribe_progress();
    let mut poll = tokio::time::interval(INTERRUPT_POLL);

    let sent = loop {
        tokio::select! {
            changed = progress.changed() => {
                if changed.is_err() {
                    return None;
                }
                let sent = *progress.borrow_and_update();
                pb.set_position(sent as u64);
                if cancel_at.is_some_and(|limit| sent >= limit && sent < total) {
                    debug!("Cancel threshold reached at {sent} bytes");
                    break sent;
                }
            },
            _ = poll.tick() => {
                if was_interrupted() {
                    break engine.progress();
                }
            },
        }
    };

    info!("Aborting update after {sent} bytes");
    pb.set_message("aborting");
    Some((sent, engine.abort_update().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CliError, exit_code, exit_code_for};
    use ergota::sim::Fault;

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::from_bytes((0..len).map(|i| (i % 256) as u8).collect()).unwrap()
    }

    fn simulation(device: SimConfig) -> Simulation {
        Simulation {
            device,
            ota: OtaConfig::default(),
            cancel_at: None,
            quiet: true,
        }
    }

    #[tokio::test]
    async fn test_simulation_completes() {
        let sim = simulation(SimConfig {
            attr: 15,
            buffer: 100,
            ..SimConfig::default()
        });
        run_simulation(&image(1024), sim, ProgressBar::hidden())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_device_fault_maps_to_ota_exit_code() {
        let sim = simulation(SimConfig {
            fault: Some(Fault::CorruptChecksum),
            ..SimConfig::default()
        });
        let err = run_simulation(&image(4096), sim, ProgressBar::hidden())
            .await
            .unwrap_err();

        assert_eq!(exit_code_for(&err), exit_code::OTA);
        assert!(format!("{err:#}").contains("invalid firmware file"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_threshold_aborts() {
        let mut sim = simulation(SimConfig {
            attr: 10,
            buffer: 100,
            reply_delay: Duration::from_millis(5),
            ..SimConfig::default()
        });
        sim.cancel_at = Some(200);

        let err = run_simulation(&image(1000), sim, ProgressBar::hidden())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Cancelled(_))
        ));
        assert_eq!(exit_code_for(&err), exit_code::CANCELLED);
    }

    #[tokio::test]
    async fn test_threshold_beyond_image_never_fires() {
        let mut sim = simulation(SimConfig {
            attr: 10,
            buffer: 100,
            reply_delay: Duration::from_millis(1),
            ..SimConfig::default()
        });
        sim.cancel_at = Some(1000);

        run_simulation(&image(1000), sim, ProgressBar::hidden())
            .await
            .unwrap();
    }
}
