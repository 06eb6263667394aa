//! Firmware info command implementation.

use anyhow::{Context, Result};
use console::style;
use ergota::{FirmwareImage, TransferPlan};
use indicatif::HumanBytes;
use std::path::Path;

use crate::DeviceParams;

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, params: &DeviceParams, json: bool) -> Result<()> {
    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let plan = plan_for(&image, params)?;

    if json {
        let info = info_json(firmware, &image, &plan);
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    eprintln!(
        "{} Loaded firmware {}",
        style("📦").cyan(),
        firmware.display()
    );

    eprintln!("\n{}", style("Firmware").bold().underlined());
    eprintln!(
        "  Size:   {} ({} bytes)",
        HumanBytes(u64::from(image.size())),
        image.size()
    );
    eprintln!("  MD5:    {}", image.digest_hex());

    eprintln!("\n{}", style("Transfer plan").bold().underlined());
    eprintln!("  attr:               {} bytes", params.attr);
    eprintln!("  buffer:             {} bytes", params.buffer);
    eprintln!("  Packages per window: {}", plan.packages_per_window());
    eprintln!("  Packages:           {}", plan.package_count());
    eprintln!(
        "  Windows:            {} ({} acknowledged)",
        plan.window_count(),
        plan.window_count().saturating_sub(1)
    );
    if let Some(last) = plan.windows().last() {
        eprintln!(
            "  Last window:        {} packages, {} bytes",
            last.package_count(),
            last.bytes.len()
        );
    }

    Ok(())
}

pub(crate) fn plan_for(image: &FirmwareImage, params: &DeviceParams) -> Result<TransferPlan> {
    image
        .plan(params.attr, params.buffer)
        .context("attr must be greater than zero")
}

fn info_json(path: &Path, image: &FirmwareImage, plan: &TransferPlan) -> serde_json::Value {
    let last = plan.windows().last();
    serde_json::json!({
        "ok": true,
        "data": {
            "path": path.display().to_string(),
            "size": image.size(),
            "md5": image.digest_hex(),
            "attr": plan.attr(),
            "packages_per_window": plan.packages_per_window(),
            "window_bytes": plan.window_bytes(),
            "package_count": plan.package_count(),
            "window_count": plan.window_count(),
            "last_window_packages": last.map_or(0, |w| w.package_count()),
        }
    })
}
