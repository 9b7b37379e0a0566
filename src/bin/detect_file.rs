use std::path::Path;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use kappa_scan::catalog;
use kappa_scan::config::DetectionConfig;
use kappa_scan::pipeline::{self, DetectionEvent, EventSink};

/// Logs run events as they arrive.
struct LogSink;

impl EventSink for LogSink {
    fn emit(&mut self, event: DetectionEvent) {
        match event {
            DetectionEvent::Progress {
                phase,
                processed,
                total,
                item_name,
            } => tracing::debug!("{phase} {processed}/{total} {item_name}"),
            DetectionEvent::Status { message } => tracing::info!("{message}"),
            DetectionEvent::Debug { message } => tracing::debug!("{message}"),
            DetectionEvent::Error { message } => tracing::error!("{message}"),
            DetectionEvent::Result(_) => {}
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: detect_file <catalog_dir> <screenshot.png> [screenshot2.png ...]");
        std::process::exit(1);
    }

    let config = DetectionConfig::default();
    let catalog_dir = Path::new(&args[1]);
    let catalog = catalog::load_catalog(catalog_dir, &config)
        .with_context(|| format!("failed to load catalog from {}", catalog_dir.display()))?;
    println!(
        "Catalog: {} item(s), {} with icons",
        catalog.len(),
        catalog.loadable().count()
    );
    println!();

    for screenshot_path in &args[2..] {
        let screenshot = match image::open(screenshot_path) {
            Ok(img) => img,
            Err(e) => {
                eprintln!("Failed to load {screenshot_path}: {e}");
                continue;
            }
        };

        let report = match pipeline::run_detection(&screenshot, &catalog, &config, &mut LogSink) {
            Ok(report) => report,
            Err(e) => {
                eprintln!("{screenshot_path}: detection failed: {e}");
                continue;
            }
        };

        println!(
            "{screenshot_path}: {} found, {} missing, scale {:.2}",
            report.found_items.len(),
            report.missing_items.len(),
            report.scale
        );
        for hit in &report.found_items {
            println!(
                "  FOUND   {:<40} conf={:.4} {} scale={:.2} rot={} crop={} at ({}, {}) {}x{}",
                hit.item.name,
                hit.confidence,
                hit.pass,
                hit.scale,
                hit.rotation.degrees(),
                hit.crop_type,
                hit.rect.left,
                hit.rect.top,
                hit.rect.width,
                hit.rect.height,
            );
        }
        for missing in &report.missing_items {
            println!("  MISSING {:<40} {}", missing.name, missing.reason);
        }
        for skipped in &report.skipped_items {
            println!("  SKIPPED {:<40} no icon", skipped.name);
        }

        let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
        println!("{json}");
        println!();
    }

    Ok(())
}
