use anyhow::{anyhow, bail, Result};
use clap::Parser;
use std::time::Duration;
use tracing::debug;
use usbtool_core::{Diagnostic, ScanConfig, ScanReport, Scanner, UnifiedDevice};
use usbtool_report::{render_json, render_text};

mod logging;

#[derive(Parser, Debug)]
#[command(name = "usb", version, about = "List Apricorn USB storage devices")]
struct Args {
    /// Print the device list as JSON.
    #[arg(long)]
    json: bool,

    /// Read the first block of `all` or a comma list of device numbers.
    #[arg(long, value_name = "TARGETS", conflicts_with = "json")]
    poke: Option<String>,

    /// Skip the USB controller lookup.
    #[arg(long)]
    minimal: bool,

    /// Do not query firmware versions.
    #[arg(long)]
    no_version: bool,

    /// Per-device SCSI timeout in seconds.
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    timeout: u64,

    /// Product id to ignore; may be repeated.
    #[arg(long = "exclude-pid", value_name = "PID")]
    exclude_pid: Vec<String>,

    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            excluded_product_ids: self
                .exclude_pid
                .iter()
                .map(|pid| pid.trim().trim_start_matches("0x").to_ascii_lowercase())
                .collect(),
            minimal: self.minimal,
            // Poking never needs the version payload.
            query_versions: !self.no_version && self.poke.is_none(),
            query_timeout: Duration::from_secs(self.timeout),
            ..ScanConfig::default()
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_logging(args.verbose)?;

    let scanner = host_scanner(args.scan_config())?;
    let report = scanner.scan()?;
    debug!(devices = report.devices.len(), passes = report.passes, "scan finished");
    print_diagnostics(&report);

    if let Some(targets) = &args.poke {
        return poke(&scanner, &report.devices, targets, Duration::from_secs(args.timeout));
    }
    if args.json {
        println!("{}", render_json(&report.devices)?);
    } else {
        print!("{}", render_text(&report.devices)?);
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn host_scanner(config: ScanConfig) -> Result<Scanner> {
    Ok(usbtool_host_linux::scanner(config))
}

#[cfg(target_os = "macos")]
fn host_scanner(config: ScanConfig) -> Result<Scanner> {
    Ok(usbtool_host_macos::scanner(config))
}

#[cfg(windows)]
fn host_scanner(config: ScanConfig) -> Result<Scanner> {
    Ok(usbtool_host_windows::scanner(config))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn host_scanner(_config: ScanConfig) -> Result<Scanner> {
    Err(anyhow!("unsupported host operating system"))
}

fn print_diagnostics(report: &ScanReport) {
    for diagnostic in &report.diagnostics {
        // Query failures are routine for locked devices; `-v` shows them.
        if matches!(diagnostic, Diagnostic::QueryFailed { .. }) {
            continue;
        }
        eprintln!("warning: {}", diagnostic);
    }
    if report.permission_denied() {
        eprintln!("warning: some information needs elevated privileges; re-run as administrator or root");
    }
}

/// Zero-based device indices named by `all` or a comma list of 1-based
/// numbers, deduplicated in order.
fn parse_poke_targets(selection: &str, count: usize) -> Result<Vec<usize>> {
    let selection = selection.trim();
    if selection.eq_ignore_ascii_case("all") {
        return Ok((0..count).collect());
    }
    let mut targets = Vec::new();
    for part in selection.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        let number: usize = part
            .parse()
            .map_err(|_| anyhow!("invalid device number '{}'", part))?;
        if number == 0 || number > count {
            bail!("device #{} does not exist ({} found)", number, count);
        }
        if !targets.contains(&(number - 1)) {
            targets.push(number - 1);
        }
    }
    if targets.is_empty() {
        bail!("no devices selected");
    }
    Ok(targets)
}

fn poke(scanner: &Scanner, devices: &[UnifiedDevice], selection: &str, timeout: Duration) -> Result<()> {
    if devices.is_empty() {
        println!("No Apricorn devices found.");
        return Ok(());
    }
    let mut failed = 0;
    for index in parse_poke_targets(selection, devices.len())? {
        let device = &devices[index];
        if device.locator.is_none() {
            println!("Device #{}: SKIPPED (no disk)", index + 1);
            continue;
        }
        match scanner.poke(device, timeout) {
            Ok(()) => println!("Device #{}: SUCCESS", index + 1),
            Err(err) => {
                failed += 1;
                println!("Device #{}: FAILED ({})", index + 1, err);
            }
        }
    }
    if failed > 0 {
        bail!("{} device(s) failed the read test", failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poke_all_selects_every_device() {
        assert_eq!(parse_poke_targets("all", 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_poke_targets("ALL", 0).unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn poke_list_is_one_based_and_deduplicated() {
        assert_eq!(parse_poke_targets("2, 1,2", 3).unwrap(), vec![1, 0]);
    }

    #[test]
    fn poke_rejects_bad_numbers() {
        assert!(parse_poke_targets("0", 3).is_err());
        assert!(parse_poke_targets("4", 3).is_err());
        assert!(parse_poke_targets("one", 3).is_err());
        assert!(parse_poke_targets(" , ", 3).is_err());
    }

    #[test]
    fn json_and_poke_conflict() {
        assert!(Args::try_parse_from(["usb", "--json", "--poke", "all"]).is_err());
        let args = Args::try_parse_from(["usb", "--exclude-pid", "0x0221", "--exclude-pid", "1400", "--no-version"]).unwrap();
        let config = args.scan_config();
        assert_eq!(config.excluded_product_ids, vec!["0221", "1400"]);
        assert!(!config.query_versions);
        assert_eq!(config.query_timeout, Duration::from_secs(5));
    }
}
