use clap::Parser;
use env_logger::Env;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;

use zebra_flyscan::{
    CaAxis, CaClient, ChannelAccess, ChannelRegistry, DetectorProfile, FlyScanController,
    FlyScanError, ScanLog, TriggeredDetector, ZebraDevice, load_config_or_default,
};
use std::time::Duration;

/// Zebra fly-scan line runner
#[derive(Parser, Debug)]
#[command(name = "flyscan")]
#[command(about = "Run one continuous-velocity fly-scan line", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Scan start position, axis units
    #[arg(long)]
    start: f64,

    /// Scan end position, axis units
    #[arg(long)]
    end: f64,

    /// Step between triggers, axis units
    #[arg(long, default_value_t = 1.0)]
    step: f64,

    /// Trigger period, seconds
    #[arg(long, default_value_t = 0.1)]
    trigger_period: f64,

    /// Detector exposure per trigger, seconds
    #[arg(long, default_value_t = 0.1)]
    collection_time: f64,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// Stand-in for a real detector adapter: exposure fixed on the command
/// line instead of read from the detector's own records.
struct FixedExposure {
    collection_time: f64,
}

impl TriggeredDetector for FixedExposure {
    fn name(&self) -> &str {
        "cli-detector"
    }

    fn profile(&self) -> Result<DetectorProfile, FlyScanError> {
        Ok(DetectorProfile::new(self.collection_time))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref());

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    env_logger::Builder::from_env(Env::default().default_filter_or(&log_level)).init();

    info!(
        "Connecting to gateway {}:{}",
        config.gateway.host, config.gateway.port
    );
    let client = CaClient::builder()
        .address(&config.gateway.host)
        .port(config.gateway.port)
        .connect_timeout(Duration::from_millis(config.gateway.connect_timeout_ms))
        .read_timeout(Duration::from_millis(config.gateway.read_timeout_ms))
        .write_timeout(Duration::from_millis(config.gateway.write_timeout_ms))
        .build()?;
    let transport: Arc<dyn ChannelAccess> = Arc::new(client);
    let registry = Arc::new(ChannelRegistry::new(transport));

    let zebra = ZebraDevice::new(
        registry.clone(),
        &config.zebra.pv_prefix,
        config.zebra.readback_tolerance,
    );
    let axis = Arc::new(CaAxis::new(registry, &config.motor.record));

    let mut controller = FlyScanController::new(zebra, axis, config.controller_settings());
    if !config.logging.scan_log_path.is_empty() {
        controller = controller.with_scan_log(ScanLog::new(
            &config.logging.scan_log_path,
            config.logging.scan_log_buffer,
        ));
    }
    controller.add_detector(Arc::new(FixedExposure {
        collection_time: args.collection_time,
    }));

    // Ctrl-C interrupts the line; the controller stops the motor and
    // leaves the unit recoverable
    let cancel = controller.cancel_token();
    ctrlc::set_handler(move || {
        info!("Interrupt received, stopping scan");
        cancel.cancel();
    })?;

    controller.set_scan_line(args.start, args.end, args.step);
    controller.set_trigger_period(args.trigger_period);
    info!(
        "Line {} -> {} step {}: {} triggers, ~{:.1}s",
        args.start,
        args.end,
        args.step,
        controller.number_of_triggers()?,
        controller.total_time()?
    );

    controller.prepare_for_move()?;
    let stream = controller.position_stream(0)?;

    let consumer = std::thread::spawn(move || -> Result<u64, FlyScanError> {
        let mut total = 0u64;
        while !stream.is_complete() {
            let batch = stream.read(1024)?;
            if batch.is_empty() {
                continue;
            }
            total += batch.len() as u64;
            info!(
                "Captured {} positions ({total} so far), latest {:.6}",
                batch.len(),
                batch[batch.len() - 1]
            );
        }
        Ok(total)
    });

    controller.start_move()?;
    let outcome = controller.wait_while_moving();
    let captured = consumer.join().expect("position consumer panicked");

    match (outcome, captured) {
        (Ok(()), Ok(total)) => {
            info!("Scan line complete: {total} positions captured");
            Ok(())
        }
        (Err(e), _) | (_, Err(e)) => {
            error!("Scan line aborted: {e}");
            if let Err(reset) = controller.stop_and_reset() {
                error!("Reset after abort failed: {reset}");
            }
            Err(e.into())
        }
    }
}
