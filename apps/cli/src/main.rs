use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use emvco_core::protocol::constants::{
    NFC_FW_DOWNLOAD, NFC_POWER_OFF, NFC_POWER_ON, NFC_VEN_RESET, TECH_NFC_A, TECH_NFC_B,
    TECH_NFC_F, TECH_NFC_V,
};
use emvco_core::{ControlEvent, ControlListener, ControllerConfig, EmvcoConfig, EmvcoController};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "NFC controller EMVCo mode tool", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Device node of the controller (overrides the config file)
    #[arg(long)]
    device: Option<String>,

    /// Exchange timeout in milliseconds (overrides the config file)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start EMVCo polling, hold it, then stop
    Start {
        /// Technologies to poll, e.g. "a,b"
        #[arg(long)]
        tech: Option<String>,

        /// Polling period in milliseconds
        #[arg(long)]
        period_ms: Option<u16>,

        /// Seconds to stay in EMVCo mode before stopping
        #[arg(long, default_value_t = 10)]
        hold: u64,
    },
    /// Send a raw extension command and print the response
    Ext {
        /// Opcode, decimal or 0x-prefixed hex
        opcode: String,

        /// Payload as hex, e.g. "01ff20"
        #[arg(default_value = "")]
        payload: String,
    },
    /// Reset the controller
    Reset {
        /// Power argument: off, on, fw-download, ven-reset or a number
        #[arg(long)]
        arg: Option<String>,
    },
    /// Print chip events for a while
    Monitor {
        /// Seconds to listen
        #[arg(long, default_value_t = 30)]
        secs: u64,
    },
    /// Write the effective configuration as TOML
    Config {
        /// Output path
        path: String,
    },
}

/// Prints every event on stdout.
struct PrintListener;

impl ControlListener for PrintListener {
    fn on_event(&self, event: &ControlEvent) {
        match event {
            ControlEvent::ModeChanged { from, to } => println!("mode: {} -> {}", from, to),
            ControlEvent::ModeTransitionFailed {
                target,
                reverted_to,
                reason,
            } => println!("mode: {} failed ({}), back to {}", target, reason, reverted_to),
            ControlEvent::ChipStateChanged { state } => println!("chip: {}", state),
            ControlEvent::Unsolicited { opcode, payload } => {
                println!("ntf: 0x{:02X} {}", opcode, to_hex(payload))
            }
            ControlEvent::TransportLost => println!("transport lost"),
        }
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    if let Command::Config { path } = &args.command {
        config.save_to_file(path)?;
        info!(path = %path, "Configuration written");
        return Ok(());
    }

    info!(device = %config.device_path, "Opening controller");
    let controller = EmvcoController::open(config.clone())?;
    controller.register_listener(Arc::new(PrintListener));

    match args.command {
        Command::Start {
            tech,
            period_ms,
            hold,
        } => {
            let mut emvco = config.emvco;
            if let Some(tech) = tech {
                emvco.technologies = parse_tech(&tech)?;
            }
            if let Some(period) = period_ms {
                emvco.poll_period_ms = period;
            }
            run_start(&controller, &emvco, Duration::from_secs(hold))
        }
        Command::Ext { opcode, payload } => {
            let opcode = parse_u8(&opcode)?;
            let payload = parse_hex(&payload)?;
            let frame = controller.send_ext_command(opcode, &payload)?;
            match frame.status() {
                Some(status) => println!("status: {} body: {}", status, to_hex(frame.body())),
                None => println!("empty response"),
            }
            Ok(())
        }
        Command::Reset { arg } => {
            match arg {
                Some(arg) => controller.reset_chip_with(parse_power_arg(&arg)?)?,
                None => controller.reset_chip()?,
            }
            println!("reset done");
            Ok(())
        }
        Command::Monitor { secs } => {
            info!(secs, "Monitoring chip events");
            thread::sleep(Duration::from_secs(secs));
            Ok(())
        }
        Command::Config { .. } => unreachable!("handled above"),
    }
}

fn run_start<T: emvco_core::NfccTransport + 'static>(
    controller: &EmvcoController<T>,
    emvco: &EmvcoConfig,
    hold: Duration,
) -> Result<()> {
    let response = controller.start_mode(emvco);
    println!("start: {}", response);
    if !response.is_accepted() {
        bail!("EMVCo start failed");
    }

    info!(secs = hold.as_secs(), "Holding EMVCo mode");
    thread::sleep(hold);

    let response = controller.stop_mode();
    println!("stop: {}", response);
    if !response.is_accepted() {
        bail!("EMVCo stop failed");
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<ControllerConfig> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path))?,
        None => ControllerConfig::default(),
    };
    if let Some(device) = &args.device {
        config.device_path = device.clone();
    }
    if let Some(timeout) = args.timeout_ms {
        config.exchange_timeout_ms = timeout;
    }
    config.validate()?;
    Ok(config)
}

fn parse_tech(s: &str) -> Result<u8> {
    let mut mask = 0;
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        mask |= match part.to_ascii_lowercase().as_str() {
            "a" => TECH_NFC_A,
            "b" => TECH_NFC_B,
            "f" => TECH_NFC_F,
            "v" => TECH_NFC_V,
            other => bail!("unknown technology '{}'", other),
        };
    }
    Ok(mask)
}

fn parse_power_arg(s: &str) -> Result<u64> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "off" => NFC_POWER_OFF,
        "on" => NFC_POWER_ON,
        "fw-download" => NFC_FW_DOWNLOAD,
        "ven-reset" => NFC_VEN_RESET,
        other => other
            .parse()
            .map_err(|e| anyhow!("invalid power argument '{}': {}", s, e))?,
    })
}

fn parse_u8(s: &str) -> Result<u8> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|e| anyhow!("invalid opcode '{}': {}", s, e))
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if !s.is_ascii() {
        bail!("hex payload contains non-ASCII characters");
    }
    if s.len() % 2 != 0 {
        bail!("hex payload has an odd number of digits");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| anyhow!("invalid hex '{}': {}", &s[i..i + 2], e))
        })
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}
