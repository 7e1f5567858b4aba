use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use can_transport as can;
use can_transport::CanBus;
use rmd_driver as rmd;
use rmd_driver::{AccelKind, DeviceId, Driver, DriverConfig, GainStorage, NodeId, PidGains};

#[derive(Parser, Debug)]
#[command(
    name = "rmd",
    version,
    about = "RMD servo actuator CLI",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    bus: BusArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct BusArgs {
    /// Bus backend; `mock` simulates the actuators in-process
    #[arg(long, value_enum, default_value_t = Backend::Mock, global = true)]
    backend: Backend,
    /// Interface name (mock) or serial port path (slcan)
    #[arg(long, default_value = "mock0", global = true)]
    device: String,
    /// Bitrate for SLCAN (defaults to 1m)
    #[arg(long, value_enum, global = true)]
    bitrate: Option<Bitrate>,
    /// Driver configuration YAML
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Registered device ids, comma separated
    #[arg(long, value_delimiter = ',', default_value = "1", global = true)]
    ids: Vec<u8>,
    /// Reply timeout for request/response commands
    #[arg(long, default_value_t = 300u64, global = true)]
    timeout_ms: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Mock,
    Slcan,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Home, hold every device at a fixed angle, then stop
    Move {
        /// Target angle in degrees
        #[arg(long, allow_hyphen_values = true)]
        angle: f64,
        /// Track with 0xA4 and this speed cap (deg/s)
        #[arg(long)]
        speed: Option<u16>,
        #[arg(long, default_value_t = 2000u64)]
        duration_ms: u64,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Home, track a sinusoid on every device, then stop
    Sinus {
        #[arg(long, default_value_t = 30.0)]
        amplitude: f64,
        #[arg(long, default_value_t = 0.5)]
        frequency: f64,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        offset: f64,
        #[arg(long, default_value_t = 5000u64)]
        duration_ms: u64,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Stop (or brake) every device on the bus with one broadcast frame
    Stop {
        #[arg(long, action = ArgAction::SetTrue)]
        brake: bool,
        /// Address each registered device instead and wait for its acknowledgement
        #[arg(long, action = ArgAction::SetTrue)]
        ack: bool,
    },
    /// Write a new id to the single device on the bus, then restart the bus
    SetId {
        #[arg(long)]
        new_id: u8,
    },
    /// Write PID gains to RAM, or ROM with --rom
    SetPid {
        #[arg(long)]
        id: u8,
        #[arg(long)]
        current_kp: u8,
        #[arg(long)]
        current_ki: u8,
        #[arg(long)]
        speed_kp: u8,
        #[arg(long)]
        speed_ki: u8,
        #[arg(long)]
        position_kp: u8,
        #[arg(long)]
        position_ki: u8,
        #[arg(long, action = ArgAction::SetTrue)]
        rom: bool,
    },
    /// Print PID gains and all acceleration parameters as JSON
    ReadRom {
        #[arg(long)]
        id: u8,
    },
    /// Write one acceleration parameter
    SetAccel {
        #[arg(long)]
        id: u8,
        #[arg(long, value_enum)]
        kind: AccelArg,
        /// Value in device units (deg/s²)
        #[arg(long)]
        value: u32,
    },
    /// Enable or disable unsolicited replies
    ActiveReply {
        #[arg(long)]
        id: u8,
        /// Opcode to report, hex (e.g. 9C)
        #[arg(long, default_value = "9C")]
        opcode: String,
        #[arg(long, action = ArgAction::SetTrue)]
        disable: bool,
        /// Interval in units of 10 ms
        #[arg(long, default_value_t = 1u32)]
        interval: u32,
    },
    /// Set the current position as encoder zero
    Zero {
        #[arg(long)]
        id: u8,
        /// Also write the zero to ROM
        #[arg(long, action = ArgAction::SetTrue)]
        persist: bool,
    },
    /// Read one status reply per registered device
    Status {
        /// Also print the driver metrics
        #[arg(long, action = ArgAction::SetTrue)]
        metrics: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Write one JSON line per tick (target vs observed position)
    #[arg(long)]
    log: Option<PathBuf>,
    /// Control period in milliseconds (overrides config)
    #[arg(long)]
    period_ms: Option<u64>,
    /// Print the driver metrics after the run
    #[arg(long, action = ArgAction::SetTrue)]
    metrics: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum AccelArg {
    PositionAccel,
    PositionDecel,
    VelocityAccel,
    VelocityDecel,
}

impl AccelArg {
    fn kind(self) -> AccelKind {
        match self {
            AccelArg::PositionAccel => AccelKind::PositionAcceleration,
            AccelArg::PositionDecel => AccelKind::PositionDeceleration,
            AccelArg::VelocityAccel => AccelKind::VelocityAcceleration,
            AccelArg::VelocityDecel => AccelKind::VelocityDeceleration,
        }
    }
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let timeout = Duration::from_millis(cli.bus.timeout_ms);

    match cli.command {
        Commands::Move {
            angle,
            speed,
            duration_ms,
            run,
        } => {
            let mut config = load_config(&cli.bus, &run, duration_ms)?;
            if speed.is_some() {
                config.control.tracking_speed_cap_dps = speed;
            }
            let period_ms = config.control.period_ms;
            let driver = open_driver(&cli.bus, config)?;
            for &node in driver.nodes() {
                driver.set_target(DeviceId::Individual(node), angle)?;
            }
            run_cycle(&driver, &run, period_ms)
        }
        Commands::Sinus {
            amplitude,
            frequency,
            offset,
            duration_ms,
            run,
        } => {
            let config = load_config(&cli.bus, &run, duration_ms)?;
            let period_ms = config.control.period_ms;
            let driver = open_driver(&cli.bus, config)?;
            let mut wave = rmd::Sinusoid::new(amplitude, frequency);
            wave.offset_deg = offset;
            driver.set_target_all(Arc::new(wave));
            run_cycle(&driver, &run, period_ms)
        }
        Commands::Stop { brake, ack } => {
            let mut config = base_config(cli.bus.config.as_deref())?;
            if brake {
                config.control.stopping.mode = rmd::StopMode::Brake;
            }
            let driver = open_driver(&cli.bus, config)?;
            stop_bus(&driver, brake, ack)
        }
        Commands::SetId { new_id } => {
            let driver = open_driver(&cli.bus, base_config(cli.bus.config.as_deref())?)?;
            driver.set_device_id(NodeId::new(new_id)?)?;
            info!(new_id, "device id set");
            Ok(())
        }
        Commands::SetPid {
            id,
            current_kp,
            current_ki,
            speed_kp,
            speed_ki,
            position_kp,
            position_ki,
            rom,
        } => {
            let driver = open_driver(&cli.bus, base_config(cli.bus.config.as_deref())?)?;
            let gains = PidGains {
                current_kp,
                current_ki,
                speed_kp,
                speed_ki,
                position_kp,
                position_ki,
            };
            let storage = if rom { GainStorage::Rom } else { GainStorage::Ram };
            let echoed = driver.write_pid(NodeId::new(id)?, gains, storage, timeout)?;
            println!("{}", serde_json::to_string(&echoed)?);
            Ok(())
        }
        Commands::ReadRom { id } => {
            let driver = open_driver(&cli.bus, base_config(cli.bus.config.as_deref())?)?;
            let node = NodeId::new(id)?;
            let mut acceleration = Vec::with_capacity(AccelKind::ALL.len());
            for kind in AccelKind::ALL {
                acceleration.push((kind, driver.read_acceleration(node, kind, timeout)?));
            }
            let rec = RomRecord {
                id,
                pid: driver.read_pid(node, timeout)?,
                acceleration,
            };
            println!("{}", serde_json::to_string_pretty(&rec)?);
            Ok(())
        }
        Commands::SetAccel { id, kind, value } => {
            let driver = open_driver(&cli.bus, base_config(cli.bus.config.as_deref())?)?;
            let echoed = driver.write_acceleration(NodeId::new(id)?, kind.kind(), value, timeout)?;
            println!("{:?}\t{echoed}", kind.kind());
            Ok(())
        }
        Commands::ActiveReply {
            id,
            opcode,
            disable,
            interval,
        } => {
            let op = parse_hex_u8(&opcode)?;
            let driver = open_driver(&cli.bus, base_config(cli.bus.config.as_deref())?)?;
            driver.set_active_reply(NodeId::new(id)?, op, !disable, interval, timeout)?;
            Ok(())
        }
        Commands::Zero { id, persist } => {
            let driver = open_driver(&cli.bus, base_config(cli.bus.config.as_deref())?)?;
            let node = NodeId::new(id)?;
            driver.zero_encoder_offset(node, timeout)?;
            if persist {
                driver.persist_zero(node, timeout)?;
            }
            info!(id, persist, "encoder zeroed");
            Ok(())
        }
        Commands::Status { metrics } => {
            let driver = open_driver(&cli.bus, base_config(cli.bus.config.as_deref())?)?;
            for &node in driver.nodes() {
                match driver.read_status(node, timeout) {
                    Ok(snap) => println!(
                        "{}",
                        serde_json::to_string(&StatusRecord { id: node.get(), snapshot: snap })?
                    ),
                    Err(e) => warn!(%node, error = %e, "no status"),
                }
            }
            if metrics {
                print!("{}", driver.metrics().encode_text());
            }
            Ok(())
        }
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Serialize)]
struct RomRecord {
    id: u8,
    pid: PidGains,
    acceleration: Vec<(AccelKind, u32)>,
}

#[derive(Serialize)]
struct StatusRecord {
    id: u8,
    #[serde(flatten)]
    snapshot: rmd::TelemetrySnapshot,
}

#[derive(Serialize)]
struct LogHeader<'a> {
    started_at: String,
    period_ms: u64,
    ids: &'a [u8],
}

fn base_config(path: Option<&Path>) -> Result<DriverConfig> {
    match path {
        Some(p) => rmd::load_config_file(p),
        None => Ok(DriverConfig::default()),
    }
}

fn load_config(bus: &BusArgs, run: &RunArgs, duration_ms: u64) -> Result<DriverConfig> {
    let mut config = base_config(bus.config.as_deref())?;
    if let Some(period) = run.period_ms {
        config.control.period_ms = period;
    }
    config.control.run_for_ms = Some(duration_ms);
    config.validate()?;
    Ok(config)
}

fn open_driver(bus: &BusArgs, config: DriverConfig) -> Result<Driver> {
    let nodes = bus
        .ids
        .iter()
        .map(|&id| NodeId::new(id))
        .collect::<Result<Vec<_>, _>>()?;
    let transport: Arc<dyn rmd::Transport> = match bus.backend {
        Backend::Mock => {
            let can_bus = can::MockBus::open(&bus.device)?;
            let sim = rmd::SimulatedActuators::new(config.addresses, config.scale, bus.ids.clone());
            can_bus.set_responder(sim.responder())?;
            Arc::new(rmd::BusTransport::new(can_bus, config.rx_timeout())?)
        }
        Backend::Slcan => {
            let br = bus.bitrate.map(|b| b.into_transport());
            let can_bus = can::SlcanBus::open_with(&bus.device, br)
                .with_context(|| format!("opening SLCAN adapter {}", bus.device))?;
            Arc::new(rmd::BusTransport::new(can_bus, config.rx_timeout())?)
        }
    };
    info!(
        backend = ?bus.backend,
        device = %bus.device,
        bitrate = bus.bitrate.map(|b| b.as_str()).unwrap_or("default"),
        "bus open"
    );
    Ok(Driver::configure(transport, config, nodes)?)
}

fn run_cycle(driver: &Driver, run: &RunArgs, period_ms: u64) -> Result<()> {
    if let Some(path) = &run.log {
        driver.set_tick_observer(tick_logger(path, driver, period_ms)?);
    }
    driver.start()?;
    let report = driver.wait()?;
    println!("{}", serde_json::to_string(&report)?);
    if run.metrics {
        print!("{}", driver.metrics().encode_text());
    }
    Ok(())
}

fn stop_bus(driver: &Driver, brake: bool, ack: bool) -> Result<()> {
    if ack {
        let report = driver.stop()?;
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }
    let command = if brake {
        rmd::Command::Brake
    } else {
        rmd::Command::Stop
    };
    driver.command(DeviceId::Broadcast, &command)?;
    info!(brake, "broadcast stop sent");
    Ok(())
}

fn tick_logger(path: &Path, driver: &Driver, period_ms: u64) -> Result<rmd::TickObserver> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut w = BufWriter::new(file);
    let ids: Vec<u8> = driver.nodes().iter().map(|n| n.get()).collect();
    let header = LogHeader {
        started_at: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default(),
        period_ms,
        ids: &ids,
    };
    writeln!(w, "{}", serde_json::to_string(&header)?)?;
    let mut failed = false;
    Ok(Box::new(move |sample: &rmd::TickSample| {
        if failed {
            return;
        }
        let line = serde_json::to_string(sample).unwrap_or_else(|_| "{}".to_string());
        if let Err(e) = writeln!(w, "{line}").and_then(|()| w.flush()) {
            warn!(error = %e, "tick log write failed; logging disabled");
            failed = true;
        }
    }))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Bitrate {
    #[value(name = "125k")]
    B125k,
    #[value(name = "250k")]
    B250k,
    #[value(name = "500k")]
    B500k,
    #[value(name = "800k")]
    B800k,
    #[value(name = "1m")]
    B1M,
}

impl Bitrate {
    fn into_transport(self) -> can::SlcanBitrate {
        match self {
            Bitrate::B125k => can::SlcanBitrate::B125k,
            Bitrate::B250k => can::SlcanBitrate::B250k,
            Bitrate::B500k => can::SlcanBitrate::B500k,
            Bitrate::B800k => can::SlcanBitrate::B800k,
            Bitrate::B1M => can::SlcanBitrate::B1M,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Bitrate::B125k => "125k",
            Bitrate::B250k => "250k",
            Bitrate::B500k => "500k",
            Bitrate::B800k => "800k",
            Bitrate::B1M => "1m",
        }
    }
}

fn parse_hex_u8(s: &str) -> Result<u8> {
    let t = s.trim();
    let no_prefix = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t);
    u8::from_str_radix(no_prefix, 16).map_err(|e| anyhow::anyhow!("invalid hex byte '{t}': {e}"))
}
