use clap::{App, Arg};
use colored::*;
use haversine::metadata::{SatelliteMetadata, TagMetadataCodec};
use haversine::policy::{CollectionEvent, EventSinkTransfers, StaticUpdates, UserPermissions};
use haversine::satellite::{ManufacturerData, OperatingMode, PersistentState, PlatformVersions, TransientState};
use haversine::simulator::{SimulatedSatellite, SimulatedTransport, SimulatorConfig};
use haversine::{
    Advertisement, CollectionIndexes, Environment, EventPump, HardwareVersion, ManagerConfig, ManagerSnapshot,
    SatelliteId, SatelliteManager, SatelliteState,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{info, Level};

const DEFAULT_SATELLITES: &str = "4";
const DEFAULT_FAILURE_RATE: &str = "10";
const DEFAULT_DURATION_S: &str = "3";
const ADVERTISING_INTERVAL_MS: u64 = 250;
const FIRST_INDEX: u16 = 65_530;

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    finished: u32,
    failed: u32,
    bytes: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("haversine-sim")
        .version("0.1.0")
        .author("Haversine Sensor Team")
        .about("🛰️  Satellite session manager running against simulated sensors")
        .arg(
            Arg::with_name("satellites")
                .short("n")
                .long("satellites")
                .value_name("COUNT")
                .help("Number of simulated satellites")
                .takes_value(true)
                .default_value(DEFAULT_SATELLITES)
                .validator(|v| match v.parse::<u8>() {
                    Ok(n) if n > 0 => Ok(()),
                    _ => Err("Satellite count must be between 1 and 255".into()),
                }),
        )
        .arg(
            Arg::with_name("users")
                .short("u")
                .long("users")
                .value_name("IDS")
                .help("Comma-separated user ids to accept (default: any user)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("failure-rate")
                .long("failure-rate")
                .value_name("PERCENT")
                .help("Chance that a single collection read fails")
                .takes_value(true)
                .default_value(DEFAULT_FAILURE_RATE)
                .validator(|v| match v.parse::<u8>() {
                    Ok(p) if p <= 100 => Ok(()),
                    _ => Err("Failure rate must be between 0 and 100".into()),
                }),
        )
        .arg(
            Arg::with_name("hw-version")
                .long("hw-version")
                .value_name("MAJOR.MINOR")
                .help("Hardware protocol version passed to the radio")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Manager configuration as JSON")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("SECONDS")
                .help("How long to scan")
                .takes_value(true)
                .default_value(DEFAULT_DURATION_S)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Duration must be a number of seconds".into()),
                }),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .value_name("SEED")
                .help("Seed for failure injection")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("latest-only")
                .long("latest-only")
                .help("Transfer only the most recent collection of each satellite"),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Log more (-v info, -vv debug)"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match matches.value_of("config") {
        Some(path) => ManagerConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => ManagerConfig::default(),
    };
    if let Some(version) = matches.value_of("hw-version") {
        config.hardware_version = parse_hardware_version(version)?;
    }
    config.validate()?;

    let satellite_count: u8 = matches.value_of("satellites").unwrap_or(DEFAULT_SATELLITES).parse()?;
    let duration_s: u64 = matches.value_of("duration").unwrap_or(DEFAULT_DURATION_S).parse()?;
    let users = match matches.value_of("users") {
        Some(list) => parse_users(list)?,
        None => Vec::new(),
    };

    let mut sim_config = SimulatorConfig {
        failure_rate_percent: matches.value_of("failure-rate").unwrap_or(DEFAULT_FAILURE_RATE).parse()?,
        ..SimulatorConfig::default()
    };
    if let Some(seed) = matches.value_of("seed") {
        sim_config.seed = seed.parse()?;
    }

    println!("{}", "🛰️  Haversine satellite simulator".bright_blue().bold());
    println!("{}", "=================================".bright_blue());
    println!(
        "{} {} satellites, {}% read failures, hardware {}",
        "⚙️".cyan(),
        satellite_count.to_string().bright_white(),
        sim_config.failure_rate_percent.to_string().bright_white(),
        config.hardware_version.to_string().bright_white()
    );

    let (transport, transport_events) = SimulatedTransport::new(sim_config);
    let transport = Arc::new(transport);
    for slot in 0..satellite_count {
        transport.add_satellite(simulated_satellite(slot, &users));
    }

    let permissions = Arc::new(UserPermissions::new());
    if !users.is_empty() {
        permissions.set_multi_user(&users)?;
    }
    let updates = Arc::new(StaticUpdates::new());
    updates.set_sensor_config(vec![0x01, 0x10, 0x00]);

    let (collection_tx, mut collection_rx) = mpsc::unbounded_channel();
    let mut transfers = EventSinkTransfers::new(collection_tx);
    if matches.is_present("latest-only") {
        transfers = transfers.latest_only();
    }

    let environment = Environment::new()
        .with_permissions(permissions)
        .with_updates(updates)
        .with_transfers(Arc::new(transfers));
    let manager = Arc::new(SatelliteManager::with_config(transport.clone(), environment, config)?);

    let _discovered = manager.discovery_events().subscribe(|satellite| {
        println!(
            "{} Discovered {} ({} dBm)",
            "📡".green(),
            satellite.id().to_string().bright_white(),
            satellite.rssi()
        );
    });
    let _completed = manager.scanning_completion_events().subscribe(|status| match status {
        Ok(()) => println!("{} {}", "✅".green(), "Scan completed".bright_green()),
        Err(e) => println!("{} Scan ended: {}", "⚠️".yellow(), e.to_string().bright_red()),
    });

    let collector = tokio::spawn(async move {
        let mut tallies: HashMap<SatelliteId, Tally> = HashMap::new();
        while let Some(event) = collection_rx.recv().await {
            match event {
                CollectionEvent::WillTransfer { satellite, range } => {
                    info!(satellite = %satellite, range = %range, "Transfer batch starting");
                }
                CollectionEvent::Finished { satellite, data, .. } => {
                    let tally = tallies.entry(satellite).or_default();
                    tally.finished += 1;
                    tally.bytes += data.len();
                }
                CollectionEvent::Failed { satellite, .. } => {
                    tallies.entry(satellite).or_default().failed += 1;
                }
            }
        }
        tallies
    });

    let pump = EventPump::spawn(Arc::clone(&manager), transport_events);
    if let Err(e) = manager.scan_for_satellites() {
        println!("{} Could not start scanning: {}", "❌".red(), e.to_string().bright_red());
    }

    // Drop one link halfway through to exercise resumption.
    let ticks = duration_s * 1000 / ADVERTISING_INTERVAL_MS;
    let mut interval = time::interval(Duration::from_millis(ADVERTISING_INTERVAL_MS));
    for tick in 0..ticks {
        interval.tick().await;
        if tick == ticks / 2 {
            let id = satellite_id(0);
            if transport.drop_connection(&id) {
                println!("{} Link to {} lost", "🔌".yellow(), id.to_string().bright_white());
            }
            transport.add_collections(&id, 2)?;
        }
        transport.advertise_all();
    }

    manager.stop_scanning();
    time::sleep(Duration::from_millis(ADVERTISING_INTERVAL_MS)).await;

    let snapshot = manager.snapshot();
    manager.shutdown();
    let pump_stats = pump.shutdown().await;
    drop(manager);

    let tallies = collector.await.unwrap_or_default();
    match matches.value_of("format").unwrap_or("table") {
        "json" => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        _ => print_table(&snapshot, &tallies),
    }

    let stats = transport.stats();
    println!(
        "\n{} {} events, {} transfer passes, {} reads ({} failed), {} updates",
        "📊".bright_blue(),
        pump_stats.events,
        pump_stats.transfers,
        stats.reads,
        stats.read_failures,
        stats.updates_written
    );
    println!("{}", "🚀 Simulator stopped".bright_green());
    Ok(())
}

fn parse_hardware_version(value: &str) -> Result<HardwareVersion, Box<dyn std::error::Error>> {
    let (major, minor) = value
        .split_once('.')
        .ok_or("hardware version must look like MAJOR.MINOR")?;
    Ok(HardwareVersion::new(major.parse()?, minor.parse()?))
}

fn parse_users(list: &str) -> Result<Vec<u32>, Box<dyn std::error::Error>> {
    let mut users = Vec::new();
    for part in list.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        users.push(part.parse()?);
    }
    Ok(users)
}

fn satellite_id(slot: u8) -> SatelliteId {
    SatelliteId::new(format!("C0:FF:EE:00:00:{:02X}", slot))
}

/// Slot owners cycle through the accepted users, then nobody, then a stranger.
fn simulated_satellite(slot: u8, users: &[u32]) -> SimulatedSatellite {
    let mut owners: Vec<Option<u32>> = users.iter().copied().map(Some).collect();
    owners.push(None);
    owners.push(Some(999_999));
    let owner = owners[usize::from(slot) % owners.len()];

    let metadata = SatelliteMetadata {
        user_id: owner,
        club_id: None,
        timestamp: 1_700_000_000 + u64::from(slot),
    };
    let collections = CollectionIndexes::new(FIRST_INDEX, FIRST_INDEX.wrapping_add(6 + u16::from(slot)));
    let id = satellite_id(slot);

    let state = SatelliteState {
        persistent: PersistentState {
            serial_number: format!("HV-{:04}", slot),
            platform_versions: PlatformVersions {
                firmware_version_major: 2,
                firmware_version_minor: 7,
                hardware_version_major: 10,
                hardware_version_minor: 0,
            },
            application_data: TagMetadataCodec::encode(&metadata, false),
        },
        transient: TransientState {
            is_moving: slot % 2 == 0,
            is_dark: slot % 3 == 0,
            truncated_collection_count: collections.len() as u8,
            ..TransientState::default()
        },
        mode: if slot == 3 {
            OperatingMode::FailSafe
        } else {
            OperatingMode::Normal
        },
    };

    let advertisement = Advertisement {
        id,
        name: Some(format!("Haversine {}", slot)),
        rssi: -50 - i16::from(slot) * 4,
        manufacturer_data: ManufacturerData {
            persistent_state_fingerprint: TagMetadataCodec::fingerprint_for(owner, 0xA5A5_0000 ^ u32::from(slot) << 8),
            truncated_collection_count: collections.len() as u8,
        },
    };

    SimulatedSatellite::new(advertisement, state, collections)
}

fn print_table(snapshot: &ManagerSnapshot, tallies: &HashMap<SatelliteId, Tally>) {
    println!("\n{}", "🛰️  Satellites".bright_blue().bold());
    println!(
        "{:<20} {:<14} {:>6} {:>6} {:>8}  {}",
        "ID".bright_white(),
        "STATE".bright_white(),
        "DONE".bright_white(),
        "FAIL".bright_white(),
        "PENDING".bright_white(),
        "SUMMARY".bright_white()
    );
    for satellite in &snapshot.satellites {
        let tally = tallies.get(&satellite.id).copied().unwrap_or_default();
        let state = if satellite.suppressed {
            "denied".red()
        } else if satellite.fail_safe {
            "fail-safe".yellow()
        } else if satellite.pending.is_empty() && tally.finished > 0 {
            "complete".green()
        } else {
            format!("{:?}", satellite.transfer_state).to_lowercase().white()
        };
        let pending = if satellite.pending.is_empty() {
            "0".green()
        } else {
            satellite.pending.len().to_string().yellow()
        };
        println!(
            "{:<20} {:<14} {:>6} {:>6} {:>8}  {}",
            satellite.id.to_string(),
            state,
            tally.finished,
            tally.failed,
            pending,
            satellite.summary
        );
    }
}
