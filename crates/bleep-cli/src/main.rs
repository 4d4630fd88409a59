//! # bleep
//!
//! Connects to one Bluetooth Low Energy device, resolves its GATT database,
//! runs one enumeration pass and prints the report as JSON on stdout.
//!
//! ## Running
//!
//! ```bash
//! bleep AA:BB:CC:DD:EE:FF            # configured default mode
//! bleep AA:BB:CC:DD:EE:FF naggy      # repeated reads
//! bleep AA:BB:CC:DD:EE:FF pokey --monitor
//! BLEEP_BRUTE_CHARACTERISTIC=2a06 bleep AA:BB:CC:DD:EE:FF bruteforce
//! ```
//!
//! # Environment Variables
//!
//! - `BLEEP_TARGET`: target address when none is given on the command line
//! - `BLEEP_MODE`: enumeration mode when none is given on the command line
//! - `BLEEP_BRUTE_CHARACTERISTIC`: bruteforce target (full or 16-bit UUID)
//! - `BLEEP_BRUTE_RANGE`: bruteforce value range such as `0x00-0x1f`
//! - `BLEEP_BRUTE_PATTERNS`: comma-separated payload patterns
//! - `BLEEP_BRUTE_FILE`: file whose contents form one more payload
//! - `BLEEP_CONFIG`: configuration file path
//! - `BLEEP_ENV`: `production` for JSON file logging
//! - `BLEEP_LOG_LEVEL` / `RUST_LOG`: log filter (default: info)

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bleep_core::types::uuid_from_u16;
use bleep_core::{
    build_payload_iterator, enumerate, BleepConfig, BruteforcePlan, ChannelSink,
    CharacteristicSink, ConnectOptions, ConnectOutcome, ConnectionEngine, DeviceAddress,
    EnumerationConfig, EnumerationMode, EnumerationOptions, EnumerationReport,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod logging;

/// Environment variable names
mod env_vars {
    pub const TARGET: &str = "BLEEP_TARGET";
    pub const MODE: &str = "BLEEP_MODE";
    pub const ENV: &str = "BLEEP_ENV";
    pub const LOG_LEVEL: &str = "BLEEP_LOG_LEVEL";
    pub const BRUTE_CHARACTERISTIC: &str = "BLEEP_BRUTE_CHARACTERISTIC";
    pub const BRUTE_RANGE: &str = "BLEEP_BRUTE_RANGE";
    pub const BRUTE_PATTERNS: &str = "BLEEP_BRUTE_PATTERNS";
    pub const BRUTE_FILE: &str = "BLEEP_BRUTE_FILE";
}

/// Patterns used when bruteforce is requested without any payload source.
const DEFAULT_BRUTE_PATTERNS: [&str; 3] = ["inc", "alt", "ascii"];

const USAGE: &str = "usage: bleep [ADDRESS] [passive|naggy|pokey|bruteforce] [--monitor] [--deep]";

/// What one run should do.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    target: String,
    mode: Option<String>,
    monitor: bool,
    deep: bool,
}

impl Invocation {
    /// Positional arguments win over the environment.
    fn parse<I, F>(args: I, env: F) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
        F: Fn(&str) -> Option<String>,
    {
        let mut positional = Vec::new();
        let mut monitor = false;
        let mut deep = false;
        for arg in args {
            match arg.as_str() {
                "--monitor" => monitor = true,
                "--deep" => deep = true,
                flag if flag.starts_with('-') => bail!("unknown option {flag}\n{USAGE}"),
                _ => positional.push(arg),
            }
        }
        if positional.len() > 2 {
            bail!("too many arguments\n{USAGE}");
        }

        let mut positional = positional.into_iter();
        let Some(target) = positional.next().or_else(|| env(env_vars::TARGET)) else {
            bail!("no target address given and {} is not set\n{USAGE}", env_vars::TARGET);
        };
        let mode = positional.next().or_else(|| env(env_vars::MODE));
        Ok(Self {
            target,
            mode,
            monitor,
            deep,
        })
    }
}

/// Resolves the enumeration mode, falling back to the configured default.
fn enumeration_mode<F>(
    name: Option<&str>,
    config: &EnumerationConfig,
    env: F,
) -> Result<EnumerationMode>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(name) = name else {
        return Ok(config.mode()?);
    };
    if name.trim().eq_ignore_ascii_case("bruteforce") {
        return Ok(EnumerationMode::Bruteforce(bruteforce_plan(config, env)?));
    }
    let named = EnumerationConfig {
        mode: name.to_string(),
        ..config.clone()
    };
    Ok(named.mode()?)
}

fn bruteforce_plan<F>(config: &EnumerationConfig, env: F) -> Result<BruteforcePlan>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(characteristic) = env(env_vars::BRUTE_CHARACTERISTIC) else {
        bail!("bruteforce needs {}", env_vars::BRUTE_CHARACTERISTIC);
    };
    let characteristic = characteristic.trim();
    let characteristic = if characteristic.len() == 4 {
        u16::from_str_radix(characteristic, 16).map(uuid_from_u16)?
    } else {
        characteristic
            .parse()
            .with_context(|| format!("invalid characteristic UUID {characteristic}"))?
    };

    let range = env(env_vars::BRUTE_RANGE)
        .map(|spec| parse_range(&spec))
        .transpose()?;
    let file = env(env_vars::BRUTE_FILE)
        .map(|path| std::fs::read(&path).with_context(|| format!("failed to read {path}")))
        .transpose()?;
    let mut patterns: Vec<String> = env(env_vars::BRUTE_PATTERNS)
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if range.is_none() && file.is_none() && patterns.is_empty() {
        patterns = DEFAULT_BRUTE_PATTERNS.iter().map(ToString::to_string).collect();
    }

    let payloads = build_payload_iterator(range, &patterns, file.as_deref());
    if payloads.is_empty() {
        bail!("bruteforce payload list is empty");
    }
    Ok(config.apply_to(BruteforcePlan::new(characteristic, payloads)))
}

/// Parses `lo-hi` with decimal or `0x` hex bounds.
fn parse_range(spec: &str) -> Result<(u8, u8)> {
    let Some((lo, hi)) = spec.split_once('-') else {
        bail!("invalid range {spec}, expected lo-hi");
    };
    Ok((parse_byte(lo)?, parse_byte(hi)?))
}

fn parse_byte(value: &str) -> Result<u8> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.with_context(|| format!("invalid byte value {value}"))
}

#[derive(Serialize)]
struct RunSummary<'a> {
    address: DeviceAddress,
    adapter: &'a str,
    connect_attempts: u32,
    report: &'a EnumerationReport,
}

#[cfg(feature = "bluetooth")]
async fn engine(config: &BleepConfig, _target: &str) -> Result<ConnectionEngine> {
    let (gateway, agent) = bleep_core::bluetooth::open(config.connection.adapter.as_deref())
        .await
        .context("failed to open Bluetooth adapter")?;
    Ok(ConnectionEngine::new(Arc::new(gateway), Arc::new(agent))
        .with_config(config.connection.clone())
        .with_monitor_config(config.monitor))
}

/// Simulated device for exercising the pipeline without hardware.
#[cfg(all(not(feature = "bluetooth"), feature = "mock-bluetooth"))]
#[allow(clippy::unused_async)]
async fn engine(config: &BleepConfig, target: &str) -> Result<ConnectionEngine> {
    use bleep_core::{AdapterReadiness, MockAdapter, MockPairingAgent, MockTransport};

    warn!("Built with the mock backend, no radio traffic will be sent");
    let device = Arc::new(MockTransport::new(target.parse()?));
    let battery = uuid_from_u16(0x180F);
    device.add_characteristic(battery, uuid_from_u16(0x2A19), &["read", "notify"], &[0x64]);
    let device_info = uuid_from_u16(0x180A);
    device.add_characteristic(device_info, uuid_from_u16(0x2A29), &["read"], b"BLEEP");
    device.add_characteristic(device_info, uuid_from_u16(0x2A06), &["write-without-response"], &[]);

    let adapter = Arc::new(MockAdapter::new(AdapterReadiness::Ready));
    adapter.add_device(device, Some(1));
    Ok(ConnectionEngine::new(adapter, Arc::new(MockPairingAgent::default()))
        .with_config(config.connection.clone())
        .with_monitor_config(config.monitor))
}

#[cfg(not(any(feature = "bluetooth", feature = "mock-bluetooth")))]
#[allow(clippy::unused_async)]
async fn engine(_config: &BleepConfig, _target: &str) -> Result<ConnectionEngine> {
    bail!("built without a Bluetooth backend, rebuild with --features bluetooth")
}

/// Connects to `target` and runs one enumeration pass over its mapping.
///
/// Rules-of-engagement hints only come from earlier runs. The maps produced
/// by this run's own resolution are reported, never fed back as hints.
async fn connect_and_enumerate(
    engine: &ConnectionEngine,
    target: &str,
    options: ConnectOptions,
    mode: &EnumerationMode,
    sink: Option<Arc<dyn CharacteristicSink>>,
) -> Result<(ConnectOutcome, EnumerationReport)> {
    let outcome = engine.connect(target, options).await?;
    let enumeration = EnumerationOptions {
        landmine_hint: None,
        permission_hint: None,
        sink,
    };
    let report = enumerate(
        outcome.session.handle(),
        Some(&outcome.mapping),
        mode,
        &enumeration,
    )
    .await?;
    Ok((outcome, report))
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_profile = std::env::var(env_vars::ENV).ok();
    logging::init(logging::LogProfile::from_env_value(env_profile.as_deref()))?;

    let env = |key: &str| std::env::var(key).ok();
    let invocation = Invocation::parse(std::env::args().skip(1), env)?;
    let config = BleepConfig::load().context("failed to load configuration")?;
    let mode = enumeration_mode(invocation.mode.as_deref(), &config.enumeration, env)?;
    info!(target_address = %invocation.target, %mode, "Starting bleep");

    let engine = engine(&config, &invocation.target).await?;

    let (sink, mut events) = ChannelSink::channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(uuid = %event.uuid(), ?event, "Characteristic event");
        }
    });

    let monitoring = invocation.monitor || config.connection.enable_monitoring;
    let (reconnect_tx, mut reconnects) = mpsc::unbounded_channel();
    let options = ConnectOptions {
        enable_monitoring: monitoring,
        deep_enumeration: invocation.deep || config.connection.deep_enumeration,
        on_reconnect: monitoring.then_some(reconnect_tx),
        sink: Some(Arc::new(sink.clone())),
        ..ConnectOptions::from_config(&config.connection)
    };
    let (mut outcome, report) = connect_and_enumerate(
        &engine,
        &invocation.target,
        options,
        &mode,
        Some(Arc::new(sink)),
    )
    .await?;

    let summary = RunSummary {
        address: outcome.session.address(),
        adapter: outcome.session.adapter_id(),
        connect_attempts: outcome.session.connect_attempts(),
        report: &report,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if monitoring {
        info!("Monitoring connection, press Ctrl-C to stop");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                Some(result) = reconnects.recv() => {
                    if result.success {
                        info!(attempts = result.attempts, "{}", result.message);
                    } else {
                        warn!(attempts = result.attempts, "{}", result.message);
                    }
                }
            }
        }
    }

    if let Err(e) = outcome.session.disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bleep_core::types::Payload;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_positional_arguments_win() {
        let env = env_from(&[(env_vars::TARGET, "11:22:33:44:55:66"), (env_vars::MODE, "pokey")]);
        let invocation =
            Invocation::parse(args(&["AA:BB:CC:DD:EE:FF", "naggy", "--monitor"]), env).unwrap();
        assert_eq!(invocation.target, "AA:BB:CC:DD:EE:FF");
        assert_eq!(invocation.mode.as_deref(), Some("naggy"));
        assert!(invocation.monitor);
        assert!(!invocation.deep);
    }

    #[test]
    fn test_environment_fallback() {
        let env = env_from(&[(env_vars::TARGET, "11:22:33:44:55:66")]);
        let invocation = Invocation::parse(args(&["--deep"]), env).unwrap();
        assert_eq!(invocation.target, "11:22:33:44:55:66");
        assert_eq!(invocation.mode, None);
        assert!(invocation.deep);
    }

    #[test]
    fn test_missing_target_and_bad_flags() {
        assert!(Invocation::parse(args(&[]), env_from(&[])).is_err());
        assert!(Invocation::parse(args(&["AA:BB:CC:DD:EE:FF", "--loud"]), env_from(&[])).is_err());
        assert!(Invocation::parse(args(&["a", "b", "c"]), env_from(&[])).is_err());
    }

    #[test]
    fn test_named_mode_uses_configured_timing() {
        let config = EnumerationConfig {
            naggy_rounds: 7,
            ..EnumerationConfig::default()
        };
        let mode = enumeration_mode(Some("naggy"), &config, env_from(&[])).unwrap();
        assert!(matches!(mode, EnumerationMode::Naggy { rounds: 7, .. }));

        let mode = enumeration_mode(None, &config, env_from(&[])).unwrap();
        assert_eq!(mode, EnumerationMode::Passive);

        assert!(enumeration_mode(Some("loud"), &config, env_from(&[])).is_err());
    }

    #[test]
    fn test_bruteforce_needs_a_target() {
        let err = enumeration_mode(Some("bruteforce"), &EnumerationConfig::default(), env_from(&[]));
        assert!(err.is_err());
    }

    #[test]
    fn test_bruteforce_plan_from_environment() {
        let env = env_from(&[
            (env_vars::BRUTE_CHARACTERISTIC, "2a06"),
            (env_vars::BRUTE_RANGE, "0x00-0x02"),
            (env_vars::BRUTE_PATTERNS, "alt, hex:beef"),
        ]);
        let mode = enumeration_mode(Some("bruteforce"), &EnumerationConfig::default(), env).unwrap();
        let EnumerationMode::Bruteforce(plan) = mode else {
            panic!("expected bruteforce, got {mode:?}");
        };
        assert_eq!(plan.characteristic, uuid_from_u16(0x2A06));
        let expected: Vec<Payload> = [
            vec![0x00],
            vec![0x01],
            vec![0x02],
            vec![0xAA],
            vec![0x55],
            vec![0xBE, 0xEF],
        ]
        .into_iter()
        .map(Payload::new)
        .collect();
        assert_eq!(plan.payloads, expected);
        assert!(plan.respect_roe);
    }

    #[test]
    fn test_bruteforce_file_payload() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xDE, 0xAD]).unwrap();
        let path = file.path().to_string_lossy().into_owned();
        let env = env_from(&[
            (env_vars::BRUTE_CHARACTERISTIC, "0000fff1-0000-1000-8000-00805f9b34fb"),
            (env_vars::BRUTE_FILE, path.as_str()),
        ]);
        let plan = bruteforce_plan(&EnumerationConfig::default(), env).unwrap();
        assert_eq!(plan.payloads, vec![Payload::new(vec![0xDE, 0xAD])]);
        assert_eq!(plan.characteristic, uuid_from_u16(0xFFF1));
    }

    #[test]
    fn test_bruteforce_default_patterns() {
        let env = env_from(&[(env_vars::BRUTE_CHARACTERISTIC, "2a06")]);
        let plan = bruteforce_plan(&EnumerationConfig::default(), env).unwrap();
        assert_eq!(plan.payloads.first(), Some(&Payload::new(vec![0x00])));
        assert!(plan.payloads.len() > 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bruteforce_writes_after_connect() {
        use bleep_core::{AdapterReadiness, MockAdapter, MockPairingAgent, MockTransport};

        let target = "AA:BB:CC:DD:EE:42";
        let control = uuid_from_u16(0x2A06);
        let device = Arc::new(MockTransport::new(target.parse().unwrap()));
        device.add_characteristic(uuid_from_u16(0x180A), control, &["write-without-response"], &[]);
        let adapter = Arc::new(MockAdapter::new(AdapterReadiness::Ready));
        adapter.add_device(Arc::clone(&device), Some(1));
        let engine = ConnectionEngine::new(adapter, Arc::new(MockPairingAgent::default()));
        let plan = BruteforcePlan::new(control, vec![Payload::new(vec![0x01]), Payload::new(vec![0x02])]);

        let (outcome, report) = connect_and_enumerate(
            &engine,
            target,
            ConnectOptions::default(),
            &EnumerationMode::Bruteforce(plan),
            None,
        )
        .await
        .unwrap();

        // Resolution maps every characteristic, the target included.
        assert!(outcome.landmines.contains_key(&control));
        let results = report.side_effects.bruteforce.as_ref().unwrap();
        assert!(!results.is_skipped());
        assert_eq!(results.len(), 2);
        assert_eq!(
            device.write_calls(),
            vec![(control, vec![0x01]), (control, vec![0x02])]
        );
        assert_eq!(report.side_effects.writes, 2);
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("0x10-0x1F").unwrap(), (0x10, 0x1F));
        assert_eq!(parse_range("1-3").unwrap(), (1, 3));
        assert!(parse_range("0x10").is_err());
        assert!(parse_range("0-256").is_err());
    }
}
