/*!
 * wallpad command line.
 *
 * `wallpad run` starts the gateway. The other commands work offline on the
 * packet table: decode a frame by hand, encode a command, print the
 * effective structure table or configuration. `wallpad scan` listens to the
 * bus once and records which devices answered.
 */
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use wallpad_core::config::{ConfigBuilder, GatewayConfig};
use wallpad_core::logging;
use wallpad_engine::{scan_bus, BridgeTopics, Gateway, MqttLink};
use wallpad_protocol::{
    analyze, derive, hex_byte, Codec, CodecOptions, FieldValue, FieldValues, FoundDevices, PacketType, Registry,
    SharedRegistry,
};

/// Commax wallpad gateway
#[derive(Parser, Debug)]
#[command(name = "wallpad", author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, default_value = "wallpad.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway until interrupted
    Run {
        /// Scan the bus again even when a device list exists
        #[arg(long)]
        rescan: bool,

        /// Scan window in seconds
        #[arg(long, default_value_t = 20)]
        scan_secs: u64,
    },

    /// Listen to the bus and save the devices found
    Scan {
        /// Scan window in seconds
        #[arg(long, default_value_t = 20)]
        secs: u64,
    },

    /// Explain a packet byte by byte
    Decode {
        /// Hex text, 7 bytes (checksum computed) or 8 bytes
        packet: String,

        /// Force a packet type instead of classifying by header
        #[arg(long = "type")]
        packet_type: Option<String>,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Encode a packet from field values
    Encode {
        /// Device name, e.g. Light
        device: String,

        /// Field values as name=value, e.g. deviceId=1 power=on
        values: Vec<String>,

        /// Packet type to encode
        #[arg(long = "type", default_value = "command")]
        packet_type: String,
    },

    /// Print the effective packet structure table as YAML
    Table,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ConfigBuilder::new()
        .with_config_file(&args.config)
        .with_environment_prefix("WALLPAD")
        .build()
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    logging::init_from_config(&config.logging)?;

    match args.command {
        Command::Run { rescan, scan_secs } => run(config, rescan, Duration::from_secs(scan_secs)).await,
        Command::Scan { secs } => scan(config, Duration::from_secs(secs)).await,
        Command::Decode {
            packet,
            packet_type,
            json,
        } => decode(&config, &packet, packet_type.as_deref(), json),
        Command::Encode {
            device,
            values,
            packet_type,
        } => encode(&config, &device, &values, &packet_type),
        Command::Table => {
            let registry = Registry::from_config(&config)?;
            print!("{}", registry.document().to_yaml_string()?);
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn codec(config: &GatewayConfig) -> Result<Codec> {
    let registry = Registry::from_config(config)?;
    Ok(Codec::new(Arc::new(registry), CodecOptions::from_config(config)))
}

async fn run(config: GatewayConfig, rescan: bool, window: Duration) -> Result<()> {
    info!("Starting wallpad gateway {}", wallpad_engine::VERSION);
    let registry = SharedRegistry::new(Registry::from_config(&config)?);
    let (link, mut inbound) = MqttLink::connect(&config.mqtt);
    let link = Arc::new(link);

    let found_path = config.found_devices_path();
    let stored = if rescan { None } else { FoundDevices::load(&found_path)? };
    let found = match stored {
        Some(found) => {
            info!("Loaded {} devices from {}", found.len(), found_path.display());
            found
        }
        None => {
            let codec = Codec::new(registry.snapshot()?, CodecOptions::from_config(&config));
            let topics = BridgeTopics::new(&config.mqtt.bridge_topic);
            let found = scan_bus(&codec, link.as_ref(), &topics, &mut inbound, window).await?;
            if found.is_empty() {
                warn!("No devices answered during the scan");
            } else {
                found.save(&found_path)?;
            }
            found
        }
    };

    let gateway = Arc::new(Gateway::new(config, registry, link.clone()));
    gateway.start(inbound).await?;
    gateway.publish_discovery(&found).await?;

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    info!("Shutting down");
    gateway.stop().await?;
    link.disconnect().await?;
    Ok(())
}

async fn scan(config: GatewayConfig, window: Duration) -> Result<()> {
    let codec = codec(&config)?;
    let (link, mut inbound) = MqttLink::connect(&config.mqtt);
    let topics = BridgeTopics::new(&config.mqtt.bridge_topic);

    let found = scan_bus(&codec, &link, &topics, &mut inbound, window).await?;
    link.disconnect().await?;

    for (name, device) in found.iter() {
        println!("{}: {}", name, serde_json::to_string(device)?);
    }
    let path = config.found_devices_path();
    found.save(&path)?;
    println!("Saved {} devices to {}", found.len(), path.display());
    Ok(())
}

fn decode(config: &GatewayConfig, text: &str, packet_type: Option<&str>, json: bool) -> Result<()> {
    let codec = codec(config)?;
    let packet_type = packet_type.map(str::parse::<PacketType>).transpose()?;
    let preview = analyze(&codec, text, packet_type, Default::default())?;
    // Confirmation source can be configured per device
    let analysis = match config.queue.confirm_with.get(&preview.device) {
        Some(source) => analyze(&codec, text, packet_type, *source)?,
        None => preview,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
        return Ok(());
    }

    println!("{}  {} {}", analysis.packet, analysis.device, analysis.packet_type);
    if !analysis.checksum_ok {
        println!("checksum mismatch, expected {}", hex_byte(analysis.expected_checksum));
    }
    for note in &analysis.bytes {
        println!("  {}", note);
    }
    if let Some(expected) = &analysis.expected {
        println!("expected state:");
        for pattern in &expected.alternatives {
            println!("  {}", pattern);
        }
    }
    Ok(())
}

fn encode(config: &GatewayConfig, device: &str, values: &[String], packet_type: &str) -> Result<()> {
    let codec = codec(config)?;
    let packet_type: PacketType = packet_type.parse()?;
    let values = parse_values(values)?;

    let packet = codec.encode(device, packet_type, &values)?;
    println!("{}", packet.to_hex());
    if packet_type == PacketType::Command {
        let expected = derive(&codec, &packet, config.confirm_source(device))?;
        for pattern in &expected.alternatives {
            println!("  expect {}", pattern);
        }
    }
    Ok(())
}

fn parse_values(pairs: &[String]) -> Result<FieldValues> {
    let mut values = FieldValues::new();
    for pair in pairs {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("Expected name=value, got '{}'", pair);
        };
        let value = match value.parse::<i64>() {
            Ok(number) => FieldValue::Number(number),
            Err(_) => FieldValue::symbol(value),
        };
        values.insert(name.to_string(), value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["wallpad", "encode", "Light", "deviceId=1", "power=on"]).unwrap();
        match args.command {
            Command::Encode {
                device,
                values,
                packet_type,
            } => {
                assert_eq!(device, "Light");
                assert_eq!(values, vec!["deviceId=1", "power=on"]);
                assert_eq!(packet_type, "command");
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(args.config, PathBuf::from("wallpad.toml"));
    }

    #[test]
    fn test_parse_values() {
        let values = parse_values(&["deviceId=2".to_string(), "power=on".to_string()]).unwrap();
        assert_eq!(values.get("deviceId"), Some(&FieldValue::Number(2)));
        assert_eq!(values.get("power"), Some(&FieldValue::symbol("on")));
        assert!(parse_values(&["power".to_string()]).is_err());
    }

    #[test]
    fn test_encode_light_command() {
        let codec = codec(&GatewayConfig::default()).unwrap();
        let values = parse_values(&["deviceId=1".to_string(), "power=on".to_string()]).unwrap();
        let packet = codec.encode("Light", PacketType::Command, &values).unwrap();
        assert_eq!(packet.to_hex(), "3101010000000033");
    }
}
