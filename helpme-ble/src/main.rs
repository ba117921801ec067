//! BLE provisioning tool for HelpMe alarm devices
//!
//! Finds the alarm over BLE, sends it Wi-Fi credentials, waits for it to
//! join the network and registers it with the account backend.

mod account;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use helpme_api::{ApiClient, DEFAULT_API_BASE, Device, SessionStore, UserInfo};
use helpme_ble_controller::{BtleplugBackend, ProvisionConfig, Provisioner, Report, StatusSink};
use helpme_proto::ble::TARGET_DEVICE_NAME;

#[derive(Parser)]
#[command(name = "helpme-ble")]
#[command(about = "BLE provisioning tool for HelpMe alarm devices")]
struct Cli {
    /// Account backend
    #[arg(long, global = true, env = "HELPME_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby BLE devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Send Wi-Fi credentials to an alarm and register it
    Provision {
        /// WiFi credentials file (SSID on line 1, password on line 2)
        #[arg(short, long, default_value = "wifi_credentials.txt")]
        file: String,
        /// WiFi network name, instead of reading the file
        #[arg(long, requires = "password")]
        ssid: Option<String>,
        #[arg(long, requires = "ssid")]
        password: Option<String>,
        /// Advertised name of the alarm
        #[arg(long, default_value = TARGET_DEVICE_NAME)]
        target: String,
    },
    /// List devices registered to the account
    Devices,
    /// Store an API token
    Login {
        #[arg(long)]
        token: String,
        #[arg(long)]
        nickname: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },
    /// Forget the stored token
    Logout,
    /// Show the stored session
    Whoami,
}

struct Console;

impl StatusSink for Console {
    fn report(&mut self, report: &Report) {
        match report {
            Report::Progress(message) => println!("{message}"),
            Report::Done(message) => println!("Done: {message}"),
            Report::Failed(error) => eprintln!("Failed: {error}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let client = ApiClient::new(&cli.api_base);
    let session = SessionStore::open_default()?;

    match cli.command {
        Commands::Scan { duration } => {
            scan_devices(duration).await?;
        }
        Commands::Provision {
            file,
            ssid,
            password,
            target,
        } => {
            let (ssid, password) = match (ssid, password) {
                (Some(ssid), Some(password)) => (ssid, password),
                _ => read_wifi_credentials(&file)?,
            };
            let config = ProvisionConfig {
                target_name: target,
                ..ProvisionConfig::default()
            };
            provision_device(client, &session, config, &ssid, &password).await?;
        }
        Commands::Devices => {
            let token = session.valid_token()?;
            if token.is_none() {
                eprintln!("Not logged in, run `helpme-ble login --token <TOKEN>`");
            }
            let devices = client.list_devices(token.as_deref()).await?;
            print_devices(&devices);
        }
        Commands::Login {
            token,
            nickname,
            phone,
        } => {
            session.set_token(token.trim())?;
            if let Some(nickname) = nickname {
                session.set_user(UserInfo {
                    nickname,
                    phone: phone.unwrap_or_default(),
                    country_code: None,
                    phone_number: None,
                    extra: Default::default(),
                })?;
            }
            println!("Logged in, session stored at {}", session.path().display());
        }
        Commands::Logout => {
            session.clear()?;
            println!("Logged out");
        }
        Commands::Whoami => {
            if !session.is_logged_in()? {
                println!("Not logged in");
                return Ok(());
            }
            match session.user()? {
                Some(user) => println!("{} ({})", user.nickname, user.phone),
                None => println!("Logged in"),
            }
            if let Some(expires) = session.expires_at()? {
                let left = expires
                    .duration_since(std::time::SystemTime::now())
                    .unwrap_or_default();
                println!("Session expires in {} hours", left.as_secs() / 3600);
            }
        }
    }

    Ok(())
}

fn read_wifi_credentials(file: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| format!("failed to read {file}: {e}"))?;
    parse_wifi_credentials(&content)
}

fn parse_wifi_credentials(content: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    let mut lines = content.lines();
    let ssid = lines.next().ok_or("Missing SSID in credentials file")?.trim().to_string();
    let password = lines.next().ok_or("Missing password in credentials file")?.trim().to_string();
    Ok((ssid, password))
}

async fn scan_devices(duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for devices ({duration} seconds)...");

    let devices = helpme_ble_controller::ble::scan(Duration::from_secs(duration), TARGET_DEVICE_NAME).await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device.rssi.map(|r| format!("{r} dBm")).unwrap_or_else(|| "N/A".to_string());
        let marker = if device.is_target { " [ALARM]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.address, rssi, marker);
    }
    Ok(())
}

async fn provision_device(
    client: ApiClient,
    session: &SessionStore,
    config: ProvisionConfig,
    ssid: &str,
    password: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let token = session.valid_token()?;
    if token.is_none() {
        eprintln!("Not logged in, the device will be registered without a token");
    }

    let mut provisioner = Provisioner::new(
        Arc::new(BtleplugBackend::new()),
        account::ApiRegistry::new(client, token),
        Console,
        config,
    );

    println!("Provisioning {ssid:?}, press Ctrl-C to cancel");
    provisioner.start(ssid, password).await?;

    let outcome = tokio::select! {
        outcome = provisioner.run() => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        Some(outcome) => {
            outcome?;
            Ok(())
        }
        None => {
            log::info!("cancelled in {:?}", provisioner.state().kind());
            provisioner.reset().await;
            Err("cancelled".into())
        }
    }
}

pub(crate) fn print_devices(devices: &[Device]) {
    if devices.is_empty() {
        println!("No devices");
        return;
    }
    println!("{} devices:", devices.len());
    for device in devices {
        let location = device.location.as_deref().unwrap_or("-");
        let shared = if device.shared_to.is_empty() {
            String::new()
        } else {
            format!(", shared with {}", device.shared_to.len())
        };
        println!(
            "  {} [{}] type {} status {} at {}, {} active alarms{}",
            device.display_name(),
            device.id,
            device.device_type_id,
            device.status,
            location,
            device.active_alarm_count,
            shared
        );
    }
}
