//! BLE provisioning tool for StripAlerts devices
//!
//! Scans for StripAlerts devices and walks one through WiFi setup, the
//! connection test, the event endpoint and the final save.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use stripalerts_ble_controller::ble;
use stripalerts_ble_controller::{
    BleLink, ProvisioningConfig, ProvisioningWizard, Step, UiEvent, UserAction, WizardError,
};
use stripalerts_proto::{Network, ReassemblyMode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "stripalerts-ble")]
#[command(about = "BLE provisioning tool for StripAlerts devices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for StripAlerts devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Provision a device: WiFi credentials, connection test, endpoint, save
    Provision {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        /// WiFi network name
        #[arg(long)]
        ssid: Option<String>,
        /// WiFi password
        #[arg(long)]
        password: Option<String>,
        /// WiFi credentials file (SSID on line 1, password on line 2)
        #[arg(short, long, conflicts_with_all = ["ssid", "password"])]
        file: Option<PathBuf>,
        /// Event endpoint, e.g. https://api.example.com/events/<user>/<token>/
        #[arg(long)]
        api_url: Option<String>,
        /// Config file (defaults to $STRIPALERTS_CONFIG or the user config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Networks channel framing: direct or framed
        #[arg(long)]
        mode: Option<ReassemblyMode>,
        /// Save without asking for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { duration } => {
            scan_devices(duration).await?;
        }
        Commands::Provision {
            device,
            ssid,
            password,
            file,
            api_url,
            config,
            mode,
            yes,
        } => {
            let mut settings = ProvisioningConfig::discover(config.as_deref())?;
            if let Some(mode) = mode {
                settings.reassembly = mode;
            }
            let (ssid, password) = match file {
                Some(file) => {
                    let (ssid, password) = read_wifi_credentials(&file)?;
                    (Some(ssid), Some(password))
                }
                None => (ssid, password),
            };
            let answers = Answers {
                ssid,
                password,
                api_url,
                yes,
            };
            provision_device(device, settings, answers).await?;
        }
    }

    Ok(())
}

fn read_wifi_credentials(file: &Path) -> Result<(String, String), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(file)?;
    let mut lines = content.lines();
    let ssid = lines.next().ok_or("Missing SSID in credentials file")?.trim().to_string();
    let password = lines.next().ok_or("Missing password in credentials file")?.trim().to_string();
    Ok((ssid, password))
}

async fn scan_devices(duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    let prefix = stripalerts_proto::ble::DEVICE_NAME_PREFIX;
    println!("Scanning for StripAlerts devices ({} seconds)...", duration);

    let devices = ble::scan(std::time::Duration::from_secs(duration), prefix).await?;

    println!("\nFound {} devices:", devices.len());
    for scanned in devices {
        let device = scanned.device;
        let rssi = device.rssi.map(|r| format!("{} dBm", r)).unwrap_or_else(|| "N/A".to_string());
        let marker = if scanned.is_stripalerts { " [STRIPALERTS]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.address, rssi, marker);
    }
    Ok(())
}

/// Values given on the command line, used once before falling back to
/// interactive prompts.
struct Answers {
    ssid: Option<String>,
    password: Option<String>,
    api_url: Option<String>,
    yes: bool,
}

/// What the next line typed on stdin answers.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Prompt {
    /// A transport sequence is running.
    Waiting,
    Scan,
    Ssid,
    Password { ssid: String },
    Endpoint,
    Confirm,
}

struct Console {
    actions: Option<mpsc::UnboundedSender<UserAction>>,
    answers: Answers,
    networks: Vec<Network>,
    step: Step,
    prompt: Prompt,
}

impl Console {
    fn send(&mut self, action: UserAction) {
        let closed = match &self.actions {
            Some(actions) => actions.send(action).is_err(),
            None => false,
        };
        if closed {
            self.actions = None;
        }
    }

    fn quit(&mut self) {
        self.actions = None;
        self.prompt = Prompt::Waiting;
    }

    fn on_event(&mut self, event: UiEvent) {
        match event {
            UiEvent::StepChanged(step) => {
                self.step = step;
                match step {
                    Step::Wifi => println!("\nDevice ready. Choose a WiFi network."),
                    Step::Api => println!("\nWiFi connection test passed."),
                    Step::Confirm => println!("\nReady to save."),
                    _ => {}
                }
                self.ask();
            }
            UiEvent::NetworksUpdated(mut networks) => {
                networks.sort_by(|a, b| b.rssi.cmp(&a.rssi));
                println!("\nNetworks:");
                for (i, network) in networks.iter().enumerate() {
                    println!("  {:>2}. {} ({} dBm)", i + 1, network.ssid, network.rssi);
                }
                self.networks = networks;
                if self.prompt == Prompt::Ssid {
                    self.ask();
                }
            }
            UiEvent::StatusChanged(text) => log::info!("device status: {text}"),
            UiEvent::Busy(true) => self.prompt = Prompt::Waiting,
            UiEvent::Busy(false) => {}
            UiEvent::Error { step, error } => {
                eprintln!("Error: {error}");
                self.step = step;
                if matches!(error, WizardError::LinkUnavailable) {
                    self.quit();
                    return;
                }
                if error == WizardError::ReconnectFailed {
                    println!("Type 'scan' to reconnect.");
                }
                self.ask();
            }
            UiEvent::Completed => {
                println!("\nSaved! The device will restart and connect to WiFi.");
                self.quit();
            }
        }
    }

    /// Prompt for the current step, answering from the command line when a
    /// value was given there.
    fn ask(&mut self) {
        match self.step {
            Step::Device => {
                self.prompt = Prompt::Scan;
                println!("Press Enter to scan again, or 'q' to quit.");
            }
            Step::Wifi => {
                let given = (self.answers.ssid.take(), self.answers.password.take());
                if let (Some(ssid), Some(password)) = given {
                    println!("Testing WiFi {ssid:?}...");
                    self.prompt = Prompt::Waiting;
                    self.send(UserAction::SubmitWifi { ssid, password });
                    return;
                }
                self.prompt = Prompt::Ssid;
                println!("Network number or name ('rescan' to refresh):");
            }
            Step::Api => {
                if let Some(url) = self.answers.api_url.take() {
                    self.send(UserAction::SubmitEndpoint(url));
                    return;
                }
                self.prompt = Prompt::Endpoint;
                println!("Event endpoint URL ('back' to change WiFi):");
            }
            Step::Confirm => {
                if self.answers.yes {
                    self.answers.yes = false;
                    self.prompt = Prompt::Waiting;
                    self.send(UserAction::ConfirmSave);
                    return;
                }
                self.prompt = Prompt::Confirm;
                println!("Save configuration to the device? [y/N] ('back' to change endpoint)");
            }
            Step::Complete => self.prompt = Prompt::Waiting,
        }
    }

    fn on_line(&mut self, line: &str) {
        let line = line.trim();
        match line {
            "q" | "quit" => return self.quit(),
            // The prompt only changes once the wizard reports it is busy; a
            // scan it ignores leaves the current question open.
            "scan" => return self.send(UserAction::BeginScan),
            "back" if matches!(self.prompt, Prompt::Endpoint | Prompt::Confirm) => {
                return self.send(UserAction::GoBack);
            }
            _ => {}
        }

        match std::mem::replace(&mut self.prompt, Prompt::Waiting) {
            Prompt::Waiting => {
                log::debug!("busy, ignoring input");
            }
            Prompt::Scan => self.send(UserAction::BeginScan),
            Prompt::Ssid => match line {
                "" => self.prompt = Prompt::Ssid,
                "rescan" => {
                    self.prompt = Prompt::Ssid;
                    self.send(UserAction::RequestRescan);
                }
                _ => {
                    let ssid = match line.parse::<usize>() {
                        Ok(n) if (1..=self.networks.len()).contains(&n) => {
                            self.networks[n - 1].ssid.clone()
                        }
                        _ => line.to_string(),
                    };
                    println!("Password for {ssid:?}:");
                    self.prompt = Prompt::Password { ssid };
                }
            },
            Prompt::Password { ssid } => self.send(UserAction::SubmitWifi {
                ssid,
                password: line.to_string(),
            }),
            Prompt::Endpoint => self.send(UserAction::SubmitEndpoint(line.to_string())),
            Prompt::Confirm => match line {
                "y" | "yes" => self.send(UserAction::ConfirmSave),
                _ => {
                    println!("Not saved.");
                    self.ask();
                }
            },
        }
    }
}

async fn provision_device(
    target: Option<String>,
    config: ProvisioningConfig,
    answers: Answers,
) -> Result<(), Box<dyn std::error::Error>> {
    let link = BleLink::new(target, config.name_prefix.clone(), config.scan_duration());
    let (wizard, mut ui) = ProvisioningWizard::new(link, config);
    let (actions, actions_rx) = mpsc::unbounded_channel();
    let flow = tokio::spawn(wizard.run(actions_rx));

    let mut console = Console {
        actions: Some(actions),
        answers,
        networks: Vec::new(),
        step: Step::Device,
        prompt: Prompt::Waiting,
    };
    println!("Scanning for StripAlerts devices...");
    console.send(UserAction::BeginScan);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = ui.recv() => match event {
                Some(event) => console.on_event(event),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => console.on_line(&line),
                None => {
                    stdin_open = false;
                    console.quit();
                }
            },
        }
    }

    let state = flow.await?;
    if state.step != Step::Complete {
        return Err(format!("provisioning stopped at the {} step", state.step).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn console() -> (Console, mpsc::UnboundedReceiver<UserAction>) {
        let (actions, rx) = mpsc::unbounded_channel();
        let console = Console {
            actions: Some(actions),
            answers: Answers {
                ssid: None,
                password: None,
                api_url: None,
                yes: false,
            },
            networks: Vec::new(),
            step: Step::Device,
            prompt: Prompt::Waiting,
        };
        (console, rx)
    }

    #[test]
    fn network_is_picked_by_number() {
        let (mut console, mut rx) = console();
        console.on_event(UiEvent::NetworksUpdated(vec![
            Network { ssid: "Weak".into(), rssi: -80 },
            Network { ssid: "Home".into(), rssi: -40 },
        ]));
        console.on_event(UiEvent::StepChanged(Step::Wifi));
        console.on_line("1");
        console.on_line("secret123");
        assert_eq!(
            rx.try_recv().unwrap(),
            UserAction::SubmitWifi {
                ssid: "Home".into(),
                password: "secret123".into()
            }
        );
    }

    #[test]
    fn command_line_answers_are_used_once() {
        let (mut console, mut rx) = console();
        console.answers.api_url = Some("https://api.example.com/events/a/".into());
        console.on_event(UiEvent::StepChanged(Step::Api));
        assert_eq!(
            rx.try_recv().unwrap(),
            UserAction::SubmitEndpoint("https://api.example.com/events/a/".into())
        );

        console.on_event(UiEvent::Error {
            step: Step::Api,
            error: WizardError::Validation(
                stripalerts_ble_controller::ValidationError::MissingSegment("/events/"),
            ),
        });
        assert_eq!(console.prompt, Prompt::Endpoint);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn back_and_quit() {
        let (mut console, mut rx) = console();
        console.on_event(UiEvent::StepChanged(Step::Confirm));
        console.on_line("back");
        assert_eq!(rx.try_recv().unwrap(), UserAction::GoBack);
        console.on_line("q");
        assert!(console.actions.is_none());
    }

    #[test]
    fn ignored_scan_keeps_the_prompt() {
        let (mut console, mut rx) = console();
        console.on_event(UiEvent::NetworksUpdated(vec![Network {
            ssid: "Home".into(),
            rssi: -40,
        }]));
        console.on_event(UiEvent::StepChanged(Step::Wifi));
        console.on_line("scan");
        assert_eq!(rx.try_recv().unwrap(), UserAction::BeginScan);
        assert_eq!(console.prompt, Prompt::Ssid);

        console.on_line("1");
        assert_eq!(console.prompt, Prompt::Password { ssid: "Home".into() });

        // An accepted scan blocks input until the wizard answers.
        console.on_event(UiEvent::Busy(true));
        console.on_line("secret123");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn credentials_file() {
        let path = std::env::temp_dir().join("stripalerts-ble-credentials-test.txt");
        std::fs::write(&path, "Home\nsecret123\n").unwrap();
        let (ssid, password) = read_wifi_credentials(&path).unwrap();
        assert_eq!(ssid, "Home");
        assert_eq!(password, "secret123");
        let _ = std::fs::remove_file(&path);
    }
}
