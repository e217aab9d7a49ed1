//! comterm - A serial port terminal for Windows
//!
//! comterm talks to a device on a COM port and displays what it sends,
//! interpreting a small set of escape codes for cursor positioning and
//! clearing. Keystrokes are sent to the device as they are typed.
//!
//! # Quick Start
//!
//! ```text
//! comterm                 # Settings from ~/.comterm/config.toml
//! comterm -p 3 -b 115200  # COM3 at 115200 baud
//! comterm --demo          # Run the demo without a serial port
//! ```
//!
//! # Keys
//!
//! | Key | Action |
//! |-----|--------|
//! | F2 | Open/close the port |
//! | F3 | Toggle UNIX/DOS CR/LF |
//! | F4 | Clear screen |
//! | F5 | Save screen to ~/.comterm/screen.txt |
//! | F10 | Quit |

mod config;
mod core;
mod ui;

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossterm::event::{self, Event};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::core::serial::{self, sim::SimulatedOpener, PortSettings};
use crate::core::session::{Activity, Session};
use crate::ui::{DebugRenderer, KeyAction, KeyMapper, Renderer};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long the Rx/Tx indicators stay lit after traffic
const LED_HOLD: Duration = Duration::from_millis(100);

/// Command line overrides
#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    port: Option<u8>,
    baud: Option<u32>,
    flow: bool,
    crlf: bool,
    open: bool,
    demo: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run(Args),
    Help,
    Version,
}

impl Args {
    /// Layer the command line on top of the config file
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.serial.port = port;
        }
        if let Some(baud) = self.baud {
            config.serial.baud = baud;
        }
        if self.flow {
            config.serial.hardware_flow_control = true;
        }
        if self.crlf {
            config.terminal.crlf = true;
        }
        if self.open {
            config.serial.open_on_start = true;
        }
    }
}

fn print_version() {
    eprintln!("comterm {}", VERSION);
}

fn print_help() {
    eprintln!("comterm {} - A serial port terminal", VERSION);
    eprintln!();
    eprintln!("Usage: comterm [OPTIONS]");
    eprintln!();
    eprintln!("Serial options:");
    eprintln!("  -p, --port <N>        COM port number (1-{})", serial::MAX_PORT);
    eprintln!("  -b, --baud <RATE>     Baud rate: 300, 2400, 4800, 9600, 19200,");
    eprintln!("                        38400, 57600, 115200");
    eprintln!("  -f, --flow            Hardware (CTS) flow control");
    eprintln!("  -o, --open            Open the port on start");
    eprintln!();
    eprintln!("Terminal options:");
    eprintln!("  --crlf                Treat LF as CR+LF (UNIX line endings)");
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  --demo                Run the demo with a simulated port");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Keys:");
    eprintln!("  F2                    Open/close the serial port");
    eprintln!("  F3                    Toggle UNIX/DOS CR/LF");
    eprintln!("  F4                    Clear screen");
    eprintln!("  F5                    Save screen to ~/.comterm/screen.txt");
    eprintln!("  F10                   Quit");
    eprintln!();
    eprintln!("Configuration: ~/.comterm/config.toml");
    eprintln!("Log file:      ~/.comterm/comterm.log (level from COMTERM_LOG)");
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut parsed = Args::default();
    let mut i = 1;

    fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
        args.get(i)
            .map(String::as_str)
            .ok_or_else(|| format!("Missing value for {}", flag))
    }

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "--version" => return Ok(Command::Version),
            "-p" | "--port" => {
                i += 1;
                let raw = value(args, i, "--port")?;
                let port = raw
                    .trim_start_matches("COM")
                    .parse::<u8>()
                    .map_err(|_| format!("Invalid port: {}", raw))?;
                parsed.port = Some(port);
            }
            "-b" | "--baud" => {
                i += 1;
                let raw = value(args, i, "--baud")?;
                let baud = raw
                    .parse::<u32>()
                    .map_err(|_| format!("Invalid baud rate: {}", raw))?;
                parsed.baud = Some(baud);
            }
            "-f" | "--flow" => parsed.flow = true,
            "--crlf" => parsed.crlf = true,
            "-o" | "--open" => parsed.open = true,
            "--demo" => parsed.demo = true,
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(Command::Run(parsed))
}

/// Log to `~/.comterm/comterm.log`; the console belongs to the renderer
fn init_logging() {
    let Some(dir) = config::config_dir() else {
        return;
    };
    let _ = std::fs::create_dir_all(&dir);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("comterm.log"))
        .ok();

    if let Some(file) = log_file {
        let filter =
            EnvFilter::try_from_env("COMTERM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = env::args().collect();
    let args = match parse_args(&argv) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Command::Version) => {
            print_version();
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    init_logging();
    info!("comterm {} starting...", VERSION);

    let mut config = Config::load();
    args.apply(&mut config);

    if let Err(e) = config.serial.port_settings().validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if args.demo || cfg!(not(windows)) {
        if !args.demo {
            eprintln!("comterm needs a Windows COM port.");
            eprintln!("Running in demo mode...");
        }
        return run_demo(&config);
    }

    if let Err(e) = run_terminal(&config) {
        error!("Terminal error: {:#}", e);
        return Err(e);
    }
    Ok(())
}

/// Interactive terminal on the system's serial ports
fn run_terminal(config: &Config) -> anyhow::Result<()> {
    let mut session = Session::new(
        serial::system_opener(),
        config.serial.port_settings(),
        config.terminal.crlf,
        config.terminal.initial_rows,
    );

    let mut renderer = Renderer::new();
    renderer.init()?;
    let (cols, rows) = renderer.viewport();
    session.resize(cols, rows);

    if config.serial.open_on_start {
        connect(&mut session);
    }

    let result = event_loop(&mut session, &mut renderer);

    session.disconnect();
    renderer.cleanup()?;
    info!("comterm exiting");
    result
}

fn connect(session: &mut Session) {
    if let Err(e) = session.connect(session.settings()) {
        error!("Failed to open serial port: {}", e);
    }
}

fn save_screen(session: &Session) {
    let Some(dir) = config::config_dir() else {
        warn!("No home directory, screen not saved");
        return;
    };
    let _ = std::fs::create_dir_all(&dir);
    let path = dir.join("screen.txt");
    match session.save_screen(&path) {
        Ok(()) => info!("Screen saved to {}", path.display()),
        Err(e) => error!("Failed to save screen to {}: {}", path.display(), e),
    }
}

/// Rx/Tx indicator hold timers
#[derive(Default)]
struct Leds {
    rx_until: Option<Instant>,
    tx_until: Option<Instant>,
}

impl Leds {
    fn update(&mut self, activity: Activity, now: Instant) -> Activity {
        if activity.rx {
            self.rx_until = Some(now + LED_HOLD);
        }
        if activity.tx {
            self.tx_until = Some(now + LED_HOLD);
        }
        Activity {
            rx: self.rx_until.is_some_and(|t| now < t),
            tx: self.tx_until.is_some_and(|t| now < t),
        }
    }
}

fn event_loop(session: &mut Session, renderer: &mut Renderer) -> anyhow::Result<()> {
    let mut dirty = true;
    let mut leds = Leds::default();
    let mut shown = Activity::default();
    let poll_timeout = Duration::from_millis(10);

    loop {
        if !session.process_input().is_empty() {
            dirty = true;
        }

        let activity = leds.update(session.take_activity(), Instant::now());
        if activity != shown {
            shown = activity;
            dirty = true;
        }

        if dirty {
            renderer.render(&session.buffer, &session.status_line(), shown)?;
            dirty = false;
        }

        if !event::poll(poll_timeout)? {
            continue;
        }

        match event::read()? {
            Event::Key(key_event) => match KeyMapper::map(&key_event) {
                KeyAction::Send(bytes) => {
                    for byte in bytes {
                        let outcome = session.send_byte(byte);
                        if !outcome.is_written() {
                            debug!("Key byte 0x{:02X} not sent: {:?}", byte, outcome);
                            break;
                        }
                    }
                }
                KeyAction::ToggleConnection => {
                    if session.is_connected() {
                        session.disconnect();
                    } else {
                        connect(session);
                    }
                    dirty = true;
                }
                KeyAction::ToggleCrLf => {
                    let crlf = session.toggle_crlf();
                    info!("CR/LF mode: {}", if crlf { "UNIX" } else { "DOS" });
                    dirty = true;
                }
                KeyAction::ClearScreen => {
                    session.clear_screen();
                    dirty = true;
                }
                KeyAction::SaveScreen => save_screen(session),
                KeyAction::Quit => break,
                KeyAction::None => {}
            },
            Event::Resize(cols, rows) => {
                renderer.resize(cols, rows);
                let (cols, rows) = renderer.viewport();
                session.resize(cols, rows);
                dirty = true;
            }
            _ => {}
        }
    }

    Ok(())
}

/// Canned device output exercising the escape codes
const DEMO_CHUNKS: [&[u8]; 5] = [
    b"\x1aWelcome to comterm\r\n",
    b"Escape codes: \x1b=\x22\x28placed at row 2, col 8\r\n",
    b"col1\tcol2\tcol3\r\n",
    b"this tail will be erased\x1b=\x24\x29\x1bT\r\n",
    b"\x1b.0cursor hidden, then shown again\x1b.1",
];

/// Run the simulated port through the full receive path and print the screen
fn run_demo(config: &Config) -> anyhow::Result<()> {
    println!("=== comterm Demo Mode ===\n");

    let settings: PortSettings = config.serial.port_settings();
    let (opener, port) = SimulatedOpener::new();
    let mut session = Session::new(
        Box::new(opener),
        settings,
        config.terminal.crlf,
        config.terminal.initial_rows,
    );

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    session.on_bytes_received(Box::new(move |bytes| {
        counter.fetch_add(bytes.len(), Ordering::SeqCst);
    }));

    session.connect(settings)?;

    let total: usize = DEMO_CHUNKS.iter().map(|c| c.len()).sum();
    for chunk in DEMO_CHUNKS {
        port.inject(chunk);
    }

    let started = Instant::now();
    while received.load(Ordering::SeqCst) < total && started.elapsed() < Duration::from_secs(2) {
        session.wait_input(Duration::from_millis(20));
    }

    let sent = session.send_bytes(b"AT\r");

    println!("{}", DebugRenderer::render(&session.buffer));
    println!("Status: {}", session.status_line());
    println!(
        "Received {} bytes, sent {} bytes: {:?}",
        received.load(Ordering::SeqCst),
        sent,
        String::from_utf8_lossy(&port.written())
    );

    session.disconnect();
    println!("\nDemo complete. Build on Windows to use a real COM port.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("comterm")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        let parsed = parse_args(&args(&["-p", "COM12", "-b", "115200", "-f", "--crlf", "-o"]));
        assert_eq!(
            parsed,
            Ok(Command::Run(Args {
                port: Some(12),
                baud: Some(115200),
                flow: true,
                crlf: true,
                open: true,
                demo: false,
            }))
        );
        assert_eq!(parse_args(&args(&[])), Ok(Command::Run(Args::default())));
        assert_eq!(parse_args(&args(&["--help"])), Ok(Command::Help));
        assert_eq!(parse_args(&args(&["-v"])), Ok(Command::Version));
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(&args(&["-p"])).is_err());
        assert!(parse_args(&args(&["--port", "x"])).is_err());
        assert!(parse_args(&args(&["-b", "fast"])).is_err());
        assert!(parse_args(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_args_override_config() {
        let mut config = Config::default();
        let parsed = Args {
            port: Some(5),
            flow: true,
            ..Args::default()
        };
        parsed.apply(&mut config);
        assert_eq!(config.serial.port, 5);
        assert_eq!(config.serial.baud, 9600);
        assert!(config.serial.hardware_flow_control);
        assert!(!config.terminal.crlf);
    }

    #[test]
    fn test_leds_hold() {
        let mut leds = Leds::default();
        let now = Instant::now();
        let lit = leds.update(Activity { rx: true, tx: false }, now);
        assert_eq!(lit, Activity { rx: true, tx: false });

        let later = leds.update(Activity::default(), now + LED_HOLD / 2);
        assert!(later.rx);
        let off = leds.update(Activity::default(), now + LED_HOLD * 2);
        assert!(!off.rx && !off.tx);
    }

    #[test]
    fn test_demo_stream() {
        let mut session = Session::new(
            Box::new(serial::UnsupportedOpener),
            PortSettings::new(1, 9600, false),
            false,
            4,
        );
        for chunk in DEMO_CHUNKS {
            session.feed_bytes(chunk);
        }
        let text = session.buffer.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Welcome to comterm");
        assert_eq!(lines[2], "        placed at row 2, col 8");
        assert!(lines[3].starts_with("col1    col2    col3"));
        assert_eq!(lines[4], "this tail");
        assert!(session.buffer.cursor_visible());
    }
}
