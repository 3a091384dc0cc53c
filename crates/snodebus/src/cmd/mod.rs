use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use snodebus::session::FailureReason;
use snodebus::transport::DEFAULT_PORT;
use snodebus::SimReply;

use crate::exit::{io_error, CliError, CliResult, DATA_INVALID, USAGE};
use crate::output::OutputFormat;

pub mod listen;
pub mod send;
pub mod simulate;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one message from a virtual node.
    Send(SendArgs),
    /// Register virtual nodes and print the messages they receive.
    Listen(ListenArgs),
    /// Run a bus master emulator on a TCP port.
    Simulate(SimulateArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => block_on(send::run(args, format)),
        Command::Listen(args) => block_on(listen::run(args, format)),
        Command::Simulate(args) => block_on(simulate::run(args, format)),
        Command::Version(args) => version::run(args),
    }
}

fn block_on<F: Future<Output = CliResult<i32>>>(future: F) -> CliResult<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime setup failed", err))?;
    runtime.block_on(future)
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Telnet server host.
    pub host: String,
    /// Telnet server port.
    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Endpoint key (32 hex characters).
    #[arg(long, short = 'k')]
    pub key: String,
    /// Message payload as hex.
    #[arg(long, short = 'd')]
    pub data: String,
    /// Wait for one message addressed to the endpoint and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for a message when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
    /// Maximum time to wait for the link to come up.
    #[arg(long, default_value = "5s")]
    pub connect_timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Telnet server host.
    #[arg(required_unless_present = "config", conflicts_with = "config")]
    pub host: Option<String>,
    /// Telnet server port.
    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Endpoint keys (comma-separated, 32 hex characters each).
    #[arg(
        long,
        short = 'k',
        value_delimiter = ',',
        required_unless_present = "config",
        conflicts_with = "config"
    )]
    pub key: Vec<String>,
    /// Bridge configuration file (JSON) listing host and endpoints.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ReplyArg {
    #[default]
    Ack,
    Busy,
    NoAck,
    InvalidSize,
    InvalidId,
}

impl From<ReplyArg> for SimReply {
    fn from(reply: ReplyArg) -> Self {
        match reply {
            ReplyArg::Ack => SimReply::Ack,
            ReplyArg::Busy => SimReply::Fail(FailureReason::Busy),
            ReplyArg::NoAck => SimReply::Fail(FailureReason::NoAck),
            ReplyArg::InvalidSize => SimReply::Fail(FailureReason::InvalidSize),
            ReplyArg::InvalidId => SimReply::Fail(FailureReason::InvalidId),
        }
    }
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Address to bind (e.g. 127.0.0.1:2323, port 0 picks a free port).
    pub addr: String,
    /// Echo every acknowledged message back to its sender.
    #[arg(long)]
    pub echo: bool,
    /// Reply to every message with this opcode.
    #[arg(long, value_enum, default_value_t = ReplyArg::Ack)]
    pub reply: ReplyArg,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Decode a hex command-line argument.
pub fn parse_hex(flag: &str, input: &str) -> CliResult<Vec<u8>> {
    hex::decode(input.trim()).map_err(|err| {
        CliError::new(DATA_INVALID, format!("{flag} is not valid hex: {err}"))
    })
}
