//! Purpose: `gatehost` CLI entry point for operating buckets, instances and rpc from a shell.
//! Role: Binary crate root; parses args, builds only the backends a command needs, emits JSON.
//! Invariants: Commands emit JSON on stdout (pretty on a TTY, compact otherwise).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::time::Duration;

use bytes::Bytes;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use gatehost::core::error::{Error, ErrorKind, to_exit_code};
use gatehost::hosting::{HostingConfig, KvBackend, MessagingBackend, PodInfo, StorageBackend};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                let message = clap_error_summary(&err);
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint("Try `gatehost --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();
    let color_mode = cli.color;
    let config = cli
        .backends
        .to_config()
        .map_err(|err| (err, color_mode))?;

    command_dispatch::dispatch_command(cli.command, config)
        .map_err(add_broker_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "gatehost",
    version,
    about = "Coordination core for proxy networks: buckets, instances and rpc",
    long_about = None,
    before_help = r#"Backends are chosen per invocation; only the ones a command needs are opened.

Mental model:
  - `kv` reads, writes and watches buckets
  - `instances` announces and lists backend servers of the network
  - `rpc` sends typed requests to the proxies of the network
"#,
    after_help = r#"EXAMPLES
  $ gatehost --storage fs --storage-options '{"folder":"./data"}' kv set perms alice admin
  $ gatehost --storage fs --storage-options '{"folder":"./data"}' kv watch perms
  $ gatehost --kv nats instances announce lobby-0 --gamemode lobby --address 10.0.0.5 --port 25565
  $ gatehost rpc transfer --uuid 6f1c0a4e-31c3-4c59-9d55-0c2a6b5f3a10 --source proxy-0 --destination lobby

NOTES
  - RUST_LOG controls diagnostics on stderr (default: warn)"#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    backends: BackendArgs,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct BackendArgs {
    #[arg(long, global = true, default_value = "memory", help = "Blob storage backend: memory|fs")]
    storage: String,
    #[arg(long, global = true, help = "Storage backend options as JSON")]
    storage_options: Option<String>,
    #[arg(long, global = true, help = "Log every storage call at debug level")]
    log_storage: bool,
    #[arg(long, global = true, default_value = "json", help = "KV backend: json|nats")]
    kv: String,
    #[arg(long, global = true, help = "KV backend options as JSON")]
    kv_options: Option<String>,
    #[arg(long, global = true, help = "Log every kv call at debug level")]
    log_kv: bool,
    #[arg(long, global = true, default_value = "nats", help = "Messaging backend: memory|nats")]
    messaging: String,
    #[arg(long, global = true, help = "Messaging backend options as JSON")]
    messaging_options: Option<String>,
    #[arg(long, global = true, help = "Log every messaging call at debug level")]
    log_messaging: bool,
    #[arg(long, global = true, default_value = "default", help = "Network name")]
    network: String,
    #[arg(long, global = true, default_value = "default", help = "Namespace of the network")]
    namespace: String,
    #[arg(long, global = true, default_value = "proxy-0", help = "Name of this proxy")]
    pod: String,
}

impl BackendArgs {
    fn to_config(&self) -> Result<HostingConfig, Error> {
        Ok(HostingConfig {
            storage: StorageBackend::parse(&self.storage, self.storage_options.as_deref())?,
            log_storage: self.log_storage,
            kv: KvBackend::parse(&self.kv, self.kv_options.as_deref())?,
            log_kv: self.log_kv,
            messaging: MessagingBackend::parse(
                &self.messaging,
                self.messaging_options.as_deref(),
            )?,
            log_messaging: self.log_messaging,
            pod: PodInfo::new(&self.network, &self.pod, &self.namespace),
        })
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Read, write and watch kv buckets",
        after_help = r#"EXAMPLES
  $ gatehost kv set perms alice admin
  $ gatehost kv get perms alice
  $ gatehost kv keys perms
  $ gatehost kv delete perms alice
  $ gatehost kv watch perms --until-replayed

NOTES
  - Values print as UTF-8 text when valid, otherwise base64 (see `encoding`)"#
    )]
    Kv {
        #[command(subcommand)]
        command: KvCommand,
    },
    #[command(
        arg_required_else_help = true,
        about = "Announce, retire and list backend server instances",
        after_help = r#"EXAMPLES
  $ gatehost instances announce lobby-0 --gamemode lobby --address 10.0.0.5 --port 25565
  $ gatehost instances list --gamemode lobby
  $ gatehost instances retire lobby-0

NOTES
  - Descriptors live in the bucket gatehost_<namespace>_<network>_instances"#
    )]
    Instances {
        #[command(subcommand)]
        command: InstancesCommand,
    },
    #[command(
        arg_required_else_help = true,
        about = "Send rpc requests over the network subject",
        after_help = r#"EXAMPLES
  $ gatehost rpc transfer --uuid 6f1c0a4e-31c3-4c59-9d55-0c2a6b5f3a10 --source proxy-0 --destination lobby"#
    )]
    Rpc {
        #[command(subcommand)]
        command: RpcCommand,
    },
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ gatehost completion bash > ~/.local/share/bash-completion/completions/gatehost
  $ gatehost completion zsh > ~/.zfunc/_gatehost"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum KvCommand {
    #[command(about = "Print one value")]
    Get { bucket: String, key: String },
    #[command(about = "Store a value (UTF-8 text)")]
    Set {
        bucket: String,
        key: String,
        value: String,
    },
    #[command(about = "Delete a key")]
    Delete { bucket: String, key: String },
    #[command(about = "List keys")]
    Keys { bucket: String },
    #[command(about = "Stream replayed state, then live changes, as JSON Lines")]
    Watch {
        bucket: String,
        #[arg(long, help = "Stop once the replay of current state is complete")]
        until_replayed: bool,
    },
}

#[derive(Subcommand)]
enum InstancesCommand {
    #[command(about = "Write an instance descriptor")]
    Announce {
        name: String,
        #[arg(long)]
        gamemode: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        port: u16,
    },
    #[command(about = "Delete an instance descriptor")]
    Retire { name: String },
    #[command(about = "List instance descriptors")]
    List {
        #[arg(long, help = "Only instances of this gamemode")]
        gamemode: Option<String>,
    },
}

#[derive(Subcommand)]
enum RpcCommand {
    #[command(about = "Ask the network to move a player to another server")]
    Transfer {
        #[arg(long)]
        uuid: uuid::Uuid,
        #[arg(long)]
        source: String,
        #[arg(long)]
        destination: String,
        #[arg(long, default_value_t = 5000, help = "Response deadline in milliseconds")]
        timeout_ms: u64,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn add_broker_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Broker || err.hint().is_some() {
        return err;
    }
    err.with_hint("Check --kv-options/--messaging-options and that the broker is reachable.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint("Unexpected internal failure. Retry with RUST_LOG=debug and share the output if it persists.")
}

fn value_json(value: &Bytes) -> (Value, &'static str) {
    use base64::Engine;
    match std::str::from_utf8(value) {
        Ok(text) => (json!(text), "utf8"),
        Err(_) => (
            json!(base64::engine::general_purpose::STANDARD.encode(value)),
            "base64",
        ),
    }
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_jsonl(value: Value) {
    let json = serde_json::to_string(&value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::AlreadyExists => "already exists".to_string(),
        ErrorKind::NoServersAvailable => "no servers available".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Broker => "broker error".to_string(),
        ErrorKind::Lagged => "watcher fell behind".to_string(),
        ErrorKind::Closed => "stream closed".to_string(),
        ErrorKind::Timeout => "timed out".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(key) = err.key() {
        lines.push(format!(
            "{} {key}",
            colorize_label("key:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn now_rfc3339() -> Result<String, Error> {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to format timestamp")
                .with_source(err)
        })
}

fn timeout_from_ms(timeout_ms: u64) -> Result<Duration, Error> {
    if timeout_ms == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("timeout must be positive")
            .with_hint("Pass --timeout-ms with a value above 0."));
    }
    Ok(Duration::from_millis(timeout_ms))
}

#[cfg(test)]
mod tests {
    use super::{Cli, error_json, value_json};
    use bytes::Bytes;
    use clap::CommandFactory;
    use gatehost::core::error::{Error, ErrorKind};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn values_render_as_text_or_base64() {
        let (value, encoding) = value_json(&Bytes::from_static(b"admin"));
        assert_eq!(value, "admin");
        assert_eq!(encoding, "utf8");
        let (value, encoding) = value_json(&Bytes::from_static(&[0xff, 0x00]));
        assert_eq!(value, "/wA=");
        assert_eq!(encoding, "base64");
    }

    #[test]
    fn error_json_carries_kind_and_key() {
        let value = error_json(&Error::not_found("alice"));
        assert_eq!(value["error"]["kind"], "NotFound");
        assert_eq!(value["error"]["key"], "alice");
        assert_eq!(value["error"]["message"], "key not found");
        let value = error_json(&Error::new(ErrorKind::Timeout));
        assert_eq!(value["error"]["message"], "timed out");
    }
}
