use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand};
use envelope::Envelope;
use ness_link::{Diagnostic, LinkConfig, LinkError, Session};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("invalid JSON argument: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("`{flag}` must be a JSON object")]
    NotAnObject { flag: &'static str },
    #[error("connection closed while watching")]
    WatchEnded,
    #[error("frame encode failed: {0}")]
    Encode(#[from] envelope::CodecError),
}

#[derive(Parser, Debug)]
#[command(name = "ness", about = "Ness backend WebSocket CLI")]
struct Cli {
    #[arg(long, env = "NESS_WS_URL")]
    url: Option<String>,

    #[arg(long, env = "NESS_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "NESS_REQUEST_TIMEOUT_SECS", help = "Per-request deadline; 0 waits forever")]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one raw request and print the reply payload.
    Request(RequestArgs),
    /// Print push notifications of the given types until interrupted.
    Watch(WatchArgs),
    Balance {
        address: String,
    },
    Wallets,
    Transactions {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    Service {
        service_id: String,
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[derive(Args, Debug)]
struct RequestArgs {
    kind: String,

    #[arg(long, default_value = "{}")]
    payload: String,
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(required = true)]
    kinds: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WalletBalance {
    address: String,
    lamports: u64,
    sol: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WalletsPayload {
    wallets: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TransactionsPayload {
    transactions: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PaymentRequired {
    payment_address: String,
    amount_lamports: u64,
    amount_sol: f64,
    currency: String,
    description: String,
    resource_id: String,
    expires_at: i64,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let session = Session::new(link_config(&cli));
    session.open().await?;

    let outcome = run(&session, cli.token.as_deref(), cli.command).await;
    session.close().await;
    if let Err(CliError::Link(error)) = &outcome {
        eprintln!("{}", failure_hint(error));
    }
    outcome
}

fn failure_hint(error: &LinkError) -> String {
    if error.is_channel_failure() {
        format!("{}: connection lost; rerun to reconnect", error.error_code())
    } else if error.retryable() {
        format!("{}: transient failure; safe to retry", error.error_code())
    } else {
        format!("{}: not retryable", error.error_code())
    }
}

fn link_config(cli: &Cli) -> LinkConfig {
    let mut config = LinkConfig::from_env();
    if let Some(url) = &cli.url {
        config = config.with_url(url.clone());
    }
    if let Some(secs) = cli.timeout_secs {
        config = config.with_request_timeout((secs > 0).then(|| Duration::from_secs(secs)));
    }
    config
}

async fn run(session: &Session, token: Option<&str>, command: Command) -> Result<(), CliError> {
    if let Some(token) = token {
        authenticate(session, token).await?;
    }

    match command {
        Command::Request(args) => {
            let payload = parse_object_arg("--payload", &args.payload)?;
            let reply = session.request(&args.kind, &payload).await?;
            print_json(&reply)
        }
        Command::Watch(args) => watch(session, args.kinds).await,
        Command::Balance { address } => {
            let balance: WalletBalance = session
                .request_as("wallet.balance", &serde_json::json!({ "address": address }))
                .await?;
            print_json(&balance)
        }
        Command::Wallets => {
            let payload: WalletsPayload = session.request_as("wallet.list", &Map::new()).await?;
            print_json(&payload.wallets)
        }
        Command::Transactions { limit } => {
            let payload: TransactionsPayload = session
                .request_as("transaction.list", &serde_json::json!({ "limit": limit }))
                .await?;
            print_json(&payload.transactions)
        }
        Command::Service { service_id, params } => {
            let params = parse_object_arg("--params", &params)?;
            let payment: PaymentRequired = session
                .request_as(
                    "service.request",
                    &serde_json::json!({ "service_id": service_id, "params": params }),
                )
                .await?;
            print_json(&payment)
        }
    }
}

async fn authenticate(session: &Session, token: &str) -> Result<(), CliError> {
    match session.request("auth", &serde_json::json!({ "token": token })).await {
        Ok(_) => Ok(()),
        Err(LinkError::Server { message, .. }) => Err(CliError::Unauthorized(message)),
        Err(error) => Err(error.into()),
    }
}

async fn watch(session: &Session, kinds: Vec<String>) -> Result<(), CliError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Value)>();
    for kind in kinds {
        let tx = tx.clone();
        let label = kind.clone();
        session.subscribe(kind, move |payload| {
            let _ = tx.send((label.clone(), payload));
        });
    }
    drop(tx);

    let mut states = session.watch_state();
    let mut diagnostics = session.diagnostics();
    loop {
        tokio::select! {
            Some((kind, payload)) = rx.recv() => {
                println!("{}", notification_line(kind, payload)?);
            }
            Ok(diagnostic) = diagnostics.recv() => {
                eprintln!("{}", diagnostic_line(&diagnostic));
            }
            changed = states.changed() => {
                if changed.is_err() || !session.is_open() {
                    return Err(CliError::WatchEnded);
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

/// One notification as a timestamped envelope, one JSON object per line.
fn notification_line(kind: String, payload: Value) -> Result<String, CliError> {
    let frame = Envelope::new(kind, payload).with_timestamp(now_ms().to_string());
    let bytes = envelope::encode_envelope(&frame)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn diagnostic_line(diagnostic: &Diagnostic) -> String {
    match diagnostic {
        Diagnostic::DecodeFailed { error } => format!("dropped undecodable frame: {error}"),
        Diagnostic::ChannelFaulted { error, failed } => {
            format!("channel faulted ({}): {error}; failed {failed} request(s)", error.error_code())
        }
        Diagnostic::ChannelClosed { failed } => format!("channel closed; failed {failed} request(s)"),
        Diagnostic::HandlerPanicked { kind } => format!("handler for `{kind}` panicked"),
    }
}

fn now_ms() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

fn parse_object_arg(flag: &'static str, raw: &str) -> Result<Map<String, Value>, CliError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(CliError::NotAnObject { flag }),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_arguments_parse() {
        let map = parse_object_arg("--params", r#"{"tier":"pro"}"#).expect("object");
        assert_eq!(map.get("tier"), Some(&json!("pro")));
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        assert!(matches!(
            parse_object_arg("--payload", "[1,2]"),
            Err(CliError::NotAnObject { flag: "--payload" })
        ));
        assert!(matches!(parse_object_arg("--payload", "{oops"), Err(CliError::InvalidJson(_))));
    }

    #[test]
    fn payment_required_decodes_snake_case_fields() {
        let payment: PaymentRequired = serde_json::from_value(json!({
            "payment_address": "9xQ",
            "amount_lamports": 1_000_000,
            "amount_sol": 0.001,
            "currency": "SOL",
            "description": "API call",
            "resource_id": "res-1",
            "expires_at": 1_760_000_000
        }))
        .expect("payment");
        assert_eq!(payment.amount_lamports, 1_000_000);
        assert_eq!(payment.resource_id, "res-1");
    }

    #[test]
    fn zero_timeout_flag_disables_deadline() {
        let cli = Cli::parse_from(["ness", "--url", "ws://localhost:1/ws", "--timeout-secs", "0", "wallets"]);
        let config = link_config(&cli);
        assert_eq!(config.url, "ws://localhost:1/ws");
        assert_eq!(config.request_timeout, None);
    }

    #[test]
    fn notification_lines_are_timestamped_envelopes() {
        let line = notification_line("price.update".into(), json!({ "sol_usd": 140 })).expect("line");
        let decoded = envelope::decode_envelope(line.as_bytes()).expect("decode");
        assert_eq!(decoded.kind, "price.update");
        assert_eq!(decoded.payload, json!({ "sol_usd": 140 }));
        assert!(decoded.timestamp.is_some());
    }

    #[test]
    fn failure_hints_follow_error_class() {
        assert!(failure_hint(&LinkError::ChannelClosed).contains("reconnect"));
        assert!(failure_hint(&LinkError::Timeout("wallet.list".into())).contains("retry"));
        assert!(failure_hint(&LinkError::NotOpen).contains("not retryable"));
    }

    #[test]
    fn diagnostics_render_error_codes() {
        let line = diagnostic_line(&Diagnostic::ChannelFaulted {
            error: LinkError::ChannelFault("reset".into()),
            failed: 2,
        });
        assert!(line.contains("E_CHANNEL_FAULT"));
        assert!(line.contains("failed 2"));
    }

    #[test]
    fn transactions_limit_defaults_to_twenty() {
        let cli = Cli::parse_from(["ness", "transactions"]);
        assert!(matches!(cli.command, Command::Transactions { limit: 20 }));
    }
}
