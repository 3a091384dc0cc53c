use std::sync::Arc;

use bytes::Bytes;
use snodebus::session::{Endpoint, PacketLink};
use snodebus::{Bridge, BridgeConfig, EndpointConfig};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cmd::ListenArgs;
use crate::exit::{bridge_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_message, OutputFormat};

/// Messages buffered between the endpoint forwarders and stdout.
const FORWARD_BUFFER: usize = 64;

/// One inbound message, tagged with the endpoint that took it.
#[derive(Debug)]
struct Received {
    endpoint: String,
    id: Option<u8>,
    payload: Bytes,
}

pub async fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let config = resolve_config(args.host, args.port, &args.key, args.config.as_deref())?;
    let bridge = Bridge::start(config)
        .await
        .map_err(|err| bridge_error("start failed", err))?;

    let running = CancellationToken::new();
    install_ctrlc_handler(running.clone())?;

    let result = listen(&bridge, args.count, &running, format).await;
    bridge.close().await;
    result
}

async fn listen(
    bridge: &Bridge,
    count: Option<usize>,
    running: &CancellationToken,
    format: OutputFormat,
) -> CliResult<i32> {
    let endpoints: Vec<_> = bridge
        .register_configured()
        .map_err(|err| bridge_error("register failed", err))?
        .into_iter()
        .map(|(name, endpoint)| (name, Arc::new(endpoint)))
        .collect();

    // Later connects re-run the handshake on their own.
    if bridge.is_connected() {
        if let Err(err) = bridge.session().init(false).await {
            tracing::warn!(error = %err, "initial handshake failed");
        }
    }

    let (tx, rx) = mpsc::channel(FORWARD_BUFFER);
    let mut forwarders = spawn_forwarders(endpoints, tx);
    let result = receive(rx, count, running, |message| {
        print_message(
            "received",
            &message.endpoint,
            message.id,
            &message.payload,
            format,
        )
    })
    .await;
    forwarders.shutdown().await;
    result
}

/// Drain every endpoint's inbound queue into `tx`, one task per endpoint.
fn spawn_forwarders<L: PacketLink>(
    endpoints: Vec<(String, Arc<Endpoint<L>>)>,
    tx: mpsc::Sender<Received>,
) -> JoinSet<()> {
    let mut forwarders = JoinSet::new();
    for (name, endpoint) in endpoints {
        let tx = tx.clone();
        forwarders.spawn(async move {
            while let Some(payload) = endpoint.recv().await {
                let message = Received {
                    endpoint: name.clone(),
                    id: endpoint.id(),
                    payload,
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            tracing::debug!(endpoint = %name, "forwarder stopped");
        });
    }
    forwarders
}

/// Hand forwarded messages to `emit` until `count` is reached or `running`
/// is cancelled.
async fn receive(
    mut rx: mpsc::Receiver<Received>,
    count: Option<usize>,
    running: &CancellationToken,
    mut emit: impl FnMut(Received),
) -> CliResult<i32> {
    let mut printed = 0usize;
    loop {
        let message = tokio::select! {
            _ = running.cancelled() => return Ok(SUCCESS),
            message = rx.recv() => message,
        };
        let Some(message) = message else {
            return Err(CliError::new(FAILURE, "receive failed: bridge closed"));
        };

        emit(message);
        printed = printed.saturating_add(1);
        if count.is_some_and(|count| printed >= count) {
            return Ok(SUCCESS);
        }
    }
}

fn resolve_config(
    host: Option<String>,
    port: u16,
    keys: &[String],
    file: Option<&std::path::Path>,
) -> CliResult<BridgeConfig> {
    if let Some(path) = file {
        return BridgeConfig::from_file(path).map_err(|err| {
            bridge_error(&format!("failed loading {}", path.display()), err)
        });
    }

    let host = host.ok_or_else(|| CliError::new(USAGE, "a host or --config is required"))?;
    let config = BridgeConfig {
        port,
        endpoints: keys
            .iter()
            .enumerate()
            .map(|(position, key)| EndpointConfig {
                name: format!("node{position}"),
                key: key.clone(),
            })
            .collect(),
        ..BridgeConfig::new(host)
    };
    config
        .validate()
        .map_err(|err| bridge_error("invalid arguments", err))?;
    Ok(config)
}

fn install_ctrlc_handler(running: CancellationToken) -> CliResult<()> {
    ctrlc::set_handler(move || running.cancel()).map_err(|err| {
        CliError::new(INTERNAL, format!("signal handler setup failed: {err}"))
    })
}
