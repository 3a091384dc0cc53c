use std::time::Duration;

use snodebus::{parse_key, Bridge, BridgeConfig, BusEndpoint};

use crate::cmd::{parse_duration, parse_hex, SendArgs};
use crate::exit::{
    bridge_error, session_error, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS, TIMEOUT,
};
use crate::output::{print_message, OutputFormat};

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let key = parse_key(&args.key)
        .map_err(|reason| CliError::new(DATA_INVALID, format!("--key: {reason}")))?;
    let payload = parse_hex("--data", &args.data)?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let connect_timeout = parse_duration(&args.connect_timeout)?;

    let config = BridgeConfig {
        port: args.port,
        ..BridgeConfig::new(args.host)
    };
    let bridge = Bridge::start(config)
        .await
        .map_err(|err| bridge_error("start failed", err))?;

    let wait = args.wait.then_some(wait_timeout);
    let result = exchange(&bridge, &key, &payload, wait, connect_timeout, format).await;
    bridge.close().await;
    result
}

async fn exchange(
    bridge: &Bridge,
    key: &[u8],
    payload: &[u8],
    wait: Option<Duration>,
    connect_timeout: Duration,
    format: OutputFormat,
) -> CliResult<i32> {
    bridge
        .wait_connected(connect_timeout)
        .await
        .map_err(|err| bridge_error("connect failed", err))?;

    let endpoint = bridge
        .register(key)
        .map_err(|err| bridge_error("register failed", err))?;
    endpoint
        .send(payload)
        .await
        .map_err(|err| session_error("send failed", err))?;
    tracing::debug!(id = ?endpoint.id(), len = payload.len(), "message acknowledged");

    if let Some(timeout) = wait {
        let reply = wait_for_message(&endpoint, timeout).await?;
        print_message("received", &hex::encode(key), endpoint.id(), &reply, format);
    }
    Ok(SUCCESS)
}

async fn wait_for_message(endpoint: &BusEndpoint, timeout: Duration) -> CliResult<bytes::Bytes> {
    match tokio::time::timeout(timeout, endpoint.recv()).await {
        Ok(Some(payload)) => Ok(payload),
        Ok(None) => Err(CliError::new(FAILURE, "receive failed: endpoint closed")),
        Err(_) => Err(CliError::new(
            TIMEOUT,
            format!("receive failed: no message within {timeout:?}"),
        )),
    }
}
