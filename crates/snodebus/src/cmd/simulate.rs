use snodebus::{SimConfig, Simulator};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::cmd::SimulateArgs;
use crate::exit::{io_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_sim_event, OutputFormat};

pub async fn run(args: SimulateArgs, format: OutputFormat) -> CliResult<i32> {
    let config = SimConfig {
        reply: args.reply.into(),
        echo: args.echo,
    };
    let sim = Simulator::bind(args.addr.as_str(), config)
        .await
        .map_err(|err| io_error(&format!("bind {} failed", args.addr), err))?;
    let mut events = sim.subscribe();

    // First line of output: the bound address, so callers can pass port 0.
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "event": "listening", "addr": sim.local_addr().to_string() })
        ),
        _ => println!("listening addr={}", sim.local_addr()),
    }

    let running = CancellationToken::new();
    let handler = running.clone();
    ctrlc::set_handler(move || handler.cancel()).map_err(|err| {
        CliError::new(INTERNAL, format!("signal handler setup failed: {err}"))
    })?;

    loop {
        let event = tokio::select! {
            _ = running.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => print_sim_event(&event, format),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "output fell behind, events skipped");
            }
            Err(RecvError::Closed) => break,
        }
    }

    sim.close().await;
    Ok(SUCCESS)
}
