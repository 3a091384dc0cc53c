use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use snodebus::SimEvent;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    event: &'static str,
    endpoint: &'a str,
    id: Option<u8>,
    payload_size: usize,
    payload: String,
    timestamp: String,
}

/// Print a message delivered to (`received`) or acknowledged for an endpoint.
pub fn print_message(
    event: &'static str,
    endpoint: &str,
    id: Option<u8>,
    payload: &[u8],
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                event,
                endpoint,
                id,
                payload_size: payload.len(),
                payload: hex::encode(payload),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["EVENT", "ENDPOINT", "ID", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    event.to_string(),
                    endpoint.to_string(),
                    id_text(id),
                    payload.len().to_string(),
                    hex::encode(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{event} endpoint={endpoint} id={} size={} payload={}",
                id_text(id),
                payload.len(),
                hex::encode(payload)
            );
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

#[derive(Serialize)]
struct SimEventOutput {
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    peer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    baud: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    timestamp: String,
}

impl SimEventOutput {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            peer: None,
            baud: None,
            id: None,
            keys: Vec::new(),
            payload: None,
            timestamp: now_unix_seconds(),
        }
    }
}

fn sim_event_output(event: &SimEvent) -> SimEventOutput {
    match event {
        SimEvent::Connected(peer) => SimEventOutput {
            peer: Some(peer.to_string()),
            ..SimEventOutput::new("connected")
        },
        SimEvent::Disconnected(peer) => SimEventOutput {
            peer: Some(peer.to_string()),
            ..SimEventOutput::new("disconnected")
        },
        SimEvent::BaudRate(baud) => SimEventOutput {
            baud: Some(*baud),
            ..SimEventOutput::new("baud")
        },
        SimEvent::Init { keys } => SimEventOutput {
            keys: keys.iter().map(hex::encode).collect(),
            ..SimEventOutput::new("init")
        },
        SimEvent::Message { id, payload } => SimEventOutput {
            id: Some(*id),
            payload: Some(hex::encode(payload)),
            ..SimEventOutput::new("message")
        },
        SimEvent::Other(packet) => SimEventOutput {
            payload: Some(hex::encode(packet)),
            ..SimEventOutput::new("other")
        },
    }
}

pub fn print_sim_event(event: &SimEvent, format: OutputFormat) {
    let out = sim_event_output(event);
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table | OutputFormat::Pretty => {
            let mut line = out.event.to_string();
            if let Some(peer) = &out.peer {
                line.push_str(&format!(" peer={peer}"));
            }
            if let Some(baud) = out.baud {
                line.push_str(&format!(" baud={baud}"));
            }
            if let Some(id) = out.id {
                line.push_str(&format!(" id={id}"));
            }
            for (position, key) in out.keys.iter().enumerate() {
                line.push_str(&format!(" key[{position}]={key}"));
            }
            if let Some(payload) = &out.payload {
                line.push_str(&format!(" payload={payload}"));
            }
            println!("{line}");
        }
        OutputFormat::Raw => {
            if let SimEvent::Message { payload, .. } = event {
                print_raw(payload);
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn id_text(id: Option<u8>) -> String {
    id.map_or_else(|| "-".to_string(), |id| id.to_string())
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
