//! Admin plane: takes control of the relays through the local broker.
use clap::{Parser, Subcommand};
use scada_link::{
    codec::{encode, qos_for},
    ClientEvent, LinkName, LinkSettings, MqttClient, RumqttClient,
};
use scada_types::{
    new_trigger_id, now_unix_ms, AdminReleasesControl, AdminWakesUp, FsmEvent, Handle,
    HardwareLayout, Message, Payload,
};
use scadad::{config, ScadaSettings};
use std::{error::Error, path::PathBuf};
use tokio::time::{timeout, Duration};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Time given to the client to flush before disconnecting
const FLUSH_DELAY: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[clap(name = "scada-admin", version, about = "Take direct control of a scada's relays")]
struct Cli {
    #[clap(long)]
    env_file: Option<PathBuf>,
    #[clap(long)]
    layout: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start an admin lease
    Wake {
        #[clap(long)]
        timeout_s: Option<u64>,
    },
    /// Wake, then send one event to a relay, e.g. `relay vdc-relay OpenRelay`
    Relay {
        name: String,
        event: String,
        #[clap(long)]
        timeout_s: Option<u64>,
    },
    /// End the admin lease
    Release,
}

/// Addressed to the scada, which forwards it to the relay only after the
/// wake has put the admin tree in place
fn relay_event(
    layout: &HardwareLayout,
    admin: &str,
    relay: &str,
    event: &str,
) -> Result<Message, Box<dyn Error>> {
    let (_, config) = layout
        .relay_config(relay)
        .ok_or_else(|| format!("{relay} is not a relay in the layout"))?;
    let event_name = [config.energizing_event(), config.de_energizing_event]
        .into_iter()
        .find(|e| e.to_string() == event)
        .ok_or_else(|| {
            format!(
                "{relay} accepts {} or {}",
                config.energizing_event(),
                config.de_energizing_event
            )
        })?;
    let from = Handle::new("h.admin")?;
    let to = from.child(relay);
    let event = FsmEvent::new(
        from,
        to,
        config.kind.event_type(),
        event_name,
        now_unix_ms(),
        new_trigger_id(),
    )?;
    Ok(Message::new(admin, layout.scada_alias(), Payload::FsmEvent(event)))
}

fn messages(layout: &HardwareLayout, command: &Command) -> Result<Vec<Message>, Box<dyn Error>> {
    let admin = layout
        .admin()
        .map(|n| n.name.clone())
        .ok_or("no admin node in the layout")?;
    let scada = layout.scada_alias();
    let wake = |timeout_s| {
        Message::new(
            admin.as_str(),
            scada,
            Payload::AdminWakesUp(AdminWakesUp { timeout_s }),
        )
    };
    Ok(match command {
        Command::Wake { timeout_s } => vec![wake(*timeout_s)],
        Command::Relay {
            name,
            event,
            timeout_s,
        } => vec![wake(*timeout_s), relay_event(layout, &admin, name, event)?],
        Command::Release => vec![Message::new(
            admin.as_str(),
            scada,
            Payload::AdminReleasesControl(AdminReleasesControl {}),
        )],
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let cli = Cli::parse();
    config::load_env_file(cli.env_file.as_deref())?;
    let settings = ScadaSettings::from_env()?;
    let layout = HardwareLayout::load(&cli.layout.unwrap_or(settings.layout_path))?;
    let outgoing = messages(&layout, &cli.command)?;

    let link = LinkSettings::new(
        LinkName::Local,
        format!("scada-admin-{}", std::process::id()),
        settings.local_mqtt,
    );
    let (client, mut events) = RumqttClient::start(&link)?;
    let connected = timeout(CONNECT_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Connected => return Ok(()),
                ClientEvent::AuthRefused(reason) => return Err(reason),
                other => log::debug!("Waiting for broker: {other:?}"),
            }
        }
        Err("client closed".to_string())
    })
    .await;
    match connected {
        Ok(Ok(())) => log::info!("Connected to {}:{}", link.mqtt.host, link.mqtt.port),
        Ok(Err(reason)) => return Err(format!("broker refused connection: {reason}").into()),
        Err(_) => return Err("timed out connecting to the local broker".into()),
    }

    for message in outgoing {
        let (topic, payload) = encode(&message)?;
        client.publish(&topic, qos_for(&message.payload), payload)?;
        log::info!("Sent {} to {}", message.payload.type_name(), message.dst());
    }
    tokio::time::sleep(FLUSH_DELAY).await;
    client.disconnect()?;
    Ok(())
}
