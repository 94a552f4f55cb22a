use actix::prelude::*;
use scada_actors::{
    CommandMode, CommandTree, Hosted, HpBoss, Multiplexer, Node, PinDriver, Relay, Scada,
    SimulatedBoard,
};
use scada_link::{codec::topic_filter, LinkManager, LinkName, LinkSettings};
use scada_runtime::{Runtime, RuntimeSettings, ServicesHandle};
use scada_types::{ActorClass, HardwareLayout, InternalShutdown};
use std::sync::Arc;
use tokio::time::Duration;

use crate::{ScadaResult, ScadaSettings};

/// Start `node` on the current arbiter and register it with the runtime
fn host<N: Node>(runtime: &mut Runtime, node: N) -> ScadaResult<()> {
    let name = node.name().to_string();
    let hosted = Hosted::new(node);
    let monitored = hosted.monitored();
    let addr = hosted.start();
    runtime.register(&name, addr.clone().recipient(), addr.recipient())?;
    runtime.monitor(monitored);
    Ok(())
}

/// Build and host the actor for every local node in the layout. Every
/// actor starts from the home-alone tree; the primary scada broadcasts
/// a new one as soon as authority changes. `board` opens the relay board
/// of the named multiplexer.
pub fn host_actors(
    runtime: &mut Runtime,
    layout: &HardwareLayout,
    settings: &ScadaSettings,
    board: &dyn Fn(&str) -> Box<dyn PinDriver>,
) -> ScadaResult<usize> {
    let services: Arc<dyn ServicesHandle> = runtime.services();
    let tree = CommandTree::for_mode(layout, CommandMode::HomeAlone).map_err(|e| {
        log::error!("Unable to build the command tree: {e:}");
        scada_actors::ActorError::from(e)
    })?;
    let mut hosted = 0;
    for node in layout.sh_nodes.iter().filter(|n| n.actor_class.is_local_actor()) {
        let name = node.name.as_str();
        match node.actor_class {
            ActorClass::PrimaryScada => host(
                runtime,
                Scada::new(
                    name,
                    services.clone(),
                    Duration::from_secs(settings.snapshot_period_s),
                )?,
            )?,
            ActorClass::Relay => host(runtime, Relay::new(name, services.clone(), tree.clone())?)?,
            ActorClass::I2cRelayMultiplexer => host(
                runtime,
                Multiplexer::new(name, services.clone(), tree.clone(), board(name))?,
            )?,
            ActorClass::HpBoss => host(runtime, HpBoss::new(name, services.clone(), tree.clone())?)?,
            other => {
                log::debug!("No local actor for {name} ({other:?})");
                continue;
            }
        }
        hosted += 1;
    }
    Ok(hosted)
}

/// Settings for both links: the cloud link waits to hear from the Atn,
/// the local link only listens to the admin
pub fn link_settings(layout: &HardwareLayout, settings: &ScadaSettings) -> Vec<LinkSettings> {
    let alias = layout.scada_alias();
    let upstream = LinkSettings::new(
        LinkName::Upstream,
        format!("{alias}-{}", LinkName::Upstream),
        settings.gridworks_mqtt.clone(),
    )
    .with_peer(layout.atn_alias())
    .subscribe(topic_filter(layout.atn_alias()));

    let mut local = LinkSettings::new(
        LinkName::Local,
        format!("{alias}-{}", LinkName::Local),
        settings.local_mqtt.clone(),
    );
    if let Some(admin) = layout.admin() {
        local = local.subscribe(topic_filter(&admin.name));
    }
    vec![upstream, local]
}

/// The running daemon
pub struct App {
    runtime: Runtime,
}

impl App {
    /// Host every actor and connect both links. Must be called from
    /// within an actix system.
    pub fn build(settings: &ScadaSettings, layout: HardwareLayout) -> ScadaResult<Self> {
        let layout = Arc::new(layout);
        let mut runtime = Runtime::new(
            layout.clone(),
            RuntimeSettings {
                seconds_per_pat: settings.seconds_per_pat,
                ..RuntimeSettings::default()
            },
        );
        let simulated = |name: &str| -> Box<dyn PinDriver> {
            log::warn!("{name} driving a simulated relay board");
            Box::new(SimulatedBoard::new())
        };
        let hosted = host_actors(&mut runtime, &layout, settings, &simulated)?;
        runtime.check_watchdog()?;
        log::info!("Hosting {hosted} actors for {}", layout.scada_alias());

        let primary = layout
            .primary_scada()
            .map(|n| n.name.clone())
            .unwrap_or_default();
        let mut links = LinkManager::new(layout.scada_alias(), &primary, runtime.inbound());
        for link in link_settings(&layout, settings) {
            links.connect(link)?;
        }
        runtime.start_links(links)?;
        Ok(Self { runtime })
    }

    /// Run until an internal shutdown or ctrl-c, then stop everything
    pub async fn run(&mut self) -> ScadaResult<InternalShutdown> {
        let shutdown = tokio::select! {
            result = self.runtime.run() => result?,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                InternalShutdown {
                    reason: "interrupted".to_string(),
                    exit_code: InternalShutdown::CLEAN,
                }
            }
        };
        self.runtime.stop().await;
        Ok(shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scada_runtime::Route;
    use scada_types::{
        layout::test_layout_json, new_trigger_id, AdminWakesUp, FsmEvent, FsmEventName,
        FsmEventType, Handle, Message, Payload,
    };

    fn settings() -> ScadaSettings {
        ScadaSettings::from_lookup(|_| None).unwrap()
    }

    fn simulated(_name: &str) -> Box<dyn PinDriver> {
        Box::new(SimulatedBoard::new())
    }

    #[actix::test]
    async fn hosts_every_local_actor() {
        let layout = HardwareLayout::from_json(test_layout_json()).unwrap();
        let mut runtime = Runtime::new(Arc::new(layout.clone()), RuntimeSettings::default());
        let hosted = host_actors(&mut runtime, &layout, &settings(), &simulated).unwrap();
        assert_eq!(hosted, 7);
        for name in [
            "s",
            "relay-multiplexer",
            "vdc-relay",
            "zone-valve",
            "hp-boss",
            "hp-scada-ops-relay",
        ] {
            assert_eq!(runtime.route(name), Route::Actor(name.to_string()));
        }
        assert_eq!(runtime.route("home"), Route::Drop);
        runtime.check_watchdog().unwrap();
        runtime.stop().await;
    }

    #[actix::test]
    async fn admin_takes_over_a_relay() {
        let layout = HardwareLayout::from_json(test_layout_json()).unwrap();
        let scada_alias = layout.scada_alias().to_string();
        let mut runtime = Runtime::new(
            Arc::new(layout.clone()),
            RuntimeSettings {
                notify_systemd: false,
                ..RuntimeSettings::default()
            },
        );
        let board = SimulatedBoard::new();
        let shared = board.clone();
        let open_board = move |_name: &str| -> Box<dyn PinDriver> { Box::new(shared.clone()) };
        host_actors(&mut runtime, &layout, &settings(), &open_board).unwrap();

        // what scada-admin publishes on the local broker, in order
        let wake = Message::new(
            "admin",
            scada_alias.as_str(),
            Payload::AdminWakesUp(AdminWakesUp { timeout_s: None }),
        );
        let open = FsmEvent::new(
            Handle::new("h.admin").unwrap(),
            Handle::new("h.admin.vdc-relay").unwrap(),
            FsmEventType::ChangeRelayState,
            FsmEventName::OpenRelay,
            0,
            new_trigger_id(),
        )
        .unwrap();
        let open = Message::new("admin", scada_alias.as_str(), Payload::FsmEvent(open));

        let inbound = runtime.inbound();
        let admin = async {
            // let the board come up and announce itself to the relays
            tokio::time::sleep(Duration::from_millis(300)).await;
            inbound.send(wake).unwrap();
            inbound.send(open).unwrap();
            for _ in 0..200 {
                if board.pin(1) == Some(true) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            false
        };
        let opened = tokio::select! {
            result = runtime.run() => panic!("runtime stopped early: {result:?}"),
            opened = admin => opened,
        };
        assert!(opened, "vdc-relay pin never energized");
        runtime.stop().await;
    }

    #[test]
    fn links_listen_to_their_peers() {
        let layout = HardwareLayout::from_json(test_layout_json()).unwrap();
        let links = link_settings(&layout, &settings());
        let upstream = &links[0];
        assert_eq!(upstream.name, LinkName::Upstream);
        assert_eq!(upstream.peer_alias.as_deref(), Some("hw1.isone.me.versant.keene.beech"));
        assert_eq!(upstream.subscriptions, vec!["hw1-isone-me-versant-keene-beech/#"]);
        let local = &links[1];
        assert_eq!(local.peer_alias, None);
        assert_eq!(local.subscriptions, vec!["admin/#"]);
    }
}
