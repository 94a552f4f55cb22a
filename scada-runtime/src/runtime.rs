use actix::Recipient;
use scada_link::{LinkCommand, LinkManager, LinkName};
use scada_types::{
    ActorClass, HardwareLayout, InternalShutdown, Message, Payload, RUNTIME_NAME,
    WATCHDOG_MANAGER_NAME,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::{Duration, Instant, MissedTickBehavior},
};

use crate::{
    Envelope, MonitoredName, RuntimeError, Services, ServicesHandle, Shutdown, SystemdNotifier,
    Watchdog,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub seconds_per_pat: f64,
    /// Bound on how long `stop` waits for each actor
    pub shutdown_timeout: Duration,
    pub notify_systemd: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            seconds_per_pat: 10.0,
            shutdown_timeout: Duration::from_secs(5),
            notify_systemd: true,
        }
    }
}

/// Where a message is headed
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Runtime,
    Actor(String),
    Link(LinkName),
    Drop,
}

struct ActorEntry {
    envelope: Recipient<Envelope>,
    shutdown: Recipient<Shutdown>,
}

/// Hosts the named actors: owns the one inbound queue every message
/// goes through, routes each message by destination and runs the
/// internal watchdog.
pub struct Runtime {
    layout: Arc<HardwareLayout>,
    services: Arc<Services>,
    inbound: Option<UnboundedReceiver<Message>>,
    link_commands: Option<UnboundedReceiver<LinkCommand>>,
    link_task: Option<tokio::task::JoinHandle<()>>,
    actors: BTreeMap<String, ActorEntry>,
    /// Registration order, stopped in reverse
    started: Vec<String>,
    primary_scada: Option<String>,
    watchdog: Watchdog,
    notifier: Option<SystemdNotifier>,
    settings: RuntimeSettings,
    stopped: bool,
}

impl Runtime {
    pub fn new(layout: Arc<HardwareLayout>, settings: RuntimeSettings) -> Self {
        let (inbound_tx, inbound) = unbounded_channel();
        let (links_tx, link_commands) = unbounded_channel();
        let services = Arc::new(Services::new(layout.clone(), inbound_tx, links_tx));
        let notifier = if settings.notify_systemd {
            SystemdNotifier::from_env()
        } else {
            None
        };
        Self {
            primary_scada: layout.primary_scada().map(|n| n.name.clone()),
            layout,
            services,
            inbound: Some(inbound),
            link_commands: Some(link_commands),
            link_task: None,
            actors: BTreeMap::new(),
            started: Vec::new(),
            watchdog: Watchdog::new(settings.seconds_per_pat),
            notifier,
            settings,
            stopped: false,
        }
    }

    pub fn services(&self) -> Arc<Services> {
        self.services.clone()
    }

    pub fn inbound(&self) -> UnboundedSender<Message> {
        self.services.inbound()
    }

    pub fn register(
        &mut self,
        name: &str,
        envelope: Recipient<Envelope>,
        shutdown: Recipient<Shutdown>,
    ) -> Result<(), RuntimeError> {
        if self.actors.contains_key(name) {
            return Err(RuntimeError::DuplicateActor(name.to_string()));
        }
        log::debug!("Registering actor {name}");
        self.actors
            .insert(name.to_string(), ActorEntry { envelope, shutdown });
        self.started.push(name.to_string());
        Ok(())
    }

    pub fn monitor(&mut self, monitored: MonitoredName) {
        self.watchdog.monitor(monitored, Instant::now());
    }

    /// Fails unless the watchdog ticks at least twice per shortest timeout
    pub fn check_watchdog(&self) -> Result<(), RuntimeError> {
        self.watchdog.validate()
    }

    pub fn start_links(&mut self, manager: LinkManager) -> Result<(), RuntimeError> {
        let commands = self
            .link_commands
            .take()
            .ok_or(RuntimeError::AlreadyRunning)?;
        self.link_task = Some(manager.spawn(commands));
        Ok(())
    }

    pub fn route(&self, dst: &str) -> Route {
        if dst == RUNTIME_NAME || dst == WATCHDOG_MANAGER_NAME {
            return Route::Runtime;
        }
        if self.actors.contains_key(dst) {
            return Route::Actor(dst.to_string());
        }
        if dst == self.layout.scada_alias() {
            if let Some(primary) = &self.primary_scada {
                return Route::Actor(primary.clone());
            }
        }
        if dst == self.layout.atn_alias() {
            return Route::Link(LinkName::Upstream);
        }
        match self.layout.node(dst).map(|n| n.actor_class) {
            Some(ActorClass::Atn) => Route::Link(LinkName::Upstream),
            Some(ActorClass::Admin) => Route::Link(LinkName::Local),
            _ => Route::Drop,
        }
    }

    /// Route one message; returns the shutdown it requests, if any
    pub fn dispatch(&mut self, mut message: Message) -> Option<InternalShutdown> {
        match self.route(message.dst()) {
            Route::Runtime => match message.payload {
                Payload::PatInternalWatchdog(pat) => {
                    self.watchdog.pat(&pat.src, Instant::now());
                    None
                }
                Payload::InternalShutdown(shutdown) => Some(shutdown),
                other => {
                    log::warn!(
                        "Runtime does not handle {} from {}",
                        other.type_name(),
                        message.header.src
                    );
                    None
                }
            },
            Route::Actor(name) => {
                // do_send ignores the mailbox capacity, so bursts are kept
                if let Some(entry) = self.actors.get(&name) {
                    entry.envelope.do_send(Envelope(message));
                }
                None
            }
            Route::Link(link) => {
                message.header.src = self.services.gnode_alias().to_string();
                self.services.publish_message(link, message);
                None
            }
            Route::Drop => {
                log::warn!(
                    "No route to {}, dropping {} from {}",
                    message.dst(),
                    message.payload.type_name(),
                    message.src()
                );
                None
            }
        }
    }

    /// Dispatch until something asks for a shutdown
    pub async fn run(&mut self) -> Result<InternalShutdown, RuntimeError> {
        self.check_watchdog()?;
        let mut inbound = self.inbound.take().ok_or(RuntimeError::AlreadyRunning)?;
        self.watchdog.restart(Instant::now());
        if let Some(notifier) = &self.notifier {
            notifier.notify("READY=1");
        }
        log::info!(
            "Runtime dispatching for {} actors, watchdog every {:?}",
            self.actors.len(),
            self.watchdog.pat_period()
        );

        let mut tick = tokio::time::interval(self.watchdog.pat_period());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => {
                        log::trace!(
                            "{} -> {}: {}",
                            message.src(),
                            message.dst(),
                            message.payload.type_name()
                        );
                        if let Some(shutdown) = self.dispatch(message) {
                            break shutdown;
                        }
                    }
                    None => break InternalShutdown {
                        reason: "inbound queue closed".to_string(),
                        exit_code: InternalShutdown::CLEAN,
                    },
                },
                _ = tick.tick() => {
                    if let Some(shutdown) = self.watchdog.check(Instant::now()) {
                        break shutdown;
                    }
                    if let Some(notifier) = &self.notifier {
                        notifier.notify("WATCHDOG=1");
                    }
                }
            }
        };
        log::warn!(
            "Internal shutdown (exit code {}): {}",
            shutdown.exit_code,
            shutdown.reason
        );
        Ok(shutdown)
    }

    /// Cancel every task, stop every actor, then the links. Failures are
    /// logged and otherwise ignored; stopping twice does nothing.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(notifier) = &self.notifier {
            notifier.notify("STOPPING=1");
        }
        self.services.tasks().cancel_all();

        for name in self.started.iter().rev() {
            let Some(entry) = self.actors.get(name) else {
                continue;
            };
            match tokio::time::timeout(self.settings.shutdown_timeout, entry.shutdown.send(Shutdown))
                .await
            {
                Ok(Ok(())) => log::debug!("Stopped actor {name}"),
                Ok(Err(e)) => log::debug!("Actor {name} already gone: {e:}"),
                Err(_) => log::warn!("Actor {name} did not stop in time"),
            }
        }

        self.services.stop_links();
        if let Some(task) = self.link_task.take() {
            if tokio::time::timeout(self.settings.shutdown_timeout, task)
                .await
                .is_err()
            {
                log::warn!("Link manager did not stop in time");
            }
        }
        log::info!("Runtime stopped");
    }
}
