use actix::prelude::*;
use scada_link::LinkName;
use scada_runtime::{Envelope, MonitoredName, ServicesHandle, Shutdown};
use scada_types::{LogLevel, Message, Payload, ProblemEvent};
use std::sync::Arc;
use tokio::time::Duration;

use crate::ActorError;

/// Longest an actor may go without patting the internal watchdog
pub const DEFAULT_ACTOR_TIMEOUT_S: u64 = 60;
pub const DEFAULT_PAT_PERIOD: Duration = Duration::from_secs(10);
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// The behavior of one named node. Implementations never block and never
/// talk to the runtime except through their services.
pub trait Node: Unpin + 'static {
    fn name(&self) -> &str;

    fn services(&self) -> &Arc<dyn ServicesHandle>;

    /// Runs once the hosting actor has started
    fn on_start(&mut self) {}

    fn process(&mut self, message: Message) -> Result<(), ActorError>;

    /// Runs every second
    fn on_tick(&mut self) {}
}

/// Hosts a [`Node`] as an actix actor on the runtime's event loop: feeds it
/// routed messages, ticks it, and pats the watchdog on its behalf for as
/// long as the loop keeps turning.
pub struct Hosted<N: Node> {
    node: N,
    pat_period: Duration,
}

impl<N: Node> Hosted<N> {
    pub fn new(node: N) -> Self {
        Self {
            node,
            pat_period: DEFAULT_PAT_PERIOD,
        }
    }

    pub fn with_pat_period(mut self, pat_period: Duration) -> Self {
        self.pat_period = pat_period;
        self
    }

    pub fn monitored(&self) -> MonitoredName {
        MonitoredName::new(self.node.name(), DEFAULT_ACTOR_TIMEOUT_S)
    }

    fn pat(&self) {
        self.node.services().pat_watchdog(self.node.name());
    }

    /// Errors never leave the actor: they are logged and reported upstream
    fn report_problem(&self, error: &ActorError) {
        let services = self.node.services();
        services.publish(
            LinkName::Upstream,
            Payload::ProblemEvent(ProblemEvent {
                src: self.node.name().to_string(),
                problem_type: LogLevel::Error,
                summary: error.to_string(),
                details: format!("{error:?}"),
                time_created_ms: services.now_ms(),
            }),
        );
    }
}

impl<N: Node> Actor for Hosted<N> {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::info!("Starting {}", self.node.name());
        self.pat();
        ctx.run_interval(self.pat_period, |act, _ctx| act.pat());
        ctx.run_interval(TICK_PERIOD, |act, _ctx| act.node.on_tick());
        self.node.on_start();
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        log::info!("Stopped {}", self.node.name());
    }
}

impl<N: Node> Handler<Envelope> for Hosted<N> {
    type Result = ();

    fn handle(&mut self, msg: Envelope, ctx: &mut Self::Context) {
        let type_name = msg.0.payload.type_name();
        if let Err(e) = self.node.process(msg.0) {
            log::error!("{} failed handling {type_name}: {e:}", self.node.name());
            self.report_problem(&e);
            if e.is_fatal() && cfg!(debug_assertions) {
                log::error!("{} stopping", self.node.name());
                ctx.stop();
            }
        }
    }
}

impl<N: Node> Handler<Shutdown> for Hosted<N> {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) {
        ctx.stop();
    }
}
