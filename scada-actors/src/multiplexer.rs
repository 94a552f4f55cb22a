use scada_link::LinkName;
use scada_runtime::ServicesHandle;
use scada_types::{
    AboutFsm, ActuationSettled, ActuatorsReady, FsmAtomicReport, FsmEvent, FsmEventName,
    FsmEventType, FsmReportType, LogLevel, Message, Payload, ProblemEvent, RelayActorConfig,
    TriggerId,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{mpsc, Arc, Mutex},
};
use thiserror::Error;
use tokio::time::Duration;

use crate::{
    authority::{check_command, GuardFailure},
    relay::pin_label,
    ActorError, CommandTree, GlitchLimiter, Node,
};

const INIT_FAILED: &str = "relay_board_init_failed";
const PIN_WRITE_FAILED: &str = "pin_write_failed";

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("I2C bus {0} unavailable")]
    BusUnavailable(String),
    #[error("Write to relay {0} failed")]
    WriteFailed(u8),
    #[error("Driver thread for {0} is gone")]
    Gone(String),
    #[error("No relay component for {0}")]
    NoComponent(String),
}

/// Synchronous access to one relay board. Runs on a dedicated OS thread,
/// so implementations may block.
pub trait PinDriver: Send + 'static {
    /// Bring the board up with every pin de-energized
    fn init(&mut self) -> Result<(), DriverError>;

    fn set_pin(&mut self, relay_idx: u8, energized: bool) -> Result<(), DriverError>;
}

/// A relay board held in memory, for running without hardware
#[derive(Debug, Clone, Default)]
pub struct SimulatedBoard {
    pins: Arc<Mutex<BTreeMap<u8, bool>>>,
    failing: Arc<Mutex<HashSet<u8>>>,
    unavailable: bool,
}

impl SimulatedBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A board whose bus never comes up
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn pin(&self, relay_idx: u8) -> Option<bool> {
        self.pins
            .lock()
            .ok()
            .and_then(|pins| pins.get(&relay_idx).copied())
    }

    /// Make every later write to this pin fail
    pub fn fail_pin(&self, relay_idx: u8) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(relay_idx);
        }
    }
}

impl PinDriver for SimulatedBoard {
    fn init(&mut self) -> Result<(), DriverError> {
        if self.unavailable {
            return Err(DriverError::BusUnavailable("simulated".to_string()));
        }
        if let Ok(mut pins) = self.pins.lock() {
            pins.values_mut().for_each(|p| *p = false);
        }
        Ok(())
    }

    fn set_pin(&mut self, relay_idx: u8, energized: bool) -> Result<(), DriverError> {
        if self
            .failing
            .lock()
            .map(|f| f.contains(&relay_idx))
            .unwrap_or(true)
        {
            return Err(DriverError::WriteFailed(relay_idx));
        }
        if let Ok(mut pins) = self.pins.lock() {
            pins.insert(relay_idx, energized);
        }
        Ok(())
    }
}

enum DriverCommand {
    Init,
    SetPin {
        relay_idx: u8,
        energized: bool,
        report: FsmAtomicReport,
    },
}

/// Runs `driver` on its own thread. Every command produces exactly one
/// message back to `name` through the inbound queue, in command order.
fn spawn_driver(
    name: &str,
    services: Arc<dyn ServicesHandle>,
    mut driver: Box<dyn PinDriver>,
) -> std::io::Result<mpsc::Sender<DriverCommand>> {
    let (sender, receiver) = mpsc::channel();
    let name = name.to_string();
    std::thread::Builder::new()
        .name(format!("{name}-driver"))
        .spawn(move || {
            let post = |payload| services.send(Message::new(name.as_str(), name.as_str(), payload));
            let problem = |summary: &str, e: DriverError| {
                Payload::ProblemEvent(ProblemEvent {
                    src: name.clone(),
                    problem_type: LogLevel::Error,
                    summary: summary.to_string(),
                    details: e.to_string(),
                    time_created_ms: services.now_ms(),
                })
            };
            while let Ok(command) = receiver.recv() {
                match command {
                    DriverCommand::Init => match driver.init() {
                        Ok(()) => post(Payload::ActuatorsReady(ActuatorsReady {})),
                        Err(e) => post(problem(INIT_FAILED, e)),
                    },
                    DriverCommand::SetPin {
                        relay_idx,
                        energized,
                        mut report,
                    } => match driver.set_pin(relay_idx, energized) {
                        Ok(()) => {
                            report.unix_time_ms = services.now_ms();
                            post(Payload::FsmAtomicReport(report))
                        }
                        Err(e) => post(problem(PIN_WRITE_FAILED, e)),
                    },
                }
            }
            log::debug!("{name} driver thread exiting");
        })?;
    Ok(sender)
}

struct InFlight {
    relay: String,
    relay_idx: u8,
    energized: bool,
}

/// Owns one I²C relay board. Relays ask for pin changes with
/// `ChangeRelayPin` events; the multiplexer drives the pin and posts its
/// action report back, after the actuation delay for slow valves.
pub struct Multiplexer {
    name: String,
    services: Arc<dyn ServicesHandle>,
    tree: CommandTree,
    relays: BTreeMap<String, RelayActorConfig>,
    ready: bool,
    pins: BTreeMap<u8, bool>,
    driver: Option<Box<dyn PinDriver>>,
    commands: Option<mpsc::Sender<DriverCommand>>,
    in_flight: VecDeque<InFlight>,
    settling: HashMap<(String, TriggerId), FsmAtomicReport>,
    glitches: GlitchLimiter,
}

impl Multiplexer {
    pub fn new(
        name: &str,
        services: Arc<dyn ServicesHandle>,
        tree: CommandTree,
        driver: Box<dyn PinDriver>,
    ) -> Result<Self, DriverError> {
        let layout = services.layout();
        let component = layout
            .node(name)
            .and_then(|n| n.component_id.as_deref())
            .and_then(|id| layout.relay_component(id))
            .ok_or_else(|| DriverError::NoComponent(name.to_string()))?;
        let relays = component
            .config_list
            .iter()
            .map(|c| (c.actor_name.clone(), c.clone()))
            .collect();
        log::info!(
            "{name} driving {} relays on {}",
            component.config_list.len(),
            component.bus
        );
        Ok(Self {
            name: name.to_string(),
            services,
            tree,
            relays,
            ready: false,
            pins: BTreeMap::new(),
            driver: Some(driver),
            commands: None,
            in_flight: VecDeque::new(),
            settling: HashMap::new(),
            glitches: GlitchLimiter::default(),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn command(&self, command: DriverCommand) -> Result<(), DriverError> {
        self.commands
            .as_ref()
            .and_then(|c| c.send(command).ok())
            .ok_or_else(|| DriverError::Gone(self.name.clone()))
    }

    fn post_back(&self, relay: &str, report: FsmAtomicReport) {
        self.services.send(Message::new(
            self.name.as_str(),
            relay,
            Payload::FsmAtomicReport(report),
        ));
    }

    fn on_event(&mut self, src: &str, event: FsmEvent) -> Result<(), ActorError> {
        let guard = check_command(
            &self.tree,
            self.services.layout(),
            &self.name,
            src,
            &event,
            &[FsmEventType::ChangeRelayPin],
            false,
        )
        .and_then(|()| {
            if self.ready {
                Ok(())
            } else {
                Err(GuardFailure::ActuatorsNotReady)
            }
        });
        let config = match guard {
            Ok(()) => self.relays.get(src).cloned(),
            Err(failure) => {
                let details = format!("{} from {}", event.event_name, event.from_handle);
                self.glitches.report(
                    self.services.as_ref(),
                    &self.name,
                    src,
                    failure.summary(),
                    details,
                );
                return Ok(());
            }
        };
        let Some(config) = config else {
            self.glitches.report(
                self.services.as_ref(),
                &self.name,
                src,
                GuardFailure::NotMyRelay.summary(),
                format!("{src} is not on this board"),
            );
            return Ok(());
        };

        let energized = event.event_name == FsmEventName::Energize;
        let was = self.pins.get(&config.relay_idx).copied().unwrap_or(false);
        let report = FsmAtomicReport {
            from_handle: event.to_handle.clone(),
            about_fsm: AboutFsm::RelayPinState,
            report_type: FsmReportType::Action,
            event_type: FsmEventType::ChangeRelayPin,
            event_name: event.event_name,
            from_state: pin_label(was).to_string(),
            to_state: pin_label(energized).to_string(),
            unix_time_ms: self.services.now_ms(),
            trigger_id: event.trigger_id,
        };
        self.command(DriverCommand::SetPin {
            relay_idx: config.relay_idx,
            energized,
            report,
        })?;
        self.in_flight.push_back(InFlight {
            relay: src.to_string(),
            relay_idx: config.relay_idx,
            energized,
        });
        Ok(())
    }

    /// The driver moved a pin
    fn on_pin_moved(&mut self, report: FsmAtomicReport) {
        let Some(done) = self.in_flight.pop_front() else {
            log::error!("{} pin report with nothing in flight", self.name);
            return;
        };
        self.pins.insert(done.relay_idx, done.energized);
        let actuation_ms = self
            .relays
            .get(&done.relay)
            .filter(|c| c.is_slow())
            .and_then(|c| c.actuation_ms);
        match actuation_ms {
            Some(ms) => {
                let settled = Message::new(
                    self.name.as_str(),
                    self.name.as_str(),
                    Payload::ActuationSettled(ActuationSettled {
                        relay_name: done.relay.clone(),
                        trigger_id: report.trigger_id,
                    }),
                );
                self.services.send_after(
                    &format!("{}-settle", done.relay),
                    Duration::from_millis(ms),
                    settled,
                );
                self.settling
                    .insert((done.relay, report.trigger_id), report);
            }
            None => self.post_back(&done.relay, report),
        }
    }

    fn on_settled(&mut self, settled: ActuationSettled) {
        match self
            .settling
            .remove(&(settled.relay_name.clone(), settled.trigger_id))
        {
            Some(mut report) => {
                report.unix_time_ms = self.services.now_ms();
                self.post_back(&settled.relay_name, report);
            }
            None => log::warn!(
                "{} nothing settling for {} trigger {}",
                self.name,
                settled.relay_name,
                settled.trigger_id
            ),
        }
    }

    fn on_problem(&mut self, problem: ProblemEvent) {
        if problem.summary == PIN_WRITE_FAILED {
            if let Some(failed) = self.in_flight.pop_front() {
                log::error!(
                    "{} failed to move pin {} for {}: {}",
                    self.name,
                    failed.relay_idx,
                    failed.relay,
                    problem.details
                );
            }
        } else {
            log::error!("{} {}: {}", self.name, problem.summary, problem.details);
        }
        self.services
            .publish(LinkName::Upstream, Payload::ProblemEvent(problem));
    }

    fn on_ready(&mut self) {
        self.ready = true;
        self.pins = self
            .relays
            .values()
            .map(|c| (c.relay_idx, false))
            .collect();
        for relay in self.relays.keys() {
            self.services.send(Message::new(
                self.name.as_str(),
                relay.as_str(),
                Payload::ActuatorsReady(ActuatorsReady {}),
            ));
        }
    }
}

impl Node for Multiplexer {
    fn name(&self) -> &str {
        &self.name
    }

    fn services(&self) -> &Arc<dyn ServicesHandle> {
        &self.services
    }

    fn on_start(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        match spawn_driver(&self.name, self.services.clone(), driver) {
            Ok(commands) => {
                self.commands = Some(commands);
                if let Err(e) = self.command(DriverCommand::Init) {
                    log::error!("{} unable to initialize driver: {e:}", self.name);
                }
            }
            Err(e) => log::error!("{} unable to start driver thread: {e:}", self.name),
        }
    }

    fn process(&mut self, message: Message) -> Result<(), ActorError> {
        let src = message.header.src;
        let from_self = src == self.name;
        match message.payload {
            Payload::FsmEvent(event) => self.on_event(&src, event),
            Payload::FsmAtomicReport(report) if from_self => {
                self.on_pin_moved(report);
                Ok(())
            }
            Payload::ActuationSettled(settled) if from_self => {
                self.on_settled(settled);
                Ok(())
            }
            Payload::ActuatorsReady(_) if from_self => {
                log::info!("{} relay board ready", self.name);
                self.on_ready();
                Ok(())
            }
            Payload::ProblemEvent(problem) if from_self => {
                self.on_problem(problem);
                Ok(())
            }
            Payload::NewCommandTree(tree) => {
                self.tree = CommandTree::from_handles(tree.handles);
                Ok(())
            }
            other => {
                log::warn!("{} ignoring {} from {src}", self.name, other.type_name());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        relay::{tests::event, PIN_DE_ENERGIZED, PIN_ENERGIZED},
        testing::{layout, RecordingServices},
        CommandMode, Relay,
    };

    const NAME: &str = "relay-multiplexer";

    fn from_driver(m: &Message) -> bool {
        m.src() == NAME && m.dst() == NAME
    }

    fn started(board: &SimulatedBoard) -> (Multiplexer, Arc<RecordingServices>) {
        let services = RecordingServices::shared();
        let tree = CommandTree::for_mode(&layout(), CommandMode::Admin).unwrap();
        let mut multiplexer =
            Multiplexer::new(NAME, services.clone(), tree, Box::new(board.clone())).unwrap();
        multiplexer.on_start();
        let ready = services.wait_for(from_driver);
        multiplexer.process(ready).unwrap();
        (multiplexer, services)
    }

    fn pin_change(relay: &str, event_name: FsmEventName) -> Message {
        Message::new(
            relay,
            NAME,
            Payload::FsmEvent(event(
                &format!("h.admin.{relay}"),
                "h.relay-multiplexer",
                FsmEventType::ChangeRelayPin,
                event_name,
            )),
        )
    }

    #[tokio::test]
    async fn announces_ready_to_its_relays() {
        let (multiplexer, services) = started(&SimulatedBoard::new());
        assert!(multiplexer.is_ready());
        let mut told: Vec<String> = services
            .take_sent()
            .into_iter()
            .filter(|m| matches!(m.payload, Payload::ActuatorsReady(_)))
            .map(|m| m.header.dst)
            .collect();
        told.sort();
        assert_eq!(
            told,
            vec![
                "hp-scada-ops-relay",
                "store-charge-discharge-relay",
                "vdc-relay",
                "zone-valve"
            ]
        );
    }

    #[tokio::test]
    async fn unavailable_bus_stays_not_ready() {
        let services = RecordingServices::shared();
        let tree = CommandTree::for_mode(&layout(), CommandMode::Admin).unwrap();
        let mut multiplexer = Multiplexer::new(
            NAME,
            services.clone(),
            tree,
            Box::new(SimulatedBoard::unavailable()),
        )
        .unwrap();
        multiplexer.on_start();
        let problem = services.wait_for(from_driver);
        multiplexer.process(problem).unwrap();
        assert!(!multiplexer.is_ready());
        assert!(matches!(
            &services.published()[0].1,
            Payload::ProblemEvent(p) if p.summary == INIT_FAILED
        ));

        multiplexer
            .process(pin_change("vdc-relay", FsmEventName::Energize))
            .unwrap();
        assert_eq!(services.glitches()[0].summary, "actuators_not_ready");
    }

    #[tokio::test]
    async fn drives_the_pin_and_reports_back() {
        let board = SimulatedBoard::new();
        let (mut multiplexer, services) = started(&board);
        services.take_sent();

        multiplexer
            .process(pin_change("vdc-relay", FsmEventName::Energize))
            .unwrap();
        let moved = services.wait_for(from_driver);
        multiplexer.process(moved).unwrap();
        assert_eq!(board.pin(1), Some(true));

        let back = services.sent_to("vdc-relay");
        assert_eq!(back.len(), 1);
        match &back[0].payload {
            Payload::FsmAtomicReport(r) => {
                assert_eq!(r.report_type, FsmReportType::Action);
                assert_eq!(r.from_state, PIN_DE_ENERGIZED);
                assert_eq!(r.to_state, PIN_ENERGIZED);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_valve_reports_after_actuation() {
        let (mut multiplexer, services) = started(&SimulatedBoard::new());
        services.take_sent();
        multiplexer
            .process(pin_change("zone-valve", FsmEventName::Energize))
            .unwrap();
        let moved = services.wait_for(from_driver);
        multiplexer.process(moved).unwrap();
        assert!(services.sent_to("zone-valve").is_empty());

        let timers = services.take_timers();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].delay, Duration::from_millis(15000));
        multiplexer.process(timers[0].message.clone()).unwrap();
        assert_eq!(services.sent_to("zone-valve").len(), 1);
    }

    #[tokio::test]
    async fn refuses_strangers() {
        let (mut multiplexer, services) = started(&SimulatedBoard::new());
        let stranger = Message::new(
            "hp-boss",
            NAME,
            Payload::FsmEvent(event(
                "h.home.hp-boss",
                "h.relay-multiplexer",
                FsmEventType::ChangeRelayPin,
                FsmEventName::Energize,
            )),
        );
        multiplexer.process(stranger).unwrap();
        assert_eq!(services.glitches()[0].summary, "not_my_relay");
    }

    #[tokio::test]
    async fn driver_failure_is_a_problem_not_a_report() {
        let board = SimulatedBoard::new();
        board.fail_pin(1);
        let (mut multiplexer, services) = started(&board);
        services.take_sent();
        multiplexer
            .process(pin_change("vdc-relay", FsmEventName::Energize))
            .unwrap();
        let failed = services.wait_for(from_driver);
        multiplexer.process(failed).unwrap();

        assert!(services.sent_to("vdc-relay").is_empty());
        assert!(services.published().iter().any(|(link, p)| *link == LinkName::Upstream
            && matches!(p, Payload::ProblemEvent(p) if p.summary == PIN_WRITE_FAILED)));
    }

    /// A relay and its multiplexer wired through the recorded queue
    #[tokio::test]
    async fn relay_and_board_end_to_end() {
        let board = SimulatedBoard::new();
        let (mut multiplexer, services) = started(&board);
        let tree = CommandTree::for_mode(&layout(), CommandMode::Admin).unwrap();
        let mut relay = Relay::new("vdc-relay", services.clone(), tree).unwrap();
        for m in services.take_sent() {
            if m.dst() == "vdc-relay" {
                relay.process(m).unwrap();
            }
        }

        let open = event(
            "h.admin",
            "h.admin.vdc-relay",
            FsmEventType::ChangeRelayState,
            FsmEventName::OpenRelay,
        );
        let trigger_id = open.trigger_id;
        relay
            .process(Message::new("admin", "vdc-relay", Payload::FsmEvent(open)))
            .unwrap();
        for m in services.take_sent() {
            multiplexer.process(m).unwrap();
        }
        let moved = services.wait_for(from_driver);
        multiplexer.process(moved).unwrap();
        for m in services.take_sent() {
            relay.process(m).unwrap();
        }

        assert_eq!(relay.state_label(), "RelayOpen");
        assert_eq!(board.pin(1), Some(true));
        let reports = services.full_reports();
        let (boss, full) = &reports[0];
        assert_eq!(boss, "admin");
        assert_eq!(full.trigger_id, trigger_id);
        assert_eq!(full.atomic_list.len(), 3);
        assert!(full.is_well_ordered());
    }
}
