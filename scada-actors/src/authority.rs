//! Who may command whom.
//!
//! The [`CommandTree`] maps every node name to its current [`Handle`].
//! The primary scada owns the authoritative tree and rebuilds it for the
//! current [`CommandMode`]; every other actor keeps a read-only copy,
//! replaced whenever a `NewCommandTree` arrives.
use scada_link::LinkName;
use scada_runtime::ServicesHandle;
use scada_types::{
    ActorClass, FsmEvent, FsmEventType, Glitch, Handle, HardwareLayout, LogLevel,
    NewCommandTree, Payload, SchemaError,
};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};
use thiserror::Error;

/// Root of the handles laid out in the hardware layout
pub const AUTO_ROOT: &str = "auto";
pub const ATN_ROOT: &str = "a";
pub const HOME_ROOT: &str = "h";
/// Boss of every relay while an admin holds the lease
pub const ADMIN_HANDLE: &str = "h.admin";

pub const GLITCH_DEBOUNCE_MS: i64 = 500;
pub const DEFAULT_ADMIN_TIMEOUT_S: u64 = 300;
pub const MAX_ADMIN_TIMEOUT_S: u64 = 3600;

#[derive(Error, Debug)]
pub enum AuthorityError {
    #[error("Schema Error")]
    Schema(#[from] SchemaError),
    #[error("No node with handle {0}")]
    UnknownHandle(Handle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandMode {
    Auto,
    Atn,
    HomeAlone,
    Admin,
}

impl CommandMode {
    /// Pick the mode from what currently holds authority, strongest first
    pub fn select(admin_lease: bool, atn_contract: bool, upstream_active: bool) -> Self {
        if admin_lease {
            CommandMode::Admin
        } else if atn_contract {
            CommandMode::Atn
        } else if upstream_active {
            CommandMode::Auto
        } else {
            CommandMode::HomeAlone
        }
    }
}

impl fmt::Display for CommandMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Node name to handle, for one command mode
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTree {
    handles: BTreeMap<String, Handle>,
}

/// Move a descendant of `auto` under another root. `auto` itself keeps its
/// own name and so drops out of the chain of command.
fn slide(handle: &Handle, root: &str) -> Handle {
    if handle.root() == AUTO_ROOT && handle.depth() > 1 {
        handle.with_root(root)
    } else {
        handle.clone()
    }
}

impl CommandTree {
    pub fn for_mode(layout: &HardwareLayout, mode: CommandMode) -> Result<Self, AuthorityError> {
        let mut handles = BTreeMap::new();
        for node in &layout.sh_nodes {
            let base = node.layout_handle();
            let handle = match mode {
                CommandMode::Auto => base,
                CommandMode::Atn => slide(&base, ATN_ROOT),
                CommandMode::HomeAlone => slide(&base, HOME_ROOT),
                CommandMode::Admin => match node.actor_class {
                    ActorClass::Relay => Handle::new(ADMIN_HANDLE)?.child(base.leaf()),
                    ActorClass::Admin => Handle::new(ADMIN_HANDLE)?,
                    _ => slide(&base, HOME_ROOT),
                },
            };
            handles.insert(node.name.clone(), handle);
        }
        Ok(Self { handles })
    }

    pub fn from_handles(handles: BTreeMap<String, Handle>) -> Self {
        Self { handles }
    }

    pub fn to_payload(&self) -> NewCommandTree {
        NewCommandTree {
            handles: self.handles.clone(),
        }
    }

    pub fn handle(&self, name: &str) -> Option<&Handle> {
        self.handles.get(name)
    }

    pub fn is_sidelined(&self, name: &str) -> bool {
        self.handle(name).is_some_and(|h| h.is_sidelined(name))
    }

    /// The node currently holding `handle`. Sidelined nodes are never
    /// found this way.
    pub fn name_of(&self, handle: &Handle) -> Option<&str> {
        self.handles
            .iter()
            .find(|(name, h)| *h == handle && !h.is_sidelined(name.as_str()))
            .map(|(name, _)| name.as_str())
    }

    /// Handle of a message source: a local node name, or the AtomicTNode's
    /// g-node alias standing for the Atn node
    pub fn resolve_sender(&self, layout: &HardwareLayout, src: &str) -> Option<&Handle> {
        if src == layout.atn_alias() {
            return layout.atn().and_then(|atn| self.handle(&atn.name));
        }
        self.handle(src)
    }
}

/// Why a command was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardFailure {
    BadBoss,
    HandleMismatch,
    BadEventType,
    ActuatorsNotReady,
    NotMyRelay,
}

impl GuardFailure {
    pub fn summary(&self) -> &'static str {
        match self {
            GuardFailure::BadBoss => "bad_boss",
            GuardFailure::HandleMismatch => "handle_mismatch",
            GuardFailure::BadEventType => "bad_event_type",
            GuardFailure::ActuatorsNotReady => "actuators_not_ready",
            GuardFailure::NotMyRelay => "not_my_relay",
        }
    }
}

impl fmt::Display for GuardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.summary())
    }
}

/// The checks every commanded node runs on an incoming event, in order:
/// addressed to my handle (and, for `boss_only`, sent by one of my
/// ancestors), sender holds the handle it claims, and the event type is
/// one I accept.
pub fn check_command(
    tree: &CommandTree,
    layout: &HardwareLayout,
    me: &str,
    src: &str,
    event: &FsmEvent,
    accepted: &[FsmEventType],
    boss_only: bool,
) -> Result<(), GuardFailure> {
    let Some(mine) = tree.handle(me) else {
        return Err(GuardFailure::BadBoss);
    };
    if event.to_handle != *mine
        || mine.is_sidelined(me)
        || (boss_only && !mine.is_descendant_of(&event.from_handle))
    {
        return Err(GuardFailure::BadBoss);
    }
    match tree.resolve_sender(layout, src) {
        Some(sender) if *sender == event.from_handle => {}
        _ => return Err(GuardFailure::HandleMismatch),
    }
    if !accepted.contains(&event.event_type) {
        return Err(GuardFailure::BadEventType);
    }
    Ok(())
}

/// Sends glitches upstream, at most one per sender and summary within
/// [`GLITCH_DEBOUNCE_MS`]
#[derive(Debug, Default)]
pub struct GlitchLimiter {
    last_sent: HashMap<(String, String), i64>,
}

impl GlitchLimiter {
    /// Returns whether the glitch went out
    pub fn report(
        &mut self,
        services: &dyn ServicesHandle,
        node: &str,
        sender: &str,
        summary: &str,
        details: String,
    ) -> bool {
        let now = services.now_ms();
        self.last_sent
            .retain(|_, sent| now - *sent < GLITCH_DEBOUNCE_MS);
        let key = (sender.to_string(), summary.to_string());
        if self.last_sent.contains_key(&key) {
            log::debug!("{node}: suppressing repeated {summary} from {sender}");
            return false;
        }
        self.last_sent.insert(key, now);

        log::warn!("{node}: {summary} from {sender}: {details}");
        services.publish(
            LinkName::Upstream,
            Payload::Glitch(Glitch {
                from_gnode_alias: services.gnode_alias().to_string(),
                node: node.to_string(),
                log_level: LogLevel::Warning,
                summary: summary.to_string(),
                details,
                created_ms: now,
            }),
        );
        true
    }
}

/// Authority granted to the admin node for a bounded time
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AdminLease {
    expires_ms: Option<i64>,
}

impl AdminLease {
    /// Start or extend the lease, returning the granted seconds
    pub fn wake(&mut self, timeout_s: Option<u64>, now_ms: i64) -> u64 {
        let granted = timeout_s
            .unwrap_or(DEFAULT_ADMIN_TIMEOUT_S)
            .min(MAX_ADMIN_TIMEOUT_S);
        self.expires_ms = Some(now_ms + granted as i64 * 1000);
        granted
    }

    /// End the lease; returns whether one was held
    pub fn release(&mut self) -> bool {
        self.expires_ms.take().is_some()
    }

    pub fn is_active(&self, now_ms: i64) -> bool {
        self.expires_ms.is_some_and(|expires| now_ms < expires)
    }

    /// Drop a lease that ran out; returns whether that just happened
    pub fn expire(&mut self, now_ms: i64) -> bool {
        if self.expires_ms.is_some() && !self.is_active(now_ms) {
            self.expires_ms = None;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{layout, RecordingServices};
    use scada_types::{new_trigger_id, FsmEventName};

    fn h(handle: &str) -> Handle {
        Handle::new(handle).unwrap()
    }

    fn open(from: &str, to: &str) -> FsmEvent {
        FsmEvent::new(
            h(from),
            h(to),
            FsmEventType::ChangeRelayState,
            FsmEventName::OpenRelay,
            0,
            new_trigger_id(),
        )
        .unwrap()
    }

    #[test]
    fn trees_per_mode() {
        let layout = layout();
        let auto = CommandTree::for_mode(&layout, CommandMode::Auto).unwrap();
        assert_eq!(auto.handle("vdc-relay").unwrap(), "auto.home.vdc-relay");
        assert!(auto.is_sidelined("admin"));

        let atn = CommandTree::for_mode(&layout, CommandMode::Atn).unwrap();
        assert_eq!(atn.handle("vdc-relay").unwrap(), "a.home.vdc-relay");
        assert_eq!(atn.handle("a").unwrap(), "a");
        assert!(atn.is_sidelined("auto"));

        let home = CommandTree::for_mode(&layout, CommandMode::HomeAlone).unwrap();
        assert_eq!(
            home.handle("hp-scada-ops-relay").unwrap(),
            "h.home.hp-boss.hp-scada-ops-relay"
        );

        let admin = CommandTree::for_mode(&layout, CommandMode::Admin).unwrap();
        assert_eq!(admin.handle("vdc-relay").unwrap(), "h.admin.vdc-relay");
        assert_eq!(
            admin.handle("hp-scada-ops-relay").unwrap(),
            "h.admin.hp-scada-ops-relay"
        );
        assert_eq!(admin.handle("admin").unwrap(), "h.admin");
        assert_eq!(admin.handle("hp-boss").unwrap(), "h.home.hp-boss");
        assert_eq!(admin.name_of(&h("h.admin.vdc-relay")), Some("vdc-relay"));
        assert_eq!(auto.name_of(&h("admin")), None);
    }

    #[test]
    fn mode_selection_order() {
        assert_eq!(CommandMode::select(true, true, true), CommandMode::Admin);
        assert_eq!(CommandMode::select(false, true, false), CommandMode::Atn);
        assert_eq!(CommandMode::select(false, false, true), CommandMode::Auto);
        assert_eq!(CommandMode::select(false, false, false), CommandMode::HomeAlone);
    }

    #[test]
    fn guards_run_in_order() {
        let layout = layout();
        let admin = CommandTree::for_mode(&layout, CommandMode::Admin).unwrap();
        let auto = CommandTree::for_mode(&layout, CommandMode::Auto).unwrap();
        let accepted = [FsmEventType::ChangeRelayState];
        let event = open("h.admin", "h.admin.vdc-relay");

        assert_eq!(
            check_command(&admin, &layout, "vdc-relay", "admin", &event, &accepted, true),
            Ok(())
        );
        assert_eq!(
            check_command(&auto, &layout, "vdc-relay", "admin", &event, &accepted, true),
            Err(GuardFailure::BadBoss)
        );
        assert_eq!(
            check_command(&admin, &layout, "vdc-relay", "hp-boss", &event, &accepted, true),
            Err(GuardFailure::HandleMismatch)
        );
        assert_eq!(
            check_command(
                &admin,
                &layout,
                "vdc-relay",
                "admin",
                &event,
                &[FsmEventType::ChangeValveState],
                true
            ),
            Err(GuardFailure::BadEventType)
        );

        // a sibling holding the right handle is still not the boss
        let sibling = open("h.admin.zone-valve", "h.admin.vdc-relay");
        assert_eq!(
            check_command(&admin, &layout, "vdc-relay", "zone-valve", &sibling, &accepted, true),
            Err(GuardFailure::BadBoss)
        );
    }

    #[test]
    fn atn_alias_resolves_to_the_atn_node() {
        let layout = layout();
        let atn = CommandTree::for_mode(&layout, CommandMode::Atn).unwrap();
        let event = open("a", "a.home.vdc-relay");
        assert_eq!(
            check_command(
                &atn,
                &layout,
                "vdc-relay",
                "hw1.isone.me.versant.keene.beech",
                &event,
                &[FsmEventType::ChangeRelayState],
                true
            ),
            Ok(())
        );
    }

    #[test]
    fn glitches_are_debounced() {
        let services = RecordingServices::new();
        let mut limiter = GlitchLimiter::default();
        assert!(limiter.report(&services, "vdc-relay", "admin", "bad_boss", "x".into()));
        services.advance_ms(200);
        assert!(!limiter.report(&services, "vdc-relay", "admin", "bad_boss", "x".into()));
        assert!(limiter.report(&services, "vdc-relay", "hp-boss", "bad_boss", "x".into()));
        services.advance_ms(400);
        assert!(limiter.report(&services, "vdc-relay", "admin", "bad_boss", "x".into()));
        assert_eq!(services.glitches().len(), 3);
    }

    #[test]
    fn admin_lease_bounds() {
        let mut lease = AdminLease::default();
        assert!(!lease.is_active(0));
        assert_eq!(lease.wake(None, 0), DEFAULT_ADMIN_TIMEOUT_S);
        assert!(lease.is_active(299_999));
        assert!(!lease.expire(299_999));
        assert!(lease.expire(300_000));
        assert!(!lease.is_active(300_000));

        assert_eq!(lease.wake(Some(100_000), 0), MAX_ADMIN_TIMEOUT_S);
        assert!(lease.release());
        assert!(!lease.release());
    }
}
