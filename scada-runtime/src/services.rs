use futures::future::BoxFuture;
use scada_link::{LinkCommand, LinkName};
use scada_types::{
    now_unix_ms, HardwareLayout, Message, PatInternalWatchdog, Payload, WATCHDOG_MANAGER_NAME,
};
use std::sync::{Arc, Mutex};
use tokio::{
    sync::mpsc::UnboundedSender,
    task::AbortHandle,
    time::Duration,
};

/// What an actor may ask of the runtime hosting it. Actors only ever
/// see this capability, never the runtime itself.
pub trait ServicesHandle: Send + Sync {
    /// Queue a message for routing by destination
    fn send(&self, message: Message);

    /// Queue `message` once `delay` has elapsed. The receiving actor must
    /// re-check its own state when the message arrives.
    fn send_after(&self, name: &str, delay: Duration, message: Message) -> TaskHandle;

    fn spawn(&self, name: &str, task: BoxFuture<'static, ()>) -> TaskHandle;

    fn pat_watchdog(&self, src: &str);

    /// Publish to the peer on the other end of `link`
    fn publish(&self, link: LinkName, payload: Payload);

    fn now_ms(&self) -> i64;

    fn gnode_alias(&self) -> &str;

    fn layout(&self) -> &HardwareLayout;
}

/// A named task that can be cancelled any number of times
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: String,
    abort: AbortHandle,
}

impl TaskHandle {
    pub fn new(name: &str, abort: AbortHandle) -> Self {
        Self {
            name: name.to_string(),
            abort,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Every task spawned through the services, in spawn order
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<Vec<TaskHandle>>,
}

impl TaskRegistry {
    pub fn register(&self, handle: TaskHandle) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.iter().filter(|t| !t.is_finished()).count())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel everything, most recently spawned first
    pub fn cancel_all(&self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        while let Some(task) = tasks.pop() {
            log::debug!("Cancelling task {}", task.name());
            task.cancel();
        }
    }
}

/// The runtime's implementation of [`ServicesHandle`]
pub struct Services {
    inbound: UnboundedSender<Message>,
    links: UnboundedSender<LinkCommand>,
    tasks: TaskRegistry,
    layout: Arc<HardwareLayout>,
}

impl Services {
    pub fn new(
        layout: Arc<HardwareLayout>,
        inbound: UnboundedSender<Message>,
        links: UnboundedSender<LinkCommand>,
    ) -> Self {
        Self {
            inbound,
            links,
            tasks: TaskRegistry::default(),
            layout,
        }
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn inbound(&self) -> UnboundedSender<Message> {
        self.inbound.clone()
    }

    /// Name of whoever is on the other end of `link`
    pub fn peer_of(&self, link: LinkName) -> String {
        match link {
            LinkName::Upstream => self.layout.atn_alias().to_string(),
            LinkName::Local => self
                .layout
                .admin()
                .map(|n| n.name.clone())
                .unwrap_or_else(|| "admin".to_string()),
        }
    }

    /// Hand a fully addressed message to the link manager
    pub fn publish_message(&self, link: LinkName, message: Message) {
        let type_name = message.payload.type_name();
        if self.links.send(LinkCommand::Publish { link, message }).is_err() {
            log::warn!("Link manager gone, dropping {type_name} for {link}");
        }
    }

    pub fn stop_links(&self) {
        self.links.send(LinkCommand::Stop).ok();
    }
}

impl ServicesHandle for Services {
    fn send(&self, message: Message) {
        if let Err(e) = self.inbound.send(message) {
            log::error!(
                "Inbound queue closed, dropping {} for {}",
                e.0.payload.type_name(),
                e.0.dst()
            );
        }
    }

    fn send_after(&self, name: &str, delay: Duration, message: Message) -> TaskHandle {
        let inbound = self.inbound.clone();
        self.spawn(
            name,
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                inbound.send(message).ok();
            }),
        )
    }

    fn spawn(&self, name: &str, task: BoxFuture<'static, ()>) -> TaskHandle {
        let handle = tokio::spawn(task);
        self.tasks
            .register(TaskHandle::new(name, handle.abort_handle()));
        TaskHandle::new(name, handle.abort_handle())
    }

    fn pat_watchdog(&self, src: &str) {
        self.send(Message::new(
            src,
            WATCHDOG_MANAGER_NAME,
            Payload::PatInternalWatchdog(PatInternalWatchdog {
                src: src.to_string(),
            }),
        ));
    }

    fn publish(&self, link: LinkName, payload: Payload) {
        let message = Message::new(self.gnode_alias(), self.peer_of(link), payload);
        self.publish_message(link, message);
    }

    fn now_ms(&self) -> i64 {
        now_unix_ms()
    }

    fn gnode_alias(&self) -> &str {
        self.layout.scada_alias()
    }

    fn layout(&self) -> &HardwareLayout {
        &self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scada_types::{layout::test_layout_json, SiegLoopReady};
    use tokio::sync::mpsc::unbounded_channel;

    fn services() -> (
        Services,
        tokio::sync::mpsc::UnboundedReceiver<Message>,
        tokio::sync::mpsc::UnboundedReceiver<LinkCommand>,
    ) {
        let layout = Arc::new(HardwareLayout::from_json(test_layout_json()).unwrap());
        let (inbound, inbound_rx) = unbounded_channel();
        let (links, links_rx) = unbounded_channel();
        (Services::new(layout, inbound, links), inbound_rx, links_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn send_after_delivers_later() {
        let (services, mut inbound, _) = services();
        services.send_after(
            "sieg-wait",
            Duration::from_secs(5),
            Message::new("a", "s", Payload::SiegLoopReady(SiegLoopReady {})),
        );
        let start = tokio::time::Instant::now();
        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.dst(), "s");
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let (services, mut inbound, _) = services();
        let handle = services.send_after(
            "sieg-wait",
            Duration::from_secs(5),
            Message::new("a", "s", Payload::SiegLoopReady(SiegLoopReady {})),
        );
        handle.cancel();
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_all_stops_everything() {
        let (services, _, _) = services();
        for i in 0..3 {
            services.spawn(
                &format!("forever-{i}"),
                Box::pin(futures::future::pending::<()>()),
            );
        }
        assert_eq!(services.tasks().len(), 3);
        services.tasks().cancel_all();
        tokio::task::yield_now().await;
        assert!(services.tasks().is_empty());
    }

    #[tokio::test]
    async fn publish_addresses_the_peer() {
        let (services, _, mut links) = services();
        services.publish(LinkName::Upstream, Payload::SiegLoopReady(SiegLoopReady {}));
        match links.recv().await.unwrap() {
            LinkCommand::Publish { link, message } => {
                assert_eq!(link, LinkName::Upstream);
                assert_eq!(message.src(), "hw1.isone.me.versant.keene.beech.scada");
                assert_eq!(message.dst(), "hw1.isone.me.versant.keene.beech");
            }
            LinkCommand::Stop => panic!("unexpected stop"),
        }
    }
}
