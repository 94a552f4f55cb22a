//! Test doubles shared by the actor tests
use futures::future::BoxFuture;
use scada_link::LinkName;
use scada_runtime::{ServicesHandle, TaskHandle};
use scada_types::{
    layout::test_layout_json, FsmFullReport, Glitch, HardwareLayout, Message, Payload,
};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex,
};
use tokio::time::Duration;

pub fn layout() -> HardwareLayout {
    HardwareLayout::from_json(test_layout_json()).unwrap()
}

pub struct Timer {
    pub name: String,
    pub delay: Duration,
    pub message: Message,
    pub handle: TaskHandle,
}

/// Records everything an actor asks of its services. Timers are recorded
/// rather than fired; tests deliver the timer message themselves.
pub struct RecordingServices {
    layout: HardwareLayout,
    now_ms: AtomicI64,
    sent: Mutex<Vec<Message>>,
    published: Mutex<Vec<(LinkName, Payload)>>,
    timers: Mutex<Vec<Timer>>,
    pats: Mutex<Vec<String>>,
}

impl RecordingServices {
    pub fn new() -> Self {
        Self {
            layout: layout(),
            now_ms: AtomicI64::new(1_700_000_000_000),
            sent: Mutex::new(vec![]),
            published: Mutex::new(vec![]),
            timers: Mutex::new(vec![]),
            pats: Mutex::new(vec![]),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn advance_ms(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, dst: &str) -> Vec<Message> {
        self.sent()
            .into_iter()
            .filter(|m| m.dst() == dst)
            .collect()
    }

    pub fn full_reports(&self) -> Vec<(String, FsmFullReport)> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m.payload {
                Payload::FsmFullReport(report) => Some((m.header.dst, report)),
                _ => None,
            })
            .collect()
    }

    /// Block until a message matching `pred` has been sent from another
    /// thread, and take it
    pub fn wait_for(&self, pred: impl Fn(&Message) -> bool) -> Message {
        for _ in 0..400 {
            {
                let mut sent = self.sent.lock().unwrap();
                if let Some(pos) = sent.iter().position(&pred) {
                    return sent.remove(pos);
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("timed out waiting for a message");
    }

    pub fn published(&self) -> Vec<(LinkName, Payload)> {
        self.published.lock().unwrap().clone()
    }

    pub fn take_published(&self) -> Vec<(LinkName, Payload)> {
        std::mem::take(&mut *self.published.lock().unwrap())
    }

    pub fn glitches(&self) -> Vec<Glitch> {
        self.published()
            .into_iter()
            .filter_map(|(_, p)| match p {
                Payload::Glitch(glitch) => Some(glitch),
                _ => None,
            })
            .collect()
    }

    pub fn take_timers(&self) -> Vec<Timer> {
        std::mem::take(&mut *self.timers.lock().unwrap())
    }

    pub fn pats(&self) -> Vec<String> {
        self.pats.lock().unwrap().clone()
    }
}

impl ServicesHandle for RecordingServices {
    fn send(&self, message: Message) {
        self.sent.lock().unwrap().push(message);
    }

    fn send_after(&self, name: &str, delay: Duration, message: Message) -> TaskHandle {
        let handle = self.spawn(name, Box::pin(futures::future::pending::<()>()));
        self.timers.lock().unwrap().push(Timer {
            name: name.to_string(),
            delay,
            message,
            handle: handle.clone(),
        });
        handle
    }

    fn spawn(&self, name: &str, task: BoxFuture<'static, ()>) -> TaskHandle {
        let handle = tokio::spawn(task);
        TaskHandle::new(name, handle.abort_handle())
    }

    fn pat_watchdog(&self, src: &str) {
        self.pats.lock().unwrap().push(src.to_string());
    }

    fn publish(&self, link: LinkName, payload: Payload) {
        self.published.lock().unwrap().push((link, payload));
    }

    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn gnode_alias(&self) -> &str {
        self.layout.scada_alias()
    }

    fn layout(&self) -> &HardwareLayout {
        &self.layout
    }
}
