use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{ServiceContainer, ServiceStartContext, ServiceStopContext};

pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn open_container() -> ServiceContainer {
    let container = ServiceContainer::new();
    container.start().expect("Failed to start container");
    container
}

/// Ordered record of the lifecycle calls made to [`Recorder`]s.
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub(crate) fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("Poisoned lock").push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().expect("Poisoned lock").clone()
    }

    pub(crate) fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

/// A service exposing its own id, which journals each step of its lifecycle.
pub(crate) struct Recorder {
    id: String,
    journal: Journal,
    start_delay: Option<Duration>,
    interruptible: bool,
    stop_delay: Option<Duration>,
    fail_start: bool,
    fail_stop: bool,
    panic_start: bool,
    panic_stop: bool,
}

impl Recorder {
    pub(crate) fn new(id: impl Into<String>, journal: &Journal) -> Self {
        Self {
            id: id.into(),
            journal: journal.clone(),
            start_delay: None,
            interruptible: false,
            stop_delay: None,
            fail_start: false,
            fail_stop: false,
            panic_start: false,
            panic_stop: false,
        }
    }

    pub(crate) fn start_delay(mut self, delay: Duration, interruptible: bool) -> Self {
        self.start_delay = Some(delay);
        self.interruptible = interruptible;
        self
    }

    pub(crate) fn stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = Some(delay);
        self
    }

    pub(crate) fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub(crate) fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub(crate) fn panicking_start(mut self) -> Self {
        self.panic_start = true;
        self
    }

    pub(crate) fn panicking_stop(mut self) -> Self {
        self.panic_stop = true;
        self
    }
}

#[async_trait::async_trait]
impl crate::Service for Recorder {
    type Value = String;

    async fn start(&mut self, ctx: &mut ServiceStartContext) -> anyhow::Result<()> {
        self.journal.push(format!("start:{}", self.id));
        anyhow::ensure!(!self.fail_start, "{} refused to start", self.id);
        assert!(!self.panic_start, "{} blew up while starting", self.id);

        match self.start_delay {
            None => self.journal.push(format!("started:{}", self.id)),
            Some(delay) => {
                let journal = self.journal.clone();
                let id = self.id.clone();
                ctx.run_async(
                    async move {
                        tokio::time::sleep(delay).await;
                        journal.push(format!("started:{id}"));
                        anyhow::Ok(())
                    },
                    self.interruptible,
                )?;
            }
        }

        Ok(())
    }

    async fn stop(&mut self, ctx: &mut ServiceStopContext) -> anyhow::Result<()> {
        self.journal.push(format!("stop:{}", self.id));
        if ctx.was_interrupted() {
            self.journal.push(format!("interrupted:{}", self.id));
        }
        anyhow::ensure!(!self.fail_stop, "{} refused to stop", self.id);
        assert!(!self.panic_stop, "{} blew up while stopping", self.id);

        match self.stop_delay {
            None => self.journal.push(format!("stopped:{}", self.id)),
            Some(delay) => {
                let journal = self.journal.clone();
                let id = self.id.clone();
                ctx.run_async(async move {
                    tokio::time::sleep(delay).await;
                    journal.push(format!("stopped:{id}"));
                    anyhow::Ok(())
                })?;
            }
        }

        Ok(())
    }

    fn get(&self) -> Self::Value {
        self.id.clone()
    }
}
