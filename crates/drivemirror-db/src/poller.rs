//! Drives the change source on a timer.
//!
//! One poll cycle pages through the remote change listing starting just past
//! the persisted checkpoint and hands each page to the applier over a bounded
//! channel. Source errors end the cycle; the next tick retries from the same
//! position.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use drivemirror_common::ChangePage;

use crate::db::Inner;
use crate::source::ChangeSource;

pub(crate) struct Poller {
    inner: Arc<Inner>,
    source: Arc<dyn ChangeSource>,
    pages: mpsc::Sender<ChangePage>,
    trigger: mpsc::Receiver<()>,
    cancel: CancellationToken,
}

impl Poller {
    pub(crate) fn new(
        inner: Arc<Inner>,
        source: Arc<dyn ChangeSource>,
        pages: mpsc::Sender<ChangePage>,
        trigger: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            source,
            pages,
            trigger,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The first tick fires immediately, so the initial sync starts at
        // open.
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.read_changes().await,
                Some(()) = self.trigger.recv() => self.read_changes().await,
            }
        }
    }

    /// One poll cycle: page through everything past the checkpoint.
    async fn read_changes(&mut self) {
        let last_change_id = self.inner.last_change_id();
        let start_change_id = (last_change_id > 0).then_some(last_change_id + 1);
        let max_results = self.inner.config.max_results;
        let mut page_token: Option<String> = None;

        debug!("polling for changes past {last_change_id}");
        loop {
            let page = match self
                .source
                .list_changes(start_change_id, page_token.as_deref(), max_results)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!("change listing failed: {e}");
                    return;
                }
            };

            let exhausted = page.changes.is_empty();
            let next_token = page.next_page_token.clone();

            // The handoff channel is bounded; a slow applier backpressures
            // the poll cycle here.
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                sent = self.pages.send(page) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }

            if exhausted {
                return;
            }
            match next_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return,
            }
        }
    }
}
