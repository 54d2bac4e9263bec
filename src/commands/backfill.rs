//! Backfill command: revisits detail pages of records missing a field and
//! stores what the extraction pipeline finds.

use crate::browser::{ProxyRotation, SessionFactory, SessionManager, SessionPolicy, WebDriverFactory};
use crate::challenge::{ChallengeAction, ChallengeHandler};
use crate::config::{BackfillSettings, Config};
use crate::error::{BrowserError, StoreError};
use crate::extract::{Extracted, ExtractionPipeline};
use crate::format::Formatter;
use crate::progress::{EtaEstimator, ItemOutcome, RunSummary};
use crate::retry::{pause, retry, RetryPolicy};
use crate::selector::WorkSelector;
use crate::store::{FieldUpdate, PendingItem, PgStoreRepository, StoreRepository, TargetField};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Failure of one navigate/classify/extract/persist cycle.
#[derive(Debug, Error)]
enum CycleError {
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of one cycle that did not fail.
enum Cycle {
    Done(ItemOutcome),
    Missing,
    Challenged,
    Skipped,
}

/// Sleeps used to pace the run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    /// Base delay after each navigation and between items.
    pub delay: Duration,
    /// Backoff after a failed cycle: `error_base + error_step * attempt`.
    pub error_base: Duration,
    pub error_step: Duration,
}

impl Pacing {
    pub fn from_settings(settings: &BackfillSettings) -> Self {
        Self {
            delay: Duration::from_millis(settings.delay_ms),
            error_base: Duration::from_millis(1200),
            error_step: Duration::from_millis(500),
        }
    }

    fn error_backoff(&self, attempt: u32) -> Duration {
        self.error_base + self.error_step * attempt
    }
}

/// Drives selector, session, challenge handler, extraction and store for one run.
pub struct BatchOrchestrator {
    store: Arc<dyn StoreRepository>,
    selector: WorkSelector,
    sessions: SessionManager,
    challenges: ChallengeHandler,
    pipeline: ExtractionPipeline,
    settings: BackfillSettings,
    db_policy: RetryPolicy,
    pacing: Pacing,
    summary: RunSummary,
    eta: EtaEstimator,
}

impl BatchOrchestrator {
    /// Wires the components from configuration. No session is opened yet.
    pub fn new(
        store: Arc<dyn StoreRepository>,
        factory: Box<dyn SessionFactory>,
        config: &Config,
        pipeline: ExtractionPipeline,
    ) -> Self {
        let settings = config.backfill.clone();

        let rotation = ProxyRotation::from_settings(settings.proxy_list.as_deref(), settings.proxy.clone());
        let mut challenges = ChallengeHandler::new(
            Duration::from_secs(settings.captcha_sleep_secs),
            settings.captcha_skip,
            rotation,
        );
        let sessions = SessionManager::new(
            factory,
            challenges.initial_proxy(),
            SessionPolicy::new(config.browser.max_recreate),
        );

        Self {
            selector: WorkSelector::new(store.clone(), settings.field, settings.batch_size),
            store,
            sessions,
            challenges,
            pipeline,
            db_policy: RetryPolicy::db_contention(settings.db_retries.max(1)),
            pacing: Pacing::from_settings(&settings),
            summary: RunSummary::new(settings.field.to_string(), settings.dry_run),
            eta: EtaEstimator::new(0),
            settings,
        }
    }

    /// Overrides the database retry policy.
    pub fn with_db_policy(mut self, policy: RetryPolicy) -> Self {
        self.db_policy = policy;
        self
    }

    /// Identity of the last attempted item.
    pub fn cursor(&self) -> i64 {
        self.selector.cursor()
    }

    /// Processes pending items until the queue is drained or the limit is reached.
    ///
    /// Without a limit the pending count only seeds the ETA: paging continues
    /// until the selector returns an empty page, so records that become
    /// pending during the run are still reached.
    pub async fn run(&mut self) -> Result<RunSummary, StoreError> {
        let field = self.settings.field;
        let pending = self.selector.count_pending().await?;
        let target = self.settings.target_total(pending);
        let bounded = self.settings.is_bounded();

        self.summary.pending = pending;
        self.eta = EtaEstimator::new(target);
        if bounded {
            info!("Records missing {}: {} (processing {})", field, pending, target);
        } else {
            info!("Records missing {}: {} (processing all)", field, pending);
        }

        'batches: while !bounded || !self.eta.is_complete() {
            let size = if bounded {
                (self.eta.total() - self.eta.done()).min(self.settings.batch_size as u64) as usize
            } else {
                self.settings.batch_size
            };

            let page = self.next_page(size).await?;
            let (Some(first), Some(last)) = (page.first(), page.last()) else {
                debug!("No pending items after id={}", self.selector.cursor());
                break;
            };

            if !bounded {
                let seen = self.eta.done() + page.len() as u64;
                if seen > self.eta.total() {
                    debug!("Queue grew past the initial count ({} > {})", seen, self.eta.total());
                    self.eta.grow_to(seen);
                }
            }

            info!("Batch id {}..{} ({} items) | {}", first.id, last.id, page.len(), self.eta.eta());

            for item in &page {
                let outcome = self.process(item).await;
                self.summary.record(outcome);
                self.selector.advance(item.id);
                self.summary.final_cursor = self.selector.cursor();
                self.eta.tick();

                if bounded && self.eta.is_complete() {
                    break 'batches;
                }
                pause(self.pacing.delay, Duration::from_millis(200), Duration::from_millis(600)).await;
            }
        }

        Ok(self.finish(false))
    }

    /// Releases the browser session. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.sessions.teardown().await;
    }

    /// Snapshot of the counters so far.
    pub fn finish(&mut self, interrupted: bool) -> RunSummary {
        self.summary.elapsed_secs = self.eta.elapsed().as_secs_f64();
        self.summary.challenge_cycles = self.challenges.total() as u64;
        self.summary.longest_challenge_streak = self.challenges.longest_streak() as u64;
        self.summary.final_cursor = self.selector.cursor();
        self.summary.interrupted = interrupted;
        self.summary.clone()
    }

    async fn next_page(&self, size: usize) -> Result<Vec<PendingItem>, StoreError> {
        let selector = &self.selector;
        retry(&self.db_policy, StoreError::is_contention, |_| selector.page(size)).await
    }

    /// Runs bounded attempts for one item. Never fails; the outcome is counted.
    async fn process(&mut self, item: &PendingItem) -> ItemOutcome {
        let url = self.settings.detail_url_for(&item.place_id);
        let max_retries = self.settings.max_retries.max(1);
        let mut attempt = 0;
        let mut challenge_cycles = 0;
        let mut last_failed = false;

        while attempt < max_retries {
            info!(
                "[{}] id={} Opening {} (attempt {}/{})",
                self.eta.position(),
                item.id,
                url,
                attempt + 1,
                max_retries
            );

            match self.cycle(item, &url).await {
                Ok(Cycle::Done(outcome)) => return outcome,
                Ok(Cycle::Missing) => {
                    info!("[{}] No {} found", item.id, self.settings.field);
                    last_failed = false;
                    attempt += 1;
                }
                Ok(Cycle::Skipped) => return ItemOutcome::Challenged,
                Ok(Cycle::Challenged) => {
                    challenge_cycles += 1;
                    if challenge_cycles >= self.settings.max_challenge_cycles {
                        warn!("[{}] Still challenged after {} cycles, moving on", item.id, challenge_cycles);
                        return ItemOutcome::Challenged;
                    }
                }
                Err(e) => {
                    attempt += 1;
                    last_failed = true;
                    warn!("[{}] Attempt {}/{} failed: {}", item.id, attempt, max_retries, e);
                    if attempt < max_retries {
                        tokio::time::sleep(self.pacing.error_backoff(attempt)).await;
                    }
                }
            }
        }

        if last_failed {
            error!("[{}] Giving up after {} attempts", item.id, max_retries);
            ItemOutcome::Failed
        } else {
            ItemOutcome::Missing
        }
    }

    /// One navigate, classify, extract and persist pass.
    async fn cycle(&mut self, item: &PendingItem, url: &str) -> Result<Cycle, CycleError> {
        self.sessions.navigate(url).await?;
        pause(self.pacing.delay, Duration::from_millis(300), Duration::from_millis(700)).await;

        match self.challenges.check(&mut self.sessions).await? {
            ChallengeAction::Proceed => {}
            ChallengeAction::Skip => return Ok(Cycle::Skipped),
            ChallengeAction::Retry => return Ok(Cycle::Challenged),
        }

        let session = self.sessions.ensure_session().await?;
        let Some(found) = self.pipeline.run(session).await else {
            return Ok(Cycle::Missing);
        };

        info!("[{}] Found {} via {} (len={}): {}", item.id, self.settings.field, found.strategy, found.value.len(), found.value);
        Ok(Cycle::Done(self.persist(item, &found).await?))
    }

    /// Writes the value, retrying only on contention.
    async fn persist(&self, item: &PendingItem, found: &Extracted) -> Result<ItemOutcome, StoreError> {
        let field: TargetField = self.settings.field;

        if self.settings.dry_run {
            info!("[DRY] Would update id={} {} (len={})", item.id, field, found.value.len());
            return Ok(ItemOutcome::Updated);
        }

        let store = &self.store;
        let value = found.value.as_str();
        let result = retry(&self.db_policy, StoreError::is_contention, |n| {
            if n > 1 {
                debug!("[{}] Retrying update ({}/{})", item.id, n, self.db_policy.max_attempts);
            }
            store.update_field(item.id, field, value)
        })
        .await;

        match result {
            Ok(FieldUpdate::Updated) => Ok(ItemOutcome::Updated),
            Ok(FieldUpdate::NotFound) => Ok(ItemOutcome::NotFound),
            Err(e) if e.is_contention() => {
                warn!("[{}] Row still locked after {} tries, skipping: {}", item.id, self.db_policy.max_attempts, e);
                Ok(ItemOutcome::Contended)
            }
            Err(e) => Err(e),
        }
    }
}

/// Executes a backfill run.
pub struct BackfillCommand {
    config: Config,
}

impl BackfillCommand {
    /// Creates a new backfill command.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Connects to Postgres and chromedriver, runs until done or `shutdown`
    /// resolves, and returns the formatted summary. Both resources are
    /// released on every path.
    pub async fn execute(&self, shutdown: impl Future<Output = ()>) -> Result<String> {
        let store = Arc::new(
            PgStoreRepository::connect(&self.config.database)
                .await
                .context("Failed to connect to Postgres")?,
        );

        let result = async {
            store.ensure_schema().await.context("Failed to install schema")?;
            store.backfill_geometry().await.context("Failed to backfill geometry")?;

            let factory = WebDriverFactory::new(self.config.browser.clone());
            self.execute_with(store.clone(), Box::new(factory), shutdown).await
        }
        .await;

        store.close().await;
        result
    }

    /// Executes with a provided store and session factory (for testing).
    pub async fn execute_with(
        &self,
        store: Arc<dyn StoreRepository>,
        factory: Box<dyn SessionFactory>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<String> {
        let summary = self.run(store, factory, shutdown).await?;
        let formatter = Formatter::new(self.config.format);
        Ok(formatter.format_summary(&summary))
    }

    /// Runs the orchestrator and returns the raw summary.
    pub async fn run(
        &self,
        store: Arc<dyn StoreRepository>,
        factory: Box<dyn SessionFactory>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunSummary> {
        let field = self.config.backfill.field;
        let pipeline = ExtractionPipeline::for_field(field)
            .with_context(|| format!("No extraction strategies for field '{}'", field))?;

        let mut orchestrator = BatchOrchestrator::new(store, factory, &self.config, pipeline);

        let outcome = tokio::select! {
            result = orchestrator.run() => Some(result),
            _ = shutdown => None,
        };

        orchestrator.shutdown().await;

        match outcome {
            Some(result) => {
                let summary = result.context("Backfill run failed")?;
                info!("Done: {} updated, {} scanned", summary.updated, summary.scanned);
                Ok(summary)
            }
            None => {
                warn!("Interrupted at id={}", orchestrator.cursor());
                Ok(orchestrator.finish(true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserSession;
    use crate::store::{MemoryStore, StorePayload};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// What the scripted browser shows for a URL.
    #[derive(Clone)]
    enum Page {
        Image(&'static str),
        Empty,
        Challenge,
        Broken,
    }

    #[derive(Default)]
    struct Script {
        pages: HashMap<String, VecDeque<Page>>,
        current: Option<Page>,
        sessions: u32,
        closed: u32,
        visits: Vec<String>,
        /// Records inserted into the store the first time a URL is opened.
        arrivals: HashMap<String, (Arc<MemoryStore>, &'static str)>,
    }

    struct ScriptedSession {
        script: Arc<Mutex<Script>>,
    }

    #[async_trait]
    impl BrowserSession for ScriptedSession {
        async fn goto(&self, url: &str) -> Result<(), BrowserError> {
            let arrival = self.script.lock().unwrap().arrivals.remove(url);
            if let Some((store, place_id)) = arrival {
                store.upsert_entity(&StorePayload::new(place_id, "Tạp hóa mới")).await.unwrap();
            }

            let mut script = self.script.lock().unwrap();
            script.visits.push(url.to_string());
            let page = script
                .pages
                .get_mut(url)
                .and_then(|queue| if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() })
                .unwrap_or(Page::Empty);
            if matches!(page, Page::Broken) {
                return Err(BrowserError::SessionBroken("invalid session id".into()));
            }
            script.current = Some(page);
            Ok(())
        }

        async fn title(&self) -> Result<String, BrowserError> {
            Ok("Google Maps".into())
        }

        async fn source(&self) -> Result<String, BrowserError> {
            let script = self.script.lock().unwrap();
            Ok(match script.current {
                Some(Page::Challenge) => "<html><body>Our systems have detected unusual traffic</body></html>".into(),
                _ => "<html><body></body></html>".into(),
            })
        }

        async fn wait_for_attribute(&self, _: &str, _: &str, _: Duration) -> Result<Option<String>, BrowserError> {
            let script = self.script.lock().unwrap();
            Ok(match script.current {
                Some(Page::Image(url)) => Some(url.to_string()),
                _ => None,
            })
        }

        async fn click(&self, _: &str, _: Duration) -> Result<bool, BrowserError> {
            Ok(false)
        }

        async fn attributes(&self, _: &str, _: &str) -> Result<Vec<String>, BrowserError> {
            Ok(Vec::new())
        }

        async fn close(self: Box<Self>) -> Result<(), BrowserError> {
            self.script.lock().unwrap().closed += 1;
            Ok(())
        }
    }

    struct ScriptedFactory {
        script: Arc<Mutex<Script>>,
    }

    #[async_trait]
    impl SessionFactory for ScriptedFactory {
        async fn create(&self, _proxy: Option<&str>) -> Result<Box<dyn BrowserSession>, BrowserError> {
            self.script.lock().unwrap().sessions += 1;
            Ok(Box::new(ScriptedSession { script: self.script.clone() }))
        }
    }

    fn make_config() -> Config {
        let mut config = Config::default();
        config.backfill.delay_ms = 0;
        config.backfill.batch_size = 2;
        config.backfill.captcha_sleep_secs = 600;
        config
    }

    fn url_for(place_id: &str) -> String {
        make_config().backfill.detail_url_for(place_id)
    }

    async fn seeded_store(place_ids: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for place_id in place_ids {
            store.upsert_entity(&StorePayload::new(*place_id, "Tạp hóa")).await.unwrap();
        }
        store
    }

    fn script(pages: Vec<(&str, Vec<Page>)>) -> Arc<Mutex<Script>> {
        let mut script = Script::default();
        for (place_id, queue) in pages {
            script.pages.insert(url_for(place_id), queue.into());
        }
        Arc::new(Mutex::new(script))
    }

    fn orchestrator(store: Arc<MemoryStore>, script: &Arc<Mutex<Script>>, config: &Config) -> BatchOrchestrator {
        let factory = ScriptedFactory { script: script.clone() };
        BatchOrchestrator::new(store, Box::new(factory), config, ExtractionPipeline::image())
            .with_db_policy(RetryPolicy::immediate(config.backfill.db_retries))
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_found_images_and_advances_past_misses() {
        let store = seeded_store(&["ChIJ1", "ChIJ2", "ChIJ3"]).await;
        let script = script(vec![
            ("ChIJ1", vec![Page::Image("https://lh3.googleusercontent.com/p/1")]),
            ("ChIJ3", vec![Page::Image("https://lh3.googleusercontent.com/p/3")]),
        ]);
        let config = make_config();

        let mut orchestrator = orchestrator(store.clone(), &script, &config);
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.updated, 2);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.final_cursor, 3);
        assert!(store.get(2).await.unwrap().unwrap().image.is_none());
        // The miss used both attempts.
        let visits = script.lock().unwrap().visits.iter().filter(|v| **v == url_for("ChIJ2")).count();
        assert_eq!(visits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenges_do_not_consume_attempts() {
        let store = seeded_store(&["ChIJ1"]).await;
        let script = script(vec![(
            "ChIJ1",
            vec![Page::Challenge, Page::Challenge, Page::Challenge, Page::Image("https://lh3.googleusercontent.com/p/1")],
        )]);
        let mut config = make_config();
        config.backfill.max_retries = 1;

        let mut orchestrator = orchestrator(store.clone(), &script, &config);
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(summary.challenge_cycles, 3);
        // One initial session plus one recreation per challenge.
        assert_eq!(script.lock().unwrap().sessions, 4);
        assert_eq!(
            store.get(1).await.unwrap().unwrap().image.as_deref(),
            Some("https://lh3.googleusercontent.com/p/1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_on_challenge() {
        let store = seeded_store(&["ChIJ1", "ChIJ2"]).await;
        let script = script(vec![
            ("ChIJ1", vec![Page::Challenge]),
            ("ChIJ2", vec![Page::Image("https://lh3.googleusercontent.com/p/2")]),
        ]);
        let mut config = make_config();
        config.backfill.captcha_skip = true;

        let mut orchestrator = orchestrator(store, &script, &config);
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.challenged, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.challenge_cycles, 1);
        assert_eq!(script.lock().unwrap().sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_mode_counts_challenge_streak() {
        let store = seeded_store(&["ChIJ1", "ChIJ2", "ChIJ3", "ChIJ4"]).await;
        let script = script(vec![
            ("ChIJ1", vec![Page::Challenge]),
            ("ChIJ2", vec![Page::Challenge]),
            ("ChIJ3", vec![Page::Image("https://lh3.googleusercontent.com/p/3")]),
            ("ChIJ4", vec![Page::Challenge]),
        ]);
        let mut config = make_config();
        config.backfill.captcha_skip = true;

        let mut orchestrator = orchestrator(store, &script, &config);
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.challenged, 3);
        assert_eq!(summary.challenge_cycles, 3);
        assert_eq!(summary.longest_challenge_streak, 2);
        assert_eq!(summary.updated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_cycle_cap() {
        let store = seeded_store(&["ChIJ1"]).await;
        let script = script(vec![("ChIJ1", vec![Page::Challenge])]);
        let mut config = make_config();
        config.backfill.max_challenge_cycles = 3;

        let mut orchestrator = orchestrator(store, &script, &config);
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.challenged, 1);
        assert_eq!(summary.challenge_cycles, 3);
        assert_eq!(summary.final_cursor, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contention_ends_item_without_retrying_cycle() {
        let store = seeded_store(&["ChIJ1", "ChIJ2"]).await;
        store.lock_row(1);
        let script = script(vec![
            ("ChIJ1", vec![Page::Image("https://lh3.googleusercontent.com/p/1")]),
            ("ChIJ2", vec![Page::Image("https://lh3.googleusercontent.com/p/2")]),
        ]);
        let config = make_config();

        let mut orchestrator = orchestrator(store.clone(), &script, &config);
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.contended, 1);
        assert_eq!(summary.updated, 1);
        let visits = script.lock().unwrap().visits.iter().filter(|v| **v == url_for("ChIJ1")).count();
        assert_eq!(visits, 1);
        assert!(store.get(1).await.unwrap().unwrap().image.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_record_is_not_found() {
        let store = seeded_store(&["ChIJ1"]).await;
        let script = script(vec![("ChIJ1", vec![Page::Image("https://lh3.googleusercontent.com/p/1")])]);
        let config = make_config();

        let mut orchestrator = orchestrator(store.clone(), &script, &config);
        // Selected, then deleted before the update lands.
        let item = PendingItem { id: 1, place_id: "ChIJ1".into() };
        store.remove(1);

        assert_eq!(orchestrator.process(&item).await, ItemOutcome::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_recreated_after_invalid_session() {
        let store = seeded_store(&["ChIJ1"]).await;
        let script = script(vec![("ChIJ1", vec![Page::Broken, Page::Image("https://lh3.googleusercontent.com/p/1")])]);
        let config = make_config();

        let mut orchestrator = orchestrator(store, &script, &config);
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(script.lock().unwrap().sessions, 2);
        assert_eq!(script.lock().unwrap().closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_writes_nothing() {
        let store = seeded_store(&["ChIJ1"]).await;
        let script = script(vec![("ChIJ1", vec![Page::Image("https://lh3.googleusercontent.com/p/1")])]);
        let mut config = make_config();
        config.backfill.dry_run = true;

        let mut orchestrator = orchestrator(store.clone(), &script, &config);
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.updated, 1);
        assert!(summary.dry_run);
        assert!(store.get(1).await.unwrap().unwrap().image.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_and_once() {
        let store = seeded_store(&["ChIJ1", "ChIJ2", "ChIJ3"]).await;
        let script = script(vec![]);
        let mut config = make_config();
        config.backfill.once = true;

        let mut orchestrator = orchestrator(store, &script, &config);
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.final_cursor, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_run_reaches_records_added_mid_run() {
        let store = seeded_store(&["ChIJ1", "ChIJ2"]).await;
        let script = script(vec![("ChIJ3", vec![Page::Image("https://lh3.googleusercontent.com/p/3")])]);
        script.lock().unwrap().arrivals.insert(url_for("ChIJ2"), (store.clone(), "ChIJ3"));
        let config = make_config();
        assert_eq!(config.backfill.limit, 0);

        let mut orchestrator = orchestrator(store.clone(), &script, &config);
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.pending, 2);
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.final_cursor, 3);
        assert_eq!(
            store.get(3).await.unwrap().unwrap().image.as_deref(),
            Some("https://lh3.googleusercontent.com/p/3")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_ignores_records_added_mid_run() {
        let store = seeded_store(&["ChIJ1", "ChIJ2"]).await;
        let script = script(vec![("ChIJ3", vec![Page::Image("https://lh3.googleusercontent.com/p/3")])]);
        script.lock().unwrap().arrivals.insert(url_for("ChIJ2"), (store.clone(), "ChIJ3"));
        let mut config = make_config();
        config.backfill.limit = 2;

        let mut orchestrator = orchestrator(store.clone(), &script, &config);
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.final_cursor, 2);
        assert!(store.get(3).await.unwrap().unwrap().image.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_tears_down_session_on_interrupt() {
        let store = seeded_store(&["ChIJ1", "ChIJ2"]).await;
        let script = script(vec![]);
        let config = make_config();
        let factory = ScriptedFactory { script: script.clone() };

        let command = BackfillCommand::new(config);
        let shutdown = tokio::time::sleep(Duration::from_millis(100));
        let summary = command.run(store, Box::new(factory), shutdown).await.unwrap();

        assert!(summary.interrupted);
        let script = script.lock().unwrap();
        assert_eq!(script.sessions, script.closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_formats_summary() {
        let store = seeded_store(&["ChIJ1"]).await;
        let script = script(vec![("ChIJ1", vec![Page::Image("https://lh3.googleusercontent.com/p/1")])]);
        let mut config = make_config();
        config.format = crate::config::OutputFormat::Json;
        let factory = ScriptedFactory { script: script.clone() };

        let output = BackfillCommand::new(config)
            .execute_with(store, Box::new(factory), std::future::pending())
            .await
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["updated"], 1);
        assert_eq!(script.lock().unwrap().closed, 1);
    }

    #[test]
    fn test_error_backoff_escalates() {
        let pacing = Pacing::from_settings(&make_config().backfill);
        assert_eq!(pacing.error_backoff(1), Duration::from_millis(1700));
        assert_eq!(pacing.error_backoff(2), Duration::from_millis(2200));
    }
}
