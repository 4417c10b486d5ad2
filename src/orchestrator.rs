//! Insertion orchestrator.
//!
//! One actor task owns the clipboard, the synthetic paste flag and the stage
//! machine. Requests reach it through a bounded queue; when the queue is full a
//! new request is rejected rather than interleaved with the one in flight.
//!
//! Every wait is a [`Clock::sleep`] raced against the request's cancellation
//! token. A cancelled request abandons its remaining stages, including the
//! clipboard restore, so a stale snapshot is never written back.

use crate::active_app::{AppActivator, PreviousApp};
use crate::clipboard::{prepare_clipboard_text, ClipboardAccess, ClipboardSnapshot};
use crate::clock::Clock;
use crate::enhancement::{Enhancement, Placement};
use crate::error::InsertionError;
use crate::input::KeySynthesizer;
use crate::permissions::{Capability, PermissionGate};
use crate::settings::InsertionSettings;
use crate::synthetic_paste::{SyntheticPasteFlag, SyntheticPasteProbe};
use crate::telemetry::{Telemetry, EVENT_INSERTION_FAILURE, EVENT_INSERTION_SLOW};
use crate::text_context::{ContextProbe, TextContext};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Map};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertionStage {
    Idle,
    Preparing,
    DirectWriteAttempt,
    ClipboardAttempt,
    Verifying,
    Restoring,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStrategy {
    DirectWrite,
    ClipboardPaste,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertionOutcome {
    /// The text reached the target, by direct write or by paste.
    Delivered,
    /// The text was left on the clipboard without pasting.
    ClipboardOnly,
    /// Nothing was delivered; the clipboard could not be written.
    Failed,
    Cancelled,
    /// The queue was full when the request was submitted.
    Rejected,
    /// The request was dropped before it could complete.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertionReport {
    pub outcome: InsertionOutcome,
    pub strategy: Option<DeliveryStrategy>,
    pub errors: Vec<InsertionError>,
    pub elapsed: Duration,
    /// Clipboard rewrite cycles needed before the paste.
    pub verify_attempts: u32,
}

impl InsertionReport {
    fn bare(outcome: InsertionOutcome) -> Self {
        Self {
            outcome,
            strategy: None,
            errors: Vec::new(),
            elapsed: Duration::ZERO,
            verify_attempts: 0,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.outcome == InsertionOutcome::Delivered
    }
}

type CompletionFn = Box<dyn FnOnce(InsertionReport) + Send>;

/// Completion continuation that fires exactly once. If the request is dropped
/// without completing it fires with [`InsertionOutcome::Abandoned`].
pub struct Completion(Option<CompletionFn>);

impl Completion {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(InsertionReport) + Send + 'static,
    {
        Self(Some(Box::new(callback)))
    }

    fn fire(mut self, report: InsertionReport) {
        if let Some(callback) = self.0.take() {
            callback(report);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback(InsertionReport::bare(InsertionOutcome::Abandoned));
        }
    }
}

struct InsertionRequest {
    content: String,
    enhancement: Enhancement,
    previous_app: Option<PreviousApp>,
    reactivate: bool,
    completion: Completion,
    cancel: CancellationToken,
}

/// Platform backends the orchestrator drives.
#[derive(Clone)]
pub struct OrchestratorBackends {
    pub clipboard: Arc<dyn ClipboardAccess>,
    pub keys: Arc<dyn KeySynthesizer>,
    pub focus: Arc<dyn AppActivator>,
    pub probe: Arc<dyn ContextProbe>,
    pub permissions: Arc<PermissionGate>,
    pub telemetry: Arc<dyn Telemetry>,
    pub clock: Arc<dyn Clock>,
}

/// Handle used by collaborators to submit insertions.
pub struct InsertionService {
    tx: mpsc::Sender<InsertionRequest>,
    previous_app: Mutex<Option<PreviousApp>>,
    in_flight: Arc<Mutex<Option<CancellationToken>>>,
    stage: watch::Receiver<InsertionStage>,
    paste_probe: SyntheticPasteProbe,
}

impl InsertionService {
    /// Spawns the orchestrator actor on the current tokio runtime.
    pub fn spawn(backends: OrchestratorBackends, settings: InsertionSettings) -> Self {
        let settings = settings.normalized();
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let (stage_tx, stage_rx) = watch::channel(InsertionStage::Idle);
        let paste_flag = SyntheticPasteFlag::new(Arc::clone(&backends.clock));
        let paste_probe = paste_flag.probe();
        let in_flight = Arc::new(Mutex::new(None));

        let actor = Orchestrator {
            backends,
            settings,
            paste_flag,
            stage: stage_tx,
            in_flight: Arc::clone(&in_flight),
        };
        tokio::spawn(actor.run(rx));

        Self {
            tx,
            previous_app: Mutex::new(None),
            in_flight,
            stage: stage_rx,
            paste_probe,
        }
    }

    /// Stores the app that had focus before our UI appeared. The next
    /// submitted request takes it.
    pub fn set_previous_app(&self, app: Option<PreviousApp>) {
        if let Ok(mut slot) = self.previous_app.lock() {
            *slot = app;
        }
    }

    /// Inserts `content` into the previously focused app, reactivating it first.
    pub fn insert_prompt<F>(
        &self,
        content: impl Into<String>,
        enhancement: Enhancement,
        completion: F,
    ) -> CancellationToken
    where
        F: FnOnce(InsertionReport) + Send + 'static,
    {
        self.submit(content.into(), enhancement, true, Completion::new(completion))
    }

    /// Same as [`insert_prompt`](Self::insert_prompt) but without switching apps.
    pub fn insert_prompt_directly<F>(
        &self,
        content: impl Into<String>,
        enhancement: Enhancement,
        completion: F,
    ) -> CancellationToken
    where
        F: FnOnce(InsertionReport) + Send + 'static,
    {
        self.submit(content.into(), enhancement, false, Completion::new(completion))
    }

    /// Async form of [`insert_prompt`](Self::insert_prompt).
    pub async fn insert(&self, content: impl Into<String>, enhancement: Enhancement) -> InsertionReport {
        let (tx, rx) = oneshot::channel();
        self.insert_prompt(content, enhancement, move |report| {
            let _ = tx.send(report);
        });
        rx.await
            .unwrap_or_else(|_| InsertionReport::bare(InsertionOutcome::Abandoned))
    }

    /// Async form of [`insert_prompt_directly`](Self::insert_prompt_directly).
    pub async fn insert_directly(
        &self,
        content: impl Into<String>,
        enhancement: Enhancement,
    ) -> InsertionReport {
        let (tx, rx) = oneshot::channel();
        self.insert_prompt_directly(content, enhancement, move |report| {
            let _ = tx.send(report);
        });
        rx.await
            .unwrap_or_else(|_| InsertionReport::bare(InsertionOutcome::Abandoned))
    }

    /// Cancels the request currently being processed, if any.
    pub fn cancel_in_flight(&self) -> bool {
        let token = self.in_flight.lock().ok().and_then(|slot| slot.clone());
        match token {
            Some(token) => {
                info!("Cancelling in-flight insertion");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stage(&self) -> InsertionStage {
        *self.stage.borrow()
    }

    pub fn subscribe_stage(&self) -> watch::Receiver<InsertionStage> {
        self.stage.clone()
    }

    /// Read-only view of the synthetic paste flag for the hotkey listener.
    pub fn synthetic_paste_probe(&self) -> SyntheticPasteProbe {
        self.paste_probe.clone()
    }

    fn submit(
        &self,
        content: String,
        enhancement: Enhancement,
        reactivate: bool,
        completion: Completion,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let previous_app = self.previous_app.lock().ok().and_then(|mut slot| slot.take());
        let request = InsertionRequest {
            content,
            enhancement,
            previous_app,
            reactivate,
            completion,
            cancel: cancel.clone(),
        };

        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!("Insertion already in progress, rejecting request");
                request
                    .completion
                    .fire(InsertionReport::bare(InsertionOutcome::Rejected));
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                warn!("Insertion orchestrator is not running");
                request
                    .completion
                    .fire(InsertionReport::bare(InsertionOutcome::Rejected));
            }
        }
        cancel
    }
}

/// Marker for an abandoned wait.
struct Cancelled;

/// Per-request bookkeeping.
struct Run {
    started: Instant,
    strategy: Option<DeliveryStrategy>,
    errors: Vec<InsertionError>,
    verify_attempts: u32,
}

impl Run {
    fn record(&mut self, error: InsertionError) {
        debug!("Insertion step failed: {}", error);
        self.errors.push(error);
    }
}

struct Orchestrator {
    backends: OrchestratorBackends,
    settings: InsertionSettings,
    paste_flag: SyntheticPasteFlag,
    stage: watch::Sender<InsertionStage>,
    in_flight: Arc<Mutex<Option<CancellationToken>>>,
}

impl Orchestrator {
    async fn run(self, mut rx: mpsc::Receiver<InsertionRequest>) {
        while let Some(request) = rx.recv().await {
            self.set_in_flight(Some(request.cancel.clone()));
            let InsertionRequest {
                content,
                enhancement,
                previous_app,
                reactivate,
                completion,
                cancel,
            } = request;

            let mut run = Run {
                started: self.backends.clock.now(),
                strategy: None,
                errors: Vec::new(),
                verify_attempts: 0,
            };
            let outcome = self
                .process(
                    &content,
                    &enhancement,
                    previous_app.as_ref(),
                    reactivate,
                    &cancel,
                    &mut run,
                )
                .await;

            self.set_in_flight(None);
            let report = self.finish(outcome, run);
            completion.fire(report);
        }
        debug!("Insertion orchestrator stopped");
    }

    async fn process(
        &self,
        content: &str,
        enhancement: &Enhancement,
        previous_app: Option<&PreviousApp>,
        reactivate: bool,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> InsertionOutcome {
        self.set_stage(InsertionStage::Preparing);
        if cancel.is_cancelled() {
            return InsertionOutcome::Cancelled;
        }

        let mut select_all_first = false;
        let final_text = if enhancement.requires_context() {
            let context = self.read_context(run);
            let final_text = enhancement.apply(
                content,
                context.selection(),
                &context.existing_content,
            );

            if self.try_direct_write(enhancement, &context, &final_text, run) {
                run.strategy = Some(DeliveryStrategy::DirectWrite);
                return InsertionOutcome::Delivered;
            }

            // The assembled text already contains the field's content, so the
            // paste has to replace the field rather than add to it.
            select_all_first = matches!(enhancement.placement, Placement::Top | Placement::Bottom)
                && !context.existing_content.is_empty();
            final_text
        } else {
            enhancement.apply(content, None, "")
        };

        match self
            .deliver_via_clipboard(&final_text, previous_app, reactivate, select_all_first, cancel, run)
            .await
        {
            Ok(outcome) => outcome,
            Err(Cancelled) => InsertionOutcome::Cancelled,
        }
    }

    fn read_context(&self, run: &mut Run) -> TextContext {
        if !self.backends.permissions.state().can_automate_ui {
            run.record(InsertionError::PermissionUnavailable(Capability::UiAutomation));
            return TextContext::empty();
        }

        let context = self.backends.probe.get_current_text_context();
        if context.is_empty() {
            run.record(InsertionError::ProbeMiss);
        } else {
            debug!(
                "Read text context from '{}' ({} chars, selection: {})",
                context.source_app_name,
                context.existing_content.chars().count(),
                context.has_selection
            );
        }
        context
    }

    fn try_direct_write(
        &self,
        enhancement: &Enhancement,
        context: &TextContext,
        final_text: &str,
        run: &mut Run,
    ) -> bool {
        if context.is_empty() {
            return false;
        }

        let value = if enhancement.placement == Placement::Wrap {
            let Some(selection) = context.selection() else {
                run.record(InsertionError::SelectionRequired);
                return false;
            };
            let existing = &context.existing_content;
            // The field only reports the selected text, not its range, so the
            // selection can only be located when it occurs exactly once.
            let start = match (existing.find(selection), existing.rfind(selection)) {
                (Some(first), Some(last)) if first == last => first,
                (None, _) => {
                    debug!("Selection not found in field value, skipping direct write");
                    run.record(InsertionError::DirectWriteFailed);
                    return false;
                }
                _ => {
                    debug!("Selection occurs more than once in field value, skipping direct write");
                    run.record(InsertionError::DirectWriteFailed);
                    return false;
                }
            };
            let mut value = existing.clone();
            value.replace_range(start..start + selection.len(), final_text);
            value
        } else {
            final_text.to_string()
        };

        self.set_stage(InsertionStage::DirectWriteAttempt);
        if self.backends.probe.set_text_content(&value) {
            info!("Inserted text by direct write");
            true
        } else {
            run.record(InsertionError::DirectWriteFailed);
            false
        }
    }

    async fn deliver_via_clipboard(
        &self,
        final_text: &str,
        previous_app: Option<&PreviousApp>,
        reactivate: bool,
        select_all_first: bool,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<InsertionOutcome, Cancelled> {
        self.set_stage(InsertionStage::ClipboardAttempt);
        run.strategy = Some(DeliveryStrategy::ClipboardPaste);
        let clipboard = &self.backends.clipboard;
        let text = prepare_clipboard_text(final_text, self.settings.convert_lf_to_crlf);

        let mut paste_allowed = true;
        if reactivate && previous_app.is_none() {
            run.record(InsertionError::FocusUnavailable);
            paste_allowed = false;
        }
        if !self.backends.permissions.state().can_send_events {
            run.record(InsertionError::PermissionUnavailable(Capability::EventDelivery));
            paste_allowed = false;
        }

        if !paste_allowed {
            return Ok(match clipboard.write_text(&text) {
                Ok(()) => {
                    info!("No paste target, text left on the clipboard");
                    InsertionOutcome::ClipboardOnly
                }
                Err(e) => {
                    run.record(InsertionError::ClipboardUnavailable(e));
                    InsertionOutcome::Failed
                }
            });
        }

        let snapshot = clipboard.snapshot(self.settings.clipboard_handling);
        debug!("Clipboard snapshot: {:?}", snapshot);
        if let Err(e) = clipboard.write_text(&text) {
            run.record(InsertionError::ClipboardUnavailable(e));
            return Ok(InsertionOutcome::Failed);
        }

        if reactivate {
            if let Some(app) = previous_app {
                if !self.backends.focus.activate(app) {
                    warn!("Could not reactivate '{}', pasting anyway", app.name);
                }
            }
            self.wait(self.settings.settle_delay(), cancel).await?;
        }

        self.verify_clipboard(&text, cancel, run).await?;

        let paste_guard = self.paste_flag.raise(self.settings.paste_flag_window());
        if select_all_first {
            if let Err(e) = self.backends.keys.send_select_all() {
                run.record(InsertionError::KeySynthesisFailed(e));
            }
        }
        if let Err(e) = self.backends.keys.send_paste() {
            drop(paste_guard);
            run.record(InsertionError::KeySynthesisFailed(e));
            // Leave the text on the clipboard so the user can paste by hand.
            return Ok(InsertionOutcome::ClipboardOnly);
        }

        self.set_stage(InsertionStage::Restoring);
        self.wait(self.settings.restore_delay(), cancel).await?;
        drop(paste_guard);
        self.restore_clipboard(snapshot);

        Ok(InsertionOutcome::Delivered)
    }

    /// Checks that our text is still on the clipboard, rewriting it up to
    /// `max_verify_attempts` times. Gives up with a race error but never blocks.
    async fn verify_clipboard(
        &self,
        text: &str,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<(), Cancelled> {
        self.set_stage(InsertionStage::Verifying);
        self.wait(self.settings.verify_delay(), cancel).await?;

        let clipboard = &self.backends.clipboard;
        let mut rewrites = 0;
        loop {
            if clipboard.read_text().as_deref() == Some(text) {
                break;
            }
            if rewrites >= self.settings.max_verify_attempts {
                warn!(
                    "Clipboard still overwritten after {} rewrites, pasting anyway",
                    rewrites
                );
                run.record(InsertionError::ClipboardRace { attempts: rewrites });
                break;
            }

            rewrites += 1;
            debug!("Clipboard changed under us, rewrite {}", rewrites);
            if let Err(e) = clipboard.write_text(text) {
                warn!("Clipboard rewrite failed: {}", e);
            }
            self.wait(self.settings.verify_retry_delay(), cancel).await?;
        }
        run.verify_attempts = rewrites;
        Ok(())
    }

    fn restore_clipboard(&self, snapshot: ClipboardSnapshot) {
        if let Err(e) = self.backends.clipboard.restore(snapshot) {
            warn!("Failed to restore clipboard: {}", e);
        }
    }

    async fn wait(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Cancelled),
            _ = self.backends.clock.sleep(duration) => Ok(()),
        }
    }

    fn finish(&self, outcome: InsertionOutcome, run: Run) -> InsertionReport {
        self.set_stage(InsertionStage::Done);
        let elapsed = self.backends.clock.now() - run.started;

        if elapsed > self.settings.slow_threshold() {
            let mut properties = Map::new();
            properties.insert("elapsed_ms".into(), json!(elapsed.as_millis() as u64));
            properties.insert("strategy".into(), json!(run.strategy));
            self.backends.telemetry.track(EVENT_INSERTION_SLOW, properties);
        }
        for error in &run.errors {
            let mut properties = Map::new();
            properties.insert("kind".into(), json!(error.kind()));
            self.backends.telemetry.track(EVENT_INSERTION_FAILURE, properties);
        }

        info!(
            "Insertion finished: {:?} via {:?} in {} ms ({} errors)",
            outcome,
            run.strategy,
            elapsed.as_millis(),
            run.errors.len()
        );

        InsertionReport {
            outcome,
            strategy: run.strategy,
            errors: run.errors,
            elapsed,
            verify_attempts: run.verify_attempts,
        }
    }

    fn set_stage(&self, stage: InsertionStage) {
        self.stage.send_replace(stage);
    }

    fn set_in_flight(&self, token: Option<CancellationToken>) {
        if let Ok(mut slot) = self.in_flight.lock() {
            *slot = token;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active_app::AppToken;
    use crate::clock::TokioClock;
    use crate::permissions::CapabilityChecker;
    use arboard::ImageData;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeClipboard {
        text: Mutex<Option<String>>,
        image: Mutex<Option<ImageData<'static>>>,
        writes: Mutex<Vec<String>>,
        clears: AtomicUsize,
        /// Simulates another process grabbing the clipboard after each write.
        hostile: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl FakeClipboard {
        fn with_text(text: &str) -> Self {
            let clipboard = Self::default();
            *clipboard.text.lock().unwrap() = Some(text.to_string());
            clipboard
        }

        fn with_image(width: usize, height: usize) -> Self {
            let clipboard = Self::default();
            *clipboard.image.lock().unwrap() = Some(ImageData {
                width,
                height,
                bytes: vec![0xaa; width * height * 4].into(),
            });
            clipboard
        }

        fn current(&self) -> Option<String> {
            self.text.lock().unwrap().clone()
        }

        fn current_image_size(&self) -> Option<(usize, usize)> {
            self.image
                .lock()
                .unwrap()
                .as_ref()
                .map(|image| (image.width, image.height))
        }

        fn writes_of(&self, text: &str) -> usize {
            self.writes.lock().unwrap().iter().filter(|w| *w == text).count()
        }
    }

    impl ClipboardAccess for FakeClipboard {
        fn read_text(&self) -> Option<String> {
            self.current()
        }

        fn write_text(&self, text: &str) -> Result<(), String> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err("clipboard is locked by another process".to_string());
            }
            self.writes.lock().unwrap().push(text.to_string());
            let stored = if self.hostile.load(Ordering::SeqCst) {
                "someone else".to_string()
            } else {
                text.to_string()
            };
            *self.text.lock().unwrap() = Some(stored);
            *self.image.lock().unwrap() = None;
            Ok(())
        }

        fn clear(&self) -> Result<(), String> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            *self.text.lock().unwrap() = None;
            *self.image.lock().unwrap() = None;
            Ok(())
        }

        fn write_image(&self, image: ImageData<'static>) -> Result<(), String> {
            *self.text.lock().unwrap() = None;
            *self.image.lock().unwrap() = Some(image);
            Ok(())
        }

        fn capture(&self) -> ClipboardSnapshot {
            if let Some(text) = self.current() {
                return ClipboardSnapshot::Text(text);
            }
            match self.image.lock().unwrap().clone() {
                Some(image) => ClipboardSnapshot::Image(image),
                None => ClipboardSnapshot::Empty,
            }
        }
    }

    #[derive(Default)]
    struct FakeKeys {
        events: Mutex<Vec<&'static str>>,
        flag: Mutex<Option<SyntheticPasteProbe>>,
        flag_during_paste: Mutex<Vec<bool>>,
        fail_paste: AtomicBool,
    }

    impl FakeKeys {
        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    impl KeySynthesizer for FakeKeys {
        fn send_paste(&self) -> Result<(), String> {
            self.events.lock().unwrap().push("paste");
            if let Some(probe) = self.flag.lock().unwrap().as_ref() {
                self.flag_during_paste.lock().unwrap().push(probe.is_active());
            }
            if self.fail_paste.load(Ordering::SeqCst) {
                return Err("input injection blocked".to_string());
            }
            Ok(())
        }

        fn send_select_all(&self) -> Result<(), String> {
            self.events.lock().unwrap().push("select_all");
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFocus {
        activations: AtomicUsize,
    }

    impl AppActivator for FakeFocus {
        fn activate(&self, _app: &PreviousApp) -> bool {
            self.activations.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[derive(Default)]
    struct FakeProbe {
        context: Mutex<TextContext>,
        accept_writes: AtomicBool,
        reads: AtomicUsize,
        written: Mutex<Vec<String>>,
    }

    impl FakeProbe {
        fn with_field(existing: &str, selected: &str) -> Self {
            let probe = Self::default();
            *probe.context.lock().unwrap() = TextContext {
                existing_content: existing.to_string(),
                selected_text: selected.to_string(),
                has_selection: !selected.is_empty(),
                source_app_name: "Editor".to_string(),
            };
            probe
        }
    }

    impl ContextProbe for FakeProbe {
        fn get_current_text_context(&self) -> TextContext {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.context.lock().unwrap().clone()
        }

        fn set_text_content(&self, text: &str) -> bool {
            self.written.lock().unwrap().push(text.to_string());
            self.accept_writes.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingTelemetry {
        events: Mutex<Vec<(String, Map<String, Value>)>>,
    }

    impl RecordingTelemetry {
        fn names(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
        }
    }

    impl Telemetry for RecordingTelemetry {
        fn track(&self, event: &str, properties: Map<String, Value>) {
            self.events.lock().unwrap().push((event.to_string(), properties));
        }
    }

    struct Granted {
        ui: bool,
        events: bool,
    }

    impl CapabilityChecker for Granted {
        fn check(&self, capability: Capability, _prompt: bool) -> bool {
            match capability {
                Capability::UiAutomation => self.ui,
                Capability::EventDelivery => self.events,
            }
        }
    }

    /// Clock that jumps forward by `extra` on every sleep, to simulate a slow target.
    struct SlowClock {
        extra: Duration,
    }

    impl Clock for SlowClock {
        fn now(&self) -> Instant {
            Instant::now()
        }

        fn sleep(&self, duration: Duration) -> futures::future::BoxFuture<'static, ()> {
            Box::pin(tokio::time::sleep(duration + self.extra))
        }
    }

    struct Harness {
        clipboard: Arc<FakeClipboard>,
        keys: Arc<FakeKeys>,
        focus: Arc<FakeFocus>,
        probe: Arc<FakeProbe>,
        telemetry: Arc<RecordingTelemetry>,
        service: InsertionService,
    }

    struct HarnessBuilder {
        clipboard: FakeClipboard,
        probe: FakeProbe,
        ui: bool,
        events: bool,
        clock: Arc<dyn Clock>,
        settings: InsertionSettings,
    }

    impl HarnessBuilder {
        fn new() -> Self {
            Self {
                clipboard: FakeClipboard::default(),
                probe: FakeProbe::default(),
                ui: true,
                events: true,
                clock: Arc::new(TokioClock),
                settings: InsertionSettings::default(),
            }
        }

        fn clipboard(mut self, clipboard: FakeClipboard) -> Self {
            self.clipboard = clipboard;
            self
        }

        fn probe(mut self, probe: FakeProbe) -> Self {
            self.probe = probe;
            self
        }

        fn permissions(mut self, ui: bool, events: bool) -> Self {
            self.ui = ui;
            self.events = events;
            self
        }

        fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
            self.clock = clock;
            self
        }

        fn build(self) -> Harness {
            let clipboard = Arc::new(self.clipboard);
            let keys = Arc::new(FakeKeys::default());
            let focus = Arc::new(FakeFocus::default());
            let probe = Arc::new(self.probe);
            let telemetry = Arc::new(RecordingTelemetry::default());
            let permissions = Arc::new(PermissionGate::new(
                Arc::new(Granted {
                    ui: self.ui,
                    events: self.events,
                }),
                Arc::clone(&self.clock),
                Duration::from_secs(2),
            ));
            permissions.check_all();

            let service = InsertionService::spawn(
                OrchestratorBackends {
                    clipboard: clipboard.clone(),
                    keys: keys.clone(),
                    focus: focus.clone(),
                    probe: probe.clone(),
                    permissions,
                    telemetry: telemetry.clone(),
                    clock: self.clock,
                },
                self.settings,
            );
            *keys.flag.lock().unwrap() = Some(service.synthetic_paste_probe());

            Harness {
                clipboard,
                keys,
                focus,
                probe,
                telemetry,
                service,
            }
        }
    }

    fn editor() -> Option<PreviousApp> {
        Some(PreviousApp {
            token: AppToken::Named("Editor".to_string()),
            name: "Editor".to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_without_previous_app_only_writes_clipboard() {
        let h = HarnessBuilder::new()
            .clipboard(FakeClipboard::with_text("before"))
            .build();

        let report = h.service.insert("hello", Enhancement::default()).await;

        assert_eq!(report.outcome, InsertionOutcome::ClipboardOnly);
        assert_eq!(report.errors, vec![InsertionError::FocusUnavailable]);
        assert_eq!(h.clipboard.current().as_deref(), Some("hello"));
        assert!(h.keys.events().is_empty());
        assert_eq!(h.focus.activations.load(Ordering::SeqCst), 0);
        assert_eq!(h.probe.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_pastes_and_restores_previous_clipboard() {
        let h = HarnessBuilder::new()
            .clipboard(FakeClipboard::with_text("before"))
            .build();
        h.service.set_previous_app(editor());

        let report = h.service.insert("hello", Enhancement::default()).await;

        assert_eq!(report.outcome, InsertionOutcome::Delivered);
        assert_eq!(report.strategy, Some(DeliveryStrategy::ClipboardPaste));
        assert!(report.errors.is_empty());
        assert_eq!(h.keys.events(), vec!["paste"]);
        assert_eq!(h.focus.activations.load(Ordering::SeqCst), 1);
        assert_eq!(h.clipboard.current().as_deref(), Some("before"));
        assert_eq!(h.probe.reads.load(Ordering::SeqCst), 0);
        assert_eq!(h.service.stage(), InsertionStage::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_clears_when_clipboard_was_empty() {
        let h = HarnessBuilder::new().build();
        h.service.set_previous_app(editor());

        let report = h.service.insert("hello", Enhancement::default()).await;

        assert!(report.is_delivered());
        assert_eq!(h.clipboard.current(), None);
        assert_eq!(h.clipboard.clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_previous_app_is_consumed_by_one_request() {
        let h = HarnessBuilder::new().build();
        h.service.set_previous_app(editor());

        let first = h.service.insert("one", Enhancement::default()).await;
        let second = h.service.insert("two", Enhancement::default()).await;

        assert_eq!(first.outcome, InsertionOutcome::Delivered);
        assert_eq!(second.outcome, InsertionOutcome::ClipboardOnly);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clipboard_race_retries_three_times_then_pastes() {
        let h = HarnessBuilder::new().build();
        h.clipboard.hostile.store(true, Ordering::SeqCst);
        h.service.set_previous_app(editor());

        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let counter = Arc::clone(&fired);
        h.service
            .insert_prompt("prompt", Enhancement::default(), move |report| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(report);
            });
        let report = rx.await.unwrap();

        // One initial write plus three rewrites.
        assert_eq!(h.clipboard.writes_of("prompt"), 4);
        assert_eq!(report.verify_attempts, 3);
        assert_eq!(report.errors, vec![InsertionError::ClipboardRace { attempts: 3 }]);
        assert_eq!(h.keys.events(), vec!["paste"]);
        assert_eq!(report.outcome, InsertionOutcome::Delivered);
        assert_eq!(
            h.telemetry.names(),
            vec![EVENT_INSERTION_FAILURE.to_string()]
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_paste_flag_only_set_around_paste() {
        let h = HarnessBuilder::new().build();
        let probe = h.service.synthetic_paste_probe();
        h.service.set_previous_app(editor());
        assert!(!probe.is_active());

        let report = h.service.insert("hello", Enhancement::default()).await;

        assert!(report.is_delivered());
        assert_eq!(*h.keys.flag_during_paste.lock().unwrap(), vec![true]);
        assert!(!probe.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_write_success_never_touches_clipboard() {
        let probe = FakeProbe::with_field("line1", "");
        probe.accept_writes.store(true, Ordering::SeqCst);
        let h = HarnessBuilder::new()
            .clipboard(FakeClipboard::with_text("before"))
            .probe(probe)
            .build();

        let mut enhancement = Enhancement::with_placement(Placement::Top);
        enhancement.newline_after = true;
        let report = h.service.insert_directly("HEADER", enhancement).await;

        assert_eq!(report.outcome, InsertionOutcome::Delivered);
        assert_eq!(report.strategy, Some(DeliveryStrategy::DirectWrite));
        assert_eq!(*h.probe.written.lock().unwrap(), vec!["HEADER\nline1".to_string()]);
        assert!(h.clipboard.writes.lock().unwrap().is_empty());
        assert!(h.keys.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_direct_write_replaces_selection_in_field() {
        let probe = FakeProbe::with_field("fix this code please", "this code");
        probe.accept_writes.store(true, Ordering::SeqCst);
        let h = HarnessBuilder::new().probe(probe).build();

        let mut enhancement = Enhancement::with_placement(Placement::Wrap);
        enhancement.wrap_prefix = "<".to_string();
        enhancement.wrap_suffix = ">".to_string();
        let report = h
            .service
            .insert_directly("Review {{selection}}", enhancement)
            .await;

        assert_eq!(report.strategy, Some(DeliveryStrategy::DirectWrite));
        assert_eq!(
            *h.probe.written.lock().unwrap(),
            vec!["fix Review <this code> please".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_miss_falls_back_to_clipboard() {
        let h = HarnessBuilder::new().build();
        h.service.set_previous_app(editor());

        let report = h
            .service
            .insert("hello", Enhancement::with_placement(Placement::Bottom))
            .await;

        assert_eq!(report.outcome, InsertionOutcome::Delivered);
        assert_eq!(report.strategy, Some(DeliveryStrategy::ClipboardPaste));
        assert_eq!(report.errors, vec![InsertionError::ProbeMiss]);
        assert_eq!(h.keys.events(), vec!["paste"]);
        assert_eq!(h.clipboard.writes_of("hello"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_direct_write_selects_all_before_paste() {
        let h = HarnessBuilder::new()
            .probe(FakeProbe::with_field("line1", ""))
            .build();
        h.service.set_previous_app(editor());

        let report = h
            .service
            .insert("tail", Enhancement::with_placement(Placement::Bottom))
            .await;

        assert_eq!(report.errors, vec![InsertionError::DirectWriteFailed]);
        assert_eq!(h.keys.events(), vec!["select_all", "paste"]);
        assert_eq!(h.clipboard.writes_of("line1\ntail"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_without_selection_pastes_unwrapped_content() {
        let h = HarnessBuilder::new()
            .probe(FakeProbe::with_field("some text", ""))
            .build();
        h.service.set_previous_app(editor());

        let mut enhancement = Enhancement::with_placement(Placement::Wrap);
        enhancement.wrap_prefix = "[".to_string();
        enhancement.wrap_suffix = "]".to_string();
        let report = h.service.insert("Explain", enhancement).await;

        assert_eq!(report.errors, vec![InsertionError::SelectionRequired]);
        assert_eq!(h.clipboard.writes_of("Explain"), 1);
        assert_eq!(h.keys.events(), vec!["paste"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ui_automation_denied_skips_probe() {
        let h = HarnessBuilder::new()
            .probe(FakeProbe::with_field("line1", ""))
            .permissions(false, true)
            .build();
        h.service.set_previous_app(editor());

        let report = h
            .service
            .insert("x", Enhancement::with_placement(Placement::Top))
            .await;

        assert_eq!(h.probe.reads.load(Ordering::SeqCst), 0);
        assert_eq!(
            report.errors,
            vec![InsertionError::PermissionUnavailable(Capability::UiAutomation)]
        );
        assert!(report.is_delivered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_delivery_denied_leaves_text_on_clipboard() {
        let h = HarnessBuilder::new().permissions(true, false).build();
        h.service.set_previous_app(editor());

        let report = h.service.insert("hello", Enhancement::default()).await;

        assert_eq!(report.outcome, InsertionOutcome::ClipboardOnly);
        assert_eq!(
            report.errors,
            vec![InsertionError::PermissionUnavailable(Capability::EventDelivery)]
        );
        assert!(h.keys.events().is_empty());
        assert_eq!(h.clipboard.current().as_deref(), Some("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_insert_without_previous_app_still_pastes() {
        let h = HarnessBuilder::new().build();

        let report = h.service.insert_directly("hello", Enhancement::default()).await;

        assert!(report.is_delivered());
        assert_eq!(h.keys.events(), vec!["paste"]);
        assert_eq!(h.focus.activations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_rejects_immediately() {
        let h = HarnessBuilder::new().build();
        let mut stages = h.service.subscribe_stage();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for id in 0..3 {
            let tx = tx.clone();
            h.service
                .insert_prompt_directly(format!("p{}", id), Enhancement::default(), move |report| {
                    let _ = tx.send((id, report.outcome));
                });
            if id == 0 {
                // Let the actor pick up the first request.
                stages
                    .wait_for(|stage| *stage != InsertionStage::Idle)
                    .await
                    .unwrap();
            }
        }

        // The third submission is rejected before any time passes.
        assert_eq!(rx.try_recv().unwrap(), (2, InsertionOutcome::Rejected));

        let mut rest = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        rest.sort_by_key(|(id, _)| *id);
        assert_eq!(
            rest,
            vec![
                (0, InsertionOutcome::Delivered),
                (1, InsertionOutcome::Delivered)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_skips_restore() {
        let h = HarnessBuilder::new()
            .clipboard(FakeClipboard::with_text("before"))
            .build();
        h.service.set_previous_app(editor());
        let mut stages = h.service.subscribe_stage();

        let (tx, rx) = oneshot::channel();
        h.service.insert_prompt("hello", Enhancement::default(), move |report| {
            let _ = tx.send(report);
        });

        stages
            .wait_for(|stage| *stage == InsertionStage::Restoring)
            .await
            .unwrap();
        assert!(h.service.cancel_in_flight());
        let report = rx.await.unwrap();

        assert_eq!(report.outcome, InsertionOutcome::Cancelled);
        assert_eq!(h.keys.events(), vec!["paste"]);
        assert_eq!(h.clipboard.current().as_deref(), Some("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_does_nothing() {
        let h = HarnessBuilder::new().build();
        h.service.set_previous_app(editor());

        let (tx, rx) = oneshot::channel();
        let token = h.service.insert_prompt("hello", Enhancement::default(), move |report| {
            let _ = tx.send(report);
        });
        token.cancel();

        let report = rx.await.unwrap();
        assert_eq!(report.outcome, InsertionOutcome::Cancelled);
        assert!(h.clipboard.writes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_insertion_emits_telemetry() {
        let h = HarnessBuilder::new()
            .clock(Arc::new(SlowClock {
                extra: Duration::from_secs(1),
            }))
            .build();
        h.service.set_previous_app(editor());

        let report = h.service.insert("hello", Enhancement::default()).await;

        assert!(report.elapsed > Duration::from_secs(2));
        let events = h.telemetry.events.lock().unwrap();
        let (name, properties) = &events[0];
        assert_eq!(name, EVENT_INSERTION_SLOW);
        assert_eq!(properties["strategy"], json!("clipboard_paste"));
        assert!(properties["elapsed_ms"].as_u64().unwrap() > 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_clipboard_is_restored_after_paste() {
        let h = HarnessBuilder::new()
            .clipboard(FakeClipboard::with_image(4, 2))
            .build();
        h.service.set_previous_app(editor());

        let report = h.service.insert("hello", Enhancement::default()).await;

        assert!(report.is_delivered());
        assert_eq!(h.keys.events(), vec!["paste"]);
        assert_eq!(h.clipboard.current_image_size(), Some((4, 2)));
        assert_eq!(h.clipboard.current(), None);
        assert_eq!(h.clipboard.clears.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paste_failure_leaves_text_on_clipboard() {
        let h = HarnessBuilder::new()
            .clipboard(FakeClipboard::with_text("before"))
            .build();
        h.keys.fail_paste.store(true, Ordering::SeqCst);
        let flag = h.service.synthetic_paste_probe();
        h.service.set_previous_app(editor());

        let report = h.service.insert("hello", Enhancement::default()).await;

        assert_eq!(report.outcome, InsertionOutcome::ClipboardOnly);
        assert_eq!(
            report.errors,
            vec![InsertionError::KeySynthesisFailed(
                "input injection blocked".to_string()
            )]
        );
        assert_eq!(h.keys.events(), vec!["paste"]);
        assert_eq!(h.clipboard.current().as_deref(), Some("hello"));
        assert_eq!(h.clipboard.writes_of("before"), 0);
        assert!(!flag.is_active());
        assert_eq!(h.telemetry.names(), vec![EVENT_INSERTION_FAILURE.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clipboard_write_failure_fails_without_paste() {
        let h = HarnessBuilder::new()
            .clipboard(FakeClipboard::with_text("before"))
            .build();
        h.clipboard.fail_writes.store(true, Ordering::SeqCst);
        h.service.set_previous_app(editor());

        let report = h.service.insert("hello", Enhancement::default()).await;

        assert_eq!(report.outcome, InsertionOutcome::Failed);
        assert!(matches!(
            report.errors.as_slice(),
            [InsertionError::ClipboardUnavailable(_)]
        ));
        assert!(h.keys.events().is_empty());
        assert_eq!(h.clipboard.current().as_deref(), Some("before"));
        assert_eq!(h.clipboard.clears.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clipboard_write_failure_without_paste_target_fails() {
        let h = HarnessBuilder::new().build();
        h.clipboard.fail_writes.store(true, Ordering::SeqCst);

        let report = h.service.insert("hello", Enhancement::default()).await;

        assert_eq!(report.outcome, InsertionOutcome::Failed);
        assert_eq!(report.errors[0], InsertionError::FocusUnavailable);
        assert!(matches!(report.errors[1], InsertionError::ClipboardUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_selection_missing_from_field_pastes_instead() {
        let probe = FakeProbe::with_field("some text", "elsewhere");
        probe.accept_writes.store(true, Ordering::SeqCst);
        let h = HarnessBuilder::new().probe(probe).build();
        h.service.set_previous_app(editor());

        let enhancement = Enhancement::with_placement(Placement::Wrap);
        let expected = enhancement.apply("Explain", Some("elsewhere"), "some text");
        let report = h.service.insert("Explain", enhancement).await;

        assert_eq!(report.outcome, InsertionOutcome::Delivered);
        assert_eq!(report.strategy, Some(DeliveryStrategy::ClipboardPaste));
        assert_eq!(report.errors, vec![InsertionError::DirectWriteFailed]);
        assert!(h.probe.written.lock().unwrap().is_empty());
        assert_eq!(h.clipboard.writes_of(&expected), 1);
        // The paste replaces the live selection, so no select-all.
        assert_eq!(h.keys.events(), vec!["paste"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_ambiguous_selection_is_not_written_directly() {
        let probe = FakeProbe::with_field("a = a + 1", "a");
        probe.accept_writes.store(true, Ordering::SeqCst);
        let h = HarnessBuilder::new().probe(probe).build();
        h.service.set_previous_app(editor());

        let report = h
            .service
            .insert("rename {{selection}}", Enhancement::with_placement(Placement::Wrap))
            .await;

        assert_eq!(report.strategy, Some(DeliveryStrategy::ClipboardPaste));
        assert_eq!(report.errors, vec![InsertionError::DirectWriteFailed]);
        assert!(h.probe.written.lock().unwrap().is_empty());
        assert_eq!(h.keys.events(), vec!["paste"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_unique_selection_is_replaced_in_place() {
        let probe = FakeProbe::with_field("let x = 1; // x", "let x = 1;");
        probe.accept_writes.store(true, Ordering::SeqCst);
        let h = HarnessBuilder::new().probe(probe).build();

        let report = h
            .service
            .insert_directly("[{{selection}}]", Enhancement::with_placement(Placement::Wrap))
            .await;

        assert_eq!(report.strategy, Some(DeliveryStrategy::DirectWrite));
        assert_eq!(
            *h.probe.written.lock().unwrap(),
            vec!["[let x = 1;] // x".to_string()]
        );
    }

    #[test]
    fn test_dropped_completion_reports_abandoned() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        drop(Completion::new(move |report| {
            *sink.lock().unwrap() = Some(report.outcome);
        }));
        assert_eq!(*seen.lock().unwrap(), Some(InsertionOutcome::Abandoned));
    }
}
