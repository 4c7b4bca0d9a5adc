//! Capture scheduler.
//!
//! One tick per refresh: capture a frame, preprocess it, await the model, gate the result and
//! repaint the surface. The next refresh is only awaited once the previous tick is complete,
//! so model calls are never queued or run concurrently. Teardown goes through a
//! [`CancellationToken`]; a model call still running at that point finishes on the blocking
//! pool and its buffers are released there, the surface is not touched again.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::PipelineConfig;
use futures::future::{BoxFuture, FutureExt};
use tokio::{
    sync::mpsc,
    time::{interval, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    decision::{decide, Decision, LabelTable},
    error::PipelineError,
    meter::{Meter, Stage},
    nn::InferenceEngine,
    overlay::{OverlayRenderer, Surface},
    preprocess::{decode_frame, Preprocessor},
    sensors::{Frame, FrameSource},
};

/// Source of repaint opportunities.
pub trait RefreshSignal: Send {
    /// Resolve at the next repaint opportunity, `None` once the signal has ended.
    fn next_refresh(&mut self) -> BoxFuture<'_, Option<Instant>>;
}

/// Fixed-rate refresh. Refreshes missed while a tick runs are skipped, not queued.
pub struct DisplayRefresh {
    interval: Interval,
}

impl DisplayRefresh {
    pub fn new(refresh_hz: u32) -> Self {
        let mut interval = interval(Duration::from_secs_f64(1.0 / refresh_hz.max(1) as f64));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

impl RefreshSignal for DisplayRefresh {
    fn next_refresh(&mut self) -> BoxFuture<'_, Option<Instant>> {
        async move { Some(self.interval.tick().await.into_std()) }.boxed()
    }
}

/// Refresh signal driven through a [`RefreshHandle`].
///
/// Ends once every handle is dropped and all requested refreshes are consumed.
pub struct ManualRefresh {
    rx: mpsc::UnboundedReceiver<()>,
}

#[derive(Clone)]
pub struct RefreshHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualRefresh {
    pub fn new() -> (Self, RefreshHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, RefreshHandle { tx })
    }
}

impl RefreshHandle {
    /// Request one refresh. Returns `false` if the signal is gone.
    pub fn refresh(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

impl RefreshSignal for ManualRefresh {
    fn next_refresh(&mut self) -> BoxFuture<'_, Option<Instant>> {
        async move { self.rx.recv().await.map(|()| Instant::now()) }.boxed()
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The source had no frame available.
    NoFrame,
    /// The frame could not be decoded.
    Skipped,
    /// The surface was repainted with this decision.
    Rendered(Decision),
    /// Teardown was signalled, the surface was left alone.
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub rendered: u64,
    pub inferences: u64,
    pub skipped: u64,
}

enum Inferred {
    Decided(Decision),
    Cancelled,
}

pub struct CaptureScheduler<F, R> {
    source: F,
    refresh: R,
    preprocessor: Preprocessor,
    engine: Arc<InferenceEngine>,
    labels: LabelTable,
    threshold: f32,
    renderer: OverlayRenderer,
    meter: Arc<Meter>,
    stats: SchedulerStats,
    last_label: Option<String>,
}

impl<F: FrameSource, R: RefreshSignal> CaptureScheduler<F, R> {
    pub fn new(config: &PipelineConfig, source: F, refresh: R, engine: Arc<InferenceEngine>) -> Self {
        Self {
            source,
            refresh,
            preprocessor: Preprocessor::new(&config.model, engine.ledger().clone()),
            engine,
            labels: LabelTable::from_config(&config.decision),
            threshold: config.decision.threshold,
            renderer: OverlayRenderer::new(&config.overlay),
            meter: Arc::new(Meter::new()),
            stats: SchedulerStats::default(),
            last_label: None,
        }
    }

    /// Count frames on a shared meter instead of a private one.
    pub fn with_meter(mut self, meter: Arc<Meter>) -> Self {
        self.meter = meter;
        self
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn renderer(&self) -> &OverlayRenderer {
        &self.renderer
    }

    /// Tick once per refresh until the signal ends, the source is exhausted or `cancel` fires.
    ///
    /// Per-tick failures are logged and contained. Only a model/label table mismatch ends the
    /// loop with an error.
    pub async fn run<S: Surface + ?Sized>(
        &mut self,
        surface: &mut S,
        cancel: &CancellationToken,
    ) -> Result<SchedulerStats, PipelineError> {
        log::info!("Capture loop started");

        loop {
            let refreshed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                refreshed = self.refresh.next_refresh() => refreshed,
            };
            if refreshed.is_none() {
                log::info!("Refresh signal ended");
                break;
            }

            match self.tick(surface, cancel).await? {
                TickOutcome::Cancelled => break,
                TickOutcome::NoFrame if self.source.is_exhausted() => {
                    log::info!("Frame source exhausted");
                    break;
                }
                _ => (),
            }
        }

        log::info!(
            "Capture loop stopped after {} ticks ({} rendered, {} inferences, {} skipped)",
            self.stats.ticks,
            self.stats.rendered,
            self.stats.inferences,
            self.stats.skipped
        );
        Ok(self.stats)
    }

    /// Run one pass of the pipeline.
    pub async fn tick<S: Surface + ?Sized>(
        &mut self,
        surface: &mut S,
        cancel: &CancellationToken,
    ) -> Result<TickOutcome, PipelineError> {
        if cancel.is_cancelled() {
            return Ok(TickOutcome::Cancelled);
        }
        self.stats.ticks += 1;

        let Some(captured) = self.source.capture() else {
            log::trace!("No frame available");
            return Ok(TickOutcome::NoFrame);
        };
        self.meter.record(Stage::Captured);

        let frame = match decode_frame(captured) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("Skipping frame: {err}");
                self.stats.skipped += 1;
                self.meter.record(Stage::Skipped);
                return Ok(TickOutcome::Skipped);
            }
        };

        let decision = match self.infer(&frame, cancel).await? {
            Inferred::Decided(decision) => decision,
            Inferred::Cancelled => return Ok(TickOutcome::Cancelled),
        };
        if cancel.is_cancelled() {
            return Ok(TickOutcome::Cancelled);
        }

        self.renderer.render(surface, &frame, &decision);
        self.stats.rendered += 1;
        self.meter.record(Stage::Rendered);
        self.log_decision(&decision);

        Ok(TickOutcome::Rendered(decision))
    }

    async fn infer(
        &mut self,
        frame: &Frame,
        cancel: &CancellationToken,
    ) -> Result<Inferred, PipelineError> {
        if !self.engine.is_ready() {
            return Ok(Inferred::Decided(None));
        }

        let input = self.preprocessor.run(frame);
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("Teardown during inference, discarding its result");
                return Ok(Inferred::Cancelled);
            }
            raw = self.engine.infer(input) => raw,
        };
        self.stats.inferences += 1;

        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("Inference failed: {err}");
                return Ok(Inferred::Decided(None));
            }
        };
        self.meter.record(Stage::Inferred);

        let decision = decide(&raw, &self.labels, self.threshold);
        raw.release();

        Ok(Inferred::Decided(decision?))
    }

    fn log_decision(&mut self, decision: &Decision) {
        let label = decision.as_ref().map(|detection| detection.label.clone());
        if label != self.last_label {
            match decision {
                Some(detection) => log::info!("Gesture: {detection}"),
                None => log::info!("Gesture: none"),
            }
            self.last_label = label;
        } else if let Some(detection) = decision {
            log::debug!("Gesture: {detection}");
        }
    }
}
