use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use common::PipelineConfig;
use futures::future::{BoxFuture, FutureExt};
use gesture_pipeline::{
    meter::{Meter, MeterReading},
    spawn_model_load, BufferLedger, CaptureFnSource, CaptureScheduler, CapturedFrame,
    GestureModel, InferenceEngine, LabelTable, ManualRefresh, ModelLoadError, ModelLoader,
    ModelOutputs, PipelineError, Surface, SurfaceRect, TickOutcome,
};
use image::{Rgb, RgbImage};
use tokio_util::sync::CancellationToken;
use tract_onnx::prelude::Tensor;

type Error = Box<dyn std::error::Error>;

/// What the scripted model does on one call.
enum Step {
    Output(Vec<f32>, Vec<f32>),
    Fail,
}

fn low() -> Step {
    Step::Output(vec![0.3, 0.2, 0.2, 0.2, 0.1], vec![10.0, 10.0, 10.0, 10.0])
}

fn confident(index: usize, bbox: [f32; 4]) -> Step {
    let mut probs = vec![0.025; 5];
    probs[index] = 0.9;
    Step::Output(probs, bbox.to_vec())
}

/// Replays a script of outputs, low confidence once the script is used up.
struct ScriptedModel {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    num_classes: Option<usize>,
}

impl ScriptedModel {
    fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            num_classes: None,
        }
    }
}

impl GestureModel for ScriptedModel {
    fn predict(&self, input: &Tensor) -> anyhow::Result<ModelOutputs> {
        assert_eq!(input.shape(), &[1, 224, 224, 3]);
        self.calls.fetch_add(1, Ordering::SeqCst);

        let step = self.script.lock().unwrap().pop_front().unwrap_or_else(low);
        match step {
            Step::Output(class_probs, bbox) => Ok(ModelOutputs { class_probs, bbox }),
            Step::Fail => anyhow::bail!("scripted failure"),
        }
    }

    fn num_classes(&self) -> Option<usize> {
        self.num_classes
    }
}

struct StaticLoader(Option<Arc<dyn GestureModel>>);

impl ModelLoader for StaticLoader {
    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn GestureModel>, ModelLoadError>> {
        let model = self.0.clone();
        async move { model.ok_or_else(|| ModelLoadError::NotFound("gesture.onnx".into())) }.boxed()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Clear,
    Image,
    Rect(SurfaceRect),
    Text(String),
}

struct RecordingSurface {
    ops: Vec<Op>,
}

impl RecordingSurface {
    fn new() -> Self {
        Self { ops: vec![] }
    }

    /// Drawing operations grouped by repaint.
    fn repaints(&self) -> Vec<Vec<Op>> {
        let mut repaints: Vec<Vec<Op>> = vec![];
        for op in &self.ops {
            match op {
                Op::Clear => repaints.push(vec![]),
                op => repaints
                    .last_mut()
                    .expect("every repaint starts with a clear")
                    .push(op.clone()),
            }
        }
        repaints
    }

    fn rects(&self) -> Vec<SurfaceRect> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Rect(rect) => Some(*rect),
                _ => None,
            })
            .collect()
    }
}

impl Surface for RecordingSurface {
    fn dimensions(&self) -> (u32, u32) {
        (640, 480)
    }
    fn clear(&mut self) {
        self.ops.push(Op::Clear);
    }
    fn draw_image(&mut self, _image: &RgbImage) {
        self.ops.push(Op::Image);
    }
    fn draw_rect(&mut self, rect: SurfaceRect, _color: Rgb<u8>) {
        self.ops.push(Op::Rect(rect));
    }
    fn draw_text(&mut self, _x: f32, _y: f32, text: &str, _color: Rgb<u8>) {
        self.ops.push(Op::Text(text.to_owned()));
    }
}

fn frames(frames: Vec<CapturedFrame>) -> CaptureFnSource {
    let mut frames = VecDeque::from(frames);
    CaptureFnSource::new(Box::new(move || frames.pop_front()))
}

fn camera_frames(n: usize) -> CaptureFnSource {
    frames(
        (0..n)
            .map(|i| CapturedFrame::pixels(RgbImage::from_pixel(640, 480, Rgb([i as u8, 64, 128]))))
            .collect(),
    )
}

async fn loaded_engine(model: ScriptedModel, ledger: &BufferLedger) -> Arc<InferenceEngine> {
    let engine = InferenceEngine::new(StaticLoader(Some(Arc::new(model))), ledger.clone());
    engine.load().await.expect("scripted model loads");
    Arc::new(engine)
}

fn assert_close(actual: SurfaceRect, expected: [f32; 4]) {
    let actual = [actual.x, actual.y, actual.width, actual.height];
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!((a - e).abs() < 0.05, "{actual:?} != {expected:?}");
    }
}

#[tokio::test]
async fn gates_a_three_frame_sequence() -> Result<(), Error> {
    let config = PipelineConfig::default();
    let ledger = BufferLedger::new();
    let engine = loaded_engine(
        ScriptedModel::new(vec![low(), confident(2, [300.0, 400.0, 100.0, 120.0]), low()]),
        &ledger,
    )
    .await;

    let (refresh, _handle) = ManualRefresh::new();
    let mut scheduler = CaptureScheduler::new(&config, camera_frames(3), refresh, engine);
    let mut surface = RecordingSurface::new();
    let cancel = CancellationToken::new();

    let mut decisions = vec![];
    for _ in 0..3 {
        match scheduler.tick(&mut surface, &cancel).await? {
            TickOutcome::Rendered(decision) => decisions.push(decision),
            outcome => panic!("unexpected outcome {outcome:?}"),
        }
        assert_eq!(ledger.live(), 0);
    }

    assert_eq!(decisions[0], None);
    assert_eq!(decisions[2], None);
    let detection = decisions[1].as_ref().expect("second frame is confident");
    assert_eq!(detection.label, "Closed fist");
    assert_eq!(detection.class_index, 2);

    let repaints = surface.repaints();
    assert_eq!(repaints.len(), 3);
    assert_eq!(repaints[0], vec![Op::Image]);
    assert_eq!(repaints[2], vec![Op::Image]);
    match repaints[1].as_slice() {
        [Op::Image, Op::Rect(rect), Op::Text(text)] => {
            assert_close(*rect, [100.0, 177.8, 33.3, 53.3]);
            assert!(text.starts_with("Closed fist"));
        }
        ops => panic!("unexpected repaint {ops:?}"),
    }

    // One input tensor and two output buffers per tick.
    assert_eq!(ledger.allocated(), 9);
    Ok(())
}

#[tokio::test]
async fn run_ticks_once_per_refresh() -> Result<(), Error> {
    let config = PipelineConfig::default();
    let ledger = BufferLedger::new();
    let engine = loaded_engine(
        ScriptedModel::new(vec![low(), confident(2, [300.0, 400.0, 100.0, 120.0]), low()]),
        &ledger,
    )
    .await;

    let (refresh, handle) = ManualRefresh::new();
    for _ in 0..3 {
        handle.refresh();
    }
    drop(handle);

    let mut scheduler = CaptureScheduler::new(&config, camera_frames(10), refresh, engine);
    let mut surface = RecordingSurface::new();
    let stats = scheduler.run(&mut surface, &CancellationToken::new()).await?;

    assert_eq!(stats.ticks, 3);
    assert_eq!(stats.rendered, 3);
    assert_eq!(stats.inferences, 3);
    assert_eq!(surface.rects().len(), 1);
    assert_eq!(ledger.live(), 0);
    Ok(())
}

#[tokio::test]
async fn no_buffers_leak_across_outcomes() -> Result<(), Error> {
    const TICKS: usize = 40;

    let config = PipelineConfig::default();
    let ledger = BufferLedger::new();
    let script = (0..TICKS)
        .map(|i| match i % 4 {
            0 => confident(i % 5, [1.0, 2.0, 3.0, 4.0]),
            1 => Step::Fail,
            // Box regression head returning three values
            2 => Step::Output(vec![0.9, 0.1], vec![1.0, 2.0, 3.0]),
            _ => low(),
        })
        .collect();
    let engine = loaded_engine(ScriptedModel::new(script), &ledger).await;

    let (refresh, handle) = ManualRefresh::new();
    for _ in 0..TICKS {
        handle.refresh();
    }
    drop(handle);

    let mut scheduler = CaptureScheduler::new(&config, camera_frames(TICKS), refresh, engine);
    let mut surface = RecordingSurface::new();
    let baseline = ledger.live();
    let stats = scheduler.run(&mut surface, &CancellationToken::new()).await?;

    assert_eq!(stats.ticks as usize, TICKS);
    assert_eq!(stats.rendered as usize, TICKS);
    assert_eq!(stats.inferences as usize, TICKS);
    assert_eq!(surface.rects().len(), TICKS / 4);
    assert_eq!(ledger.live(), baseline);
    assert!(ledger.allocated() as usize >= TICKS);
    Ok(())
}

#[tokio::test]
async fn undecodable_frames_are_skipped() -> Result<(), Error> {
    let config = PipelineConfig::default();
    let ledger = BufferLedger::new();
    let engine = loaded_engine(ScriptedModel::new(vec![]), &ledger).await;

    let source = frames(vec![
        CapturedFrame::encoded(b"garbage".to_vec()),
        CapturedFrame::pixels(RgbImage::new(320, 240)),
    ]);
    let (refresh, _handle) = ManualRefresh::new();
    let meter = Arc::new(Meter::new());
    let mut scheduler =
        CaptureScheduler::new(&config, source, refresh, engine).with_meter(Arc::clone(&meter));
    let mut surface = RecordingSurface::new();
    let cancel = CancellationToken::new();

    assert_eq!(scheduler.tick(&mut surface, &cancel).await?, TickOutcome::Skipped);
    assert!(surface.ops.is_empty());
    assert_eq!(
        scheduler.tick(&mut surface, &cancel).await?,
        TickOutcome::Rendered(None)
    );
    assert_eq!(scheduler.tick(&mut surface, &cancel).await?, TickOutcome::NoFrame);

    let stats = scheduler.stats();
    assert_eq!((stats.ticks, stats.skipped, stats.rendered), (3, 1, 1));
    assert_eq!(
        meter.take_reading(),
        MeterReading {
            captured: 2,
            skipped: 1,
            inferred: 1,
            rendered: 1,
        }
    );
    assert_eq!(ledger.live(), 0);
    Ok(())
}

#[tokio::test]
async fn label_mismatch_stops_the_loop() -> Result<(), Error> {
    let config = PipelineConfig::default();
    let ledger = BufferLedger::new();
    let engine = loaded_engine(
        ScriptedModel::new(vec![
            low(),
            Step::Output(vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.95], vec![0.0; 4]),
        ]),
        &ledger,
    )
    .await;

    let (refresh, handle) = ManualRefresh::new();
    for _ in 0..5 {
        handle.refresh();
    }
    let mut scheduler = CaptureScheduler::new(&config, camera_frames(5), refresh, engine);
    let mut surface = RecordingSurface::new();

    let result = scheduler.run(&mut surface, &CancellationToken::new()).await;
    assert!(matches!(result, Err(PipelineError::LabelIndex(err)) if err.index == 5));
    assert_eq!(scheduler.stats().ticks, 2);
    assert_eq!(ledger.live(), 0);
    Ok(())
}

#[tokio::test]
async fn failed_load_degrades_to_plain_video() -> Result<(), Error> {
    let config = PipelineConfig::default();
    let ledger = BufferLedger::new();
    let engine = Arc::new(InferenceEngine::new(StaticLoader(None), ledger.clone()));
    let cancel = CancellationToken::new();

    let load = spawn_model_load(
        Arc::clone(&engine),
        LabelTable::from_config(&config.decision),
        cancel.clone(),
    );
    load.await??;
    assert!(!engine.is_ready());
    assert!(!cancel.is_cancelled());

    let (refresh, handle) = ManualRefresh::new();
    for _ in 0..3 {
        handle.refresh();
    }
    drop(handle);
    let mut scheduler = CaptureScheduler::new(&config, camera_frames(3), refresh, engine);
    let mut surface = RecordingSurface::new();
    let stats = scheduler.run(&mut surface, &cancel).await?;

    assert_eq!(stats.rendered, 3);
    assert_eq!(stats.inferences, 0);
    assert!(surface.rects().is_empty());
    assert_eq!(ledger.allocated(), 0);
    Ok(())
}

#[tokio::test]
async fn class_count_mismatch_is_fatal_at_startup() {
    let mut model = ScriptedModel::new(vec![]);
    model.num_classes = Some(7);
    let engine = Arc::new(InferenceEngine::new(
        StaticLoader(Some(Arc::new(model))),
        BufferLedger::new(),
    ));
    let cancel = CancellationToken::new();

    let result = spawn_model_load(
        engine,
        LabelTable::from_config(&PipelineConfig::default().decision),
        cancel.clone(),
    )
    .await
    .expect("load task");

    assert!(matches!(
        result,
        Err(PipelineError::LabelTableMismatch {
            classes: 7,
            labels: 5
        })
    ));
    assert!(cancel.is_cancelled());
}

/// Blocks inside the model call until released.
struct GatedModel {
    started: Mutex<mpsc::Sender<()>>,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl GestureModel for GatedModel {
    fn predict(&self, _input: &Tensor) -> anyhow::Result<ModelOutputs> {
        self.started.lock().unwrap().send(())?;
        self.gate.lock().unwrap().recv()?;
        Ok(ModelOutputs {
            class_probs: vec![0.0, 0.0, 0.95, 0.05, 0.0],
            bbox: vec![300.0, 400.0, 100.0, 120.0],
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn teardown_discards_in_flight_inference() -> Result<(), Error> {
    let config = PipelineConfig::default();
    let ledger = BufferLedger::new();
    let (started_tx, started_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel();
    let model = GatedModel {
        started: Mutex::new(started_tx),
        gate: Mutex::new(gate_rx),
    };
    let engine = Arc::new(InferenceEngine::new(
        StaticLoader(Some(Arc::new(model))),
        ledger.clone(),
    ));
    engine.load().await?;

    let (refresh, handle) = ManualRefresh::new();
    for _ in 0..5 {
        handle.refresh();
    }
    let mut scheduler = CaptureScheduler::new(&config, camera_frames(5), refresh, engine);
    let mut surface = RecordingSurface::new();
    let cancel = CancellationToken::new();

    let teardown = {
        let cancel = cancel.clone();
        async move {
            tokio::task::spawn_blocking(move || started_rx.recv())
                .await
                .expect("wait for model call")
                .expect("model call started");
            cancel.cancel();
        }
    };
    let (stats, ()) = tokio::join!(scheduler.run(&mut surface, &cancel), teardown);
    let stats = stats?;

    assert_eq!(stats.ticks, 1);
    assert_eq!(stats.rendered, 0);
    // The input tensor is still held by the blocked model call.
    assert_eq!(ledger.live(), 1);

    gate_tx.send(())?;
    tokio::time::timeout(Duration::from_secs(5), async {
        while ledger.live() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    assert_eq!(ledger.allocated(), 3);
    assert!(surface.ops.is_empty());

    // No further ticks after teardown.
    assert_eq!(
        scheduler.tick(&mut surface, &cancel).await?,
        TickOutcome::Cancelled
    );
    assert_eq!(scheduler.stats().ticks, 1);
    Ok(())
}
