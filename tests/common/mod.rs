//! Shared fixtures: synthetic annotated faces, a stage that records what it
//! is given, a stage that fails on cue, and a holistic feature that counts
//! its invocations.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use percent_sdm::{
    CascadeStage, CascadeTrainer, Error, HolisticFeature, Image, Point, Result, Shape, StageMode,
    TrainerConfig, GT_BB_NAMESPACE,
};

pub const GROUP: &str = "PTS";

/// Five-point face layout in the unit square: eyes, nose, mouth corners.
pub fn template() -> Shape {
    Shape::new(vec![
        Point::new(0.30, 0.30),
        Point::new(0.70, 0.30),
        Point::new(0.50, 0.55),
        Point::new(0.35, 0.75),
        Point::new(0.65, 0.75),
    ])
}

pub fn face_shape(x: f32, y: f32, size: f32) -> Shape {
    Shape::new(
        template()
            .points
            .iter()
            .map(|p| Point::new(x + p.x * size, y + p.y * size))
            .collect(),
    )
}

/// 80x80 image with a Gaussian blob on every landmark, annotated under [`GROUP`].
pub fn synthetic_image(shape: Shape) -> Image {
    let blobs = shape.clone();
    let mut image = Image::from_fn(80, 80, move |x, y| {
        blobs
            .points
            .iter()
            .map(|p| {
                let dx = x as f32 - p.x;
                let dy = y as f32 - p.y;
                (-(dx * dx + dy * dy) / 18.0).exp()
            })
            .sum::<f32>()
            .min(1.0)
    });
    image.landmarks.insert(GROUP, shape);
    image
}

/// `n` faces at varied positions and sizes.
pub fn dataset(n: usize) -> Vec<Image> {
    (0..n)
        .map(|i| {
            let size = 36.0 + 2.0 * (i % 5) as f32;
            let x = 14.0 + 3.0 * (i % 4) as f32;
            let y = 12.0 + 2.5 * (i % 3) as f32;
            synthetic_image(face_shape(x, y, size))
        })
        .collect()
}

pub fn reference() -> Shape {
    face_shape(0.0, 0.0, 40.0)
}

pub fn gt_seed_key() -> String {
    format!("{GT_BB_NAMESPACE}0")
}

/// What a [`RecordingStage`] saw on one call.
#[derive(Debug, Clone)]
pub struct StageCall {
    pub stage: usize,
    pub mode: StageMode,
    pub image_sizes: Vec<(u32, u32)>,
    pub gt_shapes: Vec<Shape>,
    /// The ground-truth seed box of every image, when one was synthesized.
    pub seed_boxes: Vec<Option<Shape>>,
    pub current: Vec<Vec<Shape>>,
}

pub type CallLog = Rc<RefCell<Vec<StageCall>>>;

/// Stage that logs its inputs and returns the estimates unchanged.
pub struct RecordingStage {
    index: usize,
    log: CallLog,
}

impl RecordingStage {
    fn record(&self, mode: StageMode, images: &[Image], gt_shapes: &[Shape], current: &[Vec<Shape>]) {
        let seed_key = gt_seed_key();
        self.log.borrow_mut().push(StageCall {
            stage: self.index,
            mode,
            image_sizes: images.iter().map(|i| (i.width(), i.height())).collect(),
            gt_shapes: gt_shapes.to_vec(),
            seed_boxes: images
                .iter()
                .map(|i| i.landmarks.get(&seed_key).cloned())
                .collect(),
            current: current.to_vec(),
        });
    }
}

impl CascadeStage for RecordingStage {
    fn name(&self) -> &str {
        "Recording"
    }

    fn train(
        &mut self,
        images: &[Image],
        gt_shapes: &[Shape],
        current: Vec<Vec<Shape>>,
    ) -> Result<Vec<Vec<Shape>>> {
        self.record(StageMode::Train, images, gt_shapes, &current);
        Ok(current)
    }

    fn increment(
        &mut self,
        images: &[Image],
        gt_shapes: &[Shape],
        current: Vec<Vec<Shape>>,
    ) -> Result<Vec<Vec<Shape>>> {
        self.record(StageMode::Increment, images, gt_shapes, &current);
        Ok(current)
    }

    fn run(&self, _image: &Image, initial: &Shape) -> Result<Vec<Shape>> {
        Ok(vec![initial.clone()])
    }
}

/// A trainer whose stages are [`RecordingStage`]s sharing one log.
pub fn recording_trainer(config: TrainerConfig) -> (CascadeTrainer, CallLog) {
    let log: CallLog = Rc::default();
    let factory_log = Rc::clone(&log);
    let mut index = 0;
    let trainer = CascadeTrainer::new(config, move |_cfg| {
        let stage = RecordingStage {
            index,
            log: Rc::clone(&factory_log),
        };
        index += 1;
        Box::new(stage) as Box<dyn CascadeStage>
    })
    .expect("valid config");
    (trainer, log)
}

/// Stage that passes estimates through until its `fail_on`-th train or
/// increment call, which returns an error.
pub struct FailingStage {
    calls: Rc<Cell<usize>>,
    fail_on: usize,
}

impl FailingStage {
    fn step(&self, current: Vec<Vec<Shape>>) -> Result<Vec<Vec<Shape>>> {
        self.calls.set(self.calls.get() + 1);
        if self.calls.get() == self.fail_on {
            return Err(Error::Regression(format!("failed on call {}", self.fail_on)));
        }
        Ok(current)
    }
}

impl CascadeStage for FailingStage {
    fn name(&self) -> &str {
        "Failing"
    }

    fn train(
        &mut self,
        _images: &[Image],
        _gt_shapes: &[Shape],
        current: Vec<Vec<Shape>>,
    ) -> Result<Vec<Vec<Shape>>> {
        self.step(current)
    }

    fn increment(
        &mut self,
        _images: &[Image],
        _gt_shapes: &[Shape],
        current: Vec<Vec<Shape>>,
    ) -> Result<Vec<Vec<Shape>>> {
        self.step(current)
    }

    fn run(&self, _image: &Image, initial: &Shape) -> Result<Vec<Shape>> {
        Ok(vec![initial.clone()])
    }
}

/// A trainer whose stages share one call counter and fail on call `fail_on`.
pub fn failing_trainer(config: TrainerConfig, fail_on: usize) -> CascadeTrainer {
    let calls = Rc::new(Cell::new(0));
    CascadeTrainer::new(config, move |_cfg| {
        Box::new(FailingStage {
            calls: Rc::clone(&calls),
            fail_on,
        }) as Box<dyn CascadeStage>
    })
    .expect("valid config")
}

/// Identity feature that counts how many images it was applied to.
pub struct CountingFeature {
    calls: Arc<AtomicUsize>,
}

impl HolisticFeature for CountingFeature {
    fn name(&self) -> &str {
        "counting"
    }

    fn compute(&self, image: &Image) -> Image {
        self.calls.fetch_add(1, Ordering::SeqCst);
        image.clone()
    }
}

pub fn counting_feature() -> (Arc<dyn HolisticFeature>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let feature = CountingFeature {
        calls: Arc::clone(&calls),
    };
    (Arc::new(feature), calls)
}

pub fn assert_shapes_close(a: &Shape, b: &Shape, tolerance: f32) {
    assert_eq!(a.num_landmarks(), b.num_landmarks());
    for (p, q) in a.points.iter().zip(&b.points) {
        assert!(
            p.distance(q) <= tolerance,
            "{p:?} and {q:?} differ by more than {tolerance}"
        );
    }
}
