//! Rendering many stamps, sequentially or on a pool of worker threads.
//!
//! Objects are grouped into contiguous chunks. Each chunk is one task on a
//! bounded queue feeding `nproc` threads; finished chunks come back on a
//! results channel in completion order and are scattered into index-addressed
//! slots, so the output order never depends on scheduling. Every object seeds
//! its own RNG, which makes a parallel batch identical to a sequential one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Sender};
use log::{debug, error, info, warn};

use crate::config::StampConfig;
use crate::error::{Result, StampError};
use crate::image_proc::{BadPixImage, Image};
use crate::profile::ProfileBuilder;
use crate::stamp::{render_stamp, StampRequest, StampResult};

/// Batch-wide rendering options. Per-object fields are copied into every
/// [`StampRequest`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchOptions {
    /// Worker threads; zero or negative means one per CPU.
    pub nproc: i64,
    /// Object number of the first stamp.
    pub obj_num: usize,
    pub xsize: usize,
    pub ysize: usize,
    pub sky_level_pixel: f64,
    pub do_noise: bool,
    pub make_psf_image: bool,
    pub make_weight_image: bool,
    pub make_badpix_image: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            nproc: 1,
            obj_num: 0,
            xsize: 0,
            ysize: 0,
            sky_level_pixel: 0.0,
            do_noise: true,
            make_psf_image: false,
            make_weight_image: false,
            make_badpix_image: false,
        }
    }
}

impl BatchOptions {
    pub fn request(&self, obj_num: usize) -> StampRequest {
        StampRequest {
            obj_num,
            xsize: self.xsize,
            ysize: self.ysize,
            sky_level_pixel: self.sky_level_pixel,
            do_noise: self.do_noise,
            make_psf_image: self.make_psf_image,
            make_weight_image: self.make_weight_image,
            make_badpix_image: self.make_badpix_image,
        }
    }
}

/// Rendered stamps in object order. All vectors have the batch length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StampBatch {
    pub images: Vec<Image>,
    pub psf_images: Vec<Option<Image>>,
    pub weight_images: Vec<Option<Image>>,
    pub badpix_images: Vec<Option<BadPixImage>>,
    pub current_vars: Vec<f64>,
    pub elapsed: Vec<Duration>,
}

impl StampBatch {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    fn push(&mut self, result: StampResult) {
        self.images.push(result.image);
        self.psf_images.push(result.psf_image);
        self.weight_images.push(result.weight_image);
        self.badpix_images.push(result.badpix_image);
        self.current_vars.push(result.current_var);
        self.elapsed.push(result.elapsed);
    }
}

impl FromIterator<StampResult> for StampBatch {
    fn from_iter<I: IntoIterator<Item = StampResult>>(iter: I) -> Self {
        let mut batch = StampBatch::default();
        iter.into_iter().for_each(|result| batch.push(result));
        batch
    }
}

/// Messages from workers to the coordinating thread.
#[derive(Debug)]
pub enum WorkerMessage {
    /// One stamp finished.
    Progress {
        obj_num: usize,
        xsize: usize,
        ysize: usize,
        elapsed: Duration,
    },
    /// A whole chunk finished; `start` is the batch index of its first stamp.
    Done {
        start: usize,
        results: Vec<StampResult>,
    },
    Failed {
        start: usize,
        error: StampError,
    },
}

struct StampTask {
    config: StampConfig,
    start: usize,
    nobj: usize,
}

/// Objects per task: at most `count / nproc` (integer division), at least
/// `min_nobj`, aiming for the geometric mean and always a multiple of
/// `min_nobj`.
pub fn chunk_size(count: usize, nproc: usize, min_nobj: usize) -> usize {
    let min_nobj = min_nobj.max(1);
    let max_nobj = count / nproc.max(1);
    if max_nobj < min_nobj {
        min_nobj
    } else {
        min_nobj * (max_nobj as f64 / min_nobj as f64).sqrt() as usize
    }
}

/// Number of worker threads to use for `count` objects.
pub fn resolve_nproc(nproc: i64, count: usize) -> usize {
    let count = count.max(1);
    if nproc > count as i64 {
        warn!(
            "Trying to use more processes than objects: nproc={nproc}, nobjects={count}. \
             Reducing nproc to {count}."
        );
        return count;
    }
    if nproc <= 0 {
        let ncpu = num_cpus::get();
        if ncpu == 0 {
            warn!("nproc <= 0, but unable to determine number of cpus, using 1");
            return 1;
        }
        let nproc = ncpu.min(count);
        info!("ncpu = {ncpu}. Using {nproc} processes");
        return nproc;
    }
    nproc as usize
}

fn log_stamp(result: &StampResult, obj_num: usize) {
    info!(
        "Stamp {}: size = {} x {}, time = {:.3} sec",
        obj_num,
        result.image.ncol(),
        result.image.nrow(),
        result.elapsed.as_secs_f64()
    );
}

/// Render `count` stamps starting at `options.obj_num`.
pub fn build_stamps(
    count: usize,
    config: &StampConfig,
    builder: Arc<dyn ProfileBuilder>,
    options: &BatchOptions,
) -> Result<StampBatch> {
    if count == 0 {
        return Ok(StampBatch::default());
    }
    let nproc = resolve_nproc(options.nproc, count);
    if nproc <= 1 {
        return (0..count)
            .map(|k| {
                let obj_num = options.obj_num + k;
                let result = render_stamp(config, builder.as_ref(), &options.request(obj_num))?;
                log_stamp(&result, obj_num);
                Ok(result)
            })
            .collect();
    }
    build_parallel(count, nproc, config, builder, options)
}

fn run_worker(
    worker_id: usize,
    task: StampTask,
    builder: &dyn ProfileBuilder,
    options: &BatchOptions,
    cancel: &AtomicBool,
    results: &Sender<WorkerMessage>,
) -> Option<WorkerMessage> {
    debug!(
        "worker {worker_id}: received job to do {} stamps, starting with {}",
        task.nobj, task.start
    );
    let mut stamps = Vec::with_capacity(task.nobj);
    for k in 0..task.nobj {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        let obj_num = options.obj_num + task.start + k;
        match render_stamp(&task.config, builder, &options.request(obj_num)) {
            Ok(stamp) => {
                // A closed channel means the coordinator has given up.
                let _ = results.send(WorkerMessage::Progress {
                    obj_num,
                    xsize: stamp.image.ncol(),
                    ysize: stamp.image.nrow(),
                    elapsed: stamp.elapsed,
                });
                stamps.push(stamp);
            }
            Err(error) => {
                return Some(WorkerMessage::Failed {
                    start: task.start,
                    error,
                })
            }
        }
    }
    debug!(
        "worker {worker_id}: finished job {} -- {}",
        task.start,
        task.start + task.nobj - 1
    );
    Some(WorkerMessage::Done {
        start: task.start,
        results: stamps,
    })
}

fn build_parallel(
    count: usize,
    nproc: usize,
    config: &StampConfig,
    builder: Arc<dyn ProfileBuilder>,
    options: &BatchOptions,
) -> Result<StampBatch> {
    let min_nobj = config.ring_period().unwrap_or(1);
    let nobj_per_task = chunk_size(count, nproc, min_nobj);
    let starts: Vec<usize> = (0..count).step_by(nobj_per_task).collect();
    let ntasks = starts.len();
    debug!("{count} stamps in {ntasks} tasks of up to {nobj_per_task} on {nproc} workers");

    let (task_sender, task_receiver) = bounded::<StampTask>(ntasks);
    let (result_sender, result_receiver) = unbounded::<WorkerMessage>();
    let cancel = Arc::new(AtomicBool::new(false));

    for &start in &starts {
        let task = StampTask {
            config: config.clone(),
            start,
            nobj: nobj_per_task.min(count - start),
        };
        if task_sender.send(task).is_err() {
            break;
        }
    }
    drop(task_sender);

    let mut workers = Vec::with_capacity(nproc);
    for worker_id in 0..nproc {
        let receiver = task_receiver.clone();
        let results = result_sender.clone();
        let builder = Arc::clone(&builder);
        let cancel = Arc::clone(&cancel);
        let options = *options;

        let handle = thread::spawn(move || {
            debug!("stamp worker {worker_id} started");
            while let Ok(task) = receiver.recv() {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                let Some(message) =
                    run_worker(worker_id, task, builder.as_ref(), &options, &cancel, &results)
                else {
                    break;
                };
                if results.send(message).is_err() {
                    break;
                }
            }
            debug!("stamp worker {worker_id} shutting down");
        });
        workers.push(handle);
    }
    drop(result_sender);

    let mut slots: Vec<Option<StampResult>> = (0..count).map(|_| None).collect();
    let mut remaining = ntasks;
    let mut failure = None;
    while remaining > 0 {
        let Ok(message) = result_receiver.recv() else {
            break;
        };
        match message {
            WorkerMessage::Progress {
                obj_num,
                xsize,
                ysize,
                elapsed,
            } => info!(
                "Stamp {obj_num}: size = {xsize} x {ysize}, time = {:.3} sec",
                elapsed.as_secs_f64()
            ),
            WorkerMessage::Done { start, results } => {
                let end = start + results.len();
                for (slot, result) in slots[start..end].iter_mut().zip(results) {
                    *slot = Some(result);
                }
                remaining -= 1;
                debug!("Successfully returned results for stamps {start}--{}", end - 1);
            }
            WorkerMessage::Failed { start, error } => {
                error!("Exception caught during job starting with stamp {start}: {error}");
                error!("Aborting the rest of this batch");
                cancel.store(true, Ordering::Relaxed);
                failure = Some(StampError::Worker {
                    start,
                    source: Box::new(error),
                });
                break;
            }
        }
    }
    drop(result_receiver);

    let mut panicked = None;
    for (worker_id, handle) in workers.into_iter().enumerate() {
        if handle.join().is_err() {
            warn!("Stamp worker {worker_id} panicked");
            panicked.get_or_insert(worker_id);
        }
    }

    if let Some(err) = failure {
        return Err(err);
    }
    if let Some(worker_id) = panicked {
        return Err(StampError::WorkerPanicked(worker_id));
    }
    slots
        .into_iter()
        .map(|slot| slot.ok_or(StampError::WorkerPanicked(0)))
        .collect()
}
