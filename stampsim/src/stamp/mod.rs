//! Stamp rendering: one object at a time, or a whole batch.

pub mod batch;
pub mod context;
pub mod draw;
pub mod psf;
pub mod single;

pub use batch::{build_stamps, chunk_size, resolve_nproc, BatchOptions, StampBatch, WorkerMessage};
pub use context::StampContext;
pub use draw::{draw_stamp_fft, draw_stamp_phot, DrawRequest};
pub use psf::draw_psf_stamp;
pub use single::{render_stamp, StampRequest, StampResult};
