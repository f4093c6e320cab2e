//! Postage-stamp rendering engine for synthetic galaxy images.
//!
//! A stamp is one small image of a single object: a galaxy profile convolved
//! with a PSF and a pixel response, drawn either in Fourier space or by photon
//! shooting, with a configurable noise model applied afterwards. The engine is
//! driven by a JSON configuration tree ([`config::StampConfig`]) and a
//! [`profile::ProfileBuilder`] that turns configuration scopes into profiles.
//!
//! [`stamp::render_stamp`] renders one object. [`stamp::build_stamps`] renders a
//! set of objects, optionally across a pool of worker threads, and returns the
//! results in object order.

pub mod algo;
pub mod config;
pub mod error;
pub mod image_proc;
pub mod noise;
pub mod profile;
pub mod stamp;

pub use config::StampConfig;
pub use error::{Result, StampError};
pub use image_proc::{BadPixImage, Bounds, Image, Position};
pub use profile::{BuildOutcome, ConfigProfileBuilder, Profile, ProfileBuilder, ProfileKey};
pub use stamp::{build_stamps, render_stamp, BatchOptions, StampBatch, StampRequest, StampResult};
