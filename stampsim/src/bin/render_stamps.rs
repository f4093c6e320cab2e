//! Render a batch of postage stamps from a JSON configuration.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin render_stamps -- --config stamps.json --nobjects 100 --nproc 0
//! cargo run --release --bin render_stamps -- --config stamps.json --psf --weight -o out/
//! ```
//!
//! Each stamp is written as an 8-bit PNG preview, `stamp_<obj_num>.png`, next
//! to optional `psf_`, `weight_` and `badpix_` companions. A `summary.json`
//! records the size, pre-noise variance and render time of every stamp.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use serde::Serialize;
use stampsim::image_proc::array2_to_gray_image;
use stampsim::{build_stamps, BatchOptions, ConfigProfileBuilder, Image, StampConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON stamp configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Number of stamps to render
    #[arg(short, long, default_value = "1")]
    nobjects: usize,

    /// Worker threads (0 or less uses one per CPU)
    #[arg(long, default_value = "1", allow_negative_numbers = true)]
    nproc: i64,

    /// Object number of the first stamp
    #[arg(long, default_value = "0")]
    obj_num: usize,

    /// Background sky added to every stamp, per pixel
    #[arg(long, default_value = "0.0")]
    sky_level_pixel: f64,

    /// Skip the configured noise model
    #[arg(long)]
    no_noise: bool,

    /// Also render the PSF image of each stamp
    #[arg(long)]
    psf: bool,

    /// Also render the weight image of each stamp
    #[arg(long)]
    weight: bool,

    /// Also render the bad-pixel image of each stamp
    #[arg(long)]
    badpix: bool,

    /// Directory for PNG previews and the summary
    #[arg(short, long, default_value = "stamps")]
    output_dir: PathBuf,
}

#[derive(Serialize)]
struct StampSummary {
    obj_num: usize,
    xsize: usize,
    ysize: usize,
    bounds: Option<[i64; 4]>,
    current_var: f64,
    seconds: f64,
}

fn save_png(image: &Image, dir: &Path, name: &str) -> Result<(), Box<dyn Error>> {
    if image.is_empty() {
        return Ok(());
    }
    image.to_gray_image().save(dir.join(name))?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Cli::parse();

    let config = StampConfig::from_path(&args.config)?;
    let options = BatchOptions {
        nproc: args.nproc,
        obj_num: args.obj_num,
        sky_level_pixel: args.sky_level_pixel,
        do_noise: !args.no_noise,
        make_psf_image: args.psf,
        make_weight_image: args.weight,
        make_badpix_image: args.badpix,
        ..BatchOptions::default()
    };

    info!(
        "Rendering {} stamps from {}",
        args.nobjects,
        args.config.display()
    );
    let batch = build_stamps(args.nobjects, &config, Arc::new(ConfigProfileBuilder), &options)?;

    std::fs::create_dir_all(&args.output_dir)?;
    let progress = ProgressBar::new(batch.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("█▉▊▋▌▍▎▏ "),
    );
    progress.set_message("Writing stamps");

    let mut summary = Vec::with_capacity(batch.len());
    for (k, image) in batch.images.iter().enumerate() {
        let obj_num = args.obj_num + k;
        let dir = args.output_dir.as_path();
        save_png(image, dir, &format!("stamp_{obj_num:05}.png"))?;
        if let Some(psf) = &batch.psf_images[k] {
            save_png(psf, dir, &format!("psf_{obj_num:05}.png"))?;
        }
        if let Some(weight) = &batch.weight_images[k] {
            save_png(weight, dir, &format!("weight_{obj_num:05}.png"))?;
        }
        if let Some(badpix) = &batch.badpix_images[k] {
            if !badpix.is_empty() {
                let mask = badpix.array().mapv(|v| if v != 0 { 255u8 } else { 0 });
                array2_to_gray_image(&mask).save(dir.join(format!("badpix_{obj_num:05}.png")))?;
            }
        }

        summary.push(StampSummary {
            obj_num,
            xsize: image.ncol(),
            ysize: image.nrow(),
            bounds: image.bounds().map(|b| [b.xmin, b.xmax, b.ymin, b.ymax]),
            current_var: batch.current_vars[k],
            seconds: batch.elapsed[k].as_secs_f64(),
        });
        progress.inc(1);
    }
    progress.finish_with_message("Stamps written");

    let summary_path = args.output_dir.join("summary.json");
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;
    info!("Wrote {} stamps to {}", summary.len(), args.output_dir.display());
    Ok(())
}
