use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{LevelFilter, debug, info};
use simplelog::{Config, WriteLogger};

use pdfcutter::panic_handler;
use pdfcutter::render::{
    BoxGeometry, BoxHandle, Entity, Lookup, MupdfRenderer, Offset, PageRenderer, PixelFormat,
    RenderService, SourceRect, WorkerState,
};
use pdfcutter::settings;

/// Give up when no render completes for this long
const STALL_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A render rejected by the keep-time guard only lands once the guarded
/// entry ages out, so the stall limit must outlast the keep time.
fn stall_timeout(keep_time: Option<Duration>) -> Duration {
    keep_time.map_or(STALL_TIMEOUT, |keep| {
        STALL_TIMEOUT.max(keep.saturating_add(STALL_TIMEOUT))
    })
}

/// Render PDF pages and page regions to PNG through the background render cache
#[derive(Parser, Debug)]
#[command(name = "pdfcutter")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<LevelFilter>,

    #[arg(long, default_value = "pdfcutter.log")]
    log_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render pages and boxes of a document to PNG files
    Render {
        pdf: PathBuf,

        /// Page to render, 0-based. Repeatable. All pages when neither
        /// --page nor --box is given.
        #[arg(long = "page")]
        pages: Vec<usize>,

        /// Region to render as PAGE:X,Y,W,H in PDF points. Repeatable.
        #[arg(long = "box", value_parser = parse_box)]
        boxes: Vec<BoxGeometry>,

        /// Output pixels per PDF point
        #[arg(long, default_value_t = 1.0)]
        scale: f64,

        #[arg(long, default_value = ".")]
        out: PathBuf,

        /// Print cache and worker counters as JSON when done
        #[arg(long)]
        stats: bool,
    },
}

fn parse_box(spec: &str) -> Result<BoxGeometry, String> {
    let (page, rect) = spec
        .split_once(':')
        .ok_or_else(|| format!("expected PAGE:X,Y,W,H, got {spec:?}"))?;
    let page = page
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("bad page in {spec:?}: {e}"))?;
    let values = rect
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("bad rectangle in {spec:?}: {e}"))?;
    let [x, y, width, height] = values[..] else {
        return Err(format!("expected four numbers in {spec:?}"));
    };
    let rect = SourceRect::new(x, y, width, height);
    if rect.is_empty() {
        return Err(format!("empty rectangle in {spec:?}"));
    }
    Ok(BoxGeometry::new(page, rect))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.config {
        Some(path) => settings::load_settings_from(path),
        None => settings::load_settings(),
    }
    let level = cli.log_level.unwrap_or_else(settings::get_log_level);

    WriteLogger::init(
        level,
        Config::default(),
        File::create(&cli.log_file)
            .with_context(|| format!("cannot create log file {}", cli.log_file.display()))?,
    )?;
    panic_handler::initialize_panic_handler();

    info!("Starting pdfcutter");

    let result = match cli.command {
        Commands::Render {
            pdf,
            pages,
            boxes,
            scale,
            out,
            stats,
        } => render(&pdf, pages, boxes, scale, &out, stats),
    };

    if let Err(e) = &result {
        log::error!("pdfcutter failed: {e:?}");
    }
    info!("Shutting down pdfcutter");
    result
}

fn render(
    pdf: &Path,
    pages: Vec<usize>,
    boxes: Vec<BoxGeometry>,
    scale: f64,
    out: &Path,
    print_stats: bool,
) -> Result<()> {
    if !(scale > 0.0) {
        bail!("scale must be positive, got {scale}");
    }
    fs::create_dir_all(out).with_context(|| format!("cannot create {}", out.display()))?;

    let mut jobs: Vec<(Entity, PathBuf)> = Vec::new();
    let pages = if pages.is_empty() && boxes.is_empty() {
        let page_count = MupdfRenderer::open(pdf)
            .with_context(|| format!("cannot open {}", pdf.display()))?
            .page_count();
        (0..page_count).collect()
    } else {
        pages
    };
    for page in pages {
        jobs.push((Entity::page(page), out.join(format!("page-{page:04}.png"))));
    }
    for (index, geometry) in boxes.into_iter().enumerate() {
        let page = geometry.page;
        let handle = BoxHandle::new(geometry);
        jobs.push((
            Entity::from(handle),
            out.join(format!("box-{index:03}-page-{page:04}.png")),
        ));
    }

    let config = settings::render_config();
    debug!("Render config: {config:?}");
    let stall_limit = stall_timeout(config.keep_time);
    let path = pdf.to_path_buf();
    let mut service = RenderService::new(config, move || MupdfRenderer::open(&path))
        .with_context(|| format!("cannot start renderer for {}", pdf.display()))?;

    let mut written = HashSet::new();
    let mut last_progress = Instant::now();
    while written.len() < jobs.len() {
        for (index, (entity, target)) in jobs.iter().enumerate() {
            if written.contains(&index) {
                continue;
            }
            let lookup = service.get_rendered_or_queue(entity, scale, Offset::default());
            if let Lookup::Exact(entry) = lookup {
                save_png(entry.bitmap(), target)?;
                entry.mark_uploaded();
                info!("Wrote {entity} to {}", target.display());
                written.insert(index);
                last_progress = Instant::now();
            }
        }
        if written.len() == jobs.len() {
            break;
        }

        if service.worker_state() == WorkerState::Stopped {
            bail!("render worker stopped, see the log for details");
        }
        let failed = service.stats().failed;
        if failed > 0 {
            bail!("{failed} renders failed, see the log for details");
        }
        if last_progress.elapsed() > stall_limit {
            bail!(
                "no render finished in {stall_limit:?}; {} of {} outputs written",
                written.len(),
                jobs.len()
            );
        }
        service.wait_events(POLL_INTERVAL);
    }

    if print_stats {
        println!("{}", serde_json::to_string_pretty(&service.stats())?);
    }
    service.shutdown();
    Ok(())
}

fn save_png(bitmap: &pdfcutter::render::Bitmap, path: &Path) -> Result<()> {
    let color = match bitmap.format() {
        PixelFormat::Rgb => image::ColorType::Rgb8,
        PixelFormat::Rgba => image::ColorType::Rgba8,
    };
    image::save_buffer(
        path,
        &bitmap.to_packed(),
        bitmap.width(),
        bitmap.height(),
        color,
    )
    .with_context(|| format!("cannot write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_argument_parses() {
        let geometry = parse_box("2:10,20.5,30,40").unwrap();
        assert_eq!(geometry.page, 2);
        assert_eq!(geometry.rect, SourceRect::new(10.0, 20.5, 30.0, 40.0));
    }

    #[test]
    fn malformed_box_arguments_are_rejected() {
        assert!(parse_box("10,20,30,40").is_err());
        assert!(parse_box("x:10,20,30,40").is_err());
        assert!(parse_box("0:10,20,30").is_err());
        assert!(parse_box("0:10,20,0,40").is_err());
    }

    #[test]
    fn stall_limit_outlasts_keep_time() {
        assert_eq!(stall_timeout(None), STALL_TIMEOUT);
        let keep = Duration::from_secs(120);
        assert!(stall_timeout(Some(keep)) > keep);
        assert!(stall_timeout(Some(Duration::from_millis(1))) >= STALL_TIMEOUT);
        assert!(stall_timeout(Some(Duration::MAX)) >= STALL_TIMEOUT);
    }
}
