use std::fs;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::panic;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle};
use race_segment::{
    analyze_recording, explain, load_samples, Comparison, ComparisonView, ExtractParams,
    RaceSegment, SampleSequence, SkipReason,
};
use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Race segment extraction and comparison CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract the race segment of each FIT/GPX file and write comparison CSV/plots
    Compare(CompareArgs),
    /// Report thresholds, runs and the extraction outcome for each file
    Diagnose(DiagnoseArgs),
}

#[derive(Parser, Debug)]
struct CompareArgs {
    /// FIT/GPX files to ingest
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "race_segments.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Output PNG figure path (defaults next to CSV)
    #[arg(long, value_hint = ValueHint::FilePath)]
    png: Option<PathBuf>,

    /// Optional SVG figure path
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Write the extracted segments as JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    json: Option<PathBuf>,

    /// Skip all plotting
    #[arg(long, action = ArgAction::SetTrue)]
    no_plot: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct DiagnoseArgs {
    /// FIT/GPX files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "race_diagnostics.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Compare(args) => args.verbose,
        Command::Diagnose(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Compare(args) => handle_compare(args),
        Command::Diagnose(args) => handle_diagnose(args),
    }
}

fn handle_compare(args: CompareArgs) -> Result<()> {
    if args.inputs.is_empty() {
        return Err(anyhow!("no input files supplied"));
    }
    let timed = args.profile || args.verbose;

    // Each recording is decoded and extracted on its own; order follows the inputs.
    let t_analyze = Instant::now();
    let outcomes: Vec<(String, Result<RaceSegment, SkipReason>)> = args
        .inputs
        .par_iter()
        .map(|path| (display_name(path), analyze_file(path)))
        .collect();
    let comparison = Comparison::from_outcomes(outcomes);
    if timed {
        info!(
            "Analyze stage: {:.1} ms ({} files)",
            t_analyze.elapsed().as_secs_f64() * 1000.0,
            args.inputs.len()
        );
    }

    for skipped in &comparison.skipped {
        warn!("Skipping {}: {}", skipped.name, skipped.reason);
    }
    for entry in &comparison.entries {
        let segment = &entry.segment;
        info!(
            "{}: {:.0} m bucket, {:.1} m in {:.1} s (samples {}..={}, effort {:.0} m)",
            entry.name,
            segment.bucket.cutoff,
            segment.distance(),
            segment.duration_seconds(),
            segment.source_start,
            segment.source_start + segment.len().saturating_sub(1),
            segment.total_distance
        );
    }
    if comparison.is_empty() {
        warn!(
            "No race segments found in {} recording(s)",
            comparison.skipped.len()
        );
    }

    if args.output.as_os_str() == "-" {
        write_segments_stdout(&comparison)?;
    } else {
        let t_csv = Instant::now();
        write_segments_csv(&comparison, &args.output)?;
        if timed {
            info!(
                "CSV stage: {:.1} ms",
                t_csv.elapsed().as_secs_f64() * 1000.0
            );
        }
        info!("Wrote segment CSV: {}", args.output.display());
    }

    if let Some(path) = args.json.as_ref() {
        write_segments_json(&comparison, path)?;
        info!("Wrote segment JSON: {}", path.display());
    }

    if args.no_plot || comparison.is_empty() {
        return Ok(());
    }

    let png_path = args.png.clone().or_else(|| {
        if args.output.as_os_str() == "-" {
            None
        } else {
            let mut path = args.output.clone();
            path.set_extension("png");
            Some(path)
        }
    });
    let t_plot = Instant::now();
    if let Some(path) = png_path.as_ref() {
        match render_chart_guard(&comparison, path, ChartKind::Png) {
            Ok(()) => info!("Wrote plot: {}", path.display()),
            Err(err) => warn!("Skipping PNG render ({}): {}", path.display(), err),
        }
    }
    if let Some(path) = args.svg.as_ref() {
        match render_chart_guard(&comparison, path, ChartKind::Svg) {
            Ok(()) => info!("Wrote plot: {}", path.display()),
            Err(err) => warn!("Skipping SVG render ({}): {}", path.display(), err),
        }
    }
    if timed {
        info!(
            "Plot stage: {:.1} ms",
            t_plot.elapsed().as_secs_f64() * 1000.0
        );
    }

    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Format hint for the loader: the file extension, FIT when there is none.
fn format_hint(path: &Path) -> &str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("fit")
}

fn analyze_file(path: &Path) -> Result<RaceSegment, SkipReason> {
    let data = fs::read(path)?;
    analyze_recording(&data, format_hint(path))
}

fn load_recording(path: &Path) -> Result<SampleSequence, SkipReason> {
    let data = fs::read(path)?;
    Ok(load_samples(&data, format_hint(path))?)
}

fn write_segments_stdout(comparison: &Comparison) -> Result<()> {
    let stdout = io::stdout();
    let handle = stdout.lock();
    let mut writer = csv::Writer::from_writer(handle);
    write_segment_rows(comparison, &mut writer)
}

fn write_segments_csv(comparison: &Comparison, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_segment_rows(comparison, &mut writer)
}

fn write_segment_rows<W: Write>(comparison: &Comparison, writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "recording",
        "bucket_m",
        "index",
        "elapsed_s",
        "time_relative_s",
        "distance_relative_m",
        "speed_kmh",
        "pace_min_per_km",
        "heart_rate",
    ])?;

    for entry in &comparison.entries {
        let segment = &entry.segment;
        for (offset, race) in segment.samples.iter().enumerate() {
            writer.write_record([
                entry.name.clone(),
                format!("{:.0}", segment.bucket.cutoff),
                (segment.source_start + offset).to_string(),
                format!("{:.3}", race.sample.elapsed_seconds),
                format!("{:.3}", race.time_relative),
                format!("{:.3}", race.distance_relative),
                race.sample
                    .speed
                    .map(|v| format!("{:.3}", v))
                    .unwrap_or_default(),
                format!("{:.3}", race.sample.pace),
                race.sample
                    .heart_rate
                    .map(|v| format!("{:.0}", v))
                    .unwrap_or_default(),
            ])?;
        }
    }

    writer.flush()?;
    Ok(())
}

fn write_segments_json(comparison: &Comparison, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &comparison.entries)
        .with_context(|| format!("failed to serialize segments to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

enum ChartKind {
    Png,
    Svg,
}

const CHART_SIZE: (u32, u32) = (1200, 1800);

fn render_chart_guard(comparison: &Comparison, path: &Path, kind: ChartKind) -> Result<(), String> {
    let render = || -> Result<(), String> {
        let drawn = match kind {
            ChartKind::Png => {
                draw_views(BitMapBackend::new(path, CHART_SIZE).into_drawing_area(), comparison)
            }
            ChartKind::Svg => {
                draw_views(SVGBackend::new(path, CHART_SIZE).into_drawing_area(), comparison)
            }
        };
        drawn.map_err(|e| format!("plotting error: {}", e))
    };

    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
}

/// Upper axis bounds over the finite points of every series.
fn axis_bounds(series: &[(&str, Vec<f64>, Vec<f64>)]) -> (f64, f64) {
    let mut x_max: f64 = 0.0;
    let mut y_max: f64 = 0.0;
    for (_, xs, ys) in series {
        for (&x, &y) in xs.iter().zip(ys.iter()) {
            if x.is_finite() && y.is_finite() {
                x_max = x_max.max(x);
                y_max = y_max.max(y);
            }
        }
    }
    (x_max.max(1.0), (y_max * 1.05).max(1.0))
}

/// Three stacked panels, one per comparison view, one line per recording.
fn draw_views<DB>(root: DrawingArea<DB, plotters::coord::Shift>, comparison: &Comparison) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;
    let title_font = FontDesc::new(FontFamily::SansSerif, 24.0, FontStyle::Normal);
    let axis_font = FontDesc::new(FontFamily::SansSerif, 16.0, FontStyle::Normal);
    let legend_font = FontDesc::new(FontFamily::SansSerif, 16.0, FontStyle::Normal);

    let panels = root.split_evenly((3, 1));
    for (area, view) in panels.iter().zip(ComparisonView::ALL) {
        let series = comparison.series(view);
        let (x_max, y_max) = axis_bounds(&series);

        let mut chart = ChartBuilder::on(area)
            .caption(view.title(), title_font.clone())
            .margin(20)
            .set_label_area_size(LabelAreaPosition::Left, 60)
            .set_label_area_size(LabelAreaPosition::Bottom, 45)
            .build_cartesian_2d(0.0..x_max, 0.0..y_max)?;

        chart
            .configure_mesh()
            .light_line_style(&TRANSPARENT)
            .x_desc(view.x_label())
            .y_desc(view.y_label())
            .x_label_formatter(&|v| format!("{:.0}", v))
            .y_label_formatter(&|v| format!("{:.0}", v))
            .label_style(axis_font.clone().color(&BLACK.mix(0.85)))
            .draw()?;

        for (idx, (name, xs, ys)) in series.iter().enumerate() {
            let color = Palette99::pick(idx).to_rgba();
            let points = xs
                .iter()
                .copied()
                .zip(ys.iter().copied())
                .filter(|(x, y)| x.is_finite() && y.is_finite());
            chart
                .draw_series(LineSeries::new(points, color.stroke_width(2)))?
                .label(*name)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], color));
        }

        chart
            .configure_series_labels()
            .background_style(&WHITE.mix(0.7))
            .border_style(&BLACK.mix(0.3))
            .label_font(legend_font.clone().color(&BLACK))
            .position(SeriesLabelPosition::UpperRight)
            .draw()?;
    }

    root.present()?;
    Ok(())
}

fn handle_diagnose(args: DiagnoseArgs) -> Result<()> {
    let params = ExtractParams::default();
    let mut report = String::new();

    for path in &args.inputs {
        report.push_str(&format!("FILE: {}\n", path.display()));
        let samples = match load_recording(path) {
            Ok(samples) => samples,
            Err(err) => {
                warn!("Skipping {}: {}", path.display(), err);
                report.push_str(&format!("  error: {}\n\n", err));
                continue;
            }
        };

        let speed_count = samples.iter().filter(|s| s.speed.is_some()).count();
        let distance = samples.iter().rev().find_map(|s| s.distance);
        report.push_str(&format!("  records: {}\n", samples.len()));
        if let Some(first) = samples.as_slice().first() {
            report.push_str(&format!("  start: {}\n", first.timestamp.to_rfc3339()));
        }
        report.push_str(&format!("  timespan_s: {:.1}\n", samples.timespan_seconds()));
        report.push_str(&format!(
            "  speed_samples: {} (missing {})\n",
            speed_count,
            samples.len() - speed_count
        ));
        report.push_str(&format!(
            "  distance_m: {}\n",
            distance.map_or("n/a".into(), |v| format!("{:.1}", v))
        ));

        let extraction = explain(samples.as_slice(), &params);
        if let Some(thresholds) = extraction.thresholds {
            report.push_str(&format!(
                "  thresholds_kmh: high={:.3} low={:.3}\n",
                thresholds.high, thresholds.low
            ));
        }
        if !extraction.runs.is_empty() {
            let above = extraction.runs.iter().filter(|r| r.above).count();
            report.push_str(&format!(
                "  runs: {} ({} above threshold)\n",
                extraction.runs.len(),
                above
            ));
        }
        if let Some(run) = extraction.selected {
            report.push_str(&format!(
                "  longest_high_run: {}..={} ({} samples)\n",
                run.start,
                run.end,
                run.len()
            ));
        }
        if let Some((start, end)) = extraction.bounds {
            report.push_str(&format!("  expanded: {}..={}\n", start, end));
        }
        match &extraction.outcome {
            Ok(segment) => report.push_str(&format!(
                "  outcome: {:.0} m bucket, kept {} samples ({:.1} m of {:.1} m, {:.1} s)\n",
                segment.bucket.cutoff,
                segment.len(),
                segment.distance(),
                segment.total_distance,
                segment.duration_seconds()
            )),
            Err(reason) => report.push_str(&format!("  outcome: no race ({})\n", reason)),
        }
        report.push('\n');
    }

    if args.output.as_os_str() == "-" {
        io::stdout().write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Diagnostic report written: {}", args.output.display());
    }
    Ok(())
}
