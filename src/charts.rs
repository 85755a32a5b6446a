//! Trend charts for servercheck.
//!
//! Three PNG charts are drawn from the in-memory history window and written
//! to fixed file names in the working directory, overwriting the previous
//! run's files:
//!
//! - [`TEMPERATURE_CHART`] - one line per CPU package plus a dashed line at
//!   the temperature limit
//! - [`DISK_CHART`] - one line per partition
//! - [`CPU_MEM_CHART`] - CPU and memory usage
//!
//! A value missing from a sample (a package or partition that was not
//! reported) breaks the line into segments instead of being drawn as zero.
//!
//! Samples carry naive local timestamps. They are placed on a UTC axis
//! unchanged, so the labels read as the host's wall-clock time.

use std::collections::BTreeSet;
use std::io::Cursor;
use std::path::PathBuf;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use image::{DynamicImage, ImageFormat, RgbImage};
use indexmap::IndexSet;
use plotters::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use crate::history::HistoryWindow;

pub const TEMPERATURE_CHART: &str = "temperature.png";
pub const DISK_CHART: &str = "disk_usage.png";
pub const CPU_MEM_CHART: &str = "cpu_mem_usage.png";

/// All chart files, in the order they appear in emails.
pub const CHART_FILES: [&str; 3] = [TEMPERATURE_CHART, DISK_CHART, CPU_MEM_CHART];

const CHART_WIDTH_PX: u32 = 1000;
const CHART_HEIGHT_PX: u32 = 600;

struct ChartStyle;

impl ChartStyle {
    const MARGIN: i32 = 16;
    const CAPTION_FONT_FAMILY: &'static str = "sans-serif";
    const CAPTION_FONT_SIZE: i32 = 26;
    const X_LABEL_AREA_SIZE: u32 = 48;
    const Y_LABEL_AREA_SIZE: u32 = 56;
    const X_LABEL_COUNT: usize = 8;
    const Y_LABEL_COUNT: usize = 10;
    const LINE_WIDTH: u32 = 2;
    const POINT_RADIUS: i32 = 3;
    const LEGEND_SAMPLE_PX: i32 = 20;
    const DASH_COUNT: i32 = 40;
    const BACKGROUND: RGBColor = WHITE;
    const LEGEND_BORDER: RGBColor = BLACK;
    const REFERENCE_LINE: RGBColor = RED;
    const X_DESC: &'static str = "Date and Time";
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no samples to plot")]
    NotEnoughPoints,
    #[error("render backend failure: {0}")]
    Backend(String),
    #[error("png encoding failure: {0}")]
    Encoding(String),
    #[error("failed to write chart {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// X-axis coordinate.
pub type PlotTime = DateTime<Utc>;

fn plot_time(at: NaiveDateTime) -> PlotTime {
    at.and_utc()
}

fn backend_error<E: std::fmt::Debug>(error: E) -> RenderError {
    RenderError::Backend(format!("{error:?}"))
}

/// One named line over the window, with gaps where a sample had no value.
#[derive(Clone, Debug, PartialEq)]
pub struct Series {
    pub name: String,
    pub points: Vec<(PlotTime, Option<f64>)>,
}

impl Series {
    /// Runs of consecutive present values.
    pub fn segments(&self) -> Vec<Vec<(PlotTime, f64)>> {
        let mut segments = Vec::new();
        let mut current = Vec::new();
        for &(at, value) in &self.points {
            match value {
                Some(value) => current.push((at, value)),
                None if !current.is_empty() => segments.push(std::mem::take(&mut current)),
                None => {}
            }
        }
        if !current.is_empty() {
            segments.push(current);
        }
        segments
    }

    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().filter_map(|(_, value)| *value)
    }
}

/// One series per package seen anywhere in the window, sorted by id.
pub fn temperature_series(window: &HistoryWindow) -> Vec<Series> {
    let packages: BTreeSet<&String> = window.samples().flat_map(|s| s.tempinfo.keys()).collect();
    packages
        .into_iter()
        .map(|package| Series {
            name: format!("Package {package}"),
            points: window
                .samples()
                .map(|s| (plot_time(s.datetime), s.tempinfo.get(package).map(|&t| t as f64)))
                .collect(),
        })
        .collect()
}

/// One series per partition seen anywhere in the window, in the order they
/// were first recorded.
pub fn disk_series(window: &HistoryWindow) -> Vec<Series> {
    let partitions: IndexSet<&String> = window.samples().flat_map(|s| s.diskinfo.keys()).collect();
    partitions
        .into_iter()
        .map(|partition| Series {
            name: partition.clone(),
            points: window
                .samples()
                .map(|s| {
                    let usage = s.diskinfo.get(partition).copied().flatten();
                    (plot_time(s.datetime), usage.map(|u| u as f64))
                })
                .collect(),
        })
        .collect()
}

/// CPU and memory usage series.
pub fn cpu_mem_series(window: &HistoryWindow) -> Vec<Series> {
    vec![
        Series {
            name: "CPU Usage (%)".to_string(),
            points: window.samples().map(|s| (plot_time(s.datetime), Some(s.cpuinfo))).collect(),
        },
        Series {
            name: "Memory Usage (%)".to_string(),
            points: window.samples().map(|s| (plot_time(s.datetime), Some(s.meminfo))).collect(),
        },
    ]
}

/// Temperature y-axis: data range (limit included) padded by 5, within 0..100.
pub fn temperature_y_range(series: &[Series], max_temp: i64) -> (f64, f64) {
    let min = series.iter().flat_map(Series::values).fold(100.0, f64::min);
    let max = series
        .iter()
        .flat_map(Series::values)
        .fold(max_temp as f64, f64::max);

    let lower = (min - 5.0).max(0.0);
    let upper = (max + 5.0).min(100.0);
    if lower < upper {
        (lower, upper)
    } else {
        (0.0, 100.0)
    }
}

/// Time span covered by the window, widened when it is a single instant.
fn time_range(window: &HistoryWindow) -> Result<(PlotTime, PlotTime), RenderError> {
    if window.is_empty() {
        return Err(RenderError::NotEnoughPoints);
    }
    let mut times = window.samples().map(|s| plot_time(s.datetime));
    let first = times.next().ok_or(RenderError::NotEnoughPoints)?;
    let (mut start, mut end) = times.fold((first, first), |(lo, hi), at| (lo.min(at), hi.max(at)));

    if start == end {
        start -= Duration::minutes(1);
        end += Duration::minutes(1);
    }
    Ok((start, end))
}

fn time_label(at: &PlotTime, span: Duration) -> String {
    if span > Duration::days(1) {
        at.format("%m-%d %H:%M").to_string()
    } else {
        at.format("%H:%M").to_string()
    }
}

struct ChartLayout<'a> {
    title: &'a str,
    y_desc: &'a str,
    series: &'a [Series],
    y_range: (f64, f64),
    reference: Option<f64>,
}

fn render_png(
    layout: &ChartLayout<'_>,
    x_range: (PlotTime, PlotTime),
) -> Result<Vec<u8>, RenderError> {
    let width = CHART_WIDTH_PX;
    let height = CHART_HEIGHT_PX;
    let mut rgb_buffer = vec![255u8; width as usize * height as usize * 3];

    {
        let drawing_area =
            BitMapBackend::with_buffer(&mut rgb_buffer, (width, height)).into_drawing_area();
        drawing_area
            .fill(&ChartStyle::BACKGROUND)
            .map_err(backend_error)?;

        let (x_start, x_end) = x_range;
        let span = x_end - x_start;
        let (y_min, y_max) = layout.y_range;

        let mut chart = ChartBuilder::on(&drawing_area)
            .margin(ChartStyle::MARGIN)
            .caption(
                layout.title,
                (ChartStyle::CAPTION_FONT_FAMILY, ChartStyle::CAPTION_FONT_SIZE),
            )
            .x_label_area_size(ChartStyle::X_LABEL_AREA_SIZE)
            .y_label_area_size(ChartStyle::Y_LABEL_AREA_SIZE)
            .build_cartesian_2d(x_start..x_end, y_min..y_max)
            .map_err(backend_error)?;

        chart
            .configure_mesh()
            .x_labels(ChartStyle::X_LABEL_COUNT)
            .y_labels(ChartStyle::Y_LABEL_COUNT)
            .x_label_formatter(&|at| time_label(at, span))
            .x_desc(ChartStyle::X_DESC)
            .y_desc(layout.y_desc)
            .draw()
            .map_err(backend_error)?;

        for (index, series) in layout.series.iter().enumerate() {
            let style = Palette99::pick(index)
                .mix(1.0)
                .stroke_width(ChartStyle::LINE_WIDTH);
            let mut labelled = false;

            for segment in series.segments() {
                // a lone point between gaps has no line to draw
                let annotation = if segment.len() == 1 {
                    chart.draw_series(segment.iter().map(|&point| {
                        Circle::new(point, ChartStyle::POINT_RADIUS, style.filled())
                    }))
                } else {
                    chart.draw_series(LineSeries::new(segment, style))
                }
                .map_err(backend_error)?;

                if !labelled {
                    annotation
                        .label(series.name.as_str())
                        .legend(move |(x, y)| {
                            PathElement::new(
                                vec![(x, y), (x + ChartStyle::LEGEND_SAMPLE_PX, y)],
                                style,
                            )
                        });
                    labelled = true;
                }
            }
        }

        if let Some(level) = layout.reference {
            let style = ChartStyle::REFERENCE_LINE.stroke_width(ChartStyle::LINE_WIDTH);
            let dash = span / (ChartStyle::DASH_COUNT * 2);
            chart
                .draw_series((0..ChartStyle::DASH_COUNT).map(|i| {
                    let from = x_start + dash * (i * 2);
                    let to = from + dash;
                    PathElement::new(vec![(from, level), (to, level)], style)
                }))
                .map_err(backend_error)?;
        }

        chart
            .configure_series_labels()
            .background_style(ChartStyle::BACKGROUND.mix(0.8))
            .border_style(ChartStyle::LEGEND_BORDER)
            .draw()
            .map_err(backend_error)?;

        drawing_area.present().map_err(backend_error)?;
    }

    let rgb_image = RgbImage::from_raw(width, height, rgb_buffer)
        .ok_or_else(|| RenderError::Encoding("image buffer conversion failed".to_string()))?;
    let mut output = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(rgb_image)
        .write_to(&mut output, ImageFormat::Png)
        .map_err(|error| RenderError::Encoding(error.to_string()))?;

    Ok(output.into_inner())
}

/// Draws the three charts into a directory.
#[derive(Clone, Debug)]
pub struct ChartRenderer {
    output_dir: PathBuf,
}

impl ChartRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn write(
        &self,
        file_name: &str,
        layout: &ChartLayout<'_>,
        window: &HistoryWindow,
    ) -> Result<PathBuf, RenderError> {
        let png = render_png(layout, time_range(window)?)?;
        let path = self.output_dir.join(file_name);
        std::fs::write(&path, png).map_err(|source| RenderError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "chart written");
        Ok(path)
    }

    pub fn render_temperature(
        &self,
        window: &HistoryWindow,
        max_temp: i64,
    ) -> Result<PathBuf, RenderError> {
        let series = temperature_series(window);
        let layout = ChartLayout {
            title: "Temperature Over Time",
            y_desc: "Temperature (°C)",
            y_range: temperature_y_range(&series, max_temp),
            series: &series,
            reference: Some(max_temp as f64),
        };
        self.write(TEMPERATURE_CHART, &layout, window)
    }

    pub fn render_disks(&self, window: &HistoryWindow) -> Result<PathBuf, RenderError> {
        let series = disk_series(window);
        let layout = ChartLayout {
            title: "Disk Usage Over Time",
            y_desc: "Disk Usage (%)",
            y_range: (0.0, 100.0),
            series: &series,
            reference: None,
        };
        self.write(DISK_CHART, &layout, window)
    }

    pub fn render_cpu_mem(&self, window: &HistoryWindow) -> Result<PathBuf, RenderError> {
        let series = cpu_mem_series(window);
        let layout = ChartLayout {
            title: "CPU and Memory Usage Over Time",
            y_desc: "Usage (%)",
            y_range: (0.0, 100.0),
            series: &series,
            reference: None,
        };
        self.write(CPU_MEM_CHART, &layout, window)
    }

    /// Render every chart. A chart that fails is logged and its stale file
    /// from an earlier run removed, so emails report it as missing.
    pub fn render_all(&self, window: &HistoryWindow, max_temp: i64) -> Vec<RenderError> {
        let results = [
            (TEMPERATURE_CHART, self.render_temperature(window, max_temp)),
            (DISK_CHART, self.render_disks(window)),
            (CPU_MEM_CHART, self.render_cpu_mem(window)),
        ];

        let mut failures = Vec::new();
        for (file_name, result) in results {
            if let Err(error) = result {
                warn!(chart = file_name, error = %error, "chart rendering failed");
                let stale = self.output_dir.join(file_name);
                if let Err(err) = std::fs::remove_file(&stale) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %stale.display(), error = %err, "could not remove stale chart");
                    }
                }
                failures.push(error);
            }
        }
        failures
    }
}
