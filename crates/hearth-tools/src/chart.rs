//! Chart rendering with plotters.
//!
//! The spec is deliberately small: labeled x axis, one or more numeric
//! series, line or bar form. Output is a PNG under the media root; the
//! caller turns the id into a (signed) URL.

use std::path::Path;

use plotters::prelude::*;
use serde::Deserialize;
use uuid::Uuid;

const WIDTH: u32 = 800;
const HEIGHT: u32 = 480;

const SERIES_COLORS: [RGBColor; 5] = [
    RGBColor(66, 133, 244),
    RGBColor(219, 68, 55),
    RGBColor(244, 180, 0),
    RGBColor(15, 157, 88),
    RGBColor(171, 71, 188),
];

#[derive(Debug, Clone, Deserialize)]
pub struct ChartSpec {
    #[serde(default = "default_kind")]
    pub kind: ChartKind,

    #[serde(default)]
    pub title: Option<String>,

    pub x_labels: Vec<String>,

    pub series: Vec<Series>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Line,
    Bar,
}

fn default_kind() -> ChartKind {
    ChartKind::Line
}

#[derive(Debug, Clone, Deserialize)]
pub struct Series {
    pub name: String,
    pub values: Vec<f64>,
}

/// Render the chart and return the media id (`<uuid>.png`).
pub fn render(spec: &ChartSpec, media_root: &Path) -> Result<String, String> {
    if spec.x_labels.is_empty() {
        return Err("x_labels must not be empty".to_string());
    }
    if spec.series.is_empty() {
        return Err("series must not be empty".to_string());
    }
    for series in &spec.series {
        if series.values.len() != spec.x_labels.len() {
            return Err(format!(
                "series '{}' has {} values for {} labels",
                series.name,
                series.values.len(),
                spec.x_labels.len()
            ));
        }
    }

    std::fs::create_dir_all(media_root).map_err(|e| format!("media root: {e}"))?;
    let media_id = format!("{}.png", Uuid::now_v7());
    let path = media_root.join(&media_id);

    let y_max = spec
        .series
        .iter()
        .flat_map(|s| s.values.iter())
        .fold(f64::MIN, |a, b| a.max(*b))
        .max(1.0)
        * 1.1;
    let y_min = spec
        .series
        .iter()
        .flat_map(|s| s.values.iter())
        .fold(f64::MAX, |a, b| a.min(*b))
        .min(0.0);

    let root = BitMapBackend::new(&path, (WIDTH, HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| e.to_string())?;

    let n = spec.x_labels.len();
    let labels = spec.x_labels.clone();
    let mut builder = ChartBuilder::on(&root);
    builder
        .margin(16)
        .x_label_area_size(40)
        .y_label_area_size(56);
    if let Some(title) = &spec.title {
        builder.caption(title, ("sans-serif", 24));
    }
    let mut chart = builder
        .build_cartesian_2d(0usize..n, y_min..y_max)
        .map_err(|e| e.to_string())?;

    chart
        .configure_mesh()
        .x_labels(n.min(12))
        .x_label_formatter(&|idx| labels.get(*idx).cloned().unwrap_or_default())
        .draw()
        .map_err(|e| e.to_string())?;

    for (index, series) in spec.series.iter().enumerate() {
        let color = SERIES_COLORS[index % SERIES_COLORS.len()];
        match spec.kind {
            ChartKind::Line => {
                chart
                    .draw_series(LineSeries::new(
                        series.values.iter().enumerate().map(|(x, y)| (x, *y)),
                        color.stroke_width(2),
                    ))
                    .map_err(|e| e.to_string())?
                    .label(series.name.clone())
                    .legend(move |(x, y)| {
                        PathElement::new(vec![(x, y), (x + 16, y)], color.stroke_width(2))
                    });
            }
            ChartKind::Bar => {
                chart
                    .draw_series(series.values.iter().enumerate().map(|(x, y)| {
                        Rectangle::new([(x, 0.0), (x + 1, *y)], color.mix(0.7).filled())
                    }))
                    .map_err(|e| e.to_string())?
                    .label(series.name.clone())
                    .legend(move |(x, y)| {
                        Rectangle::new([(x, y - 6), (x + 12, y + 6)], color.filled())
                    });
            }
        }
    }

    if spec.series.len() > 1 {
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(|e| e.to_string())?;
    }

    root.present().map_err(|e| e.to_string())?;
    Ok(media_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_spec() -> ChartSpec {
        serde_json::from_value(json!({
            "kind": "line",
            "title": "本月支出",
            "x_labels": ["W1", "W2", "W3", "W4"],
            "series": [
                {"name": "买菜", "values": [120.0, 95.5, 130.0, 88.0]},
                {"name": "交通", "values": [40.0, 42.0, 38.5, 45.0]}
            ]
        }))
        .unwrap()
    }

    /// Text rendering needs a system font; headless CI images without one
    /// make plotters fail at the caption, which is not what these tests
    /// are about.
    fn render_or_skip(spec: &ChartSpec, dir: &Path) -> Option<String> {
        match render(spec, dir) {
            Ok(media_id) => Some(media_id),
            Err(e) if e.to_lowercase().contains("font") => None,
            Err(e) => panic!("render failed: {e}"),
        }
    }

    #[test]
    fn test_render_line_chart_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let Some(media_id) = render_or_skip(&sample_spec(), dir.path()) else {
            return;
        };
        assert!(media_id.ends_with(".png"));

        let bytes = std::fs::read(dir.path().join(&media_id)).unwrap();
        assert!(bytes.len() > 1000, "png should have real content");
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[test]
    fn test_render_bar_chart() {
        let dir = tempfile::tempdir().unwrap();
        let spec: ChartSpec = serde_json::from_value(json!({
            "kind": "bar",
            "x_labels": ["食品", "交通"],
            "series": [{"name": "十月", "values": [880.0, 240.0]}]
        }))
        .unwrap();
        let Some(media_id) = render_or_skip(&spec, dir.path()) else {
            return;
        };
        assert!(dir.path().join(media_id).exists());
    }

    #[test]
    fn test_mismatched_series_length_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spec: ChartSpec = serde_json::from_value(json!({
            "x_labels": ["a", "b"],
            "series": [{"name": "s", "values": [1.0]}]
        }))
        .unwrap();
        assert!(render(&spec, dir.path()).is_err());
    }

    #[test]
    fn test_empty_spec_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spec: ChartSpec = serde_json::from_value(json!({
            "x_labels": [],
            "series": []
        }))
        .unwrap();
        assert!(render(&spec, dir.path()).is_err());
    }

    #[test]
    fn test_kind_defaults_to_line() {
        let spec: ChartSpec = serde_json::from_value(json!({
            "x_labels": ["a"],
            "series": [{"name": "s", "values": [1.0]}]
        }))
        .unwrap();
        assert_eq!(spec.kind, ChartKind::Line);
    }
}
