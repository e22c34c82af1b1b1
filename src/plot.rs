use crate::config::PlotConfig;
use crate::divdiv::{DivDivData, SpectrumData};
use crate::patient::MutClass;
use crate::rates::RateMap;
use crate::stats::column_geometric_mean;
use crate::tree::TreeLayout;
use anyhow::{Context, Result, bail};
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use std::path::Path;

/// Parse a `#rrggbb` color string.
///
/// # Errors
/// Returns an error if the string is not six hex digits behind a `#`.
pub fn parse_color(color: &str) -> Result<RGBColor> {
    let Some(digits) = color.strip_prefix('#') else {
        bail!("color {color:?} must start with '#'");
    };
    if digits.len() != 6 {
        bail!("color {color:?} must have six hex digits");
    }
    let channel = |idx: usize| {
        u8::from_str_radix(&digits[2 * idx..2 * idx + 2], 16)
            .with_context(|| format!("color {color:?} has invalid hex digits"))
    };
    Ok(RGBColor(channel(0)?, channel(1)?, channel(2)?))
}

/// Split a per-position profile into runs of finite positive values, as
/// (position, value) points. Gaps come from masked or unmapped sites.
fn finite_runs(values: &[f64]) -> Vec<Vec<(f64, f64)>> {
    let mut runs = Vec::new();
    let mut run = Vec::new();
    for (pos, &value) in values.iter().enumerate() {
        if value.is_finite() && value > 0.0 {
            run.push((pos as f64, value));
        } else if !run.is_empty() {
            runs.push(std::mem::take(&mut run));
        }
    }
    if !run.is_empty() {
        runs.push(run);
    }
    runs
}

/// Render per-patient substitution-rate profiles on reference coordinates,
/// overlaid with their geometric mean, on a log scale.
pub fn plot_rates(map: &RateMap, cfg: &PlotConfig, file: &Path) -> Result<()> {
    let root = SVGBackend::new(file, (cfg.width, cfg.height)).into_drawing_area();
    root.fill(&WHITE).context("failed to fill figure")?;

    let n_positions = map.reference.ncols();
    let font = ("sans-serif", cfg.font_size);

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .x_label_area_size(45)
        .y_label_area_size(60)
        .build_cartesian_2d(0.0..n_positions as f64, (2e-4..6e-2).log_scale())
        .context("failed to build rate chart")?;
    chart
        .configure_mesh()
        .x_desc("position [bp]")
        .y_desc("substitution rate [1/year]")
        .label_style(font)
        .draw()
        .context("failed to draw rate axes")?;

    for (i_patient, code) in map.patients.iter().enumerate() {
        let color = parse_color(&cfg.patient_colors[i_patient % cfg.patient_colors.len()])?;
        let row: Vec<f64> = map.reference.row(i_patient).to_vec();
        for (i_run, run) in finite_runs(&row).into_iter().enumerate() {
            let series = chart
                .draw_series(LineSeries::new(run, color.mix(0.5)))
                .with_context(|| format!("failed to draw rates of patient {code}"))?;
            if i_run == 0 {
                series
                    .label(code.clone())
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], color));
            }
        }
    }

    let average = column_geometric_mean(map.reference.view());
    for (i_run, run) in finite_runs(&average).into_iter().enumerate() {
        let series = chart
            .draw_series(LineSeries::new(run, BLACK.stroke_width(3)))
            .context("failed to draw average rates")?;
        if i_run == 0 {
            series
                .label("average")
                .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], BLACK.stroke_width(3)));
        }
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperLeft)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .label_font(font)
        .draw()
        .context("failed to draw rate legend")?;

    root.present().context("failed to write rate figure")?;
    Ok(())
}

/// Render divergence (solid) and diversity (thin) trajectories per region
/// class, nonsynonymous in the left panel and synonymous in the right,
/// with bootstrap error bars.
pub fn plot_divdiv(data: &DivDivData, cfg: &PlotConfig, file: &Path) -> Result<()> {
    let root = SVGBackend::new(file, (cfg.width, cfg.height)).into_drawing_area();
    root.fill(&WHITE).context("failed to fill figure")?;
    let panels = root.split_evenly((1, 2));

    let x_max = data
        .trajectories
        .iter()
        .flat_map(|trajectory| trajectory.divergence.bins.iter().copied())
        .fold(0.0, f64::max);
    let y_max = data
        .trajectories
        .iter()
        .flat_map(|trajectory| {
            trajectory
                .divergence
                .avg
                .iter()
                .chain(trajectory.divergence.upper.iter())
                .chain(trajectory.diversity.avg.iter())
                .chain(trajectory.diversity.upper.iter())
        })
        .copied()
        .filter(|value| value.is_finite())
        .fold(1e-3, f64::max);
    let font = ("sans-serif", cfg.font_size);

    for (panel, class) in panels.iter().zip([MutClass::Nonsyn, MutClass::Syn]) {
        let mut chart = ChartBuilder::on(panel)
            .margin(10)
            .caption(class.label(), font)
            .x_label_area_size(45)
            .y_label_area_size(55)
            .build_cartesian_2d(0.0..x_max * 1.05, 0.0..y_max * 1.1)
            .with_context(|| format!("failed to build {} panel", class.label()))?;
        chart
            .configure_mesh()
            .x_desc("EDI [days]")
            .y_desc("divergence/diversity")
            .label_style(font)
            .draw()
            .with_context(|| format!("failed to draw {} axes", class.label()))?;

        let mut i_region = 0usize;
        for trajectory in data.trajectories.iter().filter(|t| t.class == class) {
            let color = Palette99::pick(i_region).to_rgba();
            i_region += 1;

            let divergence = &trajectory.divergence;
            chart
                .draw_series(LineSeries::new(
                    divergence
                        .bins
                        .iter()
                        .zip(divergence.avg.iter())
                        .map(|(&bin, &avg)| (bin, avg)),
                    color.stroke_width(3),
                ))
                .with_context(|| format!("failed to draw {} divergence", trajectory.region))?
                .label(trajectory.region.clone())
                .legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 16, y)], color.stroke_width(3))
                });
            chart
                .draw_series(divergence.bins.iter().enumerate().filter_map(|(bin, &x)| {
                    let lower = divergence.lower[bin];
                    let upper = divergence.upper[bin];
                    if !(lower.is_finite() && upper.is_finite()) {
                        return None;
                    }
                    Some(ErrorBar::new_vertical(
                        x,
                        lower,
                        divergence.avg[bin],
                        upper,
                        color.filled(),
                        6,
                    ))
                }))
                .with_context(|| format!("failed to draw {} error bars", trajectory.region))?;

            let diversity = &trajectory.diversity;
            chart
                .draw_series(LineSeries::new(
                    diversity
                        .bins
                        .iter()
                        .zip(diversity.avg.iter())
                        .map(|(&bin, &avg)| (bin, avg)),
                    color.mix(0.6),
                ))
                .with_context(|| format!("failed to draw {} diversity", trajectory.region))?;
        }

        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperLeft)
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .label_font(font)
            .draw()
            .with_context(|| format!("failed to draw {} legend", class.label()))?;
    }

    root.present().context("failed to write divdiv figure")?;
    Ok(())
}

/// Render the normalized site-frequency spectra as grouped bars on a log
/// scale, synonymous next to nonsynonymous.
pub fn plot_sfs(sfs: &SpectrumData, cfg: &PlotConfig, file: &Path) -> Result<()> {
    let root = SVGBackend::new(file, (cfg.width, cfg.height)).into_drawing_area();
    root.fill(&WHITE).context("failed to fill figure")?;
    let font = ("sans-serif", cfg.font_size);

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .x_label_area_size(45)
        .y_label_area_size(60)
        .build_cartesian_2d(0.0..1.0, (5e-3..1.1).log_scale())
        .context("failed to build SFS chart")?;
    chart
        .configure_mesh()
        .x_desc("frequency")
        .y_desc("fraction of SNVs")
        .label_style(font)
        .draw()
        .context("failed to draw SFS axes")?;

    let bar_width = 0.4
        * sfs
            .edges
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .fold(f64::INFINITY, f64::min);
    let classes = [
        ("synonymous", &sfs.syn, Palette99::pick(0).to_rgba(), -1.0),
        ("nonsynonymous", &sfs.nonsyn, Palette99::pick(1).to_rgba(), 0.0),
    ];

    for (label, counts, color, offset) in classes {
        let total: f64 = counts.iter().sum();
        if total <= 0.0 {
            log::warn!("no {label} variants to plot");
            continue;
        }
        chart
            .draw_series(counts.iter().enumerate().filter_map(|(bin, &count)| {
                let fraction = count / total;
                if fraction <= 0.0 {
                    return None;
                }
                let center = 0.5 * (sfs.edges[bin] + sfs.edges[bin + 1]);
                let x0 = center + offset * bar_width;
                Some(Rectangle::new(
                    [(x0, 5e-3), (x0 + bar_width, fraction)],
                    color.filled(),
                ))
            }))
            .with_context(|| format!("failed to draw {label} spectrum"))?
            .label(label)
            .legend(move |(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], color.filled()));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .label_font(font)
        .draw()
        .context("failed to draw SFS legend")?;

    root.present().context("failed to write SFS figure")?;
    Ok(())
}

/// Render a phylogram layout, root at the top left, tips labeled.
pub fn plot_tree(layout: &TreeLayout, cfg: &PlotConfig, file: &Path) -> Result<()> {
    let root = SVGBackend::new(file, (cfg.width, cfg.height)).into_drawing_area();
    root.fill(&WHITE).context("failed to fill figure")?;
    let font = ("sans-serif", cfg.font_size);

    // Flip y so the first tip row lands on top.
    let x_max = layout.x_max.max(1e-6);
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .x_label_area_size(45)
        .y_label_area_size(40)
        .build_cartesian_2d(
            -0.05 * x_max..1.25 * x_max,
            -(layout.y_max + 0.8)..-0.2,
        )
        .context("failed to build tree chart")?;
    chart
        .configure_mesh()
        .x_desc("branch length")
        .y_desc("taxa")
        .y_labels(0)
        .disable_y_mesh()
        .label_style(font)
        .draw()
        .context("failed to draw tree axes")?;

    chart
        .draw_series(
            layout
                .branches
                .iter()
                .chain(layout.connectors.iter())
                .map(|segment| {
                    PathElement::new(
                        vec![(segment.x0, -segment.y0), (segment.x1, -segment.y1)],
                        BLACK,
                    )
                }),
        )
        .context("failed to draw tree branches")?;

    let label_style = font.into_text_style(&root).pos(Pos::new(HPos::Left, VPos::Center));
    chart
        .draw_series(layout.tip_labels.iter().map(|label| {
            Text::new(format!(" {}", label.text), (label.x, -label.y), label_style.clone())
        }))
        .context("failed to draw tip labels")?;

    let confidence_style = ("sans-serif", cfg.font_size.saturating_sub(4).max(8))
        .into_text_style(&root)
        .pos(Pos::new(HPos::Center, VPos::Bottom));
    chart
        .draw_series(layout.branch_labels.iter().map(|label| {
            Text::new(label.text.clone(), (label.x, -label.y), confidence_style.clone())
        }))
        .context("failed to draw branch labels")?;

    root.present().context("failed to write tree figure")?;
    Ok(())
}
