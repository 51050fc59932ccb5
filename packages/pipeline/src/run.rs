//! Stage orchestration.

use std::collections::BTreeMap;

use crime_risk_areal_models::{AreaTable, ArealUnit, ClusterCategory, EventPoint, UnitIndex};
use crime_risk_autocorrelation::{
    LocalMoranSet, MoranOptions, MoranResult, global_moran, local_moran,
};
use crime_risk_regression::{COEFFICIENT_NAMES, ModelData, fit_icar_poisson, fit_poisson_glm};
use crime_risk_spatial::{AdjacencyGraph, WeightsMatrix, aggregate, build_contiguity};

use crate::report::{
    AutocorrelationReport, GraphSummary, MissingExposureReport, ModelComparison,
    ResidualDiagnostics, WeightsSummary,
};
use crate::{
    MoranConfig, Outcome, PipelineConfig, PipelineError, PipelineReport, ProgressCallback,
    UnitReport,
};

const STAGES: u64 = 6;

/// An outcome that could not run because `upstream` did not complete.
fn skipped<T, U>(upstream: &Outcome<U>, what: &str) -> Outcome<T> {
    let reason = match upstream {
        Outcome::Failed { message, .. } => format!("{what} failed: {message}"),
        Outcome::Skipped { reason } => format!("{what} skipped: {reason}"),
        Outcome::Completed { .. } => format!("{what} unavailable"),
    };
    Outcome::Skipped { reason }
}

fn autocorrelation_report(
    global: &MoranResult,
    local: &LocalMoranSet,
    config: &MoranConfig,
) -> AutocorrelationReport {
    let mut significant_clusters = BTreeMap::new();
    for value in &local.values {
        let category = value.significant_category(config.local_alpha);
        if category != ClusterCategory::Unclassified {
            *significant_clusters.entry(category).or_insert(0) += 1;
        }
    }
    AutocorrelationReport {
        global: global.clone(),
        reconciliation: local.reconcile(global, config.reconcile_tolerance),
        significant_clusters,
        local_alpha: config.local_alpha,
    }
}

/// Weights over the modelled units, when some were excluded.
fn model_weights(
    data: &Outcome<ModelData>,
    graph: &AdjacencyGraph,
    config: &PipelineConfig,
) -> Outcome<Option<WeightsMatrix>> {
    match data {
        Outcome::Completed { result } if !result.excluded().is_empty() => Outcome::record(
            "Weights over modelled units",
            WeightsMatrix::from_graph(
                graph.induced(&result.positions()),
                config.weights.style,
                config.weights.zero_policy,
            )
            .map(Some)
            .map_err(PipelineError::from),
        ),
        Outcome::Completed { .. } => Outcome::Completed { result: None },
        other => skipped(other, "Model input"),
    }
}

fn residual_moran(
    residuals: Option<&[f64]>,
    model_weights: &Outcome<Option<WeightsMatrix>>,
    full: &WeightsMatrix,
    options: &MoranOptions,
    what: &str,
) -> Outcome<MoranResult> {
    let Some(residuals) = residuals else {
        return Outcome::Skipped {
            reason: format!("{what} unavailable"),
        };
    };
    let weights = match model_weights {
        Outcome::Completed { result } => result.as_ref().unwrap_or(full),
        other => return skipped(other, "Weights over modelled units"),
    };
    Outcome::record(
        what,
        global_moran(residuals, weights, options).map_err(PipelineError::from),
    )
}

fn missing_exposure_report(
    table: &AreaTable,
    data: &Outcome<ModelData>,
    config: &PipelineConfig,
) -> MissingExposureReport {
    let ids = |indices: &[UnitIndex]| -> Vec<String> {
        indices
            .iter()
            .filter_map(|&index| table.get(index).map(|r| r.id.clone()))
            .collect()
    };
    let (excluded, imputed) = data
        .completed()
        .map_or_else(|| (Vec::new(), Vec::new()), |d| (ids(d.excluded()), ids(d.imputed())));
    MissingExposureReport {
        policy: config.model.missing_exposure,
        excluded,
        imputed,
    }
}

/// Runs every stage on the given units and events.
///
/// # Errors
///
/// Aggregation, contiguity and weights errors abort the run (reference
/// frame mismatch, duplicate identifiers, empty geometry, isolates under
/// the error policy). Failures of the statistics and models are recorded
/// in the report instead.
#[allow(clippy::too_many_lines)]
pub fn run_pipeline(
    units: &[ArealUnit],
    events: &[EventPoint],
    config: &PipelineConfig,
    progress: &dyn ProgressCallback,
) -> Result<PipelineReport, PipelineError> {
    progress.set_total(STAGES);

    progress.set_message("Aggregating events".to_string());
    let aggregation = aggregate(units, events)?;
    let table = &aggregation.table;
    progress.inc(1);

    progress.set_message("Building contiguity graph".to_string());
    let graph = build_contiguity(&aggregation.geometries, config.contiguity.rule)?;
    let graph_summary = GraphSummary {
        rule: config.contiguity.rule,
        units: graph.len(),
        edges: graph.edge_count(),
        components: graph.connected_components().len(),
        isolates: graph.isolates(),
    };
    let weights = WeightsMatrix::from_graph(
        graph.clone(),
        config.weights.style,
        config.weights.zero_policy,
    )?;
    let weights_summary = WeightsSummary {
        style: weights.style(),
        zero_policy: weights.zero_policy(),
        s0: weights.s0(),
        s1: weights.s1(),
        s2: weights.s2(),
    };
    progress.inc(1);

    progress.set_message("Computing Moran's I of counts".to_string());
    let counts = table.counts();
    let options = config.moran.options();
    let raw_global = Outcome::record(
        "Moran's I of counts",
        global_moran(&counts, &weights, &options).map_err(PipelineError::from),
    );
    let local = Outcome::record(
        "Local Moran's I of counts",
        local_moran(&counts, &weights).map_err(PipelineError::from),
    );
    let autocorrelation = match (&raw_global, &local) {
        (Outcome::Completed { result: global }, Outcome::Completed { result: local }) => {
            Outcome::Completed {
                result: autocorrelation_report(global, local, &config.moran),
            }
        }
        (Outcome::Completed { .. }, other) => skipped(other, "Local Moran's I"),
        (other, _) => skipped(other, "Moran's I"),
    };
    progress.inc(1);

    progress.set_message("Fitting baseline model".to_string());
    let data = Outcome::record(
        "Model input",
        ModelData::from_table(table, config.model.missing_exposure).map_err(PipelineError::from),
    );
    let baseline = match &data {
        Outcome::Completed { result } => Outcome::record(
            "Baseline model",
            fit_poisson_glm(result, &config.model.baseline).map_err(PipelineError::from),
        ),
        other => skipped(other, "Model input"),
    };
    progress.inc(1);

    progress.set_message("Fitting spatial model".to_string());
    let spatial = match &data {
        Outcome::Completed { result } => Outcome::record(
            "Spatial model",
            fit_icar_poisson(result, &graph, &config.model.spatial).map_err(PipelineError::from),
        ),
        other => skipped(other, "Model input"),
    };
    progress.inc(1);

    progress.set_message("Residual diagnostics".to_string());
    let subset_weights = model_weights(&data, &graph, config);
    let residuals = ResidualDiagnostics {
        raw_counts: raw_global,
        spatial_residuals: residual_moran(
            spatial.completed().map(|fit| fit.residuals.as_slice()),
            &subset_weights,
            &weights,
            &options,
            "Moran's I of spatial model residuals",
        ),
        baseline_residuals: residual_moran(
            baseline.completed().map(|fit| fit.residuals.as_slice()),
            &subset_weights,
            &weights,
            &options,
            "Moran's I of baseline model residuals",
        ),
    };

    let mut row_of = vec![None; table.len()];
    if let Some(data) = data.completed() {
        for (row, index) in data.indices().iter().enumerate() {
            row_of[index.position()] = Some(row);
        }
    }
    let local_values = local.completed();
    let unit_reports = table
        .records()
        .iter()
        .enumerate()
        .map(|(position, record)| {
            let row = row_of[position];
            let value = local_values.map(|set| &set.values[position]);
            let baseline_fit = baseline.completed();
            let spatial_fit = spatial.completed();
            UnitReport {
                index: record.index,
                id: record.id.clone(),
                count: record.count,
                exposure: record.exposure,
                modelled: row.is_some(),
                local_moran: value.map(|v| v.statistic),
                local_p_value: value.and_then(|v| v.p_value),
                cluster: value.map_or(ClusterCategory::Unclassified, |v| v.category),
                significant_cluster: value.map_or(ClusterCategory::Unclassified, |v| {
                    v.significant_category(config.moran.local_alpha)
                }),
                baseline_fitted: row.zip(baseline_fit).map(|(r, f)| f.fitted[r]),
                baseline_residual: row.zip(baseline_fit).map(|(r, f)| f.residuals[r]),
                spatial_fitted: row.zip(spatial_fit).map(|(r, f)| f.fitted[r]),
                spatial_residual: row.zip(spatial_fit).map(|(r, f)| f.residuals[r]),
                spatial_effect: row.zip(spatial_fit).map(|(r, f)| f.spatial_effect[r]),
            }
        })
        .collect();
    progress.inc(1);

    let comparison = ModelComparison::new(
        COEFFICIENT_NAMES[1],
        spatial.completed(),
        baseline.completed(),
    );
    if let (Some(s), Some(b)) = (&comparison.spatial, &comparison.baseline) {
        log::info!(
            "Exposure IRR: spatial {:.4} [{:.4}, {:.4}], baseline {:.4} [{:.4}, {:.4}]",
            s.rate_ratio.estimate,
            s.rate_ratio.lower,
            s.rate_ratio.upper,
            b.rate_ratio.estimate,
            b.rate_ratio.lower,
            b.rate_ratio.upper
        );
    }
    progress.finish(format!("Analysed {} units", table.len()));

    Ok(PipelineReport {
        frame: aggregation.frame.clone(),
        aggregation: aggregation.summary,
        graph: graph_summary,
        weights: weights_summary,
        missing_exposure: missing_exposure_report(table, &data, config),
        units: unit_reports,
        autocorrelation,
        residuals,
        baseline,
        spatial,
        comparison,
        config: *config,
    })
}

#[cfg(test)]
mod tests {
    use crime_risk_areal_models::{ErrorCategory, ReferenceFrame};
    use crime_risk_spatial::ZeroPolicy;
    use geo::{MultiPolygon, Rect, coord};

    use super::*;
    use crate::NullProgress;

    const FRAME: &str = "EPSG:3857";

    fn square(col: u32, row: u32) -> MultiPolygon<f64> {
        let x = f64::from(col);
        let y = f64::from(row);
        MultiPolygon(vec![
            Rect::new(coord! { x: x, y: y }, coord! { x: x + 1.0, y: y + 1.0 }).to_polygon(),
        ])
    }

    /// 4x4 grid whose left columns hold more events than the right ones.
    fn grid_inputs() -> (Vec<ArealUnit>, Vec<EventPoint>) {
        let mut units = Vec::new();
        let mut events = Vec::new();
        for row in 0..4u32 {
            for col in 0..4u32 {
                units.push(ArealUnit {
                    id: format!("u{}", row * 4 + col),
                    geometry: square(col, row),
                    frame: ReferenceFrame::new(FRAME),
                    exposure: Some(f64::from((col * 3 + row * 5) % 7) / 2.0),
                });
                let count = (4 - col) * 2 + row % 2;
                for k in 0..count {
                    events.push(EventPoint::new(
                        f64::from(col) + 0.1 + f64::from(k) * 0.05,
                        f64::from(row) + 0.5,
                        ReferenceFrame::new(FRAME),
                    ));
                }
            }
        }
        (units, events)
    }

    /// Counts on a 7x7 grid: a log-linear trend in the exposure plus a
    /// smooth bump around column 3, row 5 that the exposure does not
    /// explain. Row-major from the bottom-left.
    const CLUSTERED_COUNTS: [u32; 49] = [
        7, 8, 10, 10, 12, 12, 14, //
        9, 9, 11, 13, 13, 14, 14, //
        9, 12, 13, 15, 17, 16, 18, //
        12, 14, 19, 21, 23, 23, 20, //
        13, 20, 27, 36, 32, 28, 26, //
        14, 22, 37, 43, 44, 32, 28, //
        17, 22, 34, 45, 40, 35, 28,
    ];

    fn clustered_inputs() -> (Vec<ArealUnit>, Vec<EventPoint>) {
        let mut units = Vec::new();
        let mut events = Vec::new();
        for row in 0..7u32 {
            for col in 0..7u32 {
                let jitter = (f64::from((col * 7 + row * 13) % 5) - 2.0) / 2.0;
                units.push(ArealUnit {
                    id: format!("u{}", row * 7 + col),
                    geometry: square(col, row),
                    frame: ReferenceFrame::new(FRAME),
                    exposure: Some(f64::from(col + row) / 6.0 + 0.1 * jitter),
                });
                for k in 0..CLUSTERED_COUNTS[(row * 7 + col) as usize] {
                    events.push(EventPoint::new(
                        f64::from(col) + (f64::from(k % 10) + 0.5) / 10.0,
                        f64::from(row) + (f64::from(k / 10) + 0.5) / 10.0,
                        ReferenceFrame::new(FRAME),
                    ));
                }
            }
        }
        (units, events)
    }

    fn quick_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.model.spatial.log_precision_steps = 9;
        config
    }

    #[test]
    fn end_to_end_on_grid() {
        let (units, events) = grid_inputs();
        let report =
            run_pipeline(&units, &events, &quick_config(), &NullProgress).expect("runs");

        assert_eq!(report.units.len(), 16);
        assert_eq!(report.aggregation.events_dropped, 0);
        assert_eq!(report.units[0].count, 8);
        assert_eq!(report.units[3].count, 2);
        assert_eq!(report.graph.edges, 42);
        assert!(report.graph.isolates.is_empty());

        let autocorrelation = report.autocorrelation.completed().expect("computed");
        assert!(autocorrelation.reconciliation.consistent);
        assert!(autocorrelation.global.statistic > 0.0);

        assert!(report.baseline.completed().is_some());
        assert!(report.spatial.completed().is_some());
        assert!(report.comparison.shift.is_some());
        assert!(report.units.iter().all(|u| u.modelled && u.spatial_fitted.is_some()));
        assert!(report.residuals.spatial_residuals.completed().is_some());
        assert!(report.residuals.baseline_residuals.completed().is_some());
    }

    #[test]
    fn spatial_model_absorbs_clustered_residuals() {
        let (units, events) = clustered_inputs();
        let report =
            run_pipeline(&units, &events, &quick_config(), &NullProgress).expect("runs");
        assert_eq!(report.aggregation.events_matched, 1011);
        assert_eq!(report.units[45].count, 45);

        let statistic = |outcome: &Outcome<MoranResult>| {
            outcome.completed().map(|m| m.statistic).expect("computed")
        };
        let raw = statistic(&report.residuals.raw_counts);
        let baseline = statistic(&report.residuals.baseline_residuals);
        let spatial = statistic(&report.residuals.spatial_residuals);
        assert!(raw > 0.0);
        assert!(
            spatial.abs() < baseline.abs() && baseline.abs() < raw.abs(),
            "raw {raw}, baseline {baseline}, spatial {spatial}"
        );

        let spatial_fit = report.comparison.spatial.as_ref().expect("spatial fitted");
        let baseline_fit = report.comparison.baseline.as_ref().expect("baseline fitted");
        assert!(spatial_fit.converged && baseline_fit.converged);
        let spatial_width = spatial_fit.upper - spatial_fit.lower;
        let wald_width = baseline_fit.upper - baseline_fit.lower;
        assert!(
            spatial_width > wald_width,
            "credible width {spatial_width}, Wald width {wald_width}"
        );
        assert!(spatial_fit.estimate > 0.0 && baseline_fit.estimate > 0.0);
    }

    #[test]
    fn report_writers_produce_json_and_csv() {
        let (units, events) = grid_inputs();
        let report =
            run_pipeline(&units, &events, &quick_config(), &NullProgress).expect("runs");

        let mut json = Vec::new();
        report.write_json(&mut json).expect("json");
        let value: serde_json::Value = serde_json::from_slice(&json).expect("valid json");
        assert_eq!(value["spatial"]["status"], "completed");
        assert_eq!(value["units"].as_array().map(Vec::len), Some(16));

        let mut csv = Vec::new();
        report.write_units_csv(&mut csv).expect("csv");
        let text = String::from_utf8(csv).expect("utf8");
        assert_eq!(text.lines().count(), 17);
        assert!(text.starts_with("index,id,count,exposure,modelled"));
    }

    #[test]
    fn reruns_are_identical() {
        let (units, events) = grid_inputs();
        let mut config = quick_config();
        config.moran.inference = crime_risk_autocorrelation::NullModel::Permutation;
        config.moran.permutations = 99;
        let first = run_pipeline(&units, &events, &config, &NullProgress).expect("runs");
        let second = run_pipeline(&units, &events, &config, &NullProgress).expect("runs");
        assert_eq!(first, second);
    }

    #[test]
    fn frame_mismatch_aborts() {
        let (units, mut events) = grid_inputs();
        events.push(EventPoint::new(0.5, 0.5, ReferenceFrame::new("EPSG:4326")));
        let err = run_pipeline(&units, &events, &quick_config(), &NullProgress)
            .err()
            .expect("fails");
        assert_eq!(err.category(), ErrorCategory::InputInconsistency);
    }

    #[test]
    fn missing_exposure_is_excluded_and_reported() {
        let (mut units, events) = grid_inputs();
        units[0].exposure = None;
        let report =
            run_pipeline(&units, &events, &quick_config(), &NullProgress).expect("runs");

        assert_eq!(report.missing_exposure.excluded, vec!["u0".to_string()]);
        assert!(!report.units[0].modelled);
        assert_eq!(report.units[0].exposure, None);
        assert!(report.units[0].spatial_fitted.is_none());
        assert!(report.units[1].spatial_fitted.is_some());
        assert_eq!(report.spatial.completed().map(|f| f.indices.len()), Some(15));
        // Residual diagnostics run on the 15-unit subgraph.
        assert_eq!(
            report.residuals.spatial_residuals.completed().map(|m| m.n),
            Some(15)
        );
        // Counts are still analysed over all 16 units.
        assert_eq!(report.residuals.raw_counts.completed().map(|m| m.n), Some(16));
    }

    #[test]
    fn isolates_follow_zero_policy() {
        let (mut units, events) = grid_inputs();
        units.push(ArealUnit {
            id: "island".to_string(),
            geometry: square(10, 10),
            frame: ReferenceFrame::new(FRAME),
            exposure: Some(1.0),
        });

        let err = run_pipeline(&units, &events, &quick_config(), &NullProgress)
            .err()
            .expect("isolate rejected");
        assert_eq!(err.category(), ErrorCategory::GeometryDegeneracy);

        let mut config = quick_config();
        config.weights.zero_policy = ZeroPolicy::ZeroRow;
        let report = run_pipeline(&units, &events, &config, &NullProgress).expect("runs");
        assert_eq!(report.graph.isolates.len(), 1);
        assert_eq!(report.graph.components, 2);
        let spatial = report.spatial.completed().expect("fits");
        assert!(spatial.spatial_effect[16].abs() < 1e-8);
        assert_eq!(report.units[16].cluster, ClusterCategory::Unclassified);
    }
}
