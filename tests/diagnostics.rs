use augury::core::time::parse_required;
use augury::{
    cross_validation, generate_cutoffs, performance_metrics, CrossValidationOptions, Forecaster,
    Metric, TimeSeriesData,
};
use chrono::{Duration, NaiveDateTime};
use proptest::prelude::*;

fn daily(start: &str, n: i64) -> Vec<NaiveDateTime> {
    let s = parse_required(start).unwrap();
    (0..n).map(|i| s + Duration::days(i)).collect()
}

fn make_ds(start: &str, n: usize) -> Vec<String> {
    daily(start, n as i64)
        .into_iter()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect()
}

fn series(n: usize) -> TimeSeriesData {
    let y = (0..n)
        .map(|i| 50.0 + 0.3 * i as f64 + 4.0 * ((i % 7) as f64) + ((i * 13) % 5) as f64 * 0.3)
        .collect();
    TimeSeriesData::new(make_ds("2022-01-01", n), y).unwrap()
}

#[test]
fn cross_validation_then_metrics() {
    let model = Forecaster::new()
        .with_uncertainty_samples(100)
        .fit(&series(120))
        .unwrap();
    let options = CrossValidationOptions::new(Duration::days(10)).with_period(Duration::days(10));
    let records = cross_validation(&model, &options).unwrap();
    assert!(!records.is_empty());

    let cutoffs: Vec<NaiveDateTime> = records.iter().map(|r| r.cutoff).collect();
    assert!(cutoffs.windows(2).all(|w| w[0] <= w[1]));
    for r in &records {
        assert!(r.ds > r.cutoff && r.ds <= r.cutoff + Duration::days(10));
        assert!(r.yhat_lower.is_some() && r.yhat_upper.is_some());
    }
    // 120 days, horizon 10, initial 30, period 10
    let distinct: std::collections::BTreeSet<_> = cutoffs.iter().collect();
    assert_eq!(distinct.len(), 8);

    let pm = performance_metrics(&records, None, 0.1).unwrap();
    assert!(pm.horizon.windows(2).all(|w| w[0] < w[1]));
    let distinct_h: std::collections::BTreeSet<_> = records.iter().map(|r| r.horizon()).collect();
    assert!(pm.len() <= distinct_h.len());
    for values in pm.values.values() {
        assert_eq!(values.len(), pm.len());
        assert!(values.iter().all(|v| v.is_finite()));
    }
    assert!(pm.get(Metric::Mape).unwrap().iter().all(|v| *v < 0.5));
}

#[test]
fn parallel_matches_sequential() {
    let model = Forecaster::new()
        .with_uncertainty_samples(50)
        .fit(&series(90))
        .unwrap();
    let options = CrossValidationOptions::new(Duration::days(7));
    let sequential = cross_validation(&model, &options).unwrap();
    let parallel = cross_validation(&model, &options.clone().with_parallel(true)).unwrap();
    assert_eq!(sequential, parallel);
}

#[test]
fn custom_cutoffs_are_validated() {
    let data = series(60);
    let model = Forecaster::new()
        .with_uncertainty_samples(0)
        .fit(&data)
        .unwrap();
    let start = parse_required("2022-01-01").unwrap();

    let ok = CrossValidationOptions::new(Duration::days(5))
        .with_cutoffs(vec![start + Duration::days(40), start + Duration::days(30)]);
    let records = cross_validation(&model, &ok).unwrap();
    assert_eq!(records.len(), 10);
    assert_eq!(records[0].cutoff, start + Duration::days(30));
    assert!(records[0].yhat_lower.is_none());

    let too_early = CrossValidationOptions::new(Duration::days(5)).with_cutoffs(vec![start]);
    assert!(cross_validation(&model, &too_early)
        .unwrap_err()
        .is_configuration());

    let too_late = CrossValidationOptions::new(Duration::days(5))
        .with_cutoffs(vec![start + Duration::days(57)]);
    assert!(cross_validation(&model, &too_late)
        .unwrap_err()
        .is_configuration());
}

#[test]
fn coverage_is_dropped_without_intervals() {
    let model = Forecaster::new()
        .with_uncertainty_samples(0)
        .fit(&series(60))
        .unwrap();
    let records =
        cross_validation(&model, &CrossValidationOptions::new(Duration::days(5))).unwrap();
    let pm = performance_metrics(&records, None, 0.1).unwrap();
    assert!(pm.get(Metric::Coverage).is_none());
    assert!(pm.get(Metric::Rmse).is_some());
}

proptest! {
    #[test]
    fn cutoff_count_on_gap_free_series(
        horizon in 1i64..60,
        initial in 30i64..400,
        period in 1i64..60,
    ) {
        let ds = daily("2015-01-01", 1000);
        let (min, max) = (ds[0], ds[999]);
        let h = Duration::days(horizon);
        let i = Duration::days(initial);
        let p = Duration::days(period);
        let cutoffs = generate_cutoffs(&ds, h, i, p).unwrap();

        let expected = (999 - horizon - initial) / period + 1;
        prop_assert_eq!(cutoffs.len() as i64, expected);
        prop_assert!(cutoffs.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(cutoffs[0] >= min + i);
        prop_assert!(*cutoffs.last().unwrap() <= max - h);
    }

    #[test]
    fn snapped_cutoffs_have_data_in_window(
        keep in proptest::collection::vec(any::<bool>(), 200),
        horizon in 1i64..15,
        period in 1i64..15,
    ) {
        let all = daily("2018-06-01", 200);
        let ds: Vec<NaiveDateTime> = all
            .iter()
            .zip(&keep)
            .filter(|(_, &k)| k)
            .map(|(d, _)| *d)
            .collect();
        prop_assume!(ds.len() >= 2);
        let h = Duration::days(horizon);
        if let Ok(cutoffs) = generate_cutoffs(&ds, h, Duration::days(20), Duration::days(period)) {
            let min = ds[0];
            // snapping only ever moves a cutoff earlier
            prop_assert!(cutoffs.windows(2).all(|w| w[0] < w[1]));
            for c in &cutoffs {
                prop_assert!(*c >= min + Duration::days(20));
                prop_assert!(ds.iter().any(|&d| d > *c && d <= *c + h));
            }
        }
    }
}
