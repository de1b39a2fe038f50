use augury::{
    FittedModel, Forecaster, Frequency, HolidayConfig, RegressorConfig, SeasonalityConfig,
    SeasonalityMode, TimeSeriesData,
};

fn make_ds(start: &str, n: usize) -> Vec<String> {
    let start_date = chrono::NaiveDate::parse_from_str(start, "%Y-%m-%d").unwrap();
    (0..n)
        .map(|i| {
            (start_date + chrono::Duration::days(i as i64))
                .format("%Y-%m-%d")
                .to_string()
        })
        .collect()
}

fn assert_close(a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        let tol = 1e-9 * x.abs().max(y.abs()).max(1.0);
        assert!((x - y).abs() <= tol, "{} vs {}", x, y);
    }
}

fn fitted() -> (FittedModel, TimeSeriesData) {
    let n = 90;
    let ds = make_ds("2021-01-01", n);
    let temp: Vec<f64> = (0..n).map(|i| 15.0 + 5.0 * (i as f64 / 9.0).sin()).collect();
    let y: Vec<f64> = (0..n)
        .map(|i| 20.0 + 0.1 * i as f64 + 0.4 * temp[i] + ((i % 7) as f64) * 0.8)
        .collect();
    let data = TimeSeriesData::new(ds.clone(), y)
        .unwrap()
        .with_regressor("temp", temp)
        .unwrap();

    let mut m = Forecaster::new().with_uncertainty_samples(100).with_seed(3);
    m.add_regressor(RegressorConfig::new("temp")).unwrap();
    m.add_seasonality(
        SeasonalityConfig::new("monthly", 30.5, 4).with_mode(SeasonalityMode::Multiplicative),
    )
    .unwrap();
    m.add_holidays(HolidayConfig::new("launch", vec![ds[40].clone()]).with_windows(-1, 1))
        .unwrap();
    let model = m.fit(&data).unwrap();

    let mut future = model
        .make_future_dataframe(20, Frequency::Daily, true)
        .unwrap();
    let temps: Vec<f64> = (0..future.len())
        .map(|i| 15.0 + 5.0 * (i as f64 / 9.0).sin())
        .collect();
    future = future.with_regressor("temp", temps).unwrap();
    (model, future)
}

#[test]
fn json_round_trip_predicts_identically() {
    let (model, future) = fitted();
    let json = model.to_json().unwrap();
    let restored = FittedModel::from_json(&json).unwrap();

    assert_eq!(restored.document(), model.document());

    let a = model.predict(Some(&future)).unwrap();
    let b = restored.predict(Some(&future)).unwrap();
    assert_eq!(a.ds, b.ds);
    assert_close(&a.yhat, &b.yhat);
    assert_close(&a.trend, &b.trend);
    assert_close(a.yhat_lower.as_ref().unwrap(), b.yhat_lower.as_ref().unwrap());
    assert_close(a.yhat_upper.as_ref().unwrap(), b.yhat_upper.as_ref().unwrap());
    for (name, component) in &a.components {
        assert_close(&component.values, &b.components[name].values);
    }
}

#[test]
fn corrupted_document_is_rejected() {
    let (model, _) = fitted();
    let json = model.to_json().unwrap();
    assert!(matches!(
        FittedModel::from_json(&json[..json.len() / 2]),
        Err(augury::AuguryError::Serialization(_))
    ));

    let bumped = json.replacen("\"version\":1", "\"version\":7", 1);
    assert!(matches!(
        FittedModel::from_json(&bumped),
        Err(augury::AuguryError::State(_))
    ));
}

#[test]
fn regressor_stats_survive_round_trip() {
    let (model, _) = fitted();
    let restored = FittedModel::from_json(&model.to_json().unwrap()).unwrap();
    let r = &restored.regressors()[0];
    assert_eq!(r.name, "temp");
    assert_eq!(r.mu, model.regressors()[0].mu);
    assert_eq!(r.std, model.regressors()[0].std);
    assert!(r.std > 1.0);
}
