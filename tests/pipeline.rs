use std::fs;
use std::io::Write;

use gammaspec::io::{read_spectrum_file, read_table_file, TableError, TableWriter};
use gammaspec::prelude::*;

fn write_spectrum(path: &std::path::Path) {
    let mut handle = fs::File::create(path).unwrap();
    for channel in 0..1024 {
        let x = channel as f64;
        let counts = 10.0
            + 600.0 * (-0.5 * ((x - 300.0) / 4.0).powi(2)).exp()
            + 400.0 * (-0.5 * ((x - 700.0) / 4.0).powi(2)).exp();
        writeln!(handle, "{channel} {}", counts.round()).unwrap();
    }
}

fn step(state: &SessionState, command: Command) -> SessionState {
    recompute(state, command).unwrap().state
}

#[test_log::test]
fn calibrate_from_fitted_peaks() {
    let dir = tempfile::tempdir().unwrap();
    let spectrum_path = dir.path().join("source.txt");
    write_spectrum(&spectrum_path);

    let spectrum = read_spectrum_file(&spectrum_path).unwrap();
    assert_eq!(spectrum.len(), 1024);

    let state = step(&SessionState::default(), Command::LoadSpectrum(spectrum));
    let state = step(&state, Command::SetRange { min: 280.0, max: 320.0 });
    let first = state.analysis().unwrap().fit.peaks[0];
    assert!((first.position - 300.0).abs() < 1.0, "{first:?}");
    let state = step(&state, Command::CommitCalibrationPoint { energy: 150.0 });

    let state = step(&state, Command::SetRange { min: 680.0, max: 720.0 });
    let second = state.analysis().unwrap().fit.peaks[0];
    assert!((second.position - 700.0).abs() < 1.0, "{second:?}");
    let state = step(&state, Command::CommitCalibrationPoint { energy: 350.0 });

    let model = *state.calibration().unwrap();
    let expected_slope = 200.0 / (second.position - first.position);
    assert!((model.slope - expected_slope).abs() < 1e-9);
    assert!((model.to_energy(first.position) - 150.0).abs() < 1e-6);

    // the same window re-expressed in energy
    let energy = step(&state, Command::SetAxis(AxisDomain::Energy));
    let peak = energy.analysis().unwrap().fit.peaks[0];
    assert!((peak.position - 350.0).abs() < 0.5, "{peak:?}");

    let export = recompute(&state, Command::Save(SaveTarget::Calibration))
        .unwrap()
        .export
        .unwrap();
    let table_path = dir.path().join("calibration.txt");
    TableWriter::new(fs::File::create(&table_path).unwrap())
        .write_rows(&export)
        .unwrap();
    let rows = read_table_file(&table_path).unwrap();
    assert_eq!(rows.len(), export.len());
    for (a, b) in rows.iter().zip(export.iter()) {
        assert!((a.x - b.x).abs() <= 0.005 + 1e-9);
        assert!((a.value - b.value).abs() <= 0.005 + 1e-9);
        assert!((a.uncertainty - b.uncertainty).abs() <= 0.005 + 1e-9);
    }

    let reloaded = step(&SessionState::default(), Command::LoadCalibration(rows));
    let refit = reloaded.calibration().unwrap();
    assert!((refit.slope - model.slope).abs() < 1e-3);
}

#[test_log::test]
fn partial_calibration_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.txt");
    fs::write(&path, "100 50 0.5\n200 100 0.5\n300 150\n400 200 0.5\n").unwrap();

    let err = read_table_file(&path).unwrap_err();
    assert!(matches!(err, TableError::MalformedRow { line: 3, .. }));
    let rows = err.into_partial_rows();
    assert_eq!(rows.len(), 2);

    let state = step(&SessionState::default(), Command::LoadCalibration(rows));
    let model = state.calibration().unwrap();
    assert!((model.slope - 0.5).abs() < 1e-12);
    let points = state.calibration_points().points();
    assert!((points[0].channel_uncertainty - 1.0).abs() < 1e-9);

    let single = recompute(
        &SessionState::default(),
        Command::LoadCalibration(vec![TableRow::new(100.0, 50.0, 0.5)]),
    )
    .unwrap();
    assert!(single.state.calibration().is_none());
    assert_eq!(single.warnings.len(), 1);
}

#[test_log::test]
fn efficiency_curve_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("efficiency.txt");
    let mut handle = fs::File::create(&path).unwrap();
    for x in [100.0, 150.0, 200.0, 250.0] {
        let eff = -1e-6 * (x - 300.0f64).powi(2) + 0.2;
        writeln!(handle, "{x} {eff} 0.001").unwrap();
    }
    for x in [400.0, 600.0, 900.0, 1300.0, 1800.0, 2500.0] {
        let eff = 60.0 / (x + 100.0) + 0.01;
        writeln!(handle, "{x} {eff} 0.001").unwrap();
    }
    drop(handle);

    let rows = read_table_file(&path).unwrap();
    let state = step(
        &SessionState::default(),
        Command::LoadEfficiency {
            rows,
            domain: AxisDomain::Channel,
        },
    );
    assert!(state.efficiency().is_none());
    let state = step(&state, Command::SetBreakpoints { low: 300.0, high: 400.0 });
    let model = state.efficiency().unwrap();
    assert!((model.eval(1000.0) - (60.0 / 1100.0 + 0.01)).abs() < 1e-3);
    assert_eq!(model.error_band().len(), 100);

    let exported = recompute(&state, Command::Save(SaveTarget::Efficiency))
        .unwrap()
        .export
        .unwrap();
    assert_eq!(exported.len(), 10);
    assert!(exported.windows(2).all(|w| w[0].x < w[1].x));
}
