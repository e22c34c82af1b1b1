use evorates::patient::{PatientData, ProteinRegion};
use ndarray::{Array1, Array2, Array3};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process::Command,
};

/// Synthetic longitudinal dataset: every odd position is two-fold
/// synonymous and drifts away from the founder state, even positions are
/// nonsynonymous and stay put.
fn make_patient(code: &str, drift_per_day: f64) -> PatientData {
    let n_times = 5;
    let n_nucs = 2;
    let n_positions = 40;
    let days = [0.0, 200.0, 600.0, 1200.0, 1800.0];

    let mut frequencies = Array3::zeros((n_times, n_nucs, n_positions));
    let mut synonymous = Array2::from_elem((n_nucs, n_positions), false);
    for pos in 0..n_positions {
        if pos % 2 == 1 {
            synonymous[[0, pos]] = true;
            synonymous[[1, pos]] = true;
        }
        for (i_time, &day) in days.iter().enumerate() {
            let drift = if pos % 2 == 1 {
                (drift_per_day * day).min(0.8)
            } else {
                0.0
            };
            frequencies[[i_time, 0, pos]] = 1.0 - drift;
            frequencies[[i_time, 1, pos]] = drift;
        }
    }

    PatientData {
        code: code.to_string(),
        days_since_infection: days.to_vec(),
        frequencies,
        coverage: Array2::from_elem((n_times, n_positions), 500.0),
        founder_indices: Array1::zeros(n_positions),
        synonymous,
        constrained: Array1::from_elem(n_positions, false),
        gaps: Array1::from_elem(n_positions, false),
        reference_map: (0..n_positions).map(|pos| (pos, pos)).collect(),
        proteins: vec![
            ProteinRegion {
                name: "gag".to_string(),
                start: 0,
                end: 20,
            },
            ProteinRegion {
                name: "pol".to_string(),
                start: 20,
                end: 40,
            },
        ],
    }
}

fn write_patient(file: &Path, patient: &PatientData) {
    let file = File::create(file).expect("failed to create patient file");
    let mut writer = BufWriter::new(file);
    rmp_serde::encode::write(&mut writer, patient).expect("failed to serialize patient");
    writer.flush().expect("failed to flush patient file");
}

#[test]
fn basic_workflow() {
    let test_dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join("basic_workflow");

    fs::remove_dir_all(&test_dir).ok();
    fs::create_dir(&test_dir).expect("failed to create test directory");

    let config_contents = String::new()
        + "[rates]\n"
        + "window_size = 5\n"
        + "cov_min = 100.0\n"
        + "reference_length = 40\n"
        + "\n"
        + "[divdiv]\n"
        + "cov_min = 100.0\n"
        + "time_bins = [ 0.0, 500.0, 1000.0, 2000.0,]\n"
        + "sfs_tmin = 300.0\n"
        + "\n"
        + "[[divdiv.regions]]\n"
        + "name = \"structural\"\n"
        + "proteins = [ \"gag\",]\n"
        + "\n"
        + "[[divdiv.regions]]\n"
        + "name = \"enzymes\"\n"
        + "proteins = [ \"pol\",]\n"
        + "\n"
        + "[bootstrap]\n"
        + "n_replicates = 25\n"
        + "seed = 3\n";

    fs::write(test_dir.join("config.toml"), config_contents).expect("failed to write config file");

    write_patient(
        &test_dir.join("patient-p1.msgpack"),
        &make_patient("p1", 1e-4),
    );
    write_patient(
        &test_dir.join("patient-p2.msgpack"),
        &make_patient("p2", 3e-4),
    );

    let tree_json = r#"{
        "name": "root",
        "children": [
            {"name": "p1_0", "branch_length": 0.02},
            {
                "branch_length": 0.01,
                "confidence": 95,
                "children": [
                    {"name": "p1_450", "branch_length": 0.015},
                    {"name": "p1_1200", "branch_length": 0.03}
                ]
            }
        ]
    }"#;
    fs::write(test_dir.join("tree.json"), tree_json).expect("failed to write tree file");

    fn run_bin(args: &[&str]) {
        let bin = PathBuf::from(env!("CARGO_BIN_EXE_evorates"));

        let output = Command::new(bin)
            .args(args)
            .output()
            .expect("failed to execute command");

        let stdout_str =
            std::str::from_utf8(&output.stdout).expect("failed to convert stdout to string");
        let stderr_str =
            std::str::from_utf8(&output.stderr).expect("failed to convert stderr to string");

        assert!(
            output.status.success(),
            "failed to run binary with {args:?}\nstdout:\n{stdout_str}\nstderr:\n{stderr_str}\n"
        );
    }

    let test_dir_str = test_dir
        .to_str()
        .expect("failed to convert test directory to string");

    run_bin(&["--data-dir", test_dir_str, "rates", "--patients", "p1", "p2"]);
    assert!(test_dir.join("rates.msgpack").is_file());
    assert!(test_dir.join("figures/evolutionary_rates.svg").is_file());

    // A second run without --redo reuses the cache.
    run_bin(&["--data-dir", test_dir_str, "rates"]);

    run_bin(&["--data-dir", test_dir_str, "divdiv"]);
    assert!(test_dir.join("divdiv.msgpack").is_file());
    assert!(test_dir.join("figures/divdiv.svg").is_file());
    assert!(test_dir.join("figures/sfs.svg").is_file());

    run_bin(&["--data-dir", test_dir_str, "divdiv", "--redo"]);

    let tree_file = test_dir.join("tree.json");
    let tree_file_str = tree_file
        .to_str()
        .expect("failed to convert tree file to string");
    run_bin(&["--data-dir", test_dir_str, "tree", "--json", tree_file_str]);
    assert!(test_dir.join("figures/tree.svg").is_file());

    fs::remove_dir_all(&test_dir).ok();
}

#[test]
fn unreadable_patient_is_skipped() {
    let test_dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join("skip_bad_patient");

    fs::remove_dir_all(&test_dir).ok();
    fs::create_dir(&test_dir).expect("failed to create test directory");

    write_patient(
        &test_dir.join("patient-p1.msgpack"),
        &make_patient("p1", 1e-4),
    );
    fs::write(test_dir.join("patient-bad.msgpack"), b"not msgpack")
        .expect("failed to write bad patient file");

    let bin = PathBuf::from(env!("CARGO_BIN_EXE_evorates"));
    let test_dir_str = test_dir
        .to_str()
        .expect("failed to convert test directory to string");

    let output = Command::new(bin)
        .args(["--data-dir", test_dir_str, "rates"])
        .output()
        .expect("failed to execute command");

    // The bad file is logged and skipped, the good patient still goes
    // through.
    assert!(output.status.success());
    let stderr_str =
        std::str::from_utf8(&output.stderr).expect("failed to convert stderr to string");
    assert!(stderr_str.contains("can't load patient bad"));
    assert!(test_dir.join("figures/evolutionary_rates.svg").is_file());

    fs::remove_dir_all(&test_dir).ok();
}
