mod common;

use std::fs;

use calculix_runner::store::CANDIDATE_FILE;
use calculix_runner::{BatchOptimizer, CancellationToken, LoadOverrides, RunController, RunStatus};

use common::{candidate, config, FakeMesher, FakeSolver, Solve};

fn converging() -> FakeSolver {
    FakeSolver::new(vec![Solve::Stress(100.0), Solve::Stress(99.0)])
}

#[tokio::test]
async fn test_archive_is_replaced_on_rerun() {
    let root = tempfile::tempdir().unwrap();
    let archive = root.path().join("archive").join("UPN100_tp10_bp200");

    for pass in 0..2 {
        let controller = RunController::new(FakeMesher::default(), converging(), config(root.path()));
        let optimizer = BatchOptimizer::new(controller, LoadOverrides::default());
        let mut sink = |_: &str| {};
        let report = optimizer
            .run(vec![candidate("UPN100")], &CancellationToken::new(), &mut sink)
            .await;

        assert!(!report.stopped);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].status, RunStatus::Converged);
        assert_eq!(report.outcomes[0].archive.as_deref(), Some(archive.as_path()));

        if pass == 0 {
            fs::write(archive.join("stale.txt"), "left over").unwrap();
        }
    }

    assert!(archive.join(CANDIDATE_FILE).exists());
    assert!(!archive.join("stale.txt").exists());
    let entries = fs::read_dir(root.path().join("archive")).unwrap().count();
    assert_eq!(entries, 1);
    // Two runs, two distinct work directories
    let runs = fs::read_dir(root.path().join("work").join("UPN100_tp10_bp200"))
        .unwrap()
        .count();
    assert_eq!(runs, 2);
}

#[tokio::test]
async fn test_stop_request_skips_remaining_candidates() {
    let root = tempfile::tempdir().unwrap();
    let controller = RunController::new(FakeMesher::default(), converging(), config(root.path()));
    let optimizer = BatchOptimizer::new(controller, LoadOverrides::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut sink = move |l: &str| {
        if l.starts_with("Archived") {
            trigger.cancel();
        }
    };
    let report = optimizer
        .run(
            vec![candidate("UPN100"), candidate("UPN120"), candidate("UPN140")],
            &cancel,
            &mut sink,
        )
        .await;

    assert!(report.stopped);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.skipped, vec!["UPN120_tp10_bp200", "UPN140_tp10_bp200"]);
}

#[tokio::test]
async fn test_invalid_candidate_does_not_stop_batch() {
    let root = tempfile::tempdir().unwrap();
    let controller = RunController::new(FakeMesher::default(), converging(), config(root.path()));
    let optimizer = BatchOptimizer::new(controller, LoadOverrides::default());

    let mut broken = candidate("BROKEN");
    broken.0.remove("web_thickness");
    let mut sink = |_: &str| {};
    let report = optimizer
        .run(vec![broken, candidate("UPN100")], &CancellationToken::new(), &mut sink)
        .await;

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcomes[0].status, RunStatus::Error);
    assert!(report.outcomes[0].error.as_deref().unwrap().contains("web_thickness"));
    assert!(report.outcomes[0].archive.is_none());
    assert_eq!(report.outcomes[1].status, RunStatus::Converged);
}

#[tokio::test]
async fn test_moment_override_reaches_the_deck() {
    let root = tempfile::tempdir().unwrap();
    let controller = RunController::new(FakeMesher::default(), converging(), config(root.path()));
    let overrides = LoadOverrides {
        moment_z: Some("axial_force * plate_thickness".to_string()),
        ..LoadOverrides::default()
    };
    let optimizer = BatchOptimizer::new(controller, overrides);

    let input = optimizer.prepare(candidate("UPN100")).unwrap();
    assert_eq!(input.key, "UPN100_tp10_bp200");
    assert_eq!(input.params.loads.mz, 10_000.0);

    let mut sink = |_: &str| {};
    let report = optimizer
        .run(vec![candidate("UPN100")], &CancellationToken::new(), &mut sink)
        .await;
    assert_eq!(report.outcomes[0].status, RunStatus::Converged);

    let run_dir = fs::read_dir(root.path().join("work").join("UPN100_tp10_bp200"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let deck = fs::read_dir(run_dir.join("iter_01"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .find(|path| {
            let name = path.file_name().unwrap().to_string_lossy();
            name.starts_with("mesh_") && name.ends_with(".inp")
        })
        .unwrap();
    let text = fs::read_to_string(deck).unwrap();

    // Mesh nodes 1..=4, reference node 5, rotation node 6
    let cload = text.split("*CLOAD\n").nth(1).unwrap();
    let lines: Vec<&str> = cload.lines().take_while(|l| !l.starts_with('*')).collect();
    assert_eq!(lines, vec!["5, 1, 1.000000e3", "6, 2, 5.000000e3", "6, 3, 1.000000e4"]);
}
