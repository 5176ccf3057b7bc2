#![cfg(feature = "simulation")]

use combat_tracker::simulation::ArenaApp;
use combat_tracker::simulation::ArenaReport;

fn check_report(report: &ArenaReport) {
    let duels = report.duels as f64;
    assert_eq!(report.pvp.kills, duels, "every duel is one kill");
    assert_eq!(report.pvp.deaths, duels, "every duel is one death");
    assert!(report.pvp.identities <= report.fighters);

    // Duels move rating from one side to the other, so the total stays put.
    let expected = report.pvp.identities as f64 * 1250.0;
    assert!(
        (report.pvp.rating_total - expected).abs() < expected * 1e-4,
        "rating total {} drifted from {expected}",
        report.pvp.rating_total
    );

    let team = report.team_size as f64;
    assert_eq!(report.arena.wins, report.matches as f64 * team);
    assert_eq!(report.arena.losses, report.matches as f64 * team);
    assert_eq!(report.arena.ties, report.draws as f64 * team * 2.0);
    assert_eq!(report.arena.kills, 0.0);

    let leaders = &report.pvp.leaders;
    assert!(leaders.windows(2).all(|pair| pair[0].1 >= pair[1].1), "{leaders:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn arena_in_memory() -> Result<(), Box<dyn std::error::Error>> {
    // Relaxed parameters keep the run short.
    let app = ArenaApp::builder()
        .cli_args(vec![
            "arena_in_memory_test",
            "--quiet",
            "--fighters=40",
            "--bouts=1500",
            "--team-size=3",
            "--workers=6",
            "--save-interval=-1",
        ])
        .build()?;

    let report = app.execute().await?.expect("report");
    assert_eq!(report.fighters, 40);
    assert_eq!(report.duels + report.matches + report.draws, 1500);
    check_report(&report);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn arena_with_slow_store() -> Result<(), Box<dyn std::error::Error>> {
    let app = ArenaApp::builder()
        .cli_args(vec![
            "arena_with_slow_store_test",
            "--quiet",
            "--fighters=20",
            "--bouts=300",
            "--team-size=2",
            "--leave-rate=0.2",
            "--latency-ms=1",
            "--save-interval=-1",
        ])
        .build()?;

    let report = app.execute().await?.expect("report");
    check_report(&report);

    Ok(())
}

#[tokio::test]
async fn invalid_arguments_are_reported() -> Result<(), Box<dyn std::error::Error>> {
    let app = ArenaApp::builder()
        .cli_args(vec!["arena_invalid_test", "--quiet", "--fighters=3", "--team-size=2"])
        .build()?;

    assert!(app.execute().await.is_err());

    Ok(())
}

#[cfg(feature = "sqlite")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn arena_sqlite() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let app = ArenaApp::builder()
        .cli_args(vec![
            "arena_sqlite_test".to_string(),
            "--quiet".to_string(),
            "--sqlite".to_string(),
            format!("--sqlite-path={}", dir.path().display()),
            "--fighters=30".to_string(),
            "--bouts=500".to_string(),
            "--save-interval=-1".to_string(),
        ])
        .build()?;

    let report = app.execute().await?.expect("report");
    check_report(&report);

    Ok(())
}
