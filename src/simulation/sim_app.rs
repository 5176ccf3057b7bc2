use std::fmt::Debug;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Result;
use clap::error::ErrorKind;
use clap::CommandFactory;
use clap::Parser;
use fieldx::fxstruct;
use fieldx_plus::fx_plus;
use garde::Validate;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use super::script::Bout;
use super::script::Script;
use super::script::ScriptWriter;
#[cfg(feature = "sqlite")]
use crate::config::DatabaseSettings;
use crate::config::Settings;
use crate::rating::CalculatorRegistry;
use crate::record::Record;
use crate::store::MemoryStore;
#[cfg(feature = "sqlite")]
use crate::store::SqlStore;
use crate::tracker::Tracker;
use crate::traits::StatStore;
use crate::types::StatType;

#[derive(Debug, Clone, clap::Parser, Validate)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, author, name = "arena")]
pub(crate) struct Cli {
    /// Silence the output
    #[clap(long, short, env = "TRACKER_QUIET", default_value_t = false)]
    #[garde(skip)]
    quiet: bool,

    /// Number of fighters in the arena.
    #[clap(long, env = "TRACKER_FIGHTERS", default_value_t = 200)]
    #[garde(range(min = 2))]
    fighters: usize,

    /// Number of bouts to play. Fighters leaving in between are not counted.
    #[clap(long, env = "TRACKER_BOUTS", default_value_t = 5_000)]
    #[garde(range(min = 1))]
    bouts: usize,

    /// Fighters per team in team matches. Free-for-all draws take two teams worth of fighters.
    #[clap(long, env = "TRACKER_TEAM_SIZE", default_value_t = 3)]
    #[garde(range(min = 1), custom(Self::fits_arena(&self.fighters)))]
    team_size: usize,

    /// Share of bouts that end in a free-for-all draw.
    #[clap(long, env = "TRACKER_DRAW_RATE", default_value_t = 0.1)]
    #[garde(range(min = 0.0, max = 1.0))]
    draw_rate: f64,

    /// Share of bouts that are team matches.
    #[clap(long, env = "TRACKER_MATCH_RATE", default_value_t = 0.3)]
    #[garde(range(min = 0.0, max = 1.0))]
    match_rate: f64,

    /// Chance of a fighter leaving the arena after a bout.
    #[clap(long, env = "TRACKER_LEAVE_RATE", default_value_t = 0.05)]
    #[garde(range(min = 0.0, max = 1.0))]
    leave_rate: f64,

    /// Number of concurrent workers feeding the trackers.
    #[clap(long, short, env = "TRACKER_WORKERS", default_value_t = 8)]
    #[garde(range(min = 1))]
    workers: usize,

    /// Simulated latency of every store call, in milliseconds. Only applies to the in-memory store.
    #[clap(long, env = "TRACKER_LATENCY_MS", default_value_t = 0)]
    #[garde(skip)]
    latency_ms: u64,

    /// Autosave period in seconds; -1 disables autosave.
    #[clap(long, env = "TRACKER_SAVE_INTERVAL", default_value_t = 5, allow_negative_numbers = true)]
    #[garde(custom(Self::valid_save_interval))]
    save_interval: i64,

    /// Use SQLite as the store backend.
    #[clap(long, env = "TRACKER_SQLITE", default_value_t = false)]
    #[fieldx(get(copy))]
    #[garde(custom(Self::feature_enabled(cfg!(feature = "sqlite"), "sqlite")))]
    sqlite: bool,

    /// Directory of the SQLite database. A temporary directory is used by default.
    #[clap(long, env = "TRACKER_SQLITE_PATH")]
    // Only used when the sqlite feature is enabled.
    #[fieldx(get(clone, attributes_fn(allow(unused))))]
    #[garde(skip)]
    sqlite_path: Option<PathBuf>,
}

impl Cli {
    fn fits_arena<'a>(fighters: &'a usize) -> impl FnOnce(&'a usize, &()) -> garde::Result {
        move |value, _| {
            if value * 2 > *fighters {
                Err(garde::Error::new(format!(
                    "two teams of {value} need more than {fighters} fighters"
                )))
            }
            else {
                Ok(())
            }
        }
    }

    fn valid_save_interval(value: &i64, _ctx: &()) -> garde::Result {
        if *value == -1 || *value > 0 {
            Ok(())
        }
        else {
            Err(garde::Error::new("must be positive or -1"))
        }
    }

    fn feature_enabled(enabled: bool, feature: &'static str) -> impl FnOnce(&bool, &()) -> garde::Result {
        move |value, _| {
            if !*value || enabled {
                Ok(())
            }
            else {
                Err(garde::Error::new(format!("Build feature '{feature}' must be enabled.")))
            }
        }
    }
}

/// Totals one tracker ended up with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerSummary {
    pub identities:   usize,
    pub kills:        f64,
    pub deaths:       f64,
    pub ties:         f64,
    pub wins:         f64,
    pub losses:       f64,
    pub rating_total: f64,
    /// Best rated identities, best first.
    pub leaders:      Vec<(String, f32)>,
}

impl TrackerSummary {
    fn from_records(records: &[Record]) -> Self {
        let sum = |stat: &StatType| records.iter().map(|r| r.stat(stat) as f64).sum::<f64>();
        Self {
            identities:   records.len(),
            kills:        sum(&StatType::Kills),
            deaths:       sum(&StatType::Deaths),
            ties:         sum(&StatType::Ties),
            wins:         sum(&StatType::wins()),
            losses:       sum(&StatType::losses()),
            rating_total: sum(&StatType::Rating),
            leaders:      records
                .iter()
                .take(5)
                .map(|r| (r.name().to_string(), r.rating()))
                .collect(),
        }
    }
}

/// What the script contained and what the trackers made of it.
#[derive(Debug, Clone, Default)]
pub struct ArenaReport {
    pub fighters:  usize,
    pub duels:     usize,
    pub matches:   usize,
    pub draws:     usize,
    pub leaves:    usize,
    pub team_size: usize,
    pub pvp:       TrackerSummary,
    pub arena:     TrackerSummary,
    pub elapsed:   Duration,
}

impl Display for ArenaReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} fighters, {} duels, {} matches, {} draws, {} leaves in {:.2}s",
            self.fighters,
            self.duels,
            self.matches,
            self.draws,
            self.leaves,
            self.elapsed.as_secs_f64()
        )?;
        writeln!(
            f,
            "pvp:   {} identities, {} kills, {} deaths, rating total {:.1}",
            self.pvp.identities, self.pvp.kills, self.pvp.deaths, self.pvp.rating_total
        )?;
        writeln!(
            f,
            "arena: {} identities, {} wins, {} losses, {} ties",
            self.arena.identities, self.arena.wins, self.arena.losses, self.arena.ties
        )?;
        for (place, (name, rating)) in self.pvp.leaders.iter().enumerate() {
            writeln!(f, "  #{} {name} {rating:.1}", place + 1)?;
        }
        Ok(())
    }
}

#[fx_plus(
    app,
    rc,
    new(private),
    sync,
    get,
    fallible(off, error(anyhow::Error)),
    builder(vis(pub))
)]
pub struct ArenaApp {
    #[fieldx(inner_mut, clearer, builder("_cli_args"))]
    cli_args: Vec<String>,

    #[fieldx(lazy, private, fallible(error(clap::Error)), get(clone))]
    cli: Cli,

    // Only used when the sqlite feature is enabled.
    #[fieldx(lazy, private, get(attributes_fn(allow(unused))), fallible)]
    tempdir: tempfile::TempDir,
}

impl ArenaApp {
    fn build_cli(&self) -> Result<Cli, clap::Error> {
        Ok(if let Some(custom_args) = self.clear_cli_args() {
            Cli::try_parse_from(custom_args.into_iter())?
        }
        else {
            Cli::try_parse()?
        })
    }

    fn validate(&self) -> Result<()> {
        if let Err(err) = self.cli()?.validate() {
            let mut cmd = Cli::command();
            return Err(cmd.error(ErrorKind::InvalidValue, err).into());
        }

        Ok(())
    }

    fn setup_tracing(&self) {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let filter = tracing_subscriber::EnvFilter::from_default_env();
        let tracing_registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false));

        // Several apps may run within one test binary; the first one wins.
        if tracing_registry.try_init().is_ok() {
            info!("Tracing initialized");
        }
    }

    fn script(&self) -> Result<Script> {
        let cli = self.cli()?;
        ScriptWriter::builder()
            .fighters(cli.fighters())
            .bouts(cli.bouts())
            .team_size(cli.team_size())
            .draw_rate(cli.draw_rate())
            .match_rate(cli.match_rate())
            .leave_rate(cli.leave_rate())
            .build()?
            .create()
    }

    fn settings(&self) -> Result<Settings> {
        let cli = self.cli()?;
        let mut arena_columns = StatType::overall_columns();
        arena_columns.extend([StatType::wins(), StatType::losses()]);

        let json = serde_json::json!({
            "advanced": { "save_interval": cli.save_interval() },
            "trackers": [
                { "name": "pvp", "tracked_data": ["pvp"] },
                { "name": "arena", "tracked_data": ["pvp"], "overall_columns": arena_columns },
            ],
        });

        Ok(Settings::from_json(&json.to_string())?)
    }

    fn build_tempdir(&self) -> Result<tempfile::TempDir> {
        Ok(tempfile::Builder::new().prefix("combat-tracker-arena").tempdir()?)
    }

    #[cfg(feature = "sqlite")]
    fn database_settings(&self) -> Result<DatabaseSettings> {
        let dir = match self.cli()?.sqlite_path() {
            Some(dir) => dir,
            None => self.tempdir()?.path().to_path_buf(),
        };
        let db = dir.join("arena.db");
        Ok(DatabaseSettings::sqlite(db.display().to_string()).with_prefix("arena_"))
    }

    async fn play<S: StatStore>(pvp: &Tracker<S>, arena: &Tracker<S>, script: &Script, bout: &Bout) -> Result<()> {
        let fighter = |i: &usize| &script.fighters[*i];

        match bout {
            Bout::Duel { killer, killed } => {
                let (killer, killed) = (fighter(killer), fighter(killed));
                let killer = pvp.lock_identity(killer.id, &killer.name).await;
                let killed = pvp.get_or_create_record(killed.id, &killed.name).await;
                pvp.record_kill(&killer, &killed).await;
            }
            Bout::Match { winners, losers } => {
                let mut teams = [Vec::with_capacity(winners.len()), Vec::with_capacity(losers.len())];
                for (team, members) in teams.iter_mut().zip([winners, losers]) {
                    for member in members.iter().map(fighter) {
                        team.push(arena.get_or_create_record(member.id, &member.name).await);
                    }
                }
                let [winners, losers] = teams;
                arena.update_rating_groups(&winners, &losers, false);
            }
            Bout::Draw { players } => {
                let mut participants = Vec::with_capacity(players.len());
                for player in players.iter().map(fighter) {
                    participants.push(arena.get_or_create_record(player.id, &player.name).await);
                }
                arena.update_rating_free_for_all(&participants, true);
            }
            Bout::Leave { player } => {
                let id = fighter(player).id;
                pvp.release_identity(id).await?;
                arena.release_identity(id).await?;
            }
        }

        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn execute_script<S: StatStore>(&self, store: Arc<S>, script: Script) -> Result<ArenaReport> {
        let cli = self.cli()?;
        let settings = self.settings()?;
        let registry = CalculatorRegistry::with_elo(&settings.rating().elo());

        let tracker = |name: &str| {
            let section = settings
                .tracker(name)
                .ok_or_else(|| anyhow!("No settings for tracker '{name}'"))?;
            Ok::<_, anyhow::Error>(Tracker::from_settings(&settings, section, store.clone(), &registry)?)
        };
        let pvp = tracker("pvp")?;
        let arena = tracker("arena")?;

        let started = Instant::now();
        let script = Arc::new(script);
        let next_bout = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::<Result<usize>>::new();

        for _ in 0..cli.workers() {
            let (pvp, arena) = (pvp.clone(), arena.clone());
            let (script, next_bout) = (script.clone(), next_bout.clone());
            workers.spawn(async move {
                let mut played = 0;
                loop {
                    let idx = next_bout.fetch_add(1, Ordering::Relaxed);
                    let Some(bout) = script.bouts.get(idx)
                    else {
                        break;
                    };
                    Self::play(&pvp, &arena, &script, bout).await?;
                    played += 1;
                }
                Ok(played)
            });
        }

        let mut failure = None;
        while let Some(res) = workers.join_next().await {
            match res {
                Ok(Ok(played)) => debug!("Worker completed after {played} bouts"),
                Ok(Err(err)) => {
                    failure.get_or_insert(err);
                    workers.abort_all();
                }
                Err(err) if err.is_cancelled() => (),
                Err(err) => {
                    failure.get_or_insert(err.into());
                    workers.abort_all();
                }
            }
        }

        if let Some(err) = failure {
            // Still release the store.
            let _ = pvp.destroy().await;
            let _ = arena.destroy().await;
            return Err(err);
        }

        pvp.save_all().await?;
        arena.save_all().await?;

        let report = ArenaReport {
            fighters:  script.fighters.len(),
            duels:     script.duels(),
            matches:   script.matches(),
            draws:     script.draws(),
            leaves:    script.leaves(),
            team_size: cli.team_size(),
            pvp:       TrackerSummary::from_records(&pvp.top_records(cli.fighters(), &StatType::Rating).await),
            arena:     TrackerSummary::from_records(&arena.top_records(cli.fighters(), &StatType::Rating).await),
            elapsed:   started.elapsed(),
        };

        for tracker in [&pvp, &arena] {
            let [records, tallies, entries] = tracker.stats();
            debug!(
                "[{}] records: {records:?}; tallies: {tallies:?}; entries: {entries:?}",
                tracker.name()
            );
        }

        pvp.destroy().await?;
        arena.destroy().await?;

        Ok(report)
    }

    /// Play the script against the configured store. `None` means only help or version was printed.
    pub async fn execute(&self) -> Result<Option<ArenaReport>> {
        let cli = match self.cli() {
            Ok(cli) => cli,
            Err(err) => match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    let mut cmd = Cli::command();
                    cmd.print_help()?;
                    return Ok(None);
                }
                _ => {
                    return Err(err.into());
                }
            },
        };

        self.validate()?;
        self.setup_tracing();

        let script = self.script()?;

        #[cfg(feature = "sqlite")]
        let report = if cli.sqlite() {
            let store = SqlStore::connect(&self.database_settings()?).await?;
            self.execute_script(Arc::new(store), script).await?
        }
        else {
            self.execute_script(Arc::new(self.memory_store()), script).await?
        };

        #[cfg(not(feature = "sqlite"))]
        let report = self.execute_script(Arc::new(self.memory_store()), script).await?;

        if !cli.quiet() {
            println!("{report}");
        }

        Ok(Some(report))
    }

    fn memory_store(&self) -> MemoryStore {
        match self.cli().map(|cli| cli.latency_ms()) {
            Ok(latency) if latency > 0 => MemoryStore::new().with_latency(Duration::from_millis(latency)),
            _ => MemoryStore::new(),
        }
    }

    pub async fn run() -> Result<Option<ArenaReport>> {
        ArenaApp::__fieldx_new().execute().await
    }
}

impl ArenaAppBuilder {
    pub fn cli_args<S: ToString>(self, args: Vec<S>) -> Self {
        self._cli_args(args.into_iter().map(|s| s.to_string()).collect())
    }
}

impl Debug for ArenaApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArenaApp {{ ... }}")
    }
}
