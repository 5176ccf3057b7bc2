use crate::error::Result;
use crate::types::StatType;
use crate::types::TrackedDataType;
use fieldx::fxstruct;
use garde::Validate;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration. Usually read from a JSON file with [`Settings::load`].
///
/// ```json
/// {
///     "database": { "kind": "sqlite", "db": "tracker.db" },
///     "rating": { "elo": { "default": 1250, "spread": 400 } },
///     "advanced": { "save_interval": 300, "stale_entry_time": 900 },
///     "trackers": [ { "name": "pvp", "tracked_data": ["pvp"] } ]
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[fxstruct(no_new, default(off), get)]
#[serde(default)]
pub struct Settings {
    #[garde(dive)]
    database: DatabaseSettings,

    #[garde(dive)]
    rating: RatingSettings,

    #[fieldx(get(copy))]
    #[garde(dive)]
    advanced: AdvancedSettings,

    #[garde(dive)]
    trackers: Vec<TrackerSettings>,
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn tracker(&self, name: &str) -> Option<&TrackerSettings> {
        self.trackers.iter().find(|t| t.name == name)
    }
}

/// Which relational backend a [`SqlStore`](crate::store::sql::SqlStore) connects to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DatabaseKind {
    #[default]
    Sqlite,
    Mysql,
    #[serde(alias = "postgres")]
    Pg,
}

/// Connection parameters, handed explicitly to the store constructor.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[fxstruct(no_new, default(off), get)]
#[serde(default)]
pub struct DatabaseSettings {
    #[fieldx(get(copy))]
    #[garde(skip)]
    kind: DatabaseKind,

    /// Prefix of every table name.
    #[garde(skip)]
    prefix: String,

    /// Database name, or the file path for SQLite.
    #[garde(length(min = 1))]
    db: String,

    #[garde(skip)]
    host: String,

    #[fieldx(get(copy))]
    #[garde(skip)]
    port: Option<u16>,

    #[garde(skip)]
    user: String,

    #[garde(skip)]
    password: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            kind:     DatabaseKind::Sqlite,
            prefix:   "bt_".into(),
            db:       "tracker.db".into(),
            host:     "localhost".into(),
            port:     None,
            user:     String::new(),
            password: String::new(),
        }
    }
}

impl DatabaseSettings {
    pub fn sqlite<S: Into<String>>(db: S) -> Self {
        Self {
            db: db.into(),
            ..Default::default()
        }
    }

    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Connection URL understood by the SQL driver.
    pub fn url(&self) -> String {
        let credentials = if self.user.is_empty() {
            String::new()
        }
        else if self.password.is_empty() {
            format!("{}@", self.user)
        }
        else {
            format!("{}:{}@", self.user, self.password)
        };

        match self.kind {
            DatabaseKind::Sqlite => format!("sqlite://{}?mode=rwc", self.db),
            DatabaseKind::Mysql => format!(
                "mysql://{credentials}{}:{}/{}",
                self.host,
                self.port.unwrap_or(3306),
                self.db
            ),
            DatabaseKind::Pg => format!(
                "postgres://{credentials}{}:{}/{}",
                self.host,
                self.port.unwrap_or(5432),
                self.db
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Validate)]
#[fxstruct(no_new, default(off), get(copy))]
#[serde(default)]
pub struct RatingSettings {
    #[garde(dive)]
    elo: EloSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[fxstruct(no_new, default(off), get(copy))]
#[serde(default)]
pub struct EloSettings {
    /// Rating of a newcomer.
    #[serde(rename = "default")]
    #[garde(range(min = 0.0))]
    default_rating: f32,

    /// Rating gap at which the stronger side is expected to win ten times out of eleven.
    #[garde(range(min = 1.0))]
    spread: f32,
}

impl Default for EloSettings {
    fn default() -> Self {
        Self {
            default_rating: 1250.0,
            spread:         400.0,
        }
    }
}

impl EloSettings {
    pub fn new(default_rating: f32, spread: f32) -> Self {
        Self { default_rating, spread }
    }
}

/// Cache maintenance knobs. All times are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[fxstruct(no_new, default(off), get(copy), set)]
#[serde(default)]
pub struct AdvancedSettings {
    /// Save and evict an identity as soon as it is released.
    #[garde(skip)]
    flush_on_leave: bool,

    /// Period of the autosave pass; `-1` disables it.
    #[garde(custom(valid_save_interval))]
    save_interval: i64,

    /// How long a clean entry may stay unread before a flush evicts it.
    #[garde(range(min = 1))]
    stale_entry_time: u64,

    /// Minimal delay between two top-records queries to the store.
    #[garde(range(min = 1))]
    top_refresh: u64,
}

fn valid_save_interval(value: &i64, _ctx: &()) -> garde::Result {
    if *value == -1 || *value > 0 {
        Ok(())
    }
    else {
        Err(garde::Error::new(format!(
            "save interval must be positive or -1 to disable autosave, got {value}"
        )))
    }
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            flush_on_leave:   false,
            save_interval:    300,
            stale_entry_time: 900,
            top_refresh:      60,
        }
    }
}

impl AdvancedSettings {
    /// Autosave period, `None` when autosave is disabled.
    pub fn save_period(&self) -> Option<Duration> {
        (self.save_interval > 0).then(|| Duration::from_secs(self.save_interval as u64))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_entry_time)
    }

    pub fn top_refresh_period(&self) -> Duration {
        Duration::from_secs(self.top_refresh)
    }
}

/// Per-tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[fxstruct(no_new, default(off), get)]
pub struct TrackerSettings {
    #[garde(length(min = 1))]
    name: String,

    /// Name of the rating calculator.
    #[serde(default = "default_calculator")]
    #[garde(length(min = 1))]
    calculator: String,

    #[serde(default)]
    #[garde(skip)]
    tracked_data: Vec<TrackedDataType>,

    /// Stats persisted for every identity.
    #[serde(default = "StatType::overall_columns")]
    #[garde(length(min = 1))]
    overall_columns: Vec<StatType>,

    /// Stats persisted for every pair of identities.
    #[serde(default = "StatType::versus_columns")]
    #[garde(length(min = 1))]
    versus_columns: Vec<StatType>,
}

fn default_calculator() -> String {
    crate::rating::EloCalculator::NAME.to_string()
}

impl TrackerSettings {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name:            name.into(),
            calculator:      default_calculator(),
            tracked_data:    vec![TrackedDataType::Pvp],
            overall_columns: StatType::overall_columns(),
            versus_columns:  StatType::versus_columns(),
        }
    }

    /// Additional stat to persist, e.g. arena wins.
    pub fn with_column(mut self, stat: StatType) -> Self {
        if !self.overall_columns.contains(&stat) {
            self.overall_columns.push(stat);
        }
        self
    }

    pub fn tracks(&self, data: TrackedDataType) -> bool {
        self.tracked_data.contains(&data)
    }
}
