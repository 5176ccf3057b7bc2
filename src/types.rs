use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Statistic symbol. Well-known stats have fixed keys; anything else a tracker wants to count (arena wins, flag
/// captures, ...) goes into [`StatType::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatType {
    Kills,
    Deaths,
    Ties,
    Streak,
    MaxStreak,
    Ranking,
    MaxRanking,
    Rating,
    MaxRating,
    KdRatio,
    MaxKdRatio,
    Custom(Arc<str>),
}

impl StatType {
    const WELL_KNOWN: [StatType; 11] = [
        StatType::Kills,
        StatType::Deaths,
        StatType::Ties,
        StatType::Streak,
        StatType::MaxStreak,
        StatType::Ranking,
        StatType::MaxRanking,
        StatType::Rating,
        StatType::MaxRating,
        StatType::KdRatio,
        StatType::MaxKdRatio,
    ];

    pub fn custom<S: AsRef<str>>(key: S) -> Self {
        let Ok(stat) = key.as_ref().parse();
        stat
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Kills => "kills",
            Self::Deaths => "deaths",
            Self::Ties => "ties",
            Self::Streak => "streak",
            Self::MaxStreak => "max_streak",
            Self::Ranking => "ranking",
            Self::MaxRanking => "max_ranking",
            Self::Rating => "rating",
            Self::MaxRating => "max_rating",
            Self::KdRatio => "kd_ratio",
            Self::MaxKdRatio => "max_kd_ratio",
            Self::Custom(key) => key,
        }
    }

    /// Human readable name.
    pub fn name(&self) -> String {
        match self {
            Self::Kills => "Kills".into(),
            Self::Deaths => "Deaths".into(),
            Self::Ties => "Ties".into(),
            Self::Streak => "Streak".into(),
            Self::MaxStreak => "Max Streak".into(),
            Self::Ranking => "Ranking".into(),
            Self::MaxRanking => "Max Ranking".into(),
            Self::Rating => "Rating".into(),
            Self::MaxRating => "Max Rating".into(),
            Self::KdRatio => "K/D Ratio".into(),
            Self::MaxKdRatio => "Max K/D Ratio".into(),
            Self::Custom(key) => {
                let mut chars = key.chars();
                chars
                    .next()
                    .map(|first| first.to_uppercase().chain(chars).collect::<String>())
                    .unwrap_or_default()
                    .replace('_', " ")
            }
        }
    }

    /// Whether the stat is persisted. Running values (current streak, current ranking, current k/d ratio) are
    /// derived in memory and only their maximums are stored.
    pub fn is_tracked(&self) -> bool {
        !matches!(self, Self::Streak | Self::Ranking | Self::KdRatio)
    }

    pub fn well_known() -> impl Iterator<Item = StatType> {
        Self::WELL_KNOWN.into_iter()
    }

    /// Columns every tracker persists for its per-identity records unless configured otherwise.
    pub fn overall_columns() -> Vec<StatType> {
        vec![
            Self::Kills,
            Self::Deaths,
            Self::Ties,
            Self::MaxStreak,
            Self::MaxRanking,
            Self::Rating,
            Self::MaxRating,
            Self::MaxKdRatio,
        ]
    }

    /// Columns persisted for pairwise tallies.
    pub fn versus_columns() -> Vec<StatType> {
        vec![Self::Kills, Self::Deaths, Self::Ties]
    }

    /// Group matches won.
    pub fn wins() -> Self {
        Self::custom("wins")
    }

    /// Group matches lost.
    pub fn losses() -> Self {
        Self::custom("losses")
    }
}

impl FromStr for StatType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::WELL_KNOWN
            .iter()
            .find(|st| st.key() == s)
            .cloned()
            .unwrap_or_else(|| Self::Custom(Arc::from(s))))
    }
}

impl Display for StatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl Serialize for StatType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.key())
    }
}

impl<'de> Deserialize<'de> for StatType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        Ok(StatType::custom(key))
    }
}

/// What kind of combat a tracker follows.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TrackedDataType {
    /// Player versus player.
    Pvp,
    /// Player versus environment.
    Pve,
    /// Player versus world (falls, lava, drowning).
    World,
}

/// Order-independent key of a pair of identities. `PairKey::new(a, b) == PairKey::new(b, a)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey(Uuid, Uuid);

impl PairKey {
    pub fn new(a: Uuid, b: Uuid) -> Self {
        if a <= b {
            Self(a, b)
        }
        else {
            Self(b, a)
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.0 == *id || self.1 == *id
    }

    pub fn low(&self) -> Uuid {
        self.0
    }

    pub fn high(&self) -> Uuid {
        self.1
    }
}

impl Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}~{}", self.0, self.1)
    }
}

/// Snapshot of a container's state. Counts are taken by scanning, so they are exact at the moment of the call
/// only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries:           usize,
    pub dirty:             usize,
    pub locked:            usize,
    /// How many times a flush had to keep an unsaved entry it was asked to evict.
    pub unsaved_evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn stat_type_keys_round_trip() {
        for st in StatType::well_known() {
            assert_eq!(st.key().parse::<StatType>().unwrap(), st);
        }
        assert_eq!(StatType::custom("wins"), StatType::Custom(Arc::from("wins")));
        assert_eq!(StatType::custom("max_rating"), StatType::MaxRating);
    }

    #[test]
    fn custom_stat_name() {
        assert_eq!(StatType::custom("flag_captures").name(), "Flag captures");
        assert!(StatType::custom("wins").is_tracked());
        assert!(!StatType::Streak.is_tracked());
    }

    #[test]
    fn stat_type_serde_uses_keys() {
        let json = serde_json::to_string(&vec![StatType::MaxKdRatio, StatType::custom("wins")]).unwrap();
        assert_eq!(json, r#"["max_kd_ratio","wins"]"#);
        let back: Vec<StatType> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![StatType::MaxKdRatio, StatType::custom("wins")]);
    }

    #[test]
    fn tracked_data_type_parsing() {
        assert_eq!("PvP".parse::<TrackedDataType>().unwrap(), TrackedDataType::Pvp);
        assert_eq!(TrackedDataType::World.to_string(), "world");
        assert_eq!(TrackedDataType::iter().count(), 3);
    }

    #[test]
    fn pair_key_is_unordered() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(PairKey::new(a, b), PairKey::new(b, a));
        assert!(PairKey::new(a, b).contains(&a));
        assert!(!PairKey::new(a, a).contains(&b));
    }
}
