use crate::config::EloSettings;
use crate::error::Result;
use crate::error::TrackerError;
use crate::record::Record;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Rating algorithm of a tracker. Implementations mutate the ratings of the records passed in and must leave records
/// with tracking disabled as they are.
pub trait RatingCalculator: Debug + Send + Sync + 'static {
    /// Name the calculator is registered under.
    fn name(&self) -> &str;

    /// Rating of an identity that has never been rated.
    fn default_rating(&self) -> f32;

    /// One winner, one loser.
    fn update_rating(&self, winner: &mut Record, loser: &mut Record, tie: bool);

    /// One winner against several losers.
    fn update_rating_one_vs_many(&self, winner: &mut Record, losers: &mut [&mut Record], tie: bool);

    /// A group of winners against a group of losers.
    fn update_rating_groups(&self, winners: &mut [&mut Record], losers: &mut [&mut Record], tie: bool);

    /// Everybody against everybody.
    fn update_rating_free_for_all(&self, participants: &mut [&mut Record], tie: bool);
}

/// Elo rating with a stepped K-factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EloCalculator {
    default_rating: f32,
    spread:         f32,
}

impl Default for EloCalculator {
    fn default() -> Self {
        Self::from(&EloSettings::default())
    }
}

impl From<&EloSettings> for EloCalculator {
    fn from(settings: &EloSettings) -> Self {
        Self::new(settings.default_rating(), settings.spread())
    }
}

impl EloCalculator {
    pub const NAME: &'static str = "elo";

    pub fn new(default_rating: f32, spread: f32) -> Self {
        Self { default_rating, spread }
    }

    pub fn spread(&self) -> f32 {
        self.spread
    }

    /// See <https://en.wikipedia.org/wiki/Elo_rating_system#Most_accurate_K-factor>
    pub fn k_factor(rating: f64) -> f64 {
        match rating {
            r if r < 1600.0 => 50.0,
            r if r < 1800.0 => 35.0,
            r if r < 2000.0 => 20.0,
            r if r < 2500.0 => 10.0,
            _ => 6.0,
        }
    }

    /// Probability of `rating` beating `opponent`.
    pub fn expected_score(&self, rating: f64, opponent: f64) -> f64 {
        1.0 / (1.0 + 10f64.powf((opponent - rating) / self.spread as f64))
    }

    /// Rating change of the side rated `rating` scoring `result` (1 win, 0.5 tie, 0 loss) against `opponent`.
    pub fn rating_change(&self, rating: f64, opponent: f64, result: f64) -> f64 {
        Self::k_factor(rating) * (result - self.expected_score(rating, opponent))
    }

    #[inline]
    fn dampening(count: usize) -> f64 {
        if count == 1 {
            1.0
        }
        else {
            count as f64 / 2.0
        }
    }

    #[inline]
    fn result(tie: bool) -> f64 {
        if tie {
            0.5
        }
        else {
            1.0
        }
    }

    fn ratings(records: &[&mut Record]) -> Vec<f64> {
        records.iter().map(|r| r.rating() as f64).collect()
    }
}

fn apply(record: &mut Record, delta: f64) {
    if record.is_tracking() {
        record.set_rating((record.rating() as f64 + delta) as f32);
    }
}

impl RatingCalculator for EloCalculator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn default_rating(&self) -> f32 {
        self.default_rating
    }

    fn update_rating(&self, winner: &mut Record, loser: &mut Record, tie: bool) {
        let delta = self.rating_change(winner.rating() as f64, loser.rating() as f64, Self::result(tie));
        apply(winner, delta);
        apply(loser, -delta);
    }

    fn update_rating_one_vs_many(&self, winner: &mut Record, losers: &mut [&mut Record], tie: bool) {
        if losers.is_empty() {
            return;
        }

        let result = Self::result(tie);
        let dampening = Self::dampening(losers.len());
        let winner_rating = winner.rating() as f64;
        let deltas = Self::ratings(losers)
            .into_iter()
            .map(|loser_rating| self.rating_change(winner_rating, loser_rating, result) / dampening)
            .collect::<Vec<_>>();

        for (loser, delta) in losers.iter_mut().zip(&deltas) {
            apply(loser, -delta);
        }
        apply(winner, deltas.iter().sum());
    }

    fn update_rating_groups(&self, winners: &mut [&mut Record], losers: &mut [&mut Record], tie: bool) {
        if winners.is_empty() || losers.is_empty() {
            return;
        }

        let winner_result = Self::result(tie);
        let loser_result = 1.0 - winner_result;
        // Both sides are dampened by the size of the losing group.
        let dampening = Self::dampening(losers.len());
        let winner_ratings = Self::ratings(winners);
        let loser_ratings = Self::ratings(losers);

        let total = |rating: f64, opponents: &[f64], result: f64| -> f64 {
            opponents
                .iter()
                .map(|opponent| self.rating_change(rating, *opponent, result) / dampening)
                .sum()
        };

        let winner_deltas = winner_ratings
            .iter()
            .map(|rating| total(*rating, &loser_ratings, winner_result))
            .collect::<Vec<_>>();
        let loser_deltas = loser_ratings
            .iter()
            .map(|rating| total(*rating, &winner_ratings, loser_result))
            .collect::<Vec<_>>();

        for (record, delta) in winners.iter_mut().zip(winner_deltas) {
            apply(record, delta);
        }
        for (record, delta) in losers.iter_mut().zip(loser_deltas) {
            apply(record, delta);
        }
    }

    fn update_rating_free_for_all(&self, participants: &mut [&mut Record], tie: bool) {
        if participants.len() < 2 {
            return;
        }

        let result = Self::result(tie);
        let dampening = Self::dampening(participants.len());
        let ratings = Self::ratings(participants);
        let deltas = ratings
            .iter()
            .enumerate()
            .map(|(i, rating)| {
                ratings
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, opponent)| self.rating_change(*rating, *opponent, result) / dampening)
                    .sum::<f64>()
            })
            .collect::<Vec<_>>();

        for (record, delta) in participants.iter_mut().zip(deltas) {
            apply(record, delta);
        }
    }
}

/// Rating calculators known by name. Trackers refer to their calculator by name in configuration.
#[derive(Debug, Clone, Default)]
pub struct CalculatorRegistry {
    calculators: BTreeMap<String, Arc<dyn RatingCalculator>>,
}

impl CalculatorRegistry {
    /// Registry with the Elo calculator configured from `elo`.
    pub fn with_elo(elo: &EloSettings) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(EloCalculator::from(elo)));
        registry
    }

    /// Register a calculator under its own name, replacing any previous one with the same name.
    pub fn register(&mut self, calculator: Arc<dyn RatingCalculator>) {
        self.calculators.insert(calculator.name().to_string(), calculator);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn RatingCalculator>> {
        self.calculators
            .get(name)
            .cloned()
            .ok_or_else(|| TrackerError::UnknownCalculator(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.calculators.keys().map(String::as_str)
    }
}
