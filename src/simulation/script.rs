use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use fieldx::fxstruct;
use rand::seq::index;
use rand::Rng;
use rand_distr::Bernoulli;
use rand_distr::Distribution;
use rand_distr::Normal;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Fighter {
    pub id:    Uuid,
    pub name:  String,
    /// Hidden strength. Only the script writer knows it; the trackers have to discover it through ratings.
    pub skill: f64,
}

/// One step of the script. Fighters are referred to by their index in [`Script::fighters`].
#[derive(Debug, Clone, PartialEq)]
pub enum Bout {
    Duel { killer: usize, killed: usize },
    Match { winners: Vec<usize>, losers: Vec<usize> },
    Draw { players: Vec<usize> },
    Leave { player: usize },
}

#[derive(Debug, Clone)]
pub struct Script {
    pub fighters: Vec<Fighter>,
    pub bouts:    Vec<Bout>,
}

impl Script {
    pub fn duels(&self) -> usize {
        self.bouts.iter().filter(|b| matches!(b, Bout::Duel { .. })).count()
    }

    pub fn matches(&self) -> usize {
        self.bouts.iter().filter(|b| matches!(b, Bout::Match { .. })).count()
    }

    pub fn draws(&self) -> usize {
        self.bouts.iter().filter(|b| matches!(b, Bout::Draw { .. })).count()
    }

    pub fn leaves(&self) -> usize {
        self.bouts.iter().filter(|b| matches!(b, Bout::Leave { .. })).count()
    }
}

/// Generate a script for the arena simulation.
#[fxstruct(no_new, get(copy), builder(opt_in))]
pub struct ScriptWriter {
    #[fieldx(default(100), builder)]
    fighters: usize,

    /// Number of bouts, not counting leaves.
    #[fieldx(default(1_000), builder)]
    bouts: usize,

    #[fieldx(default(3), builder)]
    team_size: usize,

    /// Share of bouts that are free-for-all draws.
    #[fieldx(default(0.1), builder)]
    draw_rate: f64,

    /// Share of bouts that are team matches. Everything else is a duel.
    #[fieldx(default(0.3), builder)]
    match_rate: f64,

    /// Chance that somebody leaves after a bout.
    #[fieldx(default(0.05), builder)]
    leave_rate: f64,
}

impl ScriptWriter {
    // Probability of the first side winning, given the skill difference.
    fn win_chance(advantage: f64) -> f64 {
        1.0 / (1.0 + (-advantage).exp())
    }

    fn roster<R: Rng>(&self, rng: &mut R, size: usize) -> Vec<usize> {
        index::sample(rng, self.fighters, size).into_vec()
    }

    pub fn create(&self) -> Result<Script> {
        let group = self.team_size * 2;
        if group > self.fighters {
            bail!(
                "{} fighters are not enough for teams of {}",
                self.fighters,
                self.team_size
            );
        }

        let mut rng = rand::rng();
        let skill = Normal::new(0.0, 1.0).map_err(|err| anyhow!("Normal distribution: {err}"))?;
        let leave = Bernoulli::new(self.leave_rate).map_err(|err| anyhow!("Bernoulli distribution: {err}"))?;

        let fighters = (0..self.fighters)
            .map(|i| Fighter {
                id:    Uuid::new_v4(),
                name:  format!("fighter-{i:04}"),
                skill: skill.sample(&mut rng),
            })
            .collect::<Vec<_>>();

        let mut bouts = Vec::with_capacity(self.bouts + self.bouts / 10);
        for _ in 0..self.bouts {
            let kind = rng.random_range(0.0..1.0);
            let bout = if kind < self.draw_rate {
                Bout::Draw {
                    players: self.roster(&mut rng, group),
                }
            }
            else if kind < self.draw_rate + self.match_rate {
                let mut first = self.roster(&mut rng, group);
                let second = first.split_off(self.team_size);
                let strength = |team: &[usize]| team.iter().map(|i| fighters[*i].skill).sum::<f64>();
                let advantage = strength(&first) - strength(&second);
                if rng.random_bool(Self::win_chance(advantage)) {
                    Bout::Match {
                        winners: first,
                        losers:  second,
                    }
                }
                else {
                    Bout::Match {
                        winners: second,
                        losers:  first,
                    }
                }
            }
            else {
                let pair = self.roster(&mut rng, 2);
                let (a, b) = (pair[0], pair[1]);
                if rng.random_bool(Self::win_chance(fighters[a].skill - fighters[b].skill)) {
                    Bout::Duel { killer: a, killed: b }
                }
                else {
                    Bout::Duel { killer: b, killed: a }
                }
            };
            bouts.push(bout);

            if leave.sample(&mut rng) {
                bouts.push(Bout::Leave {
                    player: rng.random_range(0..self.fighters),
                });
            }
        }

        Ok(Script { fighters, bouts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_has_requested_shape() {
        let script = ScriptWriter::builder()
            .fighters(10)
            .bouts(300)
            .team_size(2)
            .build()
            .unwrap()
            .create()
            .unwrap();

        assert_eq!(script.fighters.len(), 10);
        assert_eq!(script.duels() + script.matches() + script.draws(), 300);
        assert_eq!(script.bouts.len(), 300 + script.leaves());

        for bout in &script.bouts {
            match bout {
                Bout::Duel { killer, killed } => assert_ne!(killer, killed),
                Bout::Match { winners, losers } => {
                    assert_eq!(winners.len(), 2);
                    assert_eq!(losers.len(), 2);
                    assert!(winners.iter().all(|w| !losers.contains(w)));
                }
                Bout::Draw { players } => assert_eq!(players.len(), 4),
                Bout::Leave { player } => assert!(*player < 10),
            }
        }
    }

    #[test]
    fn too_few_fighters() {
        let writer = ScriptWriter::builder().fighters(3).team_size(2).build().unwrap();
        assert!(writer.create().is_err());
    }

    #[test]
    fn stronger_side_is_favored() {
        assert!(ScriptWriter::win_chance(2.0) > 0.8);
        assert_eq!(ScriptWriter::win_chance(0.0), 0.5);
    }
}
