use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static VALID_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9-]{1,25}$").unwrap_or_else(|e| panic!("invalid name pattern: {e}"))
});

/// A proposed name and the votes it received.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    #[serde(default)]
    pub score: i64,
}

/// Whether `name` is usable as a server name: 1 to 25 ASCII letters, digits
/// or hyphens.
pub fn is_valid_name(name: &str) -> bool {
    VALID_NAME.is_match(name)
}

/// Number of names earned: one per whole multiple of `goal` reached by
/// `revenue`. Nothing is earned against a zero goal.
pub fn names_earned(revenue: u64, goal: u64) -> usize {
    if goal == 0 {
        return 0;
    }
    usize::try_from(revenue / goal).unwrap_or(usize::MAX)
}

/// Picks up to `budget` names from `candidates`.
///
/// Candidates are ranked by score, highest first, keeping submission order
/// among equal scores. Names are trimmed; invalid ones are skipped without
/// using up the budget.
pub fn shortlist(candidates: &[Candidate], budget: usize) -> Vec<String> {
    let mut ranked: Vec<&Candidate> = candidates.iter().collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked
        .into_iter()
        .map(|c| c.name.trim())
        .filter(|name| is_valid_name(name))
        .take(budget)
        .map(str::to_owned)
        .collect()
}
