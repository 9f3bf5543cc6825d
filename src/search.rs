//! Scoring for live fuzzy filtering in the browser. `history list --search`
//! filters in SQL instead.
//!
//! Ranks fall into tiers so that any exact case-insensitive substring match
//! outranks every approximate match:
//!
//! | tier        | rank range       |
//! |-------------|------------------|
//! | substring   | `10_000..20_000` |
//! | token typo  | `1_000..10_000`  |
//! | subsequence | `100..1_000`     |

use std::cmp::Ordering;

use strsim::osa_distance;

const SUBSTRING_BASE: i64 = 10_000;
const TOKEN_BASE: i64 = 1_000;
const TOKEN_CEILING: i64 = 9_999;
const SUBSEQUENCE_BASE: i64 = 100;
const SUBSEQUENCE_CEILING: i64 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Score {
    pub rank: i64,
    pub matched: bool,
}

impl Score {
    /// Result for an empty query: everything matches, nothing is preferred.
    pub const NEUTRAL: Score = Score {
        rank: 0,
        matched: true,
    };
    pub const MISS: Score = Score {
        rank: 0,
        matched: false,
    };
}

/// Score one candidate against a query.
#[must_use]
pub fn score(query: &str, candidate: &str) -> Score {
    if query.trim().is_empty() {
        return Score::NEUTRAL;
    }
    // Untrimmed: "cat " must only hit candidates that contain "cat ".
    let query = query.to_lowercase();
    let candidate = candidate.to_lowercase();

    if let Some(rank) = substring_rank(&query, &candidate) {
        return Score {
            rank,
            matched: true,
        };
    }
    if let Some(rank) = token_rank(&query, &candidate) {
        return Score {
            rank,
            matched: true,
        };
    }
    if let Some(rank) = subsequence_rank(&query, &candidate) {
        return Score {
            rank,
            matched: true,
        };
    }
    Score::MISS
}

fn substring_rank(query: &str, candidate: &str) -> Option<i64> {
    let byte_pos = candidate.find(query)?;
    let position = to_i64(candidate[..byte_pos].chars().count());
    let query_len = to_i64(query.chars().count());
    let candidate_len = to_i64(candidate.chars().count()).max(1);

    let mut rank = SUBSTRING_BASE;
    if position == 0 {
        rank += 3_000;
    } else if candidate[..byte_pos]
        .chars()
        .next_back()
        .is_some_and(|ch| !ch.is_alphanumeric())
    {
        rank += 1_500;
    }
    rank += (query_len * 1_000 / candidate_len).min(1_000);
    rank += 500 - position.min(500);
    Some(rank)
}

fn tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
}

fn typo_budget(token: &str) -> usize {
    match token.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

/// Every query token must hit some candidate word by prefix or within its typo budget.
fn token_rank(query: &str, candidate: &str) -> Option<i64> {
    let words: Vec<&str> = tokens(candidate).collect();
    if words.is_empty() {
        return None;
    }
    let mut total_cost = 0usize;
    let mut matched = 0usize;
    for token in tokens(query) {
        let budget = typo_budget(token);
        let best = words
            .iter()
            .filter_map(|word| {
                if word.starts_with(token) {
                    Some(0)
                } else {
                    let distance = osa_distance(token, word);
                    (distance <= budget).then_some(distance)
                }
            })
            .min()?;
        total_cost += best;
        matched += 1;
    }
    if matched == 0 {
        return None;
    }
    let rank = TOKEN_BASE + 8_000 + to_i64(matched) * 100 - to_i64(total_cost) * 1_000;
    Some(rank.clamp(TOKEN_BASE, TOKEN_CEILING))
}

/// Ordered characters within a window no wider than three times the query.
fn subsequence_rank(query: &str, candidate: &str) -> Option<i64> {
    let needle: Vec<char> = query.chars().filter(|ch| !ch.is_whitespace()).collect();
    if needle.is_empty() {
        return None;
    }
    let haystack: Vec<char> = candidate.chars().collect();
    let widest = needle.len() * 3;
    let mut best_span: Option<usize> = None;
    for start in 0..haystack.len() {
        if haystack[start] != needle[0] {
            continue;
        }
        let mut next = 1;
        let mut end = start;
        for (offset, ch) in haystack[start + 1..].iter().enumerate() {
            if next == needle.len() || offset + 2 > widest {
                break;
            }
            if *ch == needle[next] {
                next += 1;
                end = start + 1 + offset;
            }
        }
        if next == needle.len() {
            let span = end - start + 1;
            best_span = Some(best_span.map_or(span, |best| best.min(span)));
        }
    }
    let span = best_span?;
    if span > widest {
        return None;
    }
    let slack = to_i64(span - needle.len());
    Some((SUBSEQUENCE_CEILING - slack * 10).clamp(SUBSEQUENCE_BASE, SUBSEQUENCE_CEILING))
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    /// Position of the item in the slice passed to [`rank`].
    pub index: usize,
    pub score: Score,
}

/// Score every item and return the matches in display order: rank first,
/// then most recent, then original position.
pub fn rank<T, F>(query: &str, items: &[T], key: F) -> Vec<Match>
where
    F: Fn(&T) -> (&str, i64),
{
    let mut matches: Vec<(Match, i64)> = items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let (text, recency) = key(item);
            let score = score(query, text);
            score.matched.then_some((Match { index, score }, recency))
        })
        .collect();
    matches.sort_by(|(a, a_recency), (b, b_recency)| compare(a, *a_recency, b, *b_recency));
    matches.into_iter().map(|(found, _)| found).collect()
}

fn compare(a: &Match, a_recency: i64, b: &Match, b_recency: i64) -> Ordering {
    b.score
        .rank
        .cmp(&a.score.rank)
        .then_with(|| b_recency.cmp(&a_recency))
        .then_with(|| a.index.cmp(&b.index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_is_identity() {
        assert_eq!(score("", "anything"), Score::NEUTRAL);
        assert_eq!(score("   ", ""), Score::NEUTRAL);
    }

    #[test]
    fn substring_is_case_insensitive() {
        let found = score("CITY", "John in a city at night");
        assert!(found.matched);
        assert!(found.rank >= SUBSTRING_BASE);
    }

    #[test]
    fn tolerates_typos_and_transpositions() {
        assert!(score("robto", "a robot walking").matched);
        assert!(score("portrat", "studio portrait of john").matched);
        assert!(!score("zebra", "a robot walking").matched);
    }

    #[test]
    fn substring_beats_every_approximate_match() {
        let candidates = [
            "robot in a field",
            "rbot",
            "r o b o t",
            "roboto font sample",
            "a robto typo",
            "rob the robber",
        ];
        for query in ["rob", "robot", "ro", "bot"] {
            for with in &candidates {
                let with_score = score(query, with);
                if !with.contains(query) {
                    continue;
                }
                for without in &candidates {
                    if without.contains(query) {
                        continue;
                    }
                    let without_score = score(query, without);
                    assert!(
                        with_score.rank >= without_score.rank,
                        "{query:?}: {with:?} ({}) should outrank {without:?} ({})",
                        with_score.rank,
                        without_score.rank
                    );
                }
            }
        }
    }

    #[test]
    fn trailing_space_is_part_of_the_substring() {
        let with = score("cat ", "a cat sat");
        let without = score("cat ", "cat");
        assert!(with.matched && without.matched);
        assert!(with.rank >= SUBSTRING_BASE);
        assert!(
            with.rank >= without.rank,
            "substring candidate outranked: {} < {}",
            with.rank,
            without.rank
        );
        assert!(score(" robot", "a robot walking").rank > score(" robot", "robot").rank);
    }

    #[test]
    fn subsequence_rejects_wide_spans() {
        assert!(score("rbt", "r_b_t").matched);
        let spread = format!("r{}b{}t", "x".repeat(20), "x".repeat(20));
        assert!(!score("rbt", &spread).matched);
        let long = format!("{}z_j", "q".repeat(5_000));
        assert!(score("qzj", &long).matched);
    }

    #[test]
    fn prefix_ranks_above_inner_substring() {
        assert!(score("john", "john smiling").rank > score("john", "portrait of john").rank);
    }

    #[test]
    fn ties_break_on_recency_then_position() {
        let items = [("a cat", 10), ("a cat", 30), ("a dog", 50), ("a cat", 30)];
        let order: Vec<usize> = rank("cat", &items, |(text, at)| (*text, *at))
            .into_iter()
            .map(|found| found.index)
            .collect();
        assert_eq!(order, vec![1, 3, 0]);
    }
}
